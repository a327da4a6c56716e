//! Fabric manager request/response payloads.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub column: String,
    pub operator: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResSpec {
    #[serde(default)]
    pub condition: Vec<Condition>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    pub subnet_uuid: String,
    pub lanport_idx: u32,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub default_gw: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub lease_time: String,
    #[serde(default)]
    pub ntp: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub dns: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub fqdn: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub nic_type: u32,
    pub subnets: Vec<Subnet>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageTags {
    #[serde(default)]
    pub is_bootstorage: bool,
}

/// A resource as written in device specs and returned in machine details.
///
/// `tags` and the GPU count bounds only steer the driver; they are read from
/// configuration but never sent to the fabric manager.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub res_type: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub res_num: u32,
    // the GET /machines/{uuid} response spells this key "res_spcec"
    #[serde(default, alias = "res_spcec", skip_serializing_if = "Option::is_none")]
    pub res_spec: Option<ResSpec>,
    #[serde(default, skip_serializing)]
    pub tags: Option<StorageTags>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<Network>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub res_uuid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub res_name: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub res_status: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub res_op_status: String,
    #[serde(default, skip_serializing)]
    pub min_resource_count: u32,
    #[serde(default, skip_serializing)]
    pub max_resource_count: u32,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl Resource {
    pub fn is_boot_storage(&self) -> bool {
        self.res_type == "storage" && self.tags.as_ref().is_some_and(|t| t.is_bootstorage)
    }

    pub fn conditions(&self) -> &[Condition] {
        self.res_spec
            .as_ref()
            .map(|s| s.condition.as_slice())
            .unwrap_or_default()
    }
}

/// Condition list identifying the boot storage within a device spec.
pub fn boot_storage_condition(devices: &[Resource]) -> Option<&[Condition]> {
    devices
        .iter()
        .find(|r| r.is_boot_storage())
        .map(Resource::conditions)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResSpecs {
    pub res_specs: Vec<Resource>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateMachineSpec {
    pub mach_name: String,
    pub resources: Vec<ResSpecs>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateMachineTenants {
    pub tenant_uuid: String,
    pub machines: Vec<CreateMachineSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateMachineRequest {
    pub tenants: CreateMachineTenants,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lanport {
    #[serde(default)]
    pub lanport_uuid: String,
    #[serde(default)]
    pub subnet_uuid: String,
    #[serde(default)]
    pub mac_address: String,
    #[serde(default)]
    pub lanport_idx: u32,
    #[serde(default)]
    pub ip_address: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MachineRecord {
    #[serde(default)]
    pub mach_uuid: String,
    #[serde(default)]
    pub mach_name: String,
    #[serde(default)]
    pub mach_status: i64,
    #[serde(default)]
    pub mach_op_status: String,
    #[serde(default)]
    pub mach_status_detail: String,
    #[serde(default)]
    pub boot_ssd: String,
    #[serde(default)]
    pub lanports: Vec<Lanport>,
    #[serde(default)]
    pub resources: Vec<Resource>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MachinesData {
    #[serde(default)]
    pub machines: Vec<MachineRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MachinesResponse {
    #[serde(default)]
    pub data: MachinesData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootResource {
    pub res_uuid_ssd: String,
    pub bootimg_filename: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageInstallation {
    pub resources: BootResource,
}

/// Network role of a node subnet as configured by the operator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubnetSpec {
    pub port: u32,
    pub subnet_uuid: String,
    pub default_gw: String,
}

/// Everything the fabric manager needs to compose a machine.
#[derive(Debug, Clone)]
pub struct MachineSpec {
    pub compute_conditions: Vec<Condition>,
    pub devices: Vec<Resource>,
    pub provision: SubnetSpec,
    pub baremetal: Option<SubnetSpec>,
    pub ntp_server: String,
    pub dns_server: String,
}

impl MachineSpec {
    pub fn to_request(&self, machine_name: &str, tenant_uuid: &str) -> CreateMachineRequest {
        let subnet = |s: &SubnetSpec| Subnet {
            subnet_uuid: s.subnet_uuid.clone(),
            lanport_idx: s.port,
            default_gw: s.default_gw.clone(),
            ntp: self.ntp_server.clone(),
            dns: self.dns_server.clone(),
            ..Default::default()
        };

        let mut subnets = vec![subnet(&self.provision)];
        if let Some(baremetal) = self.baremetal.as_ref().filter(|b| !b.subnet_uuid.is_empty()) {
            subnets.push(subnet(baremetal));
        }

        let compute = Resource {
            res_type: "compute".into(),
            res_num: 1,
            res_spec: Some(ResSpec {
                condition: self.compute_conditions.clone(),
            }),
            network: Some(Network {
                nic_type: 1,
                subnets,
            }),
            ..Default::default()
        };

        let mut res_specs = vec![compute];
        res_specs.extend(self.devices.iter().cloned());

        CreateMachineRequest {
            tenants: CreateMachineTenants {
                tenant_uuid: tenant_uuid.to_string(),
                machines: vec![CreateMachineSpec {
                    mach_name: machine_name.replace('-', "_"),
                    resources: vec![ResSpecs { res_specs }],
                }],
            },
        }
    }
}

/// Parsed view of `GET /machines/{uuid}`.
#[derive(Debug, Clone, Default)]
pub struct MachineDetails {
    pub lanports: Vec<Lanport>,
    pub boot_storage_id: Option<String>,
    pub status_code: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boot_ssd() -> Resource {
        Resource {
            res_type: "storage".into(),
            res_num: 1,
            res_spec: Some(ResSpec {
                condition: vec![Condition {
                    column: "vendor".into(),
                    operator: "eq".into(),
                    value: "samsung".into(),
                }],
            }),
            tags: Some(StorageTags {
                is_bootstorage: true,
            }),
            ..Default::default()
        }
    }

    #[test]
    fn reads_misspelled_res_spec_key() {
        let json = r#"{"res_type":"storage","res_uuid":"ssd-1",
            "res_spcec":{"condition":[{"column":"vendor","operator":"eq","value":"samsung"}]}}"#;
        let r: Resource = serde_json::from_str(json).unwrap();
        assert_eq!(r.conditions().len(), 1);
        assert_eq!(r.res_uuid, "ssd-1");
    }

    #[test]
    fn driver_only_fields_are_not_sent() {
        let mut gpu = boot_ssd();
        gpu.res_type = "gpu".into();
        gpu.min_resource_count = 1;
        gpu.max_resource_count = 4;

        let json = serde_json::to_value(&gpu).unwrap();
        let obj = json.as_object().unwrap();
        assert!(!obj.contains_key("tags"));
        assert!(!obj.contains_key("min_resource_count"));
        assert!(!obj.contains_key("max_resource_count"));
        assert!(obj.contains_key("res_spec"));
    }

    #[test]
    fn finds_boot_storage_condition() {
        let devices = vec![
            Resource {
                res_type: "gpu".into(),
                ..Default::default()
            },
            boot_ssd(),
        ];
        let cond = boot_storage_condition(&devices).unwrap();
        assert_eq!(cond[0].value, "samsung");
        assert!(boot_storage_condition(&devices[..1]).is_none());
    }

    #[test]
    fn create_request_carries_both_subnets() {
        let spec = MachineSpec {
            compute_conditions: vec![Condition {
                column: "model".into(),
                operator: "eq".into(),
                value: "PRIMERGYRX2540M6".into(),
            }],
            devices: vec![boot_ssd()],
            provision: SubnetSpec {
                port: 0,
                subnet_uuid: "prov".into(),
                default_gw: "10.0.0.254".into(),
            },
            baremetal: Some(SubnetSpec {
                port: 1,
                subnet_uuid: "bm".into(),
                default_gw: "10.1.0.254".into(),
            }),
            ntp_server: "10.0.0.1".into(),
            dns_server: "10.0.0.2".into(),
        };

        let req = spec.to_request("node-pool-1", "tenant-a");
        let json = serde_json::to_value(&req).unwrap();

        assert_eq!(json["tenants"]["tenant_uuid"], "tenant-a");
        let machine = &json["tenants"]["machines"][0];
        assert_eq!(machine["mach_name"], "node_pool_1");
        let specs = machine["resources"][0]["res_specs"].as_array().unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0]["res_type"], "compute");
        let subnets = specs[0]["network"]["subnets"].as_array().unwrap();
        assert_eq!(subnets.len(), 2);
        assert_eq!(subnets[0]["subnet_uuid"], "prov");
        assert_eq!(subnets[1]["lanport_idx"], 1);
        assert_eq!(subnets[1]["ntp"], "10.0.0.1");
    }
}

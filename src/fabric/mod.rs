//! Typed HTTP client for the fabric manager REST API.

pub mod models;

use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::CONTENT_TYPE;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::errors::{DriverError, Result};
use crate::logging::redact;
use models::{
    BootResource, Condition, ImageInstallation, MachineDetails, MachineSpec, MachinesResponse,
    Resource,
};

pub const API_PATH: &str = "/fabric_manager/api/v1";

/// Operations the driver needs from the fabric manager. Every call is scoped
/// to a tenant and authorized with a bearer token.
pub trait FabricClient {
    fn validate_tenant(&self, tenant_uuid: &str, token: &str) -> Result<()>;

    /// Compose a machine and return its UUID.
    fn create_machine(
        &self,
        machine_name: &str,
        tenant_uuid: &str,
        spec: &MachineSpec,
        token: &str,
    ) -> Result<String>;

    fn machine_details(
        &self,
        tenant_uuid: &str,
        machine_uuid: &str,
        token: &str,
    ) -> Result<MachineDetails>;

    fn power_on(&self, machine_uuid: &str, tenant_uuid: &str, token: &str) -> Result<()>;

    fn power_off(&self, machine_uuid: &str, tenant_uuid: &str, token: &str) -> Result<()>;

    fn graceful_shutdown(&self, machine_uuid: &str, tenant_uuid: &str, token: &str) -> Result<()>;

    fn install_image(
        &self,
        tenant_uuid: &str,
        storage_id: &str,
        image: &str,
        token: &str,
    ) -> Result<()>;

    fn remove_machine(&self, machine_uuid: &str, tenant_uuid: &str, token: &str) -> Result<()>;
}

pub struct HttpFabricClient {
    base_url: String,
    http: Client,
    boot_storage_condition: Vec<Condition>,
}

impl HttpFabricClient {
    /// `api_url` is the CDI endpoint root; the fabric manager path is appended.
    pub fn new(api_url: &str, devices: &[Resource]) -> Result<Self> {
        if api_url.is_empty() {
            return Err(DriverError::mandatory("API URL", "api_url"));
        }
        let boot_storage_condition = models::boot_storage_condition(devices)
            .ok_or_else(|| {
                DriverError::config("not found condition in device spec for bootable storage")
            })?
            .to_vec();

        let http = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| DriverError::config(format!("building HTTP client: {e}")))?;

        let base_url = format!("{}{}", api_url.trim_end_matches('/'), API_PATH);
        debug!(base_url = %base_url, "created fabric manager client");

        Ok(Self {
            base_url,
            http,
            boot_storage_condition,
        })
    }

    /// Storage resource whose condition list equals the configured boot
    /// storage condition. A removed machine reports no resources at all.
    fn boot_storage_id(&self, machine_uuid: &str, resources: &[Resource]) -> Result<Option<String>> {
        if resources.is_empty() {
            info!(machine_uuid, "empty resource list, boot storage id not available");
            return Ok(None);
        }
        resources
            .iter()
            .find(|r| r.res_type == "storage" && r.conditions() == self.boot_storage_condition)
            .map(|r| Some(r.res_uuid.clone()))
            .ok_or_else(|| {
                error!(machine_uuid, conditions = ?self.boot_storage_condition, "boot storage not found in resources");
                DriverError::BootStorageNotFound {
                    machine_uuid: machine_uuid.to_string(),
                }
            })
    }

    fn put_machine_action(
        &self,
        machine_uuid: &str,
        action: &str,
        tenant_uuid: &str,
        token: &str,
    ) -> Result<()> {
        let path = format!("/machines/{machine_uuid}/{action}");
        self.put(&path, tenant_uuid, token, None::<&()>)?;
        Ok(())
    }

    // ── Internal helpers ───────────────────────────────────

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn get<T: DeserializeOwned>(&self, path: &str, tenant_uuid: &str, token: &str) -> Result<T> {
        let req = self.http.get(self.url(path));
        let body = self.send("GET", path, req, tenant_uuid, token, None)?;
        parse("GET", path, &body)
    }

    fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        tenant_uuid: &str,
        token: &str,
        payload: &B,
    ) -> Result<T> {
        let payload = encode("POST", path, payload)?;
        let req = self.http.post(self.url(path));
        let body = self.send("POST", path, req, tenant_uuid, token, Some(payload))?;
        parse("POST", path, &body)
    }

    fn put<B: Serialize>(
        &self,
        path: &str,
        tenant_uuid: &str,
        token: &str,
        payload: Option<&B>,
    ) -> Result<String> {
        let payload = match payload {
            Some(p) => encode("PUT", path, p)?,
            None => String::new(),
        };
        let req = self.http.put(self.url(path));
        self.send("PUT", path, req, tenant_uuid, token, Some(payload))
    }

    fn delete(&self, path: &str, tenant_uuid: &str, token: &str) -> Result<String> {
        let req = self.http.delete(self.url(path));
        self.send("DELETE", path, req, tenant_uuid, token, None)
    }

    fn send(
        &self,
        method: &'static str,
        path: &str,
        req: RequestBuilder,
        tenant_uuid: &str,
        token: &str,
        payload: Option<String>,
    ) -> Result<String> {
        let mut req = req.query(&[("tenant_uuid", tenant_uuid)]).bearer_auth(token);
        if let Some(payload) = payload {
            debug!(method, path, payload = %redact(&payload), "sending request");
            req = req.header(CONTENT_TYPE, "application/json").body(payload);
        } else {
            debug!(method, path, "sending request");
        }

        let fail = |status: Option<u16>, message: String| DriverError::Fabric {
            method,
            endpoint: path.to_string(),
            status,
            message,
        };

        let resp = req.send().map_err(|e| {
            error!(method, path, error = %e, "error sending request");
            fail(None, e.to_string())
        })?;
        let status = resp.status().as_u16();
        let body = resp
            .text()
            .map_err(|e| fail(Some(status), format!("reading response body: {e}")))?;

        if status >= 400 {
            error!(method, path, status, response_body = %redact(&body), "request failed");
            return Err(fail(Some(status), body));
        }

        debug!(method, path, status, response_body = %redact(&body), "received response");
        Ok(body)
    }
}

fn encode<B: Serialize>(method: &'static str, path: &str, payload: &B) -> Result<String> {
    serde_json::to_string(payload).map_err(|e| DriverError::Fabric {
        method,
        endpoint: path.to_string(),
        status: None,
        message: format!("encoding request payload: {e}"),
    })
}

fn parse<T: DeserializeOwned>(method: &'static str, path: &str, body: &str) -> Result<T> {
    serde_json::from_str(body).map_err(|e| DriverError::Fabric {
        method,
        endpoint: path.to_string(),
        status: None,
        message: format!("parsing response: {e}"),
    })
}

impl FabricClient for HttpFabricClient {
    fn validate_tenant(&self, tenant_uuid: &str, token: &str) -> Result<()> {
        let path = format!("/tenants/{tenant_uuid}");
        let _: serde_json::Value = self.get(&path, tenant_uuid, token)?;
        info!(tenant_uuid, "successfully validated tenant");
        Ok(())
    }

    fn create_machine(
        &self,
        machine_name: &str,
        tenant_uuid: &str,
        spec: &MachineSpec,
        token: &str,
    ) -> Result<String> {
        let request = spec.to_request(machine_name, tenant_uuid);
        let response: MachinesResponse = self.post("/machines", tenant_uuid, token, &request)?;

        let machine_uuid = response
            .data
            .machines
            .first()
            .map(|m| m.mach_uuid.clone())
            .filter(|uuid| !uuid.is_empty())
            .ok_or_else(|| DriverError::Fabric {
                method: "POST",
                endpoint: "/machines".into(),
                status: None,
                message: "response does not contain a machine UUID".into(),
            })?;

        info!(machine_uuid = %machine_uuid, "new machine successfully created");
        Ok(machine_uuid)
    }

    fn machine_details(
        &self,
        tenant_uuid: &str,
        machine_uuid: &str,
        token: &str,
    ) -> Result<MachineDetails> {
        let path = format!("/machines/{machine_uuid}");
        let response: MachinesResponse = self.get(&path, tenant_uuid, token)?;

        let machine = response.data.machines.into_iter().next().ok_or_else(|| {
            DriverError::Fabric {
                method: "GET",
                endpoint: path.clone(),
                status: None,
                message: "response does not contain the machine".into(),
            }
        })?;

        let boot_storage_id = self.boot_storage_id(machine_uuid, &machine.resources)?;
        debug!(
            machine_uuid,
            mach_status = machine.mach_status,
            boot_ssd = boot_storage_id.as_deref().unwrap_or(""),
            lanports = machine.lanports.len(),
            "received machine details"
        );

        Ok(MachineDetails {
            lanports: machine.lanports,
            boot_storage_id,
            status_code: machine.mach_status,
        })
    }

    fn power_on(&self, machine_uuid: &str, tenant_uuid: &str, token: &str) -> Result<()> {
        self.put_machine_action(machine_uuid, "pon", tenant_uuid, token)?;
        info!(machine_uuid, "requested machine power on");
        Ok(())
    }

    fn power_off(&self, machine_uuid: &str, tenant_uuid: &str, token: &str) -> Result<()> {
        self.put_machine_action(machine_uuid, "poff", tenant_uuid, token)?;
        info!(machine_uuid, "requested machine power off");
        Ok(())
    }

    fn graceful_shutdown(&self, machine_uuid: &str, tenant_uuid: &str, token: &str) -> Result<()> {
        self.put_machine_action(machine_uuid, "graceful", tenant_uuid, token)?;
        info!(machine_uuid, "requested graceful shutdown");
        Ok(())
    }

    fn install_image(
        &self,
        tenant_uuid: &str,
        storage_id: &str,
        image: &str,
        token: &str,
    ) -> Result<()> {
        let payload = ImageInstallation {
            resources: BootResource {
                res_uuid_ssd: storage_id.to_string(),
                bootimg_filename: image.to_string(),
            },
        };
        let path = format!("/resources/{storage_id}/imginstall");
        self.put(&path, tenant_uuid, token, Some(&payload))?;
        info!(storage_id, image, "requested image installation");
        Ok(())
    }

    fn remove_machine(&self, machine_uuid: &str, tenant_uuid: &str, token: &str) -> Result<()> {
        self.delete(&format!("/machines/{machine_uuid}"), tenant_uuid, token)?;
        info!(machine_uuid, "requested machine removal");
        Ok(())
    }
}

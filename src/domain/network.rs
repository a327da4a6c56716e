//! Node addresses from the fabric's lanport list.

use tracing::{debug, info};

use crate::errors::{DriverError, Result};
use crate::fabric::models::Lanport;

/// Addresses derived from a machine's lanports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeAddresses {
    pub primary: String,
    pub private: Option<String>,
}

/// Pick the primary (provisioning subnet) and private (baremetal subnet)
/// addresses. The first lanport on each subnet carrying an address wins.
pub fn resolve_addresses(
    lanports: &[Lanport],
    provision_subnet: &str,
    baremetal_subnet: Option<&str>,
) -> Result<NodeAddresses> {
    let mut primary: Option<&str> = None;
    let mut private: Option<&str> = None;

    for (idx, lanport) in lanports.iter().enumerate() {
        debug!(idx, subnet_uuid = %lanport.subnet_uuid, "inspecting lanport");
        if lanport.ip_address.is_empty() {
            continue;
        }
        if primary.is_none() && lanport.subnet_uuid == provision_subnet {
            primary = Some(lanport.ip_address.as_str());
            info!(ip = %lanport.ip_address, "filled IP address");
        }
        if private.is_none() && baremetal_subnet == Some(lanport.subnet_uuid.as_str()) {
            private = Some(lanport.ip_address.as_str());
            info!(ip = %lanport.ip_address, "filled private IP address");
        }
    }

    match primary {
        Some(ip) => Ok(NodeAddresses {
            primary: ip.to_string(),
            private: private.map(str::to_string),
        }),
        None => Err(DriverError::MissingProvisioningAddress {
            subnet_uuid: provision_subnet.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(subnet: &str, ip: &str) -> Lanport {
        Lanport {
            subnet_uuid: subnet.into(),
            ip_address: ip.into(),
            ..Default::default()
        }
    }

    #[test]
    fn assigns_both_roles() {
        let ports = [port("subnet-a", "10.0.0.1"), port("subnet-b", "10.0.0.2")];
        let addrs = resolve_addresses(&ports, "subnet-a", Some("subnet-b")).unwrap();
        assert_eq!(addrs.primary, "10.0.0.1");
        assert_eq!(addrs.private.as_deref(), Some("10.0.0.2"));
    }

    #[test]
    fn first_match_wins() {
        let ports = [
            port("subnet-b", "10.0.1.1"),
            port("subnet-a", "10.0.0.1"),
            port("subnet-a", "10.0.0.9"),
            port("subnet-b", "10.0.1.9"),
        ];
        let addrs = resolve_addresses(&ports, "subnet-a", Some("subnet-b")).unwrap();
        assert_eq!(addrs.primary, "10.0.0.1");
        assert_eq!(addrs.private.as_deref(), Some("10.0.1.1"));
    }

    #[test]
    fn private_address_is_optional() {
        let ports = [port("subnet-a", "10.0.0.1")];
        let addrs = resolve_addresses(&ports, "subnet-a", None).unwrap();
        assert_eq!(addrs.private, None);
    }

    #[test]
    fn missing_provisioning_port_is_an_error() {
        let ports = [port("subnet-b", "10.0.0.2")];
        let err = resolve_addresses(&ports, "subnet-a", Some("subnet-b")).unwrap_err();
        assert!(matches!(
            err,
            DriverError::MissingProvisioningAddress { ref subnet_uuid } if subnet_uuid == "subnet-a"
        ));
    }
}

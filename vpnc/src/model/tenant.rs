//! Tenant and service configuration model.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};

use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};

use super::connection::de_null_map;
use super::network_instance::NetworkInstance;

/// An administrative unit owning network instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Tenant {
    pub version: String,
    pub id: String,
    pub name: String,
    #[serde(default, deserialize_with = "de_null_map")]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub network_instances: BTreeMap<String, NetworkInstance>,
}

/// Deployment mode of the concentrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceMode {
    Hub,
    Endpoint,
}

/// Global BGP settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BgpGlobal {
    pub asn: u32,
    pub router_id: Ipv4Addr,
    #[serde(default)]
    pub bfd: bool,
}

/// One uplink peer toward the management environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BgpNeighbor {
    pub neighbor_address: IpAddr,
    pub neighbor_asn: u32,
    /// Lower is more preferred for receiving traffic; 0..=9.
    #[serde(default)]
    pub priority: u8,
}

/// BGP instance configuration for the core uplinks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Bgp {
    pub globals: BgpGlobal,
    pub neighbors: Vec<BgpNeighbor>,
}

/// The DEFAULT tenant: service-level settings plus the default network
/// instances (EXTERNAL, CORE, and ENDPOINT in endpoint mode).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Service {
    pub version: String,
    pub id: String,
    pub name: String,
    #[serde(default, deserialize_with = "de_null_map")]
    pub metadata: BTreeMap<String, String>,
    pub mode: ServiceMode,
    /// IKE local identifier used when a connection sets none.
    #[serde(default = "default_local_id")]
    pub local_id: String,
    /// /16 carved into /24 per NI, /28 per connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix_downlink_interface_v4: Option<Ipv4Net>,
    /// /32 carved into /48 per NI, /64 per connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix_downlink_interface_v6: Option<Ipv6Net>,
    /// /32 carved into a /96 per connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix_downlink_nat64: Option<Ipv6Net>,
    /// /12 carved into a /48 scope per NI.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix_downlink_nptv6: Option<Ipv6Net>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bgp: Option<Bgp>,
    #[serde(default)]
    pub network_instances: BTreeMap<String, NetworkInstance>,
}

fn default_local_id() -> String {
    "%any".to_string()
}

/// Private 32-bit ASN range accepted for the local BGP instance.
pub const ASN_RANGE: std::ops::RangeInclusive<u32> = 4_200_000_000..=4_294_967_294;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hub_service_config() {
        let yaml = r#"
version: "0.1.9"
id: DEFAULT
name: DEFAULT
mode: hub
prefix_downlink_interface_v4: 100.99.0.0/16
prefix_downlink_interface_v6: fdcc:cbe::/32
prefix_downlink_nat64: fdcc:0::/32
prefix_downlink_nptv6: fdc0::/12
bgp:
  globals:
    asn: 4200000000
    router_id: 10.0.10.1
    bfd: true
  neighbors:
    - neighbor_address: fd00:10::1
      neighbor_asn: 4200000001
      priority: 0
network_instances:
  EXTERNAL:
    id: EXTERNAL
    type: external
    connections: {}
  CORE:
    id: CORE
    type: core
    connections: {}
"#;
        let service: Service = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(service.mode, ServiceMode::Hub);
        assert_eq!(service.local_id, "%any");
        let bgp = service.bgp.unwrap();
        assert_eq!(bgp.globals.asn, 4_200_000_000);
        assert!(bgp.globals.bfd);
        assert_eq!(bgp.neighbors.len(), 1);
        assert_eq!(service.network_instances.len(), 2);
    }

    #[test]
    fn tenant_requires_version() {
        let yaml = r#"
id: C0001
name: tenant-one
network_instances: {}
"#;
        assert!(serde_yaml::from_str::<Tenant>(yaml).is_err());
    }
}

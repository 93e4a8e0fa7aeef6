//! Network instance data model.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::connection::Connection;

/// Role of a network instance inside the dataplane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NiType {
    External,
    Core,
    Downlink,
    Endpoint,
}

impl NiType {
    /// CORE, DOWNLINK and ENDPOINT instances route between interfaces.
    pub fn forwards(self) -> bool {
        matches!(self, NiType::Core | NiType::Downlink | NiType::Endpoint)
    }

    /// Instances wired to CORE with a veth pair.
    pub fn linked_to_core(self) -> bool {
        matches!(self, NiType::Downlink | NiType::Endpoint)
    }
}

/// An isolated routing domain, realized as a network namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkInstance {
    pub id: String,
    #[serde(rename = "type")]
    pub ni_type: NiType,
    #[serde(default, deserialize_with = "super::connection::de_null_map")]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub connections: BTreeMap<u8, Connection>,
}

impl NetworkInstance {
    /// Name of the core-side veth device of this instance.
    pub fn veth_core_name(&self) -> String {
        format!("{}_C", self.id)
    }

    /// Name of the instance-side veth device.
    pub fn veth_inner_name(&self) -> String {
        format!("{}_D", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_instance_with_connection_map() {
        let yaml = r#"
id: C0001-00
type: downlink
connections:
  0:
    id: 0
    config:
      type: physical
      interface_name: eth2
"#;
        let ni: NetworkInstance = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(ni.id, "C0001-00");
        assert_eq!(ni.ni_type, NiType::Downlink);
        assert_eq!(ni.connections.len(), 1);
        assert_eq!(ni.veth_core_name(), "C0001-00_C");
        assert_eq!(ni.veth_inner_name(), "C0001-00_D");
    }

    #[test]
    fn forwarding_roles() {
        assert!(!NiType::External.forwards());
        assert!(NiType::Core.forwards());
        assert!(NiType::Downlink.linked_to_core());
        assert!(!NiType::Core.linked_to_core());
    }
}

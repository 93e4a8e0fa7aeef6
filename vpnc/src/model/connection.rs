//! Connection data model: interface addresses, routes, and the tagged
//! transport configuration.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::{Ipv4Net, Ipv6Net};
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Interface addresses per family. `null` in YAML coerces to empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InterfaceAddrs {
    #[serde(default, deserialize_with = "de_null_vec")]
    pub ipv4: Vec<Ipv4Net>,
    #[serde(default, deserialize_with = "de_null_vec")]
    pub ipv6: Vec<Ipv6Net>,
}

impl InterfaceAddrs {
    pub fn is_empty(&self) -> bool {
        self.ipv4.is_empty() && self.ipv6.is_empty()
    }
}

/// An IPv4 route on a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteV4 {
    #[serde(deserialize_with = "de_route_v4")]
    pub to: Ipv4Net,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub via: Option<Ipv4Addr>,
}

/// An IPv6 route on a connection, optionally subject to NPTv6.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteV6 {
    #[serde(deserialize_with = "de_route_v6")]
    pub to: Ipv6Net,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub via: Option<Ipv6Addr>,
    #[serde(default = "default_true")]
    pub nptv6: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nptv6_prefix: Option<Ipv6Net>,
}

fn default_true() -> bool {
    true
}

/// Route lists per family.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Routes {
    #[serde(default, deserialize_with = "de_null_vec")]
    pub ipv4: Vec<RouteV4>,
    #[serde(default, deserialize_with = "de_null_vec")]
    pub ipv6: Vec<RouteV6>,
}

/// Whether an IPsec connection initiates or waits for the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Initiation {
    /// Initiate on load and restart on close.
    Start,
    /// Install a trap policy and wait for the peer.
    None,
}

impl Default for Initiation {
    fn default() -> Self {
        Initiation::Start
    }
}

/// Traffic selectors for policy-based IPsec.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrafficSelectors {
    #[serde(default, deserialize_with = "de_null_vec")]
    pub local: Vec<ipnet::IpNet>,
    #[serde(default, deserialize_with = "de_null_vec")]
    pub remote: Vec<ipnet::IpNet>,
}

impl TrafficSelectors {
    pub fn is_empty(&self) -> bool {
        self.local.is_empty() && self.remote.is_empty()
    }
}

/// IPsec transport settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IpsecConfig {
    pub remote_addrs: Vec<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    #[serde(default = "default_ike_version")]
    pub ike_version: u8,
    #[serde(default = "default_proposal")]
    pub ike_proposal: String,
    #[serde(default = "default_ike_lifetime")]
    pub ike_lifetime: u32,
    #[serde(default = "default_proposal")]
    pub ipsec_proposal: String,
    #[serde(default = "default_ipsec_lifetime")]
    pub ipsec_lifetime: u32,
    #[serde(default)]
    pub initiation: Initiation,
    pub psk: String,
    #[serde(default, skip_serializing_if = "TrafficSelectors::is_empty")]
    pub traffic_selectors: TrafficSelectors,
}

fn default_ike_version() -> u8 {
    2
}

fn default_proposal() -> String {
    "aes256gcm16-prfsha384-ecp384".to_string()
}

fn default_ike_lifetime() -> u32 {
    86_400
}

fn default_ipsec_lifetime() -> u32 {
    3_600
}

/// WireGuard transport settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WireguardConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_port: Option<u16>,
    pub remote_addrs: Vec<IpAddr>,
    #[serde(default = "default_wg_port")]
    pub remote_port: u16,
    pub private_key: String,
    pub public_key: String,
}

fn default_wg_port() -> u16 {
    51_820
}

/// SSH tunnel transport settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SshConfig {
    pub remote_addrs: Vec<IpAddr>,
    pub remote_tunnel_id: u8,
    pub username: String,
    #[serde(default)]
    pub remote_config: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_config_interface: Option<String>,
}

/// Physical transport: adopt an existing link into the instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PhysicalConfig {
    pub interface_name: String,
}

/// The tagged transport variant of a connection. The variant determines
/// which driver owns the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportConfig {
    Physical(PhysicalConfig),
    Ipsec(Box<IpsecConfig>),
    Wireguard(WireguardConfig),
    Ssh(SshConfig),
}

impl TransportConfig {
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportConfig::Physical(_) => TransportKind::Physical,
            TransportConfig::Ipsec(_) => TransportKind::Ipsec,
            TransportConfig::Wireguard(_) => TransportKind::Wireguard,
            TransportConfig::Ssh(_) => TransportKind::Ssh,
        }
    }
}

/// Transport discriminant, as spelled in YAML and status output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Physical,
    Ipsec,
    Wireguard,
    Ssh,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportKind::Physical => "physical",
            TransportKind::Ipsec => "ipsec",
            TransportKind::Wireguard => "wireguard",
            TransportKind::Ssh => "ssh",
        };
        f.write_str(s)
    }
}

// The transport config is an externally visible tagged object. Serde's
// internally tagged representation cannot combine with unknown-field
// rejection, so the tag is split off by hand before dispatching to the
// per-variant structs.
impl<'de> Deserialize<'de> for TransportConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let mut map = serde_yaml::Mapping::deserialize(deserializer)?;
        let tag = map
            .remove("type")
            .ok_or_else(|| D::Error::missing_field("type"))?;
        let kind: TransportKind =
            serde_yaml::from_value(tag).map_err(D::Error::custom)?;
        let rest = serde_yaml::Value::Mapping(map);
        let config = match kind {
            TransportKind::Physical => {
                TransportConfig::Physical(serde_yaml::from_value(rest).map_err(D::Error::custom)?)
            }
            TransportKind::Ipsec => {
                TransportConfig::Ipsec(serde_yaml::from_value(rest).map_err(D::Error::custom)?)
            }
            TransportKind::Wireguard => {
                TransportConfig::Wireguard(serde_yaml::from_value(rest).map_err(D::Error::custom)?)
            }
            TransportKind::Ssh => {
                TransportConfig::Ssh(serde_yaml::from_value(rest).map_err(D::Error::custom)?)
            }
        };
        Ok(config)
    }
}

impl Serialize for TransportConfig {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::Error as SerError;

        let value = match self {
            TransportConfig::Physical(c) => serde_yaml::to_value(c),
            TransportConfig::Ipsec(c) => serde_yaml::to_value(c),
            TransportConfig::Wireguard(c) => serde_yaml::to_value(c),
            TransportConfig::Ssh(c) => serde_yaml::to_value(c),
        }
        .map_err(S::Error::custom)?;
        let mut map = match value {
            serde_yaml::Value::Mapping(m) => m,
            _ => serde_yaml::Mapping::new(),
        };
        map.insert(
            serde_yaml::Value::from("type"),
            serde_yaml::Value::from(self.kind().to_string()),
        );
        serde_yaml::Value::Mapping(map).serialize(serializer)
    }
}

/// A transport attaching a network instance to a remote peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Connection {
    pub id: u8,
    #[serde(default, deserialize_with = "de_null_map")]
    pub metadata: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "de_null_default")]
    pub interface: InterfaceAddrs,
    #[serde(default, deserialize_with = "de_null_default")]
    pub routes: Routes,
    pub config: TransportConfig,
}

// `null` coercion helpers. The configuration format allows explicit
// nulls wherever a list or mapping may be omitted.

fn de_null_vec<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    let opt = Option::<Vec<T>>::deserialize(deserializer)?;
    Ok(opt.unwrap_or_default())
}

pub(crate) fn de_null_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let opt = Option::<BTreeMap<String, String>>::deserialize(deserializer)?;
    Ok(opt.unwrap_or_default())
}

fn de_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    let opt = Option::<T>::deserialize(deserializer)?;
    Ok(opt.unwrap_or_default())
}

fn de_route_v4<'de, D>(deserializer: D) -> Result<Ipv4Net, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    let raw = if raw == "default" { "0.0.0.0/0" } else { &raw };
    raw.parse().map_err(DeError::custom)
}

fn de_route_v6<'de, D>(deserializer: D) -> Result<Ipv6Net, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    let raw = if raw == "default" { "::/0" } else { &raw };
    raw.parse().map_err(DeError::custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ipsec_connection_with_defaults() {
        let yaml = r#"
id: 0
config:
  type: ipsec
  remote_addrs: [192.0.2.5]
  psk: supersecret
"#;
        let conn: Connection = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(conn.id, 0);
        match &conn.config {
            TransportConfig::Ipsec(ipsec) => {
                assert_eq!(ipsec.ike_version, 2);
                assert_eq!(ipsec.ike_proposal, "aes256gcm16-prfsha384-ecp384");
                assert_eq!(ipsec.initiation, Initiation::Start);
                assert!(ipsec.traffic_selectors.is_empty());
            }
            other => panic!("expected ipsec, got {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_transport_fields() {
        let yaml = r#"
id: 0
config:
  type: wireguard
  remote_addrs: [192.0.2.8]
  remote_port: 51820
  private_key: aaaa
  public_key: bbbb
  bogus_field: true
"#;
        assert!(serde_yaml::from_str::<Connection>(yaml).is_err());
    }

    #[test]
    fn route_default_keyword_coerces() {
        let yaml = r#"
id: 1
routes:
  ipv4:
    - to: default
      via: 192.0.2.1
  ipv6:
    - to: default
config:
  type: physical
  interface_name: eth3
"#;
        let conn: Connection = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(conn.routes.ipv4[0].to.to_string(), "0.0.0.0/0");
        assert_eq!(conn.routes.ipv6[0].to.to_string(), "::/0");
        assert!(conn.routes.ipv6[0].nptv6);
    }

    #[test]
    fn transport_roundtrips_with_tag() {
        let config = TransportConfig::Ssh(SshConfig {
            remote_addrs: vec!["198.51.100.7".parse().unwrap()],
            remote_tunnel_id: 9,
            username: "ncubed".to_string(),
            remote_config: true,
            remote_config_interface: Some("eth0".to_string()),
        });
        let yaml = serde_yaml::to_string(&config).unwrap();
        assert!(yaml.contains("type: ssh"));
        let back: TransportConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn null_lists_coerce_to_empty() {
        let yaml = r#"
id: 2
metadata:
interface:
routes:
config:
  type: physical
  interface_name: ens6
"#;
        let conn: Connection = serde_yaml::from_str(yaml).unwrap();
        assert!(conn.metadata.is_empty());
        assert!(conn.interface.is_empty());
        assert!(conn.routes.ipv4.is_empty());
    }
}

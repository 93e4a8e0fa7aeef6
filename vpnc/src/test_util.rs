//! Shared fixtures for unit and integration tests.

use std::collections::BTreeMap;

use crate::model::{
    Bgp, BgpGlobal, BgpNeighbor, Connection, Initiation, InterfaceAddrs, IpsecConfig,
    NetworkInstance, NiType, RouteV4, RouteV6, Routes, Service, ServiceMode, SshConfig, Tenant,
    TrafficSelectors, TransportConfig, WireguardConfig,
};
use crate::store::Snapshot;

/// Hub-mode service config with the documented allocator prefixes and
/// two uplink neighbors (priorities 0 and 1).
pub fn hub_service() -> Service {
    let mut network_instances = BTreeMap::new();
    network_instances.insert(
        "EXTERNAL".to_string(),
        NetworkInstance {
            id: "EXTERNAL".to_string(),
            ni_type: NiType::External,
            metadata: BTreeMap::new(),
            connections: BTreeMap::from([(
                0,
                Connection {
                    id: 0,
                    metadata: BTreeMap::new(),
                    interface: InterfaceAddrs {
                        ipv4: vec!["192.0.2.2/24".parse().unwrap()],
                        ipv6: vec![],
                    },
                    routes: Routes {
                        ipv4: vec![RouteV4 {
                            to: "0.0.0.0/0".parse().unwrap(),
                            via: Some("192.0.2.1".parse().unwrap()),
                        }],
                        ipv6: vec![],
                    },
                    config: TransportConfig::Physical(crate::model::PhysicalConfig {
                        interface_name: "eth1".to_string(),
                    }),
                },
            )]),
        },
    );
    network_instances.insert(
        "CORE".to_string(),
        NetworkInstance {
            id: "CORE".to_string(),
            ni_type: NiType::Core,
            metadata: BTreeMap::new(),
            connections: BTreeMap::from([(
                0,
                Connection {
                    id: 0,
                    metadata: BTreeMap::new(),
                    interface: InterfaceAddrs {
                        ipv4: vec![],
                        ipv6: vec!["fd00:10::2/64".parse().unwrap()],
                    },
                    routes: Routes {
                        ipv4: vec![],
                        ipv6: vec![RouteV6 {
                            to: "fd00::/16".parse().unwrap(),
                            via: Some("fd00:10::1".parse().unwrap()),
                            nptv6: false,
                            nptv6_prefix: None,
                        }],
                    },
                    config: TransportConfig::Physical(crate::model::PhysicalConfig {
                        interface_name: "eth0".to_string(),
                    }),
                },
            )]),
        },
    );

    Service {
        version: "0.1.9".to_string(),
        id: "DEFAULT".to_string(),
        name: "DEFAULT".to_string(),
        metadata: BTreeMap::new(),
        mode: ServiceMode::Hub,
        local_id: "%any".to_string(),
        prefix_downlink_interface_v4: Some("100.99.0.0/16".parse().unwrap()),
        prefix_downlink_interface_v6: Some("fdcc:cbe::/32".parse().unwrap()),
        prefix_downlink_nat64: Some("fdcc:0::/32".parse().unwrap()),
        prefix_downlink_nptv6: Some("fdc0::/12".parse().unwrap()),
        bgp: Some(Bgp {
            globals: BgpGlobal {
                asn: 4_200_000_000,
                router_id: "10.0.10.1".parse().unwrap(),
                bfd: false,
            },
            neighbors: vec![
                BgpNeighbor {
                    neighbor_address: "fd00:10::1".parse().unwrap(),
                    neighbor_asn: 4_200_000_001,
                    priority: 0,
                },
                BgpNeighbor {
                    neighbor_address: "fd00:10::5".parse().unwrap(),
                    neighbor_asn: 4_200_000_001,
                    priority: 1,
                },
            ],
        }),
        network_instances,
    }
}

/// An IPsec connection with one remote and one NPTv6-flagged route.
pub fn ipsec_connection(id: u8) -> Connection {
    Connection {
        id,
        metadata: BTreeMap::new(),
        interface: InterfaceAddrs::default(),
        routes: Routes {
            ipv4: vec![RouteV4 {
                to: "172.16.30.0/24".parse().unwrap(),
                via: None,
            }],
            ipv6: vec![RouteV6 {
                to: "2001:db8:c58::/48".parse().unwrap(),
                via: None,
                nptv6: true,
                nptv6_prefix: None,
            }],
        },
        config: TransportConfig::Ipsec(Box::new(IpsecConfig {
            remote_addrs: vec!["203.0.113.10".parse().unwrap()],
            local_id: None,
            remote_id: None,
            ike_version: 2,
            ike_proposal: "aes256gcm16-prfsha384-ecp384".to_string(),
            ike_lifetime: 86_400,
            ipsec_proposal: "aes256gcm16-prfsha384-ecp384".to_string(),
            ipsec_lifetime: 3_600,
            initiation: Initiation::Start,
            psk: "fixture-psk".to_string(),
            traffic_selectors: TrafficSelectors::default(),
        })),
    }
}

/// A WireGuard connection matching the S2 scenario shape.
pub fn wireguard_connection(id: u8) -> Connection {
    Connection {
        id,
        metadata: BTreeMap::new(),
        interface: InterfaceAddrs::default(),
        routes: Routes {
            ipv4: vec![],
            ipv6: vec![
                RouteV6 {
                    to: "2001:db8:c58::/48".parse().unwrap(),
                    via: None,
                    nptv6: false,
                    nptv6_prefix: None,
                },
                RouteV6 {
                    to: "2001:db8:c59::/52".parse().unwrap(),
                    via: None,
                    nptv6: true,
                    nptv6_prefix: None,
                },
            ],
        },
        config: TransportConfig::Wireguard(WireguardConfig {
            local_port: None,
            remote_addrs: vec!["192.0.2.8".parse().unwrap()],
            remote_port: 51_820,
            private_key: "cPYIsFq5kTJ2xkJliRrGy1gMCH3g/RlxKxUkwBDa23s=".to_string(),
            public_key: "Hm09lkMyKJHTEsWlTBxWqK6HpFCyLhWAbVIHg1bqnDI=".to_string(),
        }),
    }
}

/// An SSH tunnel connection.
pub fn ssh_connection(id: u8) -> Connection {
    Connection {
        id,
        metadata: BTreeMap::new(),
        interface: InterfaceAddrs::default(),
        routes: Routes::default(),
        config: TransportConfig::Ssh(SshConfig {
            remote_addrs: vec!["198.51.100.7".parse().unwrap()],
            remote_tunnel_id: 9,
            username: "ncubed".to_string(),
            remote_config: false,
            remote_config_interface: None,
        }),
    }
}

/// Tenant `C0001` with one downlink NI holding the given connections.
pub fn tenant_with(ni_index: u8, connections: Vec<Connection>) -> Tenant {
    let ni_id = format!("C0001-{ni_index:02x}");
    let connections: BTreeMap<u8, Connection> =
        connections.into_iter().map(|c| (c.id, c)).collect();
    Tenant {
        version: "0.1.9".to_string(),
        id: "C0001".to_string(),
        name: "tenant-one".to_string(),
        metadata: BTreeMap::new(),
        network_instances: BTreeMap::from([(
            ni_id.clone(),
            NetworkInstance {
                id: ni_id,
                ni_type: NiType::Downlink,
                metadata: BTreeMap::new(),
                connections,
            },
        )]),
    }
}

/// A full hub snapshot: service + tenant C0001 with one IPsec downlink.
pub fn hub_snapshot() -> Snapshot {
    let tenant = tenant_with(0, vec![ipsec_connection(0)]);
    Snapshot {
        service: hub_service(),
        tenants: BTreeMap::from([(tenant.id.clone(), tenant)]),
    }
}

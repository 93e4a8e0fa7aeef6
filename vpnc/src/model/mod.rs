//! Configuration data model.
//!
//! Mirrors the on-disk YAML schema: one file per tenant, the DEFAULT
//! tenant carrying service-level settings. Everything is plain data;
//! semantic validation lives in [`crate::store`].

pub mod connection;
pub mod info;
pub mod network_instance;
pub mod tenant;

pub use connection::{
    Connection, Initiation, InterfaceAddrs, IpsecConfig, PhysicalConfig, RouteV4, RouteV6, Routes,
    SshConfig, TrafficSelectors, TransportConfig, TransportKind, WireguardConfig,
};
pub use info::{DownlinkInfo, TenantId, TenantLetter};
pub use network_instance::{NetworkInstance, NiType};
pub use tenant::{Bgp, BgpGlobal, BgpNeighbor, Service, ServiceMode, Tenant};

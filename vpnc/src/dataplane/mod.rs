//! Dataplane primitives.
//!
//! Thin, idempotent wrappers over kernel state: namespaces, links,
//! addresses, routes, the NAT64 instance and NPTv6 mappings of a
//! network instance. Every mutation reports whether it created,
//! changed, or left state untouched, so the reconciler can prove
//! idempotence. Tests substitute [`memory::MemoryDataplane`].

pub mod linux;
pub mod memory;

use std::net::IpAddr;

use async_trait::async_trait;
use ipnet::{IpNet, Ipv6Net};
use thiserror::Error;

/// Outcome of an idempotent primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// State already matched the request.
    Unchanged,
    /// Existing state was updated.
    Changed,
    /// The object did not exist and was created.
    Created,
}

impl Applied {
    pub fn mutated(self) -> bool {
        !matches!(self, Applied::Unchanged)
    }
}

/// Link flavors the reconciler knows how to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkKind {
    /// XFRM interface matching an IPsec policy by if_id.
    Xfrm { if_id: u32 },
    Wireguard,
    /// One end of a veth pair; the peer lands in `peer_ns`.
    Veth { peer: String, peer_ns: String },
    Tun,
}

/// A link to ensure inside a network instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSpec {
    pub name: String,
    pub kind: LinkKind,
    /// Namespace the device is parented in before being moved into the
    /// instance (virtual tunnel devices are born in EXTERNAL so their
    /// encrypted side stays there).
    pub parent_ns: Option<String>,
}

/// A route to ensure inside a network instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSpec {
    pub dst: IpNet,
    pub via: Option<IpAddr>,
    pub device: Option<String>,
    pub blackhole: bool,
}

impl RouteSpec {
    pub fn unicast(dst: IpNet, via: Option<IpAddr>, device: Option<String>) -> Self {
        Self {
            dst,
            via,
            device,
            blackhole: false,
        }
    }

    pub fn blackhole(dst: IpNet) -> Self {
        Self {
            dst,
            via: None,
            device: None,
            blackhole: true,
        }
    }
}

/// Errors surfaced by dataplane primitives.
#[derive(Debug, Error)]
pub enum DataplaneError {
    /// EBUSY/EEXIST class failures; retried by the caller.
    #[error("kernel busy: {0}")]
    Busy(String),

    #[error("{object} not found")]
    NotFound { object: String },

    #[error("command `{command}` failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("netlink error: {0}")]
    Netlink(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type DpResult<T> = Result<T, DataplaneError>;

/// Kernel-state primitives for one host.
///
/// Implementations must be idempotent: re-applying the same request
/// yields `Applied::Unchanged` and no kernel mutation.
#[async_trait]
pub trait Dataplane: Send + Sync {
    async fn ns_list(&self) -> DpResult<Vec<String>>;
    async fn ns_ensure(&self, name: &str) -> DpResult<Applied>;
    async fn ns_delete(&self, name: &str) -> DpResult<()>;

    /// Enable IPv4+IPv6 forwarding inside an instance.
    async fn forwarding_enable(&self, ns: &str) -> DpResult<Applied>;

    async fn link_ensure(&self, ns: &str, spec: &LinkSpec) -> DpResult<Applied>;
    async fn link_up(&self, ns: &str, name: &str) -> DpResult<Applied>;
    async fn link_delete(&self, ns: &str, name: &str) -> DpResult<()>;
    async fn link_exists(&self, ns: &str, name: &str) -> DpResult<bool>;
    async fn link_is_up(&self, ns: &str, name: &str) -> DpResult<bool>;
    async fn links(&self, ns: &str) -> DpResult<Vec<String>>;

    /// Adopt an existing link from the default namespace.
    async fn link_adopt(&self, ns: &str, name: &str) -> DpResult<Applied>;
    /// Return an adopted link to the default namespace.
    async fn link_release(&self, ns: &str, name: &str) -> DpResult<()>;

    /// Make the global-scope addresses of a link exactly `addrs`.
    async fn addr_sync(&self, ns: &str, link: &str, addrs: &[IpNet]) -> DpResult<Applied>;
    /// Add one address if missing, leaving others alone (used for the
    /// link-local veth pairs, which addr_sync does not see).
    async fn addr_ensure(&self, ns: &str, link: &str, addr: &IpNet) -> DpResult<Applied>;
    async fn addrs(&self, ns: &str, link: &str) -> DpResult<Vec<IpNet>>;

    async fn route_ensure(&self, ns: &str, route: &RouteSpec) -> DpResult<Applied>;
    async fn route_delete(&self, ns: &str, dst: &IpNet) -> DpResult<()>;
    async fn routes(&self, ns: &str) -> DpResult<Vec<RouteSpec>>;

    /// Bind the NAT64 instance of an NI to a /96 pool.
    async fn nat64_ensure(&self, ns: &str, pool: Ipv6Net) -> DpResult<Applied>;
    async fn nat64_delete(&self, ns: &str) -> DpResult<()>;
    async fn nat64_pool(&self, ns: &str) -> DpResult<Option<Ipv6Net>>;

    /// Make the 1:1 prefix mappings of an NI exactly `rules`
    /// (internal -> external).
    async fn nptv6_sync(&self, ns: &str, rules: &[(Ipv6Net, Ipv6Net)]) -> DpResult<Applied>;
    async fn nptv6_rules(&self, ns: &str) -> DpResult<Vec<(Ipv6Net, Ipv6Net)>>;
}

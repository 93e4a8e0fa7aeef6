//! Per-transport connection drivers.
//!
//! Every driver implements the same contract: `apply` installs the
//! transport configuration, `observe` reports the live state, and
//! `teardown` removes every kernel object the connection owns.

pub mod ipsec;
pub mod physical;
pub mod ssh;
pub mod wireguard;

use async_trait::async_trait;
use ipnet::IpNet;
use serde::Serialize;
use thiserror::Error;

use crate::config::Settings;
use crate::dataplane::DataplaneError;
use crate::model::{Connection, DownlinkInfo, NetworkInstance, Service, TransportKind};

/// Connection lifecycle states.
///
/// `apply` moves IDLE/CONFIGURED to CONNECTING; `observe` promotes to
/// ACTIVE once the transport reports establishment and demotes to
/// DEGRADED on loss. `teardown` is valid from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConnectionState {
    Idle,
    Configured,
    Connecting,
    Active,
    Degraded,
    Teardown,
}

/// Driver failures, split by recovery policy.
#[derive(Debug, Error)]
pub enum DriverError {
    /// Timeouts and disconnects; retried with backoff, the connection
    /// goes DEGRADED.
    #[error("transient: {0}")]
    Transient(String),
    /// Rejected configuration; the connection stays CONFIGURED.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl From<DataplaneError> for DriverError {
    fn from(e: DataplaneError) -> Self {
        match e {
            DataplaneError::NotFound { .. } => DriverError::Fatal(e.to_string()),
            other => DriverError::Transient(other.to_string()),
        }
    }
}

/// Everything a driver needs to know about one connection.
pub struct ConnCtx<'a> {
    pub service: &'a Service,
    pub ni: &'a NetworkInstance,
    pub conn: &'a Connection,
    /// Parsed name pieces for downlink instances.
    pub info: Option<DownlinkInfo>,
    /// Resolved interface addresses (explicit or allocator-assigned).
    pub addrs: Vec<IpNet>,
    pub settings: &'a Settings,
}

impl ConnCtx<'_> {
    /// Name of the kernel interface owned by this connection.
    pub fn interface_name(&self) -> String {
        interface_name(self.ni, self.conn)
    }

    /// IKE connection name, shared between swanctl config and SA events.
    pub fn ike_name(&self) -> String {
        format!("{}-{}", self.ni.id, self.conn.id)
    }
}

/// Interface naming per transport, stable across restarts.
pub fn interface_name(ni: &NetworkInstance, conn: &Connection) -> String {
    match conn.config.kind() {
        TransportKind::Ipsec => format!("xfrm{}", conn.id),
        TransportKind::Wireguard => format!("wg-{}-{}", ni.id, conn.id),
        TransportKind::Ssh => format!("tun{}", conn.id),
        TransportKind::Physical => match &conn.config {
            crate::model::TransportConfig::Physical(p) => p.interface_name.clone(),
            _ => unreachable!("kind and variant always agree"),
        },
    }
}

/// Common lifecycle contract implemented by every transport.
#[async_trait]
pub trait ConnectionDriver: Send + Sync {
    /// Install configuration and kernel objects; returns the state the
    /// connection reached (normally CONNECTING).
    async fn apply(&self, ctx: &ConnCtx<'_>) -> Result<ConnectionState, DriverError>;

    /// Report the live transport state without mutating anything.
    async fn observe(&self, ctx: &ConnCtx<'_>) -> Result<ConnectionState, DriverError>;

    /// Remove every kernel object and subordinate-daemon config owned
    /// by the connection. Total: valid from any state, ends at IDLE.
    async fn teardown(&self, ctx: &ConnCtx<'_>) -> Result<(), DriverError>;
}

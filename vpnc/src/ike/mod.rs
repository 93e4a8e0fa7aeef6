//! IKE daemon integration: connection configuration, control channel
//! and the duplicate-SA monitor.

pub mod monitor;
pub mod swanctl;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub use monitor::{SaEvent, SaKey, SaMonitor, SaTable};
pub use swanctl::SwanctlControl;

#[derive(Debug, Error)]
pub enum IkeError {
    #[error("IKE control channel unavailable: {0}")]
    Unavailable(String),
    #[error("IKE daemon rejected the request: {0}")]
    Rejected(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One installed IKE or CHILD SA as reported by the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaInfo {
    /// Connection name (`<ni>-<conn>`).
    pub name: String,
    /// Daemon-assigned unique id, used for targeted termination.
    pub unique_id: String,
    pub local_id: String,
    pub remote_id: String,
    pub if_id: u32,
    /// ESTABLISHED / INSTALLED / CONNECTING as reported.
    pub state: String,
    pub remote_host: Option<std::net::IpAddr>,
    pub established: DateTime<Utc>,
}

/// Control channel toward the IKE daemon.
///
/// The production implementation renders swanctl configuration files
/// and drives the daemon through its control binary; tests install an
/// in-memory stub.
#[async_trait]
pub trait IkeControl: Send + Sync {
    /// Write (or with `None`, remove) the per-NI connection config and
    /// reload the daemon. Atomic per connection block.
    async fn write_config(&self, ni_id: &str, rendered: Option<String>) -> Result<(), IkeError>;

    /// Start negotiation for a connection by name.
    async fn initiate(&self, ike_name: &str) -> Result<(), IkeError>;

    /// Terminate all SAs of a connection by name.
    async fn terminate_ike(&self, ike_name: &str) -> Result<(), IkeError>;

    /// Terminate one SA by daemon-assigned unique id.
    async fn terminate_sa(&self, unique_id: &str) -> Result<(), IkeError>;

    /// List installed SAs, optionally filtered by connection name.
    async fn list_sas(&self, ike_name: Option<&str>) -> Result<Vec<SaInfo>, IkeError>;
}

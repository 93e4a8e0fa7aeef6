//! Daemon settings and well-known file-system locations.

use std::path::PathBuf;

/// Name of the default tenant and its configuration file stem.
pub const DEFAULT_TENANT: &str = "DEFAULT";
/// Name of the trusted CORE network instance.
pub const CORE_NI: &str = "CORE";
/// Name of the untrusted EXTERNAL network instance.
pub const EXTERNAL_NI: &str = "EXTERNAL";
/// Name of the ENDPOINT network instance (endpoint mode only).
pub const ENDPOINT_NI: &str = "ENDPOINT";

/// Runtime settings, resolved from CLI arguments.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Directory holding one active YAML file per tenant.
    pub active_dir: PathBuf,
    /// Directory holding candidate YAML files.
    pub candidate_dir: PathBuf,
    /// swanctl connection configuration directory.
    pub swanctl_dir: PathBuf,
    /// WireGuard peer configuration directory.
    pub wireguard_dir: PathBuf,
    /// Routing daemon configuration file.
    pub frr_config: PathBuf,
    /// Control socket of the DNS-doctoring hook.
    pub mangle_socket: PathBuf,
    /// Mirror file for DNS-doctoring rules.
    pub mangle_rules: PathBuf,
    /// Directory for ssh tunnel control sockets.
    pub ssh_socket_dir: PathBuf,
    /// Listen address for the read-only status endpoint.
    pub status_listen: String,
    /// Seconds between scans of the active config directory.
    pub watch_interval_secs: u64,
    /// Seconds between routing-daemon neighbor polls.
    pub bgp_poll_interval_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        let config_root = PathBuf::from("/opt/ncubed/config/vpnc");
        Self {
            active_dir: config_root.join("active"),
            candidate_dir: config_root.join("candidate"),
            swanctl_dir: PathBuf::from("/etc/swanctl/conf.d"),
            wireguard_dir: PathBuf::from("/etc/wireguard"),
            frr_config: PathBuf::from("/etc/frr/frr.conf"),
            mangle_socket: PathBuf::from("/run/vpnc/vpncmangle.sock"),
            mangle_rules: PathBuf::from("/opt/ncubed/config/vpncmangle/translations.json"),
            ssh_socket_dir: PathBuf::from("/run/vpnc/ssh"),
            status_listen: "127.0.0.1:9090".to_string(),
            watch_interval_secs: 1,
            bgp_poll_interval_secs: 10,
        }
    }
}

/// Default timeout for external commands (IKE reload, routing reload,
/// link operations).
pub const COMMAND_TIMEOUT_SECS: u64 = 10;

/// Cap for driver retry backoff.
pub const RETRY_BACKOFF_CAP_SECS: u64 = 300;

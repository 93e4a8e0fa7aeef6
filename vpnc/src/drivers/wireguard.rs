//! WireGuard connection driver.
//!
//! One dedicated link per connection with a single peer. Peer settings
//! are rendered to a config file and applied with `wg syncconf`, the
//! idempotent form of the tool; the device itself lives in the tenant
//! instance while its UDP socket stays in EXTERNAL.

use std::fmt::Write as _;
use std::path::PathBuf;
use std::process::Output;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use thiserror::Error;
use tokio::process::Command;
use tracing::info;

use crate::config::{COMMAND_TIMEOUT_SECS, EXTERNAL_NI};
use crate::dataplane::{Dataplane, LinkKind, LinkSpec};
use crate::model::{TransportConfig, WireguardConfig};
use crate::store::write_atomic;

use super::{ConnCtx, ConnectionDriver, ConnectionState, DriverError};

/// Handshakes older than this mark the peer unreachable.
const HANDSHAKE_FRESH_SECS: i64 = 180;

#[derive(Debug, Error)]
pub enum WgError {
    #[error("wg command failed: {0}")]
    Command(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Control surface over the WireGuard tooling, mockable for tests.
#[async_trait]
pub trait WgControl: Send + Sync {
    /// Apply a rendered config to a device with syncconf semantics.
    async fn sync_device(&self, ns: &str, ifname: &str, config: &str) -> Result<(), WgError>;
    /// Remove the stored config for a device.
    async fn remove_config(&self, ifname: &str) -> Result<(), WgError>;
    /// Timestamp of the last peer handshake, if any.
    async fn last_handshake(&self, ns: &str, ifname: &str)
        -> Result<Option<DateTime<Utc>>, WgError>;
}

/// Render the `wg` configuration for one connection: the local key and
/// exactly one peer with full-tunnel allowed-ips.
pub fn render_device_config(config: &WireguardConfig) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "[Interface]");
    let _ = writeln!(out, "PrivateKey = {}", config.private_key);
    if let Some(port) = config.local_port {
        let _ = writeln!(out, "ListenPort = {port}");
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "[Peer]");
    let _ = writeln!(out, "PublicKey = {}", config.public_key);
    let _ = writeln!(
        out,
        "Endpoint = {}",
        endpoint(config.remote_addrs[0], config.remote_port)
    );
    let _ = writeln!(out, "AllowedIPs = 0.0.0.0/0, ::/0");
    out
}

fn endpoint(addr: std::net::IpAddr, port: u16) -> String {
    match addr {
        std::net::IpAddr::V4(v4) => format!("{v4}:{port}"),
        std::net::IpAddr::V6(v6) => format!("[{v6}]:{port}"),
    }
}

/// Production implementation using the `wg` binary.
pub struct WgCli {
    config_dir: PathBuf,
}

impl WgCli {
    pub fn new(config_dir: PathBuf) -> Self {
        Self { config_dir }
    }

    fn config_path(&self, ifname: &str) -> PathBuf {
        self.config_dir.join(format!("{ifname}.conf"))
    }

    async fn run(&self, args: &[&str]) -> Result<Output, WgError> {
        let output = tokio::time::timeout(
            Duration::from_secs(COMMAND_TIMEOUT_SECS),
            Command::new("ip").args(args).output(),
        )
        .await
        .map_err(|_| WgError::Command("timed out".to_string()))??;
        if !output.status.success() {
            return Err(WgError::Command(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(output)
    }
}

#[async_trait]
impl WgControl for WgCli {
    async fn sync_device(&self, ns: &str, ifname: &str, config: &str) -> Result<(), WgError> {
        let path = self.config_path(ifname);
        write_atomic(&path, config.as_bytes()).map_err(|e| WgError::Command(e.to_string()))?;
        let path_str = path.display().to_string();
        self.run(&[
            "netns", "exec", ns, "wg", "syncconf", ifname, &path_str,
        ])
        .await?;
        Ok(())
    }

    async fn remove_config(&self, ifname: &str) -> Result<(), WgError> {
        let path = self.config_path(ifname);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    async fn last_handshake(
        &self,
        ns: &str,
        ifname: &str,
    ) -> Result<Option<DateTime<Utc>>, WgError> {
        let output = self
            .run(&["netns", "exec", ns, "wg", "show", ifname, "latest-handshakes"])
            .await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let timestamp = stdout
            .split_whitespace()
            .last()
            .and_then(|t| t.parse::<i64>().ok())
            .unwrap_or(0);
        if timestamp == 0 {
            return Ok(None);
        }
        Ok(Utc.timestamp_opt(timestamp, 0).single())
    }
}

pub struct WireguardDriver {
    dp: Arc<dyn Dataplane>,
    wg: Arc<dyn WgControl>,
}

impl WireguardDriver {
    pub fn new(dp: Arc<dyn Dataplane>, wg: Arc<dyn WgControl>) -> Self {
        Self { dp, wg }
    }
}

#[async_trait]
impl ConnectionDriver for WireguardDriver {
    async fn apply(&self, ctx: &ConnCtx<'_>) -> Result<ConnectionState, DriverError> {
        let TransportConfig::Wireguard(config) = &ctx.conn.config else {
            return Err(DriverError::Fatal("not a WireGuard connection".to_string()));
        };
        let ifname = ctx.interface_name();
        let spec = LinkSpec {
            name: ifname.clone(),
            kind: LinkKind::Wireguard,
            parent_ns: Some(EXTERNAL_NI.to_string()),
        };
        self.dp.link_ensure(&ctx.ni.id, &spec).await?;
        self.dp.addr_sync(&ctx.ni.id, &ifname, &ctx.addrs).await?;
        self.wg
            .sync_device(&ctx.ni.id, &ifname, &render_device_config(config))
            .await
            .map_err(|e| DriverError::Transient(e.to_string()))?;
        self.dp.link_up(&ctx.ni.id, &ifname).await?;
        Ok(ConnectionState::Connecting)
    }

    async fn observe(&self, ctx: &ConnCtx<'_>) -> Result<ConnectionState, DriverError> {
        let ifname = ctx.interface_name();
        if !self.dp.link_exists(&ctx.ni.id, &ifname).await? {
            return Ok(ConnectionState::Idle);
        }
        let handshake = self
            .wg
            .last_handshake(&ctx.ni.id, &ifname)
            .await
            .map_err(|e| DriverError::Transient(e.to_string()))?;
        match handshake {
            Some(ts) if Utc::now() - ts < chrono::Duration::seconds(HANDSHAKE_FRESH_SECS) => {
                Ok(ConnectionState::Active)
            }
            _ => Ok(ConnectionState::Degraded),
        }
    }

    async fn teardown(&self, ctx: &ConnCtx<'_>) -> Result<(), DriverError> {
        let ifname = ctx.interface_name();
        info!(ni = %ctx.ni.id, conn = ctx.conn.id, "tearing down WireGuard connection");
        self.dp.link_delete(&ctx.ni.id, &ifname).await?;
        self.wg
            .remove_config(&ifname)
            .await
            .map_err(|e| DriverError::Transient(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TransportConfig;
    use crate::test_util::wireguard_connection;

    #[test]
    fn renders_single_peer_full_tunnel() {
        let conn = wireguard_connection(0);
        let TransportConfig::Wireguard(config) = &conn.config else {
            unreachable!()
        };
        let rendered = render_device_config(config);
        assert_eq!(rendered.matches("[Peer]").count(), 1);
        assert!(rendered.contains("Endpoint = 192.0.2.8:51820"));
        assert!(rendered.contains("AllowedIPs = 0.0.0.0/0, ::/0"));
        // No ListenPort line without a configured local port.
        assert!(!rendered.contains("ListenPort"));
    }

    #[test]
    fn v6_endpoints_are_bracketed() {
        assert_eq!(
            endpoint("2001:db8::1".parse().unwrap(), 51820),
            "[2001:db8::1]:51820"
        );
    }
}

//! SSH tunnel driver.
//!
//! Each connection is a supervised `ssh -w` process building a layer-3
//! tun tunnel. The supervisor restarts crashed tunnels with exponential
//! backoff (1,2,4,..,60s), resetting once a tunnel stayed up for a
//! minute. With `remote_config` enabled, the far end is provisioned
//! over the tunnel on every (re)start.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ipnet::IpNet;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::dataplane::{Dataplane, LinkKind, LinkSpec};
use crate::model::{SshConfig, TransportConfig};

use super::{ConnCtx, ConnectionDriver, ConnectionState, DriverError};

const BACKOFF_START_SECS: u64 = 1;
const BACKOFF_CAP_SECS: u64 = 60;
/// Uptime after which the backoff resets.
const STABLE_SECS: u64 = 60;

/// Everything needed to (re)establish one tunnel, detached from the
/// config model so the supervisor task owns its copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSpec {
    /// `<ni>-<conn>`, names the control socket and the task.
    pub name: String,
    pub ns: String,
    pub local_tunnel_id: u8,
    pub config: SshConfig,
    /// Local tunnel addresses, pushed to the far end with
    /// `remote_config`.
    pub addrs: Vec<IpNet>,
    pub socket_dir: PathBuf,
}

impl TunnelSpec {
    fn socket_path(&self) -> PathBuf {
        self.socket_dir.join(format!("{}.sock", self.name))
    }

    /// Shell fragment executed on the remote host after connecting.
    fn remote_command(&self) -> Option<String> {
        if !self.config.remote_config {
            return None;
        }
        let tun = format!("tun{}", self.config.remote_tunnel_id);
        let mut script = String::new();
        let _ = write!(script, "set -e; ");
        let _ = write!(script, "sysctl -w net.ipv4.conf.all.forwarding=1; ");
        let _ = write!(script, "sysctl -w net.ipv6.conf.all.forwarding=1; ");
        let _ = write!(script, "ip link set dev {tun} up; ");
        for addr in &self.addrs {
            let family = if addr.addr().is_ipv6() { "-6" } else { "-4" };
            let _ = write!(
                script,
                "ip {family} route replace {} dev {tun}; ",
                addr.trunc()
            );
        }
        let _ = write!(
            script,
            "iptables -C INPUT -i {tun} -j ACCEPT 2>/dev/null || iptables -A INPUT -i {tun} -j ACCEPT; "
        );
        let _ = write!(
            script,
            "ip6tables -C INPUT -i {tun} -j ACCEPT 2>/dev/null || ip6tables -A INPUT -i {tun} -j ACCEPT; "
        );
        if let Some(interface) = &self.config.remote_config_interface {
            let _ = write!(
                script,
                "iptables -t nat -C POSTROUTING -o {interface} -j MASQUERADE 2>/dev/null || \
                 iptables -t nat -A POSTROUTING -o {interface} -j MASQUERADE; "
            );
        }
        Some(script.trim_end().to_string())
    }
}

/// Supervision surface, mockable for tests.
#[async_trait]
pub trait SshControl: Send + Sync {
    /// Ensure a supervised tunnel matching `spec` runs; restarts the
    /// task when the spec changed.
    async fn ensure(&self, spec: TunnelSpec) -> Result<(), DriverError>;
    async fn stop(&self, name: &str);
    /// Master-connection liveness.
    async fn established(&self, name: &str) -> bool;
}

struct Supervised {
    spec: TunnelSpec,
    handle: tokio::task::JoinHandle<()>,
    alive: Arc<std::sync::atomic::AtomicBool>,
}

/// Supervises one task per tunnel.
#[derive(Default)]
pub struct SshSupervisor {
    tunnels: Mutex<HashMap<String, Supervised>>,
}

impl SshSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    async fn run_once(spec: &TunnelSpec) -> Result<(), String> {
        let socket = spec.socket_path().display().to_string();
        let forward = format!(
            "{}:{}",
            spec.local_tunnel_id, spec.config.remote_tunnel_id
        );
        let destination = format!("{}@{}", spec.config.username, spec.config.remote_addrs[0]);
        let mut cmd = Command::new("ip");
        cmd.args(["netns", "exec", &spec.ns, "ssh"])
            .args(["-o", "ControlMaster=yes"])
            .args(["-o", &format!("ControlPath={socket}")])
            .args(["-o", "Tunnel=point-to-point"])
            .args(["-o", "ExitOnForwardFailure=yes"])
            .args(["-o", "ServerAliveInterval=5"])
            .args(["-o", "ServerAliveCountMax=5"])
            .args(["-o", "StrictHostKeyChecking=accept-new"])
            .args(["-w", &forward]);
        match spec.remote_command() {
            // The provisioning script keeps the session open instead of -N.
            Some(remote) => {
                cmd.arg(&destination).arg(remote);
            }
            None => {
                cmd.arg("-N").arg(&destination);
            }
        }
        let status = cmd.status().await.map_err(|e| e.to_string())?;
        if status.success() {
            Ok(())
        } else {
            Err(format!("ssh exited with {status}"))
        }
    }

    fn spawn(spec: TunnelSpec, alive: Arc<std::sync::atomic::AtomicBool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut backoff = BACKOFF_START_SECS;
            loop {
                let started = tokio::time::Instant::now();
                alive.store(true, std::sync::atomic::Ordering::Relaxed);
                match Self::run_once(&spec).await {
                    Ok(()) => info!(tunnel = %spec.name, "ssh tunnel exited cleanly"),
                    Err(e) => warn!(tunnel = %spec.name, error = %e, "ssh tunnel died"),
                }
                alive.store(false, std::sync::atomic::Ordering::Relaxed);
                if started.elapsed() >= Duration::from_secs(STABLE_SECS) {
                    backoff = BACKOFF_START_SECS;
                }
                tokio::time::sleep(Duration::from_secs(backoff)).await;
                backoff = (backoff * 2).min(BACKOFF_CAP_SECS);
            }
        })
    }
}

#[async_trait]
impl SshControl for SshSupervisor {
    async fn ensure(&self, spec: TunnelSpec) -> Result<(), DriverError> {
        let mut tunnels = self.tunnels.lock().await;
        if let Some(existing) = tunnels.get(&spec.name) {
            if existing.spec == spec {
                return Ok(());
            }
            existing.handle.abort();
        }
        std::fs::create_dir_all(&spec.socket_dir)
            .map_err(|e| DriverError::Transient(e.to_string()))?;
        let alive = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let handle = Self::spawn(spec.clone(), Arc::clone(&alive));
        tunnels.insert(
            spec.name.clone(),
            Supervised {
                spec,
                handle,
                alive,
            },
        );
        Ok(())
    }

    async fn stop(&self, name: &str) {
        let mut tunnels = self.tunnels.lock().await;
        if let Some(supervised) = tunnels.remove(name) {
            info!(tunnel = %name, "stopping ssh tunnel");
            supervised.handle.abort();
        }
    }

    async fn established(&self, name: &str) -> bool {
        let tunnels = self.tunnels.lock().await;
        tunnels
            .get(name)
            .map(|s| s.alive.load(std::sync::atomic::Ordering::Relaxed))
            .unwrap_or(false)
    }
}

pub struct SshDriver {
    dp: Arc<dyn Dataplane>,
    ssh: Arc<dyn SshControl>,
}

impl SshDriver {
    pub fn new(dp: Arc<dyn Dataplane>, ssh: Arc<dyn SshControl>) -> Self {
        Self { dp, ssh }
    }

    fn tunnel_spec(ctx: &ConnCtx<'_>, config: &SshConfig) -> TunnelSpec {
        TunnelSpec {
            name: ctx.ike_name(),
            ns: ctx.ni.id.clone(),
            local_tunnel_id: ctx.conn.id,
            config: config.clone(),
            addrs: ctx.addrs.clone(),
            socket_dir: ctx.settings.ssh_socket_dir.clone(),
        }
    }
}

#[async_trait]
impl ConnectionDriver for SshDriver {
    async fn apply(&self, ctx: &ConnCtx<'_>) -> Result<ConnectionState, DriverError> {
        let TransportConfig::Ssh(config) = &ctx.conn.config else {
            return Err(DriverError::Fatal("not an SSH connection".to_string()));
        };
        let ifname = ctx.interface_name();
        let spec = LinkSpec {
            name: ifname.clone(),
            kind: LinkKind::Tun,
            parent_ns: None,
        };
        self.dp.link_ensure(&ctx.ni.id, &spec).await?;
        self.dp.addr_sync(&ctx.ni.id, &ifname, &ctx.addrs).await?;
        self.dp.link_up(&ctx.ni.id, &ifname).await?;
        self.ssh.ensure(Self::tunnel_spec(ctx, config)).await?;
        Ok(ConnectionState::Connecting)
    }

    async fn observe(&self, ctx: &ConnCtx<'_>) -> Result<ConnectionState, DriverError> {
        if !self.dp.link_exists(&ctx.ni.id, &ctx.interface_name()).await? {
            return Ok(ConnectionState::Idle);
        }
        if self.ssh.established(&ctx.ike_name()).await {
            Ok(ConnectionState::Active)
        } else {
            Ok(ConnectionState::Degraded)
        }
    }

    async fn teardown(&self, ctx: &ConnCtx<'_>) -> Result<(), DriverError> {
        info!(ni = %ctx.ni.id, conn = ctx.conn.id, "tearing down ssh tunnel");
        self.ssh.stop(&ctx.ike_name()).await;
        self.dp.link_delete(&ctx.ni.id, &ctx.interface_name()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::ssh_connection;

    fn spec(remote_config: bool, interface: Option<&str>) -> TunnelSpec {
        let conn = ssh_connection(0);
        let TransportConfig::Ssh(mut config) = conn.config else {
            unreachable!()
        };
        config.remote_config = remote_config;
        config.remote_config_interface = interface.map(|s| s.to_string());
        TunnelSpec {
            name: "C0001-00-0".to_string(),
            ns: "C0001-00".to_string(),
            local_tunnel_id: 0,
            config,
            addrs: vec!["100.99.0.1/28".parse().unwrap()],
            socket_dir: PathBuf::from("/run/vpnc/ssh"),
        }
    }

    #[test]
    fn remote_command_only_with_remote_config() {
        assert!(spec(false, None).remote_command().is_none());
        let script = spec(true, None).remote_command().unwrap();
        assert!(script.contains("ip link set dev tun9 up"));
        assert!(script.contains("route replace 100.99.0.0/28 dev tun9"));
        assert!(!script.contains("MASQUERADE"));
    }

    #[test]
    fn masquerade_added_for_remote_interface() {
        let script = spec(true, Some("eth0")).remote_command().unwrap();
        assert!(script.contains("POSTROUTING -o eth0 -j MASQUERADE"));
    }
}

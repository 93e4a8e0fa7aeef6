//! swanctl configuration rendering and control-binary driver.

use std::fmt::Write as _;
use std::path::PathBuf;
use std::process::Output;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::alloc::xfrm_if_id;
use crate::config::COMMAND_TIMEOUT_SECS;
use crate::model::{DownlinkInfo, Initiation, NetworkInstance, Service, TransportConfig};
use crate::store::write_atomic;

use super::monitor::{SaEvent, SaKey, SaRecord};
use super::{IkeControl, IkeError, SaInfo};

/// Render the swanctl connection blocks for one network instance.
///
/// Returns `None` when the instance has no IPsec connections, in which
/// case its config file must be removed.
pub fn render_config(
    service: &Service,
    ni: &NetworkInstance,
    info: Option<&DownlinkInfo>,
) -> Option<String> {
    let mut connections = String::new();
    let mut secrets = String::new();
    let mut count = 0;

    for conn in ni.connections.values() {
        let TransportConfig::Ipsec(ipsec) = &conn.config else {
            continue;
        };
        count += 1;
        let name = format!("{}-{}", ni.id, conn.id);
        let if_id = xfrm_if_id(info, conn.id);
        let local_id = ipsec.local_id.as_deref().unwrap_or(&service.local_id);
        let remote_id = ipsec
            .remote_id
            .clone()
            .unwrap_or_else(|| ipsec.remote_addrs[0].to_string());
        let remote_addrs = ipsec
            .remote_addrs
            .iter()
            .map(|a| a.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let (start_action, close_action) = match ipsec.initiation {
            Initiation::Start => ("start", "start"),
            Initiation::None => ("trap", "none"),
        };
        let (local_ts, remote_ts) = if ipsec.traffic_selectors.is_empty() {
            ("0.0.0.0/0,::/0".to_string(), "0.0.0.0/0,::/0".to_string())
        } else {
            (
                join_nets(&ipsec.traffic_selectors.local),
                join_nets(&ipsec.traffic_selectors.remote),
            )
        };

        let _ = write!(
            connections,
            r#"    {name} {{
        version = {version}
        local_addrs = %any
        remote_addrs = {remote_addrs}
        proposals = {ike_proposal}
        rekey_time = {ike_lifetime}s
        unique = replace
        if_id_in = {if_id:#x}
        if_id_out = {if_id:#x}
        local {{
            auth = psk
            id = {local_id}
        }}
        remote {{
            auth = psk
            id = {remote_id}
        }}
        children {{
            {name} {{
                esp_proposals = {ipsec_proposal}
                rekey_time = {ipsec_lifetime}s
                start_action = {start_action}
                close_action = {close_action}
                dpd_action = restart
                local_ts = {local_ts}
                remote_ts = {remote_ts}
            }}
        }}
    }}
"#,
            version = ipsec.ike_version,
            ike_proposal = ipsec.ike_proposal,
            ike_lifetime = ipsec.ike_lifetime,
            ipsec_proposal = ipsec.ipsec_proposal,
            ipsec_lifetime = ipsec.ipsec_lifetime,
        );

        let _ = write!(
            secrets,
            r#"    ike-{name} {{
        secret = "{psk}"
        id = {remote_id}
    }}
"#,
            psk = ipsec.psk,
        );
    }

    if count == 0 {
        return None;
    }
    Some(format!(
        "connections {{\n{connections}}}\nsecrets {{\n{secrets}}}\n"
    ))
}

fn join_nets(nets: &[ipnet::IpNet]) -> String {
    nets.iter()
        .map(|n| n.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Drives the IKE daemon through `swanctl` and its conf.d directory.
///
/// The control channel is serialized: the daemon misbehaves when loads
/// and terminates interleave.
pub struct SwanctlControl {
    conf_dir: PathBuf,
    lock: Mutex<()>,
}

impl SwanctlControl {
    pub fn new(conf_dir: PathBuf) -> Self {
        Self {
            conf_dir,
            lock: Mutex::new(()),
        }
    }

    fn conf_path(&self, ni_id: &str) -> PathBuf {
        self.conf_dir.join(format!("{ni_id}.conf"))
    }

    async fn swanctl(&self, args: &[&str]) -> Result<Output, IkeError> {
        let output = tokio::time::timeout(
            Duration::from_secs(COMMAND_TIMEOUT_SECS),
            Command::new("swanctl").args(args).output(),
        )
        .await
        .map_err(|_| IkeError::Unavailable("swanctl timed out".to_string()))??;
        if !output.status.success() {
            return Err(IkeError::Rejected(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(output)
    }

    /// Restrict the rendered secrets to the daemon user when present.
    fn chown_to_daemon(&self, path: &std::path::Path) {
        if let Ok(Some(user)) = nix::unistd::User::from_name("swan") {
            if let Err(e) = nix::unistd::chown(path, Some(user.uid), Some(user.gid)) {
                debug!(path = %path.display(), error = %e, "chown to IKE user failed");
            }
        }
    }

    /// Spawn the event stream task: `swanctl --monitor-sa --raw` lines
    /// parsed into [`SaEvent`]s. The sender applies backpressure; SA
    /// events are accumulated, never coalesced.
    pub fn spawn_events(self: &Arc<Self>, tx: mpsc::Sender<SaEvent>) -> tokio::task::JoinHandle<()> {
        let control = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match control.stream_events(&tx).await {
                    Ok(()) => break,
                    Err(e) => {
                        warn!(error = %e, "IKE event stream lost, reconnecting");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        })
    }

    async fn stream_events(&self, tx: &mpsc::Sender<SaEvent>) -> Result<(), IkeError> {
        use tokio::io::{AsyncBufReadExt, BufReader};

        let mut child = Command::new("swanctl")
            .args(["--monitor-sa", "--raw"])
            .stdout(std::process::Stdio::piped())
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| IkeError::Unavailable("no stdout from swanctl".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();
        info!("subscribed to IKE SA events");
        while let Some(line) = lines.next_line().await? {
            for event in parse_event_line(&line) {
                if tx.send(event).await.is_err() {
                    // Receiver gone: shutting down.
                    let _ = child.kill().await;
                    return Ok(());
                }
            }
        }
        Err(IkeError::Unavailable("event stream closed".to_string()))
    }
}

#[async_trait]
impl IkeControl for SwanctlControl {
    async fn write_config(&self, ni_id: &str, rendered: Option<String>) -> Result<(), IkeError> {
        let _guard = self.lock.lock().await;
        let path = self.conf_path(ni_id);
        match rendered {
            Some(contents) => {
                if std::fs::read_to_string(&path).ok().as_deref() == Some(contents.as_str()) {
                    return Ok(());
                }
                write_atomic(&path, contents.as_bytes())
                    .map_err(|e| IkeError::Unavailable(e.to_string()))?;
                self.chown_to_daemon(&path);
            }
            None => {
                if !path.exists() {
                    return Ok(());
                }
                std::fs::remove_file(&path)?;
            }
        }
        self.swanctl(&["--load-all", "--clear"]).await?;
        Ok(())
    }

    async fn initiate(&self, ike_name: &str) -> Result<(), IkeError> {
        let _guard = self.lock.lock().await;
        self.swanctl(&["--initiate", "--ike", ike_name]).await?;
        Ok(())
    }

    async fn terminate_ike(&self, ike_name: &str) -> Result<(), IkeError> {
        let _guard = self.lock.lock().await;
        self.swanctl(&["--terminate", "--ike", ike_name]).await?;
        Ok(())
    }

    async fn terminate_sa(&self, unique_id: &str) -> Result<(), IkeError> {
        let _guard = self.lock.lock().await;
        self.swanctl(&["--terminate", "--ike-id", unique_id]).await?;
        Ok(())
    }

    async fn list_sas(&self, ike_name: Option<&str>) -> Result<Vec<SaInfo>, IkeError> {
        let _guard = self.lock.lock().await;
        let output = match ike_name {
            Some(name) => self.swanctl(&["--list-sas", "--raw", "--ike", name]).await?,
            None => self.swanctl(&["--list-sas", "--raw"]).await?,
        };
        Ok(parse_raw_sas(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Parse the `--raw` key=value brace format of swanctl listings.
///
/// Example line:
/// `list-sa event {C0001-00-0={uniqueid=7 state=ESTABLISHED local-id=%any
/// remote-id=203.0.113.10 remote-host=203.0.113.10 established=42
/// if-id-in=c0001000 ...}}`
pub fn parse_raw_sas(raw: &str) -> Vec<SaInfo> {
    let mut out = Vec::new();
    for line in raw.lines() {
        let Some(start) = line.find('{') else { continue };
        let body = &line[start + 1..line.rfind('}').unwrap_or(line.len())];
        let Some((name, fields_raw)) = body.split_once("={") else {
            continue;
        };
        let fields = parse_fields(fields_raw);
        let established_secs: i64 = fields
            .get("established")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        out.push(SaInfo {
            name: name.trim().to_string(),
            unique_id: fields.get("uniqueid").cloned().unwrap_or_default(),
            local_id: fields.get("local-id").cloned().unwrap_or_default(),
            remote_id: fields.get("remote-id").cloned().unwrap_or_default(),
            if_id: fields
                .get("if-id-in")
                .and_then(|v| u32::from_str_radix(v, 16).ok())
                .unwrap_or(0),
            state: fields.get("state").cloned().unwrap_or_default(),
            remote_host: fields.get("remote-host").and_then(|v| v.parse().ok()),
            established: Utc::now() - chrono::Duration::seconds(established_secs),
        });
    }
    out
}

/// Flat key=value extraction; nested braces only contribute their own
/// key=value pairs, which is sufficient for the fields used here.
fn parse_fields(raw: &str) -> std::collections::HashMap<String, String> {
    let mut fields = std::collections::HashMap::new();
    for token in raw.split_whitespace() {
        let token = token.trim_matches(|c| c == '{' || c == '}');
        if let Some((key, value)) = token.split_once('=') {
            if !key.is_empty() && !value.is_empty() && !value.contains('{') {
                fields.entry(key.to_string()).or_insert(value.to_string());
            }
        }
    }
    fields
}

/// Parse one monitor-sa line into zero or more events.
pub fn parse_event_line(line: &str) -> Vec<SaEvent> {
    let rekey = line.starts_with("child-rekey");
    let down = line.contains("state=DELETING") || line.contains("state=DESTROYING");
    parse_raw_sas(line)
        .into_iter()
        .map(|sa| {
            let key = SaKey {
                local_id: sa.local_id,
                remote_id: sa.remote_id,
                if_id: sa.if_id,
            };
            if rekey {
                SaEvent::Rekey { key }
            } else if down {
                SaEvent::SaDown {
                    key,
                    unique_id: sa.unique_id,
                }
            } else {
                SaEvent::SaUp {
                    key,
                    sa: SaRecord {
                        unique_id: sa.unique_id,
                        established: sa.established,
                    },
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DownlinkInfo;
    use crate::test_util::{hub_service, ipsec_connection, tenant_with};

    #[test]
    fn renders_connection_block_with_if_id() {
        let service = hub_service();
        let tenant = tenant_with(0, vec![ipsec_connection(0)]);
        let ni = &tenant.network_instances["C0001-00"];
        let info = DownlinkInfo::parse("C0001-00").unwrap();
        let rendered = render_config(&service, ni, Some(&info)).unwrap();

        assert!(rendered.contains("C0001-00-0 {"));
        assert!(rendered.contains("if_id_in = 0xc0001000"));
        assert!(rendered.contains("start_action = start"));
        assert!(rendered.contains("close_action = start"));
        assert!(rendered.contains("remote_addrs = 203.0.113.10"));
        assert!(rendered.contains("secret = \"fixture-psk\""));
        // Route-based connections carry wide traffic selectors.
        assert!(rendered.contains("local_ts = 0.0.0.0/0,::/0"));
    }

    #[test]
    fn responder_connections_use_trap() {
        let service = hub_service();
        let mut conn = ipsec_connection(0);
        if let crate::model::TransportConfig::Ipsec(ipsec) = &mut conn.config {
            ipsec.initiation = crate::model::Initiation::None;
        }
        let tenant = tenant_with(0, vec![conn]);
        let ni = &tenant.network_instances["C0001-00"];
        let info = DownlinkInfo::parse("C0001-00").unwrap();
        let rendered = render_config(&service, ni, Some(&info)).unwrap();
        assert!(rendered.contains("start_action = trap"));
        assert!(rendered.contains("close_action = none"));
    }

    #[test]
    fn instance_without_ipsec_renders_nothing() {
        let service = hub_service();
        let tenant = tenant_with(0, vec![crate::test_util::wireguard_connection(0)]);
        let ni = &tenant.network_instances["C0001-00"];
        let info = DownlinkInfo::parse("C0001-00").unwrap();
        assert!(render_config(&service, ni, Some(&info)).is_none());
    }

    #[test]
    fn parses_raw_sa_listing() {
        let raw = "list-sa event {C0001-00-0={uniqueid=7 state=ESTABLISHED \
                   local-id=%any remote-id=203.0.113.10 remote-host=203.0.113.10 \
                   established=42 if-id-in=c0001000}}";
        let sas = parse_raw_sas(raw);
        assert_eq!(sas.len(), 1);
        assert_eq!(sas[0].name, "C0001-00-0");
        assert_eq!(sas[0].unique_id, "7");
        assert_eq!(sas[0].state, "ESTABLISHED");
        assert_eq!(sas[0].if_id, 0xC0001000);
        assert_eq!(sas[0].remote_host, Some("203.0.113.10".parse().unwrap()));
    }

    #[test]
    fn event_lines_classify() {
        let up = "ike-updown {C0001-00-0={uniqueid=7 state=ESTABLISHED \
                  local-id=%any remote-id=peer if-id-in=c0001000 established=1}}";
        assert!(matches!(parse_event_line(up)[0], SaEvent::SaUp { .. }));

        let rekey = "child-rekey {C0001-00-0={uniqueid=7 state=ESTABLISHED \
                     local-id=%any remote-id=peer if-id-in=c0001000 established=1}}";
        assert!(matches!(parse_event_line(rekey)[0], SaEvent::Rekey { .. }));

        let down = "ike-updown {C0001-00-0={uniqueid=7 state=DELETING \
                    local-id=%any remote-id=peer if-id-in=c0001000 established=1}}";
        assert!(matches!(parse_event_line(down)[0], SaEvent::SaDown { .. }));
    }
}

//! Routing-daemon driver.
//!
//! Renders the BGP configuration for the core uplinks, writes it
//! atomically and asks the daemon to reload itself; the daemon is never
//! restarted from here. Neighbor state is polled over vtysh and
//! republished for the status endpoint.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::time::Duration;

use ipnet::Ipv6Net;
use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::{COMMAND_TIMEOUT_SECS, CORE_NI};
use crate::error::{Error, Result};
use crate::model::Service;
use crate::store::write_atomic;

/// Management-side prefix accepted from uplink peers.
const MGMT_PREFIX: &str = "fd00::/16";

/// Prefix sets feeding the uplink filter lists.
#[derive(Debug, Clone, Default)]
pub struct UplinkPrefixes {
    /// NAT64 /96s currently allocated.
    pub nat64: Vec<Ipv6Net>,
    /// NPTv6 prefixes currently mapped.
    pub nptv6: Vec<Ipv6Net>,
    /// Prefixes currently blackholed because their connection is not
    /// ACTIVE; they are advertised with an extra path penalty.
    pub penalized: Vec<Ipv6Net>,
}

/// Render the complete routing-daemon configuration.
///
/// Returns `None` when the service carries no BGP settings (endpoint
/// mode), in which case the daemon keeps its empty default config.
pub fn render(service: &Service, prefixes: &UplinkPrefixes) -> Option<String> {
    let bgp = service.bgp.as_ref()?;
    let mut out = String::new();
    let asn = bgp.globals.asn;

    let _ = writeln!(out, "frr defaults traditional");
    let _ = writeln!(out, "hostname vpnc");
    let _ = writeln!(out, "!");
    let _ = writeln!(out, "router bgp {asn} vrf {CORE_NI}");
    let _ = writeln!(out, " bgp router-id {}", bgp.globals.router_id);
    let _ = writeln!(out, " no bgp ebgp-requires-policy");
    let _ = writeln!(out, " neighbor UPLINK peer-group");
    let _ = writeln!(out, " neighbor UPLINK timers 10 30");
    let _ = writeln!(out, " neighbor UPLINK advertisement-interval 0");
    if bgp.globals.bfd {
        let _ = writeln!(out, " neighbor UPLINK bfd");
    }
    for neighbor in &bgp.neighbors {
        let _ = writeln!(
            out,
            " neighbor {} peer-group UPLINK",
            neighbor.neighbor_address
        );
        let _ = writeln!(
            out,
            " neighbor {} remote-as {}",
            neighbor.neighbor_address, neighbor.neighbor_asn
        );
    }
    let _ = writeln!(out, " address-family ipv6 unicast");
    let _ = writeln!(out, "  redistribute kernel");
    for neighbor in &bgp.neighbors {
        let _ = writeln!(
            out,
            "  neighbor {} activate",
            neighbor.neighbor_address
        );
        let _ = writeln!(
            out,
            "  neighbor {} route-map UPLINK-IN-{} in",
            neighbor.neighbor_address, neighbor.priority
        );
        let _ = writeln!(
            out,
            "  neighbor {} route-map UPLINK-OUT-{} out",
            neighbor.neighbor_address, neighbor.priority
        );
    }
    let _ = writeln!(out, " exit-address-family");
    let _ = writeln!(out, "!");

    // Inbound: management prefixes long enough to identify peers.
    let _ = writeln!(
        out,
        "ipv6 prefix-list UPLINK-PL-IN seq 10 permit {MGMT_PREFIX} ge 32"
    );

    // Outbound: global unicast plus the translation prefixes.
    let mut seq = 10;
    let _ = writeln!(
        out,
        "ipv6 prefix-list UPLINK-PL-OUT seq {seq} permit 2000::/3 ge 32"
    );
    for prefix in prefixes.nat64.iter().chain(prefixes.nptv6.iter()) {
        seq += 10;
        let _ = writeln!(out, "ipv6 prefix-list UPLINK-PL-OUT seq {seq} permit {prefix}");
    }

    if prefixes.penalized.is_empty() {
        // An empty prefix-list would match everything; an impossible
        // entry keeps the penalty route-map entry inert.
        let _ = writeln!(
            out,
            "ipv6 prefix-list UPLINK-PL-PENALTY seq 10 deny ::/0 le 128"
        );
    } else {
        let mut seq = 10;
        for prefix in &prefixes.penalized {
            let _ = writeln!(
                out,
                "ipv6 prefix-list UPLINK-PL-PENALTY seq {seq} permit {prefix}"
            );
            seq += 10;
        }
    }
    let _ = writeln!(out, "!");

    // One route-map pair per configured priority. Inbound preference
    // drops by 10 per priority step; outbound paths are prepended
    // `priority` times, plus 10 more while the prefix is blackholed.
    let priorities: BTreeSet<u8> = bgp.neighbors.iter().map(|n| n.priority).collect();
    for priority in priorities {
        let local_pref = 100 - 10 * u32::from(priority);
        let _ = writeln!(out, "route-map UPLINK-IN-{priority} permit 10");
        let _ = writeln!(out, " match ipv6 address prefix-list UPLINK-PL-IN");
        let _ = writeln!(out, " set local-preference {local_pref}");
        let _ = writeln!(out, "!");

        let _ = writeln!(out, "route-map UPLINK-OUT-{priority} permit 5");
        let _ = writeln!(out, " match ipv6 address prefix-list UPLINK-PL-PENALTY");
        if let Some(prepend) = prepend_str(asn, u32::from(priority) + 10) {
            let _ = writeln!(out, " set as-path prepend {prepend}");
        }
        let _ = writeln!(out, "!");
        let _ = writeln!(out, "route-map UPLINK-OUT-{priority} permit 10");
        let _ = writeln!(out, " match ipv6 address prefix-list UPLINK-PL-OUT");
        if let Some(prepend) = prepend_str(asn, u32::from(priority)) {
            let _ = writeln!(out, " set as-path prepend {prepend}");
        }
        let _ = writeln!(out, "!");
    }

    Some(out)
}

fn prepend_str(asn: u32, count: u32) -> Option<String> {
    if count == 0 {
        return None;
    }
    Some(
        std::iter::repeat(asn.to_string())
            .take(count as usize)
            .collect::<Vec<_>>()
            .join(" "),
    )
}

/// Live state of one uplink session.
#[derive(Debug, Clone, Serialize)]
pub struct NeighborState {
    pub address: String,
    pub asn: u32,
    pub state: String,
    pub uptime: String,
    pub prefixes_received: u64,
}

/// Writes the rendered config and drives reloads.
pub struct FrrDriver {
    config_path: PathBuf,
    reload: bool,
}

impl FrrDriver {
    pub fn new(config_path: PathBuf) -> Self {
        Self {
            config_path,
            reload: true,
        }
    }

    /// Disable the reload exec (tests render into a tempdir).
    pub fn without_reload(mut self) -> Self {
        self.reload = false;
        self
    }

    /// Write the config if it changed; returns whether a reload ran.
    pub async fn apply(&self, rendered: &str) -> Result<bool> {
        let current = std::fs::read_to_string(&self.config_path).unwrap_or_default();
        if current == rendered {
            return Ok(false);
        }
        write_atomic(&self.config_path, rendered.as_bytes())?;
        info!(path = %self.config_path.display(), "routing configuration updated");
        if self.reload {
            self.reload().await?;
        }
        Ok(true)
    }

    async fn reload(&self) -> Result<()> {
        let path = self.config_path.display().to_string();
        let output = tokio::time::timeout(
            Duration::from_secs(COMMAND_TIMEOUT_SECS),
            Command::new("/usr/lib/frr/frr-reload.py")
                .args(["--reload", "--stdout", &path])
                .output(),
        )
        .await
        .map_err(|_| Error::DriverTransient("routing reload timed out".to_string()))??;
        if !output.status.success() {
            return Err(Error::DriverTransient(format!(
                "routing reload failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        debug!("routing daemon reloaded");
        Ok(())
    }

    /// Poll the daemon for uplink session state.
    pub async fn neighbor_summary(&self) -> Result<Vec<NeighborState>> {
        let output = tokio::time::timeout(
            Duration::from_secs(COMMAND_TIMEOUT_SECS),
            Command::new("vtysh")
                .args(["-c", &format!("show bgp vrf {CORE_NI} summary json")])
                .output(),
        )
        .await
        .map_err(|_| Error::DriverTransient("vtysh timed out".to_string()))??;
        if !output.status.success() {
            warn!(
                error = %String::from_utf8_lossy(&output.stderr).trim(),
                "neighbor summary unavailable"
            );
            return Ok(Vec::new());
        }
        let value: serde_json::Value =
            serde_json::from_slice(&output.stdout).unwrap_or(serde_json::Value::Null);
        Ok(parse_neighbor_summary(&value))
    }
}

/// Extract per-peer session state from the vtysh JSON document.
pub fn parse_neighbor_summary(value: &serde_json::Value) -> Vec<NeighborState> {
    let mut out = Vec::new();
    let peers = value
        .get("ipv6Unicast")
        .and_then(|v| v.get("peers"))
        .and_then(|v| v.as_object());
    let Some(peers) = peers else {
        return out;
    };
    for (address, peer) in peers {
        out.push(NeighborState {
            address: address.clone(),
            asn: peer.get("remoteAs").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
            state: peer
                .get("state")
                .and_then(|v| v.as_str())
                .unwrap_or("Unknown")
                .to_string(),
            uptime: peer
                .get("peerUptime")
                .and_then(|v| v.as_str())
                .unwrap_or("never")
                .to_string(),
            prefixes_received: peer.get("pfxRcd").and_then(|v| v.as_u64()).unwrap_or(0),
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::hub_service;

    #[test]
    fn route_maps_follow_priority() {
        let service = hub_service();
        let rendered = render(&service, &UplinkPrefixes::default()).unwrap();

        // Priority 0: local-preference 100, no prepend on the regular entry.
        assert!(rendered.contains("route-map UPLINK-IN-0 permit 10"));
        assert!(rendered.contains(" set local-preference 100"));
        // Priority 1: local-preference 90, one prepend.
        assert!(rendered.contains("route-map UPLINK-IN-1 permit 10"));
        assert!(rendered.contains(" set local-preference 90"));
        assert!(rendered.contains(" set as-path prepend 4200000000\n"));

        // Penalty entries prepend 10 and 11 times.
        let penalty_10 = prepend_str(4_200_000_000, 10).unwrap();
        let penalty_11 = prepend_str(4_200_000_000, 11).unwrap();
        assert!(rendered.contains(&penalty_10));
        assert!(rendered.contains(&penalty_11));
    }

    #[test]
    fn prefix_lists_carry_translation_prefixes() {
        let service = hub_service();
        let prefixes = UplinkPrefixes {
            nat64: vec!["fdcc:0:c:1::/96".parse().unwrap()],
            nptv6: vec!["fdcc:1::/48".parse().unwrap()],
            penalized: vec!["fdcc:1::/48".parse().unwrap()],
        };
        let rendered = render(&service, &prefixes).unwrap();
        assert!(rendered.contains("permit 2000::/3 ge 32"));
        assert!(rendered.contains("UPLINK-PL-OUT seq 20 permit fdcc:0:c:1::/96"));
        assert!(rendered.contains("UPLINK-PL-OUT seq 30 permit fdcc:1::/48"));
        assert!(rendered.contains("UPLINK-PL-PENALTY seq 10 permit fdcc:1::/48"));
    }

    #[test]
    fn uplink_peer_group_settings() {
        let service = hub_service();
        let rendered = render(&service, &UplinkPrefixes::default()).unwrap();
        assert!(rendered.contains("neighbor UPLINK timers 10 30"));
        assert!(rendered.contains("neighbor UPLINK advertisement-interval 0"));
        // bfd disabled in the fixture
        assert!(!rendered.contains("neighbor UPLINK bfd"));
        assert!(rendered.contains("neighbor fd00:10::1 remote-as 4200000001"));
    }

    #[test]
    fn parses_vtysh_summary() {
        let json: serde_json::Value = serde_json::from_str(
            r#"{"ipv6Unicast":{"peers":{"fd00:10::1":{
                "remoteAs":4200000001,"state":"Established",
                "peerUptime":"01:02:03","pfxRcd":12}}}}"#,
        )
        .unwrap();
        let states = parse_neighbor_summary(&json);
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].address, "fd00:10::1");
        assert_eq!(states[0].state, "Established");
        assert_eq!(states[0].prefixes_received, 12);
    }

    #[test]
    fn endpoint_mode_renders_nothing() {
        let mut service = hub_service();
        service.bgp = None;
        assert!(render(&service, &UplinkPrefixes::default()).is_none());
    }
}

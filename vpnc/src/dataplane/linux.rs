//! Linux implementation of the dataplane primitives.
//!
//! Namespace lifecycle and physical-link moves go through rtnetlink;
//! everything scoped to a named namespace is driven through `ip -n`,
//! `jool` and `ip6tables` with JSON output where available, the same
//! check-then-apply pattern the kernel tools expect for idempotence.

use std::net::IpAddr;
use std::path::Path;
use std::process::Output;
use std::time::Duration;

use async_trait::async_trait;
use ipnet::{IpNet, Ipv6Net};
use rtnetlink::Handle;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::COMMAND_TIMEOUT_SECS;

use super::{Applied, Dataplane, DataplaneError, DpResult, LinkKind, LinkSpec, RouteSpec};

const NETNS_DIR: &str = "/var/run/netns";

/// EBUSY/EEXIST class failures are retried this many times, spaced
/// 100ms apart, before surfacing as [`DataplaneError::Busy`].
const BUSY_ATTEMPTS: u32 = 3;
const BUSY_BACKOFF: Duration = Duration::from_millis(100);

/// Dataplane backed by the running kernel.
pub struct LinuxDataplane {
    handle: Handle,
}

impl LinuxDataplane {
    /// Open the rtnetlink connection for the default namespace.
    pub fn new() -> DpResult<Self> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(connection);
        Ok(Self { handle })
    }

    /// Find a link index in the default namespace.
    async fn default_ns_link(&self, name: &str) -> DpResult<Option<u32>> {
        use futures::TryStreamExt;
        let mut links = self.handle.link().get().match_name(name.to_string()).execute();
        match links.try_next().await {
            Ok(Some(msg)) => Ok(Some(msg.header.index)),
            Ok(None) => Ok(None),
            // rtnetlink reports a missing name as an error
            Err(_) => Ok(None),
        }
    }
}

async fn run(program: &str, args: &[&str]) -> DpResult<Output> {
    let rendered = format!("{program} {}", args.join(" "));
    debug!(command = %rendered, "running");
    let output = tokio::time::timeout(
        Duration::from_secs(COMMAND_TIMEOUT_SECS),
        Command::new(program).args(args).output(),
    )
    .await
    .map_err(|_| DataplaneError::Command {
        command: rendered.clone(),
        stderr: "timed out".to_string(),
    })??;
    Ok(output)
}

async fn run_ok(program: &str, args: &[&str]) -> DpResult<Output> {
    let mut last = None;
    for attempt in 0..BUSY_ATTEMPTS {
        let output = run(program, args).await?;
        if output.status.success() {
            return Ok(output);
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.contains("File exists") || stderr.contains("Device or resource busy") {
            debug!(attempt, %stderr, "kernel busy, retrying");
            last = Some(DataplaneError::Busy(stderr));
            tokio::time::sleep(BUSY_BACKOFF).await;
            continue;
        }
        let command = format!("{program} {}", args.join(" "));
        return Err(DataplaneError::Command { command, stderr });
    }
    Err(last.unwrap_or_else(|| DataplaneError::Busy("retries exhausted".to_string())))
}

fn json_output(output: &Output) -> serde_json::Value {
    serde_json::from_slice(&output.stdout).unwrap_or(serde_json::Value::Null)
}

#[async_trait]
impl Dataplane for LinuxDataplane {
    async fn ns_list(&self) -> DpResult<Vec<String>> {
        let mut names = Vec::new();
        let dir = Path::new(NETNS_DIR);
        if !dir.exists() {
            return Ok(names);
        }
        for entry in std::fs::read_dir(dir)? {
            if let Some(name) = entry?.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn ns_ensure(&self, name: &str) -> DpResult<Applied> {
        if Path::new(NETNS_DIR).join(name).exists() {
            return Ok(Applied::Unchanged);
        }
        rtnetlink::NetworkNamespace::add(name.to_string())
            .await
            .map_err(|e| DataplaneError::Netlink(e.to_string()))?;
        Ok(Applied::Created)
    }

    async fn ns_delete(&self, name: &str) -> DpResult<()> {
        if !Path::new(NETNS_DIR).join(name).exists() {
            return Ok(());
        }
        rtnetlink::NetworkNamespace::del(name.to_string())
            .await
            .map_err(|e| DataplaneError::Netlink(e.to_string()))
    }

    async fn forwarding_enable(&self, ns: &str) -> DpResult<Applied> {
        let mut applied = Applied::Unchanged;
        for key in ["net.ipv4.conf.all.forwarding", "net.ipv6.conf.all.forwarding"] {
            let current = run_ok("ip", &["netns", "exec", ns, "sysctl", "-n", key]).await?;
            if String::from_utf8_lossy(&current.stdout).trim() != "1" {
                run_ok(
                    "ip",
                    &["netns", "exec", ns, "sysctl", "-w", &format!("{key}=1")],
                )
                .await?;
                applied = Applied::Changed;
            }
        }
        Ok(applied)
    }

    async fn link_ensure(&self, ns: &str, spec: &LinkSpec) -> DpResult<Applied> {
        if self.link_exists(ns, &spec.name).await? {
            return Ok(Applied::Unchanged);
        }

        // Virtual tunnel devices are created in their parent namespace
        // and then moved, so the encrypted side keeps its sockets there.
        let birth_ns = spec.parent_ns.as_deref().unwrap_or(ns);
        match &spec.kind {
            LinkKind::Xfrm { if_id } => {
                let if_id = if_id.to_string();
                run_ok(
                    "ip",
                    &[
                        "-n", birth_ns, "link", "add", &spec.name, "type", "xfrm", "if_id", &if_id,
                    ],
                )
                .await?;
            }
            LinkKind::Wireguard => {
                run_ok(
                    "ip",
                    &["-n", birth_ns, "link", "add", &spec.name, "type", "wireguard"],
                )
                .await?;
            }
            LinkKind::Veth { peer, peer_ns } => {
                run_ok(
                    "ip",
                    &[
                        "-n", birth_ns, "link", "add", &spec.name, "type", "veth", "peer", "name",
                        peer, "netns", peer_ns,
                    ],
                )
                .await?;
            }
            LinkKind::Tun => {
                run_ok(
                    "ip",
                    &[
                        "-n", birth_ns, "tuntap", "add", "dev", &spec.name, "mode", "tun",
                    ],
                )
                .await?;
            }
        }
        if birth_ns != ns {
            run_ok(
                "ip",
                &["-n", birth_ns, "link", "set", "dev", &spec.name, "netns", ns],
            )
            .await?;
        }
        Ok(Applied::Created)
    }

    async fn link_up(&self, ns: &str, name: &str) -> DpResult<Applied> {
        if self.link_is_up(ns, name).await? {
            return Ok(Applied::Unchanged);
        }
        run_ok("ip", &["-n", ns, "link", "set", "dev", name, "up"]).await?;
        Ok(Applied::Changed)
    }

    async fn link_delete(&self, ns: &str, name: &str) -> DpResult<()> {
        if !self.link_exists(ns, name).await? {
            return Ok(());
        }
        run_ok("ip", &["-n", ns, "link", "del", "dev", name]).await?;
        Ok(())
    }

    async fn link_exists(&self, ns: &str, name: &str) -> DpResult<bool> {
        let output = run("ip", &["-n", ns, "link", "show", "dev", name]).await?;
        Ok(output.status.success())
    }

    async fn link_is_up(&self, ns: &str, name: &str) -> DpResult<bool> {
        let output = run(
            "ip",
            &["--json", "-n", ns, "link", "show", "dev", name],
        )
        .await?;
        if !output.status.success() {
            return Ok(false);
        }
        let value = json_output(&output);
        Ok(value
            .get(0)
            .and_then(|l| l.get("operstate"))
            .and_then(|s| s.as_str())
            .map(|s| s == "UP" || s == "UNKNOWN")
            .unwrap_or(false))
    }

    async fn links(&self, ns: &str) -> DpResult<Vec<String>> {
        let output = run_ok("ip", &["--json", "-n", ns, "link", "show"]).await?;
        let value = json_output(&output);
        let mut names = Vec::new();
        if let Some(list) = value.as_array() {
            for link in list {
                if let Some(name) = link.get("ifname").and_then(|n| n.as_str()) {
                    if name != "lo" {
                        names.push(name.split('@').next().unwrap_or(name).to_string());
                    }
                }
            }
        }
        Ok(names)
    }

    async fn link_adopt(&self, ns: &str, name: &str) -> DpResult<Applied> {
        if self.link_exists(ns, name).await? {
            return Ok(Applied::Unchanged);
        }
        let index = self
            .default_ns_link(name)
            .await?
            .ok_or_else(|| DataplaneError::NotFound {
                object: format!("link {name}"),
            })?;
        let ns_file = std::fs::File::open(Path::new(NETNS_DIR).join(ns))?;
        let fd = std::os::fd::AsRawFd::as_raw_fd(&ns_file);
        let mut last = None;
        for attempt in 0..BUSY_ATTEMPTS {
            let result = self
                .handle
                .link()
                .set(index)
                .setns_by_fd(fd)
                .execute()
                .await;
            match result {
                Ok(()) => return Ok(Applied::Changed),
                Err(e) => {
                    let msg = e.to_string();
                    if msg.contains("EBUSY") {
                        debug!(attempt, link = name, "link move busy, retrying");
                        last = Some(DataplaneError::Busy(msg));
                        tokio::time::sleep(BUSY_BACKOFF).await;
                        continue;
                    }
                    return Err(DataplaneError::Netlink(msg));
                }
            }
        }
        Err(last.unwrap_or_else(|| DataplaneError::Busy("retries exhausted".to_string())))
    }

    async fn link_release(&self, ns: &str, name: &str) -> DpResult<()> {
        if !self.link_exists(ns, name).await? {
            return Ok(());
        }
        run_ok("ip", &["-n", ns, "link", "set", "dev", name, "netns", "1"]).await?;
        Ok(())
    }

    async fn addr_sync(&self, ns: &str, link: &str, addrs: &[IpNet]) -> DpResult<Applied> {
        let current = self.addrs(ns, link).await?;
        let mut applied = Applied::Unchanged;
        for addr in &current {
            if !addrs.contains(addr) {
                run_ok(
                    "ip",
                    &["-n", ns, "addr", "del", &addr.to_string(), "dev", link],
                )
                .await?;
                applied = Applied::Changed;
            }
        }
        for addr in addrs {
            if !current.contains(addr) {
                run_ok(
                    "ip",
                    &["-n", ns, "addr", "replace", &addr.to_string(), "dev", link],
                )
                .await?;
                applied = Applied::Changed;
            }
        }
        Ok(applied)
    }

    async fn addr_ensure(&self, ns: &str, link: &str, addr: &IpNet) -> DpResult<Applied> {
        let output = run(
            "ip",
            &["--json", "-n", ns, "addr", "show", "dev", link],
        )
        .await?;
        if output.status.success() {
            let value = json_output(&output);
            if let Some(addr_info) = value
                .get(0)
                .and_then(|l| l.get("addr_info"))
                .and_then(|a| a.as_array())
            {
                let present = addr_info.iter().any(|info| {
                    info.get("local").and_then(|l| l.as_str())
                        == Some(addr.addr().to_string().as_str())
                        && info.get("prefixlen").and_then(|p| p.as_u64())
                            == Some(u64::from(addr.prefix_len()))
                });
                if present {
                    return Ok(Applied::Unchanged);
                }
            }
        }
        run_ok(
            "ip",
            &["-n", ns, "addr", "replace", &addr.to_string(), "dev", link],
        )
        .await?;
        Ok(Applied::Changed)
    }

    async fn addrs(&self, ns: &str, link: &str) -> DpResult<Vec<IpNet>> {
        let output = run(
            "ip",
            &["--json", "-n", ns, "addr", "show", "dev", link],
        )
        .await?;
        if !output.status.success() {
            return Ok(Vec::new());
        }
        let value = json_output(&output);
        let mut out = Vec::new();
        if let Some(addr_info) = value
            .get(0)
            .and_then(|l| l.get("addr_info"))
            .and_then(|a| a.as_array())
        {
            for info in addr_info {
                if info.get("scope").and_then(|s| s.as_str()) != Some("global") {
                    continue;
                }
                let local = info.get("local").and_then(|l| l.as_str());
                let plen = info.get("prefixlen").and_then(|p| p.as_u64());
                if let (Some(local), Some(plen)) = (local, plen) {
                    if let Ok(addr) = local.parse::<IpAddr>() {
                        if let Ok(net) = IpNet::new(addr, plen as u8) {
                            out.push(net);
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    async fn route_ensure(&self, ns: &str, route: &RouteSpec) -> DpResult<Applied> {
        let existing = self.routes(ns).await?;
        if existing.iter().any(|r| r == route) {
            return Ok(Applied::Unchanged);
        }
        let family = if route.dst.addr().is_ipv6() { "-6" } else { "-4" };
        let dst = route.dst.to_string();
        let mut args: Vec<&str> = vec!["-n", ns, family, "route", "replace"];
        if route.blackhole {
            args.push("blackhole");
            args.push(&dst);
        } else {
            args.push(&dst);
        }
        let via = route.via.map(|v| v.to_string());
        if let Some(via) = &via {
            args.push("via");
            args.push(via);
        }
        if let Some(device) = &route.device {
            args.push("dev");
            args.push(device);
        }
        run_ok("ip", &args).await?;
        let created = !existing.iter().any(|r| r.dst == route.dst);
        Ok(if created { Applied::Created } else { Applied::Changed })
    }

    async fn route_delete(&self, ns: &str, dst: &IpNet) -> DpResult<()> {
        let family = if dst.addr().is_ipv6() { "-6" } else { "-4" };
        let output = run(
            "ip",
            &["-n", ns, family, "route", "del", &dst.to_string()],
        )
        .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.contains("No such process") {
                warn!(ns, %dst, error = %stderr.trim(), "route delete failed");
            }
        }
        Ok(())
    }

    async fn routes(&self, ns: &str) -> DpResult<Vec<RouteSpec>> {
        let mut out = Vec::new();
        for family in ["-4", "-6"] {
            let output = run("ip", &["--json", "-n", ns, family, "route", "show"]).await?;
            if !output.status.success() {
                continue;
            }
            let value = json_output(&output);
            if let Some(list) = value.as_array() {
                for entry in list {
                    // Connected and RA routes belong to the kernel, not
                    // to the reconciler; hide them so syncs and prunes
                    // only ever see daemon-installed routes.
                    if matches!(
                        entry.get("protocol").and_then(|p| p.as_str()),
                        Some("kernel") | Some("ra")
                    ) {
                        continue;
                    }
                    let dst = match entry.get("dst").and_then(|d| d.as_str()) {
                        Some("default") if family == "-4" => "0.0.0.0/0".to_string(),
                        Some("default") => "::/0".to_string(),
                        Some(d) if d.contains('/') => d.to_string(),
                        Some(d) if family == "-4" => format!("{d}/32"),
                        Some(d) => format!("{d}/128"),
                        None => continue,
                    };
                    let Ok(dst) = dst.parse::<IpNet>() else { continue };
                    let via = entry
                        .get("gateway")
                        .and_then(|g| g.as_str())
                        .and_then(|g| g.parse().ok());
                    let device = entry
                        .get("dev")
                        .and_then(|d| d.as_str())
                        .map(|d| d.to_string());
                    let blackhole =
                        entry.get("type").and_then(|t| t.as_str()) == Some("blackhole");
                    out.push(RouteSpec {
                        dst,
                        via,
                        device,
                        blackhole,
                    });
                }
            }
        }
        Ok(out)
    }

    async fn nat64_ensure(&self, ns: &str, pool: Ipv6Net) -> DpResult<Applied> {
        if self.nat64_pool(ns).await? == Some(pool) {
            return Ok(Applied::Unchanged);
        }
        // The instance cannot be re-pooled in place.
        self.nat64_delete(ns).await?;
        run_ok(
            "ip",
            &[
                "netns", "exec", ns, "jool", "instance", "add", ns, "--netfilter", "--pool6",
                &pool.to_string(),
            ],
        )
        .await?;
        Ok(Applied::Created)
    }

    async fn nat64_delete(&self, ns: &str) -> DpResult<()> {
        let output = run(
            "ip",
            &["netns", "exec", ns, "jool", "instance", "remove", ns],
        )
        .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.contains("does not exist") && !stderr.contains("not found") {
                warn!(ns, error = %stderr.trim(), "NAT64 instance removal failed");
            }
        }
        Ok(())
    }

    async fn nat64_pool(&self, ns: &str) -> DpResult<Option<Ipv6Net>> {
        let output = run(
            "ip",
            &[
                "netns", "exec", ns, "jool", "--instance", ns, "global", "display",
            ],
        )
        .await?;
        if !output.status.success() {
            return Ok(None);
        }
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            let line = line.trim();
            if let Some(rest) = line.strip_prefix("pool6:") {
                return Ok(rest.trim().parse().ok());
            }
        }
        Ok(None)
    }

    async fn nptv6_sync(&self, ns: &str, rules: &[(Ipv6Net, Ipv6Net)]) -> DpResult<Applied> {
        let current = self.nptv6_rules(ns).await?;
        let mut applied = Applied::Unchanged;
        for (internal, external) in &current {
            if !rules.contains(&(*internal, *external)) {
                for (chain, flag, matched, to) in [
                    ("POSTROUTING", "-s", internal, external),
                    ("PREROUTING", "-d", external, internal),
                ] {
                    let matched = matched.to_string();
                    let to = to.to_string();
                    let _ = run(
                        "ip",
                        &[
                            "netns", "exec", ns, "ip6tables", "-t", "nat", "-D", chain, flag,
                            &matched, "-j", "NETMAP", "--to", &to,
                        ],
                    )
                    .await;
                }
                applied = Applied::Changed;
            }
        }
        for (internal, external) in rules {
            if !current.contains(&(*internal, *external)) {
                for (chain, flag, matched, to) in [
                    ("POSTROUTING", "-s", internal, external),
                    ("PREROUTING", "-d", external, internal),
                ] {
                    let matched = matched.to_string();
                    let to = to.to_string();
                    run_ok(
                        "ip",
                        &[
                            "netns", "exec", ns, "ip6tables", "-t", "nat", "-A", chain, flag,
                            &matched, "-j", "NETMAP", "--to", &to,
                        ],
                    )
                    .await?;
                }
                applied = if current.is_empty() {
                    Applied::Created
                } else {
                    Applied::Changed
                };
            }
        }
        Ok(applied)
    }

    async fn nptv6_rules(&self, ns: &str) -> DpResult<Vec<(Ipv6Net, Ipv6Net)>> {
        let output = run(
            "ip",
            &[
                "netns", "exec", ns, "ip6tables", "-t", "nat", "-S", "POSTROUTING",
            ],
        )
        .await?;
        if !output.status.success() {
            return Ok(Vec::new());
        }
        let mut rules = Vec::new();
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            if !line.contains("NETMAP") {
                continue;
            }
            let mut internal = None;
            let mut external = None;
            let mut parts = line.split_whitespace();
            while let Some(token) = parts.next() {
                match token {
                    "-s" => internal = parts.next().and_then(|v| v.parse().ok()),
                    "--to" => external = parts.next().and_then(|v| v.parse().ok()),
                    _ => {}
                }
            }
            if let (Some(internal), Some(external)) = (internal, external) {
                rules.push((internal, external));
            }
        }
        Ok(rules)
    }
}

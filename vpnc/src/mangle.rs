//! DNS-doctor rule feeder.
//!
//! Computes, per downlink instance, which A answers must be rewritten
//! into the NAT64 /96 and which AAAA answers into their NPTv6 prefix,
//! then pushes the rule document to the netfilter DNS hook over its
//! control socket. The document is mirrored to a file so the hook can
//! recover after a restart.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::alloc;
use crate::error::Result;
use crate::model::{DownlinkInfo, ServiceMode};
use crate::store::{write_atomic, Snapshot};

/// Rewrite rules for one network instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NiRules {
    /// A answers inside the IPv4 net are rewritten to AAAA inside the
    /// /96 (NAT64 pool, full IPv4 space).
    pub dns64: Vec<(Ipv6Net, Ipv4Net)>,
    /// AAAA answers inside the original prefix are rewritten into the
    /// translated prefix.
    pub dns66: Vec<(Ipv6Net, Ipv6Net)>,
}

/// The full rule document pushed to the hook.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MangleRules(pub BTreeMap<String, NiRules>);

/// Compute the rewrite rules for every downlink instance.
pub fn compute(snapshot: &Snapshot) -> Result<MangleRules> {
    let mut rules = MangleRules::default();
    if snapshot.service.mode != ServiceMode::Hub {
        return Ok(rules);
    }
    let all_v4: Ipv4Net = "0.0.0.0/0".parse().expect("static prefix");

    for tenant in snapshot.tenants.values() {
        for ni in tenant.network_instances.values() {
            let info = DownlinkInfo::parse(&ni.id)?;
            let mut ni_rules = NiRules::default();

            for conn in ni.connections.values() {
                let pool = alloc::nat64_pool(&snapshot.service, &info, conn.id)?;
                ni_rules.dns64.push((pool, all_v4));
            }

            let scope = alloc::nptv6_scope(&snapshot.service, &info)?;
            let route_lists: Vec<(u8, &[crate::model::RouteV6])> = ni
                .connections
                .values()
                .map(|c| (c.id, c.routes.ipv6.as_slice()))
                .collect();
            let assigned = alloc::assign_nptv6(scope, &route_lists)?;
            for assignment in &assigned {
                ni_rules.dns66.push((assignment.external, assignment.internal));
            }
            // Non-translated routes still resolve to themselves.
            for conn in ni.connections.values() {
                for route in &conn.routes.ipv6 {
                    if !route.nptv6 {
                        ni_rules.dns66.push((route.to, route.to));
                    }
                }
            }

            rules.0.insert(ni.id.clone(), ni_rules);
        }
    }
    Ok(rules)
}

/// Where computed rules go; tests capture them in memory.
#[async_trait]
pub trait MangleSink: Send + Sync {
    async fn push(&self, rules: &MangleRules) -> Result<()>;
}

/// Production sink: one JSON document per push over a unix stream
/// socket, mirrored to the rules file.
pub struct UnixSocketSink {
    socket: PathBuf,
    mirror: PathBuf,
}

impl UnixSocketSink {
    pub fn new(socket: PathBuf, mirror: PathBuf) -> Self {
        Self { socket, mirror }
    }
}

#[async_trait]
impl MangleSink for UnixSocketSink {
    async fn push(&self, rules: &MangleRules) -> Result<()> {
        let document = serde_json::to_vec(rules).expect("rules always serialize");

        if let Some(parent) = self.mirror.parent() {
            std::fs::create_dir_all(parent)?;
        }
        write_atomic(&self.mirror, &document)?;

        match tokio::net::UnixStream::connect(&self.socket).await {
            Ok(mut stream) => {
                stream.write_all(&document).await?;
                stream.write_all(b"\n").await?;
                debug!(rules = rules.0.len(), "pushed DNS rewrite rules");
            }
            Err(e) => {
                // The hook reads the mirror on startup, so a missed
                // push converges on its next restart.
                warn!(error = %e, "DNS hook socket unavailable, rules mirrored only");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{hub_snapshot, tenant_with, wireguard_connection};

    #[test]
    fn computes_nat64_and_nptv6_rules() {
        let snapshot = hub_snapshot();
        let rules = compute(&snapshot).unwrap();
        let ni_rules = &rules.0["C0001-00"];

        assert_eq!(ni_rules.dns64.len(), 1);
        assert_eq!(ni_rules.dns64[0].0.to_string(), "fdcc:0:c:1::/96");
        assert_eq!(ni_rules.dns64[0].1.to_string(), "0.0.0.0/0");

        // The fixture route 2001:db8:c58::/48 is NPTv6-flagged; its
        // rewrite target is the first /48 carve of scope fdcc:1::/48.
        assert_eq!(ni_rules.dns66.len(), 1);
        assert_eq!(ni_rules.dns66[0].0.to_string(), "fdcc:1::/48");
        assert_eq!(ni_rules.dns66[0].1.to_string(), "2001:db8:c58::/48");
    }

    #[test]
    fn untranslated_routes_map_to_themselves() {
        let mut snapshot = hub_snapshot();
        let tenant = tenant_with(0, vec![wireguard_connection(0)]);
        snapshot.tenants.insert(tenant.id.clone(), tenant);
        let rules = compute(&snapshot).unwrap();
        let ni_rules = &rules.0["C0001-00"];
        assert!(ni_rules
            .dns66
            .iter()
            .any(|(ext, int)| ext == int && int.to_string() == "2001:db8:c58::/48"));
    }

    #[test]
    fn endpoint_mode_has_no_rules() {
        let mut snapshot = hub_snapshot();
        snapshot.service.mode = ServiceMode::Endpoint;
        snapshot.tenants.clear();
        let rules = compute(&snapshot).unwrap();
        assert!(rules.0.is_empty());
    }
}

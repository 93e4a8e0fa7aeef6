//! Reconciler integration tests on the in-memory dataplane.
//!
//! Cover the idempotence invariant, the full create/teardown cycle of
//! an IPsec downlink, the WireGuard downlink shape, and the route
//! advertisement flip when a transport comes up.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tempfile::TempDir;

use vpnc::config::Settings;
use vpnc::dataplane::memory::MemoryDataplane;
use vpnc::dataplane::Dataplane;
use vpnc::drivers::ssh::{SshControl, TunnelSpec};
use vpnc::drivers::wireguard::{WgControl, WgError};
use vpnc::drivers::DriverError;
use vpnc::frr::FrrDriver;
use vpnc::ike::{IkeControl, IkeError, SaInfo};
use vpnc::mangle::{MangleRules, MangleSink};
use vpnc::reconciler::{Effectors, Reconciler};
use vpnc::status::StatusRegistry;
use vpnc::store::Snapshot;
use vpnc::test_util::{hub_service, ipsec_connection, tenant_with, wireguard_connection};

#[derive(Default)]
struct StubIke {
    configs: Mutex<BTreeMap<String, String>>,
    established: Mutex<Vec<String>>,
}

#[async_trait]
impl IkeControl for StubIke {
    async fn write_config(&self, ni_id: &str, rendered: Option<String>) -> Result<(), IkeError> {
        let mut configs = self.configs.lock().unwrap();
        match rendered {
            Some(contents) => {
                configs.insert(ni_id.to_string(), contents);
            }
            None => {
                configs.remove(ni_id);
            }
        }
        Ok(())
    }

    async fn initiate(&self, _ike_name: &str) -> Result<(), IkeError> {
        Ok(())
    }

    async fn terminate_ike(&self, _ike_name: &str) -> Result<(), IkeError> {
        Ok(())
    }

    async fn terminate_sa(&self, _unique_id: &str) -> Result<(), IkeError> {
        Ok(())
    }

    async fn list_sas(&self, ike_name: Option<&str>) -> Result<Vec<SaInfo>, IkeError> {
        let established = self.established.lock().unwrap();
        Ok(established
            .iter()
            .filter(|name| ike_name.is_none() || Some(name.as_str()) == ike_name)
            .map(|name| SaInfo {
                name: name.clone(),
                unique_id: "1".to_string(),
                local_id: "%any".to_string(),
                remote_id: "peer".to_string(),
                if_id: 0,
                state: "ESTABLISHED".to_string(),
                remote_host: None,
                established: Utc::now(),
            })
            .collect())
    }
}

#[derive(Default)]
struct StubWg {
    configs: Mutex<BTreeMap<String, String>>,
    handshake: Mutex<Option<DateTime<Utc>>>,
}

#[async_trait]
impl WgControl for StubWg {
    async fn sync_device(&self, _ns: &str, ifname: &str, config: &str) -> Result<(), WgError> {
        self.configs
            .lock()
            .unwrap()
            .insert(ifname.to_string(), config.to_string());
        Ok(())
    }

    async fn remove_config(&self, ifname: &str) -> Result<(), WgError> {
        self.configs.lock().unwrap().remove(ifname);
        Ok(())
    }

    async fn last_handshake(
        &self,
        _ns: &str,
        _ifname: &str,
    ) -> Result<Option<DateTime<Utc>>, WgError> {
        Ok(*self.handshake.lock().unwrap())
    }
}

#[derive(Default)]
struct StubSsh;

#[async_trait]
impl SshControl for StubSsh {
    async fn ensure(&self, _spec: TunnelSpec) -> Result<(), DriverError> {
        Ok(())
    }

    async fn stop(&self, _name: &str) {}

    async fn established(&self, _name: &str) -> bool {
        false
    }
}

#[derive(Default)]
struct StubMangle {
    last: Mutex<Option<MangleRules>>,
}

#[async_trait]
impl MangleSink for StubMangle {
    async fn push(&self, rules: &MangleRules) -> vpnc::error::Result<()> {
        *self.last.lock().unwrap() = Some(rules.clone());
        Ok(())
    }
}

struct Harness {
    dp: Arc<MemoryDataplane>,
    ike: Arc<StubIke>,
    wg: Arc<StubWg>,
    mangle: Arc<StubMangle>,
    reconciler: Arc<Reconciler>,
    status: Arc<StatusRegistry>,
    _frr_dir: TempDir,
}

fn harness() -> Harness {
    let dp = Arc::new(MemoryDataplane::new());
    dp.seed_default_link("eth0");
    dp.seed_default_link("eth1");
    let ike = Arc::new(StubIke::default());
    let wg = Arc::new(StubWg::default());
    let mangle = Arc::new(StubMangle::default());
    let frr_dir = TempDir::new().unwrap();
    let frr = Arc::new(FrrDriver::new(frr_dir.path().join("frr.conf")).without_reload());
    let status = Arc::new(StatusRegistry::new());
    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&dp) as Arc<dyn Dataplane>,
        Effectors {
            ike: Arc::clone(&ike) as Arc<dyn IkeControl>,
            wg: Arc::clone(&wg) as Arc<dyn WgControl>,
            ssh: Arc::new(StubSsh) as Arc<dyn SshControl>,
            mangle: Arc::clone(&mangle) as Arc<dyn MangleSink>,
            frr,
        },
        Settings::default(),
        Arc::clone(&status),
    ));
    Harness {
        dp,
        ike,
        wg,
        mangle,
        reconciler,
        status,
        _frr_dir: frr_dir,
    }
}

fn snapshot_with_tenant(tenant: Option<vpnc::model::Tenant>) -> Snapshot {
    let mut tenants = BTreeMap::new();
    if let Some(tenant) = tenant {
        tenants.insert(tenant.id.clone(), tenant);
    }
    Snapshot {
        service: hub_service(),
        tenants,
    }
}

#[tokio::test]
async fn second_run_performs_no_kernel_changes() {
    let h = harness();
    let snapshot = snapshot_with_tenant(Some(tenant_with(0, vec![ipsec_connection(0)])));

    h.reconciler.apply_snapshot(None, &snapshot).await.unwrap();
    let after_first = h.dp.mutations();
    assert!(after_first > 0);

    h.reconciler
        .apply_snapshot(Some(&snapshot), &snapshot)
        .await
        .unwrap();
    assert_eq!(h.dp.mutations(), after_first, "second run must not touch the kernel");
}

#[tokio::test]
async fn ipsec_downlink_lifecycle() {
    let h = harness();
    let with_conn = snapshot_with_tenant(Some(tenant_with(0, vec![ipsec_connection(0)])));

    h.reconciler.apply_snapshot(None, &with_conn).await.unwrap();

    // Namespace, XFRM link, NAT64 pool and IKE config exist.
    let (links, _routes, nat64, _nptv6) = h.dp.ns_contents("C0001-00").unwrap();
    assert!(links.contains(&"xfrm0".to_string()));
    assert!(links.contains(&"C0001-00_D".to_string()));
    assert_eq!(nat64.unwrap().to_string(), "fdcc:0:c:1::/96");
    let ike_config = h.ike.configs.lock().unwrap().get("C0001-00").cloned().unwrap();
    assert!(ike_config.contains("C0001-00-0"));

    // The /96 is fed to the routing view and the DNS hook.
    let frr_conf = std::fs::read_to_string(h._frr_dir.path().join("frr.conf")).unwrap();
    assert!(frr_conf.contains("permit fdcc:0:c:1::/96"));
    let rules = h.mangle.last.lock().unwrap().clone().unwrap();
    assert!(rules.0.contains_key("C0001-00"));

    // Removing the connection removes its whole kernel footprint.
    let without_conn = snapshot_with_tenant(Some(tenant_with(0, vec![])));
    h.reconciler
        .apply_snapshot(Some(&with_conn), &without_conn)
        .await
        .unwrap();
    let (links, routes, nat64, nptv6) = h.dp.ns_contents("C0001-00").unwrap();
    assert!(!links.contains(&"xfrm0".to_string()));
    assert!(routes
        .iter()
        .all(|r| r.dst.to_string() != "172.16.30.0/24"));
    assert!(nat64.is_none());
    assert!(nptv6.is_empty());
    assert!(!h
        .ike
        .configs
        .lock()
        .unwrap()
        .get("C0001-00")
        .map(|c| c.contains("C0001-00-0"))
        .unwrap_or(false));

    // Removing the tenant removes the namespace.
    let empty = snapshot_with_tenant(None);
    h.reconciler
        .apply_snapshot(Some(&without_conn), &empty)
        .await
        .unwrap();
    assert!(h.dp.ns_contents("C0001-00").is_none());
}

#[tokio::test]
async fn wireguard_downlink_shape() {
    let h = harness();
    let tenant = tenant_with(1, vec![wireguard_connection(0)]);
    let snapshot = snapshot_with_tenant(Some(tenant));

    h.reconciler.apply_snapshot(None, &snapshot).await.unwrap();

    let ifname = "wg-C0001-01-0";
    let (links, routes, _nat64, _nptv6) = h.dp.ns_contents("C0001-01").unwrap();
    assert!(links.contains(&ifname.to_string()));

    // Interface addresses come from the pools.
    let addrs = h.dp.addrs("C0001-01", ifname).await.unwrap();
    let addr_strings: Vec<String> = addrs.iter().map(|a| a.to_string()).collect();
    assert!(addr_strings.contains(&"100.99.1.1/28".to_string()));
    assert!(addr_strings.contains(&"fdcc:cbe:1::/64".to_string()));

    // Exactly one peer.
    let config = h.wg.configs.lock().unwrap().get(ifname).cloned().unwrap();
    assert_eq!(config.matches("[Peer]").count(), 1);
    assert!(config.contains("Endpoint = 192.0.2.8:51820"));

    // Native and translated routes applied inside the instance.
    assert!(routes
        .iter()
        .any(|r| r.dst.to_string() == "2001:db8:c58::/48" && !r.blackhole));

    // Not yet active: the adverts are blackholed in CORE.
    let core_routes = h.dp.routes("CORE").await.unwrap();
    assert!(core_routes
        .iter()
        .any(|r| r.dst.to_string() == "fdcc:1:1::/52" && r.blackhole));
}

#[tokio::test]
async fn adverts_flip_when_transport_establishes() {
    let h = harness();
    let snapshot = snapshot_with_tenant(Some(tenant_with(1, vec![wireguard_connection(0)])));

    h.reconciler.apply_snapshot(None, &snapshot).await.unwrap();
    let core_routes = h.dp.routes("CORE").await.unwrap();
    assert!(core_routes
        .iter()
        .any(|r| r.dst.to_string() == "2001:db8:c58::/48" && r.blackhole));

    // Handshake arrives; the observe sweep promotes the connection.
    *h.wg.handshake.lock().unwrap() = Some(Utc::now());
    h.reconciler
        .apply_snapshot(Some(&snapshot), &snapshot)
        .await
        .unwrap();

    let core_routes = h.dp.routes("CORE").await.unwrap();
    let advert = core_routes
        .iter()
        .find(|r| r.dst.to_string() == "2001:db8:c58::/48")
        .unwrap();
    assert!(!advert.blackhole);
    assert_eq!(advert.device.as_deref(), Some("C0001-01_C"));

    use vpnc::drivers::ConnectionState;
    assert_eq!(
        h.status.connection_state("C0001-01", 0).await,
        Some(ConnectionState::Active)
    );
}

#[tokio::test]
async fn edited_connection_prunes_stale_routes() {
    let h = harness();
    let before = snapshot_with_tenant(Some(tenant_with(1, vec![wireguard_connection(0)])));
    h.reconciler.apply_snapshot(None, &before).await.unwrap();

    // Both routes and the translated advert are installed.
    let (_links, routes, _nat64, _nptv6) = h.dp.ns_contents("C0001-01").unwrap();
    assert!(routes
        .iter()
        .any(|r| r.dst.to_string() == "2001:db8:c59::/52"));
    let core = h.dp.routes("CORE").await.unwrap();
    assert!(core.iter().any(|r| r.dst.to_string() == "fdcc:1:1::/52"));

    // Drop the NPTv6-flagged route from the live connection; the
    // connection itself survives.
    let mut edited = wireguard_connection(0);
    edited.routes.ipv6.retain(|r| !r.nptv6);
    let after = snapshot_with_tenant(Some(tenant_with(1, vec![edited])));
    h.reconciler
        .apply_snapshot(Some(&before), &after)
        .await
        .unwrap();

    // The stale route and its translated advert are gone from the
    // instance and from CORE; the surviving native advert stays.
    let (_links, routes, _nat64, nptv6) = h.dp.ns_contents("C0001-01").unwrap();
    assert!(routes
        .iter()
        .all(|r| r.dst.to_string() != "2001:db8:c59::/52"));
    assert!(nptv6.is_empty());
    let core = h.dp.routes("CORE").await.unwrap();
    assert!(core.iter().all(|r| r.dst.to_string() != "fdcc:1:1::/52"));
    assert!(core.iter().any(|r| r.dst.to_string() == "2001:db8:c58::/48"));

    // Re-running with the edited snapshot performs no further changes.
    let settled = h.dp.mutations();
    h.reconciler
        .apply_snapshot(Some(&after), &after)
        .await
        .unwrap();
    assert_eq!(h.dp.mutations(), settled);
}

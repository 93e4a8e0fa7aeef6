//! Tenant/NI reconciliation engine.
//!
//! Runs on every published snapshot. Per instance: ensure the
//! namespace, wire the veth toward CORE, apply connections through
//! their drivers, install routes, then materialize NAT64/NPTv6.
//! Removals run in reverse order. Re-running with the same snapshot
//! performs no kernel changes.

pub mod plan;

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, error, info, warn};

use crate::config::{Settings, CORE_NI};
use crate::dataplane::{Dataplane, LinkKind, LinkSpec, RouteSpec};
use crate::drivers::{
    interface_name, ipsec::IpsecDriver, physical::PhysicalDriver, ssh::SshDriver,
    ssh::SshControl, wireguard::WgControl, wireguard::WireguardDriver, ConnCtx, ConnectionDriver,
    ConnectionState, DriverError,
};
use crate::error::Result;
use crate::frr::{FrrDriver, UplinkPrefixes};
use crate::ike::IkeControl;
use crate::mangle::{self, MangleSink};
use crate::model::{
    Connection, DownlinkInfo, NetworkInstance, NiType, Service, TransportConfig, TransportKind,
};
use crate::status::{ConnectionStatus, NatStatus, StatusRegistry};
use crate::store::Snapshot;

use plan::ConnPlan;

/// How many tenant instances reconcile concurrently.
const NI_WORKERS: usize = 4;

/// External collaborators driven during reconciliation.
pub struct Effectors {
    pub ike: Arc<dyn IkeControl>,
    pub wg: Arc<dyn WgControl>,
    pub ssh: Arc<dyn SshControl>,
    pub mangle: Arc<dyn MangleSink>,
    pub frr: Arc<FrrDriver>,
}

pub struct Reconciler {
    dp: Arc<dyn Dataplane>,
    ipsec: IpsecDriver,
    wireguard: WireguardDriver,
    ssh: SshDriver,
    physical: PhysicalDriver,
    mangle: Arc<dyn MangleSink>,
    frr: Arc<FrrDriver>,
    settings: Settings,
    status: Arc<StatusRegistry>,
    /// Serializes all primitive calls touching one instance.
    ni_locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Global lock around namespace creation and deletion.
    ns_lock: Mutex<()>,
    workers: Semaphore,
    /// Transient-failure backoff per connection: (consecutive failures,
    /// earliest next attempt).
    retry: std::sync::Mutex<HashMap<(String, u8), (u32, std::time::Instant)>>,
}

impl Reconciler {
    pub fn new(
        dp: Arc<dyn Dataplane>,
        effectors: Effectors,
        settings: Settings,
        status: Arc<StatusRegistry>,
    ) -> Self {
        Self {
            ipsec: IpsecDriver::new(Arc::clone(&dp), Arc::clone(&effectors.ike)),
            wireguard: WireguardDriver::new(Arc::clone(&dp), Arc::clone(&effectors.wg)),
            ssh: SshDriver::new(Arc::clone(&dp), Arc::clone(&effectors.ssh)),
            physical: PhysicalDriver::new(Arc::clone(&dp)),
            mangle: effectors.mangle,
            frr: effectors.frr,
            dp,
            settings,
            status,
            ni_locks: std::sync::Mutex::new(HashMap::new()),
            ns_lock: Mutex::new(()),
            workers: Semaphore::new(NI_WORKERS),
            retry: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// True while a failed connection still waits out its backoff.
    fn retry_pending(&self, ni: &str, conn: u8) -> bool {
        let retry = self.retry.lock().expect("retry map never poisoned");
        retry
            .get(&(ni.to_string(), conn))
            .map(|(_, next)| *next > std::time::Instant::now())
            .unwrap_or(false)
    }

    /// Record a transient failure: exponential backoff from 1s, capped
    /// at five minutes.
    fn retry_bump(&self, ni: &str, conn: u8) {
        let mut retry = self.retry.lock().expect("retry map never poisoned");
        let entry = retry
            .entry((ni.to_string(), conn))
            .or_insert((0, std::time::Instant::now()));
        entry.0 = entry.0.saturating_add(1);
        let delay = (1u64 << entry.0.min(16)).min(crate::config::RETRY_BACKOFF_CAP_SECS);
        entry.1 = std::time::Instant::now() + std::time::Duration::from_secs(delay);
    }

    fn retry_clear(&self, ni: &str, conn: u8) {
        self.retry
            .lock()
            .expect("retry map never poisoned")
            .remove(&(ni.to_string(), conn));
    }

    fn driver(&self, kind: TransportKind) -> &dyn ConnectionDriver {
        match kind {
            TransportKind::Ipsec => &self.ipsec,
            TransportKind::Wireguard => &self.wireguard,
            TransportKind::Ssh => &self.ssh,
            TransportKind::Physical => &self.physical,
        }
    }

    fn ni_lock(&self, ni: &str) -> Arc<Mutex<()>> {
        let mut locks = self.ni_locks.lock().expect("lock map never poisoned");
        Arc::clone(locks.entry(ni.to_string()).or_default())
    }

    /// Apply one snapshot transition. Removed instances are torn down
    /// first, default instances are brought up in dependency order,
    /// tenant instances reconcile in parallel.
    pub async fn apply_snapshot(
        self: &Arc<Self>,
        old: Option<&Snapshot>,
        new: &Snapshot,
    ) -> Result<()> {
        // Teardown of instances that vanished from config.
        if let Some(old_snapshot) = old {
            for tenant in old_snapshot.tenants.values() {
                let survivor = new.tenants.get(&tenant.id);
                for ni in tenant.network_instances.values() {
                    let still_there = survivor
                        .map(|t| t.network_instances.contains_key(&ni.id))
                        .unwrap_or(false);
                    if !still_there {
                        if let Err(e) = self.teardown_ni(&old_snapshot.service, ni).await {
                            error!(ni = %ni.id, error = %e, "instance teardown failed");
                        }
                    }
                }
            }
        }

        // Default instances, in dependency order.
        for name in ["EXTERNAL", "CORE", "ENDPOINT"] {
            let Some(ni) = new.service.network_instances.get(name) else {
                continue;
            };
            let old_ni = old.and_then(|s| s.service.network_instances.get(name));
            if let Err(e) = self.reconcile_ni(&new.service, ni, old_ni).await {
                error!(ni = %ni.id, error = %e, "instance reconciliation failed");
            }
        }

        // Tenant instances, bounded parallelism, serialized per NI.
        let mut tasks = Vec::new();
        for tenant in new.tenants.values() {
            for ni in tenant.network_instances.values() {
                let this = Arc::clone(self);
                let service = new.service.clone();
                let ni = ni.clone();
                let old_ni = old
                    .and_then(|s| s.tenants.get(&tenant.id))
                    .and_then(|t| t.network_instances.get(&ni.id))
                    .cloned();
                tasks.push(tokio::spawn(async move {
                    let _permit = this.workers.acquire().await.expect("semaphore open");
                    if let Err(e) = this.reconcile_ni(&service, &ni, old_ni.as_ref()).await {
                        error!(ni = %ni.id, error = %e, "instance reconciliation failed");
                    }
                }));
            }
        }
        for task in tasks {
            let _ = task.await;
        }

        self.publish_subordinates(new).await;
        Ok(())
    }

    /// Render and push the routing-daemon and DNS-hook views derived
    /// from the reconciled state.
    async fn publish_subordinates(&self, snapshot: &Snapshot) {
        let mut prefixes = UplinkPrefixes::default();
        for tenant in snapshot.tenants.values() {
            for ni in tenant.network_instances.values() {
                let Ok(ni_plan) = plan::compute(&snapshot.service, ni) else {
                    continue;
                };
                prefixes.nat64.extend(ni_plan.nat64_prefixes());
                prefixes.nptv6.extend(ni_plan.nptv6_prefixes());
                for conn in &ni_plan.connections {
                    let active = matches!(
                        self.status.connection_state(&ni.id, conn.conn_id).await,
                        Some(ConnectionState::Active)
                    );
                    if !active {
                        for advert in &conn.core_adverts {
                            if let IpNet::V6(v6) = advert {
                                prefixes.penalized.push(*v6);
                            }
                        }
                    }
                }
            }
        }

        if let Some(rendered) = crate::frr::render(&snapshot.service, &prefixes) {
            if let Err(e) = self.frr.apply(&rendered).await {
                warn!(error = %e, "routing configuration apply failed");
            }
        }

        match mangle::compute(snapshot) {
            Ok(rules) => {
                if let Err(e) = self.mangle.push(&rules).await {
                    warn!(error = %e, "DNS rewrite rule push failed");
                }
            }
            Err(e) => warn!(error = %e, "DNS rewrite rule computation failed"),
        }
    }

    /// Bring one instance to its desired state.
    pub async fn reconcile_ni(
        &self,
        service: &Service,
        ni: &NetworkInstance,
        old_ni: Option<&NetworkInstance>,
    ) -> Result<()> {
        let lock = self.ni_lock(&ni.id);
        let _guard = lock.lock().await;
        debug!(ni = %ni.id, "reconciling instance");

        let ni_plan = plan::compute(service, ni)?;

        {
            let _ns_guard = self.ns_lock.lock().await;
            self.dp.ns_ensure(&ni.id).await.map_err(dp_err)?;
        }
        if ni_plan.forwarding {
            self.dp.forwarding_enable(&ni.id).await.map_err(dp_err)?;
        }

        if let Some(veth) = &ni_plan.veth {
            self.ensure_veth(&ni.id, veth).await?;
        }

        // Connections that disappeared from config: reverse order, ssh
        // tunnels first (they ride on other connections).
        if let Some(old_ni) = old_ni {
            let removed = removed_connections(old_ni, ni);
            if !removed.is_empty() {
                self.teardown_connections(service, old_ni, &removed).await;
            }
        }

        // Forward order: transport first, then routes, then NAT rules.
        let mut states: HashMap<u8, ConnectionState> = HashMap::new();
        for conn_plan in &ni_plan.connections {
            let conn = &ni.connections[&conn_plan.conn_id];
            let state = self.apply_connection(service, ni, conn, conn_plan).await;
            states.insert(conn_plan.conn_id, state);
        }

        for conn_plan in &ni_plan.connections {
            for route in &conn_plan.routes {
                self.dp.route_ensure(&ni.id, route).await.map_err(dp_err)?;
            }
            if let Some(veth) = &ni_plan.veth {
                let active = states.get(&conn_plan.conn_id) == Some(&ConnectionState::Active);
                for advert in &conn_plan.core_adverts {
                    let route = if active {
                        RouteSpec::unicast(
                            *advert,
                            Some("fe80::1".parse::<IpAddr>().expect("static address")),
                            Some(veth.core_name.clone()),
                        )
                    } else {
                        RouteSpec::blackhole(*advert)
                    };
                    self.dp.route_ensure(CORE_NI, &route).await.map_err(dp_err)?;
                }
            }
        }

        if let Some(veth) = &ni_plan.veth {
            for route in &veth.uplink_routes {
                self.dp.route_ensure(&ni.id, route).await.map_err(dp_err)?;
            }
        }

        self.prune_routes(service, ni, old_ni, &ni_plan).await?;

        match ni_plan.nat64 {
            Some(pool) => {
                self.dp.nat64_ensure(&ni.id, pool).await.map_err(dp_err)?;
            }
            None => self.dp.nat64_delete(&ni.id).await.map_err(dp_err)?,
        }
        let nptv6: Vec<_> = ni_plan.nptv6.clone();
        self.dp.nptv6_sync(&ni.id, &nptv6).await.map_err(dp_err)?;

        self.status
            .publish_nat(
                &ni.id,
                NatStatus {
                    nat64: ni_plan.nat64_prefixes(),
                    nptv6,
                },
            )
            .await;

        Ok(())
    }

    /// Delete routes that are actual but no longer desired, the same
    /// full-sync contract addr_sync and nptv6_sync follow. Covers live
    /// connections whose route list shrank or whose NPTv6 carve moved;
    /// fully removed connections are handled by teardown_connections.
    async fn prune_routes(
        &self,
        service: &Service,
        ni: &NetworkInstance,
        old_ni: Option<&NetworkInstance>,
        ni_plan: &plan::NiPlan,
    ) -> Result<()> {
        // Inside the instance, only routes on interfaces this plan owns
        // are candidates; kernel-managed routes never surface here.
        let mut desired_dsts: HashSet<IpNet> = HashSet::new();
        let mut owned_devices: HashSet<String> = HashSet::new();
        for conn_plan in &ni_plan.connections {
            let conn = &ni.connections[&conn_plan.conn_id];
            owned_devices.insert(interface_name(ni, conn));
            desired_dsts.extend(conn_plan.routes.iter().map(|r| r.dst));
        }
        if let Some(veth) = &ni_plan.veth {
            owned_devices.insert(veth.inner_name.clone());
            desired_dsts.extend(veth.uplink_routes.iter().map(|r| r.dst));
        }
        for actual in self.dp.routes(&ni.id).await.map_err(dp_err)? {
            let owned = actual
                .device
                .as_ref()
                .map(|d| owned_devices.contains(d))
                .unwrap_or(false);
            if owned && !desired_dsts.contains(&actual.dst) {
                info!(ni = %ni.id, route = %actual.dst, "removing stale route");
                self.dp
                    .route_delete(&ni.id, &actual.dst)
                    .await
                    .map_err(dp_err)?;
            }
        }

        // In CORE, this instance owns routes over its veth plus the
        // prefixes it advertised before the edit; blackholed adverts
        // carry no device, so ownership of those comes from the
        // previous plan.
        let Some(veth) = &ni_plan.veth else {
            return Ok(());
        };
        let desired_adverts: HashSet<IpNet> = ni_plan
            .connections
            .iter()
            .flat_map(|c| c.core_adverts.iter().copied())
            .collect();
        let mut owned_adverts = desired_adverts.clone();
        if let Some(old_ni) = old_ni {
            if let Ok(old_plan) = plan::compute(service, old_ni) {
                owned_adverts.extend(
                    old_plan
                        .connections
                        .iter()
                        .flat_map(|c| c.core_adverts.iter().copied()),
                );
            }
        }
        for actual in self.dp.routes(CORE_NI).await.map_err(dp_err)? {
            let ours = actual.device.as_deref() == Some(veth.core_name.as_str())
                || owned_adverts.contains(&actual.dst);
            if ours && !desired_adverts.contains(&actual.dst) {
                info!(ni = %ni.id, route = %actual.dst, "retracting stale advertisement");
                self.dp
                    .route_delete(CORE_NI, &actual.dst)
                    .await
                    .map_err(dp_err)?;
            }
        }
        Ok(())
    }

    async fn ensure_veth(&self, ns: &str, veth: &plan::VethPlan) -> Result<()> {
        let spec = LinkSpec {
            name: veth.inner_name.clone(),
            kind: LinkKind::Veth {
                peer: veth.core_name.clone(),
                peer_ns: CORE_NI.to_string(),
            },
            parent_ns: None,
        };
        self.dp.link_ensure(ns, &spec).await.map_err(dp_err)?;
        self.dp.link_up(ns, &veth.inner_name).await.map_err(dp_err)?;
        self.dp.link_up(CORE_NI, &veth.core_name).await.map_err(dp_err)?;

        let core_ll: IpNet = "fe80::/64".parse().expect("static prefix");
        let inner_ll: IpNet = "fe80::1/64".parse().expect("static prefix");
        self.dp
            .addr_ensure(CORE_NI, &veth.core_name, &core_ll)
            .await
            .map_err(dp_err)?;
        self.dp
            .addr_ensure(ns, &veth.inner_name, &inner_ll)
            .await
            .map_err(dp_err)?;

        if veth.endpoint_mode {
            let core_v4: IpNet = "169.254.0.1/30".parse().expect("static prefix");
            let inner_v4: IpNet = "169.254.0.2/30".parse().expect("static prefix");
            self.dp
                .addr_ensure(CORE_NI, &veth.core_name, &core_v4)
                .await
                .map_err(dp_err)?;
            self.dp
                .addr_ensure(ns, &veth.inner_name, &inner_v4)
                .await
                .map_err(dp_err)?;
        }
        Ok(())
    }

    /// Apply one connection through its driver; reports the reached
    /// state and publishes it.
    async fn apply_connection(
        &self,
        service: &Service,
        ni: &NetworkInstance,
        conn: &Connection,
        conn_plan: &ConnPlan,
    ) -> ConnectionState {
        let info = match ni.ni_type {
            NiType::Downlink => DownlinkInfo::parse(&ni.id).ok(),
            _ => None,
        };
        let ctx = ConnCtx {
            service,
            ni,
            conn,
            info,
            addrs: conn_plan.addrs.clone(),
            settings: &self.settings,
        };
        let driver = self.driver(conn_plan.kind);

        let (state, reason) = if self.retry_pending(&ni.id, conn.id) {
            (
                ConnectionState::Degraded,
                Some("waiting out retry backoff".to_string()),
            )
        } else {
            match driver.apply(&ctx).await {
                Ok(_) => {
                    self.retry_clear(&ni.id, conn.id);
                    match driver.observe(&ctx).await {
                        Ok(state) => (state, None),
                        Err(e) => (ConnectionState::Degraded, Some(e.to_string())),
                    }
                }
                Err(DriverError::Fatal(reason)) => {
                    warn!(ni = %ni.id, conn = conn.id, %reason, "connection rejected by driver");
                    (ConnectionState::Configured, Some(reason))
                }
                Err(DriverError::Transient(reason)) => {
                    self.retry_bump(&ni.id, conn.id);
                    warn!(ni = %ni.id, conn = conn.id, %reason, "connection apply failed, will retry");
                    (ConnectionState::Degraded, Some(reason))
                }
            }
        };

        self.status
            .publish_connection(ConnectionStatus {
                tenant: tenant_of(&ni.id),
                network_instance: ni.id.clone(),
                connection: conn.id,
                kind: conn_plan.kind,
                state,
                interface: interface_name(ni, conn),
                addresses: conn_plan.addrs.iter().map(|a| a.to_string()).collect(),
                remote: remote_of(conn),
                reason,
            })
            .await;
        state
    }

    /// Tear down a set of connections in reverse order: NAT rules and
    /// routes first, then the transports, ssh tunnels before the
    /// connections they ride on.
    async fn teardown_connections(
        &self,
        service: &Service,
        old_ni: &NetworkInstance,
        removed: &[u8],
    ) {
        let Ok(old_plan) = plan::compute(service, old_ni) else {
            return;
        };
        let mut ordered: Vec<&Connection> = removed
            .iter()
            .filter_map(|id| old_ni.connections.get(id))
            .collect();
        ordered.sort_by_key(|c| {
            (
                c.config.kind() != TransportKind::Ssh,
                std::cmp::Reverse(c.id),
            )
        });

        for conn in ordered {
            info!(ni = %old_ni.id, conn = conn.id, "removing connection");
            self.retry_clear(&old_ni.id, conn.id);
            self.status
                .publish_connection(ConnectionStatus {
                    tenant: tenant_of(&old_ni.id),
                    network_instance: old_ni.id.clone(),
                    connection: conn.id,
                    kind: conn.config.kind(),
                    state: ConnectionState::Teardown,
                    interface: interface_name(old_ni, conn),
                    addresses: Vec::new(),
                    remote: remote_of(conn),
                    reason: None,
                })
                .await;
            let conn_plan = old_plan
                .connections
                .iter()
                .find(|p| p.conn_id == conn.id);

            if let Some(conn_plan) = conn_plan {
                for advert in &conn_plan.core_adverts {
                    let _ = self.dp.route_delete(CORE_NI, advert).await;
                }
                for route in &conn_plan.routes {
                    let _ = self.dp.route_delete(&old_ni.id, &route.dst).await;
                }
            }

            let info = match old_ni.ni_type {
                NiType::Downlink => DownlinkInfo::parse(&old_ni.id).ok(),
                _ => None,
            };
            let ctx = ConnCtx {
                service,
                ni: old_ni,
                conn,
                info,
                addrs: Vec::new(),
                settings: &self.settings,
            };
            if let Err(e) = self.driver(conn.config.kind()).teardown(&ctx).await {
                error!(ni = %old_ni.id, conn = conn.id, error = %e, "connection teardown failed");
            }
            self.status.forget_connection(&old_ni.id, conn.id).await;
        }
    }

    /// Remove one instance and everything it owns.
    pub async fn teardown_ni(&self, service: &Service, ni: &NetworkInstance) -> Result<()> {
        let lock = self.ni_lock(&ni.id);
        let _guard = lock.lock().await;
        info!(ni = %ni.id, "tearing down instance");

        let all: Vec<u8> = ni.connections.keys().copied().collect();
        self.teardown_connections(service, ni, &all).await;

        let _ = self.dp.nptv6_sync(&ni.id, &[]).await;
        let _ = self.dp.nat64_delete(&ni.id).await;

        {
            let _ns_guard = self.ns_lock.lock().await;
            self.dp.ns_delete(&ni.id).await.map_err(dp_err)?;
        }
        self.status.forget_ni(&ni.id).await;
        self.ni_locks
            .lock()
            .expect("lock map never poisoned")
            .remove(&ni.id);
        Ok(())
    }
}

fn removed_connections(old_ni: &NetworkInstance, new_ni: &NetworkInstance) -> Vec<u8> {
    old_ni
        .connections
        .keys()
        .filter(|id| !new_ni.connections.contains_key(id))
        .copied()
        .collect()
}

fn tenant_of(ni_id: &str) -> String {
    match ni_id.split_once('-') {
        Some((tenant, _)) => tenant.to_string(),
        None => "DEFAULT".to_string(),
    }
}

fn remote_of(conn: &Connection) -> Option<String> {
    match &conn.config {
        TransportConfig::Ipsec(c) => c.remote_addrs.first().map(|a| a.to_string()),
        TransportConfig::Wireguard(c) => c
            .remote_addrs
            .first()
            .map(|a| format!("{a}:{}", c.remote_port)),
        TransportConfig::Ssh(c) => c.remote_addrs.first().map(|a| a.to_string()),
        TransportConfig::Physical(_) => None,
    }
}

fn dp_err(e: crate::dataplane::DataplaneError) -> crate::error::Error {
    match e {
        crate::dataplane::DataplaneError::Busy(msg) => crate::error::Error::KernelBusy(msg),
        crate::dataplane::DataplaneError::NotFound { .. } => {
            crate::error::Error::DriverFatal(e.to_string())
        }
        other => crate::error::Error::DriverTransient(other.to_string()),
    }
}

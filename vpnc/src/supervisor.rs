//! Task wiring, lifecycle ordering and shutdown.
//!
//! One supervisor owns the snapshot watcher, the IKE event stream, the
//! routing-daemon poller and the reconciler. Snapshots and neighbor
//! state are last-writer-wins (`watch`); SA events accumulate in a
//! bounded queue. On shutdown, instances are torn down in reverse
//! dependency order: downlinks, then CORE, then EXTERNAL.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::dataplane::linux::LinuxDataplane;
use crate::drivers::ssh::SshSupervisor;
use crate::drivers::wireguard::WgCli;
use crate::error::Result;
use crate::frr::FrrDriver;
use crate::ike::{SaMonitor, SwanctlControl};
use crate::mangle::UnixSocketSink;
use crate::reconciler::{Effectors, Reconciler};
use crate::status::{self, StatusRegistry};
use crate::store::{spawn_watcher, Snapshot, Store};

/// Capacity of the SA event queue; events are accumulated, the stream
/// blocks rather than drops when the monitor falls behind.
const SA_QUEUE: usize = 256;

/// Interval of the observe sweep that promotes CONNECTING connections
/// and flips route advertisements.
const OBSERVE_INTERVAL_SECS: u64 = 30;

/// Run the daemon until a termination signal arrives.
pub async fn run(settings: Settings) -> Result<()> {
    let store = Store::new(&settings.active_dir, &settings.candidate_dir);

    // An unreadable active store must escalate so supervision restarts
    // the process; an invalid one is a hard startup error too.
    let snapshot = Arc::new(store.load_active()?);
    info!(
        tenants = snapshot.tenants.len(),
        mode = ?snapshot.service.mode,
        "active configuration loaded"
    );

    let status = Arc::new(StatusRegistry::new());
    let dp = Arc::new(LinuxDataplane::new().map_err(|e| {
        crate::error::Error::DriverTransient(format!("netlink unavailable: {e}"))
    })?);
    let ike = Arc::new(SwanctlControl::new(settings.swanctl_dir.clone()));
    let effectors = Effectors {
        ike: ike.clone(),
        wg: Arc::new(WgCli::new(settings.wireguard_dir.clone())),
        ssh: Arc::new(SshSupervisor::new()),
        mangle: Arc::new(UnixSocketSink::new(
            settings.mangle_socket.clone(),
            settings.mangle_rules.clone(),
        )),
        frr: Arc::new(FrrDriver::new(settings.frr_config.clone())),
    };
    let frr = Arc::clone(&effectors.frr);
    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&dp) as Arc<dyn crate::dataplane::Dataplane>,
        effectors,
        settings.clone(),
        Arc::clone(&status),
    ));

    // Startup recovery: converge on the loaded snapshot before any
    // watcher or monitor runs.
    reconciler.apply_snapshot(None, &snapshot).await?;
    info!("startup reconciliation complete");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handler(shutdown_tx.clone());

    // Status endpoint.
    let status_for_http = Arc::clone(&status);
    let listen = settings.status_listen.clone();
    tokio::spawn(async move {
        if let Err(e) = status::serve(status_for_http, &listen).await {
            error!(error = %e, "status endpoint failed");
        }
    });

    // Config watcher.
    let (mut snapshots, mut watcher_handle) = spawn_watcher(
        store,
        Arc::clone(&snapshot),
        Duration::from_secs(settings.watch_interval_secs),
        shutdown_rx.clone(),
    );

    // IKE event stream and duplicate-SA monitor.
    let (sa_tx, sa_rx) = mpsc::channel(SA_QUEUE);
    ike.spawn_events(sa_tx);
    let monitor = SaMonitor::new(ike.clone() as Arc<dyn crate::ike::IkeControl>);
    tokio::spawn(monitor.run(sa_rx));

    // Routing-daemon neighbor poll.
    spawn_bgp_poll(
        Arc::clone(&frr),
        Arc::clone(&status),
        Duration::from_secs(settings.bgp_poll_interval_secs),
        shutdown_rx.clone(),
    );

    let mut current = snapshot;
    let mut observe = tokio::time::interval(Duration::from_secs(OBSERVE_INTERVAL_SECS));
    observe.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut shutdown = shutdown_rx;

    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let next = snapshots.borrow_and_update().clone();
                info!("applying configuration change");
                if let Err(e) = reconciler.apply_snapshot(Some(&current), &next).await {
                    error!(error = %e, "snapshot application failed");
                }
                current = next;
            }
            _ = observe.tick() => {
                // Idempotent sweep: promotes transports that came up and
                // refreshes route advertisements.
                if let Err(e) = reconciler.apply_snapshot(Some(&current), &current).await {
                    error!(error = %e, "observe sweep failed");
                }
            }
            result = &mut watcher_handle => {
                match result {
                    Ok(Err(e)) => {
                        error!(error = %e, "configuration store unreadable, exiting");
                        return Err(e);
                    }
                    _ => break,
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("shutting down");
    shutdown_teardown(&reconciler, &current).await;
    Ok(())
}

fn spawn_signal_handler(shutdown: watch::Sender<bool>) {
    tokio::spawn(async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("SIGTERM handler installs");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        info!("termination signal received");
        let _ = shutdown.send(true);
    });
}

fn spawn_bgp_poll(
    frr: Arc<FrrDriver>,
    status: Arc<StatusRegistry>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match frr.neighbor_summary().await {
                        Ok(neighbors) => status.publish_bgp(neighbors).await,
                        Err(e) => warn!(error = %e, "neighbor poll failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    });
}

/// Tear down in reverse dependency order; pending retries are dropped
/// with the tasks, in-flight kernel calls finish under their NI locks.
async fn shutdown_teardown(reconciler: &Arc<Reconciler>, snapshot: &Snapshot) {
    for tenant in snapshot.tenants.values().rev() {
        for ni in tenant.network_instances.values().rev() {
            if let Err(e) = reconciler.teardown_ni(&snapshot.service, ni).await {
                error!(ni = %ni.id, error = %e, "teardown failed during shutdown");
            }
        }
    }
    for name in ["ENDPOINT", "CORE", "EXTERNAL"] {
        if let Some(ni) = snapshot.service.network_instances.get(name) {
            if let Err(e) = reconciler.teardown_ni(&snapshot.service, ni).await {
                error!(ni = %ni.id, error = %e, "teardown failed during shutdown");
            }
        }
    }
}

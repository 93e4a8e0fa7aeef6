//! Poll-based watcher for the active configuration directory.
//!
//! Publishes validated snapshots over a `watch` channel, so slow
//! consumers only ever see the newest state (last-writer-wins). Invalid
//! configuration keeps the previous snapshot alive; an unreadable store
//! stops the watcher with an error so supervision can restart the
//! process.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::{Error, Result};

use super::{Snapshot, Store};

type DirState = BTreeMap<PathBuf, (SystemTime, u64)>;

fn scan(store: &Store) -> Result<DirState> {
    let mut state = DirState::new();
    for entry in std::fs::read_dir(store.active_dir())? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
            continue;
        }
        let meta = entry.metadata()?;
        let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        state.insert(path, (mtime, meta.len()));
    }
    Ok(state)
}

/// Spawn the watcher task.
///
/// Returns the snapshot receiver seeded with `initial` and the task
/// handle; the task resolves with an error only when the active store
/// became unreadable.
pub fn spawn_watcher(
    store: Store,
    initial: Arc<Snapshot>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> (watch::Receiver<Arc<Snapshot>>, JoinHandle<Result<()>>) {
    let (tx, rx) = watch::channel(initial);

    let handle = tokio::spawn(async move {
        let mut last = scan(&store)?;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("configuration watcher stopping");
                        return Ok(());
                    }
                }
            }

            let current = scan(&store)?;
            if current == last {
                continue;
            }
            last = current;

            match store.load_active() {
                Ok(snapshot) => {
                    info!(
                        tenants = snapshot.tenants.len(),
                        "active configuration changed"
                    );
                    // Receivers may be gone during shutdown.
                    let _ = tx.send(Arc::new(snapshot));
                }
                Err(Error::Io(e)) => {
                    error!(error = %e, "active configuration store unreadable");
                    return Err(Error::Io(e));
                }
                Err(e) => {
                    warn!(error = %e, "ignoring invalid active configuration");
                }
            }
        }
    });

    (rx, handle)
}

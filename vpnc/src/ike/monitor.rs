//! Duplicate-SA bookkeeping and reaping.
//!
//! Rekeys can legitimately leave two SAs installed for the same
//! `(local_id, remote_id, if_id)` for a short make-before-break window.
//! Outside that window, only the youngest SA survives; older ones are
//! terminated with bounded retries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{IkeControl, IkeError};

/// Identity of an SA family; duplicates are tracked per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SaKey {
    pub local_id: String,
    pub remote_id: String,
    pub if_id: u32,
}

/// One installed SA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaRecord {
    pub unique_id: String,
    pub established: DateTime<Utc>,
}

/// Events from the IKE daemon's stream.
#[derive(Debug, Clone)]
pub enum SaEvent {
    SaUp { key: SaKey, sa: SaRecord },
    SaDown { key: SaKey, unique_id: String },
    /// A CHILD_REKEY was observed; duplicates within the window are
    /// legitimate replacements and must not be reaped.
    Rekey { key: SaKey },
}

/// Width of the make-before-break window around a rekey, seconds.
pub const REKEY_WINDOW_SECS: i64 = 30;

/// Pure duplicate-tracking state machine.
#[derive(Debug, Default)]
pub struct SaTable {
    entries: HashMap<SaKey, Vec<SaRecord>>,
    rekey_until: HashMap<SaKey, DateTime<Utc>>,
}

impl SaTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an event; returns the SAs that must be terminated now.
    pub fn observe(&mut self, event: SaEvent, now: DateTime<Utc>) -> Vec<SaRecord> {
        match event {
            SaEvent::Rekey { key } => {
                self.rekey_until
                    .insert(key, now + chrono::Duration::seconds(REKEY_WINDOW_SECS));
                Vec::new()
            }
            SaEvent::SaDown { key, unique_id } => {
                if let Some(records) = self.entries.get_mut(&key) {
                    records.retain(|r| r.unique_id != unique_id);
                    if records.is_empty() {
                        self.entries.remove(&key);
                    }
                }
                Vec::new()
            }
            SaEvent::SaUp { key, sa } => {
                let records = self.entries.entry(key.clone()).or_default();
                if !records.iter().any(|r| r.unique_id == sa.unique_id) {
                    records.push(sa);
                }
                if records.len() <= 1 {
                    return Vec::new();
                }
                if let Some(until) = self.rekey_until.get(&key) {
                    if now < *until {
                        debug!(?key, "duplicate SA inside rekey window, leaving alone");
                        return Vec::new();
                    }
                    self.rekey_until.remove(&key);
                }
                // Keep the youngest; reap everything older.
                let youngest = records
                    .iter()
                    .max_by(|a, b| {
                        a.established
                            .cmp(&b.established)
                            .then_with(|| a.unique_id.cmp(&b.unique_id))
                    })
                    .cloned()
                    .into_iter()
                    .collect::<Vec<_>>();
                let reap: Vec<SaRecord> = records
                    .iter()
                    .filter(|r| r.unique_id != youngest[0].unique_id)
                    .cloned()
                    .collect();
                *records = youngest;
                reap
            }
        }
    }

    /// Installed SAs for a key, youngest last.
    pub fn records(&self, key: &SaKey) -> &[SaRecord] {
        self.entries.get(key).map(Vec::as_slice).unwrap_or_default()
    }
}

/// How often a reap is retried before giving up.
const REAP_ATTEMPTS: u32 = 5;

/// Asynchronous monitor wrapping [`SaTable`].
pub struct SaMonitor {
    control: Arc<dyn IkeControl>,
    table: SaTable,
    /// Unique ids that could not be reaped; surfaced via status and
    /// left alone until the next event.
    failed_reaps: Vec<String>,
}

impl SaMonitor {
    pub fn new(control: Arc<dyn IkeControl>) -> Self {
        Self {
            control,
            table: SaTable::new(),
            failed_reaps: Vec::new(),
        }
    }

    pub fn failed_reaps(&self) -> &[String] {
        &self.failed_reaps
    }

    /// Consume events until the channel closes.
    pub async fn run(mut self, mut events: mpsc::Receiver<SaEvent>) {
        info!("SA monitor running");
        while let Some(event) = events.recv().await {
            self.handle(event).await;
        }
        info!("SA monitor stopping, event channel closed");
    }

    async fn handle(&mut self, event: SaEvent) {
        let reap = self.table.observe(event, Utc::now());
        for record in reap {
            if let Err(e) = self.reap(&record).await {
                let err = crate::error::Error::SaReapFailed {
                    unique_id: record.unique_id.clone(),
                    attempts: REAP_ATTEMPTS,
                };
                warn!(error = %err, cause = %e, "leaving SA alone until the next event");
                self.failed_reaps.push(record.unique_id.clone());
            }
        }
    }

    /// Terminate one SA with exponential backoff.
    async fn reap(&self, record: &SaRecord) -> Result<(), IkeError> {
        let mut delay = Duration::from_millis(200);
        let mut last = None;
        for attempt in 1..=REAP_ATTEMPTS {
            match self.control.terminate_sa(&record.unique_id).await {
                Ok(()) => {
                    info!(unique_id = %record.unique_id, "reaped duplicate SA");
                    return Ok(());
                }
                Err(e) => {
                    debug!(attempt, unique_id = %record.unique_id, error = %e, "SA reap failed");
                    last = Some(e);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
        Err(last.unwrap_or_else(|| IkeError::Unavailable("reap retries exhausted".into())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn key() -> SaKey {
        SaKey {
            local_id: "%any".to_string(),
            remote_id: "203.0.113.10".to_string(),
            if_id: 0xC0001000,
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn sa(id: &str, established_at: i64) -> SaRecord {
        SaRecord {
            unique_id: id.to_string(),
            established: at(established_at),
        }
    }

    #[test]
    fn single_sa_is_left_alone() {
        let mut table = SaTable::new();
        let reap = table.observe(
            SaEvent::SaUp {
                key: key(),
                sa: sa("1", 0),
            },
            at(1),
        );
        assert!(reap.is_empty());
        assert_eq!(table.records(&key()).len(), 1);
    }

    #[test]
    fn duplicate_outside_rekey_window_reaps_oldest() {
        let mut table = SaTable::new();
        table.observe(
            SaEvent::SaUp {
                key: key(),
                sa: sa("1", 0),
            },
            at(1),
        );
        let reap = table.observe(
            SaEvent::SaUp {
                key: key(),
                sa: sa("2", 10),
            },
            at(11),
        );
        assert_eq!(reap.len(), 1);
        assert_eq!(reap[0].unique_id, "1");
        // The youngest survives.
        let records = table.records(&key());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].unique_id, "2");
        assert_eq!(records[0].established, at(10));
    }

    #[test]
    fn duplicate_inside_rekey_window_survives() {
        let mut table = SaTable::new();
        table.observe(
            SaEvent::SaUp {
                key: key(),
                sa: sa("1", 0),
            },
            at(1),
        );
        table.observe(SaEvent::Rekey { key: key() }, at(5));
        let reap = table.observe(
            SaEvent::SaUp {
                key: key(),
                sa: sa("2", 6),
            },
            at(6),
        );
        assert!(reap.is_empty());
        assert_eq!(table.records(&key()).len(), 2);

        // Past the window, the next event resolves the duplicate.
        let reap = table.observe(
            SaEvent::SaUp {
                key: key(),
                sa: sa("3", 40),
            },
            at(40),
        );
        assert_eq!(reap.len(), 2);
        assert_eq!(table.records(&key()).len(), 1);
        assert_eq!(table.records(&key())[0].unique_id, "3");
    }

    #[test]
    fn sa_down_clears_records() {
        let mut table = SaTable::new();
        table.observe(
            SaEvent::SaUp {
                key: key(),
                sa: sa("1", 0),
            },
            at(1),
        );
        table.observe(
            SaEvent::SaDown {
                key: key(),
                unique_id: "1".to_string(),
            },
            at(2),
        );
        assert!(table.records(&key()).is_empty());
    }

    #[test]
    fn concurrent_child_updates_keep_youngest() {
        // Two CHILD updates for the same if_id in quick succession: the
        // survivor's creation time is the maximum of the two.
        let mut table = SaTable::new();
        table.observe(
            SaEvent::SaUp {
                key: key(),
                sa: sa("10", 100),
            },
            at(100),
        );
        let reap = table.observe(
            SaEvent::SaUp {
                key: key(),
                sa: sa("11", 101),
            },
            at(101),
        );
        assert_eq!(reap.len(), 1);
        assert_eq!(reap[0].unique_id, "10");
        let survivor = &table.records(&key())[0];
        assert_eq!(survivor.established, at(101));
    }
}

//! Per-variant request counters.
//!
//! Counting is in memory and never waits on storage. The table is written as
//! one object by [`RequestCounters::flush`]; counts bumped since the last
//! successful flush are lost on a crash.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};
use ulid::Ulid;

use crate::db::{CatalogBackend, Database};
use crate::error::Result;

use super::CatalogIndex;

pub struct RequestCounters {
    backend: Arc<dyn CatalogBackend>,
    counts: DashMap<Ulid, u64>,
    dirty: AtomicBool,
}

impl RequestCounters {
    pub async fn load(backend: Arc<dyn CatalogBackend>) -> Result<Self> {
        let counts: DashMap<Ulid, u64> = backend.load_counters().await?.into_iter().collect();
        debug!(variants = counts.len(), "loaded request counters");
        Ok(Self {
            backend,
            counts,
            dirty: AtomicBool::new(false),
        })
    }

    pub fn get(&self, id: &Ulid) -> u64 {
        self.counts.get(id).map(|c| *c).unwrap_or(0)
    }

    /// Bump the counter of one variant, returning the new value.
    pub fn increment(&self, id: Ulid) -> u64 {
        let count = {
            let mut entry = self.counts.entry(id).or_insert(0);
            *entry += 1;
            *entry
        };
        self.dirty.store(true, Ordering::SeqCst);
        count
    }

    /// Persist the counters of variants that still exist, dropping the rest.
    /// Returns the number of counters written, 0 when nothing changed.
    #[instrument(skip_all)]
    pub async fn flush(&self, db: &Database) -> Result<usize> {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(0);
        }

        let counts: HashMap<Ulid, u64> = self.counts.iter().map(|e| (*e.key(), *e.value())).collect();
        // taken after the counts, so every counted variant that still exists is in it
        let tables = db.snapshot();
        let live: HashSet<Ulid> = tables.items.values().flatten().map(|v| v.id).collect();

        let (kept, stale): (HashMap<Ulid, u64>, HashMap<Ulid, u64>) =
            counts.into_iter().partition(|(id, _)| live.contains(id));
        for id in stale.keys() {
            self.counts.remove(id);
        }

        if let Err(e) = self.backend.save_counters(&kept).await {
            self.dirty.store(true, Ordering::SeqCst);
            return Err(e);
        }
        debug!(written = kept.len(), dropped = stale.len(), "flushed request counters");
        Ok(kept.len())
    }
}

/// Flush request counters every `interval` until shutdown, then once more.
pub async fn flush_loop(
    catalog: Arc<CatalogIndex>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_secs = interval.as_secs(), "counter flush loop started");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = catalog.flush_counters().await {
                    warn!(error = %e, "request counter flush failed");
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    if let Err(e) = catalog.flush_counters().await {
        warn!(error = %e, "final request counter flush failed");
    }
    info!("counter flush loop stopped");
}

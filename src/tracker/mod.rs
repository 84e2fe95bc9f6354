//! Concurrent block activity tracker.
//!
//! Maps block addresses to [`BlockRecord`]s. Ingestion calls
//! [`Tracker::bump`] for every matching trace event while the control loop
//! calls [`Tracker::snapshot_into`] and [`Tracker::age_tick`] once per frame.
//!
//! All access to the index goes through a single mutex that is held for one
//! operation at a time. The aging sweep re-acquires it per record, so a burst
//! of bumps never waits behind more than one record's worth of aging work.

mod slab;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::config::TrackerConfig;

use self::slab::{Slab, SlotId};

/// Records copied per lock acquisition while taking a render snapshot.
const SNAPSHOT_CHUNK: usize = 256;

/// Activity record for one block address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRecord {
    pub address: u64,
    /// Capped activity accumulator.
    pub weight: u32,
    /// Remaining aging ticks before eviction.
    pub ttl: u32,
}

/// The part of a record the heatmap needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordView {
    pub address: u64,
    pub weight: u32,
}

/// Result of a single [`Tracker::bump`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BumpOutcome {
    Created,
    Updated,
    /// No room for a new record; the event was discarded.
    Dropped,
}

/// Summary of one aging sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AgeReport {
    pub visited: usize,
    pub evicted: usize,
    pub live: usize,
}

/// Cumulative tracker counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerStats {
    pub created: u64,
    pub evicted: u64,
    pub dropped: u64,
}

struct Inner {
    index: HashMap<u64, SlotId>,
    slab: Slab,
}

/// Thread-safe store of live block activity records.
pub struct Tracker {
    cfg: TrackerConfig,
    inner: Mutex<Inner>,
    /// Serializes sweeps and snapshot walks. Bumps never take it, and only
    /// sweeps remove slots, so a walker's cursor stays valid while held.
    walk: Mutex<()>,
    created: AtomicU64,
    evicted: AtomicU64,
    dropped: AtomicU64,
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracker")
            .field("live", &self.len())
            .field("max_ttl", &self.cfg.max_ttl)
            .field("max_weight", &self.cfg.max_weight)
            .finish()
    }
}

impl Tracker {
    /// Create an empty tracker. `cfg` is expected to be validated.
    pub fn new(cfg: TrackerConfig) -> Self {
        let capacity = cfg.capacity;
        Self {
            cfg,
            inner: Mutex::new(Inner {
                index: HashMap::with_capacity(capacity),
                slab: Slab::with_capacity(capacity),
            }),
            walk: Mutex::new(()),
            created: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.cfg
    }

    /// Record activity at `address`.
    pub fn bump(&self, address: u64) -> BumpOutcome {
        let mut inner = self.inner.lock();
        let Inner { index, slab } = &mut *inner;

        if let Some(&id) = index.get(&address) {
            if let Some(record) = slab.get_mut(id) {
                record.weight = record
                    .weight
                    .saturating_add(1)
                    .min(self.cfg.max_weight);
                record.ttl = self.cfg.max_ttl;
                return BumpOutcome::Updated;
            }
        }

        if self.cfg.max_records != 0 && slab.len() >= self.cfg.max_records {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return BumpOutcome::Dropped;
        }

        if index.try_reserve(1).is_err() || slab.try_reserve_one().is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return BumpOutcome::Dropped;
        }

        let id = slab.insert_front(BlockRecord {
            address,
            weight: self.cfg.initial_weight.min(self.cfg.max_weight),
            ttl: self.cfg.max_ttl,
        });
        index.insert(address, id);
        self.created.fetch_add(1, Ordering::Relaxed);

        BumpOutcome::Created
    }

    /// Decrement every live record's ttl and evict the expired ones.
    ///
    /// Records created while the sweep runs are inserted ahead of its cursor
    /// and are first aged on the next sweep.
    pub fn age_tick(&self) -> AgeReport {
        let _walk = self.walk.lock();
        let mut report = AgeReport::default();

        let mut cursor = self.inner.lock().slab.head();
        while let Some(id) = cursor {
            let mut inner = self.inner.lock();
            let Inner { index, slab } = &mut *inner;

            cursor = slab.next(id);
            let Some(record) = slab.get_mut(id) else {
                break;
            };
            report.visited += 1;

            record.ttl = record.ttl.saturating_sub(self.cfg.age_step);
            record.weight = record.weight.saturating_sub(self.cfg.weight_decay);
            if record.ttl == 0 {
                let address = record.address;
                slab.remove(id);
                index.remove(&address);
                report.evicted += 1;
            }
        }

        report.live = self.len();
        if report.evicted > 0 {
            self.evicted
                .fetch_add(report.evicted as u64, Ordering::Relaxed);
        }

        report
    }

    /// Copy `(address, weight)` of every live record.
    pub fn snapshot_for_render(&self) -> Vec<RecordView> {
        let mut out = Vec::with_capacity(self.len());
        self.snapshot_into(&mut out);
        out
    }

    /// Like [`Tracker::snapshot_for_render`], reusing `out`'s allocation.
    ///
    /// The lock is released every [`SNAPSHOT_CHUNK`] records, so the result is
    /// not a point-in-time view: records created mid-walk may be missing.
    pub fn snapshot_into(&self, out: &mut Vec<RecordView>) {
        out.clear();
        let _walk = self.walk.lock();

        let mut cursor = self.inner.lock().slab.head();
        while cursor.is_some() {
            let inner = self.inner.lock();
            for _ in 0..SNAPSHOT_CHUNK {
                let Some(id) = cursor else { break };
                let Some(record) = inner.slab.get(id) else {
                    cursor = None;
                    break;
                };
                out.push(RecordView {
                    address: record.address,
                    weight: record.weight,
                });
                cursor = inner.slab.next(id);
            }
        }
    }

    /// Current record for `address`, if live.
    pub fn get(&self, address: u64) -> Option<BlockRecord> {
        let inner = self.inner.lock();
        let id = inner.index.get(&address)?;
        inner.slab.get(*id).copied()
    }

    /// Full copy of all live records in sweep order, taken under one lock.
    pub fn records(&self) -> Vec<BlockRecord> {
        let inner = self.inner.lock();
        inner.slab.iter().copied().collect()
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.inner.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> TrackerStats {
        TrackerStats {
            created: self.created.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

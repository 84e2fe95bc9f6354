use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// What happened to one trace line on its way to the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum Outcome {
    /// Event for the monitored device, bumped into the tracker.
    Matched = 0,
    /// Valid block event for another device.
    ForeignDevice = 1,
    /// Line that did not parse as a block event.
    Malformed = 2,
    /// Matched event the tracker had no room for.
    Dropped = 3,
}

impl Outcome {
    const COUNT: usize = 4;

    pub const ALL: [Outcome; Self::COUNT] = [
        Outcome::Matched,
        Outcome::ForeignDevice,
        Outcome::Malformed,
        Outcome::Dropped,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Outcome::Matched => "matched",
            Outcome::ForeignDevice => "foreign_device",
            Outcome::Malformed => "malformed",
            Outcome::Dropped => "dropped",
        }
    }
}

/// Counters read and reset by [`EventStats::snapshot`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub matched: u64,
    pub foreign_device: u64,
    pub malformed: u64,
    pub dropped: u64,
    /// Parsed events per tracepoint name, sorted by name.
    pub by_event: Vec<(String, u64)>,
}

impl StatsSnapshot {
    pub fn total(&self) -> u64 {
        self.matched + self.foreign_device + self.malformed + self.dropped
    }
}

/// Lock-free ingest counters.
///
/// Outcome counters are plain atomics. Per-event-name counters live in a
/// `DashMap` so a new tracepoint name is only allocated the first time it is
/// seen.
pub struct EventStats {
    outcomes: [AtomicU64; Outcome::COUNT],
    by_event: DashMap<String, AtomicU64>,
}

impl EventStats {
    pub fn new() -> Self {
        Self {
            outcomes: std::array::from_fn(|_| AtomicU64::new(0)),
            by_event: DashMap::new(),
        }
    }

    /// Count one line with the given outcome.
    pub fn record(&self, outcome: Outcome) {
        self.outcomes[outcome as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Count one parsed event by tracepoint name.
    pub fn record_event(&self, name: &str) {
        if let Some(counter) = self.by_event.get(name) {
            counter.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.by_event
            .entry(name.to_string())
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Current value of one outcome counter without resetting it.
    pub fn get(&self, outcome: Outcome) -> u64 {
        self.outcomes[outcome as usize].load(Ordering::Relaxed)
    }

    /// Atomically read and reset all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        let take = |o: Outcome| self.outcomes[o as usize].swap(0, Ordering::Relaxed);

        let mut by_event: Vec<(String, u64)> = self
            .by_event
            .iter()
            .filter_map(|entry| {
                let v = entry.value().swap(0, Ordering::Relaxed);
                (v > 0).then(|| (entry.key().clone(), v))
            })
            .collect();
        by_event.sort_unstable_by(|a, b| a.0.cmp(&b.0));

        StatsSnapshot {
            matched: take(Outcome::Matched),
            foreign_device: take(Outcome::ForeignDevice),
            malformed: take(Outcome::Malformed),
            dropped: take(Outcome::Dropped),
            by_event,
        }
    }
}

impl Default for EventStats {
    fn default() -> Self {
        Self::new()
    }
}

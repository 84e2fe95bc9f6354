use std::sync::Arc;

use prometheus::Counter;

use crate::device::DeviceDescriptor;
use crate::export::health::HealthMetrics;
use crate::tracer::event::{AddressUnit, TraceEvent};
use crate::tracer::stats::{EventStats, Outcome};
use crate::tracer::TracerError;
use crate::tracker::{BumpOutcome, Tracker};

/// Routes parsed trace events for the monitored device into the tracker.
pub struct Ingest {
    device: DeviceDescriptor,
    tracker: Arc<Tracker>,
    stats: Arc<EventStats>,
    health: Option<IngestCounters>,
}

/// Prometheus handles resolved once so the hot path skips label lookups.
struct IngestCounters {
    metrics: Arc<HealthMetrics>,
    outcomes: Vec<Counter>,
}

impl Ingest {
    pub fn new(
        device: DeviceDescriptor,
        tracker: Arc<Tracker>,
        stats: Arc<EventStats>,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        let health = health.map(|metrics| IngestCounters {
            outcomes: Outcome::ALL
                .iter()
                .map(|o| metrics.outcome_counter(*o))
                .collect(),
            metrics,
        });

        Self {
            device,
            tracker,
            stats,
            health,
        }
    }

    /// Handle one parsed event.
    pub fn handle(&self, event: TraceEvent<'_>) -> Outcome {
        self.stats.record_event(event.name);
        if let Some(h) = &self.health {
            h.metrics.events_received.inc();
            h.metrics
                .events_by_type
                .with_label_values(&[event.name])
                .inc();
        }

        let outcome = if event.device != self.device.id {
            Outcome::ForeignDevice
        } else {
            let block = match event.unit {
                AddressUnit::Block => event.address,
                AddressUnit::Sector => self.device.sector_to_block(event.address),
            };
            match self.tracker.bump(block) {
                BumpOutcome::Dropped => Outcome::Dropped,
                BumpOutcome::Created | BumpOutcome::Updated => Outcome::Matched,
            }
        };

        self.record(outcome);
        outcome
    }

    /// Handle a tracer error. Unparseable lines are counted; I/O errors are
    /// logged by the tracer itself.
    pub fn handle_error(&self, err: &TracerError) {
        if let TracerError::Parse(_) = err {
            if let Some(h) = &self.health {
                h.metrics.events_received.inc();
            }
            self.record(Outcome::Malformed);
        }
    }

    fn record(&self, outcome: Outcome) {
        self.stats.record(outcome);
        if let Some(counter) = self
            .health
            .as_ref()
            .and_then(|h| h.outcomes.get(outcome as usize))
        {
            counter.inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackerConfig;
    use crate::device::DeviceId;
    use crate::tracer::parse::{parse_line, ParseError};

    fn setup(health: Option<Arc<HealthMetrics>>) -> (Ingest, Arc<Tracker>, Arc<EventStats>) {
        let device = DeviceDescriptor::new(DeviceId::new(8, 3), 4096, 1_000_000);
        let tracker = Arc::new(Tracker::new(TrackerConfig::default()));
        let stats = Arc::new(EventStats::new());
        let ingest = Ingest::new(device, Arc::clone(&tracker), Arc::clone(&stats), health);
        (ingest, tracker, stats)
    }

    fn event(device: DeviceId, address: u64, unit: AddressUnit) -> TraceEvent<'static> {
        TraceEvent {
            name: "block_rq_issue",
            device,
            address,
            unit,
        }
    }

    #[test]
    fn test_block_address_bumped_as_is() {
        let (ingest, tracker, _) = setup(None);
        let outcome = ingest.handle(event(DeviceId::new(8, 3), 42, AddressUnit::Block));

        assert_eq!(outcome, Outcome::Matched);
        assert!(tracker.get(42).is_some());
    }

    #[test]
    fn test_sector_address_converted_to_block() {
        let (ingest, tracker, _) = setup(None);
        ingest.handle(event(DeviceId::new(8, 3), 800, AddressUnit::Sector));

        assert!(tracker.get(100).is_some());
        assert!(tracker.get(800).is_none());
    }

    #[test]
    fn test_foreign_device_ignored() {
        let (ingest, tracker, stats) = setup(None);
        let outcome = ingest.handle(event(DeviceId::new(8, 0), 42, AddressUnit::Block));

        assert_eq!(outcome, Outcome::ForeignDevice);
        assert!(tracker.is_empty());
        assert_eq!(stats.get(Outcome::ForeignDevice), 1);
    }

    #[test]
    fn test_full_tracker_counts_dropped() {
        let device = DeviceDescriptor::new(DeviceId::new(8, 3), 4096, 1000);
        let tracker = Arc::new(Tracker::new(TrackerConfig {
            max_records: 1,
            ..TrackerConfig::default()
        }));
        let stats = Arc::new(EventStats::new());
        let ingest = Ingest::new(device, Arc::clone(&tracker), Arc::clone(&stats), None);

        assert_eq!(ingest.handle(event(device.id, 1, AddressUnit::Block)), Outcome::Matched);
        assert_eq!(ingest.handle(event(device.id, 2, AddressUnit::Block)), Outcome::Dropped);
        assert_eq!(stats.get(Outcome::Dropped), 1);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_parse_errors_counted_malformed() {
        let (ingest, _, stats) = setup(None);
        ingest.handle_error(&TracerError::Parse(ParseError::NotARecord));
        ingest.handle_error(&TracerError::Io(std::io::Error::other("boom")));

        let snap = stats.snapshot();
        assert_eq!(snap.malformed, 1);
        assert_eq!(snap.total(), 1);
    }

    #[test]
    fn test_health_counters_updated() {
        let health = Arc::new(HealthMetrics::new("127.0.0.1:0").expect("metrics"));
        let (ingest, _, _) = setup(Some(Arc::clone(&health)));

        let line = "  task-1 [000] .... 1.0: block_dirty_buffer: 8,3 sector=7 size=4096";
        ingest.handle(parse_line(line).expect("parse"));
        ingest.handle_error(&TracerError::Parse(ParseError::NotARecord));

        assert_eq!(health.events_received.get(), 2.0);
        assert_eq!(health.outcome_counter(Outcome::Matched).get(), 1.0);
        assert_eq!(health.outcome_counter(Outcome::Malformed).get(), 1.0);
        assert_eq!(
            health
                .events_by_type
                .with_label_values(&["block_dirty_buffer"])
                .get(),
            1.0
        );
    }
}

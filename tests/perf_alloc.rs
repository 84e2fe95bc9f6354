use std::alloc::System;
use std::hint::black_box;
use std::sync::Arc;

use blockmon::config::TrackerConfig;
use blockmon::device::{DeviceDescriptor, DeviceId};
use blockmon::heatmap::{GridSize, Projector};
use blockmon::monitor::ingest::Ingest;
use blockmon::tracer::parse::parse_line;
use blockmon::tracer::stats::{EventStats, Outcome};
use blockmon::tracer::TracerError;
use blockmon::tracker::{RecordView, Tracker};
use serial_test::serial;
use stats_alloc::{Region, StatsAlloc, INSTRUMENTED_SYSTEM};

#[global_allocator]
static GLOBAL: &StatsAlloc<System> = &INSTRUMENTED_SYSTEM;

const DIRTY_BUFFER: &str =
    "  jbd2/sda3-8-629   [001] .... 64723.852280: block_dirty_buffer: 8,3 sector=38797433 size=4096";
const PLUG: &str = "   kworker/0:1H-200 [000] .... 55.0: block_plug: [kworker/0:1H]";
const UNPLUG: &str = "   kworker/0:1H-200 [000] .... 55.1: block_unplug: [kworker/0:1H] 1";
const BAD_ADDRESS: &str =
    "   task-1 [000] .... 55.2: block_dirty_buffer: 8,3 sector=abc size=4096";
const RQ_ISSUE: &str =
    "  kworker/u16:2-1234  [002] d..1. 1201.000001: block_rq_issue: 8,3 WS 4096 () 2048 + 8 [kworker/u16:2]";

fn measure_alloc_counts<T>(f: impl FnOnce() -> T) -> (T, usize, usize) {
    // Calibrate for ambient allocator activity in the test harness process.
    let idle_region = Region::new(&GLOBAL);
    black_box(());
    let idle = idle_region.change();

    let region = Region::new(&GLOBAL);
    let output = f();
    let used = region.change();

    let allocations = used.allocations.saturating_sub(idle.allocations);
    let deallocations = used.deallocations.saturating_sub(idle.deallocations);
    (output, allocations, deallocations)
}

fn populated_tracker(records: u64) -> Tracker {
    let tracker = Tracker::new(TrackerConfig::default());
    for address in 0..records {
        tracker.bump(address * 3);
    }
    tracker
}

#[test]
#[serial]
fn parse_line_allocates_zero() {
    let (_, allocations, deallocations) = measure_alloc_counts(|| {
        for _ in 0..256 {
            black_box(parse_line(black_box(DIRTY_BUFFER)).expect("parse dirty buffer"));
            black_box(parse_line(black_box(RQ_ISSUE)).expect("parse rq issue"));
        }
    });

    assert_eq!(allocations, 0, "parse allocated {allocations} times");
    assert_eq!(deallocations, 0);
}

#[test]
#[serial]
fn rejected_lines_allocate_zero() {
    let tracker = Arc::new(Tracker::new(TrackerConfig::default()));
    let stats = Arc::new(EventStats::new());
    let device = DeviceDescriptor::new(DeviceId::new(8, 3), 4096, 1 << 30);
    let ingest = Ingest::new(device, tracker, Arc::clone(&stats), None);

    let (_, allocations, deallocations) = measure_alloc_counts(|| {
        for _ in 0..256 {
            for line in [PLUG, UNPLUG, BAD_ADDRESS, "# tracer: nop"] {
                let err = parse_line(black_box(line)).expect_err("rejected line");
                ingest.handle_error(&TracerError::Parse(err));
            }
        }
    });

    assert_eq!(allocations, 0, "rejecting lines allocated {allocations} times");
    assert_eq!(deallocations, 0);
    assert_eq!(stats.get(Outcome::Malformed), 1_024);
}

#[test]
#[serial]
fn bump_existing_address_allocates_zero() {
    let tracker = populated_tracker(1_024);

    let (_, allocations, _) = measure_alloc_counts(|| {
        for i in 0..10_000u64 {
            black_box(tracker.bump((i % 1_024) * 3));
        }
    });

    assert_eq!(allocations, 0, "bump of live addresses allocated {allocations} times");
}

#[test]
#[serial]
fn ingest_matched_event_allocates_zero() {
    let tracker = Arc::new(Tracker::new(TrackerConfig::default()));
    let stats = Arc::new(EventStats::new());
    let device = DeviceDescriptor::new(DeviceId::new(8, 3), 4096, 1 << 30);
    let ingest = Ingest::new(device, Arc::clone(&tracker), stats, None);

    // First sight of each address and event name may allocate.
    let event = parse_line(DIRTY_BUFFER).expect("parse");
    ingest.handle(event);

    let (_, allocations, _) = measure_alloc_counts(|| {
        for _ in 0..1_000 {
            black_box(ingest.handle(event));
        }
    });

    assert_eq!(allocations, 0, "steady-state ingest allocated {allocations} times");
}

#[test]
#[serial]
fn snapshot_into_reused_buffer_allocates_zero() {
    let tracker = populated_tracker(4_096);
    let mut buf: Vec<RecordView> = Vec::with_capacity(4_096);

    let (_, allocations, _) = measure_alloc_counts(|| {
        for _ in 0..16 {
            tracker.snapshot_into(&mut buf);
            black_box(buf.len());
        }
    });

    assert_eq!(buf.len(), 4_096);
    assert_eq!(allocations, 0, "snapshot allocated {allocations} times");
}

#[test]
#[serial]
fn age_tick_without_evictions_allocates_zero() {
    let tracker = populated_tracker(4_096);

    let (_, allocations, deallocations) = measure_alloc_counts(|| {
        for _ in 0..8 {
            black_box(tracker.age_tick());
        }
    });

    assert_eq!(tracker.len(), 4_096);
    assert_eq!(allocations, 0, "aging allocated {allocations} times");
    assert_eq!(deallocations, 0);
}

#[test]
#[serial]
fn project_allocation_budget() {
    let tracker = populated_tracker(4_096);
    let records = tracker.snapshot_for_render();
    let mut projector = Projector::new(5);
    let size = GridSize::new(200, 50);

    // Warm the accumulation buffer.
    black_box(projector.project(&records, 20_000, size));

    let (_, allocations, _) = measure_alloc_counts(|| {
        black_box(projector.project(&records, 20_000, size));
    });

    // Only the tier vector of the returned frame.
    assert!(
        allocations <= 1,
        "projection allocation budget exceeded: {}",
        allocations
    );
}

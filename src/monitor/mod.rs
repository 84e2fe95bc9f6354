pub mod ingest;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::device::DeviceDescriptor;
use crate::export::health::HealthMetrics;
use crate::tracer::event::TraceEvent;
use crate::tracer::pipe::{TracePipeTracer, TracingSwitch};
use crate::tracer::stats::EventStats;
use crate::tracer::{ReaderExit, Tracer, TracerError};
use crate::tracker::Tracker;

use self::ingest::Ingest;

/// Monitor owns everything that outlives a single frame: configuration, the
/// device descriptor, the tracker, counters, and the ingestion task.
pub struct Monitor {
    cfg: Config,
    device: DeviceDescriptor,
    tracker: Arc<Tracker>,
    stats: Arc<EventStats>,
    health: Option<Arc<HealthMetrics>>,
    tracer: Option<TracePipeTracer>,
    switch: Option<TracingSwitch>,
    reporter: Option<tokio::task::JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Monitor {
    /// Creates a new monitor for `device`. Nothing is started yet.
    pub fn new(cfg: Config, device: DeviceDescriptor) -> Result<Self> {
        let health = if cfg.health.addr.is_empty() {
            None
        } else {
            Some(Arc::new(
                HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?,
            ))
        };

        let tracker = Arc::new(Tracker::new(cfg.tracker.clone()));

        Ok(Self {
            cfg,
            device,
            tracker,
            stats: Arc::new(EventStats::new()),
            health,
            tracer: None,
            switch: None,
            reporter: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Start the health server, enable block tracing and begin ingestion.
    pub async fn start(&mut self) -> Result<()> {
        if let Some(health) = &self.health {
            health
                .start()
                .await
                .context("starting health metrics server")?;
        }

        if self.cfg.trace.manage_events {
            let switch = TracingSwitch::new(self.cfg.block_enable_path());
            if switch.enable() {
                info!("block tracing enabled");
            }
            self.switch = Some(switch);
        }

        let mut tracer = TracePipeTracer::new(self.cfg.trace_pipe_path());

        let ingest = Arc::new(Ingest::new(
            self.device,
            Arc::clone(&self.tracker),
            Arc::clone(&self.stats),
            self.health.as_ref().map(Arc::clone),
        ));
        let ingest_ev = Arc::clone(&ingest);
        tracer.on_event(Box::new(move |event: TraceEvent<'_>| {
            ingest_ev.handle(event);
        }));
        tracer.on_error(Box::new(move |err: &TracerError| {
            ingest.handle_error(err);
        }));

        tracer
            .start(self.cancel.child_token())
            .await
            .context("starting trace pipe tracer")?;
        self.tracer = Some(tracer);

        self.reporter = Some(self.spawn_event_stats_reporter());

        info!(
            device = %self.device.id,
            block_size = self.device.block_size,
            blocks = self.device.total_blocks,
            "monitor started",
        );

        Ok(())
    }

    /// Cancel ingestion, wait for it to finish and undo side effects.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        if let Some(mut tracer) = self.tracer.take() {
            if let Err(e) = tracer.stop().await {
                error!(error = %e, "error stopping tracer");
            }
        }

        if let Some(reporter) = self.reporter.take() {
            if let Err(e) = reporter.await {
                error!(error = %e, "event stats reporter failed");
            }
        }

        if let Some(switch) = self.switch.take() {
            if switch.disable() {
                info!("block tracing disabled");
            }
        }

        if let Some(health) = &self.health {
            health.stop().await?;
        }

        let stats = self.tracker.stats();
        info!(
            created = stats.created,
            evicted = stats.evicted,
            dropped = stats.dropped,
            "monitor stopped",
        );

        Ok(())
    }

    /// True once the ingestion task has exited for any reason.
    pub fn ingestion_finished(&self) -> bool {
        self.ingestion_exit().is_some()
    }

    /// Why the ingestion task exited, or `None` while it runs or before start.
    pub fn ingestion_exit(&self) -> Option<ReaderExit> {
        self.tracer.as_ref().and_then(Tracer::exit)
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn device(&self) -> &DeviceDescriptor {
        &self.device
    }

    pub fn tracker(&self) -> &Arc<Tracker> {
        &self.tracker
    }

    pub fn stats(&self) -> &Arc<EventStats> {
        &self.stats
    }

    pub fn health(&self) -> Option<&Arc<HealthMetrics>> {
        self.health.as_ref()
    }

    /// Root cancellation token; cancelling it ends ingestion and the UI loop.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawn background event stats reporter.
    fn spawn_event_stats_reporter(&self) -> tokio::task::JoinHandle<()> {
        let cancel = self.cancel.clone();
        let stats = Arc::clone(&self.stats);
        let tracker = Arc::clone(&self.tracker);
        let interval = self.cfg.stats_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let snapshot = stats.snapshot();
                        if snapshot.total() == 0 {
                            continue;
                        }

                        info!(
                            matched = snapshot.matched,
                            foreign_device = snapshot.foreign_device,
                            malformed = snapshot.malformed,
                            dropped = snapshot.dropped,
                            live = tracker.len(),
                            interval = %humantime::format_duration(interval),
                            "event stats",
                        );

                        for (event, count) in &snapshot.by_event {
                            debug!(event = %event, count, "  by event");
                        }
                    }
                }
            }
        })
    }
}

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Highest supported number of intensity tiers (including tier 0).
pub const MAX_TIERS: u8 = 8;

/// Top-level configuration for blockmon.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging filter (trace, debug, info, warn, error or an EnvFilter directive). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// File receiving log output. The terminal belongs to the UI, so logs are
    /// discarded when unset.
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Any path on the filesystem whose block device should be monitored. Default: ".".
    #[serde(default = "default_device_path")]
    pub device_path: PathBuf,

    /// Delay between screen refreshes (and aging ticks). Default: 15ms.
    #[serde(default = "default_refresh_delay", with = "humantime_serde")]
    pub refresh_delay: Duration,

    /// Refuse to start unless running as root. Default: true.
    #[serde(default = "default_true")]
    pub require_root: bool,

    /// How often ingest statistics are logged. Default: 60s.
    #[serde(default = "default_stats_interval", with = "humantime_serde")]
    pub stats_interval: Duration,

    /// Kernel tracing facility configuration.
    #[serde(default)]
    pub trace: TraceConfig,

    /// Block activity tracker configuration.
    #[serde(default)]
    pub tracker: TrackerConfig,

    /// Heatmap projection and layout configuration.
    #[serde(default)]
    pub heatmap: HeatmapConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Kernel tracing facility configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TraceConfig {
    /// tracefs mount point. Default: "/sys/kernel/debug/tracing".
    #[serde(default = "default_trace_root")]
    pub root: PathBuf,

    /// Enable block tracepoints on start and disable them on exit. Default: true.
    #[serde(default = "default_true")]
    pub manage_events: bool,
}

/// Block activity tracker configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TrackerConfig {
    /// Weight assigned to a newly created record. Default: 1.
    #[serde(default = "default_initial_weight")]
    pub initial_weight: u32,

    /// Saturation cap for a record's weight. Default: 65535.
    #[serde(default = "default_max_weight")]
    pub max_weight: u32,

    /// Ticks a record survives without activity. Default: 64.
    #[serde(default = "default_max_ttl")]
    pub max_ttl: u32,

    /// Amount subtracted from every ttl per aging tick. Default: 1.
    #[serde(default = "default_age_step")]
    pub age_step: u32,

    /// Amount subtracted from every weight per aging tick. Default: 0 (no decay).
    #[serde(default)]
    pub weight_decay: u32,

    /// Upper bound on live records; new addresses are dropped beyond it. 0 = unbounded.
    #[serde(default)]
    pub max_records: usize,

    /// Initial index capacity. Default: 4096.
    #[serde(default = "default_tracker_capacity")]
    pub capacity: usize,
}

/// Heatmap projection and layout configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HeatmapConfig {
    /// Number of intensity tiers including the empty tier. Default: 5.
    #[serde(default = "default_tiers")]
    pub tiers: u8,

    /// Narrowest usable window; smaller windows show a placeholder. Default: 80.
    #[serde(default = "default_min_width")]
    pub min_width: u16,

    /// Shortest usable window; smaller windows show a placeholder. Default: 23.
    #[serde(default = "default_min_height")]
    pub min_height: u16,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HealthConfig {
    /// Listen address (e.g. ":9090"). Empty disables the server. Default: "".
    #[serde(default)]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_device_path() -> PathBuf {
    PathBuf::from(".")
}

fn default_refresh_delay() -> Duration {
    Duration::from_millis(15)
}

fn default_stats_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_true() -> bool {
    true
}

fn default_trace_root() -> PathBuf {
    PathBuf::from("/sys/kernel/debug/tracing")
}

fn default_initial_weight() -> u32 {
    1
}

fn default_max_weight() -> u32 {
    65_535
}

fn default_max_ttl() -> u32 {
    64
}

fn default_age_step() -> u32 {
    1
}

fn default_tracker_capacity() -> usize {
    4096
}

fn default_tiers() -> u8 {
    5
}

fn default_min_width() -> u16 {
    80
}

fn default_min_height() -> u16 {
    23
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_file: None,
            device_path: default_device_path(),
            refresh_delay: default_refresh_delay(),
            require_root: true,
            stats_interval: default_stats_interval(),
            trace: TraceConfig::default(),
            tracker: TrackerConfig::default(),
            heatmap: HeatmapConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            root: default_trace_root(),
            manage_events: true,
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            initial_weight: default_initial_weight(),
            max_weight: default_max_weight(),
            max_ttl: default_max_ttl(),
            age_step: default_age_step(),
            weight_decay: 0,
            max_records: 0,
            capacity: default_tracker_capacity(),
        }
    }
}

impl Default for HeatmapConfig {
    fn default() -> Self {
        Self {
            tiers: default_tiers(),
            min_width: default_min_width(),
            min_height: default_min_height(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.refresh_delay.is_zero() {
            bail!("refresh_delay must be positive");
        }

        if self.stats_interval.is_zero() {
            bail!("stats_interval must be positive");
        }

        if self.device_path.as_os_str().is_empty() {
            bail!("device_path is required");
        }

        if self.trace.root.as_os_str().is_empty() {
            bail!("trace.root is required");
        }

        self.tracker.validate().context("invalid tracker config")?;

        let tiers = self.heatmap.tiers;
        if !(2..=MAX_TIERS).contains(&tiers) {
            bail!("heatmap.tiers must be between 2 and {MAX_TIERS}, got {tiers}");
        }

        if self.heatmap.min_height < 3 {
            bail!("heatmap.min_height must leave room for header and legend (>= 3)");
        }

        if self.heatmap.min_width == 0 {
            bail!("heatmap.min_width must be positive");
        }

        Ok(())
    }

    /// The trace pipe inside the configured tracefs mount.
    pub fn trace_pipe_path(&self) -> PathBuf {
        self.trace.root.join("trace_pipe")
    }

    /// The block event enable switch inside the configured tracefs mount.
    pub fn block_enable_path(&self) -> PathBuf {
        self.trace.root.join("events/block/enable")
    }
}

impl TrackerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_ttl == 0 {
            bail!("max_ttl must be positive");
        }

        if self.age_step == 0 {
            bail!("age_step must be positive");
        }

        if self.max_weight == 0 {
            bail!("max_weight must be positive");
        }

        if self.initial_weight > self.max_weight {
            bail!(
                "initial_weight {} exceeds max_weight {}",
                self.initial_weight,
                self.max_weight
            );
        }

        Ok(())
    }
}

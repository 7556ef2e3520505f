use crate::error::AppError;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variables with this prefix override file settings,
/// e.g. `CODEGRAB__SCAN__SCAN_INTERVAL=50`.
pub const ENV_PREFIX: &str = "CODEGRAB";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub log_level: String,
    pub scan: ScanSettings,
    pub pool: PoolSettings,
    pub predictor: PredictorSettings,
    pub decode: DecodeSettings,
    pub submission: SubmissionSettings,
    pub api: ApiSettings,
    pub source: SourceSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            scan: ScanSettings::default(),
            pool: PoolSettings::default(),
            predictor: PredictorSettings::default(),
            decode: DecodeSettings::default(),
            submission: SubmissionSettings::default(),
            api: ApiSettings::default(),
            source: SourceSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    /// Milliseconds between capture ticks.
    #[serde(alias = "scan_interval")]
    pub scan_interval_ms: u64,
    /// Keep scanning after a code ends in a terminal failure.
    pub auto_retry: bool,
    pub thread_pool_enabled: bool,
    pub max_workers: usize,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            scan_interval_ms: 100,
            auto_retry: true,
            thread_pool_enabled: false,
            max_workers: default_workers(),
        }
    }
}

impl ScanSettings {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    /// Upper bound on concurrent decode workers after the pool toggle is applied.
    pub fn worker_limit(&self) -> usize {
        if self.thread_pool_enabled {
            self.max_workers.max(1)
        } else {
            1
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub capacity: usize,
    /// Frame sizes (width, height) allocated up front.
    pub prewarm: Vec<(u32, u32)>,
    pub exhaustion_warn_after_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            capacity: 5,
            prewarm: vec![(1280, 720), (800, 800)],
            exhaustion_warn_after_ms: 500,
        }
    }
}

impl PoolSettings {
    pub fn exhaustion_warn_after(&self) -> Duration {
        Duration::from_millis(self.exhaustion_warn_after_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PredictorSettings {
    /// Position gain of the alpha-beta filter.
    pub alpha: f32,
    /// Velocity gain of the alpha-beta filter.
    pub beta: f32,
    /// Padding added on each side of the last known size, as a fraction of that size.
    pub margin: f32,
    /// Consecutive misses after which the whole frame is searched.
    pub max_misses: u32,
}

impl Default for PredictorSettings {
    fn default() -> Self {
        Self {
            alpha: 0.6,
            beta: 0.2,
            margin: 0.5,
            max_misses: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DecodeSettings {
    /// Payloads without this substring are ignored.
    pub payload_marker: Option<String>,
    /// Directory holding `enhance.json`.
    pub model_dir: PathBuf,
    pub enhance_max_side: u32,
    pub enhance_min_contrast: u8,
    pub enhance_min_sharpness: f32,
    pub adaptive_block_radius: u32,
}

impl Default for DecodeSettings {
    fn default() -> Self {
        Self {
            payload_marker: Some("KURO".to_string()),
            model_dir: PathBuf::from("models"),
            enhance_max_side: 480,
            enhance_min_contrast: 64,
            enhance_min_sharpness: 32.0,
            adaptive_block_radius: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SubmissionSettings {
    /// Waits between attempts; one more attempt than entries is made.
    pub backoff_ms: Vec<u64>,
    pub jitter_ms: u64,
    pub attempt_timeout_ms: u64,
    /// Terminal tickets remembered before the oldest are forgotten.
    pub history_limit: usize,
}

impl Default for SubmissionSettings {
    fn default() -> Self {
        Self {
            backoff_ms: vec![600, 1200, 2000],
            jitter_ms: 0,
            attempt_timeout_ms: 3000,
            history_limit: 256,
        }
    }
}

impl SubmissionSettings {
    pub fn backoff(&self) -> Vec<Duration> {
        self.backoff_ms
            .iter()
            .copied()
            .map(Duration::from_millis)
            .collect()
    }

    pub fn jitter(&self) -> Duration {
        Duration::from_millis(self.jitter_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    pub base_url: String,
    pub token: String,
    pub dev_code: String,
    pub app_version: String,
    pub auto_login: bool,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.kurobbs.com".to_string(),
            token: String::new(),
            dev_code: String::new(),
            app_version: "2.5.0".to_string(),
            auto_login: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    /// Scan every Nth decoded stream picture.
    pub frame_stride: u32,
    pub queue_depth: usize,
    pub stall_warn_after_ms: u64,
    pub replay_dir: PathBuf,
    pub replay_fps: u32,
    pub replay_loop: bool,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            frame_stride: 5,
            queue_depth: 8,
            stall_warn_after_ms: 2000,
            replay_dir: PathBuf::from("frames"),
            replay_fps: 30,
            replay_loop: false,
        }
    }
}

impl Settings {
    /// Loads settings from an optional file plus environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self, AppError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        let settings: Settings = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()?;
        settings.validate().map_err(AppError::InvalidSettings)?;
        Ok(settings)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        if self.scan.scan_interval_ms == 0 {
            return Err("Scan interval must be greater than 0".to_string());
        }

        if self.pool.capacity == 0 {
            return Err("Pool capacity must be greater than 0".to_string());
        }

        let p = &self.predictor;
        if !(0.0..=1.0).contains(&p.alpha) || !(0.0..=1.0).contains(&p.beta) {
            return Err("Predictor gains must be between 0.0 and 1.0".to_string());
        }
        if p.margin < 0.0 {
            return Err("Predictor margin must not be negative".to_string());
        }
        if p.max_misses == 0 {
            return Err("Predictor max misses must be greater than 0".to_string());
        }

        if self.submission.attempt_timeout_ms == 0 {
            return Err("Attempt timeout must be greater than 0".to_string());
        }

        if self.source.frame_stride == 0 {
            return Err("Frame stride must be greater than 0".to_string());
        }

        Ok(())
    }

    pub fn with_scan_interval(mut self, interval: Duration) -> Self {
        self.scan.scan_interval_ms = (interval.as_millis() as u64).max(1);
        self
    }

    pub fn with_thread_pool(mut self, enabled: bool, max_workers: usize) -> Self {
        self.scan.thread_pool_enabled = enabled;
        self.scan.max_workers = max_workers.clamp(1, 64);
        self
    }
}

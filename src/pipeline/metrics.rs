use super::decode::DecoderVariant;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::watch;

const ALPHA: f32 = 0.1; // EWMA smoothing factor

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Capture,
    Decode,
    Submit,
}

/// Point-in-time view of pipeline performance. Replaced wholesale on every
/// update; readers never see a half-written snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub frames_captured: u64,
    pub frames_decoded: u64,
    pub detections: u64,
    pub enhanced_detections: u64,
    pub submissions: u64,

    // EWMA timing stats per phase
    pub avg_capture_us: f32,
    pub avg_decode_us: f32,
    pub avg_submit_us: f32,

    // Max timing stats for bottleneck detection
    pub max_capture_us: u64,
    pub max_decode_us: u64,
    pub max_submit_us: u64,

    pub frames_per_second: f32,
    /// Most recent decode timings, oldest first.
    pub recent_decode_us: Vec<u64>,
}

impl MetricsSnapshot {
    /// Fraction of the scan interval left over after an average decode, in [0, 1].
    pub fn headroom(&self, interval: Duration) -> f32 {
        if self.frames_decoded == 0 || interval.is_zero() {
            return 0.0;
        }
        (1.0 - self.avg_decode_us / interval.as_micros() as f32).clamp(0.0, 1.0)
    }

    pub fn fastest_decode_us(&self) -> Option<u64> {
        self.recent_decode_us.iter().copied().min()
    }

    pub fn slowest_decode_us(&self) -> Option<u64> {
        self.recent_decode_us.iter().copied().max()
    }

    pub fn window_average_decode_us(&self) -> Option<f32> {
        if self.recent_decode_us.is_empty() {
            return None;
        }
        let sum: u64 = self.recent_decode_us.iter().sum();
        Some(sum as f32 / self.recent_decode_us.len() as f32)
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} frames ({:.1} fps), {} decoded, {} detections ({} enhanced), {} submissions; \
             capture avg {:.1}ms, decode avg {:.1}ms",
            self.frames_captured,
            self.frames_per_second,
            self.frames_decoded,
            self.detections,
            self.enhanced_detections,
            self.submissions,
            self.avg_capture_us / 1000.0,
            self.avg_decode_us / 1000.0,
        )?;
        if let (Some(fastest), Some(slowest)) = (self.fastest_decode_us(), self.slowest_decode_us())
        {
            write!(
                f,
                " (fastest {:.1}ms, slowest {:.1}ms)",
                fastest as f32 / 1000.0,
                slowest as f32 / 1000.0
            )?;
        }
        Ok(())
    }
}

struct MonitorState {
    stats: MetricsSnapshot,
    window: VecDeque<u64>,
    window_size: usize,
    fps_frame_count: u64,
    last_fps_calculation: Instant,
}

/// Rolling performance metrics shared by the scheduler, predictor and
/// submission tasks.
#[derive(Clone)]
pub struct PerformanceMonitor {
    state: Arc<Mutex<MonitorState>>,
    published: Arc<watch::Sender<Arc<MetricsSnapshot>>>,
}

impl PerformanceMonitor {
    pub fn new(window_size: usize) -> Self {
        let (tx, _) = watch::channel(Arc::new(MetricsSnapshot::default()));
        Self {
            state: Arc::new(Mutex::new(MonitorState {
                stats: MetricsSnapshot::default(),
                window: VecDeque::with_capacity(window_size.max(1)),
                window_size: window_size.max(1),
                fps_frame_count: 0,
                last_fps_calculation: Instant::now(),
            })),
            published: Arc::new(tx),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<MetricsSnapshot>> {
        self.published.subscribe()
    }

    pub fn snapshot(&self) -> Arc<MetricsSnapshot> {
        Arc::clone(&self.published.borrow())
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn update_ewma(current: f32, new_value: u64, alpha: f32) -> f32 {
        if current == 0.0 {
            return new_value as f32;
        }
        current * (1.0 - alpha) + new_value as f32 * alpha
    }

    pub fn record(&self, phase: Phase, duration: Duration) {
        let duration_us = duration.as_micros() as u64;
        let mut state = self.lock();
        let stats = &mut state.stats;
        match phase {
            Phase::Capture => {
                stats.frames_captured += 1;
                stats.avg_capture_us = Self::update_ewma(stats.avg_capture_us, duration_us, ALPHA);
                stats.max_capture_us = stats.max_capture_us.max(duration_us);
            }
            Phase::Decode => {
                stats.frames_decoded += 1;
                stats.avg_decode_us = Self::update_ewma(stats.avg_decode_us, duration_us, ALPHA);
                stats.max_decode_us = stats.max_decode_us.max(duration_us);
            }
            Phase::Submit => {
                stats.submissions += 1;
                stats.avg_submit_us = Self::update_ewma(stats.avg_submit_us, duration_us, ALPHA);
                stats.max_submit_us = stats.max_submit_us.max(duration_us);
            }
        }

        if phase == Phase::Decode {
            if state.window.len() == state.window_size {
                state.window.pop_front();
            }
            state.window.push_back(duration_us);
        }

        if phase == Phase::Capture {
            // Update FPS calculation
            state.fps_frame_count += 1;
            let now = Instant::now();
            let elapsed = now.duration_since(state.last_fps_calculation);
            if elapsed.as_secs_f32() >= 1.0 {
                state.stats.frames_per_second =
                    state.fps_frame_count as f32 / elapsed.as_secs_f32();
                state.fps_frame_count = 0;
                state.last_fps_calculation = now;
            }
        }

        self.publish(&mut state);
    }

    pub fn record_detection(&self, variant: DecoderVariant) {
        let mut state = self.lock();
        state.stats.detections += 1;
        if matches!(variant, DecoderVariant::Enhanced(_)) {
            state.stats.enhanced_detections += 1;
        }
        self.publish(&mut state);
    }

    fn publish(&self, state: &mut MonitorState) {
        state.stats.recent_decode_us = state.window.iter().copied().collect();
        self.published.send_replace(Arc::new(state.stats.clone()));
    }
}

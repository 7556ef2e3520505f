use super::decode::{DecodeEngine, Detection};
use super::metrics::{PerformanceMonitor, Phase};
use super::predictor::{PredictorStats, RegionPredictor};
use super::reorder::ReorderBuffer;
use crate::common::{EventBus, Frame, FrameOrigin, PipelineEvent, PipelineState, Region, StateCell};
use crate::config::Settings;
use crate::error::CaptureError;
use crate::intake::{CaptureOutcome, FrameSource};
use crate::submission::{Outcome, SubmissionCoordinator};
use chrono::Utc;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Consecutive slow decode averages before another worker is allowed.
const GROW_AFTER: u32 = 3;
/// Consecutive fast decode averages before a worker is given back.
const SHRINK_AFTER: u32 = 10;

/// Handles shared by everything running inside one pipeline.
#[derive(Clone)]
pub struct PipelineHandles {
    pub state: StateCell,
    pub events: EventBus,
    pub cancel: CancellationToken,
    pub metrics: PerformanceMonitor,
}

/// Decides how many decode workers may run at once.
#[derive(Debug, Clone)]
pub struct ParallelismController {
    target: usize,
    max: usize,
    slow_streak: u32,
    fast_streak: u32,
}

impl ParallelismController {
    pub fn new(max: usize) -> Self {
        Self {
            target: 1,
            max: max.max(1),
            slow_streak: 0,
            fast_streak: 0,
        }
    }

    pub fn target(&self) -> usize {
        self.target
    }

    /// Feeds one decode average. Returns the new target when it changes.
    pub fn observe(&mut self, avg_decode: Duration, interval: Duration) -> Option<usize> {
        if avg_decode > interval {
            self.fast_streak = 0;
            self.slow_streak += 1;
            if self.slow_streak >= GROW_AFTER && self.target < self.max {
                self.slow_streak = 0;
                self.target += 1;
                return Some(self.target);
            }
        } else if avg_decode < interval / 2 {
            self.slow_streak = 0;
            self.fast_streak += 1;
            if self.fast_streak >= SHRINK_AFTER && self.target > 1 {
                self.fast_streak = 0;
                self.target -= 1;
                return Some(self.target);
            }
        } else {
            self.slow_streak = 0;
            self.fast_streak = 0;
        }
        None
    }
}

#[derive(Debug)]
struct Completion {
    seq: u64,
    detection: Option<Detection>,
    elapsed: Duration,
}

/// What a finished scan of one source looked like.
#[derive(Debug, Clone)]
pub struct ScanReport {
    pub source: String,
    pub origin: FrameOrigin,
    pub state: PipelineState,
    pub frames: u64,
    pub predictor: PredictorStats,
    pub skipped_sequences: u64,
    pub peak_workers: usize,
}

/// Drives capture, prediction and decoding on a fixed tick until the
/// pipeline is cancelled or the source fails.
pub struct WorkerScheduler {
    source: Box<dyn FrameSource>,
    engine: Arc<DecodeEngine>,
    submissions: Arc<SubmissionCoordinator>,
    predictor: RegionPredictor,
    reorder: ReorderBuffer<Completion>,
    controller: ParallelismController,
    interval: Duration,
    handles: PipelineHandles,
    next_seq: u64,
    peak_workers: usize,
}

impl WorkerScheduler {
    pub fn new(
        source: Box<dyn FrameSource>,
        engine: Arc<DecodeEngine>,
        submissions: Arc<SubmissionCoordinator>,
        settings: &Settings,
        handles: PipelineHandles,
    ) -> Self {
        let max_workers = settings.scan.worker_limit();
        Self {
            source,
            engine,
            submissions,
            predictor: RegionPredictor::new(settings.predictor.clone()),
            reorder: ReorderBuffer::new(max_workers * 4),
            controller: ParallelismController::new(max_workers),
            interval: settings.scan.scan_interval(),
            handles,
            next_seq: 0,
            peak_workers: 0,
        }
    }

    pub async fn run(mut self) -> ScanReport {
        let mut workers: JoinSet<Completion> = JoinSet::new();
        let mut submissions: JoinSet<Outcome> = JoinSet::new();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let description = self.source.describe();
        let origin = self.source.origin();
        tracing::info!(
            "Scanning {} ({}) every {:?} with up to {} workers",
            description,
            origin,
            self.interval,
            self.controller.max
        );
        // the first source to start moves the pipeline out of Idle
        self.handles
            .state
            .transition_from(PipelineState::Idle, PipelineState::Scanning);
        self.handles.events.emit(PipelineEvent::ScanStarted {
            source: description.clone(),
        });

        let cancel = self.handles.cancel.clone();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(done) = workers.join_next(), if !workers.is_empty() => {
                    self.complete(done, &mut submissions);
                }
                Some(settled) = submissions.join_next(), if !submissions.is_empty() => {
                    if let Err(e) = settled {
                        tracing::error!("Submission task failed: {}", e);
                    }
                }
                _ = ticker.tick() => {
                    if workers.len() >= self.controller.target() {
                        tracing::trace!("All {} workers busy, skipping tick", workers.len());
                        continue;
                    }
                    let captured = tokio::select! {
                        _ = cancel.cancelled() => break,
                        captured = self.capture() => captured,
                    };
                    match captured {
                        Ok(Some(frame)) => self.dispatch(frame, &mut workers),
                        Ok(None) => {}
                        Err(e) => {
                            tracing::error!("Capture failed, stopping scan: {}", e);
                            self.handles.events.emit(PipelineEvent::CaptureFailed {
                                reason: e.to_string(),
                            });
                            self.handles.state.transition(PipelineState::Failed);
                            cancel.cancel();
                            break;
                        }
                    }
                }
            }
        }

        // In-flight work finishes; nothing new is started.
        while let Some(done) = workers.join_next().await {
            self.complete(done, &mut submissions);
        }
        while let Some(settled) = submissions.join_next().await {
            if let Err(e) = settled {
                tracing::error!("Submission task failed: {}", e);
            }
        }

        if self.handles.state.transition(PipelineState::Cancelled) {
            tracing::info!("Scan cancelled");
            self.handles.events.emit(PipelineEvent::Cancelled);
        }

        let report = ScanReport {
            source: description,
            origin,
            state: self.handles.state.get(),
            frames: self.next_seq,
            predictor: self.predictor.stats().clone(),
            skipped_sequences: self.reorder.skipped(),
            peak_workers: self.peak_workers,
        };
        tracing::info!(
            "Scan of {} finished as {:?} after {} frames ({:.0}% predicted in region)",
            report.source,
            report.state,
            report.frames,
            report.predictor.accuracy() * 100.0
        );
        report
    }

    async fn capture(&mut self) -> Result<Option<Frame>, CaptureError> {
        let start = Instant::now();
        match self.source.capture_once().await? {
            CaptureOutcome::Frame(frame) => {
                self.handles.metrics.record(Phase::Capture, start.elapsed());
                Ok(Some(frame))
            }
            CaptureOutcome::NotReady => Ok(None),
        }
    }

    fn dispatch(&mut self, frame: Frame, workers: &mut JoinSet<Completion>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let frame = frame.with_sequence(seq);
        let region = self.predictor.predict(seq, frame.width(), frame.height());
        tracing::debug!("Frame {} dispatched, searching {}", seq, region);

        let engine = Arc::clone(&self.engine);
        workers.spawn_blocking(move || decode_frame(&engine, frame, region));
        self.peak_workers = self.peak_workers.max(workers.len());
    }

    fn complete(
        &mut self,
        done: Result<Completion, JoinError>,
        submissions: &mut JoinSet<Outcome>,
    ) {
        let completion = match done {
            Ok(completion) => completion,
            Err(e) => {
                tracing::error!("Decode worker lost: {}", e);
                return;
            }
        };
        self.handles.metrics.record(Phase::Decode, completion.elapsed);
        if let Err(late) = self.reorder.insert(completion.seq, completion) {
            // The predictor has moved past this frame; the ticket still counts.
            tracing::debug!("Frame {} completed after its slot was skipped", late.seq);
            if let Some(detection) = late.detection {
                self.handles.metrics.record_detection(detection.variant);
                self.forward(detection, submissions);
            }
        }

        for completion in self.reorder.drain_ready() {
            match completion.detection {
                Some(detection) => {
                    self.predictor.observe(completion.seq, &detection.region);
                    self.handles.metrics.record_detection(detection.variant);
                    self.forward(detection, submissions);
                }
                None => self.predictor.miss(completion.seq),
            }
        }

        let snapshot = self.handles.metrics.snapshot();
        self.predictor.set_headroom(snapshot.headroom(self.interval));
        let avg_decode = Duration::from_micros(snapshot.avg_decode_us as u64);
        if let Some(target) = self.controller.observe(avg_decode, self.interval) {
            tracing::info!(
                "Decode average {:?} against {:?} interval, running {} workers",
                avg_decode,
                self.interval,
                target
            );
        }
    }

    fn forward(&self, detection: Detection, submissions: &mut JoinSet<Outcome>) {
        if self.handles.cancel.is_cancelled() {
            return;
        }
        if self.submissions.is_tracked(&detection.ticket) {
            tracing::trace!("Ticket {} already handled", detection.ticket.short());
            return;
        }
        let since_capture = (Utc::now() - detection.captured_at)
            .to_std()
            .unwrap_or_default();
        tracing::info!(
            "Found code {} at {} on {} via {} in {:?} ({:?} after capture)",
            detection.ticket.short(),
            detection.region,
            detection.origin,
            detection.variant.label(),
            detection.latency,
            since_capture
        );
        self.handles.events.emit(PipelineEvent::CodeFound {
            ticket: detection.ticket.clone(),
            origin: detection.origin,
            region: detection.region,
            decoder: detection.variant.label(),
            latency: detection.latency,
        });
        let coordinator = Arc::clone(&self.submissions);
        submissions.spawn(async move { coordinator.submit(detection.ticket).await });
    }
}

fn decode_frame(engine: &DecodeEngine, frame: Frame, region: Region) -> Completion {
    let start = Instant::now();
    let seq = frame.seq();
    let detection = panic::catch_unwind(AssertUnwindSafe(|| engine.decode(&frame, region)))
        .unwrap_or_else(|_| {
            tracing::error!("Decoder panicked on frame {}, counting it as a miss", seq);
            None
        });
    // frame storage goes back to the pool here
    drop(frame);
    Completion {
        seq,
        detection,
        elapsed: start.elapsed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Ticket;
    use crate::config::DecodeSettings;
    use crate::error::LoginError;
    use crate::intake::FramePool;
    use crate::pipeline::decode::{ClarityThresholds, CodeDecoder, DecodedCode, DecoderVariant};
    use crate::submission::{Credentials, LoginRequest, LoginResponse};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::service_fn;

    struct FakeSource {
        pool: FramePool,
        captures: Arc<AtomicUsize>,
        fail_at: Option<usize>,
    }

    #[async_trait]
    impl FrameSource for FakeSource {
        fn describe(&self) -> String {
            "fake source".to_string()
        }

        fn origin(&self) -> FrameOrigin {
            FrameOrigin::Screen
        }

        async fn capture_once(&mut self) -> Result<CaptureOutcome, CaptureError> {
            let n = self.captures.fetch_add(1, Ordering::SeqCst);
            if self.fail_at == Some(n) {
                return Err(CaptureError::TargetGone("window closed".to_string()));
            }
            let mut buf = self.pool.acquire(Frame::byte_len(64, 48)).await?;
            buf.as_mut_slice().fill(255);
            let frame = Frame::new(FrameOrigin::Screen, 64, 48, Utc::now(), buf)?;
            Ok(CaptureOutcome::Frame(frame))
        }
    }

    enum Behaviour {
        Always(&'static str),
        Never,
        Panic,
    }

    struct FakeDecoder(Behaviour);

    impl CodeDecoder for FakeDecoder {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn decode(&self, _luma: &image::GrayImage) -> Option<DecodedCode> {
            match self.0 {
                Behaviour::Always(payload) => Some(DecodedCode {
                    payload: payload.to_string(),
                    bounds: Region::new(10, 10, 20, 20),
                    pass: "raw",
                }),
                Behaviour::Never => None,
                Behaviour::Panic => panic!("corrupt crop"),
            }
        }
    }

    struct Rig {
        scheduler: WorkerScheduler,
        handles: PipelineHandles,
        captures: Arc<AtomicUsize>,
        logins: Arc<AtomicUsize>,
    }

    fn rig(behaviour: Behaviour, fail_at: Option<usize>) -> Rig {
        rig_with_login_delay(behaviour, fail_at, Duration::ZERO)
    }

    fn rig_with_login_delay(
        behaviour: Behaviour,
        fail_at: Option<usize>,
        login_delay: Duration,
    ) -> Rig {
        let settings = Settings::default().with_scan_interval(Duration::from_millis(5));
        let handles = PipelineHandles {
            state: StateCell::new(),
            events: EventBus::default(),
            cancel: CancellationToken::new(),
            metrics: PerformanceMonitor::new(16),
        };
        let logins = Arc::new(AtomicUsize::new(0));
        let endpoint = {
            let logins = Arc::clone(&logins);
            service_fn(move |_req: LoginRequest| {
                let logins = Arc::clone(&logins);
                async move {
                    logins.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(login_delay).await;
                    Ok::<_, LoginError>(LoginResponse::Success)
                }
            })
        };
        let submissions = Arc::new(SubmissionCoordinator::new(
            endpoint,
            &settings,
            Credentials::default(),
            handles.state.clone(),
            handles.events.clone(),
            handles.cancel.clone(),
        ));
        let engine = Arc::new(DecodeEngine::new(
            Box::new(FakeDecoder(behaviour)),
            None,
            ClarityThresholds::from(&DecodeSettings::default()),
        ));
        let captures = Arc::new(AtomicUsize::new(0));
        let source = FakeSource {
            pool: FramePool::new(3),
            captures: Arc::clone(&captures),
            fail_at,
        };
        Rig {
            scheduler: WorkerScheduler::new(
                Box::new(source),
                engine,
                submissions,
                &settings,
                handles.clone(),
            ),
            handles,
            captures,
            logins,
        }
    }

    async fn run_bounded(scheduler: WorkerScheduler) -> ScanReport {
        tokio::time::timeout(Duration::from_secs(10), scheduler.run())
            .await
            .expect("scheduler did not stop")
    }

    #[tokio::test]
    async fn login_stops_the_scan() {
        let rig = rig(Behaviour::Always("G152#KURO#live"), None);
        let mut events = rig.handles.events.subscribe();
        let report = run_bounded(rig.scheduler).await;

        assert_eq!(report.state, PipelineState::LoggedIn);
        assert_eq!(rig.logins.load(Ordering::SeqCst), 1);
        assert!(rig.handles.cancel.is_cancelled());

        let mut found = 0;
        while let Ok(event) = events.try_recv() {
            if let PipelineEvent::CodeFound { ticket, .. } = event {
                assert_eq!(ticket, Ticket::from("G152#KURO#live"));
                found += 1;
            }
        }
        assert!(found >= 1);
    }

    #[tokio::test]
    async fn capture_failure_fails_the_pipeline() {
        let rig = rig(Behaviour::Never, Some(3));
        let mut events = rig.handles.events.subscribe();
        let report = run_bounded(rig.scheduler).await;

        assert_eq!(report.state, PipelineState::Failed);
        assert_eq!(report.frames, 3);
        assert_eq!(rig.captures.load(Ordering::SeqCst), 4);

        let mut reason = None;
        while let Ok(event) = events.try_recv() {
            if let PipelineEvent::CaptureFailed { reason: r } = event {
                reason = Some(r);
            }
        }
        assert!(reason.unwrap().contains("window closed"));
    }

    #[tokio::test]
    async fn login_in_flight_outlives_a_capture_failure() {
        let rig = rig_with_login_delay(
            Behaviour::Always("G152#KURO#late"),
            Some(3),
            Duration::from_millis(200),
        );
        let report = run_bounded(rig.scheduler).await;

        assert_eq!(rig.captures.load(Ordering::SeqCst), 4);
        assert_eq!(rig.logins.load(Ordering::SeqCst), 1);
        assert_eq!(report.state, PipelineState::LoggedIn);
        assert_eq!(rig.handles.state.get(), PipelineState::LoggedIn);
    }

    #[tokio::test]
    async fn cancellation_stops_capture() {
        let rig = rig(Behaviour::Never, None);
        let cancel = rig.handles.cancel.clone();
        let task = tokio::spawn(rig.scheduler.run());
        tokio::time::sleep(Duration::from_millis(60)).await;
        cancel.cancel();
        let report = task.await.unwrap();

        assert_eq!(report.state, PipelineState::Cancelled);
        let captured = rig.captures.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(rig.captures.load(Ordering::SeqCst), captured);
        assert_eq!(rig.logins.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn decoder_panic_counts_as_miss() {
        let rig = rig(Behaviour::Panic, None);
        let cancel = rig.handles.cancel.clone();
        let metrics = rig.handles.metrics.clone();
        let task = tokio::spawn(rig.scheduler.run());
        tokio::time::sleep(Duration::from_millis(60)).await;
        cancel.cancel();
        let report = task.await.unwrap();

        assert_eq!(report.state, PipelineState::Cancelled);
        assert!(report.predictor.misses > 0);
        assert_eq!(metrics.snapshot().detections, 0);
    }

    #[tokio::test]
    async fn completions_reach_the_predictor_in_capture_order() {
        let mut rig = rig(Behaviour::Never, None);
        let mut submissions = JoinSet::new();
        let hit = Detection {
            seq: 0,
            origin: FrameOrigin::Screen,
            captured_at: Utc::now(),
            ticket: Ticket::from("G152#KURO#order"),
            region: Region::new(10, 10, 20, 20),
            latency: Duration::from_millis(4),
            variant: DecoderVariant::Base,
        };

        // frame 1 (a miss) finishes before frame 0 (a hit)
        rig.scheduler.complete(
            Ok(Completion {
                seq: 1,
                detection: None,
                elapsed: Duration::from_millis(2),
            }),
            &mut submissions,
        );
        assert!(!rig.scheduler.predictor.is_tracking());
        rig.scheduler.complete(
            Ok(Completion {
                seq: 0,
                detection: Some(hit),
                elapsed: Duration::from_millis(4),
            }),
            &mut submissions,
        );

        assert!(rig.scheduler.predictor.is_tracking());
        assert_eq!(rig.scheduler.predictor.misses(), 1);
        assert_eq!(submissions.len(), 1);
        while submissions.join_next().await.is_some() {}
        assert_eq!(rig.logins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn skipped_frame_still_submits_its_code() {
        let mut rig = rig(Behaviour::Never, None);
        rig.scheduler.reorder = ReorderBuffer::new(1);
        let mut submissions = JoinSet::new();
        for seq in [1, 2] {
            rig.scheduler.complete(
                Ok(Completion {
                    seq,
                    detection: None,
                    elapsed: Duration::from_millis(2),
                }),
                &mut submissions,
            );
        }
        assert_eq!(rig.scheduler.reorder.skipped(), 1);
        assert_eq!(rig.scheduler.predictor.stats().misses, 2);

        let late = Detection {
            seq: 0,
            origin: FrameOrigin::Screen,
            captured_at: Utc::now(),
            ticket: Ticket::from("G152#KURO#straggler"),
            region: Region::new(10, 10, 20, 20),
            latency: Duration::from_millis(40),
            variant: DecoderVariant::Base,
        };
        rig.scheduler.complete(
            Ok(Completion {
                seq: 0,
                detection: Some(late),
                elapsed: Duration::from_millis(40),
            }),
            &mut submissions,
        );

        // submitted, but the predictor never hears about it
        assert_eq!(submissions.len(), 1);
        assert!(!rig.scheduler.predictor.is_tracking());
        assert_eq!(rig.scheduler.predictor.stats().misses, 2);
        assert_eq!(rig.handles.metrics.snapshot().detections, 1);
        while submissions.join_next().await.is_some() {}
        assert_eq!(rig.logins.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn controller_grows_on_slow_and_shrinks_on_fast() {
        let interval = Duration::from_millis(100);
        let mut controller = ParallelismController::new(3);
        let slow = Duration::from_millis(150);
        let fast = Duration::from_millis(20);

        assert_eq!(controller.observe(slow, interval), None);
        assert_eq!(controller.observe(slow, interval), None);
        assert_eq!(controller.observe(slow, interval), Some(2));
        for _ in 0..6 {
            controller.observe(slow, interval);
        }
        assert_eq!(controller.target(), 3);

        // a borderline reading breaks the streak
        for _ in 0..9 {
            controller.observe(fast, interval);
        }
        controller.observe(Duration::from_millis(70), interval);
        assert_eq!(controller.target(), 3);
        for _ in 0..9 {
            assert_eq!(controller.observe(fast, interval), None);
        }
        assert_eq!(controller.observe(fast, interval), Some(2));
        for _ in 0..50 {
            controller.observe(fast, interval);
        }
        assert_eq!(controller.target(), 1);
    }

    #[test]
    fn single_worker_when_pool_disabled() {
        let mut controller = ParallelismController::new(Settings::default().scan.worker_limit());
        for _ in 0..10 {
            controller.observe(Duration::from_secs(1), Duration::from_millis(100));
        }
        assert_eq!(controller.target(), 1);
    }
}

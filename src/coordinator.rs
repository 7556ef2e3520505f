use crate::{
    common::{EventBus, PipelineEvent, PipelineState, StateCell},
    config::Settings,
    error::AppError,
    intake::FrameSource,
    pipeline::{
        DecodeEngine, MetricsSnapshot, PerformanceMonitor, PipelineHandles, ScanReport,
        WorkerScheduler,
    },
    submission::{BoxError, Credentials, LoginRequest, LoginResponse, SubmissionCoordinator},
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tower::util::BoxCloneService;
use tower::{Service, ServiceExt};
use uuid::Uuid;

type LoginEndpoint = BoxCloneService<LoginRequest, LoginResponse, BoxError>;

const METRICS_WINDOW: usize = 64;

/// How a pipeline ended, with one scan report per source in the order the
/// sources were added.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub state: PipelineState,
    pub scans: Vec<ScanReport>,
}

impl PipelineReport {
    pub fn frames(&self) -> u64 {
        self.scans.iter().map(|scan| scan.frames).sum()
    }
}

/// Handle to one scanning pipeline: start it, watch it, stop it.
///
/// Every source gets its own scheduler. They share one submission
/// coordinator, so a code seen by several sources is submitted once, and one
/// cancellation token, so a login or a failed source stops all of them.
pub struct Coordinator {
    id: Uuid,
    handles: PipelineHandles,
    engine: Arc<DecodeEngine>,
    schedulers: Vec<WorkerScheduler>,
    model_warning: Option<String>,
    scan_task: Option<JoinHandle<PipelineReport>>,
}

impl Coordinator {
    pub fn builder(settings: Settings) -> CoordinatorBuilder {
        CoordinatorBuilder::new(settings)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Spawns the scan. A coordinator runs once.
    pub fn start(&mut self) -> Result<(), AppError> {
        if self.schedulers.is_empty() {
            return Err(AppError::Pipeline("Pipeline already started".to_string()));
        }
        let schedulers = std::mem::take(&mut self.schedulers);

        if let Some(reason) = self.model_warning.take() {
            self.handles
                .events
                .emit(PipelineEvent::ModelUnavailable { reason });
        }

        tracing::info!(
            "Starting pipeline {} with {} source(s)",
            self.id,
            schedulers.len()
        );
        let engine = Arc::clone(&self.engine);
        let state = self.handles.state.clone();
        self.scan_task = Some(tokio::spawn(async move {
            if tokio::task::spawn_blocking(move || engine.warm_up())
                .await
                .is_err()
            {
                tracing::warn!("Decoder warm-up panicked, scanning anyway");
            }
            let mut scans = JoinSet::new();
            for (index, scheduler) in schedulers.into_iter().enumerate() {
                scans.spawn(async move { (index, scheduler.run().await) });
            }
            let mut reports = Vec::with_capacity(scans.len());
            while let Some(done) = scans.join_next().await {
                match done {
                    Ok(scan) => reports.push(scan),
                    Err(e) => tracing::error!("Scan task failed: {}", e),
                }
            }
            reports.sort_by_key(|(index, _)| *index);
            PipelineReport {
                state: state.get(),
                scans: reports.into_iter().map(|(_, report)| report).collect(),
            }
        }));
        Ok(())
    }

    /// Requests a stop without waiting for it.
    pub fn cancel(&self) {
        self.handles.cancel.cancel();
    }

    pub async fn stop(&mut self) -> Result<PipelineReport, AppError> {
        self.cancel();
        self.join().await
    }

    /// Waits for every scan to finish on its own (login, failure or cancel).
    pub async fn join(&mut self) -> Result<PipelineReport, AppError> {
        let task = self
            .scan_task
            .take()
            .ok_or(AppError::Pipeline("Pipeline not running".to_string()))?;
        task.await
            .map_err(|e| AppError::Pipeline(format!("Scan task failed: {}", e)))
    }

    pub fn is_running(&self) -> bool {
        self.scan_task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    pub fn state(&self) -> watch::Receiver<PipelineState> {
        self.handles.state.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<PipelineEvent> {
        self.handles.events.subscribe()
    }

    /// Events as a stream. Events missed by a slow reader are skipped.
    pub fn event_stream(&self) -> impl Stream<Item = PipelineEvent> + Send + Unpin + 'static {
        BroadcastStream::new(self.handles.events.subscribe()).filter_map(|event| match event {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::warn!("Event reader fell behind: {}", e);
                None
            }
        })
    }

    pub fn metrics(&self) -> watch::Receiver<Arc<MetricsSnapshot>> {
        self.handles.metrics.subscribe()
    }

    pub fn metrics_snapshot(&self) -> Arc<MetricsSnapshot> {
        self.handles.metrics.snapshot()
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.cancel();
    }
}

pub struct CoordinatorBuilder {
    settings: Settings,
    sources: Vec<Box<dyn FrameSource>>,
    endpoint: Option<LoginEndpoint>,
    credentials: Option<Credentials>,
    engine: Option<DecodeEngine>,
    event_capacity: usize,
}

impl CoordinatorBuilder {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            sources: Vec::new(),
            endpoint: None,
            credentials: None,
            engine: None,
            event_capacity: 64,
        }
    }

    // Sets the scan interval, this will override the default configuration.
    pub fn scan_interval(mut self, interval: Duration) -> Self {
        self.settings = self.settings.with_scan_interval(interval);
        self
    }

    // Enables parallel decoding, this will override the default configuration.
    pub fn thread_pool(mut self, enabled: bool, max_workers: usize) -> Self {
        self.settings = self.settings.with_thread_pool(enabled, max_workers);
        self
    }

    // Keeps scanning after a failed code, this will override the default configuration.
    pub fn auto_retry(mut self, auto_retry: bool) -> Self {
        self.settings.scan.auto_retry = auto_retry;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.clamp(1, 4096);
        self
    }

    // Adds a source. Each call adds another one scanned alongside the rest.
    pub fn source(mut self, source: impl FrameSource + 'static) -> Self {
        self.sources.push(Box::new(source));
        self
    }

    pub fn endpoint<S>(mut self, endpoint: S) -> Self
    where
        S: Service<LoginRequest, Response = LoginResponse> + Clone + Send + 'static,
        S::Error: Into<BoxError>,
        S::Future: Send + 'static,
    {
        self.endpoint = Some(BoxCloneService::new(endpoint.map_err(Into::into)));
        self
    }

    // Falls back to the token in the api settings when not set.
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    // Replaces the decoders loaded from the decode settings.
    pub fn engine(mut self, engine: DecodeEngine) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn build(self) -> Result<Coordinator, AppError> {
        self.settings
            .validate()
            .map_err(AppError::InvalidSettings)?;
        if self.sources.is_empty() {
            return Err(AppError::Pipeline("Frame source not set".to_string()));
        }
        let endpoint = self
            .endpoint
            .ok_or(AppError::Pipeline("Login endpoint not set".to_string()))?;
        let credentials = self
            .credentials
            .unwrap_or_else(|| Credentials::from_settings(&self.settings.api));

        let (engine, model_warning) = match self.engine {
            Some(engine) => (engine, None),
            None => {
                let (engine, error) = DecodeEngine::from_settings(&self.settings.decode);
                (engine, error.map(|e| e.to_string()))
            }
        };
        let engine = Arc::new(engine);

        let handles = PipelineHandles {
            state: StateCell::new(),
            events: EventBus::new(self.event_capacity),
            cancel: CancellationToken::new(),
            metrics: PerformanceMonitor::new(METRICS_WINDOW),
        };
        let submissions = SubmissionCoordinator::new(
            endpoint,
            &self.settings,
            credentials,
            handles.state.clone(),
            handles.events.clone(),
            handles.cancel.clone(),
        )
        .with_metrics(handles.metrics.clone());
        let submissions = Arc::new(submissions);
        let schedulers = self
            .sources
            .into_iter()
            .map(|source| {
                WorkerScheduler::new(
                    source,
                    Arc::clone(&engine),
                    Arc::clone(&submissions),
                    &self.settings,
                    handles.clone(),
                )
            })
            .collect();

        Ok(Coordinator {
            id: Uuid::new_v4(),
            handles,
            engine,
            schedulers,
            model_warning,
            scan_task: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{FrameOrigin, Region};
    use crate::error::LoginError;
    use crate::intake::{FramePool, PixelFormat, StreamLocator, StreamPicture, StreamSource};
    use crate::pipeline::decode::test_support::render_qr;
    use crate::pipeline::decode::{ClarityThresholds, CodeDecoder, DecodedCode};
    use bytes::Bytes;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::{Context, Poll};

    #[derive(Clone)]
    struct CountingEndpoint {
        calls: Arc<AtomicUsize>,
        response: LoginResponse,
        delay: Duration,
    }

    impl Service<LoginRequest> for CountingEndpoint {
        type Response = LoginResponse;
        type Error = LoginError;
        type Future = Pin<Box<dyn Future<Output = Result<LoginResponse, LoginError>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _request: LoginRequest) -> Self::Future {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let response = self.response.clone();
            let delay = self.delay;
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                Ok(response)
            })
        }
    }

    fn counting_endpoint(response: LoginResponse) -> (CountingEndpoint, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let endpoint = CountingEndpoint {
            calls: Arc::clone(&calls),
            response,
            delay: Duration::ZERO,
        };
        (endpoint, calls)
    }

    fn test_settings() -> Settings {
        let mut settings = Settings::default().with_scan_interval(Duration::from_millis(10));
        settings.source.frame_stride = 1;
        settings.decode.model_dir = std::env::temp_dir().join("codegrab-missing-model");
        settings
    }

    #[tokio::test]
    async fn scans_stream_and_logs_in() {
        let settings = test_settings();
        let pool = FramePool::new(4);
        let (source, feeder) = StreamSource::channel(
            StreamLocator("test://qr".to_string()),
            &settings.source,
            pool,
        );
        let qr = render_qr("G152#KURO#endtoend", 4, 4, 0, 255);
        let (width, height) = qr.dimensions();
        assert!(feeder.push(StreamPicture {
            width,
            height,
            format: PixelFormat::Luma8,
            data: Bytes::from(qr.into_raw()),
        }));

        let (endpoint, calls) = counting_endpoint(LoginResponse::Success);
        let mut coordinator = CoordinatorBuilder::new(settings)
            .source(source)
            .endpoint(endpoint)
            .credentials(Credentials::new("token", "device"))
            .build()
            .expect("Failed to build coordinator");
        let mut events = coordinator.events();
        let state = coordinator.state();

        coordinator.start().unwrap();
        let report = tokio::time::timeout(Duration::from_secs(10), coordinator.join())
            .await
            .expect("pipeline did not finish")
            .unwrap();

        assert_eq!(report.state, PipelineState::LoggedIn);
        assert_eq!(*state.borrow(), PipelineState::LoggedIn);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.scans.len(), 1);
        assert_eq!(report.scans[0].source, "stream test://qr");
        assert_eq!(report.scans[0].origin, FrameOrigin::Stream);
        assert!(coordinator.metrics_snapshot().detections >= 1);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(matches!(seen.first(), Some(PipelineEvent::ModelUnavailable { .. })));
        assert!(seen
            .iter()
            .any(|e| matches!(
                e,
                PipelineEvent::CodeFound {
                    decoder: "base",
                    origin: FrameOrigin::Stream,
                    ..
                }
            )));
        assert!(seen.iter().any(|e| matches!(e, PipelineEvent::LoggedIn { .. })));
        drop(feeder);
    }

    struct FixedCode(&'static str);

    impl CodeDecoder for FixedCode {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn decode(&self, luma: &image::GrayImage) -> Option<DecodedCode> {
            Some(DecodedCode {
                payload: self.0.to_string(),
                bounds: Region::new(0, 0, luma.width(), luma.height()),
                pass: "raw",
            })
        }
    }

    fn blank_picture() -> StreamPicture {
        StreamPicture {
            width: 32,
            height: 32,
            format: PixelFormat::Luma8,
            data: Bytes::from(vec![255u8; 32 * 32]),
        }
    }

    #[tokio::test]
    async fn sources_share_one_submission_per_code() {
        let settings = test_settings();
        let (first, first_feeder) = StreamSource::channel(
            StreamLocator("test://left".to_string()),
            &settings.source,
            FramePool::new(4),
        );
        let (second, second_feeder) = StreamSource::channel(
            StreamLocator("test://right".to_string()),
            &settings.source,
            FramePool::new(4),
        );
        for _ in 0..3 {
            assert!(first_feeder.push(blank_picture()));
            assert!(second_feeder.push(blank_picture()));
        }

        let (mut endpoint, calls) = counting_endpoint(LoginResponse::Success);
        endpoint.delay = Duration::from_millis(150);
        let engine = DecodeEngine::new(
            Box::new(FixedCode("T123")),
            None,
            ClarityThresholds::from(&settings.decode),
        );
        let mut coordinator = CoordinatorBuilder::new(settings)
            .source(first)
            .source(second)
            .endpoint(endpoint)
            .engine(engine)
            .build()
            .unwrap();

        coordinator.start().unwrap();
        let report = tokio::time::timeout(Duration::from_secs(10), coordinator.join())
            .await
            .expect("pipeline did not finish")
            .unwrap();

        assert_eq!(report.state, PipelineState::LoggedIn);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let sources: Vec<_> = report.scans.iter().map(|s| s.source.as_str()).collect();
        assert_eq!(sources, ["stream test://left", "stream test://right"]);
        assert!(report.scans.iter().all(|scan| scan.frames >= 1));
        assert_eq!(coordinator.metrics_snapshot().submissions, 1);
        drop((first_feeder, second_feeder));
    }

    #[tokio::test]
    async fn stop_cancels_an_idle_scan() {
        let settings = test_settings();
        let (source, feeder) = StreamSource::channel(
            StreamLocator("test://idle".to_string()),
            &settings.source,
            FramePool::new(2),
        );
        let (endpoint, calls) = counting_endpoint(LoginResponse::Success);
        let mut coordinator = CoordinatorBuilder::new(settings)
            .source(source)
            .endpoint(endpoint)
            .build()
            .unwrap();
        let mut stream = coordinator.event_stream();

        coordinator.start().unwrap();
        assert!(coordinator.start().is_err());
        tokio::time::sleep(Duration::from_millis(50)).await;
        let report = coordinator.stop().await.unwrap();

        assert_eq!(report.state, PipelineState::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!coordinator.is_running());

        let mut cancelled = false;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(100), stream.next()).await
        {
            if matches!(event, PipelineEvent::Cancelled) {
                cancelled = true;
                break;
            }
        }
        assert!(cancelled);
        drop(feeder);
    }

    #[tokio::test]
    async fn stream_end_is_a_capture_failure() {
        let settings = test_settings();
        let (source, feeder) = StreamSource::channel(
            StreamLocator("test://gone".to_string()),
            &settings.source,
            FramePool::new(2),
        );
        drop(feeder);
        let (endpoint, _) = counting_endpoint(LoginResponse::Success);
        let mut coordinator = CoordinatorBuilder::new(settings)
            .source(source)
            .endpoint(endpoint)
            .build()
            .unwrap();
        let mut events = coordinator.events();

        coordinator.start().unwrap();
        let report = tokio::time::timeout(Duration::from_secs(5), coordinator.join())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.state, PipelineState::Failed);

        let mut reason = None;
        while let Ok(event) = events.try_recv() {
            if let PipelineEvent::CaptureFailed { reason: r } = event {
                reason = Some(r);
            }
        }
        assert_eq!(reason.as_deref(), Some("Stream ended"));
    }

    #[test]
    fn build_requires_source_and_endpoint() {
        let missing_source = CoordinatorBuilder::new(Settings::default()).build();
        assert!(matches!(missing_source, Err(AppError::Pipeline(_))));

        let (source, _feeder) = StreamSource::channel(
            StreamLocator("test://x".to_string()),
            &Settings::default().source,
            FramePool::new(1),
        );
        let missing_endpoint = CoordinatorBuilder::new(Settings::default())
            .source(source)
            .build();
        assert!(matches!(missing_endpoint, Err(AppError::Pipeline(_))));
    }

    #[test]
    fn builder_overrides_are_clamped() {
        let builder = CoordinatorBuilder::new(Settings::default())
            .thread_pool(true, 500)
            .scan_interval(Duration::ZERO)
            .event_capacity(0);
        assert_eq!(builder.settings.scan.max_workers, 64);
        assert_eq!(builder.settings.scan.scan_interval_ms, 1);
        assert_eq!(builder.event_capacity, 1);
    }
}

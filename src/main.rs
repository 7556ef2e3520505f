use codegrab::common::PipelineEvent;
use codegrab::error::AppError;
use codegrab::intake::{FramePool, ReplayDecoder, StreamLocator, StreamSource};
use codegrab::submission::{Credentials, KuroLoginClient};
use codegrab::{CoordinatorBuilder, Settings};
use tokio_stream::StreamExt;
use tracing::Level;

fn init_logging(level: &str) {
    let level = level.parse::<Level>().unwrap_or(Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).init();
}

fn log_event(event: PipelineEvent) {
    match event {
        PipelineEvent::CodeFound {
            ticket,
            origin,
            region,
            decoder,
            latency,
        } => {
            tracing::info!(
                "Code {} at {} on {} ({} decoder, {:?})",
                ticket.short(),
                region,
                origin,
                decoder,
                latency
            );
        }
        PipelineEvent::SubmissionFinished { ticket, outcome } => {
            tracing::info!("Ticket {}: {}", ticket.short(), outcome);
        }
        PipelineEvent::CaptureFailed { reason } => {
            tracing::error!("Scanning stopped: {}", reason);
        }
        PipelineEvent::ModelUnavailable { reason } => {
            tracing::warn!("Enhanced decoding unavailable: {}", reason);
        }
        event => tracing::debug!("{:?}", event),
    }
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config_path = std::env::args().nth(1);
    let settings = Settings::load(config_path.as_deref())?;
    init_logging(&settings.log_level);

    let pool = FramePool::from_settings(&settings.pool);
    let locator = StreamLocator(format!("replay://{}", settings.source.replay_dir.display()));
    let (source, feeder) = StreamSource::channel(locator, &settings.source, pool.clone());
    let mut replay = ReplayDecoder::spawn(
        &settings.source.replay_dir,
        settings.source.replay_fps,
        settings.source.replay_loop,
        feeder,
    )?;

    let endpoint = KuroLoginClient::new(&settings.api, settings.submission.attempt_timeout());
    let mut coordinator = CoordinatorBuilder::new(settings.clone())
        .source(source)
        .endpoint(endpoint)
        .credentials(Credentials::from_settings(&settings.api))
        .build()?;

    let mut events = coordinator.event_stream();
    let state = coordinator.state();
    coordinator.start()?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, stopping");
                coordinator.cancel();
                break;
            }
            event = events.next() => {
                let Some(event) = event else { break };
                log_event(event);
                if state.borrow().is_terminal() {
                    break;
                }
            }
        }
    }

    let report = coordinator.join().await?;
    replay.stop();

    tracing::info!("Finished as {:?} after {} frames", report.state, report.frames());
    for scan in &report.scans {
        tracing::info!(
            "{}: {} frames, {} skipped, peak {} workers",
            scan.source,
            scan.frames,
            scan.skipped_sequences,
            scan.peak_workers
        );
    }
    tracing::info!("Metrics: {}", coordinator.metrics_snapshot());
    let stats = pool.stats();
    tracing::info!(
        "Frame pool: {} allocations, {} reuses, high water {}, {:.1} MB held",
        stats.allocations,
        stats.reuses,
        stats.high_water,
        stats.memory_mb()
    );
    Ok(())
}

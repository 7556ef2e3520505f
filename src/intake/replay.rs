use super::stream::{PixelFormat, StreamFeeder, StreamPicture};
use crate::error::AppError;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

/// Plays a directory of images into a stream source at a fixed rate, standing
/// in for a live video decoder.
pub struct ReplayDecoder {
    cancel_token: CancellationToken,
    replay_thread: Option<std::thread::JoinHandle<()>>,
}

impl ReplayDecoder {
    pub fn spawn(
        dir: &Path,
        fps: u32,
        looped: bool,
        feeder: StreamFeeder,
    ) -> Result<Self, AppError> {
        let pictures = load_pictures(dir)?;
        if pictures.is_empty() {
            return Err(AppError::Pipeline(format!(
                "No replay frames found in {}",
                dir.display()
            )));
        }
        tracing::info!(
            "Replaying {} frames from {} at {} fps",
            pictures.len(),
            dir.display(),
            fps
        );

        let period = Duration::from_secs_f64(1.0 / fps.max(1) as f64);
        let cancel_token = CancellationToken::new();
        let token = cancel_token.clone();
        let replay_thread = std::thread::spawn(move || {
            run(pictures, period, looped, feeder, token);
        });
        Ok(Self {
            cancel_token,
            replay_thread: Some(replay_thread),
        })
    }

    pub fn stop(&mut self) {
        self.cancel_token.cancel();
        if let Some(thread) = self.replay_thread.take() {
            if thread.join().is_err() {
                tracing::error!("Replay thread panicked");
            }
        }
    }
}

impl Drop for ReplayDecoder {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    pictures: Vec<StreamPicture>,
    period: Duration,
    looped: bool,
    feeder: StreamFeeder,
    cancel_token: CancellationToken,
) {
    loop {
        for picture in &pictures {
            if cancel_token.is_cancelled() || !feeder.push(picture.clone()) {
                return;
            }
            std::thread::sleep(period);
        }
        if !looped {
            tracing::info!("Replay finished");
            return;
        }
    }
}

fn frame_paths(dir: &Path) -> Result<Vec<PathBuf>, std::io::Error> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let known = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()));
        if known {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

fn load_pictures(dir: &Path) -> Result<Vec<StreamPicture>, AppError> {
    frame_paths(dir)?
        .into_iter()
        .map(|path| {
            let rgba = image::open(&path)?.to_rgba8();
            let (width, height) = rgba.dimensions();
            Ok(StreamPicture {
                width,
                height,
                format: PixelFormat::Rgba8,
                data: Bytes::from(rgba.into_raw()),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceSettings;
    use crate::error::CaptureError;
    use crate::intake::buffer_pool::FramePool;
    use crate::intake::source::{CaptureOutcome, FrameSource};
    use crate::intake::stream::{StreamLocator, StreamSource};
    use image::{Rgba, RgbaImage};

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("codegrab-replay-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn empty_directory_is_rejected() {
        let dir = temp_dir();
        std::fs::write(dir.join("notes.txt"), "not a frame").unwrap();
        let settings = SourceSettings::default();
        let (_source, feeder) =
            StreamSource::channel(StreamLocator("replay".into()), &settings, FramePool::new(1));
        assert!(ReplayDecoder::spawn(&dir, 30, false, feeder).is_err());
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn replays_frames_in_order_then_ends() {
        let dir = temp_dir();
        RgbaImage::from_pixel(3, 2, Rgba([10, 10, 10, 255]))
            .save(dir.join("000.png"))
            .unwrap();
        RgbaImage::from_pixel(3, 2, Rgba([20, 20, 20, 255]))
            .save(dir.join("001.png"))
            .unwrap();

        let settings = SourceSettings {
            frame_stride: 1,
            queue_depth: 4,
            ..SourceSettings::default()
        };
        let (mut source, feeder) =
            StreamSource::channel(StreamLocator("replay".into()), &settings, FramePool::new(2));
        let mut replay = ReplayDecoder::spawn(&dir, 1000, false, feeder).unwrap();

        let mut seen = Vec::new();
        loop {
            match source.capture_once().await {
                Ok(CaptureOutcome::Frame(frame)) => {
                    assert_eq!((frame.width(), frame.height()), (3, 2));
                    seen.push(frame.rgba()[0]);
                }
                Ok(CaptureOutcome::NotReady) => {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                Err(e) => {
                    assert_eq!(e, CaptureError::StreamEnded);
                    break;
                }
            }
        }
        replay.stop();
        assert!(!seen.is_empty());
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(seen.last(), Some(&20));
        std::fs::remove_dir_all(dir).unwrap();
    }
}

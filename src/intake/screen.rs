use super::buffer_pool::FramePool;
use super::source::{CaptureOutcome, FrameSource};
use crate::common::{Frame, FrameOrigin, Region};
use crate::error::CaptureError;
use async_trait::async_trait;
use chrono::Utc;

/// Platform screen grabber. Implementations are blocking and run on the
/// blocking thread pool.
pub trait ScreenBackend: Send {
    fn name(&self) -> &'static str;

    /// One-time check that the backend works on this machine.
    fn probe(&mut self) -> Result<(), CaptureError>;

    /// Writes `rect` (screen coordinates) as RGBA8 rows into `out`,
    /// which is exactly `rect.width * rect.height * 4` bytes.
    fn grab(&mut self, rect: Region, out: &mut [u8]) -> Result<(), CaptureError>;
}

/// Captures a fixed rectangle of the display.
pub struct ScreenSource {
    backend: Option<Box<dyn ScreenBackend>>,
    backend_name: &'static str,
    target: Region,
    exclude: Option<Region>,
    pool: FramePool,
}

impl ScreenSource {
    /// Probes `hardware` once and falls back to `software` if it is missing or fails.
    pub fn new(
        hardware: Option<Box<dyn ScreenBackend>>,
        mut software: Box<dyn ScreenBackend>,
        target: Region,
        pool: FramePool,
    ) -> Result<Self, CaptureError> {
        if target.is_empty() {
            return Err(CaptureError::TargetGone(format!(
                "empty capture target {}",
                target
            )));
        }

        let mut chosen = None;
        if let Some(mut hardware) = hardware {
            match hardware.probe() {
                Ok(()) => chosen = Some(hardware),
                Err(e) => tracing::warn!(
                    "Hardware capture '{}' unavailable, using '{}': {}",
                    hardware.name(),
                    software.name(),
                    e
                ),
            }
        }
        let backend = match chosen {
            Some(hardware) => hardware,
            None => {
                software.probe()?;
                software
            }
        };

        tracing::info!(
            "Screen capture using '{}' for target {}",
            backend.name(),
            target
        );
        Ok(Self {
            backend_name: backend.name(),
            backend: Some(backend),
            target,
            exclude: None,
            pool,
        })
    }

    /// Masks `overlay` (screen coordinates) out of every captured frame.
    pub fn with_exclusion(mut self, overlay: Region) -> Self {
        self.exclude = Some(overlay);
        self
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend_name
    }

    fn overlay_in_frame(&self) -> Option<Region> {
        let overlap = self.exclude?.intersection(&self.target)?;
        Some(Region::new(
            overlap.x - self.target.x,
            overlap.y - self.target.y,
            overlap.width,
            overlap.height,
        ))
    }
}

#[async_trait]
impl FrameSource for ScreenSource {
    fn describe(&self) -> String {
        format!("screen {} via {}", self.target, self.backend_name)
    }

    fn origin(&self) -> FrameOrigin {
        FrameOrigin::Screen
    }

    async fn capture_once(&mut self) -> Result<CaptureOutcome, CaptureError> {
        let (width, height) = (self.target.width, self.target.height);
        let buffer = self.pool.acquire(Frame::byte_len(width, height)).await?;
        let mut backend = self.backend.take().ok_or(CaptureError::Backend {
            backend: self.backend_name,
            reason: "backend lost after an earlier failure".to_string(),
        })?;

        let rect = self.target;
        let (backend, buffer, grabbed) = tokio::task::spawn_blocking(move || {
            let mut buffer = buffer;
            let grabbed = backend.grab(rect, buffer.as_mut_slice());
            (backend, buffer, grabbed)
        })
        .await
        .map_err(|e| CaptureError::Backend {
            backend: self.backend_name,
            reason: e.to_string(),
        })?;
        self.backend = Some(backend);
        grabbed?;

        let mut frame = Frame::new(FrameOrigin::Screen, width, height, Utc::now(), buffer)?;
        if let Some(overlay) = self.overlay_in_frame() {
            frame.mask_out(&overlay);
        }
        Ok(CaptureOutcome::Frame(frame))
    }
}

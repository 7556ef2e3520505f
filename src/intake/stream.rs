use super::buffer_pool::FramePool;
use super::source::{CaptureOutcome, FrameSource};
use crate::common::{Frame, FrameOrigin};
use crate::config::SourceSettings;
use crate::error::CaptureError;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};

/// Larger pictures are rejected before any pool storage is taken.
pub const MAX_PICTURE_SIDE: u32 = 8192;

/// Where a live stream comes from. Resolved to pictures by an external decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamLocator(pub String);

impl std::fmt::Display for StreamLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgba8,
    Bgra8,
    Rgb8,
    Luma8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Rgba8 | PixelFormat::Bgra8 => 4,
            PixelFormat::Rgb8 => 3,
            PixelFormat::Luma8 => 1,
        }
    }
}

/// One decoded picture from the elementary stream.
#[derive(Debug, Clone)]
pub struct StreamPicture {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Bytes,
}

impl StreamPicture {
    fn malformed(&self) -> CaptureError {
        CaptureError::UnsupportedPicture(format!(
            "{}x{} {:?} picture with {} bytes",
            self.width,
            self.height,
            self.format,
            self.data.len()
        ))
    }

    /// Checks the header against the payload. Returns the pixel count.
    fn validate(&self) -> Result<usize, CaptureError> {
        if self.width == 0
            || self.height == 0
            || self.width > MAX_PICTURE_SIDE
            || self.height > MAX_PICTURE_SIDE
        {
            return Err(self.malformed());
        }
        let pixels = self.width as usize * self.height as usize;
        if self.data.len() < pixels * self.format.bytes_per_pixel() {
            return Err(self.malformed());
        }
        Ok(pixels)
    }

    fn write_rgba(&self, out: &mut [u8]) -> Result<(), CaptureError> {
        let pixels = self.validate()?;
        let expected = pixels * self.format.bytes_per_pixel();
        if out.len() < pixels * 4 {
            return Err(self.malformed());
        }

        let src = &self.data[..expected];
        let dst = &mut out[..pixels * 4];
        match self.format {
            PixelFormat::Rgba8 => dst.copy_from_slice(src),
            PixelFormat::Bgra8 => {
                for (d, s) in dst.chunks_exact_mut(4).zip(src.chunks_exact(4)) {
                    d.copy_from_slice(&[s[2], s[1], s[0], s[3]]);
                }
            }
            PixelFormat::Rgb8 => {
                for (d, s) in dst.chunks_exact_mut(4).zip(src.chunks_exact(3)) {
                    d.copy_from_slice(&[s[0], s[1], s[2], 0xFF]);
                }
            }
            PixelFormat::Luma8 => {
                for (d, &l) in dst.chunks_exact_mut(4).zip(src) {
                    d.copy_from_slice(&[l, l, l, 0xFF]);
                }
            }
        }
        Ok(())
    }
}

/// Producer half handed to the stream decoder.
#[derive(Clone)]
pub struct StreamFeeder {
    tx: mpsc::Sender<StreamPicture>,
}

impl StreamFeeder {
    /// Queues a picture, dropping it if the scanner is behind. Returns false
    /// once the scanner side is gone.
    pub fn push(&self, picture: StreamPicture) -> bool {
        match self.tx.try_send(picture) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::debug!("Stream queue full, dropping picture");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Frames from a decoded live stream. Never blocks waiting for the stream.
pub struct StreamSource {
    locator: StreamLocator,
    rx: mpsc::Receiver<StreamPicture>,
    pool: FramePool,
    frame_stride: u64,
    received: u64,
    last_frame_at: Instant,
    stall_warn_after: Duration,
    stall_reported: bool,
}

impl StreamSource {
    pub fn channel(
        locator: StreamLocator,
        settings: &SourceSettings,
        pool: FramePool,
    ) -> (Self, StreamFeeder) {
        let (tx, rx) = mpsc::channel(settings.queue_depth.max(1));
        let source = Self {
            locator,
            rx,
            pool,
            frame_stride: settings.frame_stride.max(1) as u64,
            received: 0,
            last_frame_at: Instant::now(),
            stall_warn_after: Duration::from_millis(settings.stall_warn_after_ms),
            stall_reported: false,
        };
        (source, StreamFeeder { tx })
    }

    /// Drains the queue and keeps the newest picture that falls on the stride.
    fn newest_eligible(&mut self) -> Result<Option<StreamPicture>, CaptureError> {
        let mut newest = None;
        loop {
            match self.rx.try_recv() {
                Ok(picture) => {
                    // any picture proves the stream is alive, on stride or not
                    self.last_frame_at = Instant::now();
                    self.stall_reported = false;
                    self.received += 1;
                    if (self.received - 1) % self.frame_stride == 0 {
                        newest = Some(picture);
                    }
                }
                Err(TryRecvError::Empty) => return Ok(newest),
                Err(TryRecvError::Disconnected) => {
                    return match newest {
                        Some(picture) => Ok(Some(picture)),
                        None => Err(CaptureError::StreamEnded),
                    }
                }
            }
        }
    }
}

#[async_trait]
impl FrameSource for StreamSource {
    fn describe(&self) -> String {
        format!("stream {}", self.locator)
    }

    fn origin(&self) -> FrameOrigin {
        FrameOrigin::Stream
    }

    async fn capture_once(&mut self) -> Result<CaptureOutcome, CaptureError> {
        let Some(picture) = self.newest_eligible()? else {
            if !self.stall_reported && self.last_frame_at.elapsed() >= self.stall_warn_after {
                tracing::warn!(
                    "Stream {} stalled, no picture for {:?}",
                    self.locator,
                    self.last_frame_at.elapsed()
                );
                self.stall_reported = true;
            }
            return Ok(CaptureOutcome::NotReady);
        };

        if let Err(e) = picture.validate() {
            tracing::warn!("Skipping malformed stream picture: {}", e);
            return Ok(CaptureOutcome::NotReady);
        }
        let mut buffer = self
            .pool
            .acquire(Frame::byte_len(picture.width, picture.height))
            .await?;
        if let Err(e) = picture.write_rgba(buffer.as_mut_slice()) {
            tracing::warn!("Skipping malformed stream picture: {}", e);
            return Ok(CaptureOutcome::NotReady);
        }
        let frame = Frame::new(
            FrameOrigin::Stream,
            picture.width,
            picture.height,
            Utc::now(),
            buffer,
        )?;
        Ok(CaptureOutcome::Frame(frame))
    }
}

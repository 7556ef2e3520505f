use crate::common::{Frame, FrameOrigin};
use crate::error::CaptureError;
use async_trait::async_trait;

#[derive(Debug)]
pub enum CaptureOutcome {
    Frame(Frame),
    /// Nothing new to look at yet; try again next tick.
    NotReady,
}

/// Something that produces frames for the scanner. The variant is chosen when
/// the pipeline is built.
#[async_trait]
pub trait FrameSource: Send {
    /// Short label for logs and events.
    fn describe(&self) -> String;

    fn origin(&self) -> FrameOrigin;

    /// Captures one frame. An `Err` is terminal for this source.
    async fn capture_once(&mut self) -> Result<CaptureOutcome, CaptureError>;
}

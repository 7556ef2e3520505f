pub mod buffer_pool;
pub mod replay;
pub mod screen;
pub mod source;
pub mod stream;

pub use buffer_pool::{FramePool, PoolStats, PooledBuffer};
pub use replay::ReplayDecoder;
pub use screen::{ScreenBackend, ScreenSource};
pub use source::{CaptureOutcome, FrameSource};
pub use stream::{PixelFormat, StreamFeeder, StreamLocator, StreamPicture, StreamSource};

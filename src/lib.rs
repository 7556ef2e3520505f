pub mod common;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod intake;
pub mod pipeline;
pub mod submission;

pub use config::Settings;
pub use coordinator::{Coordinator, CoordinatorBuilder, PipelineReport};
pub use error::{AppError, CaptureError, LoginError, ModelError};

use std::path::PathBuf;
use thiserror::Error;

// Main Application Error Type

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration Error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("Invalid settings: {0}")]
    InvalidSettings(String),
    #[error("Capture Error: {0}")]
    Capture(#[from] CaptureError),
    #[error("Model Error: {0}")]
    Model(#[from] ModelError),
    #[error("Login Error: {0}")]
    Login(#[from] LoginError),
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Image Error: {0}")]
    Image(#[from] image::ImageError),
    #[error("Pipeline Error: {0}")]
    Pipeline(String),
}

// Frame capture failures. Every variant is terminal for the pipeline that raised it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Capture target is gone: {0}")]
    TargetGone(String),
    #[error("Stream ended")]
    StreamEnded,
    #[error("Backend '{backend}' unavailable: {reason}")]
    BackendUnavailable {
        backend: &'static str,
        reason: String,
    },
    #[error("Backend '{backend}' failed: {reason}")]
    Backend {
        backend: &'static str,
        reason: String,
    },
    #[error("Unsupported picture: {0}")]
    UnsupportedPicture(String),
    #[error("Frame pool is closed")]
    PoolClosed,
}

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Model artifact not found at {0}")]
    Missing(PathBuf),
    #[error("Failed to read model artifact: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse model artifact: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid model: {0}")]
    Invalid(String),
}

// Errors from a single login attempt. All of them are retryable.
#[derive(Error, Debug)]
pub enum LoginError {
    #[error("Transport error: {0}")]
    Transport(#[from] Box<ureq::Error>),
    #[error("Server returned HTTP {0}")]
    Status(u16),
    #[error("Failed to read response: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unexpected response: {0}")]
    Protocol(String),
    #[error("Request worker failed: {0}")]
    Worker(String),
}

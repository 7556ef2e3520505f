//! Exactly-once submission of decoded tickets to the login endpoint.

pub mod backoff;
pub mod coordinator;
pub mod endpoint;
pub mod instrument;

pub use backoff::SteppedBackoff;
pub use coordinator::SubmissionCoordinator;
pub use endpoint::KuroLoginClient;
pub use instrument::{InstrumentLayer, Instrumented};

use crate::common::Ticket;
use crate::config::ApiSettings;
use std::sync::Arc;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Account credentials passed through to the endpoint untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub token: String,
    pub dev_code: String,
}

impl Credentials {
    pub fn new(token: impl Into<String>, dev_code: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            dev_code: dev_code.into(),
        }
    }

    pub fn from_settings(settings: &ApiSettings) -> Self {
        Self::new(settings.token.clone(), settings.dev_code.clone())
    }
}

#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub ticket: Ticket,
    pub credentials: Arc<Credentials>,
    pub auto_login: bool,
    pub verify_code: String,
}

/// What the endpoint said about a ticket. Transport problems are errors, not
/// responses, so only errors are ever retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginResponse {
    Success,
    Expired,
    InvalidCredentials,
    Rejected { code: i64, message: String },
}

/// Final result of submitting a ticket. Every outcome is terminal for that ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    LoggedIn,
    Expired,
    InvalidCredentials,
    Rejected { code: i64, message: String },
    PermanentFailure { attempts: u32, reason: String },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::LoggedIn)
    }
}

impl From<LoginResponse> for Outcome {
    fn from(response: LoginResponse) -> Self {
        match response {
            LoginResponse::Success => Outcome::LoggedIn,
            LoginResponse::Expired => Outcome::Expired,
            LoginResponse::InvalidCredentials => Outcome::InvalidCredentials,
            LoginResponse::Rejected { code, message } => Outcome::Rejected { code, message },
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::LoggedIn => write!(f, "logged in"),
            Outcome::Expired => write!(f, "code expired"),
            Outcome::InvalidCredentials => write!(f, "credentials rejected, token needs renewal"),
            Outcome::Rejected { code, message } => write!(f, "rejected ({}): {}", code, message),
            Outcome::PermanentFailure { attempts, reason } => {
                write!(f, "gave up after {} attempts: {}", attempts, reason)
            }
        }
    }
}

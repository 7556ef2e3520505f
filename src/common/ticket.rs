use std::sync::Arc;

/// A decoded payload. Equality and hashing use the full payload, which makes
/// it the dedup key for submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ticket(Arc<str>);

impl Ticket {
    pub fn new(payload: impl Into<Arc<str>>) -> Self {
        Self(payload.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First few characters, enough to tell tickets apart in logs.
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(8) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl std::fmt::Display for Ticket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Ticket {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Ticket {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

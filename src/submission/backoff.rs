use crate::config::SubmissionSettings;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tower::retry::Policy;

/// Retry policy that waits through a fixed schedule of delays, then gives up.
///
/// Only errors are retried. A response, whatever it says, is final.
#[derive(Debug, Clone)]
pub struct SteppedBackoff {
    schedule: Arc<[Duration]>,
    jitter: Duration,
    attempt: usize,
}

impl SteppedBackoff {
    pub fn new(schedule: Vec<Duration>, jitter: Duration) -> Self {
        Self {
            schedule: schedule.into(),
            jitter,
            attempt: 0,
        }
    }

    pub fn from_settings(settings: &SubmissionSettings) -> Self {
        Self::new(settings.backoff(), settings.jitter())
    }

    /// Attempts made before giving up: one per delay plus the first.
    pub fn max_attempts(&self) -> u32 {
        self.schedule.len() as u32 + 1
    }

    /// Delay before the next retry, or `None` once the schedule is spent.
    fn next_delay(&mut self) -> Option<Duration> {
        let base = *self.schedule.get(self.attempt)?;
        self.attempt += 1;
        if self.jitter.is_zero() {
            return Some(base);
        }
        let extra = rand::rng().random_range(0..=self.jitter.as_millis() as u64);
        Some(base + Duration::from_millis(extra))
    }
}

impl<Req, Res, E> Policy<Req, Res, E> for SteppedBackoff
where
    Req: Clone,
    E: std::fmt::Display,
{
    type Future = tokio::time::Sleep;

    fn retry(&mut self, _req: &mut Req, result: &mut Result<Res, E>) -> Option<Self::Future> {
        let error = match result {
            Ok(_) => return None,
            Err(e) => e,
        };
        match self.next_delay() {
            Some(delay) => {
                tracing::warn!(
                    "Login attempt {} failed: {}; retrying in {:?}",
                    self.attempt,
                    error,
                    delay
                );
                Some(tokio::time::sleep(delay))
            }
            None => {
                tracing::warn!("Login attempt {} failed: {}; giving up", self.attempt + 1, error);
                None
            }
        }
    }

    fn clone_request(&mut self, req: &Req) -> Option<Req> {
        Some(req.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(values: &[u64]) -> Vec<Duration> {
        values.iter().map(|v| Duration::from_millis(*v)).collect()
    }

    #[test]
    fn walks_schedule_then_stops() {
        let mut policy = SteppedBackoff::new(ms(&[600, 1200, 2000]), Duration::ZERO);
        assert_eq!(policy.max_attempts(), 4);
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(600)));
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(1200)));
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(2000)));
        assert_eq!(policy.next_delay(), None);
    }

    #[test]
    fn jitter_stays_within_bound() {
        let mut policy = SteppedBackoff::new(ms(&[600; 50]), Duration::from_millis(100));
        while let Some(delay) = policy.next_delay() {
            assert!(delay >= Duration::from_millis(600));
            assert!(delay <= Duration::from_millis(700));
        }
    }

    #[tokio::test]
    async fn responses_are_never_retried() {
        let mut policy = SteppedBackoff::new(ms(&[600]), Duration::ZERO);
        let mut req = ();
        let mut ok: Result<u8, String> = Ok(1);
        assert!(Policy::<(), u8, String>::retry(&mut policy, &mut req, &mut ok).is_none());
        let mut err: Result<u8, String> = Err("timeout".to_string());
        assert!(Policy::<(), u8, String>::retry(&mut policy, &mut req, &mut err).is_some());
        assert!(Policy::<(), u8, String>::retry(&mut policy, &mut req, &mut err).is_none());
    }
}

use super::LoginRequest;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;
use tower::Service;
use tower_layer::Layer;
use tracing::{debug, instrument};

/// Wraps a login service so every attempt is timed and logged in its own span.
#[derive(Debug, Clone)]
pub struct Instrumented<S> {
    inner: S,
    name: &'static str,
}

impl<S> Instrumented<S> {
    pub fn new(inner: S, name: &'static str) -> Self {
        Self { inner, name }
    }
}

#[instrument(skip_all, fields(service = name, ticket = %ticket))]
async fn timed<F, R, E>(name: &'static str, ticket: String, attempt: F) -> Result<R, E>
where
    F: Future<Output = Result<R, E>>,
    R: std::fmt::Debug,
    E: std::fmt::Display,
{
    let start = Instant::now();
    debug!("Starting login attempt");

    let result = attempt.await;

    let duration_us = start.elapsed().as_micros() as u64;
    match &result {
        Ok(response) => debug!("Attempt answered {:?} in {}us", response, duration_us),
        Err(e) => tracing::error!("Attempt failed after {}us: {}", duration_us, e),
    }
    result
}

impl<S> Service<LoginRequest> for Instrumented<S>
where
    S: Service<LoginRequest>,
    S::Future: Send + 'static,
    S::Response: std::fmt::Debug + Send + 'static,
    S::Error: std::fmt::Display + Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: LoginRequest) -> Self::Future {
        let ticket = request.ticket.short().to_string();
        let attempt = self.inner.call(request);
        Box::pin(timed(self.name, ticket, attempt))
    }
}

#[derive(Debug, Clone)]
pub struct InstrumentLayer {
    name: &'static str,
}

impl InstrumentLayer {
    pub fn new(name: &'static str) -> Self {
        Self { name }
    }
}

impl<S> Layer<S> for InstrumentLayer {
    type Service = Instrumented<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Instrumented::new(inner, self.name)
    }
}

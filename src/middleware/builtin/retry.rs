use crate::config::dynamic::Retry;
use crate::proxy::{replay_request, BoxFuture, BoxHandler, Handler, HandlerResult, HttpBody, ProxyError};
use http_body_util::BodyExt;
use hyper::http::request::Parts;
use hyper::Request;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const MAX_INTERVAL: Duration = Duration::from_secs(30);

/// Observer notified before every new attempt.
pub trait RetryListener: Send + Sync {
    fn retried(&self, req: &Parts, attempt: u32);
}

/// Re-sends a request when the round trip fails before any response was
/// produced. Application-level error statuses are returned as is.
pub struct RetryMiddleware {
    attempts: u32,
    initial_interval: Duration,
    listeners: Vec<Arc<dyn RetryListener>>,
    next: BoxHandler,
}

impl RetryMiddleware {
    /// `server_count` is the attempt budget used when none is configured.
    pub fn new(config: &Retry, server_count: usize, next: BoxHandler) -> Self {
        let attempts = if config.attempts > 0 {
            config.attempts
        } else {
            u32::try_from(server_count).unwrap_or(u32::MAX)
        };
        Self {
            attempts: attempts.max(1),
            initial_interval: config.initial_interval.as_std(),
            listeners: Vec::new(),
            next,
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn RetryListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    #[inline]
    pub fn max_attempts(&self) -> u32 {
        self.attempts
    }

    /// Wait before attempt `attempt` (1-indexed): nothing before the first,
    /// then the initial interval doubling each time.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 || self.initial_interval.is_zero() {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt - 2);
        self.initial_interval.saturating_mul(factor).min(MAX_INTERVAL)
    }

    async fn serve_with_retries(&self, req: Request<HttpBody>) -> HandlerResult {
        if self.attempts == 1 {
            return self.next.serve(req).await;
        }

        let (parts, body) = req.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| ProxyError::RequestBody(Box::new(e)))?
            .to_bytes();

        let mut attempt = 1;
        loop {
            let result = self.next.serve(replay_request(&parts, body.clone())).await;
            match result {
                Err(e) if e.is_network_error() && attempt < self.attempts => {
                    attempt += 1;
                    debug!("New attempt {} for request {} {}: {}", attempt, parts.method, parts.uri, e);
                    for listener in &self.listeners {
                        listener.retried(&parts, attempt);
                    }
                    let delay = self.delay_for_attempt(attempt);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                result => return result,
            }
        }
    }
}

impl Handler for RetryMiddleware {
    fn serve(&self, req: Request<HttpBody>) -> BoxFuture<'_, HandlerResult> {
        Box::pin(self.serve_with_retries(req))
    }
}

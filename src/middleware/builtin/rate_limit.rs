use crate::config::dynamic::RateLimit;
use crate::middleware::source::SourceExtractor;
use crate::proxy::{status_response, BoxFuture, BoxHandler, Handler, HandlerResult, HttpBody};
use dashmap::DashMap;
use hyper::header::{HeaderValue, RETRY_AFTER};
use hyper::{Request, StatusCode};
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// Tokens are stored in thousandths so slow rates still refill.
const UNIT: u64 = 1000;

/// Bucket count above which idle buckets are dropped on insert.
const CLEANUP_THRESHOLD: usize = 10_000;

/// Token bucket rate limiter keyed by request source.
pub struct RateLimitMiddleware {
    /// 0 disables limiting.
    average: u64,
    period: Duration,
    burst: u64,
    source: SourceExtractor,
    buckets: DashMap<String, TokenBucket>,
    epoch: Instant,
    next: BoxHandler,
}

struct TokenBucket {
    state: Mutex<BucketState>,
}

struct BucketState {
    /// Thousandths of a token.
    tokens: u128,
    /// Nanos since the limiter epoch up to which time has been credited.
    last_update: u64,
}

impl TokenBucket {
    fn new(burst: u64, now_nanos: u64) -> Self {
        Self {
            state: Mutex::new(BucketState {
                tokens: u128::from(burst) * u128::from(UNIT),
                last_update: now_nanos,
            }),
        }
    }

    /// Refill for the time elapsed since the last credit, then try to take
    /// one token. Time worth less than a thousandth of a token stays
    /// uncredited so frequent calls still refill.
    #[inline]
    fn try_acquire(&self, now_nanos: u64, average: u64, period: Duration, burst: u64) -> bool {
        let rate = u128::from(average) * u128::from(UNIT);
        let period_nanos = period.as_nanos().max(1);
        let max = u128::from(burst) * u128::from(UNIT);

        let mut state = self.state.lock();
        let elapsed = now_nanos.saturating_sub(state.last_update);
        let refill = u128::from(elapsed).saturating_mul(rate) / period_nanos;

        if state.tokens.saturating_add(refill) >= max {
            state.tokens = max;
            state.last_update = now_nanos;
        } else if refill > 0 {
            state.tokens += refill;
            let credited = refill.saturating_mul(period_nanos).div_ceil(rate);
            let credited = u64::try_from(credited).unwrap_or(u64::MAX).min(elapsed);
            state.last_update += credited;
        }

        if state.tokens >= u128::from(UNIT) {
            state.tokens -= u128::from(UNIT);
            true
        } else {
            false
        }
    }

    fn idle_since(&self) -> u64 {
        self.state.lock().last_update
    }

    fn remaining(&self) -> u64 {
        u64::try_from(self.state.lock().tokens / u128::from(UNIT)).unwrap_or(u64::MAX)
    }
}

impl RateLimitMiddleware {
    pub fn new(config: &RateLimit, next: BoxHandler) -> Result<Self, String> {
        let period = config.period.as_std();
        if period.is_zero() {
            return Err("rateLimit period must be positive".into());
        }
        let source = SourceExtractor::new(config.source_criterion.as_ref())?;

        Ok(Self {
            average: config.average,
            period,
            burst: config.burst.max(1),
            source,
            buckets: DashMap::new(),
            epoch: Instant::now(),
            next,
        })
    }

    fn now_nanos(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    /// Check whether a request from `key` may proceed.
    pub fn is_allowed(&self, key: &str) -> bool {
        if self.average == 0 {
            return true;
        }
        let now = self.now_nanos();
        if !self.buckets.contains_key(key) && self.buckets.len() >= CLEANUP_THRESHOLD {
            self.cleanup(self.refill_time());
        }
        let bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::new(self.burst, now));
        bucket.try_acquire(now, self.average, self.period, self.burst)
    }

    pub fn remaining(&self, key: &str) -> u64 {
        self.buckets.get(key).map(|b| b.remaining()).unwrap_or(self.burst)
    }

    /// Time for an empty bucket to fill up to burst again.
    fn refill_time(&self) -> Duration {
        self.token_interval().saturating_mul(self.burst.min(u32::MAX as u64) as u32)
    }

    /// Time to earn a single token.
    fn token_interval(&self) -> Duration {
        self.period / self.average.clamp(1, u32::MAX as u64) as u32
    }

    /// Drop buckets that have been idle longer than `max_age`; a full
    /// bucket behaves exactly like a missing one.
    pub fn cleanup(&self, max_age: Duration) {
        let now = self.now_nanos();
        let max_age = max_age.as_nanos() as u64;
        self.buckets
            .retain(|_, bucket| now.saturating_sub(bucket.idle_since()) < max_age);
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Seconds until one token is available again, at least 1.
    fn retry_after(&self) -> u64 {
        let interval = self.token_interval();
        let secs = interval.as_secs() + u64::from(interval.subsec_nanos() > 0);
        secs.max(1)
    }
}

impl Handler for RateLimitMiddleware {
    fn serve(&self, req: Request<HttpBody>) -> BoxFuture<'_, HandlerResult> {
        Box::pin(async move {
            let key = self.source.key(&req).unwrap_or_default();
            if !self.is_allowed(&key) {
                debug!("Rate limit exceeded for source {:?}", key);
                let mut response = status_response(StatusCode::TOO_MANY_REQUESTS);
                response
                    .headers_mut()
                    .insert(RETRY_AFTER, HeaderValue::from(self.retry_after()));
                return Ok(response);
            }
            self.next.serve(req).await
        })
    }
}

use crate::config::dynamic::CircuitBreaker;
use crate::middleware::expression::{Expr, ExpressionError, Signatures, Value};
use crate::proxy::{status_response, BoxFuture, BoxHandler, Handler, HandlerResult, HttpBody};
use hyper::{Request, StatusCode};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Functions available to a circuit breaker expression.
pub const BREAKER_FUNCTIONS: Signatures = &[
    ("NetworkErrorRatio", 0),
    ("ResponseCodeRatio", 4),
    ("LatencyAtQuantileMS", 1),
];

const BUCKETS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
enum State {
    Closed,
    Open { until: Instant },
    HalfOpen { since: Instant, seen: u64, admitted: u64 },
}

#[derive(Debug, Default, Clone)]
struct Bucket {
    second: u64,
    requests: u64,
    network_errors: u64,
    codes: BTreeMap<u16, u64>,
    latencies_ms: BTreeMap<u64, u64>,
}

/// Request outcomes over the last ten one-second buckets.
#[derive(Debug)]
struct RollingMetrics {
    epoch: Instant,
    buckets: Vec<Bucket>,
}

impl RollingMetrics {
    fn new(now: Instant) -> Self {
        Self {
            epoch: now,
            buckets: vec![Bucket::default(); BUCKETS],
        }
    }

    fn second(&self, now: Instant) -> u64 {
        // Offset by one so that a zeroed bucket is never current.
        now.saturating_duration_since(self.epoch).as_secs() + 1
    }

    fn add(&mut self, now: Instant, code: u16, network_error: bool, latency: Duration) {
        let second = self.second(now);
        let bucket = &mut self.buckets[(second % BUCKETS as u64) as usize];
        if bucket.second != second {
            *bucket = Bucket {
                second,
                ..Default::default()
            };
        }
        bucket.requests += 1;
        if network_error {
            bucket.network_errors += 1;
        }
        *bucket.codes.entry(code).or_default() += 1;
        *bucket.latencies_ms.entry(latency.as_millis() as u64).or_default() += 1;
    }

    fn live(&self, now: Instant) -> impl Iterator<Item = &Bucket> {
        let current = self.second(now);
        self.buckets
            .iter()
            .filter(move |b| b.second != 0 && b.second + (BUCKETS as u64) > current)
    }

    fn network_error_ratio(&self, now: Instant) -> f64 {
        let (errors, total) = self
            .live(now)
            .fold((0, 0), |(e, t), b| (e + b.network_errors, t + b.requests));
        ratio(errors, total)
    }

    fn response_code_ratio(&self, now: Instant, from: u16, to: u16, div_from: u16, div_to: u16) -> f64 {
        let count = |lo: u16, hi: u16| -> u64 {
            self.live(now)
                .flat_map(|b| b.codes.range(lo..hi.max(lo)))
                .map(|(_, n)| n)
                .sum()
        };
        ratio(count(from, to), count(div_from, div_to))
    }

    /// Latency in milliseconds at `quantile` percent.
    fn latency_at_quantile(&self, now: Instant, quantile: f64) -> f64 {
        let mut merged: BTreeMap<u64, u64> = BTreeMap::new();
        for bucket in self.live(now) {
            for (ms, n) in &bucket.latencies_ms {
                *merged.entry(*ms).or_default() += n;
            }
        }
        let total: u64 = merged.values().sum();
        if total == 0 {
            return 0.0;
        }
        let target = ((quantile.clamp(0.0, 100.0) / 100.0) * total as f64).ceil().max(1.0) as u64;
        let mut seen = 0;
        for (ms, n) in &merged {
            seen += n;
            if seen >= target {
                return *ms as f64;
            }
        }
        merged.keys().next_back().copied().unwrap_or(0) as f64
    }
}

fn ratio(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

struct Inner {
    state: State,
    last_check: Option<Instant>,
    metrics: RollingMetrics,
}

/// Gates requests on an expression over recent request outcomes.
///
/// Closed: the expression is evaluated at most once per check period and
/// trips the breaker when true. Open: every request gets a 503 until the
/// fallback duration has passed. HalfOpen: a share of requests growing
/// linearly over the recovery duration is let through; the expression
/// tripping again reopens the breaker, otherwise it closes.
pub struct CircuitBreakerMiddleware {
    expression: Expr,
    check_period: Duration,
    fallback_duration: Duration,
    recovery_duration: Duration,
    inner: Mutex<Inner>,
    next: BoxHandler,
}

impl CircuitBreakerMiddleware {
    pub fn new(config: &CircuitBreaker, next: BoxHandler) -> Result<Self, ExpressionError> {
        let expression = Expr::parse(&config.expression, BREAKER_FUNCTIONS)?;
        Ok(Self {
            expression,
            check_period: config.check_period.as_std(),
            fallback_duration: config.fallback_duration.as_std(),
            recovery_duration: config.recovery_duration.as_std(),
            inner: Mutex::new(Inner {
                state: State::Closed,
                last_check: None,
                metrics: RollingMetrics::new(Instant::now()),
            }),
            next,
        })
    }

    pub fn state(&self) -> BreakerState {
        match self.inner.lock().state {
            State::Closed => BreakerState::Closed,
            State::Open { .. } => BreakerState::Open,
            State::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    fn admit(&self, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        if let State::Open { until } = inner.state {
            if now < until {
                return false;
            }
            info!("Circuit breaker half-open, recovering over {:?}", self.recovery_duration);
            inner.state = State::HalfOpen {
                since: now,
                seen: 0,
                admitted: 0,
            };
            inner.metrics = RollingMetrics::new(now);
        }

        match inner.state {
            State::Closed => true,
            State::Open { .. } => false,
            State::HalfOpen { since, seen, admitted } => {
                let elapsed = now.saturating_duration_since(since);
                if elapsed >= self.recovery_duration {
                    info!("Circuit breaker closed");
                    inner.state = State::Closed;
                    inner.metrics = RollingMetrics::new(now);
                    inner.last_check = None;
                    return true;
                }
                let share = elapsed.as_secs_f64() / self.recovery_duration.as_secs_f64();
                let seen = seen + 1;
                let allowed = (admitted as f64) < share * seen as f64;
                inner.state = State::HalfOpen {
                    since,
                    seen,
                    admitted: admitted + u64::from(allowed),
                };
                allowed
            }
        }
    }

    fn record(&self, now: Instant, result: &HandlerResult, latency: Duration) {
        let (code, network_error) = match result {
            Ok(response) => (response.status().as_u16(), false),
            Err(e) => (e.status_code().as_u16(), e.is_network_error()),
        };

        let mut inner = self.inner.lock();
        inner.metrics.add(now, code, network_error, latency);

        if matches!(inner.state, State::Open { .. }) {
            return;
        }
        if inner
            .last_check
            .is_some_and(|last| now.saturating_duration_since(last) < self.check_period)
        {
            return;
        }
        inner.last_check = Some(now);

        let metrics = &inner.metrics;
        let tripped = self.expression.eval(&|name, args| match name {
            "NetworkErrorRatio" => Value::Number(metrics.network_error_ratio(now)),
            "ResponseCodeRatio" => Value::Number(metrics.response_code_ratio(
                now,
                args[0] as u16,
                args[1] as u16,
                args[2] as u16,
                args[3] as u16,
            )),
            "LatencyAtQuantileMS" => Value::Number(metrics.latency_at_quantile(now, args[0])),
            _ => Value::Number(0.0),
        });

        if tripped {
            warn!("Circuit breaker open for {:?}", self.fallback_duration);
            inner.state = State::Open {
                until: now + self.fallback_duration,
            };
        }
    }
}

impl Handler for CircuitBreakerMiddleware {
    fn serve(&self, req: Request<HttpBody>) -> BoxFuture<'_, HandlerResult> {
        Box::pin(async move {
            if !self.admit(Instant::now()) {
                return Ok(status_response(StatusCode::SERVICE_UNAVAILABLE));
            }
            let start = Instant::now();
            let result = self.next.serve(req).await;
            let now = Instant::now();
            self.record(now, &result, now.saturating_duration_since(start));
            result
        })
    }
}

//! HTTP middlewares: the closed set of kinds a configuration may declare,
//! and the builder that wraps a service handler with a router's list.

mod builder;
pub mod builtin;
pub mod expression;
pub mod source;

pub use builder::{MiddlewareBuilder, ServiceTarget};

use crate::config::dynamic::{
    AddPrefix, BasicAuth, Buffering, Chain, CircuitBreaker, ForwardAuth, Headers, InFlightReq, IpAllowList,
    Middleware, RateLimit, ReplacePath, ReplacePathRegex, ReplaceQueryRegex, Retry, StripPrefix,
};
use crate::metrics::MetricsRetryListener;
use crate::proxy::BoxHandler;
use builtin::*;
use std::sync::Arc;

/// One configured middleware, borrowed from its configuration.
#[derive(Debug, Clone, Copy)]
pub enum MiddlewareKind<'a> {
    AddPrefix(&'a AddPrefix),
    StripPrefix(&'a StripPrefix),
    ReplacePath(&'a ReplacePath),
    ReplacePathRegex(&'a ReplacePathRegex),
    ReplaceQueryRegex(&'a ReplaceQueryRegex),
    Headers(&'a Headers),
    IpAllowList(&'a IpAllowList),
    BasicAuth(&'a BasicAuth),
    ForwardAuth(&'a ForwardAuth),
    RateLimit(&'a RateLimit),
    InFlightReq(&'a InFlightReq),
    Retry(&'a Retry),
    Buffering(&'a Buffering),
    CircuitBreaker(&'a CircuitBreaker),
    Chain(&'a Chain),
}

/// Resilience middlewares always sit next to the service, in this order
/// from outermost to innermost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResilienceStage {
    RateLimit,
    InFlight,
    Retry,
    Buffering,
    CircuitBreaker,
}

impl<'a> MiddlewareKind<'a> {
    /// The single kind set on `config`; zero or several is an error.
    pub fn of(config: &'a Middleware) -> Result<Self, String> {
        let kinds: Vec<MiddlewareKind<'a>> = [
            config.add_prefix.as_ref().map(MiddlewareKind::AddPrefix),
            config.strip_prefix.as_ref().map(MiddlewareKind::StripPrefix),
            config.replace_path.as_ref().map(MiddlewareKind::ReplacePath),
            config.replace_path_regex.as_ref().map(MiddlewareKind::ReplacePathRegex),
            config.replace_query_regex.as_ref().map(MiddlewareKind::ReplaceQueryRegex),
            config.headers.as_ref().map(MiddlewareKind::Headers),
            config.ip_allow_list.as_ref().map(MiddlewareKind::IpAllowList),
            config.basic_auth.as_ref().map(MiddlewareKind::BasicAuth),
            config.forward_auth.as_ref().map(MiddlewareKind::ForwardAuth),
            config.rate_limit.as_ref().map(MiddlewareKind::RateLimit),
            config.in_flight_req.as_ref().map(MiddlewareKind::InFlightReq),
            config.retry.as_ref().map(MiddlewareKind::Retry),
            config.buffering.as_ref().map(MiddlewareKind::Buffering),
            config.circuit_breaker.as_ref().map(MiddlewareKind::CircuitBreaker),
            config.chain.as_ref().map(MiddlewareKind::Chain),
        ]
        .into_iter()
        .flatten()
        .collect();

        match kinds.as_slice() {
            [kind] => Ok(*kind),
            [] => Err("no middleware type defined".into()),
            many => Err(format!(
                "exactly one middleware type must be defined, found {}",
                many.len()
            )),
        }
    }

    pub fn stage(&self) -> Option<ResilienceStage> {
        match self {
            MiddlewareKind::RateLimit(_) => Some(ResilienceStage::RateLimit),
            MiddlewareKind::InFlightReq(_) => Some(ResilienceStage::InFlight),
            MiddlewareKind::Retry(_) => Some(ResilienceStage::Retry),
            MiddlewareKind::Buffering(_) => Some(ResilienceStage::Buffering),
            MiddlewareKind::CircuitBreaker(_) => Some(ResilienceStage::CircuitBreaker),
            _ => None,
        }
    }

    /// Wrap `next` with this middleware. Chains are expanded by the builder
    /// and never reach here.
    pub fn apply(&self, target: &ServiceTarget, next: BoxHandler) -> Result<BoxHandler, String> {
        let handler: BoxHandler = match *self {
            MiddlewareKind::AddPrefix(c) => Arc::new(PathRewrite::add_prefix(c, next)?),
            MiddlewareKind::StripPrefix(c) => Arc::new(PathRewrite::strip_prefix(c, next)),
            MiddlewareKind::ReplacePath(c) => Arc::new(PathRewrite::replace_path(c, next)),
            MiddlewareKind::ReplacePathRegex(c) => Arc::new(PathRewrite::replace_path_regex(c, next)?),
            MiddlewareKind::ReplaceQueryRegex(c) => Arc::new(PathRewrite::replace_query_regex(c, next)?),
            MiddlewareKind::Headers(c) => Arc::new(HeadersMiddleware::new(c, next)?),
            MiddlewareKind::IpAllowList(c) => Arc::new(IpAllowListMiddleware::new(c, next)?),
            MiddlewareKind::BasicAuth(c) => Arc::new(BasicAuthMiddleware::new(c, next)?),
            MiddlewareKind::ForwardAuth(c) => Arc::new(ForwardAuthMiddleware::new(c, next)?),
            MiddlewareKind::RateLimit(c) => Arc::new(RateLimitMiddleware::new(c, next)?),
            MiddlewareKind::InFlightReq(c) => Arc::new(InFlightMiddleware::new(c, next)?),
            MiddlewareKind::Retry(c) => Arc::new(
                RetryMiddleware::new(c, target.server_count, next)
                    .with_listener(Arc::new(MetricsRetryListener::new(&target.service))),
            ),
            MiddlewareKind::Buffering(c) => {
                Arc::new(BufferingMiddleware::new(c, next).map_err(|e| format!("retryExpression: {}", e))?)
            }
            MiddlewareKind::CircuitBreaker(c) => {
                Arc::new(CircuitBreakerMiddleware::new(c, next).map_err(|e| format!("expression: {}", e))?)
            }
            MiddlewareKind::Chain(_) => return Err("chain cannot be applied directly".into()),
        };
        Ok(handler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exactly_one_kind() {
        let none = Middleware::default();
        assert_eq!(MiddlewareKind::of(&none).err().unwrap(), "no middleware type defined");

        let two = Middleware {
            add_prefix: Some(AddPrefix { prefix: "/a".into() }),
            retry: Some(Retry::default()),
            ..Default::default()
        };
        assert!(MiddlewareKind::of(&two).is_err());

        let one = Middleware {
            retry: Some(Retry::default()),
            ..Default::default()
        };
        let kind = MiddlewareKind::of(&one).unwrap();
        assert_eq!(kind.stage(), Some(ResilienceStage::Retry));
    }

    #[test]
    fn test_stage_order() {
        let mut stages = vec![
            ResilienceStage::CircuitBreaker,
            ResilienceStage::Retry,
            ResilienceStage::RateLimit,
            ResilienceStage::Buffering,
            ResilienceStage::InFlight,
        ];
        stages.sort();
        assert_eq!(
            stages,
            vec![
                ResilienceStage::RateLimit,
                ResilienceStage::InFlight,
                ResilienceStage::Retry,
                ResilienceStage::Buffering,
                ResilienceStage::CircuitBreaker,
            ]
        );
    }
}

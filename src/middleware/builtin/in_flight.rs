use crate::config::dynamic::InFlightReq;
use crate::middleware::source::SourceExtractor;
use crate::proxy::{status_response, BoxFuture, BoxHandler, Handler, HandlerResult, HttpBody};
use bytes::Bytes;
use dashmap::DashMap;
use http_body_util::BodyExt;
use hyper::body::{Body, Frame, SizeHint};
use hyper::{Request, StatusCode};
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::debug;

/// Caps the number of requests in progress per source. A request counts
/// until its response body has been fully sent or dropped.
pub struct InFlightMiddleware {
    amount: u64,
    source: SourceExtractor,
    counters: Arc<DashMap<String, u64>>,
    next: BoxHandler,
}

/// One unit of the per-source budget, released on drop.
struct Permit {
    counters: Arc<DashMap<String, u64>>,
    key: String,
}

impl Drop for Permit {
    fn drop(&mut self) {
        if let Some(mut count) = self.counters.get_mut(&self.key) {
            *count = count.saturating_sub(1);
        }
        self.counters.remove_if(&self.key, |_, count| *count == 0);
    }
}

pin_project! {
    struct GuardedBody {
        #[pin]
        inner: HttpBody,
        permit: Permit,
    }
}

impl Body for GuardedBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        self.project().inner.poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl InFlightMiddleware {
    pub fn new(config: &InFlightReq, next: BoxHandler) -> Result<Self, String> {
        if config.amount == 0 {
            return Err("inFlightReq amount must be positive".into());
        }
        Ok(Self {
            amount: config.amount,
            source: SourceExtractor::new(config.source_criterion.as_ref())?,
            counters: Arc::new(DashMap::new()),
            next,
        })
    }

    fn acquire(&self, key: String) -> Option<Permit> {
        let mut count = self.counters.entry(key.clone()).or_insert(0);
        if *count >= self.amount {
            return None;
        }
        *count += 1;
        drop(count);
        Some(Permit {
            counters: self.counters.clone(),
            key,
        })
    }

    pub fn in_flight(&self, key: &str) -> u64 {
        self.counters.get(key).map(|c| *c).unwrap_or(0)
    }
}

impl Handler for InFlightMiddleware {
    fn serve(&self, req: Request<HttpBody>) -> BoxFuture<'_, HandlerResult> {
        Box::pin(async move {
            let key = self.source.key(&req).unwrap_or_default();
            let Some(permit) = self.acquire(key) else {
                debug!("Too many in-flight requests");
                return Ok(status_response(StatusCode::TOO_MANY_REQUESTS));
            };
            let response = self.next.serve(req).await?;
            Ok(response.map(|inner| GuardedBody { inner, permit }.boxed()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::dynamic::SourceCriterion;
    use crate::proxy::{empty_body, full_body, handler_fn};
    use hyper::Response;
    use tokio::sync::oneshot;

    fn middleware(amount: u64, next: BoxHandler) -> Arc<InFlightMiddleware> {
        let config = InFlightReq {
            amount,
            source_criterion: Some(SourceCriterion {
                request_header_name: Some("x-client".into()),
                ..Default::default()
            }),
        };
        Arc::new(InFlightMiddleware::new(&config, next).unwrap())
    }

    fn request(client: &str) -> Request<HttpBody> {
        Request::builder()
            .header("x-client", client)
            .body(empty_body())
            .unwrap()
    }

    #[tokio::test]
    async fn test_limit_held_until_body_dropped() {
        let middleware = middleware(1, handler_fn(|_| async { Ok(Response::new(full_body("data"))) }));

        let first = middleware.serve(request("a")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(middleware.in_flight("a"), 1);

        let rejected = middleware.serve(request("a")).await.unwrap();
        assert_eq!(rejected.status(), StatusCode::TOO_MANY_REQUESTS);

        let other = middleware.serve(request("b")).await.unwrap();
        assert_eq!(other.status(), StatusCode::OK);

        let body = first.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, "data".as_bytes());
        assert_eq!(middleware.in_flight("a"), 0);

        drop(other);
        assert_eq!(middleware.in_flight("b"), 0);
        assert_eq!(middleware.serve(request("a")).await.unwrap().status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_limit_applies_while_waiting_for_backend() {
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let release_rx = Arc::new(parking_lot::Mutex::new(Some(release_rx)));
        let next = handler_fn(move |_| {
            let rx = release_rx.lock().take();
            async move {
                if let Some(rx) = rx {
                    let _ = rx.await;
                }
                Ok(Response::new(empty_body()))
            }
        });
        let middleware = middleware(1, next);

        let pending = tokio::spawn({
            let middleware = middleware.clone();
            async move { middleware.serve(request("a")).await.unwrap().status() }
        });
        while middleware.in_flight("a") == 0 {
            tokio::task::yield_now().await;
        }

        let rejected = middleware.serve(request("a")).await.unwrap();
        assert_eq!(rejected.status(), StatusCode::TOO_MANY_REQUESTS);

        release_tx.send(()).unwrap();
        assert_eq!(pending.await.unwrap(), StatusCode::OK);
        assert_eq!(middleware.in_flight("a"), 0);
    }

    #[tokio::test]
    async fn test_error_releases_permit() {
        let next = handler_fn(|_| async { Err(crate::proxy::ProxyError::NoAvailableServer) });
        let middleware = middleware(1, next);
        assert!(middleware.serve(request("a")).await.is_err());
        assert_eq!(middleware.in_flight("a"), 0);
    }

    #[test]
    fn test_zero_amount_rejected() {
        let next = handler_fn(|_| async { Ok(Response::new(empty_body())) });
        assert!(InFlightMiddleware::new(&InFlightReq::default(), next).is_err());
    }
}

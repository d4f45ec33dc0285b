//! HTTP handler abstraction and the reverse-proxy forwarder.

mod error;
mod forwarder;

pub use error::{status_response, BoxError, ProxyError};
pub use forwarder::{Forwarder, HttpClient};
pub(crate) use forwarder::strip_hop_by_hop;
pub use futures::future::BoxFuture;

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::http::request::Parts;
use hyper::{Request, Response};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

pub type HttpBody = BoxBody<Bytes, hyper::Error>;

pub type HandlerResult = Result<Response<HttpBody>, ProxyError>;

/// Anything that turns a request into a response: middlewares, load
/// balancers and the forwarder all implement it.
pub trait Handler: Send + Sync {
    fn serve(&self, req: Request<HttpBody>) -> BoxFuture<'_, HandlerResult>;
}

pub type BoxHandler = Arc<dyn Handler>;

/// Downstream connection details, inserted into request extensions by the
/// entry point.
#[derive(Debug, Clone, Copy)]
pub struct ClientInfo {
    pub remote_addr: SocketAddr,
    pub tls: bool,
}

impl ClientInfo {
    pub fn of<B>(req: &Request<B>) -> Option<ClientInfo> {
        req.extensions().get::<ClientInfo>().copied()
    }
}

struct HandlerFn<F>(F);

impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Request<HttpBody>) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn serve(&self, req: Request<HttpBody>) -> BoxFuture<'_, HandlerResult> {
        Box::pin((self.0)(req))
    }
}

/// Build a handler from an async closure.
pub fn handler_fn<F, Fut>(f: F) -> BoxHandler
where
    F: Fn(Request<HttpBody>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(HandlerFn(f))
}

#[inline]
pub fn full_body<T: Into<Bytes>>(content: T) -> HttpBody {
    Full::new(content.into())
        .map_err(|never| match never {})
        .boxed()
}

#[inline]
pub fn empty_body() -> HttpBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

/// A fresh request with the same head as `parts` and `body` as payload,
/// for handlers that send one request several times.
pub(crate) fn replay_request(parts: &Parts, body: Bytes) -> Request<HttpBody> {
    let mut req = Request::new(full_body(body));
    *req.method_mut() = parts.method.clone();
    *req.uri_mut() = parts.uri.clone();
    *req.version_mut() = parts.version;
    *req.headers_mut() = parts.headers.clone();
    *req.extensions_mut() = parts.extensions.clone();
    req
}

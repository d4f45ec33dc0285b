use super::{full_body, HttpBody};
use hyper::header::CONTENT_TYPE;
use hyper::{Response, StatusCode};
use std::error::Error as StdError;
use thiserror::Error;

pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Failure on the request path, before a response could be produced.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("no available server")]
    NoAvailableServer,

    #[error("error connecting to backend {backend}: {source}")]
    Connect {
        backend: String,
        #[source]
        source: BoxError,
    },

    #[error("error from backend {backend}: {source}")]
    Backend {
        backend: String,
        #[source]
        source: BoxError,
    },

    #[error("timeout waiting for backend {backend}")]
    Timeout { backend: String },

    #[error("error reading request body: {0}")]
    RequestBody(#[source] BoxError),

    #[error("invalid backend URI: {0}")]
    InvalidUri(String),
}

impl ProxyError {
    /// Whether the failure happened while talking to a backend, as opposed
    /// to a local or client-side condition.
    pub fn is_network_error(&self) -> bool {
        matches!(
            self,
            ProxyError::Connect { .. } | ProxyError::Backend { .. } | ProxyError::Timeout { .. }
        )
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::NoAvailableServer => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Connect { .. } | ProxyError::Backend { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::RequestBody(_) => StatusCode::BAD_REQUEST,
            ProxyError::InvalidUri(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn into_response(self) -> Response<HttpBody> {
        let status = self.status_code();
        status_response(status)
    }
}

/// Plain-text response carrying the canonical reason phrase of `status`.
pub fn status_response(status: StatusCode) -> Response<HttpBody> {
    let mut response = Response::new(full_body(status.canonical_reason().unwrap_or("")));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ProxyError::NoAvailableServer.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ProxyError::Timeout { backend: "b".into() }.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        let connect = ProxyError::Connect {
            backend: "http://10.0.0.1:80".into(),
            source: "refused".into(),
        };
        assert_eq!(connect.status_code(), StatusCode::BAD_GATEWAY);
        assert!(connect.is_network_error());
    }

    #[test]
    fn test_no_available_server_is_not_network_error() {
        assert!(!ProxyError::NoAvailableServer.is_network_error());
        assert!(!ProxyError::InvalidUri("x".into()).is_network_error());
    }

    #[test]
    fn test_into_response() {
        let response = ProxyError::NoAvailableServer.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers()[CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );
    }
}

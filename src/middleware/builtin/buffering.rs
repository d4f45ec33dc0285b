use crate::config::dynamic::Buffering;
use crate::middleware::expression::{Expr, ExpressionError, Signatures, Value};
use crate::proxy::{
    full_body, replay_request, status_response, BoxFuture, BoxHandler, Handler, HandlerResult, HttpBody, ProxyError,
};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use hyper::{Request, Response, StatusCode};
use tracing::{debug, warn};

/// Functions available to `retryExpression`.
pub const RETRY_FUNCTIONS: Signatures = &[("IsNetworkError", 0), ("Attempts", 0), ("ResponseCode", 0)];

/// Upper bound on attempts whatever the retry expression says.
const MAX_ATTEMPTS: u32 = 10;

/// Reads whole request and response bodies into memory, enforcing size
/// limits, so that a request can be replayed when `retryExpression` holds.
pub struct BufferingMiddleware {
    max_request_body_bytes: usize,
    max_response_body_bytes: usize,
    retry: Option<Expr>,
    next: BoxHandler,
}

impl BufferingMiddleware {
    pub fn new(config: &Buffering, next: BoxHandler) -> Result<Self, ExpressionError> {
        let retry = match config.retry_expression.trim() {
            "" => None,
            expr => Some(Expr::parse(expr, RETRY_FUNCTIONS)?),
        };
        Ok(Self {
            max_request_body_bytes: limit(config.max_request_body_bytes),
            max_response_body_bytes: limit(config.max_response_body_bytes),
            retry,
            next,
        })
    }

    fn should_retry(&self, result: &HandlerResult, attempts: u32) -> bool {
        let Some(expr) = &self.retry else {
            return false;
        };
        if attempts >= MAX_ATTEMPTS {
            return false;
        }
        let (network_error, code) = match result {
            Ok(response) => (false, response.status().as_u16()),
            Err(e) => (e.is_network_error(), e.status_code().as_u16()),
        };
        expr.eval(&|name, _| match name {
            "IsNetworkError" => Value::Bool(network_error),
            "Attempts" => Value::Number(attempts as f64),
            "ResponseCode" => Value::Number(code as f64),
            _ => Value::Number(0.0),
        })
    }

    async fn buffer(&self, req: Request<HttpBody>) -> HandlerResult {
        let declared = req
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        if declared.is_some_and(|len| len > self.max_request_body_bytes as u64) {
            debug!("Request body of {:?} bytes over buffering limit", declared);
            return Ok(status_response(StatusCode::PAYLOAD_TOO_LARGE));
        }

        let (parts, body) = req.into_parts();
        let body = match Limited::new(body, self.max_request_body_bytes).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.is::<LengthLimitError>() => {
                return Ok(status_response(StatusCode::PAYLOAD_TOO_LARGE));
            }
            Err(e) => return Err(ProxyError::RequestBody(e)),
        };

        let mut attempts = 1;
        let result = loop {
            let result = self.next.serve(replay_request(&parts, body.clone())).await;
            if !self.should_retry(&result, attempts) {
                break result;
            }
            attempts += 1;
            debug!("Buffering retry, attempt {} for {} {}", attempts, parts.method, parts.uri);
        };

        let response = result?;
        let (mut head, body) = response.into_parts();
        let body = match Limited::new(body, self.max_response_body_bytes).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.is::<LengthLimitError>() => {
                warn!("Response body for {} over buffering limit", parts.uri);
                return Ok(status_response(StatusCode::INTERNAL_SERVER_ERROR));
            }
            Err(e) => {
                warn!("Error reading response body for {}: {}", parts.uri, e);
                return Ok(status_response(StatusCode::BAD_GATEWAY));
            }
        };
        head.headers.remove(TRANSFER_ENCODING);
        head.headers.insert(CONTENT_LENGTH, body.len().into());
        Ok(Response::from_parts(head, full_body(body)))
    }
}

/// 0 means unlimited.
fn limit(bytes: u64) -> usize {
    match bytes {
        0 => usize::MAX,
        n => usize::try_from(n).unwrap_or(usize::MAX),
    }
}

impl Handler for BufferingMiddleware {
    fn serve(&self, req: Request<HttpBody>) -> BoxFuture<'_, HandlerResult> {
        Box::pin(self.buffer(req))
    }
}

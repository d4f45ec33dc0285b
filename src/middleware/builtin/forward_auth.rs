use crate::config::dynamic::ForwardAuth;
use crate::proxy::{
    full_body, status_response, strip_hop_by_hop, BoxFuture, BoxHandler, ClientInfo, Handler, HandlerResult,
    HttpBody,
};
use hyper::header::{HeaderName, HeaderValue, CONTENT_LENGTH, HOST};
use hyper::{HeaderMap, Request, Response, StatusCode};
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

const AUTH_TIMEOUT: Duration = Duration::from_secs(30);

/// ForwardAuth middleware delegates authentication to an external service.
/// A 2xx answer lets the request through; anything else is returned to the
/// client as is.
pub struct ForwardAuthMiddleware {
    client: Client,
    address: String,
    trust_forward_header: bool,
    auth_response_headers: Vec<HeaderName>,
    next: BoxHandler,
}

impl ForwardAuthMiddleware {
    pub fn new(config: &ForwardAuth, next: BoxHandler) -> Result<Self, String> {
        if config.address.is_empty() {
            return Err("forwardAuth address is empty".into());
        }
        reqwest::Url::parse(&config.address).map_err(|e| format!("invalid address {:?}: {}", config.address, e))?;

        let client = Client::builder()
            .timeout(AUTH_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| e.to_string())?;

        let auth_response_headers = config
            .auth_response_headers
            .iter()
            .map(|h| HeaderName::try_from(h.as_str()).map_err(|_| format!("invalid header name {:?}", h)))
            .collect::<Result<_, _>>()?;

        Ok(Self {
            client,
            address: config.address.clone(),
            trust_forward_header: config.trust_forward_header,
            auth_response_headers,
            next,
        })
    }

    /// Headers sent to the auth server: the original ones plus the
    /// `X-Forwarded-*` description of the request.
    fn auth_headers<B>(&self, req: &Request<B>) -> HeaderMap {
        let mut headers = req.headers().clone();
        strip_hop_by_hop(&mut headers);
        headers.remove(CONTENT_LENGTH);
        headers.remove(HOST);

        let client = ClientInfo::of(req);
        let host = req
            .headers()
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .or_else(|| req.uri().authority().map(|a| a.as_str()))
            .unwrap_or_default()
            .to_string();
        let proto = if client.is_some_and(|c| c.tls) { "https" } else { "http" };
        let uri = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_string();

        let forwarded = [
            ("x-forwarded-method", req.method().to_string()),
            ("x-forwarded-proto", proto.to_string()),
            ("x-forwarded-host", host),
            ("x-forwarded-uri", uri),
            (
                "x-forwarded-for",
                client.map(|c| c.remote_addr.ip().to_string()).unwrap_or_default(),
            ),
        ];

        for (name, value) in forwarded {
            if self.trust_forward_header && headers.contains_key(name) {
                continue;
            }
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.insert(name, value);
            }
        }

        headers
    }

    async fn authorize(&self, mut req: Request<HttpBody>) -> HandlerResult {
        let auth_req = self
            .client
            .get(&self.address)
            .headers(self.auth_headers(&req));

        let auth_response = match auth_req.send().await {
            Ok(r) => r,
            Err(e) => {
                warn!("Forward auth request to {} failed: {}", self.address, e);
                return Ok(status_response(StatusCode::INTERNAL_SERVER_ERROR));
            }
        };

        let status = auth_response.status();
        if !status.is_success() {
            debug!("Forward auth denied with status {}", status);
            let mut headers = auth_response.headers().clone();
            strip_hop_by_hop(&mut headers);
            headers.remove(CONTENT_LENGTH);
            let body = auth_response.bytes().await.unwrap_or_default();

            let mut response = Response::new(full_body(body));
            *response.status_mut() = status;
            *response.headers_mut() = headers;
            return Ok(response);
        }

        for name in &self.auth_response_headers {
            req.headers_mut().remove(name);
            for value in auth_response.headers().get_all(name) {
                req.headers_mut().append(name.clone(), value.clone());
            }
        }

        self.next.serve(req).await
    }
}

impl Handler for ForwardAuthMiddleware {
    fn serve(&self, req: Request<HttpBody>) -> BoxFuture<'_, HandlerResult> {
        Box::pin(self.authorize(req))
    }
}

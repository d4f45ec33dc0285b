use super::{BoxFuture, ClientInfo, Handler, HandlerResult, HttpBody, ProxyError};
use crate::config::ForwardingConfig;
use http_body_util::BodyExt;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST, TE};
use hyper::{Request, Response, Uri, Version};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::{Client, ResponseFuture};
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, warn};

static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
static X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
static X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

fn hop_by_hop_headers() -> &'static [&'static str] {
    &[
        "connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "proxy-connection",
        "te",
        "trailer",
        "transfer-encoding",
        "upgrade",
    ]
}

/// Remove hop-by-hop headers, including any listed in `Connection`.
/// `TE: trailers` survives so trailers keep flowing end to end.
pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let keep_trailers = headers
        .get_all(TE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("trailers")));

    let named: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect();

    for name in named {
        headers.remove(name.as_str());
    }
    for name in hop_by_hop_headers() {
        headers.remove(*name);
    }

    if keep_trailers {
        headers.insert(TE, HeaderValue::from_static("trailers"));
    }
}

/// Shared outbound HTTP client. Cheap to clone.
#[derive(Clone)]
pub struct HttpClient {
    client: Client<HttpsConnector<HttpConnector>, HttpBody>,
    response_header_timeout: Option<Duration>,
}

impl HttpClient {
    pub fn new(config: &ForwardingConfig) -> Result<Self, rustls::Error> {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.set_reuse_address(true);
        connector.enforce_http(false);
        connector.set_connect_timeout(Some(config.dial_timeout.as_std()));

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = match hyper_rustls::HttpsConnectorBuilder::new()
            .with_provider_and_native_roots(provider.clone())
        {
            Ok(builder) => builder,
            Err(e) => {
                warn!("No native root certificates available ({}), HTTPS backends will not verify", e);
                let tls = rustls::ClientConfig::builder_with_provider(provider)
                    .with_safe_default_protocol_versions()?
                    .with_root_certificates(rustls::RootCertStore::empty())
                    .with_no_client_auth();
                hyper_rustls::HttpsConnectorBuilder::new().with_tls_config(tls)
            }
        };
        let https = builder.https_or_http().enable_http1().wrap_connector(connector);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(config.idle_conn_timeout.as_std())
            .pool_max_idle_per_host(config.max_idle_conns_per_host)
            .retry_canceled_requests(true)
            .set_host(true)
            .build(https);

        let response_header_timeout =
            (!config.response_header_timeout.is_zero()).then(|| config.response_header_timeout.as_std());

        Ok(Self {
            client,
            response_header_timeout,
        })
    }

    /// Send a request without any forwarding rewrites.
    pub fn request(&self, req: Request<HttpBody>) -> ResponseFuture {
        self.client.request(req)
    }
}

/// Reverse proxy to a single backend server.
pub struct Forwarder {
    backend: String,
    target: Uri,
    pass_host_header: bool,
    client: HttpClient,
}

impl Forwarder {
    pub fn new(backend: &str, pass_host_header: bool, client: HttpClient) -> Result<Self, ProxyError> {
        let target: Uri = backend
            .parse()
            .map_err(|e| ProxyError::InvalidUri(format!("{}: {}", backend, e)))?;
        if target.authority().is_none() {
            return Err(ProxyError::InvalidUri(format!("{}: missing host", backend)));
        }

        Ok(Self {
            backend: backend.to_string(),
            target,
            pass_host_header,
            client,
        })
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    #[inline]
    fn build_backend_uri(&self, original_uri: &Uri) -> Result<Uri, ProxyError> {
        let path_and_query = original_uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        let uri_string = format!(
            "{}://{}{}",
            self.target.scheme_str().unwrap_or("http"),
            self.target.authority().map(|a| a.as_str()).unwrap_or(""),
            path_and_query,
        );

        uri_string
            .parse()
            .map_err(|e| ProxyError::InvalidUri(format!("{}: {}", uri_string, e)))
    }

    fn build_proxied_request(&self, req: Request<HttpBody>) -> Result<Request<HttpBody>, ProxyError> {
        let client = ClientInfo::of(&req);
        let (mut parts, body) = req.into_parts();

        let original_host = parts
            .headers
            .get(HOST)
            .cloned()
            .or_else(|| {
                parts
                    .uri
                    .authority()
                    .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
            });

        parts.uri = self.build_backend_uri(&parts.uri)?;
        parts.version = Version::HTTP_11;

        strip_hop_by_hop(&mut parts.headers);

        if let Some(client) = client {
            let ip = client.remote_addr.ip().to_string();
            let xff = match parts.headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
                Some(existing) => format!("{}, {}", existing, ip),
                None => ip,
            };
            if let Ok(val) = HeaderValue::from_str(&xff) {
                parts.headers.insert(X_FORWARDED_FOR.clone(), val);
            }

            let proto = if client.tls { "https" } else { "http" };
            parts
                .headers
                .insert(X_FORWARDED_PROTO.clone(), HeaderValue::from_static(proto));
        }

        if let Some(host) = &original_host {
            if !parts.headers.contains_key(&X_FORWARDED_HOST) {
                parts.headers.insert(X_FORWARDED_HOST.clone(), host.clone());
            }
        }

        if self.pass_host_header {
            if let Some(host) = original_host {
                parts.headers.insert(HOST, host);
            }
        } else if let Some(authority) = parts.uri.authority() {
            if let Ok(host_value) = HeaderValue::from_str(authority.as_str()) {
                parts.headers.insert(HOST, host_value);
            }
        }

        Ok(Request::from_parts(parts, body))
    }

    async fn forward(&self, req: Request<HttpBody>) -> HandlerResult {
        let start = Instant::now();
        let proxied = self.build_proxied_request(req)?;
        debug!("Forwarding {} {} to {}", proxied.method(), proxied.uri(), self.backend);

        let request = self.client.client.request(proxied);
        let result = match self.client.response_header_timeout {
            Some(limit) => match timeout(limit, request).await {
                Ok(result) => result,
                Err(_) => {
                    warn!("Timeout after {:?} waiting for {}", limit, self.backend);
                    return Err(ProxyError::Timeout {
                        backend: self.backend.clone(),
                    });
                }
            },
            None => request.await,
        };

        match result {
            Ok(response) => {
                debug!(
                    "Backend response: {} in {:?} from {}",
                    response.status(),
                    start.elapsed(),
                    self.backend
                );
                let (mut parts, body) = response.into_parts();
                strip_hop_by_hop(&mut parts.headers);
                Ok(Response::from_parts(parts, body.boxed()))
            }
            Err(e) if e.is_connect() => Err(ProxyError::Connect {
                backend: self.backend.clone(),
                source: Box::new(e),
            }),
            Err(e) => Err(ProxyError::Backend {
                backend: self.backend.clone(),
                source: Box::new(e),
            }),
        }
    }
}

impl Handler for Forwarder {
    fn serve(&self, req: Request<HttpBody>) -> BoxFuture<'_, HandlerResult> {
        Box::pin(self.forward(req))
    }
}

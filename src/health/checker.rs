use crate::config::dynamic::HealthCheck;
use crate::metrics::Metrics;
use crate::runtime::ServiceInfo;
use crate::service::{BalancedHandler, HealthTarget};
use crate::proxy::{empty_body, HttpBody, HttpClient};
use hyper::header::{HeaderName, HeaderValue, HOST, USER_AGENT};
use hyper::{Request, Uri};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

pub const STATUS_UP: &str = "UP";
pub const STATUS_DOWN: &str = "DOWN";

/// Active health checking of one load-balancer service.
///
/// Every interval each server is probed once; a 2xx or 3xx answer within
/// the timeout means up. Transitions are pushed to the balancer (selection
/// and sticky lookup skip down servers) and to the runtime status map.
pub struct HealthChecker {
    service: String,
    info: Arc<ServiceInfo>,
    balancer: Arc<BalancedHandler>,
    config: HealthCheck,
    servers: Vec<String>,
    client: HttpClient,
}

impl HealthChecker {
    /// Probes go through the shared outbound client, so `https` servers
    /// and schemes work the same way as forwarding does.
    pub fn new(target: HealthTarget) -> Self {
        Self {
            service: target.service,
            info: target.info,
            balancer: target.balancer,
            config: target.config,
            servers: target.servers,
            client: target.client,
        }
    }

    pub async fn start(self) {
        let mut ticker = interval(self.config.interval.as_std().max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut up: HashMap<String, bool> = self.servers.iter().map(|s| (s.clone(), true)).collect();

        info!(
            "Health checking {} servers of service '{}' every {:?}",
            self.servers.len(),
            self.service,
            self.config.interval.as_std()
        );

        loop {
            ticker.tick().await;
            for server in &self.servers {
                let healthy = match self.check(server).await {
                    Ok(()) => true,
                    Err(e) => {
                        debug!("Health check of {} failed: {}", server, e);
                        false
                    }
                };
                let was = up.insert(server.clone(), healthy).unwrap_or(true);
                if was != healthy {
                    self.set_status(server, healthy);
                }
            }
        }
    }

    fn set_status(&self, server: &str, healthy: bool) {
        if healthy {
            info!("Server {} of service '{}' is up", server, self.service);
        } else {
            warn!("Server {} of service '{}' is down", server, self.service);
        }
        self.balancer.set_server_up(server, healthy);
        self.info
            .update_server_status(server, if healthy { STATUS_UP } else { STATUS_DOWN });
        Metrics::record_server_status(&self.service, server, healthy);
    }

    async fn check(&self, server: &str) -> Result<(), String> {
        let req = self.probe_request(server)?;
        let response = timeout(self.config.timeout.as_std(), self.client.request(req))
            .await
            .map_err(|_| "timeout".to_string())?
            .map_err(|e| format!("request failed: {}", e))?;

        let status = response.status();
        if status.is_success() || status.is_redirection() {
            Ok(())
        } else {
            Err(format!("received status {}", status))
        }
    }

    fn probe_request(&self, server: &str) -> Result<Request<HttpBody>, String> {
        let uri = probe_uri(server, &self.config)?;

        let mut builder = Request::get(uri).header(USER_AGENT, "edgeroute-health-check");
        if let Some(hostname) = self.config.hostname.as_deref().filter(|h| !h.is_empty()) {
            builder = builder.header(HOST, hostname);
        }
        let mut req = builder.body(empty_body()).map_err(|e| e.to_string())?;

        for (name, value) in &self.config.headers {
            let name = HeaderName::try_from(name.as_str()).map_err(|e| e.to_string())?;
            let value = HeaderValue::from_str(value).map_err(|e| e.to_string())?;
            req.headers_mut().insert(name, value);
        }
        Ok(req)
    }
}

/// Probe address: the server URL with scheme and port optionally
/// overridden and the configured path.
fn probe_uri(server: &str, config: &HealthCheck) -> Result<Uri, String> {
    let base: Uri = server.parse().map_err(|e| format!("invalid server URL: {}", e))?;
    let host = base.host().ok_or("server URL has no host")?;
    let scheme = config
        .scheme
        .as_deref()
        .or(base.scheme_str())
        .unwrap_or("http");
    let port = config
        .port
        .or(base.port_u16())
        .ok_or("server URL has no port")?;
    let path = if config.path.starts_with('/') {
        config.path.clone()
    } else {
        format!("/{}", config.path)
    };

    format!("{}://{}:{}{}", scheme, host, port, path)
        .parse()
        .map_err(|e| format!("invalid health check URL: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::dynamic::Service;
    use crate::config::{Duration as ConfigDuration, ForwardingConfig};
    use crate::proxy::{empty_body, full_body, handler_fn, Handler};
    use hyper::body::Incoming;
    use hyper::service::service_fn;
    use hyper::{Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::net::TcpListener;

    fn config() -> HealthCheck {
        HealthCheck {
            scheme: None,
            path: "/health".into(),
            port: None,
            interval: ConfigDuration::from_millis(20),
            timeout: ConfigDuration::from_millis(200),
            hostname: None,
            headers: Default::default(),
        }
    }

    /// Answers `/health` with 200 while `healthy` is set, 503 otherwise.
    async fn spawn_backend(healthy: Arc<AtomicBool>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { break };
                let healthy = healthy.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let healthy = healthy.load(Ordering::SeqCst);
                        async move {
                            assert_eq!(req.uri().path(), "/health");
                            let status = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
                            let mut response = Response::new(full_body(""));
                            *response.status_mut() = status;
                            Ok::<_, Infallible>(response)
                        }
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        addr
    }

    fn checker(url: &str, info: Arc<ServiceInfo>, balancer: Arc<BalancedHandler>, config: HealthCheck) -> HealthChecker {
        HealthChecker::new(HealthTarget {
            service: "app@file".into(),
            info,
            balancer,
            config,
            servers: vec![url.to_string()],
            client: HttpClient::new(&ForwardingConfig::default()).unwrap(),
        })
    }

    #[test]
    fn test_probe_uri() {
        let mut config = config();
        assert_eq!(
            probe_uri("http://10.0.0.1:8080", &config).unwrap(),
            "http://10.0.0.1:8080/health"
        );

        config.scheme = Some("https".into());
        config.port = Some(9000);
        config.path = "ready?full=1".into();
        assert_eq!(
            probe_uri("http://10.0.0.1:8080/", &config).unwrap(),
            "https://10.0.0.1:9000/ready?full=1"
        );
    }

    #[tokio::test]
    async fn test_down_and_up_transitions() {
        let healthy = Arc::new(AtomicBool::new(false));
        let addr = spawn_backend(healthy.clone()).await;
        let url = format!("http://{}", addr);

        let info = Arc::new(ServiceInfo::new(Service::default()));
        info.update_server_status(&url, STATUS_UP);
        let balancer = Arc::new(BalancedHandler::new(
            "app@file",
            vec![(url.clone(), handler_fn(|_| async { Ok(Response::new(empty_body())) }), 1)],
            None,
        ));

        let checker = checker(&url, info.clone(), balancer.clone(), config());
        let task = tokio::spawn(checker.start());

        for _ in 0..100 {
            if info.get_all_status()[&url] == STATUS_DOWN {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(info.get_all_status()[&url], STATUS_DOWN);
        assert!(balancer.serve(Request::new(empty_body())).await.is_err());

        healthy.store(true, Ordering::SeqCst);
        for _ in 0..100 {
            if info.get_all_status()[&url] == STATUS_UP {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(info.get_all_status()[&url], STATUS_UP);
        assert!(balancer.serve(Request::new(empty_body())).await.is_ok());

        task.abort();
    }

    #[tokio::test]
    async fn test_https_probe_opens_tls_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (first_byte_tx, first_byte) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1];
            tokio::io::AsyncReadExt::read_exact(&mut stream, &mut buf).await.unwrap();
            let _ = first_byte_tx.send(buf[0]);
        });

        let url = format!("http://{}", addr);
        let mut config = config();
        config.scheme = Some("https".into());
        let info = Arc::new(ServiceInfo::new(Service::default()));
        let balancer = Arc::new(BalancedHandler::new("app@file", Vec::new(), None));
        let checker = checker(&url, info, balancer, config);

        let req = checker.probe_request(&url).unwrap();
        assert_eq!(req.uri().scheme_str(), Some("https"));

        // No certificate on the other side, so the probe itself fails
        assert!(checker.check(&url).await.is_err());
        // TLS handshake record
        assert_eq!(first_byte.await.unwrap(), 0x16);
    }
}

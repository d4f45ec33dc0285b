use super::connections::ConnectionTracker;
use super::routing::RoutingTable;
use crate::config::EntryPointConfig;
use crate::proxy::{status_response, ClientInfo, Handler};
use crate::tcp::{peek_client_hello, Peeked, TcpHandler, TcpRouteTls};
use crate::tls;
use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// How long to wait for a client's first bytes before treating the
/// connection as plain.
const PEEK_TIMEOUT: Duration = Duration::from_secs(2);

/// One named listening address.
///
/// Each accepted connection is dispatched against the routing table that is
/// current at accept time: TCP routers first, then HTTP over TLS when the
/// client starts a handshake, then plain HTTP.
pub struct EntryPoint {
    name: String,
    config: EntryPointConfig,
    table: Arc<ArcSwap<RoutingTable>>,
    tls: Option<TlsAcceptor>,
    connections: Arc<ConnectionTracker>,
}

impl EntryPoint {
    pub fn new(name: &str, config: EntryPointConfig, table: Arc<ArcSwap<RoutingTable>>) -> Result<Self> {
        let tls = match &config.tls {
            Some(tls) => {
                let acceptor = tls::acceptor(tls)
                    .with_context(|| format!("Failed to configure TLS for entry point '{}'", name))?;
                info!("TLS enabled for entry point '{}'", name);
                Some(acceptor)
            }
            None => None,
        };

        Ok(Self {
            name: name.to_string(),
            config,
            table,
            tls,
            connections: ConnectionTracker::new(),
        })
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let addr: SocketAddr = self
            .config
            .address
            .parse()
            .with_context(|| format!("Invalid address: {}", self.config.address))?;

        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind entry point '{}' to {}", self.name, addr))?;

        info!("Entry point '{}' listening on {}", self.name, addr);
        Ok(listener)
    }

    /// Accept connections until `shutdown` flips, then give open
    /// connections the grace timeout before closing them.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, remote_addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            error!("Entry point '{}': failed to accept connection: {}", self.name, e);
                            continue;
                        }
                    };

                    let Some(guard) = self.connections.connection_start() else {
                        debug!("Rejecting connection from {} - entry point draining", remote_addr);
                        continue;
                    };
                    let entry_point = Arc::clone(&self);
                    let shutdown = shutdown.clone();
                    tasks.spawn(async move {
                        entry_point.handle(stream, remote_addr, shutdown).await;
                        drop(guard);
                    });
                }
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        drop(listener);
        let grace = self.config.transport.grace_timeout.as_std();
        info!(
            "Entry point '{}' stopped accepting, draining {} connections",
            self.name,
            self.connections.active()
        );

        if !self.connections.drain(grace).await {
            warn!(
                "Entry point '{}': closing {} connections after {:?} grace period",
                self.name,
                self.connections.active(),
                grace
            );
            tasks.abort_all();
        }
        while tasks.join_next().await.is_some() {}
        info!("Entry point '{}' stopped", self.name);
    }

    async fn handle(&self, stream: TcpStream, remote_addr: SocketAddr, shutdown: watch::Receiver<bool>) {
        let table = self.table.load_full();
        let tcp_router = table.tcp_router(&self.name).filter(|r| !r.is_empty());

        if let Some(router) = &tcp_router {
            if let Some(route) = router.catch_all().filter(|_| !router.has_tls_routes()) {
                debug!("TCP: {} handled by catch-all router '{}'", remote_addr, route.name);
                route.handler().serve_tcp(Box::new(stream)).await;
                return;
            }
        }

        let peeked = if tcp_router.is_none() && self.tls.is_none() {
            Peeked::Plain
        } else {
            match peek_client_hello(&stream, PEEK_TIMEOUT).await {
                Ok(peeked) => peeked,
                Err(e) => {
                    debug!("Failed to read from {}: {}", remote_addr, e);
                    return;
                }
            }
        };

        if let Some(route) = tcp_router
            .as_ref()
            .and_then(|router| router.match_connection(&peeked, Some(remote_addr.ip())))
        {
            let handler = Arc::clone(route.handler());
            if route.tls == TcpRouteTls::Terminate {
                let Some(acceptor) = &self.tls else {
                    warn!(
                        "TCP router '{}' terminates TLS but entry point '{}' has no certificate",
                        route.name, self.name
                    );
                    return;
                };
                match acceptor.accept(stream).await {
                    Ok(tls_stream) => handler.serve_tcp(Box::new(tls_stream)).await,
                    Err(e) => debug!("TLS handshake failed from {}: {}", remote_addr, e),
                }
            } else {
                handler.serve_tcp(Box::new(stream)).await;
            }
            return;
        }

        if peeked.is_tls() {
            let Some(acceptor) = &self.tls else {
                debug!(
                    "Dropping TLS connection from {}: entry point '{}' has no certificate",
                    remote_addr, self.name
                );
                return;
            };
            match acceptor.accept(stream).await {
                Ok(tls_stream) => {
                    self.serve_http(TokioIo::new(tls_stream), remote_addr, true, shutdown)
                        .await
                }
                Err(e) => debug!("TLS handshake failed from {}: {}", remote_addr, e),
            }
        } else {
            self.serve_http(TokioIo::new(stream), remote_addr, false, shutdown)
                .await;
        }
    }

    async fn serve_http<I>(&self, io: I, remote_addr: SocketAddr, tls: bool, mut shutdown: watch::Receiver<bool>)
    where
        I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
    {
        let table = Arc::clone(&self.table);
        let entry_point = self.name.clone();

        let service = service_fn(move |req: Request<Incoming>| {
            // Load current routing table (supports hot reload)
            let router = table.load().http_router(&entry_point, tls);

            async move {
                let Some(router) = router else {
                    return Ok::<_, Infallible>(status_response(StatusCode::NOT_FOUND));
                };

                let mut req = req.map(|body| body.boxed());
                req.extensions_mut().insert(ClientInfo { remote_addr, tls });

                let response = match router.serve(req).await {
                    Ok(response) => response,
                    Err(e) => {
                        debug!("Request from {} failed: {}", remote_addr, e);
                        e.into_response()
                    }
                };
                Ok(response)
            }
        });

        // Auto-detect HTTP/1 or HTTP/2 (including h2c and ALPN negotiated h2)
        let builder = AutoBuilder::new(TokioExecutor::new());
        let conn = builder.serve_connection_with_upgrades(io, service);
        tokio::pin!(conn);

        let result = tokio::select! {
            result = conn.as_mut() => result,
            _ = shutdown.changed() => {
                conn.as_mut().graceful_shutdown();
                conn.await
            }
        };
        if let Err(e) = result {
            debug!("Connection error from {}: {}", remote_addr, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::dynamic::{
        Configuration, HttpConfiguration, Router, Server, ServersLoadBalancer, Service, TcpConfiguration,
        TcpRouter, TcpServer, TcpServersLoadBalancer, TcpService,
    };
    use crate::config::{Duration as ConfigDuration, ForwardingConfig, StaticConfig};
    use crate::proxy::{full_body, HttpClient};
    use crate::runtime::RuntimeConfiguration;
    use crate::server::routing::build_routing;
    use hyper::Response;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn spawn_http_backend(body: &'static str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { break };
                tokio::spawn(async move {
                    let service = service_fn(move |_req: Request<Incoming>| async move {
                        Ok::<_, Infallible>(Response::new(full_body(body)))
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        addr
    }

    async fn spawn_echo_backend() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else { break };
                tokio::spawn(async move {
                    let (mut reader, mut writer) = stream.split();
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                });
            }
        });
        addr
    }

    fn entry_point_config(grace: ConfigDuration) -> EntryPointConfig {
        EntryPointConfig {
            address: "127.0.0.1:0".to_string(),
            tls: None,
            transport: crate::config::TransportConfig { grace_timeout: grace },
        }
    }

    fn table(conf: Configuration) -> Arc<ArcSwap<RoutingTable>> {
        let mut static_config = StaticConfig::default();
        static_config
            .entry_points
            .insert("web".to_string(), entry_point_config(ConfigDuration::from_secs(1)));
        let runtime = RuntimeConfiguration::new(conf);
        runtime.populate_used_by();
        let client = HttpClient::new(&ForwardingConfig::default()).unwrap();
        let (table, _) = build_routing(&static_config, runtime, &client);
        Arc::new(ArcSwap::from_pointee(table))
    }

    async fn start(
        table: Arc<ArcSwap<RoutingTable>>,
    ) -> (SocketAddr, watch::Sender<bool>, tokio::task::JoinHandle<()>) {
        let entry_point = Arc::new(
            EntryPoint::new("web", entry_point_config(ConfigDuration::from_millis(200)), table).unwrap(),
        );
        let listener = entry_point.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(entry_point.serve(listener, rx));
        (addr, tx, handle)
    }

    async fn http_get(addr: SocketAddr, host: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!("GET / HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n", host);
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_http_routing_through_entry_point() {
        let backend = spawn_http_backend("hello from app").await;
        let conf = Configuration {
            http: Some(HttpConfiguration {
                routers: [(
                    "app@file".to_string(),
                    Router {
                        rule: "Host(`app.local`)".to_string(),
                        service: "app".to_string(),
                        ..Default::default()
                    },
                )]
                .into_iter()
                .collect(),
                services: [(
                    "app@file".to_string(),
                    Service {
                        load_balancer: Some(ServersLoadBalancer {
                            servers: vec![Server {
                                url: format!("http://{}", backend),
                                weight: 1,
                            }],
                            ..Default::default()
                        }),
                        weighted: None,
                    },
                )]
                .into_iter()
                .collect(),
                middlewares: Default::default(),
            }),
            tcp: None,
        };
        let (addr, shutdown, handle) = start(table(conf)).await;

        let response = http_get(addr, "app.local").await;
        assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
        assert!(response.ends_with("hello from app"));

        let response = http_get(addr, "other.local").await;
        assert!(response.starts_with("HTTP/1.1 404"), "{}", response);

        shutdown.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_table_answers_not_found() {
        let (addr, shutdown, handle) = start(Arc::new(ArcSwap::from_pointee(RoutingTable::default()))).await;
        let response = http_get(addr, "app.local").await;
        assert!(response.starts_with("HTTP/1.1 404"), "{}", response);

        shutdown.send(true).unwrap();
        handle.await.unwrap();
    }

    fn echo_catch_all(backend: SocketAddr) -> Configuration {
        Configuration {
            http: None,
            tcp: Some(TcpConfiguration {
                routers: [(
                    "echo@file".to_string(),
                    TcpRouter {
                        rule: "HostSNI(`*`)".to_string(),
                        service: "echo".to_string(),
                        ..Default::default()
                    },
                )]
                .into_iter()
                .collect(),
                services: [(
                    "echo@file".to_string(),
                    TcpService {
                        load_balancer: Some(TcpServersLoadBalancer {
                            servers: vec![TcpServer {
                                address: backend.to_string(),
                                weight: 1,
                            }],
                            ..Default::default()
                        }),
                        weighted: None,
                    },
                )]
                .into_iter()
                .collect(),
            }),
        }
    }

    #[tokio::test]
    async fn test_tcp_catch_all_router() {
        let backend = spawn_echo_backend().await;
        let conf = echo_catch_all(backend);
        let (addr, shutdown, handle) = start(table(conf)).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        drop(stream);

        shutdown.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_force_closes_open_tcp_session() {
        let backend = spawn_echo_backend().await;
        let (addr, shutdown, handle) = start(table(echo_catch_all(backend))).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        // The session stays open past the 200ms grace period
        shutdown.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        let mut rest = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(2), stream.read_to_end(&mut rest))
            .await
            .expect("session should be closed once the grace period is over")
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_idle_connections_after_grace() {
        let (addr, shutdown, handle) = start(Arc::new(ArcSwap::from_pointee(RoutingTable::default()))).await;

        // Connected but silent: the HTTP connection sits waiting for a request
        let _idle = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        shutdown.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(TcpStream::connect(addr).await.is_err());
    }
}

use crate::config::StaticConfig;
use crate::middleware::{MiddlewareBuilder, ServiceTarget};
use crate::proxy::{BoxHandler, HttpClient};
use crate::router::{HttpRouter, Route, RuleParser};
use crate::runtime::{RouterInfo, RuntimeConfiguration, TcpRouterInfo};
use crate::service::{BuildContext, BuildError, HealthTarget, ServiceManager};
use crate::tcp::{BoxTcpHandler, TcpRoute, TcpRouteTls, TcpRouter, TcpServiceManager};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Everything the listeners need for one configuration generation. Built
/// off to the side and published as a whole.
#[derive(Default)]
pub struct RoutingTable {
    pub runtime: RuntimeConfiguration,
    http: BTreeMap<String, Arc<HttpRouter>>,
    https: BTreeMap<String, Arc<HttpRouter>>,
    tcp: BTreeMap<String, Arc<TcpRouter>>,
}

impl RoutingTable {
    /// The HTTP routers of `entry_point`: TLS routers when the request
    /// arrived over a terminated TLS session, the others otherwise.
    pub fn http_router(&self, entry_point: &str, tls: bool) -> Option<Arc<HttpRouter>> {
        let table = if tls { &self.https } else { &self.http };
        table.get(entry_point).cloned()
    }

    pub fn tcp_router(&self, entry_point: &str) -> Option<Arc<TcpRouter>> {
        self.tcp.get(entry_point).cloned()
    }
}

/// Build the routing table of every entry point from `runtime`, recording
/// failures on the entities concerned. Returns the load balancers that
/// asked for health checks along with the table.
pub fn build_routing(
    static_config: &StaticConfig,
    runtime: RuntimeConfiguration,
    client: &HttpClient,
) -> (RoutingTable, Vec<HealthTarget>) {
    let entry_points = static_config.entry_point_names();

    let services = ServiceManager::new(runtime.services.clone(), client.clone());
    let middlewares = MiddlewareBuilder::new(runtime.middlewares.clone());
    let http_builder = HttpRouterBuilder {
        services: &services,
        middlewares: &middlewares,
        handlers: HashMap::new(),
    };
    let (http, https) = http_builder.build_all(&runtime, &entry_points);

    let tcp_services = TcpServiceManager::new(
        runtime.tcp_services.clone(),
        static_config.forwarding.dial_timeout.as_std(),
    );
    let tcp = build_tcp_routers(&runtime, &entry_points, &tcp_services);

    let table = RoutingTable {
        runtime,
        http,
        https,
        tcp,
    };
    (table, services.take_health_targets())
}

struct HttpRouterBuilder<'a> {
    services: &'a ServiceManager,
    middlewares: &'a MiddlewareBuilder,
    /// Router handlers already built, so a router attached to several entry
    /// points shares its middleware state.
    handlers: HashMap<String, Option<BoxHandler>>,
}

impl HttpRouterBuilder<'_> {
    fn build_all(
        mut self,
        runtime: &RuntimeConfiguration,
        entry_points: &[String],
    ) -> (BTreeMap<String, Arc<HttpRouter>>, BTreeMap<String, Arc<HttpRouter>>) {
        let mut tables = [BTreeMap::new(), BTreeMap::new()];

        for (tls, table) in [false, true].into_iter().zip(tables.iter_mut()) {
            for (entry_point, routers) in runtime.get_routers_by_entry_points(entry_points, tls) {
                let routes: Vec<Route> = routers
                    .iter()
                    .filter_map(|(name, info)| self.route(name, info))
                    .collect();
                info!(
                    "Entry point '{}': {} {} routers installed",
                    entry_point,
                    routes.len(),
                    if tls { "TLS" } else { "HTTP" }
                );
                table.insert(entry_point, Arc::new(HttpRouter::new(routes)));
            }
        }

        let [http, https] = tables;
        (http, https)
    }

    fn route(&mut self, name: &str, info: &Arc<RouterInfo>) -> Option<Route> {
        let handler = match self.handlers.get(name) {
            Some(handler) => handler.clone()?,
            None => {
                let built = self
                    .handler(name, info)
                    .inspect_err(|e| {
                        error!("Router '{}' disabled: {}", name, e);
                        info.add_error(e, true);
                    })
                    .ok();
                self.handlers.insert(name.to_string(), built.clone());
                built?
            }
        };

        let router = &info.router;
        Route::new(name, &router.rule, router.priority, handler).ok()
    }

    fn handler(&self, name: &str, info: &RouterInfo) -> Result<BoxHandler, BuildError> {
        let router = &info.router;
        // Parse once up front so a bad rule is reported before anything is built
        RuleParser::parse(&router.rule).map_err(|e| BuildError::InvalidRule(e.to_string()))?;

        let ctx = BuildContext::for_entity(name);
        let service = self.services.build(&ctx, &router.service)?;
        let target = ServiceTarget {
            service: ctx.qualify(&router.service),
            server_count: self.services.server_count(&ctx, &router.service),
        };
        let handler = self.middlewares.build(&ctx, &router.middlewares, &target, service)?;

        debug!("Built router '{}'", name);
        Ok(handler)
    }
}

fn build_tcp_routers(
    runtime: &RuntimeConfiguration,
    entry_points: &[String],
    services: &TcpServiceManager,
) -> BTreeMap<String, Arc<TcpRouter>> {
    let mut handlers: HashMap<String, Option<BoxTcpHandler>> = HashMap::new();
    let mut tables = BTreeMap::new();

    for (entry_point, routers) in runtime.get_tcp_routers_by_entry_points(entry_points) {
        let mut routes = Vec::with_capacity(routers.len());

        for (name, info) in &routers {
            let handler = handlers
                .entry(name.clone())
                .or_insert_with(|| {
                    let ctx = BuildContext::for_entity(name);
                    services
                        .build(&ctx, &info.router.service)
                        .inspect_err(|e| {
                            error!("TCP router '{}' disabled: {}", name, e);
                            info.add_error(e, true);
                        })
                        .ok()
                })
                .clone();
            let Some(handler) = handler else {
                continue;
            };

            match tcp_route(name, info, handler) {
                Ok(route) => routes.push(route),
                Err(e) => {
                    error!("TCP router '{}' disabled: {}", name, e);
                    info.add_error(&e, true);
                }
            }
        }

        info!("Entry point '{}': {} TCP routers installed", entry_point, routes.len());
        tables.insert(entry_point, Arc::new(TcpRouter::new(routes)));
    }

    tables
}

fn tcp_route(name: &str, info: &TcpRouterInfo, handler: BoxTcpHandler) -> Result<TcpRoute, BuildError> {
    let router = &info.router;
    let tls = match &router.tls {
        None => TcpRouteTls::None,
        Some(tls) if tls.passthrough => TcpRouteTls::Passthrough,
        Some(_) => TcpRouteTls::Terminate,
    };
    TcpRoute::new(name, &router.rule, router.priority, tls, handler)
        .map_err(|e| BuildError::InvalidRule(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::dynamic::{
        Configuration, HttpConfiguration, Middleware, Router, Server, ServersLoadBalancer, Service,
        TcpConfiguration, TcpRouter as TcpRouterConfig, TcpServer, TcpServersLoadBalancer, TcpService,
    };
    use crate::config::{EntryPointConfig, ForwardingConfig};
    use crate::proxy::{empty_body, Handler};
    use crate::runtime::RuntimeStatus;
    use crate::tcp::Peeked;
    use hyper::header::HOST;
    use hyper::{Request, StatusCode};

    fn static_config() -> StaticConfig {
        let mut config = StaticConfig::default();
        for (name, address) in [("web", "127.0.0.1:0"), ("websecure", "127.0.0.1:0")] {
            config.entry_points.insert(
                name.to_string(),
                EntryPointConfig {
                    address: address.to_string(),
                    tls: None,
                    transport: Default::default(),
                },
            );
        }
        config
    }

    fn router(rule: &str, service: &str) -> Router {
        Router {
            rule: rule.to_string(),
            service: service.to_string(),
            ..Default::default()
        }
    }

    fn service(url: &str) -> Service {
        Service {
            load_balancer: Some(ServersLoadBalancer {
                servers: vec![Server {
                    url: url.to_string(),
                    weight: 1,
                }],
                ..Default::default()
            }),
            weighted: None,
        }
    }

    fn build(conf: Configuration) -> RoutingTable {
        let runtime = RuntimeConfiguration::new(conf);
        runtime.populate_used_by();
        let client = HttpClient::new(&ForwardingConfig::default()).unwrap();
        build_routing(&static_config(), runtime, &client).0
    }

    #[tokio::test]
    async fn test_broken_routers_are_disabled_and_not_installed() {
        let mut routers = BTreeMap::new();
        routers.insert("ok@file".to_string(), router("Host(`ok.com`)", "app"));
        routers.insert("bad-rule@file".to_string(), router("Host(`x.com`", "app"));
        routers.insert("no-service@file".to_string(), router("Host(`y.com`)", "missing"));
        let mut bad_mw = router("Host(`z.com`)", "app");
        bad_mw.middlewares = vec!["empty".to_string()];
        routers.insert("bad-mw@file".to_string(), bad_mw);

        let table = build(Configuration {
            http: Some(HttpConfiguration {
                routers,
                services: [("app@file".to_string(), service("http://127.0.0.1:9"))].into_iter().collect(),
                middlewares: [("empty@file".to_string(), Middleware::default())].into_iter().collect(),
            }),
            tcp: None,
        });

        let runtime = &table.runtime;
        assert_eq!(runtime.routers["ok@file"].status(), RuntimeStatus::Enabled);
        for name in ["bad-rule@file", "no-service@file", "bad-mw@file"] {
            assert_eq!(runtime.routers[name].status(), RuntimeStatus::Disabled, "{}", name);
        }
        assert_eq!(
            runtime.routers["no-service@file"].errors(),
            vec![r#"the service "missing@file" does not exist"#.to_string()]
        );

        let web = table.http_router("web", false).unwrap();
        let names: Vec<_> = web.routes().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["ok@file"]);
        assert!(table.http_router("web", true).is_none());

        let req = Request::builder()
            .uri("/")
            .header(HOST, "y.com")
            .body(empty_body())
            .unwrap();
        let response = web.serve(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_routers_attach_to_declared_entry_points() {
        let mut only_web = router("Host(`a.com`)", "app");
        only_web.entry_points = vec!["web".to_string(), "nope".to_string()];
        let mut secure = router("Host(`b.com`)", "app");
        secure.tls = Some(Default::default());

        let table = build(Configuration {
            http: Some(HttpConfiguration {
                routers: [
                    ("a@file".to_string(), only_web),
                    ("b@file".to_string(), secure),
                ]
                .into_iter()
                .collect(),
                services: [("app@file".to_string(), service("http://127.0.0.1:9"))].into_iter().collect(),
                middlewares: BTreeMap::new(),
            }),
            tcp: None,
        });

        assert_eq!(table.http_router("web", false).unwrap().routes().count(), 1);
        assert!(table.http_router("websecure", false).is_none());
        assert_eq!(table.http_router("web", true).unwrap().routes().count(), 1);
        assert_eq!(table.http_router("websecure", true).unwrap().routes().count(), 1);
        assert_eq!(table.runtime.routers["a@file"].status(), RuntimeStatus::Warning);
    }

    #[test]
    fn test_tcp_routers() {
        let catch_all = TcpRouterConfig {
            entry_points: vec!["web".to_string()],
            service: "db".to_string(),
            rule: "HostSNI(`*`)".to_string(),
            ..Default::default()
        };
        let sni_without_tls = TcpRouterConfig {
            entry_points: vec!["web".to_string()],
            service: "db".to_string(),
            rule: "HostSNI(`db.example.com`)".to_string(),
            ..Default::default()
        };
        let no_port = TcpService {
            load_balancer: Some(TcpServersLoadBalancer {
                servers: vec![TcpServer {
                    address: "10.0.0.5".to_string(),
                    weight: 1,
                }],
                ..Default::default()
            }),
            weighted: None,
        };
        let db = TcpService {
            load_balancer: Some(TcpServersLoadBalancer {
                servers: vec![TcpServer {
                    address: "127.0.0.1:5432".to_string(),
                    weight: 1,
                }],
                ..Default::default()
            }),
            weighted: None,
        };
        let broken = TcpRouterConfig {
            entry_points: vec!["web".to_string()],
            service: "broken".to_string(),
            rule: "HostSNI(`*`)".to_string(),
            ..Default::default()
        };

        let table = build(Configuration {
            http: None,
            tcp: Some(TcpConfiguration {
                routers: [
                    ("all@file".to_string(), catch_all),
                    ("sni@file".to_string(), sni_without_tls),
                    ("broken@file".to_string(), broken),
                ]
                .into_iter()
                .collect(),
                services: [("db@file".to_string(), db), ("broken@file".to_string(), no_port)]
                    .into_iter()
                    .collect(),
            }),
        });

        let tcp = table.tcp_router("web").unwrap();
        assert_eq!(tcp.match_connection(&Peeked::Plain, None).unwrap().name, "all@file");
        assert_eq!(table.runtime.tcp_routers["sni@file"].status(), RuntimeStatus::Disabled);
        assert_eq!(table.runtime.tcp_routers["broken@file"].status(), RuntimeStatus::Disabled);
        assert_eq!(
            table.runtime.tcp_services["broken@file"].errors(),
            vec!["in service broken@file: address 10.0.0.5: missing port in address".to_string()]
        );
        assert!(table.tcp_router("websecure").is_none());
    }
}

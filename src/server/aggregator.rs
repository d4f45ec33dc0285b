use super::routing::{build_routing, RoutingTable};
use crate::config::dynamic::{Configuration, Service, TcpService};
use crate::config::StaticConfig;
use crate::health::HealthChecks;
use crate::metrics::Metrics;
use crate::provider::ConfigMessage;
use crate::proxy::HttpClient;
use crate::runtime::{names, RuntimeConfiguration};
use arc_swap::ArcSwap;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid provider name {0:?}: must be non-empty and must not contain '@'")]
    InvalidProviderName(String),
}

/// Merges provider configurations and publishes the routing table built
/// from them.
///
/// Every accepted message rebuilds the whole runtime model off to the side;
/// listeners keep serving the previous table until the new one is stored.
pub struct ConfigurationWatcher {
    static_config: Arc<StaticConfig>,
    client: HttpClient,
    table: Arc<ArcSwap<RoutingTable>>,
    configs: BTreeMap<String, Configuration>,
    health: HealthChecks,
}

impl ConfigurationWatcher {
    pub fn new(static_config: Arc<StaticConfig>, client: HttpClient) -> Self {
        Self {
            static_config,
            client,
            table: Arc::new(ArcSwap::from_pointee(RoutingTable::default())),
            configs: BTreeMap::new(),
            health: HealthChecks::default(),
        }
    }

    /// Handle on the published table, for listeners.
    pub fn table(&self) -> Arc<ArcSwap<RoutingTable>> {
        Arc::clone(&self.table)
    }

    /// Apply one provider message. Returns whether a new table was
    /// published; identical configurations are skipped.
    pub fn apply(&mut self, message: ConfigMessage) -> Result<bool, ConfigError> {
        let ConfigMessage {
            provider_name,
            configuration,
        } = message;

        if provider_name.is_empty() || provider_name.contains('@') {
            return Err(ConfigError::InvalidProviderName(provider_name));
        }

        if self.configs.get(&provider_name) == Some(&configuration) {
            info!("Skipping same configuration for provider '{}'", provider_name);
            return Ok(false);
        }
        self.configs.insert(provider_name.clone(), configuration);

        let merged = merge_configurations(&self.configs);
        let runtime = RuntimeConfiguration::new(merged);
        runtime.populate_used_by();

        let (table, health_targets) = build_routing(&self.static_config, runtime, &self.client);
        let health = HealthChecks::start(health_targets);

        self.table.store(Arc::new(table));
        // Replacing the group stops the previous generation's checkers
        self.health = health;
        Metrics::record_config_reload();

        info!(
            "Configuration from provider '{}' applied ({} health checkers running)",
            provider_name,
            self.health.len()
        );
        Ok(true)
    }

    /// Consume messages until every sender is gone.
    pub async fn run(mut self, mut messages: mpsc::Receiver<ConfigMessage>) {
        while let Some(message) = messages.recv().await {
            let provider = message.provider_name.clone();
            if let Err(e) = self.apply(message) {
                error!("Rejected configuration from provider '{}': {}", provider, e);
            }
        }
        debug!("Configuration channel closed");
    }
}

/// Merge the configurations of every provider into one, qualifying each
/// entity name with its provider. Providers and keys are visited in sorted
/// order so the result is deterministic.
pub fn merge_configurations(configs: &BTreeMap<String, Configuration>) -> Configuration {
    let mut merged = Configuration::default();

    for (provider, conf) in configs {
        if let Some(http) = &conf.http {
            let out = merged.http.get_or_insert_with(Default::default);
            merge_entities(provider, "router", &http.routers, &mut out.routers, replace);
            merge_entities(provider, "service", &http.services, &mut out.services, merge_service);
            merge_entities(provider, "middleware", &http.middlewares, &mut out.middlewares, replace);
        }

        if let Some(tcp) = &conf.tcp {
            let out = merged.tcp.get_or_insert_with(Default::default);
            merge_entities(provider, "TCP router", &tcp.routers, &mut out.routers, replace);
            merge_entities(provider, "TCP service", &tcp.services, &mut out.services, merge_tcp_service);
        }
    }

    merged
}

fn merge_entities<T: Clone>(
    provider: &str,
    kind: &str,
    from: &BTreeMap<String, T>,
    into: &mut BTreeMap<String, T>,
    combine: fn(&str, &mut T, &T),
) {
    for (name, entity) in from {
        let qualified = match names::provider_of(name) {
            None => names::qualify(provider, name),
            Some(p) if p == provider => name.clone(),
            Some(other) => {
                error!(
                    "Provider '{}' cannot define {} '{}' belonging to provider '{}'",
                    provider, kind, name, other
                );
                continue;
            }
        };

        match into.get_mut(&qualified) {
            Some(existing) => combine(&qualified, existing, entity),
            None => {
                into.insert(qualified, entity.clone());
            }
        }
    }
}

fn replace<T: Clone>(name: &str, existing: &mut T, incoming: &T) {
    warn!("'{}' is defined more than once, keeping the last definition", name);
    *existing = incoming.clone();
}

/// Two definitions of one load balancer that agree on everything but
/// their servers are combined; otherwise the last one wins.
fn merge_service(name: &str, existing: &mut Service, incoming: &Service) {
    match (existing.load_balancer.as_mut(), incoming.load_balancer.as_ref()) {
        (Some(current), Some(other)) if existing.weighted.is_none() && current.mergeable(other) => {
            for server in &other.servers {
                if !current.servers.iter().any(|s| s.url == server.url) {
                    current.servers.push(server.clone());
                }
            }
        }
        _ => replace(name, existing, incoming),
    }
}

fn merge_tcp_service(name: &str, existing: &mut TcpService, incoming: &TcpService) {
    match (existing.load_balancer.as_mut(), incoming.load_balancer.as_ref()) {
        (Some(current), Some(other)) if existing.weighted.is_none() && current.mergeable(other) => {
            for server in &other.servers {
                if !current.servers.iter().any(|s| s.address == server.address) {
                    current.servers.push(server.clone());
                }
            }
        }
        _ => replace(name, existing, incoming),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::dynamic::{
        HttpConfiguration, Router, Server, ServersLoadBalancer, Sticky, TcpConfiguration, TcpServer,
        TcpServersLoadBalancer,
    };
    use crate::config::{EntryPointConfig, ForwardingConfig};
    use crate::runtime::RuntimeStatus;
    use tokio_test::{assert_err, assert_ok};

    fn static_config() -> Arc<StaticConfig> {
        let mut config = StaticConfig::default();
        config.entry_points.insert(
            "web".to_string(),
            EntryPointConfig {
                address: "127.0.0.1:0".to_string(),
                tls: None,
                transport: Default::default(),
            },
        );
        Arc::new(config)
    }

    fn watcher() -> ConfigurationWatcher {
        let client = HttpClient::new(&ForwardingConfig::default()).unwrap();
        ConfigurationWatcher::new(static_config(), client)
    }

    fn lb_service(urls: &[&str]) -> Service {
        Service {
            load_balancer: Some(ServersLoadBalancer {
                servers: urls
                    .iter()
                    .map(|url| Server {
                        url: url.to_string(),
                        weight: 1,
                    })
                    .collect(),
                ..Default::default()
            }),
            weighted: None,
        }
    }

    fn http(routers: Vec<(&str, Router)>, services: Vec<(&str, Service)>) -> Configuration {
        Configuration {
            http: Some(HttpConfiguration {
                routers: routers.into_iter().map(|(n, r)| (n.to_string(), r)).collect(),
                services: services.into_iter().map(|(n, s)| (n.to_string(), s)).collect(),
                middlewares: BTreeMap::new(),
            }),
            tcp: None,
        }
    }

    fn router(service: &str) -> Router {
        Router {
            rule: "PathPrefix(`/`)".to_string(),
            service: service.to_string(),
            ..Default::default()
        }
    }

    fn message(provider: &str, configuration: Configuration) -> ConfigMessage {
        ConfigMessage {
            provider_name: provider.to_string(),
            configuration,
        }
    }

    #[test]
    fn test_merge_qualifies_names() {
        let mut configs = BTreeMap::new();
        configs.insert(
            "file".to_string(),
            http(
                vec![("web", router("app")), ("api@file", router("shared@docker"))],
                vec![("app", lb_service(&["http://10.0.0.1:80"]))],
            ),
        );
        configs.insert(
            "docker".to_string(),
            http(vec![], vec![("shared", lb_service(&["http://10.0.0.2:80"]))]),
        );

        let merged = merge_configurations(&configs);
        let http = merged.http.unwrap();
        assert_eq!(
            http.routers.keys().collect::<Vec<_>>(),
            vec!["api@file", "web@file"]
        );
        assert_eq!(
            http.services.keys().collect::<Vec<_>>(),
            vec!["app@file", "shared@docker"]
        );
        // References are left for the builders to qualify
        assert_eq!(http.routers["api@file"].service, "shared@docker");
        assert!(merged.tcp.is_none());
    }

    #[test]
    fn test_merge_skips_foreign_definitions() {
        let mut configs = BTreeMap::new();
        configs.insert(
            "file".to_string(),
            http(vec![], vec![("app@docker", lb_service(&["http://10.0.0.1:80"]))]),
        );
        let merged = merge_configurations(&configs);
        assert!(merged.http.unwrap().services.is_empty());
    }

    #[test]
    fn test_merge_combines_mergeable_load_balancers() {
        let mut configs = BTreeMap::new();
        configs.insert(
            "file".to_string(),
            http(
                vec![],
                vec![
                    ("app", lb_service(&["http://10.0.0.1:80"])),
                    ("app@file", lb_service(&["http://10.0.0.2:80", "http://10.0.0.1:80"])),
                ],
            ),
        );
        let merged = merge_configurations(&configs);
        let servers: Vec<_> = merged.http.unwrap().services["app@file"]
            .load_balancer
            .as_ref()
            .unwrap()
            .servers
            .iter()
            .map(|s| s.url.clone())
            .collect();
        assert_eq!(servers, vec!["http://10.0.0.1:80", "http://10.0.0.2:80"]);
    }

    #[test]
    fn test_merge_last_definition_wins_when_not_mergeable() {
        let mut sticky = lb_service(&["http://10.0.0.2:80"]);
        sticky.load_balancer.as_mut().unwrap().sticky = Some(Sticky::default());

        let mut configs = BTreeMap::new();
        configs.insert(
            "file".to_string(),
            http(
                vec![],
                vec![("app", lb_service(&["http://10.0.0.1:80"])), ("app@file", sticky.clone())],
            ),
        );
        let merged = merge_configurations(&configs);
        assert_eq!(merged.http.unwrap().services["app@file"], sticky);
    }

    #[test]
    fn test_merge_tcp_services() {
        let tcp = |address: &str| TcpService {
            load_balancer: Some(TcpServersLoadBalancer {
                servers: vec![TcpServer {
                    address: address.to_string(),
                    weight: 1,
                }],
                ..Default::default()
            }),
            weighted: None,
        };
        let mut configs = BTreeMap::new();
        configs.insert(
            "file".to_string(),
            Configuration {
                http: None,
                tcp: Some(TcpConfiguration {
                    routers: BTreeMap::new(),
                    services: [
                        ("db".to_string(), tcp("10.0.0.1:5432")),
                        ("db@file".to_string(), tcp("10.0.0.2:5432")),
                    ]
                    .into_iter()
                    .collect(),
                }),
            },
        );
        let merged = merge_configurations(&configs);
        assert!(merged.http.is_none());
        let servers = &merged.tcp.unwrap().services["db@file"].load_balancer.clone().unwrap().servers;
        assert_eq!(servers.len(), 2);
    }

    #[tokio::test]
    async fn test_rejects_invalid_provider_names() {
        let mut watcher = watcher();
        for name in ["", "file@docker"] {
            let err = assert_err!(watcher.apply(message(name, Configuration::default())));
            assert_eq!(err, ConfigError::InvalidProviderName(name.to_string()));
        }
        assert!(watcher.table().load().runtime.routers.is_empty());
    }

    #[tokio::test]
    async fn test_apply_publishes_and_skips_identical() {
        let mut watcher = watcher();
        let table = watcher.table();
        let conf = http(vec![("web", router("app"))], vec![("app", lb_service(&["http://127.0.0.1:9"]))]);

        assert!(watcher.apply(message("file", conf.clone())).unwrap());
        let first = table.load_full();
        assert_eq!(first.runtime.routers["web@file"].status(), RuntimeStatus::Enabled);
        assert_eq!(first.runtime.services["app@file"].used_by(), vec!["web@file".to_string()]);
        assert!(first.http_router("web", false).is_some());

        assert!(!watcher.apply(message("file", conf)).unwrap());
        assert!(Arc::ptr_eq(&first, &table.load_full()));
    }

    #[tokio::test]
    async fn test_providers_are_kept_side_by_side() {
        let mut watcher = watcher();
        let table = watcher.table();

        assert_ok!(watcher.apply(message("file", http(vec![("web", router("app@docker"))], vec![]))));
        assert_eq!(
            table.load().runtime.routers["web@file"].status(),
            RuntimeStatus::Disabled
        );

        assert_ok!(watcher.apply(message(
            "docker",
            http(vec![], vec![("app", lb_service(&["http://127.0.0.1:9"]))])
        )));
        let current = table.load();
        assert_eq!(current.runtime.routers["web@file"].status(), RuntimeStatus::Enabled);
        assert_eq!(current.runtime.services["app@docker"].used_by(), vec!["web@file".to_string()]);
    }

    #[tokio::test]
    async fn test_run_consumes_channel() {
        let watcher = watcher();
        let table = watcher.table();
        let (tx, rx) = mpsc::channel(4);

        let task = tokio::spawn(watcher.run(rx));
        tx.send(message("bad@name", Configuration::default())).await.unwrap();
        tx.send(message("file", http(vec![("web", router("app"))], vec![("app", lb_service(&["http://127.0.0.1:9"]))])))
            .await
            .unwrap();
        drop(tx);
        task.await.unwrap();

        assert!(table.load().runtime.routers.contains_key("web@file"));
    }
}

//! Configuration providers and the message type they push to the
//! aggregator.

mod file;

pub use file::FileProvider;

use crate::config::dynamic::{Configuration, Server, ServersLoadBalancer};
use async_trait::async_trait;
use std::collections::HashSet;
use tokio::sync::{mpsc, watch};
use tracing::warn;
use url::Url;

/// A complete dynamic configuration from one provider. Each message
/// replaces everything the provider sent before.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigMessage {
    pub provider_name: String,
    pub configuration: Configuration,
}

/// A source of dynamic configuration.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Used to qualify the names of everything the provider defines.
    fn name(&self) -> &str;

    /// Push configurations into `sender` until `shutdown` flips to true.
    /// Failing to produce the first configuration is an error.
    async fn provide(
        &self,
        sender: mpsc::Sender<ConfigMessage>,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()>;
}

/// Turns the servers a provider discovered into the list a load balancer
/// is built from.
pub trait ServersBuilder: Send + Sync {
    fn build_servers(&self, service: &str, lb: &mut ServersLoadBalancer);
}

/// Normalizes server URLs: a missing scheme becomes `http`, a missing
/// port is taken from the scheme, and duplicates are dropped. Weights
/// missing from the document already default to 1 when deserialized.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultServersBuilder;

impl ServersBuilder for DefaultServersBuilder {
    fn build_servers(&self, service: &str, lb: &mut ServersLoadBalancer) {
        let mut seen = HashSet::new();
        let servers = std::mem::take(&mut lb.servers);

        for server in servers {
            let url = match normalize_url(&server.url) {
                Some(url) => url,
                None => {
                    // Left untouched; the service build reports it
                    warn!("Service '{}': cannot normalize server URL '{}'", service, server.url);
                    server.url.clone()
                }
            };
            if !seen.insert(url.clone()) {
                warn!("Service '{}': dropping duplicate server '{}'", service, url);
                continue;
            }
            lb.servers.push(Server { url, ..server });
        }
    }
}

fn normalize_url(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let parsed = if raw.contains("://") {
        Url::parse(raw).ok()?
    } else {
        Url::parse(&format!("http://{}", raw)).ok()?
    };

    let host = parsed.host_str()?;
    let port = parsed.port_or_known_default()?;
    let path = match parsed.path() {
        "/" => "",
        path => path,
    };

    Some(format!("{}://{}:{}{}", parsed.scheme(), host, port, path))
}

/// Run `builder` over every HTTP load balancer of `conf`.
pub fn build_all_servers(builder: &dyn ServersBuilder, conf: &mut Configuration) {
    let Some(http) = conf.http.as_mut() else {
        return;
    };
    for (name, service) in http.services.iter_mut() {
        if let Some(lb) = service.load_balancer.as_mut() {
            builder.build_servers(name, lb);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::dynamic::{HttpConfiguration, Service};

    fn lb(urls: &[(&str, u32)]) -> ServersLoadBalancer {
        ServersLoadBalancer {
            servers: urls
                .iter()
                .map(|(url, weight)| Server {
                    url: url.to_string(),
                    weight: *weight,
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_normalize_url() {
        assert_eq!(normalize_url("10.0.0.1").unwrap(), "http://10.0.0.1:80");
        assert_eq!(normalize_url("https://api.internal").unwrap(), "https://api.internal:443");
        assert_eq!(normalize_url("http://10.0.0.1:8080/").unwrap(), "http://10.0.0.1:8080");
        assert_eq!(normalize_url("http://10.0.0.1:8080/base").unwrap(), "http://10.0.0.1:8080/base");
        assert_eq!(normalize_url("http://[::1]:9000").unwrap(), "http://[::1]:9000");
        assert!(normalize_url("http://").is_none());
    }

    #[test]
    fn test_default_servers_builder() {
        let mut lb = lb(&[("10.0.0.1", 2), ("http://10.0.0.1:80", 5), ("10.0.0.2:8080", 1)]);
        DefaultServersBuilder.build_servers("app", &mut lb);

        let urls: Vec<_> = lb.servers.iter().map(|s| (s.url.as_str(), s.weight)).collect();
        assert_eq!(urls, vec![("http://10.0.0.1:80", 2), ("http://10.0.0.2:8080", 1)]);
    }

    #[test]
    fn test_build_all_servers() {
        let mut conf = Configuration {
            http: Some(HttpConfiguration {
                services: [(
                    "app".to_string(),
                    Service {
                        load_balancer: Some(lb(&[("backend:3000", 1)])),
                        weighted: None,
                    },
                )]
                .into_iter()
                .collect(),
                ..Default::default()
            }),
            tcp: None,
        };

        build_all_servers(&DefaultServersBuilder, &mut conf);
        let http = conf.http.unwrap();
        let servers = &http.services["app"].load_balancer.as_ref().unwrap().servers;
        assert_eq!(servers[0].url, "http://backend:3000");
    }
}

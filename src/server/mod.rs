mod aggregator;
mod connections;
mod listener;
mod routing;

pub use aggregator::{merge_configurations, ConfigError, ConfigurationWatcher};
pub use connections::{ConnectionGuard, ConnectionTracker};
pub use listener::EntryPoint;
pub use routing::{build_routing, RoutingTable};

use crate::config::StaticConfig;
use crate::provider::{DefaultServersBuilder, FileProvider, Provider};
use crate::proxy::HttpClient;
use anyhow::{Context, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// Messages a provider can queue before the aggregator catches up.
const CONFIG_CHANNEL_CAPACITY: usize = 16;

pub struct Server {
    config: Arc<StaticConfig>,
}

impl Server {
    pub fn new(config: StaticConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Run until SIGINT or SIGTERM.
    pub async fn run(self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Bind every entry point, start the providers, and serve until
    /// `shutdown` completes. Failing to bind or to load a provider's first
    /// configuration is fatal.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let client = HttpClient::new(&self.config.forwarding).context("Failed to build HTTP client")?;
        crate::metrics::describe();

        let watcher = ConfigurationWatcher::new(Arc::clone(&self.config), client);
        let table = watcher.table();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut listeners = JoinSet::new();
        for (name, config) in &self.config.entry_points {
            let entry_point = Arc::new(EntryPoint::new(name, config.clone(), Arc::clone(&table))?);
            let listener = entry_point.bind().await?;
            listeners.spawn(entry_point.serve(listener, shutdown_rx.clone()));
        }

        let (config_tx, config_rx) = mpsc::channel(CONFIG_CHANNEL_CAPACITY);
        let aggregator = tokio::spawn(watcher.run(config_rx));

        let mut providers = JoinSet::new();
        for provider in self.providers() {
            let sender = config_tx.clone();
            let shutdown = shutdown_rx.clone();
            info!("Starting provider '{}'", provider.name());
            providers.spawn(async move {
                let name = provider.name().to_string();
                provider
                    .provide(sender, shutdown)
                    .await
                    .with_context(|| format!("Provider '{}' failed", name))
            });
        }
        drop(config_tx);

        info!("Server started, waiting for shutdown signal");
        tokio::pin!(shutdown);

        let outcome = loop {
            tokio::select! {
                _ = &mut shutdown => break Ok(()),
                Some(result) = providers.join_next(), if !providers.is_empty() => match result {
                    Ok(Ok(())) => debug!("A provider finished"),
                    Ok(Err(e)) => break Err(e),
                    Err(e) => error!("Provider task failed: {}", e),
                },
            }
        };

        info!("Shutting down");
        let _ = shutdown_tx.send(true);

        while providers.join_next().await.is_some() {}
        while listeners.join_next().await.is_some() {}
        if let Err(e) = aggregator.await {
            error!("Configuration aggregator failed: {}", e);
        }

        info!("Server stopped");
        outcome
    }

    fn providers(&self) -> Vec<Box<dyn Provider>> {
        let mut providers: Vec<Box<dyn Provider>> = Vec::new();
        if let Some(file) = &self.config.providers.file {
            providers.push(Box::new(FileProvider::new(file, Arc::new(DefaultServersBuilder))));
        }
        providers
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EntryPointConfig, FileProviderConfig};
    use std::path::PathBuf;
    use std::time::Duration;

    fn config(filename: PathBuf) -> StaticConfig {
        let mut config = StaticConfig::default();
        config.entry_points.insert(
            "web".to_string(),
            EntryPointConfig {
                address: "127.0.0.1:0".to_string(),
                tls: None,
                transport: Default::default(),
            },
        );
        config.providers.file = Some(FileProviderConfig { filename, watch: false });
        config
    }

    #[tokio::test]
    async fn test_missing_provider_file_is_fatal() {
        let server = Server::new(config(PathBuf::from("/nonexistent/edgeroute/dynamic.yaml")));
        let result = tokio::time::timeout(Duration::from_secs(5), server.run_until(std::future::pending()))
            .await
            .unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_runs_until_shutdown() {
        let dir = std::env::temp_dir().join(format!("edgeroute-server-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("dynamic.yaml");
        std::fs::write(&path, "http:\n  routers: {}\n").unwrap();

        let server = Server::new(config(path));
        let result = server
            .run_until(tokio::time::sleep(Duration::from_millis(100)))
            .await;
        assert!(result.is_ok());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_bind_failure_is_fatal() {
        let mut config = config(PathBuf::from("unused.yaml"));
        config.entry_points.get_mut("web").unwrap().address = "203.0.113.1:1".to_string();
        let result = Server::new(config).run_until(std::future::pending()).await;
        assert!(result.is_err());
    }
}

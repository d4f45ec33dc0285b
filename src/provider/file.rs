use super::{build_all_servers, ConfigMessage, Provider, ServersBuilder};
use crate::config::dynamic::Configuration;
use crate::config::{load_dynamic, FileProviderConfig};
use anyhow::{Context, Result};
use async_trait::async_trait;
use notify::{recommended_watcher, Event, EventKind, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

const DEBOUNCE: Duration = Duration::from_millis(100);
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Reads the dynamic configuration from a single YAML or JSON file and,
/// when `watch` is set, sends it again every time the file changes.
pub struct FileProvider {
    filename: PathBuf,
    watch: bool,
    servers_builder: Arc<dyn ServersBuilder>,
}

impl FileProvider {
    pub const NAME: &'static str = "file";

    pub fn new(config: &FileProviderConfig, servers_builder: Arc<dyn ServersBuilder>) -> Self {
        Self {
            filename: config.filename.clone(),
            watch: config.watch,
            servers_builder,
        }
    }

    pub fn load(&self) -> Result<Configuration> {
        let mut conf = load_dynamic(&self.filename)?;
        build_all_servers(self.servers_builder.as_ref(), &mut conf);
        Ok(conf)
    }

    async fn send(&self, sender: &mpsc::Sender<ConfigMessage>, configuration: Configuration) -> bool {
        let message = ConfigMessage {
            provider_name: Self::NAME.to_string(),
            configuration,
        };
        sender.send(message).await.is_ok()
    }
}

#[async_trait]
impl Provider for FileProvider {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn provide(
        &self,
        sender: mpsc::Sender<ConfigMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let initial = self.load()?;
        info!("Loaded dynamic configuration from {:?}", self.filename);
        if !self.send(&sender, initial).await || !self.watch {
            return Ok(());
        }

        let (events_tx, mut events_rx) = mpsc::channel::<()>(1);
        let path = self.filename.clone();
        let watcher = tokio::task::spawn_blocking(move || {
            if let Err(e) = watch_file(&path, events_tx) {
                error!("File watcher for {:?} stopped: {:#}", path, e);
            }
        });

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = events_rx.recv() => {
                    if event.is_none() {
                        break;
                    }
                    // Let the writer finish before reading
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    match self.load() {
                        Ok(conf) => {
                            info!("Dynamic configuration file {:?} changed", self.filename);
                            if !self.send(&sender, conf).await {
                                break;
                            }
                        }
                        Err(e) => warn!("Failed to reload {:?}: {:#}", self.filename, e),
                    }
                }
            }
        }

        // Closing the receiver stops the blocking watcher on its next poll
        drop(events_rx);
        if let Err(e) = watcher.await {
            debug!("File watcher task ended abnormally: {}", e);
        }
        Ok(())
    }
}

/// Blocking loop that signals `notify` when `path` is written. The parent
/// directory is watched so editors that replace the file are seen too.
fn watch_file(path: &Path, notify: mpsc::Sender<()>) -> Result<()> {
    let (sync_tx, sync_rx) = std::sync::mpsc::channel::<notify::Result<Event>>();

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let file_name = path
        .file_name()
        .with_context(|| format!("{:?} has no file name", path))?
        .to_os_string();

    let mut watcher = recommended_watcher(sync_tx)?;
    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("Failed to watch {:?}", dir))?;
    info!("Watching {:?} for changes", path);

    let mut last_event: Option<std::time::Instant> = None;

    loop {
        if notify.is_closed() {
            return Ok(());
        }

        let event = match sync_rx.recv_timeout(POLL_INTERVAL) {
            Ok(Ok(event)) => event,
            Ok(Err(e)) => {
                error!("Watch error on {:?}: {:?}", path, e);
                continue;
            }
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => return Ok(()),
        };

        if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
            continue;
        }
        if !event.paths.iter().any(|p| p.file_name() == Some(file_name.as_os_str())) {
            continue;
        }

        let now = std::time::Instant::now();
        if last_event.is_some_and(|last| now.duration_since(last) < DEBOUNCE) {
            continue;
        }
        last_event = Some(now);
        debug!("Dynamic configuration file event: {:?}", event.kind);

        // A full channel already holds a pending reload
        if let Err(mpsc::error::TrySendError::Closed(_)) = notify.try_send(()) {
            return Ok(());
        }
    }
}

use super::Duration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Static configuration, read once at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaticConfig {
    #[serde(default)]
    pub entry_points: BTreeMap<String, EntryPointConfig>,

    #[serde(default)]
    pub forwarding: ForwardingConfig,

    #[serde(default)]
    pub providers: ProvidersConfig,

    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryPointConfig {
    pub address: String,

    #[serde(default)]
    pub tls: Option<EntryPointTls>,

    #[serde(default)]
    pub transport: TransportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryPointTls {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Time given to in-flight connections to finish once shutdown starts.
    #[serde(default = "default_grace_timeout")]
    pub grace_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            grace_timeout: default_grace_timeout(),
        }
    }
}

fn default_grace_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Outbound connection settings shared by every HTTP forwarder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardingConfig {
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout: Duration,

    /// Zero disables the timeout.
    #[serde(default)]
    pub response_header_timeout: Duration,

    #[serde(default = "default_idle_conn_timeout")]
    pub idle_conn_timeout: Duration,

    #[serde(default = "default_max_idle_conns_per_host")]
    pub max_idle_conns_per_host: usize,
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            dial_timeout: default_dial_timeout(),
            response_header_timeout: Duration::ZERO,
            idle_conn_timeout: default_idle_conn_timeout(),
            max_idle_conns_per_host: default_max_idle_conns_per_host(),
        }
    }
}

fn default_dial_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_idle_conn_timeout() -> Duration {
    Duration::from_secs(90)
}

fn default_max_idle_conns_per_host() -> usize {
    200
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub file: Option<FileProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileProviderConfig {
    pub filename: PathBuf,

    #[serde(default)]
    pub watch: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Common,
    Json,
}

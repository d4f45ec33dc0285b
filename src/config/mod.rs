pub mod duration;
pub mod dynamic;
mod types;

pub use duration::Duration;
pub use dynamic::Configuration;
pub use types::*;

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::Path;

impl StaticConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: StaticConfig =
            serde_yml::from_str(&content).with_context(|| "Failed to parse config file")?;

        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.entry_points.is_empty() {
            anyhow::bail!("At least one entry point must be defined");
        }

        for (name, ep) in &self.entry_points {
            if name.contains('@') {
                anyhow::bail!("Entry point name '{}' must not contain '@'", name);
            }
            ep.address
                .parse::<SocketAddr>()
                .with_context(|| format!("Invalid address for entry point '{}': {}", name, ep.address))?;
        }

        if let Some(file) = &self.providers.file {
            if file.filename.as_os_str().is_empty() {
                anyhow::bail!("File provider requires a filename");
            }
        }

        Ok(())
    }

    /// Names of every configured entry point, sorted.
    pub fn entry_point_names(&self) -> Vec<String> {
        self.entry_points.keys().cloned().collect()
    }
}

/// Read a dynamic configuration document. YAML is a superset of JSON so
/// both formats go through the same parser.
pub fn load_dynamic(path: &Path) -> Result<Configuration> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read dynamic config: {:?}", path))?;

    if content.trim().is_empty() {
        return Ok(Configuration::default());
    }

    serde_yml::from_str(&content)
        .with_context(|| format!("Failed to parse dynamic config: {:?}", path))
}

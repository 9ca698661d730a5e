//! Hub binary configuration.
//!
//! Read from TOML at `$THREATEYE_CONFIG`, or `~/.config/threateye/hub.toml`
//! when the variable is unset. A missing file means defaults.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use threateye_hub_server::HubConfig;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "THREATEYE_CONFIG";

/// One accepted API key.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ApiKeyEntry {
    pub organization_id: String,
    /// Lowercase hex SHA-256 of the key.
    pub key_sha256: String,
    #[serde(default)]
    pub label: Option<String>,
    /// Whether the key may also open observer subscriptions.
    #[serde(default)]
    pub observer: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub bind_address: IpAddr,
    pub port: u16,
    pub heartbeat_interval_secs: u64,
    pub command_timeout_ms: u64,
    pub max_command_timeout_ms: u64,
    pub observer_queue_capacity: usize,
    pub send_buffer_size: usize,
    pub max_inflight_classifications: usize,
    pub max_commands_per_observer: usize,
    pub request_system_info_on_auth: bool,
    pub api_keys: Vec<ApiKeyEntry>,
}

impl Default for AppConfig {
    fn default() -> Self {
        let hub = HubConfig::default();
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: hub.port,
            heartbeat_interval_secs: hub.heartbeat_interval.as_secs(),
            command_timeout_ms: millis(hub.command_timeout),
            max_command_timeout_ms: millis(hub.max_command_timeout),
            observer_queue_capacity: hub.observer_queue_capacity,
            send_buffer_size: hub.send_buffer_size,
            max_inflight_classifications: hub.max_inflight_classifications,
            max_commands_per_observer: hub.max_commands_per_observer,
            request_system_info_on_auth: hub.request_system_info_on_auth,
            api_keys: Vec::new(),
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl AppConfig {
    /// Loads from the environment-selected path, or the default path.
    pub fn load() -> anyhow::Result<Self> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::load_from(Path::new(&path)),
            None => match default_path() {
                Some(path) if path.exists() => Self::load_from(&path),
                _ => {
                    tracing::info!("no config file found, using defaults");
                    Ok(Self::default())
                }
            },
        }
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        tracing::debug!(path = %path.display(), keys = config.api_keys.len(), "config loaded");
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        let max_heartbeat = HubConfig::MAX_HEARTBEAT_INTERVAL.as_secs();
        if !(1..=max_heartbeat).contains(&self.heartbeat_interval_secs) {
            anyhow::bail!("heartbeat_interval_secs must be between 1 and {max_heartbeat}");
        }
        if self.max_inflight_classifications > HubConfig::MAX_INFLIGHT_CLASSIFICATIONS {
            anyhow::bail!(
                "max_inflight_classifications must be at most {}",
                HubConfig::MAX_INFLIGHT_CLASSIFICATIONS
            );
        }
        if !(1..=HubConfig::MAX_INFLIGHT_CLASSIFICATIONS).contains(&self.max_commands_per_observer) {
            anyhow::bail!(
                "max_commands_per_observer must be between 1 and {}",
                HubConfig::MAX_INFLIGHT_CLASSIFICATIONS
            );
        }
        for entry in &self.api_keys {
            if entry.organization_id.is_empty() {
                anyhow::bail!("api key entry without organization_id");
            }
            let digest = hex::decode(&entry.key_sha256)
                .with_context(|| format!("key_sha256 for {} is not hex", entry.organization_id))?;
            if digest.len() != 32 {
                anyhow::bail!("key_sha256 for {} is not a SHA-256 digest", entry.organization_id);
            }
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            port: self.port,
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            command_timeout: Duration::from_millis(self.command_timeout_ms),
            max_command_timeout: Duration::from_millis(self.max_command_timeout_ms),
            observer_queue_capacity: self.observer_queue_capacity,
            send_buffer_size: self.send_buffer_size,
            max_inflight_classifications: self.max_inflight_classifications,
            max_commands_per_observer: self.max_commands_per_observer,
            request_system_info_on_auth: self.request_system_info_on_auth,
        }
    }
}

fn default_path() -> Option<PathBuf> {
    let home = std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE"))?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("threateye")
            .join("hub.toml"),
    )
}

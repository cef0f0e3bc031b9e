//! The `config` module loads settings and resolves destinations into the
//! channel configurations a session connects with.

mod settings;

use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use tracing::warn;

use crate::config::settings::PartialSettings;

pub use settings::{
    AgentSettings, ChannelSettings, DestinationSettings, LoggingSettings, Settings,
};

/// Loads the configuration from the default file and environment variables
/// Merges the configuration with default values
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from("config/default")
}

/// Loads `path` (any format the `config` crate knows, extension optional)
/// layered under `MSGSESSION_*` environment variables, e.g.
/// `MSGSESSION_AGENT__RESUBSCRIBE_ATTEMPTS=3`.
pub fn load_config_from(path: &str) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(
            Environment::with_prefix("MSGSESSION")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    // Merge with defaults
    let default = Settings::default();
    let agent = partial.agent.as_ref();

    Ok(Settings {
        logging: LoggingSettings {
            level: partial
                .logging
                .and_then(|l| l.level)
                .unwrap_or(default.logging.level),
        },
        agent: AgentSettings {
            request_timeout_secs: agent
                .and_then(|a| a.request_timeout_secs)
                .unwrap_or(default.agent.request_timeout_secs),
            resubscribe_attempts: agent
                .and_then(|a| a.resubscribe_attempts)
                .unwrap_or(default.agent.resubscribe_attempts),
            resubscribe_interval_ms: agent
                .and_then(|a| a.resubscribe_interval_ms)
                .unwrap_or(default.agent.resubscribe_interval_ms),
            reconnect_attempts: agent
                .and_then(|a| a.reconnect_attempts)
                .unwrap_or(default.agent.reconnect_attempts),
            reconnect_interval_ms: agent
                .and_then(|a| a.reconnect_interval_ms)
                .unwrap_or(default.agent.reconnect_interval_ms),
        },
        base_url: partial.base_url.or(default.base_url),
        channels: partial.channels.unwrap_or_default(),
        destinations: partial.destinations.unwrap_or_default(),
    })
}

/// Resolved configuration of one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelConfig {
    pub id: String,
    pub uri: String,
    pub failover_uris: Vec<String>,
    pub client_load_balancing_uris: Vec<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub login_after_disconnect: bool,
    pub small_messages: bool,
    pub reliable_reconnect_duration: Duration,
}

impl ChannelConfig {
    pub fn new(id: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            uri: uri.into(),
            failover_uris: Vec::new(),
            client_load_balancing_uris: Vec::new(),
            connect_timeout: Duration::ZERO,
            request_timeout: Duration::ZERO,
            login_after_disconnect: false,
            small_messages: false,
            reliable_reconnect_duration: Duration::ZERO,
        }
    }

    pub fn from_settings(id: &str, settings: &ChannelSettings) -> Self {
        Self {
            id: id.to_string(),
            uri: settings.uri.clone(),
            failover_uris: settings.failover_uris.clone(),
            client_load_balancing_uris: settings.client_load_balancing_uris.clone(),
            connect_timeout: Duration::from_secs(settings.connect_timeout_secs),
            request_timeout: Duration::from_secs(settings.request_timeout_secs),
            login_after_disconnect: settings.login_after_disconnect,
            small_messages: settings.small_messages,
            reliable_reconnect_duration: Duration::from_millis(
                settings.reliable_reconnect_duration_ms,
            ),
        }
    }
}

/// The channels a destination is reachable through, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct DestinationConfig {
    pub channels: Vec<ChannelConfig>,
    pub clustered: bool,
    pub heartbeat_interval: Duration,
}

/// Resolves destinations into channel configurations.
pub trait ConfigSource: Send + Sync {
    fn destination(&self, name: &str) -> Option<DestinationConfig>;

    fn base_url(&self) -> Option<String> {
        None
    }

    fn agent_defaults(&self) -> AgentSettings {
        AgentSettings::default()
    }
}

impl ConfigSource for Settings {
    fn destination(&self, name: &str) -> Option<DestinationConfig> {
        let destination = self.destinations.get(name)?;
        let channels = destination
            .channels
            .iter()
            .filter_map(|id| match self.channels.get(id) {
                Some(channel) => Some(ChannelConfig::from_settings(id, channel)),
                None => {
                    warn!(destination = name, channel = %id, "destination names an unknown channel");
                    None
                }
            })
            .collect();
        Some(DestinationConfig {
            channels,
            clustered: destination.clustered,
            heartbeat_interval: Duration::from_millis(destination.heartbeat_interval_ms),
        })
    }

    fn base_url(&self) -> Option<String> {
        self.base_url.clone()
    }

    fn agent_defaults(&self) -> AgentSettings {
        self.agent.clone()
    }
}

#[cfg(test)]
mod tests;

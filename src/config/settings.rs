use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

/// Top-level configuration settings for the application.
///
/// Holds logging, the defaults applied to new agents, and the channels and
/// destinations agents resolve their channel sets from.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub agent: AgentSettings,
    /// Base used to resolve relative channel uris and `{server.*}` tokens.
    pub base_url: Option<String>,
    pub channels: HashMap<String, ChannelSettings>,
    pub destinations: HashMap<String, DestinationSettings>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    pub level: String,
}

/// Defaults for newly created consumers and producers.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct AgentSettings {
    /// Seconds before an unanswered request faults; 0 disables.
    pub request_timeout_secs: u64,
    /// Resubscribe attempts after a retryable failure; -1 retries forever.
    pub resubscribe_attempts: i32,
    pub resubscribe_interval_ms: u64,
    /// Reconnect attempts for producers; -1 retries forever.
    pub reconnect_attempts: i32,
    pub reconnect_interval_ms: u64,
}

impl AgentSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn resubscribe_interval(&self) -> Duration {
        Duration::from_millis(self.resubscribe_interval_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}

/// One configured channel, keyed by its id in [`Settings::channels`].
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct ChannelSettings {
    pub uri: String,
    pub failover_uris: Vec<String>,
    /// Shuffled once; the first becomes the uri, the rest the failover list.
    pub client_load_balancing_uris: Vec<String>,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub login_after_disconnect: bool,
    pub small_messages: bool,
    pub reliable_reconnect_duration_ms: u64,
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct DestinationSettings {
    /// Channel ids in order of preference.
    pub channels: Vec<String>,
    pub clustered: bool,
    pub heartbeat_interval_ms: u64,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values can be filled using defaults.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub logging: Option<PartialLoggingSettings>,
    pub agent: Option<PartialAgentSettings>,
    pub base_url: Option<String>,
    pub channels: Option<HashMap<String, ChannelSettings>>,
    pub destinations: Option<HashMap<String, DestinationSettings>>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialAgentSettings {
    pub request_timeout_secs: Option<u64>,
    pub resubscribe_attempts: Option<i32>,
    pub resubscribe_interval_ms: Option<u64>,
    pub reconnect_attempts: Option<i32>,
    pub reconnect_interval_ms: Option<u64>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            request_timeout_secs: 0,
            resubscribe_attempts: 5,
            resubscribe_interval_ms: 5000,
            reconnect_attempts: 0,
            reconnect_interval_ms: 5000,
        }
    }
}

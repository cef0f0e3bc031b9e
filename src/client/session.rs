use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, info};

use crate::agent::{Consumer, Producer};
use crate::channel::{Channel, ChannelSet, ClientIdentity};
use crate::config::{AgentSettings, ChannelConfig, ConfigSource, Settings};
use crate::dispatcher::ConsumerMessageDispatcher;
use crate::transport::{TransportFactory, WebSocketTransportFactory};
use crate::utils::error::{Result, SessionError};

/// Process-level messaging state.
///
/// A session owns what every agent in a process shares: the client identity
/// handed out by the server, the consumer message dispatcher, one [`Channel`]
/// per configured channel id and the channel sets built from them.
pub struct Session {
    config: Arc<dyn ConfigSource>,
    transports: Arc<dyn TransportFactory>,
    identity: Arc<ClientIdentity>,
    dispatcher: Arc<ConsumerMessageDispatcher>,
    channels: Mutex<HashMap<String, Arc<Channel>>>,
    channel_sets: Mutex<HashMap<String, Weak<ChannelSet>>>,
}

impl Session {
    pub fn new(
        config: Arc<dyn ConfigSource>,
        transports: Arc<dyn TransportFactory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            transports,
            identity: Arc::new(ClientIdentity::new()),
            dispatcher: ConsumerMessageDispatcher::new(),
            channels: Mutex::new(HashMap::new()),
            channel_sets: Mutex::new(HashMap::new()),
        })
    }

    /// Session over WebSocket transports for the given settings.
    pub fn from_settings(settings: Settings) -> Arc<Self> {
        Self::new(Arc::new(settings), Arc::new(WebSocketTransportFactory))
    }

    pub fn identity(&self) -> &Arc<ClientIdentity> {
        &self.identity
    }

    pub fn dispatcher(&self) -> &Arc<ConsumerMessageDispatcher> {
        &self.dispatcher
    }

    pub fn agent_defaults(&self) -> AgentSettings {
        self.config.agent_defaults()
    }

    pub fn base_url(&self) -> Option<String> {
        self.config.base_url()
    }

    /// Creates a consumer for `destination`.
    pub fn consumer(self: &Arc<Self>, destination: &str) -> Arc<Consumer> {
        Consumer::new(Arc::clone(self), destination)
    }

    /// Creates a producer for `destination`.
    pub fn producer(self: &Arc<Self>, destination: &str) -> Arc<Producer> {
        Producer::new(Arc::clone(self), destination)
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<String, Arc<Channel>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The channel for `config.id`, created on first use.
    pub fn channel(&self, config: &ChannelConfig) -> Arc<Channel> {
        let mut channels = self.channels();
        if let Some(channel) = channels.get(&config.id) {
            return Arc::clone(channel);
        }
        debug!(channel = %config.id, uri = %config.uri, "creating channel");
        let channel = Channel::new(
            config.clone(),
            self.config.base_url(),
            self.transports.create(config),
            Arc::clone(&self.identity),
        );
        channels.insert(config.id.clone(), Arc::clone(&channel));
        channel
    }

    /// The channel set serving `destination`. Destinations configured with
    /// the same channels share one set for as long as an agent holds it.
    pub fn channel_set_for(&self, destination: &str) -> Result<Arc<ChannelSet>> {
        let resolved = self
            .config
            .destination(destination)
            .ok_or_else(|| SessionError::UnknownDestination(destination.to_string()))?;
        if resolved.channels.is_empty() {
            return Err(SessionError::NoChannels(destination.to_string()));
        }
        let ids: Vec<&str> = resolved.channels.iter().map(|c| c.id.as_str()).collect();
        let key = format!("{}|{}", ids.join(","), resolved.clustered);

        let mut sets = self
            .channel_sets
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = sets.get(&key).and_then(Weak::upgrade) {
            return Ok(existing);
        }
        let channels = resolved
            .channels
            .iter()
            .map(|config| self.channel(config))
            .collect();
        let channel_set = ChannelSet::new(channels, resolved.clustered, resolved.heartbeat_interval);
        info!(%destination, channel_set = %channel_set.id(), channels = ?ids, "channel set created");
        sets.retain(|_, set| set.strong_count() > 0);
        sets.insert(key, Arc::downgrade(&channel_set));
        Ok(channel_set)
    }
}

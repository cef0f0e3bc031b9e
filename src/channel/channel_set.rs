use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::channel::Channel;
use super::events::{ChannelEvent, ChannelFaultEvent};
use super::responder::{AgentTarget, ResponseTarget, status_fault};
use crate::agent::Agent;
use crate::message::headers::{CREDENTIALS_CHARSET_HEADER, HEARTBEAT_HEADER, RETRYABLE_HINT_HEADER};
use crate::message::{CommandOperation, MESSAGE_SEND_FAULT, Message, create_uid};
use crate::utils::encode_credentials;
use crate::utils::error::{Result, SessionError};

/// Receiver of messages pushed by the server through a channel set.
pub trait PushListener: Send + Sync {
    fn on_push(&self, channel_set: &Arc<ChannelSet>, message: Message);
}

/// Outcome of a login or logout: the acknowledgement, or the error message.
pub type AuthReply = std::result::Result<Message, Message>;

/// An ordered group of channels shared by the agents attached to it.
///
/// Exactly one channel is current. When it fails for good the set hunts
/// forward through the remaining channels before giving up.
pub struct ChannelSet {
    id: String,
    channels: Vec<Arc<Channel>>,
    clustered: bool,
    heartbeat_interval: Duration,
    state: Mutex<ChannelSetState>,
    self_ref: Weak<ChannelSet>,
}

struct PendingSend {
    message: Message,
    target: Arc<dyn ResponseTarget>,
}

#[derive(Default)]
struct ChannelSetState {
    current: usize,
    connecting: bool,
    connected: bool,
    authenticated: bool,
    authenticating: bool,
    agents: Vec<(String, Weak<dyn Agent>)>,
    pending: VecDeque<PendingSend>,
    push_listeners: Vec<Weak<dyn PushListener>>,
    cluster_requested: bool,
    heartbeat: Option<JoinHandle<()>>,
}

impl ChannelSetState {
    fn live_agents(&self) -> Vec<Arc<dyn Agent>> {
        self.agents
            .iter()
            .filter_map(|(_, agent)| agent.upgrade())
            .collect()
    }

    fn stop_heartbeat(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
    }
}

enum FaultAction {
    Relay,
    Hunt {
        from: Arc<Channel>,
        to: Arc<Channel>,
    },
    GiveUp {
        channel: Arc<Channel>,
        pending: VecDeque<PendingSend>,
    },
}

impl ChannelSet {
    pub fn new(channels: Vec<Arc<Channel>>, clustered: bool, heartbeat_interval: Duration) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            id: create_uid(),
            channels,
            clustered,
            heartbeat_interval,
            state: Mutex::new(ChannelSetState::default()),
            self_ref: self_ref.clone(),
        })
    }

    fn state(&self) -> MutexGuard<'_, ChannelSetState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn channels(&self) -> &[Arc<Channel>] {
        &self.channels
    }

    pub fn channel_ids(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.id().to_string()).collect()
    }

    pub fn current_channel(&self) -> Option<Arc<Channel>> {
        let current = self.state().current;
        self.channels.get(current).cloned()
    }

    pub fn connected(&self) -> bool {
        self.state().connected
    }

    pub fn authenticated(&self) -> bool {
        self.state().authenticated
    }

    pub fn clustered(&self) -> bool {
        self.clustered
    }

    pub fn agent_count(&self) -> usize {
        self.state()
            .agents
            .iter()
            .filter(|(_, agent)| agent.strong_count() > 0)
            .count()
    }

    pub fn pending_count(&self) -> usize {
        self.state().pending.len()
    }

    /// Attaches `agent`, connecting the current channel if needed. An agent
    /// joining a connected set is told so immediately.
    pub fn connect(&self, agent: &Arc<dyn Agent>) {
        let (start, connected, authenticated) = {
            let mut state = self.state();
            if !state.agents.iter().any(|(id, _)| id == agent.id()) {
                state.agents.retain(|(_, agent)| agent.strong_count() > 0);
                state
                    .agents
                    .push((agent.id().to_string(), Arc::downgrade(agent)));
            }
            let start = !state.connected && !state.connecting;
            if start {
                state.connecting = true;
            }
            (start, state.connected, state.authenticated)
        };
        if connected {
            if let Some(channel) = self.current_channel() {
                agent.channel_connected(&ChannelEvent::new(channel.id(), false, false));
            }
            if authenticated {
                agent.set_authenticated(true);
            }
        }
        if start {
            self.connect_current();
        }
    }

    fn connect_current(&self) {
        let (Some(this), Some(channel)) = (self.self_ref.upgrade(), self.current_channel()) else {
            warn!(channel_set = %self.id, "no channel to connect");
            self.state().connecting = false;
            return;
        };
        debug!(channel_set = %self.id, channel = %channel.id(), "connecting channel");
        channel.connect(&this);
    }

    /// Detaches the agent. The last agent to leave disconnects the channel.
    pub fn disconnect(&self, agent_id: &str) {
        let channel = {
            let mut state = self.state();
            state
                .agents
                .retain(|(id, agent)| id != agent_id && agent.strong_count() > 0);
            if !state.agents.is_empty() {
                return;
            }
            state.connected = false;
            state.connecting = false;
            state.authenticated = false;
            state.pending.clear();
            state.stop_heartbeat();
            self.channels.get(state.current).cloned()
        };
        if let Some(channel) = channel {
            debug!(channel_set = %self.id, "last agent left, disconnecting");
            channel.disconnect(self);
        }
    }

    /// Replaces the current channel's connection, also when other channel
    /// sets share it. Sends made meanwhile wait for the new connection.
    pub fn reconnect(&self) {
        if let Some(channel) = self.current_channel() {
            channel.reconnect_now();
        }
    }

    /// Sends on behalf of `agent`; responses reach its acknowledge/fault.
    pub fn send_for(&self, agent: Weak<dyn Agent>, message: Message) {
        self.send(message, AgentTarget::new(agent));
    }

    /// Sends through the current channel, queueing until it is connected.
    pub fn send(&self, message: Message, target: Arc<dyn ResponseTarget>) {
        let (channel, start) = {
            let mut state = self.state();
            if state.connected {
                (self.channels.get(state.current).cloned(), false)
            } else {
                state.pending.push_back(PendingSend {
                    message: message.clone(),
                    target: Arc::clone(&target),
                });
                let start = !state.connecting;
                if start {
                    state.connecting = true;
                }
                (None, start)
            }
        };
        match channel {
            Some(channel) => channel.send(message, target),
            None if start => self.connect_current(),
            None => debug!(channel_set = %self.id, "send queued until connected"),
        }
    }

    pub(crate) fn channel_connected(&self, event: &ChannelEvent) {
        let (channel, agents, pending, cluster) = {
            let mut state = self.state();
            let Some(channel) = self.channels.get(state.current).cloned() else {
                return;
            };
            if channel.id() != event.channel_id || state.connected {
                return;
            }
            state.connected = true;
            state.connecting = false;
            let cluster = self.clustered && !state.cluster_requested;
            state.cluster_requested |= cluster;
            if !self.heartbeat_interval.is_zero() {
                state.stop_heartbeat();
                state.heartbeat = Some(self.spawn_heartbeat());
            }
            (
                channel,
                state.live_agents(),
                std::mem::take(&mut state.pending),
                cluster,
            )
        };
        info!(channel_set = %self.id, channel = %channel.id(), "connected");
        for agent in &agents {
            agent.channel_connected(event);
        }
        for send in pending {
            channel.send(send.message, send.target);
        }
        if cluster {
            self.request_cluster(&channel);
        }
    }

    pub(crate) fn channel_disconnected(&self, event: &ChannelEvent) {
        let agents = {
            let mut state = self.state();
            if !self.is_current(&state, &event.channel_id) {
                return;
            }
            state.connected = false;
            state.connecting = event.reconnecting;
            state.stop_heartbeat();
            state.live_agents()
        };
        for agent in agents {
            agent.channel_disconnected(event);
        }
    }

    pub(crate) fn channel_faulted(&self, event: &ChannelFaultEvent) {
        let (action, agents) = {
            let mut state = self.state();
            if !self.is_current(&state, &event.channel_id) {
                return;
            }
            state.connected = false;
            let action = if event.reconnecting {
                FaultAction::Relay
            } else {
                let from = Arc::clone(&self.channels[state.current]);
                match self.channels.get(state.current + 1) {
                    Some(next) if !event.rejected() => {
                        state.current += 1;
                        FaultAction::Hunt {
                            from,
                            to: Arc::clone(next),
                        }
                    }
                    _ => {
                        state.current = 0;
                        state.connecting = false;
                        FaultAction::GiveUp {
                            channel: from,
                            pending: std::mem::take(&mut state.pending),
                        }
                    }
                }
            };
            (action, state.live_agents())
        };
        match action {
            FaultAction::Relay => {
                for agent in agents {
                    agent.channel_faulted(event);
                }
            }
            FaultAction::Hunt { from, to } => {
                info!(channel_set = %self.id, from = %from.id(), to = %to.id(), "trying next channel");
                from.disconnect(self);
                if let Some(this) = self.self_ref.upgrade() {
                    to.connect(&this);
                }
            }
            FaultAction::GiveUp { channel, pending } => {
                warn!(channel_set = %self.id, code = %event.fault.code, "no channel could connect");
                channel.disconnect(self);
                // agents decide on retrying before their queued sends fail
                for agent in agents {
                    agent.channel_faulted(event);
                }
                for send in pending {
                    let mut fault = Message::error_for(
                        &send.message,
                        MESSAGE_SEND_FAULT,
                        "Send failed",
                        format!(
                            "No channel could deliver the message: {}",
                            event.fault.description
                        ),
                    );
                    if !event.rejected() {
                        fault.headers.insert(RETRYABLE_HINT_HEADER, true);
                    }
                    send.target.on_status(fault, send.message);
                }
            }
        }
    }

    pub(crate) fn channel_authenticated(&self, authenticated: bool) {
        let agents = {
            let mut state = self.state();
            if state.authenticated == authenticated {
                return;
            }
            state.authenticated = authenticated;
            state.live_agents()
        };
        for agent in agents {
            agent.set_authenticated(authenticated);
        }
    }

    pub(crate) fn channel_message(&self, message: Message) {
        let Some(this) = self.self_ref.upgrade() else {
            return;
        };
        let listeners: Vec<_> = self
            .state()
            .push_listeners
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        if listeners.is_empty() {
            debug!(channel_set = %self.id, "push without listeners dropped");
        }
        for listener in listeners {
            listener.on_push(&this, message.clone());
        }
    }

    fn is_current(&self, state: &ChannelSetState, channel_id: &str) -> bool {
        self.channels
            .get(state.current)
            .is_some_and(|channel| channel.id() == channel_id)
    }

    pub fn add_push_listener(&self, listener: Weak<dyn PushListener>) {
        let mut state = self.state();
        if !state.push_listeners.iter().any(|l| Weak::ptr_eq(l, &listener)) {
            state.push_listeners.push(listener);
        }
    }

    pub fn remove_push_listener(&self, listener: &Weak<dyn PushListener>) {
        self.state()
            .push_listeners
            .retain(|l| !Weak::ptr_eq(l, listener) && l.strong_count() > 0);
    }

    pub fn has_push_listeners(&self) -> bool {
        self.state()
            .push_listeners
            .iter()
            .any(|l| l.strong_count() > 0)
    }

    /// Forwards an agent's credentials to the current channel.
    pub fn set_credentials(
        &self,
        credentials: Option<String>,
        charset: Option<String>,
        agent: Weak<dyn Agent>,
    ) -> Result<()> {
        match self.current_channel() {
            Some(channel) => channel.set_credentials(credentials, charset, Some(agent)),
            None => Err(SessionError::NoChannels(self.id.clone())),
        }
    }

    /// Logs in on the current channel, connecting it if needed.
    pub fn login(
        &self,
        username: &str,
        password: &str,
        charset: Option<String>,
    ) -> Result<oneshot::Receiver<AuthReply>> {
        {
            let mut state = self.state();
            if state.authenticated {
                return Err(SessionError::AlreadyAuthenticated(self.id.clone()));
            }
            if state.authenticating {
                return Err(SessionError::AuthenticationInProgress(self.id.clone()));
            }
            state.authenticating = true;
        }
        let credentials = encode_credentials(username, password);
        let mut message = Message::command(CommandOperation::Login).with_body(credentials.clone());
        if let Some(charset) = &charset {
            message.headers.insert(CREDENTIALS_CHARSET_HEADER, charset.clone());
        }
        let (reply, receiver) = oneshot::channel();
        let target = Arc::new(AuthTarget {
            channel_set: self.self_ref.clone(),
            credentials: Some(credentials),
            charset,
            authenticated: true,
            reply: Mutex::new(Some(reply)),
        });
        self.send(message, target);
        Ok(receiver)
    }

    pub fn logout(&self) -> oneshot::Receiver<AuthReply> {
        self.state().authenticating = true;
        let (reply, receiver) = oneshot::channel();
        let target = Arc::new(AuthTarget {
            channel_set: self.self_ref.clone(),
            credentials: None,
            charset: None,
            authenticated: false,
            reply: Mutex::new(Some(reply)),
        });
        self.send(Message::command(CommandOperation::Logout), target);
        receiver
    }

    fn spawn_heartbeat(&self) -> JoinHandle<()> {
        let channel_set = self.self_ref.clone();
        let interval = self.heartbeat_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(channel_set) = channel_set.upgrade() else {
                    return;
                };
                let Some(channel) = channel_set.current_channel() else {
                    return;
                };
                if !channel_set.connected() {
                    return;
                }
                let ping = Message::command(CommandOperation::ClientPing)
                    .with_header(HEARTBEAT_HEADER, true);
                channel.send(ping, Arc::new(HeartbeatTarget));
            }
        })
    }

    fn request_cluster(&self, channel: &Arc<Channel>) {
        debug!(channel_set = %self.id, "requesting cluster endpoints");
        let target = Arc::new(ClusterTarget {
            channel_set: self.self_ref.clone(),
        });
        channel.send(Message::command(CommandOperation::ClusterRequest), target);
    }

    /// Applies a cluster-request reply: an array of `{channelId: uri}`
    /// objects, one per server node.
    fn apply_cluster(&self, body: &Value) {
        let Some(nodes) = body.as_array() else {
            return;
        };
        for channel in &self.channels {
            let current = channel.uri();
            let uris: Vec<String> = nodes
                .iter()
                .filter_map(|node| node.get(channel.id()).and_then(Value::as_str))
                .filter(|uri| *uri != current)
                .map(str::to_string)
                .collect();
            if !uris.is_empty() {
                debug!(channel = %channel.id(), count = uris.len(), "cluster failover uris");
                channel.set_failover_uris(uris);
            }
        }
    }
}

struct AuthTarget {
    channel_set: Weak<ChannelSet>,
    credentials: Option<String>,
    charset: Option<String>,
    authenticated: bool,
    reply: Mutex<Option<oneshot::Sender<AuthReply>>>,
}

impl AuthTarget {
    fn finish(&self, outcome: AuthReply) {
        if let Some(channel_set) = self.channel_set.upgrade() {
            channel_set.state().authenticating = false;
            if outcome.is_ok() {
                if let Some(channel) = channel_set.current_channel() {
                    channel.apply_authentication(
                        self.credentials.clone(),
                        self.charset.clone(),
                        self.authenticated,
                    );
                }
            }
        }
        let reply = self
            .reply
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reply) = reply {
            // the caller may have dropped the receiver
            let _ = reply.send(outcome);
        }
    }
}

impl ResponseTarget for AuthTarget {
    fn on_result(&self, response: Message, _request: Message) {
        if response.is_error() {
            self.finish(Err(response));
        } else {
            self.finish(Ok(response));
        }
    }

    fn on_status(&self, fault: Message, request: Message) {
        self.finish(Err(status_fault(fault, &request)));
    }
}

struct HeartbeatTarget;

impl ResponseTarget for HeartbeatTarget {
    fn on_result(&self, response: Message, _request: Message) {
        if let Some(fault) = response.fault() {
            debug!(code = %fault.fault_code, "heartbeat rejected");
        }
    }

    fn on_status(&self, fault: Message, _request: Message) {
        debug!(code = ?fault.fault_code(), "heartbeat failed");
    }
}

struct ClusterTarget {
    channel_set: Weak<ChannelSet>,
}

impl ResponseTarget for ClusterTarget {
    fn on_result(&self, response: Message, _request: Message) {
        if response.is_error() {
            warn!(code = ?response.fault_code(), "cluster request failed");
            return;
        }
        if let Some(channel_set) = self.channel_set.upgrade() {
            channel_set.apply_cluster(&response.body);
        }
    }

    fn on_status(&self, fault: Message, _request: Message) {
        warn!(code = ?fault.fault_code(), "cluster request failed");
    }
}

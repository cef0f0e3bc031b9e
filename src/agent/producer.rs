use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::Agent;
use super::events::AgentEvent;
use super::message_agent::MessageAgent;
use super::retry::{RetryPolicy, RetryTimer, Tick};
use crate::channel::{ChannelEvent, ChannelFaultEvent, ChannelSet};
use crate::client::Session;
use crate::message::headers::{PRIORITY_HEADER, SUBTOPIC_HEADER};
use crate::message::{CONNECT_FAULT, CommandOperation, Headers, MESSAGE_SEND_FAULT, Message};
use crate::utils::error::Result;

/// Highest message priority the server accepts.
pub const MAX_PRIORITY: u8 = 9;

/// Sends messages to a destination.
pub struct Producer {
    agent: MessageAgent,
    reconnect: RetryTimer,
    state: Mutex<ProducerState>,
    self_ref: Weak<Producer>,
}

struct ProducerState {
    auto_connect: bool,
    should_be_connected: bool,
    connect_pending: bool,
    default_headers: Headers,
    subtopic: Option<String>,
    priority: Option<u8>,
    reconnect_attempts: i32,
    reconnect_interval: Duration,
    connect_message: Option<Message>,
}

impl Producer {
    pub(crate) fn new(session: Arc<Session>, destination: &str) -> Arc<Self> {
        let defaults = session.agent_defaults();
        Arc::new_cyclic(|self_ref: &Weak<Producer>| {
            let owner: Weak<dyn Agent> = self_ref.clone();
            Self {
                agent: MessageAgent::new(session, "producer", destination, owner),
                reconnect: RetryTimer::new(),
                state: Mutex::new(ProducerState {
                    auto_connect: true,
                    should_be_connected: false,
                    connect_pending: false,
                    default_headers: Headers::new(),
                    subtopic: None,
                    priority: None,
                    reconnect_attempts: defaults.reconnect_attempts,
                    reconnect_interval: defaults.reconnect_interval(),
                    connect_message: None,
                }),
                self_ref: self_ref.clone(),
            }
        })
    }

    fn state(&self) -> MutexGuard<'_, ProducerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn agent(&self) -> &MessageAgent {
        &self.agent
    }

    pub fn events(&self) -> mpsc::UnboundedReceiver<AgentEvent> {
        self.agent.events()
    }

    pub fn connected(&self) -> bool {
        self.agent.connected()
    }

    pub fn channel_set(&self) -> Option<Arc<ChannelSet>> {
        self.agent.channel_set()
    }

    pub fn reconnecting(&self) -> bool {
        self.reconnect.is_running()
    }

    pub fn auto_connect(&self) -> bool {
        self.state().auto_connect
    }

    pub fn set_auto_connect(&self, auto_connect: bool) {
        self.state().auto_connect = auto_connect;
    }

    pub fn default_headers(&self) -> Headers {
        self.state().default_headers.clone()
    }

    /// Headers added to every sent message that does not set them itself.
    pub fn set_default_headers(&self, headers: Headers) {
        self.state().default_headers = headers;
    }

    pub fn set_subtopic(&self, subtopic: Option<String>) {
        self.state().subtopic = subtopic;
    }

    pub fn priority(&self) -> Option<u8> {
        self.state().priority
    }

    /// Default priority of sent messages, clamped to `0..=9`.
    pub fn set_priority(&self, priority: Option<u8>) {
        self.state().priority = priority.map(|p| p.min(MAX_PRIORITY));
    }

    pub fn set_reconnect_attempts(&self, attempts: i32) {
        self.state().reconnect_attempts = attempts;
    }

    pub fn set_reconnect_interval(&self, interval: Duration) {
        self.state().reconnect_interval = interval;
    }

    /// Connects to the destination ahead of the first send. Does nothing
    /// while connected or while a connect is outstanding.
    pub fn connect(&self) -> Result<()> {
        if self.connected() {
            return Ok(());
        }
        let message = {
            let mut state = self.state();
            state.should_be_connected = true;
            if state.connect_pending {
                return Ok(());
            }
            state.connect_pending = true;
            state
                .connect_message
                .get_or_insert_with(|| Message::command(CommandOperation::TriggerConnect))
                .clone()
        };
        debug!(agent = %self.agent.id(), "connecting");
        self.agent.internal_send(message, false)
    }

    /// Sends `message` to the destination. Without a connection and with
    /// auto-connect off the message faults locally instead.
    pub fn send(&self, mut message: Message) -> Result<()> {
        let auto_connect = self.auto_connect();
        if !self.connected() && auto_connect {
            self.connect()?;
        }
        message.destination = self.agent.destination();
        {
            let state = self.state();
            if let Some(subtopic) = &state.subtopic {
                message.headers.insert_if_absent(SUBTOPIC_HEADER, subtopic.clone());
            }
            if let Some(priority) = state.priority {
                message.headers.insert_if_absent(PRIORITY_HEADER, priority);
            }
            message.headers.merge_missing(&state.default_headers);
        }
        if !self.connected() && !auto_connect {
            let fault = Message::error_for(
                &message,
                MESSAGE_SEND_FAULT,
                "Send failed",
                "The producer is not connected and does not connect automatically.",
            );
            self.agent.dispatch_fault(fault, message);
            return Ok(());
        }
        self.agent.internal_send(message, true)
    }

    pub fn disconnect(&self) {
        self.reconnect.stop();
        {
            let mut state = self.state();
            state.should_be_connected = false;
            state.connect_pending = false;
        }
        self.agent.disconnect();
    }

    fn is_connect_message(&self, request: &Message) -> bool {
        request.is_command(CommandOperation::TriggerConnect)
            && self
                .state()
                .connect_message
                .as_ref()
                .is_some_and(|current| current.message_id() == request.message_id())
    }

    fn start_reconnect(&self) -> bool {
        let policy = {
            let state = self.state();
            RetryPolicy::new(state.reconnect_attempts, state.reconnect_interval)
        };
        let producer = self.self_ref.clone();
        self.reconnect.start(policy, move |tick| {
            if let Some(producer) = producer.upgrade() {
                producer.reconnect_tick(tick);
            }
        })
    }

    fn reconnect_tick(&self, tick: Tick) {
        match tick {
            Tick::Attempt(attempt) => {
                let message = {
                    let state = self.state();
                    state
                        .should_be_connected
                        .then(|| state.connect_message.clone())
                        .flatten()
                };
                let Some(message) = message else {
                    self.reconnect.stop();
                    return;
                };
                let connected = self
                    .agent
                    .channel_set()
                    .is_some_and(|channel_set| channel_set.connected());
                info!(agent = %self.agent.id(), attempt, connected, "reconnect attempt");
                let sent = if connected {
                    self.agent.internal_send(message, false)
                } else {
                    self.agent.connect_channel_set()
                };
                if let Err(e) = sent {
                    warn!(agent = %self.agent.id(), error = %e, "reconnect attempt failed");
                }
            }
            Tick::Exhausted => {
                let request = {
                    let mut state = self.state();
                    state.should_be_connected = false;
                    state.connect_message.clone()
                };
                warn!(agent = %self.agent.id(), "reconnect attempts exhausted");
                let request =
                    request.unwrap_or_else(|| Message::command(CommandOperation::TriggerConnect));
                let fault = Message::error_for(
                    &request,
                    CONNECT_FAULT,
                    "Connect failed",
                    "Reconnect attempts exhausted.",
                );
                self.agent.dispatch_fault(fault, request);
            }
        }
    }
}

impl Agent for Producer {
    fn id(&self) -> &str {
        self.agent.id()
    }

    fn acknowledge(&self, ack: Message, request: Message) {
        if self.is_connect_message(&request) {
            self.state().connect_pending = false;
            self.reconnect.stop();
        }
        self.agent.acknowledge(ack, request);
    }

    fn fault(&self, mut error: Message, request: Message) {
        if self.agent.barrier_raised() {
            return;
        }
        if self.is_connect_message(&request) {
            let should_be_connected = {
                let mut state = self.state();
                state.connect_pending = false;
                state.should_be_connected
            };
            if self.reconnect.is_running()
                || (error.is_retryable() && should_be_connected && self.start_reconnect())
            {
                debug!(agent = %self.agent.id(), code = ?error.fault_code(), "connect fault while reconnecting");
                self.agent.adopt_identity(&error, &request);
                return;
            }
            self.state().should_be_connected = false;
            if let Some(fault) = error.fault_mut() {
                fault.fault_code = CONNECT_FAULT.to_string();
            }
        }
        self.agent.fault(error, request);
    }

    fn channel_connected(&self, event: &ChannelEvent) {
        self.reconnect.stop();
        self.agent.channel_connected(event);
    }

    fn channel_disconnected(&self, event: &ChannelEvent) {
        self.agent.channel_disconnected(event);
        if self.state().should_be_connected && !event.rejected {
            self.start_reconnect();
        }
    }

    fn channel_faulted(&self, event: &ChannelFaultEvent) {
        self.agent.channel_faulted(event);
        if self.state().should_be_connected && !event.rejected() {
            self.start_reconnect();
        }
    }

    fn set_authenticated(&self, authenticated: bool) {
        self.agent.set_authenticated(authenticated);
    }
}

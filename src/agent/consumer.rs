use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::Agent;
use super::events::{AgentEvent, PropertyChange};
use super::message_agent::MessageAgent;
use super::retry::{RetryPolicy, RetryTimer, Tick};
use crate::channel::{ChannelEvent, ChannelFaultEvent, ChannelSet};
use crate::client::Session;
use crate::dispatcher::ConsumerMessageDispatcher;
use crate::message::headers::{
    MAX_FREQUENCY_HEADER, PRESERVE_DURABLE_HEADER, SELECTOR_HEADER, SUBTOPIC_HEADER,
};
use crate::message::{CommandOperation, Message, SUBSCRIBE_FAULT};
use crate::transport::message::WireMessage;
use crate::utils::error::Result;

/// Receives messages published to a destination.
///
/// A subscription that fails with a retryable fault, or whose channel drops,
/// is retried on a timer until it succeeds or the attempt budget runs out.
pub struct Consumer {
    agent: MessageAgent,
    dispatcher: Arc<ConsumerMessageDispatcher>,
    resubscribe: RetryTimer,
    state: Mutex<ConsumerState>,
    self_ref: Weak<Consumer>,
}

struct ConsumerState {
    subscribed: bool,
    should_be_subscribed: bool,
    selector: Option<String>,
    subtopic: Option<String>,
    max_frequency: u32,
    timestamp: i64,
    resubscribe_attempts: i32,
    resubscribe_interval: Duration,
    subscribe_message: Option<Message>,
    /// The current subscribe was sent and its reply is still outstanding.
    subscribe_in_flight: bool,
}

impl Consumer {
    pub(crate) fn new(session: Arc<Session>, destination: &str) -> Arc<Self> {
        let defaults = session.agent_defaults();
        let dispatcher = Arc::clone(session.dispatcher());
        Arc::new_cyclic(|self_ref: &Weak<Consumer>| {
            let owner: Weak<dyn Agent> = self_ref.clone();
            Self {
                agent: MessageAgent::new(session, "consumer", destination, owner),
                dispatcher,
                resubscribe: RetryTimer::new(),
                state: Mutex::new(ConsumerState {
                    subscribed: false,
                    should_be_subscribed: false,
                    selector: None,
                    subtopic: None,
                    max_frequency: 0,
                    timestamp: -1,
                    resubscribe_attempts: defaults.resubscribe_attempts,
                    resubscribe_interval: defaults.resubscribe_interval(),
                    subscribe_message: None,
                    subscribe_in_flight: false,
                }),
                self_ref: self_ref.clone(),
            }
        })
    }

    fn state(&self) -> MutexGuard<'_, ConsumerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The shared agent state: client id, destination, credentials and events.
    pub fn agent(&self) -> &MessageAgent {
        &self.agent
    }

    pub fn events(&self) -> mpsc::UnboundedReceiver<AgentEvent> {
        self.agent.events()
    }

    pub fn client_id(&self) -> Option<String> {
        self.agent.client_id()
    }

    pub fn channel_set(&self) -> Option<Arc<ChannelSet>> {
        self.agent.channel_set()
    }

    pub fn subscribed(&self) -> bool {
        self.state().subscribed
    }

    pub fn should_be_subscribed(&self) -> bool {
        self.state().should_be_subscribed
    }

    pub fn resubscribing(&self) -> bool {
        self.resubscribe.is_running()
    }

    /// Timestamp of the newest message seen; `-1` before the first one.
    pub fn timestamp(&self) -> i64 {
        self.state().timestamp
    }

    pub fn selector(&self) -> Option<String> {
        self.state().selector.clone()
    }

    /// Changes the selector, resubscribing when currently subscribed.
    pub fn set_selector(&self, selector: Option<String>) -> Result<()> {
        let resubscribe = {
            let mut state = self.state();
            if state.selector == selector {
                return Ok(());
            }
            state.selector = selector;
            state.subscribed
        };
        if resubscribe {
            self.subscribe(None)?;
        }
        Ok(())
    }

    pub fn subtopic(&self) -> Option<String> {
        self.state().subtopic.clone()
    }

    /// Changes the subtopic. An active subscription is dropped and made again
    /// for the new subtopic.
    pub fn set_subtopic(&self, subtopic: Option<String>) -> Result<()> {
        let resubscribe = {
            let mut state = self.state();
            if state.subtopic == subtopic {
                return Ok(());
            }
            state.subtopic = subtopic;
            state.subscribed
        };
        if resubscribe {
            self.unsubscribe(false)?;
            self.subscribe(None)?;
        }
        Ok(())
    }

    pub fn set_max_frequency(&self, max_frequency: u32) {
        self.state().max_frequency = max_frequency;
    }

    /// Retries after the initial subscribe; `-1` retries until stopped and
    /// `0` disables retrying.
    pub fn set_resubscribe_attempts(&self, attempts: i32) {
        self.state().resubscribe_attempts = attempts;
    }

    pub fn set_resubscribe_interval(&self, interval: Duration) {
        self.state().resubscribe_interval = interval;
    }

    pub fn set_destination(&self, destination: &str) -> Result<()> {
        let resubscribe = self.subscribed();
        if resubscribe {
            self.unsubscribe(false)?;
        }
        self.agent.set_destination(destination);
        if resubscribe {
            self.subscribe(None)?;
        }
        Ok(())
    }

    /// Subscribes to the destination, optionally under an identity handed
    /// out earlier. A subscription held under another identity is dropped
    /// first.
    pub fn subscribe(&self, client_id: Option<&str>) -> Result<()> {
        if let Some(client_id) = client_id {
            if self.agent.client_id().as_deref() != Some(client_id) {
                if self.subscribed() {
                    self.unsubscribe(false)?;
                }
                self.agent.set_client_id(Some(client_id.to_string()));
            }
        }
        self.resubscribe.stop();
        let message = {
            let mut state = self.state();
            state.should_be_subscribed = true;
            let mut message = Message::command(CommandOperation::Subscribe);
            if let Some(selector) = &state.selector {
                message.headers.insert(SELECTOR_HEADER, selector.clone());
            }
            if let Some(subtopic) = &state.subtopic {
                message.headers.insert(SUBTOPIC_HEADER, subtopic.clone());
            }
            if state.max_frequency > 0 {
                message
                    .headers
                    .insert(MAX_FREQUENCY_HEADER, state.max_frequency);
            }
            state.subscribe_message = Some(message.clone());
            message
        };
        info!(agent = %self.agent.id(), destination = %self.agent.destination(), "subscribing");
        self.send_subscribe(message)
    }

    fn send_subscribe(&self, message: Message) -> Result<()> {
        self.state().subscribe_in_flight = true;
        let sent = self.agent.internal_send(message, true);
        if sent.is_err() {
            self.state().subscribe_in_flight = false;
        }
        sent
    }

    /// Drops the subscription. Pushes stop reaching this consumer at once,
    /// before the server confirms.
    pub fn unsubscribe(&self, preserve_durable: bool) -> Result<()> {
        let subscribed = {
            let mut state = self.state();
            state.should_be_subscribed = false;
            state.subscribed
        };
        if !subscribed {
            self.resubscribe.stop();
            return Ok(());
        }
        self.dispatcher.unregister(self);
        let mut message = Message::command(CommandOperation::Unsubscribe);
        if preserve_durable {
            message.headers.insert(PRESERVE_DURABLE_HEADER, true);
        }
        {
            let state = self.state();
            if let Some(subtopic) = &state.subtopic {
                message.headers.insert(SUBTOPIC_HEADER, subtopic.clone());
            }
            if let Some(selector) = &state.selector {
                message.headers.insert(SELECTOR_HEADER, selector.clone());
            }
        }
        info!(agent = %self.agent.id(), "unsubscribing");
        self.agent.internal_send(message, true)
    }

    /// Asks the server for queued messages; only meaningful on channels that
    /// poll rather than receive pushes.
    pub fn receive(&self) -> Result<()> {
        let timestamp = self.timestamp();
        debug!(agent = %self.agent.id(), timestamp, "polling");
        self.agent
            .internal_send(Message::command(CommandOperation::Poll), true)
    }

    /// Unsubscribes locally, stops retrying and detaches from the channel set.
    pub fn disconnect(&self) {
        self.resubscribe.stop();
        {
            let mut state = self.state();
            state.should_be_subscribed = false;
            state.subscribe_in_flight = false;
        }
        self.set_subscribed(false);
        self.agent.disconnect();
    }

    fn set_subscribed(&self, subscribed: bool) {
        let changed = {
            let mut state = self.state();
            let changed = state.subscribed != subscribed;
            state.subscribed = subscribed;
            changed
        };
        if !changed {
            return;
        }
        if subscribed {
            if let Some(this) = self.self_ref.upgrade() {
                self.dispatcher.register(&this);
            }
        } else {
            self.dispatcher.unregister(self);
        }
        self.agent
            .emit(AgentEvent::PropertyChange(PropertyChange::Subscribed(subscribed)));
    }

    fn is_current_subscribe(&self, request: &Message) -> bool {
        request.is_command(CommandOperation::Subscribe)
            && self
                .state()
                .subscribe_message
                .as_ref()
                .is_some_and(|current| current.message_id() == request.message_id())
    }

    fn start_resubscribe(&self) -> bool {
        let policy = {
            let state = self.state();
            RetryPolicy::new(state.resubscribe_attempts, state.resubscribe_interval)
        };
        let consumer = self.self_ref.clone();
        let started = self.resubscribe.start(policy, move |tick| {
            if let Some(consumer) = consumer.upgrade() {
                consumer.resubscribe_tick(tick);
            }
        });
        if started {
            debug!(agent = %self.agent.id(), "resubscribe timer started");
        }
        started
    }

    fn resubscribe_tick(&self, tick: Tick) {
        match tick {
            Tick::Attempt(attempt) => {
                let (message, in_flight) = {
                    let state = self.state();
                    if !state.should_be_subscribed || state.subscribed {
                        (None, false)
                    } else {
                        (state.subscribe_message.clone(), state.subscribe_in_flight)
                    }
                };
                let Some(message) = message else {
                    self.resubscribe.stop();
                    return;
                };
                if in_flight {
                    debug!(agent = %self.agent.id(), attempt, "subscribe still awaiting its reply");
                    return;
                }
                let connected = self
                    .agent
                    .channel_set()
                    .is_some_and(|channel_set| channel_set.connected());
                info!(agent = %self.agent.id(), attempt, connected, "resubscribe attempt");
                let sent = if connected {
                    self.send_subscribe(message)
                } else {
                    self.agent.connect_channel_set()
                };
                if let Err(e) = sent {
                    warn!(agent = %self.agent.id(), error = %e, "resubscribe attempt failed");
                }
            }
            Tick::Exhausted => {
                let request = {
                    let mut state = self.state();
                    state.should_be_subscribed = false;
                    state.subscribe_message.clone()
                };
                warn!(agent = %self.agent.id(), "resubscribe attempts exhausted");
                let request = request.unwrap_or_else(|| Message::command(CommandOperation::Subscribe));
                let fault = Message::error_for(
                    &request,
                    SUBSCRIBE_FAULT,
                    "Subscribe failed",
                    "Subscription attempts exhausted.",
                );
                self.agent.dispatch_fault(fault, request);
            }
        }
    }

    /// Hands over a message pushed by the server for this subscription.
    pub(crate) fn deliver(&self, message: Message) {
        if message.is_command(CommandOperation::SubscriptionInvalidate) {
            info!(agent = %self.agent.id(), "subscription invalidated by the server");
            self.set_subscribed(false);
            return;
        }
        {
            let mut state = self.state();
            if message.timestamp > state.timestamp {
                state.timestamp = message.timestamp;
            }
        }
        if message.is_error() {
            self.agent.emit(AgentEvent::Fault {
                fault: message,
                request: None,
            });
        } else {
            self.agent.emit(AgentEvent::Message(message));
        }
    }

    fn deliver_polled(&self, body: &Value) {
        let Some(items) = body.as_array() else {
            return;
        };
        for item in items {
            match serde_json::from_value::<WireMessage>(item.clone()) {
                Ok(wire) => self.deliver(wire.into()),
                Err(e) => warn!(agent = %self.agent.id(), error = %e, "invalid polled message"),
            }
        }
    }
}

impl Agent for Consumer {
    fn id(&self) -> &str {
        self.agent.id()
    }

    fn acknowledge(&self, ack: Message, request: Message) {
        if self.agent.barrier_raised() {
            return;
        }
        match request.operation() {
            Some(CommandOperation::Subscribe) if self.is_current_subscribe(&request) => {
                if let Some(client_id) = &ack.client_id {
                    self.agent.set_client_id(Some(client_id.clone()));
                }
                {
                    let mut state = self.state();
                    state.subscribe_in_flight = false;
                    if ack.timestamp > state.timestamp {
                        state.timestamp = ack.timestamp;
                    }
                }
                self.resubscribe.stop();
                self.set_subscribed(true);
                info!(agent = %self.agent.id(), client_id = ?self.agent.client_id(), "subscribed");
            }
            Some(CommandOperation::Unsubscribe) => {
                self.set_subscribed(false);
                info!(agent = %self.agent.id(), "unsubscribed");
            }
            Some(CommandOperation::Poll) => self.deliver_polled(&ack.body),
            _ => {}
        }
        self.agent.acknowledge(ack, request);
    }

    fn fault(&self, error: Message, request: Message) {
        if self.agent.barrier_raised() || self.agent.reauthorize(&error, &request) {
            return;
        }
        if self.is_current_subscribe(&request) {
            self.state().subscribe_in_flight = false;
            if error.is_retryable()
                && self.should_be_subscribed()
                && (self.resubscribe.is_running() || self.start_resubscribe())
            {
                debug!(agent = %self.agent.id(), code = ?error.fault_code(), "retryable subscribe fault");
                self.agent.adopt_identity(&error, &request);
                return;
            }
            self.resubscribe.stop();
            self.state().should_be_subscribed = false;
        }
        self.agent.surface_fault(error, request);
    }

    fn channel_connected(&self, event: &ChannelEvent) {
        self.agent.channel_connected(event);
        let resend = {
            let state = self.state();
            (state.should_be_subscribed
                && !state.subscribed
                && !state.subscribe_in_flight
                && self.resubscribe.is_running())
            .then(|| state.subscribe_message.clone())
            .flatten()
        };
        if let Some(message) = resend {
            debug!(agent = %self.agent.id(), "channel back, resubscribing");
            if let Err(e) = self.send_subscribe(message) {
                warn!(agent = %self.agent.id(), error = %e, "resubscribe failed");
            }
        }
    }

    fn channel_disconnected(&self, event: &ChannelEvent) {
        self.set_subscribed(false);
        self.agent.channel_disconnected(event);
        if self.should_be_subscribed() && !event.rejected {
            self.start_resubscribe();
        }
    }

    fn channel_faulted(&self, event: &ChannelFaultEvent) {
        if !event.channel_connected {
            self.set_subscribed(false);
        }
        self.agent.channel_faulted(event);
        if self.should_be_subscribed() && !event.rejected() {
            self.start_resubscribe();
        }
    }

    fn set_authenticated(&self, authenticated: bool) {
        self.agent.set_authenticated(authenticated);
    }
}

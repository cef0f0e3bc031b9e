use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::Agent;
use super::events::{AgentEvent, PropertyChange};
use crate::channel::{ChannelEvent, ChannelFaultEvent, ChannelSet};
use crate::client::Session;
use crate::message::headers::{
    ERROR_HINT_HEADER, NEEDS_CONFIG_HEADER, REMOTE_CREDENTIALS_CHARSET_HEADER,
    REMOTE_CREDENTIALS_HEADER, REQUEST_TIMEOUT_HEADER,
};
use crate::message::{AUTHENTICATION_FAULT, CommandOperation, Message, create_uid};
use crate::utils::encode_credentials;
use crate::utils::error::{Result, SessionError};

/// How the agent came by its channel set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelSetMode {
    /// Resolved from the destination on first send; released on disconnect.
    Auto,
    /// Assigned by the application and kept across disconnects.
    Manual,
}

/// Shared session state of a consumer or producer.
///
/// Until the server hands out a client id only one message is in flight; the
/// rest wait in a queue and go out in order once the id is known.
pub struct MessageAgent {
    id: String,
    kind: &'static str,
    session: Arc<Session>,
    owner: Weak<dyn Agent>,
    state: Mutex<AgentState>,
    listeners: Mutex<Vec<mpsc::UnboundedSender<AgentEvent>>>,
}

struct AgentState {
    client_id: Option<String>,
    destination: String,
    connected: bool,
    authenticated: bool,
    credentials: Option<String>,
    credentials_charset: Option<String>,
    remote_credentials: Option<String>,
    remote_credentials_charset: Option<String>,
    send_remote_credentials: bool,
    request_timeout: Duration,
    channel_set: Option<Arc<ChannelSet>>,
    mode: ChannelSetMode,
    client_id_wait_sent: bool,
    pending: VecDeque<Message>,
    disconnect_barrier: bool,
    config_requested: bool,
    reauthorized: HashSet<String>,
}

impl MessageAgent {
    pub(crate) fn new(
        session: Arc<Session>,
        kind: &'static str,
        destination: &str,
        owner: Weak<dyn Agent>,
    ) -> Self {
        let request_timeout = session.agent_defaults().request_timeout();
        Self {
            id: create_uid(),
            kind,
            session,
            owner,
            state: Mutex::new(AgentState {
                client_id: None,
                destination: destination.to_string(),
                connected: false,
                authenticated: false,
                credentials: None,
                credentials_charset: None,
                remote_credentials: None,
                remote_credentials_charset: None,
                send_remote_credentials: false,
                request_timeout,
                channel_set: None,
                mode: ChannelSetMode::Auto,
                client_id_wait_sent: false,
                pending: VecDeque::new(),
                disconnect_barrier: false,
                config_requested: false,
                reauthorized: HashSet::new(),
            }),
            listeners: Mutex::new(Vec::new()),
        }
    }

    fn state(&self) -> MutexGuard<'_, AgentState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn client_id(&self) -> Option<String> {
        self.state().client_id.clone()
    }

    pub fn destination(&self) -> String {
        self.state().destination.clone()
    }

    /// Changes the destination. An automatically acquired channel set is
    /// released so the next send resolves the new one.
    pub fn set_destination(&self, destination: &str) {
        let released = {
            let mut state = self.state();
            if state.destination == destination {
                return;
            }
            state.destination = destination.to_string();
            if state.mode == ChannelSetMode::Auto {
                state.connected = false;
                state.channel_set.take()
            } else {
                None
            }
        };
        if let Some(channel_set) = released {
            channel_set.disconnect(&self.id);
        }
    }

    pub fn connected(&self) -> bool {
        self.state().connected
    }

    pub fn authenticated(&self) -> bool {
        self.state().authenticated
    }

    pub fn channel_set(&self) -> Option<Arc<ChannelSet>> {
        self.state().channel_set.clone()
    }

    /// Assigns a channel set explicitly, detaching from the previous one.
    pub fn set_channel_set(&self, channel_set: Option<Arc<ChannelSet>>) {
        let previous = {
            let mut state = self.state();
            if let (Some(old), Some(new)) = (&state.channel_set, &channel_set) {
                if old.id() == new.id() {
                    state.mode = ChannelSetMode::Manual;
                    return;
                }
            }
            state.mode = if channel_set.is_some() {
                ChannelSetMode::Manual
            } else {
                ChannelSetMode::Auto
            };
            state.connected = false;
            std::mem::replace(&mut state.channel_set, channel_set)
        };
        if let Some(previous) = previous {
            previous.disconnect(&self.id);
        }
    }

    pub fn request_timeout(&self) -> Duration {
        self.state().request_timeout
    }

    pub fn set_request_timeout(&self, timeout: Duration) {
        self.state().request_timeout = timeout;
    }

    /// Number of messages waiting for the client id.
    pub fn queued(&self) -> usize {
        self.state().pending.len()
    }

    /// Subscribes to this agent's events.
    pub fn events(&self) -> mpsc::UnboundedReceiver<AgentEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub(crate) fn emit(&self, event: AgentEvent) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Whether responses must be dropped because the agent disconnected
    /// while they were in flight.
    pub(crate) fn barrier_raised(&self) -> bool {
        let raised = self.state().disconnect_barrier;
        if raised {
            debug!(agent = %self.id, "response after disconnect ignored");
        }
        raised
    }

    fn ensure_channel_set(&self) -> Result<Arc<ChannelSet>> {
        let destination = {
            let state = self.state();
            if let Some(channel_set) = &state.channel_set {
                return Ok(Arc::clone(channel_set));
            }
            if state.destination.is_empty() {
                return Err(SessionError::MissingDestination);
            }
            state.destination.clone()
        };
        let channel_set = self.session.channel_set_for(&destination)?;
        let credentials = {
            let mut state = self.state();
            if let Some(existing) = &state.channel_set {
                return Ok(Arc::clone(existing));
            }
            state.channel_set = Some(Arc::clone(&channel_set));
            state.mode = ChannelSetMode::Auto;
            state
                .credentials
                .clone()
                .map(|c| (c, state.credentials_charset.clone()))
        };
        debug!(agent = %self.id, %destination, channel_set = %channel_set.id(), "channel set acquired");
        if let Some((credentials, charset)) = credentials {
            channel_set.set_credentials(Some(credentials), charset, self.owner.clone())?;
        }
        Ok(channel_set)
    }

    /// Attaches to the channel set, connecting it when needed.
    pub fn connect_channel_set(&self) -> Result<()> {
        let channel_set = self.ensure_channel_set()?;
        if let Some(owner) = self.owner.upgrade() {
            channel_set.connect(&owner);
        }
        Ok(())
    }

    /// Sends `message`. With `wait_for_client_id`, only one message goes out
    /// while the client id is unknown and later ones queue behind it.
    pub fn internal_send(&self, message: Message, wait_for_client_id: bool) -> Result<()> {
        self.ensure_channel_set()?;
        {
            let mut state = self.state();
            if state.client_id.is_none() && wait_for_client_id {
                if state.client_id_wait_sent {
                    debug!(agent = %self.id, queued = state.pending.len() + 1, "waiting for client id");
                    state.pending.push_back(message);
                    return Ok(());
                }
                state.client_id_wait_sent = true;
            }
        }
        self.transmit(message)
    }

    fn transmit(&self, mut message: Message) -> Result<()> {
        let channel_set = self.ensure_channel_set()?;
        let connect = {
            let mut state = self.state();
            message.client_id = state.client_id.clone();
            if message.destination.is_empty() {
                message.destination = state.destination.clone();
            }
            if !state.request_timeout.is_zero() {
                message
                    .headers
                    .insert_if_absent(REQUEST_TIMEOUT_HEADER, state.request_timeout.as_secs());
            }
            if state.send_remote_credentials
                && !message.is_command(CommandOperation::TriggerConnect)
            {
                if let Some(credentials) = &state.remote_credentials {
                    message
                        .headers
                        .insert(REMOTE_CREDENTIALS_HEADER, credentials.clone());
                    if let Some(charset) = &state.remote_credentials_charset {
                        message
                            .headers
                            .insert(REMOTE_CREDENTIALS_CHARSET_HEADER, charset.clone());
                    }
                }
                state.send_remote_credentials = false;
            }
            if !state.config_requested && channel_set.connected() {
                message.headers.insert(NEEDS_CONFIG_HEADER, true);
                state.config_requested = true;
            }
            !state.connected
        };
        if connect {
            if let Some(owner) = self.owner.upgrade() {
                channel_set.connect(&owner);
            }
        }
        debug!(agent = %self.id, kind = self.kind, message_id = %message.message_id(), "sending");
        channel_set.send_for(self.owner.clone(), message);
        Ok(())
    }

    pub(crate) fn set_client_id(&self, client_id: Option<String>) {
        let changed = {
            let mut state = self.state();
            if state.client_id == client_id {
                false
            } else {
                state.client_id = client_id.clone();
                state.client_id_wait_sent = false;
                true
            }
        };
        if changed {
            info!(agent = %self.id, client_id = ?client_id, "client id changed");
            self.emit(AgentEvent::PropertyChange(PropertyChange::ClientId(client_id)));
            self.flush_pending();
        }
    }

    /// Learns the client id from a response while it is still unknown, and
    /// lets the next queued message go out either way. Trigger-connect
    /// commands never hold the queue, so their replies only release it when
    /// they carry an id.
    pub(crate) fn adopt_identity(&self, response: &Message, request: &Message) {
        if request.is_command(CommandOperation::TriggerConnect) && response.client_id.is_none() {
            return;
        }
        let release = {
            let mut state = self.state();
            if state.client_id.is_some() {
                false
            } else {
                state.client_id_wait_sent = false;
                true
            }
        };
        if !release {
            return;
        }
        match &response.client_id {
            Some(id) => self.set_client_id(Some(id.clone())),
            None => self.flush_pending(),
        }
    }

    /// Sends queued messages in order: all of them once the client id is
    /// known, otherwise exactly one.
    fn flush_pending(&self) {
        loop {
            let (message, known) = {
                let mut state = self.state();
                let known = state.client_id.is_some();
                if !known && state.client_id_wait_sent {
                    return;
                }
                let Some(message) = state.pending.pop_front() else {
                    return;
                };
                if !known {
                    state.client_id_wait_sent = true;
                }
                (message, known)
            };
            if let Err(e) = self.transmit(message) {
                warn!(agent = %self.id, error = %e, "queued message could not be sent");
            }
            if !known {
                return;
            }
        }
    }

    pub fn acknowledge(&self, mut ack: Message, request: Message) {
        if self.barrier_raised() {
            return;
        }
        self.state().reauthorized.remove(request.message_id());
        let error_hint = ack.headers.remove(ERROR_HINT_HEADER).is_some();
        self.adopt_identity(&ack, &request);
        if !error_hint {
            self.emit(AgentEvent::Acknowledge { ack, request });
        }
    }

    pub fn fault(&self, error: Message, request: Message) {
        if self.barrier_raised() {
            return;
        }
        if self.reauthorize(&error, &request) {
            return;
        }
        self.surface_fault(error, request);
    }

    /// Reports a fault that no relogin absorbed.
    pub(crate) fn surface_fault(&self, error: Message, request: Message) {
        self.adopt_identity(&error, &request);
        self.emit(AgentEvent::Fault {
            fault: error,
            request: Some(request),
        });
    }

    /// Reports a fault regardless of the disconnect barrier.
    pub(crate) fn dispatch_fault(&self, error: Message, request: Message) {
        self.emit(AgentEvent::Fault {
            fault: error,
            request: Some(request),
        });
    }

    /// An authentication fault on a session that was authenticated means the
    /// server session expired. Channels that log in again after reconnecting
    /// get one reconnect and resend instead of the fault. A resent request
    /// is remembered until its reply arrives.
    pub(crate) fn reauthorize(&self, error: &Message, request: &Message) -> bool {
        let resent = self.state().reauthorized.remove(request.message_id());
        if resent || error.fault_code() != Some(AUTHENTICATION_FAULT) {
            return false;
        }
        let channel_set = {
            let mut state = self.state();
            if !state.authenticated {
                return false;
            }
            let Some(channel_set) = state.channel_set.clone() else {
                return false;
            };
            if !channel_set
                .current_channel()
                .is_some_and(|channel| channel.login_after_disconnect())
            {
                return false;
            }
            state.reauthorized.insert(request.message_id().to_string());
            state.connected = false;
            channel_set
        };
        info!(agent = %self.id, "credentials expired, reconnecting to log in again");
        channel_set.reconnect();
        // the request still holds the client id slot, so it skips the queue
        if let Err(e) = self.transmit(request.clone()) {
            warn!(agent = %self.id, error = %e, "resend after login failed");
            self.state().reauthorized.remove(request.message_id());
            return false;
        }
        true
    }

    pub fn channel_connected(&self, event: &ChannelEvent) {
        let changed = {
            let mut state = self.state();
            state.disconnect_barrier = false;
            if state.remote_credentials.is_some() {
                state.send_remote_credentials = true;
            }
            let changed = !state.connected;
            state.connected = true;
            changed
        };
        if changed {
            self.emit(AgentEvent::PropertyChange(PropertyChange::Connected(true)));
        }
        self.emit(AgentEvent::ChannelConnect(event.clone()));
    }

    pub fn channel_disconnected(&self, event: &ChannelEvent) {
        let changed = {
            let mut state = self.state();
            let changed = state.connected;
            state.connected = false;
            changed
        };
        if changed {
            self.emit(AgentEvent::PropertyChange(PropertyChange::Connected(false)));
        }
        self.emit(AgentEvent::ChannelDisconnect(event.clone()));
    }

    pub fn channel_faulted(&self, event: &ChannelFaultEvent) {
        let changed = {
            let mut state = self.state();
            let changed = state.connected && !event.channel_connected;
            if !event.channel_connected {
                state.connected = false;
            }
            changed
        };
        if changed {
            self.emit(AgentEvent::PropertyChange(PropertyChange::Connected(false)));
        }
        self.emit(AgentEvent::ChannelFault(event.clone()));
    }

    pub fn set_authenticated(&self, authenticated: bool) {
        let changed = {
            let mut state = self.state();
            let changed = state.authenticated != authenticated;
            state.authenticated = authenticated;
            changed
        };
        if changed {
            self.emit(AgentEvent::PropertyChange(PropertyChange::Authenticated(
                authenticated,
            )));
        }
    }

    /// Sets the credentials used to log in on the channel.
    pub fn set_credentials(
        &self,
        username: &str,
        password: &str,
        charset: Option<String>,
    ) -> Result<()> {
        let credentials = encode_credentials(username, password);
        let channel_set = self.channel_set();
        if let Some(channel_set) = channel_set {
            channel_set.set_credentials(Some(credentials.clone()), charset.clone(), self.owner.clone())?;
        }
        let mut state = self.state();
        state.credentials = Some(credentials);
        state.credentials_charset = charset;
        Ok(())
    }

    /// Credentials for the remote destination, sent with the next message.
    pub fn set_remote_credentials(&self, username: &str, password: &str, charset: Option<String>) {
        let mut state = self.state();
        state.remote_credentials = Some(encode_credentials(username, password));
        state.remote_credentials_charset = charset;
        state.send_remote_credentials = true;
    }

    pub fn logout(&self) {
        let channel_set = {
            let mut state = self.state();
            state.credentials = None;
            state.credentials_charset = None;
            state.channel_set.clone()
        };
        if let Some(channel_set) = channel_set {
            // the reply only matters to agents through set_authenticated
            drop(channel_set.logout());
        }
    }

    /// Drops queued messages, ignores responses still in flight and detaches
    /// from the channel set.
    pub fn disconnect(&self) {
        let (channel_set, was_connected) = {
            let mut state = self.state();
            let dropped = state.pending.len();
            if dropped > 0 {
                debug!(agent = %self.id, dropped, "queued messages discarded");
            }
            state.pending.clear();
            state.reauthorized.clear();
            state.client_id_wait_sent = false;
            let was_connected = state.connected;
            if was_connected {
                state.disconnect_barrier = true;
            }
            state.connected = false;
            state.config_requested = false;
            let channel_set = match state.mode {
                ChannelSetMode::Auto => state.channel_set.take(),
                ChannelSetMode::Manual => state.channel_set.clone(),
            };
            (channel_set, was_connected)
        };
        if let Some(channel_set) = channel_set {
            channel_set.disconnect(&self.id);
        }
        if was_connected {
            info!(agent = %self.id, kind = self.kind, "disconnected");
            self.emit(AgentEvent::PropertyChange(PropertyChange::Connected(false)));
        }
    }
}

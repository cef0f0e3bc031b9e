use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use super::channel_set::ChannelSet;
use super::events::{ChannelEvent, ChannelFault, ChannelFaultEvent};
use super::identity::{ClientIdentity, ConnectPermit};
use super::responder::{MessageResponder, ResponseTarget};
use crate::agent::Agent;
use crate::config::ChannelConfig;
use crate::message::headers::{
    CREDENTIALS_CHARSET_HEADER, ENDPOINT_HEADER, SESSION_ID_HEADER, MESSAGING_VERSION,
    MESSAGING_VERSION_HEADER, REQUEST_TIMEOUT_HEADER,
};
use crate::message::{CHANNEL_CONNECT_FAULT, CommandOperation, Message};
use crate::transport::{Transport, TransportListener};
use crate::utils::error::{Result, SessionError};

/// Delay before trying the next uri, so the old transport can finish closing.
const FAILOVER_DELAY: Duration = Duration::from_millis(1);
/// Delay between retries of the current uri inside the reliable reconnect
/// window.
const RELIABLE_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// One transport endpoint shared by any number of channel sets.
///
/// The channel owns the connect, failover and authentication state for its
/// endpoint. It stays connected while at least one channel set is attached.
pub struct Channel {
    id: String,
    config: ChannelConfig,
    base_url: Option<String>,
    transport: Arc<dyn Transport>,
    identity: Arc<ClientIdentity>,
    state: Mutex<ChannelState>,
    self_ref: Weak<Channel>,
}

struct ChannelState {
    uri: String,
    primary_uri: String,
    failover_uris: Vec<String>,
    failover_index: Option<usize>,
    connected: bool,
    connecting: bool,
    reconnecting: bool,
    should_be_connected: bool,
    previously_connected: bool,
    owns_identity_guard: bool,
    authenticated: bool,
    authenticating: bool,
    credentials: Option<String>,
    credentials_charset: Option<String>,
    channel_sets: Vec<Weak<ChannelSet>>,
    attempt: u64,
    connect_timer: Option<JoinHandle<()>>,
    dropped_at: Option<Instant>,
    polling_refs: usize,
}

impl ChannelState {
    fn reset_to_primary(&mut self) {
        self.failover_index = None;
        self.uri = self.primary_uri.clone();
    }

    fn live_sets(&self) -> Vec<Arc<ChannelSet>> {
        self.channel_sets.iter().filter_map(Weak::upgrade).collect()
    }

    fn cancel_connect_timer(&mut self) {
        if let Some(timer) = self.connect_timer.take() {
            timer.abort();
        }
    }

    /// Decides whether a failed or dropped connection is retried, and after
    /// which delay. Moves `uri` along the failover list as a side effect.
    fn plan_failover(&mut self, rejected: bool, reliable_window: Duration) -> Option<Duration> {
        if rejected || !self.should_be_connected {
            self.reset_to_primary();
            return None;
        }
        if let Some(dropped_at) = self.dropped_at {
            if !reliable_window.is_zero() && dropped_at.elapsed() < reliable_window {
                return Some(RELIABLE_RECONNECT_DELAY);
            }
        }
        if self.previously_connected {
            // one retry of the uri that used to work
            self.previously_connected = false;
            return Some(FAILOVER_DELAY);
        }
        let next = self.failover_index.map_or(0, |index| index + 1);
        if let Some(uri) = self.failover_uris.get(next) {
            self.failover_index = Some(next);
            self.uri = uri.clone();
            return Some(FAILOVER_DELAY);
        }
        self.reset_to_primary();
        None
    }
}

enum ConnectAction {
    Notify,
    Start,
    Wait,
}

impl Channel {
    pub fn new(
        config: ChannelConfig,
        base_url: Option<String>,
        transport: Arc<dyn Transport>,
        identity: Arc<ClientIdentity>,
    ) -> Arc<Self> {
        let (uri, failover_uris) = if config.client_load_balancing_uris.is_empty() {
            (config.uri.clone(), config.failover_uris.clone())
        } else {
            let mut uris = config.client_load_balancing_uris.clone();
            uris.shuffle(&mut rand::thread_rng());
            let primary = uris.remove(0);
            (primary, uris)
        };
        Arc::new_cyclic(|self_ref| Self {
            id: config.id.clone(),
            config,
            base_url,
            transport,
            identity,
            state: Mutex::new(ChannelState {
                primary_uri: uri.clone(),
                uri,
                failover_uris,
                failover_index: None,
                connected: false,
                connecting: false,
                reconnecting: false,
                should_be_connected: false,
                previously_connected: false,
                owns_identity_guard: false,
                authenticated: false,
                authenticating: false,
                credentials: None,
                credentials_charset: None,
                channel_sets: Vec::new(),
                attempt: 0,
                connect_timer: None,
                dropped_at: None,
                polling_refs: 0,
            }),
            self_ref: self_ref.clone(),
        })
    }

    fn state(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn uri(&self) -> String {
        self.state().uri.clone()
    }

    /// Protocol-qualified form of the current uri.
    pub fn endpoint(&self) -> String {
        derive_endpoint(&self.uri(), self.base_url.as_deref())
    }

    pub fn failover_uris(&self) -> Vec<String> {
        self.state().failover_uris.clone()
    }

    pub fn set_failover_uris(&self, uris: Vec<String>) {
        let mut state = self.state();
        state.failover_index = None;
        state.failover_uris = uris;
    }

    pub fn connected(&self) -> bool {
        self.state().connected
    }

    pub fn reconnecting(&self) -> bool {
        self.state().reconnecting
    }

    pub fn authenticated(&self) -> bool {
        self.state().authenticated
    }

    pub fn login_after_disconnect(&self) -> bool {
        self.config.login_after_disconnect
    }

    pub fn request_timeout(&self) -> Duration {
        self.config.request_timeout
    }

    pub fn is_polling(&self) -> bool {
        self.transport.is_polling()
    }

    /// Attaches `channel_set` and connects unless already connected or
    /// connecting. A set that attaches to a connected channel is notified
    /// straight away.
    pub fn connect(&self, channel_set: &Arc<ChannelSet>) {
        let action = {
            let mut state = self.state();
            let known = state
                .channel_sets
                .iter()
                .any(|set| set.upgrade().is_some_and(|set| set.id() == channel_set.id()));
            if !known {
                state.channel_sets.retain(|set| set.strong_count() > 0);
                state.channel_sets.push(Arc::downgrade(channel_set));
            }
            state.should_be_connected = true;
            if state.connected {
                ConnectAction::Notify
            } else if state.connecting {
                ConnectAction::Wait
            } else {
                state.connecting = true;
                ConnectAction::Start
            }
        };
        match action {
            ConnectAction::Notify => {
                channel_set.channel_connected(&ChannelEvent::new(&self.id, false, false));
            }
            ConnectAction::Start => self.begin_connect(),
            ConnectAction::Wait => {}
        }
    }

    fn begin_connect(&self) {
        let Some(this) = self.self_ref.upgrade() else {
            return;
        };
        match self.identity.acquire(&this) {
            ConnectPermit::Proceed => self.internal_connect(),
            ConnectPermit::Owner => {
                debug!(channel = %self.id, "connecting first to obtain the client identity");
                self.state().owns_identity_guard = true;
                self.internal_connect();
            }
            ConnectPermit::Deferred => {
                debug!(channel = %self.id, "connect deferred until the client identity is known");
            }
        }
    }

    /// Called by the identity barrier once the first connect has settled.
    pub(crate) fn resume_connect(&self) {
        {
            let state = self.state();
            if !state.connecting || state.connected {
                return;
            }
        }
        self.begin_connect();
    }

    fn internal_connect(&self) {
        let (endpoint, attempt) = {
            let mut state = self.state();
            state.attempt += 1;
            state.cancel_connect_timer();
            (
                derive_endpoint(&state.uri, self.base_url.as_deref()),
                state.attempt,
            )
        };
        if !self.config.connect_timeout.is_zero() {
            let channel = self.self_ref.clone();
            let timeout = self.config.connect_timeout;
            let timer = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(channel) = channel.upgrade() {
                    channel.connect_timed_out(attempt);
                }
            });
            let mut state = self.state();
            if state.attempt == attempt {
                state.connect_timer = Some(timer);
            } else {
                timer.abort();
            }
        }
        info!(channel = %self.id, %endpoint, "connecting");
        let listener = Arc::new(ConnectionListener {
            channel: self.self_ref.clone(),
            attempt,
        });
        self.transport.connect(&endpoint, listener);
    }

    fn connect_timed_out(&self, attempt: u64) {
        warn!(channel = %self.id, "connect attempt timed out");
        let fault = ChannelFault::new(
            CHANNEL_CONNECT_FAULT,
            "Connect attempt timed out.",
            format!("No connection to '{}' within {:?}.", self.endpoint(), self.config.connect_timeout),
            false,
        );
        self.connect_failed(attempt, fault);
    }

    fn is_current(&self, attempt: u64) -> bool {
        self.state().attempt == attempt
    }

    /// The transport is up; confirm the session with a ping carrying our
    /// identity before declaring the channel connected.
    fn transport_connected(&self, attempt: u64) {
        if !self.is_current(attempt) {
            return;
        }
        let ping = Message::command(CommandOperation::ClientPing)
            .with_header(
                SESSION_ID_HEADER,
                self.identity.id().unwrap_or_else(|| "nil".to_string()),
            )
            .with_header(MESSAGING_VERSION_HEADER, MESSAGING_VERSION);
        let target = Arc::new(HandshakeTarget {
            channel: self.self_ref.clone(),
            attempt,
        });
        self.send(ping, target);
    }

    fn connect_success(&self, attempt: u64, ack: &Message) {
        let (sets, owns_guard, relogin) = {
            let mut state = self.state();
            if state.attempt != attempt || state.connected {
                return;
            }
            state.cancel_connect_timer();
            state.connected = true;
            state.connecting = false;
            state.reconnecting = false;
            state.previously_connected = true;
            state.failover_index = None;
            state.dropped_at = None;
            let relogin = (self.config.login_after_disconnect && !state.authenticated)
                .then(|| state.credentials.clone())
                .flatten();
            if relogin.is_some() {
                state.authenticating = true;
            }
            (
                state.live_sets(),
                std::mem::take(&mut state.owns_identity_guard),
                relogin,
            )
        };
        if let Some(id) = ack.headers.get_str(SESSION_ID_HEADER) {
            self.identity.set_id(id);
        }
        if owns_guard {
            self.identity.release();
        }
        info!(channel = %self.id, endpoint = %self.endpoint(), "connected");
        if let Some(credentials) = relogin {
            debug!(channel = %self.id, "logging in again after reconnect");
            self.send_login(credentials, None);
        }
        let event = ChannelEvent::new(&self.id, false, false);
        for set in sets {
            set.channel_connected(&event);
        }
    }

    fn connect_failed(&self, attempt: u64, fault: ChannelFault) {
        let (plan, sets, owns_guard) = {
            let mut state = self.state();
            if state.attempt != attempt || state.connected {
                return;
            }
            state.cancel_connect_timer();
            // closing the transport fails the handshake ping of this attempt
            state.attempt += 1;
            let plan = state.plan_failover(fault.rejected, self.config.reliable_reconnect_duration);
            state.reconnecting = plan.is_some();
            state.connecting = plan.is_some();
            let owns_guard = plan.is_none() && std::mem::take(&mut state.owns_identity_guard);
            (plan, state.live_sets(), owns_guard)
        };
        self.transport.disconnect();
        if owns_guard {
            self.identity.release();
        }
        match plan {
            Some(delay) => {
                info!(channel = %self.id, uri = %self.uri(), ?delay, code = %fault.code, "connect failed, failing over");
            }
            None => {
                warn!(channel = %self.id, code = %fault.code, rejected = fault.rejected, "connect failed");
            }
        }
        let event = ChannelFaultEvent {
            channel_id: self.id.clone(),
            fault,
            reconnecting: plan.is_some(),
            channel_connected: false,
        };
        for set in sets {
            set.channel_faulted(&event);
        }
        if let Some(delay) = plan {
            self.schedule_reconnect(delay);
        }
    }

    fn transport_disconnected(&self, attempt: u64, rejected: bool) {
        let (plan, sets, notify_auth) = {
            let mut state = self.state();
            if state.attempt != attempt || !state.connected {
                return;
            }
            state.connected = false;
            state.dropped_at = Some(Instant::now());
            let notify_auth = state.authenticated && !self.config.login_after_disconnect;
            state.authenticated = false;
            let plan = state.plan_failover(rejected, self.config.reliable_reconnect_duration);
            state.reconnecting = plan.is_some();
            state.connecting = plan.is_some();
            (plan, state.live_sets(), notify_auth)
        };
        warn!(channel = %self.id, rejected, reconnecting = plan.is_some(), "connection lost");
        let event = ChannelEvent::new(&self.id, plan.is_some(), rejected);
        for set in &sets {
            set.channel_disconnected(&event);
            if notify_auth {
                set.channel_authenticated(false);
            }
        }
        if let Some(delay) = plan {
            self.schedule_reconnect(delay);
        }
    }

    fn schedule_reconnect(&self, delay: Duration) {
        let attempt = self.state().attempt;
        let channel = self.self_ref.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(channel) = channel.upgrade() {
                channel.reconnect(attempt);
            }
        });
    }

    fn reconnect(&self, attempt: u64) {
        {
            let state = self.state();
            if state.attempt != attempt || !state.connecting || !state.should_be_connected {
                return;
            }
        }
        self.internal_connect();
    }

    /// Replaces the live connection with a new one while every channel set
    /// stays attached. Calls in flight fail, and a channel that logs in after
    /// disconnects logs in again once the new connection is up.
    pub fn reconnect_now(&self) {
        let (sets, notify_auth) = {
            let mut state = self.state();
            if !state.connected {
                return;
            }
            let notify_auth = state.authenticated && !self.config.login_after_disconnect;
            state.attempt += 1;
            state.cancel_connect_timer();
            state.connected = false;
            state.connecting = true;
            state.reconnecting = true;
            state.authenticated = false;
            state.authenticating = false;
            (state.live_sets(), notify_auth)
        };
        info!(channel = %self.id, sets = sets.len(), "reconnecting");
        let event = ChannelEvent::new(&self.id, true, false);
        for set in &sets {
            set.channel_disconnected(&event);
            if notify_auth {
                set.channel_authenticated(false);
            }
        }
        // sets already queue new sends, so retries of the failed calls wait
        // for the new connection
        self.transport.disconnect();
        self.begin_connect();
    }

    /// Detaches `channel_set`. The transport is torn down once no channel set
    /// is left.
    pub fn disconnect(&self, channel_set: &ChannelSet) {
        let (was_active, owns_guard) = {
            let mut state = self.state();
            state.channel_sets.retain(|set| {
                set.upgrade()
                    .is_some_and(|set| set.id() != channel_set.id())
            });
            if !state.channel_sets.is_empty() {
                return;
            }
            let was_active = state.connected || state.connecting;
            state.should_be_connected = false;
            state.connected = false;
            state.connecting = false;
            state.reconnecting = false;
            state.authenticated = false;
            state.authenticating = false;
            state.attempt += 1;
            state.cancel_connect_timer();
            state.reset_to_primary();
            (was_active, std::mem::take(&mut state.owns_identity_guard))
        };
        if owns_guard {
            self.identity.release();
        }
        if was_active {
            info!(channel = %self.id, "disconnecting");
            self.transport.disconnect();
        }
    }

    /// Sends `message` through the transport, correlating the response to
    /// `target`.
    pub fn send(&self, mut message: Message, target: Arc<dyn ResponseTarget>) {
        message.headers.insert(ENDPOINT_HEADER, self.id.clone());
        if let Some(id) = self.identity.id() {
            message.headers.insert_if_absent(SESSION_ID_HEADER, id);
        }
        let timeout = message
            .headers
            .get_i64(REQUEST_TIMEOUT_HEADER)
            .filter(|secs| *secs > 0)
            .map(|secs| Duration::from_secs(secs as u64))
            .unwrap_or(self.config.request_timeout);
        let responder = MessageResponder::new(message.clone(), target);
        if !timeout.is_zero() {
            responder.start_request_timeout(timeout);
        }
        debug!(channel = %self.id, message_id = %message.message_id(), "sending");
        self.transport.invoke(message, responder);
    }

    /// Stores credentials for this channel and logs in when connected.
    ///
    /// Fails when the channel is authenticated with different credentials or
    /// a login is still outstanding.
    pub fn set_credentials(
        &self,
        credentials: Option<String>,
        charset: Option<String>,
        agent: Option<Weak<dyn Agent>>,
    ) -> Result<()> {
        let login = {
            let mut state = self.state();
            if state.authenticated && credentials.is_some() && state.credentials != credentials {
                return Err(SessionError::CredentialsConflict(self.id.clone()));
            }
            if state.credentials == credentials {
                return Ok(());
            }
            if state.authenticating {
                return Err(SessionError::AuthenticationInProgress(self.id.clone()));
            }
            state.credentials = credentials.clone();
            state.credentials_charset = charset;
            let login = state.connected && !state.authenticated;
            if login && credentials.is_some() {
                state.authenticating = true;
                credentials
            } else {
                None
            }
        };
        if let Some(credentials) = login {
            self.send_login(credentials, agent);
        }
        Ok(())
    }

    fn send_login(&self, credentials: String, agent: Option<Weak<dyn Agent>>) {
        let charset = self.state().credentials_charset.clone();
        let mut login = Message::command(CommandOperation::Login).with_body(credentials);
        if let Some(charset) = charset {
            login.headers.insert(CREDENTIALS_CHARSET_HEADER, charset);
        }
        let target = Arc::new(ChannelLoginTarget {
            channel: self.self_ref.clone(),
            agent,
        });
        self.send(login, target);
    }

    /// Records the outcome of a login or logout and tells every channel set.
    pub(crate) fn apply_authentication(
        &self,
        credentials: Option<String>,
        charset: Option<String>,
        authenticated: bool,
    ) {
        let sets = {
            let mut state = self.state();
            state.credentials = credentials;
            state.credentials_charset = charset;
            state.authenticating = false;
            if state.authenticated == authenticated {
                return;
            }
            state.authenticated = authenticated;
            state.live_sets()
        };
        info!(channel = %self.id, authenticated, "authentication changed");
        for set in sets {
            set.channel_authenticated(authenticated);
        }
    }

    fn login_failed(&self) {
        let mut state = self.state();
        state.authenticating = false;
        state.credentials = None;
        state.credentials_charset = None;
    }

    pub fn enable_polling(&self) {
        let first = {
            let mut state = self.state();
            state.polling_refs += 1;
            state.polling_refs == 1
        };
        if first {
            self.transport.enable_polling();
        }
    }

    pub fn disable_polling(&self) {
        let last = {
            let mut state = self.state();
            if state.polling_refs == 0 {
                return;
            }
            state.polling_refs -= 1;
            state.polling_refs == 0
        };
        if last {
            self.transport.disable_polling();
        }
    }

    fn pushed(&self, message: Message) {
        let sets = self.state().live_sets();
        for set in sets {
            set.channel_message(message.clone());
        }
    }
}

/// Resolves `uri` against the optional base url: fills in the
/// `{server.name}` and `{server.port}` tokens, joins relative uris and maps
/// http schemes onto their websocket equivalents.
pub fn derive_endpoint(uri: &str, base_url: Option<&str>) -> String {
    let base = base_url.and_then(|base| Url::parse(base).ok());
    let mut resolved = uri.to_string();
    if let Some(base) = &base {
        if let Some(host) = base.host_str() {
            resolved = resolved.replace("{server.name}", host);
        }
        if let Some(port) = base.port_or_known_default() {
            resolved = resolved.replace("{server.port}", &port.to_string());
        }
    }
    let parsed = match (Url::parse(&resolved), &base) {
        (Ok(url), _) => Some(url),
        (Err(url::ParseError::RelativeUrlWithoutBase), Some(base)) => base.join(&resolved).ok(),
        _ => None,
    };
    let Some(mut url) = parsed else {
        return resolved;
    };
    let scheme = match url.scheme() {
        "http" => Some("ws"),
        "https" => Some("wss"),
        _ => None,
    };
    if let Some(scheme) = scheme {
        // http(s) -> ws(s) is always a permitted scheme change
        let _ = url.set_scheme(scheme);
    }
    url.to_string()
}

/// Per-attempt transport callbacks. Callbacks from an attempt that has been
/// superseded are ignored.
struct ConnectionListener {
    channel: Weak<Channel>,
    attempt: u64,
}

impl TransportListener for ConnectionListener {
    fn on_connected(&self) {
        if let Some(channel) = self.channel.upgrade() {
            channel.transport_connected(self.attempt);
        }
    }

    fn on_connect_failed(&self, fault: ChannelFault) {
        if let Some(channel) = self.channel.upgrade() {
            channel.connect_failed(self.attempt, fault);
        }
    }

    fn on_disconnected(&self, rejected: bool) {
        if let Some(channel) = self.channel.upgrade() {
            channel.transport_disconnected(self.attempt, rejected);
        }
    }

    fn on_message(&self, message: Message) {
        if let Some(channel) = self.channel.upgrade() {
            if channel.is_current(self.attempt) {
                channel.pushed(message);
            }
        }
    }
}

struct HandshakeTarget {
    channel: Weak<Channel>,
    attempt: u64,
}

impl ResponseTarget for HandshakeTarget {
    fn on_result(&self, response: Message, _request: Message) {
        let Some(channel) = self.channel.upgrade() else {
            return;
        };
        match response.fault() {
            Some(fault) => {
                let fault = ChannelFault::new(
                    CHANNEL_CONNECT_FAULT,
                    fault.fault_string.clone(),
                    fault.fault_detail.clone(),
                    true,
                );
                channel.connect_failed(self.attempt, fault);
            }
            None => channel.connect_success(self.attempt, &response),
        }
    }

    fn on_status(&self, fault: Message, _request: Message) {
        let Some(channel) = self.channel.upgrade() else {
            return;
        };
        let (description, detail) = fault
            .fault()
            .map(|f| (f.fault_string.clone(), f.fault_detail.clone()))
            .unwrap_or_default();
        let fault = ChannelFault::new(CHANNEL_CONNECT_FAULT, description, detail, false);
        channel.connect_failed(self.attempt, fault);
    }
}

/// Login sent by the channel itself, either for an agent's credentials or
/// to restore a session after reconnecting.
struct ChannelLoginTarget {
    channel: Weak<Channel>,
    agent: Option<Weak<dyn Agent>>,
}

impl ResponseTarget for ChannelLoginTarget {
    fn on_result(&self, response: Message, request: Message) {
        if response.is_error() {
            self.on_status(response, request);
            return;
        }
        if let Some(channel) = self.channel.upgrade() {
            let (credentials, charset) = {
                let state = channel.state();
                (state.credentials.clone(), state.credentials_charset.clone())
            };
            channel.apply_authentication(credentials, charset, true);
        }
    }

    fn on_status(&self, fault: Message, request: Message) {
        if let Some(channel) = self.channel.upgrade() {
            warn!(channel = %channel.id, "login failed");
            channel.login_failed();
        }
        if let Some(agent) = self.agent.as_ref().and_then(Weak::upgrade) {
            agent.fault(super::responder::status_fault(fault, &request), request);
        }
    }
}

//! In-memory transport for tests. Nothing happens until the test drives it:
//! connects wait for `open`/`fail_connect`, invocations wait for a reply.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::channel::{ChannelFault, ResponseHandler};
use crate::client::Session;
use crate::config::{ChannelConfig, ChannelSettings, DestinationSettings, Settings};
use crate::message::headers::{RETRYABLE_HINT_HEADER, SESSION_ID_HEADER};
use crate::message::{CHANNEL_CONNECT_FAULT, CommandOperation, Message};
use crate::transport::{Transport, TransportFactory, TransportListener, connection_lost};

#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    connects: Vec<String>,
    disconnects: usize,
    listener: Option<Arc<dyn TransportListener>>,
    invoked: Vec<Message>,
    pending: Vec<(Message, Arc<dyn ResponseHandler>)>,
    polling: bool,
    polling_enabled: bool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn polling() -> Self {
        let transport = Self::default();
        transport.state().polling = true;
        transport
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn listener(&self) -> Arc<dyn TransportListener> {
        self.state()
            .listener
            .clone()
            .expect("no connect attempt in progress")
    }

    pub fn connects(&self) -> Vec<String> {
        self.state().connects.clone()
    }

    pub fn disconnects(&self) -> usize {
        self.state().disconnects
    }

    /// Every message invoked so far, in order.
    pub fn invoked(&self) -> Vec<Message> {
        self.state().invoked.clone()
    }

    /// Operations of the invoked command messages, handshake pings excluded.
    pub fn operations(&self) -> Vec<CommandOperation> {
        self.invoked()
            .iter()
            .filter_map(Message::operation)
            .filter(|op| *op != CommandOperation::ClientPing)
            .collect()
    }

    pub fn pending(&self) -> Vec<Message> {
        self.state().pending.iter().map(|(m, _)| m.clone()).collect()
    }

    pub fn polling_enabled(&self) -> bool {
        self.state().polling_enabled
    }

    /// Reports the connection as established and acknowledges the handshake
    /// ping, handing out `client_id` as the session identity.
    pub fn open_with_id(&self, client_id: Option<&str>) {
        self.listener().on_connected();
        self.respond(
            |m| m.is_command(CommandOperation::ClientPing),
            |ping| {
                let mut ack = Message::acknowledge_for(ping);
                if let Some(id) = client_id {
                    ack.headers.insert(SESSION_ID_HEADER, id);
                }
                ack
            },
        )
        .expect("handshake ping was not sent");
    }

    pub fn open(&self) {
        self.open_with_id(Some("SESSION-1"));
    }

    /// Reports the connection as established but leaves the handshake ping
    /// unanswered.
    pub fn accept(&self) {
        self.listener().on_connected();
    }

    /// Acknowledges the oldest pending command with operation `operation`.
    pub fn ack_command(&self, operation: CommandOperation, client_id: Option<&str>) -> Option<Message> {
        self.respond(
            |m| m.is_command(operation),
            |request| {
                let mut ack = Message::acknowledge_for(request);
                ack.client_id = client_id.map(str::to_string);
                ack
            },
        )
    }

    pub fn fail_connect(&self, rejected: bool) {
        self.listener().on_connect_failed(ChannelFault::new(
            CHANNEL_CONNECT_FAULT,
            "Connect failed",
            "refused",
            rejected,
        ));
    }

    /// Loses the connection: outstanding calls fail, then the listener
    /// hears about it.
    pub fn drop_connection(&self, rejected: bool) {
        let listener = self.listener();
        self.fail_pending("The connection closed before a response arrived.");
        listener.on_disconnected(rejected);
    }

    fn fail_pending(&self, detail: &str) {
        let pending = std::mem::take(&mut self.state().pending);
        for (_, handler) in pending {
            handler.status(connection_lost(detail));
        }
    }

    pub fn push(&self, message: Message) {
        self.listener().on_message(message);
    }

    /// Completes the first pending invocation matching `select` with the
    /// reply built by `reply`. Returns the request.
    pub fn respond(
        &self,
        select: impl Fn(&Message) -> bool,
        reply: impl FnOnce(&Message) -> Message,
    ) -> Option<Message> {
        let (request, handler) = {
            let mut state = self.state();
            let index = state.pending.iter().position(|(m, _)| select(m))?;
            state.pending.remove(index)
        };
        handler.result(reply(&request));
        Some(request)
    }

    /// Acknowledges the oldest pending message.
    pub fn ack_next(&self, client_id: Option<&str>) -> Option<Message> {
        self.respond(
            |_| true,
            |request| {
                let mut ack = Message::acknowledge_for(request);
                ack.client_id = client_id.map(str::to_string);
                ack
            },
        )
    }

    /// Faults the oldest pending message with a server error.
    pub fn fault_next(&self, code: &str, retryable: bool) -> Option<Message> {
        self.respond(
            |_| true,
            |request| {
                let mut error = Message::error_for(request, code, "Server fault", "");
                if retryable {
                    error.headers.insert(RETRYABLE_HINT_HEADER, true);
                }
                error
            },
        )
    }

    /// Fails the oldest pending call below the protocol.
    pub fn fail_next(&self) -> Option<Message> {
        let (request, handler) = {
            let mut state = self.state();
            if state.pending.is_empty() {
                return None;
            }
            state.pending.remove(0)
        };
        handler.status(Message::error(
            crate::message::CHANNEL_CALL_FAULT,
            "Channel call failed",
            "",
        ));
        Some(request)
    }
}

impl Transport for MockTransport {
    fn connect(&self, endpoint: &str, listener: Arc<dyn TransportListener>) {
        let mut state = self.state();
        state.connects.push(endpoint.to_string());
        state.listener = Some(listener);
    }

    fn disconnect(&self) {
        self.state().disconnects += 1;
        self.fail_pending("The connection was closed.");
    }

    fn invoke(&self, message: Message, handler: Arc<dyn ResponseHandler>) {
        let mut state = self.state();
        state.invoked.push(message.clone());
        state.pending.push((message, handler));
    }

    fn is_polling(&self) -> bool {
        self.state().polling
    }

    fn enable_polling(&self) {
        self.state().polling_enabled = true;
    }

    fn disable_polling(&self) {
        self.state().polling_enabled = false;
    }
}

/// Hands out one [`MockTransport`] per channel id.
#[derive(Default)]
pub struct MockFactory {
    transports: Mutex<HashMap<String, Arc<MockTransport>>>,
}

impl MockFactory {
    pub fn transport(&self, channel_id: &str) -> Arc<MockTransport> {
        Arc::clone(
            self.transports
                .lock()
                .unwrap()
                .entry(channel_id.to_string())
                .or_insert_with(|| Arc::new(MockTransport::new())),
        )
    }
}

impl TransportFactory for MockFactory {
    fn create(&self, config: &ChannelConfig) -> Arc<dyn Transport> {
        self.transport(&config.id)
    }
}

/// Settings with one channel per id at `ws://<id>/messages` and the given
/// destinations mapped onto those channels.
pub fn settings(destinations: &[(&str, &[&str])]) -> Settings {
    let mut settings = Settings::default();
    for (destination, channels) in destinations {
        for channel in channels.iter() {
            settings.channels.insert(
                channel.to_string(),
                ChannelSettings {
                    uri: format!("ws://{channel}/messages"),
                    ..ChannelSettings::default()
                },
            );
        }
        settings.destinations.insert(
            destination.to_string(),
            DestinationSettings {
                channels: channels.iter().map(|c| c.to_string()).collect(),
                ..DestinationSettings::default()
            },
        );
    }
    settings
}

pub fn session_with(settings: Settings) -> (Arc<Session>, Arc<MockFactory>) {
    let factory = Arc::new(MockFactory::default());
    let session = Session::new(Arc::new(settings), factory.clone());
    (session, factory)
}

/// Session with destination `quotes` on channel `ch1`.
pub fn session() -> (Arc<Session>, Arc<MockFactory>) {
    session_with(settings(&[("quotes", &["ch1"])]))
}

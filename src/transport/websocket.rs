use futures_util::{SinkExt, StreamExt};
use tokio::spawn;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::channel::{ChannelFault, ResponseHandler};
use crate::config::ChannelConfig;
use crate::message::codec::{self, SmallMessageKind};
use crate::message::{CHANNEL_CALL_FAULT, CHANNEL_CONNECT_FAULT, Message};
use crate::transport::message::{ClientFrame, ServerFrame, WireMessage};
use crate::transport::{Transport, TransportFactory, TransportListener, connection_lost};

type Handlers = HashMap<String, Vec<Arc<dyn ResponseHandler>>>;

/// Transport over a single WebSocket connection.
///
/// Every connect starts a new generation; frames and close notifications
/// from an older generation are dropped.
pub struct WebSocketTransport {
    small_messages: bool,
    inner: Arc<Mutex<Connection>>,
}

#[derive(Default)]
struct Connection {
    generation: u64,
    sender: Option<mpsc::UnboundedSender<WsMessage>>,
    /// Outstanding calls by message id. A resent message shares its id with
    /// the original, so each id keeps its handlers in send order.
    pending: Handlers,
}

impl Connection {
    /// Forgets handlers that already settled, e.g. on a request timeout.
    fn prune_settled(&mut self) {
        self.pending.retain(|_, handlers| {
            handlers.retain(|handler| !handler.settled());
            !handlers.is_empty()
        });
    }
}

fn lock(inner: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

fn is_current(inner: &Mutex<Connection>, generation: u64) -> bool {
    lock(inner).generation == generation
}

fn fail_all(pending: Handlers, detail: &str) {
    for handler in pending.into_values().flatten() {
        handler.status(connection_lost(detail));
    }
}

impl WebSocketTransport {
    pub fn new(small_messages: bool) -> Self {
        Self {
            small_messages,
            inner: Arc::new(Mutex::new(Connection::default())),
        }
    }

    fn encode(&self, message: &Message) -> Result<WsMessage, String> {
        if self.small_messages {
            if let Some(kind) = SmallMessageKind::of(message) {
                let mut frame = vec![kind.tag()];
                frame.extend(codec::encode(message).map_err(|e| e.to_string())?);
                return Ok(WsMessage::binary(frame));
            }
        }
        let frame = ClientFrame::Send {
            message: WireMessage::from(message),
        };
        serde_json::to_string(&frame)
            .map(WsMessage::text)
            .map_err(|e| e.to_string())
    }
}

impl Transport for WebSocketTransport {
    fn connect(&self, endpoint: &str, listener: Arc<dyn TransportListener>) {
        let generation = {
            let mut connection = lock(&self.inner);
            connection.generation += 1;
            connection.sender = None;
            connection.generation
        };
        let inner = Arc::clone(&self.inner);
        let endpoint = endpoint.to_string();

        spawn(async move {
            let ws_stream = match connect_async(endpoint.as_str()).await {
                Ok((ws, _)) => ws,
                Err(e) => {
                    if is_current(&inner, generation) {
                        listener.on_connect_failed(ChannelFault::new(
                            CHANNEL_CONNECT_FAULT,
                            format!("Unable to connect to '{endpoint}'."),
                            e.to_string(),
                            false,
                        ));
                    }
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
            {
                let mut connection = lock(&inner);
                if connection.generation != generation {
                    return;
                }
                connection.sender = Some(tx);
            }

            // Forward queued frames to the socket
            let send_endpoint = endpoint.clone();
            spawn(async move {
                while let Some(msg) = rx.recv().await {
                    if let Err(e) = ws_sender.send(msg).await {
                        warn!(endpoint = %send_endpoint, error = %e, "failed to send frame");
                        break;
                    }
                }
                let _ = ws_sender.close().await;
                debug!(endpoint = %send_endpoint, "send loop closed");
            });

            info!(%endpoint, "websocket connected");
            listener.on_connected();

            while let Some(frame) = ws_receiver.next().await {
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(%endpoint, error = %e, "websocket read failed");
                        break;
                    }
                };
                if !is_current(&inner, generation) {
                    return;
                }
                match frame {
                    WsMessage::Text(text) => handle_text(&inner, &listener, text.as_str()),
                    WsMessage::Binary(data) => handle_binary(&inner, &listener, &data),
                    WsMessage::Close(_) => break,
                    _ => {}
                }
            }

            let pending = {
                let mut connection = lock(&inner);
                if connection.generation != generation {
                    return;
                }
                connection.sender = None;
                std::mem::take(&mut connection.pending)
            };
            info!(%endpoint, outstanding = pending.len(), "websocket closed");
            fail_all(pending, "The connection closed before a response arrived.");
            listener.on_disconnected(false);
        });
    }

    fn disconnect(&self) {
        let pending = {
            let mut connection = lock(&self.inner);
            connection.generation += 1;
            connection.sender = None;
            std::mem::take(&mut connection.pending)
        };
        if !pending.is_empty() {
            debug!(outstanding = pending.len(), "disconnect fails outstanding calls");
        }
        fail_all(pending, "The connection was closed.");
    }

    fn invoke(&self, message: Message, handler: Arc<dyn ResponseHandler>) {
        let frame = match self.encode(&message) {
            Ok(frame) => frame,
            Err(e) => {
                handler.status(Message::error(CHANNEL_CALL_FAULT, "Channel call failed", e));
                return;
            }
        };
        let message_id = message.message_id().to_string();
        let sent = {
            let mut connection = lock(&self.inner);
            let sent = connection
                .sender
                .as_ref()
                .is_some_and(|tx| tx.send(frame).is_ok());
            if sent {
                connection.prune_settled();
                connection
                    .pending
                    .entry(message_id)
                    .or_default()
                    .push(Arc::clone(&handler));
            }
            sent
        };
        if !sent {
            handler.status(connection_lost("The channel is not connected."));
        }
    }
}

fn handle_text(inner: &Mutex<Connection>, listener: &Arc<dyn TransportListener>, text: &str) {
    match serde_json::from_str::<ServerFrame>(text) {
        Ok(ServerFrame::Result { message }) | Ok(ServerFrame::Fault { message }) => {
            respond(inner, message.into());
        }
        Ok(ServerFrame::Push { message }) => listener.on_message(message.into()),
        Err(err) => {
            warn!(error = %err, frame = text, "invalid server frame");
        }
    }
}

fn handle_binary(inner: &Mutex<Connection>, listener: &Arc<dyn TransportListener>, data: &[u8]) {
    let Some((tag, body)) = data.split_first() else {
        return;
    };
    let decoded = SmallMessageKind::from_tag(*tag).and_then(|kind| {
        codec::decode(kind, body).map(|message| (kind, message))
    });
    match decoded {
        Ok((SmallMessageKind::Acknowledge, message)) => respond(inner, message),
        Ok((_, message)) => listener.on_message(message),
        Err(err) => warn!(error = %err, "invalid binary frame"),
    }
}

fn respond(inner: &Mutex<Connection>, message: Message) {
    let handler = message.correlation_id.as_ref().and_then(|id| {
        let mut connection = lock(inner);
        let handlers = connection.pending.get_mut(id)?;
        let handler = (!handlers.is_empty()).then(|| handlers.remove(0));
        if handlers.is_empty() {
            connection.pending.remove(id);
        }
        handler
    });
    match handler {
        Some(handler) => handler.result(message),
        None => debug!(correlation_id = ?message.correlation_id, "uncorrelated response dropped"),
    }
}

/// Creates a [`WebSocketTransport`] per channel.
#[derive(Debug, Default)]
pub struct WebSocketTransportFactory;

impl TransportFactory for WebSocketTransportFactory {
    fn create(&self, config: &ChannelConfig) -> Arc<dyn Transport> {
        Arc::new(WebSocketTransport::new(config.small_messages))
    }
}

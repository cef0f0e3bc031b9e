//! The `transport` module is the seam between channels and the network.
//!
//! A [`Transport`] connects to one endpoint, invokes messages and reports
//! lifecycle changes and pushed messages to a [`TransportListener`]. The
//! WebSocket implementation speaks JSON frames, or the compact binary form
//! for channels that enable small messages.

pub mod message;
#[cfg(test)]
pub(crate) mod mock;
pub mod websocket;

use std::sync::Arc;

use crate::channel::{ChannelFault, ResponseHandler};
use crate::config::ChannelConfig;
use crate::message::headers::RETRYABLE_HINT_HEADER;
use crate::message::{CHANNEL_CALL_FAULT, Message};

pub use websocket::{WebSocketTransport, WebSocketTransportFactory};

/// Connection events reported by a transport.
pub trait TransportListener: Send + Sync {
    fn on_connected(&self);
    fn on_connect_failed(&self, fault: ChannelFault);
    /// The established connection went away.
    fn on_disconnected(&self, rejected: bool);
    /// A message the server pushed without a request.
    fn on_message(&self, message: Message);
}

pub trait Transport: Send + Sync {
    /// Starts connecting to `endpoint`; the outcome arrives on `listener`.
    fn connect(&self, endpoint: &str, listener: Arc<dyn TransportListener>);

    /// Closes the connection. Outstanding invocations fail with
    /// [`connection_lost`].
    fn disconnect(&self);

    fn invoke(&self, message: Message, handler: Arc<dyn ResponseHandler>);

    /// Whether this transport pulls messages rather than having them pushed.
    fn is_polling(&self) -> bool {
        false
    }

    fn enable_polling(&self) {}

    fn disable_polling(&self) {}
}

/// Status for an invocation whose connection went away before the reply.
/// The call may succeed on the next connection, so it carries the retryable
/// hint.
pub(crate) fn connection_lost(detail: &str) -> Message {
    Message::error(CHANNEL_CALL_FAULT, "Channel call failed", detail)
        .with_header(RETRYABLE_HINT_HEADER, true)
}

/// Creates the transport behind each configured channel.
pub trait TransportFactory: Send + Sync {
    fn create(&self, config: &ChannelConfig) -> Arc<dyn Transport>;
}

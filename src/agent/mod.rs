//! The `agent` module holds the session objects applications talk to.
//!
//! A [`MessageAgent`] carries the state every agent shares: the client id,
//! the queue of messages waiting for it, credentials and the channel set.
//! [`Consumer`] and [`Producer`] build the subscribe and connect protocols on
//! top of it, each with its own [`RetryTimer`].

mod consumer;
pub mod events;
mod message_agent;
mod producer;
mod retry;

pub use consumer::Consumer;
pub use events::{AgentEvent, PropertyChange};
pub use message_agent::MessageAgent;
pub use producer::Producer;
pub use retry::{RetryPhase, RetryPolicy, RetryTimer, Tick};

use crate::channel::{ChannelEvent, ChannelFaultEvent};
use crate::message::Message;

/// Callbacks an agent receives from responders and channel sets.
pub trait Agent: Send + Sync {
    fn id(&self) -> &str;

    /// A request was acknowledged.
    fn acknowledge(&self, ack: Message, request: Message);

    /// A request failed, on the server or locally.
    fn fault(&self, error: Message, request: Message);

    fn channel_connected(&self, event: &ChannelEvent);

    fn channel_disconnected(&self, event: &ChannelEvent);

    fn channel_faulted(&self, event: &ChannelFaultEvent);

    fn set_authenticated(&self, authenticated: bool);
}

#[cfg(test)]
mod tests;

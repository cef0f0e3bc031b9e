use crate::channel::{ChannelEvent, ChannelFaultEvent};
use crate::message::Message;

/// Events an agent reports to the application through
/// [`MessageAgent::events`](super::MessageAgent::events).
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Acknowledge {
        ack: Message,
        request: Message,
    },
    /// `request` is absent for faults pushed by the server.
    Fault {
        fault: Message,
        request: Option<Message>,
    },
    /// A message delivered to a consumer.
    Message(Message),
    ChannelConnect(ChannelEvent),
    ChannelDisconnect(ChannelEvent),
    ChannelFault(ChannelFaultEvent),
    PropertyChange(PropertyChange),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PropertyChange {
    Connected(bool),
    Subscribed(bool),
    Authenticated(bool),
    ClientId(Option<String>),
}

impl AgentEvent {
    /// Fault code of a `Fault` event.
    pub fn fault_code(&self) -> Option<&str> {
        match self {
            AgentEvent::Fault { fault, .. } => fault.fault_code(),
            _ => None,
        }
    }
}

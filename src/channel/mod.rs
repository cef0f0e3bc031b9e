//! The `channel` module manages transport endpoints and their grouping.
//!
//! A [`Channel`] owns the connection to one endpoint: connecting,
//! failing over between uris, logging in and correlating responses through
//! [`MessageResponder`]s. A [`ChannelSet`] groups channels for the agents of
//! one destination and relays channel events to them.

#[allow(clippy::module_inception)]
mod channel;
mod channel_set;
pub mod events;
mod identity;
mod responder;

pub use channel::{Channel, derive_endpoint};
pub use channel_set::{AuthReply, ChannelSet, PushListener};
pub use events::{ChannelEvent, ChannelFault, ChannelFaultEvent};
pub use identity::{ClientIdentity, ConnectPermit};
pub use responder::{AgentTarget, MessageResponder, ResponseHandler, ResponseTarget};

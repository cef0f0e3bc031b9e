//! # msgsession
//!
//! `msgsession` is the client side of a publish/subscribe and request/response
//! messaging session. Agents talk to destinations through shared channels that
//! connect, fail over and log in on their own, with responses correlated back
//! to the agent that sent the request.
//!
//! ## Core Modules
//!
//! - `agent`: Consumers and producers, and the message agent state they share.
//! - `channel`: Channels, channel sets, the client identity barrier and response correlation.
//! - `client`: The process-level `Session` that hands out agents.
//! - `config`: Loading settings and resolving destinations to channels.
//! - `dispatcher`: Routing of pushed messages to subscribed consumers, without duplicates.
//! - `message`: The message model, header keys, command operations and the compact binary codec.
//! - `transport`: The transport seam and its WebSocket implementation.
//! - `utils`: Error types, logging and shared helpers.

pub mod agent;
pub mod channel;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod message;
pub mod transport;
pub mod utils;

pub use agent::{AgentEvent, Consumer, Producer};
pub use client::Session;
pub use message::Message;

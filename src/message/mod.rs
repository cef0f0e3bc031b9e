//! The `message` module defines the messages agents exchange with the server:
//! the message model itself, header keys, command operation codes and the
//! compact binary codec used by channels with small messages enabled.

pub mod codec;
pub mod command;
pub mod headers;
pub mod model;

pub use command::CommandOperation;
pub use headers::Headers;
pub use model::{
    AUTHENTICATION_FAULT, CHANNEL_CALL_FAULT, CHANNEL_CONNECT_FAULT, CONNECT_FAULT, FaultInfo,
    MESSAGE_SEND_FAULT, Message, MessageKind, REQUEST_TIMEOUT_FAULT, SUBSCRIBE_FAULT, create_uid,
};

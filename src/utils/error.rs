//! The `error` module defines the error types returned synchronously by the
//! `msgsession` API.
//!
//! Protocol faults that arrive asynchronously from the server are not Rust
//! errors: they travel as error messages through the agents' fault path and
//! surface as `AgentEvent::Fault`.

use config::ConfigError;

use crate::message::codec::CodecError;

/// Result type for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Errors raised directly to the caller of a session operation.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The agent has neither a destination nor an assigned channel set.
    #[error("a destination must be set before sending")]
    MissingDestination,

    /// The configuration source has no entry for the destination.
    #[error("no channels configured for destination '{0}'")]
    UnknownDestination(String),

    /// Credentials differ from the ones already authenticated on the channel.
    #[error("credentials cannot be changed while channel '{0}' is authenticated; log out first")]
    CredentialsConflict(String),

    /// Credentials were changed while a login or logout is outstanding.
    #[error("credentials cannot be changed while channel '{0}' is authenticating")]
    AuthenticationInProgress(String),

    /// The channel set is already logged in.
    #[error("channel set '{0}' is already authenticated")]
    AlreadyAuthenticated(String),

    /// The channel set has no channels to send through.
    #[error("channel set '{0}' has no channels")]
    NoChannels(String),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("transport error: {0}")]
    Transport(String),
}

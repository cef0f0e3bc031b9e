//! The `utils` module provides a collection of utility functions and common
//! definitions used across the `msgsession` crate.
//!
//! It holds the crate error type, logging initialisation and the credential
//! encoding shared by agents and channel sets.

pub mod error;
pub mod logging;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

/// Encodes a `username:password` pair the way login and remote-credentials
/// headers carry it on the wire.
pub fn encode_credentials(username: &str, password: &str) -> String {
    STANDARD.encode(format!("{username}:{password}"))
}

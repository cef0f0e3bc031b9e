//! Header keys exchanged with the server and the typed header map that
//! carries them.
//!
//! Keys are matched exactly by the server, so they must never be renamed.
//! Several behaviours key off whether a header is *present* rather than its
//! value, which is why [`Headers`] keeps absent and explicitly-set entries
//! apart (a `null` value is still a present header).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Id of the endpoint (channel) a message was sent through.
pub const ENDPOINT_HEADER: &str = "DSEndpoint";
/// Process-wide client identity assigned by the server.
pub const SESSION_ID_HEADER: &str = "DSId";
/// Base64 credentials for a remote destination.
pub const REMOTE_CREDENTIALS_HEADER: &str = "DSRemoteCredentials";
/// Charset used to encode [`REMOTE_CREDENTIALS_HEADER`].
pub const REMOTE_CREDENTIALS_CHARSET_HEADER: &str = "DSRemoteCredentialsCharset";
/// Charset used to encode the body of a login command.
pub const CREDENTIALS_CHARSET_HEADER: &str = "DSCredentialsCharset";
/// Per-message request timeout, in seconds.
pub const REQUEST_TIMEOUT_HEADER: &str = "DSRequestTimeout";
/// Set on error messages the client may retry automatically.
pub const RETRYABLE_HINT_HEADER: &str = "DSRetryableErrorHint";
/// Marks an acknowledgement that actually reports a problem.
pub const ERROR_HINT_HEADER: &str = "DSErrorHint";
/// HTTP-style status code reported by the server.
pub const STATUS_CODE_HEADER: &str = "DSStatusCode";
/// Maximum number of messages per second a consumer wants pushed.
pub const MAX_FREQUENCY_HEADER: &str = "DSMaxFrequency";
/// Message selector expression of a subscription.
pub const SELECTOR_HEADER: &str = "DSSelector";
/// Subtopic of a subscription or published message.
pub const SUBTOPIC_HEADER: &str = "DSSubtopic";
/// Keep a durable subscription alive across an unsubscribe.
pub const PRESERVE_DURABLE_HEADER: &str = "DSPreserveDurable";
/// Ask the server to return destination configuration with the reply.
pub const NEEDS_CONFIG_HEADER: &str = "DSNeedsConfig";
/// Time the server may hold a poll open, in milliseconds.
pub const POLL_WAIT_HEADER: &str = "DSPollWait";
/// Poll that only keeps the session alive.
pub const NO_OP_POLL_HEADER: &str = "DSNoOpPoll";
/// Marks a ping sent by the heartbeat.
pub const HEARTBEAT_HEADER: &str = "DSHeartbeat";
/// Messaging protocol version spoken by the client.
pub const MESSAGING_VERSION_HEADER: &str = "DSMessagingVersion";
/// Delivery priority of a produced message (0..=9).
pub const PRIORITY_HEADER: &str = "DSPriority";

/// Protocol version advertised in the connect handshake.
pub const MESSAGING_VERSION: i64 = 1;

/// Ordered map of message headers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(BTreeMap<String, Value>);

impl Headers {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Integer view of a header; numeric strings are accepted as well.
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.0.get(key)? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Truthiness of a header: `true`, a non-zero number or a non-empty
    /// string other than `"false"`.
    pub fn is_set(&self, key: &str) -> bool {
        match self.0.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
            Some(Value::String(s)) => !s.is_empty() && s != "false",
            Some(Value::Null) | None => false,
            Some(_) => true,
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    /// Inserts only when the key is absent; returns whether it was inserted.
    pub fn insert_if_absent(&mut self, key: &str, value: impl Into<Value>) -> bool {
        if self.0.contains_key(key) {
            return false;
        }
        self.0.insert(key.to_string(), value.into());
        true
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    /// Copies every entry of `defaults` whose key is not already present.
    pub fn merge_missing(&mut self, defaults: &Headers) {
        for (key, value) in &defaults.0 {
            self.0.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

impl FromIterator<(String, Value)> for Headers {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

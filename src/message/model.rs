use std::sync::OnceLock;

use serde_json::Value;
use uuid::Uuid;

use super::command::CommandOperation;
use super::headers::{Headers, RETRYABLE_HINT_HEADER};

/// Fault code of a request that received no response in time.
pub const REQUEST_TIMEOUT_FAULT: &str = "Client.Error.RequestTimeout";
/// Fault code of a send that could not be delivered to any channel.
pub const MESSAGE_SEND_FAULT: &str = "Client.Error.MessageSend";
/// Fault code of a subscription that ran out of retries.
pub const SUBSCRIBE_FAULT: &str = "Client.Error.Subscribe";
/// Fault code of a producer that could not connect.
pub const CONNECT_FAULT: &str = "Client.Error.Connect";
/// Fault code of rejected or expired credentials.
pub const AUTHENTICATION_FAULT: &str = "Client.Authentication";
/// Fault code of a channel that failed to connect.
pub const CHANNEL_CONNECT_FAULT: &str = "Channel.Connect.Failed";
/// Fault code of a call the transport could not complete.
pub const CHANNEL_CALL_FAULT: &str = "Channel.Call.Failed";

/// Error details carried by [`MessageKind::Error`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FaultInfo {
    pub fault_code: String,
    pub fault_string: String,
    pub fault_detail: String,
    pub root_cause: Option<Value>,
    pub extended_data: Option<Value>,
}

impl FaultInfo {
    pub fn new(
        fault_code: impl Into<String>,
        fault_string: impl Into<String>,
        fault_detail: impl Into<String>,
    ) -> Self {
        Self {
            fault_code: fault_code.into(),
            fault_string: fault_string.into(),
            fault_detail: fault_detail.into(),
            root_cause: None,
            extended_data: None,
        }
    }
}

/// The message kinds exchanged with the server.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageKind {
    /// Plain publish/subscribe data.
    Async,
    /// Control message for the session (subscribe, ping, login, ...).
    Command { operation: CommandOperation },
    /// Successful reply to a prior message.
    Acknowledge,
    /// Failed reply to a prior message, or a pushed error.
    Error(FaultInfo),
}

/// The unit of communication between agents and the server.
///
/// `message_id` is generated lazily on first read. Clones always share the
/// original's id, generating it first if needed, so a request and the copy
/// kept for correlation can never disagree.
#[derive(Debug, PartialEq)]
pub struct Message {
    pub body: Value,
    pub client_id: Option<String>,
    pub destination: String,
    pub headers: Headers,
    message_id: OnceLock<String>,
    pub timestamp: i64,
    pub time_to_live: i64,
    pub correlation_id: Option<String>,
    pub kind: MessageKind,
}

/// Creates an id in the canonical upper-case hyphenated UUID form.
pub fn create_uid() -> String {
    Uuid::new_v4().hyphenated().to_string().to_uppercase()
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl Clone for Message {
    fn clone(&self) -> Self {
        Self {
            body: self.body.clone(),
            client_id: self.client_id.clone(),
            destination: self.destination.clone(),
            headers: self.headers.clone(),
            message_id: OnceLock::from(self.message_id().to_string()),
            timestamp: self.timestamp,
            time_to_live: self.time_to_live,
            correlation_id: self.correlation_id.clone(),
            kind: self.kind.clone(),
        }
    }
}

impl Message {
    fn with_kind(kind: MessageKind) -> Self {
        Self {
            body: Value::Null,
            client_id: None,
            destination: String::new(),
            headers: Headers::new(),
            message_id: OnceLock::new(),
            timestamp: 0,
            time_to_live: 0,
            correlation_id: None,
            kind,
        }
    }

    /// An empty data message.
    pub fn new_async() -> Self {
        Self::with_kind(MessageKind::Async)
    }

    pub fn command(operation: CommandOperation) -> Self {
        Self::with_kind(MessageKind::Command { operation })
    }

    pub fn acknowledge() -> Self {
        Self::with_kind(MessageKind::Acknowledge)
    }

    pub fn error(
        fault_code: impl Into<String>,
        fault_string: impl Into<String>,
        fault_detail: impl Into<String>,
    ) -> Self {
        Self::with_kind(MessageKind::Error(FaultInfo::new(
            fault_code,
            fault_string,
            fault_detail,
        )))
    }

    /// Acknowledgement correlated to `request`.
    pub fn acknowledge_for(request: &Message) -> Self {
        let mut ack = Self::acknowledge();
        ack.correlation_id = Some(request.message_id().to_string());
        ack.client_id = request.client_id.clone();
        ack.destination = request.destination.clone();
        ack.timestamp = now_millis();
        ack
    }

    /// Error message correlated to `request`.
    pub fn error_for(
        request: &Message,
        fault_code: impl Into<String>,
        fault_string: impl Into<String>,
        fault_detail: impl Into<String>,
    ) -> Self {
        let mut error = Self::error(fault_code, fault_string, fault_detail);
        error.correlation_id = Some(request.message_id().to_string());
        error.destination = request.destination.clone();
        error.timestamp = now_millis();
        error
    }

    pub fn message_id(&self) -> &str {
        self.message_id.get_or_init(create_uid)
    }

    /// Whether an id has been generated or assigned yet.
    pub fn has_message_id(&self) -> bool {
        self.message_id.get().is_some()
    }

    pub fn set_message_id(&mut self, id: impl Into<String>) {
        self.message_id = OnceLock::from(id.into());
    }

    pub fn with_body(mut self, body: impl Into<Value>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = destination.into();
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(key, value);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn operation(&self) -> Option<CommandOperation> {
        match self.kind {
            MessageKind::Command { operation } => Some(operation),
            _ => None,
        }
    }

    pub fn is_command(&self, operation: CommandOperation) -> bool {
        self.operation() == Some(operation)
    }

    pub fn is_acknowledge(&self) -> bool {
        matches!(self.kind, MessageKind::Acknowledge)
    }

    pub fn is_error(&self) -> bool {
        matches!(self.kind, MessageKind::Error(_))
    }

    pub fn fault(&self) -> Option<&FaultInfo> {
        match &self.kind {
            MessageKind::Error(info) => Some(info),
            _ => None,
        }
    }

    pub fn fault_mut(&mut self) -> Option<&mut FaultInfo> {
        match &mut self.kind {
            MessageKind::Error(info) => Some(info),
            _ => None,
        }
    }

    pub fn fault_code(&self) -> Option<&str> {
        self.fault().map(|f| f.fault_code.as_str())
    }

    /// Error messages the server flagged as safe to retry.
    pub fn is_retryable(&self) -> bool {
        self.is_error() && self.headers.is_set(RETRYABLE_HINT_HEADER)
    }

    /// Whether this message replies to `request`.
    pub fn correlates_with(&self, request: &Message) -> bool {
        self.correlation_id.as_deref() == Some(request.message_id())
    }
}

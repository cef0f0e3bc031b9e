use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::{CommandOperation, Headers, Message, MessageKind};

/// Frames sent by the client.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    #[serde(rename = "send")]
    Send { message: WireMessage },
}

/// Frames sent by the server.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    /// Reply to a sent message, correlated by `correlationId`.
    #[serde(rename = "result")]
    Result { message: WireMessage },

    /// Error reply to a sent message.
    #[serde(rename = "fault")]
    Fault { message: WireMessage },

    /// Message published to a subscription.
    #[serde(rename = "push")]
    Push { message: WireMessage },
}

/// JSON form of a [`Message`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub body: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub destination: String,
    #[serde(default, skip_serializing_if = "Headers::is_empty")]
    pub headers: Headers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub time_to_live: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(flatten)]
    pub kind: WireKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum WireKind {
    Async,
    Command {
        operation: CommandOperation,
    },
    Acknowledge,
    Error {
        fault_code: String,
        #[serde(default)]
        fault_string: String,
        #[serde(default)]
        fault_detail: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        root_cause: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        extended_data: Option<Value>,
    },
}

impl From<&Message> for WireMessage {
    fn from(message: &Message) -> Self {
        let kind = match &message.kind {
            MessageKind::Async => WireKind::Async,
            MessageKind::Command { operation } => WireKind::Command {
                operation: *operation,
            },
            MessageKind::Acknowledge => WireKind::Acknowledge,
            MessageKind::Error(fault) => WireKind::Error {
                fault_code: fault.fault_code.clone(),
                fault_string: fault.fault_string.clone(),
                fault_detail: fault.fault_detail.clone(),
                root_cause: fault.root_cause.clone(),
                extended_data: fault.extended_data.clone(),
            },
        };
        Self {
            body: message.body.clone(),
            client_id: message.client_id.clone(),
            destination: message.destination.clone(),
            headers: message.headers.clone(),
            message_id: Some(message.message_id().to_string()),
            timestamp: message.timestamp,
            time_to_live: message.time_to_live,
            correlation_id: message.correlation_id.clone(),
            kind,
        }
    }
}

impl From<WireMessage> for Message {
    fn from(wire: WireMessage) -> Self {
        let mut message = match wire.kind {
            WireKind::Async => Message::new_async(),
            WireKind::Command { operation } => Message::command(operation),
            WireKind::Acknowledge => Message::acknowledge(),
            WireKind::Error {
                fault_code,
                fault_string,
                fault_detail,
                root_cause,
                extended_data,
            } => {
                let mut error = Message::error(fault_code, fault_string, fault_detail);
                if let Some(fault) = error.fault_mut() {
                    fault.root_cause = root_cause;
                    fault.extended_data = extended_data;
                }
                error
            }
        };
        message.body = wire.body;
        message.client_id = wire.client_id;
        message.destination = wire.destination;
        message.headers = wire.headers;
        if let Some(id) = wire.message_id {
            message.set_message_id(id);
        }
        message.timestamp = wire.timestamp;
        message.time_to_live = wire.time_to_live;
        message.correlation_id = wire.correlation_id;
        message
    }
}

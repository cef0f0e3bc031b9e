use crate::message::Message;

/// Lifecycle notification a channel sends to its channel sets, which relay
/// it to their agents.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelEvent {
    pub channel_id: String,
    /// The channel is already working on getting connected again.
    pub reconnecting: bool,
    /// The server refused the connection; no failover or retry follows.
    pub rejected: bool,
}

impl ChannelEvent {
    pub fn new(channel_id: impl Into<String>, reconnecting: bool, rejected: bool) -> Self {
        Self {
            channel_id: channel_id.into(),
            reconnecting,
            rejected,
        }
    }
}

/// A transport level failure.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelFault {
    pub code: String,
    pub description: String,
    pub detail: String,
    pub rejected: bool,
}

impl ChannelFault {
    pub fn new(
        code: impl Into<String>,
        description: impl Into<String>,
        detail: impl Into<String>,
        rejected: bool,
    ) -> Self {
        Self {
            code: code.into(),
            description: description.into(),
            detail: detail.into(),
            rejected,
        }
    }

    /// The fault as an error message for the agent fault path.
    pub fn to_error_message(&self) -> Message {
        Message::error(&self.code, &self.description, &self.detail)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelFaultEvent {
    pub channel_id: String,
    pub fault: ChannelFault,
    pub reconnecting: bool,
    /// Whether the channel is still connected after the fault.
    pub channel_connected: bool,
}

impl ChannelFaultEvent {
    pub fn rejected(&self) -> bool {
        self.fault.rejected
    }
}

//! Command operation codes.
//!
//! The numeric values are part of the wire contract with the server.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandOperation {
    Subscribe,
    Unsubscribe,
    Poll,
    ClientSync,
    ClientPing,
    ClusterRequest,
    Login,
    Logout,
    SubscriptionInvalidate,
    MultiSubscribe,
    Disconnect,
    TriggerConnect,
    Unknown,
}

impl CommandOperation {
    pub fn code(self) -> u32 {
        match self {
            CommandOperation::Subscribe => 0,
            CommandOperation::Unsubscribe => 1,
            CommandOperation::Poll => 2,
            CommandOperation::ClientSync => 4,
            CommandOperation::ClientPing => 5,
            CommandOperation::ClusterRequest => 7,
            CommandOperation::Login => 8,
            CommandOperation::Logout => 9,
            CommandOperation::SubscriptionInvalidate => 10,
            CommandOperation::MultiSubscribe => 11,
            CommandOperation::Disconnect => 12,
            CommandOperation::TriggerConnect => 13,
            CommandOperation::Unknown => 10000,
        }
    }

    /// Unrecognised codes map to [`CommandOperation::Unknown`].
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => CommandOperation::Subscribe,
            1 => CommandOperation::Unsubscribe,
            2 => CommandOperation::Poll,
            4 => CommandOperation::ClientSync,
            5 => CommandOperation::ClientPing,
            7 => CommandOperation::ClusterRequest,
            8 => CommandOperation::Login,
            9 => CommandOperation::Logout,
            10 => CommandOperation::SubscriptionInvalidate,
            11 => CommandOperation::MultiSubscribe,
            12 => CommandOperation::Disconnect,
            13 => CommandOperation::TriggerConnect,
            _ => CommandOperation::Unknown,
        }
    }
}

impl fmt::Display for CommandOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandOperation::Subscribe => "subscribe",
            CommandOperation::Unsubscribe => "unsubscribe",
            CommandOperation::Poll => "poll",
            CommandOperation::ClientSync => "client-sync",
            CommandOperation::ClientPing => "client-ping",
            CommandOperation::ClusterRequest => "cluster-request",
            CommandOperation::Login => "login",
            CommandOperation::Logout => "logout",
            CommandOperation::SubscriptionInvalidate => "subscription-invalidate",
            CommandOperation::MultiSubscribe => "multi-subscribe",
            CommandOperation::Disconnect => "disconnect",
            CommandOperation::TriggerConnect => "trigger-connect",
            CommandOperation::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

impl Serialize for CommandOperation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.code())
    }
}

impl<'de> Deserialize<'de> for CommandOperation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        u32::deserialize(deserializer).map(CommandOperation::from_code)
    }
}

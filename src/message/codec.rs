//! Compact "small message" codec.
//!
//! Wire format:
//! ```text
//! ┌──────────────┬────────────────┬──────────────┬──────────────┬─────┐
//! │ common flags │ common values  │ async flags  │ async values │ ... │
//! │ 1..n bytes   │ in flag order  │ 1..n bytes   │              │     │
//! └──────────────┴────────────────┴──────────────┴──────────────┴─────┘
//! ```
//!
//! Each block starts with one or more flag bytes. Bit 7 of a flag byte means
//! "another flag byte follows". The remaining bits announce which optional
//! values follow the flags, in bit order. Acknowledgements and commands append
//! one more block after the async block.
//!
//! Every value is written as `[u32 big-endian length][bytes]`, so a decoder can
//! step over values announced by bits it does not know. That keeps older
//! decoders aligned with streams written by newer encoders without any
//! explicit version check. A stream that ends where a flag byte is expected
//! decodes as "no further fields".

use serde_json::Value;
use uuid::Uuid;

use super::command::CommandOperation;
use super::headers::Headers;
use super::model::{Message, MessageKind};

pub const HAS_NEXT_FLAG: u8 = 0x80;

// common block, byte 0
pub const BODY_FLAG: u8 = 0x01;
pub const CLIENT_ID_FLAG: u8 = 0x02;
pub const DESTINATION_FLAG: u8 = 0x04;
pub const HEADERS_FLAG: u8 = 0x08;
pub const MESSAGE_ID_FLAG: u8 = 0x10;
pub const TIMESTAMP_FLAG: u8 = 0x20;
pub const TIME_TO_LIVE_FLAG: u8 = 0x40;
// common block, byte 1
pub const CLIENT_ID_BYTES_FLAG: u8 = 0x01;
pub const MESSAGE_ID_BYTES_FLAG: u8 = 0x02;
// async block
pub const CORRELATION_ID_FLAG: u8 = 0x01;
pub const CORRELATION_ID_BYTES_FLAG: u8 = 0x02;
// command block
pub const OPERATION_FLAG: u8 = 0x01;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum CodecError {
    #[error("unexpected end of input at byte {0}")]
    Truncated(usize),

    #[error("invalid utf-8 string value")]
    InvalidUtf8,

    #[error("invalid json value: {0}")]
    InvalidJson(String),

    #[error("invalid {field} value of {len} bytes")]
    InvalidLength { field: &'static str, len: usize },

    #[error("error messages have no small form")]
    Unsupported,

    #[error("unknown small message tag {0:#04x}")]
    UnknownTag(u8),
}

/// Message kinds that have a small form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmallMessageKind {
    Async,
    Acknowledge,
    Command,
}

impl SmallMessageKind {
    pub fn of(message: &Message) -> Option<Self> {
        match message.kind {
            MessageKind::Async => Some(SmallMessageKind::Async),
            MessageKind::Acknowledge => Some(SmallMessageKind::Acknowledge),
            MessageKind::Command { .. } => Some(SmallMessageKind::Command),
            MessageKind::Error(_) => None,
        }
    }

    /// One-byte tag used by framings that prefix the kind.
    pub fn tag(self) -> u8 {
        match self {
            SmallMessageKind::Async => b'A',
            SmallMessageKind::Acknowledge => b'K',
            SmallMessageKind::Command => b'C',
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, CodecError> {
        match tag {
            b'A' => Ok(SmallMessageKind::Async),
            b'K' => Ok(SmallMessageKind::Acknowledge),
            b'C' => Ok(SmallMessageKind::Command),
            other => Err(CodecError::UnknownTag(other)),
        }
    }
}

/// Encodes `message` in its small form.
///
/// Reading the message id forces one to exist, so encoded messages always
/// carry an id.
pub fn encode(message: &Message) -> Result<Vec<u8>, CodecError> {
    let kind = SmallMessageKind::of(message).ok_or(CodecError::Unsupported)?;
    let mut w = Writer::new();

    let message_id = message.message_id();
    let client_id_bytes = message.client_id.as_deref().and_then(uuid_bytes);
    let message_id_bytes = uuid_bytes(message_id);

    let mut flags = 0u8;
    if !message.body.is_null() {
        flags |= BODY_FLAG;
    }
    if message.client_id.is_some() && client_id_bytes.is_none() {
        flags |= CLIENT_ID_FLAG;
    }
    if !message.destination.is_empty() {
        flags |= DESTINATION_FLAG;
    }
    if !message.headers.is_empty() {
        flags |= HEADERS_FLAG;
    }
    if message_id_bytes.is_none() {
        flags |= MESSAGE_ID_FLAG;
    }
    if message.timestamp != 0 {
        flags |= TIMESTAMP_FLAG;
    }
    if message.time_to_live != 0 {
        flags |= TIME_TO_LIVE_FLAG;
    }
    let mut id_flags = 0u8;
    if client_id_bytes.is_some() {
        id_flags |= CLIENT_ID_BYTES_FLAG;
    }
    if message_id_bytes.is_some() {
        id_flags |= MESSAGE_ID_BYTES_FLAG;
    }
    w.write_flags(&[flags, id_flags]);

    if flags & BODY_FLAG != 0 {
        w.write_json(&message.body)?;
    }
    if flags & CLIENT_ID_FLAG != 0 {
        if let Some(client_id) = &message.client_id {
            w.write_str(client_id);
        }
    }
    if flags & DESTINATION_FLAG != 0 {
        w.write_str(&message.destination);
    }
    if flags & HEADERS_FLAG != 0 {
        let headers = serde_json::to_vec(&message.headers)
            .map_err(|e| CodecError::InvalidJson(e.to_string()))?;
        w.write_value(&headers);
    }
    if flags & MESSAGE_ID_FLAG != 0 {
        w.write_str(message_id);
    }
    if flags & TIMESTAMP_FLAG != 0 {
        w.write_i64(message.timestamp);
    }
    if flags & TIME_TO_LIVE_FLAG != 0 {
        w.write_i64(message.time_to_live);
    }
    if let Some(bytes) = client_id_bytes {
        w.write_value(&bytes);
    }
    if let Some(bytes) = message_id_bytes {
        w.write_value(&bytes);
    }

    let correlation_bytes = message.correlation_id.as_deref().and_then(uuid_bytes);
    let mut async_flags = 0u8;
    if message.correlation_id.is_some() && correlation_bytes.is_none() {
        async_flags |= CORRELATION_ID_FLAG;
    }
    if correlation_bytes.is_some() {
        async_flags |= CORRELATION_ID_BYTES_FLAG;
    }
    w.write_flags(&[async_flags]);
    if async_flags & CORRELATION_ID_FLAG != 0 {
        if let Some(correlation_id) = &message.correlation_id {
            w.write_str(correlation_id);
        }
    }
    if let Some(bytes) = correlation_bytes {
        w.write_value(&bytes);
    }

    match (kind, &message.kind) {
        (SmallMessageKind::Acknowledge, _) => w.write_flags(&[0]),
        (SmallMessageKind::Command, MessageKind::Command { operation }) => {
            if *operation == CommandOperation::Unknown {
                w.write_flags(&[0]);
            } else {
                w.write_flags(&[OPERATION_FLAG]);
                w.write_value(&operation.code().to_be_bytes());
            }
        }
        _ => {}
    }

    Ok(w.into_bytes())
}

/// Decodes a small message of the given kind.
pub fn decode(kind: SmallMessageKind, bytes: &[u8]) -> Result<Message, CodecError> {
    let mut r = Reader::new(bytes);
    let mut message = match kind {
        SmallMessageKind::Async => Message::new_async(),
        SmallMessageKind::Acknowledge => Message::acknowledge(),
        SmallMessageKind::Command => Message::command(CommandOperation::Unknown),
    };

    let flags = r.read_flags()?;
    for (i, byte) in flags.iter().copied().enumerate() {
        let known_bits = match i {
            0 => {
                if byte & BODY_FLAG != 0 {
                    message.body = r.read_json()?;
                }
                if byte & CLIENT_ID_FLAG != 0 {
                    message.client_id = Some(r.read_string()?);
                }
                if byte & DESTINATION_FLAG != 0 {
                    message.destination = r.read_string()?;
                }
                if byte & HEADERS_FLAG != 0 {
                    let raw = r.read_value()?;
                    message.headers = serde_json::from_slice::<Headers>(raw)
                        .map_err(|e| CodecError::InvalidJson(e.to_string()))?;
                }
                if byte & MESSAGE_ID_FLAG != 0 {
                    let id = r.read_string()?;
                    message.set_message_id(id);
                }
                if byte & TIMESTAMP_FLAG != 0 {
                    message.timestamp = r.read_i64()?;
                }
                if byte & TIME_TO_LIVE_FLAG != 0 {
                    message.time_to_live = r.read_i64()?;
                }
                7
            }
            1 => {
                if byte & CLIENT_ID_BYTES_FLAG != 0 {
                    message.client_id = Some(r.read_uuid("clientId")?);
                }
                if byte & MESSAGE_ID_BYTES_FLAG != 0 {
                    let id = r.read_uuid("messageId")?;
                    message.set_message_id(id);
                }
                2
            }
            _ => 0,
        };
        r.skip_unknown(byte, known_bits)?;
    }

    let flags = r.read_flags()?;
    for (i, byte) in flags.iter().copied().enumerate() {
        let known_bits = if i == 0 {
            if byte & CORRELATION_ID_FLAG != 0 {
                message.correlation_id = Some(r.read_string()?);
            }
            if byte & CORRELATION_ID_BYTES_FLAG != 0 {
                message.correlation_id = Some(r.read_uuid("correlationId")?);
            }
            2
        } else {
            0
        };
        r.skip_unknown(byte, known_bits)?;
    }

    match kind {
        SmallMessageKind::Async => {}
        SmallMessageKind::Acknowledge => {
            let flags = r.read_flags()?;
            for byte in flags {
                r.skip_unknown(byte, 0)?;
            }
        }
        SmallMessageKind::Command => {
            let flags = r.read_flags()?;
            for (i, byte) in flags.iter().copied().enumerate() {
                let known_bits = if i == 0 {
                    if byte & OPERATION_FLAG != 0 {
                        let raw = r.read_value()?;
                        let code: [u8; 4] = raw.try_into().map_err(|_| CodecError::InvalidLength {
                            field: "operation",
                            len: raw.len(),
                        })?;
                        message.kind = MessageKind::Command {
                            operation: CommandOperation::from_code(u32::from_be_bytes(code)),
                        };
                    }
                    1
                } else {
                    0
                };
                r.skip_unknown(byte, known_bits)?;
            }
        }
    }

    Ok(message)
}

/// Binary form of an id, when it is a canonical upper-case UUID string.
fn uuid_bytes(id: &str) -> Option<[u8; 16]> {
    let uuid = Uuid::parse_str(id).ok()?;
    if uuid.hyphenated().to_string().to_uppercase() == id {
        Some(*uuid.as_bytes())
    } else {
        None
    }
}

pub(crate) struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub(crate) fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Writes a flag block. Trailing zero bytes are dropped; the first byte is
    /// always written.
    pub(crate) fn write_flags(&mut self, flags: &[u8]) {
        let last = flags.iter().rposition(|b| *b != 0).unwrap_or(0);
        for (i, byte) in flags.iter().take(last + 1).enumerate() {
            let byte = byte & !HAS_NEXT_FLAG;
            if i < last {
                self.buf.push(byte | HAS_NEXT_FLAG);
            } else {
                self.buf.push(byte);
            }
        }
    }

    pub(crate) fn write_value(&mut self, value: &[u8]) {
        self.buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
        self.buf.extend_from_slice(value);
    }

    pub(crate) fn write_str(&mut self, value: &str) {
        self.write_value(value.as_bytes());
    }

    pub(crate) fn write_i64(&mut self, value: i64) {
        self.write_value(&value.to_be_bytes());
    }

    pub(crate) fn write_json(&mut self, value: &Value) -> Result<(), CodecError> {
        let raw = serde_json::to_vec(value).map_err(|e| CodecError::InvalidJson(e.to_string()))?;
        self.write_value(&raw);
        Ok(())
    }

    pub(crate) fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Reads a flag block; an exhausted stream yields no flags.
    fn read_flags(&mut self) -> Result<Vec<u8>, CodecError> {
        let mut flags = Vec::new();
        while let Some(byte) = self.buf.get(self.pos).copied() {
            self.pos += 1;
            flags.push(byte);
            if byte & HAS_NEXT_FLAG == 0 {
                break;
            }
        }
        Ok(flags)
    }

    fn read_value(&mut self) -> Result<&'a [u8], CodecError> {
        let buf: &'a [u8] = self.buf;
        let header = buf
            .get(self.pos..self.pos + 4)
            .ok_or(CodecError::Truncated(self.pos))?;
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let start = self.pos + 4;
        let value = buf
            .get(start..start + len)
            .ok_or(CodecError::Truncated(start))?;
        self.pos = start + len;
        Ok(value)
    }

    fn read_string(&mut self) -> Result<String, CodecError> {
        let raw = self.read_value()?;
        String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8)
    }

    fn read_i64(&mut self) -> Result<i64, CodecError> {
        let raw = self.read_value()?;
        let bytes: [u8; 8] = raw.try_into().map_err(|_| CodecError::InvalidLength {
            field: "i64",
            len: raw.len(),
        })?;
        Ok(i64::from_be_bytes(bytes))
    }

    fn read_json(&mut self) -> Result<Value, CodecError> {
        let raw = self.read_value()?;
        serde_json::from_slice(raw).map_err(|e| CodecError::InvalidJson(e.to_string()))
    }

    fn read_uuid(&mut self, field: &'static str) -> Result<String, CodecError> {
        let raw = self.read_value()?;
        let uuid = Uuid::from_slice(raw).map_err(|_| CodecError::InvalidLength {
            field,
            len: raw.len(),
        })?;
        Ok(uuid.hyphenated().to_string().to_uppercase())
    }

    /// Steps over one value for every set bit from `known_bits` up to bit 6.
    fn skip_unknown(&mut self, flags: u8, known_bits: u8) -> Result<(), CodecError> {
        for bit in known_bits..7 {
            if (flags >> bit) & 1 != 0 {
                self.read_value()?;
            }
        }
        Ok(())
    }
}

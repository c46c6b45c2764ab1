//! Application-level chat message carried in a packet payload.
//!
//! # Binary Format
//!
//! - 1 byte: flags (bit 0 relay, bit 1 private, bit 2 encrypted)
//! - 8 bytes: timestamp, `f64` bits, big-endian
//! - id, sender, sender_peer_id: u8 length + UTF-8
//! - content: u32 length (big-endian) + UTF-8
//! - original_sender, recipient_nickname, channel: presence byte, then
//!   u8 length + UTF-8 when present
//! - encrypted_content: presence byte, then u32 length + bytes when present
//! - mentions: u8 count, each u8 length + UTF-8
//! - 1 byte: delivery status code
//!
//! Encoding has no randomness: the same message always yields the same bytes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ProtocolError, Result};
use crate::packet::now_timestamp;

const FLAG_RELAY: u8 = 0b0000_0001;
const FLAG_PRIVATE: u8 = 0b0000_0010;
const FLAG_ENCRYPTED: u8 = 0b0000_0100;

/// Sender name used for locally generated notices.
pub const SYSTEM_SENDER: &str = "system";

/// Delivery state of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// Created, not yet handed to the transport.
    #[default]
    Pending,
    /// Handed to the transport.
    Sent,
    /// Acknowledged by the recipient.
    Delivered,
    /// Read by the recipient.
    Read,
    /// Gave up.
    Failed,
}

impl DeliveryStatus {
    /// One-byte wire code.
    pub fn code(self) -> u8 {
        match self {
            DeliveryStatus::Pending => 0,
            DeliveryStatus::Sent => 1,
            DeliveryStatus::Delivered => 2,
            DeliveryStatus::Read => 3,
            DeliveryStatus::Failed => 4,
        }
    }

    /// Maps a wire code back to a status.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(DeliveryStatus::Pending),
            1 => Some(DeliveryStatus::Sent),
            2 => Some(DeliveryStatus::Delivered),
            3 => Some(DeliveryStatus::Read),
            4 => Some(DeliveryStatus::Failed),
            _ => None,
        }
    }

    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Read => "read",
            DeliveryStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(DeliveryStatus::Pending),
            "sent" => Ok(DeliveryStatus::Sent),
            "delivered" => Ok(DeliveryStatus::Delivered),
            "read" => Ok(DeliveryStatus::Read),
            "failed" => Ok(DeliveryStatus::Failed),
            _ => Err(ProtocolError::invalid(format!("Invalid status: {s}"))),
        }
    }
}

/// A chat message.
///
/// One record covers broadcast, channel, private, relayed and encrypted
/// messages; the flags and optional fields say which apply.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    /// UUID string.
    pub id: String,
    /// Sender nickname.
    pub sender: String,
    /// Plain text; empty while `is_encrypted`.
    pub content: String,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
    /// Forwarded on behalf of someone else.
    pub is_relay: bool,
    /// Nickname of the author when relayed.
    pub original_sender: Option<String>,
    /// Direct message.
    pub is_private: bool,
    /// Addressee of a direct message.
    pub recipient_nickname: Option<String>,
    /// Peer id of the sender.
    pub sender_peer_id: String,
    /// Mentioned nicknames in order of appearance.
    pub mentions: Vec<String>,
    /// Channel name, e.g. `#general`.
    pub channel: Option<String>,
    /// `content` is carried in `encrypted_content`.
    pub is_encrypted: bool,
    /// Channel ciphertext.
    #[serde(with = "serde_bytes")]
    pub encrypted_content: Option<Vec<u8>>,
    /// Delivery state.
    pub delivery_status: DeliveryStatus,
}

impl ChatMessage {
    /// Creates a plain broadcast message with a fresh UUID and the current
    /// time.
    pub fn new(
        sender: impl Into<String>,
        content: impl Into<String>,
        sender_peer_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender: sender.into(),
            content: content.into(),
            timestamp: now_timestamp(),
            is_relay: false,
            original_sender: None,
            is_private: false,
            recipient_nickname: None,
            sender_peer_id: sender_peer_id.into(),
            mentions: Vec::new(),
            channel: None,
            is_encrypted: false,
            encrypted_content: None,
            delivery_status: DeliveryStatus::Pending,
        }
    }

    /// A locally generated notice for the system-message log.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(SYSTEM_SENDER, content, SYSTEM_SENDER)
    }

    /// Targets a channel.
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    /// Makes this a direct message to `nickname`.
    pub fn private_to(mut self, nickname: impl Into<String>) -> Self {
        self.is_private = true;
        self.recipient_nickname = Some(nickname.into());
        self
    }

    /// Marks this message as relayed on behalf of `original_sender`.
    pub fn relayed_by(mut self, original_sender: impl Into<String>) -> Self {
        self.is_relay = true;
        self.original_sender = Some(original_sender.into());
        self
    }

    /// Sets mentions from `@nick` tokens found in the content.
    pub fn with_mentions(mut self) -> Self {
        self.mentions = parse_mentions(&self.content);
        self
    }

    /// Encodes to the binary format.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(64 + self.content.len());

        let mut flags = 0u8;
        if self.is_relay {
            flags |= FLAG_RELAY;
        }
        if self.is_private {
            flags |= FLAG_PRIVATE;
        }
        if self.is_encrypted {
            flags |= FLAG_ENCRYPTED;
        }
        out.push(flags);
        out.extend_from_slice(&self.timestamp.to_bits().to_be_bytes());

        write_short(&mut out, "id", &self.id)?;
        write_short(&mut out, "sender", &self.sender)?;
        write_short(&mut out, "sender_peer_id", &self.sender_peer_id)?;
        write_long(&mut out, "content", self.content.as_bytes())?;

        write_optional_short(&mut out, "original_sender", self.original_sender.as_deref())?;
        write_optional_short(
            &mut out,
            "recipient_nickname",
            self.recipient_nickname.as_deref(),
        )?;
        write_optional_short(&mut out, "channel", self.channel.as_deref())?;
        match &self.encrypted_content {
            Some(bytes) => {
                out.push(1);
                write_long(&mut out, "encrypted_content", bytes)?;
            }
            None => out.push(0),
        }

        let count = u8::try_from(self.mentions.len()).map_err(|_| {
            ProtocolError::Serialization(format!(
                "too many mentions: {} (max 255)",
                self.mentions.len()
            ))
        })?;
        out.push(count);
        for mention in &self.mentions {
            write_short(&mut out, "mention", mention)?;
        }

        out.push(self.delivery_status.code());
        Ok(out)
    }

    /// Decodes the binary format, naming the offending field on failure.
    pub fn decode(data: &[u8]) -> Result<ChatMessage> {
        let mut reader = Reader::new(data);

        let flags = reader.u8("flags")?;
        let timestamp = f64::from_bits(u64::from_be_bytes(reader.array("timestamp")?));
        let id = reader.short_string("id")?;
        let sender = reader.short_string("sender")?;
        let sender_peer_id = reader.short_string("sender_peer_id")?;
        let content = reader.long_string("content")?;

        let original_sender = reader.optional("original_sender", Reader::short_string)?;
        let recipient_nickname = reader.optional("recipient_nickname", Reader::short_string)?;
        let channel = reader.optional("channel", Reader::short_string)?;
        let encrypted_content = reader.optional("encrypted_content", Reader::long_bytes)?;

        let count = reader.u8("mention count")?;
        let mut mentions = Vec::with_capacity(count as usize);
        for _ in 0..count {
            mentions.push(reader.short_string("mention")?);
        }

        let code = reader.u8("delivery_status")?;
        let delivery_status = DeliveryStatus::from_code(code).ok_or_else(|| {
            ProtocolError::Deserialization(format!("unknown delivery_status code {code}"))
        })?;

        if !reader.is_empty() {
            return Err(ProtocolError::Deserialization(format!(
                "{} trailing bytes after message",
                reader.remaining()
            )));
        }

        Ok(ChatMessage {
            id,
            sender,
            content,
            timestamp,
            is_relay: flags & FLAG_RELAY != 0,
            original_sender,
            is_private: flags & FLAG_PRIVATE != 0,
            recipient_nickname,
            sender_peer_id,
            mentions,
            channel,
            is_encrypted: flags & FLAG_ENCRYPTED != 0,
            encrypted_content,
            delivery_status,
        })
    }
}

/// Extracts `@nick` mentions from `text`, in order.
///
/// A nickname is a run of ASCII alphanumerics, `_` or `-` right after `@`.
pub fn parse_mentions(text: &str) -> Vec<String> {
    let mut mentions = Vec::new();
    let mut rest = text;
    while let Some(at) = rest.find('@') {
        let after = &rest[at + 1..];
        let end = after
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'))
            .unwrap_or(after.len());
        if end > 0 {
            mentions.push(after[..end].to_string());
        }
        rest = &after[end..];
    }
    mentions
}

fn write_short(out: &mut Vec<u8>, field: &str, value: &str) -> Result<()> {
    let len = u8::try_from(value.len()).map_err(|_| {
        ProtocolError::Serialization(format!("{field} too long: {} bytes (max 255)", value.len()))
    })?;
    out.push(len);
    out.extend_from_slice(value.as_bytes());
    Ok(())
}

fn write_long(out: &mut Vec<u8>, field: &str, value: &[u8]) -> Result<()> {
    let len = u32::try_from(value.len())
        .map_err(|_| ProtocolError::Serialization(format!("{field} too long")))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(value);
    Ok(())
}

fn write_optional_short(out: &mut Vec<u8>, field: &str, value: Option<&str>) -> Result<()> {
    match value {
        Some(value) => {
            out.push(1);
            write_short(out, field, value)
        }
        None => {
            out.push(0);
            Ok(())
        }
    }
}

/// Bounds-checked cursor over an encoded message.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, field: &str, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(ProtocolError::Deserialization(format!(
                "truncated {field}: need {len} bytes, have {}",
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self, field: &str) -> Result<u8> {
        Ok(self.take(field, 1)?[0])
    }

    fn array<const N: usize>(&mut self, field: &str) -> Result<[u8; N]> {
        let mut array = [0u8; N];
        array.copy_from_slice(self.take(field, N)?);
        Ok(array)
    }

    fn utf8(field: &str, bytes: &[u8]) -> Result<String> {
        String::from_utf8(bytes.to_vec())
            .map_err(|_| ProtocolError::Deserialization(format!("invalid UTF-8 in {field}")))
    }

    fn short_string(&mut self, field: &str) -> Result<String> {
        let len = self.u8(field)? as usize;
        let bytes = self.take(field, len)?;
        Self::utf8(field, bytes)
    }

    fn long_bytes(&mut self, field: &str) -> Result<Vec<u8>> {
        let len = u32::from_be_bytes(self.array(field)?) as usize;
        Ok(self.take(field, len)?.to_vec())
    }

    fn long_string(&mut self, field: &str) -> Result<String> {
        let bytes = self.long_bytes(field)?;
        String::from_utf8(bytes)
            .map_err(|_| ProtocolError::Deserialization(format!("invalid UTF-8 in {field}")))
    }

    fn optional<T>(
        &mut self,
        field: &str,
        read: impl FnOnce(&mut Self, &str) -> Result<T>,
    ) -> Result<Option<T>> {
        match self.u8(field)? {
            0 => Ok(None),
            1 => read(self, field).map(Some),
            other => Err(ProtocolError::Deserialization(format!(
                "invalid presence byte {other} for {field}"
            ))),
        }
    }
}

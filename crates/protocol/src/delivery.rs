//! Delivery status bookkeeping and the ack / receipt payloads.
//!
//! Entries are only ever added or updated; nothing is evicted.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::{ProtocolError, Result};
use crate::message::DeliveryStatus;
use crate::packet::now_timestamp;

/// Acknowledgment that a message reached a recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAck {
    /// Fresh UUID for this ack.
    pub ack_id: String,
    /// UUID of the acknowledged message.
    pub message_id: String,
    /// UUID of the acknowledging recipient.
    pub recipient_id: String,
    /// Recipient nickname.
    pub nickname: String,
    /// Hops the message travelled.
    pub hop_count: u32,
}

impl DeliveryAck {
    /// Serialize to a MessagePack payload.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    /// Deserialize from a MessagePack payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// Notice that a recipient has read a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadReceipt {
    /// UUID of the read message.
    pub message_id: String,
    /// Id of the reader.
    pub recipient_id: String,
    /// Reader nickname.
    pub nickname: String,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
}

impl ReadReceipt {
    /// Creates a receipt stamped with the current time.
    pub fn new(
        message_id: impl Into<String>,
        recipient_id: impl Into<String>,
        nickname: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            recipient_id: recipient_id.into(),
            nickname: nickname.into(),
            timestamp: now_timestamp(),
        }
    }

    /// Serialize to a MessagePack payload.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    /// Deserialize from a MessagePack payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

fn require_non_empty(value: &str, message: &'static str) -> Result<()> {
    if value.is_empty() {
        return Err(ProtocolError::invalid(message));
    }
    Ok(())
}

/// Per-message delivery status and accumulated acks.
#[derive(Debug, Default)]
pub struct DeliveryTracker {
    statuses: HashMap<String, DeliveryStatus>,
    acks: HashMap<String, Vec<DeliveryAck>>,
}

impl DeliveryTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `status` for `message_id`, replacing any previous status.
    pub fn track_message(&mut self, message_id: &str, status: DeliveryStatus) -> Result<()> {
        require_non_empty(message_id, "message_id cannot be empty")?;
        self.statuses.insert(message_id.to_string(), status);
        Ok(())
    }

    /// Builds an ack for a received message. Does not touch tracker state.
    pub fn generate_ack(
        &self,
        message_id: &str,
        recipient_id: &str,
        nickname: &str,
        hop_count: i64,
    ) -> Result<DeliveryAck> {
        require_non_empty(message_id, "message_id cannot be empty")?;
        require_non_empty(recipient_id, "recipient_id cannot be empty")?;
        require_non_empty(nickname, "nickname cannot be empty")?;
        if hop_count < 0 {
            return Err(ProtocolError::invalid("hop_count cannot be negative"));
        }
        if Uuid::parse_str(message_id).is_err() {
            return Err(ProtocolError::invalid("message_id must be a valid UUID"));
        }
        if Uuid::parse_str(recipient_id).is_err() {
            return Err(ProtocolError::invalid("recipient_id must be a valid UUID"));
        }
        let hop_count = u32::try_from(hop_count)
            .map_err(|_| ProtocolError::invalid("hop_count out of range"))?;

        Ok(DeliveryAck {
            ack_id: Uuid::new_v4().to_string(),
            message_id: message_id.to_string(),
            recipient_id: recipient_id.to_string(),
            nickname: nickname.to_string(),
            hop_count,
        })
    }

    /// Stores `ack` and marks its message delivered, whatever its previous
    /// status. Duplicate acks are kept.
    pub fn process_ack(&mut self, ack: &DeliveryAck) -> Result<()> {
        require_non_empty(&ack.message_id, "ack.message_id cannot be empty")?;
        debug!(message_id = %ack.message_id, hop_count = ack.hop_count, "processing delivery ack");

        self.acks
            .entry(ack.message_id.clone())
            .or_default()
            .push(ack.clone());
        self.statuses
            .insert(ack.message_id.clone(), DeliveryStatus::Delivered);
        Ok(())
    }

    /// Marks the receipt's message as read.
    pub fn process_receipt(&mut self, receipt: &ReadReceipt) -> Result<()> {
        require_non_empty(&receipt.message_id, "receipt.message_id cannot be empty")?;
        debug!(message_id = %receipt.message_id, "processing read receipt");
        self.statuses
            .insert(receipt.message_id.clone(), DeliveryStatus::Read);
        Ok(())
    }

    /// Current status, or `None` for an unknown message.
    pub fn get_status(&self, message_id: &str) -> Result<Option<DeliveryStatus>> {
        require_non_empty(message_id, "message_id cannot be empty")?;
        Ok(self.statuses.get(message_id).copied())
    }

    /// Acks received so far, in arrival order.
    pub fn get_acks(&self, message_id: &str) -> Result<Vec<DeliveryAck>> {
        require_non_empty(message_id, "message_id cannot be empty")?;
        Ok(self.acks.get(message_id).cloned().unwrap_or_default())
    }

    /// Number of messages with a recorded status.
    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    /// Whether nothing has been tracked yet.
    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }
}

//! Message records and the durable-log codec. The host owns the files; this
//! module owns the format and the replay transforms.
//!
//! Format: one JSON array of message records per identity. Reads must
//! tolerate an empty or corrupt file by yielding an empty sequence.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::identity::PeerId;
use crate::proto::ChannelMessage;

/// Delivery state of a persisted message. `Pending` messages have not yet
/// been acknowledged as sent over an open channel and are replayed whenever
/// the owning session's channel opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    Pending,
    Delivered,
}

/// One chat message as persisted and mirrored in memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub content: String,
    pub sender: PeerId,
    pub timestamp: u64,
    #[serde(default = "default_sub_type")]
    pub sub_type: String,
    #[serde(default = "default_delivery")]
    pub delivery: DeliveryState,
}

fn default_sub_type() -> String {
    "text".to_string()
}

fn default_delivery() -> DeliveryState {
    DeliveryState::Delivered
}

impl Message {
    pub fn text(content: impl Into<String>, sender: PeerId, timestamp: u64) -> Self {
        Message {
            content: content.into(),
            sender,
            timestamp,
            sub_type: default_sub_type(),
            delivery: DeliveryState::Pending,
        }
    }

    /// Idempotent identity of a message: content + timestamp + sender. Replay
    /// of a persisted message is indistinguishable from a true duplicate by
    /// anything finer than this key.
    pub fn replay_key(&self) -> (&str, u64, &PeerId) {
        (&self.content, self.timestamp, &self.sender)
    }

    /// The wire form sent over the primary channel.
    pub fn to_channel_message(&self) -> ChannelMessage {
        ChannelMessage::Chat {
            content: self.content.clone(),
            sender: self.sender.clone(),
            timestamp: self.timestamp,
            sub_type: self.sub_type.clone(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Parse a durable log. Empty, partial or corrupt content yields an empty
/// sequence; errors never cross this boundary.
pub fn decode_history(bytes: &[u8]) -> Vec<Message> {
    if bytes.is_empty() {
        return Vec::new();
    }
    serde_json::from_slice(bytes).unwrap_or_default()
}

pub fn encode_history(history: &[Message]) -> Result<Vec<u8>, StoreError> {
    Ok(serde_json::to_vec(history)?)
}

/// The messages that must be replayed on reconnect, in log order.
pub fn pending(history: &[Message]) -> Vec<Message> {
    history
        .iter()
        .filter(|m| m.delivery == DeliveryState::Pending)
        .cloned()
        .collect()
}

/// Rewrite-as-delivered transform applied after a successful replay.
pub fn mark_all_delivered(history: &mut [Message]) {
    for m in history {
        m.delivery = DeliveryState::Delivered;
    }
}

/// Cached contact metadata learned from profile sync, keyed by identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContactMeta {
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub photo: Option<String>,
    #[serde(default)]
    pub updated_at: u64,
}

pub type ContactCache = HashMap<PeerId, ContactMeta>;

/// Same tolerance rules as [`decode_history`].
pub fn decode_contacts(bytes: &[u8]) -> ContactCache {
    if bytes.is_empty() {
        return ContactCache::new();
    }
    serde_json::from_slice(bytes).unwrap_or_default()
}

pub fn encode_contacts(cache: &ContactCache) -> Result<Vec<u8>, StoreError> {
    Ok(serde_json::to_vec(cache)?)
}

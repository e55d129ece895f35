//! Direct-channel protocol: everything that flows over an established peer
//! channel. Encoding is bincode; framing is length-prefix (see frame module).
//!
//! One primary channel per session carries chat, presence, profile sync and
//! transfer control. Parallel transfer blocks flow over separately labeled
//! sub-channels.

use serde::{Deserialize, Serialize};

use crate::identity::PeerId;

/// Label binding a connection to the session's primary channel.
pub const PRIMARY_LABEL: &str = "primary";

/// Label for parallel transfer sub-channel `index`.
pub fn sub_channel_label(index: u32) -> String {
    format!("cptp_channel_{index}")
}

/// Inverse of [`sub_channel_label`]; `None` for the primary or unknown labels.
pub fn parse_sub_channel_label(label: &str) -> Option<u32> {
    label.strip_prefix("cptp_channel_")?.parse().ok()
}

/// All direct-channel message types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChannelMessage {
    /// Chat payload. `sub_type` distinguishes text from future rich kinds.
    Chat {
        content: String,
        sender: PeerId,
        timestamp: u64,
        sub_type: String,
    },
    /// Periodic liveness + status. Volatile: never persisted.
    Presence {
        activity: String,
        typing: bool,
        timestamp: u64,
    },
    /// Profile sync, sent on channel open unless ghost mode is active.
    Profile {
        peer_id: PeerId,
        name: String,
        pronouns: String,
        photo: Option<String>,
        timestamp: u64,
    },
    /// Announces an incoming parallel transfer before any block is streamed.
    CptpInit {
        transfer_id: [u8; 16],
        total_channels: u32,
        file_size: u64,
        file_name: String,
        hash: [u8; 32],
    },
    /// Receiver accepted; sender may start streaming.
    CptpAccept { transfer_id: [u8; 16] },
    /// Receiver declined; the sender abandons the job.
    CptpReject { transfer_id: [u8; 16] },
    /// One transfer block, sent over the sub-channel owning `part_index`.
    /// The header lets the receiver keep an authoritative part table.
    Block {
        transfer_id: [u8; 16],
        part_index: u32,
        offset: u64,
        data: Vec<u8>,
    },
}

//! Remote-identity presence cache, fed by presence and profile messages on
//! the primary channel and consumed by the UI layer.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::identity::PeerId;

/// Everything known about a remote identity's presence and profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemotePeer {
    pub alias: Option<String>,
    pub pronouns: Option<String>,
    pub photo: Option<String>,
    pub activity: Option<String>,
    pub typing: bool,
    /// Timestamp of the last presence or profile message.
    pub last_seen: u64,
}

#[derive(Debug, Default)]
pub struct PresenceCache {
    peers: HashMap<PeerId, RemotePeer>,
}

impl PresenceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a volatile presence update.
    pub fn apply_presence(&mut self, peer: &PeerId, activity: &str, typing: bool, timestamp: u64) {
        let entry = self.peers.entry(peer.clone()).or_default();
        entry.activity = if activity.is_empty() {
            None
        } else {
            Some(activity.to_string())
        };
        entry.typing = typing;
        entry.last_seen = entry.last_seen.max(timestamp);
    }

    /// Apply a profile sync. Profile fields overwrite; presence fields keep.
    pub fn apply_profile(
        &mut self,
        peer: &PeerId,
        name: &str,
        pronouns: &str,
        photo: Option<&str>,
        timestamp: u64,
    ) {
        let entry = self.peers.entry(peer.clone()).or_default();
        entry.alias = Some(name.to_string());
        entry.pronouns = if pronouns.is_empty() {
            None
        } else {
            Some(pronouns.to_string())
        };
        entry.photo = photo.map(str::to_string);
        entry.last_seen = entry.last_seen.max(timestamp);
    }

    pub fn get(&self, peer: &PeerId) -> Option<&RemotePeer> {
        self.peers.get(peer)
    }

    pub fn remove(&mut self, peer: &PeerId) {
        self.peers.remove(peer);
    }
}

//! Local identity: stable peer ID and the broadcastable profile.

use serde::{Deserialize, Serialize};

/// Stable opaque peer identity. Generated once, persisted by the host, and
/// never reused for two different remote parties.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Generate a fresh identity. The host persists it; subsequent runs load
    /// the stored value instead of calling this again.
    pub fn generate() -> Self {
        PeerId(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        PeerId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId(s.to_string())
    }
}

/// Privacy mode. Ghost mode forbids broadcasting any profile or presence data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Privacy {
    Social,
    Ghost,
}

impl Default for Privacy {
    fn default() -> Self {
        Privacy::Social
    }
}

/// Local profile, supplied by the identity provider at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub alias: String,
    #[serde(default)]
    pub pronouns: String,
    #[serde(default)]
    pub photo: Option<String>,
    #[serde(default)]
    pub privacy: Privacy,
}

impl Profile {
    pub fn new(alias: impl Into<String>) -> Self {
        Profile {
            alias: alias.into(),
            pronouns: String::new(),
            photo: None,
            privacy: Privacy::Social,
        }
    }

    /// Whether presence and profile data may leave this machine.
    pub fn allows_broadcast(&self) -> bool {
        self.privacy == Privacy::Social
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique() {
        let a = PeerId::generate();
        let b = PeerId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn peer_id_serializes_as_plain_string() {
        let id = PeerId::new("mole-7");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"mole-7\"");
        let back: PeerId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn ghost_mode_blocks_broadcast() {
        let mut p = Profile::new("ana");
        assert!(p.allows_broadcast());
        p.privacy = Privacy::Ghost;
        assert!(!p.allows_broadcast());
    }

    #[test]
    fn profile_defaults_fill_missing_fields() {
        let p: Profile = serde_json::from_str(r#"{"alias":"ana"}"#).unwrap();
        assert_eq!(p.privacy, Privacy::Social);
        assert!(p.photo.is_none());
    }
}

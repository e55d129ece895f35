//! Relay wire envelopes: JSON tagged union, appType routing discriminator,
//! hard 16384-byte size ceiling, and the room-protocol signal masquerade
//! applied only at the relay-compatibility boundary.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::identity::PeerId;

/// Hard ceiling for a serialized envelope handed to the relay. Oversize
/// envelopes are dropped locally before send, never truncated.
pub const MAX_ENVELOPE_BYTES: usize = 16384;

/// appType for the direct-identity messenger flow.
pub const APP_TYPE_DIRECT: &str = "cloak-messenger";
/// appType for the room-based flow. The relay for this flow only routes
/// `join` and `signal`, hence the masquerade in [`encode_envelope`].
pub const APP_TYPE_ROOM: &str = "cloaks";

/// Session descriptor carried in offers and answers: where the sender can be
/// reached and a per-negotiation token the transport hello must echo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub addr: String,
    pub token: String,
}

/// Alternative reachability info. Only meaningful inside an existing session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateAddr {
    pub addr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub id: PeerId,
    #[serde(default)]
    pub alias: Option<String>,
}

/// Everything exchanged with the relay. `appType` travels alongside the tag;
/// see [`encode_envelope`] / [`decode_envelope`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Envelope {
    Register {
        peer_id: PeerId,
        alias: String,
    },
    Join {
        room: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
        alias: String,
        peer_id: PeerId,
    },
    Offer {
        target_peer_id: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_peer_id: Option<PeerId>,
        offer: SessionDescriptor,
    },
    Answer {
        target_peer_id: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_peer_id: Option<PeerId>,
        answer: SessionDescriptor,
    },
    Candidate {
        target_peer_id: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_peer_id: Option<PeerId>,
        candidate: CandidateAddr,
    },
    FindPeer {
        target_peer_id: PeerId,
    },
    PeerFound {
        peer_id: PeerId,
    },
    PeerNotFound {
        peer_id: PeerId,
    },
    Ping,
    // Server -> client confirmations.
    Registered {
        peer_id: PeerId,
    },
    Joined {
        your_id: PeerId,
        #[serde(default)]
        peers: Vec<PeerInfo>,
    },
    PeerJoined {
        peer_id: PeerId,
        #[serde(default)]
        alias: Option<String>,
    },
    PeerLeft {
        peer_id: PeerId,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    /// Serialized size exceeded [`MAX_ENVELOPE_BYTES`]. The envelope was
    /// dropped before send; nothing reached the relay.
    #[error("envelope too large: {len} bytes (max {MAX_ENVELOPE_BYTES})")]
    Oversize { len: usize },
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("envelope must be a JSON object")]
    NotAnObject,
}

/// A decoded envelope plus the appType the relay routed it under.
#[derive(Debug, Clone)]
pub struct WireEnvelope {
    pub envelope: Envelope,
    pub app_type: Option<String>,
}

/// Serialize an envelope for the relay. Stamps `appType`; for room appTypes,
/// adds the room to every envelope and masquerades offer/answer/candidate as
/// `signal` with the real kind preserved in `signalType` (the room relay only
/// routes `join` and `signal`). Enforces the size ceiling.
pub fn encode_envelope(
    env: &Envelope,
    app_type: &str,
    room: Option<&str>,
) -> Result<Vec<u8>, EnvelopeError> {
    let mut value = serde_json::to_value(env)?;
    let obj = value.as_object_mut().ok_or(EnvelopeError::NotAnObject)?;
    obj.insert("appType".to_string(), json!(app_type));
    if app_type != APP_TYPE_DIRECT {
        if let Some(room) = room {
            obj.entry("room".to_string()).or_insert_with(|| json!(room));
        }
        let kind = obj.get("type").and_then(|t| t.as_str()).map(str::to_string);
        if let Some(kind) = kind {
            if matches!(kind.as_str(), "offer" | "answer" | "candidate") {
                obj.insert("signalType".to_string(), json!(kind));
                obj.insert("type".to_string(), json!("signal"));
            }
        }
    }
    let bytes = serde_json::to_vec(&value)?;
    if bytes.len() > MAX_ENVELOPE_BYTES {
        return Err(EnvelopeError::Oversize { len: bytes.len() });
    }
    Ok(bytes)
}

/// Parse one envelope off the relay connection, undoing the signal masquerade
/// so the rest of the system only ever sees the proper tagged union.
pub fn decode_envelope(bytes: &[u8]) -> Result<WireEnvelope, EnvelopeError> {
    let mut value: serde_json::Value = serde_json::from_slice(bytes)?;
    let obj = value.as_object_mut().ok_or(EnvelopeError::NotAnObject)?;
    let app_type = obj
        .remove("appType")
        .and_then(|v| v.as_str().map(str::to_string));
    if obj.get("type").and_then(|t| t.as_str()) == Some("signal") {
        if let Some(real) = obj.remove("signalType").and_then(|v| match v {
            serde_json::Value::String(s) => Some(s),
            _ => None,
        }) {
            obj.insert("type".to_string(), json!(real));
        }
    }
    let envelope: Envelope = serde_json::from_value(value)?;
    Ok(WireEnvelope { envelope, app_type })
}

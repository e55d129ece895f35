//! Cloak peer session protocol reference implementation.
//! Sans-I/O: the host passes events and timers in and receives effects out.

pub mod envelope;
pub mod frame;
pub mod identity;
pub mod presence;
pub mod proto;
pub mod session;
pub mod store;
pub mod transfer;

pub use envelope::{decode_envelope, encode_envelope, Envelope, EnvelopeError, MAX_ENVELOPE_BYTES};
pub use frame::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
pub use identity::{PeerId, Privacy, Profile};
pub use proto::ChannelMessage;
pub use session::{Effect, SessionEvent, SessionManager, SessionState};
pub use store::{DeliveryState, Message};
pub use transfer::{ReceiveState, TransferJob};

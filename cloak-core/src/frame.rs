//! Direct-channel framing: 4 bytes LE length + bincode payload.
//!
//! The length cap depends on the channel: transfer sub-channels only ever
//! carry 64KiB blocks and are capped tightly, while the primary channel
//! allows multi-megabyte profile frames (photos).

use crate::proto::ChannelMessage;

const LEN_SIZE: usize = 4;
/// Cap for primary-channel frames. Room for oversized profile photos
/// without letting a peer OOM us.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;
/// Cap for transfer sub-channel frames: one 64KiB block plus its header.
pub const MAX_BLOCK_FRAME_LEN: u32 = 72 * 1024;

/// Encode a channel message into a single frame.
pub fn encode_frame(msg: &ChannelMessage) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(msg).map_err(FrameEncodeError::Encode)?;
    let len = payload.len() as u32;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`, rejecting declared lengths
/// past `max_len` (the reader picks the cap from the channel label).
/// Returns the message and the number of bytes consumed. Safe to call with
/// a partial buffer; `NeedMore` means try again after more data arrives.
pub fn decode_frame(
    bytes: &[u8],
    max_len: u32,
) -> Result<(ChannelMessage, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len > max_len as usize {
        return Err(FrameDecodeError::TooLarge);
    }
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let msg: ChannelMessage =
        bincode::deserialize(&bytes[LEN_SIZE..LEN_SIZE + len]).map_err(FrameDecodeError::Decode)?;
    Ok((msg, LEN_SIZE + len))
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PeerId;

    fn sample_chat() -> ChannelMessage {
        ChannelMessage::Chat {
            content: "hola".to_string(),
            sender: PeerId::new("a"),
            timestamp: 1_700_000_000_000,
            sub_type: "text".to_string(),
        }
    }

    #[test]
    fn roundtrip_chat() {
        let msg = sample_chat();
        let frame = encode_frame(&msg).unwrap();
        let (decoded, n) = decode_frame(&frame, MAX_FRAME_LEN).unwrap();
        assert_eq!(n, frame.len());
        assert_eq!(decoded, msg);
    }

    #[test]
    fn partial_read_need_more() {
        let frame = encode_frame(&sample_chat()).unwrap();
        assert!(matches!(
            decode_frame(&frame[..2], MAX_FRAME_LEN),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&frame[..LEN_SIZE], MAX_FRAME_LEN),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn two_frames_back_to_back() {
        let a = sample_chat();
        let b = ChannelMessage::Presence {
            activity: String::new(),
            typing: true,
            timestamp: 7,
        };
        let fa = encode_frame(&a).unwrap();
        let fb = encode_frame(&b).unwrap();
        let mut buf = Vec::new();
        buf.extend_from_slice(&fa);
        buf.extend_from_slice(&fb);
        let (m1, n1) = decode_frame(&buf, MAX_FRAME_LEN).unwrap();
        let (m2, n2) = decode_frame(&buf[n1..], MAX_FRAME_LEN).unwrap();
        assert_eq!(n1, fa.len());
        assert_eq!(n2, fb.len());
        assert_eq!(m1, a);
        assert_eq!(m2, b);
    }

    #[test]
    fn full_block_fits_under_the_sub_channel_cap() {
        let msg = ChannelMessage::Block {
            transfer_id: [9u8; 16],
            part_index: 3,
            offset: 1 << 20,
            data: vec![0xAB; 64 * 1024],
        };
        let frame = encode_frame(&msg).unwrap();
        let (decoded, _) = decode_frame(&frame, MAX_BLOCK_FRAME_LEN).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn sub_channel_cap_rejects_primary_sized_frames() {
        // A photo-bearing profile frame decodes on the primary channel but
        // must be rejected on a block sub-channel.
        let msg = ChannelMessage::Profile {
            peer_id: PeerId::new("a"),
            name: "Ana".to_string(),
            pronouns: String::new(),
            photo: Some("p".repeat(200 * 1024)),
            timestamp: 1,
        };
        let frame = encode_frame(&msg).unwrap();
        assert!(decode_frame(&frame, MAX_FRAME_LEN).is_ok());
        assert!(matches!(
            decode_frame(&frame, MAX_BLOCK_FRAME_LEN),
            Err(FrameDecodeError::TooLarge)
        ));
    }

    #[test]
    fn declared_length_past_cap_rejected() {
        let mut buf = (MAX_FRAME_LEN + 1).to_le_bytes().to_vec();
        buf.extend_from_slice(&[0u8; 8]);
        assert!(matches!(
            decode_frame(&buf, MAX_FRAME_LEN),
            Err(FrameDecodeError::TooLarge)
        ));
    }
}

//! Parallel transfer engine (CPTP): split one large object into contiguous
//! per-channel ranges, plan fixed-size blocks under a per-channel
//! high-watermark, and reconcile parts on the receiving side.
//!
//! The receiver keeps an authoritative per-part table keyed by the block
//! headers. The transport below each sub-channel is ordered and reliable, so
//! within a part the only legal next offset is the end of what has already
//! arrived; anything else is reported instead of silently absorbed.

use serde::{Deserialize, Serialize};

use crate::proto::ChannelMessage;

/// Default number of parallel sub-channels.
pub const DEFAULT_CHANNELS: u32 = 16;
/// Fixed block size streamed on each sub-channel.
pub const BLOCK_SIZE: u64 = 64 * 1024;
/// Per-channel outstanding-bytes high watermark. A channel above this must
/// not enqueue another block until it drains back under.
pub const HIGH_WATERMARK: u64 = 4 * 1024 * 1024;
/// Backpressure retry delay in milliseconds.
pub const RETRY_DELAY_MS: u64 = 10;

/// One contiguous slice of the object, owned by a single sub-channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartRange {
    pub index: u32,
    pub start: u64,
    pub end: u64,
}

impl PartRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Partition `[0, size)` into exactly `channels` contiguous, non-overlapping
/// ranges: part `i` covers `[i*ceil(size/n), min((i+1)*ceil(size/n), size))`,
/// clamped so trailing parts of a small object come out empty.
pub fn split_parts(size: u64, channels: u32) -> Vec<PartRange> {
    let n = if channels == 0 { DEFAULT_CHANNELS } else { channels } as u64;
    let part_size = size.div_ceil(n);
    (0..n as u32)
        .map(|i| {
            let start = (i as u64 * part_size).min(size);
            let end = ((i as u64 + 1) * part_size).min(size);
            PartRange { index: i, start, end }
        })
        .collect()
}

/// Whether a sub-channel may enqueue another block given its outstanding
/// unsent byte count.
pub fn may_enqueue(buffered: u64) -> bool {
    buffered <= HIGH_WATERMARK
}

/// Sender-side progress for one part.
#[derive(Debug, Clone)]
pub struct PartProgress {
    pub range: PartRange,
    pub bytes_sent: u64,
}

impl PartProgress {
    pub fn new(range: PartRange) -> Self {
        PartProgress {
            range,
            bytes_sent: 0,
        }
    }

    /// Next block to stream: `(offset, len)`, or `None` once the range is
    /// exhausted. The final block is clamped to the range end.
    pub fn next_block(&self) -> Option<(u64, u64)> {
        let offset = self.range.start + self.bytes_sent;
        if offset >= self.range.end {
            return None;
        }
        let len = BLOCK_SIZE.min(self.range.end - offset);
        Some((offset, len))
    }

    pub fn mark_sent(&mut self, len: u64) {
        self.bytes_sent += len;
    }

    pub fn done(&self) -> bool {
        self.bytes_sent >= self.range.len()
    }
}

/// One outbound large-object transfer, owned exclusively by the sending side.
#[derive(Debug, Clone)]
pub struct TransferJob {
    pub transfer_id: [u8; 16],
    pub file_name: String,
    pub object_size: u64,
    pub hash: [u8; 32],
    pub parts: Vec<PartProgress>,
}

impl TransferJob {
    pub fn new(file_name: impl Into<String>, object_size: u64, hash: [u8; 32]) -> Self {
        let transfer_id: [u8; 16] = uuid::Uuid::new_v4().into_bytes();
        let parts = split_parts(object_size, DEFAULT_CHANNELS)
            .into_iter()
            .map(PartProgress::new)
            .collect();
        TransferJob {
            transfer_id,
            file_name: file_name.into(),
            object_size,
            hash,
            parts,
        }
    }

    /// The metadata message sent over the primary channel before streaming.
    pub fn init_message(&self) -> ChannelMessage {
        ChannelMessage::CptpInit {
            transfer_id: self.transfer_id,
            total_channels: self.parts.len() as u32,
            file_size: self.object_size,
            file_name: self.file_name.clone(),
            hash: self.hash,
        }
    }

    pub fn complete(&self) -> bool {
        self.parts.iter().all(PartProgress::done)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TransferError {
    #[error("unknown transfer")]
    UnknownTransfer,
    #[error("part index {0} out of range")]
    UnknownPart(u32),
    #[error("part {part}: expected offset {expected}, got {got}")]
    OffsetMismatch { part: u32, expected: u64, got: u64 },
    #[error("part {part}: block overruns range end {end}")]
    Overrun { part: u32, end: u64 },
}

/// Receiver-side bookkeeping: the part table plus aggregate byte count.
#[derive(Debug)]
pub struct ReceiveState {
    pub transfer_id: [u8; 16],
    pub file_name: String,
    pub file_size: u64,
    pub hash: [u8; 32],
    parts: Vec<PartRange>,
    /// Bytes received per part, contiguous from the part start.
    covered: Vec<u64>,
    total_received: u64,
}

impl ReceiveState {
    pub fn new(
        transfer_id: [u8; 16],
        file_name: impl Into<String>,
        file_size: u64,
        total_channels: u32,
        hash: [u8; 32],
    ) -> Self {
        let parts = split_parts(file_size, total_channels);
        let covered = vec![0u64; parts.len()];
        ReceiveState {
            transfer_id,
            file_name: file_name.into(),
            file_size,
            hash,
            parts,
            covered,
            total_received: 0,
        }
    }

    /// Account for one block. The caller writes the payload at `offset`;
    /// this validates the header against the part table first.
    pub fn on_block(&mut self, part_index: u32, offset: u64, len: u64) -> Result<(), TransferError> {
        let part = self
            .parts
            .get(part_index as usize)
            .copied()
            .ok_or(TransferError::UnknownPart(part_index))?;
        let expected = part.start + self.covered[part_index as usize];
        if offset != expected {
            return Err(TransferError::OffsetMismatch {
                part: part_index,
                expected,
                got: offset,
            });
        }
        if offset + len > part.end {
            return Err(TransferError::Overrun {
                part: part_index,
                end: part.end,
            });
        }
        self.covered[part_index as usize] += len;
        self.total_received += len;
        Ok(())
    }

    pub fn bytes_received(&self) -> u64 {
        self.total_received
    }

    /// Whether one part's range is fully covered. Parts stream one
    /// sub-channel each, so a part left short when its channel dies can
    /// never finish. Indexes past the table owe nothing.
    pub fn part_complete(&self, index: u32) -> bool {
        match self.parts.get(index as usize) {
            Some(part) => self.covered[index as usize] >= part.len(),
            None => true,
        }
    }

    /// Complete only when every part is fully covered, which also forces the
    /// aggregate to equal the announced size.
    pub fn is_complete(&self) -> bool {
        self.parts
            .iter()
            .zip(&self.covered)
            .all(|(p, &c)| c == p.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Partition law: exactly N contiguous, non-overlapping, union-complete
    /// ranges for any S >= 0.
    fn assert_partition(size: u64) {
        let parts = split_parts(size, DEFAULT_CHANNELS);
        assert_eq!(parts.len(), DEFAULT_CHANNELS as usize);
        let mut cursor = 0u64;
        for (i, p) in parts.iter().enumerate() {
            assert_eq!(p.index, i as u32);
            assert_eq!(p.start, cursor, "size={size} part={i}");
            assert!(p.end >= p.start);
            cursor = p.end;
        }
        assert_eq!(cursor, size);
    }

    #[test]
    fn partition_holds_across_sizes() {
        for size in [
            0,
            1,
            15,
            16,
            17,
            BLOCK_SIZE - 1,
            BLOCK_SIZE * 16,
            BLOCK_SIZE * 16 + 5,
            1_500_000_000,
        ] {
            assert_partition(size);
        }
    }

    #[test]
    fn small_object_leaves_trailing_parts_empty() {
        let parts = split_parts(10, 16);
        // ceil(10/16) = 1, so parts 0..10 get one byte each.
        assert_eq!(parts[0], PartRange { index: 0, start: 0, end: 1 });
        assert_eq!(parts[9].end, 10);
        assert!(parts[10].is_empty());
        assert!(parts[15].is_empty());
    }

    #[test]
    fn part_size_is_ceil_of_size_over_channels() {
        let parts = split_parts(100, 16);
        // ceil(100/16) = 7.
        assert_eq!(parts[0].len(), 7);
        assert_eq!(parts[14].end, 100);
        assert!(parts[15].is_empty());
    }

    #[test]
    fn block_planning_covers_range_exactly() {
        let range = PartRange {
            index: 0,
            start: 1000,
            end: 1000 + BLOCK_SIZE * 2 + 100,
        };
        let mut part = PartProgress::new(range);
        let mut total = 0u64;
        while let Some((offset, len)) = part.next_block() {
            assert_eq!(offset, range.start + total);
            part.mark_sent(len);
            total += len;
        }
        assert_eq!(total, range.len());
        assert!(part.done());
        // Last block was the 100-byte remainder.
        assert_eq!(total % BLOCK_SIZE, 100);
    }

    #[test]
    fn empty_part_has_no_blocks() {
        let part = PartProgress::new(PartRange { index: 5, start: 7, end: 7 });
        assert!(part.next_block().is_none());
        assert!(part.done());
    }

    #[test]
    fn part_completion_tracks_coverage() {
        let mut st = ReceiveState::new([1u8; 16], "f.bin", BLOCK_SIZE * 2, 2, [0u8; 32]);
        assert!(!st.part_complete(0));
        st.on_block(0, 0, BLOCK_SIZE).unwrap();
        assert!(st.part_complete(0));
        assert!(!st.part_complete(1));
        assert!(st.part_complete(99));
    }

    #[test]
    fn watermark_boundary() {
        assert!(may_enqueue(0));
        assert!(may_enqueue(HIGH_WATERMARK));
        assert!(!may_enqueue(HIGH_WATERMARK + 1));
    }

    #[test]
    fn job_completes_when_all_parts_sent() {
        let mut job = TransferJob::new("big.bin", BLOCK_SIZE * 20, [0u8; 32]);
        assert!(!job.complete());
        for part in &mut job.parts {
            while let Some((_, len)) = part.next_block() {
                part.mark_sent(len);
            }
        }
        assert!(job.complete());
    }

    #[test]
    fn init_message_announces_geometry() {
        let job = TransferJob::new("big.bin", 12345, [7u8; 32]);
        match job.init_message() {
            ChannelMessage::CptpInit {
                total_channels,
                file_size,
                file_name,
                ..
            } => {
                assert_eq!(total_channels, DEFAULT_CHANNELS);
                assert_eq!(file_size, 12345);
                assert_eq!(file_name, "big.bin");
            }
            other => panic!("expected CptpInit, got {other:?}"),
        }
    }

    fn drive_receive(size: u64) -> ReceiveState {
        let mut rx = ReceiveState::new([1u8; 16], "f", size, DEFAULT_CHANNELS, [0u8; 32]);
        for part in split_parts(size, DEFAULT_CHANNELS) {
            let mut progress = PartProgress::new(part);
            while let Some((offset, len)) = progress.next_block() {
                rx.on_block(part.index, offset, len).unwrap();
                progress.mark_sent(len);
            }
        }
        rx
    }

    #[test]
    fn receiver_completes_on_full_coverage() {
        let size = BLOCK_SIZE * 16 + 777;
        let rx = drive_receive(size);
        assert!(rx.is_complete());
        assert_eq!(rx.bytes_received(), size);
    }

    #[test]
    fn receiver_zero_size_is_immediately_complete() {
        let rx = ReceiveState::new([1u8; 16], "f", 0, DEFAULT_CHANNELS, [0u8; 32]);
        assert!(rx.is_complete());
    }

    #[test]
    fn receiver_rejects_offset_gap() {
        let size = BLOCK_SIZE * 32;
        let mut rx = ReceiveState::new([1u8; 16], "f", size, DEFAULT_CHANNELS, [0u8; 32]);
        let parts = split_parts(size, DEFAULT_CHANNELS);
        // Skip the first block of part 0.
        let err = rx
            .on_block(0, parts[0].start + BLOCK_SIZE, BLOCK_SIZE)
            .unwrap_err();
        assert_eq!(
            err,
            TransferError::OffsetMismatch {
                part: 0,
                expected: parts[0].start,
                got: parts[0].start + BLOCK_SIZE,
            }
        );
    }

    #[test]
    fn receiver_rejects_overrun_and_unknown_part() {
        let mut rx = ReceiveState::new([1u8; 16], "f", 100, 16, [0u8; 32]);
        assert_eq!(
            rx.on_block(99, 0, 1).unwrap_err(),
            TransferError::UnknownPart(99)
        );
        // Part 0 covers [0, 7); a 10-byte block overruns it.
        assert_eq!(
            rx.on_block(0, 0, 10).unwrap_err(),
            TransferError::Overrun { part: 0, end: 7 }
        );
    }

    #[test]
    fn incomplete_until_every_part_arrives() {
        let size = BLOCK_SIZE * 16;
        let mut rx = ReceiveState::new([1u8; 16], "f", size, DEFAULT_CHANNELS, [0u8; 32]);
        let parts = split_parts(size, DEFAULT_CHANNELS);
        // All parts except the last.
        for part in &parts[..15] {
            rx.on_block(part.index, part.start, part.len()).unwrap();
        }
        assert!(!rx.is_complete());
        rx.on_block(15, parts[15].start, parts[15].len()).unwrap();
        assert!(rx.is_complete());
    }
}

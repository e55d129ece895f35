//! Parallel transfer driver: streams one large object over the labeled
//! sub-channels, one contiguous part per channel.
//!
//! The sender opens one file handle per part and reads sequentially within
//! its range, pausing whenever the channel's outstanding bytes sit above the
//! high watermark. The receiver preallocates the full file and writes each
//! validated block at its announced offset, then verifies the whole-object
//! hash at the end.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use cloak_core::transfer::{may_enqueue, PartProgress, ReceiveState, RETRY_DELAY_MS};
use cloak_core::TransferJob;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::time::Duration;
use tracing::debug;

use crate::store::sanitize;
use crate::transport::ChannelHandle;

#[derive(Debug, thiserror::Error)]
pub enum CptpError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Transfer(#[from] cloak_core::transfer::TransferError),
    #[error("object hash mismatch")]
    HashMismatch,
    #[error("sub-channel closed mid-transfer")]
    ChannelClosed,
}

/// Hash and size an object before announcing it.
pub async fn hash_object(path: &Path) -> anyhow::Result<([u8; 32], u64)> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut size = 0u64;
    let mut buf = vec![0u8; 256 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((hasher.finalize().into(), size))
}

/// Stream every part of `job` concurrently. `channels` is index-aligned with
/// the job's parts; empty parts need no channel and their slot is skipped.
pub async fn run_sender(
    job: TransferJob,
    path: PathBuf,
    channels: Vec<ChannelHandle>,
) -> Result<(), CptpError> {
    let mut tasks = Vec::new();
    for (progress, handle) in job.parts.into_iter().zip(channels) {
        if progress.range.is_empty() {
            continue;
        }
        let path = path.clone();
        let transfer_id = job.transfer_id;
        tasks.push(tokio::spawn(stream_part(
            transfer_id,
            progress,
            path,
            handle,
        )));
    }
    for task in tasks {
        task.await.map_err(|_| CptpError::ChannelClosed)??;
    }
    debug!(transfer = %uuid::Uuid::from_bytes(job.transfer_id), "all parts streamed");
    Ok(())
}

async fn stream_part(
    transfer_id: [u8; 16],
    mut progress: PartProgress,
    path: PathBuf,
    handle: ChannelHandle,
) -> Result<(), CptpError> {
    let mut file = tokio::fs::File::open(&path).await?;
    file.seek(std::io::SeekFrom::Start(progress.range.start))
        .await?;
    while let Some((offset, len)) = progress.next_block() {
        while !may_enqueue(handle.buffered_amount()) {
            tokio::time::sleep(Duration::from_millis(RETRY_DELAY_MS)).await;
        }
        let mut data = vec![0u8; len as usize];
        file.read_exact(&mut data).await?;
        handle
            .send(&cloak_core::ChannelMessage::Block {
                transfer_id,
                part_index: progress.range.index,
                offset,
                data,
            })
            .map_err(|_| CptpError::ChannelClosed)?;
        progress.mark_sent(len);
    }
    Ok(())
}

/// Receiver side of one announced transfer: preallocated output file plus
/// the part table.
pub struct IncomingTransfer {
    state: ReceiveState,
    file: Arc<std::fs::File>,
    path: PathBuf,
}

impl IncomingTransfer {
    /// Create the output file under `dir`, sized up front so every part can
    /// write at its own offset.
    pub fn create(dir: &Path, state: ReceiveState) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(sanitize(&state.file_name));
        let file = std::fs::File::create(&path)?;
        file.set_len(state.file_size)?;
        Ok(IncomingTransfer {
            state,
            file: Arc::new(file),
            path,
        })
    }

    pub fn transfer_id(&self) -> [u8; 16] {
        self.state.transfer_id
    }

    pub fn bytes_received(&self) -> u64 {
        self.state.bytes_received()
    }

    pub fn part_complete(&self, index: u32) -> bool {
        self.state.part_complete(index)
    }

    /// Remove the preallocated file of a transfer that can no longer finish.
    pub fn discard(self) -> std::io::Result<()> {
        drop(self.file);
        std::fs::remove_file(&self.path)
    }

    /// Validate and persist one block. Returns true once the object is fully
    /// covered.
    pub fn on_block(&mut self, part_index: u32, offset: u64, data: &[u8]) -> Result<bool, CptpError> {
        self.state.on_block(part_index, offset, data.len() as u64)?;
        write_at(&self.file, data, offset)?;
        Ok(self.state.is_complete())
    }

    /// Verify the whole-object hash and hand back the final path.
    pub fn finalize(self) -> Result<PathBuf, CptpError> {
        let file = self.file;
        drop(file);
        let mut reader = std::fs::File::open(&self.path)?;
        let mut hasher = Sha256::new();
        std::io::copy(&mut reader, &mut hasher)?;
        let digest: [u8; 32] = hasher.finalize().into();
        if digest != self.state.hash {
            return Err(CptpError::HashMismatch);
        }
        Ok(self.path)
    }
}

#[cfg(unix)]
fn write_at(file: &std::fs::File, data: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(data, offset)
}

#[cfg(windows)]
fn write_at(file: &std::fs::File, data: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut written = 0usize;
    while written < data.len() {
        written += file.seek_write(&data[written..], offset + written as u64)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloak_core::transfer::{split_parts, BLOCK_SIZE, DEFAULT_CHANNELS};

    fn digest(bytes: &[u8]) -> [u8; 32] {
        let mut h = Sha256::new();
        h.update(bytes);
        h.finalize().into()
    }

    #[tokio::test]
    async fn hash_object_matches_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("obj.bin");
        let body = vec![0x5Au8; 100_000];
        tokio::fs::write(&path, &body).await.unwrap();
        let (hash, size) = hash_object(&path).await.unwrap();
        assert_eq!(size, 100_000);
        assert_eq!(hash, digest(&body));
    }

    #[test]
    fn receiver_reassembles_out_of_part_order() {
        let dir = tempfile::tempdir().unwrap();
        let size = BLOCK_SIZE * 16 + 123;
        let body: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        let state = ReceiveState::new([2u8; 16], "big.bin", size, DEFAULT_CHANNELS, digest(&body));
        let mut rx = IncomingTransfer::create(dir.path(), state).unwrap();

        // Feed parts in reverse order; blocks within a part stay in order.
        let parts = split_parts(size, DEFAULT_CHANNELS);
        let mut complete = false;
        for part in parts.iter().rev() {
            let mut progress = PartProgress::new(*part);
            while let Some((offset, len)) = progress.next_block() {
                let data = &body[offset as usize..(offset + len) as usize];
                complete = rx.on_block(part.index, offset, data).unwrap();
                progress.mark_sent(len);
            }
        }
        assert!(complete);
        let path = rx.finalize().unwrap();
        assert_eq!(std::fs::read(path).unwrap(), body);
    }

    #[test]
    fn finalize_detects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let body = vec![7u8; 1000];
        // Announce a hash that does not match the body.
        let state = ReceiveState::new([3u8; 16], "f.bin", 1000, DEFAULT_CHANNELS, [0u8; 32]);
        let mut rx = IncomingTransfer::create(dir.path(), state).unwrap();
        for part in split_parts(1000, DEFAULT_CHANNELS) {
            if part.is_empty() {
                continue;
            }
            let data = &body[part.start as usize..part.end as usize];
            rx.on_block(part.index, part.start, data).unwrap();
        }
        assert!(matches!(rx.finalize(), Err(CptpError::HashMismatch)));
    }

    #[test]
    fn announced_file_name_cannot_escape_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let state = ReceiveState::new([4u8; 16], "../../evil", 10, DEFAULT_CHANNELS, [0u8; 32]);
        let rx = IncomingTransfer::create(dir.path(), state).unwrap();
        assert!(rx.path.starts_with(dir.path()));
        assert_eq!(rx.path.file_name().unwrap(), "______evil");
    }

    #[tokio::test]
    async fn stalled_sub_channel_stops_enqueuing_at_the_watermark() {
        use cloak_core::identity::PeerId;
        use cloak_core::transfer::{PartRange, HIGH_WATERMARK};
        use tokio::io::{AsyncBufReadExt, BufReader};
        use tokio::sync::mpsc;

        let dir = tempfile::tempdir().unwrap();
        // Far more than the watermark plus anything the kernel can buffer.
        let size = 32 * 1024 * 1024u64;
        let path = dir.path().join("slow.bin");
        std::fs::write(&path, vec![0x11u8; size as usize]).unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (tx, _rx) = mpsc::unbounded_channel();
        let client = crate::transport::Transport::new(PeerId::new("tx"), tx);
        let handle = client
            .dial(PeerId::new("rx"), &addr, "tok", "cptp_channel_0")
            .await
            .unwrap();

        // Consume the hello line, then stall without reading.
        let (sock, _) = listener.accept().await.unwrap();
        let mut reader = BufReader::new(sock);
        let mut hello = String::new();
        reader.read_line(&mut hello).await.unwrap();

        let range = PartRange { index: 0, start: 0, end: size };
        let sender = tokio::spawn(stream_part(
            [5u8; 16],
            PartProgress::new(range),
            path,
            handle.clone(),
        ));

        // The stalled consumer forces the outstanding count over the
        // watermark once the socket buffers fill.
        let mut stalled = false;
        for _ in 0..2000 {
            if handle.buffered_amount() > HIGH_WATERMARK {
                stalled = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(stalled, "sender never outpaced the stalled consumer");

        // Above the watermark the sender must stop enqueuing: one block in
        // flight past the threshold check, plus frame overhead, is the
        // ceiling.
        let ceiling = HIGH_WATERMARK + BLOCK_SIZE + 1024;
        for _ in 0..50 {
            assert!(handle.buffered_amount() <= ceiling);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // Resume the consumer; the sender finishes the part.
        let drain = tokio::spawn(async move {
            let mut buf = vec![0u8; 256 * 1024];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        });
        sender.await.unwrap().unwrap();
        drop(handle);
        drain.await.unwrap();
    }

    #[tokio::test]
    async fn sender_streams_every_part_over_its_channel() {
        use crate::transport::TransportEvent;
        use cloak_core::identity::PeerId;
        use tokio::sync::mpsc;

        let dir = tempfile::tempdir().unwrap();
        let size = BLOCK_SIZE * 4 + 77;
        let body: Vec<u8> = (0..size).map(|i| (i % 149) as u8).collect();
        let path = dir.path().join("send.bin");
        std::fs::write(&path, &body).unwrap();

        let (hash, got_size) = hash_object(&path).await.unwrap();
        assert_eq!(got_size, size);
        let job = TransferJob::new("send.bin", size, hash);
        let transfer_id = job.transfer_id;

        // Wire each part to a loopback connection and collect the receiver's
        // view through the part table.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (srv_tx, mut srv_rx) = mpsc::unbounded_channel();
        let server = crate::transport::Transport::new(PeerId::new("rx"), srv_tx);
        server.expect("tok".to_string(), PeerId::new("tx")).await;
        tokio::spawn(async move { server.run_listener(listener).await });

        let (cli_tx, _cli_rx) = mpsc::unbounded_channel();
        let client = crate::transport::Transport::new(PeerId::new("tx"), cli_tx);
        let mut channels = Vec::new();
        for i in 0..job.parts.len() {
            let handle = client
                .dial(
                    PeerId::new("rx"),
                    &addr,
                    "tok",
                    &cloak_core::proto::sub_channel_label(i as u32),
                )
                .await
                .unwrap();
            channels.push(handle);
        }

        run_sender(job, path, channels).await.unwrap();

        let state = ReceiveState::new(transfer_id, "recv.bin", size, DEFAULT_CHANNELS, hash);
        let out = dir.path().join("out");
        let mut rx = IncomingTransfer::create(&out, state).unwrap();
        let mut complete = false;
        while !complete {
            match srv_rx.recv().await.unwrap() {
                TransportEvent::Frame {
                    message:
                        cloak_core::ChannelMessage::Block {
                            part_index,
                            offset,
                            data,
                            ..
                        },
                    ..
                } => {
                    complete = rx.on_block(part_index, offset, &data).unwrap();
                }
                TransportEvent::ChannelUp { .. } | TransportEvent::ChannelDown { .. } => {}
                other => panic!("unexpected event {other:?}"),
            }
        }
        let final_path = rx.finalize().unwrap();
        assert_eq!(std::fs::read(final_path).unwrap(), body);
    }
}

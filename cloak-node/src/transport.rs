//! Direct peer transport: TCP listener and dialer for the primary channel
//! and the labeled parallel-transfer sub-channels.
//!
//! Every connection starts with one JSON hello line `{peerId, token, label}`.
//! The token must have been registered via `expect` (the session manager's
//! eager channel open); unknown tokens are dropped at accept. After the
//! hello, traffic is length-prefixed bincode frames.
//!
//! Each channel tracks its outstanding unsent byte count; the transfer
//! engine polls it as the backpressure signal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cloak_core::frame::{
    decode_frame, encode_frame, FrameEncodeError, MAX_BLOCK_FRAME_LEN, MAX_FRAME_LEN,
};
use cloak_core::identity::PeerId;
use cloak_core::proto::{ChannelMessage, PRIMARY_LABEL};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{
    tcp::{OwnedReadHalf, OwnedWriteHalf},
    TcpListener, TcpStream,
};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// First line on every direct connection.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelHello {
    peer_id: PeerId,
    token: String,
    label: String,
}

#[derive(Debug)]
pub enum TransportEvent {
    ChannelUp {
        peer: PeerId,
        label: String,
        handle: ChannelHandle,
    },
    ChannelDown {
        peer: PeerId,
        label: String,
    },
    Frame {
        peer: PeerId,
        label: String,
        message: ChannelMessage,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error("channel closed")]
    Closed,
}

/// Sending side of one channel. Cloneable; the writer task lives as long as
/// the connection.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    buffered: Arc<AtomicU64>,
}

impl ChannelHandle {
    pub fn send(&self, msg: &ChannelMessage) -> Result<(), TransportError> {
        let frame = encode_frame(msg)?;
        self.buffered.fetch_add(frame.len() as u64, Ordering::Relaxed);
        self.tx.send(frame).map_err(|_| TransportError::Closed)
    }

    /// Bytes enqueued but not yet handed to the socket. The transfer
    /// engine's high-watermark check reads this.
    pub fn buffered_amount(&self) -> u64 {
        self.buffered.load(Ordering::Relaxed)
    }
}

#[derive(Clone)]
pub struct Transport {
    local_id: PeerId,
    /// Tokens the session layer is willing to accept inbound channels for.
    expected: Arc<Mutex<HashMap<String, PeerId>>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl Transport {
    pub fn new(local_id: PeerId, events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Transport {
            local_id,
            expected: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    /// Register `token` so inbound hellos naming it bind to `peer`.
    pub async fn expect(&self, token: String, peer: PeerId) {
        self.expected.lock().await.insert(token, peer);
    }

    /// Drop a token when its session dies.
    pub async fn forget(&self, token: &str) {
        self.expected.lock().await.remove(token);
    }

    /// Accept loop. Runs until the listener errors.
    pub async fn run_listener(&self, listener: TcpListener) {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(x) => x,
                Err(e) => {
                    warn!(error = %e, "transport accept failed");
                    break;
                }
            };
            debug!(%addr, "inbound transport connection");
            let expected = self.expected.clone();
            let events = self.events.clone();
            tokio::spawn(async move {
                if let Err(e) = accept_channel(stream, expected, events).await {
                    debug!(error = %e, "inbound channel rejected");
                }
            });
        }
    }

    /// Open a channel toward `addr`, presenting `token` and `label`. The
    /// returned handle is live immediately; the listener side binds after
    /// validating the hello.
    pub async fn dial(
        &self,
        peer: PeerId,
        addr: &str,
        token: &str,
        label: &str,
    ) -> Result<ChannelHandle, TransportError> {
        let mut stream = TcpStream::connect(addr).await?;
        let hello = ChannelHello {
            peer_id: self.local_id.clone(),
            token: token.to_string(),
            label: label.to_string(),
        };
        let mut line = serde_json::to_vec(&hello).map_err(std::io::Error::other)?;
        line.push(b'\n');
        stream.write_all(&line).await?;
        Ok(spawn_channel(
            stream,
            peer,
            label.to_string(),
            self.events.clone(),
        ))
    }
}

async fn accept_channel(
    stream: TcpStream,
    expected: Arc<Mutex<HashMap<String, PeerId>>>,
    events: mpsc::UnboundedSender<TransportEvent>,
) -> Result<(), TransportError> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    let hello: ChannelHello =
        serde_json::from_str(line.trim_end()).map_err(std::io::Error::other)?;

    let bound = expected.lock().await.get(&hello.token).cloned();
    let peer = match bound {
        Some(p) if p == hello.peer_id => p,
        Some(_) | None => {
            debug!(token = %hello.token, "unknown or mismatched channel token");
            return Err(TransportError::Closed);
        }
    };
    // BufReader may have buffered bytes past the hello; keep it for reads.
    let _ = spawn_channel_buffered(reader, peer, hello.label, events);
    Ok(())
}

fn spawn_channel(
    stream: TcpStream,
    peer: PeerId,
    label: String,
    events: mpsc::UnboundedSender<TransportEvent>,
) -> ChannelHandle {
    let (read_half, write_half) = stream.into_split();
    start_channel_tasks(ReadSide::Plain(read_half), write_half, peer, label, events)
}

fn spawn_channel_buffered(
    reader: BufReader<TcpStream>,
    peer: PeerId,
    label: String,
    events: mpsc::UnboundedSender<TransportEvent>,
) -> ChannelHandle {
    // Splitting after the hello: hand the buffered reader's inner stream
    // halves to the channel tasks, preserving any already-buffered bytes.
    let buffered: Vec<u8> = reader.buffer().to_vec();
    let stream = reader.into_inner();
    let (read_half, write_half) = stream.into_split();
    start_channel_tasks(
        ReadSide::WithPrefix(buffered, read_half),
        write_half,
        peer,
        label,
        events,
    )
}

enum ReadSide {
    Plain(OwnedReadHalf),
    WithPrefix(Vec<u8>, OwnedReadHalf),
}

fn start_channel_tasks(
    read: ReadSide,
    mut write_half: OwnedWriteHalf,
    peer: PeerId,
    label: String,
    events: mpsc::UnboundedSender<TransportEvent>,
) -> ChannelHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let buffered = Arc::new(AtomicU64::new(0));

    let writer_buffered = buffered.clone();
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let len = frame.len() as u64;
            let ok = write_half.write_all(&frame).await.is_ok();
            writer_buffered.fetch_sub(len, Ordering::Relaxed);
            if !ok {
                break;
            }
        }
    });

    let handle = ChannelHandle { tx, buffered };
    let _ = events.send(TransportEvent::ChannelUp {
        peer: peer.clone(),
        label: label.clone(),
        handle: handle.clone(),
    });

    // Sub-channels only carry transfer blocks and get the tight frame cap.
    let max_frame_len = if label == PRIMARY_LABEL {
        MAX_FRAME_LEN
    } else {
        MAX_BLOCK_FRAME_LEN
    };
    tokio::spawn(async move {
        let (prefix, mut read_half) = match read {
            ReadSide::Plain(r) => (Vec::new(), r),
            ReadSide::WithPrefix(p, r) => (p, r),
        };
        let mut pending = prefix;
        loop {
            // Drain every complete frame already buffered.
            loop {
                match decode_frame(&pending, max_frame_len) {
                    Ok((message, consumed)) => {
                        pending.drain(..consumed);
                        if events
                            .send(TransportEvent::Frame {
                                peer: peer.clone(),
                                label: label.clone(),
                                message,
                            })
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(cloak_core::frame::FrameDecodeError::NeedMore) => break,
                    Err(e) => {
                        debug!(error = %e, "direct channel framing error");
                        let _ = events.send(TransportEvent::ChannelDown { peer, label });
                        return;
                    }
                }
            }
            let mut buf = [0u8; 64 * 1024];
            match read_half.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if pending.len() + n > max_frame_len as usize + 4 {
                        debug!("direct channel read buffer overflow");
                        break;
                    }
                    pending.extend_from_slice(&buf[..n]);
                }
            }
        }
        let _ = events.send(TransportEvent::ChannelDown { peer, label });
    });
    handle
}

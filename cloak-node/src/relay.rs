//! Relay transport client: one TCP connection to the rendezvous relay,
//! newline-delimited JSON envelopes.
//!
//! While the connection is down, sends queue in FIFO order. On connect the
//! registration (or join) envelope goes first, then the queue is flushed, so
//! nothing submitted during the gap races ahead of causal order. A dropped
//! connection is surfaced as an event; reconnection is the owner's decision.

use std::collections::VecDeque;
use std::time::Duration;

use cloak_core::envelope::{
    decode_envelope, encode_envelope, Envelope, EnvelopeError, WireEnvelope,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Liveness envelope cadence while the connection is open.
const PING_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub enum RelayEvent {
    /// The connection closed (peer hangup or error). The owner must call
    /// `connect()` again if it wants the relay back.
    Closed,
    Envelope(WireEnvelope),
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// The envelope was dropped locally before send; nothing reached the
    /// relay connection.
    #[error("envelope dropped before send: {len} bytes over ceiling")]
    Oversize { len: usize },
    #[error("encode error: {0}")]
    Encode(EnvelopeError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct RelayClient {
    addr: String,
    app_type: String,
    room: Option<String>,
    registration: Envelope,
    queue: VecDeque<Vec<u8>>,
    writer: Option<mpsc::UnboundedSender<Vec<u8>>>,
    events: mpsc::UnboundedSender<RelayEvent>,
    ping_task: Option<JoinHandle<()>>,
}

impl RelayClient {
    /// `registration` is the register/join envelope re-sent on every connect.
    pub fn new(
        addr: impl Into<String>,
        app_type: impl Into<String>,
        room: Option<String>,
        registration: Envelope,
        events: mpsc::UnboundedSender<RelayEvent>,
    ) -> Self {
        RelayClient {
            addr: addr.into(),
            app_type: app_type.into(),
            room,
            registration,
            queue: VecDeque::new(),
            writer: None,
            events,
            ping_task: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    fn encode(&self, env: &Envelope) -> Result<Vec<u8>, RelayError> {
        match encode_envelope(env, &self.app_type, self.room.as_deref()) {
            Ok(bytes) => Ok(bytes),
            Err(EnvelopeError::Oversize { len }) => Err(RelayError::Oversize { len }),
            Err(e) => Err(RelayError::Encode(e)),
        }
    }

    /// Establish the relay connection, send the registration envelope, then
    /// flush the queue in submission order. Idempotent while open.
    pub async fn connect(&mut self) -> Result<(), RelayError> {
        if self.writer.is_some() {
            return Ok(());
        }
        let stream = TcpStream::connect(&self.addr).await?;
        let (read_half, mut write_half) = stream.into_split();

        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if write_half.write_all(&line).await.is_err() {
                    break;
                }
                if write_half.write_all(b"\n").await.is_err() {
                    break;
                }
            }
        });

        // Registration first, then the queue, before any new send can race.
        let reg = self.encode(&self.registration)?;
        let _ = tx.send(reg);
        while let Some(line) = self.queue.pop_front() {
            let _ = tx.send(line);
        }

        let events = self.events.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match decode_envelope(line.as_bytes()) {
                        Ok(wire) => {
                            if events.send(RelayEvent::Envelope(wire)).is_err() {
                                return;
                            }
                        }
                        Err(e) => debug!(error = %e, "ignoring undecodable relay line"),
                    },
                    Ok(None) | Err(_) => break,
                }
            }
            let _ = events.send(RelayEvent::Closed);
        });

        let ping_tx = tx.clone();
        let ping_line = self.encode(&Envelope::Ping)?;
        self.ping_task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(PING_INTERVAL);
            interval.tick().await; // first tick fires immediately; skip it
            loop {
                interval.tick().await;
                if ping_tx.send(ping_line.clone()).is_err() {
                    return;
                }
            }
        }));

        self.writer = Some(tx);
        Ok(())
    }

    /// Serialize and submit one envelope. Oversize envelopes are rejected
    /// here and never queued; while disconnected, valid envelopes queue FIFO.
    pub fn send(&mut self, env: &Envelope) -> Result<(), RelayError> {
        let line = self.encode(env)?;
        match self.writer.clone() {
            Some(tx) => {
                if tx.send(line.clone()).is_err() {
                    warn!("relay writer gone; queueing envelope");
                    self.mark_closed();
                    self.queue.push_back(line);
                }
            }
            None => self.queue.push_back(line),
        }
        Ok(())
    }

    /// Tear down connection-bound state after a `Closed` event (or to force
    /// a clean slate before reconnecting). The queue survives.
    pub fn mark_closed(&mut self) {
        self.writer = None;
        if let Some(t) = self.ping_task.take() {
            t.abort();
        }
    }

    #[cfg(test)]
    fn queued(&self) -> usize {
        self.queue.len()
    }
}

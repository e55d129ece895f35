//! Node driver: owns the session manager and executes its effects against
//! the relay client, the direct transport and the durable store.
//!
//! Single task, single select loop. Session state never leaves the manager;
//! everything async (sockets, files, timers) happens out here, feeding events
//! back in.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::time::Duration;

use cloak_core::envelope::{Envelope, APP_TYPE_DIRECT, APP_TYPE_ROOM};
use cloak_core::identity::{PeerId, Profile};
use cloak_core::presence::PresenceCache;
use cloak_core::proto::{parse_sub_channel_label, sub_channel_label, PRIMARY_LABEL};
use cloak_core::session::{Effect, SessionEvent, SessionManager, SessionState};
use cloak_core::store::{self as log, ContactMeta, DeliveryState, Message};
use cloak_core::transfer::ReceiveState;
use cloak_core::{ChannelMessage, TransferJob};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::cptp::{self, IncomingTransfer};
use crate::relay::{RelayClient, RelayError, RelayEvent};
use crate::store::MessageStore;
use crate::transport::{ChannelHandle, Transport, TransportEvent};

/// Commands from the owning process (CLI, UI bridge, tests).
#[derive(Debug)]
pub enum Command {
    /// Locate `peer` through the relay and negotiate a session.
    Connect { peer: PeerId },
    Disconnect { peer: PeerId },
    SendChat { peer: PeerId, content: String },
    SendFile { peer: PeerId, path: PathBuf },
    /// Activity string and typing flag carried in the next presence beats.
    SetActivity { activity: String, typing: bool },
    SetProfile(Profile),
    /// Re-dial the relay after a `RelayClosed` event. Never automatic.
    ConnectRelay,
    DeleteChat { peer: PeerId },
    ClearAll,
    Shutdown,
}

/// Everything the owner observes about the node.
#[derive(Debug)]
pub enum UiEvent {
    ChannelOpen { peer: PeerId },
    ChannelClosed { peer: PeerId },
    PeerOffline { peer: PeerId },
    RelayClosed,
    /// The relay refused us (wrong room password, protocol violation).
    /// Fatal to the current relay session; reconnect takes a new
    /// `ConnectRelay`.
    RelayRejected { message: String },
    MessageReceived { peer: PeerId, message: Message },
    TransferStarted {
        peer: PeerId,
        transfer_id: [u8; 16],
        file_name: String,
        file_size: u64,
    },
    TransferComplete {
        peer: PeerId,
        transfer_id: [u8; 16],
        path: PathBuf,
    },
    TransferSent { peer: PeerId, transfer_id: [u8; 16] },
    TransferFailed { transfer_id: [u8; 16], reason: String },
}

struct PendingTransfer {
    peer: PeerId,
    path: PathBuf,
    job: TransferJob,
}

pub struct Driver {
    sessions: SessionManager,
    relay: RelayClient,
    relay_rx: mpsc::UnboundedReceiver<RelayEvent>,
    transport: Transport,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    store: MessageStore,
    presence: PresenceCache,
    profile: Profile,
    activity: String,
    typing: bool,
    auto_accept: bool,
    incoming_dir: PathBuf,
    primary: HashMap<PeerId, ChannelHandle>,
    /// Tokens registered with the transport, per session, for cleanup.
    tokens: HashMap<PeerId, String>,
    outgoing: HashMap<[u8; 16], PendingTransfer>,
    incoming: HashMap<[u8; 16], (PeerId, IncomingTransfer)>,
    commands: mpsc::UnboundedReceiver<Command>,
    ui: mpsc::UnboundedSender<UiEvent>,
}

/// Channel pair the owner talks to the driver through.
pub struct NodeHandle {
    pub commands: mpsc::UnboundedSender<Command>,
    pub ui: mpsc::UnboundedReceiver<UiEvent>,
}

/// Registration envelope plus appType and room for the relay connection.
fn registration(config: &Config, local_id: &PeerId, profile: &Profile) -> (Envelope, String, Option<String>) {
    match &config.room {
        Some(room) => (
            Envelope::Join {
                room: room.clone(),
                password: config.room_password.clone(),
                alias: profile.alias.clone(),
                peer_id: local_id.clone(),
            },
            APP_TYPE_ROOM.to_string(),
            Some(room.clone()),
        ),
        None => (
            Envelope::Register {
                peer_id: local_id.clone(),
                alias: profile.alias.clone(),
            },
            APP_TYPE_DIRECT.to_string(),
            None,
        ),
    }
}

/// Wire everything up and hand back the command/event channels. The listener
/// is bound by the caller so the advertised address is decided there.
pub fn spawn(config: Config, local_id: PeerId, profile: Profile, listener: TcpListener) -> NodeHandle {
    let (reg, app_type, room) = registration(&config, &local_id, &profile);
    let (relay_tx, relay_rx) = mpsc::unbounded_channel();
    let relay = RelayClient::new(config.relay_addr.clone(), app_type, room, reg, relay_tx);

    let (transport_tx, transport_rx) = mpsc::unbounded_channel();
    let transport = Transport::new(local_id.clone(), transport_tx);
    let acceptor = transport.clone();
    tokio::spawn(async move { acceptor.run_listener(listener).await });

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (ui_tx, ui_rx) = mpsc::unbounded_channel();
    let driver = Driver {
        sessions: SessionManager::new(local_id, config.advertise_addr()),
        relay,
        relay_rx,
        transport,
        transport_rx,
        store: MessageStore::new(config.data_dir(), config.zero_trace),
        presence: PresenceCache::new(),
        profile,
        activity: String::new(),
        typing: false,
        auto_accept: config.auto_accept_transfers,
        incoming_dir: config.data_dir().join("incoming"),
        primary: HashMap::new(),
        tokens: HashMap::new(),
        outgoing: HashMap::new(),
        incoming: HashMap::new(),
        commands: cmd_rx,
        ui: ui_tx,
    };
    tokio::spawn(async move {
        if let Err(e) = driver.run().await {
            error!(error = %e, "node driver exited");
        }
    });
    NodeHandle {
        commands: cmd_tx,
        ui: ui_rx,
    }
}

impl Driver {
    pub async fn run(mut self) -> anyhow::Result<()> {
        if let Err(e) = self.relay.connect().await {
            warn!(error = %e, "initial relay connection failed");
        }
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                Some(cmd) = self.commands.recv() => {
                    if matches!(cmd, Command::Shutdown) {
                        info!("driver shutting down");
                        return Ok(());
                    }
                    self.handle_command(cmd).await;
                }
                Some(ev) = self.relay_rx.recv() => self.handle_relay_event(ev).await,
                Some(ev) = self.transport_rx.recv() => self.handle_transport_event(ev).await,
                _ = ticker.tick() => {
                    let effects = self.sessions.tick();
                    self.apply_effects(effects).await;
                }
            }
        }
    }

    async fn dispatch(&mut self, event: SessionEvent) {
        let effects = self.sessions.handle(event);
        self.apply_effects(effects).await;
    }

    async fn apply_effects(&mut self, effects: Vec<Effect>) {
        let mut queue: VecDeque<Effect> = effects.into();
        while let Some(effect) = queue.pop_front() {
            if let Some(event) = self.apply_effect(effect).await {
                queue.extend(self.sessions.handle(event));
            }
        }
    }

    /// Perform one effect. A returned event feeds back into the manager.
    async fn apply_effect(&mut self, effect: Effect) -> Option<SessionEvent> {
        match effect {
            Effect::SendEnvelope(env) => {
                match self.relay.send(&env) {
                    Ok(()) => {}
                    Err(RelayError::Oversize { len }) => {
                        warn!(len, "envelope over size ceiling; dropped before send");
                    }
                    Err(e) => warn!(error = %e, "relay send failed"),
                }
                None
            }
            Effect::ExpectChannel { peer, token } => {
                self.tokens.insert(peer.clone(), token.clone());
                self.transport.expect(token, peer).await;
                None
            }
            Effect::DialPeer { peer, addr, token } => {
                let transport = self.transport.clone();
                tokio::spawn(async move {
                    if let Err(e) = transport.dial(peer, &addr, &token, PRIMARY_LABEL).await {
                        debug!(%addr, error = %e, "peer dial failed");
                    }
                });
                None
            }
            Effect::Deliver { peer, message } => match self.primary.get(&peer) {
                Some(handle) => match handle.send(&message) {
                    Ok(()) => None,
                    Err(_) => Some(SessionEvent::ChannelClosed { peer }),
                },
                None => {
                    debug!(%peer, "deliver with no open channel; dropped");
                    None
                }
            },
            Effect::Connected { peer } => {
                self.on_connected(peer).await;
                None
            }
            Effect::Closed { peer } => {
                self.primary.remove(&peer);
                if let Some(token) = self.tokens.remove(&peer) {
                    self.transport.forget(&token).await;
                }
                self.presence.remove(&peer);
                let orphaned: Vec<[u8; 16]> = self
                    .incoming
                    .iter()
                    .filter(|(_, (owner, _))| *owner == peer)
                    .map(|(id, _)| *id)
                    .collect();
                for transfer_id in orphaned {
                    self.drop_incoming(transfer_id, "session closed mid-transfer");
                }
                self.outgoing.retain(|_, p| p.peer != peer);
                let _ = self.ui.send(UiEvent::ChannelClosed { peer });
                None
            }
            Effect::PeerOffline { peer } => {
                let _ = self.ui.send(UiEvent::PeerOffline { peer });
                None
            }
            Effect::PresenceDue { peer } => {
                if !self.profile.allows_broadcast() {
                    return None;
                }
                let message = ChannelMessage::Presence {
                    activity: self.activity.clone(),
                    typing: self.typing,
                    timestamp: now_millis(),
                };
                match self.primary.get(&peer) {
                    Some(handle) if handle.send(&message).is_err() => {
                        Some(SessionEvent::ChannelClosed { peer })
                    }
                    _ => None,
                }
            }
        }
    }

    /// Session reached Connected: replay the durable backlog in order, mark
    /// it delivered, then sync the local profile.
    async fn on_connected(&mut self, peer: PeerId) {
        let _ = self.ui.send(UiEvent::ChannelOpen { peer: peer.clone() });
        let handle = match self.primary.get(&peer) {
            Some(h) => h.clone(),
            None => return,
        };
        let mut history = self.store.load_history(&peer).await;
        let backlog = log::pending(&history);
        if !backlog.is_empty() {
            info!(%peer, count = backlog.len(), "replaying undelivered messages");
            let mut all_sent = true;
            for message in &backlog {
                if handle.send(&message.to_channel_message()).is_err() {
                    all_sent = false;
                    break;
                }
            }
            if all_sent {
                log::mark_all_delivered(&mut history);
                if let Err(e) = self.store.replace_history(&peer, &history).await {
                    warn!(error = %e, "failed to rewrite log after replay");
                }
            }
        }
        if self.profile.allows_broadcast() {
            let _ = handle.send(&ChannelMessage::Profile {
                peer_id: self.sessions.local_id().clone(),
                name: self.profile.alias.clone(),
                pronouns: self.profile.pronouns.clone(),
                photo: self.profile.photo.clone(),
                timestamp: now_millis(),
            });
        }
    }

    async fn handle_relay_event(&mut self, event: RelayEvent) {
        let wire = match event {
            RelayEvent::Closed => {
                self.relay.mark_closed();
                warn!("relay connection lost; reconnect with ConnectRelay");
                let _ = self.ui.send(UiEvent::RelayClosed);
                return;
            }
            RelayEvent::Envelope(wire) => wire,
        };
        match wire.envelope {
            Envelope::Offer {
                from_peer_id: Some(from),
                offer,
                ..
            } => self.dispatch(SessionEvent::OfferReceived { from, offer }).await,
            Envelope::Answer {
                from_peer_id: Some(from),
                answer,
                ..
            } => self.dispatch(SessionEvent::AnswerReceived { from, answer }).await,
            Envelope::Candidate {
                from_peer_id: Some(from),
                candidate,
                ..
            } => {
                self.dispatch(SessionEvent::CandidateReceived { from, candidate })
                    .await
            }
            Envelope::PeerFound { peer_id } => {
                self.dispatch(SessionEvent::PeerFound { peer: peer_id }).await
            }
            Envelope::PeerNotFound { peer_id } => {
                self.dispatch(SessionEvent::PeerNotFound { peer: peer_id }).await
            }
            Envelope::Registered { peer_id } => debug!(%peer_id, "registered with relay"),
            Envelope::Joined { peers, .. } => {
                // As the joining side we initiate toward every present member.
                for info in peers {
                    if let Some(alias) = info.alias.clone() {
                        self.remember_contact(&info.id, alias, None).await;
                    }
                    self.dispatch(SessionEvent::Initiate { target: info.id }).await;
                }
            }
            Envelope::PeerJoined { peer_id, alias } => {
                // The joiner initiates; we only note them.
                if let Some(alias) = alias {
                    self.remember_contact(&peer_id, alias, None).await;
                }
            }
            Envelope::PeerLeft { peer_id } => {
                self.dispatch(SessionEvent::Teardown { peer: peer_id }).await
            }
            Envelope::Error { message } => {
                warn!(%message, "relay rejected the session");
                self.relay.mark_closed();
                let _ = self.ui.send(UiEvent::RelayRejected { message });
            }
            other => debug!(?other, "unexpected envelope from relay"),
        }
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::ChannelUp { peer, label, handle } if label == PRIMARY_LABEL => {
                self.primary.insert(peer.clone(), handle);
                self.dispatch(SessionEvent::ChannelOpen { peer }).await;
            }
            // Sub-channels are owned by the transfer tasks on the sending
            // side and consumed through Frame events on the receiving side.
            TransportEvent::ChannelUp { .. } => {}
            TransportEvent::ChannelDown { peer, label } if label == PRIMARY_LABEL => {
                self.dispatch(SessionEvent::ChannelClosed { peer }).await;
            }
            TransportEvent::ChannelDown { peer, label } => {
                if let Some(index) = parse_sub_channel_label(&label) {
                    self.reap_stalled_incoming(&peer, index);
                }
            }
            TransportEvent::Frame { peer, message, .. } => self.handle_frame(peer, message).await,
        }
    }

    async fn handle_frame(&mut self, peer: PeerId, message: ChannelMessage) {
        match message {
            ChannelMessage::Chat {
                content,
                sender,
                timestamp,
                sub_type,
            } => {
                let record = Message {
                    content,
                    sender,
                    timestamp,
                    sub_type,
                    delivery: DeliveryState::Delivered,
                };
                // Replays after a reconnect are indistinguishable from
                // duplicates; the replay key filters both.
                let history = self.store.load_history(&peer).await;
                if history.iter().any(|m| m.replay_key() == record.replay_key()) {
                    debug!(%peer, "duplicate message ignored");
                    return;
                }
                if let Err(e) = self.store.append(&peer, &record).await {
                    warn!(error = %e, "failed to persist inbound message");
                }
                self.sessions.record_message(&peer, record.clone());
                let _ = self.ui.send(UiEvent::MessageReceived { peer, message: record });
            }
            ChannelMessage::Presence {
                activity,
                typing,
                timestamp,
            } => {
                self.presence.apply_presence(&peer, &activity, typing, timestamp);
                self.dispatch(SessionEvent::PresenceReceived { from: peer }).await;
            }
            ChannelMessage::Profile {
                name,
                pronouns,
                photo,
                timestamp,
                ..
            } => {
                self.presence
                    .apply_profile(&peer, &name, &pronouns, photo.as_deref(), timestamp);
                if let Err(e) = self
                    .store
                    .save_contact(
                        &peer,
                        ContactMeta {
                            alias: Some(name),
                            photo,
                            updated_at: timestamp,
                        },
                    )
                    .await
                {
                    warn!(error = %e, "failed to update contact cache");
                }
            }
            ChannelMessage::CptpInit {
                transfer_id,
                total_channels,
                file_size,
                file_name,
                hash,
            } => {
                self.on_transfer_offer(peer, transfer_id, total_channels, file_size, file_name, hash)
                    .await
            }
            ChannelMessage::CptpAccept { transfer_id } => self.start_outgoing(transfer_id),
            ChannelMessage::CptpReject { transfer_id } => {
                if self.outgoing.remove(&transfer_id).is_some() {
                    let _ = self.ui.send(UiEvent::TransferFailed {
                        transfer_id,
                        reason: "rejected by peer".to_string(),
                    });
                }
            }
            ChannelMessage::Block {
                transfer_id,
                part_index,
                offset,
                data,
            } => self.on_block(peer, transfer_id, part_index, offset, &data),
        }
    }

    async fn on_transfer_offer(
        &mut self,
        peer: PeerId,
        transfer_id: [u8; 16],
        total_channels: u32,
        file_size: u64,
        file_name: String,
        hash: [u8; 32],
    ) {
        let handle = match self.primary.get(&peer) {
            Some(h) => h.clone(),
            None => return,
        };
        if !self.auto_accept {
            let _ = handle.send(&ChannelMessage::CptpReject { transfer_id });
            return;
        }
        let state = ReceiveState::new(transfer_id, file_name.clone(), file_size, total_channels, hash);
        let incoming = match IncomingTransfer::create(&self.incoming_dir, state) {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "could not create incoming transfer file");
                let _ = handle.send(&ChannelMessage::CptpReject { transfer_id });
                return;
            }
        };
        let _ = self.ui.send(UiEvent::TransferStarted {
            peer: peer.clone(),
            transfer_id,
            file_name,
            file_size,
        });
        let _ = handle.send(&ChannelMessage::CptpAccept { transfer_id });
        if file_size == 0 {
            // No blocks will ever arrive.
            match incoming.finalize() {
                Ok(path) => {
                    let _ = self.ui.send(UiEvent::TransferComplete { peer, transfer_id, path });
                }
                Err(e) => {
                    let _ = self.ui.send(UiEvent::TransferFailed {
                        transfer_id,
                        reason: e.to_string(),
                    });
                }
            }
            return;
        }
        self.incoming.insert(transfer_id, (peer, incoming));
    }

    /// The receiver accepted: open every sub-channel and stream the parts.
    fn start_outgoing(&mut self, transfer_id: [u8; 16]) {
        let Some(pending) = self.outgoing.remove(&transfer_id) else {
            debug!("accept for unknown transfer");
            return;
        };
        let Some(remote) = self
            .sessions
            .session(&pending.peer)
            .and_then(|s| s.remote.clone())
        else {
            let _ = self.ui.send(UiEvent::TransferFailed {
                transfer_id,
                reason: "session lost before streaming".to_string(),
            });
            return;
        };
        let transport = self.transport.clone();
        let ui = self.ui.clone();
        tokio::spawn(async move {
            let total = pending.job.parts.len();
            let mut channels = Vec::with_capacity(total);
            for i in 0..total {
                let label = sub_channel_label(i as u32);
                match transport
                    .dial(pending.peer.clone(), &remote.addr, &remote.token, &label)
                    .await
                {
                    Ok(handle) => channels.push(handle),
                    Err(e) => {
                        warn!(%label, error = %e, "sub-channel dial failed");
                        let _ = ui.send(UiEvent::TransferFailed {
                            transfer_id,
                            reason: e.to_string(),
                        });
                        return;
                    }
                }
            }
            match cptp::run_sender(pending.job, pending.path, channels).await {
                Ok(()) => {
                    let _ = ui.send(UiEvent::TransferSent {
                        peer: pending.peer,
                        transfer_id,
                    });
                }
                Err(e) => {
                    let _ = ui.send(UiEvent::TransferFailed {
                        transfer_id,
                        reason: e.to_string(),
                    });
                }
            }
        });
    }

    /// A sub-channel died. Each part streams over exactly one channel, so a
    /// transfer from `peer` whose matching part is still short can never
    /// complete; fail it and drop the preallocated file now instead of
    /// holding both until the session closes.
    fn reap_stalled_incoming(&mut self, peer: &PeerId, part_index: u32) {
        let stalled: Vec<[u8; 16]> = self
            .incoming
            .iter()
            .filter(|(_, (owner, t))| owner == peer && !t.part_complete(part_index))
            .map(|(id, _)| *id)
            .collect();
        for transfer_id in stalled {
            warn!(part_index, "sub-channel closed before its part finished");
            self.drop_incoming(transfer_id, "sub-channel closed mid-transfer");
        }
    }

    fn drop_incoming(&mut self, transfer_id: [u8; 16], reason: &str) {
        if let Some((_, transfer)) = self.incoming.remove(&transfer_id) {
            if let Err(e) = transfer.discard() {
                warn!(error = %e, "could not remove partial transfer file");
            }
            let _ = self.ui.send(UiEvent::TransferFailed {
                transfer_id,
                reason: reason.to_string(),
            });
        }
    }

    fn on_block(&mut self, peer: PeerId, transfer_id: [u8; 16], part_index: u32, offset: u64, data: &[u8]) {
        let outcome = match self.incoming.get_mut(&transfer_id) {
            Some((owner, incoming)) if *owner == peer => {
                Some(incoming.on_block(part_index, offset, data))
            }
            Some(_) => {
                debug!(%peer, "block from a peer that does not own the transfer");
                None
            }
            None => {
                debug!("block for unknown transfer");
                None
            }
        };
        match outcome {
            Some(Ok(true)) => {
                if let Some((peer, incoming)) = self.incoming.remove(&transfer_id) {
                    match incoming.finalize() {
                        Ok(path) => {
                            let _ = self.ui.send(UiEvent::TransferComplete { peer, transfer_id, path });
                        }
                        Err(e) => {
                            let _ = self.ui.send(UiEvent::TransferFailed {
                                transfer_id,
                                reason: e.to_string(),
                            });
                        }
                    }
                }
            }
            Some(Ok(false)) | None => {}
            Some(Err(e)) => {
                warn!(error = %e, "transfer aborted");
                self.drop_incoming(transfer_id, &e.to_string());
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { peer } => {
                self.dispatch(SessionEvent::FindPeer { target: peer }).await
            }
            Command::Disconnect { peer } => {
                self.dispatch(SessionEvent::Teardown { peer }).await
            }
            Command::SendChat { peer, content } => {
                let mut record =
                    Message::text(content, self.sessions.local_id().clone(), now_millis());
                // The durable log is the only reconnect backlog: an open
                // channel gets the message now, anything else waits for the
                // replay on connect. With no log (no-trace mode) the session
                // FIFO bridges the gap instead.
                let connected =
                    matches!(self.sessions.state_of(&peer), Some(SessionState::Connected));
                if connected || self.store.zero_trace() {
                    self.dispatch(SessionEvent::OutboundMessage {
                        peer: peer.clone(),
                        message: record.to_channel_message(),
                    })
                    .await;
                }
                // A failed deliver closes the session before we get back
                // here; only a send the channel accepted counts.
                if connected
                    && matches!(self.sessions.state_of(&peer), Some(SessionState::Connected))
                {
                    record.delivery = DeliveryState::Delivered;
                }
                if let Err(e) = self.store.append(&peer, &record).await {
                    warn!(error = %e, "failed to persist outbound message");
                }
                self.sessions.record_message(&peer, record);
            }
            Command::SendFile { peer, path } => self.offer_file(peer, path).await,
            Command::SetActivity { activity, typing } => {
                self.activity = activity;
                self.typing = typing;
            }
            Command::SetProfile(profile) => {
                self.profile = profile;
                if self.profile.allows_broadcast() {
                    let message = ChannelMessage::Profile {
                        peer_id: self.sessions.local_id().clone(),
                        name: self.profile.alias.clone(),
                        pronouns: self.profile.pronouns.clone(),
                        photo: self.profile.photo.clone(),
                        timestamp: now_millis(),
                    };
                    for handle in self.primary.values() {
                        let _ = handle.send(&message);
                    }
                }
            }
            Command::ConnectRelay => {
                if let Err(e) = self.relay.connect().await {
                    warn!(error = %e, "relay reconnect failed");
                }
            }
            Command::DeleteChat { peer } => {
                self.store.delete_chat(&peer).await;
            }
            Command::ClearAll => self.store.clear_all().await,
            Command::Shutdown => {}
        }
    }

    async fn offer_file(&mut self, peer: PeerId, path: PathBuf) {
        let handle = match self.primary.get(&peer) {
            Some(h) => h.clone(),
            None => {
                warn!(%peer, "no open channel; transfer not offered");
                return;
            }
        };
        let (hash, size) = match cptp::hash_object(&path).await {
            Ok(x) => x,
            Err(e) => {
                warn!(error = %e, "could not read transfer source");
                return;
            }
        };
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "object".to_string());
        let job = TransferJob::new(name, size, hash);
        let transfer_id = job.transfer_id;
        if handle.send(&job.init_message()).is_ok() {
            self.outgoing.insert(transfer_id, PendingTransfer { peer, path, job });
        }
    }

    async fn remember_contact(&mut self, peer: &PeerId, alias: String, photo: Option<String>) {
        if let Err(e) = self
            .store
            .save_contact(
                peer,
                ContactMeta {
                    alias: Some(alias),
                    photo,
                    updated_at: now_millis(),
                },
            )
            .await
        {
            warn!(error = %e, "failed to update contact cache");
        }
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

//! Session manager: room membership, routing of signaling traffic to peer
//! sessions, and the single dispatch loop everything runs on.
//!
//! Signaling messages, transport callbacks, health ticks and embedder
//! commands all arrive as [`Event`]s on one channel and are handled one at a
//! time, so none of the state below needs locking.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SessionError};
use crate::events::{CloseReason, Events, SessionEvent};
use crate::health::{HealthMonitor, SweepReason};
use crate::media::{LocalMedia, SharedMedia};
use crate::peer::{PeerSession, PeerSnapshot, PeerState};
use crate::protocol::{ClientMessage, IceCandidate, ParticipantId, Participants, ServerMessage};
use crate::relay::{Delivery, FallbackRelay};
use crate::signaling::{Outbox, SignalingChannel, SignalingEvent};
use crate::transport::{PeerEvent, PeerEventSink, Role, TransportFactory};

/// Candidates held per sender while its offer is outstanding.
const MAX_EARLY_CANDIDATES: usize = 64;

pub enum Event {
    Signaling(SignalingEvent),
    Peer {
        participant: ParticipantId,
        generation: u64,
        event: PeerEvent,
    },
    Command(Command),
}

#[derive(Debug)]
pub enum Command {
    RequestRoom(RoomRequest),
    Leave,
    SetMuted(bool),
    Send {
        target: ParticipantId,
        message: Value,
    },
    /// App came back to the foreground; run an immediate health sweep.
    Foreground,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomRequest {
    Create(Option<String>),
    Join(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Room {
    room_id: Option<String>,
    participants: BTreeSet<ParticipantId>,
    reported_count: u64,
}

impl Room {
    pub fn room_id(&self) -> Option<&str> {
        self.room_id.as_deref()
    }

    pub fn participants(&self) -> &BTreeSet<ParticipantId> {
        &self.participants
    }

    /// Head count as last reported by the server.
    pub fn reported_count(&self) -> u64 {
        self.reported_count
    }

    fn note_count(&mut self, participants: Option<&Participants>) {
        if let Some(p) = participants {
            self.reported_count = p.count();
        }
    }
}

/// Cloneable front door into a running session loop.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<Event>,
}

impl SessionHandle {
    fn command(&self, cmd: Command) -> bool {
        self.tx.send(Event::Command(cmd)).is_ok()
    }

    pub fn request_room(&self, req: RoomRequest) -> bool {
        self.command(Command::RequestRoom(req))
    }

    pub fn leave(&self) -> bool {
        self.command(Command::Leave)
    }

    pub fn set_muted(&self, muted: bool) -> bool {
        self.command(Command::SetMuted(muted))
    }

    pub fn send_message(&self, target: ParticipantId, message: Value) -> bool {
        self.command(Command::Send { target, message })
    }

    pub fn foreground(&self) -> bool {
        self.command(Command::Foreground)
    }

    pub fn shutdown(&self) -> bool {
        self.command(Command::Shutdown)
    }
}

pub struct SessionManager {
    room: Room,
    room_requested: bool,
    peers: HashMap<ParticipantId, PeerSession>,
    early_candidates: HashMap<ParticipantId, Vec<IceCandidate>>,
    retired: HashSet<ParticipantId>,
    outbox: Outbox,
    factory: Arc<dyn TransportFactory>,
    media: SharedMedia,
    events: Events,
    relay: FallbackRelay,
    health: HealthMonitor,
    event_tx: mpsc::UnboundedSender<Event>,
    next_generation: u64,
}

impl SessionManager {
    /// `event_tx` must feed the receiver later passed to [`SessionManager::run`];
    /// transports report back through it.
    pub fn new(
        channel: Arc<dyn SignalingChannel>,
        factory: Arc<dyn TransportFactory>,
        media: Arc<dyn LocalMedia>,
        event_tx: mpsc::UnboundedSender<Event>,
    ) -> Self {
        Self {
            room: Room::default(),
            room_requested: false,
            peers: HashMap::new(),
            early_candidates: HashMap::new(),
            retired: HashSet::new(),
            outbox: Outbox::new(channel),
            factory,
            media: SharedMedia::new(media),
            events: Events::default(),
            relay: FallbackRelay::default(),
            health: HealthMonitor::default(),
            event_tx,
            next_generation: 0,
        }
    }

    pub fn with_events(mut self, events: Events) -> Self {
        self.events = events;
        self
    }

    pub fn with_relay(mut self, relay: FallbackRelay) -> Self {
        self.relay = relay;
        self
    }

    pub fn with_health(mut self, health: HealthMonitor) -> Self {
        self.health = health;
        self
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            tx: self.event_tx.clone(),
        }
    }

    pub fn events(&self) -> &Events {
        &self.events
    }

    pub fn room(&self) -> &Room {
        &self.room
    }

    pub fn peer_state(&self, participant: &ParticipantId) -> Option<PeerState> {
        self.peers.get(participant).map(|p| p.state())
    }

    pub fn peers(&self) -> Vec<PeerSnapshot> {
        let mut out: Vec<PeerSnapshot> = self.peers.values().map(|p| p.snapshot()).collect();
        out.sort_by(|a, b| a.participant.cmp(&b.participant));
        out
    }

    pub fn is_muted(&self) -> bool {
        self.media.is_muted()
    }

    pub fn media_acquired(&self) -> bool {
        self.media.is_acquired()
    }

    pub fn queued_messages(&self) -> usize {
        self.outbox.queued()
    }

    /// Runs until [`Command::Shutdown`], then leaves the room.
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Event>) {
        let mut ticker = tokio::time::interval(self.health.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        info!(interval = ?self.health.interval(), "session loop started");
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    let Some(event) = maybe else { break };
                    if !self.dispatch(event).await {
                        break;
                    }
                }
                _ = ticker.tick() => self.sweep(SweepReason::Periodic).await,
            }
        }
        self.leave_room().await;
        info!("session loop stopped");
    }

    /// Handles one event. Returns false when the loop should stop.
    pub async fn dispatch(&mut self, event: Event) -> bool {
        match event {
            Event::Signaling(SignalingEvent::Open) => self.on_channel_open(),
            Event::Signaling(SignalingEvent::Message(msg)) => self.handle_signal(msg).await,
            Event::Signaling(SignalingEvent::Error(err)) => {
                warn!("signaling channel error: {err}");
                self.on_channel_lost().await;
            }
            Event::Signaling(SignalingEvent::Closed) => self.on_channel_lost().await,
            Event::Peer {
                participant,
                generation,
                event,
            } => self.handle_peer_event(participant, generation, event).await,
            Event::Command(cmd) => match cmd {
                Command::RequestRoom(req) => self.request_room(req),
                Command::Leave => self.leave_room().await,
                Command::SetMuted(muted) => self.set_muted(muted),
                Command::Send { target, message } => {
                    self.send_message(target, message).await;
                }
                Command::Foreground => self.sweep(SweepReason::Foreground).await,
                Command::Shutdown => return false,
            },
        }
        true
    }

    /// Asks the server to create or join a room. If the channel is not open
    /// yet the request waits in the outbox until it is.
    pub fn request_room(&mut self, req: RoomRequest) {
        if !self.outbox.is_open() {
            warn!(?req, "{}; room request queued", SessionError::ChannelUnavailable);
        }
        let msg = match req {
            RoomRequest::Create(room_id) => ClientMessage::CreateRoom { room_id },
            RoomRequest::Join(room_id) => ClientMessage::JoinRoom { room_id },
        };
        self.room_requested = true;
        self.outbox.send(&msg);
    }

    pub async fn handle_signal(&mut self, msg: ServerMessage) {
        debug!(kind = msg.kind(), "signaling message");
        match msg {
            ServerMessage::RoomCreated {
                room_id,
                participants,
            }
            | ServerMessage::RoomJoined {
                room_id,
                participants,
            } => self.on_room_entered(room_id, participants),
            ServerMessage::NewParticipant { id, participants } => {
                self.room.note_count(participants.as_ref());
                self.on_new_participant(id).await;
            }
            ServerMessage::Offer {
                sender_id,
                offer,
                ice_restart,
            } => {
                if !self.peers.contains_key(&sender_id) {
                    if let Err(err) = self.create_peer(&sender_id, Role::Responder).await {
                        self.report(Some(&sender_id), err);
                        return;
                    }
                    self.room.participants.insert(sender_id.clone());
                }
                let Some(peer) = self.peers.get_mut(&sender_id) else {
                    return;
                };
                debug!(participant = %sender_id, ice_restart, state = %peer.state(), "remote offer");
                let before = peer.state();
                let result = peer.handle_offer(offer, &mut self.outbox).await;
                self.settle(&sender_id, before, result).await;
            }
            ServerMessage::Answer { sender_id, answer } => {
                let Some(peer) = self.peers.get_mut(&sender_id) else {
                    warn!("{}; answer discarded", SessionError::UnknownPeer(sender_id));
                    return;
                };
                let before = peer.state();
                let result = peer.handle_answer(answer).await;
                self.settle(&sender_id, before, result).await;
            }
            ServerMessage::IceCandidate {
                sender_id,
                candidate,
            } => {
                let Some(peer) = self.peers.get_mut(&sender_id) else {
                    self.buffer_early_candidate(sender_id, candidate);
                    return;
                };
                let before = peer.state();
                let result = peer.handle_candidate(candidate).await;
                self.settle(&sender_id, before, result).await;
            }
            ServerMessage::ParticipantLeft { id, participants } => {
                self.room.note_count(participants.as_ref());
                self.close_peer(&id, CloseReason::ParticipantLeft).await;
                self.early_candidates.remove(&id);
                self.retired.remove(&id);
                if self.room.participants.remove(&id) {
                    self.events.emit(SessionEvent::ParticipantLeft(id));
                }
            }
            ServerMessage::RelayedMessage { sender_id, message } => {
                self.relay.on_relayed(&sender_id, message);
            }
            ServerMessage::IceRestart { sender_id } => {
                let Some(peer) = self.peers.get_mut(&sender_id) else {
                    warn!("{}; restart request discarded", SessionError::UnknownPeer(sender_id));
                    return;
                };
                let before = peer.state();
                let result = peer
                    .handle_restart_request(&mut self.outbox, self.health.retry_after())
                    .await;
                self.settle(&sender_id, before, result).await;
            }
            ServerMessage::Error { message } => {
                warn!("server error: {message}");
                self.report(None, SessionError::Protocol(message));
            }
            ServerMessage::Unknown => debug!("ignoring unknown signaling message"),
        }
    }

    fn on_room_entered(&mut self, room_id: String, participants: Participants) {
        info!(room = %room_id, count = participants.count(), "in room");
        self.room.room_id = Some(room_id.clone());
        self.room.participants = participants.roster().iter().cloned().collect();
        self.room.reported_count = participants.count();
        self.events.emit(SessionEvent::RoomJoined {
            room_id,
            participants: self.room.participants.iter().cloned().collect(),
        });
    }

    async fn on_new_participant(&mut self, id: ParticipantId) {
        if self.room.participants.insert(id.clone()) {
            self.events.emit(SessionEvent::ParticipantJoined(id.clone()));
        }
        if self.peers.contains_key(&id) {
            debug!(participant = %id, "session already exists");
            return;
        }
        if let Err(err) = self.create_peer(&id, Role::Initiator).await {
            self.report(Some(&id), err);
            return;
        }
        let Some(peer) = self.peers.get_mut(&id) else {
            return;
        };
        let before = peer.state();
        let result = peer.start_offer(&mut self.outbox, false).await;
        self.settle(&id, before, result).await;
    }

    /// Holds a candidate from a roster member whose offer has not arrived.
    /// Senders outside the room are reported; members whose session already
    /// ended are ignored.
    fn buffer_early_candidate(&mut self, sender: ParticipantId, candidate: IceCandidate) {
        if !self.room.participants.contains(&sender) {
            self.report(Some(&sender), SessionError::UnknownPeer(sender.clone()));
            return;
        }
        if self.retired.contains(&sender) {
            debug!(participant = %sender, "discarding candidate for closed session");
            return;
        }
        let buffered = self.early_candidates.entry(sender.clone()).or_default();
        if buffered.len() >= MAX_EARLY_CANDIDATES {
            warn!(participant = %sender, limit = MAX_EARLY_CANDIDATES, "early candidate buffer full; dropping");
            return;
        }
        buffered.push(candidate);
        debug!(participant = %sender, buffered = buffered.len(), "buffering candidate for peer without session");
    }

    async fn create_peer(&mut self, id: &ParticipantId, role: Role) -> Result<()> {
        self.media.ensure().await?;
        self.next_generation += 1;
        let generation = self.next_generation;
        let sink = PeerEventSink::new(id.clone(), generation, self.event_tx.clone());
        let transport = match self.factory.create(id, role, sink).await {
            Ok(transport) => transport,
            Err(err) => {
                if self.peers.is_empty() {
                    self.media.release();
                }
                return Err(err);
            }
        };
        self.retired.remove(id);
        let mut peer = PeerSession::new(id.clone(), role, generation, transport);
        if let Some(early) = self.early_candidates.remove(id) {
            peer.preload_candidates(early);
        }
        info!(participant = %id, ?role, generation, "peer session created");
        self.peers.insert(id.clone(), peer);
        Ok(())
    }

    pub async fn handle_peer_event(
        &mut self,
        participant: ParticipantId,
        generation: u64,
        event: PeerEvent,
    ) {
        let Some(peer) = self
            .peers
            .get_mut(&participant)
            .filter(|p| p.generation() == generation)
        else {
            debug!(participant = %participant, generation, ?event, "discarding stale transport event");
            if let PeerEvent::ChannelOpen(channel) = event {
                channel.close().await;
            }
            return;
        };
        let before = peer.state();
        let result = match event {
            PeerEvent::Connectivity(c) => {
                peer.on_connectivity(c).await;
                Ok(())
            }
            PeerEvent::LocalCandidate(c) => {
                peer.on_local_candidate(c, &mut self.outbox);
                Ok(())
            }
            PeerEvent::GatheringComplete => {
                peer.on_gathering_complete().await;
                Ok(())
            }
            PeerEvent::ChannelOpen(channel) => {
                peer.on_channel_open(channel).await;
                Ok(())
            }
            PeerEvent::ChannelMessage(raw) => match peer.on_channel_message(&raw).await {
                Ok(Some(message)) => {
                    self.relay.on_direct(&participant, message);
                    Ok(())
                }
                Ok(None) => Ok(()),
                Err(err) => Err(err),
            },
            PeerEvent::ChannelClosed => {
                peer.on_channel_closed().await;
                Ok(())
            }
        };
        self.settle(&participant, before, result).await;
    }

    /// Applies the consequences of one peer operation: failures close that
    /// peer only, state changes become observer events.
    async fn settle(&mut self, id: &ParticipantId, before: PeerState, result: Result<()>) {
        if let Err(err) = result {
            self.report(Some(id), err);
            self.close_peer(id, CloseReason::NegotiationFailed).await;
            return;
        }
        let Some((after, degraded)) = self
            .peers
            .get(id)
            .map(|p| (p.state(), p.connectivity().is_degraded()))
        else {
            return;
        };
        if after == PeerState::Closed {
            self.close_peer(id, CloseReason::TransportClosed).await;
        } else if before != PeerState::Connected && after == PeerState::Connected {
            info!(participant = %id, "peer connected");
            self.events.emit(SessionEvent::PeerConnected(id.clone()));
        } else if before == PeerState::Connected && after != PeerState::Connected {
            info!(participant = %id, state = %after, "peer disconnected");
            self.events.emit(SessionEvent::PeerDisconnected(id.clone()));
            if degraded {
                self.report(Some(id), SessionError::TransportDegraded(id.clone()));
            }
        }
    }

    async fn close_peer(&mut self, id: &ParticipantId, reason: CloseReason) {
        let Some(peer) = self.peers.get_mut(id) else {
            return;
        };
        peer.close().await;
        self.peers.remove(id);
        self.early_candidates.remove(id);
        self.retired.insert(id.clone());
        debug!(participant = %id, ?reason, remaining = self.peers.len(), "peer removed");
        self.events.emit(SessionEvent::PeerClosed {
            participant: id.clone(),
            reason,
        });
        if self.peers.is_empty() {
            self.media.release();
            self.events.emit(SessionEvent::CallEnded);
        }
    }

    fn report(&self, participant: Option<&ParticipantId>, error: SessionError) {
        if error.is_peer_scoped() {
            warn!(participant = ?participant, "{error}");
        } else {
            error!(participant = ?participant, "{error}");
        }
        self.events.emit(SessionEvent::Error {
            participant: participant.cloned(),
            error,
        });
    }

    /// Leaves the room and closes every peer session. Safe to call repeatedly.
    pub async fn leave_room(&mut self) {
        self.outbox.discard();
        let active = self.room_requested || self.room.room_id.is_some() || !self.peers.is_empty();
        if !active {
            return;
        }
        if let Err(err) = self.outbox.send_now(&ClientMessage::LeaveRoom) {
            debug!("leave_room not delivered: {err}");
        }
        self.teardown(CloseReason::LocalLeave).await;
    }

    async fn teardown(&mut self, reason: CloseReason) {
        let mut ids: Vec<ParticipantId> = self.peers.keys().cloned().collect();
        ids.sort();
        for id in ids {
            self.close_peer(&id, reason).await;
        }
        self.early_candidates.clear();
        self.retired.clear();
        self.room_requested = false;
        let room = std::mem::take(&mut self.room);
        self.media.release();
        if room.room_id.is_some() {
            info!(room = ?room.room_id, ?reason, "left room");
            self.events.emit(SessionEvent::RoomLeft {
                room_id: room.room_id,
            });
        }
    }

    fn on_channel_open(&mut self) {
        let flushed = self.outbox.flush();
        info!(flushed, "signaling channel ready");
    }

    async fn on_channel_lost(&mut self) {
        self.outbox.discard();
        let active = self.room.room_id.is_some() || !self.peers.is_empty();
        if active {
            self.report(None, SessionError::ChannelUnavailable);
        }
        self.teardown(CloseReason::ChannelClosed).await;
    }

    /// Fallback Relay entry point.
    pub async fn send_message(&mut self, target: ParticipantId, message: Value) -> Delivery {
        let peer = self.peers.get_mut(&target);
        self.relay
            .send(peer, &target, message, &mut self.outbox)
            .await
    }

    pub async fn sweep(&mut self, reason: SweepReason) {
        let restarted = self
            .health
            .sweep(reason, &mut self.peers, &mut self.outbox)
            .await;
        for r in restarted {
            self.settle(&r.participant, r.before, r.result).await;
        }
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.media.set_muted(muted);
        self.events.emit(SessionEvent::MuteChanged(muted));
    }
}

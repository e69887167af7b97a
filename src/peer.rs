//! Per-participant negotiation state machine.
//!
//! Initiator: `Created -> OfferSent -> AnswerExchanged -> Connected`.
//! Responder: `Created -> OfferReceived -> AnswerExchanged -> Connected`.
//! Degradation moves `Connected -> Disconnected`, an ICE restart moves
//! `Disconnected -> Reconnecting`, and a successful renegotiation returns to
//! `Connected`. `Closed` is terminal.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{NegotiationStage, Result, SessionError};
use crate::protocol::{self, ChannelFrame, ClientMessage, IceCandidate, ParticipantId, SessionDescription};
use crate::signaling::Outbox;
use crate::transport::{Connectivity, FallbackChannel, PeerTransport, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Created,
    OfferSent,
    OfferReceived,
    AnswerExchanged,
    Connected,
    Disconnected,
    Reconnecting,
    Closed,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerState::Created => "created",
            PeerState::OfferSent => "offer_sent",
            PeerState::OfferReceived => "offer_received",
            PeerState::AnswerExchanged => "answer_exchanged",
            PeerState::Connected => "connected",
            PeerState::Disconnected => "disconnected",
            PeerState::Reconnecting => "reconnecting",
            PeerState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Read-only view of a peer session.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerSnapshot {
    pub participant: ParticipantId,
    pub role: Role,
    pub state: PeerState,
    pub pending_candidates: usize,
    pub fallback_open: bool,
    pub last_activity: DateTime<Utc>,
}

pub struct PeerSession {
    participant: ParticipantId,
    role: Role,
    generation: u64,
    state: PeerState,
    transport: Box<dyn PeerTransport>,
    fallback: Option<Box<dyn FallbackChannel>>,
    pending_candidates: VecDeque<IceCandidate>,
    remote_description_set: bool,
    pending_offer: Option<SessionDescription>,
    restart_started: Option<Instant>,
    local_candidates: Vec<IceCandidate>,
    gathering_complete: bool,
    candidates_punched: bool,
    last_activity: DateTime<Utc>,
}

impl PeerSession {
    pub fn new(
        participant: ParticipantId,
        role: Role,
        generation: u64,
        transport: Box<dyn PeerTransport>,
    ) -> Self {
        Self {
            participant,
            role,
            generation,
            state: PeerState::Created,
            transport,
            fallback: None,
            pending_candidates: VecDeque::new(),
            remote_description_set: false,
            pending_offer: None,
            restart_started: None,
            local_candidates: Vec::new(),
            gathering_complete: false,
            candidates_punched: false,
            last_activity: Utc::now(),
        }
    }

    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == PeerState::Closed
    }

    pub fn connectivity(&self) -> Connectivity {
        self.transport.connectivity()
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn fallback_open(&self) -> bool {
        self.fallback.as_ref().is_some_and(|ch| ch.is_open())
    }

    pub fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            participant: self.participant.clone(),
            role: self.role,
            state: self.state,
            pending_candidates: self.pending_candidates.len(),
            fallback_open: self.fallback_open(),
            last_activity: self.last_activity,
        }
    }

    fn set_state(&mut self, next: PeerState) {
        if self.state == next {
            return;
        }
        debug!(participant = %self.participant, from = %self.state, to = %next, "peer state");
        self.state = next;
    }

    fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    fn awaiting_answer(&self) -> bool {
        self.pending_offer.is_some()
    }

    fn restart_overdue(&self, now: Instant, retry_after: Duration) -> bool {
        self.restart_started
            .map_or(true, |t| now.saturating_duration_since(t) >= retry_after)
    }

    /// Candidates that arrived before this session existed, in arrival order.
    pub fn preload_candidates(&mut self, early: Vec<IceCandidate>) {
        self.pending_candidates.extend(early);
    }

    /// Builds, applies and sends an offer. With `ice_restart` the offer
    /// re-runs ICE on the existing transport.
    pub async fn start_offer(&mut self, outbox: &mut Outbox, ice_restart: bool) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        let offer = self
            .transport
            .create_offer(ice_restart)
            .await
            .map_err(|e| SessionError::negotiation(&self.participant, NegotiationStage::CreateOffer, e))?;
        if self.is_closed() {
            return Ok(());
        }
        self.transport
            .set_local_description(offer.clone())
            .await
            .map_err(|e| {
                SessionError::negotiation(&self.participant, NegotiationStage::SetLocalDescription, e)
            })?;
        self.pending_offer = Some(offer.clone());
        outbox.send(&ClientMessage::Offer {
            target_id: self.participant.clone(),
            offer,
            ice_restart,
        });
        self.touch();
        if ice_restart {
            self.restart_started = Some(Instant::now());
            self.set_state(PeerState::Reconnecting);
        } else if self.state == PeerState::Created {
            self.set_state(PeerState::OfferSent);
        }
        Ok(())
    }

    /// Applies a remote offer and answers it. A second offer on an
    /// established session is treated as renegotiation.
    ///
    /// A pending local offer is rolled back first so the transport is stable
    /// when the remote offer lands.
    pub async fn handle_offer(&mut self, offer: SessionDescription, outbox: &mut Outbox) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        if let Some(pending) = self.pending_offer.take() {
            debug!(participant = %self.participant, "remote offer supersedes our pending offer");
            self.transport
                .set_local_description(SessionDescription::rollback(pending.sdp))
                .await
                .map_err(|e| {
                    SessionError::negotiation(&self.participant, NegotiationStage::SetLocalDescription, e)
                })?;
        }
        self.touch();
        self.apply_remote(offer).await?;
        if self.state == PeerState::Created {
            self.set_state(PeerState::OfferReceived);
        }

        let answer = self
            .transport
            .create_answer()
            .await
            .map_err(|e| SessionError::negotiation(&self.participant, NegotiationStage::CreateAnswer, e))?;
        if self.is_closed() {
            return Ok(());
        }
        self.transport
            .set_local_description(answer.clone())
            .await
            .map_err(|e| {
                SessionError::negotiation(&self.participant, NegotiationStage::SetLocalDescription, e)
            })?;
        outbox.send(&ClientMessage::Answer {
            target_id: self.participant.clone(),
            answer,
        });
        self.answer_exchanged();
        Ok(())
    }

    pub async fn handle_answer(&mut self, answer: SessionDescription) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        if !self.awaiting_answer() {
            warn!(participant = %self.participant, state = %self.state, "discarding unexpected answer");
            return Ok(());
        }
        self.touch();
        self.pending_offer = None;
        self.apply_remote(answer).await?;
        self.answer_exchanged();
        Ok(())
    }

    /// Applies a remote candidate, or buffers it until a remote description
    /// is in place. Never changes the primary state.
    pub async fn handle_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        self.touch();
        if !self.remote_description_set {
            self.pending_candidates.push_back(candidate);
            debug!(
                participant = %self.participant,
                buffered = self.pending_candidates.len(),
                "buffering candidate until remote description"
            );
            return Ok(());
        }
        self.add_candidate(candidate).await
    }

    async fn apply_remote(&mut self, desc: SessionDescription) -> Result<()> {
        self.transport
            .set_remote_description(desc)
            .await
            .map_err(|e| {
                SessionError::negotiation(&self.participant, NegotiationStage::SetRemoteDescription, e)
            })?;
        self.remote_description_set = true;
        while let Some(candidate) = self.pending_candidates.pop_front() {
            if self.is_closed() {
                break;
            }
            self.add_candidate(candidate).await?;
        }
        Ok(())
    }

    async fn add_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
        self.transport
            .add_ice_candidate(candidate)
            .await
            .map_err(|e| SessionError::negotiation(&self.participant, NegotiationStage::AddCandidate, e))
    }

    fn answer_exchanged(&mut self) {
        self.set_state(PeerState::AnswerExchanged);
        if self.transport.connectivity() == Connectivity::Connected {
            self.restart_started = None;
            self.set_state(PeerState::Connected);
        }
    }

    /// Reacts to a transport connectivity report. `Closed` from the transport
    /// is a terminal failure and closes the session.
    pub async fn on_connectivity(&mut self, connectivity: Connectivity) {
        if self.is_closed() {
            return;
        }
        match connectivity {
            Connectivity::Connected => {
                if matches!(
                    self.state,
                    PeerState::AnswerExchanged | PeerState::Disconnected | PeerState::Reconnecting
                ) {
                    self.restart_started = None;
                    self.set_state(PeerState::Connected);
                }
            }
            Connectivity::Disconnected | Connectivity::Failed => {
                if matches!(
                    self.state,
                    PeerState::AnswerExchanged | PeerState::Connected | PeerState::Reconnecting
                ) {
                    warn!(participant = %self.participant, ?connectivity, "transport degraded");
                    self.set_state(PeerState::Disconnected);
                }
            }
            Connectivity::Closed => {
                warn!(participant = %self.participant, "transport closed underneath session");
                self.close().await;
            }
            Connectivity::New | Connectivity::Connecting => {}
        }
    }

    /// True when a health sweep should (re)issue an ICE restart.
    ///
    /// A restart still in flight is left alone until it has been outstanding
    /// for `retry_after`.
    pub fn needs_restart(&self, now: Instant, retry_after: Duration) -> bool {
        if !self.transport.connectivity().is_degraded() {
            return false;
        }
        match self.state {
            PeerState::AnswerExchanged | PeerState::Connected | PeerState::Disconnected => true,
            PeerState::Reconnecting => self.restart_overdue(now, retry_after),
            _ => false,
        }
    }

    /// Starts recovery of a degraded transport.
    ///
    /// The initiator re-offers with the ICE-restart flag; the responder asks
    /// the initiator to do so, which keeps both sides from offering at once.
    pub async fn restart_ice(&mut self, outbox: &mut Outbox) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        if self.state != PeerState::Reconnecting {
            self.set_state(PeerState::Disconnected);
        }
        info!(participant = %self.participant, role = ?self.role, "ice restart");
        match self.role {
            Role::Initiator => self.start_offer(outbox, true).await,
            Role::Responder => {
                outbox.send(&ClientMessage::IceRestart {
                    target_id: self.participant.clone(),
                });
                self.restart_started = Some(Instant::now());
                self.set_state(PeerState::Reconnecting);
                Ok(())
            }
        }
    }

    /// Remote side asked us to restart ICE.
    ///
    /// While one of our offers is unanswered the request is ignored, unless
    /// that offer is a restart that has been outstanding for `retry_after`.
    pub async fn handle_restart_request(&mut self, outbox: &mut Outbox, retry_after: Duration) -> Result<()> {
        if self.role != Role::Initiator {
            debug!(participant = %self.participant, "ignoring restart request as responder");
            return Ok(());
        }
        if self.awaiting_answer() {
            if self.restart_started.is_none() || !self.restart_overdue(Instant::now(), retry_after) {
                return Ok(());
            }
            debug!(participant = %self.participant, "restart answer overdue, re-offering");
        }
        match self.state {
            PeerState::AnswerExchanged
            | PeerState::Connected
            | PeerState::Disconnected
            | PeerState::Reconnecting => self.start_offer(outbox, true).await,
            _ => Ok(()),
        }
    }

    /// Trickles a locally gathered candidate and keeps it for the hole-punch batch.
    pub fn on_local_candidate(&mut self, candidate: IceCandidate, outbox: &mut Outbox) {
        if self.is_closed() {
            return;
        }
        self.local_candidates.push(candidate.clone());
        outbox.send(&ClientMessage::IceCandidate {
            target_id: self.participant.clone(),
            candidate,
        });
    }

    pub async fn on_gathering_complete(&mut self) {
        self.gathering_complete = true;
        self.punch_candidates().await;
    }

    pub async fn on_channel_open(&mut self, channel: Box<dyn FallbackChannel>) {
        if self.is_closed() {
            channel.close().await;
            return;
        }
        info!(participant = %self.participant, "fallback channel open");
        if let Some(old) = self.fallback.replace(channel) {
            old.close().await;
        }
        self.punch_candidates().await;
    }

    pub async fn on_channel_closed(&mut self) {
        if let Some(ch) = self.fallback.take() {
            debug!(participant = %self.participant, "fallback channel closed");
            ch.close().await;
        }
    }

    /// Sends every gathered local candidate once over the fallback channel,
    /// as soon as both gathering is done and the channel is open.
    async fn punch_candidates(&mut self) {
        if self.candidates_punched || !self.gathering_complete || self.is_closed() {
            return;
        }
        let Some(channel) = self.fallback.as_ref().filter(|ch| ch.is_open()) else {
            return;
        };
        let frame = ChannelFrame::Candidates {
            candidates: self.local_candidates.clone(),
        };
        let text = match protocol::encode_frame(&frame) {
            Ok(t) => t,
            Err(err) => {
                warn!(participant = %self.participant, "encode candidate batch: {err}");
                return;
            }
        };
        match channel.send_text(text).await {
            Ok(()) => {
                self.candidates_punched = true;
                debug!(
                    participant = %self.participant,
                    count = self.local_candidates.len(),
                    "sent candidate batch over fallback channel"
                );
            }
            Err(err) => warn!(participant = %self.participant, "candidate batch send failed: {err}"),
        }
    }

    /// Handles a frame from the fallback channel. Application messages are
    /// handed back to the caller.
    pub async fn on_channel_message(&mut self, raw: &str) -> Result<Option<Value>> {
        if self.is_closed() {
            return Ok(None);
        }
        self.touch();
        let frame = match protocol::decode_frame(raw) {
            Ok(f) => f,
            Err(err) => {
                warn!(participant = %self.participant, "discarding malformed channel frame: {err}");
                return Ok(None);
            }
        };
        match frame {
            ChannelFrame::Candidates { candidates } => {
                debug!(participant = %self.participant, count = candidates.len(), "received candidate batch");
                for candidate in candidates {
                    self.handle_candidate(candidate).await?;
                }
                Ok(None)
            }
            ChannelFrame::Message { message } => Ok(Some(message)),
        }
    }

    /// Sends an application message over the fallback channel when it is open.
    pub async fn send_direct(&mut self, message: &Value) -> bool {
        let Some(channel) = self.fallback.as_ref().filter(|ch| ch.is_open()) else {
            return false;
        };
        let frame = ChannelFrame::Message {
            message: message.clone(),
        };
        let text = match protocol::encode_frame(&frame) {
            Ok(t) => t,
            Err(_) => return false,
        };
        match channel.send_text(text).await {
            Ok(()) => {
                self.touch();
                true
            }
            Err(err) => {
                debug!(participant = %self.participant, "direct send failed: {err}");
                false
            }
        }
    }

    /// Releases the fallback channel and the transport. Irreversible.
    pub async fn close(&mut self) {
        if self.is_closed() {
            return;
        }
        self.set_state(PeerState::Closed);
        self.pending_offer = None;
        self.pending_candidates.clear();
        if let Some(ch) = self.fallback.take() {
            ch.close().await;
        }
        self.transport.close().await;
        info!(participant = %self.participant, "peer session closed");
    }
}

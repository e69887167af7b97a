#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use voicecall_rs::error::{Result, SessionError};
use voicecall_rs::events::SessionEvent;
use voicecall_rs::media::LocalMedia;
use voicecall_rs::protocol::{self, IceCandidate, ParticipantId, SdpKind, SessionDescription};
use voicecall_rs::relay::{Delivery, FallbackRelay, MessageHandler};
use voicecall_rs::session::{Event, SessionManager};
use voicecall_rs::signaling::{SignalingChannel, SignalingEvent};
use voicecall_rs::transport::{
    Connectivity, FallbackChannel, PeerEvent, PeerEventSink, PeerTransport, Role, TransportFactory,
};

/// Captures every frame handed to the signaling channel.
pub struct FakeChannel {
    open: AtomicBool,
    sent: Mutex<Vec<String>>,
}

impl FakeChannel {
    pub fn new(open: bool) -> Arc<Self> {
        Arc::new(Self {
            open: AtomicBool::new(open),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Value> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|s| serde_json::from_str(s).unwrap())
            .collect()
    }

    pub fn sent_of(&self, kind: &str) -> Vec<Value> {
        self.sent()
            .into_iter()
            .filter(|m| m["type"] == kind)
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }
}

impl SignalingChannel for FakeChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send_text(&self, text: String) -> Result<()> {
        if !self.is_open() {
            return Err(SessionError::ChannelUnavailable);
        }
        self.sent.lock().unwrap().push(text);
        Ok(())
    }
}

/// Operation a fake transport can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailAt {
    Create,
    CreateOffer,
    CreateAnswer,
    SetRemote,
    AddCandidate,
}

/// Offer/answer position of a fake transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signaling {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

#[derive(Debug)]
pub struct SpyState {
    pub calls: Vec<String>,
    pub candidates: Vec<String>,
    pub connectivity: Connectivity,
    pub closed: bool,
    pub fail: Option<FailAt>,
    pub signaling: Signaling,
    offers: usize,
}

/// What one fake transport was asked to do.
pub struct TransportSpy {
    state: Mutex<SpyState>,
}

impl TransportSpy {
    fn new(fail: Option<FailAt>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SpyState {
                calls: Vec::new(),
                candidates: Vec::new(),
                connectivity: Connectivity::New,
                closed: false,
                fail,
                signaling: Signaling::Stable,
                offers: 0,
            }),
        })
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn candidates(&self) -> Vec<String> {
        self.state.lock().unwrap().candidates.clone()
    }

    pub fn closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    pub fn signaling(&self) -> Signaling {
        self.state.lock().unwrap().signaling
    }

    pub fn set_connectivity(&self, c: Connectivity) {
        self.state.lock().unwrap().connectivity = c;
    }

    fn check(&self, op: FailAt) -> Result<()> {
        if self.state.lock().unwrap().fail == Some(op) {
            return Err(SessionError::Transport(format!("injected {op:?} failure")));
        }
        Ok(())
    }

    fn record(&self, call: String) {
        self.state.lock().unwrap().calls.push(call);
    }
}

pub struct FakeTransport {
    spy: Arc<TransportSpy>,
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        self.spy.check(FailAt::CreateOffer)?;
        let n = {
            let mut state = self.spy.state.lock().unwrap();
            state.offers += 1;
            state.offers
        };
        self.spy.record(if ice_restart {
            "create_offer(restart)".into()
        } else {
            "create_offer".into()
        });
        Ok(SessionDescription::offer(format!("offer-{n}")))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.spy.check(FailAt::CreateAnswer)?;
        self.spy.record("create_answer".into());
        Ok(SessionDescription::answer("answer-sdp"))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        let mut state = self.spy.state.lock().unwrap();
        let next = match (desc.kind, state.signaling) {
            (SdpKind::Offer, Signaling::Stable | Signaling::HaveLocalOffer) => Signaling::HaveLocalOffer,
            (SdpKind::Answer | SdpKind::Pranswer, Signaling::HaveRemoteOffer) => Signaling::Stable,
            (SdpKind::Rollback, Signaling::HaveLocalOffer) => Signaling::Stable,
            (kind, current) => {
                return Err(SessionError::Transport(format!(
                    "local {kind:?} not allowed in {current:?}"
                )))
            }
        };
        state.signaling = next;
        state.calls.push(match desc.kind {
            SdpKind::Rollback => "rollback".into(),
            _ => format!("set_local:{}", desc.sdp),
        });
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.spy.check(FailAt::SetRemote)?;
        let mut state = self.spy.state.lock().unwrap();
        let next = match (desc.kind, state.signaling) {
            (SdpKind::Offer, Signaling::Stable | Signaling::HaveRemoteOffer) => Signaling::HaveRemoteOffer,
            (SdpKind::Answer | SdpKind::Pranswer, Signaling::HaveLocalOffer) => Signaling::Stable,
            (kind, current) => {
                return Err(SessionError::Transport(format!(
                    "remote {kind:?} not allowed in {current:?}"
                )))
            }
        };
        state.signaling = next;
        state.calls.push(format!("set_remote:{}", desc.sdp));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.spy.check(FailAt::AddCandidate)?;
        self.spy.record(format!("add_candidate:{}", candidate.candidate));
        self.spy
            .state
            .lock()
            .unwrap()
            .candidates
            .push(candidate.candidate);
        Ok(())
    }

    fn connectivity(&self) -> Connectivity {
        self.spy.state.lock().unwrap().connectivity
    }

    async fn close(&self) {
        let mut state = self.spy.state.lock().unwrap();
        state.closed = true;
        state.connectivity = Connectivity::Closed;
    }
}

#[derive(Default)]
struct FactoryState {
    created: Vec<(ParticipantId, Role)>,
    spies: HashMap<ParticipantId, Arc<TransportSpy>>,
    sinks: HashMap<ParticipantId, PeerEventSink>,
    fail: HashMap<ParticipantId, FailAt>,
}

/// Hands out fake transports and keeps a spy plus event sink per peer.
#[derive(Default)]
pub struct FakeFactory {
    state: Mutex<FactoryState>,
}

impl FakeFactory {
    pub fn fail(&self, participant: &str, at: FailAt) {
        self.state
            .lock()
            .unwrap()
            .fail
            .insert(participant.into(), at);
    }

    pub fn created(&self) -> Vec<(ParticipantId, Role)> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn created_count(&self, participant: &str) -> usize {
        let id = ParticipantId::from(participant);
        self.created().iter().filter(|(p, _)| *p == id).count()
    }

    /// Spy on the most recent transport built for `participant`.
    pub fn spy(&self, participant: &str) -> Arc<TransportSpy> {
        Arc::clone(&self.state.lock().unwrap().spies[&ParticipantId::from(participant)])
    }

    pub fn sink(&self, participant: &str) -> PeerEventSink {
        self.state.lock().unwrap().sinks[&ParticipantId::from(participant)].clone()
    }
}

#[async_trait]
impl TransportFactory for FakeFactory {
    async fn create(
        &self,
        participant: &ParticipantId,
        role: Role,
        events: PeerEventSink,
    ) -> Result<Box<dyn PeerTransport>> {
        let mut state = self.state.lock().unwrap();
        let fail = state.fail.get(participant).copied();
        if fail == Some(FailAt::Create) {
            return Err(SessionError::Transport("injected create failure".into()));
        }
        let spy = TransportSpy::new(fail);
        state.created.push((participant.clone(), role));
        state.spies.insert(participant.clone(), Arc::clone(&spy));
        state.sinks.insert(participant.clone(), events);
        Ok(Box::new(FakeTransport { spy }))
    }
}

#[derive(Default)]
pub struct FakeMedia {
    pub deny: AtomicBool,
    pub acquired: AtomicUsize,
    pub stopped: AtomicUsize,
    pub enabled: AtomicBool,
}

#[async_trait]
impl LocalMedia for FakeMedia {
    async fn acquire(&self) -> Result<()> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(SessionError::MediaUnavailable("permission denied".into()));
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        self.enabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FallbackSpy {
    pub open: AtomicBool,
    pub closed: AtomicBool,
    pub sent: Mutex<Vec<String>>,
}

impl FallbackSpy {
    pub fn frames(&self) -> Vec<Value> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|s| serde_json::from_str(s).unwrap())
            .collect()
    }
}

pub struct FakeFallback(pub Arc<FallbackSpy>);

impl FakeFallback {
    pub fn open() -> (Box<dyn FallbackChannel>, Arc<FallbackSpy>) {
        let spy = Arc::new(FallbackSpy::default());
        spy.open.store(true, Ordering::SeqCst);
        (Box::new(FakeFallback(Arc::clone(&spy))), spy)
    }
}

#[async_trait]
impl FallbackChannel for FakeFallback {
    fn is_open(&self) -> bool {
        self.0.open.load(Ordering::SeqCst)
    }

    async fn send_text(&self, text: String) -> Result<()> {
        if !self.is_open() {
            return Err(SessionError::Transport("fallback channel closed".into()));
        }
        self.0.sent.lock().unwrap().push(text);
        Ok(())
    }

    async fn close(&self) {
        self.0.open.store(false, Ordering::SeqCst);
        self.0.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct Inbox {
    pub messages: Mutex<Vec<(ParticipantId, Value, Delivery)>>,
}

impl MessageHandler for Inbox {
    fn on_message(&self, sender: &ParticipantId, message: Value, via: Delivery) {
        self.messages
            .lock()
            .unwrap()
            .push((sender.clone(), message, via));
    }
}

/// A session manager driven by hand, one event at a time.
pub struct Harness {
    pub manager: SessionManager,
    pub rx: mpsc::UnboundedReceiver<Event>,
    pub channel: Arc<FakeChannel>,
    pub factory: Arc<FakeFactory>,
    pub media: Arc<FakeMedia>,
    pub inbox: Arc<Inbox>,
    events: broadcast::Receiver<SessionEvent>,
}

impl Harness {
    pub fn new() -> Self {
        let channel = FakeChannel::new(true);
        let factory = Arc::new(FakeFactory::default());
        let media = Arc::new(FakeMedia::default());
        let inbox = Arc::new(Inbox::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = SessionManager::new(channel.clone(), factory.clone(), media.clone(), tx)
            .with_relay(FallbackRelay::new(Some(inbox.clone() as Arc<dyn MessageHandler>)));
        let events = manager.events().subscribe();
        Self {
            manager,
            rx,
            channel,
            factory,
            media,
            inbox,
            events,
        }
    }

    /// Feeds one server message through the dispatch loop.
    pub async fn signal(&mut self, msg: Value) {
        let msg = protocol::decode(&msg.to_string()).unwrap();
        self.manager
            .dispatch(Event::Signaling(SignalingEvent::Message(msg)))
            .await;
    }

    /// Dispatches everything transports have queued so far.
    pub async fn pump(&mut self) {
        while let Ok(event) = self.rx.try_recv() {
            self.manager.dispatch(event).await;
        }
    }

    /// Reports `c` from the transport of `participant` and processes it.
    pub async fn connectivity(&mut self, participant: &str, c: Connectivity) {
        self.factory.spy(participant).set_connectivity(c);
        self.factory
            .sink(participant)
            .emit(PeerEvent::Connectivity(c));
        self.pump().await;
    }

    pub async fn join_room(&mut self, room: &str, roster: &[&str]) {
        self.signal(serde_json::json!({
            "type": "room_joined",
            "roomId": room,
            "participants": roster,
        }))
        .await;
    }

    /// Completes the initiator side of a call with `participant`.
    pub async fn connect_as_initiator(&mut self, participant: &str) {
        self.signal(serde_json::json!({"type": "new_participant", "id": participant}))
            .await;
        self.signal(serde_json::json!({
            "type": "answer",
            "senderId": participant,
            "answer": {"type": "answer", "sdp": format!("answer-from-{participant}")},
        }))
        .await;
        self.connectivity(participant, Connectivity::Connected).await;
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = self.events.try_recv() {
            out.push(ev);
        }
        out
    }

    pub fn event_names(&mut self) -> Vec<&'static str> {
        self.drain_events().iter().map(|e| e.name()).collect()
    }
}

pub fn offer(sdp: &str) -> Value {
    serde_json::json!({"type": "offer", "sdp": sdp})
}

pub fn candidate(c: &str) -> Value {
    serde_json::json!({"candidate": c, "sdpMid": "0", "sdpMLineIndex": 0})
}

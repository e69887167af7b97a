use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::config::Config;
use crate::events::{Events, SessionEvent};
use crate::health::HealthMonitor;
use crate::relay::{FallbackRelay, MessageHandler};
use crate::rtc::{RtcTransportFactory, TrackMedia};
use crate::session::{RoomRequest, SessionHandle, SessionManager};
use crate::signaling::WsSignaling;

/// Wires the session core to a WebSocket signaling server and webrtc-rs.
pub struct Client {
    cfg: Config,
    handler: Option<Arc<dyn MessageHandler>>,
    media: Arc<TrackMedia>,
}

impl Client {
    pub fn new(cfg: Config) -> Self {
        Self {
            cfg,
            handler: None,
            media: Arc::new(TrackMedia::new()),
        }
    }

    pub fn with_message_handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// The outgoing audio track; feed encoded capture frames here.
    pub fn media(&self) -> Arc<TrackMedia> {
        Arc::clone(&self.media)
    }

    /// Connects, waits for the channel to open and issues the room request.
    pub async fn start(&self, request: RoomRequest) -> Result<Call> {
        let call_id = Uuid::new_v4();
        let span = tracing::info_span!("call", %call_id);
        let url = self.cfg.signaling_url()?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let factory = Arc::new(RtcTransportFactory::new(
            &self.cfg.ice_servers,
            Arc::clone(&self.media),
        )?);
        let (channel, mut gate, signaling) = {
            let _enter = span.enter();
            WsSignaling::connect(url.clone(), event_tx.clone())
        };

        let events = Events::default();
        let manager = SessionManager::new(channel, factory, self.media.clone(), event_tx)
            .with_events(events.clone())
            .with_relay(FallbackRelay::new(self.handler.clone()))
            .with_health(HealthMonitor::new(self.cfg.health_interval()));
        let handle = manager.handle();

        let observer = tokio::spawn(log_events(events.subscribe()).instrument(span.clone()));
        let session = tokio::spawn(manager.run(event_rx).instrument(span.clone()));

        if let Err(err) = gate.wait_open(self.cfg.open_timeout()).await {
            handle.shutdown();
            let _ = session.await;
            observer.abort();
            signaling.abort();
            return Err(err).with_context(|| format!("signaling server {url} unavailable"));
        }
        span.in_scope(|| info!(url = %url, ?request, "signaling open; requesting room"));
        handle.request_room(request);

        Ok(Call {
            call_id,
            handle,
            events,
            session,
            signaling,
            observer,
        })
    }
}

/// A running call started by [`Client::start`].
pub struct Call {
    call_id: Uuid,
    handle: SessionHandle,
    events: Events,
    session: JoinHandle<()>,
    signaling: JoinHandle<()>,
    observer: JoinHandle<()>,
}

impl Call {
    pub fn call_id(&self) -> Uuid {
        self.call_id
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    pub fn events(&self) -> &Events {
        &self.events
    }

    /// Leaves the room and waits for the session loop to finish.
    pub async fn stop(self) -> Result<()> {
        self.handle.shutdown();
        self.session.await.context("session loop panicked")?;
        self.signaling.abort();
        self.observer.abort();
        info!(call_id = %self.call_id, "call stopped");
        Ok(())
    }
}

async fn log_events(mut rx: broadcast::Receiver<SessionEvent>) {
    loop {
        match rx.recv().await {
            Ok(SessionEvent::Error { participant, error }) => {
                warn!(participant = ?participant, "session error: {error}");
            }
            Ok(event) => info!(event = event.name(), "{event:?}"),
            Err(RecvError::Lagged(n)) => warn!(skipped = n, "event observer lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

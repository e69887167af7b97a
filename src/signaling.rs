use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::error::{Result, SessionError};
use crate::protocol::{self, ClientMessage, ServerMessage};
use crate::session::Event;

/// Reliable ordered transport to the coordination server.
pub trait SignalingChannel: Send + Sync {
    fn is_open(&self) -> bool;
    /// Fails with [`SessionError::ChannelUnavailable`] unless the channel is open.
    fn send_text(&self, text: String) -> Result<()>;
}

#[derive(Debug)]
pub enum SignalingEvent {
    Open,
    Message(ServerMessage),
    Error(String),
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Connecting,
    Open,
    Closed,
}

/// Lets callers wait for the signaling channel to finish connecting.
#[derive(Clone)]
pub struct OpenGate {
    rx: watch::Receiver<ChannelStatus>,
}

impl OpenGate {
    pub fn new(rx: watch::Receiver<ChannelStatus>) -> Self {
        Self { rx }
    }

    pub fn status(&self) -> ChannelStatus {
        *self.rx.borrow()
    }

    pub async fn wait_open(&mut self, limit: Duration) -> Result<()> {
        let waited = tokio::time::timeout(limit, async {
            loop {
                let current = *self.rx.borrow_and_update();
                match current {
                    ChannelStatus::Open => return Ok(()),
                    ChannelStatus::Closed => return Err(SessionError::ChannelUnavailable),
                    ChannelStatus::Connecting => {}
                }
                if self.rx.changed().await.is_err() {
                    return Err(SessionError::ChannelUnavailable);
                }
            }
        })
        .await;
        waited.unwrap_or(Err(SessionError::ChannelUnavailable))
    }
}

/// Outbound queue in front of the signaling channel.
///
/// Messages sent while the channel is still connecting are kept in order and
/// flushed once it reports open.
pub struct Outbox {
    channel: Arc<dyn SignalingChannel>,
    queued: VecDeque<String>,
}

impl Outbox {
    pub fn new(channel: Arc<dyn SignalingChannel>) -> Self {
        Self {
            channel,
            queued: VecDeque::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    pub fn queued(&self) -> usize {
        self.queued.len()
    }

    pub fn send(&mut self, msg: &ClientMessage) {
        let text = match protocol::encode(msg) {
            Ok(t) => t,
            Err(err) => {
                error!(kind = msg.kind(), "encode signaling message: {err}");
                return;
            }
        };
        if !self.queued.is_empty() {
            self.queued.push_back(text);
            return;
        }
        if let Err(err) = self.channel.send_text(text.clone()) {
            warn!(kind = msg.kind(), "signaling send deferred: {err}");
            self.queued.push_back(text);
        }
    }

    /// Sends now or not at all.
    pub fn send_now(&mut self, msg: &ClientMessage) -> Result<()> {
        let text = protocol::encode(msg)?;
        self.channel.send_text(text)
    }

    /// Drains the queue in order; stops at the first failure.
    pub fn flush(&mut self) -> usize {
        let mut sent = 0;
        while let Some(text) = self.queued.pop_front() {
            if let Err(err) = self.channel.send_text(text.clone()) {
                debug!("signaling flush paused: {err}");
                self.queued.push_front(text);
                break;
            }
            sent += 1;
        }
        sent
    }

    pub fn discard(&mut self) {
        if !self.queued.is_empty() {
            debug!(dropped = self.queued.len(), "discarding queued signaling messages");
        }
        self.queued.clear();
    }
}

/// WebSocket-backed signaling channel.
pub struct WsSignaling {
    out_tx: mpsc::UnboundedSender<String>,
    status: watch::Receiver<ChannelStatus>,
}

impl WsSignaling {
    /// Starts connecting in the background. Inbound traffic and lifecycle
    /// changes are delivered to `events` as [`Event::Signaling`].
    pub fn connect(
        url: Url,
        events: mpsc::UnboundedSender<Event>,
    ) -> (Arc<Self>, OpenGate, JoinHandle<()>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
        let (status_tx, status_rx) = watch::channel(ChannelStatus::Connecting);
        let channel = Arc::new(Self {
            out_tx,
            status: status_rx.clone(),
        });
        let task = tokio::spawn(run_ws(url, events, out_rx, status_tx));
        (channel, OpenGate::new(status_rx), task)
    }
}

impl SignalingChannel for WsSignaling {
    fn is_open(&self) -> bool {
        *self.status.borrow() == ChannelStatus::Open
    }

    fn send_text(&self, text: String) -> Result<()> {
        if !self.is_open() {
            return Err(SessionError::ChannelUnavailable);
        }
        self.out_tx
            .send(text)
            .map_err(|_| SessionError::ChannelUnavailable)
    }
}

async fn run_ws(
    url: Url,
    events: mpsc::UnboundedSender<Event>,
    mut out_rx: mpsc::UnboundedReceiver<String>,
    status: watch::Sender<ChannelStatus>,
) {
    let ws_stream = match connect_async(url.as_str()).await {
        Ok((stream, _)) => stream,
        Err(err) => {
            error!(url = %url, "signaling connect failed: {err}");
            let _ = status.send(ChannelStatus::Closed);
            let _ = events.send(Event::Signaling(SignalingEvent::Error(err.to_string())));
            let _ = events.send(Event::Signaling(SignalingEvent::Closed));
            return;
        }
    };
    info!(url = %url, "signaling channel open");
    let (mut write, mut read) = ws_stream.split();
    let _ = status.send(ChannelStatus::Open);
    let _ = events.send(Event::Signaling(SignalingEvent::Open));

    // writer
    let write_task = tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if let Err(err) = write.send(Message::Text(text)).await {
                error!("signaling send error: {err}");
                break;
            }
        }
        let _ = write.close().await;
    });

    // reader
    while let Some(msg) = read.next().await {
        let text = match msg {
            Ok(Message::Text(txt)) => txt,
            Ok(Message::Binary(bin)) => match String::from_utf8(bin) {
                Ok(txt) => txt,
                Err(_) => {
                    warn!("dropping non-utf8 binary signaling frame");
                    continue;
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                let _ = events.send(Event::Signaling(SignalingEvent::Error(err.to_string())));
                break;
            }
        };
        match protocol::decode(&text) {
            Ok(parsed) => {
                if events
                    .send(Event::Signaling(SignalingEvent::Message(parsed)))
                    .is_err()
                {
                    break;
                }
            }
            Err(err) => warn!("discarding malformed signaling message: {err}"),
        }
    }

    let _ = status.send(ChannelStatus::Closed);
    write_task.abort();
    info!("signaling channel closed");
    let _ = events.send(Event::Signaling(SignalingEvent::Closed));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Toggle {
        open: Mutex<bool>,
        sent: Mutex<Vec<String>>,
    }

    impl SignalingChannel for Toggle {
        fn is_open(&self) -> bool {
            *self.open.lock().unwrap()
        }

        fn send_text(&self, text: String) -> Result<()> {
            if !self.is_open() {
                return Err(SessionError::ChannelUnavailable);
            }
            self.sent.lock().unwrap().push(text);
            Ok(())
        }
    }

    #[test]
    fn outbox_queues_until_open_then_flushes_in_order() {
        let chan = Arc::new(Toggle {
            open: Mutex::new(false),
            sent: Mutex::new(Vec::new()),
        });
        let mut outbox = Outbox::new(chan.clone());
        outbox.send(&ClientMessage::CreateRoom { room_id: None });
        outbox.send(&ClientMessage::LeaveRoom);
        assert_eq!(outbox.queued(), 2);
        assert!(chan.sent.lock().unwrap().is_empty());

        *chan.open.lock().unwrap() = true;
        assert_eq!(outbox.flush(), 2);
        let sent = chan.sent.lock().unwrap().clone();
        assert_eq!(
            sent,
            vec![
                r#"{"type":"create_room"}"#.to_string(),
                r#"{"type":"leave_room"}"#.to_string()
            ]
        );
    }

    #[test]
    fn send_now_does_not_queue() {
        let chan = Arc::new(Toggle {
            open: Mutex::new(false),
            sent: Mutex::new(Vec::new()),
        });
        let mut outbox = Outbox::new(chan);
        let err = outbox.send_now(&ClientMessage::LeaveRoom).unwrap_err();
        assert!(matches!(err, SessionError::ChannelUnavailable));
        assert_eq!(outbox.queued(), 0);
    }

    #[tokio::test]
    async fn open_gate_resolves_on_open_and_fails_on_close() {
        let (tx, rx) = watch::channel(ChannelStatus::Connecting);
        let mut gate = OpenGate::new(rx);
        let opener = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = tx.send(ChannelStatus::Open);
            tx
        });
        gate.wait_open(Duration::from_secs(2)).await.unwrap();
        let tx = opener.await.unwrap();

        let _ = tx.send(ChannelStatus::Closed);
        assert!(gate.wait_open(Duration::from_secs(1)).await.is_err());
    }

    #[tokio::test]
    async fn open_gate_times_out() {
        let (_tx, rx) = watch::channel(ChannelStatus::Connecting);
        let mut gate = OpenGate::new(rx);
        let err = gate.wait_open(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, SessionError::ChannelUnavailable));
    }
}

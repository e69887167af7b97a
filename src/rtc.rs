//! webrtc-rs backed transports, fallback channels and the outgoing audio track.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::config::IceServerConfig;
use crate::error::{Result, SessionError};
use crate::media::LocalMedia;
use crate::protocol::{IceCandidate, ParticipantId, SdpKind, SessionDescription};
use crate::transport::{
    Connectivity, FallbackChannel, PeerEvent, PeerEventSink, PeerTransport, Role, TransportFactory,
};

pub const FALLBACK_LABEL: &str = "fallback";

fn transport_err(context: &str, err: impl std::fmt::Display) -> SessionError {
    SessionError::Transport(format!("{context}: {err}"))
}

fn to_rtc_ice_server(server: &IceServerConfig) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

/// Outgoing 48kHz Opus track shared by every peer connection.
///
/// Capture happens outside this crate; whoever owns the device pushes encoded
/// frames through [`TrackMedia::write_sample`]. Frames are dropped while the
/// track is stopped or muted.
pub struct TrackMedia {
    track: Arc<TrackLocalStaticSample>,
    live: AtomicBool,
    enabled: AtomicBool,
}

impl TrackMedia {
    pub fn new() -> Self {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                rtcp_feedback: vec![],
            },
            "audio".to_owned(),
            "voicecall-rs".to_owned(),
        ));
        Self {
            track,
            live: AtomicBool::new(false),
            enabled: AtomicBool::new(true),
        }
    }

    pub fn track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.track)
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst) && self.enabled.load(Ordering::SeqCst)
    }

    pub async fn write_sample(&self, sample: &Sample) -> Result<()> {
        if !self.is_live() {
            return Ok(());
        }
        self.track
            .write_sample(sample)
            .await
            .map_err(|e| transport_err("write sample", e))
    }
}

impl Default for TrackMedia {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LocalMedia for TrackMedia {
    async fn acquire(&self) -> Result<()> {
        self.live.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }
}

/// Builds one `RTCPeerConnection` per remote participant.
pub struct RtcTransportFactory {
    api: API,
    config: RTCConfiguration,
    media: Arc<TrackMedia>,
}

impl RtcTransportFactory {
    pub fn new(ice_servers: &[IceServerConfig], media: Arc<TrackMedia>) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| transport_err("register codecs", e))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| transport_err("register interceptors", e))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers.iter().map(to_rtc_ice_server).collect(),
            ..Default::default()
        };
        Ok(Self { api, config, media })
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        participant: &ParticipantId,
        role: Role,
        events: PeerEventSink,
    ) -> Result<Box<dyn PeerTransport>> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.config.clone())
                .await
                .map_err(|e| transport_err("new peer connection", e))?,
        );

        pc.add_track(self.media.track() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| transport_err("add track", e))?;

        let sink = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = sink.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    sink.emit(PeerEvent::GatheringComplete);
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        sink.emit(PeerEvent::LocalCandidate(from_rtc_candidate(init)));
                    }
                    Err(err) => warn!(participant = %sink.participant(), "candidate to_json: {err}"),
                }
            })
        }));

        let sink = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let sink = sink.clone();
            Box::pin(async move {
                sink.emit(PeerEvent::Connectivity(map_state(s)));
            })
        }));

        match role {
            Role::Initiator => {
                let dc = pc
                    .create_data_channel(FALLBACK_LABEL, None)
                    .await
                    .map_err(|e| transport_err("create data channel", e))?;
                wire_channel(dc, events);
            }
            Role::Responder => {
                pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                    let sink = events.clone();
                    Box::pin(async move {
                        if dc.label() == FALLBACK_LABEL {
                            wire_channel(dc, sink);
                        } else {
                            debug!(label = dc.label(), "ignoring unexpected data channel");
                        }
                    })
                }));
            }
        }

        debug!(participant = %participant, ?role, "rtc peer connection ready");
        Ok(Box::new(RtcTransport { pc }))
    }
}

fn wire_channel(dc: Arc<RTCDataChannel>, sink: PeerEventSink) {
    let weak: Weak<RTCDataChannel> = Arc::downgrade(&dc);
    let open_sink = sink.clone();
    dc.on_open(Box::new(move || {
        let sink = open_sink.clone();
        let weak = weak.clone();
        Box::pin(async move {
            if let Some(dc) = weak.upgrade() {
                sink.emit(PeerEvent::ChannelOpen(Box::new(RtcChannel { dc })));
            }
        })
    }));

    let message_sink = sink.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let sink = message_sink.clone();
        Box::pin(async move {
            match String::from_utf8(msg.data.to_vec()) {
                Ok(text) => {
                    sink.emit(PeerEvent::ChannelMessage(text));
                }
                Err(_) => debug!(participant = %sink.participant(), "dropping binary channel frame"),
            }
        })
    }));

    dc.on_close(Box::new(move || {
        let sink = sink.clone();
        Box::pin(async move {
            sink.emit(PeerEvent::ChannelClosed);
        })
    }));
}

fn map_state(s: RTCPeerConnectionState) -> Connectivity {
    match s {
        RTCPeerConnectionState::Connecting => Connectivity::Connecting,
        RTCPeerConnectionState::Connected => Connectivity::Connected,
        RTCPeerConnectionState::Disconnected => Connectivity::Disconnected,
        RTCPeerConnectionState::Failed => Connectivity::Failed,
        RTCPeerConnectionState::Closed => Connectivity::Closed,
        _ => Connectivity::New,
    }
}

fn from_rtc_candidate(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let parsed = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
        // webrtc-rs rolls back from the description type; the SDP is the
        // withdrawn offer so the local-description parse succeeds.
        SdpKind::Rollback => {
            return serde_json::to_value(&desc)
                .and_then(serde_json::from_value::<RTCSessionDescription>)
                .map_err(|e| SessionError::Protocol(format!("invalid rollback: {e}")))
        }
    };
    parsed.map_err(|e| SessionError::Protocol(format!("invalid sdp: {e}")))
}

fn from_rtc_description(desc: RTCSessionDescription) -> Result<SessionDescription> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        other => return Err(SessionError::Transport(format!("unexpected sdp type {other}"))),
    };
    Ok(SessionDescription {
        kind,
        sdp: desc.sdp,
    })
}

pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerTransport for RtcTransport {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        let options = ice_restart.then_some(RTCOfferOptions {
            ice_restart: true,
            voice_activity_detection: false,
        });
        let offer = self
            .pc
            .create_offer(options)
            .await
            .map_err(|e| transport_err("create offer", e))?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| transport_err("create answer", e))?;
        from_rtc_description(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        let desc = to_rtc_description(desc)?;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(|e| transport_err("set local description", e))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let desc = to_rtc_description(desc)?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| transport_err("set remote description", e))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(|e| transport_err("add ice candidate", e))
    }

    fn connectivity(&self) -> Connectivity {
        map_state(self.pc.connection_state())
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            debug!("peer connection close: {err}");
        }
    }
}

pub struct RtcChannel {
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl FallbackChannel for RtcChannel {
    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: String) -> Result<()> {
        self.dc
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(|e| transport_err("fallback send", e))
    }

    async fn close(&self) {
        if let Err(err) = self.dc.close().await {
            debug!("fallback channel close: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_connection_states_map_to_connectivity() {
        assert_eq!(map_state(RTCPeerConnectionState::Connected), Connectivity::Connected);
        assert_eq!(map_state(RTCPeerConnectionState::Failed), Connectivity::Failed);
        assert_eq!(map_state(RTCPeerConnectionState::Unspecified), Connectivity::New);
    }

    #[test]
    fn rollback_keeps_type_and_sdp() {
        let desc = to_rtc_description(SessionDescription::rollback("v=0\r\n")).unwrap();
        assert_eq!(desc.sdp_type, RTCSdpType::Rollback);
        assert_eq!(desc.sdp, "v=0\r\n");
    }

    #[test]
    fn ice_server_credentials_are_carried() {
        let server = IceServerConfig {
            urls: vec!["turn:turn.example.com:3478".into()],
            username: Some("u".into()),
            credential: None,
        };
        let rtc = to_rtc_ice_server(&server);
        assert_eq!(rtc.urls, server.urls);
        assert_eq!(rtc.username, "u");
        assert_eq!(rtc.credential, "");
    }

    #[tokio::test]
    async fn track_media_follows_mute_and_stop() {
        let media = TrackMedia::new();
        assert!(!media.is_live());
        media.acquire().await.unwrap();
        assert!(media.is_live());
        media.set_enabled(false);
        assert!(!media.is_live());
        media.set_enabled(true);
        media.stop();
        assert!(!media.is_live());
    }
}

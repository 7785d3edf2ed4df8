//! webrtc-rs backed transport.
//!
//! Implements the peer seam on `webrtc::peer_connection::RTCPeerConnection`.
//! Every engine callback is reduced to a [`TransportEvent`] pushed into the
//! connection's event queue; nothing here touches session state directly.

use async_trait::async_trait;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use super::error::SessionError;
use super::media::{LocalAudioTrack, MediaSource};
use super::peer::{
    DataChannelTransport, PeerConfig, PeerTransport, PeerTransportFactory, TransportEvent,
    TransportEventSender, TransportState,
};

fn transport_err(context: &str) -> impl Fn(webrtc::Error) -> SessionError + '_ {
    move |e| SessionError::Transport(format!("{context}: {e}"))
}

impl From<RTCPeerConnectionState> for TransportState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => Self::Connecting,
            RTCPeerConnectionState::Connected => Self::Connected,
            RTCPeerConnectionState::Disconnected => Self::Disconnected,
            RTCPeerConnectionState::Failed => Self::Failed,
            RTCPeerConnectionState::Closed => Self::Closed,
            _ => Self::New,
        }
    }
}

// ── Local Opus track ───────────────────────────────────────────────

/// Microphone track fed with Opus frames by the capture layer.
pub struct WebRtcAudioTrack {
    id: String,
    track: Arc<TrackLocalStaticSample>,
    stopped: AtomicBool,
}

impl WebRtcAudioTrack {
    pub fn new(id: &str) -> Self {
        let track = TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48_000,
                channels: 2,
                ..Default::default()
            },
            "audio".to_owned(),
            id.to_owned(),
        );
        Self {
            id: id.to_owned(),
            track: Arc::new(track),
            stopped: AtomicBool::new(false),
        }
    }

    /// Write one encoded Opus frame. Frames after `stop()` are discarded.
    pub async fn write_opus_frame(&self, frame: Vec<u8>, duration: Duration) -> Result<(), SessionError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.track
            .write_sample(&Sample {
                data: frame.into(),
                duration,
                ..Default::default()
            })
            .await
            .map_err(transport_err("failed to write audio sample"))
    }

    fn rtc_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.track.clone()
    }
}

impl LocalAudioTrack for WebRtcAudioTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Hands out one Opus track per session; capture writes into it.
#[derive(Default)]
pub struct OpusTrackSource {
    current: parking_lot::Mutex<Option<Arc<WebRtcAudioTrack>>>,
}

impl OpusTrackSource {
    /// The track handed out by the last `acquire`, for the capture layer.
    pub fn current(&self) -> Option<Arc<WebRtcAudioTrack>> {
        self.current.lock().clone()
    }
}

#[async_trait]
impl MediaSource for OpusTrackSource {
    async fn acquire(&self) -> Result<Arc<dyn LocalAudioTrack>, SessionError> {
        let track = Arc::new(WebRtcAudioTrack::new(&format!(
            "mic-{}",
            uuid::Uuid::new_v4().simple()
        )));
        *self.current.lock() = Some(Arc::clone(&track));
        Ok(track)
    }
}

// ── Data channel ───────────────────────────────────────────────────

struct WebRtcDataChannel {
    inner: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannelTransport for WebRtcDataChannel {
    async fn send_text(&self, text: String) -> Result<(), SessionError> {
        self.inner
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(transport_err("data channel send failed"))
    }

    async fn close(&self) -> Result<(), SessionError> {
        self.inner
            .close()
            .await
            .map_err(transport_err("data channel close failed"))
    }
}

// ── Peer connection ────────────────────────────────────────────────

struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    events: TransportEventSender,
}

#[async_trait]
impl PeerTransport for WebRtcPeer {
    async fn add_local_audio(&self, track: Arc<dyn LocalAudioTrack>) -> Result<(), SessionError> {
        let Some(track) = track.as_any().downcast_ref::<WebRtcAudioTrack>() else {
            return Err(SessionError::Media(format!(
                "track {} is not a WebRTC audio track",
                track.id()
            )));
        };
        self.pc
            .add_track(track.rtc_track())
            .await
            .map_err(transport_err("failed to add local audio"))?;
        Ok(())
    }

    async fn watch_remote_audio(&self) -> Result<(), SessionError> {
        let events = self.events.clone();
        self.pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let events = events.clone();
            Box::pin(async move {
                if track.kind() != RTPCodecType::Audio {
                    return;
                }
                tracing::info!(
                    codec = %track.codec().capability.mime_type,
                    "Remote audio track received"
                );
                tokio::spawn(async move {
                    while let Ok((packet, _)) = track.read_rtp().await {
                        if events
                            .send(TransportEvent::RemoteAudio(packet.payload.to_vec()))
                            .is_err()
                        {
                            break;
                        }
                    }
                });
            })
        }));
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
        ordered: bool,
    ) -> Result<Arc<dyn DataChannelTransport>, SessionError> {
        let dc = self
            .pc
            .create_data_channel(
                label,
                Some(RTCDataChannelInit {
                    ordered: Some(ordered),
                    ..Default::default()
                }),
            )
            .await
            .map_err(transport_err("failed to create data channel"))?;

        let on_open = self.events.clone();
        dc.on_open(Box::new(move || {
            let _ = on_open.send(TransportEvent::ChannelOpen);
            Box::pin(async {})
        }));

        let on_message = self.events.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            if msg.is_string {
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => {
                        let _ = on_message.send(TransportEvent::ChannelMessage(text));
                    }
                    Err(e) => tracing::warn!(error = %e, "Dropping non-UTF-8 data channel message"),
                }
            }
            Box::pin(async {})
        }));

        let on_close = self.events.clone();
        dc.on_close(Box::new(move || {
            let _ = on_close.send(TransportEvent::ChannelClosed);
            Box::pin(async {})
        }));

        Ok(Arc::new(WebRtcDataChannel { inner: dc }))
    }

    async fn create_offer(&self) -> Result<String, SessionError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(transport_err("failed to create offer"))?;

        // Non-trickle signaling: wait for every candidate to land in the SDP.
        let mut gathered = self.pc.gathering_complete_promise().await;
        self.pc
            .set_local_description(offer)
            .await
            .map_err(transport_err("failed to set local description"))?;
        let _ = gathered.recv().await;

        self.pc
            .local_description()
            .await
            .map(|d| d.sdp)
            .ok_or_else(|| SessionError::Negotiation("no local description after gathering".into()))
    }

    async fn accept_answer(&self, sdp: &str) -> Result<(), SessionError> {
        let answer = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| SessionError::Negotiation(format!("invalid SDP answer: {e}")))?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| SessionError::Negotiation(format!("failed to apply SDP answer: {e}")))
    }

    async fn close(&self) -> Result<(), SessionError> {
        self.pc
            .close()
            .await
            .map_err(transport_err("peer connection close failed"))
    }
}

/// Builds webrtc-rs peer connections with default codecs and interceptors.
pub struct WebRtcTransportFactory {
    api: API,
}

impl WebRtcTransportFactory {
    pub fn new() -> anyhow::Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api })
    }
}

#[async_trait]
impl PeerTransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        config: &PeerConfig,
        events: TransportEventSender,
    ) -> Result<Arc<dyn PeerTransport>, SessionError> {
        let rtc_config = RTCConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = Arc::new(
            self.api
                .new_peer_connection(rtc_config)
                .await
                .map_err(transport_err("failed to create peer connection"))?,
        );

        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            tracing::debug!(state = %state, "Peer connection state changed");
            let _ = state_events.send(TransportEvent::PeerState(state.into()));
            Box::pin(async {})
        }));

        Ok(Arc::new(WebRtcPeer { pc, events }))
    }
}

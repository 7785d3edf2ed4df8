//! Peer connection controller.
//!
//! Owns one peer-to-peer media session against the realtime voice endpoint:
//!
//! 1. **Create** peer connection configured with public STUN servers
//! 2. **Attach** local microphone track so the model hears the user
//! 3. **Listen** remote audio forwarded into a playback sink
//! 4. **Channel** ordered data channel for protocol events
//! 5. **Signal** SDP offer POSTed with the credential as bearer token,
//!    answer applied as the remote description
//!
//! The underlying RTC engine reports everything (state changes, channel
//! open/close, inbound messages, remote audio) as [`TransportEvent`]s pushed
//! into a single-consumer queue; the coordinator drains that queue. A
//! [`PeerConnection`] is never reused: reconnects build a new one.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::credential::Credential;
use super::error::SessionError;
use super::events::ConnectionStatus;
use super::media::{AudioOutput, AudioSink, LocalAudioTrack};

// ── Transport seam ─────────────────────────────────────────────────

/// Peer connection state as reported by the RTC engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Everything the RTC engine reports, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    PeerState(TransportState),
    ChannelOpen,
    ChannelMessage(String),
    ChannelClosed,
    RemoteAudio(Vec<u8>),
}

pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;
pub type TransportEventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Settings for constructing a peer connection.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub ice_servers: Vec<String>,
    pub data_channel_label: String,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            data_channel_label: "oai-events".to_string(),
        }
    }
}

/// Outbound side of the protocol data channel.
#[async_trait]
pub trait DataChannelTransport: Send + Sync {
    async fn send_text(&self, text: String) -> Result<(), SessionError>;
    async fn close(&self) -> Result<(), SessionError>;
}

/// One RTC engine peer connection.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn add_local_audio(&self, track: Arc<dyn LocalAudioTrack>) -> Result<(), SessionError>;

    /// Start forwarding remote audio as [`TransportEvent::RemoteAudio`].
    async fn watch_remote_audio(&self) -> Result<(), SessionError>;

    async fn create_data_channel(
        &self,
        label: &str,
        ordered: bool,
    ) -> Result<Arc<dyn DataChannelTransport>, SessionError>;

    /// Create an offer, set it as the local description and return its SDP.
    async fn create_offer(&self) -> Result<String, SessionError>;

    async fn accept_answer(&self, sdp: &str) -> Result<(), SessionError>;

    async fn close(&self) -> Result<(), SessionError>;
}

/// Builds RTC engine peer connections that report into `events`.
#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    async fn create(
        &self,
        config: &PeerConfig,
        events: TransportEventSender,
    ) -> Result<Arc<dyn PeerTransport>, SessionError>;
}

// ── SDP exchange ──────────────────────────────────────────────────

/// Posts an SDP offer to the voice endpoint and returns the answer.
#[async_trait]
pub trait SdpExchange: Send + Sync {
    async fn exchange(&self, credential: &Credential, offer: &str) -> Result<String, SessionError>;
}

/// SDP exchange against `{api_base}/v1/realtime?model=...`.
pub struct HttpSdpExchange {
    endpoint: String,
    http: reqwest::Client,
}

impl HttpSdpExchange {
    pub fn new(api_base: &str, model: &str, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            endpoint: format!("{}/v1/realtime?model={model}", api_base.trim_end_matches('/')),
            http,
        })
    }
}

#[async_trait]
impl SdpExchange for HttpSdpExchange {
    async fn exchange(&self, credential: &Credential, offer: &str) -> Result<String, SessionError> {
        let resp = self
            .http
            .post(&self.endpoint)
            .bearer_auth(credential.token())
            .header(reqwest::header::CONTENT_TYPE, "application/sdp")
            .body(offer.to_string())
            .send()
            .await
            .map_err(|e| SessionError::Negotiation(format!("SDP endpoint unreachable: {e}")))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| SessionError::Negotiation(format!("failed to read SDP answer: {e}")))?;

        if !status.is_success() {
            return Err(SessionError::Negotiation(format!(
                "SDP endpoint returned HTTP {}: {}",
                status.as_u16(),
                body.trim()
            )));
        }
        if !body.starts_with("v=") {
            return Err(SessionError::Negotiation(
                "SDP endpoint returned a body that is not an SDP answer".into(),
            ));
        }
        Ok(body)
    }
}

// ── Connection state ──────────────────────────────────────────────

/// Lifecycle of one peer connection instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Negotiating,
    Open,
    Closing,
    Closed,
    Failed,
}

impl ConnectionState {
    fn rank(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Negotiating => 1,
            Self::Open => 2,
            Self::Closing => 3,
            Self::Closed | Self::Failed => 4,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    /// Transitions only move forward; `Closed` and `Failed` are terminal.
    pub fn can_advance_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == Self::Failed {
            return self != Self::Closing;
        }
        next.rank() > self.rank()
    }
}

// ── Connection handle ─────────────────────────────────────────────

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to one live (or negotiating) peer connection.
pub struct PeerConnection {
    id: u64,
    state: Mutex<ConnectionState>,
    transport: Arc<dyn PeerTransport>,
    data_channel: Arc<dyn DataChannelTransport>,
    sink: Mutex<Option<Box<dyn AudioSink>>>,
    closed: AtomicBool,
}

impl PeerConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn data_channel(&self) -> Arc<dyn DataChannelTransport> {
        Arc::clone(&self.data_channel)
    }

    fn advance(&self, next: ConnectionState) -> bool {
        let mut state = self.state.lock();
        if !state.can_advance_to(next) {
            return false;
        }
        tracing::debug!(
            connection = self.id,
            from = ?*state,
            to = ?next,
            "Peer connection state"
        );
        *state = next;
        true
    }

    /// Fold an engine-reported state into this connection's state and return
    /// the status transition it represents, if any.
    pub fn apply_transport_state(&self, reported: TransportState) -> Option<ConnectionStatus> {
        match reported {
            TransportState::New | TransportState::Connecting => {
                (self.state() == ConnectionState::Negotiating).then_some(ConnectionStatus::Connecting)
            }
            TransportState::Connected => self
                .advance(ConnectionState::Open)
                .then_some(ConnectionStatus::Connected),
            // ICE may recover on its own from `disconnected`.
            TransportState::Disconnected => {
                tracing::warn!(connection = self.id, "Peer connection disconnected");
                None
            }
            TransportState::Failed => self
                .advance(ConnectionState::Failed)
                .then_some(ConnectionStatus::Failed),
            TransportState::Closed => {
                let changed = {
                    let mut state = self.state.lock();
                    if state.is_terminal() {
                        false
                    } else {
                        *state = ConnectionState::Closed;
                        true
                    }
                };
                changed.then_some(ConnectionStatus::Closed)
            }
        }
    }

    /// Route remote audio to the playback sink; dropped once detached.
    pub fn play_remote(&self, payload: &[u8]) {
        if let Some(sink) = self.sink.lock().as_mut() {
            sink.play(payload);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the peer connection, then detach the remote sink. Idempotent.
    ///
    /// The local track is not touched: it belongs to the session and outlives
    /// individual connections.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.advance(ConnectionState::Closing);
        if let Err(e) = self.transport.close().await {
            tracing::warn!(connection = self.id, error = %e, "Peer connection close failed");
        }
        self.advance(ConnectionState::Closed);

        let sink = self.sink.lock().take();
        if let Some(mut sink) = sink {
            sink.detach();
        }
        tracing::debug!(connection = self.id, "Peer connection closed");
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ── Controller ────────────────────────────────────────────────────

/// Builds peer connections.
pub struct PeerConnectionController {
    config: PeerConfig,
    factory: Arc<dyn PeerTransportFactory>,
    sdp: Arc<dyn SdpExchange>,
    output: Arc<dyn AudioOutput>,
}

impl PeerConnectionController {
    pub fn new(
        config: PeerConfig,
        factory: Arc<dyn PeerTransportFactory>,
        sdp: Arc<dyn SdpExchange>,
        output: Arc<dyn AudioOutput>,
    ) -> Self {
        Self {
            config,
            factory,
            sdp,
            output,
        }
    }

    /// Negotiate a new peer connection.
    ///
    /// Returns the connection handle together with the queue of transport
    /// events it will report. Any failure here is a `NegotiationError` for
    /// the caller. On failure or `cancel` the partially built transport is
    /// closed before returning.
    pub async fn open(
        &self,
        credential: &Credential,
        track: Arc<dyn LocalAudioTrack>,
        cancel: &CancellationToken,
    ) -> Result<(Arc<PeerConnection>, TransportEventReceiver), SessionError> {
        if credential.is_expired(Utc::now()) {
            return Err(SessionError::Negotiation(
                "refusing to negotiate with an expired credential".into(),
            ));
        }

        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        tracing::info!(
            connection = id,
            ice_servers = ?self.config.ice_servers,
            "Opening peer connection"
        );

        let transport = self
            .factory
            .create(&self.config, events_tx)
            .await
            .map_err(as_negotiation)?;

        let negotiated = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
            result = self.negotiate(&transport, credential, track) => result,
        };
        match negotiated {
            Ok(data_channel) => {
                let connection = PeerConnection {
                    id,
                    state: Mutex::new(ConnectionState::Negotiating),
                    transport,
                    data_channel,
                    sink: Mutex::new(Some(self.output.open_sink())),
                    closed: AtomicBool::new(false),
                };
                Ok((Arc::new(connection), events_rx))
            }
            Err(SessionError::Cancelled) => {
                tracing::debug!(connection = id, "Peer negotiation cancelled");
                if let Err(close_err) = transport.close().await {
                    tracing::debug!(connection = id, error = %close_err, "Close after cancelled negotiation");
                }
                Err(SessionError::Cancelled)
            }
            Err(e) => {
                tracing::warn!(connection = id, error = %e, "Peer negotiation failed");
                if let Err(close_err) = transport.close().await {
                    tracing::debug!(connection = id, error = %close_err, "Close after failed negotiation");
                }
                Err(as_negotiation(e))
            }
        }
    }

    async fn negotiate(
        &self,
        transport: &Arc<dyn PeerTransport>,
        credential: &Credential,
        track: Arc<dyn LocalAudioTrack>,
    ) -> Result<Arc<dyn DataChannelTransport>, SessionError> {
        transport.add_local_audio(track).await?;
        transport.watch_remote_audio().await?;
        let data_channel = transport
            .create_data_channel(&self.config.data_channel_label, true)
            .await?;
        let offer = transport.create_offer().await?;
        let answer = self.sdp.exchange(credential, &offer).await?;
        transport.accept_answer(&answer).await?;
        Ok(data_channel)
    }
}

fn as_negotiation(err: SessionError) -> SessionError {
    match err {
        SessionError::Negotiation(_) => err,
        other => SessionError::Negotiation(other.to_string()),
    }
}

// ── Tests ──────────────────────────────────────────────────────────

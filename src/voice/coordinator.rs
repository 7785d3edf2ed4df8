//! Session lifecycle coordinator.
//!
//! ## State machine
//!
//! ```text
//! Idle ──start()──▸ Acquiring ──credential──▸ Negotiating ──peer+channel──▸ Live
//!                      │                          │                          │
//!                      └────── retries spent ─────┴──▸ Failed ◂── reconnect ─┤
//!                                                                 failed     │
//!                                    Live ◂── re-established ── Reconnecting ◂┘
//!                                                          (expiry timer / transport loss)
//! ```
//!
//! `stop()` tears down from any phase and returns to `Idle`. Reconnects are
//! invisible to the conversation store: only `start()`, `stop()` and a
//! terminal failure publish connection status.

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::bus::EventBus;
use super::channel::ProtocolChannel;
use super::credential::{Credential, CredentialBroker, Voice};
use super::error::SessionError;
use super::events::{
    ClientEvent, ConnectionStatus, InputTranscription, ProtocolEvent, SessionSettings,
    TurnDetection, DEFAULT_TRANSCRIPTION_MODEL,
};
use super::media::{AudioTrackHandle, LocalAudioTrack, MediaSource};
use super::peer::{
    PeerConnection, PeerConnectionController, TransportEvent, TransportEventReceiver,
};
use crate::config::Config;

// ── Configuration ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// How long before `expires_at` the expiry timer fires.
    pub refresh_margin: Duration,
    /// Credential acquisitions per connect before giving up.
    pub issuance_attempts: u32,
    /// First retry delay; doubles per attempt.
    pub issuance_backoff: Duration,
    /// Upper bound on waiting for peer-connected and channel-open.
    pub negotiation_timeout: Duration,
    pub instructions: Option<String>,
    pub transcription_model: String,
    pub turn_detection: TurnDetection,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            refresh_margin: Duration::from_secs(10),
            issuance_attempts: 3,
            issuance_backoff: Duration::from_millis(500),
            negotiation_timeout: Duration::from_secs(15),
            instructions: None,
            transcription_model: DEFAULT_TRANSCRIPTION_MODEL.to_string(),
            turn_detection: TurnDetection::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            refresh_margin: Duration::from_secs(config.session.refresh_margin_secs),
            issuance_attempts: config.session.issuance_attempts,
            issuance_backoff: Duration::from_millis(config.session.issuance_backoff_ms),
            negotiation_timeout: Duration::from_secs(config.session.negotiation_timeout_secs),
            instructions: config.session.instructions.clone(),
            transcription_model: config.realtime.transcription_model.clone(),
            turn_detection: config.realtime.turn_detection.clone(),
        }
    }

    fn session_settings(&self, voice: Voice) -> SessionSettings {
        let mut settings = SessionSettings::new(voice);
        settings.instructions = self.instructions.clone();
        settings.input_audio_transcription = Some(InputTranscription {
            model: self.transcription_model.clone(),
        });
        settings.turn_detection = self.turn_detection.clone();
        settings
    }
}

// ── Lifecycle phase ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    Idle,
    Acquiring,
    Negotiating,
    Live,
    Reconnecting,
    /// `stop()` teardown in progress.
    Closing,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReconnectReason {
    CredentialExpiry,
    TransportLost,
    Requested,
}

impl ReconnectReason {
    fn as_str(self) -> &'static str {
        match self {
            Self::CredentialExpiry => "credential_expiry",
            Self::TransportLost => "transport_lost",
            Self::Requested => "requested",
        }
    }
}

/// Progress of one link towards `Live`, reported by its pump.
#[derive(Debug, Clone, PartialEq)]
enum Readiness {
    Pending,
    Live,
    Failed(String),
}

/// One peer connection plus its protocol channel and event pump.
struct ActiveLink {
    generation: u64,
    connection: Arc<PeerConnection>,
    channel: Arc<ProtocolChannel>,
    pump: JoinHandle<()>,
    expires_at: DateTime<Utc>,
}

impl ActiveLink {
    /// Data channel first, then the peer (which detaches the remote sink).
    async fn teardown(self) {
        self.channel.close().await;
        self.pump.abort();
        self.connection.close().await;
        tracing::debug!(
            generation = self.generation,
            connection = self.connection.id(),
            "Link torn down"
        );
    }
}

struct SessionState {
    phase: LifecyclePhase,
    session_id: String,
    voice: Voice,
    /// Bumped by every `start()` and `stop()`; stale work checks it.
    epoch: u64,
    cancel: CancellationToken,
    track: Option<AudioTrackHandle>,
    link: Option<ActiveLink>,
    expiry: Option<CancellationToken>,
}

struct Inner {
    config: CoordinatorConfig,
    broker: Arc<dyn CredentialBroker>,
    media: Arc<dyn MediaSource>,
    controller: PeerConnectionController,
    bus: Arc<EventBus>,
    state: Mutex<SessionState>,
    reconnecting: AtomicBool,
    next_generation: AtomicU64,
}

struct ReconnectGuard<'a>(&'a AtomicBool);

impl Drop for ReconnectGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// ── Coordinator ────────────────────────────────────────────────────

/// Drives credential → peer connection → protocol channel for one session.
pub struct SessionCoordinator {
    inner: Arc<Inner>,
}

impl SessionCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        broker: Arc<dyn CredentialBroker>,
        media: Arc<dyn MediaSource>,
        controller: PeerConnectionController,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                broker,
                media,
                controller,
                bus,
                state: Mutex::new(SessionState {
                    phase: LifecyclePhase::Idle,
                    session_id: String::new(),
                    voice: Voice::default(),
                    epoch: 0,
                    cancel: CancellationToken::new(),
                    track: None,
                    link: None,
                    expiry: None,
                }),
                reconnecting: AtomicBool::new(false),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.inner.state.lock().phase
    }

    pub fn voice(&self) -> Voice {
        self.inner.state.lock().voice
    }

    /// Identifier sent to the issuance endpoint; fresh per `start()`.
    pub fn session_id(&self) -> String {
        self.inner.state.lock().session_id.clone()
    }

    /// Expiry of the credential behind the current link.
    pub fn credential_expires_at(&self) -> Option<DateTime<Utc>> {
        self.inner.state.lock().link.as_ref().map(|l| l.expires_at)
    }

    pub fn bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.inner.bus)
    }

    /// Connect and suspend until the session is `Live` or has failed.
    ///
    /// A no-op unless the session is `Idle` or `Failed`. Returns
    /// [`SessionError::Cancelled`] if `stop()` runs before the session goes
    /// live.
    pub async fn start(&self, voice: Voice) -> Result<(), SessionError> {
        let (epoch, cancel, session_id) = {
            let mut st = self.inner.state.lock();
            if !matches!(st.phase, LifecyclePhase::Idle | LifecyclePhase::Failed) {
                tracing::debug!(phase = ?st.phase, "start() ignored: session already active");
                return Ok(());
            }
            st.epoch += 1;
            st.cancel = CancellationToken::new();
            st.phase = LifecyclePhase::Acquiring;
            st.voice = voice;
            st.session_id = uuid::Uuid::new_v4().to_string();
            (st.epoch, st.cancel.clone(), st.session_id.clone())
        };

        tracing::info!(session_id = %session_id, voice = %voice, "Starting voice session");
        self.inner
            .bus
            .publish(&ProtocolEvent::ConnectionStatus(ConnectionStatus::Connecting));

        match self.inner.run_start(epoch, &cancel).await {
            Ok(()) => Ok(()),
            Err(_) if cancel.is_cancelled() => Err(SessionError::Cancelled),
            Err(e) => {
                self.inner.fail(epoch, &e).await;
                Err(e)
            }
        }
    }

    /// Tear everything down and return to `Idle`. Idempotent.
    pub async fn stop(&self) {
        self.inner.stop().await;
    }

    /// Reconnect now with a fresh credential, exactly as the expiry timer
    /// would. Returns whether a reconnect ran and succeeded.
    pub async fn request_reconnect(&self) -> bool {
        let generation = {
            let st = self.inner.state.lock();
            match (&st.link, st.phase) {
                (Some(link), LifecyclePhase::Live) => link.generation,
                _ => return false,
            }
        };
        Arc::clone(&self.inner)
            .reconnect(generation, ReconnectReason::Requested)
            .await
    }

    /// Send a user text turn and ask the model to respond.
    pub async fn send_text(&self, text: &str) -> Result<(), SessionError> {
        let channel = self.live_channel()?;
        channel.send(&ClientEvent::user_text(text)).await?;
        channel.send(&ClientEvent::ResponseCreate).await
    }

    /// Interrupt the response in progress.
    pub async fn cancel_response(&self) -> Result<(), SessionError> {
        self.live_channel()?.send(&ClientEvent::ResponseCancel).await
    }

    fn live_channel(&self) -> Result<Arc<ProtocolChannel>, SessionError> {
        let st = self.inner.state.lock();
        match (&st.link, st.phase) {
            (Some(link), LifecyclePhase::Live) => Ok(Arc::clone(&link.channel)),
            (_, phase) => Err(SessionError::InvalidState(format!(
                "session is {phase:?}, not Live"
            ))),
        }
    }
}

impl Inner {
    async fn run_start(
        self: &Arc<Self>,
        epoch: u64,
        cancel: &CancellationToken,
    ) -> Result<(), SessionError> {
        let track = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SessionError::Cancelled),
            track = self.media.acquire() => track?,
        };
        let handle = AudioTrackHandle::new(track);
        {
            let mut st = self.state.lock();
            if st.epoch != epoch {
                drop(st);
                handle.release();
                return Err(SessionError::Cancelled);
            }
            st.track = Some(handle.clone());
        }
        self.establish(epoch, cancel, handle.track(), true).await
    }

    /// Acquire a credential, open a peer connection and wait for `Live`.
    async fn establish(
        self: &Arc<Self>,
        epoch: u64,
        cancel: &CancellationToken,
        track: Arc<dyn LocalAudioTrack>,
        announce: bool,
    ) -> Result<(), SessionError> {
        let (session_id, voice) = {
            let st = self.state.lock();
            (st.session_id.clone(), st.voice)
        };

        let credential = self.acquire_credential(&session_id, voice, cancel).await?;
        self.set_phase(epoch, LifecyclePhase::Negotiating)?;

        let (connection, events) = self.controller.open(&credential, track, cancel).await?;

        let channel = Arc::new(ProtocolChannel::new(connection.data_channel()));
        let bus = Arc::clone(&self.bus);
        channel.on_event(move |event| {
            bus.publish(&event);
        });
        // Queued until the channel opens, so it is always the first message.
        channel
            .send(&ClientEvent::SessionUpdate {
                session: self.config.session_settings(voice),
            })
            .await?;

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (ready_tx, mut ready_rx) = watch::channel(Readiness::Pending);
        let pump = tokio::spawn(pump_transport_events(
            Arc::downgrade(self),
            generation,
            Arc::clone(&connection),
            Arc::clone(&channel),
            events,
            ready_tx,
        ));

        let link = ActiveLink {
            generation,
            connection,
            channel,
            pump,
            expires_at: credential.expires_at(),
        };
        let stale = {
            let mut st = self.state.lock();
            if st.epoch == epoch {
                st.link = Some(link);
                None
            } else {
                Some(link)
            }
        };
        if let Some(link) = stale {
            link.teardown().await;
            return Err(SessionError::Cancelled);
        }

        let wait = async {
            ready_rx
                .wait_for(|r| *r != Readiness::Pending)
                .await
                .map(|r| r.clone())
        };
        let readiness = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SessionError::Cancelled),
            r = tokio::time::timeout(self.config.negotiation_timeout, wait) => r,
        };
        match readiness {
            Ok(Ok(Readiness::Live)) => {}
            Ok(Ok(Readiness::Failed(reason))) => return Err(SessionError::Negotiation(reason)),
            Ok(Ok(Readiness::Pending)) | Ok(Err(_)) => {
                return Err(SessionError::Transport(
                    "transport event queue closed before the session went live".into(),
                ))
            }
            Err(_) => {
                return Err(SessionError::Negotiation(format!(
                    "peer connection not ready after {}s",
                    self.config.negotiation_timeout.as_secs()
                )))
            }
        }

        let delay = credential.refresh_delay(Utc::now(), self.config.refresh_margin);
        let expiry = CancellationToken::new();
        {
            let mut st = self.state.lock();
            if st.epoch != epoch {
                return Err(SessionError::Cancelled);
            }
            if let Some(previous) = st.expiry.replace(expiry.clone()) {
                previous.cancel();
            }
            st.phase = LifecyclePhase::Live;
        }
        self.arm_expiry_timer(generation, delay, expiry);

        tracing::info!(
            session_id = %session_id,
            generation,
            refresh_in_secs = delay.as_secs(),
            "Voice session live"
        );
        if announce {
            self.bus
                .publish(&ProtocolEvent::ConnectionStatus(ConnectionStatus::Connected));
        }
        Ok(())
    }

    fn arm_expiry_timer(self: &Arc<Self>, generation: u64, delay: Duration, token: CancellationToken) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Some(inner) = weak.upgrade() {
                        inner.reconnect(generation, ReconnectReason::CredentialExpiry).await;
                    }
                }
            }
        });
    }

    /// Bounded, cancel-aware retry with exponential backoff.
    async fn acquire_credential(
        &self,
        session_id: &str,
        voice: Voice,
        cancel: &CancellationToken,
    ) -> Result<Credential, SessionError> {
        let attempts = self.config.issuance_attempts.max(1);
        let mut backoff = self.config.issuance_backoff;
        let mut last_err = SessionError::Issuance("no attempt made".into());

        for attempt in 1..=attempts {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SessionError::Cancelled),
                r = self.broker.acquire(session_id, voice) => r,
            };
            match result {
                Ok(credential) if !credential.is_expired(Utc::now()) => return Ok(credential),
                Ok(_) => {
                    last_err = SessionError::Issuance("issued credential already expired".into())
                }
                Err(e) => last_err = e,
            }
            tracing::warn!(attempt, attempts, error = %last_err, "Credential acquisition failed");

            if attempt < attempts {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(SessionError::Cancelled),
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = backoff.saturating_mul(2);
            }
        }
        Err(last_err)
    }

    fn set_phase(&self, epoch: u64, phase: LifecyclePhase) -> Result<(), SessionError> {
        let mut st = self.state.lock();
        if st.epoch != epoch {
            return Err(SessionError::Cancelled);
        }
        // Reconnects keep reporting `Reconnecting` until live again.
        if st.phase != LifecyclePhase::Reconnecting {
            st.phase = phase;
        }
        Ok(())
    }

    /// Replace the current link with a fresh one. No-op when a reconnect is
    /// already running, the session is not `Live`, or `generation` no longer
    /// names the current link.
    fn reconnect(self: Arc<Self>, generation: u64, reason: ReconnectReason) -> BoxFuture<'static, bool> {
        Box::pin(async move {
            if self.reconnecting.swap(true, Ordering::SeqCst) {
                tracing::debug!(generation, reason = reason.as_str(), "Reconnect already in flight");
                return false;
            }
            let _guard = ReconnectGuard(&self.reconnecting);

            let (epoch, cancel, old_link, track) = {
                let mut st = self.state.lock();
                let current = st.link.as_ref().map(|l| l.generation);
                if st.phase != LifecyclePhase::Live || current != Some(generation) {
                    return false;
                }
                st.phase = LifecyclePhase::Reconnecting;
                if let Some(expiry) = st.expiry.take() {
                    expiry.cancel();
                }
                (
                    st.epoch,
                    st.cancel.clone(),
                    st.link.take(),
                    st.track.as_ref().map(AudioTrackHandle::track),
                )
            };

            tracing::info!(generation, reason = reason.as_str(), "Reconnecting voice session");
            if let Some(link) = old_link {
                link.teardown().await;
            }

            let Some(track) = track else {
                let err = SessionError::InvalidState("no local audio track to reconnect with".into());
                self.fail(epoch, &err).await;
                return false;
            };

            match self.establish(epoch, &cancel, track, false).await {
                Ok(()) => true,
                Err(_) if cancel.is_cancelled() => false,
                Err(e) => {
                    tracing::error!(error = %e, "Reconnect failed");
                    self.fail(epoch, &e).await;
                    false
                }
            }
        })
    }

    /// Enter `Failed`: release everything and surface the error.
    async fn fail(&self, epoch: u64, err: &SessionError) {
        let (link, track) = {
            let mut st = self.state.lock();
            if st.epoch != epoch || st.phase == LifecyclePhase::Failed {
                return;
            }
            st.phase = LifecyclePhase::Failed;
            st.cancel.cancel();
            if let Some(expiry) = st.expiry.take() {
                expiry.cancel();
            }
            (st.link.take(), st.track.take())
        };

        tracing::error!(error = %err, "Voice session failed");
        if let Some(link) = link {
            link.teardown().await;
        }
        if let Some(track) = track {
            track.release();
        }
        self.bus
            .publish(&ProtocolEvent::ConnectionStatus(ConnectionStatus::Failed));
        self.bus.publish(&ProtocolEvent::fatal(err.to_string()));
    }

    async fn stop(&self) {
        let (epoch, link, track, was_active) = {
            let mut st = self.state.lock();
            let was_active = st.phase != LifecyclePhase::Idle;
            st.epoch += 1;
            st.cancel.cancel();
            if let Some(expiry) = st.expiry.take() {
                expiry.cancel();
            }
            if was_active {
                st.phase = LifecyclePhase::Closing;
            }
            (st.epoch, st.link.take(), st.track.take(), was_active)
        };

        if let Some(link) = link {
            link.teardown().await;
        }
        if let Some(track) = track {
            track.release();
        }

        {
            let mut st = self.state.lock();
            if st.epoch == epoch {
                st.phase = LifecyclePhase::Idle;
            }
        }
        if was_active {
            tracing::info!("Voice session stopped");
            self.bus
                .publish(&ProtocolEvent::ConnectionStatus(ConnectionStatus::Closed));
        }
    }
}

// ── Transport event pump ───────────────────────────────────────────

/// Single consumer of one link's transport events.
async fn pump_transport_events(
    inner: Weak<Inner>,
    generation: u64,
    connection: Arc<PeerConnection>,
    channel: Arc<ProtocolChannel>,
    mut events: TransportEventReceiver,
    ready: watch::Sender<Readiness>,
) {
    let mut peer_connected = false;
    let mut channel_open = false;

    let reason = loop {
        let Some(event) = events.recv().await else {
            break "transport event queue closed";
        };
        let lost = match event {
            TransportEvent::PeerState(reported) => {
                match connection.apply_transport_state(reported) {
                    Some(ConnectionStatus::Connected) => {
                        peer_connected = true;
                        None
                    }
                    Some(ConnectionStatus::Failed) => Some("peer connection failed"),
                    Some(ConnectionStatus::Closed) => Some("peer connection closed"),
                    _ => None,
                }
            }
            TransportEvent::ChannelOpen => match channel.mark_open().await {
                Ok(_) => {
                    channel_open = true;
                    None
                }
                Err(e) => {
                    tracing::warn!(generation, error = %e, "Flushing queued events failed");
                    Some("data channel flush failed")
                }
            },
            TransportEvent::ChannelMessage(raw) => {
                channel.receive(&raw);
                None
            }
            TransportEvent::ChannelClosed => Some("data channel closed"),
            TransportEvent::RemoteAudio(payload) => {
                connection.play_remote(&payload);
                None
            }
        };

        if let Some(reason) = lost {
            break reason;
        }

        if peer_connected && channel_open && *ready.borrow() == Readiness::Pending {
            ready.send_replace(Readiness::Live);
        }
    };

    if *ready.borrow() == Readiness::Live {
        tracing::warn!(generation, reason, "Transport lost while live");
        if let Some(inner) = inner.upgrade() {
            tokio::spawn(inner.reconnect(generation, ReconnectReason::TransportLost));
        }
    } else {
        ready.send_replace(Readiness::Failed(reason.to_string()));
    }
    tracing::debug!(generation, "Transport event pump finished");
}

// ── Tests ──────────────────────────────────────────────────────────

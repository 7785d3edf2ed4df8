//! Scripted fakes for every voice seam, shared by the in-file tests.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::credential::{Credential, CredentialBroker, Voice};
use super::error::SessionError;
use super::media::{AudioOutput, AudioSink, LocalAudioTrack, MediaSource};
use super::peer::{
    DataChannelTransport, PeerConfig, PeerTransport, PeerTransportFactory, SdpExchange,
    TransportEvent, TransportEventSender, TransportState,
};

pub fn fresh_credential(token: &str, ttl_secs: i64) -> Credential {
    Credential::new(token, Utc::now() + chrono::Duration::seconds(ttl_secs))
}

// ── Broker ─────────────────────────────────────────────────────────

/// Issues `t1`, `t2`, … with a fixed lifetime, after draining any queued
/// failures.
pub struct ScriptedBroker {
    ttl_secs: i64,
    failures: Mutex<VecDeque<SessionError>>,
    calls: Mutex<Vec<(tokio::time::Instant, Voice)>>,
    issued: AtomicUsize,
    delay: Mutex<Option<Duration>>,
}

impl ScriptedBroker {
    pub fn with_ttl(ttl_secs: i64) -> Self {
        Self {
            ttl_secs,
            failures: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            issued: AtomicUsize::new(0),
            delay: Mutex::new(None),
        }
    }

    pub fn fail_next(&self, n: usize, err: SessionError) {
        let mut failures = self.failures.lock();
        for _ in 0..n {
            failures.push_back(err.clone());
        }
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn calls(&self) -> Vec<(tokio::time::Instant, Voice)> {
        self.calls.lock().clone()
    }

    pub fn voices(&self) -> Vec<Voice> {
        self.calls.lock().iter().map(|(_, v)| *v).collect()
    }
}

#[async_trait]
impl CredentialBroker for ScriptedBroker {
    async fn acquire(&self, _session_id: &str, voice: Voice) -> Result<Credential, SessionError> {
        self.calls.lock().push((tokio::time::Instant::now(), voice));
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.failures.lock().pop_front() {
            return Err(err);
        }
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(fresh_credential(&format!("t{n}"), self.ttl_secs))
    }
}

// ── Media ──────────────────────────────────────────────────────────

pub struct FakeTrack {
    id: String,
    stops: AtomicUsize,
}

impl FakeTrack {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            stops: AtomicUsize::new(0),
        }
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl LocalAudioTrack for FakeTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Default)]
pub struct FakeMedia {
    tracks: Mutex<Vec<Arc<FakeTrack>>>,
    unavailable: AtomicBool,
}

impl FakeMedia {
    pub fn unavailable() -> Self {
        let media = Self::default();
        media.unavailable.store(true, Ordering::SeqCst);
        media
    }

    pub fn acquires(&self) -> usize {
        self.tracks.lock().len()
    }

    pub fn track(&self, i: usize) -> Arc<FakeTrack> {
        Arc::clone(&self.tracks.lock()[i])
    }
}

#[async_trait]
impl MediaSource for FakeMedia {
    async fn acquire(&self) -> Result<Arc<dyn LocalAudioTrack>, SessionError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SessionError::Media("permission denied".into()));
        }
        let mut tracks = self.tracks.lock();
        let track = Arc::new(FakeTrack::new(&format!("mic-{}", tracks.len())));
        tracks.push(Arc::clone(&track));
        Ok(track)
    }
}

// ── Audio output ───────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeAudioOutput {
    detaches: Arc<AtomicUsize>,
    played: Arc<AtomicUsize>,
}

impl FakeAudioOutput {
    pub fn detaches(&self) -> usize {
        self.detaches.load(Ordering::SeqCst)
    }

    pub fn played_bytes(&self) -> usize {
        self.played.load(Ordering::SeqCst)
    }
}

struct FakeSink {
    detaches: Arc<AtomicUsize>,
    played: Arc<AtomicUsize>,
}

impl AudioOutput for FakeAudioOutput {
    fn open_sink(&self) -> Box<dyn AudioSink> {
        Box::new(FakeSink {
            detaches: Arc::clone(&self.detaches),
            played: Arc::clone(&self.played),
        })
    }
}

impl AudioSink for FakeSink {
    fn play(&mut self, payload: &[u8]) {
        self.played.fetch_add(payload.len(), Ordering::SeqCst);
    }

    fn detach(&mut self) {
        self.detaches.fetch_add(1, Ordering::SeqCst);
    }
}

// ── Data channel ───────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeDataChannel {
    sent: Mutex<Vec<String>>,
    closes: AtomicUsize,
}

impl FakeDataChannel {
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    /// `type` of every sent message, in order.
    pub fn sent_types(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter_map(|wire| {
                let v: serde_json::Value = serde_json::from_str(wire).ok()?;
                v["type"].as_str().map(str::to_string)
            })
            .collect()
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataChannelTransport for FakeDataChannel {
    async fn send_text(&self, text: String) -> Result<(), SessionError> {
        self.sent.lock().push(text);
        Ok(())
    }

    async fn close(&self) -> Result<(), SessionError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ── Peer transport ─────────────────────────────────────────────────

pub struct FakePeer {
    calls: Mutex<Vec<String>>,
    closes: AtomicUsize,
    events: Mutex<Option<TransportEventSender>>,
    data_channel: Arc<FakeDataChannel>,
    auto_connect: bool,
}

impl FakePeer {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn data_channel(&self) -> Arc<FakeDataChannel> {
        Arc::clone(&self.data_channel)
    }

    /// Inject an engine event as if the RTC stack reported it.
    pub fn emit(&self, event: TransportEvent) {
        if let Some(events) = self.events.lock().as_ref() {
            let _ = events.send(event);
        }
    }

    /// Drop the event sender, as an engine that shuts down without a
    /// final state report would.
    pub fn hang_up(&self) {
        self.events.lock().take();
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }
}

#[async_trait]
impl PeerTransport for FakePeer {
    async fn add_local_audio(&self, track: Arc<dyn LocalAudioTrack>) -> Result<(), SessionError> {
        self.record(format!("add_local_audio:{}", track.id()));
        Ok(())
    }

    async fn watch_remote_audio(&self) -> Result<(), SessionError> {
        self.record("watch_remote_audio");
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
        ordered: bool,
    ) -> Result<Arc<dyn DataChannelTransport>, SessionError> {
        let mode = if ordered { "ordered" } else { "unordered" };
        self.record(format!("create_data_channel:{label}:{mode}"));
        Ok(self.data_channel.clone())
    }

    async fn create_offer(&self) -> Result<String, SessionError> {
        self.record("create_offer");
        Ok("v=0\r\noffer".to_string())
    }

    async fn accept_answer(&self, _sdp: &str) -> Result<(), SessionError> {
        self.record("accept_answer");
        if self.auto_connect {
            self.emit(TransportEvent::PeerState(TransportState::Connecting));
            self.emit(TransportEvent::PeerState(TransportState::Connected));
            self.emit(TransportEvent::ChannelOpen);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), SessionError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Records every peer it builds. Peers connect on `accept_answer` unless
/// built with [`FakeTransportFactory::manual`].
pub struct FakeTransportFactory {
    peers: Mutex<Vec<(Arc<FakePeer>, Vec<String>)>>,
    auto_connect: bool,
}

impl Default for FakeTransportFactory {
    fn default() -> Self {
        Self {
            peers: Mutex::new(Vec::new()),
            auto_connect: true,
        }
    }
}

impl FakeTransportFactory {
    pub fn manual() -> Self {
        Self {
            auto_connect: false,
            ..Self::default()
        }
    }

    pub fn created(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn peer(&self, i: usize) -> Arc<FakePeer> {
        Arc::clone(&self.peers.lock()[i].0)
    }

    pub fn ice_servers(&self, i: usize) -> Vec<String> {
        self.peers.lock()[i].1.clone()
    }
}

#[async_trait]
impl PeerTransportFactory for FakeTransportFactory {
    async fn create(
        &self,
        config: &PeerConfig,
        events: TransportEventSender,
    ) -> Result<Arc<dyn PeerTransport>, SessionError> {
        let peer = Arc::new(FakePeer {
            calls: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
            events: Mutex::new(Some(events)),
            data_channel: Arc::new(FakeDataChannel::default()),
            auto_connect: self.auto_connect,
        });
        self.peers
            .lock()
            .push((Arc::clone(&peer), config.ice_servers.clone()));
        Ok(peer)
    }
}

// ── SDP exchange ───────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeSdpExchange {
    tokens: Mutex<Vec<String>>,
    failures: AtomicUsize,
    delay: Mutex<Option<Duration>>,
}

impl FakeSdpExchange {
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Bearer token presented on each exchange, in order.
    pub fn tokens(&self) -> Vec<String> {
        self.tokens.lock().clone()
    }
}

#[async_trait]
impl SdpExchange for FakeSdpExchange {
    async fn exchange(&self, credential: &Credential, _offer: &str) -> Result<String, SessionError> {
        self.tokens.lock().push(credential.token().to_string());
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SessionError::Negotiation("SDP endpoint returned HTTP 500".into()));
        }
        Ok("v=0\r\nanswer".to_string())
    }
}

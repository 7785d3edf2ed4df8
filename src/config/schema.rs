use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::voice::events::{TurnDetection, DEFAULT_TRANSCRIPTION_MODEL};
use crate::voice::Voice;

/// Top-level `config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where this config was loaded from (not serialized).
    #[serde(skip)]
    pub config_path: PathBuf,
    pub realtime: RealtimeConfig,
    pub session: SessionConfig,
    pub gateway: GatewayConfig,
    pub archive: ArchiveConfig,
}

// ── Realtime endpoint ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Base URL of the voice model API (SDP exchange and upstream issuance).
    pub api_base: String,
    pub model: String,
    pub ice_servers: Vec<String>,
    pub data_channel_label: String,
    pub transcription_model: String,
    pub turn_detection: TurnDetection,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com".to_string(),
            model: "gpt-4o-realtime-preview".to_string(),
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            data_channel_label: "oai-events".to_string(),
            transcription_model: DEFAULT_TRANSCRIPTION_MODEL.to_string(),
            turn_detection: TurnDetection::default(),
        }
    }
}

// ── Session lifecycle ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Base URL of the credential issuance gateway (`/session` is appended).
    pub issuer_url: String,
    pub voice: Voice,
    pub instructions: Option<String>,
    pub refresh_margin_secs: u64,
    pub issuance_attempts: u32,
    pub issuance_backoff_ms: u64,
    pub negotiation_timeout_secs: u64,
    pub http_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            issuer_url: "http://127.0.0.1:8787".to_string(),
            voice: Voice::default(),
            instructions: None,
            refresh_margin_secs: 10,
            issuance_attempts: 3,
            issuance_backoff_ms: 500,
            negotiation_timeout_secs: 15,
            http_timeout_secs: 30,
        }
    }
}

// ── Issuance gateway ───────────────────────────────────────────────

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Upstream voice API key. Usually supplied via `OPENAI_API_KEY`.
    pub api_key: Option<String>,
    /// Credential requests allowed per client address per minute (0 = unlimited).
    pub rate_limit_per_minute: u32,
    /// Take the client address from `X-Forwarded-For` / `X-Real-IP`. Only
    /// enable behind a reverse proxy that overwrites those headers.
    pub trust_forwarded_headers: bool,
    pub max_body_bytes: usize,
    pub request_timeout_secs: u64,
    /// Allowed browser origins; empty allows any.
    pub allowed_origins: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
            api_key: None,
            rate_limit_per_minute: 10,
            trust_forwarded_headers: false,
            max_body_bytes: 64 * 1024,
            request_timeout_secs: 30,
            allowed_origins: Vec::new(),
        }
    }
}

impl fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("rate_limit_per_minute", &self.rate_limit_per_minute)
            .field("trust_forwarded_headers", &self.trust_forwarded_headers)
            .field("max_body_bytes", &self.max_body_bytes)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("allowed_origins", &self.allowed_origins)
            .finish()
    }
}

// ── Archive ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Directory for finished conversations; defaults to `~/.lingocall/conversations`.
    pub dir: Option<PathBuf>,
}

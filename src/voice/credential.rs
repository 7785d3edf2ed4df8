//! Ephemeral credential acquisition.
//!
//! A [`Credential`] authorizes exactly one connection attempt against the
//! realtime voice endpoint. It is fetched from the issuance gateway
//! (`POST /session`), never mutated, and superseded by a fresh one on every
//! reconnect.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::error::SessionError;

// ── Voice ──────────────────────────────────────────────────────────

/// Voices accepted by the realtime model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Voice {
    Alloy,
    Ash,
    Ballad,
    Coral,
    Echo,
    Sage,
    Shimmer,
    Verse,
}

impl Voice {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Alloy => "alloy",
            Self::Ash => "ash",
            Self::Ballad => "ballad",
            Self::Coral => "coral",
            Self::Echo => "echo",
            Self::Sage => "sage",
            Self::Shimmer => "shimmer",
            Self::Verse => "verse",
        }
    }

    pub fn all() -> &'static [Voice] {
        &[
            Self::Alloy,
            Self::Ash,
            Self::Ballad,
            Self::Coral,
            Self::Echo,
            Self::Sage,
            Self::Shimmer,
            Self::Verse,
        ]
    }
}

impl Default for Voice {
    fn default() -> Self {
        Self::Alloy
    }
}

impl fmt::Display for Voice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Voice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::all()
            .iter()
            .copied()
            .find(|v| v.as_str() == wanted)
            .ok_or_else(|| format!("Unknown voice: {s}"))
    }
}

// ── Credential ─────────────────────────────────────────────────────

/// Short-lived bearer token plus its absolute expiry.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    token: String,
    expires_at: DateTime<Utc>,
}

impl Credential {
    pub fn new(token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            expires_at,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Time until the expiry timer should fire.
    ///
    /// Normally `expires_at - margin`. When the credential lives shorter than
    /// twice the margin the delay is floored at half of the remaining
    /// lifetime, so the timer still fires strictly before expiry without
    /// collapsing into an immediate reconnect loop.
    pub fn refresh_delay(&self, now: DateTime<Utc>, margin: Duration) -> Duration {
        let remaining = (self.expires_at - now).to_std().unwrap_or(Duration::ZERO);
        let with_margin = remaining.saturating_sub(margin);
        with_margin.max(remaining / 2)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

// ── Broker ─────────────────────────────────────────────────────────

/// Obtains a fresh credential. One network call per acquisition, no
/// internal retry: the coordinator owns the retry policy.
#[async_trait]
pub trait CredentialBroker: Send + Sync {
    async fn acquire(&self, session_id: &str, voice: Voice) -> Result<Credential, SessionError>;
}

/// Request body for `POST /session`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct IssueRequest<'a> {
    session_id: &'a str,
    model: &'a str,
    voice: Voice,
}

/// Response body: `{"client_secret": {"value": "...", "expires_at": 1700000000}}`.
#[derive(Debug, Deserialize)]
struct IssueResponse {
    client_secret: ClientSecret,
}

#[derive(Debug, Deserialize)]
struct ClientSecret {
    value: String,
    expires_at: i64,
}

/// Credential broker backed by the issuance gateway over HTTP.
pub struct HttpCredentialBroker {
    endpoint: String,
    model: String,
    http: reqwest::Client,
}

impl HttpCredentialBroker {
    /// `issuer_url` is the gateway base URL; `/session` is appended.
    pub fn new(
        issuer_url: &str,
        model: impl Into<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            endpoint: format!("{}/session", issuer_url.trim_end_matches('/')),
            model: model.into(),
            http,
        })
    }
}

#[async_trait]
impl CredentialBroker for HttpCredentialBroker {
    async fn acquire(&self, session_id: &str, voice: Voice) -> Result<Credential, SessionError> {
        let body = IssueRequest {
            session_id,
            model: &self.model,
            voice,
        };

        let resp = self
            .http
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| SessionError::Issuance(format!("issuer unreachable: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(SessionError::Issuance(format!(
                "issuer returned HTTP {}: {}",
                status.as_u16(),
                detail.trim()
            )));
        }

        let parsed: IssueResponse = resp
            .json()
            .await
            .map_err(|e| SessionError::Issuance(format!("malformed issuer response: {e}")))?;

        if parsed.client_secret.value.is_empty() {
            return Err(SessionError::Issuance("issuer returned an empty token".into()));
        }

        let expires_at = Utc
            .timestamp_opt(parsed.client_secret.expires_at, 0)
            .single()
            .ok_or_else(|| {
                SessionError::Issuance(format!(
                    "invalid expires_at {}",
                    parsed.client_secret.expires_at
                ))
            })?;

        let credential = Credential::new(parsed.client_secret.value, expires_at);
        if credential.is_expired(Utc::now()) {
            return Err(SessionError::Issuance(
                "issuer returned an already-expired credential".into(),
            ));
        }

        tracing::debug!(
            session_id = %session_id,
            voice = %voice,
            expires_at = %credential.expires_at(),
            "Acquired ephemeral credential"
        );
        Ok(credential)
    }
}

// ── Tests ──────────────────────────────────────────────────────────

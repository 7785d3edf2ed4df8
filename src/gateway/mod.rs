//! Credential issuance gateway.
//!
//! Small axum service that mints ephemeral realtime credentials for browser
//! and CLI clients so the upstream API key never leaves the server:
//! - `POST /session` validates the voice, throttles per client address and
//!   forwards to the upstream realtime sessions endpoint
//! - `GET /health` liveness probe
//!
//! Request bodies are capped and every request has a timeout.

use crate::config::Config;
use crate::voice::Voice;
use anyhow::Result;
use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Trailing window for per-client issuance throttling.
pub const RATE_LIMIT_WINDOW_SECS: u64 = 60;

/// How often clients with no mints left in the window are forgotten.
const LEDGER_PRUNE_INTERVAL: Duration = Duration::from_secs(300);

const MAX_SESSION_ID_LEN: usize = 128;

// ── Issuance throttling ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Granted,
    Throttled { retry_after: Duration },
}

/// Caps credential mints per client address over a trailing window.
///
/// Keyed on the caller's address, never on anything in the request body:
/// a fresh `sessionId` must not buy a fresh allowance.
#[derive(Debug)]
struct IssuanceThrottle {
    per_window: usize,
    window: Duration,
    ledger: Mutex<MintLedger>,
}

#[derive(Debug)]
struct MintLedger {
    by_client: HashMap<IpAddr, VecDeque<Instant>>,
    pruned_at: Instant,
}

impl IssuanceThrottle {
    fn new(per_window: u32, window: Duration) -> Self {
        Self {
            per_window: per_window as usize,
            window,
            ledger: Mutex::new(MintLedger {
                by_client: HashMap::new(),
                pruned_at: Instant::now(),
            }),
        }
    }

    fn admit(&self, client: IpAddr) -> Admission {
        self.admit_at(client, Instant::now())
    }

    fn admit_at(&self, client: IpAddr, now: Instant) -> Admission {
        if self.per_window == 0 {
            return Admission::Granted;
        }

        let mut guard = self.ledger.lock();
        let ledger = &mut *guard;
        if now.saturating_duration_since(ledger.pruned_at) >= LEDGER_PRUNE_INTERVAL {
            ledger.by_client.retain(|_, mints| {
                expire_mints(mints, now, self.window);
                !mints.is_empty()
            });
            ledger.pruned_at = now;
        }

        let mints = ledger.by_client.entry(client).or_default();
        expire_mints(mints, now, self.window);
        if mints.len() >= self.per_window {
            let oldest = mints.front().copied().unwrap_or(now);
            let retry_after = self
                .window
                .saturating_sub(now.saturating_duration_since(oldest));
            return Admission::Throttled { retry_after };
        }
        mints.push_back(now);
        Admission::Granted
    }

    #[cfg(test)]
    fn tracked_clients(&self) -> usize {
        self.ledger.lock().by_client.len()
    }
}

fn expire_mints(mints: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while mints
        .front()
        .is_some_and(|t| now.saturating_duration_since(*t) >= window)
    {
        mints.pop_front();
    }
}

/// Address the throttle charges for this request.
///
/// Forwarded headers are only honoured when the gateway sits behind a proxy
/// that sets them; otherwise any caller could pick its own key.
fn client_addr(headers: &HeaderMap, peer: SocketAddr, trust_forwarded: bool) -> IpAddr {
    if trust_forwarded {
        for name in ["x-forwarded-for", "x-real-ip"] {
            let forwarded = headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .and_then(|first| first.trim().parse::<IpAddr>().ok());
            if let Some(ip) = forwarded {
                return ip;
            }
        }
    }
    peer.ip()
}

// ── Upstream issuance ──────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
enum IssueError {
    #[error("upstream API key is not configured")]
    MissingKey,
    #[error("upstream request failed: {0}")]
    Upstream(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSecret {
    pub value: String,
    /// Unix seconds.
    pub expires_at: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionResponse {
    pub client_secret: ClientSecret,
}

#[derive(Debug, Serialize)]
struct UpstreamSessionRequest<'a> {
    model: &'a str,
    voice: Voice,
    modalities: [&'static str; 2],
    #[serde(skip_serializing_if = "Option::is_none")]
    instructions: Option<&'a str>,
}

/// Client for `POST {api_base}/v1/realtime/sessions`.
struct UpstreamIssuer {
    endpoint: String,
    api_key: Option<String>,
    instructions: Option<String>,
    http: reqwest::Client,
}

impl UpstreamIssuer {
    fn new(
        api_base: &str,
        api_key: Option<String>,
        instructions: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            endpoint: format!("{}/v1/realtime/sessions", api_base.trim_end_matches('/')),
            api_key,
            instructions,
            http,
        })
    }

    async fn issue(&self, model: &str, voice: Voice) -> Result<ClientSecret, IssueError> {
        let key = self.api_key.as_deref().ok_or(IssueError::MissingKey)?;
        let body = UpstreamSessionRequest {
            model,
            voice,
            modalities: ["audio", "text"],
            instructions: self.instructions.as_deref(),
        };

        let resp = self
            .http
            .post(&self.endpoint)
            .bearer_auth(key)
            .json(&body)
            .send()
            .await
            .map_err(|e| IssueError::Upstream(format!("unreachable: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(IssueError::Upstream(format!("HTTP {}", status.as_u16())));
        }

        let parsed: SessionResponse = resp
            .json()
            .await
            .map_err(|e| IssueError::Upstream(format!("malformed response: {e}")))?;
        let secret = parsed.client_secret;
        if secret.value.is_empty() {
            return Err(IssueError::Upstream("empty client secret".into()));
        }
        if secret.expires_at <= chrono::Utc::now().timestamp() {
            return Err(IssueError::Upstream("client secret already expired".into()));
        }
        Ok(secret)
    }
}

// ── State and router ───────────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    issuer: Arc<UpstreamIssuer>,
    throttle: Arc<IssuanceThrottle>,
    trust_forwarded: bool,
    default_model: String,
}

impl AppState {
    pub fn from_config(config: &Config) -> Result<Self> {
        let issuer = UpstreamIssuer::new(
            &config.realtime.api_base,
            config.gateway.api_key.clone(),
            config.session.instructions.clone(),
            Duration::from_secs(config.session.http_timeout_secs),
        )?;
        Ok(Self {
            issuer: Arc::new(issuer),
            throttle: Arc::new(IssuanceThrottle::new(
                config.gateway.rate_limit_per_minute,
                Duration::from_secs(RATE_LIMIT_WINDOW_SECS),
            )),
            trust_forwarded: config.gateway.trust_forwarded_headers,
            default_model: config.realtime.model.clone(),
        })
    }
}

pub fn build_router(state: AppState, config: &Config) -> Result<Router> {
    let origins = &config.gateway.allowed_origins;
    let cors = CorsLayer::new()
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers([header::CONTENT_TYPE])
        .max_age(Duration::from_secs(3600));
    let cors = if origins.is_empty() {
        cors.allow_origin(Any)
    } else {
        let parsed = origins
            .iter()
            .map(|o| {
                HeaderValue::from_str(o).map_err(|e| anyhow::anyhow!("Invalid origin {o}: {e}"))
            })
            .collect::<Result<Vec<_>>>()?;
        cors.allow_origin(parsed)
    };

    Ok(Router::new()
        .route("/health", get(handle_health))
        .route("/session", post(handle_session))
        .with_state(state)
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(config.gateway.max_body_bytes))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(config.gateway.request_timeout_secs),
        )))
}

/// Serve the gateway until the process is stopped.
pub async fn run_gateway(config: Config) -> Result<()> {
    let host = &config.gateway.host;
    let addr: SocketAddr = format!("{host}:{}", config.gateway.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;

    if config.gateway.api_key.is_none() {
        tracing::warn!("No upstream API key configured; POST /session will return 503");
    }

    let state = AppState::from_config(&config)?;
    let app = build_router(state, &config)?;

    tracing::info!(addr = %local, "Credential gateway listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

// ── Handlers ───────────────────────────────────────────────────────

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

/// GET /health
async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRequest {
    session_id: String,
    #[serde(default)]
    model: Option<String>,
    voice: String,
}

/// POST /session: mint an ephemeral credential.
async fn handle_session(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Result<Json<SessionRequest>, JsonRejection>,
) -> Response {
    let body = match body {
        Ok(Json(b)) => b,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, format!("Invalid request: {e}")),
    };

    // Validated before anything leaves this process.
    let voice: Voice = match body.voice.parse() {
        Ok(v) => v,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };

    let session_id = body.session_id.trim();
    if session_id.is_empty() || session_id.len() > MAX_SESSION_ID_LEN {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("sessionId must be 1-{MAX_SESSION_ID_LEN} characters"),
        );
    }

    let client = client_addr(&headers, peer, state.trust_forwarded);
    if let Admission::Throttled { retry_after } = state.throttle.admit(client) {
        let retry_secs = retry_after.as_secs().max(1);
        tracing::warn!(%client, session_id, retry_secs, "Credential request throttled");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, retry_secs.to_string())],
            Json(serde_json::json!({
                "error": "Too many credential requests",
                "retry_after": retry_secs,
            })),
        )
            .into_response();
    }

    let model = body
        .model
        .as_deref()
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .unwrap_or(state.default_model.as_str());

    match state.issuer.issue(model, voice).await {
        Ok(client_secret) => {
            tracing::info!(session_id, voice = %voice, model, "Issued realtime credential");
            Json(SessionResponse { client_secret }).into_response()
        }
        Err(IssueError::MissingKey) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, "Credential issuance is not configured")
        }
        Err(e) => {
            tracing::warn!(session_id, error = %e, "Credential issuance failed");
            error_response(StatusCode::BAD_GATEWAY, "Credential issuance failed")
        }
    }
}

//! Conversation state consumed by the UI.
//!
//! A single [`ConversationStore`] subscribes to the event bus and reduces
//! events into one [`ConversationState`]: the status machine, the
//! append-only message log, partial transcripts and the last error.
//! Internal reconnects never reach it.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

use super::bus::{EventBus, SubscriptionId};
use super::events::{ConnectionStatus, PlainText, ProtocolEvent, Role};

const STATUS_BROADCAST_CAPACITY: usize = 64;

/// Application-facing session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Idle,
    Connecting,
    Connected,
    /// The model is responding (transcript or audio in flight).
    Streaming,
    Error,
}

/// Audio that accompanied an assistant message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioRef {
    pub item_id: String,
    pub bytes: usize,
}

/// One finished utterance. Never edited after it is appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: PlainText,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<AudioRef>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PartialTranscript {
    pub role: Option<Role>,
    pub text: PlainText,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationState {
    pub status: ConversationStatus,
    pub messages: Vec<Message>,
    /// In-progress transcripts keyed by conversation item.
    pub partials: HashMap<String, PartialTranscript>,
    pub error: Option<String>,
    pub remote_session_id: Option<String>,
    audio_bytes: HashMap<String, usize>,
}

impl Default for ConversationState {
    fn default() -> Self {
        Self {
            status: ConversationStatus::Idle,
            messages: Vec::new(),
            partials: HashMap::new(),
            error: None,
            remote_session_id: None,
            audio_bytes: HashMap::new(),
        }
    }
}

impl ConversationState {
    /// Apply one event. Returns the new status if it changed.
    pub fn reduce(&mut self, event: &ProtocolEvent) -> Option<ConversationStatus> {
        let before = self.status;
        match event {
            ProtocolEvent::ConnectionStatus(status) => match status {
                ConnectionStatus::Connecting => {
                    self.status = ConversationStatus::Connecting;
                    self.error = None;
                }
                ConnectionStatus::Connected => self.status = ConversationStatus::Connected,
                ConnectionStatus::Closed => {
                    self.status = ConversationStatus::Idle;
                    self.partials.clear();
                    self.audio_bytes.clear();
                }
                ConnectionStatus::Failed => {
                    self.status = ConversationStatus::Error;
                    if self.error.is_none() {
                        self.error = Some("connection failed".to_string());
                    }
                }
            },
            ProtocolEvent::TranscriptDelta {
                role,
                item_id,
                text,
            } => {
                let partial = self.partials.entry(item_id.clone()).or_default();
                partial.role = Some(*role);
                partial.text.push(text);
                if *role == Role::Assistant {
                    self.mark_streaming();
                }
            }
            ProtocolEvent::TranscriptDone {
                role,
                item_id,
                text,
                at,
            } => {
                self.partials.remove(item_id);
                let audio = self
                    .audio_bytes
                    .remove(item_id)
                    .map(|bytes| AudioRef {
                        item_id: item_id.clone(),
                        bytes,
                    });
                if !text.is_empty() {
                    self.messages.push(Message {
                        role: *role,
                        content: text.clone(),
                        timestamp: *at,
                        audio,
                    });
                }
                if *role == Role::Assistant && self.status == ConversationStatus::Streaming {
                    self.status = ConversationStatus::Connected;
                }
            }
            ProtocolEvent::AudioChunk { item_id, data } => {
                *self.audio_bytes.entry(item_id.clone()).or_default() += data.len();
                self.mark_streaming();
            }
            ProtocolEvent::ResponseDone { item_ids, .. } => {
                // Items the response never finished (cancelled or cut short).
                for item_id in item_ids {
                    self.partials.remove(item_id);
                    self.audio_bytes.remove(item_id);
                }
                if self.status == ConversationStatus::Streaming {
                    self.status = ConversationStatus::Connected;
                }
            }
            ProtocolEvent::ErrorNotice { message, fatal, .. } => {
                self.error = Some(message.as_str().to_string());
                if *fatal {
                    self.status = ConversationStatus::Error;
                }
            }
            ProtocolEvent::SessionConfig { session_id } => {
                self.remote_session_id = session_id.clone();
            }
        }
        (self.status != before).then_some(self.status)
    }

    fn mark_streaming(&mut self) {
        if self.status == ConversationStatus::Connected {
            self.status = ConversationStatus::Streaming;
        }
    }
}

/// Owner of the one [`ConversationState`] for a user session.
pub struct ConversationStore {
    state: Mutex<ConversationState>,
    status_tx: broadcast::Sender<ConversationStatus>,
    subscription: Mutex<Option<(Arc<EventBus>, SubscriptionId)>>,
}

impl ConversationStore {
    pub fn init() -> Arc<Self> {
        let (status_tx, _) = broadcast::channel(STATUS_BROADCAST_CAPACITY);
        Arc::new(Self {
            state: Mutex::new(ConversationState::default()),
            status_tx,
            subscription: Mutex::new(None),
        })
    }

    /// Subscribe this store to every topic on `bus`. Replaces any previous
    /// subscription.
    pub fn attach(self: &Arc<Self>, bus: &Arc<EventBus>) {
        self.detach();
        let weak = Arc::downgrade(self);
        let id = bus.subscribe(&[], move |event| {
            if let Some(store) = weak.upgrade() {
                store.apply(event);
            }
        });
        *self.subscription.lock() = Some((Arc::clone(bus), id));
    }

    pub fn detach(&self) {
        if let Some((bus, id)) = self.subscription.lock().take() {
            bus.unsubscribe(id);
        }
    }

    pub fn apply(&self, event: &ProtocolEvent) {
        let changed = self.state.lock().reduce(event);
        if let Some(status) = changed {
            tracing::debug!(status = ?status, "Conversation status");
            let _ = self.status_tx.send(status);
        }
    }

    pub fn snapshot(&self) -> ConversationState {
        self.state.lock().clone()
    }

    pub fn status(&self) -> ConversationStatus {
        self.state.lock().status
    }

    pub fn messages(&self) -> Vec<Message> {
        self.state.lock().messages.clone()
    }

    /// Every status change from now on, in order.
    pub fn status_changes(&self) -> broadcast::Receiver<ConversationStatus> {
        self.status_tx.subscribe()
    }

    pub fn reset(&self) {
        let changed = {
            let mut state = self.state.lock();
            let before = state.status;
            *state = ConversationState::default();
            (before != state.status).then_some(state.status)
        };
        if let Some(status) = changed {
            let _ = self.status_tx.send(status);
        }
    }

    /// Take the message log for persistence and reset the store.
    pub fn finish(&self) -> Vec<Message> {
        let messages = std::mem::take(&mut self.state.lock().messages);
        self.reset();
        messages
    }
}

impl Drop for ConversationStore {
    fn drop(&mut self) {
        self.detach();
    }
}

// ── Tests ──────────────────────────────────────────────────────────

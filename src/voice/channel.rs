//! Protocol channel over the peer connection's data channel.
//!
//! Outbound sends issued before the channel opens are queued and flushed in
//! order on the open transition; the `session.update` configuration therefore
//! always precedes anything else the session sends. Inbound messages that do
//! not decode are dropped and logged, never escalated.

use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::error::SessionError;
use super::events::{decode_server_event, ClientEvent, ProtocolEvent};
use super::peer::DataChannelTransport;

type EventHandler = Arc<dyn Fn(ProtocolEvent) + Send + Sync>;

struct Outbound {
    open: bool,
    queue: VecDeque<String>,
}

pub struct ProtocolChannel {
    transport: Arc<dyn DataChannelTransport>,
    // Held across the transport send so queued and direct sends stay ordered.
    outbound: Mutex<Outbound>,
    closed: AtomicBool,
    handler: RwLock<Option<EventHandler>>,
    dropped: AtomicU64,
}

impl ProtocolChannel {
    pub fn new(transport: Arc<dyn DataChannelTransport>) -> Self {
        Self {
            transport,
            outbound: Mutex::new(Outbound {
                open: false,
                queue: VecDeque::new(),
            }),
            closed: AtomicBool::new(false),
            handler: RwLock::new(None),
            dropped: AtomicU64::new(0),
        }
    }

    /// Register the consumer of decoded inbound events.
    pub fn on_event(&self, handler: impl Fn(ProtocolEvent) + Send + Sync + 'static) {
        *self.handler.write() = Some(Arc::new(handler));
    }

    /// Send an event, queueing it if the channel is not open yet.
    pub async fn send(&self, event: &ClientEvent) -> Result<(), SessionError> {
        let payload = event
            .to_wire()
            .map_err(|e| SessionError::Transport(format!("failed to encode event: {e}")))?;

        if self.is_closed() {
            return Err(SessionError::Transport("protocol channel closed".into()));
        }

        let mut outbound = self.outbound.lock().await;
        if !outbound.open {
            outbound.queue.push_back(payload);
            tracing::debug!(queued = outbound.queue.len(), "Queued protocol event until open");
            return Ok(());
        }
        self.transport.send_text(payload).await
    }

    /// Mark the channel open and flush queued sends in their original order.
    ///
    /// Returns how many queued events were delivered. The flush stops early
    /// only if [`close`](Self::close) runs concurrently.
    pub async fn mark_open(&self) -> Result<usize, SessionError> {
        let mut outbound = self.outbound.lock().await;
        if outbound.open {
            return Ok(0);
        }
        outbound.open = true;

        let mut flushed = 0;
        while let Some(payload) = outbound.queue.pop_front() {
            if self.is_closed() {
                tracing::debug!(remaining = outbound.queue.len() + 1, "Flush interrupted by close");
                break;
            }
            self.transport.send_text(payload).await?;
            flushed += 1;
        }
        tracing::debug!(flushed, "Protocol channel open");
        Ok(flushed)
    }

    /// Decode one inbound message and hand it to the registered handler.
    pub fn receive(&self, raw: &str) {
        match decode_server_event(raw) {
            Ok(Some(event)) => {
                let handler = self.handler.read().clone();
                if let Some(handler) = handler {
                    handler(event);
                }
            }
            Ok(None) => {}
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                let err = SessionError::from(e);
                tracing::warn!(error = %err, bytes = raw.len(), "Dropping inbound protocol message");
            }
        }
    }

    /// Number of inbound messages dropped as undecodable.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the data channel. Idempotent; does not wait for an in-progress
    /// flush.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.transport.close().await {
            tracing::warn!(error = %e, "Data channel close failed");
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::credential::Voice;
    use crate::voice::events::{Role, SessionSettings};
    use crate::voice::testing::FakeDataChannel;

    fn channel() -> (Arc<FakeDataChannel>, ProtocolChannel) {
        let dc = Arc::new(FakeDataChannel::default());
        let ch = ProtocolChannel::new(dc.clone());
        (dc, ch)
    }

    fn event_type(wire: &str) -> String {
        let v: serde_json::Value = serde_json::from_str(wire).unwrap();
        v["type"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn sends_before_open_flush_in_order() {
        let (dc, ch) = channel();
        ch.send(&ClientEvent::SessionUpdate {
            session: SessionSettings::new(Voice::Alloy),
        })
        .await
        .unwrap();
        for i in 0..5 {
            ch.send(&ClientEvent::user_text(&format!("msg {i}"))).await.unwrap();
        }
        assert!(dc.sent().is_empty());

        assert_eq!(ch.mark_open().await.unwrap(), 6);
        let sent = dc.sent();
        assert_eq!(sent.len(), 6);
        assert_eq!(event_type(&sent[0]), "session.update");
        for (i, wire) in sent[1..].iter().enumerate() {
            assert!(wire.contains(&format!("msg {i}")));
        }
    }

    #[tokio::test]
    async fn sends_after_open_go_straight_through() {
        let (dc, ch) = channel();
        ch.mark_open().await.unwrap();
        ch.send(&ClientEvent::ResponseCreate).await.unwrap();
        assert_eq!(dc.sent(), vec![r#"{"type":"response.create"}"#.to_string()]);
        // Opening twice does not replay anything.
        assert_eq!(ch.mark_open().await.unwrap(), 0);
        assert_eq!(dc.sent().len(), 1);
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let (dc, ch) = channel();
        ch.close().await;
        ch.close().await;
        assert_eq!(dc.closes(), 1);
        assert!(matches!(
            ch.send(&ClientEvent::ResponseCreate).await,
            Err(SessionError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn close_interrupts_pending_flush() {
        let (dc, ch) = channel();
        ch.send(&ClientEvent::ResponseCreate).await.unwrap();
        ch.close().await;
        assert_eq!(ch.mark_open().await.unwrap(), 0);
        assert!(dc.sent().is_empty());
    }

    #[test]
    fn malformed_inbound_is_dropped_without_reaching_handler() {
        let (_dc, ch) = channel();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        ch.on_event(move |e| sink.lock().push(e));

        ch.receive("{oops");
        ch.receive(r#"{"type":"response.brand_new"}"#);
        ch.receive(r#"{"no_type":true}"#);
        assert!(seen.lock().is_empty());
        assert_eq!(ch.dropped(), 3);

        ch.receive(r#"{"type":"response.audio_transcript.done","item_id":"a","transcript":"Hola"}"#);
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert!(matches!(
            &seen[0],
            ProtocolEvent::TranscriptDone { role: Role::Assistant, text, .. } if text.as_str() == "Hola"
        ));
    }
}

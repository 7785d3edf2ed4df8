//! Local microphone track and remote playback seams.
//!
//! Device enumeration and capture live outside this crate: a [`MediaSource`]
//! hands back a live [`LocalAudioTrack`], and an [`AudioOutput`] opens a
//! playback sink for each peer connection. The coordinator wraps the local
//! track in an [`AudioTrackHandle`] so it is released exactly once per
//! session, regardless of how many reconnects happen in between.

use async_trait::async_trait;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::error::SessionError;

/// A live local audio source track.
pub trait LocalAudioTrack: Send + Sync {
    fn id(&self) -> &str;

    /// Stop capturing. Called once by [`AudioTrackHandle::release`].
    fn stop(&self);

    /// Lets a transport backend recover its concrete track type.
    fn as_any(&self) -> &dyn Any;
}

/// Hands out live microphone tracks.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self) -> Result<Arc<dyn LocalAudioTrack>, SessionError>;
}

/// Receives remote audio for one peer connection.
pub trait AudioSink: Send {
    fn play(&mut self, payload: &[u8]);

    /// Disconnect from the output device. No `play` follows.
    fn detach(&mut self);
}

/// Opens a playback sink per peer connection.
pub trait AudioOutput: Send + Sync {
    fn open_sink(&self) -> Box<dyn AudioSink>;
}

// ── Release-once handle ───────────────────────────────────────────

/// Session-owned reference to the local track.
#[derive(Clone)]
pub struct AudioTrackHandle {
    track: Arc<dyn LocalAudioTrack>,
    released: Arc<AtomicBool>,
}

impl AudioTrackHandle {
    pub fn new(track: Arc<dyn LocalAudioTrack>) -> Self {
        Self {
            track,
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn track(&self) -> Arc<dyn LocalAudioTrack> {
        Arc::clone(&self.track)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Stops the underlying track the first time it is called.
    /// Returns whether this call performed the release.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        tracing::debug!(track_id = self.track.id(), "Releasing local audio track");
        self.track.stop();
        true
    }
}

impl std::fmt::Debug for AudioTrackHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioTrackHandle")
            .field("track_id", &self.track.id())
            .field("released", &self.is_released())
            .finish()
    }
}

/// Playback output that drops remote audio, for headless sessions.
#[derive(Debug, Default)]
pub struct NullAudioOutput;

struct NullSink {
    bytes: u64,
}

impl AudioOutput for NullAudioOutput {
    fn open_sink(&self) -> Box<dyn AudioSink> {
        Box::new(NullSink { bytes: 0 })
    }
}

impl AudioSink for NullSink {
    fn play(&mut self, payload: &[u8]) {
        self.bytes += payload.len() as u64;
    }

    fn detach(&mut self) {
        tracing::debug!(bytes = self.bytes, "Remote audio sink detached");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::testing::FakeTrack;

    #[test]
    fn release_stops_track_exactly_once() {
        let track = Arc::new(FakeTrack::new("mic-0"));
        let handle = AudioTrackHandle::new(track.clone());
        let clone = handle.clone();

        assert!(handle.release());
        assert!(!clone.release());
        assert!(!handle.release());
        assert!(clone.is_released());
        assert_eq!(track.stops(), 1);
    }
}

//! Realtime voice session manager.
//!
//! Connects a local microphone to a hosted speech-to-speech model over a
//! peer-to-peer audio connection and keeps conversation state in sync.
//!
//! ## Design
//! - Trait seams for everything that touches the outside world
//!   (`CredentialBroker`, `MediaSource`, `PeerTransportFactory`, `SdpExchange`)
//! - Transport callbacks become `TransportEvent`s in a single-consumer queue
//! - Ordered data channel with a send queue that flushes on open
//! - Credential expiry handled by a cancellable timer and a transparent reconnect
//! - Synchronous in-process event bus feeding one `ConversationStore`

pub mod bus;
pub mod channel;
pub mod coordinator;
pub mod credential;
pub mod error;
pub mod events;
pub mod media;
pub mod peer;
pub mod store;
#[cfg(feature = "webrtc-native")]
pub mod webrtc;

#[cfg(test)]
pub(crate) mod testing;

pub use bus::{EventBus, SubscriptionId};
pub use channel::ProtocolChannel;
pub use coordinator::{CoordinatorConfig, LifecyclePhase, SessionCoordinator};
pub use credential::{Credential, CredentialBroker, HttpCredentialBroker, Voice};
pub use error::{DecodeError, SessionError};
pub use events::{
    ClientEvent, ConnectionStatus, PlainText, ProtocolEvent, ResponseOutcome, Role, Topic,
};
pub use media::{AudioOutput, AudioSink, AudioTrackHandle, LocalAudioTrack, MediaSource, NullAudioOutput};
pub use peer::{
    ConnectionState, HttpSdpExchange, PeerConfig, PeerConnection, PeerConnectionController,
    PeerTransport, PeerTransportFactory, SdpExchange, TransportEvent, TransportState,
};
pub use store::{ConversationState, ConversationStatus, ConversationStore, Message};

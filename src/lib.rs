//! Realtime voice sessions for conversational language practice.
//!
//! - [`voice`] session manager: credentials, peer connection, protocol
//!   channel, lifecycle coordinator, event bus and conversation store
//! - [`gateway`] credential issuance HTTP service
//! - [`archive`] persistence of finished conversations
//! - [`config`] TOML configuration with environment overrides

pub mod archive;
pub mod config;
pub mod gateway;
pub mod voice;

//! Voice Session Transport
//!
//! Everything that touches the persistent WebSocket connection to the backend:
//!
//! - `protocol`: Encodes control commands and microphone audio into frames, decodes inbound frames.
//! - `connection`: Owns the transport, runs the session state machine and publishes snapshots.

pub mod connection;
pub mod protocol;

pub use connection::{ConnectionCommand, ConnectionConfig, VoiceSessionConnection};
pub use protocol::SessionCodec;

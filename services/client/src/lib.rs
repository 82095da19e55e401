//! Voz Client Library Crate
//!
//! Everything needed to hold a live voice conversation with the backend agent:
//! configuration, microphone capture, agent audio playback, the session-creation
//! client, the wire codec and the session connection. The `voz` binary is a thin
//! wrapper around [`orchestrator::VoiceSessionOrchestrator`].

pub mod audio_utils;
pub mod capture;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod playback;
pub mod session_api;
pub mod ws;

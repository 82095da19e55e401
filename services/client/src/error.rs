//! Error taxonomy for the voice client.
//!
//! Faults that invalidate a whole session (`PermissionFault`, `TransportFault`,
//! `SessionCreationFault`) surface through [`VoiceError`]. `ProtocolDecodeFault`
//! is local to one frame: the codec counts and logs it and never returns it to the
//! state machine.

use reqwest::StatusCode;
use tokio_tungstenite::tungstenite;
use voz_core::SessionState;

/// The microphone could not be acquired. The session never starts.
#[derive(Debug, thiserror::Error)]
pub enum PermissionFault {
    #[error("Microphone access was denied: {0}")]
    PermissionDenied(String),
    #[error("No usable input device: {0}")]
    DeviceUnavailable(String),
}

/// The transport could not be opened or failed mid-session.
#[derive(Debug, thiserror::Error)]
pub enum TransportFault {
    #[error("Invalid transport endpoint '{0}'")]
    InvalidEndpoint(String),
    #[error("Failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: tungstenite::Error,
    },
    #[error("Connection dropped: {0}")]
    Dropped(#[source] tungstenite::Error),
    #[error("Failed to send frame: {0}")]
    Send(#[source] tungstenite::Error),
}

/// A single inbound frame could not be understood.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolDecodeFault {
    #[error("Malformed JSON text frame: {0}")]
    MalformedJson(#[from] serde_json::Error),
    #[error("Event frame without an event name")]
    MissingEventName,
    #[error("Binary audio frame has an odd byte count ({0})")]
    OddByteCount(usize),
}

/// The session-creation endpoint failed. No session object exists.
#[derive(Debug, thiserror::Error)]
pub enum SessionCreationFault {
    #[error("Session request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("Session endpoint answered with status {0}")]
    Status(StatusCode),
    #[error("Session endpoint returned an invalid body: {0}")]
    InvalidResponse(#[source] reqwest::Error),
    #[error("Cannot build a URL from '{0}'")]
    InvalidUrl(String),
}

/// Top-level error returned by the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    #[error(transparent)]
    Permission(#[from] PermissionFault),
    #[error(transparent)]
    Transport(#[from] TransportFault),
    #[error(transparent)]
    SessionCreation(#[from] SessionCreationFault),
    #[error("A session is already active ({0})")]
    SessionBusy(SessionState),
    #[error("Session start was cancelled")]
    Cancelled,
}

impl VoiceError {
    /// A short message suitable for showing to the user.
    pub fn user_message(&self) -> &'static str {
        match self {
            VoiceError::Permission(_) => {
                "Microphone unavailable. Check the input device and its permissions."
            }
            VoiceError::Transport(_) => "The voice connection was lost. Start a new session.",
            VoiceError::SessionCreation(_) => "Could not start a session. Check the backend.",
            VoiceError::SessionBusy(_) => "A session is already in progress.",
            VoiceError::Cancelled => "Session start cancelled.",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PermissionFault::DeviceUnavailable("no default input".into());
        assert_eq!(err.to_string(), "No usable input device: no default input");

        let err = SessionCreationFault::Status(StatusCode::BAD_GATEWAY);
        assert_eq!(
            err.to_string(),
            "Session endpoint answered with status 502 Bad Gateway"
        );

        let err = VoiceError::SessionBusy(SessionState::InConversation);
        assert_eq!(
            err.to_string(),
            "A session is already active (in_conversation)"
        );
    }

    #[test]
    fn test_voice_error_from_faults() {
        let err: VoiceError = PermissionFault::PermissionDenied("denied".into()).into();
        assert!(matches!(err, VoiceError::Permission(_)));
        assert!(err.user_message().contains("Microphone"));
        assert_eq!(err.to_string(), "Microphone access was denied: denied");
    }
}

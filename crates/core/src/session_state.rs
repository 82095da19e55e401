//! Session lifecycle transition table.
//!
//! The table is the single authority on which state changes are legal. The
//! connection layer feeds it events and publishes whatever state comes out.

use crate::generic_types::SessionState;
use std::fmt;

/// Inputs that can move a session from one state to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// The orchestrator asked the backend for a new session.
    CreateRequested,
    /// The backend refused or the request failed; nothing was created.
    CreationFailed,
    /// A session handle is available and the transport is being opened.
    HandleObtained,
    /// The transport handshake completed.
    TransportOpened,
    /// The transport was closed by either side.
    TransportClosed,
    /// The transport failed.
    TransportError,
    /// The backend announced the end of the conversation.
    SessionEndedByBackend,
    /// The user wants to start over.
    Restart,
}

/// Returned when an event is not valid for the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid session transition: {event:?} while {from}")]
pub struct InvalidTransition {
    pub from: SessionState,
    pub event: SessionEvent,
}

impl SessionState {
    /// Computes the state that follows `event`.
    ///
    /// Closing or failing an already ended session is a no-op rather than an error.
    pub fn next(self, event: SessionEvent) -> Result<SessionState, InvalidTransition> {
        use SessionEvent::*;
        use SessionState::*;

        let next = match (self, event) {
            (NoSession, CreateRequested) => CreatingSession,
            (CreatingSession, CreationFailed) => NoSession,
            (NoSession | CreatingSession, HandleObtained) => Connecting,
            (Connecting, TransportOpened) => InConversation,
            (
                Connecting | InConversation,
                TransportClosed | TransportError | SessionEndedByBackend,
            ) => Ended,
            (Ended, TransportClosed | TransportError | SessionEndedByBackend) => Ended,
            (Ended | NoSession, Restart) => NoSession,
            (from, event) => return Err(InvalidTransition { from, event }),
        };
        Ok(next)
    }

    /// Position along the forward path, used to check monotonicity.
    pub fn rank(self) -> u8 {
        match self {
            SessionState::NoSession => 0,
            SessionState::CreatingSession => 1,
            SessionState::Connecting => 2,
            SessionState::InConversation => 3,
            SessionState::Ended => 4,
        }
    }
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

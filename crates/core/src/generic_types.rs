//! Provider-agnostic data types shared by the capture, codec and connection layers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one backend conversation and where its transport lives.
///
/// Produced by the session-creation collaborator and owned by the orchestrator
/// for the lifetime of the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHandle {
    /// Opaque identifier assigned by the backend.
    pub session_id: String,
    /// Fully resolved `ws://` or `wss://` endpoint, including the `id_sesion` query.
    pub transport_endpoint: String,
}

/// Lifecycle of a voice session, from the client's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    #[default]
    NoSession,
    CreatingSession,
    Connecting,
    InConversation,
    Ended,
}

impl SessionState {
    /// A new session may only be started when nothing is in flight.
    pub fn can_start(self) -> bool {
        matches!(self, SessionState::NoSession | SessionState::Ended)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionState::NoSession => "no_session",
            SessionState::CreatingSession => "creating_session",
            SessionState::Connecting => "connecting",
            SessionState::InConversation => "in_conversation",
            SessionState::Ended => "ended",
        };
        f.write_str(label)
    }
}

/// One direction of the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    User,
    Agent,
}

/// Speaking flag and loudness of a single channel.
///
/// The level is always kept inside `[0, 1]`; every write goes through [`ChannelStatus::set_level`].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct ChannelStatus {
    speaking: bool,
    level: f32,
}

impl ChannelStatus {
    pub fn speaking(&self) -> bool {
        self.speaking
    }

    pub fn level(&self) -> f32 {
        self.level
    }

    pub fn set_speaking(&mut self, speaking: bool) {
        self.speaking = speaking;
    }

    /// Stores a new level, clamping it to `[0, 1]`. NaN is treated as silence.
    pub fn set_level(&mut self, level: f32) {
        self.level = if level.is_nan() {
            0.0
        } else {
            level.clamp(0.0, 1.0)
        };
    }
}

/// Counters kept by the connection for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SessionStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub decode_faults: u64,
    pub sequence_gaps: u64,
}

/// Read-only view handed to UI subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct SessionSnapshot {
    pub session_state: SessionState,
    pub user_channel: ChannelStatus,
    pub agent_channel: ChannelStatus,
    pub stats: SessionStats,
}

impl SessionSnapshot {
    pub fn channel(&self, channel: Channel) -> ChannelStatus {
        match channel {
            Channel::User => self.user_channel,
            Channel::Agent => self.agent_channel,
        }
    }
}

/// Which way an audio frame travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Captured from the microphone, heading to the backend.
    Outbound,
    /// Received from the backend, spoken by the agent.
    Inbound,
}

/// A block of mono samples normalized to `[-1.0, 1.0]`.
///
/// Sequence numbers are per direction and strictly increasing; a jump larger than one
/// means frames were dropped somewhere upstream.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub direction: Direction,
    pub sequence: u64,
    pub samples: Vec<f32>,
}

impl AudioFrame {
    pub fn outbound(sequence: u64, samples: Vec<f32>) -> Self {
        Self {
            direction: Direction::Outbound,
            sequence,
            samples,
        }
    }

    pub fn inbound(sequence: u64, samples: Vec<f32>) -> Self {
        Self {
            direction: Direction::Inbound,
            sequence,
            samples,
        }
    }
}

pub const EVENT_AGENT_RESPONSE_STARTED: &str = "inicio_respuesta_agente";
pub const EVENT_AGENT_RESPONSE_ENDED: &str = "fin_respuesta_agente";
pub const EVENT_INTERRUPTION_DETECTED: &str = "interrupcion_detectada";
pub const EVENT_SESSION_ENDED: &str = "sesion_finalizada";
pub const EVENT_ERROR: &str = "error";

/// Named events pushed by the backend as text frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// The agent started speaking a response.
    AgentResponseStarted,
    /// The agent finished its response.
    AgentResponseEnded,
    /// The user talked over the agent and the response was cut short.
    InterruptionDetected,
    /// The backend closed the conversation (e.g. inactivity timeout).
    SessionEnded { detail: Option<String> },
    /// The backend reported a problem, usually right before closing.
    Error { detail: Option<String> },
    /// Anything this client does not know yet.
    Unknown { name: String },
}

impl ControlEvent {
    pub fn from_name(name: &str, detail: Option<String>) -> Self {
        match name {
            EVENT_AGENT_RESPONSE_STARTED => ControlEvent::AgentResponseStarted,
            EVENT_AGENT_RESPONSE_ENDED => ControlEvent::AgentResponseEnded,
            EVENT_INTERRUPTION_DETECTED => ControlEvent::InterruptionDetected,
            EVENT_SESSION_ENDED => ControlEvent::SessionEnded { detail },
            EVENT_ERROR => ControlEvent::Error { detail },
            other => ControlEvent::Unknown {
                name: other.to_string(),
            },
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ControlEvent::AgentResponseStarted => EVENT_AGENT_RESPONSE_STARTED,
            ControlEvent::AgentResponseEnded => EVENT_AGENT_RESPONSE_ENDED,
            ControlEvent::InterruptionDetected => EVENT_INTERRUPTION_DETECTED,
            ControlEvent::SessionEnded { .. } => EVENT_SESSION_ENDED,
            ControlEvent::Error { .. } => EVENT_ERROR,
            ControlEvent::Unknown { name } => name,
        }
    }
}

/// Control commands the client sends to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// The user finished talking; the agent may answer.
    EndTurn,
    /// The user asked to end the conversation.
    EndSession,
    /// Keep-alive.
    Ping,
}

impl ControlCommand {
    pub fn name(self) -> &'static str {
        match self {
            ControlCommand::EndTurn => "fin_turno",
            ControlCommand::EndSession => "finalizar_sesion",
            ControlCommand::Ping => "ping",
        }
    }
}

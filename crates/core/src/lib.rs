//! Core types for the voice session client: session lifecycle, channel status,
//! audio frames, control events and loudness metering. Nothing in this crate
//! touches a device or a socket.

pub mod generic_types;
pub mod level_meter;
pub mod liveness;
pub mod session_state;

pub use generic_types::{
    AudioFrame, Channel, ChannelStatus, ControlCommand, ControlEvent, Direction, SessionHandle,
    SessionSnapshot, SessionState, SessionStats,
};
pub use level_meter::{LevelMeter, MeterConfig, SampleScale};
pub use liveness::{Liveness, LivenessFlag};
pub use session_state::{InvalidTransition, SessionEvent};

//! Defines the wire protocol between this client and the voice backend.
//!
//! Text frames carry JSON control events, binary frames carry raw mono PCM16
//! little-endian audio. Decoding never fails the connection: a frame that cannot
//! be understood is counted as a decode fault, logged and skipped.

use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use voz_core::{AudioFrame, ControlCommand, ControlEvent, Direction};

use crate::audio_utils::{
    BACKEND_INPUT_PCM16_SAMPLE_RATE, StreamResampler, convert_i16_to_f32, decode_pcm16_le,
    encode_pcm16_le,
};
use crate::error::ProtocolDecodeFault;

const RESAMPLER_CHUNK_SIZE: usize = 256;

/// Control message sent by the client.
#[derive(Serialize, Debug)]
pub struct ClientEvent<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub name: &'a str,
}

impl<'a> ClientEvent<'a> {
    pub fn new(name: &'a str) -> Self {
        Self {
            kind: "event",
            name,
        }
    }
}

/// Control message pushed by the backend.
///
/// The backend spells the discriminator `tipo` or `type` and the event name
/// `nombre_evento` or `name`; both spellings are accepted.
#[derive(Deserialize, Debug)]
pub struct ServerEvent {
    #[serde(rename = "type", alias = "tipo")]
    pub kind: String,
    #[serde(default, alias = "name")]
    pub nombre_evento: Option<String>,
    #[serde(default)]
    pub detalle: Option<String>,
}

/// Result of decoding one inbound frame.
#[derive(Debug, PartialEq)]
pub enum Inbound {
    Control(ControlEvent),
    Audio(AudioFrame),
    /// The peer closed the transport.
    Closed,
    /// Nothing to act on: pings, unknown envelopes, or a faulty frame.
    Ignored,
}

/// Encodes outbound frames and decodes inbound ones for a single session.
pub struct SessionCodec {
    resampler: StreamResampler,
    last_outbound: Option<u64>,
    next_inbound: u64,
    decode_faults: u64,
    sequence_gaps: u64,
}

impl SessionCodec {
    /// `capture_sample_rate` is the rate of the microphone blocks handed to [`Self::encode_audio`].
    pub fn new(capture_sample_rate: u32) -> Result<Self, rubato::ResamplerConstructionError> {
        Ok(Self {
            resampler: StreamResampler::new(
                capture_sample_rate,
                BACKEND_INPUT_PCM16_SAMPLE_RATE,
                RESAMPLER_CHUNK_SIZE,
            )?,
            last_outbound: None,
            next_inbound: 0,
            decode_faults: 0,
            sequence_gaps: 0,
        })
    }

    pub fn decode_faults(&self) -> u64 {
        self.decode_faults
    }

    pub fn sequence_gaps(&self) -> u64 {
        self.sequence_gaps
    }

    pub fn encode_command(&self, command: ControlCommand) -> Result<Message, serde_json::Error> {
        let text = serde_json::to_string(&ClientEvent::new(command.name()))?;
        Ok(Message::Text(text.into()))
    }

    /// Turns one capture block into one binary frame.
    ///
    /// Returns `None` when the block was too short to produce resampled output;
    /// its samples are carried into the next block.
    pub fn encode_audio(&mut self, frame: AudioFrame) -> Option<Message> {
        if frame.direction != Direction::Outbound {
            warn!("Refusing to encode an inbound frame for sending");
            return None;
        }
        self.track_outbound_sequence(frame.sequence);

        let resampled = self.resampler.process(&frame.samples);
        if resampled.is_empty() {
            return None;
        }
        Some(Message::Binary(encode_pcm16_le(&resampled).into()))
    }

    pub fn decode(&mut self, message: Message) -> Inbound {
        match message {
            Message::Text(text) => self.decode_text(text.as_str()),
            Message::Binary(data) => self.decode_audio(&data),
            Message::Close(frame) => {
                debug!(?frame, "Received close frame");
                Inbound::Closed
            }
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => Inbound::Ignored,
        }
    }

    fn decode_text(&mut self, text: &str) -> Inbound {
        let event: ServerEvent = match serde_json::from_str(text) {
            Ok(event) => event,
            Err(e) => return self.fault(e.into()),
        };
        if event.kind != "evento" && event.kind != "event" {
            debug!(kind = %event.kind, "Ignoring text frame with unknown type");
            return Inbound::Ignored;
        }
        match event.nombre_evento {
            Some(name) => Inbound::Control(ControlEvent::from_name(&name, event.detalle)),
            None => self.fault(ProtocolDecodeFault::MissingEventName),
        }
    }

    fn decode_audio(&mut self, data: &[u8]) -> Inbound {
        match decode_pcm16_le(data) {
            Ok(pcm16) => {
                let sequence = self.next_inbound;
                self.next_inbound += 1;
                Inbound::Audio(AudioFrame::inbound(sequence, convert_i16_to_f32(&pcm16)))
            }
            Err(fault) => self.fault(fault),
        }
    }

    fn track_outbound_sequence(&mut self, sequence: u64) {
        if let Some(last) = self.last_outbound {
            if sequence > last + 1 {
                self.sequence_gaps += 1;
                warn!(
                    last,
                    sequence,
                    lost = sequence - last - 1,
                    "Capture frames lost before sending"
                );
            } else if sequence <= last {
                warn!(last, sequence, "Capture frame sequence went backwards");
            }
        }
        self.last_outbound = Some(sequence);
    }

    fn fault(&mut self, fault: ProtocolDecodeFault) -> Inbound {
        self.decode_faults += 1;
        warn!(faults = self.decode_faults, "Skipping inbound frame: {}", fault);
        Inbound::Ignored
    }
}

//! Owns the transport for one voice session and runs the session state machine.
//!
//! All state lives in [`VoiceSessionConnection`] and is only mutated from the
//! task that drives [`VoiceSessionConnection::run`]. Transport messages, capture
//! blocks and local commands are multiplexed on that single task, so frames are
//! processed strictly in arrival order and no locking is needed. Observers follow
//! changes through a `watch` channel of [`SessionSnapshot`]s.

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, Message},
};
use tracing::{Instrument, debug, error, info, info_span, warn};
use voz_core::{
    AudioFrame, ChannelStatus, ControlCommand, ControlEvent, LevelMeter, MeterConfig,
    SessionEvent, SessionHandle, SessionSnapshot, SessionState, SessionStats,
};

use super::protocol::{Inbound, SessionCodec};
use crate::capture::MicrophoneStream;
use crate::error::{TransportFault, VoiceError};
use crate::playback::AgentAudioSink;

/// Tuning for channel metering.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectionConfig {
    pub meter: MeterConfig,
    /// User level at or above which the user counts as speaking.
    pub speaking_threshold: f32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            meter: MeterConfig::default(),
            speaking_threshold: 0.02,
        }
    }
}

/// Requests from the orchestrator to a running session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionCommand {
    Send(ControlCommand),
    Stop,
}

/// What the event loop should do after handling an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    Close,
}

pub type SnapshotPublisher = Arc<watch::Sender<SessionSnapshot>>;

pub struct VoiceSessionConnection {
    state: SessionState,
    user_channel: ChannelStatus,
    agent_channel: ChannelStatus,
    stats: SessionStats,
    user_meter: LevelMeter,
    agent_meter: LevelMeter,
    speaking_threshold: f32,
    handle: Option<SessionHandle>,
    codec: Option<SessionCodec>,
    agent_sink: Option<Box<dyn AgentAudioSink>>,
    publisher: SnapshotPublisher,
}

impl VoiceSessionConnection {
    pub fn new(config: ConnectionConfig) -> Self {
        let (tx, _rx) = watch::channel(SessionSnapshot::default());
        Self::with_publisher(config, Arc::new(tx))
    }

    /// Builds a connection that reports to an existing snapshot channel.
    pub fn with_publisher(config: ConnectionConfig, publisher: SnapshotPublisher) -> Self {
        let connection = Self {
            state: SessionState::NoSession,
            user_channel: ChannelStatus::default(),
            agent_channel: ChannelStatus::default(),
            stats: SessionStats::default(),
            user_meter: LevelMeter::new(config.meter),
            agent_meter: LevelMeter::new(config.meter),
            speaking_threshold: config.speaking_threshold.clamp(0.0, 1.0),
            handle: None,
            codec: None,
            agent_sink: None,
            publisher,
        };
        connection.publish();
        connection
    }

    pub fn set_agent_sink(&mut self, sink: Box<dyn AgentAudioSink>) {
        self.agent_sink = Some(sink);
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.publisher.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn handle(&self) -> Option<&SessionHandle> {
        self.handle.as_ref()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let mut stats = self.stats;
        if let Some(codec) = &self.codec {
            stats.decode_faults = codec.decode_faults();
            stats.sequence_gaps = codec.sequence_gaps();
        }
        SessionSnapshot {
            session_state: self.state,
            user_channel: self.user_channel,
            agent_channel: self.agent_channel,
            stats,
        }
    }

    /// Records that a session is being requested from the backend.
    pub fn mark_creating(&mut self) -> Result<(), VoiceError> {
        if !self.state.can_start() {
            return Err(VoiceError::SessionBusy(self.state));
        }
        if self.state == SessionState::Ended {
            self.reset();
        }
        self.apply(SessionEvent::CreateRequested);
        Ok(())
    }

    /// Rolls back a session request that produced no session.
    pub fn creation_failed(&mut self) {
        if self.state == SessionState::CreatingSession {
            self.apply(SessionEvent::CreationFailed);
        }
    }

    /// Takes ownership of a session handle and moves to `Connecting`.
    pub fn begin(&mut self, handle: SessionHandle, codec: SessionCodec) -> Result<(), VoiceError> {
        if self.state == SessionState::Ended {
            self.reset();
        }
        if !matches!(
            self.state,
            SessionState::NoSession | SessionState::CreatingSession
        ) {
            return Err(VoiceError::SessionBusy(self.state));
        }
        info!(session_id = %handle.session_id, "Session handle obtained");
        self.handle = Some(handle);
        self.codec = Some(codec);
        self.apply(SessionEvent::HandleObtained);
        Ok(())
    }

    /// Explicit restart: `Ended` back to `NoSession`, clearing both channels.
    pub fn reset(&mut self) {
        if !self.state.can_start() {
            warn!(state = %self.state, "Ignoring reset of a session that has not ended");
            return;
        }
        self.user_channel = ChannelStatus::default();
        self.agent_channel = ChannelStatus::default();
        self.stats = SessionStats::default();
        self.user_meter.reset();
        self.agent_meter.reset();
        self.handle = None;
        self.codec = None;
        self.apply(SessionEvent::Restart);
    }

    pub fn on_transport_opened(&mut self) {
        self.apply(SessionEvent::TransportOpened);
    }

    pub fn on_transport_closed(&mut self) {
        self.apply(SessionEvent::TransportClosed);
    }

    pub fn on_transport_error(&mut self) {
        self.apply(SessionEvent::TransportError);
    }

    /// Decodes and applies one inbound frame.
    pub fn handle_frame(&mut self, message: Message) -> Step {
        let Some(codec) = self.codec.as_mut() else {
            return Step::Continue;
        };
        let step = match codec.decode(message) {
            Inbound::Closed => {
                self.on_transport_closed();
                return Step::Close;
            }
            Inbound::Ignored => Step::Continue,
            Inbound::Control(event) => {
                self.stats.frames_received += 1;
                self.handle_event(event)
            }
            Inbound::Audio(frame) => {
                self.stats.frames_received += 1;
                self.handle_agent_audio(frame);
                Step::Continue
            }
        };
        self.publish();
        step
    }

    /// Meters a capture block and encodes it for sending.
    ///
    /// Blocks that arrive outside `InConversation` are dropped.
    pub fn handle_capture(&mut self, frame: AudioFrame) -> Option<Message> {
        if self.state != SessionState::InConversation {
            return None;
        }
        let codec = self.codec.as_mut()?;
        let level = self.user_meter.measure_f32(&frame.samples);
        self.user_channel.set_level(level);
        self.user_channel
            .set_speaking(self.user_channel.level() >= self.speaking_threshold);

        let message = codec.encode_audio(frame);
        if message.is_some() {
            self.stats.frames_sent += 1;
        }
        self.publish();
        message
    }

    pub fn encode_command(&self, command: ControlCommand) -> Option<Message> {
        let codec = self.codec.as_ref()?;
        match codec.encode_command(command) {
            Ok(message) => Some(message),
            Err(e) => {
                error!("Failed to encode {} command: {}", command.name(), e);
                None
            }
        }
    }

    fn handle_event(&mut self, event: ControlEvent) -> Step {
        if self.state != SessionState::InConversation {
            debug!(state = %self.state, event = event.name(), "Ignoring event outside conversation");
            return Step::Continue;
        }
        match event {
            ControlEvent::AgentResponseStarted => {
                self.agent_channel.set_speaking(true);
                Step::Continue
            }
            ControlEvent::AgentResponseEnded | ControlEvent::InterruptionDetected => {
                self.agent_channel.set_speaking(false);
                Step::Continue
            }
            ControlEvent::SessionEnded { detail } => {
                info!(?detail, "Backend ended the session");
                self.apply(SessionEvent::SessionEndedByBackend);
                Step::Close
            }
            ControlEvent::Error { detail } => {
                warn!(?detail, "Backend reported an error");
                Step::Continue
            }
            ControlEvent::Unknown { name } => {
                debug!(%name, "Ignoring unknown event");
                Step::Continue
            }
        }
    }

    fn handle_agent_audio(&mut self, frame: AudioFrame) {
        if self.state != SessionState::InConversation {
            return;
        }
        let level = self.agent_meter.measure_f32(&frame.samples);
        self.agent_channel.set_level(level);
        if let Some(sink) = self.agent_sink.as_mut() {
            sink.play(&frame.samples);
        }
    }

    fn apply(&mut self, event: SessionEvent) {
        match self.state.next(event) {
            Ok(next) => {
                if next != self.state {
                    debug!(from = %self.state, to = %next, %event, "Session state changed");
                }
                self.state = next;
            }
            Err(e) => debug!("{}", e),
        }
        self.publish();
    }

    fn publish(&self) {
        self.publisher.send_replace(self.snapshot());
    }

    /// Opens the transport and pumps frames until the session ends.
    ///
    /// On every exit path the order is: stop consuming capture blocks, close the
    /// transport, then release the microphone.
    pub async fn run(
        &mut self,
        mut microphone: Option<MicrophoneStream>,
        mut commands: mpsc::Receiver<ConnectionCommand>,
    ) -> Result<(), TransportFault> {
        let Some(endpoint) = self.handle.as_ref().map(|h| h.transport_endpoint.clone()) else {
            return Ok(());
        };
        let session_id = self
            .handle
            .as_ref()
            .map(|h| h.session_id.clone())
            .unwrap_or_default();

        let result = self
            .pump(&endpoint, microphone.as_mut(), &mut commands)
            .instrument(info_span!("voice_session", %session_id))
            .await;

        if let Some(mut microphone) = microphone.take() {
            microphone.stop();
        }
        info!(%session_id, state = %self.state, "Voice session finished");
        result
    }

    async fn pump(
        &mut self,
        endpoint: &str,
        mut microphone: Option<&mut MicrophoneStream>,
        commands: &mut mpsc::Receiver<ConnectionCommand>,
    ) -> Result<(), TransportFault> {
        if self.state != SessionState::Connecting {
            return Ok(());
        }

        info!(%endpoint, "Connecting to voice backend");
        let connect = connect_async(endpoint);
        tokio::pin!(connect);
        let mut capture_open = microphone.is_some();
        let ws_stream = loop {
            tokio::select! {
                result = &mut connect => match result {
                    Ok((ws_stream, _)) => break ws_stream,
                    Err(tungstenite::Error::Url(e)) => {
                        error!("Invalid transport endpoint: {}", e);
                        self.on_transport_error();
                        return Err(TransportFault::InvalidEndpoint(endpoint.to_string()));
                    }
                    Err(e) => {
                        error!("Failed to connect: {}", e);
                        self.on_transport_error();
                        return Err(TransportFault::Connect { endpoint: endpoint.to_string(), source: e });
                    }
                },
                command = commands.recv() => match command {
                    Some(ConnectionCommand::Send(command)) => {
                        debug!(command = command.name(), "Dropping command sent before the transport opened");
                    }
                    Some(ConnectionCommand::Stop) | None => {
                        info!("Session stopped while connecting");
                        self.on_transport_closed();
                        return Ok(());
                    }
                },
                block = next_capture_block(&mut microphone), if capture_open => match block {
                    Some(frame) => {
                        debug!(sequence = frame.sequence, "Dropping capture block received while connecting");
                    }
                    None => capture_open = false,
                },
            }
        };

        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        self.on_transport_opened();
        info!("Voice transport open");

        let mut local_stop = false;
        let mut result = Ok(());

        loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(ConnectionCommand::Send(command)) => {
                        let message = self.encode_command(command);
                        if let Some(message) = message {
                            debug!(command = command.name(), "Sending control command");
                            if let Err(e) = ws_tx.send(message).await {
                                self.on_transport_error();
                                result = Err(TransportFault::Send(e));
                                break;
                            }
                        }
                    }
                    Some(ConnectionCommand::Stop) | None => {
                        local_stop = true;
                        break;
                    }
                },
                inbound = ws_rx.next() => match inbound {
                    Some(Ok(message)) => {
                        let step = self.handle_frame(message);
                        if step == Step::Close {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        error!("Error receiving from voice transport: {}", e);
                        self.on_transport_error();
                        result = Err(TransportFault::Dropped(e));
                        break;
                    }
                    None => {
                        info!("Voice transport closed by backend");
                        self.on_transport_closed();
                        break;
                    }
                },
                block = next_capture_block(&mut microphone), if capture_open => match block {
                    Some(frame) => {
                        let message = self.handle_capture(frame);
                        if let Some(message) = message {
                            if let Err(e) = ws_tx.send(message).await {
                                error!("Failed to send audio frame: {}", e);
                                self.on_transport_error();
                                result = Err(TransportFault::Send(e));
                                break;
                            }
                        }
                    }
                    None => {
                        warn!("Microphone stream ended; continuing without outbound audio");
                        capture_open = false;
                    }
                },
            }
        }

        // Outbound audio has stopped being consumed; now close the transport.
        if local_stop && self.state == SessionState::InConversation {
            let message = self.encode_command(ControlCommand::EndSession);
            if let Some(message) = message {
                if let Err(e) = ws_tx.send(message).await {
                    debug!("Could not notify backend of session end: {}", e);
                }
            }
        }
        if let Err(e) = ws_tx.close().await {
            debug!("Transport already closed: {}", e);
        }
        self.on_transport_closed();
        result
    }
}

async fn next_capture_block(microphone: &mut Option<&mut MicrophoneStream>) -> Option<AudioFrame> {
    match microphone {
        Some(microphone) => microphone.next_block().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;
    use voz_core::LivenessFlag;

    fn handle(endpoint: &str) -> SessionHandle {
        SessionHandle {
            session_id: "abc".to_string(),
            transport_endpoint: endpoint.to_string(),
        }
    }

    fn event(name: &str) -> Message {
        Message::Text(format!(r#"{{"type":"evento","nombre_evento":"{}"}}"#, name).into())
    }

    fn in_conversation() -> VoiceSessionConnection {
        let mut connection = VoiceSessionConnection::new(ConnectionConfig::default());
        connection
            .begin(handle("ws://unused"), SessionCodec::new(16000).unwrap())
            .unwrap();
        connection.on_transport_opened();
        assert_eq!(connection.state(), SessionState::InConversation);
        connection
    }

    #[test]
    fn test_agent_speaking_toggles_without_leaking() {
        let mut connection = in_conversation();
        for _ in 0..5 {
            connection.handle_frame(event("inicio_respuesta_agente"));
            assert!(connection.snapshot().agent_channel.speaking());
            connection.handle_frame(event("fin_respuesta_agente"));
            assert!(!connection.snapshot().agent_channel.speaking());
        }
    }

    #[test]
    fn test_interruption_stops_agent_speaking() {
        let mut connection = in_conversation();
        connection.handle_frame(event("inicio_respuesta_agente"));
        connection.handle_frame(event("interrupcion_detectada"));
        assert!(!connection.snapshot().agent_channel.speaking());
    }

    #[test]
    fn test_session_ended_event_is_terminal() {
        let mut connection = in_conversation();
        assert_eq!(
            connection.handle_frame(event("sesion_finalizada")),
            Step::Close
        );
        assert_eq!(connection.state(), SessionState::Ended);

        // Later frames have no effect until an explicit restart.
        connection.handle_frame(event("inicio_respuesta_agente"));
        connection.handle_frame(Message::Binary(vec![0xFF, 0x7F].into()));
        connection.on_transport_opened();
        assert_eq!(connection.state(), SessionState::Ended);
        assert!(!connection.snapshot().agent_channel.speaking());
        assert_eq!(connection.snapshot().agent_channel.level(), 0.0);

        connection.reset();
        assert_eq!(connection.state(), SessionState::NoSession);
    }

    #[test]
    fn test_malformed_frames_never_change_state() {
        let mut connection = in_conversation();
        for text in ["{", "null", "[]", r#"{"type":"evento","nombre_evento":7}"#] {
            assert_eq!(
                connection.handle_frame(Message::Text(text.to_string().into())),
                Step::Continue
            );
            assert_eq!(connection.state(), SessionState::InConversation);
        }
        assert_eq!(connection.snapshot().stats.decode_faults, 4);
        assert_eq!(connection.snapshot().stats.frames_received, 0);
    }

    #[test]
    fn test_agent_audio_updates_level() {
        let mut connection = in_conversation();
        // Full-scale square wave.
        let payload: Vec<u8> = (0..64)
            .flat_map(|i| if i % 2 == 0 { i16::MAX } else { i16::MIN }.to_le_bytes())
            .collect();
        connection.handle_frame(Message::Binary(payload.into()));
        assert!(connection.snapshot().agent_channel.level() > 0.99);

        connection.handle_frame(Message::Binary(vec![0u8; 64].into()));
        assert_eq!(connection.snapshot().agent_channel.level(), 0.0);
    }

    #[test]
    fn test_events_ignored_outside_conversation() {
        let mut connection = VoiceSessionConnection::new(ConnectionConfig::default());
        connection
            .begin(handle("ws://unused"), SessionCodec::new(16000).unwrap())
            .unwrap();
        assert_eq!(connection.state(), SessionState::Connecting);
        connection.handle_frame(event("inicio_respuesta_agente"));
        assert!(!connection.snapshot().agent_channel.speaking());
        assert!(
            connection
                .handle_capture(AudioFrame::outbound(0, vec![0.5; 32]))
                .is_none()
        );
        assert_eq!(connection.snapshot().user_channel.level(), 0.0);
    }

    #[test]
    fn test_close_keeps_last_speaking_flag() {
        let mut connection = in_conversation();
        connection.handle_frame(event("inicio_respuesta_agente"));
        assert_eq!(connection.handle_frame(Message::Close(None)), Step::Close);
        let snapshot = connection.snapshot();
        assert_eq!(snapshot.session_state, SessionState::Ended);
        assert!(snapshot.agent_channel.speaking());
    }

    #[test]
    fn test_begin_is_guarded() {
        let mut connection = in_conversation();
        let err = connection
            .begin(handle("ws://other"), SessionCodec::new(16000).unwrap())
            .unwrap_err();
        assert!(matches!(
            err,
            VoiceError::SessionBusy(SessionState::InConversation)
        ));
        assert!(connection.mark_creating().is_err());

        // Ended allows a fresh start, which clears the old channels.
        connection.handle_frame(event("inicio_respuesta_agente"));
        connection.on_transport_closed();
        connection.mark_creating().unwrap();
        assert_eq!(connection.state(), SessionState::CreatingSession);
        assert!(!connection.snapshot().agent_channel.speaking());
        connection.creation_failed();
        assert_eq!(connection.state(), SessionState::NoSession);
    }

    #[test]
    fn test_user_level_and_speaking() {
        let mut connection = in_conversation();
        let message = connection.handle_capture(AudioFrame::outbound(0, vec![0.5; 160]));
        assert!(matches!(message, Some(Message::Binary(_))));
        let snapshot = connection.snapshot();
        assert!((snapshot.user_channel.level() - 0.5).abs() < 1e-6);
        assert!(snapshot.user_channel.speaking());
        assert_eq!(snapshot.stats.frames_sent, 1);

        connection.handle_capture(AudioFrame::outbound(1, vec![0.0; 160]));
        assert!(!connection.snapshot().user_channel.speaking());
    }

    #[test]
    fn test_subscribers_see_updates() {
        let mut connection = in_conversation();
        let rx = connection.subscribe();
        connection.handle_frame(event("inicio_respuesta_agente"));
        assert!(rx.borrow().agent_channel.speaking());
        assert_eq!(rx.borrow().session_state, SessionState::InConversation);
    }

    async fn loopback_server() -> (String, tokio::task::JoinHandle<Vec<Message>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.send(event("inicio_respuesta_agente")).await.unwrap();
            let mut received = Vec::new();
            while let Some(Ok(message)) = ws.next().await {
                let is_close = message.is_close();
                received.push(message);
                if is_close {
                    break;
                }
            }
            received
        });
        (format!("ws://{}/api/voz?id_sesion=abc", addr), server)
    }

    #[tokio::test]
    async fn test_run_sends_audio_and_ends_on_stop() {
        let (endpoint, server) = loopback_server().await;

        let mut connection = VoiceSessionConnection::new(ConnectionConfig::default());
        connection
            .begin(handle(&endpoint), SessionCodec::new(16000).unwrap())
            .unwrap();
        let mut rx = connection.subscribe();

        let (block_tx, block_rx) = mpsc::channel(8);
        let liveness = LivenessFlag::new();
        let microphone = MicrophoneStream::from_parts(block_rx, 16000, liveness.clone());
        let (command_tx, command_rx) = mpsc::channel(8);

        let task = tokio::spawn(async move {
            let result = connection.run(Some(microphone), command_rx).await;
            (connection, result)
        });

        rx.wait_for(|s| s.agent_channel.speaking()).await.unwrap();
        block_tx
            .send(AudioFrame::outbound(0, vec![0.25; 160]))
            .await
            .unwrap();
        block_tx
            .send(AudioFrame::outbound(1, vec![0.25; 160]))
            .await
            .unwrap();
        rx.wait_for(|s| s.stats.frames_sent == 2).await.unwrap();

        command_tx.send(ConnectionCommand::Stop).await.unwrap();
        let (connection, result) = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(connection.state(), SessionState::Ended);
        // The agent was still speaking when the session ended.
        assert!(connection.snapshot().agent_channel.speaking());
        // The microphone was released once the transport closed.
        assert!(!liveness.is_active());

        let received = server.await.unwrap();
        let binaries = received.iter().filter(|m| m.is_binary()).count();
        assert_eq!(binaries, 2);
        let end_notice = received
            .iter()
            .filter_map(|m| m.to_text().ok())
            .any(|t| t.contains("finalizar_sesion"));
        assert!(end_notice);
        assert!(received.last().unwrap().is_close());
    }

    #[tokio::test]
    async fn test_blocks_captured_while_connecting_are_dropped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        const QUEUE: usize = 32;
        let (block_tx, block_rx) = mpsc::channel(QUEUE);
        for sequence in 0..20 {
            block_tx
                .send(AudioFrame::outbound(sequence, vec![0.25; 160]))
                .await
                .unwrap();
        }

        // Hold the handshake until the connecting session has drained every queued block.
        let queue = block_tx.clone();
        let server = tokio::spawn(async move {
            while queue.capacity() < QUEUE {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.send(event("inicio_respuesta_agente")).await.unwrap();
            let mut received = Vec::new();
            while let Some(Ok(message)) = ws.next().await {
                let is_close = message.is_close();
                received.push(message);
                if is_close {
                    break;
                }
            }
            received
        });

        let mut connection = VoiceSessionConnection::new(ConnectionConfig::default());
        connection
            .begin(
                handle(&format!("ws://{}/api/voz?id_sesion=abc", addr)),
                SessionCodec::new(16000).unwrap(),
            )
            .unwrap();
        let mut rx = connection.subscribe();
        let liveness = LivenessFlag::new();
        let microphone = MicrophoneStream::from_parts(block_rx, 16000, liveness.clone());
        let (command_tx, command_rx) = mpsc::channel(8);
        let task = tokio::spawn(async move {
            let result = connection.run(Some(microphone), command_rx).await;
            (connection, result)
        });

        tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|s| s.agent_channel.speaking()),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(rx.borrow().stats.frames_sent, 0);
        assert_eq!(rx.borrow().user_channel.level(), 0.0);

        command_tx.send(ConnectionCommand::Stop).await.unwrap();
        let (connection, result) = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(connection.snapshot().stats.frames_sent, 0);
        assert!(!liveness.is_active());

        let received = server.await.unwrap();
        assert_eq!(received.iter().filter(|m| m.is_binary()).count(), 0);
        drop(block_tx);
    }

    #[tokio::test]
    async fn test_run_ends_when_backend_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.send(event("sesion_finalizada")).await.unwrap();
            // Drain until the client closes.
            while let Some(Ok(_)) = ws.next().await {}
        });

        let mut connection = VoiceSessionConnection::new(ConnectionConfig::default());
        connection
            .begin(
                handle(&format!("ws://{}/api/voz?id_sesion=abc", addr)),
                SessionCodec::new(16000).unwrap(),
            )
            .unwrap();
        let (_command_tx, command_rx) = mpsc::channel(1);
        let result = tokio::time::timeout(Duration::from_secs(5), connection.run(None, command_rx))
            .await
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(connection.state(), SessionState::Ended);
    }

    #[tokio::test]
    async fn test_run_rejects_non_websocket_endpoint() {
        let mut connection = VoiceSessionConnection::new(ConnectionConfig::default());
        connection
            .begin(handle("http://localhost/voz"), SessionCodec::new(16000).unwrap())
            .unwrap();
        let (_command_tx, command_rx) = mpsc::channel(1);
        let result = connection.run(None, command_rx).await;
        assert!(matches!(result, Err(TransportFault::InvalidEndpoint(_))));
        assert_eq!(connection.state(), SessionState::Ended);
    }

    #[tokio::test]
    async fn test_run_connect_failure_ends_session() {
        // Bind then drop to get a port with nothing listening.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let mut connection = VoiceSessionConnection::new(ConnectionConfig::default());
        connection
            .begin(
                handle(&format!("ws://{}/api/voz?id_sesion=abc", addr)),
                SessionCodec::new(16000).unwrap(),
            )
            .unwrap();
        let (_command_tx, command_rx) = mpsc::channel(1);
        let result = connection.run(None, command_rx).await;
        assert!(matches!(result, Err(TransportFault::Connect { .. })));
        assert_eq!(connection.state(), SessionState::Ended);
    }
}

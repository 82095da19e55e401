//! Top-level voice session façade.
//!
//! The orchestrator sequences one session: ask the backend for a session handle,
//! acquire the microphone, then hand both to a [`VoiceSessionConnection`] running
//! on its own task. While that task runs it owns the connection; the orchestrator
//! keeps a command channel to it and gets the connection back when it finishes.
//! UI code reads state only through [`SessionSnapshot`]s.

use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use voz_core::{ControlCommand, LivenessFlag, SessionHandle, SessionSnapshot, SessionState};

use crate::capture::{MicrophoneSource, MicrophoneStream};
use crate::error::{PermissionFault, TransportFault, VoiceError};
use crate::playback::AgentAudioSink;
use crate::session_api::SessionCreator;
use crate::ws::connection::SnapshotPublisher;
use crate::ws::{ConnectionCommand, ConnectionConfig, SessionCodec, VoiceSessionConnection};

const COMMAND_CHANNEL_CAPACITY: usize = 16;

type SessionTask = JoinHandle<(VoiceSessionConnection, Result<(), TransportFault>)>;

struct ActiveSession {
    handle: SessionHandle,
    commands: mpsc::Sender<ConnectionCommand>,
    task: SessionTask,
}

#[derive(Default)]
struct StopTargets {
    pending_start: Option<LivenessFlag>,
    commands: Option<mpsc::Sender<ConnectionCommand>>,
}

/// Stops the orchestrator's session from anywhere, including while `start()` is
/// still waiting on the backend or on microphone permission.
#[derive(Clone, Default)]
pub struct StopHandle {
    targets: Arc<Mutex<StopTargets>>,
}

impl StopHandle {
    pub fn stop(&self) {
        let targets = self.targets.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(flag) = &targets.pending_start {
            info!("Cancelling pending session start");
            flag.stop();
        }
        if let Some(commands) = &targets.commands {
            if let Err(e) = commands.try_send(ConnectionCommand::Stop) {
                debug!("Stop not delivered to session task: {}", e);
            }
        }
    }

    fn arm(&self, flag: LivenessFlag) {
        let mut targets = self.targets.lock().unwrap_or_else(|e| e.into_inner());
        targets.pending_start = Some(flag);
    }

    fn disarm(&self) {
        let mut targets = self.targets.lock().unwrap_or_else(|e| e.into_inner());
        targets.pending_start = None;
    }

    fn attach(&self, commands: mpsc::Sender<ConnectionCommand>) {
        let mut targets = self.targets.lock().unwrap_or_else(|e| e.into_inner());
        targets.commands = Some(commands);
    }

    fn detach(&self) {
        let mut targets = self.targets.lock().unwrap_or_else(|e| e.into_inner());
        targets.commands = None;
    }
}

pub struct VoiceSessionOrchestrator {
    creator: Arc<dyn SessionCreator>,
    microphone: Arc<dyn MicrophoneSource>,
    user_id: Option<String>,
    config: ConnectionConfig,
    publisher: SnapshotPublisher,
    snapshots: watch::Receiver<SessionSnapshot>,
    /// `None` while a session task owns the connection.
    connection: Option<VoiceSessionConnection>,
    active: Option<ActiveSession>,
    pending_sink: Option<Box<dyn AgentAudioSink>>,
    stop: StopHandle,
}

impl VoiceSessionOrchestrator {
    pub fn new(
        creator: Arc<dyn SessionCreator>,
        microphone: Arc<dyn MicrophoneSource>,
        user_id: Option<String>,
        config: ConnectionConfig,
    ) -> Self {
        let (tx, snapshots) = watch::channel(SessionSnapshot::default());
        let publisher = Arc::new(tx);
        let connection = VoiceSessionConnection::with_publisher(config, publisher.clone());
        Self {
            creator,
            microphone,
            user_id,
            config,
            publisher,
            snapshots,
            connection: Some(connection),
            active: None,
            pending_sink: None,
            stop: StopHandle::default(),
        }
    }

    /// Routes decoded agent audio to `sink` from the next session on.
    pub fn set_agent_sink(&mut self, sink: Box<dyn AgentAudioSink>) {
        match self.connection.as_mut() {
            Some(connection) => connection.set_agent_sink(sink),
            None => self.pending_sink = Some(sink),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        *self.snapshots.borrow()
    }

    pub fn state(&self) -> SessionState {
        self.snapshot().session_state
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn session_handle(&self) -> Option<&SessionHandle> {
        self.active.as_ref().map(|active| &active.handle)
    }

    /// Creates a session, acquires the microphone and opens the transport.
    ///
    /// Returns once the session task is running; the transport may still be
    /// connecting. Only permitted from `NoSession` or `Ended`.
    #[instrument(skip(self))]
    pub async fn start(&mut self) -> Result<SessionHandle, VoiceError> {
        self.reap().await;
        match self.connection.as_mut() {
            Some(connection) => connection.mark_creating()?,
            None => return Err(VoiceError::SessionBusy(self.state())),
        }

        let cancel = LivenessFlag::new();
        self.stop.arm(cancel.clone());
        let acquired = self.acquire(&cancel).await;

        let (handle, mut microphone) = match acquired {
            Ok(acquired) => acquired,
            Err(e) => {
                self.stop.disarm();
                warn!("Session start failed: {}", e);
                self.roll_back();
                return Err(e);
            }
        };

        let codec = match SessionCodec::new(microphone.sample_rate()) {
            Ok(codec) => codec,
            Err(e) => {
                self.stop.disarm();
                microphone.stop();
                self.roll_back();
                return Err(PermissionFault::DeviceUnavailable(format!(
                    "Unsupported capture rate {} Hz: {}",
                    microphone.sample_rate(),
                    e
                ))
                .into());
            }
        };

        let Some(mut connection) = self.connection.take() else {
            self.stop.disarm();
            microphone.stop();
            return Err(VoiceError::SessionBusy(self.state()));
        };
        if let Some(sink) = self.pending_sink.take() {
            connection.set_agent_sink(sink);
        }
        if let Err(e) = connection.begin(handle.clone(), codec) {
            self.stop.disarm();
            microphone.stop();
            connection.creation_failed();
            self.connection = Some(connection);
            return Err(e);
        }

        let (commands, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        // Attach before disarming so a concurrent stop always finds a target.
        self.stop.attach(commands.clone());
        self.stop.disarm();
        let task = tokio::spawn(async move {
            let result = connection.run(Some(microphone), command_rx).await;
            (connection, result)
        });
        // A stop that raced the hand-off above still has to reach the task.
        if !cancel.is_active() {
            let _ = commands.try_send(ConnectionCommand::Stop);
        }

        info!(session_id = %handle.session_id, "Voice session started");
        self.active = Some(ActiveSession {
            handle: handle.clone(),
            commands,
            task,
        });
        Ok(handle)
    }

    async fn acquire(
        &self,
        cancel: &LivenessFlag,
    ) -> Result<(SessionHandle, MicrophoneStream), VoiceError> {
        let handle = tokio::select! {
            biased;
            _ = cancel.stopped() => return Err(VoiceError::Cancelled),
            result = self.creator.create_session(self.user_id.clone()) => result?,
        };

        // Dropping the pending start releases whatever the device thread acquired.
        let mut microphone = tokio::select! {
            biased;
            _ = cancel.stopped() => {
                info!("Start cancelled while waiting for microphone access");
                return Err(VoiceError::Cancelled);
            }
            result = self.microphone.start() => result?,
        };

        if !cancel.is_active() {
            microphone.stop();
            return Err(VoiceError::Cancelled);
        }
        Ok((handle, microphone))
    }

    fn roll_back(&mut self) {
        if let Some(connection) = self.connection.as_mut() {
            connection.creation_failed();
        }
    }

    /// Tears the session down: outbound audio stops, the transport closes, then
    /// the microphone is released. Safe to call at any time.
    #[instrument(skip(self))]
    pub async fn end_session(&mut self) {
        self.stop.stop();
        let Some(active) = self.active.take() else {
            debug!("No active session to end");
            return;
        };
        if active.commands.send(ConnectionCommand::Stop).await.is_err() {
            debug!("Session task already finished");
        }
        if let Err(e) = self.finish(active).await {
            warn!("Session ended with a transport fault: {}", e);
        }
    }

    /// Waits for the running session to end on its own.
    pub async fn wait_for_end(&mut self) -> Result<(), VoiceError> {
        let Some(active) = self.active.take() else {
            return Ok(());
        };
        self.finish(active).await.map_err(VoiceError::from)
    }

    /// Tells the backend the user finished speaking.
    pub async fn end_turn(&self) -> bool {
        self.send_command(ControlCommand::EndTurn).await
    }

    pub async fn send_command(&self, command: ControlCommand) -> bool {
        match &self.active {
            Some(active) if !active.task.is_finished() => active
                .commands
                .send(ConnectionCommand::Send(command))
                .await
                .is_ok(),
            _ => {
                debug!(command = command.name(), "No running session for command");
                false
            }
        }
    }

    /// Returns an ended session to `NoSession`, clearing both channels.
    pub async fn restart(&mut self) -> Result<(), VoiceError> {
        self.reap().await;
        let Some(connection) = self.connection.as_mut() else {
            return Err(VoiceError::SessionBusy(self.state()));
        };
        if !connection.state().can_start() {
            return Err(VoiceError::SessionBusy(connection.state()));
        }
        connection.reset();
        Ok(())
    }

    /// Collects a session task that has finished, or that has published `Ended`
    /// and is only releasing the transport and microphone.
    async fn reap(&mut self) {
        let ended = self.state() == SessionState::Ended;
        let finished = self
            .active
            .as_ref()
            .is_some_and(|active| ended || active.task.is_finished());
        if !finished {
            return;
        }
        if let Some(active) = self.active.take() {
            if let Err(e) = self.finish(active).await {
                debug!("Previous session ended with: {}", e);
            }
        }
    }

    async fn finish(&mut self, active: ActiveSession) -> Result<(), TransportFault> {
        let result = active.task.await;
        self.stop.detach();
        match result {
            Ok((connection, result)) => {
                self.connection = Some(connection);
                result
            }
            Err(e) => {
                error!("Voice session task failed: {}", e);
                self.connection = Some(VoiceSessionConnection::with_publisher(
                    self.config,
                    self.publisher.clone(),
                ));
                Ok(())
            }
        }
    }
}

impl Drop for VoiceSessionOrchestrator {
    fn drop(&mut self) {
        if let Some(active) = &self.active {
            let _ = active.commands.try_send(ConnectionCommand::Stop);
        }
    }
}

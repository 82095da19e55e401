//! Main Entrypoint for the Voz Voice Client
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment and the command line.
//! 2. Wiring the microphone, agent playback and session-creation client.
//! 3. Running one voice session until the backend or the user ends it.

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};
use voz_client::{
    capture::{CpalMicrophone, list_input_devices},
    config::Config,
    error::VoiceError,
    orchestrator::VoiceSessionOrchestrator,
    playback::CpalPlayback,
    session_api::HttpSessionCreator,
    ws::ConnectionConfig,
};
use voz_core::{Channel, MeterConfig, SessionSnapshot, SessionState};

const PLAYBACK_BUFFER_SECS: f32 = 2.0;

#[derive(Debug, Parser)]
#[command(
    name = "voz",
    about = "Talk to the voice agent from the terminal",
    version
)]
struct Cli {
    #[arg(long, help = "Backend base URL; overrides VOZ_BACKEND_URL")]
    backend_url: Option<String>,

    #[arg(long, help = "User id sent when creating the session; overrides VOZ_USER_ID")]
    user_id: Option<String>,

    #[arg(long, help = "Do not play the agent's audio")]
    no_playback: bool,

    #[arg(long, help = "List input devices and exit")]
    list_devices: bool,
}

/// Logs the transitions UI code would render.
fn log_changes(previous: &SessionSnapshot, current: &SessionSnapshot) {
    if previous.session_state != current.session_state {
        info!(state = %current.session_state, "Session state changed");
    }
    for channel in [Channel::User, Channel::Agent] {
        let before = previous.channel(channel);
        let now = current.channel(channel);
        if before.speaking() != now.speaking() {
            info!(?channel, speaking = now.speaking(), level = now.level(), "Speaking changed");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // --- 1. Load Configuration ---
    let mut config = Config::from_env().context("Failed to load configuration")?;
    if let Some(backend_url) = cli.backend_url {
        config.backend_url = backend_url;
    }
    if cli.user_id.is_some() {
        config.user_id = cli.user_id;
    }

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();

    if cli.list_devices {
        for name in list_input_devices() {
            println!("{}", name);
        }
        return Ok(());
    }

    // --- 3. Wire Collaborators ---
    let creator = HttpSessionCreator::new(&config.backend_url, &config.api_prefix)
        .context("Invalid backend URL")?;
    let microphone = CpalMicrophone::new(config.input_device.clone());
    let connection_config = ConnectionConfig {
        meter: MeterConfig {
            smoothing: config.level_smoothing,
        },
        speaking_threshold: config.speaking_threshold,
    };
    let mut orchestrator = VoiceSessionOrchestrator::new(
        Arc::new(creator),
        Arc::new(microphone),
        config.user_id.clone(),
        connection_config,
    );

    if config.playback && !cli.no_playback {
        match CpalPlayback::open(PLAYBACK_BUFFER_SECS) {
            Ok(playback) => orchestrator.set_agent_sink(Box::new(playback)),
            Err(e) => warn!("Agent audio playback disabled: {:#}", e),
        }
    }

    let stop = orchestrator.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal. Ending session...");
            stop.stop();
        }
    });

    let mut snapshots = orchestrator.subscribe();
    let monitor = tokio::spawn(async move {
        let mut previous = *snapshots.borrow_and_update();
        while snapshots.changed().await.is_ok() {
            let current = *snapshots.borrow_and_update();
            log_changes(&previous, &current);
            previous = current;
        }
    });

    // --- 4. Run the Session ---
    info!(backend = %config.backend_url, "Starting voice session...");
    let handle = match orchestrator.start().await {
        Ok(handle) => handle,
        Err(VoiceError::Cancelled) => {
            info!("Session start cancelled.");
            monitor.abort();
            return Ok(());
        }
        Err(e) => {
            error!("{}", e);
            monitor.abort();
            return Err(anyhow::Error::new(e).context("Could not start a voice session"));
        }
    };
    info!(session_id = %handle.session_id, "Press Enter to end your turn, Ctrl+C to hang up.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut state = orchestrator.subscribe();
    loop {
        tokio::select! {
            _ = state.wait_for(|s| s.session_state == SessionState::Ended) => break,
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(_)) => {
                    if !orchestrator.end_turn().await {
                        debug!("Turn end not delivered");
                    }
                }
                Ok(None) | Err(_) => stdin_open = false,
            },
        }
    }

    let result = orchestrator.wait_for_end().await;
    let stats = orchestrator.snapshot().stats;
    info!(
        frames_sent = stats.frames_sent,
        frames_received = stats.frames_received,
        decode_faults = stats.decode_faults,
        sequence_gaps = stats.sequence_gaps,
        "Session has ended."
    );
    monitor.abort();

    match result {
        Ok(()) => Ok(()),
        Err(e) => {
            error!("{}", e.user_message());
            Err(anyhow::Error::new(e).context("Voice session failed"))
        }
    }
}

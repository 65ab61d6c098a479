//! board-voice - talk to a realtime voice model from the command line

use anyhow::Context;
use board_voice::capture::{FramePoll, FrameProvider};
use board_voice::config::{Modality, DEFAULT_URL};
use board_voice::credentials::EnvCredentials;
use board_voice::media::WavFileProvider;
use board_voice::playback::OutputDevice;
use board_voice::recorder::ResponseRecorder;
use board_voice::ws_transport::WsConnector;
use board_voice::{Collaborators, ConnectionState, RealtimeConfig, SessionEvent, VoiceError, VoiceSession};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const FRAME_DURATION: Duration = Duration::from_millis(20);

#[derive(Parser, Debug)]
#[command(name = "board-voice", about = "Voice conversation with a realtime model")]
struct Args {
    /// Realtime endpoint
    #[arg(long, env = "BOARD_VOICE_URL", default_value = DEFAULT_URL)]
    url: String,

    /// System instructions for the model
    #[arg(long)]
    instructions: Option<String>,

    #[arg(long, default_value = "alloy")]
    voice: String,

    /// Replay a WAV file instead of the microphone
    #[arg(long)]
    input: Option<PathBuf>,

    /// Save assistant audio as one WAV per turn in this directory
    #[arg(long)]
    record: Option<PathBuf>,

    /// Ask a typed question once the session is active
    #[arg(long)]
    say: Option<String>,

    /// Exit after the response to the end of --input
    #[arg(long)]
    exit_after_input: bool,

    /// Request text responses only
    #[arg(long)]
    text_only: bool,
}

/// Stand-in source when no audio input is available.
#[cfg_attr(feature = "pulse", allow(dead_code))]
struct NoInput;

impl FrameProvider for NoInput {
    fn open(&mut self) -> board_voice::Result<()> {
        Err(VoiceError::Audio("no audio input configured".to_string()))
    }

    fn poll_frame(&mut self) -> board_voice::Result<FramePoll> {
        Ok(FramePoll::Ended)
    }

    fn close(&mut self) {}
}

fn frame_source(args: &Args) -> (Box<dyn FrameProvider>, bool) {
    if let Some(path) = &args.input {
        return (Box::new(WavFileProvider::new(path, FRAME_DURATION)), true);
    }

    #[cfg(feature = "pulse")]
    {
        let mic = board_voice::media::PulseMicrophone::new(board_voice::codec::WIRE_SAMPLE_RATE, FRAME_DURATION);
        (Box::new(mic), true)
    }

    #[cfg(not(feature = "pulse"))]
    {
        (Box::new(NoInput), false)
    }
}

fn output_device() -> Box<dyn OutputDevice> {
    #[cfg(feature = "pulse")]
    {
        Box::new(board_voice::media::PulseSpeaker::new())
    }

    #[cfg(not(feature = "pulse"))]
    {
        Box::new(board_voice::playback::NullOutput)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let mut config = RealtimeConfig {
        url: args.url.clone(),
        voice: args.voice.clone(),
        ..Default::default()
    };
    if let Some(instructions) = &args.instructions {
        config.instructions = instructions.clone();
    }
    if args.text_only {
        config.modalities = vec![Modality::Text];
    }

    let (frames, has_input) = frame_source(&args);
    if !has_input && args.say.is_none() {
        anyhow::bail!("no audio input: pass --input <wav>, --say <text>, or build with --features pulse");
    }

    let recorder = match &args.record {
        Some(dir) => Some(ResponseRecorder::new(dir).context("Failed to create recording directory")?),
        None => None,
    };

    let session = VoiceSession::spawn(
        config,
        Collaborators {
            connector: Arc::new(WsConnector::new()),
            credentials: Arc::new(EnvCredentials),
            frames,
            output: output_device(),
            recorder,
        },
    )?;

    let mut events = session.subscribe();
    let mut snapshots = session.watch();

    if has_input {
        // Connects first when needed
        session.start_listening()?;
    } else {
        session.connect()?;
    }

    let mut say = args.say.clone();
    let mut turns_at_input_end: Option<u64> = None;
    let mut last_response = String::new();
    let mut was_active = false;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }

            event = events.recv() => {
                match event {
                    Ok(SessionEvent::ConnectionStateChanged(ConnectionState::Active)) => {
                        was_active = true;
                        if let Some(text) = say.take() {
                            println!("you (typed): {}", text);
                            session.send_text(text)?;
                        }
                    }
                    Ok(SessionEvent::ConnectionStateChanged(ConnectionState::Closed)) => {
                        if was_active {
                            info!("Session closed");
                        }
                        break;
                    }
                    Ok(SessionEvent::Transcript(text)) => println!("you: {}", text),
                    Ok(SessionEvent::AssistantResponse(text)) => last_response = text,
                    Ok(SessionEvent::Error(message)) => warn!("{}", message),
                    Ok(SessionEvent::ListeningChanged(false)) if args.exit_after_input => {
                        turns_at_input_end = Some(session.snapshot().completed_turns);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => warn!("Dropped {} session events", n),
                    Err(RecvError::Closed) => break,
                }
            }

            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                if snapshot.current_response_text.is_empty() && !last_response.is_empty() {
                    println!("assistant: {}", last_response);
                    last_response.clear();

                    if turns_at_input_end.is_some_and(|t| snapshot.completed_turns > t) {
                        info!("Input finished and answered, exiting");
                        break;
                    }
                }
            }
        }
    }

    session.shutdown().await?;
    Ok(())
}

//! Session runtime
//!
//! [`VoiceSession`] is a cheap handle to a single task that owns the
//! [`Session`] state machine and every resource it drives: the transport,
//! the capture stream, the playback scheduler and the optional recorder.
//! Caller requests, transport events, captured audio and timers are all
//! funneled into that one task, so the state machine only ever sees one
//! event at a time.

use crate::capture::{CaptureMessage, CaptureStream, Captured, FrameProvider};
use crate::config::RealtimeConfig;
use crate::credentials::CredentialProvider;
use crate::error::{Result, VoiceError};
use crate::playback::{OutputDevice, PlaybackScheduler};
use crate::protocol::{parse_binary_message, parse_server_message, ClientEvent};
use crate::recorder::ResponseRecorder;
use crate::session::{Action, Session, SessionEvent, SessionSnapshot};
use crate::transport::{Connector, TransportEvent, TransportHandle, WireMessage};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 256;

/// External resources a session drives.
pub struct Collaborators {
    pub connector: Arc<dyn Connector>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub frames: Box<dyn FrameProvider>,
    pub output: Box<dyn OutputDevice>,
    pub recorder: Option<ResponseRecorder>,
}

enum Command {
    Connect,
    Disconnect(oneshot::Sender<()>),
    StartListening,
    StopListening,
    SendText(String),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to a running voice session.
#[derive(Clone)]
pub struct VoiceSession {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<SessionEvent>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

impl VoiceSession {
    /// Start the session task on the current tokio runtime. The session
    /// starts `Idle`; nothing is opened until [`connect`](Self::connect).
    pub fn spawn(config: RealtimeConfig, collaborators: Collaborators) -> Result<Self> {
        let (handle, actor, commands) = Self::build(config, collaborators)?;
        tokio::spawn(actor.run(commands));
        Ok(handle)
    }

    fn build(
        config: RealtimeConfig,
        collaborators: Collaborators,
    ) -> Result<(Self, SessionActor, mpsc::UnboundedReceiver<Command>)> {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());

        let (capture_tx, capture_rx) = mpsc::unbounded_channel();
        let (playback_err_tx, playback_err_rx) = mpsc::unbounded_channel();

        let capture = CaptureStream::new(collaborators.frames, config.capture_interval, capture_tx);
        let playback = PlaybackScheduler::new(collaborators.output, playback_err_tx)?;

        let actor = SessionActor {
            session: Session::new(config),
            connector: collaborators.connector,
            credentials: collaborators.credentials,
            capture,
            capture_rx,
            playback,
            playback_errors: playback_err_rx,
            recorder: collaborators.recorder,
            transport: None,
            transport_events: None,
            listen_retry: None,
            events: events.clone(),
            snapshot: snapshot_tx,
        };

        let handle = Self {
            commands: command_tx,
            events,
            snapshot: snapshot_rx,
        };
        Ok((handle, actor, command_rx))
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| VoiceError::ChannelClosed)
    }

    pub fn connect(&self) -> Result<()> {
        self.send(Command::Connect)
    }

    /// Tear the session down; resolves once every resource is released.
    pub async fn disconnect(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Disconnect(tx))?;
        rx.await.map_err(|_| VoiceError::ChannelClosed)
    }

    pub fn start_listening(&self) -> Result<()> {
        self.send(Command::StartListening)
    }

    pub fn stop_listening(&self) -> Result<()> {
        self.send(Command::StopListening)
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(Command::SendText(text.into()))
    }

    /// Disconnect and stop the session task. Other handles become inert.
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Shutdown(tx))?;
        rx.await.map_err(|_| VoiceError::ChannelClosed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }
}

enum Wake {
    Command(Option<Command>),
    Transport(Option<TransportEvent>),
    Capture(Captured),
    PlaybackError(String),
    ListenRetry(u32),
}

struct SessionActor {
    session: Session,
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialProvider>,
    capture: CaptureStream,
    capture_rx: mpsc::UnboundedReceiver<Captured>,
    playback: PlaybackScheduler,
    playback_errors: mpsc::UnboundedReceiver<String>,
    recorder: Option<ResponseRecorder>,
    transport: Option<TransportHandle>,
    transport_events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    listen_retry: Option<(u32, Instant)>,
    events: broadcast::Sender<SessionEvent>,
    snapshot: watch::Sender<SessionSnapshot>,
}

async fn next_transport_event(
    events: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>,
) -> Option<TransportEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn listen_retry_due(retry: Option<(u32, Instant)>) -> u32 {
    match retry {
        Some((attempt, at)) => {
            tokio::time::sleep_until(at).await;
            attempt
        }
        None => std::future::pending().await,
    }
}

impl SessionActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        info!("Voice session task started");

        loop {
            let wake = tokio::select! {
                command = commands.recv() => Wake::Command(command),
                event = next_transport_event(&mut self.transport_events) => Wake::Transport(event),
                Some(message) = self.capture_rx.recv() => Wake::Capture(message),
                Some(message) = self.playback_errors.recv() => Wake::PlaybackError(message),
                attempt = listen_retry_due(self.listen_retry) => Wake::ListenRetry(attempt),
            };

            match wake {
                Wake::Command(None) => {
                    info!("All session handles dropped");
                    self.session.disconnect();
                    self.execute_actions();
                    break;
                }
                Wake::Command(Some(command)) => {
                    if let Some(done) = self.on_command(command) {
                        self.session.disconnect();
                        self.execute_actions();
                        if let Some(recorder) = self.recorder.as_mut() {
                            recorder.finish_turn();
                        }
                        let _ = done.send(());
                        break;
                    }
                }
                Wake::Transport(Some(event)) => self.on_transport_event(event),
                Wake::Transport(None) => {
                    // Transport task went away without a final event
                    self.transport = None;
                    self.transport_events = None;
                    self.session.on_transport_closed(None);
                }
                Wake::Capture(message) => self.on_capture(message),
                Wake::PlaybackError(message) => self.session.on_local_error(message),
                Wake::ListenRetry(attempt) => {
                    self.listen_retry = None;
                    self.session.on_listen_retry(attempt);
                }
            }

            self.execute_actions();
        }

        self.capture.stop();
        info!("Voice session task stopped ({})", self.session.turns().summary());
    }

    /// Returns the completion sender when the command asks for shutdown.
    fn on_command(&mut self, command: Command) -> Option<oneshot::Sender<()>> {
        match command {
            Command::Connect => {
                // Rejections are reported to observers by the session
                let _ = self.session.connect();
            }
            Command::Disconnect(done) => {
                self.session.disconnect();
                self.execute_actions();
                let _ = done.send(());
            }
            Command::StartListening => self.session.start_listening(),
            Command::StopListening => self.session.stop_listening(),
            Command::SendText(text) => {
                let _ = self.session.send_text(&text);
            }
            Command::Shutdown(done) => return Some(done),
        }
        None
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => self.session.on_transport_opened(),
            TransportEvent::Message(message) => {
                let parsed = match &message {
                    WireMessage::Text(text) => parse_server_message(text),
                    WireMessage::Binary(bytes) => parse_binary_message(bytes),
                };
                match parsed {
                    Ok(Some(event)) => self.session.on_inbound(event),
                    Ok(None) => {}
                    Err(e) => self.session.on_protocol_error(format!("invalid server message: {}", e)),
                }
            }
            TransportEvent::Closed { reason } => {
                self.transport = None;
                self.transport_events = None;
                self.session.on_transport_closed(reason);
            }
            TransportEvent::Failed(message) => {
                self.transport = None;
                self.transport_events = None;
                self.session.on_transport_failed(message);
            }
        }
    }

    fn on_capture(&mut self, captured: Captured) {
        if captured.generation != self.capture.generation() {
            debug!("Dropping message from stopped capture run {}", captured.generation);
            return;
        }

        match captured.message {
            CaptureMessage::Chunk(chunk) => self.session.on_captured(chunk),
            CaptureMessage::Failed(message) => self.session.on_capture_failed(message),
            CaptureMessage::Ended => {
                info!("Capture input ended");
                self.session.stop_listening();
            }
        }
    }

    /// Run queued actions until the session stops producing new ones.
    fn execute_actions(&mut self) {
        loop {
            let actions = self.session.drain_actions();
            if actions.is_empty() {
                break;
            }
            for action in actions {
                self.execute(action);
            }
        }
        self.snapshot.send_replace(self.session.snapshot());
    }

    fn execute(&mut self, action: Action) {
        match action {
            Action::OpenTransport => self.open_transport(),
            Action::Send(event) => self.send_event(event),
            Action::CloseTransport => {
                if let Some(handle) = self.transport.take() {
                    debug!("Closing transport");
                    handle.close();
                }
                self.transport_events = None;
            }
            Action::StartCapture => match self.capture.start() {
                Ok(()) => self.session.on_capture_started(),
                Err(e) => {
                    error!("Failed to start capture: {}", e);
                    self.session.on_capture_failed(e.to_string());
                }
            },
            Action::StopCapture => self.capture.stop(),
            Action::Play(chunk) => {
                if let Some(recorder) = self.recorder.as_mut() {
                    recorder.on_chunk(&chunk);
                }
                self.playback.enqueue(chunk);
            }
            Action::StopPlayback => {
                if self.playback.is_playing() {
                    info!("Interrupting playback ({} chunks queued)", self.playback.queued_chunks());
                }
                self.playback.stop();
                if let Some(recorder) = self.recorder.as_mut() {
                    recorder.finish_turn();
                }
            }
            Action::ResponseComplete => {
                if let Some(recorder) = self.recorder.as_mut() {
                    recorder.finish_turn();
                }
            }
            Action::ScheduleListenRetry { attempt, delay } => {
                self.listen_retry = Some((attempt, Instant::now() + delay));
            }
            Action::CancelListenRetry => self.listen_retry = None,
            Action::Notify(event) => {
                debug!("Session event: {:?}", event);
                // No subscribers is fine
                let _ = self.events.send(event);
            }
        }
    }

    fn open_transport(&mut self) {
        if let Some(stale) = self.transport.take() {
            stale.close();
        }

        let config = self.session.config();
        let api_key = match self.credentials.credential(&config.credential_name) {
            Ok(key) => key,
            Err(e) => {
                self.session.on_transport_failed(format!("cannot connect: {}", e));
                return;
            }
        };

        let connection = self.connector.open(config.connect_request(&api_key));
        self.transport = Some(connection.handle);
        self.transport_events = Some(connection.events);
    }

    fn send_event(&mut self, event: ClientEvent) {
        let Some(handle) = self.transport.as_ref() else {
            warn!("Dropping {} with no open transport", event.kind());
            return;
        };

        let json = match event.to_json() {
            Ok(json) => json,
            Err(e) => {
                self.session.on_local_error(format!("failed to encode {}: {}", event.kind(), e));
                return;
            }
        };

        debug!("Sending {}", event.kind());
        if let Err(e) = handle.send(WireMessage::Text(json)) {
            self.session.on_transport_failed(format!("send failed: {}", e));
        }
    }
}

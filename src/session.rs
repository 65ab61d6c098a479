//! Realtime voice session state machine
//!
//! [`Session`] owns all per-session state and is mutated only through its
//! event methods. It performs no I/O: every side effect (open the socket,
//! send a message, start capture, play audio, notify observers) is queued
//! as an [`Action`] and drained by the runtime after each event.

use crate::codec::{encode_base64, AudioChunk, AudioFormat, ChunkSequencer};
use crate::config::RealtimeConfig;
use crate::error::{Result, VoiceError};
use crate::protocol::{ClientEvent, ConversationItem, InboundEvent};
use crate::stats::TurnTracker;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Connection lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    AwaitingConfig,
    Active,
    Closing,
    Closed,
}

impl ConnectionState {
    /// States in which a transport exists and inbound events are processed.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Connecting | Self::AwaitingConfig | Self::Active)
    }
}

/// Notifications delivered to observers
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ConnectionStateChanged(ConnectionState),
    /// Finalized transcription of user speech
    Transcript(String),
    /// Cumulative assistant text for the in-progress response
    AssistantResponse(String),
    Error(String),
    /// Remote VAD reports the user is (or stopped) speaking
    SpeakingChanged(bool),
    ListeningChanged(bool),
}

/// Side effects requested by the state machine, executed in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    OpenTransport,
    Send(ClientEvent),
    CloseTransport,
    StartCapture,
    StopCapture,
    Play(AudioChunk),
    StopPlayback,
    /// The assistant finished a response turn
    ResponseComplete,
    ScheduleListenRetry { attempt: u32, delay: Duration },
    CancelListenRetry,
    Notify(SessionEvent),
}

/// Point-in-time copy of the observable session fields.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionSnapshot {
    pub connection_state: ConnectionState,
    pub is_listening: bool,
    pub listen_requested: bool,
    pub is_remote_speaking: bool,
    pub pending_outbound_audio: usize,
    pub current_response_text: String,
    pub last_user_transcript: Option<String>,
    pub last_error: Option<String>,
    pub completed_turns: u64,
    pub average_latency: Option<Duration>,
}

/// One voice conversation over a duplex connection.
pub struct Session {
    config: RealtimeConfig,
    state: ConnectionState,
    is_listening: bool,
    /// Listening was asked for before the session became active
    listen_requested: bool,
    /// StartCapture issued, device not confirmed yet
    capture_starting: bool,
    is_remote_speaking: bool,
    pending_outbound_audio: VecDeque<AudioChunk>,
    current_response_text: String,
    last_user_transcript: Option<String>,
    last_error: Option<String>,
    config_sent: bool,
    playback_sequencer: ChunkSequencer,
    turns: TurnTracker,
    outbox: Vec<Action>,
}

impl Session {
    pub fn new(config: RealtimeConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Idle,
            is_listening: false,
            listen_requested: false,
            capture_starting: false,
            is_remote_speaking: false,
            pending_outbound_audio: VecDeque::new(),
            current_response_text: String::new(),
            last_user_transcript: None,
            last_error: None,
            config_sent: false,
            playback_sequencer: ChunkSequencer::new(),
            turns: TurnTracker::new(),
            outbox: Vec::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_listening(&self) -> bool {
        self.is_listening
    }

    pub fn is_remote_speaking(&self) -> bool {
        self.is_remote_speaking
    }

    pub fn current_response_text(&self) -> &str {
        &self.current_response_text
    }

    pub fn last_user_transcript(&self) -> Option<&str> {
        self.last_user_transcript.as_deref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn pending_outbound_audio(&self) -> usize {
        self.pending_outbound_audio.len()
    }

    pub fn turns(&self) -> &TurnTracker {
        &self.turns
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.config
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            connection_state: self.state,
            is_listening: self.is_listening,
            listen_requested: self.listen_requested,
            is_remote_speaking: self.is_remote_speaking,
            pending_outbound_audio: self.pending_outbound_audio.len(),
            current_response_text: self.current_response_text.clone(),
            last_user_transcript: self.last_user_transcript.clone(),
            last_error: self.last_error.clone(),
            completed_turns: self.turns.completed_turns(),
            average_latency: self.turns.average_latency(),
        }
    }

    /// Drain all pending actions
    pub fn drain_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.outbox)
    }

    // === Caller requests ===

    /// Begin a new session. Only valid when no session is live.
    pub fn connect(&mut self) -> Result<()> {
        match self.state {
            ConnectionState::Idle | ConnectionState::Closed => {
                self.last_error = None;
                self.set_state(ConnectionState::Connecting);
                self.outbox.push(Action::OpenTransport);
                Ok(())
            }
            state => {
                let message = format!("connect requested while session is {:?}", state);
                warn!("{}", message);
                self.report_error(message.clone());
                Err(VoiceError::InvalidState(message))
            }
        }
    }

    /// Tear the session down. Safe from any state; a no-op when nothing is live.
    pub fn disconnect(&mut self) {
        match self.state {
            ConnectionState::Idle | ConnectionState::Closed | ConnectionState::Closing => {
                debug!("Disconnect ignored in state {:?}", self.state);
            }
            _ => {
                info!("Disconnecting session");
                self.teardown();
            }
        }
    }

    pub fn start_listening(&mut self) {
        if self.is_listening || self.capture_starting {
            debug!("Already listening");
            return;
        }

        match self.state {
            ConnectionState::Active => self.begin_capture(),
            ConnectionState::Idle | ConnectionState::Closed => {
                info!("Listening requested without a session, connecting first");
                self.listen_requested = true;
                // Cannot fail from Idle/Closed
                let _ = self.connect();
                self.schedule_listen_retry(1);
            }
            ConnectionState::Connecting | ConnectionState::AwaitingConfig => {
                if !self.listen_requested {
                    debug!("Listening requested during {:?}, deferring capture", self.state);
                    self.listen_requested = true;
                    self.schedule_listen_retry(1);
                }
            }
            ConnectionState::Closing => {
                debug!("Listening requested while closing, ignored");
            }
        }
    }

    pub fn stop_listening(&mut self) {
        if self.is_listening {
            info!("Stopping capture");
            self.is_listening = false;
            self.pending_outbound_audio.clear();
            self.outbox.push(Action::StopCapture);
            self.notify(SessionEvent::ListeningChanged(false));
        } else if self.capture_starting {
            self.capture_starting = false;
            self.pending_outbound_audio.clear();
            self.outbox.push(Action::StopCapture);
        } else if self.listen_requested {
            debug!("Cancelling deferred listen request");
            self.listen_requested = false;
            self.pending_outbound_audio.clear();
            self.outbox.push(Action::CancelListenRetry);
        }
    }

    /// Ask the model a typed question. Only valid while active.
    pub fn send_text(&mut self, text: &str) -> Result<()> {
        if self.state != ConnectionState::Active {
            let message = format!("cannot send text while session is {:?}", self.state);
            self.report_error(message.clone());
            return Err(VoiceError::InvalidState(message));
        }

        self.outbox.push(Action::Send(ClientEvent::ConversationItemCreate {
            item: ConversationItem::user_text(text),
        }));
        self.outbox.push(Action::Send(ClientEvent::ResponseCreate));
        Ok(())
    }

    // === Transport signals ===

    pub fn on_transport_opened(&mut self) {
        if self.state == ConnectionState::Connecting {
            self.set_state(ConnectionState::AwaitingConfig);
        } else {
            debug!("Transport open signal ignored in state {:?}", self.state);
        }
    }

    /// Peer closed the connection.
    pub fn on_transport_closed(&mut self, reason: Option<String>) {
        let message = match reason {
            Some(reason) => format!("connection closed: {}", reason),
            None => "connection closed".to_string(),
        };
        self.on_transport_failed(message);
    }

    /// Connection-level failure: always fatal to the session.
    pub fn on_transport_failed(&mut self, message: String) {
        if !self.state.is_live() {
            debug!("Transport failure after teardown ignored: {}", message);
            return;
        }
        warn!("Transport failure: {}", message);
        self.report_error(message);
        self.teardown();
    }

    /// A frame could not be decoded. Reported, never fatal.
    pub fn on_protocol_error(&mut self, message: String) {
        if !self.state.is_live() {
            return;
        }
        warn!("Protocol error: {}", message);
        self.report_error(message);
    }

    /// Dispatch one inbound event.
    pub fn on_inbound(&mut self, event: InboundEvent) {
        if !self.state.is_live() {
            debug!("Discarding {:?} in state {:?}", event_name(&event), self.state);
            return;
        }

        match event {
            InboundEvent::SessionCreated => match self.state {
                ConnectionState::Connecting | ConnectionState::AwaitingConfig => self.activate(),
                _ => warn!("Duplicate session.created ignored"),
            },
            InboundEvent::SessionUpdated => {
                debug!("Session configuration acknowledged");
            }
            InboundEvent::Error { message } => {
                warn!("Server error: {}", message);
                self.report_error(message);
            }
            InboundEvent::SpeechStarted => {
                self.is_remote_speaking = true;
                self.notify(SessionEvent::SpeakingChanged(true));
                if self.config.interrupt_playback_on_speech {
                    self.outbox.push(Action::StopPlayback);
                }
            }
            InboundEvent::SpeechStopped => {
                self.is_remote_speaking = false;
                self.notify(SessionEvent::SpeakingChanged(false));
                self.turns.start_turn();
            }
            InboundEvent::UserTranscript { text } => {
                info!("User: {}", text);
                self.last_user_transcript = Some(text.clone());
                self.notify(SessionEvent::Transcript(text));
            }
            InboundEvent::AssistantTextDelta { text } => {
                self.turns.first_response();
                self.current_response_text.push_str(&text);
                self.notify(SessionEvent::AssistantResponse(self.current_response_text.clone()));
            }
            InboundEvent::AssistantTextDone { text } => {
                self.current_response_text = text;
                self.notify(SessionEvent::AssistantResponse(self.current_response_text.clone()));
            }
            InboundEvent::AssistantAudioDelta { bytes } => {
                self.turns.first_response();
                if bytes.is_empty() {
                    return;
                }
                let chunk = self.playback_sequencer.chunk(bytes, AudioFormat::WIRE);
                debug!(
                    "Assistant audio chunk {} ({}ms)",
                    chunk.sequence(),
                    chunk.duration().as_millis()
                );
                self.outbox.push(Action::Play(chunk));
            }
            InboundEvent::ResponseDone => {
                debug!("Response complete");
                self.current_response_text.clear();
                self.outbox.push(Action::ResponseComplete);
            }
        }
    }

    // === Local audio ===

    /// A wire-format chunk from the capture stream.
    pub fn on_captured(&mut self, chunk: AudioChunk) {
        if self.state == ConnectionState::Active && self.is_listening {
            debug!("Sending audio chunk {} ({} bytes)", chunk.sequence(), chunk.data().len());
            self.outbox.push(Action::Send(ClientEvent::InputAudioBufferAppend {
                audio: encode_base64(chunk.data()),
            }));
        } else if self.state.is_live() && (self.listen_requested || self.capture_starting || self.is_listening) {
            self.pending_outbound_audio.push_back(chunk);
            if self.pending_outbound_audio.len() > self.config.pending_audio_limit {
                self.pending_outbound_audio.pop_front();
                debug!("Pending audio full, dropped oldest chunk");
            }
        } else {
            debug!("Dropping captured chunk {} (not listening)", chunk.sequence());
        }
    }

    /// The capture device is open and delivering frames.
    pub fn on_capture_started(&mut self) {
        if !self.capture_starting {
            debug!("Capture start confirmation ignored");
            return;
        }
        self.capture_starting = false;
        self.is_listening = true;
        self.notify(SessionEvent::ListeningChanged(true));

        let pending: Vec<AudioChunk> = self.pending_outbound_audio.drain(..).collect();
        if !pending.is_empty() {
            debug!("Flushing {} pending audio chunks", pending.len());
        }
        for chunk in pending {
            self.outbox.push(Action::Send(ClientEvent::InputAudioBufferAppend {
                audio: encode_base64(chunk.data()),
            }));
        }
    }

    /// The capture device failed; the connection is unaffected.
    pub fn on_capture_failed(&mut self, message: String) {
        let was_listening = self.is_listening;
        self.is_listening = false;
        self.capture_starting = false;
        self.listen_requested = false;
        self.pending_outbound_audio.clear();
        self.outbox.push(Action::StopCapture);
        self.outbox.push(Action::CancelListenRetry);
        self.report_error(format!("audio capture failed: {}", message));
        if was_listening {
            self.notify(SessionEvent::ListeningChanged(false));
        }
    }

    /// Playback or other local device failure.
    pub fn on_local_error(&mut self, message: String) {
        self.report_error(message);
    }

    /// Retry timer for a deferred listen request fired.
    pub fn on_listen_retry(&mut self, attempt: u32) {
        if !self.listen_requested {
            return;
        }

        if self.state == ConnectionState::Active {
            self.begin_capture();
        } else if !self.state.is_live() {
            self.listen_requested = false;
        } else if attempt >= self.config.listen_retry.max_attempts {
            self.listen_requested = false;
            self.pending_outbound_audio.clear();
            self.report_error(format!(
                "session not active after {} attempts; listening cancelled",
                attempt
            ));
        } else {
            debug!("Session not active yet (attempt {}), retrying", attempt);
            self.schedule_listen_retry(attempt + 1);
        }
    }

    // === Internals ===

    fn activate(&mut self) {
        if self.state == ConnectionState::Connecting {
            self.set_state(ConnectionState::AwaitingConfig);
        }

        if !self.config_sent {
            info!("Session created, sending configuration");
            self.config_sent = true;
            self.outbox.push(Action::Send(ClientEvent::SessionUpdate {
                session: self.config.session_update(),
            }));
        }
        self.set_state(ConnectionState::Active);

        if self.listen_requested {
            self.begin_capture();
        }
    }

    /// Listening is announced by [`on_capture_started`](Self::on_capture_started)
    /// once the device is open.
    fn begin_capture(&mut self) {
        info!("Starting capture");
        self.listen_requested = false;
        self.capture_starting = true;
        self.outbox.push(Action::CancelListenRetry);
        self.outbox.push(Action::StartCapture);
    }

    fn schedule_listen_retry(&mut self, attempt: u32) {
        self.outbox.push(Action::ScheduleListenRetry {
            attempt,
            delay: self.config.listen_retry.delay,
        });
    }

    fn teardown(&mut self) {
        self.set_state(ConnectionState::Closing);

        self.outbox.push(Action::CancelListenRetry);
        self.outbox.push(Action::StopCapture);
        self.outbox.push(Action::StopPlayback);
        self.outbox.push(Action::CloseTransport);

        if !self.pending_outbound_audio.is_empty() {
            debug!("Discarding {} pending audio chunks", self.pending_outbound_audio.len());
            self.pending_outbound_audio.clear();
        }

        let was_listening = self.is_listening;
        let was_speaking = self.is_remote_speaking;

        self.is_listening = false;
        self.capture_starting = false;
        self.listen_requested = false;
        self.is_remote_speaking = false;
        self.current_response_text.clear();
        self.last_user_transcript = None;
        self.config_sent = false;
        self.playback_sequencer = ChunkSequencer::new();
        self.turns.abandon_pending();

        if was_listening {
            self.notify(SessionEvent::ListeningChanged(false));
        }
        if was_speaking {
            self.notify(SessionEvent::SpeakingChanged(false));
        }

        self.set_state(ConnectionState::Closed);
        info!("Session closed ({})", self.turns.summary());
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            info!("Session state: {:?} -> {:?}", self.state, state);
            self.state = state;
            self.notify(SessionEvent::ConnectionStateChanged(state));
        }
    }

    fn report_error(&mut self, message: String) {
        self.last_error = Some(message.clone());
        self.notify(SessionEvent::Error(message));
    }

    fn notify(&mut self, event: SessionEvent) {
        self.outbox.push(Action::Notify(event));
    }
}

fn event_name(event: &InboundEvent) -> &'static str {
    match event {
        InboundEvent::SessionCreated => "SessionCreated",
        InboundEvent::SessionUpdated => "SessionUpdated",
        InboundEvent::Error { .. } => "Error",
        InboundEvent::SpeechStarted => "SpeechStarted",
        InboundEvent::SpeechStopped => "SpeechStopped",
        InboundEvent::UserTranscript { .. } => "UserTranscript",
        InboundEvent::AssistantTextDelta { .. } => "AssistantTextDelta",
        InboundEvent::AssistantTextDone { .. } => "AssistantTextDone",
        InboundEvent::AssistantAudioDelta { .. } => "AssistantAudioDelta",
        InboundEvent::ResponseDone => "ResponseDone",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ListenRetryPolicy;

    fn active_session() -> Session {
        let mut session = Session::new(RealtimeConfig::default());
        session.connect().unwrap();
        session.on_transport_opened();
        session.on_inbound(InboundEvent::SessionCreated);
        session.drain_actions();
        session
    }

    fn config_sends(actions: &[Action]) -> usize {
        actions
            .iter()
            .filter(|a| matches!(a, Action::Send(ClientEvent::SessionUpdate { .. })))
            .count()
    }

    fn notifications(actions: &[Action]) -> Vec<SessionEvent> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Notify(e) => Some(e.clone()),
                _ => None,
            })
            .collect()
    }

    fn audio_sends(actions: &[Action]) -> Vec<String> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Send(ClientEvent::InputAudioBufferAppend { audio }) => Some(audio.clone()),
                _ => None,
            })
            .collect()
    }

    /// Start listening and confirm the device opened.
    fn listen(session: &mut Session) {
        session.start_listening();
        session.on_capture_started();
    }

    fn chunk(bytes: &[u8], sequence: u64) -> AudioChunk {
        AudioChunk::new(bytes.to_vec(), AudioFormat::WIRE, sequence)
    }

    #[test]
    fn test_connect_reaches_active_with_one_config_send() {
        let mut session = Session::new(RealtimeConfig::default());
        session.connect().unwrap();
        assert_eq!(session.state(), ConnectionState::Connecting);
        assert_eq!(session.drain_actions()[1], Action::OpenTransport);

        session.on_transport_opened();
        assert_eq!(session.state(), ConnectionState::AwaitingConfig);

        session.on_inbound(InboundEvent::SessionCreated);
        assert_eq!(session.state(), ConnectionState::Active);
        let actions = session.drain_actions();
        assert_eq!(config_sends(&actions), 1);

        // The configuration goes out before Active is announced
        let send_idx = actions
            .iter()
            .position(|a| matches!(a, Action::Send(ClientEvent::SessionUpdate { .. })))
            .unwrap();
        let active_idx = actions
            .iter()
            .position(|a| {
                *a == Action::Notify(SessionEvent::ConnectionStateChanged(ConnectionState::Active))
            })
            .unwrap();
        assert!(send_idx < active_idx);

        session.on_inbound(InboundEvent::SessionCreated);
        assert_eq!(config_sends(&session.drain_actions()), 0);
    }

    #[test]
    fn test_session_created_before_transport_open() {
        let mut session = Session::new(RealtimeConfig::default());
        session.connect().unwrap();
        session.drain_actions();

        session.on_inbound(InboundEvent::SessionCreated);
        let actions = session.drain_actions();
        assert_eq!(session.state(), ConnectionState::Active);
        assert_eq!(config_sends(&actions), 1);
        assert_eq!(
            notifications(&actions)[..2],
            [
                SessionEvent::ConnectionStateChanged(ConnectionState::AwaitingConfig),
                SessionEvent::ConnectionStateChanged(ConnectionState::Active),
            ]
        );

        // A late open signal changes nothing
        session.on_transport_opened();
        assert_eq!(session.state(), ConnectionState::Active);
        assert!(session.drain_actions().is_empty());
    }

    #[test]
    fn test_happy_path_scenario() {
        let mut session = active_session();

        session.start_listening();
        let actions = session.drain_actions();
        assert!(actions.contains(&Action::StartCapture));
        session.on_capture_started();
        assert!(session.is_listening());

        session.on_inbound(InboundEvent::SpeechStarted);
        assert!(session.is_remote_speaking());

        session.on_inbound(InboundEvent::UserTranscript { text: "2+2=?".to_string() });
        assert_eq!(session.last_user_transcript(), Some("2+2=?"));

        session.on_inbound(InboundEvent::AssistantTextDelta { text: "The ".to_string() });
        session.on_inbound(InboundEvent::AssistantTextDelta { text: "answer is 4.".to_string() });
        assert_eq!(session.current_response_text(), "The answer is 4.");

        let events = notifications(&session.drain_actions());
        assert!(events.contains(&SessionEvent::Transcript("2+2=?".to_string())));
        assert!(events.contains(&SessionEvent::AssistantResponse("The ".to_string())));
        assert!(events.contains(&SessionEvent::AssistantResponse("The answer is 4.".to_string())));

        session.on_inbound(InboundEvent::ResponseDone);
        assert_eq!(session.current_response_text(), "");
        assert!(session.drain_actions().contains(&Action::ResponseComplete));
    }

    #[test]
    fn test_text_done_overwrites_deltas() {
        let mut session = active_session();
        for delta in ["a", "b", "c"] {
            session.on_inbound(InboundEvent::AssistantTextDelta { text: delta.to_string() });
        }
        assert_eq!(session.current_response_text(), "abc");

        session.on_inbound(InboundEvent::AssistantTextDone { text: "final".to_string() });
        assert_eq!(session.current_response_text(), "final");
        let events = notifications(&session.drain_actions());
        assert_eq!(events.last(), Some(&SessionEvent::AssistantResponse("final".to_string())));
    }

    #[test]
    fn test_server_error_is_not_fatal() {
        let mut session = active_session();
        session.on_inbound(InboundEvent::Error { message: "rate limited".to_string() });

        assert_eq!(session.state(), ConnectionState::Active);
        assert_eq!(session.last_error(), Some("rate limited"));
        let actions = session.drain_actions();
        assert_eq!(actions, vec![Action::Notify(SessionEvent::Error("rate limited".to_string()))]);
    }

    #[test]
    fn test_protocol_error_is_not_fatal() {
        let mut session = active_session();
        session.on_protocol_error("bad frame".to_string());
        assert_eq!(session.state(), ConnectionState::Active);
        assert_eq!(
            session.drain_actions(),
            vec![Action::Notify(SessionEvent::Error("bad frame".to_string()))]
        );
    }

    #[test]
    fn test_stop_listening_is_idempotent() {
        let mut session = active_session();
        listen(&mut session);
        session.drain_actions();

        session.stop_listening();
        let first = session.drain_actions();
        assert!(first.contains(&Action::StopCapture));
        assert!(!session.is_listening());

        session.stop_listening();
        assert!(session.drain_actions().is_empty());

        // Starting twice is also a no-op the second time
        session.start_listening();
        session.drain_actions();
        session.start_listening();
        assert!(session.drain_actions().is_empty());
    }

    #[test]
    fn test_disconnect_releases_resources() {
        let mut session = active_session();
        listen(&mut session);
        session.on_inbound(InboundEvent::SpeechStarted);
        session.on_inbound(InboundEvent::AssistantTextDelta { text: "partial".to_string() });
        session.drain_actions();

        session.disconnect();
        let actions = session.drain_actions();

        assert!(actions.contains(&Action::StopCapture));
        assert!(actions.contains(&Action::StopPlayback));
        assert!(actions.contains(&Action::CloseTransport));
        assert_eq!(session.state(), ConnectionState::Closed);
        assert!(!session.is_listening());
        assert!(!session.is_remote_speaking());
        assert_eq!(session.current_response_text(), "");

        let events = notifications(&actions);
        assert_eq!(
            events,
            vec![
                SessionEvent::ConnectionStateChanged(ConnectionState::Closing),
                SessionEvent::ListeningChanged(false),
                SessionEvent::SpeakingChanged(false),
                SessionEvent::ConnectionStateChanged(ConnectionState::Closed),
            ]
        );
    }

    #[test]
    fn test_disconnect_from_idle_and_closed_is_noop() {
        let mut session = Session::new(RealtimeConfig::default());
        session.disconnect();
        assert!(session.drain_actions().is_empty());
        assert_eq!(session.state(), ConnectionState::Idle);

        let mut session = active_session();
        session.disconnect();
        session.drain_actions();
        session.disconnect();
        assert!(session.drain_actions().is_empty());
        assert_eq!(session.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_events_after_disconnect_are_discarded() {
        let mut session = active_session();
        session.disconnect();
        session.drain_actions();

        session.on_inbound(InboundEvent::AssistantTextDelta { text: "late".to_string() });
        session.on_inbound(InboundEvent::AssistantAudioDelta { bytes: vec![0, 0] });
        session.on_inbound(InboundEvent::SessionCreated);
        session.on_transport_failed("late failure".to_string());

        assert!(session.drain_actions().is_empty());
        assert_eq!(session.current_response_text(), "");
        assert_eq!(session.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_second_connect_is_rejected() {
        let mut session = active_session();
        assert!(matches!(session.connect(), Err(VoiceError::InvalidState(_))));
        assert_eq!(session.state(), ConnectionState::Active);
        let events = notifications(&session.drain_actions());
        assert!(matches!(events.as_slice(), [SessionEvent::Error(_)]));
    }

    #[test]
    fn test_reconnect_after_disconnect() {
        let mut session = active_session();
        session.disconnect();
        session.drain_actions();

        session.connect().unwrap();
        session.on_inbound(InboundEvent::SessionCreated);
        assert_eq!(session.state(), ConnectionState::Active);
        assert_eq!(config_sends(&session.drain_actions()), 1);
    }

    #[test]
    fn test_transport_failure_forces_closed() {
        let mut session = active_session();
        listen(&mut session);
        session.drain_actions();

        session.on_transport_closed(Some("going away".to_string()));
        let actions = session.drain_actions();
        assert_eq!(session.state(), ConnectionState::Closed);
        assert_eq!(session.last_error(), Some("connection closed: going away"));

        let events = notifications(&actions);
        assert_eq!(events[0], SessionEvent::Error("connection closed: going away".to_string()));
        assert!(events.contains(&SessionEvent::ListeningChanged(false)));
        assert_eq!(
            events.last(),
            Some(&SessionEvent::ConnectionStateChanged(ConnectionState::Closed))
        );
    }

    #[test]
    fn test_listen_from_idle_connects_then_captures() {
        let mut session = Session::new(RealtimeConfig::default());
        session.start_listening();
        let actions = session.drain_actions();
        assert!(actions.contains(&Action::OpenTransport));
        assert!(actions.contains(&Action::ScheduleListenRetry {
            attempt: 1,
            delay: Duration::from_millis(500)
        }));
        assert!(!actions.contains(&Action::StartCapture));
        assert!(!session.is_listening());

        session.on_inbound(InboundEvent::SessionCreated);
        let actions = session.drain_actions();
        let config_idx = actions
            .iter()
            .position(|a| matches!(a, Action::Send(ClientEvent::SessionUpdate { .. })))
            .unwrap();
        let capture_idx = actions.iter().position(|a| *a == Action::StartCapture).unwrap();
        assert!(config_idx < capture_idx);
        session.on_capture_started();
        assert!(session.is_listening());

        // The pending retry timer is now stale
        session.on_listen_retry(1);
        assert!(session.drain_actions().is_empty());
    }

    #[test]
    fn test_listen_retry_is_bounded() {
        let config = RealtimeConfig {
            listen_retry: ListenRetryPolicy {
                max_attempts: 3,
                delay: Duration::from_millis(10),
            },
            ..Default::default()
        };
        let mut session = Session::new(config);
        session.start_listening();
        session.drain_actions();

        session.on_listen_retry(1);
        assert!(session.drain_actions().contains(&Action::ScheduleListenRetry {
            attempt: 2,
            delay: Duration::from_millis(10)
        }));
        session.on_listen_retry(2);
        session.drain_actions();

        session.on_listen_retry(3);
        let actions = session.drain_actions();
        assert!(!actions.iter().any(|a| matches!(a, Action::ScheduleListenRetry { .. })));
        assert!(matches!(notifications(&actions).as_slice(), [SessionEvent::Error(_)]));

        // The connection attempt itself is left alone; a late session.created
        // no longer starts capture
        assert_eq!(session.state(), ConnectionState::Connecting);
        session.on_inbound(InboundEvent::SessionCreated);
        assert!(!session.drain_actions().contains(&Action::StartCapture));
    }

    #[test]
    fn test_pending_audio_flushed_in_order_on_activation() {
        let config = RealtimeConfig {
            pending_audio_limit: 2,
            ..Default::default()
        };
        let mut session = Session::new(config);
        session.start_listening();
        session.on_transport_opened();

        session.on_captured(chunk(&[1, 0], 0));
        session.on_captured(chunk(&[2, 0], 1));
        session.on_captured(chunk(&[3, 0], 2));
        assert_eq!(session.pending_outbound_audio(), 2);
        session.drain_actions();

        session.on_inbound(InboundEvent::SessionCreated);
        assert!(audio_sends(&session.drain_actions()).is_empty());

        session.on_capture_started();
        let sent = audio_sends(&session.drain_actions());
        assert_eq!(sent, vec![encode_base64(&[2, 0]), encode_base64(&[3, 0])]);
        assert_eq!(session.pending_outbound_audio(), 0);
    }

    #[test]
    fn test_audio_only_sent_while_listening() {
        let mut session = active_session();
        session.on_captured(chunk(&[9, 9], 0));
        assert!(session.drain_actions().is_empty());

        listen(&mut session);
        session.drain_actions();
        session.on_captured(chunk(&[1, 2], 1));
        assert_eq!(audio_sends(&session.drain_actions()), vec![encode_base64(&[1, 2])]);
    }

    #[test]
    fn test_assistant_audio_is_sequenced_for_playback() {
        let mut session = active_session();
        session.on_inbound(InboundEvent::AssistantAudioDelta { bytes: vec![1, 0] });
        session.on_inbound(InboundEvent::AssistantAudioDelta { bytes: vec![2, 0] });
        let played: Vec<u64> = session
            .drain_actions()
            .into_iter()
            .filter_map(|a| match a {
                Action::Play(chunk) => Some(chunk.sequence()),
                _ => None,
            })
            .collect();
        assert_eq!(played, vec![0, 1]);
    }

    #[test]
    fn test_speech_start_interrupts_playback() {
        let mut session = active_session();
        session.on_inbound(InboundEvent::SpeechStarted);
        assert!(session.drain_actions().contains(&Action::StopPlayback));

        let config = RealtimeConfig {
            interrupt_playback_on_speech: false,
            ..Default::default()
        };
        let mut session = Session::new(config);
        session.connect().unwrap();
        session.on_inbound(InboundEvent::SessionCreated);
        session.drain_actions();
        session.on_inbound(InboundEvent::SpeechStarted);
        assert!(!session.drain_actions().contains(&Action::StopPlayback));
    }

    #[test]
    fn test_capture_failure_keeps_connection() {
        let mut session = active_session();
        listen(&mut session);
        session.drain_actions();

        session.on_capture_failed("device busy".to_string());
        assert_eq!(session.state(), ConnectionState::Active);
        assert!(!session.is_listening());
        let events = notifications(&session.drain_actions());
        assert_eq!(
            events,
            vec![
                SessionEvent::Error("audio capture failed: device busy".to_string()),
                SessionEvent::ListeningChanged(false),
            ]
        );
    }

    #[test]
    fn test_listening_announced_once_capture_starts() {
        let mut session = active_session();
        session.start_listening();
        let actions = session.drain_actions();
        assert!(actions.contains(&Action::StartCapture));
        assert!(notifications(&actions).is_empty());
        assert!(!session.is_listening());

        // A second request while the device is opening is ignored
        session.start_listening();
        assert!(session.drain_actions().is_empty());

        session.on_capture_started();
        assert!(session.is_listening());
        assert_eq!(
            notifications(&session.drain_actions()),
            vec![SessionEvent::ListeningChanged(true)]
        );

        // Stale confirmations change nothing
        session.on_capture_started();
        assert!(session.drain_actions().is_empty());
    }

    #[test]
    fn test_failed_capture_start_never_reports_listening() {
        let mut session = active_session();
        session.start_listening();
        session.drain_actions();

        session.on_capture_failed("no device".to_string());
        assert_eq!(session.state(), ConnectionState::Active);
        assert!(!session.is_listening());
        assert_eq!(
            notifications(&session.drain_actions()),
            vec![SessionEvent::Error("audio capture failed: no device".to_string())]
        );
        assert_eq!(session.last_error(), Some("audio capture failed: no device"));
    }

    #[test]
    fn test_stop_listening_while_capture_opening() {
        let mut session = active_session();
        session.start_listening();
        session.drain_actions();

        session.stop_listening();
        assert_eq!(session.drain_actions(), vec![Action::StopCapture]);

        session.on_capture_started();
        assert!(!session.is_listening());
        assert!(session.drain_actions().is_empty());
    }

    #[test]
    fn test_new_session_matches_default_snapshot() {
        let session = Session::new(RealtimeConfig::default());
        assert_eq!(session.snapshot(), SessionSnapshot::default());
        assert_eq!(SessionSnapshot::default().connection_state, ConnectionState::Idle);
    }

    #[test]
    fn test_send_text_requires_active() {
        let mut session = Session::new(RealtimeConfig::default());
        assert!(session.send_text("hi").is_err());
        session.drain_actions();

        let mut session = active_session();
        session.send_text("what is 2+2?").unwrap();
        let actions = session.drain_actions();
        assert!(matches!(
            actions.as_slice(),
            [
                Action::Send(ClientEvent::ConversationItemCreate { .. }),
                Action::Send(ClientEvent::ResponseCreate)
            ]
        ));
    }

    #[test]
    fn test_turn_latency_tracked() {
        let mut session = active_session();
        session.on_inbound(InboundEvent::SpeechStopped);
        assert_eq!(session.turns().pending_turns(), 1);
        session.on_inbound(InboundEvent::AssistantAudioDelta { bytes: vec![0, 0] });
        session.on_inbound(InboundEvent::AssistantTextDelta { text: "x".to_string() });
        assert_eq!(session.turns().completed_turns(), 1);
        assert_eq!(session.snapshot().completed_turns, 1);
    }
}

//! Microphone capture stream
//!
//! A [`FrameProvider`] yields native-format frames; [`CaptureStream`] polls
//! it on a fixed interval, runs each frame through the [`FrameCodec`] and
//! forwards wire-format chunks to the session.

use crate::codec::{AudioChunk, FrameCodec, RawAudioFrame};
use crate::error::Result;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Upper bound on frames drained per tick, so a backlog cannot starve the runtime.
const MAX_FRAMES_PER_TICK: usize = 16;

/// Result of polling a provider for audio
#[derive(Debug, Clone, PartialEq)]
pub enum FramePoll {
    Frame(RawAudioFrame),
    /// Nothing available yet
    Pending,
    /// The source is exhausted (e.g. end of a file)
    Ended,
}

/// Source of native capture frames.
///
/// `poll_frame` must not block for long; it is called from the async runtime.
pub trait FrameProvider: Send {
    /// Acquire the device. Called on every capture start, from the session
    /// task; implementations should return once the device is connected and
    /// leave reading to their own thread.
    fn open(&mut self) -> Result<()>;

    fn poll_frame(&mut self) -> Result<FramePoll>;

    /// Release the device. Must be safe to call when not open.
    fn close(&mut self);
}

/// Messages from a running capture stream
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureMessage {
    Chunk(AudioChunk),
    Failed(String),
    Ended,
}

/// A [`CaptureMessage`] tagged with the capture run that produced it.
///
/// Every `start` and `stop` moves the stream to a new generation, so a
/// receiver can drop messages still queued from a run that was stopped.
#[derive(Debug, Clone, PartialEq)]
pub struct Captured {
    pub generation: u64,
    pub message: CaptureMessage,
}

/// Drives a [`FrameProvider`] while listening is active.
pub struct CaptureStream {
    provider: Arc<Mutex<Box<dyn FrameProvider>>>,
    interval: Duration,
    output: UnboundedSender<Captured>,
    task: Option<JoinHandle<()>>,
    generation: u64,
}

impl CaptureStream {
    pub fn new(
        provider: Box<dyn FrameProvider>,
        interval: Duration,
        output: UnboundedSender<Captured>,
    ) -> Self {
        Self {
            provider: Arc::new(Mutex::new(provider)),
            interval,
            output,
            task: None,
            generation: 0,
        }
    }

    /// Generation of the current run; messages tagged otherwise are stale.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Open the provider and start forwarding chunks. No-op when running.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        // Release a provider whose task already ended
        self.stop();

        self.provider
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .open()?;
        self.generation += 1;
        info!("Capture started (run {})", self.generation);

        let provider = self.provider.clone();
        let output = self.output.clone();
        let interval = self.interval;
        let generation = self.generation;
        self.task = Some(tokio::spawn(run_capture(provider, interval, output, generation)));
        Ok(())
    }

    /// Stop forwarding and release the device. Safe when not running.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            self.generation += 1;
            self.provider
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .close();
            info!("Capture stopped");
        }
    }
}

impl Drop for CaptureStream {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_capture(
    provider: Arc<Mutex<Box<dyn FrameProvider>>>,
    interval: Duration,
    output: UnboundedSender<Captured>,
    generation: u64,
) {
    let send = |message: CaptureMessage| output.send(Captured { generation, message }).is_ok();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut codec: Option<FrameCodec> = None;

    loop {
        ticker.tick().await;

        let mut frames = Vec::new();
        let mut terminal = None;
        {
            let mut provider = provider.lock().unwrap_or_else(|e| e.into_inner());
            while frames.len() < MAX_FRAMES_PER_TICK {
                match provider.poll_frame() {
                    Ok(FramePoll::Frame(frame)) => frames.push(frame),
                    Ok(FramePoll::Pending) => break,
                    Ok(FramePoll::Ended) => {
                        terminal = Some(CaptureMessage::Ended);
                        break;
                    }
                    Err(e) => {
                        terminal = Some(CaptureMessage::Failed(e.to_string()));
                        break;
                    }
                }
            }
        }

        for frame in frames {
            if codec.is_none() {
                match FrameCodec::for_frame(&frame) {
                    Ok(c) => codec = Some(c),
                    Err(e) => {
                        send(CaptureMessage::Failed(e.to_string()));
                        return;
                    }
                }
            }
            let Some(codec) = codec.as_mut() else { continue };

            match codec.encode(&frame) {
                Ok(Some(chunk)) => {
                    if !send(CaptureMessage::Chunk(chunk)) {
                        debug!("Capture receiver gone");
                        return;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Capture encode failed: {}", e);
                    send(CaptureMessage::Failed(e.to_string()));
                    return;
                }
            }
        }

        if let Some(message) = terminal {
            debug!("Capture task finishing: {:?}", message);
            send(message);
            return;
        }
    }
}

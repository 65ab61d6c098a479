//! PulseAudio microphone and speaker
//!
//! Both use the blocking "simple" API. The microphone reads on its own OS
//! thread and hands frames over a std channel; the speaker is driven from
//! the playback thread directly.

use crate::capture::{FramePoll, FrameProvider};
use crate::codec::{AudioFormat, RawAudioFrame};
use crate::error::{Result, VoiceError};
use crate::playback::OutputDevice;
use anyhow::Context;
use libpulse_binding as pulse;
use libpulse_simple_binding as psimple;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

const APP_NAME: &str = "board-voice";

fn audio_error(e: anyhow::Error) -> VoiceError {
    VoiceError::Audio(format!("{:#}", e))
}

/// Default PulseAudio source, read at a fixed rate in fixed-size frames.
pub struct PulseMicrophone {
    sample_rate: u32,
    frame_duration: Duration,
    frames: Option<Receiver<std::result::Result<RawAudioFrame, String>>>,
    shutdown: Arc<AtomicBool>,
}

impl PulseMicrophone {
    pub fn new(sample_rate: u32, frame_duration: Duration) -> Self {
        Self {
            sample_rate,
            frame_duration,
            frames: None,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl FrameProvider for PulseMicrophone {
    fn open(&mut self) -> Result<()> {
        let spec = pulse::sample::Spec {
            format: pulse::sample::Format::S16le,
            channels: 1,
            rate: self.sample_rate,
        };

        let capture = psimple::Simple::new(
            None,
            APP_NAME,
            pulse::stream::Direction::Record,
            None,
            "microphone",
            &spec,
            None,
            None,
        )
        .context("Failed to create PulseAudio microphone connection")
        .map_err(audio_error)?;
        info!("Microphone capture connected at {} Hz", self.sample_rate);

        let samples_per_frame =
            (self.sample_rate as u64 * self.frame_duration.as_millis() as u64 / 1000).max(1) as usize;
        let (tx, rx) = mpsc::channel();
        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_shutdown = shutdown.clone();
        let sample_rate = self.sample_rate;

        std::thread::Builder::new()
            .name("pulse-capture".to_string())
            .spawn(move || {
                let mut bytes = vec![0u8; samples_per_frame * 2];
                while !thread_shutdown.load(Ordering::Relaxed) {
                    if let Err(e) = capture.read(&mut bytes).context("Failed to read audio") {
                        error!("Microphone read failed: {:#}", e);
                        let _ = tx.send(Err(format!("{:#}", e)));
                        break;
                    }
                    let samples = bytes
                        .chunks_exact(2)
                        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / i16::MAX as f32)
                        .collect();
                    let frame = RawAudioFrame {
                        samples,
                        sample_rate,
                        channels: 1,
                    };
                    if tx.send(Ok(frame)).is_err() {
                        break;
                    }
                }
                debug!("Microphone thread exiting");
            })
            .map_err(|e| VoiceError::Audio(format!("failed to spawn capture thread: {}", e)))?;

        self.frames = Some(rx);
        self.shutdown = shutdown;
        Ok(())
    }

    fn poll_frame(&mut self) -> Result<FramePoll> {
        let Some(frames) = self.frames.as_ref() else {
            return Err(VoiceError::Audio("microphone polled before open".to_string()));
        };
        match frames.try_recv() {
            Ok(Ok(frame)) => Ok(FramePoll::Frame(frame)),
            Ok(Err(message)) => Err(VoiceError::Audio(message)),
            Err(TryRecvError::Empty) => Ok(FramePoll::Pending),
            Err(TryRecvError::Disconnected) => {
                Err(VoiceError::Audio("microphone thread stopped".to_string()))
            }
        }
    }

    fn close(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        // Dropping the receiver also ends the thread after its current read
        self.frames = None;
    }
}

impl Drop for PulseMicrophone {
    fn drop(&mut self) {
        self.close();
    }
}

/// Default PulseAudio sink
#[derive(Default)]
pub struct PulseSpeaker {
    stream: Option<psimple::Simple>,
}

impl PulseSpeaker {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OutputDevice for PulseSpeaker {
    fn start(&mut self, format: AudioFormat) -> Result<()> {
        let spec = pulse::sample::Spec {
            format: pulse::sample::Format::S16le,
            channels: format.channels as u8,
            rate: format.sample_rate,
        };
        let stream = psimple::Simple::new(
            None,
            APP_NAME,
            pulse::stream::Direction::Playback,
            None,
            "assistant",
            &spec,
            None,
            None,
        )
        .context("Failed to create PulseAudio playback connection")
        .map_err(audio_error)?;
        info!("Speaker connected at {} Hz", format.sample_rate);
        self.stream = Some(stream);
        Ok(())
    }

    fn write(&mut self, samples: &[i16]) -> Result<()> {
        let Some(stream) = self.stream.as_ref() else {
            return Err(VoiceError::Audio("speaker written before start".to_string()));
        };
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        stream
            .write(&bytes)
            .context("Failed to write audio")
            .map_err(audio_error)
    }

    fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.flush() {
                debug!("Speaker flush failed: {}", e);
            }
        }
    }
}

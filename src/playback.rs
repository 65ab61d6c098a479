//! Assistant audio playback
//!
//! Chunks are queued without blocking and written to the output device by a
//! dedicated OS thread in arrival order. [`PlaybackScheduler::stop`] discards
//! everything queued and returns once the worker has halted the device.

use crate::codec::{pcm16_le_to_i16, AudioChunk, AudioFormat};
use crate::error::{Result, VoiceError};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

/// Samples written per device call (20ms at the wire rate). Stop requests
/// take effect between slices.
const SLICE_SAMPLES: usize = 480;

/// How long `stop` waits for the worker to acknowledge.
const STOP_TIMEOUT: Duration = Duration::from_millis(250);

/// A sink for PCM16 samples, driven from the playback thread.
pub trait OutputDevice: Send {
    /// Prepare the device for samples in `format`.
    fn start(&mut self, format: AudioFormat) -> Result<()>;

    /// Write samples; may block for roughly their playback duration.
    fn write(&mut self, samples: &[i16]) -> Result<()>;

    /// Discard anything buffered and release the device.
    fn stop(&mut self);
}

/// Discards all audio. Used when running headless.
#[derive(Debug, Default)]
pub struct NullOutput;

impl OutputDevice for NullOutput {
    fn start(&mut self, format: AudioFormat) -> Result<()> {
        debug!("Null output started at {} Hz", format.sample_rate);
        Ok(())
    }

    fn write(&mut self, _samples: &[i16]) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self) {}
}

#[derive(Default)]
struct PlaybackState {
    queue: VecDeque<AudioChunk>,
    /// Bumped by every stop request
    generation: u64,
    /// Last generation the worker has halted for
    halted: u64,
    playing: bool,
    shutdown: bool,
}

struct Shared {
    state: Mutex<PlaybackState>,
    signal: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PlaybackState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Plays queued assistant audio in order on a worker thread.
pub struct PlaybackScheduler {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl PlaybackScheduler {
    /// Spawn the playback thread. Device failures are reported on `errors`
    /// and do not stop the worker.
    pub fn new(device: Box<dyn OutputDevice>, errors: UnboundedSender<String>) -> Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(PlaybackState::default()),
            signal: Condvar::new(),
        });

        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name("playback".to_string())
            .spawn(move || run_worker(worker_shared, device, errors))
            .map_err(|e| VoiceError::Audio(format!("failed to spawn playback thread: {}", e)))?;

        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Queue a chunk behind everything already scheduled. Never blocks on
    /// the device.
    pub fn enqueue(&self, chunk: AudioChunk) {
        let mut state = self.shared.lock();
        if state.shutdown {
            return;
        }
        state.queue.push_back(chunk);
        self.shared.signal.notify_all();
    }

    /// Drop queued audio and halt the device. Returns once the worker has
    /// stopped writing, or after a short timeout if the device is wedged.
    ///
    /// Blocks the calling thread, normally for at most one slice (20ms) and
    /// never longer than `STOP_TIMEOUT`.
    pub fn stop(&self) {
        let mut state = self.shared.lock();
        let discarded = state.queue.len();
        state.queue.clear();
        state.generation += 1;
        let target = state.generation;
        self.shared.signal.notify_all();

        let deadline = Instant::now() + STOP_TIMEOUT;
        while state.halted < target && !state.shutdown {
            let now = Instant::now();
            if now >= deadline {
                warn!("Playback worker did not acknowledge stop in time");
                break;
            }
            state = match self.shared.signal.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(e) => e.into_inner().0,
            };
        }

        if discarded > 0 {
            debug!("Playback stopped, {} queued chunks discarded", discarded);
        }
    }

    /// Whether audio is being written or waiting to be written.
    pub fn is_playing(&self) -> bool {
        let state = self.shared.lock();
        state.playing || !state.queue.is_empty()
    }

    pub fn queued_chunks(&self) -> usize {
        self.shared.lock().queue.len()
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        {
            let mut state = self.shared.lock();
            state.shutdown = true;
            state.queue.clear();
            self.shared.signal.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Playback thread panicked");
            }
        }
    }
}

fn run_worker(shared: Arc<Shared>, mut device: Box<dyn OutputDevice>, errors: UnboundedSender<String>) {
    let mut active_format: Option<AudioFormat> = None;
    info!("Playback thread started");

    loop {
        let (chunk, generation) = {
            let mut state = shared.lock();
            loop {
                if state.shutdown {
                    state.playing = false;
                    drop(state);
                    if active_format.is_some() {
                        device.stop();
                    }
                    info!("Playback thread exiting");
                    return;
                }

                if state.halted < state.generation {
                    if active_format.take().is_some() {
                        device.stop();
                    }
                    state.halted = state.generation;
                    state.playing = false;
                    shared.signal.notify_all();
                    continue;
                }

                if let Some(chunk) = state.queue.pop_front() {
                    state.playing = true;
                    break (chunk, state.generation);
                }

                state.playing = false;
                state = shared.signal.wait(state).unwrap_or_else(|e| e.into_inner());
            }
        };

        if let Err(e) = play_chunk(&shared, device.as_mut(), &mut active_format, &chunk, generation) {
            error!("Playback of chunk {} failed: {}", chunk.sequence(), e);
            if active_format.take().is_some() {
                device.stop();
            }
            let _ = errors.send(format!("playback failed: {}", e));
        }
    }
}

fn play_chunk(
    shared: &Shared,
    device: &mut dyn OutputDevice,
    active_format: &mut Option<AudioFormat>,
    chunk: &AudioChunk,
    generation: u64,
) -> Result<()> {
    if *active_format != Some(chunk.format()) {
        if active_format.is_some() {
            device.stop();
        }
        device.start(chunk.format())?;
        *active_format = Some(chunk.format());
    }

    let samples = pcm16_le_to_i16(chunk.data());
    for slice in samples.chunks(SLICE_SAMPLES) {
        if shared.lock().generation != generation {
            debug!("Chunk {} interrupted", chunk.sequence());
            return Ok(());
        }
        device.write(slice)?;
    }
    Ok(())
}

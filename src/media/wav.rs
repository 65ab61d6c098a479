//! WAV file capture source
//!
//! Replays a WAV file as if it were a microphone, releasing one frame per
//! frame duration of wall-clock time.

use crate::capture::{FramePoll, FrameProvider};
use crate::codec::RawAudioFrame;
use crate::error::{Result, VoiceError};
use hound::{SampleFormat, WavReader};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Feeds a WAV file into a capture stream.
pub struct WavFileProvider {
    path: PathBuf,
    frame_duration: Duration,
    paced: bool,
    samples: Vec<f32>,
    sample_rate: u32,
    channels: u16,
    position: usize,
    started: Option<Instant>,
    emitted: u32,
}

impl WavFileProvider {
    pub fn new(path: impl Into<PathBuf>, frame_duration: Duration) -> Self {
        Self {
            path: path.into(),
            frame_duration,
            paced: true,
            samples: Vec::new(),
            sample_rate: 0,
            channels: 0,
            position: 0,
            started: None,
            emitted: 0,
        }
    }

    /// Emit frames as fast as they are polled instead of in real time.
    pub fn unpaced(mut self) -> Self {
        self.paced = false;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn frame_samples(&self) -> usize {
        let per_channel = (self.sample_rate as u64 * self.frame_duration.as_millis() as u64 / 1000).max(1);
        per_channel as usize * self.channels as usize
    }

    fn frame_due(&self) -> bool {
        if !self.paced {
            return true;
        }
        match self.started {
            Some(started) => started.elapsed() >= self.frame_duration * self.emitted,
            None => false,
        }
    }
}

/// Decode a WAV file into interleaved samples in `[-1.0, 1.0]`.
pub fn load_wav(path: &Path) -> Result<(Vec<f32>, u32, u16)> {
    let mut reader = WavReader::open(path)?;
    let spec = reader.spec();
    debug!("Loading {:?}: {:?}", path, spec);

    let samples = match (spec.sample_format, spec.bits_per_sample) {
        (SampleFormat::Float, 32) => reader
            .samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>()?,
        (SampleFormat::Int, bits @ 8..=32) => {
            let scale = (1i64 << (bits - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<Vec<_>, _>>()?
        }
        (format, bits) => {
            return Err(VoiceError::Audio(format!(
                "unsupported WAV format: {:?} {} bits",
                format, bits
            )))
        }
    };

    Ok((samples, spec.sample_rate, spec.channels))
}

impl FrameProvider for WavFileProvider {
    fn open(&mut self) -> Result<()> {
        let (samples, sample_rate, channels) = load_wav(&self.path)?;
        info!(
            "Replaying {:?} ({} Hz, {} channels, {:.1}s)",
            self.path,
            sample_rate,
            channels,
            samples.len() as f32 / (sample_rate.max(1) as f32 * channels.max(1) as f32)
        );
        self.samples = samples;
        self.sample_rate = sample_rate;
        self.channels = channels;
        self.position = 0;
        self.emitted = 0;
        self.started = Some(Instant::now());
        Ok(())
    }

    fn poll_frame(&mut self) -> Result<FramePoll> {
        if self.started.is_none() {
            return Err(VoiceError::Audio("WAV source polled before open".to_string()));
        }
        if self.position >= self.samples.len() {
            return Ok(FramePoll::Ended);
        }
        if !self.frame_due() {
            return Ok(FramePoll::Pending);
        }

        let end = (self.position + self.frame_samples()).min(self.samples.len());
        // Keep frames whole across channels
        let end = end - (end - self.position) % self.channels.max(1) as usize;
        if end == self.position {
            self.position = self.samples.len();
            return Ok(FramePoll::Ended);
        }

        let frame = RawAudioFrame {
            samples: self.samples[self.position..end].to_vec(),
            sample_rate: self.sample_rate,
            channels: self.channels,
        };
        self.position = end;
        self.emitted += 1;
        Ok(FramePoll::Frame(frame))
    }

    fn close(&mut self) {
        self.started = None;
        self.samples = Vec::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hound::{WavSpec, WavWriter};

    fn write_wav(path: &Path, sample_rate: u32, channels: u16, samples: &[i16]) {
        let spec = WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(path, spec).unwrap();
        for s in samples {
            writer.write_sample(*s).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_unpaced_frames_cover_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.wav");
        // 50ms of mono audio at 24 kHz
        write_wav(&path, 24_000, 1, &vec![16384; 1200]);

        let mut provider = WavFileProvider::new(&path, Duration::from_millis(20)).unpaced();
        provider.open().unwrap();

        let mut lengths = Vec::new();
        loop {
            match provider.poll_frame().unwrap() {
                FramePoll::Frame(frame) => {
                    assert_eq!(frame.sample_rate, 24_000);
                    assert!((frame.samples[0] - 0.5).abs() < 1e-6);
                    lengths.push(frame.samples.len());
                }
                FramePoll::Ended => break,
                FramePoll::Pending => panic!("unpaced provider should never be pending"),
            }
        }
        assert_eq!(lengths, vec![480, 480, 240]);
    }

    #[test]
    fn test_paced_provider_waits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.wav");
        write_wav(&path, 16_000, 2, &vec![0; 3200]);

        let mut provider = WavFileProvider::new(&path, Duration::from_secs(10));
        provider.open().unwrap();
        assert!(matches!(provider.poll_frame().unwrap(), FramePoll::Frame(_)));
        assert_eq!(provider.poll_frame().unwrap(), FramePoll::Pending);
    }

    #[test]
    fn test_missing_file_fails_open() {
        let mut provider = WavFileProvider::new("/definitely/not/here.wav", Duration::from_millis(20));
        assert!(matches!(provider.open(), Err(VoiceError::Wav(_))));
        assert!(provider.poll_frame().is_err());
    }
}

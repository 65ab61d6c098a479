//! Response recorder - saves each assistant audio turn as a WAV file

use crate::codec::{pcm16_le_to_i16, AudioChunk, AudioFormat};
use crate::error::Result;
use hound::{SampleFormat, WavSpec, WavWriter};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

struct OpenTurn {
    path: PathBuf,
    format: AudioFormat,
    writer: WavWriter<BufWriter<File>>,
    samples: usize,
}

/// Writes `<dir>/turn_NNN.wav` for every assistant response.
pub struct ResponseRecorder {
    base: PathBuf,
    next_turn: u32,
    current: Option<OpenTurn>,
    saved: Vec<PathBuf>,
}

impl ResponseRecorder {
    pub fn new(base: impl Into<PathBuf>) -> Result<Self> {
        let base = base.into();
        fs::create_dir_all(&base)?;
        info!("Recording responses to {:?}", base);
        Ok(Self {
            base,
            next_turn: 1,
            current: None,
            saved: Vec::new(),
        })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Files finalized so far, oldest first
    pub fn saved(&self) -> &[PathBuf] {
        &self.saved
    }

    /// Append a playback chunk to the current turn, opening a file if needed.
    pub fn on_chunk(&mut self, chunk: &AudioChunk) {
        if self.current.as_ref().is_some_and(|t| t.format != chunk.format()) {
            debug!("Audio format changed mid-turn, starting a new file");
            self.finish_turn();
        }

        if self.current.is_none() {
            match self.open_turn(chunk.format()) {
                Ok(turn) => self.current = Some(turn),
                Err(e) => {
                    error!("Failed to create recording: {}", e);
                    return;
                }
            }
        }

        let Some(turn) = self.current.as_mut() else { return };
        let samples = pcm16_le_to_i16(chunk.data());
        for sample in &samples {
            if let Err(e) = turn.writer.write_sample(*sample) {
                error!("Failed to write audio to {:?}: {}", turn.path, e);
                self.current = None;
                return;
            }
        }
        turn.samples += samples.len();
    }

    /// Finalize the current file. Returns its path if anything was recorded.
    pub fn finish_turn(&mut self) -> Option<PathBuf> {
        let turn = self.current.take()?;
        match turn.writer.finalize() {
            Ok(()) => {
                debug!("Saved {} samples to {:?}", turn.samples, turn.path);
                self.saved.push(turn.path.clone());
                Some(turn.path)
            }
            Err(e) => {
                error!("Failed to finalize {:?}: {}", turn.path, e);
                None
            }
        }
    }

    fn open_turn(&mut self, format: AudioFormat) -> Result<OpenTurn> {
        let path = self.base.join(format!("turn_{:03}.wav", self.next_turn));
        self.next_turn += 1;

        let spec = WavSpec {
            channels: format.channels,
            sample_rate: format.sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let writer = WavWriter::create(&path, spec)?;
        debug!("Recording turn to {:?}", path);

        Ok(OpenTurn {
            path,
            format,
            writer,
            samples: 0,
        })
    }
}

impl Drop for ResponseRecorder {
    fn drop(&mut self) {
        self.finish_turn();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hound::WavReader;

    fn chunk(samples: &[i16], sequence: u64) -> AudioChunk {
        let bytes = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        AudioChunk::new(bytes, AudioFormat::WIRE, sequence)
    }

    #[test]
    fn test_one_file_per_turn() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = ResponseRecorder::new(dir.path().join("out")).unwrap();

        recorder.on_chunk(&chunk(&[1, 2, 3], 0));
        recorder.on_chunk(&chunk(&[4], 1));
        let first = recorder.finish_turn().unwrap();

        recorder.on_chunk(&chunk(&[-5, -6], 2));
        let second = recorder.finish_turn().unwrap();

        assert_eq!(first.file_name().unwrap(), "turn_001.wav");
        assert_eq!(second.file_name().unwrap(), "turn_002.wav");
        assert_eq!(recorder.saved(), &[first.clone(), second.clone()]);

        let mut reader = WavReader::open(&first).unwrap();
        assert_eq!(reader.spec().sample_rate, 24_000);
        assert_eq!(reader.spec().channels, 1);
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![1, 2, 3, 4]);

        let samples: Vec<i16> = WavReader::open(&second)
            .unwrap()
            .samples::<i16>()
            .map(|s| s.unwrap())
            .collect();
        assert_eq!(samples, vec![-5, -6]);
    }

    #[test]
    fn test_finish_without_audio() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = ResponseRecorder::new(dir.path()).unwrap();
        assert_eq!(recorder.finish_turn(), None);
        assert!(recorder.saved().is_empty());
    }

    #[test]
    fn test_drop_finalizes_open_turn() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut recorder = ResponseRecorder::new(dir.path()).unwrap();
            recorder.on_chunk(&chunk(&[9, 9], 0));
        }
        let reader = WavReader::open(dir.path().join("turn_001.wav")).unwrap();
        assert_eq!(reader.len(), 2);
    }
}

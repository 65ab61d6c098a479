//! Audio frame codec
//!
//! Converts device-native capture frames (interleaved `f32`, any rate and
//! channel count) into the wire format the realtime service expects:
//! 24 kHz, mono, 16-bit little-endian PCM. Also holds the PCM16/base64
//! helpers used on the receive path.

use crate::error::{Result, VoiceError};
use base64::engine::general_purpose;
use base64::Engine;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use std::time::Duration;
use tracing::debug;

/// Sample rate of every chunk on the wire, in both directions.
pub const WIRE_SAMPLE_RATE: u32 = 24_000;

/// Sample rate, channel count and bit depth of a PCM buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl AudioFormat {
    /// PCM16 mono at [`WIRE_SAMPLE_RATE`]
    pub const WIRE: AudioFormat = AudioFormat {
        sample_rate: WIRE_SAMPLE_RATE,
        channels: 1,
        bits_per_sample: 16,
    };

    pub fn bytes_per_second(&self) -> u64 {
        self.sample_rate as u64 * self.channels as u64 * (self.bits_per_sample as u64 / 8)
    }

    /// Playback duration of `len` bytes in this format.
    pub fn duration_of(&self, len: usize) -> Duration {
        let bps = self.bytes_per_second();
        if bps == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(len as u64 * 1_000_000 / bps)
    }
}

/// One frame as delivered by the capture device, before conversion.
#[derive(Debug, Clone, PartialEq)]
pub struct RawAudioFrame {
    /// Interleaved samples in `[-1.0, 1.0]`
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl RawAudioFrame {
    /// Number of sample frames (samples per channel).
    pub fn frame_len(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels as usize
        }
    }
}

/// Immutable, sequenced buffer of encoded audio.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    data: Vec<u8>,
    format: AudioFormat,
    sequence: u64,
}

impl AudioChunk {
    pub fn new(data: Vec<u8>, format: AudioFormat, sequence: u64) -> Self {
        Self {
            data,
            format,
            sequence,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn duration(&self) -> Duration {
        self.format.duration_of(self.data.len())
    }
}

/// Hands out monotonically increasing sequence numbers.
#[derive(Debug, Default)]
pub struct ChunkSequencer {
    next: u64,
}

impl ChunkSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chunk(&mut self, data: Vec<u8>, format: AudioFormat) -> AudioChunk {
        let sequence = self.next;
        self.next += 1;
        AudioChunk::new(data, format, sequence)
    }
}

/// Converts native capture frames into wire-format chunks.
///
/// When the native rate differs from [`WIRE_SAMPLE_RATE`] a cubic
/// resampler runs over fixed input blocks of one native frame; at most one
/// frame of input is carried between calls.
pub struct FrameCodec {
    native_rate: u32,
    native_channels: u16,
    resampler: Option<FastFixedIn<f32>>,
    chunk_in: usize,
    in_buf: Vec<f32>,
    sequencer: ChunkSequencer,
}

impl FrameCodec {
    /// Create a codec for frames of `frame_len` samples per channel.
    pub fn new(native_rate: u32, native_channels: u16, frame_len: usize) -> Result<Self> {
        if native_rate == 0 || native_channels == 0 {
            return Err(VoiceError::Audio(format!(
                "unsupported capture format: {} Hz, {} channels",
                native_rate, native_channels
            )));
        }

        let chunk_in = frame_len.max(1);
        let resampler = if native_rate != WIRE_SAMPLE_RATE {
            let ratio = WIRE_SAMPLE_RATE as f64 / native_rate as f64;
            let resampler = FastFixedIn::<f32>::new(ratio, 1.0, PolynomialDegree::Cubic, chunk_in, 1)
                .map_err(|e| VoiceError::Audio(format!("failed to create resampler: {}", e)))?;
            Some(resampler)
        } else {
            None
        };

        debug!(
            "Frame codec: {} Hz x{} -> {} Hz mono ({} frames per block)",
            native_rate, native_channels, WIRE_SAMPLE_RATE, chunk_in
        );

        Ok(Self {
            native_rate,
            native_channels,
            resampler,
            chunk_in,
            in_buf: Vec::with_capacity(chunk_in),
            sequencer: ChunkSequencer::new(),
        })
    }

    /// Build a codec sized for the given frame.
    pub fn for_frame(frame: &RawAudioFrame) -> Result<Self> {
        Self::new(frame.sample_rate, frame.channels, frame.frame_len())
    }

    /// Convert one native frame. Returns `None` when the resampler is still
    /// filling its first block.
    pub fn encode(&mut self, frame: &RawAudioFrame) -> Result<Option<AudioChunk>> {
        if frame.sample_rate != self.native_rate || frame.channels != self.native_channels {
            return Err(VoiceError::Audio(format!(
                "capture format changed mid-stream: {} Hz x{} (expected {} Hz x{})",
                frame.sample_rate, frame.channels, self.native_rate, self.native_channels
            )));
        }

        let mono = downmix(&frame.samples, frame.channels);

        let wire = match self.resampler.as_mut() {
            None => mono,
            Some(resampler) => {
                let mut out = Vec::with_capacity(mono.len());
                let mut src = &mono[..];
                while !src.is_empty() {
                    let take = (self.chunk_in - self.in_buf.len()).min(src.len());
                    self.in_buf.extend_from_slice(&src[..take]);
                    src = &src[take..];

                    if self.in_buf.len() == self.chunk_in {
                        let processed = resampler
                            .process(&[&self.in_buf[..]], None)
                            .map_err(|e| VoiceError::Audio(format!("resampling failed: {}", e)))?;
                        out.extend_from_slice(&processed[0]);
                        self.in_buf.clear();
                    }
                }
                out
            }
        };

        if wire.is_empty() {
            return Ok(None);
        }

        Ok(Some(self.sequencer.chunk(f32_to_pcm16_le(&wire), AudioFormat::WIRE)))
    }
}

/// Average interleaved channels down to mono.
pub fn downmix(samples: &[f32], channels: u16) -> Vec<f32> {
    match channels {
        0 => Vec::new(),
        1 => samples.to_vec(),
        n => samples
            .chunks_exact(n as usize)
            .map(|frame| frame.iter().sum::<f32>() / n as f32)
            .collect(),
    }
}

/// Clamp to `[-1.0, 1.0]` and quantize to little-endian PCM16.
pub fn f32_to_pcm16_le(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&s| {
            let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16;
            v.to_le_bytes()
        })
        .collect()
}

/// Interpret little-endian PCM16 bytes as samples. A trailing odd byte is ignored.
pub fn pcm16_le_to_i16(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

pub fn encode_base64(bytes: &[u8]) -> String {
    general_purpose::STANDARD.encode(bytes)
}

/// Decode a base64 PCM16 payload, rejecting buffers that are not whole samples.
pub fn decode_pcm16_base64(payload: &str) -> Result<Vec<u8>> {
    let bytes = general_purpose::STANDARD.decode(payload)?;
    if bytes.len() % 2 != 0 {
        return Err(VoiceError::Protocol(format!(
            "audio payload has odd length {}",
            bytes.len()
        )));
    }
    Ok(bytes)
}

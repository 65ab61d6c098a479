//! Concrete audio sources and sinks

pub mod wav;

#[cfg(feature = "pulse")]
pub mod pulse;

pub use wav::WavFileProvider;

#[cfg(feature = "pulse")]
pub use pulse::{PulseMicrophone, PulseSpeaker};

//! Realtime voice sessions against a duplex speech-to-speech API
//!
//! The crate is split the same way the runtime is: a pure [`session`] state
//! machine, the [`runner`] task that executes its actions, and the I/O
//! pieces it drives ([`transport`], [`capture`], [`playback`]).

pub mod capture;
pub mod codec;
pub mod config;
pub mod credentials;
pub mod error;
pub mod media;
pub mod playback;
pub mod protocol;
pub mod recorder;
pub mod runner;
pub mod session;
pub mod stats;
pub mod transport;
pub mod ws_transport;

pub use config::RealtimeConfig;
pub use error::{Result, VoiceError};
pub use runner::{Collaborators, VoiceSession};
pub use session::{ConnectionState, SessionEvent, SessionSnapshot};

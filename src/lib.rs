//! Realtime voice tutoring over the Gemini Live API
//!
//! Microphone audio is streamed to the model as 16-bit PCM while the model's
//! synthesized speech is scheduled back to back on the speaker, so playback
//! stays gapless under network jitter.

#![forbid(unsafe_code)]

pub mod audio;
pub mod config;
pub mod error;
pub mod frame;
pub mod live;
pub mod protocol;
pub mod recorder;
pub mod scheduler;
pub mod session;
pub mod streamer;

#[cfg(test)]
pub(crate) mod testing;

pub use config::SessionConfig;
pub use error::{LiveError, Result};
pub use live::{LiveEvent, LiveSession, SessionState};

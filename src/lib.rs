//! Per-guild audio broadcast engine.
//!
//! Each guild gets a queue and a playback state machine driven by its own
//! worker task; all guilds share one size-bounded cache of transcoded audio.

pub mod audio;
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod sources;
pub mod storage;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{EngineError, Result};

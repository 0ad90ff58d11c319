//! Error types for the synthesizer host.
//!
//! Decode-time problems never cross the audio thread boundary as panics;
//! they are reported through these types and logged. Only construction
//! (engines, workers, SoundFonts, configuration) returns errors to callers.

use std::path::PathBuf;
use thiserror::Error;

/// Failures that can occur while building or configuring the host.
#[derive(Debug, Error)]
pub enum SynthError {
    /// A SoundFont file could not be opened.
    #[error("failed to open SoundFont {path}: {source}")]
    SoundFontIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A SoundFont file was read but could not be parsed.
    #[error("failed to load SoundFont {path}: {reason}")]
    SoundFontLoad { path: PathBuf, reason: String },

    /// The engine back end refused to create a stream.
    #[error("failed to create synthesis engine: {0}")]
    EngineCreate(String),

    /// A worker thread could not be spawned.
    #[error("failed to spawn {name} thread: {source}")]
    ThreadSpawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// The configuration is not usable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Outcome of a SysEx message that was not applied.
///
/// None of these are fatal; the message is dropped and processing continues
/// with the next queued event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SysExError {
    /// The buffer is not a well-formed `F0 .. F7` message.
    #[error("invalid sysex buffer: {0}")]
    InvalidBuffer(&'static str),

    /// The Roland checksum did not match the address and data bytes.
    #[error("sysex checksum mismatch: expected {expected:#04x}, found {found:#04x}")]
    Checksum { expected: u8, found: u8 },

    /// Unknown manufacturer, model or sub-command.
    #[error("sysex message not supported")]
    NotSupported,
}

impl SysExError {
    /// True when the message was rejected as an invalid buffer, either
    /// because of its framing or because its checksum failed.
    pub fn is_invalid_buffer(&self) -> bool {
        matches!(self, SysExError::InvalidBuffer(_) | SysExError::Checksum { .. })
    }
}

/// Errors raised while building cooked stream buffers.
#[derive(Debug, Error)]
pub enum StreamError {
    /// File could not be read.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The Standard MIDI File could not be parsed.
    #[error("MIDI parse error: {0}")]
    Parse(String),

    /// The cooked byte stream is truncated or inconsistent.
    #[error("malformed stream buffer at byte {offset}: {reason}")]
    Malformed { offset: usize, reason: &'static str },
}

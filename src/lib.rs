//! synthhost - the real-time core of a software MIDI synthesizer host.
//!
//! This library accepts live MIDI events and cooked MIDI streams, decodes
//! them (including Roland GS SysEx), limits note density per instance and
//! renders audio on a pool of worker threads ahead of the audio sink.

pub mod audio;
pub mod config;
pub mod error;
pub mod host;
pub mod midi;
pub mod player;
pub mod render;
pub mod synth;

// Re-export commonly used types
pub use config::HostConfig;
pub use error::{StreamError, SynthError, SysExError};
pub use host::SynthHost;
pub use midi::ResetKind;
pub use player::{StreamBuffer, StreamEvent, StreamListener, StreamPosition};
pub use render::AudioReader;

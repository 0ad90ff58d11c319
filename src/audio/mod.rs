//! Audio sinks for the host's rendered output.
//!
//! - [`output`] plays through the default device with rodio
//! - [`export`] records to a WAV file with hound

pub mod export;
pub mod output;

pub use export::record_to_wav;
pub use output::AudioOutput;

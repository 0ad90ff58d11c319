//! Synthesis back ends.
//!
//! The pipeline only talks to engines through [`SynthEngine`] and creates
//! them through an [`EngineFactory`], so a back end can be swapped by
//! configuration without touching routing or rendering code.

pub mod instance;
pub mod rusty;
#[cfg(test)]
pub(crate) mod testing;

use crate::config::{EngineKind, HostConfig};
use crate::error::SynthError;
use crate::midi::{ParamChange, ResetKind};
use std::path::PathBuf;
use std::sync::Arc;

pub use instance::SynthInstance;
pub use rusty::{RustyEngine, RustyFactory};

/// Something queued for an engine, in arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    /// A complete short event (status byte present).
    Short(u32),
    /// A decoded SysEx parameter.
    Param(ParamChange),
    Reset(ResetKind),
}

/// One synthesis stream.
pub trait SynthEngine: Send {
    /// Applies a packed short event.
    fn send_event(&mut self, event: u32);

    /// Applies a decoded parameter. Returns `false` if the engine has no
    /// equivalent for it.
    fn send_param(&mut self, _change: &ParamChange) -> bool {
        false
    }

    /// Commits events sent since the last flush.
    fn flush(&mut self) {}

    /// Renders interleaved samples into `out`, returning how many were
    /// written.
    fn read_samples(&mut self, out: &mut [f32]) -> usize;

    /// Voices currently sounding.
    fn active_voice_count(&self) -> u32;

    /// Replaces the engine's SoundFonts, highest priority first.
    fn set_soundfonts(&mut self, soundfonts: &[PathBuf]) -> Result<(), SynthError>;

    /// Silences the engine and restores controllers for the given mode.
    fn reset(&mut self, kind: ResetKind);
}

/// Creates engine streams for one back end.
pub trait EngineFactory: Send + Sync {
    /// Short back-end name for logs.
    fn name(&self) -> &'static str;

    /// Creates a stream producing `audio_channels` interleaved channels.
    fn create(&self, audio_channels: u16) -> Result<Box<dyn SynthEngine>, SynthError>;
}

/// Builds the factory selected by `config.engine`.
pub fn factory_for(config: &HostConfig) -> Result<Arc<dyn EngineFactory>, SynthError> {
    match config.engine {
        EngineKind::RustySynth => Ok(Arc::new(RustyFactory::new(
            config.sample_rate,
            &config.soundfonts,
        )?)),
    }
}

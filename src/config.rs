//! Host configuration.
//!
//! The configuration is a plain serde struct so it can be kept next to the
//! host binary as pretty-printed JSON. Every field has a default, so a
//! partial file (or `{}`) is valid.

use crate::error::SynthError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Number of MIDI channels handled by the host.
pub const MIDI_CHANNELS: usize = 16;

/// Which synthesis back end renders the instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// SoundFont rendering through rustysynth.
    #[default]
    RustySynth,
}

/// Settings for one host session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Output sample rate in Hz.
    pub sample_rate: u32,

    /// Interleaved output channels (2 = stereo).
    pub audio_channels: u16,

    /// Key slices per MIDI channel. 0 selects a single engine instance that
    /// receives every channel; n > 0 creates 16 * n instances.
    pub key_slices: usize,

    /// Render worker threads. 0 means one per available core, capped at the
    /// instance count.
    pub render_threads: usize,

    /// Notes-per-second ceiling per instance. `None` disables limiting.
    pub max_nps: Option<u64>,

    /// How far ahead of the audio callback the buffered renderer works.
    pub render_ahead_ms: u32,

    /// Slots in each short event ring.
    pub event_buffer_capacity: usize,

    /// Bytes in each long (SysEx) event ring.
    pub long_buffer_capacity: usize,

    /// Longest SysEx message accepted, terminator included.
    pub max_sysex_len: usize,

    /// SoundFonts handed to every engine, highest priority first.
    pub soundfonts: Vec<PathBuf>,

    /// Back end used to create instances.
    pub engine: EngineKind,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            audio_channels: 2,
            key_slices: 1,
            render_threads: 0,
            max_nps: Some(10_000_000),
            render_ahead_ms: 10,
            event_buffer_capacity: 32768,
            long_buffer_capacity: 65536,
            max_sysex_len: 1024,
            soundfonts: Vec::new(),
            engine: EngineKind::RustySynth,
        }
    }
}

impl HostConfig {
    /// Number of engine instances this configuration creates.
    pub fn instance_count(&self) -> usize {
        if self.key_slices == 0 {
            1
        } else {
            MIDI_CHANNELS * self.key_slices
        }
    }

    /// Number of render workers, resolving 0 to the machine's parallelism.
    pub fn worker_count(&self) -> usize {
        let requested = if self.render_threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            self.render_threads
        };
        requested.clamp(1, self.instance_count())
    }

    /// Samples per channel rendered in one buffered-renderer chunk.
    pub fn render_chunk_frames(&self) -> usize {
        ((self.sample_rate as u64 * self.render_ahead_ms as u64) / 1000).max(16) as usize
    }

    /// Checks that the configuration can drive a host.
    pub fn validate(&self) -> Result<(), SynthError> {
        if self.sample_rate == 0 {
            return Err(SynthError::InvalidConfig("sample_rate must be > 0".into()));
        }
        if self.audio_channels == 0 {
            return Err(SynthError::InvalidConfig(
                "audio_channels must be > 0".into(),
            ));
        }
        if self.key_slices > 128 {
            return Err(SynthError::InvalidConfig(format!(
                "key_slices must be at most 128, got {}",
                self.key_slices
            )));
        }
        if self.event_buffer_capacity < 2 || self.long_buffer_capacity < 2 {
            return Err(SynthError::InvalidConfig(
                "ring buffers need at least 2 slots".into(),
            ));
        }
        if self.max_sysex_len < 4 {
            return Err(SynthError::InvalidConfig(
                "max_sysex_len must allow at least 4 bytes".into(),
            ));
        }
        Ok(())
    }

    /// Loads a configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns error if file reading or parsing fails
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let json = fs::read_to_string(path)?;
        serde_json::from_str(&json)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Saves the configuration to a JSON file.
    ///
    /// # Errors
    ///
    /// Returns error if serialization or file writing fails
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        fs::write(path, json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = HostConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.instance_count(), 16);
        assert!(config.worker_count() >= 1);
        assert!(config.worker_count() <= 16);
    }

    #[test]
    fn test_single_instance_layout() {
        let config = HostConfig {
            key_slices: 0,
            render_threads: 8,
            ..Default::default()
        };
        assert_eq!(config.instance_count(), 1);
        assert_eq!(config.worker_count(), 1);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: HostConfig = serde_json::from_str(r#"{ "key_slices": 4 }"#).unwrap();
        assert_eq!(config.key_slices, 4);
        assert_eq!(config.sample_rate, 44100);
        assert_eq!(config.instance_count(), 64);
        assert_eq!(config.engine, EngineKind::RustySynth);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let config = HostConfig {
            sample_rate: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = HostConfig {
            key_slices: 200,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host.json");

        let config = HostConfig {
            max_nps: None,
            soundfonts: vec![PathBuf::from("a.sf2")],
            ..Default::default()
        };
        config.save(&path).unwrap();

        let loaded = HostConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }
}

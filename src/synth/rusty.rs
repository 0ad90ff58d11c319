//! rustysynth back end.
//!
//! Wraps a [`rustysynth::Synthesizer`] behind [`SynthEngine`]. SoundFonts are
//! loaded once by the factory and shared between every stream it creates.

use super::{EngineFactory, SynthEngine};
use crate::error::SynthError;
use crate::midi::{unpack_short, ParamChange, ParamScope, ResetKind, SynthParam};
use rustysynth::{SoundFont, Synthesizer, SynthesizerSettings};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// rustysynth's power-on master volume.
const DEFAULT_MASTER_VOLUME: f32 = 0.5;

/// Loads the first SoundFont in `paths` that parses.
///
/// rustysynth renders from a single SoundFont, so lower-priority entries
/// are only used as fallbacks.
fn load_soundfont(paths: &[PathBuf]) -> Result<Arc<SoundFont>, SynthError> {
    let mut last_error = None;
    for path in paths {
        match open_soundfont(path) {
            Ok(soundfont) => {
                if paths.len() > 1 {
                    tracing::warn!(
                        "only one SoundFont is rendered; using {}",
                        path.display()
                    );
                }
                return Ok(soundfont);
            }
            Err(e) => {
                tracing::warn!("{}", e);
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| SynthError::InvalidConfig("no SoundFont configured".into())))
}

fn open_soundfont(path: &Path) -> Result<Arc<SoundFont>, SynthError> {
    let mut file = BufReader::new(File::open(path).map_err(|source| SynthError::SoundFontIo {
        path: path.to_path_buf(),
        source,
    })?);
    let soundfont = SoundFont::new(&mut file).map_err(|e| SynthError::SoundFontLoad {
        path: path.to_path_buf(),
        reason: format!("{:?}", e),
    })?;
    Ok(Arc::new(soundfont))
}

fn new_synthesizer(soundfont: &Arc<SoundFont>, sample_rate: u32) -> Result<Synthesizer, SynthError> {
    let settings = SynthesizerSettings::new(sample_rate as i32);
    Synthesizer::new(soundfont, &settings)
        .map_err(|e| SynthError::EngineCreate(format!("{:?}", e)))
}

/// Creates [`RustyEngine`] streams sharing one SoundFont.
pub struct RustyFactory {
    sample_rate: u32,
    soundfont: Arc<SoundFont>,
}

impl RustyFactory {
    /// Loads the SoundFont list once for every stream.
    ///
    /// # Errors
    ///
    /// Returns error if none of the SoundFonts can be opened and parsed.
    pub fn new(sample_rate: u32, soundfonts: &[PathBuf]) -> Result<Self, SynthError> {
        let soundfont = load_soundfont(soundfonts)?;
        Ok(Self {
            sample_rate,
            soundfont,
        })
    }
}

impl EngineFactory for RustyFactory {
    fn name(&self) -> &'static str {
        "rustysynth"
    }

    fn create(&self, audio_channels: u16) -> Result<Box<dyn SynthEngine>, SynthError> {
        let synth = new_synthesizer(&self.soundfont, self.sample_rate)?;
        Ok(Box::new(RustyEngine::new(synth, self.sample_rate, audio_channels)))
    }
}

/// A rustysynth stream.
///
/// rustysynth does not expose its voice list, so the reported voice count is
/// the number of keys currently held across all channels.
pub struct RustyEngine {
    synth: Synthesizer,
    sample_rate: u32,
    audio_channels: u16,
    left: Vec<f32>,
    right: Vec<f32>,
    /// One bit per key, per channel.
    held: [u128; 16],
}

impl RustyEngine {
    pub fn new(synth: Synthesizer, sample_rate: u32, audio_channels: u16) -> Self {
        Self {
            synth,
            sample_rate,
            audio_channels: audio_channels.max(1),
            left: Vec::new(),
            right: Vec::new(),
            held: [0; 16],
        }
    }

    fn control_change(&mut self, channel: u8, controller: u8, value: u8) {
        self.synth
            .process_midi_message(channel as i32, 0xB0, controller as i32, value as i32);
    }
}

impl SynthEngine for RustyEngine {
    fn send_event(&mut self, event: u32) {
        let (status, data1, data2) = unpack_short(event);
        if status >= 0xF0 {
            if status == 0xFF {
                self.reset(ResetKind::Default);
            }
            return;
        }
        let channel = (status & 0x0F) as usize;
        let key = (data1 & 0x7F) as u32;
        match status & 0xF0 {
            0x90 if data2 > 0 => self.held[channel] |= 1u128 << key,
            0x80 | 0x90 => self.held[channel] &= !(1u128 << key),
            // all sound off / all notes off
            0xB0 if data1 == 120 || data1 == 123 => self.held[channel] = 0,
            _ => {}
        }
        self.synth.process_midi_message(
            channel as i32,
            (status & 0xF0) as i32,
            data1 as i32,
            data2 as i32,
        );
    }

    fn send_param(&mut self, change: &ParamChange) -> bool {
        match (change.scope, change.param) {
            (ParamScope::Global, SynthParam::MasterVolume(volume)) => {
                self.synth
                    .set_master_volume(DEFAULT_MASTER_VOLUME * volume as f32 / 127.0);
                true
            }
            (ParamScope::Channel(channel), param) => match param {
                SynthParam::PartLevel(value) => {
                    self.control_change(channel, 7, value);
                    true
                }
                SynthParam::PartPan(value) => {
                    self.control_change(channel, 10, value);
                    true
                }
                SynthParam::ReverbSend(value) => {
                    self.control_change(channel, 91, value);
                    true
                }
                SynthParam::ChorusSend(value) => {
                    self.control_change(channel, 93, value);
                    true
                }
                SynthParam::ToneNumber { bank, program } => {
                    self.control_change(channel, 0, bank);
                    self.synth
                        .process_midi_message(channel as i32, 0xC0, program as i32, 0);
                    true
                }
                SynthParam::PitchKeyShift(semitones) => {
                    // RPN 0002 coarse tuning, then null RPN
                    let value = (64 + semitones as i16).clamp(0, 127) as u8;
                    self.control_change(channel, 101, 0);
                    self.control_change(channel, 100, 2);
                    self.control_change(channel, 6, value);
                    self.control_change(channel, 101, 127);
                    self.control_change(channel, 100, 127);
                    true
                }
                _ => false,
            },
            _ => false,
        }
    }

    fn read_samples(&mut self, out: &mut [f32]) -> usize {
        let channels = self.audio_channels as usize;
        let frames = out.len() / channels;
        if self.left.len() < frames {
            self.left.resize(frames, 0.0);
            self.right.resize(frames, 0.0);
        }
        self.synth
            .render(&mut self.left[..frames], &mut self.right[..frames]);

        for (i, frame) in out.chunks_exact_mut(channels).enumerate() {
            match frame {
                [mono] => *mono = (self.left[i] + self.right[i]) * 0.5,
                [left, right, rest @ ..] => {
                    *left = self.left[i];
                    *right = self.right[i];
                    rest.fill(0.0);
                }
                [] => {}
            }
        }
        frames * channels
    }

    fn active_voice_count(&self) -> u32 {
        self.held.iter().map(|keys| keys.count_ones()).sum()
    }

    fn set_soundfonts(&mut self, soundfonts: &[PathBuf]) -> Result<(), SynthError> {
        let soundfont = load_soundfont(soundfonts)?;
        self.synth = new_synthesizer(&soundfont, self.sample_rate)?;
        self.held = [0; 16];
        Ok(())
    }

    fn reset(&mut self, kind: ResetKind) {
        tracing::debug!("rustysynth reset ({:?})", kind);
        self.synth.reset();
        self.synth.set_master_volume(DEFAULT_MASTER_VOLUME);
        self.held = [0; 16];
    }
}

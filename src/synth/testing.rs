//! An engine that records what it receives, for pipeline tests.

use super::{EngineEvent, EngineFactory, SynthEngine};
use crate::error::SynthError;
use crate::midi::{unpack_short, ParamChange, ResetKind};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Shared view of one [`RecordingEngine`].
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<EngineEvent>>>,
    renders: Arc<AtomicUsize>,
    soundfonts: Arc<Mutex<Vec<PathBuf>>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn renders(&self) -> usize {
        self.renders.load(Ordering::SeqCst)
    }

    pub fn soundfonts(&self) -> Vec<PathBuf> {
        self.soundfonts.lock().unwrap().clone()
    }

    pub fn note_ons(&self) -> usize {
        self.count(|status, velocity| status & 0xF0 == 0x90 && velocity > 0)
    }

    pub fn note_offs(&self) -> usize {
        self.count(|status, velocity| {
            status & 0xF0 == 0x80 || (status & 0xF0 == 0x90 && velocity == 0)
        })
    }

    fn count(&self, matches: impl Fn(u8, u8) -> bool) -> usize {
        self.events()
            .iter()
            .filter(|event| match event {
                EngineEvent::Short(word) => {
                    let (status, _, velocity) = unpack_short(*word);
                    matches(status, velocity)
                }
                _ => false,
            })
            .count()
    }
}

pub struct RecordingEngine {
    recorder: Recorder,
    level: f32,
    short_reads: Option<usize>,
    held: u32,
}

impl SynthEngine for RecordingEngine {
    fn send_event(&mut self, event: u32) {
        let (status, _, velocity) = unpack_short(event);
        match status & 0xF0 {
            0x90 if velocity > 0 => self.held += 1,
            0x80 | 0x90 => self.held = self.held.saturating_sub(1),
            _ => {}
        }
        self.recorder
            .events
            .lock()
            .unwrap()
            .push(EngineEvent::Short(event));
    }

    fn send_param(&mut self, change: &ParamChange) -> bool {
        self.recorder
            .events
            .lock()
            .unwrap()
            .push(EngineEvent::Param(*change));
        true
    }

    fn read_samples(&mut self, out: &mut [f32]) -> usize {
        self.recorder.renders.fetch_add(1, Ordering::SeqCst);
        let written = self.short_reads.unwrap_or(out.len()).min(out.len());
        out[..written].fill(self.level);
        written
    }

    fn active_voice_count(&self) -> u32 {
        self.held
    }

    fn set_soundfonts(&mut self, soundfonts: &[PathBuf]) -> Result<(), SynthError> {
        *self.recorder.soundfonts.lock().unwrap() = soundfonts.to_vec();
        Ok(())
    }

    fn reset(&mut self, kind: ResetKind) {
        self.held = 0;
        self.recorder
            .events
            .lock()
            .unwrap()
            .push(EngineEvent::Reset(kind));
    }
}

/// Hands out [`RecordingEngine`]s and keeps a [`Recorder`] for each.
pub struct RecordingFactory {
    level: f32,
    short_reads: Option<usize>,
    recorders: Mutex<Vec<Recorder>>,
}

impl RecordingFactory {
    /// Engines render a constant `level` on every sample.
    pub fn new(level: f32) -> Self {
        Self {
            level,
            short_reads: None,
            recorders: Mutex::new(Vec::new()),
        }
    }

    /// Engines write at most `samples` per read.
    pub fn with_short_reads(mut self, samples: usize) -> Self {
        self.short_reads = Some(samples);
        self
    }

    /// Recorders in creation order.
    pub fn recorders(&self) -> Vec<Recorder> {
        self.recorders.lock().unwrap().clone()
    }
}

impl EngineFactory for RecordingFactory {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn create(&self, _audio_channels: u16) -> Result<Box<dyn SynthEngine>, SynthError> {
        let recorder = Recorder::default();
        self.recorders.lock().unwrap().push(recorder.clone());
        Ok(Box::new(RecordingEngine {
            recorder,
            level: self.level,
            short_reads: self.short_reads,
            held: 0,
        }))
    }
}

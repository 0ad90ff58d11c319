//! One engine stream plus the buffers around it.

use super::{EngineEvent, EngineFactory, SynthEngine};
use crate::error::SynthError;
use crate::midi::{ParamChange, ResetKind};
use crate::render::Renderer;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

/// Owns an engine stream, the micro-buffer of events waiting for it, and
/// the output of its most recent render.
///
/// The event thread appends to the micro-buffer; whichever thread renders
/// the instance drains it into the engine right before reading samples, so
/// events reach the engine in arrival order.
pub struct SynthInstance {
    index: usize,
    pending: Mutex<Vec<EngineEvent>>,
    engine: Mutex<Box<dyn SynthEngine>>,
    output: Mutex<Vec<f32>>,
    voices: AtomicU32,
}

impl SynthInstance {
    /// Creates the engine stream for instance `index`.
    pub fn start(
        index: usize,
        factory: &dyn EngineFactory,
        audio_channels: u16,
    ) -> Result<Self, SynthError> {
        let engine = factory.create(audio_channels)?;
        tracing::debug!("started {} instance {}", factory.name(), index);
        Ok(Self::with_engine(index, engine))
    }

    pub fn with_engine(index: usize, engine: Box<dyn SynthEngine>) -> Self {
        Self {
            index,
            pending: Mutex::new(Vec::with_capacity(256)),
            engine: Mutex::new(engine),
            output: Mutex::new(Vec::new()),
            voices: AtomicU32::new(0),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Queues a short event.
    pub fn send_event(&self, event: u32) {
        self.push(EngineEvent::Short(event));
    }

    /// Queues a decoded parameter.
    pub fn send_param(&self, change: ParamChange) {
        self.push(EngineEvent::Param(change));
    }

    /// Queues a reset behind everything already pending.
    pub fn reset_stream(&self, kind: ResetKind) {
        self.push(EngineEvent::Reset(kind));
    }

    fn push(&self, event: EngineEvent) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    /// Moves pending events into the engine.
    fn flush_events(&self, engine: &mut dyn SynthEngine) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        for event in pending.drain(..) {
            match event {
                EngineEvent::Short(word) => engine.send_event(word),
                EngineEvent::Param(change) => {
                    if !engine.send_param(&change) {
                        tracing::trace!("instance {} ignored {:?}", self.index, change);
                    }
                }
                EngineEvent::Reset(kind) => engine.reset(kind),
            }
        }
        drop(pending);
        engine.flush();
    }

    /// Renders `len` interleaved samples into this instance's own output
    /// buffer and returns the active voice count.
    pub fn render(&self, len: usize) -> u32 {
        let mut output = self.output.lock().unwrap_or_else(PoisonError::into_inner);
        output.resize(len, 0.0);
        self.render_into(&mut output)
    }

    /// Renders straight into `out`, zero-filling anything the engine left
    /// unwritten.
    pub fn render_into(&self, out: &mut [f32]) -> u32 {
        let mut engine = self.engine.lock().unwrap_or_else(PoisonError::into_inner);
        self.flush_events(engine.as_mut());
        let written = engine.read_samples(out).min(out.len());
        out[written..].fill(0.0);
        let voices = engine.active_voice_count();
        self.voices.store(voices, Ordering::Relaxed);
        voices
    }

    /// Adds the last rendered output onto `out`.
    pub fn mix_into(&self, out: &mut [f32]) {
        let output = self.output.lock().unwrap_or_else(PoisonError::into_inner);
        for (dest, sample) in out.iter_mut().zip(output.iter()) {
            *dest += *sample;
        }
    }

    /// Swaps the engine's SoundFonts, waiting for any render in progress.
    pub fn set_soundfonts(&self, soundfonts: &[PathBuf]) -> Result<(), SynthError> {
        self.engine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .set_soundfonts(soundfonts)
    }

    /// Voice count as of the last render.
    pub fn active_voice_count(&self) -> u32 {
        self.voices.load(Ordering::Relaxed)
    }

    /// Events waiting for the next render.
    pub fn pending_len(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// A lone instance renders directly, without the worker pool.
impl Renderer for SynthInstance {
    fn render(&self, out: &mut [f32]) -> usize {
        self.render_into(out);
        out.len()
    }

    fn active_voice_count(&self) -> u32 {
        SynthInstance::active_voice_count(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi::SynthParam;
    use crate::synth::testing::RecordingFactory;

    #[test]
    fn test_events_reach_engine_in_order_on_render() {
        let factory = RecordingFactory::new(0.5);
        let instance = SynthInstance::start(0, &factory, 2).unwrap();
        instance.send_event(0x00643C90);
        instance.send_param(ParamChange::global(SynthParam::MasterVolume(100)));
        instance.reset_stream(ResetKind::Gs);
        instance.send_event(0x00003C80);

        let recorder = &factory.recorders()[0];
        assert!(recorder.events().is_empty());
        assert_eq!(instance.pending_len(), 4);

        instance.render(64);
        assert_eq!(instance.pending_len(), 0);
        assert_eq!(
            recorder.events(),
            vec![
                EngineEvent::Short(0x00643C90),
                EngineEvent::Param(ParamChange::global(SynthParam::MasterVolume(100))),
                EngineEvent::Reset(ResetKind::Gs),
                EngineEvent::Short(0x00003C80),
            ]
        );
    }

    #[test]
    fn test_mix_adds_output() {
        let factory = RecordingFactory::new(0.25);
        let instance = SynthInstance::start(0, &factory, 2).unwrap();
        instance.render(8);

        let mut out = vec![1.0f32; 8];
        instance.mix_into(&mut out);
        assert!(out.iter().all(|s| (*s - 1.25).abs() < f32::EPSILON));
    }

    #[test]
    fn test_short_engine_output_is_zero_filled() {
        let factory = RecordingFactory::new(0.5).with_short_reads(4);
        let instance = SynthInstance::start(0, &factory, 2).unwrap();
        let mut out = vec![9.0f32; 10];
        instance.render_into(&mut out);
        assert_eq!(&out[..4], &[0.5; 4]);
        assert_eq!(&out[4..], &[0.0; 6]);
    }
}

//! Audio playback through rodio.

use crate::render::AudioReader;
use anyhow::{Context, Result};
use rodio::{OutputStream, OutputStreamHandle, Source};
use std::time::Duration;

/// Frames pulled from the reader per refill.
/// Smaller = lower latency but more wakeups.
const PULL_FRAMES: usize = 256;

/// Audio source that drains a host's [`AudioReader`].
struct ReaderSource {
    reader: AudioReader,
    buffer: Vec<f32>,
    /// Current position in the buffer.
    pos: usize,
    channels: u16,
    sample_rate: u32,
}

impl ReaderSource {
    fn new(reader: AudioReader, sample_rate: u32, channels: u16) -> Self {
        let len = PULL_FRAMES * channels as usize;
        Self {
            reader,
            buffer: vec![0.0; len],
            pos: len, // start at end to trigger first read
            channels,
            sample_rate,
        }
    }
}

impl Iterator for ReaderSource {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        if self.pos >= self.buffer.len() {
            // under-runs come back as silence
            self.reader.read(&mut self.buffer);
            self.pos = 0;
        }
        let sample = self.buffer[self.pos];
        self.pos += 1;
        Some(sample)
    }
}

impl Source for ReaderSource {
    fn current_frame_len(&self) -> Option<usize> {
        None // Continuous stream
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn total_duration(&self) -> Option<Duration> {
        None // Infinite stream
    }
}

/// An open output device playing a host's audio.
pub struct AudioOutput {
    /// Audio output stream (must be kept alive).
    _stream: OutputStream,
    _stream_handle: OutputStreamHandle,
}

impl AudioOutput {
    /// Opens the default output device and starts pulling from `reader`.
    ///
    /// # Errors
    ///
    /// Returns error if no output device can be opened
    pub fn start(reader: AudioReader, sample_rate: u32, channels: u16) -> Result<Self> {
        let (stream, stream_handle) =
            OutputStream::try_default().context("Failed to open audio output")?;
        stream_handle
            .play_raw(ReaderSource::new(reader, sample_rate, channels))
            .context("Failed to start audio playback")?;
        tracing::info!("audio output: {} Hz, {} channels", sample_rate, channels);
        Ok(Self {
            _stream: stream,
            _stream_handle: stream_handle,
        })
    }
}

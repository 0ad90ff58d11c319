//! Recording a host's output to a WAV file.

use crate::render::AudioReader;
use anyhow::{Context, Result};
use hound::{SampleFormat, WavSpec, WavWriter};
use std::path::Path;
use std::time::{Duration, Instant};

/// Frames pulled per write.
const RECORD_FRAMES: usize = 1024;

/// Records from `reader` into a 16-bit WAV file until `keep_going` returns
/// false. Reads are paced to wall time, since the host renders in real
/// time. Returns the number of frames written.
///
/// # Errors
///
/// Returns error if the file cannot be created or written
pub fn record_to_wav<P, F>(
    reader: &mut AudioReader,
    sample_rate: u32,
    channels: u16,
    output_path: P,
    mut keep_going: F,
) -> Result<u64>
where
    P: AsRef<Path>,
    F: FnMut() -> bool,
{
    let spec = WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(output_path.as_ref(), spec).with_context(|| {
        format!(
            "Failed to create output WAV file: {}",
            output_path.as_ref().display()
        )
    })?;

    let mut buffer = vec![0.0f32; RECORD_FRAMES * channels as usize];
    let block = Duration::from_secs_f64(RECORD_FRAMES as f64 / sample_rate as f64);
    let mut deadline = Instant::now();
    let mut frames = 0u64;

    while keep_going() {
        deadline += block;
        let now = Instant::now();
        if deadline > now {
            std::thread::sleep(deadline - now);
        }

        let filled = reader.read(&mut buffer);
        if filled < buffer.len() {
            tracing::trace!("recorder under-run: {} of {} samples", filled, buffer.len());
        }
        // Convert f32 (-1.0 to 1.0) to i16
        for sample in &buffer {
            writer.write_sample((sample * 32767.0).clamp(-32768.0, 32767.0) as i16)?;
        }
        frames += RECORD_FRAMES as u64;
    }

    writer.finalize().context("Failed to finalize WAV file")?;
    tracing::info!(
        "wrote {} frames to {}",
        frames,
        output_path.as_ref().display()
    );
    Ok(frames)
}

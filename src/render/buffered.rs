//! Render-ahead thread between the render path and the audio sink.
//!
//! A background thread renders fixed-size chunks slightly ahead of demand
//! and queues them on a bounded channel. The sink pulls through an
//! [`AudioReader`], which never blocks: when nothing is queued it hands out
//! silence.

use crate::error::SynthError;
use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Render-time samples kept for the running average.
const LOAD_HISTORY: usize = 100;

/// Chunks the channel holds before the render thread waits.
const QUEUE_CHUNKS: usize = 16;

/// Rendering statistics shared between the render thread and readers.
#[derive(Debug, Default)]
pub struct RendererStats {
    average_load: AtomicU32,
    last_load: AtomicU32,
    buffered: AtomicUsize,
    last_request: AtomicUsize,
}

impl RendererStats {
    /// Mean of render time over chunk period across recent chunks.
    pub fn average_load(&self) -> f32 {
        f32::from_bits(self.average_load.load(Ordering::Relaxed))
    }

    /// Render time over chunk period for the latest chunk.
    pub fn last_load(&self) -> f32 {
        f32::from_bits(self.last_load.load(Ordering::Relaxed))
    }

    /// Rendered samples not yet handed to a reader.
    pub fn buffered_samples(&self) -> usize {
        self.buffered.load(Ordering::Relaxed)
    }

    fn record(&self, history: &VecDeque<f32>, last: f32) {
        let average = history.iter().sum::<f32>() / history.len().max(1) as f32;
        self.average_load.store(average.to_bits(), Ordering::Relaxed);
        self.last_load.store(last.to_bits(), Ordering::Relaxed);
    }
}

pub struct BufferedRenderer {
    stats: Arc<RendererStats>,
    stop: Arc<AtomicBool>,
    reader: Option<AudioReader>,
    handle: Option<JoinHandle<()>>,
}

impl BufferedRenderer {
    /// Starts the render thread. `render` fills one chunk of
    /// `chunk_frames * channels` interleaved samples per call.
    pub fn start<F>(
        mut render: F,
        sample_rate: u32,
        channels: u16,
        chunk_frames: usize,
    ) -> Result<Self, SynthError>
    where
        F: FnMut(&mut [f32]) + Send + 'static,
    {
        if sample_rate == 0 || channels == 0 || chunk_frames == 0 {
            return Err(SynthError::InvalidConfig(
                "buffered renderer needs a non-zero rate, channel count and chunk".into(),
            ));
        }
        let chunk_len = chunk_frames * channels as usize;
        let period = Duration::from_secs_f64(chunk_frames as f64 / sample_rate as f64);

        let stats = Arc::new(RendererStats::default());
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = bounded(QUEUE_CHUNKS);

        let thread_stats = Arc::clone(&stats);
        let thread_stop = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("render-ahead".into())
            .spawn(move || {
                let mut history = VecDeque::with_capacity(LOAD_HISTORY);
                while !thread_stop.load(Ordering::Relaxed) {
                    let wanted = thread_stats
                        .last_request
                        .load(Ordering::Relaxed)
                        .max(chunk_len);
                    if thread_stats.buffered_samples() * 10 > wanted * 11 {
                        std::thread::sleep(period / 4);
                        continue;
                    }

                    let started = Instant::now();
                    let mut chunk = vec![0.0f32; chunk_len];
                    render(&mut chunk);
                    let load = started.elapsed().as_secs_f32() / period.as_secs_f32();
                    if history.len() == LOAD_HISTORY {
                        history.pop_front();
                    }
                    history.push_back(load);
                    thread_stats.record(&history, load);

                    thread_stats.buffered.fetch_add(chunk_len, Ordering::Relaxed);
                    if !send_chunk(&tx, chunk, period, &thread_stop) {
                        thread_stats.buffered.fetch_sub(chunk_len, Ordering::Relaxed);
                        break;
                    }

                    let next = started + period.mul_f32(0.9);
                    let now = Instant::now();
                    if next > now {
                        std::thread::sleep(next - now);
                    }
                }
                tracing::debug!("render-ahead thread stopped");
            })
            .map_err(|source| SynthError::ThreadSpawn {
                name: "render-ahead".into(),
                source,
            })?;

        tracing::info!(
            "render-ahead: {} frames per chunk, {:.1} ms period",
            chunk_frames,
            period.as_secs_f64() * 1000.0
        );
        Ok(Self {
            reader: Some(AudioReader {
                chunks: rx,
                remainder: Vec::new(),
                stats: Arc::clone(&stats),
            }),
            stats,
            stop,
            handle: Some(handle),
        })
    }

    /// Hands out the reading end. There is only one.
    pub fn take_reader(&mut self) -> Option<AudioReader> {
        self.reader.take()
    }

    pub fn stats(&self) -> Arc<RendererStats> {
        Arc::clone(&self.stats)
    }
}

// Returns false once the renderer is stopping or the reader is gone.
fn send_chunk(tx: &Sender<Vec<f32>>, mut chunk: Vec<f32>, period: Duration, stop: &AtomicBool) -> bool {
    loop {
        match tx.send_timeout(chunk, period) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(back)) => {
                if stop.load(Ordering::Relaxed) {
                    return false;
                }
                chunk = back;
            }
            Err(SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}

impl Drop for BufferedRenderer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("render-ahead thread panicked");
            }
        }
    }
}

/// Pull side used by the audio sink.
pub struct AudioReader {
    chunks: Receiver<Vec<f32>>,
    remainder: Vec<f32>,
    stats: Arc<RendererStats>,
}

impl AudioReader {
    /// Fills `dest` from rendered audio and returns how many samples were
    /// real; the rest of `dest` is silence.
    pub fn read(&mut self, dest: &mut [f32]) -> usize {
        dest.fill(0.0);
        self.stats.last_request.store(dest.len(), Ordering::Relaxed);

        let mut filled = self.take_remainder(dest);
        while filled < dest.len() {
            let Ok(chunk) = self.chunks.try_recv() else {
                break;
            };
            let count = chunk.len().min(dest.len() - filled);
            dest[filled..filled + count].copy_from_slice(&chunk[..count]);
            filled += count;
            if count < chunk.len() {
                self.remainder = chunk;
                self.remainder.drain(..count);
            }
        }
        self.stats.buffered.fetch_sub(filled, Ordering::Relaxed);
        filled
    }

    fn take_remainder(&mut self, dest: &mut [f32]) -> usize {
        let count = self.remainder.len().min(dest.len());
        dest[..count].copy_from_slice(&self.remainder[..count]);
        self.remainder.drain(..count);
        count
    }

    pub fn stats(&self) -> Arc<RendererStats> {
        Arc::clone(&self.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counting_renderer() -> BufferedRenderer {
        let mut next = 0.0f32;
        BufferedRenderer::start(
            move |chunk: &mut [f32]| {
                for sample in chunk.iter_mut() {
                    *sample = next;
                    next += 1.0;
                }
            },
            44100,
            2,
            64,
        )
        .unwrap()
    }

    fn wait_for(stats: &RendererStats, samples: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while stats.buffered_samples() < samples {
            assert!(Instant::now() < deadline, "renderer never filled");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_reads_are_contiguous_across_chunks() {
        let mut renderer = counting_renderer();
        let stats = renderer.stats();
        let mut reader = renderer.take_reader().unwrap();
        assert!(renderer.take_reader().is_none());

        let mut expected = 0.0f32;
        for size in [100usize, 37, 128, 140] {
            wait_for(&stats, size);
            let mut dest = vec![-1.0f32; size];
            assert_eq!(reader.read(&mut dest), size);
            for sample in &dest {
                assert_eq!(*sample, expected);
                expected += 1.0;
            }
        }
    }

    #[test]
    fn test_underrun_is_silence() {
        let mut renderer = counting_renderer();
        let mut reader = renderer.take_reader().unwrap();
        drop(renderer);

        // whatever was queued before the stop, the tail is silent
        let mut dest = vec![5.0f32; 10_000];
        let filled = reader.read(&mut dest);
        assert!(filled < dest.len());
        assert!(dest[filled..].iter().all(|s| *s == 0.0));
    }

    #[test]
    fn test_render_ahead_is_bounded() {
        let renderer = counting_renderer();
        let stats = renderer.stats();
        wait_for(&stats, 128);
        std::thread::sleep(Duration::from_millis(50));
        // with no reads the queue stops growing after one extra chunk
        assert!(stats.buffered_samples() <= 256);
        assert!(stats.last_load() >= 0.0);
        assert!(stats.average_load() >= 0.0);
    }

    #[test]
    fn test_zero_chunk_is_rejected() {
        assert!(BufferedRenderer::start(|_: &mut [f32]| {}, 44100, 2, 0).is_err());
    }
}

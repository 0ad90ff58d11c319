//! Renders a set of instances on a fixed pool of worker threads.
//!
//! Each call to [`RenderManager::render`] is one fork-join round: the caller
//! publishes the block length, wakes every worker, waits until all of them
//! report done, then sums the per-instance buffers into the output. Worker
//! `t` of `M` always renders instances `t`, `t + M`, `t + 2M`, ...

use super::Renderer;
use crate::error::SynthError;
use crate::synth::SynthInstance;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

/// State guarded by the pool mutex.
struct RoundState {
    /// Set by the dispatcher, cleared by the worker once it is finished.
    working: Vec<bool>,
    /// Samples to render this round.
    sample_count: usize,
    /// Workers that have not finished the current round.
    active: usize,
    exit: bool,
}

struct Shared {
    state: Mutex<RoundState>,
    /// Signalled when a round starts or the pool shuts down.
    work: Condvar,
    /// Signalled when the last worker finishes a round.
    done: Condvar,
    voices: Vec<AtomicU32>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, RoundState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct RenderManager {
    instances: Vec<Arc<SynthInstance>>,
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    /// Serializes render calls.
    render_lock: Mutex<()>,
}

impl RenderManager {
    /// Spawns `threads` workers (clamped to `1..=instances.len()`).
    pub fn new(instances: Vec<Arc<SynthInstance>>, threads: usize) -> Result<Self, SynthError> {
        let threads = threads.clamp(1, instances.len().max(1));
        let shared = Arc::new(Shared {
            state: Mutex::new(RoundState {
                working: vec![false; threads],
                sample_count: 0,
                active: 0,
                exit: false,
            }),
            work: Condvar::new(),
            done: Condvar::new(),
            voices: (0..threads).map(|_| AtomicU32::new(0)).collect(),
        });

        let mut manager = Self {
            instances,
            shared,
            workers: Vec::with_capacity(threads),
            render_lock: Mutex::new(()),
        };
        for thread in 0..threads {
            let assigned: Vec<Arc<SynthInstance>> = manager
                .instances
                .iter()
                .skip(thread)
                .step_by(threads)
                .cloned()
                .collect();
            let shared = Arc::clone(&manager.shared);
            let name = format!("render-{}", thread);
            // on failure, dropping `manager` shuts down the workers already running
            let handle = std::thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker_loop(thread, assigned, shared))
                .map_err(|source| SynthError::ThreadSpawn { name, source })?;
            manager.workers.push(handle);
        }

        tracing::info!(
            "render pool: {} instances on {} threads",
            manager.instances.len(),
            threads
        );
        Ok(manager)
    }

    pub fn thread_count(&self) -> usize {
        self.workers.len()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    fn run_round(&self, sample_count: usize) {
        let mut state = self.shared.lock();
        state.sample_count = sample_count;
        state.active = state.working.len();
        state.working.iter_mut().for_each(|w| *w = true);
        self.shared.work.notify_all();
        while state.active > 0 {
            state = self
                .shared
                .done
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

fn worker_loop(thread: usize, assigned: Vec<Arc<SynthInstance>>, shared: Arc<Shared>) {
    loop {
        let sample_count = {
            let mut state = shared.lock();
            while !state.working[thread] && !state.exit {
                state = shared
                    .work
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            if state.exit {
                return;
            }
            state.sample_count
        };

        let voices: u32 = assigned
            .iter()
            .map(|instance| instance.render(sample_count))
            .sum();
        shared.voices[thread].store(voices, Ordering::Relaxed);

        let mut state = shared.lock();
        state.working[thread] = false;
        state.active -= 1;
        if state.active == 0 {
            shared.done.notify_all();
        }
    }
}

impl Renderer for RenderManager {
    fn render(&self, out: &mut [f32]) -> usize {
        let _round = self.render_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.run_round(out.len());
        out.fill(0.0);
        for instance in &self.instances {
            instance.mix_into(out);
        }
        out.len()
    }

    fn active_voice_count(&self) -> u32 {
        self.shared
            .voices
            .iter()
            .map(|v| v.load(Ordering::Relaxed))
            .sum()
    }
}

impl Drop for RenderManager {
    fn drop(&mut self) {
        {
            let mut state = self.shared.lock();
            state.exit = true;
            state.working.iter_mut().for_each(|w| *w = true);
            self.shared.work.notify_all();
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!("render worker panicked during shutdown");
                std::process::abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synth::testing::RecordingFactory;

    fn instances(factory: &RecordingFactory, count: usize) -> Vec<Arc<SynthInstance>> {
        (0..count)
            .map(|i| Arc::new(SynthInstance::start(i, factory, 2).unwrap()))
            .collect()
    }

    #[test]
    fn test_every_instance_renders_once_per_round() {
        for count in 1..=6 {
            for threads in 1..=count {
                let factory = RecordingFactory::new(0.0);
                let manager = RenderManager::new(instances(&factory, count), threads).unwrap();
                assert_eq!(manager.thread_count(), threads);

                let mut out = vec![1.0f32; 32];
                for round in 1..=3 {
                    assert_eq!(manager.render(&mut out), 32);
                    for recorder in factory.recorders() {
                        assert_eq!(recorder.renders(), round, "{} on {}", count, threads);
                    }
                }
            }
        }
    }

    #[test]
    fn test_output_is_sum_of_instances() {
        let factory = RecordingFactory::new(0.125);
        let manager = RenderManager::new(instances(&factory, 5), 2).unwrap();
        let mut out = vec![7.0f32; 64];
        manager.render(&mut out);
        assert!(out.iter().all(|s| (*s - 0.625).abs() < 1e-6));
    }

    #[test]
    fn test_thread_count_is_clamped() {
        let factory = RecordingFactory::new(0.0);
        let manager = RenderManager::new(instances(&factory, 3), 16).unwrap();
        assert_eq!(manager.thread_count(), 3);
        let manager = RenderManager::new(instances(&factory, 3), 0).unwrap();
        assert_eq!(manager.thread_count(), 1);
    }

    #[test]
    fn test_voice_counts_are_summed() {
        let factory = RecordingFactory::new(0.0);
        let all = instances(&factory, 4);
        all[0].send_event(0x00643C90);
        all[3].send_event(0x00643E90);
        all[3].send_event(0x00644090);
        let manager = RenderManager::new(all, 2).unwrap();
        manager.render(&mut [0.0f32; 16]);
        assert_eq!(manager.active_voice_count(), 3);
    }

    #[test]
    fn test_concurrent_callers_are_serialized() {
        let factory = RecordingFactory::new(0.5);
        let manager = Arc::new(RenderManager::new(instances(&factory, 4), 4).unwrap());
        let callers: Vec<_> = (0..4)
            .map(|_| {
                let manager = Arc::clone(&manager);
                std::thread::spawn(move || {
                    let mut out = vec![0.0f32; 128];
                    for _ in 0..25 {
                        manager.render(&mut out);
                        assert!(out.iter().all(|s| (*s - 2.0).abs() < 1e-6));
                    }
                })
            })
            .collect();
        for caller in callers {
            caller.join().unwrap();
        }
        for recorder in factory.recorders() {
            assert_eq!(recorder.renders(), 100);
        }
    }
}

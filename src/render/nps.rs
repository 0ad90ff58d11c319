//! Notes-per-second limiting.
//!
//! Every instance has a [`ChannelNpsLimiter`] that decides whether a Note On
//! is forwarded, based on its velocity and the instance's recent note rate.
//! Limiters read time from a shared [`RoughClock`], which a single
//! [`ClockTimer`] thread advances, so the hot path never queries the OS
//! clock.

use crate::error::SynthError;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Width of one counting window.
pub const WINDOW_MS: u64 = 1;

/// Windows in the rolling one-second total.
pub const WINDOW_COUNT: usize = (1000 / WINDOW_MS) as usize;

/// The current window's count is scaled up to a per-second rate and then by
/// this ratio, which makes bursts limit harder than steady streams.
const SHORT_WINDOW_NUMERATOR: u64 = 4;
const SHORT_WINDOW_DENOMINATOR: u64 = 3;

/// The clock thread ticks once per window.
const CLOCK_TICK: Duration = Duration::from_millis(WINDOW_MS);

/// A millisecond counter shared between limiters.
#[derive(Debug, Clone, Default)]
pub struct RoughClock {
    millis: Arc<AtomicU64>,
}

impl RoughClock {
    /// A clock that only moves when [`RoughClock::advance`] is called.
    pub fn manual() -> Self {
        Self::default()
    }

    pub fn now_ms(&self) -> u64 {
        self.millis.load(Ordering::Relaxed)
    }

    pub fn advance(&self, millis: u64) {
        self.millis.fetch_add(millis, Ordering::Relaxed);
    }

    fn set(&self, millis: u64) {
        self.millis.store(millis, Ordering::Relaxed);
    }
}

/// Thread that keeps a [`RoughClock`] in step with wall time.
pub struct ClockTimer {
    clock: RoughClock,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ClockTimer {
    pub fn start() -> Result<Self, SynthError> {
        let clock = RoughClock::default();
        let stop = Arc::new(AtomicBool::new(false));

        let thread_clock = clock.clone();
        let thread_stop = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("nps-clock".into())
            .spawn(move || {
                let origin = Instant::now();
                while !thread_stop.load(Ordering::Relaxed) {
                    std::thread::sleep(CLOCK_TICK);
                    thread_clock.set(origin.elapsed().as_millis() as u64);
                }
            })
            .map_err(|source| SynthError::ThreadSpawn {
                name: "nps-clock".into(),
                source,
            })?;

        Ok(Self {
            clock,
            stop,
            handle: Some(handle),
        })
    }

    pub fn clock(&self) -> RoughClock {
        self.clock.clone()
    }
}

impl Drop for ClockTimer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Per-instance note density governor.
///
/// Keeps note-on/note-off pairing intact: a Note Off for a key whose Note On
/// was dropped is dropped too.
pub struct ChannelNpsLimiter {
    clock: RoughClock,
    max_nps: u64,
    /// Note counts of the last second, indexed by window number modulo
    /// the window count.
    windows: Box<[u32; WINDOW_COUNT]>,
    window_index: u64,
    /// Sum of `windows`.
    total: u64,
    missed: [u32; 128],
}

impl ChannelNpsLimiter {
    pub fn new(clock: RoughClock, max_nps: u64) -> Self {
        let window_index = clock.now_ms() / WINDOW_MS;
        Self {
            clock,
            max_nps,
            windows: Box::new([0; WINDOW_COUNT]),
            window_index,
            total: 0,
            missed: [0; 128],
        }
    }

    fn advance(&mut self) {
        let now = self.clock.now_ms() / WINDOW_MS;
        if now <= self.window_index {
            return;
        }
        if now - self.window_index >= WINDOW_COUNT as u64 {
            self.windows.fill(0);
            self.total = 0;
        } else {
            for index in self.window_index + 1..=now {
                let slot = &mut self.windows[Self::slot(index)];
                self.total -= *slot as u64;
                *slot = 0;
            }
        }
        self.window_index = now;
    }

    fn slot(window_index: u64) -> usize {
        (window_index % WINDOW_COUNT as u64) as usize
    }

    fn current(&self) -> u64 {
        self.windows[Self::slot(self.window_index)] as u64
    }

    /// The larger of the scaled short-window rate and the one-second total.
    pub fn current_nps(&mut self) -> u64 {
        self.advance();
        let short = self.current() * (1000 / WINDOW_MS) * SHORT_WINDOW_NUMERATOR
            / SHORT_WINDOW_DENOMINATOR;
        short.max(self.total)
    }

    /// Returns `true` if the Note On should be forwarded.
    pub fn note_on(&mut self, key: u8, velocity: u8) -> bool {
        let nps = self.current_nps();
        let allowance = (velocity as u64).saturating_mul(self.max_nps) / 127;
        if allowance > nps {
            let slot = &mut self.windows[Self::slot(self.window_index)];
            *slot = slot.saturating_add(1);
            self.total += 1;
            true
        } else {
            let missed = &mut self.missed[(key & 0x7F) as usize];
            *missed = missed.saturating_add(1);
            false
        }
    }

    /// Returns `true` if the Note Off should be forwarded.
    pub fn note_off(&mut self, key: u8) -> bool {
        let missed = &mut self.missed[(key & 0x7F) as usize];
        if *missed > 0 {
            *missed -= 1;
            false
        } else {
            true
        }
    }

    /// Forgets every dropped note.
    pub fn reset(&mut self) {
        self.missed = [0; 128];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quiet_instance_forwards() {
        let clock = RoughClock::manual();
        let mut limiter = ChannelNpsLimiter::new(clock, 1000);
        assert!(limiter.note_on(60, 127));
        assert!(limiter.note_off(60));
    }

    #[test]
    fn test_burst_is_limited_and_pairs_are_kept() {
        let clock = RoughClock::manual();
        let mut limiter = ChannelNpsLimiter::new(clock, 100_000);

        // 75 notes in one window read as 75 * 1000 * 4/3 = 100000 nps
        let accepted = (0..100).filter(|_| limiter.note_on(60, 127)).count();
        assert_eq!(accepted, 75);

        let forwarded_offs = (0..100).filter(|_| limiter.note_off(60)).count();
        assert_eq!(forwarded_offs, accepted);
    }

    #[test]
    fn test_soft_notes_are_dropped_first() {
        let clock = RoughClock::manual();
        let mut limiter = ChannelNpsLimiter::new(clock, 100_000);
        for _ in 0..3 {
            assert!(limiter.note_on(40, 127));
        }
        // 3 * 1000 * 4/3 = 4000 nps; velocity 4 allows 3149
        assert!(!limiter.note_on(41, 4));
        assert!(limiter.note_on(42, 127));
    }

    #[test]
    fn test_windows_expire_over_time() {
        let clock = RoughClock::manual();
        let mut limiter = ChannelNpsLimiter::new(clock.clone(), 100_000);
        while limiter.note_on(60, 127) {}
        assert!(!limiter.note_on(60, 127));

        // the burst falls out of the short window, but still counts
        // towards the rolling second
        clock.advance(WINDOW_MS);
        assert_eq!(limiter.current_nps(), 75);

        clock.advance(1000);
        assert_eq!(limiter.current_nps(), 0);
        assert!(limiter.note_on(60, 127));
    }

    #[test]
    fn test_rolling_total_drops_oldest_window() {
        let clock = RoughClock::manual();
        let mut limiter = ChannelNpsLimiter::new(clock.clone(), 1_000_000);
        for _ in 0..5 {
            assert!(limiter.note_on(1, 127));
        }
        for _ in 0..WINDOW_COUNT - 1 {
            clock.advance(WINDOW_MS);
            assert!(limiter.note_on(2, 127));
        }
        // 5 + 999 notes inside the last second
        assert_eq!(limiter.total, 1004);
        clock.advance(WINDOW_MS);
        assert_eq!(limiter.current_nps(), 999);
    }

    #[test]
    fn test_pairing_holds_for_any_interleaving() {
        let clock = RoughClock::manual();
        let mut limiter = ChannelNpsLimiter::new(clock.clone(), 2000);
        let mut held = [0u32; 128];
        let mut accepted_ons = 0usize;
        let mut forwarded_offs = 0usize;

        let mut seed = 0x2545_F491u32;
        let mut next = || {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            seed
        };

        for _ in 0..20_000 {
            let roll = next();
            let key = (roll % 8) as u8;
            if roll & 0x100 != 0 {
                let velocity = ((roll >> 9) % 127) as u8 + 1;
                held[key as usize] += 1;
                if limiter.note_on(key, velocity) {
                    accepted_ons += 1;
                }
            } else if held[key as usize] > 0 {
                held[key as usize] -= 1;
                if limiter.note_off(key) {
                    forwarded_offs += 1;
                }
            }
            if roll & 0x7000 == 0 {
                clock.advance(3);
            }
        }
        for (key, count) in held.iter().enumerate() {
            for _ in 0..*count {
                if limiter.note_off(key as u8) {
                    forwarded_offs += 1;
                }
            }
        }
        assert_eq!(accepted_ons, forwarded_offs);
    }

    #[test]
    fn test_reset_clears_missed_notes() {
        let clock = RoughClock::manual();
        let mut limiter = ChannelNpsLimiter::new(clock, 1);
        assert!(!limiter.note_on(70, 64));
        limiter.reset();
        assert!(limiter.note_off(70));
    }

    #[test]
    fn test_timer_advances_clock() {
        let timer = ClockTimer::start().unwrap();
        let clock = timer.clock();
        std::thread::sleep(Duration::from_millis(30));
        assert!(clock.now_ms() > 0);
    }
}

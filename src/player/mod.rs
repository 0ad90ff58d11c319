//! Cooked MIDI stream playback.
//!
//! The [`StreamPlayer`] owns a FIFO of [`StreamBuffer`]s and a thread that
//! walks them in order, sleeping once per event for that event's delta time
//! and then dispatching it to a [`StreamSink`]. Finished buffers are handed
//! back through the [`StreamListener`].

pub mod smf;
pub mod stream;

pub use smf::{load_smf, parse_smf, SmfStream};
pub use stream::{BufferId, StreamBuffer, StreamEvent, StreamEventKind, EVENT_CALLBACK};

use crate::error::SynthError;
use crate::midi::{EventWriter, TransportCommand};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

/// Microseconds per quarter note until a tempo event says otherwise.
pub const DEFAULT_TEMPO: u32 = 500_000;

/// Ticks per quarter note until the division is set.
pub const DEFAULT_DIVISION: u16 = 24;

/// How delta ticks map to time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeDivision {
    /// Ticks per quarter note; scaled by the current tempo.
    Metrical(u16),
    /// Frames per second (29 means 29.97 drop frame) and ticks per frame.
    Smpte { fps: u8, ticks_per_frame: u8 },
}

impl TimeDivision {
    /// Decodes a time-division word as found in a MIDI file header.
    pub fn from_raw(raw: u16) -> Self {
        if raw & 0x8000 != 0 {
            let fps = ((raw >> 8) as u8 as i8).unsigned_abs();
            TimeDivision::Smpte {
                fps,
                ticks_per_frame: (raw & 0xFF) as u8,
            }
        } else {
            TimeDivision::Metrical(raw)
        }
    }

    pub fn is_smpte(&self) -> bool {
        matches!(self, TimeDivision::Smpte { .. })
    }

    /// Real time for `delta` ticks.
    pub fn delay_micros(&self, delta: u32, tempo: u32) -> u64 {
        match *self {
            TimeDivision::Metrical(tpqn) => delta as u64 * tempo as u64 / tpqn.max(1) as u64,
            TimeDivision::Smpte {
                fps,
                ticks_per_frame,
            } => {
                let ticks_per_frame = ticks_per_frame.max(1) as u64;
                match fps {
                    0 => 0,
                    29 => delta as u64 * 100_000_000 / (2997 * ticks_per_frame),
                    fps => delta as u64 * 1_000_000 / (fps as u64 * ticks_per_frame),
                }
            }
        }
    }
}

/// Playback position since the queue was last reset or emptied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamPosition {
    pub ticks: u64,
    pub micros: u64,
}

/// Receives buffers back from the player.
pub trait StreamListener: Send + Sync {
    /// A buffer finished playing or was flushed from the queue.
    fn on_buffer_done(&self, _buffer: StreamBuffer) {}

    /// An event carrying the callback flag was played.
    fn on_position(&self, _buffer: BufferId, _position: StreamPosition) {}
}

/// Listener that drops everything it gets.
pub struct NullListener;

impl StreamListener for NullListener {}

/// Where the player dispatches events.
pub trait StreamSink: Send {
    fn short(&mut self, event: u32) -> bool;
    fn long(&mut self, message: &[u8]) -> bool;
}

impl StreamSink for EventWriter {
    fn short(&mut self, event: u32) -> bool {
        self.write_short(event)
    }

    fn long(&mut self, message: &[u8]) -> bool {
        self.write_long(message)
    }
}

struct PlayerState {
    queue: VecDeque<StreamBuffer>,
    playing: bool,
    tempo: u32,
    division: TimeDivision,
    position: StreamPosition,
    /// Bumped whenever a pending wait must be abandoned.
    generation: u64,
    exit: bool,
}

impl PlayerState {
    fn interrupt(&mut self) {
        self.generation = self.generation.wrapping_add(1);
    }
}

struct Shared {
    state: Mutex<PlayerState>,
    wake: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PlayerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle for queue and transport operations; cheap to clone.
#[derive(Clone)]
pub struct PlayerControl {
    shared: Arc<Shared>,
    listener: Arc<dyn StreamListener>,
}

impl PlayerControl {
    /// Appends a buffer to the queue.
    pub fn add_to_queue(&self, buffer: StreamBuffer) -> BufferId {
        let id = buffer.id();
        let mut state = self.shared.lock();
        state.queue.push_back(buffer);
        self.shared.wake.notify_all();
        id
    }

    /// Rewinds every queued buffer to its first event and restarts the
    /// position.
    pub fn reset_queue(&self) {
        let mut state = self.shared.lock();
        state.queue.iter_mut().for_each(StreamBuffer::rewind);
        state.position = StreamPosition::default();
        state.interrupt();
        self.shared.wake.notify_all();
    }

    /// Completes every queued buffer without playing the rest of it.
    pub fn empty_queue(&self) {
        let flushed: Vec<StreamBuffer> = {
            let mut state = self.shared.lock();
            state.position = StreamPosition::default();
            state.interrupt();
            self.shared.wake.notify_all();
            state.queue.drain(..).collect()
        };
        if !flushed.is_empty() {
            tracing::debug!("flushed {} stream buffers", flushed.len());
        }
        for mut buffer in flushed {
            buffer.finish();
            self.listener.on_buffer_done(buffer);
        }
    }

    pub fn play(&self) {
        let mut state = self.shared.lock();
        state.playing = true;
        self.shared.wake.notify_all();
    }

    pub fn pause(&self) {
        let mut state = self.shared.lock();
        state.playing = false;
        state.interrupt();
        self.shared.wake.notify_all();
    }

    pub fn is_playing(&self) -> bool {
        self.shared.lock().playing
    }

    /// Sets microseconds per quarter note.
    pub fn set_tempo(&self, tempo: u32) {
        self.shared.lock().tempo = tempo;
    }

    pub fn tempo(&self) -> u32 {
        self.shared.lock().tempo
    }

    /// Sets the time division from a raw header word. The top bit selects
    /// SMPTE timing.
    pub fn set_ticks_per_quarter_note(&self, division: u16) {
        self.shared.lock().division = TimeDivision::from_raw(division);
    }

    pub fn division(&self) -> TimeDivision {
        self.shared.lock().division
    }

    pub fn get_position(&self) -> StreamPosition {
        self.shared.lock().position
    }

    /// Buffers still queued, including the one playing.
    pub fn queued(&self) -> usize {
        self.shared.lock().queue.len()
    }

    /// Applies a MIDI machine control command.
    pub fn handle_transport(&self, command: TransportCommand) {
        tracing::debug!("transport {:?}", command);
        match command {
            TransportCommand::Stop => {
                self.pause();
                self.empty_queue();
            }
            TransportCommand::Start => {
                self.reset_queue();
                self.play();
            }
            TransportCommand::Resume => self.play(),
            TransportCommand::Pause => self.pause(),
            TransportCommand::Reset => {
                self.pause();
                self.empty_queue();
                let mut state = self.shared.lock();
                state.tempo = DEFAULT_TEMPO;
                state.division = TimeDivision::Metrical(DEFAULT_DIVISION);
            }
        }
    }
}

/// The playback thread plus its control handle.
pub struct StreamPlayer {
    control: PlayerControl,
    handle: Option<JoinHandle<()>>,
}

impl StreamPlayer {
    /// Starts the playback thread, paused with an empty queue.
    pub fn start<S>(sink: S, listener: Arc<dyn StreamListener>) -> Result<Self, SynthError>
    where
        S: StreamSink + 'static,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(PlayerState {
                queue: VecDeque::new(),
                playing: false,
                tempo: DEFAULT_TEMPO,
                division: TimeDivision::Metrical(DEFAULT_DIVISION),
                position: StreamPosition::default(),
                generation: 0,
                exit: false,
            }),
            wake: Condvar::new(),
        });

        let thread_shared = Arc::clone(&shared);
        let thread_listener = Arc::clone(&listener);
        let handle = std::thread::Builder::new()
            .name("stream-player".into())
            .spawn(move || playback_loop(thread_shared, sink, thread_listener))
            .map_err(|source| SynthError::ThreadSpawn {
                name: "stream-player".into(),
                source,
            })?;

        Ok(Self {
            control: PlayerControl { shared, listener },
            handle: Some(handle),
        })
    }

    pub fn control(&self) -> PlayerControl {
        self.control.clone()
    }
}

impl std::ops::Deref for StreamPlayer {
    type Target = PlayerControl;

    fn deref(&self) -> &PlayerControl {
        &self.control
    }
}

impl Drop for StreamPlayer {
    fn drop(&mut self) {
        {
            let mut state = self.control.shared.lock();
            state.exit = true;
            state.interrupt();
            self.control.shared.wake.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("stream player thread panicked");
            }
        }
    }
}

/// What the loop does once the lock is released.
enum Step {
    Dispatch {
        kind: StreamEventKind,
        position: Option<(BufferId, StreamPosition)>,
    },
    Finished(StreamBuffer),
}

fn playback_loop<S: StreamSink>(shared: Arc<Shared>, mut sink: S, listener: Arc<dyn StreamListener>) {
    let mut state = shared.lock();
    loop {
        if state.exit {
            return;
        }
        if !state.playing || state.queue.is_empty() {
            state = shared.wake.wait(state).unwrap_or_else(PoisonError::into_inner);
            continue;
        }

        let step = match state.queue.front().and_then(|b| b.current().cloned()) {
            None => match state.queue.pop_front() {
                Some(mut buffer) => {
                    buffer.finish();
                    Step::Finished(buffer)
                }
                None => continue,
            },
            Some(event) => {
                let delay = state.division.delay_micros(event.delta, state.tempo);
                let generation = state.generation;
                state = shared
                    .wake
                    .wait_timeout_while(state, Duration::from_micros(delay), |s| {
                        s.generation == generation && !s.exit
                    })
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
                if state.generation != generation || state.exit {
                    continue;
                }

                state.position.ticks += event.delta as u64;
                state.position.micros += delay;
                if let StreamEventKind::Tempo(tempo) = event.kind {
                    if !state.division.is_smpte() {
                        state.tempo = tempo;
                    }
                }
                let position = state.position;
                let Some(buffer) = state.queue.front_mut() else {
                    continue;
                };
                buffer.advance();
                Step::Dispatch {
                    position: event.callback.then(|| (buffer.id(), position)),
                    kind: event.kind,
                }
            }
        };

        drop(state);
        match step {
            Step::Dispatch { kind, position } => {
                let queued = match &kind {
                    StreamEventKind::Short(word) => sink.short(*word),
                    StreamEventKind::Long(message) => sink.long(message),
                    StreamEventKind::Tempo(_) | StreamEventKind::Nop => true,
                };
                if !queued {
                    tracing::trace!("stream event not queued");
                }
                if let Some((id, position)) = position {
                    listener.on_position(id, position);
                }
            }
            Step::Finished(buffer) => listener.on_buffer_done(buffer),
        }
        state = shared.lock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Instant;

    #[derive(Clone, Default)]
    struct RecordingSink {
        events: Arc<Mutex<Vec<(Instant, u32)>>>,
        long: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl StreamSink for RecordingSink {
        fn short(&mut self, event: u32) -> bool {
            self.events.lock().unwrap().push((Instant::now(), event));
            true
        }

        fn long(&mut self, message: &[u8]) -> bool {
            self.long.lock().unwrap().push(message.to_vec());
            true
        }
    }

    struct ChannelListener {
        done: Mutex<mpsc::Sender<(u64, bool)>>,
        positions: Mutex<mpsc::Sender<StreamPosition>>,
    }

    impl StreamListener for ChannelListener {
        fn on_buffer_done(&self, buffer: StreamBuffer) {
            let _ = self.done.lock().unwrap().send((buffer.tag(), buffer.is_done()));
        }

        fn on_position(&self, _buffer: BufferId, position: StreamPosition) {
            let _ = self.positions.lock().unwrap().send(position);
        }
    }

    fn player() -> (
        StreamPlayer,
        RecordingSink,
        mpsc::Receiver<(u64, bool)>,
        mpsc::Receiver<StreamPosition>,
    ) {
        let sink = RecordingSink::default();
        let (done_tx, done_rx) = mpsc::channel();
        let (pos_tx, pos_rx) = mpsc::channel();
        let listener = Arc::new(ChannelListener {
            done: Mutex::new(done_tx),
            positions: Mutex::new(pos_tx),
        });
        let player = StreamPlayer::start(sink.clone(), listener).unwrap();
        (player, sink, done_rx, pos_rx)
    }

    #[test]
    fn test_time_division_decoding() {
        assert_eq!(TimeDivision::from_raw(96), TimeDivision::Metrical(96));
        // -25 fps, 40 ticks per frame
        assert_eq!(
            TimeDivision::from_raw(0xE728),
            TimeDivision::Smpte {
                fps: 25,
                ticks_per_frame: 40
            }
        );
        assert_eq!(TimeDivision::Metrical(24).delay_micros(24, 500_000), 500_000);
        // 25 fps * 40 ticks = 1000 ticks per second
        assert_eq!(TimeDivision::from_raw(0xE728).delay_micros(1000, 1), 1_000_000);
        assert_eq!(TimeDivision::from_raw(0xE301).delay_micros(2997, 0), 100_000_000);
    }

    #[test]
    fn test_delta_timing_at_default_tempo() {
        let (player, sink, done_rx, _) = player();
        player.add_to_queue(
            StreamBuffer::new(vec![
                StreamEvent::short(0, 0x0064_3C90),
                StreamEvent::short(24, 0x0000_3C80),
            ])
            .with_tag(1),
        );
        player.play();

        assert_eq!(done_rx.recv_timeout(Duration::from_secs(3)).unwrap(), (1, true));
        let events = sink.events.lock().unwrap().clone();
        assert_eq!(events.len(), 2);
        let gap = events[1].0 - events[0].0;
        assert!(gap >= Duration::from_millis(490), "gap {:?}", gap);
        assert!(gap < Duration::from_millis(700), "gap {:?}", gap);
        assert_eq!(
            player.get_position(),
            StreamPosition {
                ticks: 24,
                micros: 500_000
            }
        );
    }

    #[test]
    fn test_position_is_cumulative_delta_across_buffers() {
        let (player, sink, done_rx, pos_rx) = player();
        player.set_tempo(24_000); // one tick per millisecond
        player.add_to_queue(StreamBuffer::new(vec![
            StreamEvent::short(3, 0x90),
            StreamEvent::short(5, 0x80),
        ]));
        player.add_to_queue(StreamBuffer::new(vec![
            StreamEvent::short(7, 0x90),
            StreamEvent::short(2, 0x80).with_callback(),
        ]));
        player.play();

        done_rx.recv_timeout(Duration::from_secs(3)).unwrap();
        done_rx.recv_timeout(Duration::from_secs(3)).unwrap();
        assert_eq!(pos_rx.recv_timeout(Duration::from_secs(1)).unwrap().ticks, 17);
        assert_eq!(player.get_position().ticks, 17);
        assert_eq!(sink.events.lock().unwrap().len(), 4);
        assert_eq!(player.queued(), 0);
    }

    #[test]
    fn test_tempo_event_changes_speed() {
        let (player, sink, done_rx, _) = player();
        player.add_to_queue(StreamBuffer::new(vec![
            StreamEvent::new(0, StreamEventKind::Tempo(24_000)),
            StreamEvent::short(0, 0x90),
            StreamEvent::short(48, 0x80),
        ]));
        player.play();
        done_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(player.tempo(), 24_000);
        assert_eq!(player.get_position().micros, 48_000);
        assert_eq!(sink.events.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_tempo_events_ignored_in_smpte_mode() {
        let (player, _, done_rx, _) = player();
        player.set_ticks_per_quarter_note(0xE728);
        player.add_to_queue(StreamBuffer::new(vec![
            StreamEvent::new(10, StreamEventKind::Tempo(1)),
            StreamEvent::new(10, StreamEventKind::Nop),
        ]));
        player.play();
        done_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(player.tempo(), DEFAULT_TEMPO);
        assert_eq!(player.get_position().micros, 20_000);
    }

    #[test]
    fn test_empty_queue_hands_back_every_buffer_undispatched() {
        let (player, sink, done_rx, _) = player();
        for tag in 0..3 {
            player.add_to_queue(
                StreamBuffer::new(vec![StreamEvent::short(24 * 100, 0x90)]).with_tag(tag),
            );
        }
        player.play();
        std::thread::sleep(Duration::from_millis(20));
        player.empty_queue();

        let tags: Vec<_> = (0..3)
            .map(|_| done_rx.recv_timeout(Duration::from_secs(1)).unwrap())
            .collect();
        assert_eq!(tags, vec![(0, true), (1, true), (2, true)]);
        assert!(sink.events.lock().unwrap().is_empty());
        assert_eq!(player.get_position(), StreamPosition::default());
    }

    #[test]
    fn test_paused_player_dispatches_nothing() {
        let (player, sink, _, _) = player();
        player.add_to_queue(StreamBuffer::new(vec![StreamEvent::short(0, 0x90)]));
        std::thread::sleep(Duration::from_millis(30));
        assert!(sink.events.lock().unwrap().is_empty());
        assert!(!player.is_playing());
    }

    #[test]
    fn test_transport_commands() {
        let (player, sink, done_rx, _) = player();
        player.add_to_queue(StreamBuffer::new(vec![
            StreamEvent::short(0, 0x90),
            StreamEvent::new(0, StreamEventKind::Long(vec![0xF0, 0x01, 0xF7])),
        ]));
        player.handle_transport(TransportCommand::Start);
        done_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(sink.long.lock().unwrap().len(), 1);

        player.handle_transport(TransportCommand::Pause);
        assert!(!player.is_playing());
        player.handle_transport(TransportCommand::Resume);
        assert!(player.is_playing());

        player.set_tempo(1);
        player.handle_transport(TransportCommand::Reset);
        assert!(!player.is_playing());
        assert_eq!(player.tempo(), DEFAULT_TEMPO);
        assert_eq!(player.division(), TimeDivision::Metrical(DEFAULT_DIVISION));
    }
}

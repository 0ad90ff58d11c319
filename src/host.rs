//! The host context: owns every thread and buffer of one synthesizer.
//!
//! Live input and the stream player each feed their own SPSC event queue.
//! A dedicated event thread drains both, applies running status, decodes
//! SysEx and hands events to the [`EventRouter`]. Instances are rendered by
//! the [`RenderManager`] (or directly, when there is only one) from inside
//! the [`BufferedRenderer`] thread, and the audio sink pulls from the
//! [`AudioReader`].

use crate::config::HostConfig;
use crate::error::{SynthError, SysExError};
use crate::midi::{
    event_queue, sysex, EventReader, EventWriter, QueuedEvent, ResetKind, RunningStatus,
    SysExAction,
};
use crate::player::{
    BufferId, NullListener, PlayerControl, StreamBuffer, StreamListener, StreamPlayer,
    StreamPosition,
};
use crate::render::{
    AudioReader, BufferedRenderer, ClockTimer, EventRouter, RenderManager, Renderer,
    RendererStats, Topology,
};
use crate::synth::{factory_for, EngineFactory, SynthInstance};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

/// Event thread sleep when both queues are empty.
const IDLE_QUANTUM: Duration = Duration::from_millis(1);

/// One running synthesizer.
pub struct SynthHost {
    config: HostConfig,
    live: Mutex<EventWriter>,
    dropped: Arc<AtomicU64>,
    stop: Arc<AtomicBool>,
    event_thread: Option<JoinHandle<()>>,
    // dropped in this order once the event thread is gone
    player: StreamPlayer,
    buffered: BufferedRenderer,
    stats: Arc<RendererStats>,
    renderer: Arc<dyn Renderer>,
    instances: Vec<Arc<SynthInstance>>,
    _clock: Option<ClockTimer>,
}

impl SynthHost {
    /// Builds a host around the engine back end named by `config`.
    pub fn from_config(config: HostConfig) -> Result<Self, SynthError> {
        let factory = factory_for(&config)?;
        Self::new(config, factory)
    }

    pub fn new(config: HostConfig, factory: Arc<dyn EngineFactory>) -> Result<Self, SynthError> {
        Self::with_listener(config, factory, Arc::new(NullListener))
    }

    /// Builds a host whose stream player reports to `listener`.
    pub fn with_listener(
        config: HostConfig,
        factory: Arc<dyn EngineFactory>,
        listener: Arc<dyn StreamListener>,
    ) -> Result<Self, SynthError> {
        config.validate()?;

        let topology = Topology::from_slices(config.key_slices);
        let instances = (0..topology.instance_count())
            .map(|index| {
                SynthInstance::start(index, factory.as_ref(), config.audio_channels).map(Arc::new)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let renderer: Arc<dyn Renderer> = match instances.as_slice() {
            [single] => Arc::clone(single) as Arc<dyn Renderer>,
            _ => Arc::new(RenderManager::new(instances.clone(), config.worker_count())?),
        };

        let clock = match config.max_nps {
            Some(_) => Some(ClockTimer::start()?),
            None => None,
        };
        let limit = config
            .max_nps
            .zip(clock.as_ref().map(ClockTimer::clock));
        let router = EventRouter::new(topology, instances.clone(), limit);

        let (live_tx, live_rx) = event_queue(
            config.event_buffer_capacity,
            config.long_buffer_capacity,
            config.max_sysex_len,
        );
        let (player_tx, player_rx) = event_queue(
            config.event_buffer_capacity,
            config.long_buffer_capacity,
            config.max_sysex_len,
        );
        let player = StreamPlayer::start(player_tx, listener)?;

        let render_path = Arc::clone(&renderer);
        let buffered = BufferedRenderer::start(
            move |chunk: &mut [f32]| {
                render_path.render(chunk);
            },
            config.sample_rate,
            config.audio_channels,
            config.render_chunk_frames(),
        )?;
        let stats = buffered.stats();

        let stop = Arc::new(AtomicBool::new(false));
        let worker = EventWorker {
            router,
            sources: [
                EventSource::new(live_rx, "live"),
                EventSource::new(player_rx, "player"),
            ],
            transport: player.control(),
            stop: Arc::clone(&stop),
        };
        let event_thread = std::thread::Builder::new()
            .name("midi-events".into())
            .spawn(move || worker.run())
            .map_err(|source| SynthError::ThreadSpawn {
                name: "midi-events".into(),
                source,
            })?;

        tracing::info!(
            "synth host started: {} instances ({}), {} Hz, {} channels",
            instances.len(),
            factory.name(),
            config.sample_rate,
            config.audio_channels
        );
        Ok(Self {
            config,
            live: Mutex::new(live_tx),
            dropped: Arc::new(AtomicU64::new(0)),
            stop,
            event_thread: Some(event_thread),
            player,
            buffered,
            stats,
            renderer,
            instances,
            _clock: clock,
        })
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Queues a packed short event from live input. Never blocks: returns
    /// `false` if the event was dropped because the queue is full or
    /// another producer holds it.
    pub fn push_short_event(&self, event: u32) -> bool {
        let queued = match self.live.try_lock() {
            Ok(mut writer) => writer.write_short(event),
            Err(_) => false,
        };
        if !queued {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::trace!("dropped short event {:#08x}", event);
        }
        queued
    }

    /// Queues a complete SysEx message from live input. Malformed messages
    /// are rejected; `Ok(false)` means a well-formed message was dropped.
    pub fn push_long_event(&self, message: &[u8]) -> Result<bool, SysExError> {
        sysex::validate_frame(message)?;
        if message.len() > self.config.max_sysex_len {
            return Err(SysExError::InvalidBuffer("message exceeds max_sysex_len"));
        }
        let queued = match self.live.try_lock() {
            Ok(mut writer) => writer.write_long(message),
            Err(_) => false,
        };
        if !queued {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::trace!("dropped {} byte sysex", message.len());
        }
        Ok(queued)
    }

    /// Resets every instance, in order with the events already queued.
    pub fn reset(&self, kind: ResetKind) {
        let mut writer = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        if !writer.write_short(kind.to_event()) {
            tracing::warn!("event queue full, {:?} reset dropped", kind);
        }
    }

    /// Replaces the SoundFonts of every instance.
    pub fn set_soundfonts(&mut self, soundfonts: &[PathBuf]) -> Result<(), SynthError> {
        for instance in &self.instances {
            instance.set_soundfonts(soundfonts)?;
        }
        self.config.soundfonts = soundfonts.to_vec();
        tracing::info!("loaded {} SoundFonts", soundfonts.len());
        Ok(())
    }

    /// Voices sounding across all instances.
    pub fn active_voice_count(&self) -> u32 {
        self.renderer.active_voice_count()
    }

    /// Average render time over chunk period; above 1.0 the host cannot
    /// keep up.
    pub fn rendering_load(&self) -> f32 {
        self.stats.average_load()
    }

    pub fn renderer_stats(&self) -> Arc<RendererStats> {
        Arc::clone(&self.stats)
    }

    /// Hands out the audio pull side. Only the first call gets it.
    pub fn take_audio_reader(&mut self) -> Option<AudioReader> {
        self.buffered.take_reader()
    }

    /// Events dropped at the live input.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn player(&self) -> PlayerControl {
        self.player.control()
    }

    pub fn add_to_queue(&self, buffer: StreamBuffer) -> BufferId {
        self.player.add_to_queue(buffer)
    }

    pub fn reset_queue(&self) {
        self.player.reset_queue();
    }

    pub fn empty_queue(&self) {
        self.player.empty_queue();
    }

    pub fn play(&self) {
        self.player.play();
    }

    pub fn pause(&self) {
        self.player.pause();
    }

    pub fn set_tempo(&self, tempo: u32) {
        self.player.set_tempo(tempo);
    }

    pub fn set_ticks_per_quarter_note(&self, division: u16) {
        self.player.set_ticks_per_quarter_note(division);
    }

    pub fn get_position(&self) -> StreamPosition {
        self.player.get_position()
    }
}

impl Drop for SynthHost {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.event_thread.take() {
            if handle.join().is_err() {
                tracing::error!("midi event thread panicked");
            }
        }
        tracing::info!("synth host stopped");
    }
}

/// One input queue and the running status of its connection.
struct EventSource {
    reader: EventReader,
    status: RunningStatus,
    name: &'static str,
}

impl EventSource {
    fn new(reader: EventReader, name: &'static str) -> Self {
        Self {
            reader,
            status: RunningStatus::new(),
            name,
        }
    }
}

struct EventWorker {
    router: EventRouter,
    sources: [EventSource; 2],
    transport: PlayerControl,
    stop: Arc<AtomicBool>,
}

impl EventWorker {
    fn run(mut self) {
        while !self.stop.load(Ordering::Relaxed) {
            let mut idle = true;
            for source in self.sources.iter_mut() {
                while let Some(event) = source.reader.read() {
                    idle = false;
                    match event {
                        QueuedEvent::Short(word) => {
                            if let Some(word) = source.status.apply(word) {
                                self.router.route(word);
                            }
                        }
                        QueuedEvent::Long(message) => {
                            source.status.clear();
                            apply_sysex(&mut self.router, &self.transport, source.name, message.bytes());
                        }
                    }
                }
            }
            if idle {
                std::thread::sleep(IDLE_QUANTUM);
            }
        }
    }
}

fn apply_sysex(router: &mut EventRouter, transport: &PlayerControl, source: &str, message: &[u8]) {
    match sysex::decode(message) {
        Ok(SysExAction::Params(changes)) => {
            tracing::debug!("{} sysex: {} parameter changes", source, changes.len());
            for change in changes {
                router.route_param(change);
            }
        }
        Ok(SysExAction::Reset(kind)) => router.reset(kind),
        Ok(SysExAction::Transport(command)) => transport.handle_transport(command),
        Err(SysExError::NotSupported) => {
            tracing::debug!("{} sysex not supported: {:02x?}", source, message);
        }
        Err(e) => tracing::warn!("{} sysex discarded: {}", source, e),
    }
}

//! synthhost - plays a MIDI file through the real-time synth host.
//!
//! The file is loaded into cooked stream buffers and played by the host's
//! stream player, so it exercises the same path a driver would: event
//! queues, SysEx decoding, note limiting, the render pool and the
//! render-ahead buffer.
//!
//! # Usage
//!
//! ```bash
//! cargo run -- song.mid -sf font.sf2            # play through the speakers
//! cargo run -- song.mid -sf font.sf2 -o out.wav # record instead
//! ```

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use synthhost::audio::{record_to_wav, AudioOutput};
use synthhost::player::{load_smf, StreamBuffer, StreamListener};
use synthhost::synth::factory_for;
use synthhost::{HostConfig, SynthHost};

/// Audio kept after the last event so releases ring out.
const TAIL: Duration = Duration::from_secs(2);

/// Command-line options for the application.
struct CliOptions {
    midi_file: PathBuf,
    soundfonts: Vec<PathBuf>,
    config: Option<PathBuf>,
    output: Option<PathBuf>,
    key_slices: Option<usize>,
    render_threads: Option<usize>,
    /// `Some(None)` turns limiting off.
    max_nps: Option<Option<u64>>,
}

impl CliOptions {
    /// Parses command-line arguments.
    ///
    /// Supports:
    /// - `<file.mid>`: the file to play
    /// - `--soundfont <path>` or `-sf <path>`: add a SoundFont (repeatable)
    /// - `--config <path>` or `-c <path>`: load a JSON host configuration
    /// - `--output <path>` or `-o <path>`: record to WAV instead of playing
    /// - `--slices N`, `--threads N`, `--max-nps N|off`: override the config
    /// - `--help` or `-h`: Print help and exit
    fn parse() -> Result<Self> {
        let args: Vec<String> = std::env::args().collect();
        let mut midi_file = None;
        let mut soundfonts = Vec::new();
        let mut config = None;
        let mut output = None;
        let mut key_slices = None;
        let mut render_threads = None;
        let mut max_nps = None;
        let mut i = 1;

        let value = |i: usize, flag: &str| -> Result<String> {
            args.get(i)
                .cloned()
                .with_context(|| format!("{} requires an argument", flag))
        };

        while i < args.len() {
            match args[i].as_str() {
                flag @ ("--soundfont" | "-sf") => {
                    i += 1;
                    soundfonts.push(PathBuf::from(value(i, flag)?));
                }
                flag @ ("--config" | "-c") => {
                    i += 1;
                    config = Some(PathBuf::from(value(i, flag)?));
                }
                flag @ ("--output" | "-o") => {
                    i += 1;
                    output = Some(PathBuf::from(value(i, flag)?));
                }
                flag @ "--slices" => {
                    i += 1;
                    key_slices = Some(value(i, flag)?.parse().context("--slices expects a number")?);
                }
                flag @ "--threads" => {
                    i += 1;
                    render_threads =
                        Some(value(i, flag)?.parse().context("--threads expects a number")?);
                }
                flag @ "--max-nps" => {
                    i += 1;
                    let raw = value(i, flag)?;
                    max_nps = Some(if raw == "off" {
                        None
                    } else {
                        Some(raw.parse().context("--max-nps expects a number or 'off'")?)
                    });
                }
                "--help" | "-h" => {
                    eprintln!("synthhost - real-time MIDI synth host");
                    eprintln!();
                    eprintln!(
                        "Usage: {} <file.mid> [OPTIONS]",
                        args.first().map(String::as_str).unwrap_or("synthhost")
                    );
                    eprintln!();
                    eprintln!("Options:");
                    eprintln!("  -sf, --soundfont PATH  Add a SoundFont file (.sf2), highest priority first");
                    eprintln!("  -c, --config PATH      Load host settings from a JSON file");
                    eprintln!("  -o, --output PATH      Record to a WAV file instead of playing");
                    eprintln!("  --slices N             Instances per MIDI channel (0 = one instance)");
                    eprintln!("  --threads N            Render threads (0 = one per core)");
                    eprintln!("  --max-nps N|off        Notes-per-second ceiling per instance");
                    eprintln!("  -h, --help             Print this help message");
                    std::process::exit(0);
                }
                other if other.starts_with('-') => {
                    eprintln!("Unknown option: {}", other);
                    eprintln!("Use --help for usage information");
                    std::process::exit(1);
                }
                other => {
                    if other.ends_with(".sf2") {
                        soundfonts.push(PathBuf::from(other));
                    } else {
                        midi_file = Some(PathBuf::from(other));
                    }
                }
            }
            i += 1;
        }

        let Some(midi_file) = midi_file else {
            bail!("no MIDI file given (see --help)");
        };
        Ok(Self {
            midi_file,
            soundfonts,
            config,
            output,
            key_slices,
            render_threads,
            max_nps,
        })
    }

    fn host_config(&self) -> Result<HostConfig> {
        let mut config = match &self.config {
            Some(path) => HostConfig::load(path)
                .with_context(|| format!("Failed to load config: {}", path.display()))?,
            None => HostConfig::default(),
        };
        if !self.soundfonts.is_empty() {
            config.soundfonts = self.soundfonts.clone();
        }
        if let Some(slices) = self.key_slices {
            config.key_slices = slices;
        }
        if let Some(threads) = self.render_threads {
            config.render_threads = threads;
        }
        if let Some(max_nps) = self.max_nps {
            config.max_nps = max_nps;
        }
        if config.soundfonts.is_empty() {
            bail!("no SoundFont given; use --soundfont or a config file");
        }
        Ok(config)
    }
}

/// Counts buffers still owned by the player.
struct Completion {
    remaining: AtomicUsize,
}

impl Completion {
    fn finished(&self) -> bool {
        self.remaining.load(Ordering::Acquire) == 0
    }
}

impl StreamListener for Completion {
    fn on_buffer_done(&self, _buffer: StreamBuffer) {
        self.remaining.fetch_sub(1, Ordering::AcqRel);
    }
}

/// True until the tail after the last buffer has played.
fn still_playing(completion: &Completion, finished_at: &mut Option<Instant>) -> bool {
    if !completion.finished() {
        return true;
    }
    finished_at.get_or_insert_with(Instant::now).elapsed() < TAIL
}

/// Main entry point.
fn main() -> Result<()> {
    let cli = CliOptions::parse()?;

    // Initialize logging (optional, for debugging)
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = cli.host_config()?;
    let stream = load_smf(&cli.midi_file)
        .with_context(|| format!("Failed to load MIDI file: {}", cli.midi_file.display()))?;

    let completion = Arc::new(Completion {
        remaining: AtomicUsize::new(stream.buffers.len()),
    });
    let factory = factory_for(&config).context("Failed to load SoundFonts")?;
    let (sample_rate, channels) = (config.sample_rate, config.audio_channels);
    let mut host = SynthHost::with_listener(config, factory, completion.clone())
        .context("Failed to start synth host")?;
    let reader = host
        .take_audio_reader()
        .context("audio reader already taken")?;

    host.set_ticks_per_quarter_note(stream.division);
    for buffer in stream.buffers {
        host.add_to_queue(buffer);
    }
    host.play();

    let mut finished_at = None;
    match &cli.output {
        Some(path) => {
            let mut reader = reader;
            record_to_wav(&mut reader, sample_rate, channels, path, || {
                still_playing(&completion, &mut finished_at)
            })?;
        }
        None => {
            let _output = AudioOutput::start(reader, sample_rate, channels)?;
            let mut last_report = Instant::now();
            while still_playing(&completion, &mut finished_at) {
                std::thread::sleep(Duration::from_millis(20));
                if last_report.elapsed() >= Duration::from_secs(1) {
                    tracing::debug!(
                        "voices {}, load {:.2}, ticks {}",
                        host.active_voice_count(),
                        host.rendering_load(),
                        host.get_position().ticks
                    );
                    last_report = Instant::now();
                }
            }
        }
    }

    if host.dropped_events() > 0 {
        tracing::warn!("{} live events dropped", host.dropped_events());
    }
    Ok(())
}

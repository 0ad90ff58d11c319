//! Standard MIDI File loading.
//!
//! Turns a .mid file into cooked stream buffers for the player. Format 0
//! and 1 files have their tracks merged by absolute tick; format 2 files
//! play their tracks one after another.
//!
//! # Limitations
//!
//! - Escape (`F7`) packets and divided SysEx messages are not reassembled
//! - Meta events other than tempo are dropped

use super::stream::{StreamBuffer, StreamEvent, StreamEventKind};
use crate::error::StreamError;
use crate::midi::pack_short;
use midly::{Format, MetaMessage, MidiMessage, Smf, Timing, TrackEventKind};
use std::fs;
use std::path::Path;

/// Events per emitted buffer.
const EVENTS_PER_BUFFER: usize = 4096;

/// A loaded file, ready to queue.
#[derive(Debug)]
pub struct SmfStream {
    /// Raw time-division word for the player.
    pub division: u16,
    pub buffers: Vec<StreamBuffer>,
}

impl SmfStream {
    pub fn event_count(&self) -> usize {
        self.buffers.iter().map(|b| b.events().len()).sum()
    }
}

/// Reads and converts a MIDI file.
pub fn load_smf<P: AsRef<Path>>(path: P) -> Result<SmfStream, StreamError> {
    let data = fs::read(path.as_ref())?;
    parse_smf(&data)
}

/// Converts an in-memory MIDI file.
pub fn parse_smf(data: &[u8]) -> Result<SmfStream, StreamError> {
    let smf = Smf::parse(data).map_err(|e| StreamError::Parse(e.to_string()))?;

    let division = match smf.header.timing {
        Timing::Metrical(tpb) => tpb.as_int(),
        Timing::Timecode(fps, ticks_per_frame) => {
            let fps = (-(fps.as_int() as i8)) as u8;
            ((fps as u16) << 8) | ticks_per_frame as u16
        }
    };

    // (absolute tick, track, event) so merged events keep track order on ties
    let mut timed: Vec<(u64, usize, StreamEventKind)> = Vec::new();
    let mut track_offset = 0u64;
    for (track_idx, track) in smf.tracks.iter().enumerate() {
        let mut tick = track_offset;
        for event in track {
            tick += event.delta.as_int() as u64;
            if let Some(kind) = convert(event.kind) {
                timed.push((tick, track_idx, kind));
            }
        }
        if smf.header.format == Format::Sequential {
            track_offset = tick;
        }
    }
    timed.sort_by_key(|(tick, track, _)| (*tick, *track));

    let mut events = Vec::with_capacity(timed.len());
    let mut last_tick = 0u64;
    for (tick, _, kind) in timed {
        let delta = (tick - last_tick).min(u32::MAX as u64) as u32;
        last_tick = tick;
        events.push(StreamEvent::new(delta, kind));
    }

    let mut buffers = Vec::with_capacity(events.len() / EVENTS_PER_BUFFER + 1);
    let mut rest = events.into_iter().peekable();
    while rest.peek().is_some() {
        let chunk: Vec<StreamEvent> = rest.by_ref().take(EVENTS_PER_BUFFER).collect();
        buffers.push(StreamBuffer::new(chunk));
    }

    tracing::info!(
        "loaded MIDI file: {} tracks, division {:#06x}, {} buffers",
        smf.tracks.len(),
        division,
        buffers.len()
    );
    Ok(SmfStream { division, buffers })
}

/// Maps one track event to a stream event, if it is playable.
fn convert(kind: TrackEventKind<'_>) -> Option<StreamEventKind> {
    match kind {
        TrackEventKind::Midi { channel, message } => {
            let ch = channel.as_int();
            let word = match message {
                MidiMessage::NoteOff { key, vel } => pack_short(0x80 | ch, key.as_int(), vel.as_int()),
                MidiMessage::NoteOn { key, vel } => pack_short(0x90 | ch, key.as_int(), vel.as_int()),
                MidiMessage::Aftertouch { key, vel } => {
                    pack_short(0xA0 | ch, key.as_int(), vel.as_int())
                }
                MidiMessage::Controller { controller, value } => {
                    pack_short(0xB0 | ch, controller.as_int(), value.as_int())
                }
                MidiMessage::ProgramChange { program } => pack_short(0xC0 | ch, program.as_int(), 0),
                MidiMessage::ChannelAftertouch { vel } => pack_short(0xD0 | ch, vel.as_int(), 0),
                MidiMessage::PitchBend { bend } => {
                    let value = bend.0.as_int();
                    pack_short(0xE0 | ch, (value & 0x7F) as u8, (value >> 7) as u8)
                }
            };
            Some(StreamEventKind::Short(word))
        }
        TrackEventKind::SysEx(bytes) => {
            let mut message = Vec::with_capacity(bytes.len() + 2);
            message.push(0xF0);
            message.extend_from_slice(bytes);
            if message.last() != Some(&0xF7) {
                message.push(0xF7);
            }
            Some(StreamEventKind::Long(message))
        }
        TrackEventKind::Meta(MetaMessage::Tempo(tempo)) => Some(StreamEventKind::Tempo(tempo.as_int())),
        TrackEventKind::Meta(_) | TrackEventKind::Escape(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_vlq(mut value: u32, out: &mut Vec<u8>) {
        let mut bytes = vec![(value & 0x7F) as u8];
        value >>= 7;
        while value > 0 {
            bytes.push(((value & 0x7F) as u8) | 0x80);
            value >>= 7;
        }
        bytes.reverse();
        out.extend(bytes);
    }

    fn track(events: &[(u32, &[u8])]) -> Vec<u8> {
        let mut data = Vec::new();
        for (delta, bytes) in events {
            write_vlq(*delta, &mut data);
            data.extend_from_slice(bytes);
        }
        data.extend_from_slice(&[0x00, 0xFF, 0x2F, 0x00]);
        let mut chunk = b"MTrk".to_vec();
        chunk.extend_from_slice(&(data.len() as u32).to_be_bytes());
        chunk.extend(data);
        chunk
    }

    fn file(format: u16, division: u16, tracks: &[Vec<u8>]) -> Vec<u8> {
        let mut out = b"MThd".to_vec();
        out.extend_from_slice(&6u32.to_be_bytes());
        out.extend_from_slice(&format.to_be_bytes());
        out.extend_from_slice(&(tracks.len() as u16).to_be_bytes());
        out.extend_from_slice(&division.to_be_bytes());
        for track in tracks {
            out.extend_from_slice(track);
        }
        out
    }

    #[test]
    fn test_tracks_are_merged_by_tick() {
        let tempo = track(&[(0, &[0xFF, 0x51, 0x03, 0x07, 0xA1, 0x20])]);
        let melody = track(&[(0, &[0x90, 60, 100]), (96, &[0x80, 60, 0])]);
        let bass = track(&[(48, &[0x91, 36, 90]), (96, &[0x81, 36, 0])]);
        let stream = parse_smf(&file(1, 96, &[tempo, melody, bass])).unwrap();

        assert_eq!(stream.division, 96);
        let events = stream.buffers[0].events();
        let summary: Vec<(u32, StreamEventKind)> =
            events.iter().map(|e| (e.delta, e.kind.clone())).collect();
        assert_eq!(
            summary,
            vec![
                (0, StreamEventKind::Tempo(500_000)),
                (0, StreamEventKind::Short(0x0064_3C90)),
                (48, StreamEventKind::Short(0x005A_2491)),
                (48, StreamEventKind::Short(0x0000_3C80)),
                (48, StreamEventKind::Short(0x0000_2481)),
            ]
        );
    }

    #[test]
    fn test_sysex_is_framed() {
        let data = track(&[(0, &[0xF0, 0x04, 0x7E, 0x7F, 0x09, 0xF7])]);
        let stream = parse_smf(&file(0, 480, &[data])).unwrap();
        assert_eq!(
            stream.buffers[0].events()[0].kind,
            StreamEventKind::Long(vec![0xF0, 0x7E, 0x7F, 0x09, 0xF7])
        );
    }

    #[test]
    fn test_pitch_bend_and_timecode() {
        let data = track(&[(10, &[0xE2, 0x00, 0x40])]);
        let stream = parse_smf(&file(0, 0xE728, &[data])).unwrap();
        assert_eq!(stream.division, 0xE728);
        assert_eq!(
            stream.buffers[0].events()[0],
            StreamEvent::short(10, 0x0040_00E2)
        );
    }

    #[test]
    fn test_sequential_tracks_play_in_turn() {
        let first = track(&[(10, &[0x90, 60, 1])]);
        let second = track(&[(5, &[0x90, 61, 1])]);
        let stream = parse_smf(&file(2, 24, &[first, second])).unwrap();
        let deltas: Vec<u32> = stream.buffers[0].events().iter().map(|e| e.delta).collect();
        assert_eq!(deltas, vec![10, 5]);
    }

    #[test]
    fn test_large_files_are_chunked() {
        let note = [0x90u8, 60, 1];
        let events: Vec<(u32, &[u8])> = (0..EVENTS_PER_BUFFER + 10).map(|_| (1, &note[..])).collect();
        let stream = parse_smf(&file(0, 24, &[track(&events)])).unwrap();
        assert_eq!(stream.buffers.len(), 2);
        assert_eq!(stream.event_count(), EVENTS_PER_BUFFER + 10);
    }

    #[test]
    fn test_garbage_is_a_parse_error() {
        assert!(matches!(parse_smf(b"not a midi file"), Err(StreamError::Parse(_))));
    }
}

//! Cooked stream buffers.
//!
//! A [`StreamBuffer`] is a run of timed events handed to the player in one
//! piece. Buffers can be built event by event or parsed from the packed
//! `MIDIEVENT` byte layout used by stream drivers: a little-endian delta,
//! stream id and event word per record, with long payloads padded to a
//! multiple of four bytes.

use crate::error::StreamError;
use crate::midi::sysex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Global counter for generating unique buffer IDs.
static BUFFER_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a queued buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(u64);

impl BufferId {
    pub fn new() -> Self {
        Self(BUFFER_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for BufferId {
    fn default() -> Self {
        Self::new()
    }
}

/// Event word flag asking for a position callback when the event plays.
pub const EVENT_CALLBACK: u32 = 0x4000_0000;

const EVENT_SHORT: u8 = 0x00;
const EVENT_TEMPO: u8 = 0x01;
const EVENT_NOP: u8 = 0x02;
const EVENT_LONG: u8 = 0x80;

/// Size of a record without its long payload.
const RECORD_HEADER: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEventKind {
    /// Packed short message.
    Short(u32),
    /// Complete SysEx message.
    Long(Vec<u8>),
    /// Microseconds per quarter note.
    Tempo(u32),
    Nop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    /// Ticks since the previous event.
    pub delta: u32,
    pub kind: StreamEventKind,
    /// Report the position when this event plays.
    pub callback: bool,
}

impl StreamEvent {
    pub fn new(delta: u32, kind: StreamEventKind) -> Self {
        Self {
            delta,
            kind,
            callback: false,
        }
    }

    pub fn short(delta: u32, event: u32) -> Self {
        Self::new(delta, StreamEventKind::Short(event))
    }

    pub fn with_callback(mut self) -> Self {
        self.callback = true;
        self
    }
}

/// A queued run of events plus the caller's tag.
#[derive(Debug, Clone)]
pub struct StreamBuffer {
    id: BufferId,
    tag: u64,
    events: Vec<StreamEvent>,
    offset: usize,
    done: bool,
}

impl StreamBuffer {
    pub fn new(events: Vec<StreamEvent>) -> Self {
        Self {
            id: BufferId::new(),
            tag: 0,
            events,
            offset: 0,
            done: false,
        }
    }

    /// Attaches an opaque value the caller uses to find its own handle
    /// when the buffer comes back.
    pub fn with_tag(mut self, tag: u64) -> Self {
        self.tag = tag;
        self
    }

    /// Parses packed `MIDIEVENT` records.
    pub fn from_cooked(data: &[u8]) -> Result<Self, StreamError> {
        let mut events = Vec::new();
        let mut pos = 0;
        while pos < data.len() {
            if data.len() - pos < RECORD_HEADER {
                return Err(StreamError::Malformed {
                    offset: pos,
                    reason: "truncated event header",
                });
            }
            let delta = read_u32(data, pos);
            // bytes 4..8 hold the stream id, which is unused
            let word = read_u32(data, pos + 8);
            let callback = word & EVENT_CALLBACK != 0;
            let kind = ((word >> 24) as u8) & !((EVENT_CALLBACK >> 24) as u8);
            pos += RECORD_HEADER;

            let kind = if kind & EVENT_LONG != 0 {
                let len = (word & 0x00FF_FFFF) as usize;
                let padded = (len + 3) & !3;
                if data.len() - pos < len {
                    return Err(StreamError::Malformed {
                        offset: pos,
                        reason: "long event payload exceeds buffer",
                    });
                }
                let payload = data[pos..pos + len].to_vec();
                pos = (pos + padded).min(data.len());
                if kind == EVENT_LONG {
                    match sysex::validate_frame(&payload) {
                        Ok(()) => StreamEventKind::Long(payload),
                        Err(e) => {
                            tracing::warn!("long stream event kept as nop: {}", e);
                            StreamEventKind::Nop
                        }
                    }
                } else {
                    // comments, version records
                    StreamEventKind::Nop
                }
            } else {
                match kind {
                    EVENT_SHORT => StreamEventKind::Short(word & 0x00FF_FFFF),
                    EVENT_TEMPO => StreamEventKind::Tempo(word & 0x00FF_FFFF),
                    EVENT_NOP => StreamEventKind::Nop,
                    _ => {
                        tracing::debug!("unknown stream event type {:#04x}", kind);
                        StreamEventKind::Nop
                    }
                }
            };
            events.push(StreamEvent {
                delta,
                kind,
                callback,
            });
        }
        Ok(Self::new(events))
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn tag(&self) -> u64 {
        self.tag
    }

    pub fn events(&self) -> &[StreamEvent] {
        &self.events
    }

    /// Index of the next event to play.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Total ticks spanned by the buffer.
    pub fn duration_ticks(&self) -> u64 {
        self.events.iter().map(|e| e.delta as u64).sum()
    }

    pub(crate) fn current(&self) -> Option<&StreamEvent> {
        self.events.get(self.offset)
    }

    pub(crate) fn advance(&mut self) {
        self.offset += 1;
    }

    pub(crate) fn rewind(&mut self) {
        self.offset = 0;
        self.done = false;
    }

    pub(crate) fn finish(&mut self) {
        self.offset = self.events.len();
        self.done = true;
    }
}

fn read_u32(data: &[u8], pos: usize) -> u32 {
    u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
}

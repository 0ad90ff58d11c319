//! MIDI wire-level types.
//!
//! Short events travel through the host packed into a `u32` the same way
//! driver APIs hand them over: status in the low byte, then the two data
//! bytes. This module provides the packing helpers, the event rings, the
//! running-status decoder and the SysEx parser.

pub mod decoder;
pub mod evbuf;
pub mod sysex;

pub use decoder::{MidiMessage, RunningStatus};
pub use evbuf::{event_queue, EventReader, EventWriter, LongEvent, QueuedEvent};
pub use sysex::{ParamChange, ParamScope, SynthParam, SysExAction, TransportCommand};

/// Note Off status nibble.
pub const NOTE_OFF: u8 = 0x80;
/// Note On status nibble.
pub const NOTE_ON: u8 = 0x90;
/// Polyphonic key pressure status nibble.
pub const POLY_PRESSURE: u8 = 0xA0;
/// Control Change status nibble.
pub const CONTROL_CHANGE: u8 = 0xB0;
/// Program Change status nibble.
pub const PROGRAM_CHANGE: u8 = 0xC0;
/// Channel pressure status nibble.
pub const CHANNEL_PRESSURE: u8 = 0xD0;
/// Pitch bend status nibble.
pub const PITCH_BEND: u8 = 0xE0;
/// System Exclusive start.
pub const SYSEX_START: u8 = 0xF0;
/// System Reset realtime message.
pub const SYSTEM_RESET: u8 = 0xFF;

/// Packs a status byte and two data bytes into a short event word.
///
/// # Examples
///
/// ```
/// use synthhost::midi::pack_short;
///
/// assert_eq!(pack_short(0x90, 0x3C, 0x64), 0x00643C90);
/// ```
pub fn pack_short(status: u8, param1: u8, param2: u8) -> u32 {
    status as u32 | (param1 as u32) << 8 | (param2 as u32) << 16
}

/// Splits a short event word into status and data bytes.
pub fn unpack_short(event: u32) -> (u8, u8, u8) {
    (
        (event & 0xFF) as u8,
        ((event >> 8) & 0xFF) as u8,
        ((event >> 16) & 0xFF) as u8,
    )
}

/// Reset flavors a synthesizer understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResetKind {
    /// Plain reset to power-on state.
    Default,
    /// General MIDI System On.
    Gm,
    /// General MIDI 2 System On.
    Gm2,
    /// Roland GS reset.
    Gs,
    /// Yamaha XG System On.
    Xg,
}

impl ResetKind {
    /// Encodes the reset as an in-band System Reset word so it stays ordered
    /// with the events queued around it.
    pub fn to_event(self) -> u32 {
        let code = match self {
            ResetKind::Default => 0,
            ResetKind::Gm => 1,
            ResetKind::Gm2 => 2,
            ResetKind::Gs => 3,
            ResetKind::Xg => 4,
        };
        pack_short(SYSTEM_RESET, code, 0)
    }

    /// Decodes the reset flavor carried by a System Reset word.
    pub fn from_event(event: u32) -> Self {
        match unpack_short(event).1 {
            1 => ResetKind::Gm,
            2 => ResetKind::Gm2,
            3 => ResetKind::Gs,
            4 => ResetKind::Xg,
            _ => ResetKind::Default,
        }
    }
}

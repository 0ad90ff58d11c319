//! Running-status reconstruction and channel-voice message typing.

use super::{
    pack_short, unpack_short, CHANNEL_PRESSURE, CONTROL_CHANGE, NOTE_OFF, NOTE_ON, PITCH_BEND,
    POLY_PRESSURE, PROGRAM_CHANGE,
};

/// Center value of a 14-bit pitch bend.
pub const PITCH_BEND_CENTER: u16 = 0x2000;

/// Per-connection running status.
///
/// Senders may omit a status byte that repeats the previous one. A word
/// whose low byte has its high bit clear is therefore data-only and is
/// rebuilt with the stored status.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunningStatus {
    status: Option<u8>,
}

impl RunningStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the full event for `event`, or `None` for data with no
    /// status to inherit.
    pub fn apply(&mut self, event: u32) -> Option<u32> {
        let status = (event & 0xFF) as u8;
        if status & 0x80 == 0 {
            let stored = self.status?;
            return Some((event << 8) & 0x00FF_FF00 | stored as u32);
        }
        match status {
            0x80..=0xEF => self.status = Some(status),
            // system common cancels running status, realtime leaves it alone
            0xF0..=0xF7 => self.status = None,
            _ => {}
        }
        Some(event)
    }

    /// Forgets the stored status.
    pub fn clear(&mut self) {
        self.status = None;
    }
}

/// A decoded short event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MidiMessage {
    NoteOff { channel: u8, key: u8, velocity: u8 },
    NoteOn { channel: u8, key: u8, velocity: u8 },
    PolyPressure { channel: u8, key: u8, pressure: u8 },
    ControlChange { channel: u8, controller: u8, value: u8 },
    ProgramChange { channel: u8, program: u8 },
    ChannelPressure { channel: u8, pressure: u8 },
    /// 14-bit bend, 0x2000 is center.
    PitchBend { channel: u8, value: u16 },
    /// Any system common or realtime status, with its raw data bytes.
    System { status: u8, data1: u8, data2: u8 },
}

impl MidiMessage {
    /// Types a packed word that already carries a status byte.
    ///
    /// A Note On with velocity 0 decodes as a Note Off. Returns `None` for
    /// a data-only word.
    pub fn decode(event: u32) -> Option<Self> {
        let (status, data1, data2) = unpack_short(event);
        if status & 0x80 == 0 {
            return None;
        }
        let channel = status & 0x0F;
        let (key, value) = (data1 & 0x7F, data2 & 0x7F);
        Some(match status & 0xF0 {
            NOTE_OFF => MidiMessage::NoteOff {
                channel,
                key,
                velocity: value,
            },
            NOTE_ON if value == 0 => MidiMessage::NoteOff {
                channel,
                key,
                velocity: 0,
            },
            NOTE_ON => MidiMessage::NoteOn {
                channel,
                key,
                velocity: value,
            },
            POLY_PRESSURE => MidiMessage::PolyPressure {
                channel,
                key,
                pressure: value,
            },
            CONTROL_CHANGE => MidiMessage::ControlChange {
                channel,
                controller: key,
                value,
            },
            PROGRAM_CHANGE => MidiMessage::ProgramChange {
                channel,
                program: key,
            },
            CHANNEL_PRESSURE => MidiMessage::ChannelPressure {
                channel,
                pressure: key,
            },
            PITCH_BEND => MidiMessage::PitchBend {
                channel,
                value: (value as u16) << 7 | key as u16,
            },
            _ => MidiMessage::System {
                status,
                data1,
                data2,
            },
        })
    }

    /// Channel of a channel-voice message.
    pub fn channel(&self) -> Option<u8> {
        match *self {
            MidiMessage::NoteOff { channel, .. }
            | MidiMessage::NoteOn { channel, .. }
            | MidiMessage::PolyPressure { channel, .. }
            | MidiMessage::ControlChange { channel, .. }
            | MidiMessage::ProgramChange { channel, .. }
            | MidiMessage::ChannelPressure { channel, .. }
            | MidiMessage::PitchBend { channel, .. } => Some(channel),
            MidiMessage::System { .. } => None,
        }
    }

    /// Packs the message back into a short event word.
    pub fn encode(&self) -> u32 {
        match *self {
            MidiMessage::NoteOff {
                channel,
                key,
                velocity,
            } => pack_short(NOTE_OFF | channel, key, velocity),
            MidiMessage::NoteOn {
                channel,
                key,
                velocity,
            } => pack_short(NOTE_ON | channel, key, velocity),
            MidiMessage::PolyPressure {
                channel,
                key,
                pressure,
            } => pack_short(POLY_PRESSURE | channel, key, pressure),
            MidiMessage::ControlChange {
                channel,
                controller,
                value,
            } => pack_short(CONTROL_CHANGE | channel, controller, value),
            MidiMessage::ProgramChange { channel, program } => {
                pack_short(PROGRAM_CHANGE | channel, program, 0)
            }
            MidiMessage::ChannelPressure { channel, pressure } => {
                pack_short(CHANNEL_PRESSURE | channel, pressure, 0)
            }
            MidiMessage::PitchBend { channel, value } => pack_short(
                PITCH_BEND | channel,
                (value & 0x7F) as u8,
                ((value >> 7) & 0x7F) as u8,
            ),
            MidiMessage::System {
                status,
                data1,
                data2,
            } => pack_short(status, data1, data2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_status_inherits_previous_status() {
        let mut running = RunningStatus::new();
        let first = running.apply(0x00044A90).unwrap();
        assert_eq!(
            MidiMessage::decode(first),
            Some(MidiMessage::NoteOn {
                channel: 0,
                key: 0x4A,
                velocity: 0x04
            })
        );

        let second = running.apply(0x00007F7F).unwrap();
        assert_eq!(second, 0x007F7F90);
        assert_eq!(
            MidiMessage::decode(second),
            Some(MidiMessage::NoteOn {
                channel: 0,
                key: 0x7F,
                velocity: 0x7F
            })
        );
    }

    #[test]
    fn test_data_without_status_is_dropped() {
        let mut running = RunningStatus::new();
        assert_eq!(running.apply(0x00007F40), None);
    }

    #[test]
    fn test_realtime_keeps_and_system_common_clears_status() {
        let mut running = RunningStatus::new();
        running.apply(0x000040B2);
        running.apply(0xF8);
        assert_eq!(running.apply(0x00007F10), Some(0x007F_10B2));
        running.apply(0xF6);
        assert_eq!(running.apply(0x00007F10), None);
    }

    #[test]
    fn test_note_on_zero_velocity_is_note_off() {
        assert_eq!(
            MidiMessage::decode(0x00003C93),
            Some(MidiMessage::NoteOff {
                channel: 3,
                key: 0x3C,
                velocity: 0
            })
        );
    }

    #[test]
    fn test_pitch_bend_combines_fourteen_bits() {
        // lsb 0x00, msb 0x40 -> center
        assert_eq!(
            MidiMessage::decode(0x004000E1),
            Some(MidiMessage::PitchBend {
                channel: 1,
                value: PITCH_BEND_CENTER
            })
        );
        assert_eq!(
            MidiMessage::decode(0x007F7FE0),
            Some(MidiMessage::PitchBend {
                channel: 0,
                value: 0x3FFF
            })
        );
    }

    #[test]
    fn test_encode_matches_decode() {
        for event in [0x00643C90u32, 0x000007B5, 0x000005C2, 0x004000EF, 0x000000FF] {
            let message = MidiMessage::decode(event).unwrap();
            assert_eq!(message.encode(), event);
        }
    }
}

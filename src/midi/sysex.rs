//! System Exclusive decoding.
//!
//! Handles Roland GS parameter writes (DT1) with their checksum, the
//! universal GM on/off messages and master volume, stream transport commands
//! (universal non-realtime and MIDI machine control) and Yamaha XG System
//! On. Everything else is reported as [`SysExError::NotSupported`].
//!
//! A Roland DT1 message looks like
//!
//! ```text
//! F0 41 <dev> 42 12 <addr hi> <addr mid> <addr lo> <data ...> <checksum> F7
//! ```
//!
//! The data bytes are written starting at the address, which advances by
//! the length of each parameter record. The checksum brings the 7-bit sum of
//! the address and data bytes to zero.

use super::ResetKind;
use crate::error::SysExError;

const EOX: u8 = 0xF7;

const ID_ROLAND: u8 = 0x41;
const ID_YAMAHA: u8 = 0x43;
const ID_UNIVERSAL_NON_REALTIME: u8 = 0x7E;
const ID_UNIVERSAL_REALTIME: u8 = 0x7F;

const ROLAND_MODEL_GS: u8 = 0x42;
const ROLAND_CMD_DT1: u8 = 0x12;

/// Address of the GS reset parameter.
const GS_RESET_ADDRESS: u32 = address(0x40, 0x00, 0x7F);

const fn address(hi: u8, mid: u8, lo: u8) -> u32 {
    (hi as u32) << 14 | (mid as u32) << 7 | lo as u32
}

/// Which part of the synthesizer a parameter applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamScope {
    Global,
    Channel(u8),
}

/// A synthesizer parameter decoded from a SysEx message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthParam {
    /// Offset from A440 in tenths of a cent (-1000..=1000).
    MasterTune(i16),
    MasterVolume(u8),
    /// Semitones (-24..=24).
    MasterKeyShift(i8),
    /// 0x40 is center; 0 is random.
    MasterPan(u8),
    ReverbMacro(u8),
    ReverbCharacter(u8),
    ReverbPreLpf(u8),
    ReverbLevel(u8),
    ReverbTime(u8),
    ReverbDelayFeedback(u8),
    ChorusMacro(u8),
    ChorusPreLpf(u8),
    ChorusLevel(u8),
    ChorusFeedback(u8),
    ChorusDelay(u8),
    ChorusRate(u8),
    ChorusDepth(u8),
    ChorusSendToReverb(u8),
    /// Sixteen ASCII bytes.
    PatchName([u8; 16]),
    ToneNumber { bank: u8, program: u8 },
    /// Receive channel; 0x10 disables the part.
    RxChannel(u8),
    /// `true` for poly, `false` for mono.
    PolyMode(bool),
    /// 0 = off, 1 = drum map 1, 2 = drum map 2.
    UseForRhythm(u8),
    /// Semitones (-24..=24).
    PitchKeyShift(i8),
    PartLevel(u8),
    PartPan(u8),
    ChorusSend(u8),
    ReverbSend(u8),
    /// Cents (-64..=63) for C through B.
    ScaleTuning([i8; 12]),
}

/// A parameter write together with its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamChange {
    pub scope: ParamScope,
    pub param: SynthParam,
}

impl ParamChange {
    pub fn global(param: SynthParam) -> Self {
        Self {
            scope: ParamScope::Global,
            param,
        }
    }

    pub fn channel(channel: u8, param: SynthParam) -> Self {
        Self {
            scope: ParamScope::Channel(channel),
            param,
        }
    }
}

/// Transport commands carried by MIDI machine control messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportCommand {
    Stop,
    Start,
    Resume,
    Pause,
    Reset,
}

/// What a successfully decoded SysEx message asks the host to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SysExAction {
    /// Parameter writes, in message order.
    Params(Vec<ParamChange>),
    Reset(ResetKind),
    Transport(TransportCommand),
}

/// Computes the Roland checksum of the address and data bytes.
///
/// # Examples
///
/// ```
/// use synthhost::midi::sysex::roland_checksum;
///
/// // GS reset: address 40 00 7F, data 00
/// assert_eq!(roland_checksum(&[0x40, 0x00, 0x7F, 0x00]), 0x41);
/// ```
pub fn roland_checksum(bytes: &[u8]) -> u8 {
    let sum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    (0x80 - (sum % 0x80)) % 0x80
}

/// Checks the framing of a SysEx message without interpreting it.
pub fn validate_frame(message: &[u8]) -> Result<(), SysExError> {
    if message.is_empty() {
        return Err(SysExError::InvalidBuffer("empty buffer"));
    }
    if message.len() < 4 {
        return Err(SysExError::InvalidBuffer("shorter than 4 bytes"));
    }
    if message[0] != 0xF0 {
        return Err(SysExError::InvalidBuffer("missing F0 start byte"));
    }
    if message[message.len() - 1] != EOX {
        return Err(SysExError::InvalidBuffer("missing F7 terminator"));
    }
    if message[1..message.len() - 1].iter().any(|b| b & 0x80 != 0) {
        return Err(SysExError::InvalidBuffer("status byte inside payload"));
    }
    Ok(())
}

/// Decodes one complete SysEx message.
pub fn decode(message: &[u8]) -> Result<SysExAction, SysExError> {
    validate_frame(message)?;
    match message[1] {
        ID_ROLAND => decode_roland(message),
        ID_UNIVERSAL_NON_REALTIME => decode_universal_non_realtime(message),
        ID_UNIVERSAL_REALTIME => decode_universal_realtime(message),
        ID_YAMAHA => decode_yamaha(message),
        _ => Err(SysExError::NotSupported),
    }
}

fn decode_roland(message: &[u8]) -> Result<SysExAction, SysExError> {
    // F0 41 dev model cmd a a a <data> cs F7
    if message.len() < 6 {
        return Err(SysExError::NotSupported);
    }
    if message[3] != ROLAND_MODEL_GS || message[4] != ROLAND_CMD_DT1 {
        return Err(SysExError::NotSupported);
    }
    if message.len() < 11 {
        return Err(SysExError::InvalidBuffer("roland message too short"));
    }

    let body = &message[5..message.len() - 2];
    let found = message[message.len() - 2];
    let (addr_bytes, data) = body.split_at(3);

    let mut sum = addr_bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    let mut addr = address(addr_bytes[0], addr_bytes[1], addr_bytes[2]);
    let mut pending = Vec::new();
    let mut offset = 0;

    while offset < data.len() {
        if addr == GS_RESET_ADDRESS && data[offset] == 0x00 {
            return Ok(SysExAction::Reset(ResetKind::Gs));
        }
        let len = gs_record_len(addr).unwrap_or(1);
        let record = data
            .get(offset..offset + len)
            .ok_or(SysExError::InvalidBuffer("truncated parameter record"))?;
        sum = record.iter().fold(sum, |acc, b| acc.wrapping_add(*b));
        if let Some(change) = decode_gs_record(addr, record) {
            pending.push(change);
        }
        offset += len;
        addr += len as u32;
    }

    let expected = (0x80 - (sum % 0x80)) % 0x80;
    if expected != found {
        return Err(SysExError::Checksum { expected, found });
    }
    Ok(SysExAction::Params(pending))
}

/// Length in bytes of the GS parameter at `addr`, if it is one we know.
fn gs_record_len(addr: u32) -> Option<usize> {
    let [hi, mid, lo] = split_address(addr);
    match (hi, mid, lo) {
        (0x40, 0x00, 0x00) => Some(4),
        (0x40, 0x00, 0x04..=0x06) => Some(1),
        (0x40, 0x01, 0x00) => Some(16),
        (0x40, 0x01, 0x30..=0x3F) => Some(1),
        (0x40, 0x10..=0x1F, 0x00) => Some(2),
        (0x40, 0x10..=0x1F, 0x02 | 0x13 | 0x15 | 0x16 | 0x19 | 0x1C | 0x21 | 0x22) => Some(1),
        (0x40, 0x10..=0x1F, 0x40) => Some(12),
        _ => None,
    }
}

fn split_address(addr: u32) -> [u8; 3] {
    [
        ((addr >> 14) & 0x7F) as u8,
        ((addr >> 7) & 0x7F) as u8,
        (addr & 0x7F) as u8,
    ]
}

/// GS numbers parts 1..16 with part 10 (the drum part) in block 0.
fn gs_part_channel(block: u8) -> u8 {
    match block {
        0 => 9,
        1..=9 => block - 1,
        _ => block,
    }
}

fn decode_gs_record(addr: u32, data: &[u8]) -> Option<ParamChange> {
    let [hi, mid, lo] = split_address(addr);
    let value = data[0];
    let change = match (hi, mid, lo) {
        (0x40, 0x00, 0x00) => {
            let raw = data
                .iter()
                .fold(0i32, |acc, nibble| acc << 4 | (*nibble & 0x0F) as i32);
            let tune = (raw - 0x400).clamp(-1000, 1000) as i16;
            ParamChange::global(SynthParam::MasterTune(tune))
        }
        (0x40, 0x00, 0x04) => ParamChange::global(SynthParam::MasterVolume(value)),
        (0x40, 0x00, 0x05) => {
            ParamChange::global(SynthParam::MasterKeyShift(value as i8 - 0x40))
        }
        (0x40, 0x00, 0x06) => ParamChange::global(SynthParam::MasterPan(value)),
        (0x40, 0x01, 0x00) => {
            let mut name = [0u8; 16];
            name.copy_from_slice(data);
            ParamChange::global(SynthParam::PatchName(name))
        }
        (0x40, 0x01, lo) => {
            let param = match lo {
                0x30 => SynthParam::ReverbMacro(value),
                0x31 => SynthParam::ReverbCharacter(value),
                0x32 => SynthParam::ReverbPreLpf(value),
                0x33 => SynthParam::ReverbLevel(value),
                0x34 => SynthParam::ReverbTime(value),
                0x35 => SynthParam::ReverbDelayFeedback(value),
                0x38 => SynthParam::ChorusMacro(value),
                0x39 => SynthParam::ChorusPreLpf(value),
                0x3A => SynthParam::ChorusLevel(value),
                0x3B => SynthParam::ChorusFeedback(value),
                0x3C => SynthParam::ChorusDelay(value),
                0x3D => SynthParam::ChorusRate(value),
                0x3E => SynthParam::ChorusDepth(value),
                0x3F => SynthParam::ChorusSendToReverb(value),
                _ => return None,
            };
            ParamChange::global(param)
        }
        (0x40, block @ 0x10..=0x1F, lo) => {
            let channel = gs_part_channel(block & 0x0F);
            let param = match lo {
                0x00 => SynthParam::ToneNumber {
                    bank: data[0],
                    program: data[1],
                },
                0x02 => SynthParam::RxChannel(value),
                0x13 => SynthParam::PolyMode(value != 0),
                0x15 => SynthParam::UseForRhythm(value),
                0x16 => SynthParam::PitchKeyShift(value as i8 - 0x40),
                0x19 => SynthParam::PartLevel(value),
                0x1C => SynthParam::PartPan(value),
                0x21 => SynthParam::ChorusSend(value),
                0x22 => SynthParam::ReverbSend(value),
                0x40 => {
                    let mut cents = [0i8; 12];
                    for (cent, raw) in cents.iter_mut().zip(data) {
                        *cent = *raw as i8 - 64;
                    }
                    SynthParam::ScaleTuning(cents)
                }
                _ => return None,
            };
            ParamChange::channel(channel, param)
        }
        _ => return None,
    };
    Some(change)
}

fn decode_universal_non_realtime(message: &[u8]) -> Result<SysExAction, SysExError> {
    match message.get(3..5) {
        // F0 7E dev 09 nn F7
        Some([0x09, 0x01]) => Ok(SysExAction::Reset(ResetKind::Gm)),
        Some([0x09, 0x02]) => Ok(SysExAction::Reset(ResetKind::Default)),
        Some([0x09, 0x03]) => Ok(SysExAction::Reset(ResetKind::Gm2)),
        // F0 7E dev 06 cmd F7
        Some([0x06, command]) => transport(*command),
        _ => Err(SysExError::NotSupported),
    }
}

fn transport(command: u8) -> Result<SysExAction, SysExError> {
    let transport = match command {
        0x01 => TransportCommand::Stop,
        0x02 => TransportCommand::Start,
        0x03 => TransportCommand::Resume,
        0x09 => TransportCommand::Pause,
        0x0D => TransportCommand::Reset,
        _ => return Err(SysExError::NotSupported),
    };
    Ok(SysExAction::Transport(transport))
}

fn decode_universal_realtime(message: &[u8]) -> Result<SysExAction, SysExError> {
    match message.get(3..5) {
        // F0 7F dev 04 01 lsb msb F7
        Some([0x04, 0x01]) => {
            let msb = message
                .get(6)
                .filter(|_| message.len() == 8)
                .ok_or(SysExError::InvalidBuffer("master volume needs two data bytes"))?;
            Ok(SysExAction::Params(vec![ParamChange::global(
                SynthParam::MasterVolume(*msb),
            )]))
        }
        // F0 7F dev 06 cmd F7
        Some([0x06, command]) => transport(*command),
        _ => Err(SysExError::NotSupported),
    }
}

fn decode_yamaha(message: &[u8]) -> Result<SysExAction, SysExError> {
    // F0 43 1n 4C 00 00 7E 00 F7
    if message.len() == 9
        && message[2] & 0xF0 == 0x10
        && message[3..8] == [0x4C, 0x00, 0x00, 0x7E, 0x00]
    {
        Ok(SysExAction::Reset(ResetKind::Xg))
    } else {
        Err(SysExError::NotSupported)
    }
}

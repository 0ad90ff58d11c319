//! Fans decoded events out to synthesis instances.

use super::nps::{ChannelNpsLimiter, RoughClock};
use crate::config::MIDI_CHANNELS;
use crate::midi::{MidiMessage, ParamChange, ParamScope, ResetKind, SYSTEM_RESET};
use crate::synth::SynthInstance;
use std::ops::Range;
use std::sync::Arc;

/// How MIDI channels and keys map onto instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    /// One instance receives every channel.
    Single,
    /// Each channel is spread over `slices` instances by key.
    Split { slices: usize },
}

impl Topology {
    pub fn from_slices(slices: usize) -> Self {
        if slices == 0 {
            Topology::Single
        } else {
            Topology::Split { slices }
        }
    }

    pub fn instance_count(&self) -> usize {
        match *self {
            Topology::Single => 1,
            Topology::Split { slices } => MIDI_CHANNELS * slices,
        }
    }

    /// Instance that plays `key` on `channel`.
    pub fn note_target(&self, channel: u8, key: u8) -> usize {
        match *self {
            Topology::Single => 0,
            Topology::Split { slices } => {
                (channel as usize & 0x0F) * slices + (key as usize % slices)
            }
        }
    }

    /// Every instance serving `channel`.
    pub fn channel_targets(&self, channel: u8) -> Range<usize> {
        match *self {
            Topology::Single => 0..1,
            Topology::Split { slices } => {
                let first = (channel as usize & 0x0F) * slices;
                first..first + slices
            }
        }
    }
}

/// Sends events to the right instances and applies note limiting.
///
/// Owned by the event thread; the limiters are never touched elsewhere.
pub struct EventRouter {
    topology: Topology,
    instances: Vec<Arc<SynthInstance>>,
    limiters: Option<Vec<ChannelNpsLimiter>>,
}

impl EventRouter {
    /// `limit` enables note limiting with the given ceiling and clock.
    pub fn new(
        topology: Topology,
        instances: Vec<Arc<SynthInstance>>,
        limit: Option<(u64, RoughClock)>,
    ) -> Self {
        debug_assert_eq!(instances.len(), topology.instance_count());
        let limiters = limit.map(|(max_nps, clock)| {
            (0..instances.len())
                .map(|_| ChannelNpsLimiter::new(clock.clone(), max_nps))
                .collect()
        });
        Self {
            topology,
            instances,
            limiters,
        }
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    /// Routes a short event that carries a status byte.
    pub fn route(&mut self, event: u32) {
        let Some(message) = MidiMessage::decode(event) else {
            return;
        };
        match message {
            MidiMessage::NoteOn {
                channel,
                key,
                velocity,
            } => {
                let target = self.topology.note_target(channel, key);
                if let Some(limiters) = self.limiters.as_mut() {
                    if !limiters[target].note_on(key, velocity) {
                        tracing::trace!("nps limit dropped note on {}:{}", channel, key);
                        return;
                    }
                }
                self.instances[target].send_event(event);
            }
            MidiMessage::NoteOff { channel, key, .. } => {
                let target = self.topology.note_target(channel, key);
                if let Some(limiters) = self.limiters.as_mut() {
                    if !limiters[target].note_off(key) {
                        return;
                    }
                }
                self.instances[target].send_event(event);
            }
            MidiMessage::System {
                status: SYSTEM_RESET,
                ..
            } => self.reset(ResetKind::from_event(event)),
            MidiMessage::System { .. } => {
                for instance in &self.instances {
                    instance.send_event(event);
                }
            }
            other => {
                // every remaining variant carries a channel
                let channel = other.channel().unwrap_or(0);
                for target in self.topology.channel_targets(channel) {
                    self.instances[target].send_event(event);
                }
            }
        }
    }

    /// Routes a decoded SysEx parameter.
    pub fn route_param(&mut self, change: ParamChange) {
        match change.scope {
            ParamScope::Global => {
                for instance in &self.instances {
                    instance.send_param(change);
                }
            }
            ParamScope::Channel(channel) => {
                for target in self.topology.channel_targets(channel) {
                    self.instances[target].send_param(change);
                }
            }
        }
    }

    /// Resets every instance and forgets every dropped note.
    pub fn reset(&mut self, kind: ResetKind) {
        tracing::debug!("reset ({:?}) across {} instances", kind, self.instances.len());
        for instance in &self.instances {
            instance.reset_stream(kind);
        }
        if let Some(limiters) = self.limiters.as_mut() {
            limiters.iter_mut().for_each(ChannelNpsLimiter::reset);
        }
    }
}

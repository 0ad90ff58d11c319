//! Lock-free single-producer/single-consumer event rings.
//!
//! [`ev_buf`] wraps an `rtrb` ring split into an [`EvProducer`] and an
//! [`EvConsumer`]. Neither handle is `Clone`, so the one-producer/
//! one-consumer contract is enforced by ownership instead of by locking.
//!
//! [`event_queue`] pairs a short-event ring with a byte ring so SysEx
//! messages travel in order with the short events around them.

use super::sysex;
use rtrb::{Consumer, Producer, RingBuffer};

/// Marker written to the short ring for every queued long event.
pub const LONG_EVENT_MARKER: u32 = 0xF0;

/// SysEx terminator byte.
const EOX: u8 = 0xF7;

/// Creates a ring with `capacity` slots, of which `capacity - 1` are usable.
///
/// # Panics
///
/// Panics if `capacity` is less than 2.
pub fn ev_buf<T: Copy + Send>(capacity: usize) -> (EvProducer<T>, EvConsumer<T>) {
    assert!(capacity >= 2, "ring capacity must be at least 2");
    let (producer, consumer) = RingBuffer::new(capacity - 1);
    (EvProducer { inner: producer }, EvConsumer { inner: consumer })
}

/// Writing half of a ring.
pub struct EvProducer<T> {
    inner: Producer<T>,
}

impl<T: Copy> EvProducer<T> {
    /// Appends one item. Returns `false` and drops the item if the ring is
    /// full; never blocks.
    pub fn write(&mut self, item: T) -> bool {
        self.inner.push(item).is_ok()
    }

    /// Appends every item of `items`, or none of them if they do not all fit.
    pub fn write_all(&mut self, items: &[T]) -> bool {
        match self.inner.write_chunk_uninit(items.len()) {
            Ok(chunk) => {
                chunk.fill_from_iter(items.iter().copied());
                true
            }
            Err(_) => false,
        }
    }

    /// Slots that can be written right now.
    pub fn free(&self) -> usize {
        self.inner.slots()
    }
}

/// Reading half of a ring.
pub struct EvConsumer<T> {
    inner: Consumer<T>,
}

impl<T: Copy> EvConsumer<T> {
    /// Removes and returns the oldest item, or `None` when empty.
    pub fn read(&mut self) -> Option<T> {
        self.inner.pop().ok()
    }

    /// Returns the oldest item without consuming it.
    pub fn peek(&self) -> Option<T> {
        self.inner.peek().ok().copied()
    }
}

/// One complete `F0 .. F7` message drained from a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LongEvent {
    data: Vec<u8>,
}

impl LongEvent {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }
}

/// An item read back from an [`EventReader`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueuedEvent {
    Short(u32),
    Long(LongEvent),
}

/// Producer side of a short + long event queue.
pub struct EventWriter {
    events: EvProducer<u32>,
    bytes: EvProducer<u8>,
}

/// Consumer side of a short + long event queue.
pub struct EventReader {
    events: EvConsumer<u32>,
    bytes: EvConsumer<u8>,
    max_long_len: usize,
}

/// Creates a paired event queue.
///
/// `max_long_len` bounds the size of a [`LongEvent`]; longer messages are
/// drained and discarded by the reader.
pub fn event_queue(
    short_capacity: usize,
    long_capacity: usize,
    max_long_len: usize,
) -> (EventWriter, EventReader) {
    let (events_tx, events_rx) = ev_buf(short_capacity);
    let (bytes_tx, bytes_rx) = ev_buf(long_capacity);
    (
        EventWriter {
            events: events_tx,
            bytes: bytes_tx,
        },
        EventReader {
            events: events_rx,
            bytes: bytes_rx,
            max_long_len,
        },
    )
}

impl EventWriter {
    /// Queues a packed short event. Words carrying a SysEx status are
    /// refused since they would be mistaken for the long-event marker.
    pub fn write_short(&mut self, event: u32) -> bool {
        if event & 0xFF == LONG_EVENT_MARKER || event & 0xFF == EOX as u32 {
            return false;
        }
        self.events.write(event)
    }

    /// Queues a framed SysEx message. Either the whole message and its
    /// marker are queued, or nothing is. Messages that are not a single
    /// `F0 .. F7` frame are refused, since the reader splits on `F7`.
    pub fn write_long(&mut self, message: &[u8]) -> bool {
        if let Err(e) = sysex::validate_frame(message) {
            tracing::warn!("refusing {} byte long event: {}", message.len(), e);
            return false;
        }
        if self.events.free() == 0 || !self.bytes.write_all(message) {
            return false;
        }
        // The marker slot was checked above and only this side fills slots.
        self.events.write(LONG_EVENT_MARKER)
    }
}

impl EventReader {
    /// Reads the next event. Over-long SysEx messages are skipped.
    pub fn read(&mut self) -> Option<QueuedEvent> {
        loop {
            let word = self.events.read()?;
            if word != LONG_EVENT_MARKER {
                return Some(QueuedEvent::Short(word));
            }
            if let Some(long) = self.read_long() {
                return Some(QueuedEvent::Long(long));
            }
        }
    }

    // Pulls one message out of the byte ring. Each byte is peeked first and
    // only consumed once it is known not to be the terminator, so the read
    // head never moves past the end of this message.
    fn read_long(&mut self) -> Option<LongEvent> {
        let mut data = Vec::with_capacity(64);
        let mut overflow = false;
        loop {
            match self.bytes.peek() {
                Some(EOX) => {
                    self.bytes.read();
                    if data.len() < self.max_long_len {
                        data.push(EOX);
                    } else {
                        overflow = true;
                    }
                    break;
                }
                Some(byte) => {
                    self.bytes.read();
                    if data.len() + 1 < self.max_long_len {
                        data.push(byte);
                    } else {
                        overflow = true;
                    }
                }
                None => {
                    tracing::warn!("long event truncated after {} bytes", data.len());
                    return None;
                }
            }
        }
        if overflow {
            tracing::warn!(
                "dropping sysex longer than {} bytes",
                self.max_long_len
            );
            return None;
        }
        Some(LongEvent::new(data))
    }
}

//! Input event feeder
//!
//! Reads Linux `struct input_event` records (64-bit layout, native byte
//! order) from an evdev node or any other reader and publishes them into the
//! input event ring. Sync markers are filtered by the ring itself.

use std::io::{ErrorKind, Read};

use cell_comms::event::{EventProducer, InputEvent, InputEventBuffer, INPUT_EVENT_SLOTS};
use cell_comms::Notify;

use crate::error::Result;

/// `sizeof(struct input_event)` on a 64-bit host
pub const LINUX_EVENT_SIZE: usize = 24;

/// Decode one raw `input_event`
pub fn parse_input_event(raw: &[u8; LINUX_EVENT_SIZE]) -> InputEvent {
    let word = |at: usize| {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&raw[at..at + 8]);
        i64::from_ne_bytes(bytes)
    };
    let sec = u64::try_from(word(0)).unwrap_or(0);
    let usec = u64::try_from(word(8)).unwrap_or(0);

    InputEvent {
        time_us: sec.saturating_mul(1_000_000).saturating_add(usec),
        kind: u16::from_ne_bytes([raw[16], raw[17]]),
        code: u16::from_ne_bytes([raw[18], raw[19]]),
        value: i32::from_ne_bytes([raw[20], raw[21], raw[22], raw[23]]),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedStats {
    pub read: u64,
    pub published: u64,
    pub filtered: u64,
}

/// Copies events from `reader` into the ring
pub struct InputFeeder<'a, R, N: Notify> {
    reader: R,
    producer: EventProducer<'a, InputEvent, INPUT_EVENT_SLOTS, N>,
    stats: FeedStats,
    echo: bool,
}

impl<'a, R: Read, N: Notify> InputFeeder<'a, R, N> {
    pub fn new(reader: R, ring: &'a InputEventBuffer, notify: N) -> Self {
        Self {
            reader,
            producer: EventProducer::new(ring, notify),
            stats: FeedStats::default(),
            echo: false,
        }
    }

    /// Log every event read at info level
    pub fn set_echo(&mut self, echo: bool) {
        self.echo = echo;
    }

    pub fn stats(&self) -> FeedStats {
        self.stats
    }

    /// Forward a single event
    ///
    /// # Returns
    /// `false` once the reader is exhausted
    ///
    /// # Errors
    /// Any read error other than a clean end of stream
    pub fn feed_one(&mut self) -> Result<bool> {
        let mut raw = [0u8; LINUX_EVENT_SIZE];
        match self.reader.read_exact(&mut raw) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(false),
            Err(err) => return Err(err.into()),
        }

        let event = parse_input_event(&raw);
        self.stats.read += 1;
        if self.echo {
            log::info!(
                "type {:#x} code {} value {} @ {}us",
                event.kind,
                event.code,
                event.value,
                event.time_us
            );
        }

        if self.producer.publish(event) {
            self.stats.published += 1;
        } else {
            self.stats.filtered += 1;
        }
        Ok(true)
    }

    /// Forward events until the reader ends
    pub fn run(&mut self) -> Result<FeedStats> {
        while self.feed_one()? {}
        log::info!(
            "input ended: {} read, {} forwarded",
            self.stats.read,
            self.stats.published
        );
        Ok(self.stats)
    }
}

//! Event Delivery Channel - lossy one-directional ring
//!
//! The producer writes one fixed-shape record per event at the write cursor
//! and moves on; there is no acknowledgement and no backpressure. A consumer
//! that falls more than `N` records behind loses the oldest ones.
//!
//! Each slot is stamped with the low 31 bits of the cursor value of the
//! record it holds. The [`BUSY`] bit is set in the stamp while the record is
//! rewritten, so a reader that races with an overwrite notices it and drops
//! the record instead of returning a mixture of two events.

use core::cell::UnsafeCell;
use core::mem::size_of;
use core::sync::atomic::{fence, AtomicU32, Ordering};

use static_assertions::const_assert;

use crate::abi::WireStruct;
use crate::layout::EVENT_WINDOW_SIZE;
use crate::notify::Notify;
use crate::region::SharedLayout;

/// Stamp bit of a slot that is being rewritten
pub const BUSY: u32 = 1 << 31;

/// Stamp of the record written at `cursor`; never has [`BUSY`] set
const fn stamp_of(cursor: u32) -> u32 {
    cursor & !BUSY
}

/// Input events the ring holds
pub const INPUT_EVENT_SLOTS: usize = 128;

/// Record type carried by an event ring
pub trait EventRecord: WireStruct + Send {
    /// Records that carry no information are dropped by the producer
    fn is_forwardable(&self) -> bool {
        true
    }
}

#[repr(C)]
pub struct EventSlot<T> {
    stamp: AtomicU32,
    record: UnsafeCell<T>,
}

/// Event ring header plus slots, as laid out in the shared window
#[repr(C)]
pub struct EventBuffer<T, const N: usize> {
    write_cursor: AtomicU32,
    /// Consumer progress, informational only
    read_cursor: AtomicU32,
    slots: [EventSlot<T>; N],
}

// Single writer per slot, readers validate with the stamp.
unsafe impl<T: EventRecord, const N: usize> Sync for EventBuffer<T, N> {}

unsafe impl<T: EventRecord, const N: usize> SharedLayout for EventBuffer<T, N> {
    const NAME: &'static str = "event buffer";
}

impl<T: EventRecord, const N: usize> EventBuffer<T, N> {
    const CAPACITY: u32 = {
        assert!(N.is_power_of_two(), "event ring size must be power of 2");
        N as u32
    };

    pub fn write_cursor(&self) -> u32 {
        self.write_cursor.load(Ordering::Acquire)
    }

    /// Records published but not yet taken by the consumer
    pub fn backlog(&self) -> u32 {
        self.write_cursor()
            .wrapping_sub(self.read_cursor.load(Ordering::Relaxed))
            .min(Self::CAPACITY)
    }

    fn slot(&self, cursor: u32) -> &EventSlot<T> {
        &self.slots[cursor as usize % N]
    }
}

/// Producer end of an event ring
///
/// Only one producer may exist per ring.
pub struct EventProducer<'a, T, const N: usize, Nt: Notify> {
    buf: &'a EventBuffer<T, N>,
    cursor: u32,
    notify: Nt,
}

impl<'a, T: EventRecord, const N: usize, Nt: Notify> EventProducer<'a, T, N, Nt> {
    /// Attach to a ring, continuing from its current write cursor
    pub fn new(buf: &'a EventBuffer<T, N>, notify: Nt) -> Self {
        Self {
            cursor: buf.write_cursor(),
            buf,
            notify,
        }
    }

    /// Publish one record
    ///
    /// # Returns
    /// `false` if the record was filtered out at the source
    pub fn publish(&mut self, record: T) -> bool {
        if !record.is_forwardable() {
            return false;
        }

        let slot = self.buf.slot(self.cursor);
        slot.stamp.store(BUSY, Ordering::Relaxed);
        fence(Ordering::Release);
        // SAFETY: this producer is the only writer of the slot.
        unsafe { core::ptr::write_volatile(slot.record.get(), record) };
        slot.stamp.store(stamp_of(self.cursor), Ordering::Release);

        self.cursor = self.cursor.wrapping_add(1);
        self.buf.write_cursor.store(self.cursor, Ordering::Release);
        self.notify.notify();
        true
    }
}

/// Consumer end of an event ring
pub struct EventConsumer<'a, T, const N: usize> {
    buf: &'a EventBuffer<T, N>,
    next: u32,
    lost: u64,
}

impl<'a, T: EventRecord, const N: usize> EventConsumer<'a, T, N> {
    /// Attach to a ring; only records published from now on are seen
    pub fn new(buf: &'a EventBuffer<T, N>) -> Self {
        Self {
            next: buf.write_cursor(),
            buf,
            lost: 0,
        }
    }

    /// Attach to a ring and replay whatever it still holds
    pub fn from_start(buf: &'a EventBuffer<T, N>) -> Self {
        Self {
            next: buf.read_cursor.load(Ordering::Relaxed),
            buf,
            lost: 0,
        }
    }

    /// Records overwritten before this consumer got to them
    pub fn lost(&self) -> u64 {
        self.lost
    }

    /// Take the next record, if any
    pub fn poll(&mut self) -> Option<T> {
        loop {
            let write = self.buf.write_cursor();
            if self.next == write {
                return None;
            }

            let behind = write.wrapping_sub(self.next);
            if behind > EventBuffer::<T, N>::CAPACITY {
                let oldest = write.wrapping_sub(EventBuffer::<T, N>::CAPACITY);
                self.skip_to(oldest);
            }

            let cursor = self.next;
            let slot = self.buf.slot(cursor);
            let before = slot.stamp.load(Ordering::Acquire);
            if before == stamp_of(cursor) {
                // SAFETY: validated by re-reading the stamp below.
                let record = unsafe { core::ptr::read_volatile(slot.record.get()) };
                fence(Ordering::Acquire);
                if slot.stamp.load(Ordering::Relaxed) == before {
                    self.advance(cursor.wrapping_add(1));
                    return Some(record);
                }
            }

            // A newer lap reached this slot first.
            self.skip_to(cursor.wrapping_add(1));
        }
    }

    fn skip_to(&mut self, cursor: u32) {
        let skipped = cursor.wrapping_sub(self.next);
        self.lost += u64::from(skipped);
        log::warn!("event ring overrun: {skipped} record(s) lost");
        self.advance(cursor);
    }

    fn advance(&mut self, cursor: u32) {
        self.next = cursor;
        self.buf.read_cursor.store(cursor, Ordering::Relaxed);
    }
}

impl<T: EventRecord, const N: usize> Iterator for EventConsumer<'_, T, N> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.poll()
    }
}

pub const EV_SYN: u16 = 0x00;
pub const EV_KEY: u16 = 0x01;
pub const EV_REL: u16 = 0x02;
pub const EV_ABS: u16 = 0x03;

/// Input event delivered to the bare-metal cell
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputEvent {
    pub time_us: u64,
    pub kind: u16,
    pub code: u16,
    pub value: i32,
}

unsafe impl WireStruct for InputEvent {}

impl EventRecord for InputEvent {
    fn is_forwardable(&self) -> bool {
        // Sync markers carry nothing the guest can use.
        self.kind != EV_SYN
    }
}

pub type InputEventBuffer = EventBuffer<InputEvent, INPUT_EVENT_SLOTS>;

const_assert!(size_of::<InputEventBuffer>() <= EVENT_WINDOW_SIZE);

//! Frame Handoff Buffer - latest-wins video/audio handoff
//!
//! The producer (the bare-metal display/audio path) overwrites a single
//! descriptor in place and never waits for the consumer. Each rewrite of the
//! descriptor and its frame number is bracketed by a sequence counter that
//! is odd while the write is in progress (a seqlock), so the consumer (the
//! host encoder) only accepts a descriptor and frame number written by the
//! same publish. It compares frame numbers to detect new frames and counts
//! the ones it missed.

use core::cell::UnsafeCell;
use core::sync::atomic::{fence, AtomicU32, Ordering};

use static_assertions::const_assert;

use crate::abi::WireStruct;
use crate::call::Param;
use crate::layout::MEDIA_WINDOW_SIZE;
use crate::region::SharedLayout;

pub const AUDIO_SAMPLE_RATE: u32 = 48_000;
pub const AUDIO_SAMPLE_BYTES: u32 = 2;
pub const AUDIO_CHANNELS: u32 = 2;

/// Single-slot handoff of descriptor `D`
#[repr(C)]
pub struct FrameChannel<D> {
    frame_no: AtomicU32,
    /// Odd while the producer is rewriting `frame_no` and `desc`
    seq: AtomicU32,
    desc: UnsafeCell<D>,
}

unsafe impl<D: WireStruct + Send> Sync for FrameChannel<D> {}

impl<D: WireStruct> FrameChannel<D> {
    /// Number of the most recently published frame (0 = none yet)
    pub fn frame_no(&self) -> u32 {
        self.frame_no.load(Ordering::Acquire)
    }

    /// Read the descriptor together with its frame number, retrying while
    /// the producer is rewriting them
    fn read_stable(&self) -> (u32, D) {
        loop {
            let seq = self.seq.load(Ordering::Acquire);
            if seq & 1 == 0 {
                let frame_no = self.frame_no.load(Ordering::Relaxed);
                // SAFETY: discarded unless the sequence is unchanged below.
                let desc = unsafe { core::ptr::read_volatile(self.desc.get()) };
                fence(Ordering::Acquire);
                if self.seq.load(Ordering::Relaxed) == seq {
                    return (frame_no, desc);
                }
            }
            core::hint::spin_loop();
        }
    }
}

/// Publishing end of a frame channel
pub struct FrameProducer<'a, D> {
    chan: &'a FrameChannel<D>,
    frame_no: u32,
}

impl<'a, D: WireStruct> FrameProducer<'a, D> {
    /// Attach, continuing the frame numbering already in the channel
    pub fn new(chan: &'a FrameChannel<D>) -> Self {
        Self {
            frame_no: chan.frame_no(),
            chan,
        }
    }

    /// Publish a new frame descriptor
    ///
    /// # Returns
    /// The frame number assigned to it
    pub fn publish(&mut self, desc: D) -> u32 {
        self.frame_no = self.frame_no.wrapping_add(1);

        // An odd value left by a producer that died mid-write is reused.
        let begin = self.chan.seq.load(Ordering::Relaxed) | 1;
        self.chan.seq.store(begin, Ordering::Relaxed);
        fence(Ordering::Release);
        // SAFETY: single producer per channel.
        unsafe { core::ptr::write_volatile(self.chan.desc.get(), desc) };
        self.chan.frame_no.store(self.frame_no, Ordering::Relaxed);
        self.chan.seq.store(begin.wrapping_add(1), Ordering::Release);

        self.frame_no
    }
}

/// A frame the consumer has not seen yet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameUpdate<D> {
    pub frame_no: u32,
    pub desc: D,
    /// Frames published since the previous update that were never observed
    pub dropped: u32,
}

/// Consuming end of a frame channel
pub struct FrameConsumer<'a, D> {
    chan: &'a FrameChannel<D>,
    last: u32,
    dropped_total: u64,
    label: &'static str,
}

impl<'a, D: WireStruct> FrameConsumer<'a, D> {
    /// Attach, treating every frame already published as seen
    pub fn new(chan: &'a FrameChannel<D>, label: &'static str) -> Self {
        Self {
            last: chan.frame_no(),
            chan,
            dropped_total: 0,
            label,
        }
    }

    /// Attach before the producer starts; the first frame is frame 1
    pub fn from_start(chan: &'a FrameChannel<D>, label: &'static str) -> Self {
        Self {
            chan,
            last: 0,
            dropped_total: 0,
            label,
        }
    }

    pub fn has_new(&self) -> bool {
        self.chan.frame_no() != self.last
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total
    }

    pub fn last_frame(&self) -> u32 {
        self.last
    }

    /// Take the newest frame if it differs from the last one seen
    pub fn poll(&mut self) -> Option<FrameUpdate<D>> {
        if !self.has_new() {
            return None;
        }

        let (frame_no, desc) = self.chan.read_stable();
        let dropped = frame_no.wrapping_sub(self.last).saturating_sub(1);
        if dropped > 0 {
            log::warn!("{} frame drop {}->{}", self.label, self.last, frame_no);
            self.dropped_total += u64::from(dropped);
        }
        self.last = frame_no;

        Some(FrameUpdate {
            frame_no,
            desc,
            dropped,
        })
    }
}

/// Video frame: separate luma and chroma planes in bare-metal memory
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VideoFrame {
    pub luma: Param,
    pub chroma: Param,
    pub width: u32,
    pub height: u32,
}

unsafe impl WireStruct for VideoFrame {}

/// Audio frame: interleaved 16-bit stereo samples
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AudioFrame {
    pub buffer: Param,
    pub size: u32,
    pub _pad: u32,
}

unsafe impl WireStruct for AudioFrame {}

impl AudioFrame {
    /// Samples per channel in this frame
    pub fn samples(&self) -> u32 {
        self.size / AUDIO_SAMPLE_BYTES / AUDIO_CHANNELS
    }
}

/// Media handoff window: recording switch plus video and audio channels
#[repr(C)]
pub struct MediaPort {
    enabled: AtomicU32,
    pub video: FrameChannel<VideoFrame>,
    pub audio: FrameChannel<AudioFrame>,
}

unsafe impl SharedLayout for MediaPort {
    const NAME: &'static str = "media port";
}

const_assert!(core::mem::size_of::<MediaPort>() <= MEDIA_WINDOW_SIZE);

impl MediaPort {
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire) != 0
    }

    /// Start or stop recording (bare-metal side)
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(u32::from(enabled), Ordering::Release);
    }
}

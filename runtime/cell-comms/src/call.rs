//! Call Channel - synchronous RPC from the bare-metal cell to the host libc
//!
//! # Wire format
//! One [`CallBuffer`] per system: a readiness sentinel, a free-running write
//! and read cursor, and [`CALL_SLOTS`] fixed-size [`CallSlot`]s. Each slot
//! carries an operation id, four argument words, the return word, the host
//! error number and a scratch buffer for translated compound results.
//!
//! # Slot ownership
//! Every slot moves through `Free → Claimed → Pending → Done → Free`:
//! - a client claims the slot at the write cursor (under the claim lock
//!   word in the header) and only after the previous occupant released it,
//!   so a wrapped writer can never overwrite an in-flight call
//! - the client fills in the arguments and publishes `Pending`; the server
//!   never dequeues a slot that is not `Pending`
//! - the server writes the results and publishes `Done`
//! - the client copies the results out and publishes `Free`
//!
//! The state word is always written last with release ordering, which is
//! what makes the rest of the slot visible to the other side.

use core::cell::UnsafeCell;
use core::mem::{offset_of, size_of};
use core::sync::atomic::{AtomicU32, Ordering};

use static_assertions::const_assert;

use crate::abi::Errno;
use crate::layout::CALL_WINDOW_SIZE;
use crate::notify::Notify;
use crate::region::SharedLayout;
use crate::{CommsError, Result};

/// Argument word, as wide as a bare-metal pointer
#[cfg(not(feature = "narrow-params"))]
pub type Param = u64;
#[cfg(not(feature = "narrow-params"))]
pub type SignedParam = i64;

/// Argument word, as wide as a bare-metal pointer
#[cfg(feature = "narrow-params")]
pub type Param = u32;
#[cfg(feature = "narrow-params")]
pub type SignedParam = i32;

/// Number of call slots in the ring
pub const CALL_SLOTS: usize = 32;

/// Argument words per call
pub const ARG_COUNT: usize = 4;

/// Bytes of scratch space per slot for translated results
pub const SCRATCH_SIZE: usize = 384;

/// Written by the server once its mappings are in place
pub const READY_MAGIC: u32 = 0x0013_7590;

const_assert!(CALL_SLOTS.is_power_of_two());

/// Host operations reachable through the channel
///
/// Discriminants are the wire ids.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Write = 0,
    Read = 1,
    Lseek = 2,
    Fstat = 3,
    Open = 4,
    Close = 5,
    Unlink = 6,
    Opendir = 7,
    Closedir = 8,
    Readdir = 9,
    Chdir = 10,
    Getcwd = 11,
    Stat = 12,
    Rename = 13,
    Mkdir = 14,
    Rmdir = 15,
    Wait = 16,
    ForkPtyExec = 17,
    System = 18,
    GetTimeOfDay = 19,
}

/// Kind of a logical call argument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// Plain integer (descriptor, flags, offset, opaque handle)
    Int,
    /// Pointer into the bare-metal cell's memory
    Ptr,
    /// Pointer plus length; occupies two words
    Buf,
}

impl ArgKind {
    pub const fn words(self) -> usize {
        match self {
            Self::Int | Self::Ptr => 1,
            Self::Buf => 2,
        }
    }
}

impl OpCode {
    pub const ALL: [Self; 20] = [
        Self::Write,
        Self::Read,
        Self::Lseek,
        Self::Fstat,
        Self::Open,
        Self::Close,
        Self::Unlink,
        Self::Opendir,
        Self::Closedir,
        Self::Readdir,
        Self::Chdir,
        Self::Getcwd,
        Self::Stat,
        Self::Rename,
        Self::Mkdir,
        Self::Rmdir,
        Self::Wait,
        Self::ForkPtyExec,
        Self::System,
        Self::GetTimeOfDay,
    ];

    pub fn from_raw(raw: u32) -> Option<Self> {
        Self::ALL.get(raw as usize).copied()
    }

    pub const fn raw(self) -> u32 {
        self as u32
    }

    /// Argument kinds, in wire order
    pub const fn signature(self) -> &'static [ArgKind] {
        use ArgKind::{Buf, Int, Ptr};
        match self {
            Self::Write | Self::Read => &[Int, Buf],
            Self::Lseek => &[Int, Int, Int],
            Self::Fstat => &[Int, Ptr],
            Self::Open => &[Ptr, Int, Int],
            Self::Close | Self::Closedir | Self::Readdir => &[Int],
            Self::Unlink | Self::Opendir | Self::Chdir | Self::Rmdir | Self::System => &[Ptr],
            Self::Getcwd => &[Buf],
            Self::Stat | Self::Rename => &[Ptr, Ptr],
            Self::Mkdir => &[Ptr, Int],
            Self::Wait => &[Ptr],
            Self::ForkPtyExec => &[Ptr, Ptr, Ptr],
            Self::GetTimeOfDay => &[Ptr, Int],
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Write => "write",
            Self::Read => "read",
            Self::Lseek => "lseek",
            Self::Fstat => "fstat",
            Self::Open => "open",
            Self::Close => "close",
            Self::Unlink => "unlink",
            Self::Opendir => "opendir",
            Self::Closedir => "closedir",
            Self::Readdir => "readdir",
            Self::Chdir => "chdir",
            Self::Getcwd => "getcwd",
            Self::Stat => "stat",
            Self::Rename => "rename",
            Self::Mkdir => "mkdir",
            Self::Rmdir => "rmdir",
            Self::Wait => "wait",
            Self::ForkPtyExec => "forkptyexec",
            Self::System => "system",
            Self::GetTimeOfDay => "gettimeofday",
        }
    }
}

/// One logical call argument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arg {
    Int(Param),
    Ptr(Param),
    Buf { ptr: Param, len: Param },
}

impl Arg {
    pub const NULL: Self = Self::Ptr(0);

    /// Signed integer, stored two's complement in the argument word
    pub fn int(value: i64) -> Self {
        Self::Int(value as Param)
    }

    pub fn ptr<T>(ptr: *const T) -> Result<Self> {
        to_param(ptr as usize).map(Self::Ptr)
    }

    pub fn buf(buf: &[u8]) -> Result<Self> {
        Ok(Self::Buf {
            ptr: to_param(buf.as_ptr() as usize)?,
            len: to_param(buf.len())?,
        })
    }

    pub fn buf_mut(buf: &mut [u8]) -> Result<Self> {
        Ok(Self::Buf {
            ptr: to_param(buf.as_mut_ptr() as usize)?,
            len: to_param(buf.len())?,
        })
    }

    pub const fn kind(&self) -> ArgKind {
        match self {
            Self::Int(_) => ArgKind::Int,
            Self::Ptr(_) => ArgKind::Ptr,
            Self::Buf { .. } => ArgKind::Buf,
        }
    }
}

fn to_param(value: usize) -> Result<Param> {
    Param::try_from(value).map_err(|_| CommsError::PointerTooWide { addr: value })
}

/// Pack logical arguments into the four wire words
///
/// # Errors
/// Returns `TooManyArgs` if the arguments need more than [`ARG_COUNT`] words.
pub fn encode_args(args: &[Arg]) -> Result<[Param; ARG_COUNT]> {
    let mut words = [0; ARG_COUNT];
    let mut next = 0;

    for arg in args {
        if next + arg.kind().words() > ARG_COUNT {
            return Err(CommsError::TooManyArgs);
        }
        match *arg {
            Arg::Int(value) | Arg::Ptr(value) => words[next] = value,
            Arg::Buf { ptr, len } => {
                words[next] = ptr;
                words[next + 1] = len;
            }
        }
        next += arg.kind().words();
    }

    Ok(words)
}

/// Unpack wire words according to an operation's signature
pub fn decode_args(op: OpCode, words: &[Param; ARG_COUNT]) -> DecodedArgs {
    let mut args = DecodedArgs::default();
    let mut next = 0;

    for kind in op.signature() {
        let arg = match kind {
            ArgKind::Int => Arg::Int(words[next]),
            ArgKind::Ptr => Arg::Ptr(words[next]),
            ArgKind::Buf => Arg::Buf {
                ptr: words[next],
                len: words[next + 1],
            },
        };
        args.items[args.len] = arg;
        args.len += 1;
        next += kind.words();
    }

    args
}

/// Arguments of one call after decoding
#[derive(Debug, Clone, Copy)]
pub struct DecodedArgs {
    items: [Arg; ARG_COUNT],
    len: usize,
}

impl Default for DecodedArgs {
    fn default() -> Self {
        Self {
            items: [Arg::Int(0); ARG_COUNT],
            len: 0,
        }
    }
}

impl DecodedArgs {
    pub fn as_slice(&self) -> &[Arg] {
        &self.items[..self.len]
    }

    /// Integer or pointer word at `index`
    pub fn word(&self, index: usize) -> Param {
        match self.items[index] {
            Arg::Int(value) | Arg::Ptr(value) => value,
            Arg::Buf { ptr, .. } => ptr,
        }
    }

    /// Buffer descriptor at `index` as `(ptr, len)`
    pub fn buf(&self, index: usize) -> (Param, Param) {
        match self.items[index] {
            Arg::Buf { ptr, len } => (ptr, len),
            Arg::Int(value) | Arg::Ptr(value) => (value, 0),
        }
    }
}

/// Slot lifecycle states
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free = 0,
    Claimed = 1,
    Pending = 2,
    Done = 3,
}

impl SlotState {
    fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Claimed,
            2 => Self::Pending,
            3 => Self::Done,
            _ => Self::Free,
        }
    }
}

/// One call descriptor
#[repr(C)]
pub struct CallSlot {
    op: AtomicU32,
    state: AtomicU32,
    args: UnsafeCell<[Param; ARG_COUNT]>,
    retval: UnsafeCell<Param>,
    errno: AtomicU32,
    _reserved: AtomicU32,
    scratch: UnsafeCell<[u8; SCRATCH_SIZE]>,
}

impl CallSlot {
    pub fn state(&self) -> SlotState {
        SlotState::from_raw(self.state.load(Ordering::Acquire))
    }
}

/// Call channel header plus slots, as laid out in the shared window
#[repr(C)]
pub struct CallBuffer {
    magic: AtomicU32,
    write_cursor: AtomicU32,
    read_cursor: AtomicU32,
    /// Non-zero while a client is claiming a slot
    claim_lock: AtomicU32,
    slots: [CallSlot; CALL_SLOTS],
}

// Non-atomic slot fields have exactly one writer per slot state.
unsafe impl Sync for CallBuffer {}

unsafe impl SharedLayout for CallBuffer {
    const NAME: &'static str = "call buffer";
}

const_assert!(size_of::<CallBuffer>() <= CALL_WINDOW_SIZE);

fn slot_index(cursor: u32) -> usize {
    cursor as usize % CALL_SLOTS
}

impl CallBuffer {
    pub fn is_ready(&self) -> bool {
        self.magic.load(Ordering::Acquire) == READY_MAGIC
    }

    pub fn write_cursor(&self) -> u32 {
        self.write_cursor.load(Ordering::Acquire)
    }

    pub fn read_cursor(&self) -> u32 {
        self.read_cursor.load(Ordering::Acquire)
    }

    /// Calls claimed but not yet dequeued by the server
    pub fn in_flight(&self) -> u32 {
        self.write_cursor().wrapping_sub(self.read_cursor())
    }

    pub fn slot(&self, index: usize) -> &CallSlot {
        &self.slots[index]
    }

    /// Byte offset of a slot's scratch buffer from the start of the buffer
    pub const fn scratch_offset(index: usize) -> usize {
        offset_of!(CallBuffer, slots) + index * size_of::<CallSlot>() + offset_of!(CallSlot, scratch)
    }

    /// Publish the readiness sentinel (server side)
    ///
    /// Idempotent: a restarted server finds the sentinel already set and
    /// leaves cursors and slots alone, so pending calls survive the restart.
    ///
    /// # Returns
    /// `true` if the channel was (re)initialised
    pub fn publish_ready(&self) -> bool {
        if self.is_ready() {
            return false;
        }

        for slot in &self.slots {
            slot.state.store(SlotState::Free as u32, Ordering::Relaxed);
        }
        self.read_cursor.store(0, Ordering::Relaxed);
        self.write_cursor.store(0, Ordering::Relaxed);
        self.claim_lock.store(0, Ordering::Relaxed);
        self.magic.store(READY_MAGIC, Ordering::Release);
        true
    }

    /// Spin on the header's claim word
    ///
    /// Serialises cursor advancement between every client instance on this
    /// buffer, whichever cell or thread created them.
    fn lock_claims(&self) -> ClaimGuard<'_> {
        while self
            .claim_lock
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
        ClaimGuard(&self.claim_lock)
    }

    /// Take the server end of the channel
    ///
    /// # Safety
    /// At most one server end may exist across both cells at a time; the
    /// read cursor and every result field rely on a single server.
    pub unsafe fn server_end(&self) -> ServerEnd<'_> {
        ServerEnd { buf: self }
    }
}

struct ClaimGuard<'a>(&'a AtomicU32);

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        self.0.store(0, Ordering::Release);
    }
}

/// Single-consumer view of the call channel
pub struct ServerEnd<'a> {
    buf: &'a CallBuffer,
}

impl<'a> ServerEnd<'a> {
    pub fn buffer(&self) -> &'a CallBuffer {
        self.buf
    }

    /// Next call in arrival order, if its client has published it
    pub fn next_pending(&mut self) -> Option<PendingCall<'_>> {
        let read = self.buf.read_cursor.load(Ordering::Relaxed);
        if read == self.buf.write_cursor.load(Ordering::Acquire) {
            return None;
        }

        let index = slot_index(read);
        let slot = &self.buf.slots[index];
        if slot.state() != SlotState::Pending {
            // Claimed but arguments not written yet.
            return None;
        }

        Some(PendingCall {
            buf: self.buf,
            slot,
            index,
            cursor: read,
        })
    }
}

/// A dequeued call the server is working on
pub struct PendingCall<'a> {
    buf: &'a CallBuffer,
    slot: &'a CallSlot,
    index: usize,
    cursor: u32,
}

impl PendingCall<'_> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn op_raw(&self) -> u32 {
        self.slot.op.load(Ordering::Relaxed)
    }

    pub fn args(&self) -> [Param; ARG_COUNT] {
        // SAFETY: the client stopped writing before publishing Pending.
        unsafe { core::ptr::read_volatile(self.slot.args.get()) }
    }

    pub fn scratch_mut(&mut self) -> &mut [u8; SCRATCH_SIZE] {
        // SAFETY: the server owns the scratch buffer while the slot is Pending.
        unsafe { &mut *self.slot.scratch.get() }
    }

    /// Store the results, hand the slot back and advance the read cursor
    pub fn complete(self, retval: Param, errno: Errno) {
        // SAFETY: the server owns the result fields while the slot is Pending.
        unsafe { core::ptr::write_volatile(self.slot.retval.get(), retval) };
        self.slot.errno.store(errno.code(), Ordering::Relaxed);
        self.slot.state.store(SlotState::Done as u32, Ordering::Release);
        self.buf
            .read_cursor
            .store(self.cursor.wrapping_add(1), Ordering::Release);
    }
}

/// Results of a completed call, copied out of the slot
#[derive(Clone, Copy)]
pub struct CallReply {
    pub retval: Param,
    pub errno: Errno,
    pub scratch: [u8; SCRATCH_SIZE],
}

impl CallReply {
    /// Return word interpreted as a signed value
    pub fn signed(&self) -> SignedParam {
        self.retval as SignedParam
    }

    /// Negative return values signal failure, as the host call reported them
    pub fn result(&self) -> core::result::Result<Param, Errno> {
        if self.signed() < 0 {
            Err(self.errno)
        } else {
            Ok(self.retval)
        }
    }

    pub fn is_null(&self) -> bool {
        self.retval == 0
    }
}

impl core::fmt::Debug for CallReply {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CallReply")
            .field("retval", &self.retval)
            .field("errno", &self.errno)
            .finish_non_exhaustive()
    }
}

/// Client end of the call channel
///
/// One instance serves every core of the bare-metal cell. Its local lock
/// queues those cores; the buffer's claim word orders them against any other
/// client on the same buffer.
pub struct CallClient<'a, N: Notify> {
    buf: &'a CallBuffer,
    local_lock: spin::Mutex<()>,
    notify: N,
}

impl<'a, N: Notify> CallClient<'a, N> {
    pub fn new(buf: &'a CallBuffer, notify: N) -> Self {
        Self {
            buf,
            local_lock: spin::Mutex::new(()),
            notify,
        }
    }

    pub fn buffer(&self) -> &'a CallBuffer {
        self.buf
    }

    pub fn is_server_ready(&self) -> bool {
        self.buf.is_ready()
    }

    /// Block until the host server has published the readiness sentinel
    pub fn wait_until_ready(&self) {
        while !self.buf.is_ready() {
            self.notify.wait_for_change();
        }
    }

    /// Invoke a host operation and wait for its completion
    ///
    /// Blocks until the server is ready and then until the call is done.
    /// There is no timeout: a host call that never returns blocks the caller
    /// forever.
    ///
    /// # Errors
    /// Only argument encoding can fail; host failures come back in the reply.
    pub fn call(&self, op: OpCode, args: &[Arg]) -> Result<CallReply> {
        let words = encode_args(args)?;
        Ok(self.call_raw(op.raw(), words))
    }

    /// Invoke an operation by raw id with pre-encoded words
    pub fn call_raw(&self, op: u32, args: [Param; ARG_COUNT]) -> CallReply {
        self.wait_until_ready();

        let index = self.claim();
        let slot = &self.buf.slots[index];

        slot.op.store(op, Ordering::Relaxed);
        // SAFETY: the slot is Claimed by this caller; the server ignores it
        // until Pending is published below.
        unsafe {
            core::ptr::write_volatile(slot.args.get(), args);
            core::ptr::write_volatile(slot.retval.get(), 0);
        }
        slot.errno.store(0, Ordering::Relaxed);
        slot.state.store(SlotState::Pending as u32, Ordering::Release);
        self.notify.notify();

        while slot.state() != SlotState::Done {
            self.notify.wait_for_change();
        }

        // SAFETY: Done hands the slot back to this caller.
        let reply = unsafe {
            CallReply {
                retval: core::ptr::read_volatile(slot.retval.get()),
                errno: Errno(slot.errno.load(Ordering::Relaxed)),
                scratch: core::ptr::read_volatile(slot.scratch.get()),
            }
        };

        slot.state.store(SlotState::Free as u32, Ordering::Release);
        // A claimer may be waiting for this slot after a full wrap.
        self.notify.notify();

        reply
    }

    /// Claim the slot at the write cursor and advance the cursor
    fn claim(&self) -> usize {
        let _local = self.local_lock.lock();
        let _shared = self.buf.lock_claims();

        let cursor = self.buf.write_cursor.load(Ordering::Acquire);
        let index = slot_index(cursor);
        let slot = &self.buf.slots[index];

        // After a full wrap the previous occupant may still be in flight.
        while slot
            .state
            .compare_exchange(
                SlotState::Free as u32,
                SlotState::Claimed as u32,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_err()
        {
            self.notify.wait_for_change();
        }

        self.buf
            .write_cursor
            .store(cursor.wrapping_add(1), Ordering::Release);
        index
    }
}

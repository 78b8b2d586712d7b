//! Cell Comms - inter-cell communication substrate
//!
//! # Purpose
//! Lets a bare-metal program running as an isolated hypervisor cell use
//! operating-system services of the Linux cell next to it. Everything here is
//! shared by both sides: the fixed region map, the typed shared-region
//! handle, the notify primitive and every channel layout.
//!
//! # Integration Points
//! - Depends on: fixed physical windows agreed at build time (see [`layout`])
//! - Provides to: the bare-metal runtime (client side) and `cell-host`
//!   (server side, helper processes)
//! - Signalling: architectural event wait/send, optionally amplified by a
//!   hypervisor-injected interrupt
//!
//! # Architecture
//! - [`call`]: synchronous RPC ring; clients marshal a call into a slot and
//!   block until the host libc server marks it done
//! - [`event`]: lossy one-directional ring for input events
//! - [`port`]: duplex single-byte mailbox for the debug stub
//! - [`frame`]: latest-wins video/audio frame handoff
//! - [`abi`]: the bare-metal libc structure layouts and their translators
//! - [`guest_libc`]: typed libc front end for the bare-metal side
//!
//! # Testing Strategy
//! - Unit tests: per-channel state machines on heap-backed regions
//! - Integration tests: client and libc server on separate threads
//!   (`cell-host/tests`)

#![no_std]

#[cfg(test)]
#[macro_use]
extern crate std;

use thiserror::Error;

pub mod abi;
pub mod call;
pub mod event;
pub mod frame;
pub mod guest_libc;
pub mod layout;
pub mod notify;
pub mod port;
pub mod region;

#[cfg(test)]
pub(crate) mod testutil;

pub use abi::Errno;
pub use call::{Arg, CallBuffer, CallClient, CallReply, OpCode, Param};
pub use layout::{RegionMap, Window};
pub use notify::{EventNotifier, IrqInjector, Notify, WithIrq};
pub use region::{SharedLayout, SharedRegion};

/// Errors raised while setting up or using a channel
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CommsError {
    #[error("region {name} too small: need {needed} bytes, have {available}")]
    RegionTooSmall {
        name: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("address {addr:#x} is not aligned to {align} bytes")]
    Misaligned { addr: usize, align: usize },

    #[error("windows {first} and {second} overlap")]
    Overlap {
        first: &'static str,
        second: &'static str,
    },

    #[error("call needs more than the available argument words")]
    TooManyArgs,

    #[error("pointer {addr:#x} does not fit an argument word")]
    PointerTooWide { addr: usize },

    #[error("unknown operation id {0}")]
    UnknownOp(u32),

    #[error("interrupt injection failed (code {0})")]
    InjectFailed(i32),
}

pub type Result<T> = core::result::Result<T, CommsError>;

//! Cell Host - Linux-side services for a bare-metal cell
//!
//! # Purpose
//! Runs next to the Jailhouse root cell's Linux and gives the bare-metal
//! program access to host services through the windows defined in
//! `cell-comms`: a libc server answering call-channel requests, an input
//! feeder, a debug-port bridge and a frame monitor.
//!
//! # Integration Points
//! - Depends on: `cell-comms` (layouts, client/server ends), `/dev/mem`,
//!   `/dev/jailhouse` for interrupt injection
//! - Provides to: the `cellctl` binary, one subcommand per service
//!
//! # Architecture
//! - [`config`]: TOML configuration of windows, devices and idle policy
//! - [`mapping`]: maps windows from `/dev/mem` (or the heap, in tests)
//! - [`guest_mem`]: guest address translation with bounds checks
//! - [`host`]: typed host operations backed by the `libc` crate
//! - [`dispatch`] and [`server`]: the libc server
//! - [`input`], [`debug_port`], [`frames`]: helper processes
//!
//! # Testing Strategy
//! - Unit tests: translation tables, address checks, bridge and monitor
//!   logic against in-memory streams
//! - Integration tests: a real `CallClient` talking to the server on
//!   another thread over heap-backed windows, against a temp directory

pub mod config;
pub mod debug_port;
pub mod dispatch;
pub mod error;
pub mod frames;
pub mod guest_mem;
pub mod host;
pub mod input;
pub mod mapping;
pub mod notify;
pub mod server;

pub use config::CommsConfig;
pub use error::{HostError, Result};
pub use guest_mem::{GuestMemory, IdentityMemory, WindowedMemory};
pub use host::{HostOs, LibcHost};
pub use mapping::{CommsRegions, HeapMapper, MemDevice, WindowMapper};
pub use notify::{BackoffNotifier, CondvarNotifier, JailhouseIrq};
pub use server::{CallServer, IdleBackoff};

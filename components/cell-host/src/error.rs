//! Host-side error type

use std::io;
use std::path::PathBuf;

use cell_comms::CommsError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to map {name} at {phys:#x} ({size:#x} bytes): {source}")]
    Map {
        name: &'static str,
        phys: usize,
        size: usize,
        #[source]
        source: io::Error,
    },

    #[error("failed to read config {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("cannot serialize config: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    #[error("guest memory window at {guest_base:#x} overlaps another window")]
    GuestWindowOverlap { guest_base: usize },

    #[error("guest buffer {addr:#x}+{len:#x} is not mapped")]
    GuestBuffer { addr: u64, len: usize },

    #[error("no unused recording name left in {dir}")]
    RecordingsExhausted { dir: PathBuf },

    #[error("allocation of {size:#x} bytes failed")]
    OutOfMemory { size: usize },

    #[error(transparent)]
    Comms(#[from] CommsError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, HostError>;

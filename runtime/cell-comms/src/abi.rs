//! Bare-metal libc ABI
//!
//! The bare-metal cell is built against a small embedded C library whose
//! structure layouts and flag bits differ from the host's. This module holds
//! the guest-side layouts, neutral wide records the host fills in, and the
//! field-by-field translators between them. Fields are narrowed with plain
//! truncation so an out-of-range host value always maps to the same guest
//! value.

use core::fmt;
use core::mem::size_of;

use bitflags::bitflags;
use static_assertions::const_assert;

use crate::call::SCRATCH_SIZE;

/// Host error number, carried verbatim across the channel
///
/// Values use the host (Linux) numbering; the guest libc maps them to its
/// own representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(pub u32);

impl Errno {
    pub const EPERM: Self = Self(1);
    pub const ENOENT: Self = Self(2);
    pub const E2BIG: Self = Self(7);
    pub const EBADF: Self = Self(9);
    pub const ENOMEM: Self = Self(12);
    pub const EFAULT: Self = Self(14);
    pub const EEXIST: Self = Self(17);
    pub const ENOTDIR: Self = Self(20);
    pub const EINVAL: Self = Self(22);
    pub const ERANGE: Self = Self(34);
    pub const ENOSYS: Self = Self(38);
    pub const ENOTSUP: Self = Self(95);

    pub const fn code(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "errno {}", self.0)
    }
}

/// Plain-old-data structures exchanged through shared memory
///
/// # Safety
/// Implementors must be `repr(C)` without implicit padding, so that every
/// byte of a value is initialised.
pub unsafe trait WireStruct: Copy {
    fn as_bytes(&self) -> &[u8] {
        // SAFETY: repr(C), no implicit padding (trait contract).
        unsafe { core::slice::from_raw_parts((self as *const Self).cast::<u8>(), size_of::<Self>()) }
    }

    /// Decode from the start of `bytes`, or `None` if too short
    fn read_from(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < size_of::<Self>() {
            return None;
        }
        // SAFETY: length checked; every bit pattern is valid for these PODs.
        Some(unsafe { core::ptr::read_unaligned(bytes.as_ptr().cast::<Self>()) })
    }
}

pub const S_IFMT: u32 = 0o170_000;
pub const S_IFDIR: u32 = 0o040_000;
pub const S_IFREG: u32 = 0o100_000;

pub const DT_UNKNOWN: u8 = 0;
pub const DT_DIR: u8 = 4;
pub const DT_REG: u8 = 8;

/// Maximum file name length in a guest directory entry, excluding NUL
pub const NAME_MAX: usize = 255;

/// `struct stat` as the bare-metal libc lays it out
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GuestStat {
    pub st_dev: i16,
    pub st_ino: u16,
    pub st_mode: u32,
    pub st_nlink: u16,
    pub st_uid: u16,
    pub st_gid: u16,
    pub st_rdev: u16,
    pub st_size: i32,
    pub _pad: u32,
    pub st_mtime: i64,
}

unsafe impl WireStruct for GuestStat {}

impl GuestStat {
    pub fn from_host(host: &HostStat) -> Self {
        Self {
            st_dev: host.dev as i16,
            st_ino: host.ino as u16,
            st_mode: host.mode,
            st_nlink: host.nlink as u16,
            st_uid: host.uid as u16,
            st_gid: host.gid as u16,
            st_rdev: host.rdev as u16,
            st_size: host.size as i32,
            _pad: 0,
            st_mtime: host.mtime,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.st_mode & S_IFMT == S_IFDIR
    }

    pub fn is_file(&self) -> bool {
        self.st_mode & S_IFMT == S_IFREG
    }
}

/// `struct timeval` as the bare-metal libc lays it out
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GuestTimeval {
    pub tv_sec: u64,
    pub tv_usec: u64,
}

unsafe impl WireStruct for GuestTimeval {}

impl GuestTimeval {
    pub fn from_host(host: &HostTimeval) -> Self {
        Self {
            tv_sec: host.sec as u64,
            tv_usec: host.usec as u64,
        }
    }
}

/// `struct dirent` as the bare-metal libc lays it out
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct GuestDirent {
    pub d_type: u8,
    pub d_name: [u8; NAME_MAX + 1],
}

unsafe impl WireStruct for GuestDirent {}

impl GuestDirent {
    pub fn from_host(host: &HostDirent<'_>) -> Self {
        let mut d_name = [0u8; NAME_MAX + 1];
        let len = host.name.len().min(NAME_MAX);
        d_name[..len].copy_from_slice(&host.name[..len]);

        let d_type = match host.kind {
            HostFileType::Directory => DT_DIR,
            HostFileType::Regular => DT_REG,
            HostFileType::Other => DT_UNKNOWN,
        };

        Self { d_type, d_name }
    }

    /// Name bytes up to the terminating NUL
    pub fn name(&self) -> &[u8] {
        let end = self
            .d_name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.d_name.len());
        &self.d_name[..end]
    }
}

impl fmt::Debug for GuestDirent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestDirent")
            .field("d_type", &self.d_type)
            .field("d_name", &core::str::from_utf8(self.name()).unwrap_or("<non-utf8>"))
            .finish()
    }
}

/// Terminal size handed to a pseudo-terminal spawn; identical on both sides
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GuestWinsize {
    pub ws_row: u16,
    pub ws_col: u16,
    pub ws_xpixel: u16,
    pub ws_ypixel: u16,
}

unsafe impl WireStruct for GuestWinsize {}

bitflags! {
    /// `open()` flags with the bare-metal libc bit positions
    ///
    /// Read-only access is the absence of both access bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct GuestOpenFlags: u32 {
        const WRONLY = 0x0001;
        const RDWR = 0x0002;
        const APPEND = 0x0008;
        const CREAT = 0x0200;
        const TRUNC = 0x0400;
        const EXCL = 0x0800;
        const SYNC = 0x2000;
        const NONBLOCK = 0x4000;
        const NOCTTY = 0x8000;
        const CLOEXEC = 0x0004_0000;
        const NOFOLLOW = 0x0010_0000;
        const DIRECTORY = 0x0020_0000;
    }
}

impl GuestOpenFlags {
    pub const RDONLY: Self = Self::empty();
}

/// File type as reported by the host, independent of its numbering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostFileType {
    Directory,
    Regular,
    Other,
}

/// Host file status with every field at its widest
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostStat {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: i64,
    pub mtime: i64,
}

/// Host directory entry, borrowed from the host's iteration state
#[derive(Debug, Clone, Copy)]
pub struct HostDirent<'a> {
    pub kind: HostFileType,
    pub name: &'a [u8],
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostTimeval {
    pub sec: i64,
    pub usec: i64,
}

// Translated results are returned through the call slot scratch buffer.
const_assert!(size_of::<GuestStat>() <= SCRATCH_SIZE);
const_assert!(size_of::<GuestTimeval>() <= SCRATCH_SIZE);
const_assert!(size_of::<GuestDirent>() <= SCRATCH_SIZE);
const_assert!(size_of::<GuestWinsize>() <= SCRATCH_SIZE);
const_assert!(size_of::<GuestStat>() == 32);
const_assert!(size_of::<GuestDirent>() == 257);

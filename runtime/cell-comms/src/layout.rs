//! Shared region map
//!
//! Physical windows both cells are built against. The defaults below are
//! the agreed constants; the host tools may override them from their
//! configuration file, but the bare-metal side always uses
//! [`RegionMap::DEFAULT`].

use crate::{CommsError, Result};

/// Load address of the bare-metal program inside the hypervisor cell
pub const GUEST_BASE_ADDR: usize = 0x4900_0000;

pub const CALL_WINDOW_ADDR: usize = 0x488f_c000;
pub const CALL_WINDOW_SIZE: usize = 0x4000;

pub const EVENT_WINDOW_ADDR: usize = 0x488f_1000;
pub const EVENT_WINDOW_SIZE: usize = 0x2000;

pub const MEDIA_WINDOW_ADDR: usize = 0x488f_0000;
pub const MEDIA_WINDOW_SIZE: usize = 0x1000;

pub const DEBUG_PORT_WINDOW_ADDR: usize = 0x488e_f000;
pub const DEBUG_PORT_WINDOW_SIZE: usize = 0x1000;

/// One fixed physical window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub name: &'static str,
    pub phys_base: usize,
    pub size: usize,
}

impl Window {
    pub const fn new(name: &'static str, phys_base: usize, size: usize) -> Self {
        Self {
            name,
            phys_base,
            size,
        }
    }

    pub const fn end(&self) -> usize {
        self.phys_base + self.size
    }

    pub const fn overlaps(&self, other: &Window) -> bool {
        self.phys_base < other.end() && other.phys_base < self.end()
    }

    /// Fail unless a layout of `needed` bytes fits this window
    pub fn require(&self, needed: usize) -> Result<()> {
        if needed > self.size {
            return Err(CommsError::RegionTooSmall {
                name: self.name,
                needed,
                available: self.size,
            });
        }
        Ok(())
    }
}

/// Every communication window of the system
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionMap {
    pub call: Window,
    pub event: Window,
    pub media: Window,
    pub debug_port: Window,
}

impl RegionMap {
    pub const DEFAULT: Self = Self {
        call: Window::new("call buffer", CALL_WINDOW_ADDR, CALL_WINDOW_SIZE),
        event: Window::new("event buffer", EVENT_WINDOW_ADDR, EVENT_WINDOW_SIZE),
        media: Window::new("media port", MEDIA_WINDOW_ADDR, MEDIA_WINDOW_SIZE),
        debug_port: Window::new("debug port", DEBUG_PORT_WINDOW_ADDR, DEBUG_PORT_WINDOW_SIZE),
    };

    pub fn windows(&self) -> [Window; 4] {
        [self.call, self.event, self.media, self.debug_port]
    }

    /// Check windows are disjoint and large enough for their layouts
    pub fn validate(&self) -> Result<()> {
        self.call.require(core::mem::size_of::<crate::call::CallBuffer>())?;
        self.event.require(core::mem::size_of::<crate::event::InputEventBuffer>())?;
        self.media.require(core::mem::size_of::<crate::frame::MediaPort>())?;
        self.debug_port.require(core::mem::size_of::<crate::port::BytePort>())?;

        let windows = self.windows();
        for (i, first) in windows.iter().enumerate() {
            for second in &windows[i + 1..] {
                if first.overlaps(second) {
                    return Err(CommsError::Overlap {
                        first: first.name,
                        second: second.name,
                    });
                }
            }
        }
        Ok(())
    }
}

impl Default for RegionMap {
    fn default() -> Self {
        Self::DEFAULT
    }
}

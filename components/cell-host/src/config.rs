//! Host configuration
//!
//! Every field has a default matching the constants the bare-metal side is
//! built with, so an empty file (or no file) is a valid configuration.
//!
//! ```toml
//! [regions.call]
//! phys = 0x488fc000
//! size = 0x4000
//!
//! [[guest_memory]]
//! guest_base = 0x49000000
//! phys = 0x49000000
//! size = 0x67000000
//!
//! [debug_port]
//! irq = 125
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use cell_comms::layout::{
    CALL_WINDOW_ADDR, CALL_WINDOW_SIZE, DEBUG_PORT_WINDOW_ADDR, DEBUG_PORT_WINDOW_SIZE,
    EVENT_WINDOW_ADDR, EVENT_WINDOW_SIZE, GUEST_BASE_ADDR, MEDIA_WINDOW_ADDR, MEDIA_WINDOW_SIZE,
};
use cell_comms::{RegionMap, Window};
use serde::{Deserialize, Serialize};

use crate::error::{HostError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WindowConfig {
    pub phys: usize,
    pub size: usize,
}

impl WindowConfig {
    const fn new(phys: usize, size: usize) -> Self {
        Self { phys, size }
    }
}

/// Physical windows of the communication channels
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegionConfig {
    pub call: WindowConfig,
    pub event: WindowConfig,
    pub media: WindowConfig,
    pub debug_port: WindowConfig,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            call: WindowConfig::new(CALL_WINDOW_ADDR, CALL_WINDOW_SIZE),
            event: WindowConfig::new(EVENT_WINDOW_ADDR, EVENT_WINDOW_SIZE),
            media: WindowConfig::new(MEDIA_WINDOW_ADDR, MEDIA_WINDOW_SIZE),
            debug_port: WindowConfig::new(DEBUG_PORT_WINDOW_ADDR, DEBUG_PORT_WINDOW_SIZE),
        }
    }
}

/// Part of the bare-metal cell's memory the libc server may dereference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GuestWindowConfig {
    /// Address the bare-metal program uses
    pub guest_base: usize,
    /// Physical address backing it
    pub phys: usize,
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceConfig {
    pub mem: PathBuf,
    pub hypervisor: PathBuf,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            mem: PathBuf::from("/dev/mem"),
            hypervisor: PathBuf::from("/dev/jailhouse"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DebugPortConfig {
    /// Interrupt injected into the bare-metal cell after each byte sent
    pub irq: u32,
    /// Empty polls before the bridge starts sleeping
    pub idle_polls: u32,
    pub idle_sleep_us: u64,
    /// Pause between checks while the bare-metal side has not taken a byte
    pub send_retry_us: u64,
}

impl Default for DebugPortConfig {
    fn default() -> Self {
        Self {
            irq: 125,
            idle_polls: 10_000,
            idle_sleep_us: 1000,
            send_retry_us: 100,
        }
    }
}

/// Idle policy of the libc server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IdleConfig {
    /// Time spent in architectural waits before falling back to sleeping
    pub spin_ms: u64,
    pub sleep_us: u64,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            spin_ms: 2000,
            sleep_us: 1000,
        }
    }
}

impl IdleConfig {
    pub fn spin_for(&self) -> Duration {
        Duration::from_millis(self.spin_ms)
    }

    pub fn sleep(&self) -> Duration {
        Duration::from_micros(self.sleep_us)
    }
}

/// Complete host configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CommsConfig {
    pub regions: RegionConfig,
    pub guest_memory: Vec<GuestWindowConfig>,
    pub devices: DeviceConfig,
    pub debug_port: DebugPortConfig,
    pub idle: IdleConfig,
}

impl Default for CommsConfig {
    fn default() -> Self {
        Self {
            regions: RegionConfig::default(),
            guest_memory: vec![
                // Program text, data, heap. The top of RAM is left out for
                // lack of host address space on 2 GiB boards.
                GuestWindowConfig {
                    guest_base: GUEST_BASE_ADDR,
                    phys: GUEST_BASE_ADDR,
                    size: 0x6700_0000,
                },
                // Stack, which call arguments may point into.
                GuestWindowConfig {
                    guest_base: 0x8000,
                    phys: 0x4880_8000,
                    size: 0x8000,
                },
            ],
            devices: DeviceConfig::default(),
            debug_port: DebugPortConfig::default(),
            idle: IdleConfig::default(),
        }
    }
}

impl CommsConfig {
    /// Load from a TOML file
    ///
    /// # Errors
    /// Fails if the file cannot be read, does not parse, or describes an
    /// invalid layout.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|source| HostError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        log::info!("loaded config from {}", path.display());
        Ok(config)
    }

    /// Load `path` if given, defaults otherwise
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn region_map(&self) -> RegionMap {
        let r = &self.regions;
        RegionMap {
            call: Window::new("call buffer", r.call.phys, r.call.size),
            event: Window::new("event buffer", r.event.phys, r.event.size),
            media: Window::new("media port", r.media.phys, r.media.size),
            debug_port: Window::new("debug port", r.debug_port.phys, r.debug_port.size),
        }
    }

    /// Check channel windows and guest memory windows
    pub fn validate(&self) -> Result<()> {
        self.region_map().validate()?;

        for (i, first) in self.guest_memory.iter().enumerate() {
            for second in &self.guest_memory[i + 1..] {
                let disjoint = first.guest_base + first.size <= second.guest_base
                    || second.guest_base + second.size <= first.guest_base;
                if !disjoint {
                    return Err(HostError::GuestWindowOverlap {
                        guest_base: second.guest_base,
                    });
                }
            }
        }
        Ok(())
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

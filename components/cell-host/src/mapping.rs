//! Window mapping
//!
//! The host reaches the shared windows through `/dev/mem`. Each mapping is
//! kept alive by the mapper that created it, so regions handed out by a
//! mapper stay valid for as long as the mapper is borrowed.
//!
//! [`HeapMapper`] stands in for physical memory in tests and simulation:
//! mapping the same physical address twice returns the same allocation,
//! the way two cells mapping one window see the same bytes.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::{Mutex, PoisonError};

use cell_comms::call::CallBuffer;
use cell_comms::event::InputEventBuffer;
use cell_comms::frame::MediaPort;
use cell_comms::port::BytePort;
use cell_comms::{RegionMap, SharedRegion, Window};
use memmap2::{MmapMut, MmapOptions};

use crate::error::{HostError, Result};

const PAGE_SIZE: usize = 4096;

/// Source of shared-memory windows
pub trait WindowMapper {
    /// Map `window` read/write
    ///
    /// The region stays valid while the mapper is alive.
    fn map(&self, window: &Window) -> Result<SharedRegion<'_>>;
}

/// `/dev/mem` (or any file standing in for it)
pub struct MemDevice {
    file: File,
    path: PathBuf,
    maps: Mutex<Vec<MmapMut>>,
}

impl MemDevice {
    /// Open the memory device for synchronous read/write access
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(path)
            .map_err(|source| HostError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            maps: Mutex::new(Vec::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of live mappings
    pub fn mapping_count(&self) -> usize {
        self.maps.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn map_window(&self, window: &Window) -> Result<SharedRegion<'_>> {
        let map_err = |source| HostError::Map {
            name: window.name,
            phys: window.phys_base,
            size: window.size,
            source,
        };

        // SAFETY: the other cell writes this memory concurrently; all
        // access goes through the layouts' atomics and volatile accessors.
        let mut mmap = unsafe {
            MmapOptions::new()
                .offset(window.phys_base as u64)
                .len(window.size)
                .map_mut(&self.file)
        }
        .map_err(map_err)?;

        let base = NonNull::new(mmap.as_mut_ptr()).ok_or_else(|| {
            map_err(std::io::Error::new(std::io::ErrorKind::Other, "null mapping"))
        })?;
        log::info!(
            "mapped {} {:#x}+{:#x} at {:p}",
            window.name,
            window.phys_base,
            window.size,
            base
        );

        // Moving the MmapMut into the list does not move the mapping.
        self.maps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(mmap);

        // SAFETY: the mapping is owned by `self.maps` until `self` drops.
        Ok(unsafe { SharedRegion::new(base, window.size, window.phys_base) })
    }
}

impl WindowMapper for MemDevice {
    fn map(&self, window: &Window) -> Result<SharedRegion<'_>> {
        self.map_window(window)
    }
}

/// Page-aligned, zeroed heap allocation
pub struct HeapRegion {
    ptr: NonNull<u8>,
    layout: Layout,
}

// Plain memory; callers synchronise through the layouts viewed on it.
unsafe impl Send for HeapRegion {}
unsafe impl Sync for HeapRegion {}

impl HeapRegion {
    pub fn new(size: usize) -> Result<Self> {
        let layout = Layout::from_size_align(size.max(1), PAGE_SIZE)
            .map_err(|_| HostError::OutOfMemory { size })?;
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(HostError::OutOfMemory { size })?;
        Ok(Self { ptr, layout })
    }

    /// Region for this allocation, reporting `phys` as its physical address
    pub fn region(&self, phys: usize) -> SharedRegion<'_> {
        // SAFETY: the allocation lives as long as `self`.
        unsafe { SharedRegion::new(self.ptr, self.layout.size(), phys) }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }
}

impl Drop for HeapRegion {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

/// Simulated physical memory
#[derive(Default)]
pub struct HeapMapper {
    windows: Mutex<HashMap<usize, HeapRegion>>,
    // Allocations replaced by a larger mapping of the same address; earlier
    // regions may still point into them.
    retired: Mutex<Vec<HeapRegion>>,
}

impl HeapMapper {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HeapMapper {
    fn region_of(&self, heap: &HeapRegion, phys: usize) -> SharedRegion<'_> {
        // SAFETY: allocations are only freed when `self` drops; replaced
        // ones move to `retired`.
        unsafe { SharedRegion::new(heap.ptr, heap.len(), phys) }
    }
}

impl WindowMapper for HeapMapper {
    fn map(&self, window: &Window) -> Result<SharedRegion<'_>> {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = windows.get(&window.phys_base) {
            if existing.len() >= window.size {
                return Ok(self.region_of(existing, window.phys_base));
            }
        }

        let heap = HeapRegion::new(window.size)?;
        let region = self.region_of(&heap, window.phys_base);
        if let Some(old) = windows.insert(window.phys_base, heap) {
            self.retired
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(old);
        }
        Ok(region)
    }
}

/// Every channel window, mapped
pub struct CommsRegions<'m> {
    pub call: SharedRegion<'m>,
    pub event: SharedRegion<'m>,
    pub media: SharedRegion<'m>,
    pub debug_port: SharedRegion<'m>,
}

impl<'m> CommsRegions<'m> {
    /// Map all four windows of `map`
    pub fn map_all<M: WindowMapper>(mapper: &'m M, map: &RegionMap) -> Result<Self> {
        map.validate()?;
        Ok(Self {
            call: mapper.map(&map.call)?,
            event: mapper.map(&map.event)?,
            media: mapper.map(&map.media)?,
            debug_port: mapper.map(&map.debug_port)?,
        })
    }

    pub fn call_buffer(&self) -> Result<&'m CallBuffer> {
        Ok(self.call.view()?)
    }

    pub fn input_events(&self) -> Result<&'m InputEventBuffer> {
        Ok(self.event.view()?)
    }

    pub fn media_port(&self) -> Result<&'m MediaPort> {
        Ok(self.media.view()?)
    }

    pub fn byte_port(&self) -> Result<&'m BytePort> {
        Ok(self.debug_port.view()?)
    }

    fn all(&self) -> [SharedRegion<'m>; 4] {
        [self.call, self.event, self.media, self.debug_port]
    }
}

/// Clear every channel window
///
/// Run once before either cell starts using the channels, so neither side
/// sees stale cursors, flags or a stale readiness sentinel.
pub fn init_comms<M: WindowMapper>(mapper: &M, map: &RegionMap) -> Result<()> {
    let regions = CommsRegions::map_all(mapper, map)?;
    for region in regions.all() {
        region.zero();
        log::info!("cleared {:#x}+{:#x}", region.phys(), region.len());
    }
    Ok(())
}

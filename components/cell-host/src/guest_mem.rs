//! Guest memory access
//!
//! Call arguments are addresses in the bare-metal cell's address space. The
//! server resolves them through a [`GuestMemory`] before touching anything,
//! and an address outside every known window fails the call with `EFAULT`
//! instead of faulting the server.

use std::ffi::CStr;
use std::mem::size_of;
use std::ptr::NonNull;

use cell_comms::abi::{Errno, WireStruct};
use cell_comms::Param;

use crate::config::GuestWindowConfig;
use crate::error::Result;
use crate::mapping::WindowMapper;

/// Translation from guest addresses to host memory
pub trait GuestMemory {
    /// Host address of `addr` and the number of bytes accessible from it
    fn resolve(&self, addr: Param) -> Option<(NonNull<u8>, usize)>;

    /// Bounds-checked pointer to `len` bytes at `addr`
    fn range(&self, addr: Param, len: usize) -> std::result::Result<*mut u8, Errno> {
        match self.resolve(addr) {
            Some((ptr, available)) if len <= available => Ok(ptr.as_ptr()),
            _ => Err(Errno::EFAULT),
        }
    }

    /// Borrow a guest buffer for reading
    ///
    /// The guest caller owns the buffer for the duration of the call.
    fn bytes(&self, addr: Param, len: usize) -> std::result::Result<&[u8], Errno> {
        if len == 0 {
            return Ok(&[]);
        }
        let ptr = self.range(addr, len)?;
        // SAFETY: range checked; the guest does not touch it mid-call.
        Ok(unsafe { std::slice::from_raw_parts(ptr, len) })
    }

    /// Borrow a guest buffer for writing
    #[allow(clippy::mut_from_ref)]
    fn bytes_mut(&self, addr: Param, len: usize) -> std::result::Result<&mut [u8], Errno> {
        if len == 0 {
            return Ok(&mut []);
        }
        let ptr = self.range(addr, len)?;
        // SAFETY: as for `bytes`; only the server writes it until Done.
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr, len) })
    }

    /// NUL-terminated string at `addr`
    fn cstr(&self, addr: Param) -> std::result::Result<&CStr, Errno> {
        let (ptr, available) = self.resolve(addr).ok_or(Errno::EFAULT)?;
        let mut len = 0;
        // SAFETY: every byte read is inside the resolved window.
        unsafe {
            while len < available {
                if *ptr.as_ptr().add(len) == 0 {
                    let bytes = std::slice::from_raw_parts(ptr.as_ptr(), len + 1);
                    return CStr::from_bytes_with_nul(bytes).map_err(|_| Errno::EFAULT);
                }
                len += 1;
            }
        }
        Err(Errno::EFAULT)
    }

    /// Store a translated structure at `addr`
    fn write_struct<T: WireStruct>(&self, addr: Param, value: &T) -> std::result::Result<(), Errno> {
        let ptr = self.range(addr, size_of::<T>())?;
        // SAFETY: range checked; guest structures have no alignment guarantee.
        unsafe { std::ptr::write_unaligned(ptr.cast::<T>(), *value) };
        Ok(())
    }

    fn write_i32(&self, addr: Param, value: i32) -> std::result::Result<(), Errno> {
        let ptr = self.range(addr, size_of::<i32>())?;
        // SAFETY: as for `write_struct`.
        unsafe { std::ptr::write_unaligned(ptr.cast::<i32>(), value) };
        Ok(())
    }

    /// Guest pointer array terminated by a null entry, at most `max` long
    fn pointer_array(&self, addr: Param, max: usize) -> std::result::Result<Vec<Param>, Errno> {
        let mut words = Vec::new();
        for i in 0..=max {
            let offset = Param::try_from(i * size_of::<Param>()).map_err(|_| Errno::EFAULT)?;
            let ptr = self.range(addr.wrapping_add(offset), size_of::<Param>())?;
            // SAFETY: range checked.
            let word = unsafe { std::ptr::read_unaligned(ptr.cast::<Param>()) };
            if word == 0 {
                return Ok(words);
            }
            words.push(word);
        }
        Err(Errno::E2BIG)
    }
}

/// Guest and host share one address space
///
/// Used when both ends run in one process.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityMemory;

impl GuestMemory for IdentityMemory {
    fn resolve(&self, addr: Param) -> Option<(NonNull<u8>, usize)> {
        let addr = usize::try_from(addr).ok()?;
        let ptr = NonNull::new(addr as *mut u8)?;
        Some((ptr, isize::MAX as usize - addr))
    }
}

#[derive(Debug, Clone, Copy)]
struct GuestWindow {
    guest_base: usize,
    len: usize,
    host: NonNull<u8>,
}

impl GuestWindow {
    fn resolve(&self, addr: usize) -> Option<(NonNull<u8>, usize)> {
        let offset = addr.checked_sub(self.guest_base)?;
        if offset >= self.len {
            return None;
        }
        // SAFETY: offset is inside the window.
        let ptr = unsafe { NonNull::new_unchecked(self.host.as_ptr().add(offset)) };
        Some((ptr, self.len - offset))
    }
}

/// Guest memory reachable through a set of mapped windows
pub struct WindowedMemory<'m> {
    windows: Vec<GuestWindow>,
    _mapper: std::marker::PhantomData<&'m ()>,
}

// The windows are plain memory; access is bounded per call.
unsafe impl Send for WindowedMemory<'_> {}
unsafe impl Sync for WindowedMemory<'_> {}

impl<'m> WindowedMemory<'m> {
    pub fn new() -> Self {
        Self {
            windows: Vec::new(),
            _mapper: std::marker::PhantomData,
        }
    }

    /// Map every configured window through `mapper`
    pub fn map<M: WindowMapper>(mapper: &'m M, windows: &[GuestWindowConfig]) -> Result<Self> {
        let mut memory = Self::new();
        for w in windows {
            let region = mapper.map(&cell_comms::Window::new("guest memory", w.phys, w.size))?;
            // SAFETY: the region lives as long as the mapper borrow.
            unsafe { memory.add_raw(w.guest_base, region.base(), region.len()) };
        }
        Ok(memory)
    }

    /// Add a window by raw host pointer
    ///
    /// # Safety
    /// `host..host + len` must stay mapped read/write for `'m`.
    pub unsafe fn add_raw(&mut self, guest_base: usize, host: *mut u8, len: usize) {
        if let Some(host) = NonNull::new(host) {
            self.windows.push(GuestWindow {
                guest_base,
                len,
                host,
            });
        }
    }

    pub fn window_count(&self) -> usize {
        self.windows.len()
    }
}

impl Default for WindowedMemory<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl GuestMemory for WindowedMemory<'_> {
    fn resolve(&self, addr: Param) -> Option<(NonNull<u8>, usize)> {
        let addr = usize::try_from(addr).ok()?;
        self.windows.iter().find_map(|w| w.resolve(addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::HeapMapper;
    use cell_comms::abi::GuestTimeval;

    fn windowed(mapper: &HeapMapper) -> WindowedMemory<'_> {
        WindowedMemory::map(
            mapper,
            &[
                GuestWindowConfig {
                    guest_base: 0x4900_0000,
                    phys: 0x1_0000,
                    size: 0x1000,
                },
                GuestWindowConfig {
                    guest_base: 0x8000,
                    phys: 0x2_0000,
                    size: 0x100,
                },
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_out_of_window_is_efault() {
        let mapper = HeapMapper::new();
        let mem = windowed(&mapper);

        assert!(mem.bytes(0x4900_0000, 0x1000).is_ok());
        assert_eq!(mem.bytes(0x4900_0800, 0x1000).err(), Some(Errno::EFAULT));
        assert_eq!(mem.bytes(0x4800_0000, 1).err(), Some(Errno::EFAULT));
        assert_eq!(mem.bytes(0, 1).err(), Some(Errno::EFAULT));
        assert!(mem.bytes(0, 0).is_ok());
    }

    #[test]
    fn test_windows_are_translated() {
        let mapper = HeapMapper::new();
        let mem = windowed(&mapper);

        mem.bytes_mut(0x8010, 4).unwrap().copy_from_slice(b"abc\0");
        assert_eq!(mem.cstr(0x8010).unwrap(), c"abc");

        let tv = GuestTimeval {
            tv_sec: 5,
            tv_usec: 6,
        };
        mem.write_struct(0x4900_0003, &tv).unwrap();
        let back = GuestTimeval::read_from(mem.bytes(0x4900_0003, 16).unwrap()).unwrap();
        assert_eq!(back, tv);
    }

    #[test]
    fn test_unterminated_string_is_efault() {
        let mapper = HeapMapper::new();
        let mem = windowed(&mapper);
        mem.bytes_mut(0x8000, 0x100).unwrap().fill(b'x');
        assert_eq!(mem.cstr(0x80f0).err(), Some(Errno::EFAULT));
    }

    #[test]
    fn test_pointer_array() {
        let words: [Param; 4] = [0x10, 0x20, 0, 0x99];
        let mem = IdentityMemory;
        let got = mem.pointer_array(words.as_ptr() as Param, 8).unwrap();
        assert_eq!(got, vec![0x10, 0x20]);
        assert_eq!(
            mem.pointer_array(words.as_ptr() as Param, 1).err(),
            Some(Errno::E2BIG)
        );
    }
}

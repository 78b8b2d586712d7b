//! Shared region handle
//!
//! A [`SharedRegion`] is one fixed physical window mapped by both cells. It
//! owns nothing but the base address and length; typed access goes through
//! [`SharedRegion::view`], which checks that the layout fits the window.

use core::marker::PhantomData;
use core::mem::{align_of, size_of};
use core::ptr::NonNull;

use crate::{CommsError, Result};

/// Layouts that may live in a shared window.
///
/// # Safety
/// The all-zero bit pattern must be a valid, initial value of the type, and
/// every field must tolerate concurrent access from the peer cell (atomics or
/// interior mutability with a single designated writer).
pub unsafe trait SharedLayout: Sync {
    /// Human-readable name used in error reports
    const NAME: &'static str;
}

/// Handle to one shared-memory window
///
/// `'a` is the lifetime of the mapping, not of the handle: views taken
/// through a copy of the handle stay valid while the mapping does.
#[derive(Debug, Clone, Copy)]
pub struct SharedRegion<'a> {
    base: NonNull<u8>,
    len: usize,
    phys: usize,
    _mapping: PhantomData<&'a [u8]>,
}

// The region is a plain address range; synchronisation is the job of the
// layouts viewed through it.
unsafe impl Send for SharedRegion<'_> {}
unsafe impl Sync for SharedRegion<'_> {}

impl<'a> SharedRegion<'a> {
    /// Wrap an already mapped window
    ///
    /// # Arguments
    /// * `base` - Address the window is mapped at in this address space
    /// * `len` - Window length in bytes
    /// * `phys` - Physical address agreed with the peer cell
    ///
    /// # Safety
    /// `base..base + len` must stay mapped read/write for `'a`.
    pub const unsafe fn new(base: NonNull<u8>, len: usize, phys: usize) -> Self {
        Self {
            base,
            len,
            phys,
            _mapping: PhantomData,
        }
    }

    /// Wrap a window that is identity-mapped (bare-metal side)
    ///
    /// # Safety
    /// Same contract as [`SharedRegion::new`]; `phys` must be non-zero.
    pub unsafe fn identity(phys: usize, len: usize) -> Option<Self> {
        NonNull::new(phys as *mut u8).map(|base| Self::new(base, len, phys))
    }

    pub fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn phys(&self) -> usize {
        self.phys
    }

    /// Borrow the window as a typed layout
    ///
    /// # Errors
    /// Returns `RegionTooSmall` if `T` does not fit and `Misaligned` if the
    /// mapping does not satisfy the alignment of `T`.
    pub fn view<T: SharedLayout>(&self) -> Result<&'a T> {
        let needed = size_of::<T>();
        if needed > self.len {
            return Err(CommsError::RegionTooSmall {
                name: T::NAME,
                needed,
                available: self.len,
            });
        }

        let addr = self.base.as_ptr() as usize;
        let align = align_of::<T>();
        if addr % align != 0 {
            return Err(CommsError::Misaligned { addr, align });
        }

        // SAFETY: size and alignment checked above; SharedLayout guarantees
        // that zeroed or peer-written memory is a valid T.
        Ok(unsafe { &*self.base.as_ptr().cast::<T>() })
    }

    /// Clear the whole window
    ///
    /// Runs exactly once, before either cell starts using the window.
    pub fn zero(&self) {
        for offset in 0..self.len {
            // SAFETY: offset is inside the mapped window.
            unsafe { core::ptr::write_volatile(self.base.as_ptr().add(offset), 0) };
        }
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
    }
}

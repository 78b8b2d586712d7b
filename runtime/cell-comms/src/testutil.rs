//! Heap-backed windows standing in for physical memory in unit tests

use core::ptr::NonNull;
use std::alloc::{alloc_zeroed, dealloc, Layout};

use crate::region::SharedRegion;

pub struct HeapWindow {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl HeapWindow {
    pub fn new(len: usize) -> Self {
        let layout = Layout::from_size_align(len.max(1), 4096).unwrap();
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) }).expect("test allocation failed");
        Self { ptr, layout }
    }

    pub fn region(&self) -> SharedRegion<'_> {
        unsafe { SharedRegion::new(self.ptr, self.layout.size(), self.ptr.as_ptr() as usize) }
    }
}

impl Drop for HeapWindow {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

unsafe impl Send for HeapWindow {}
unsafe impl Sync for HeapWindow {}

/// Notifier that yields the OS thread while waiting
#[derive(Debug, Default, Clone, Copy)]
pub struct YieldNotifier;

impl crate::notify::Notify for YieldNotifier {
    fn notify(&self) {}

    fn wait_for_change(&self) {
        std::thread::yield_now();
    }
}

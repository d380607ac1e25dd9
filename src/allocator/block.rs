//! Owned raw memory region
//!
//! A `Block` is the only place the allocator touches the system
//! allocator. It is zeroed on creation and freed on drop.

use std::alloc::{self, Layout};
use std::ptr::{self, NonNull};

/// Default alignment for blocks when the caller does not need more
pub const DEFAULT_ALIGN: usize = 16;

pub(crate) struct Block {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: a Block exclusively owns its region; moving it between threads
// moves that ownership.
unsafe impl Send for Block {}

impl Block {
    /// Allocate a zeroed region, `None` on invalid layout or OOM
    pub(crate) fn allocate_zeroed(size: usize, align: usize) -> Option<Self> {
        if size == 0 || !align.is_power_of_two() {
            return None;
        }
        let layout = Layout::from_size_align(size, align.max(DEFAULT_ALIGN)).ok()?;
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        NonNull::new(raw).map(|ptr| Self { ptr, layout })
    }

    #[inline]
    pub(crate) fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    #[inline]
    pub(crate) fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.layout.size()
    }

    #[inline]
    pub(crate) fn align(&self) -> usize {
        self.layout.align()
    }

    /// Can this block serve a request of `size` bytes at `align`?
    #[inline]
    pub(crate) fn fits(&self, size: usize, align: usize) -> bool {
        self.size() >= size && self.align() >= align
    }

    pub(crate) fn zero(&mut self) {
        // SAFETY: the region is owned and `size` bytes long.
        unsafe { ptr::write_bytes(self.ptr.as_ptr(), 0, self.size()) }
    }

    /// Copy the first `len` bytes of `src` into this block
    ///
    /// # Safety
    /// No other thread may write to either region during the copy.
    pub(crate) unsafe fn copy_from(&mut self, src: &Block, len: usize) {
        let len = len.min(self.size()).min(src.size());
        ptr::copy_nonoverlapping(src.ptr.as_ptr(), self.ptr.as_ptr(), len);
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        // SAFETY: allocated in `allocate_zeroed` with this exact layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("size", &self.size())
            .field("align", &self.align())
            .finish()
    }
}

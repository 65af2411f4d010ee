//! Kernel heap façade: `kmalloc`/`kfree`, and the `GlobalAlloc` impl that
//! lets ordinary `alloc::boxed::Box`/`Vec`/`BTreeMap` work throughout the
//! kernel.
//!
//! Requests at or below [`slab::MAX_SLAB_SIZE`] go to the slab allocator;
//! anything larger goes straight to the VMM's page-backed
//! `alloc_contiguous_kmem`, which keeps its own leading page-count header.
//! `kfree` tells the two apart with [`slab::is_slab`] rather than asking the
//! caller to remember which path served a given pointer.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::NonNull;

use crate::mm::slab;
use crate::mm::vmm;

/// Allocates at least `size` bytes, zero-initialized only at the chunk's
/// creation (reused chunks are **not** re-zeroed — callers that need that
/// must zero themselves, matching `malloc`'s contract).
pub fn kmalloc(size: usize) -> *mut u8 {
    if size == 0 {
        return core::ptr::null_mut();
    }
    if let Some(class) = slab::size_class_for(size) {
        slab::alloc(class).as_ptr()
    } else {
        vmm::alloc_contiguous_kmem(size)
    }
}

/// Frees a pointer returned by [`kmalloc`]. A null pointer is a no-op.
///
/// # Safety
/// `ptr` must have been returned by `kmalloc` and not already freed.
pub unsafe fn kfree(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    // SAFETY: `ptr` is non-null and was allocated by `kmalloc`, so it is
    // either a slab chunk or a contiguous-kmem block; `is_slab` only reads
    // the header of the page it falls within, which is guaranteed mapped.
    if unsafe { slab::is_slab(ptr) } {
        // SAFETY: confirmed above to be a live slab chunk.
        unsafe { slab::free(ptr) };
    } else {
        vmm::free_contiguous_kmem(ptr);
    }
}

/// `GlobalAlloc` wrapper over [`kmalloc`]/[`kfree`], ignoring requested
/// alignment above what the size class already guarantees (every size class
/// is a power of two, so natural alignment equals the class size, which
/// covers every `Layout` the kernel constructs types with up to 1 KiB).
pub struct KernelHeap;

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        kmalloc(layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        // SAFETY: `ptr` was returned by `alloc` above, i.e. by `kmalloc`.
        unsafe { kfree(ptr) };
    }
}

#[cfg(target_os = "none")]
#[global_allocator]
static HEAP: KernelHeap = KernelHeap;

/// Allocates `size` bytes and returns them as a `NonNull<u8>`, panicking on
/// allocation failure rather than returning null — convenience wrapper for
/// call sites (process/fd table growth) that would otherwise immediately
/// assert non-null themselves.
pub fn kmalloc_nonnull(size: usize) -> NonNull<u8> {
    NonNull::new(kmalloc(size)).expect("kmalloc: allocation failed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_size_returns_null() {
        assert!(kmalloc(0).is_null());
    }
}

//! Fixed-size-class slab allocator over single kernel pages.
//!
//! Each slab is exactly one [`crate::mm::pmm::FRAME_SIZE`] kernel page,
//! carved into equal-size chunks for one of six size classes. A magic-tagged
//! header at the foot of the page (so chunk 0 stays naturally aligned) tracks
//! a singly-linked intrusive free list through the unused chunks themselves —
//! the same trick the kernel heap's large-allocation path uses for its
//! page-count header, just at chunk granularity instead of page granularity.

use core::ptr::NonNull;

use crate::mm::pmm::FRAME_SIZE;
use crate::mm::vmm;
use crate::sync::IrqSpinLock;

/// Marks a page as a live slab header, to catch a stray `kfree` of a pointer
/// that was never allocated from a slab.
const SLAB_MAGIC: u32 = 0x51AB_5EED;

/// Size classes the slab allocator serves. `kmalloc` picks the smallest
/// class that fits; anything larger is the kernel heap's job.
pub const SIZE_CLASSES: [usize; 6] = [32, 64, 128, 256, 512, 1024];

/// Largest request the slab allocator will serve; above this, `kmalloc`
/// falls through to page-backed allocation.
pub const MAX_SLAB_SIZE: usize = 1024;

/// Returns the smallest size class that fits `size`, if any.
pub fn size_class_for(size: usize) -> Option<usize> {
    SIZE_CLASSES.iter().copied().find(|&class| size <= class)
}

fn class_index(size_class: usize) -> usize {
    SIZE_CLASSES
        .iter()
        .position(|&c| c == size_class)
        .expect("invalid slab size class")
}

/// Header embedded at a fixed offset in every slab page.
#[repr(C)]
struct SlabHeader {
    magic: u32,
    size_class_index: u32,
    free_chunks: u32,
    _pad: u32,
    free_head: *mut u8,
    prev: *mut SlabHeader,
    next: *mut SlabHeader,
}

/// One free list per size class, each a doubly-linked chain of slab pages
/// with at least one free chunk, plus the total number of slab pages
/// (partial or full) currently backing this class.
struct SlabClass {
    partial: *mut SlabHeader,
    slab_count: usize,
}

impl SlabClass {
    const fn empty() -> Self {
        Self {
            partial: core::ptr::null_mut(),
            slab_count: 0,
        }
    }
}

// SAFETY: all access to the raw pointers inside is serialized by the
// enclosing `IrqSpinLock`.
unsafe impl Send for SlabClass {}

struct SlabAllocatorState {
    classes: [SlabClass; SIZE_CLASSES.len()],
}

static STATE: IrqSpinLock<SlabAllocatorState> = IrqSpinLock::new(SlabAllocatorState {
    classes: [
        SlabClass::empty(),
        SlabClass::empty(),
        SlabClass::empty(),
        SlabClass::empty(),
        SlabClass::empty(),
        SlabClass::empty(),
    ],
});

/// Number of chunks a slab of `size_class` bytes holds, reserving the tail
/// of the page for the header.
fn chunks_per_slab(size_class: usize) -> usize {
    (FRAME_SIZE as usize - core::mem::size_of::<SlabHeader>()) / size_class
}

fn header_of(slab_page: *mut u8) -> *mut SlabHeader {
    let chunks_region = FRAME_SIZE as usize - core::mem::size_of::<SlabHeader>();
    // SAFETY: every slab page is a full `FRAME_SIZE` allocation; the header
    // lives in the trailing bytes past the chunk region.
    unsafe { slab_page.add(chunks_region) as *mut SlabHeader }
}

fn new_slab(size_class: usize) -> *mut SlabHeader {
    let page = vmm::alloc_kpage();
    let header = header_of(page);
    let n = chunks_per_slab(size_class);

    // Thread every chunk onto the free list, each chunk's first 8 bytes
    // holding the address of the next free chunk (or null for the last).
    let mut prev: *mut u8 = core::ptr::null_mut();
    for i in (0..n).rev() {
        // SAFETY: `i < n` so `page + i * size_class` stays within the
        // chunk region reserved by `chunks_per_slab`.
        let chunk = unsafe { page.add(i * size_class) };
        // SAFETY: every size class is >= 32 bytes, so a chunk has room for
        // a `*mut u8` link at its start.
        unsafe { (chunk as *mut *mut u8).write(prev) };
        prev = chunk;
    }

    // SAFETY: `header` points at freshly allocated, writable memory sized
    // to hold `SlabHeader`.
    unsafe {
        header.write(SlabHeader {
            magic: SLAB_MAGIC,
            size_class_index: class_index(size_class) as u32,
            free_chunks: n as u32,
            _pad: 0,
            free_head: prev,
            prev: core::ptr::null_mut(),
            next: core::ptr::null_mut(),
        });
    }
    header
}

fn free_slab(header: *mut SlabHeader) {
    // SAFETY: `header` is a slab header at the tail of its own page; the
    // page base is the header address minus the chunk region size.
    let page = unsafe { (header as *mut u8).sub(FRAME_SIZE as usize - core::mem::size_of::<SlabHeader>()) };
    vmm::free_kpage(page);
}

/// Allocates a single chunk of `size_class` bytes.
pub fn alloc(size_class: usize) -> NonNull<u8> {
    let idx = class_index(size_class);
    let mut state = STATE.lock();
    let class = &mut state.classes[idx];

    if class.partial.is_null() {
        let header = new_slab(size_class);
        // SAFETY: newly created, not linked anywhere else yet.
        unsafe { (*header).prev = core::ptr::null_mut() };
        class.partial = header;
        class.slab_count += 1;
    }

    let header = class.partial;
    // SAFETY: `header` is a live slab with `free_chunks > 0` (a slab with
    // zero free chunks is unlinked from `partial` in the branch below), so
    // `free_head` is non-null.
    let chunk = unsafe { (*header).free_head };
    // SAFETY: `chunk` was linked by `new_slab` or a prior `free`, each
    // storing the next free chunk's address (or null) at its first 8 bytes.
    let next_free = unsafe { (chunk as *mut *mut u8).read() };

    // SAFETY: `header` is a valid, currently-locked slab header.
    unsafe {
        (*header).free_head = next_free;
        (*header).free_chunks -= 1;
        if (*header).free_chunks == 0 {
            class.partial = (*header).next;
            if !class.partial.is_null() {
                (*class.partial).prev = core::ptr::null_mut();
            }
            (*header).next = core::ptr::null_mut();
        }
    }

    NonNull::new(chunk).expect("slab chunk pointer is never null")
}

/// Returns `true` if `ptr` looks like it was allocated by [`alloc`] (its
/// containing page carries the slab magic), without freeing it.
///
/// # Safety
/// `ptr` must point to the start of a page-aligned region, or into the
/// interior of a live slab-owned page; reading outside an allocated frame
/// is undefined behavior.
pub unsafe fn is_slab(ptr: *mut u8) -> bool {
    let page = (ptr as usize & !(FRAME_SIZE as usize - 1)) as *mut u8;
    let header = header_of(page);
    // SAFETY: caller guarantees `ptr` falls within an allocated page; the
    // header lives at the computed offset within that same page.
    unsafe { (*header).magic == SLAB_MAGIC }
}

/// Frees a chunk previously returned by [`alloc`].
///
/// # Safety
/// `ptr` must have been returned by a prior call to [`alloc`] and not
/// already freed.
pub unsafe fn free(ptr: *mut u8) {
    let page = (ptr as usize & !(FRAME_SIZE as usize - 1)) as *mut u8;
    let header = header_of(page);
    // SAFETY: caller guarantees `ptr` came from `alloc`, so `page` is a live
    // slab page and `header` is its header.
    let size_class_index = unsafe { (*header).size_class_index as usize };
    let size_class = SIZE_CLASSES[size_class_index];

    let mut state = STATE.lock();
    let class = &mut state.classes[size_class_index];

    // SAFETY: `header` is a valid slab header, and access to it is
    // serialized by the lock just acquired.
    unsafe {
        let was_full = (*header).free_chunks == 0;
        (ptr as *mut *mut u8).write((*header).free_head);
        (*header).free_head = ptr;
        (*header).free_chunks += 1;

        if was_full {
            (*header).next = class.partial;
            if !class.partial.is_null() {
                (*class.partial).prev = header;
            }
            class.partial = header;
        }

        // A fully-free slab is only destroyed if another slab remains to
        // serve this class; the last/only slab is kept as the class's
        // allocatable pool rather than returned to the VMM.
        if (*header).free_chunks as usize == chunks_per_slab(size_class) && class.slab_count > 1 {
            let prev = (*header).prev;
            let next = (*header).next;
            if !prev.is_null() {
                (*prev).next = next;
            } else {
                class.partial = next;
            }
            if !next.is_null() {
                (*next).prev = prev;
            }
            class.slab_count -= 1;
            drop(state);
            free_slab(header);
            return;
        }
    }
}

//! Bitmap-based physical frame allocator.
//!
//! One bit per 4 KiB frame, packed into `u64` words so the scan can use
//! `trailing_zeros` (TZCNT on x86-64) to find a free bit within a word
//! instead of testing bit-by-bit. Bit set means allocated/reserved.
//!
//! The bitmap itself is a fixed-size static array rather than one sized at
//! boot time from the memory map: frames above the tracked cap are simply
//! never reported as free, which is the `add_free_memory` truncation the
//! public surface documents.

use crate::addr::PhysAddr;
use crate::sync::IrqSpinLock;

/// Size of a physical frame.
pub const FRAME_SIZE: u64 = 4096;
const BITS_PER_WORD: usize = 64;

/// Frames above this physical address are never tracked; `add_free_memory`
/// truncates regions that extend past it.
const TRACKED_BYTES: u64 = 2 * 1024 * 1024 * 1024;
const MAX_FRAMES: usize = (TRACKED_BYTES / FRAME_SIZE) as usize;
const BITMAP_WORDS: usize = MAX_FRAMES / BITS_PER_WORD;

struct Bitmap {
    words: [u64; BITMAP_WORDS],
    /// Word index to resume `alloc_frame`'s scan from.
    cursor: usize,
    free_count: usize,
}

impl Bitmap {
    const fn all_used() -> Self {
        Self {
            words: [u64::MAX; BITMAP_WORDS],
            cursor: 0,
            free_count: 0,
        }
    }

    fn set_used(&mut self, frame_idx: usize) {
        let word = frame_idx / BITS_PER_WORD;
        let bit = frame_idx % BITS_PER_WORD;
        let mask = 1u64 << bit;
        if self.words[word] & mask == 0 {
            self.words[word] |= mask;
            self.free_count -= 1;
        }
    }

    fn set_free(&mut self, frame_idx: usize) {
        let word = frame_idx / BITS_PER_WORD;
        let bit = frame_idx % BITS_PER_WORD;
        let mask = 1u64 << bit;
        if self.words[word] & mask != 0 {
            self.words[word] &= !mask;
            self.free_count += 1;
        }
    }
}

/// Bitmap physical frame allocator.
pub struct PhysFrameAllocator(IrqSpinLock<Bitmap>);

/// The single system-wide frame allocator.
pub static PFA: PhysFrameAllocator = PhysFrameAllocator::new();

impl PhysFrameAllocator {
    const fn new() -> Self {
        Self(IrqSpinLock::new(Bitmap::all_used()))
    }

    /// Marks the entire tracked range as used. Must be called once at boot
    /// before any `add_free_memory` call.
    pub fn init(&self) {
        let mut bitmap = self.0.lock();
        *bitmap = Bitmap::all_used();
    }

    /// Marks the frames covering `[phys, phys + len)` as free.
    ///
    /// Bytes beyond the tracked cap are silently truncated. Frame 0 is
    /// always re-marked used afterward so the null physical address is
    /// never handed out, even if the bootloader reports it usable.
    pub fn add_free_memory(&self, phys: PhysAddr, len: u64) {
        let mut bitmap = self.0.lock();
        let start_frame = (phys.as_u64() / FRAME_SIZE) as usize;
        let end = phys.as_u64().saturating_add(len);
        let end_frame = ((end + FRAME_SIZE - 1) / FRAME_SIZE) as usize;
        let end_frame = end_frame.min(MAX_FRAMES);

        for frame_idx in start_frame..end_frame {
            bitmap.set_free(frame_idx);
        }
        if MAX_FRAMES > 0 {
            bitmap.set_used(0);
        }
    }

    /// Allocates a single frame. Panics if the allocator is exhausted.
    pub fn alloc_frame(&self) -> PhysAddr {
        let mut bitmap = self.0.lock();
        if bitmap.free_count == 0 {
            panic!("pmm: out of physical memory");
        }

        let start_word = bitmap.cursor;
        for offset in 0..BITMAP_WORDS {
            let word_idx = (start_word + offset) % BITMAP_WORDS;
            let word = bitmap.words[word_idx];
            if word == u64::MAX {
                continue;
            }
            let bit = (!word).trailing_zeros() as usize;
            let frame_idx = word_idx * BITS_PER_WORD + bit;
            if frame_idx >= MAX_FRAMES {
                continue;
            }
            bitmap.set_used(frame_idx);
            bitmap.cursor = (word_idx + 1) % BITMAP_WORDS;
            return PhysAddr::from_frame_index(frame_idx as u64);
        }
        panic!("pmm: out of physical memory");
    }

    /// Allocates `n` contiguous frames via a full-bitmap scan. Panics if no
    /// run of that length exists.
    pub fn alloc_contiguous_frames(&self, n: usize) -> PhysAddr {
        if n == 0 {
            return PhysAddr::zero();
        }
        let mut bitmap = self.0.lock();

        let mut run_start = 0usize;
        let mut run_len = 0usize;
        let mut found = None;

        for frame_idx in 0..MAX_FRAMES {
            let word = bitmap.words[frame_idx / BITS_PER_WORD];
            let bit = frame_idx % BITS_PER_WORD;
            let used = word & (1u64 << bit) != 0;
            if used {
                run_len = 0;
            } else {
                if run_len == 0 {
                    run_start = frame_idx;
                }
                run_len += 1;
                if run_len == n {
                    found = Some(run_start);
                    break;
                }
            }
        }

        let run_start = found.unwrap_or_else(|| panic!("pmm: no contiguous run of {n} frames"));
        for i in 0..n {
            bitmap.set_used(run_start + i);
        }
        PhysAddr::from_frame_index(run_start as u64)
    }

    /// Frees a single frame. Double-frees are silently tolerated.
    pub fn free_frame(&self, phys: PhysAddr) {
        let mut bitmap = self.0.lock();
        let frame_idx = (phys.as_u64() / FRAME_SIZE) as usize;
        if frame_idx < MAX_FRAMES {
            bitmap.set_free(frame_idx);
            bitmap.cursor = bitmap.cursor.min(frame_idx / BITS_PER_WORD);
        }
    }

    /// Frees `n` contiguous frames starting at `phys`.
    pub fn free_contiguous_frames(&self, phys: PhysAddr, n: usize) {
        let mut bitmap = self.0.lock();
        let start = (phys.as_u64() / FRAME_SIZE) as usize;
        for i in 0..n {
            let frame_idx = start + i;
            if frame_idx < MAX_FRAMES {
                bitmap.set_free(frame_idx);
            }
        }
    }

    /// Returns the number of currently free frames.
    pub fn get_free_frames(&self) -> usize {
        self.0.lock().free_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> PhysFrameAllocator {
        let pfa = PhysFrameAllocator::new();
        pfa.init();
        pfa
    }

    #[test]
    fn starts_fully_reserved() {
        let pfa = fresh();
        assert_eq!(pfa.get_free_frames(), 0);
    }

    #[test]
    fn add_free_memory_frees_region_but_not_frame_zero() {
        let pfa = fresh();
        pfa.add_free_memory(PhysAddr::zero(), 16 * FRAME_SIZE);
        assert_eq!(pfa.get_free_frames(), 15);
    }

    #[test]
    fn alloc_frame_avoids_null() {
        let pfa = fresh();
        pfa.add_free_memory(PhysAddr::zero(), 4 * FRAME_SIZE);
        for _ in 0..3 {
            let f = pfa.alloc_frame();
            assert_ne!(f, PhysAddr::zero());
        }
        assert_eq!(pfa.get_free_frames(), 0);
    }

    #[test]
    #[should_panic(expected = "out of physical memory")]
    fn alloc_frame_panics_when_exhausted() {
        let pfa = fresh();
        pfa.alloc_frame();
    }

    #[test]
    fn free_then_alloc_reuses_frame() {
        let pfa = fresh();
        pfa.add_free_memory(PhysAddr::from_frame_index(16), 4 * FRAME_SIZE);
        let a = pfa.alloc_frame();
        pfa.free_frame(a);
        let b = pfa.alloc_frame();
        assert_eq!(a, b);
    }

    #[test]
    fn double_free_is_idempotent() {
        let pfa = fresh();
        pfa.add_free_memory(PhysAddr::from_frame_index(16), FRAME_SIZE);
        let a = pfa.alloc_frame();
        pfa.free_frame(a);
        pfa.free_frame(a);
        assert_eq!(pfa.get_free_frames(), 1);
    }

    #[test]
    fn alloc_contiguous_frames_finds_a_run() {
        let pfa = fresh();
        pfa.add_free_memory(PhysAddr::from_frame_index(100), 32 * FRAME_SIZE);
        let base = pfa.alloc_contiguous_frames(8);
        assert_eq!(base.frame_index(), 100);
        assert_eq!(pfa.get_free_frames(), 24);
    }

    #[test]
    #[should_panic(expected = "no contiguous run")]
    fn alloc_contiguous_frames_panics_when_run_too_short() {
        let pfa = fresh();
        pfa.add_free_memory(PhysAddr::from_frame_index(100), 3 * FRAME_SIZE);
        pfa.alloc_contiguous_frames(4);
    }

    #[test]
    fn free_contiguous_frames_roundtrip() {
        let pfa = fresh();
        // frame 0 is reserved, so the only 8-frame run starts at frame 1.
        pfa.add_free_memory(PhysAddr::from_frame_index(0), 9 * FRAME_SIZE);
        let base = pfa.alloc_contiguous_frames(8);
        assert_eq!(base.frame_index(), 1);
        pfa.free_contiguous_frames(base, 8);
        assert_eq!(pfa.get_free_frames(), 8);
    }
}

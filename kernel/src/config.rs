//! Kernel-wide tunable constants.
//!
//! Collected in one place rather than scattered `const`s per module, since a
//! freestanding single-target kernel has no Cargo-feature-level
//! configuration surface to hang these off of.

/// Size of a page, and the unit the PFA/VMM/slab allocator all operate in.
pub const PAGE_SIZE: u64 = 4096;

/// Size of every process's kernel stack.
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

/// Size of every process's user stack.
pub const USER_STACK_SIZE: u64 = 16 * 1024;

/// Fixed low virtual address the user stack is mapped at.
pub const USER_STACK_BASE: u64 = 0x0080_0000;

/// `mmap_min_addr`-style floor below which user mappings are never placed.
pub const USER_MMAP_MIN_ADDR: u64 = 0x1_0000;

/// Desired LAPIC timer tick period, in milliseconds.
pub const TIMER_TICK_MS: u32 = 10;

/// Depth of the keyboard scancode ring buffer.
pub const KEYBOARD_RING_CAPACITY: usize = 128;

/// Depth of the tty line-editor history ring.
pub const TTY_HISTORY_CAPACITY: usize = 32;

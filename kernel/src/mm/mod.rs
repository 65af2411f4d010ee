//! Memory management: physical frames, the 4-level virtual memory manager,
//! the slab allocator, and the kernel heap façade built over both.

pub mod heap;
pub mod pmm;
pub mod slab;
pub mod vmm;

pub use pmm::PFA;

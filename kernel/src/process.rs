//! Process control blocks and ELF64-based process creation.
//!
//! Grounded on the process lifecycle description in the base design notes
//! (creation steps, termination, the two descheduling flavors) and on
//! `elf.rs`'s `parse`, which this module is the sole caller of.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::config;
use crate::context::ContextFrame;
use crate::elf;
use crate::errno::KernelError;
use crate::fs::{self, FileDescriptor, InodePrivate};
use crate::idt::InterruptFrame;
use crate::mm::vmm::{self, PageFlags, PageTable};
use crate::percpu;

/// A process's run state. Transitions follow the FSM in the base design
/// notes: `New -> Ready -> Running -> {Ready, Blocked, Dead}`, `Dead` is
/// terminal until the scheduler reaps it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    New,
    Ready,
    Running,
    Blocked,
    Dead,
}

/// Why a `Blocked` process is waiting, kept for diagnostics only — nothing
/// currently branches on it, since `Blocked` plus the two context-validity
/// booleans already fully determine how a process is resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitReason {
    Sleep,
    Io,
}

/// A process control block. Always heap-allocated and referenced through a
/// raw pointer (`Box::into_raw`/`Box::from_raw` at creation/reap): the
/// scheduler, per-CPU slot, keyboard driver, and `/dev/tty1` all need to
/// hold a pointer to the current or a waiting process without borrowing
/// through Rust's ownership rules, which a kernel's single-threaded,
/// IRQ-disciplined concurrency model makes sound.
pub struct Process {
    pub pid: u64,
    pub state: ProcessState,
    pub wait_reason: Option<WaitReason>,
    pub exit_status: i32,

    /// Saved register image for user context, valid once this process has
    /// been preempted by the timer at least once (`has_user_context`).
    /// Initialized at creation to the process's entry point and user stack,
    /// even though it is not yet the authoritative resume mechanism until
    /// the first preemption overwrites it.
    pub user_frame: InterruptFrame,

    pub pml4: *mut PageTable,
    pub fd_table: Vec<Option<FileDescriptor>>,
    pub heap_break: u64,
    pub wake_time_ticks: Option<u64>,

    /// Stack pointer into this process's kernel stack, valid only while
    /// `has_kernel_context` — the "top of a ContextFrame" the base design
    /// notes describe. Resumed via `context::context_switch`, never via
    /// `iretq`.
    pub kernel_rsp_saved: u64,
    pub kernel_stack_top: u64,
    kernel_stack: *mut u8,

    /// Two independent descheduling flavors (see `sched`'s module doc):
    /// a process can be resumable via cooperative `context_switch`
    /// (`has_kernel_context`), via the timer's interrupt-frame restore
    /// (`has_user_context`), or — only transiently — both.
    pub has_kernel_context: bool,
    pub has_user_context: bool,

    /// `(virt_addr, num_pages)` regions mapped in `pml4`, released on
    /// termination (P10).
    allocations: Vec<(vmm_addr::VirtAddr, usize)>,
}

// Re-exported under a local alias so the allocations list above reads
// naturally; `addr::VirtAddr` already has that name in every other module.
mod vmm_addr {
    pub use crate::addr::VirtAddr;
}
use vmm_addr::VirtAddr;

static NEXT_PID: core::sync::atomic::AtomicU64 = core::sync::atomic::AtomicU64::new(1);

/// Maps `p_memsz` bytes of one `PT_LOAD` segment at its (page-aligned)
/// virtual address, zeroing the whole range first and then copying
/// `p_filesz` bytes from the ELF buffer — the rest stays zero (BSS).
fn load_segment(pml4: *mut PageTable, seg: &elf::ProgramHeader, data: &[u8], allocations: &mut Vec<(VirtAddr, usize)>) -> u64 {
    let vaddr = VirtAddr::new_truncate(seg.vaddr);
    let page_start = vaddr.align_down(config::PAGE_SIZE);
    let seg_end = vaddr + seg.memsz;
    let span = seg_end - page_start;
    let num_pages = vmm::map_mem_at(pml4, page_start, span, PageFlags::WRITABLE | PageFlags::USER);
    allocations.push((page_start, num_pages));

    let file_start = vaddr;
    let file_end = vaddr + seg.filesz;

    for page_idx in 0..num_pages {
        let page_virt = page_start + (page_idx as u64) * config::PAGE_SIZE;
        let page_end = page_virt + config::PAGE_SIZE;
        let phys = vmm::virt_to_phys(pml4, page_virt).expect("segment page was just mapped");
        // SAFETY: `phys` is HHDM-resident and was just mapped exclusively
        // for this segment; no one else can observe it yet.
        let dst = unsafe { vmm::phys_to_virt::<u8>(phys) };
        unsafe { core::ptr::write_bytes(dst, 0, config::PAGE_SIZE as usize) };

        let copy_start = core::cmp::max(page_virt, file_start);
        let copy_end = core::cmp::min(page_end, file_end);
        if copy_start < copy_end {
            let len = (copy_end - copy_start) as usize;
            let file_offset = (seg.offset + (copy_start - file_start)) as usize;
            let dst_offset = (copy_start - page_virt) as usize;
            // SAFETY: `file_offset..file_offset+len` was bounds-checked by
            // `elf::parse` constructing `seg` against `data`'s length, and
            // `dst_offset..dst_offset+len` fits within the page just zeroed.
            unsafe {
                core::ptr::copy_nonoverlapping(data[file_offset..file_offset + len].as_ptr(), dst.add(dst_offset), len);
            }
        }
    }

    seg_end.as_u64()
}

impl Process {
    /// Creation steps 1-8 of the base design notes: validate the ELF
    /// buffer, build a fresh address space, map every `PT_LOAD` segment and
    /// the user stack, seed stdin/stdout/stderr at `/dev/tty1`, and leave a
    /// `ContextFrame` on a freshly allocated kernel stack so the process's
    /// first dispatch lands in the trampoline.
    pub fn create(path: &str) -> Result<*mut Process, KernelError> {
        let inode = fs::open(path, 0)?;
        let data = match &inode.private {
            InodePrivate::Regular(regular) => regular.bytes,
            _ => return Err(KernelError::InvalidArgument),
        };
        let elf_file = elf::parse(data)?;

        let pml4 = vmm::create_user_pml4();
        let mut allocations = Vec::new();
        let mut highest = elf_file.entry;
        for seg in &elf_file.segments {
            let seg_end = load_segment(pml4, seg, elf_file.data, &mut allocations);
            highest = highest.max(seg_end);
        }
        let heap_break = VirtAddr::new_truncate(highest).align_up(config::PAGE_SIZE).as_u64();

        let user_stack_base = VirtAddr::new(config::USER_STACK_BASE);
        let stack_pages = vmm::map_mem_at(pml4, user_stack_base, config::USER_STACK_SIZE, PageFlags::WRITABLE | PageFlags::USER);
        allocations.push((user_stack_base, stack_pages));
        let user_stack_top = (user_stack_base + config::USER_STACK_SIZE).as_u64();

        let selectors = crate::gdt::selectors();
        let user_frame = InterruptFrame {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            r11: 0,
            r10: 0,
            r9: 0,
            r8: 0,
            rbp: 0,
            rdi: 0,
            rsi: 0,
            rdx: 0,
            rcx: 0,
            rbx: 0,
            rax: 0,
            rip: elf_file.entry,
            cs: u64::from(selectors.user_code_selector.0),
            rflags: 0x202,
            rsp: user_stack_top,
            ss: u64::from(selectors.user_data_selector.0),
        };

        let kernel_stack = vmm::alloc_contiguous_kmem(config::KERNEL_STACK_SIZE);
        let kernel_stack_top = kernel_stack as u64 + config::KERNEL_STACK_SIZE as u64;
        let context_frame = ContextFrame::new_process(elf_file.entry, user_stack_top);
        // SAFETY: `kernel_stack_top` is the exclusive top of a
        // `KERNEL_STACK_SIZE`-byte region this process owns exclusively.
        let kernel_rsp_saved = unsafe { context_frame.push_onto(kernel_stack_top) };

        let mut fd_table = Vec::with_capacity(3);
        for _ in 0..3 {
            let tty = fs::open("/dev/tty1", 0)?;
            fd_table.push(Some(FileDescriptor { inode: tty, offset: 0, flags: 0 }));
        }

        let process = Box::new(Process {
            pid: NEXT_PID.fetch_add(1, core::sync::atomic::Ordering::Relaxed),
            state: ProcessState::New,
            wait_reason: None,
            exit_status: 0,
            user_frame,
            pml4,
            fd_table,
            heap_break,
            wake_time_ticks: None,
            kernel_rsp_saved,
            kernel_stack_top,
            kernel_stack,
            has_kernel_context: true,
            has_user_context: false,
            allocations,
        });

        Ok(Box::into_raw(process))
    }

    /// Closes every open descriptor, unmaps and frees every recorded
    /// allocation (and the address space's page tables), and frees the
    /// kernel stack. Does not free the `Process` object itself — that is
    /// `reap`'s job, once the scheduler has switched away from it.
    fn teardown(&mut self) {
        for fd in self.fd_table.iter_mut().flatten() {
            fd.close();
        }
        self.fd_table.clear();
        for (virt, num_pages) in self.allocations.drain(..) {
            vmm::unmap_mem_at(self.pml4, virt, num_pages);
        }
        vmm::free_page_tables(self.pml4);
        vmm::free_contiguous_kmem(self.kernel_stack);
    }
}

/// Frees a `Dead` process entirely: its resources (`teardown`) and then the
/// `Process` allocation itself. The caller must guarantee `p` is not the
/// CPU's current process (see `sched`'s reap hook).
///
/// # Safety
/// `p` must be a valid pointer returned by `Process::create` that has not
/// already been reaped.
pub unsafe fn reap(p: *mut Process) {
    // SAFETY: forwarded to the caller; `p` is uniquely owned once reap runs
    // (nothing still references a `Dead`, not-current process).
    let mut boxed = unsafe { Box::from_raw(p) };
    boxed.teardown();
}

/// Marks the current process `Dead` and hands the CPU to the scheduler,
/// which picks a replacement and reaps this process once it is safe to.
///
/// # Safety
/// Must be called from the current process's own execution context (a
/// syscall handler), with a valid per-CPU current process installed.
pub unsafe fn exit_current(code: i32) -> ! {
    // SAFETY: `current_process` returns the installed per-CPU process,
    // which is exactly the one this function is documented to run on.
    let current = unsafe { current_process() };
    unsafe {
        (*current).state = ProcessState::Dead;
        (*current).exit_status = code;
        (*current).has_user_context = false;
    }
    crate::sched::die(current)
}

/// Returns the process currently installed on this CPU's per-CPU slot.
///
/// # Safety
/// Must only be called after `percpu::init` and while a process is
/// installed (i.e. not during early boot before the first `sched::run`).
pub unsafe fn current_process() -> *mut Process {
    // SAFETY: forwarded to the caller.
    unsafe { percpu::current().process }
}

/// Wakes `process` if it is currently `Blocked`. Called from the keyboard
/// ISR (and any future event source) to hand a waiting process back to the
/// scheduler without it having to poll.
///
/// # Safety
/// `process` must be a live, not-yet-reaped process pointer.
pub unsafe fn wake_if_blocked(process: *mut Process) {
    // SAFETY: forwarded to the caller.
    unsafe {
        if (*process).state == ProcessState::Blocked {
            (*process).state = ProcessState::Ready;
            (*process).wake_time_ticks = None;
            (*process).wait_reason = None;
        }
    }
}

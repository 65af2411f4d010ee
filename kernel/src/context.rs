//! Cooperative context switching and the one-shot trampoline a brand-new
//! process's first switch lands in.
//!
//! Two of the five hand-written assembly stubs this kernel needs live here:
//! [`context_switch`] and [`trampoline`]. The other three are the IDT timer
//! stub (`idt::timer_entry`), the SYSCALL entry stub (`syscall::syscall_entry`),
//! and `syscall::sysret_to_user`. Everything else is typed Rust calling typed
//! Rust.

use core::arch::naked_asm;

use crate::gdt;
use crate::idt::InterruptFrame;

/// Ring 3 code selector: GDT offset 0x30 (see `gdt`'s layout doc comment),
/// RPL 3.
const USER_CODE_SELECTOR: u64 = 0x30 | 3;
/// Ring 3 data/stack selector: GDT offset 0x28, RPL 3.
const USER_DATA_SELECTOR: u64 = 0x28 | 3;

/// RFLAGS a freshly started process runs with: interrupts enabled, nothing
/// else.
const USER_RFLAGS: u64 = 0x202;

/// Debug sentinels left in the callee-saved slots of a synthesized
/// [`ContextFrame`] that nothing ever reads as real register values — a
/// process's first `context_switch` lands in [`trampoline`], not in ordinary
/// compiled code that would expect `rbx`/`rbp`/`r12`/`r13` to hold anything
/// in particular. Visible in a stack dump if one of them ever is read.
const SENTINEL_RBP: u64 = 0xDEAD_0000_0000_00BD;
const SENTINEL_RBX: u64 = 0xDEAD_0000_0000_00B4;
const SENTINEL_R12: u64 = 0xDEAD_0000_0000_0012;
const SENTINEL_R13: u64 = 0xDEAD_0000_0000_0013;

/// The callee-saved register set [`context_switch`] preserves across a
/// cooperative yield, laid out exactly as its push sequence leaves it on the
/// kernel stack (lowest address first, matching the order `context_switch`
/// pops them back off).
///
/// For a process that has never run, this frame is synthesized rather than
/// saved: `rip` points at [`trampoline`], `r15` holds the user entry point
/// and `r14` the user stack top (the two registers `trampoline` reads the
/// moment it is `ret`-ed into), and the remaining callee-saved slots are the
/// sentinels above.
#[repr(C)]
pub struct ContextFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub rip: u64,
}

impl ContextFrame {
    /// Builds the frame a new process's kernel stack starts with: the first
    /// [`context_switch`] into it lands in [`trampoline`], which drops to
    /// ring 3 at `entry` with stack pointer `user_stack_top`.
    pub fn new_process(entry: u64, user_stack_top: u64) -> Self {
        Self {
            r15: entry,
            r14: user_stack_top,
            r13: SENTINEL_R13,
            r12: SENTINEL_R12,
            rbx: SENTINEL_RBX,
            rbp: SENTINEL_RBP,
            rip: trampoline as u64,
        }
    }

    /// Writes this frame at the top of a kernel stack spanning
    /// `..stack_top`, and returns the resulting stack pointer — the value to
    /// save as the process's kernel RSP before its first
    /// [`context_switch`].
    ///
    /// # Safety
    /// `stack_top` must be the exclusive top of a region at least
    /// `size_of::<ContextFrame>()` bytes long, 8-byte aligned, that the
    /// caller owns exclusively.
    pub unsafe fn push_onto(self, stack_top: u64) -> u64 {
        let frame_addr = stack_top - core::mem::size_of::<ContextFrame>() as u64;
        // SAFETY: forwarded to the caller's obligations above.
        unsafe {
            core::ptr::write(frame_addr as *mut ContextFrame, self);
        }
        frame_addr
    }
}

/// Switches from the currently running kernel context to `new_rsp`.
///
/// Pushes the caller's callee-saved registers onto the current stack (the
/// return address is already there courtesy of the `call` that reached this
/// function), stores the resulting stack pointer through `old_rsp_ptr`,
/// then pops the same registers back off `new_rsp` and `ret`s into whatever
/// return address sits above them. For a process that has never run, that
/// lands in [`trampoline`]; for one that previously yielded by calling
/// `context_switch` itself (`sched`'s cooperative path), it resumes right
/// after that call as an ordinary function return.
///
/// # Safety
/// `old_rsp_ptr` must point at storage the caller owns, and `new_rsp` must
/// be a stack pointer produced by [`ContextFrame::push_onto`] or by a prior
/// `context_switch` writing through its own `old_rsp_ptr`. Callers must hold
/// interrupts disabled: the scheduler's run list and the per-CPU kernel RSP
/// slot are not safe to read while a switch is in flight.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(old_rsp_ptr: *mut u64, new_rsp: u64) {
    naked_asm!(
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov [rdi], rsp",
        "mov rsp, rsi",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
    );
}

/// Entered exactly once per process, via `context_switch`'s `ret` the first
/// time that process is switched to. `r15`/`r14` hold the user entry point
/// and user stack top that [`ContextFrame::new_process`] put there; this
/// builds an `iretq` frame from them and drops to ring 3.
///
/// Never returns to its caller in the ordinary sense: user code runs until
/// it syscalls, faults, or is preempted by the timer, none of which come
/// back through here.
#[unsafe(naked)]
extern "C" fn trampoline() -> ! {
    naked_asm!(
        "mov rdi, r15",
        "mov rsi, r14",
        "mov ax, {user_ss}",
        "mov ds, ax",
        "mov es, ax",
        "mov fs, ax",
        // GS is deliberately left untouched: its base holds the per-CPU
        // pointer, installed once by `percpu::init` via `IA32_GS_BASE` and
        // never swapped. Reloading the GS selector here would reset that
        // base back to the flat user-data descriptor's base of 0.
        "push {user_ss}",
        "push rsi",
        "push {user_rflags}",
        "push {user_cs}",
        "push rdi",
        "iretq",
        user_ss = const USER_DATA_SELECTOR,
        user_rflags = const USER_RFLAGS,
        user_cs = const USER_CODE_SELECTOR,
    );
}

/// Restores a saved [`InterruptFrame`] directly and `iretq`s into it,
/// without going through an interrupt at all.
///
/// Mirrors the pop half of `idt::timer_entry` exactly: `InterruptFrame`'s
/// field order is laid out (`#[repr(C)]`) so that reading it forward from
/// its first field is the same sequence of values that stub leaves on the
/// stack for its own `pop`/`iretq` tail, so the same instruction sequence
/// restores either one. Used by the scheduler to dispatch a process whose
/// only valid context is a preempted user frame, from a place (a dying
/// process's exit path) that is not itself inside a timer interrupt.
///
/// # Safety
/// `frame` must point at a live, fully populated `InterruptFrame` describing
/// a process the caller has already installed as the current process on
/// this CPU.
#[unsafe(naked)]
pub unsafe extern "C" fn resume_interrupt_frame(frame: *const InterruptFrame) -> ! {
    naked_asm!(
        "mov rsp, rdi",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "iretq",
    );
}

/// Checks the ring-3 selector constants above against the live GDT. Call
/// once at boot, after `gdt::init`.
pub fn init() {
    let selectors = gdt::selectors();
    debug_assert_eq!(
        u64::from(selectors.user_code_selector.0),
        USER_CODE_SELECTOR
    );
    debug_assert_eq!(
        u64::from(selectors.user_data_selector.0),
        USER_DATA_SELECTOR
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_frame_is_exactly_seven_registers() {
        assert_eq!(core::mem::size_of::<ContextFrame>(), 7 * 8);
    }

    #[test]
    fn new_process_frame_carries_entry_and_stack_in_r15_r14() {
        let frame = ContextFrame::new_process(0x4000, 0x8000);
        assert_eq!(frame.r15, 0x4000);
        assert_eq!(frame.r14, 0x8000);
        assert_eq!(frame.rip, trampoline as u64);
    }
}

//! SYSCALL/SYSRET fast path: MSR programming for the ring 3 <-> ring 0
//! transition, and the syscall table it dispatches into (§4.6, §6).
//!
//! Mirrors `idt.rs`'s `timer_entry`/`InterruptFrame` pattern: a naked stub
//! builds a GPR frame on the kernel stack and hands Rust a pointer to it,
//! rather than going through the `x86-interrupt` ABI (which hides GPRs and
//! in any case cannot express SYSCALL's entry conventions at all). Unlike
//! `timer_entry`, this stub also has to swap RSP itself — SYSCALL, unlike an
//! interrupt, does not touch the stack pointer — using the two fixed
//! `%gs`-relative slots `percpu.rs` documents as this module's contract.
//!
//! No `swapgs`: per `percpu::init`, `GS_BASE` is fixed at boot and
//! `KERNEL_GS_BASE` stays zero, since user code in this kernel never touches
//! the GS segment register.

use core::arch::naked_asm;

use crate::errno::{self, KernelError};
use crate::fs::SeekWhence;
use crate::gdt;
use crate::msr::{rdmsr, wrmsr, EFER_SCE, IA32_EFER, IA32_FMASK, IA32_LSTAR, IA32_STAR};
use crate::process::{self, ProcessState, WaitReason};
use crate::sched;

pub const SYS_READ: u64 = 0;
pub const SYS_WRITE: u64 = 1;
pub const SYS_LSEEK: u64 = 8;
pub const SYS_SLEEP_MS: u64 = 35;
pub const SYS_GETPID: u64 = 39;
pub const SYS_EXIT: u64 = 60;

/// RFLAGS bits cleared on SYSCALL entry: TF (8), IF (9), DF (10). Matching
/// interrupt gates, the kernel runs with interrupts off until it chooses to
/// re-enable them; nothing in the syscall path currently does.
const SFMASK_BITS: u64 = (1 << 8) | (1 << 9) | (1 << 10);

/// Every general-purpose register, as pushed by [`syscall_entry`]'s
/// prologue. No CS/SS/RIP/RFLAGS here — unlike an interrupt, SYSCALL leaves
/// those in RCX/R11 and the segment registers untouched, and this kernel
/// never inspects them.
#[repr(C)]
pub struct SyscallFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
}

/// Programs `EFER.SCE`, `STAR`, `LSTAR`, and `FMASK` from the live GDT
/// selectors. Must run after [`gdt::init`]; has no effect on ordering with
/// respect to `idt::init`, since SYSCALL does not go through the IDT.
///
/// SYSRET (64-bit, `REX.W`) computes `CS = STAR[63:48]+16`,
/// `SS = STAR[63:48]+8`; SYSCALL computes `CS = STAR[47:32]`,
/// `SS = STAR[47:32]+8`. Deriving both fields from `gdt::selectors()` rather
/// than hardcoding them keeps this in lockstep with the GDT layout
/// `gdt.rs` documents.
pub fn init() {
    let selectors = gdt::selectors();
    let kernel_cs = u64::from(selectors.code_selector.0 & !0x3);
    let user_data_base = u64::from(selectors.user_data_selector.0 & !0x3);
    let user_code_base = u64::from(selectors.user_code_selector.0 & !0x3);
    let sysret_base = user_data_base - 8;
    debug_assert_eq!(sysret_base + 8, user_data_base);
    debug_assert_eq!(sysret_base + 16, user_code_base);

    let star = (sysret_base << 48) | (kernel_cs << 32);

    // SAFETY: programs the well-known SYSCALL MSRs with a target RIP
    // (this module's own entry stub) and selectors drawn from the GDT this
    // kernel just loaded.
    unsafe {
        let efer = rdmsr(IA32_EFER);
        wrmsr(IA32_EFER, efer | EFER_SCE);
        wrmsr(IA32_STAR, star);
        wrmsr(IA32_LSTAR, syscall_entry as u64);
        wrmsr(IA32_FMASK, SFMASK_BITS);
    }
}

/// Naked SYSCALL entry point. Swaps to the current process's kernel stack
/// through the per-CPU `user_rsp`/`kernel_rsp` slots (`percpu.rs`'s fixed
/// `%gs` offsets 0x10/0x08), pushes every GPR, calls [`dispatch_syscall`]
/// with a pointer to the resulting [`SyscallFrame`], then restores the
/// user stack and `sysretq`s back to ring 3.
#[unsafe(naked)]
pub unsafe extern "C" fn syscall_entry() -> ! {
    naked_asm!(
        "mov gs:0x10, rsp",
        "mov rsp, gs:0x08",
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbp",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov rdi, rsp",
        "call {dispatch}",
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
        "mov rsp, gs:0x10",
        "sysretq",
        dispatch = sym dispatch_syscall,
    );
}

fn with_current_fd<R>(fd: i32, f: impl FnOnce(&mut crate::fs::FileDescriptor) -> Result<R, KernelError>) -> Result<R, KernelError> {
    if fd < 0 {
        return Err(KernelError::BadFileDescriptor);
    }
    // SAFETY: the current process is installed and alive for the duration
    // of this syscall.
    unsafe {
        let current = process::current_process();
        let slot = (*current).fd_table.get_mut(fd as usize).ok_or(KernelError::BadFileDescriptor)?;
        let descriptor = slot.as_mut().ok_or(KernelError::BadFileDescriptor)?;
        f(descriptor)
    }
}

fn sys_read(fd: i32, buf_ptr: u64, len: usize) -> i64 {
    // SAFETY: SYSCALL does not change CR3, so the caller's own mappings are
    // still live; `buf_ptr..buf_ptr+len` is a range the process itself
    // handed us for its own use. A malformed pointer here faults the same
    // way it would in the process's own code, not a kernel memory-safety
    // issue.
    let buf = unsafe { core::slice::from_raw_parts_mut(buf_ptr as *mut u8, len) };
    match with_current_fd(fd, |descriptor| descriptor.read(buf)) {
        Ok(n) => n as i64,
        Err(e) => e.into(),
    }
}

fn sys_write(fd: i32, buf_ptr: u64, len: usize) -> i64 {
    // SAFETY: see `sys_read`.
    let buf = unsafe { core::slice::from_raw_parts(buf_ptr as *const u8, len) };
    match with_current_fd(fd, |descriptor| descriptor.write(buf)) {
        Ok(n) => n as i64,
        Err(e) => e.into(),
    }
}

fn sys_lseek(fd: i32, offset: i64, whence: i32) -> i64 {
    let whence = match whence {
        0 => SeekWhence::Set,
        1 => SeekWhence::Cur,
        2 => SeekWhence::End,
        _ => return -errno::EINVAL,
    };
    match with_current_fd(fd, |descriptor| descriptor.lseek(offset, whence)) {
        Ok(n) => n as i64,
        Err(e) => e.into(),
    }
}

/// Blocks the calling process until at least `ms` milliseconds of LAPIC
/// ticks have elapsed. `sched::wake_sleepers` (run from the timer handler)
/// is what actually moves it back to `Ready`.
fn sys_sleep_ms(ms: u64) -> i64 {
    let ticks_to_wait = ms.div_ceil(u64::from(crate::config::TIMER_TICK_MS)).max(1);
    let wake_at = crate::apic::ticks() + ticks_to_wait;
    // SAFETY: runs in the calling process's own syscall context, which is
    // `yield_blocked`'s precondition.
    unsafe {
        let current = process::current_process();
        (*current).state = ProcessState::Blocked;
        (*current).wait_reason = Some(WaitReason::Sleep);
        (*current).wake_time_ticks = Some(wake_at);
        sched::yield_blocked();
    }
    0
}

fn sys_getpid() -> i64 {
    // SAFETY: see `sys_sleep_ms`.
    unsafe { (*process::current_process()).pid as i64 }
}

/// Rust side of the SYSCALL entry: dispatches on `rax` and writes the
/// return value back into it, the same in-place convention
/// `idt::timer_handler` uses for its frame. `SYS_EXIT` is handled before the
/// table since `exit_current` never returns here.
extern "C" fn dispatch_syscall(frame: *mut SyscallFrame) {
    // SAFETY: `frame` points at the `SyscallFrame` `syscall_entry` just
    // built on its own stack; it stays valid for the duration of this call.
    let frame = unsafe { &mut *frame };

    // This stack frame is now the calling process's valid kernel context,
    // resumable via `context::context_switch` the same as a cooperative
    // yield, whether or not this particular syscall goes on to block.
    //
    // SAFETY: `dispatch_syscall` runs in the context of the process whose
    // syscall this is.
    unsafe {
        (*process::current_process()).has_kernel_context = true;
    }

    if frame.rax == SYS_EXIT {
        // SAFETY: `dispatch_syscall` runs in the context of the process
        // whose syscall this is.
        unsafe { process::exit_current(frame.rdi as i32) }
    }

    let result: i64 = match frame.rax {
        SYS_READ => sys_read(frame.rdi as i32, frame.rsi, frame.rdx as usize),
        SYS_WRITE => sys_write(frame.rdi as i32, frame.rsi, frame.rdx as usize),
        SYS_LSEEK => sys_lseek(frame.rdi as i32, frame.rsi as i64, frame.rdx as i32),
        SYS_SLEEP_MS => sys_sleep_ms(frame.rdi),
        SYS_GETPID => sys_getpid(),
        other => {
            log::warn!("syscall: unknown number {other}");
            -errno::ENOSYS
        }
    };
    frame.rax = result as u64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syscall_frame_has_no_padding() {
        assert_eq!(core::mem::size_of::<SyscallFrame>(), 15 * 8);
    }

    #[test]
    fn star_derivation_matches_the_documented_gdt_layout() {
        // Mirrors `gdt.rs`'s documented layout without depending on a live
        // GDT: kernel code 0x08, user data base 0x28, user code base 0x30.
        let kernel_cs: u64 = 0x08;
        let user_data_base: u64 = 0x28;
        let user_code_base: u64 = 0x30;
        let sysret_base = user_data_base - 8;
        assert_eq!(sysret_base, 0x20);
        assert_eq!(sysret_base + 8, user_data_base);
        assert_eq!(sysret_base + 16, user_code_base);
        let star = (sysret_base << 48) | (kernel_cs << 32);
        assert_eq!(star, (0x20u64 << 48) | (0x08u64 << 32));
    }
}

//! Round-robin scheduler.
//!
//! Two context flavors share one run queue, resumed by two different
//! mechanisms depending on which flavor a process last went off the CPU
//! with:
//!
//!   - `has_user_context`: preempted by the timer while running in ring 3.
//!     Resumed by copying its saved [`InterruptFrame`] back into the frame
//!     the *next* timer interrupt leaves on the stack, so `iretq` drops
//!     straight into it — see [`on_timer_interrupt`].
//!   - `has_kernel_context`: gave up the CPU cooperatively (a blocking
//!     syscall, or it has never run at all). Resumed by
//!     `context::context_switch`ing into its parked kernel stack — see
//!     [`yield_blocked`].
//!
//! A process can have both valid only for the instant between creation and
//! its first dispatch through [`run`]. `on_timer_interrupt`'s Schedule hook
//! prefers a `has_kernel_context` candidate over a `has_user_context` one:
//! parking the just-preempted process into its own interrupted stack frame
//! and `context_switch`ing into the other process's kernel stack is sound
//! even from inside the ISR, since [`context_switch`](context::context_switch)
//! only manipulates the stack pointer — it works identically whether called
//! from ordinary kernel code or from a timer handler deep in its call chain.
//! The parked process resumes, much later, right after that call, and falls
//! through to the timer stub's own `iretq`, landing exactly where it was
//! interrupted.

use alloc::vec::Vec;

use crate::context;
use crate::gdt;
use crate::idt::InterruptFrame;
use crate::mm::vmm;
use crate::percpu;
use crate::process::{self, Process, ProcessState};
use crate::sync::IrqSpinLock;

static RUN_QUEUE: IrqSpinLock<Vec<*mut Process>> = IrqSpinLock::new(Vec::new());

/// Installs `p` as the CPU's current process: reloads CR3 to its address
/// space and updates the per-CPU process pointer and the two stack-top slots
/// a ring-3 -> ring-0 transition reads before any kernel code runs —
/// TSS.RSP0 (for interrupts) and per-CPU `kernel_rsp` (for SYSCALL). The
/// stack-top slots are just `p`'s fixed kernel-stack top: syscalls and
/// interrupts don't nest for a given process, so every transition starts a
/// fresh frame there.
///
/// Every place this scheduler hands the CPU to a process — `run`, both
/// branches of `schedule`, both branches of `yield_blocked`, and both
/// branches of `die` — calls this first, so a process always resumes with
/// its own address space installed, whether it is dispatched via
/// `context_switch` or via a direct `InterruptFrame`/trampoline restore.
///
/// # Safety
/// `p` must be a live process.
unsafe fn install_current(p: *mut Process) {
    // SAFETY: forwarded to the caller.
    unsafe {
        vmm::switch_pml4((*p).pml4);
        percpu::current().process = p;
        percpu::current().kernel_rsp = (*p).kernel_stack_top;
        gdt::set_kernel_stack((*p).kernel_stack_top);
    }
}

/// Registers a freshly created process with the scheduler as `Ready`.
pub fn enqueue(p: *mut Process) {
    // SAFETY: `p` was just returned by `Process::create` and is not yet
    // visible to anything else.
    unsafe {
        (*p).state = ProcessState::Ready;
    }
    RUN_QUEUE.lock().push(p);
}

/// Creates a process from the ELF image at `path` and enqueues it.
pub fn spawn(path: &str) -> Result<u64, crate::errno::KernelError> {
    let p = Process::create(path)?;
    // SAFETY: `p` was just created.
    let pid = unsafe { (*p).pid };
    enqueue(p);
    Ok(pid)
}

fn find_ready(queue: &[*mut Process], exclude: *mut Process, pred: impl Fn(&Process) -> bool) -> Option<*mut Process> {
    queue.iter().copied().find(|&p| {
        p != exclude
            && unsafe {
                // SAFETY: every pointer in `RUN_QUEUE` is a live process
                // until `reap_dead` removes it under the same lock.
                (*p).state == ProcessState::Ready && pred(&*p)
            }
    })
}

/// Entry point called once at boot, after the initial process(es) have been
/// enqueued. Enables interrupts and `context_switch`es into the first
/// `Ready` process; never returns.
pub fn run() -> ! {
    let first = {
        let queue = RUN_QUEUE.lock();
        find_ready(&queue, core::ptr::null_mut(), |_| true)
    }
    .expect("sched::run called with no process enqueued");

    // SAFETY: `first` is `Ready` with a valid parked kernel context from
    // `Process::create`; nothing else has installed it on any CPU yet.
    unsafe {
        (*first).state = ProcessState::Running;
        (*first).has_kernel_context = false;
        install_current(first);
        let mut discard: u64 = 0;
        x86_64::instructions::interrupts::enable();
        context::context_switch(&mut discard, (*first).kernel_rsp_saved);
    }
    unreachable!("the first process's kernel stack never returns into `run`");
}

/// Wakes every `Blocked` process whose `wake_time_ticks` has arrived.
fn wake_sleepers() {
    let now = crate::apic::ticks();
    let queue = RUN_QUEUE.lock();
    for &p in queue.iter() {
        // SAFETY: see `find_ready`.
        unsafe {
            if (*p).state == ProcessState::Blocked {
                if let Some(wake_at) = (*p).wake_time_ticks {
                    if wake_at <= now {
                        (*p).state = ProcessState::Ready;
                        (*p).wake_time_ticks = None;
                        (*p).wait_reason = None;
                    }
                }
            }
        }
    }
}

/// Frees every `Dead` process other than the one currently running.
fn reap_dead() {
    // SAFETY: called only from `on_timer_interrupt`, after boot's first
    // dispatch has installed a current process.
    let current = unsafe { percpu::current().process };
    let mut queue = RUN_QUEUE.lock();
    queue.retain(|&p| {
        // SAFETY: see `find_ready`.
        let dead = unsafe { (*p).state == ProcessState::Dead };
        if dead && p != current {
            // SAFETY: `p` is `Dead` and not `current`, so nothing else can
            // reach it again.
            unsafe { process::reap(p) };
            false
        } else {
            true
        }
    });
}

/// Checkpoints the preempted process (if it was running in user mode) and
/// picks a replacement, per the module doc comment above.
fn schedule(frame: &mut InterruptFrame) {
    if !frame.is_user_mode() {
        return;
    }

    // SAFETY: see `reap_dead`.
    let current = unsafe { percpu::current().process };
    if current.is_null() {
        return;
    }

    // SAFETY: `current` is a live process installed by a prior dispatch.
    unsafe {
        (*current).user_frame = *frame;
        (*current).has_user_context = true;
        if (*current).state == ProcessState::Running {
            (*current).state = ProcessState::Ready;
        }
    }

    let next_via_user = {
        let queue = RUN_QUEUE.lock();
        find_ready(&queue, core::ptr::null_mut(), |p| p.has_user_context)
    };
    if let Some(next) = next_via_user {
        // SAFETY: `next` is `Ready` with a valid saved `InterruptFrame`.
        unsafe {
            *frame = (*next).user_frame;
            (*next).state = ProcessState::Running;
            install_current(next);
        }
        return;
    }

    let next_via_kernel = {
        let queue = RUN_QUEUE.lock();
        find_ready(&queue, core::ptr::null_mut(), |p| p.has_kernel_context)
    };
    if let Some(next) = next_via_kernel {
        // SAFETY: `next` has a valid parked kernel context; `current` is
        // about to gain one at the point `context_switch` parks it. Module
        // doc comment above explains why this is sound from inside the ISR.
        unsafe {
            (*current).has_kernel_context = true;
            (*next).has_kernel_context = false;
            (*next).state = ProcessState::Running;
            install_current(next);
            context::context_switch(&mut (*current).kernel_rsp_saved, (*next).kernel_rsp_saved);
        }
        // Resumes here once something parks back into `current`'s kernel
        // context; falls through to the unmodified `frame`, resuming `current`
        // exactly where it was preempted.
        return;
    }

    // SAFETY: nobody else is ready; `current` keeps running unmodified.
    unsafe {
        (*current).state = ProcessState::Running;
    }
}

/// Called from `idt::timer_handler` on every LAPIC tick, after EOI has
/// already been sent. Runs the Wake, Reap, and Schedule hooks in that order.
pub fn on_timer_interrupt(frame: &mut InterruptFrame) {
    wake_sleepers();
    reap_dead();
    schedule(frame);
}

/// Cooperative deschedule: called by the syscall dispatcher once the
/// current process's state has been set to `Blocked` (with `wait_reason`
/// and `wake_time_ticks` populated as needed). Parks the caller's kernel
/// context and `context_switch`es into the next `has_kernel_context` `Ready`
/// process, halting until one exists if none currently does.
///
/// # Safety
/// Must be called with the current process already marked `Blocked` and
/// with a current process installed.
pub unsafe fn yield_blocked() {
    // SAFETY: forwarded to the caller.
    let current = unsafe { process::current_process() };
    // SAFETY: `current` is the live, just-blocked process.
    unsafe {
        (*current).has_kernel_context = true;
    }

    loop {
        let next_kernel = {
            let queue = RUN_QUEUE.lock();
            find_ready(&queue, current, |p| p.has_kernel_context)
        };
        if let Some(next) = next_kernel {
            // SAFETY: `next` has a valid parked kernel context (either from
            // a prior yield or from `Process::create`'s synthesized
            // `ContextFrame`). Resumes here, in this call frame, once
            // `current` is switched back into.
            unsafe {
                (*next).has_kernel_context = false;
                (*next).state = ProcessState::Running;
                install_current(next);
                context::context_switch(&mut (*current).kernel_rsp_saved, (*next).kernel_rsp_saved);
            }
            return;
        }

        let next_user = {
            let queue = RUN_QUEUE.lock();
            find_ready(&queue, current, |p| p.has_user_context)
        };
        if let Some(next) = next_user {
            // SAFETY: `next` has a valid saved `InterruptFrame`; there is no
            // timer interrupt here to restore it for us, so do it directly.
            // This call does not return: the next time `current` runs, it is
            // because something switched back into its parked kernel
            // context above, which only happens through the branch taken on
            // a future call to this same function or to `schedule`, not by
            // unwinding this one.
            unsafe {
                (*next).state = ProcessState::Running;
                install_current(next);
                context::resume_interrupt_frame(&(*next).user_frame);
            }
        }

        x86_64::instructions::interrupts::enable_and_hlt();
    }
}

/// Hands the CPU to another process after marking `current` `Dead`. Called
/// by `process::exit_current`; never returns. Prefers a `has_kernel_context`
/// candidate (resumed via `context_switch`, consistent with `yield_blocked`);
/// falls back to a `has_user_context` one, resumed directly through
/// [`context::resume_interrupt_frame`] since there is no timer interrupt
/// here to do the restore for us.
///
/// # Safety
/// `current` must be the process installed on this CPU, already marked
/// `Dead`.
pub unsafe fn die(current: *mut Process) -> ! {
    loop {
        let next_kernel = {
            let queue = RUN_QUEUE.lock();
            find_ready(&queue, current, |p| p.has_kernel_context)
        };
        if let Some(next) = next_kernel {
            // SAFETY: `next` has a valid parked kernel context.
            unsafe {
                (*next).has_kernel_context = false;
                (*next).state = ProcessState::Running;
                install_current(next);
                let mut discard: u64 = 0;
                context::context_switch(&mut discard, (*next).kernel_rsp_saved);
            }
            unreachable!("a dead process's discarded context is never resumed");
        }

        let next_user = {
            let queue = RUN_QUEUE.lock();
            find_ready(&queue, current, |p| p.has_user_context)
        };
        if let Some(next) = next_user {
            // SAFETY: `next` has a valid saved `InterruptFrame`.
            unsafe {
                (*next).state = ProcessState::Running;
                install_current(next);
                context::resume_interrupt_frame(&(*next).user_frame);
            }
        }

        // Nothing is ready yet; wait for a wake-up (timer or keyboard IRQ)
        // and check again. `current` stays installed but `Dead`, so
        // `reap_dead` still skips it until we actually switch away.
        x86_64::instructions::interrupts::enable_and_hlt();
    }
}

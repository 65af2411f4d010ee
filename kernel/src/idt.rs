//! Interrupt Descriptor Table: exception handlers and the IRQ dispatch
//! table.
//!
//! Exceptions (vectors 0-31) are fatal: log a fixed name table, dump the
//! frame, halt. IRQs (vectors 32 and up) look up a 256-wide table of
//! registered handlers; EOI is each handler's own responsibility, matching
//! how the APIC driver acknowledges per-source rather than the dispatcher
//! doing it centrally.

use core::arch::naked_asm;

use lazy_static::lazy_static;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};
use x86_64::VirtAddr;

use crate::gdt;
use crate::sync::IrqSpinLock;

/// First vector number used for hardware IRQs, after the 32 CPU exception
/// vectors. ISA IRQs 0-15 are redirected by the IOAPIC onto vectors
/// `IRQ_BASE..IRQ_BASE+16` (so legacy IRQ1, the keyboard, lands on 33).
pub const IRQ_BASE: u8 = 32;
/// Last ISA-range IRQ vector (inclusive).
const IRQ_LAST: u8 = IRQ_BASE + 15;
/// LAPIC timer vector, programmed directly into the LVT Timer register
/// rather than routed through the IOAPIC, so it lives outside the ISA range.
pub const TIMER_VECTOR: u8 = 0x40;
/// Legacy `int 0x80` software-interrupt syscall entry point. DPL=3 so user
/// code may invoke it; unused unless SYSCALL/SYSRET is disabled.
pub const SYSCALL_VECTOR: u8 = 0x80;

type IrqHandler = fn();

static IRQ_HANDLERS: IrqSpinLock<[Option<IrqHandler>; 256]> = IrqSpinLock::new([None; 256]);

/// Registers `handler` to run when vector `vector` fires. Overwrites any
/// previous registration for that vector.
pub fn register_irq_handler(vector: u8, handler: IrqHandler) {
    IRQ_HANDLERS.lock()[vector as usize] = Some(handler);
}

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.divide_error.set_handler_fn(exception_divide_error);
        idt.debug.set_handler_fn(exception_debug);
        idt.non_maskable_interrupt.set_handler_fn(exception_nmi);
        idt.breakpoint.set_handler_fn(exception_breakpoint);
        idt.overflow.set_handler_fn(exception_overflow);
        idt.bound_range_exceeded.set_handler_fn(exception_bound_range);
        idt.invalid_opcode.set_handler_fn(exception_invalid_opcode);
        idt.device_not_available.set_handler_fn(exception_device_not_available);
        // SAFETY: the double-fault stack index names a valid IST slot set
        // up by `gdt::init`, which must run before `idt::init`.
        unsafe {
            idt.double_fault
                .set_handler_fn(exception_double_fault)
                .set_stack_index(gdt::DOUBLE_FAULT_IST_INDEX);
        }
        idt.invalid_tss.set_handler_fn(exception_invalid_tss);
        idt.segment_not_present.set_handler_fn(exception_segment_not_present);
        idt.stack_segment_fault.set_handler_fn(exception_stack_segment_fault);
        idt.general_protection_fault.set_handler_fn(exception_general_protection);
        idt.page_fault.set_handler_fn(exception_page_fault);
        idt.x87_floating_point.set_handler_fn(exception_x87_fpu);
        idt.alignment_check.set_handler_fn(exception_alignment_check);
        idt.machine_check.set_handler_fn(exception_machine_check);
        idt.simd_floating_point.set_handler_fn(exception_simd_fpu);

        for vector in IRQ_BASE..=IRQ_LAST {
            idt[vector as usize].set_handler_fn(irq_stub_for(vector));
        }
        // The timer vector bypasses `set_handler_fn`: the `x86-interrupt` ABI
        // hides GPRs from Rust, but the scheduler needs to read and rewrite
        // every GPR of a preempted user process at each tick. `timer_entry`
        // is a hand-rolled naked stub that builds an `InterruptFrame` the
        // scheduler can freely mutate before `iretq`.
        unsafe {
            idt[TIMER_VECTOR as usize].set_handler_addr(VirtAddr::new(timer_entry as u64));
        }

        unsafe {
            idt[SYSCALL_VECTOR as usize]
                .set_handler_fn(legacy_syscall_vector)
                .set_present(true)
                .set_privilege_level(x86_64::PrivilegeLevel::Ring3);
        }
        idt
    };
}

/// Loads the IDT. Must run after [`gdt::init`].
pub fn init() {
    IDT.load();
}

fn dump_and_halt(name: &str, frame: &InterruptStackFrame) -> ! {
    log::error!("EXCEPTION: {name}");
    log::error!("{frame:#?}");
    loop {
        #[cfg(target_os = "none")]
        x86_64::instructions::hlt();
        #[cfg(not(target_os = "none"))]
        core::hint::spin_loop();
    }
}

extern "x86-interrupt" fn exception_divide_error(f: InterruptStackFrame) {
    dump_and_halt("DIVIDE ERROR", &f);
}
extern "x86-interrupt" fn exception_debug(f: InterruptStackFrame) {
    dump_and_halt("DEBUG", &f);
}
extern "x86-interrupt" fn exception_nmi(f: InterruptStackFrame) {
    dump_and_halt("NON-MASKABLE INTERRUPT", &f);
}
extern "x86-interrupt" fn exception_breakpoint(f: InterruptStackFrame) {
    log::warn!("EXCEPTION: BREAKPOINT\n{f:#?}");
}
extern "x86-interrupt" fn exception_overflow(f: InterruptStackFrame) {
    dump_and_halt("OVERFLOW", &f);
}
extern "x86-interrupt" fn exception_bound_range(f: InterruptStackFrame) {
    dump_and_halt("BOUND RANGE EXCEEDED", &f);
}
extern "x86-interrupt" fn exception_invalid_opcode(f: InterruptStackFrame) {
    dump_and_halt("INVALID OPCODE", &f);
}
extern "x86-interrupt" fn exception_device_not_available(f: InterruptStackFrame) {
    dump_and_halt("DEVICE NOT AVAILABLE", &f);
}
extern "x86-interrupt" fn exception_double_fault(f: InterruptStackFrame, _error_code: u64) -> ! {
    dump_and_halt("DOUBLE FAULT", &f);
}
extern "x86-interrupt" fn exception_invalid_tss(f: InterruptStackFrame, error_code: u64) {
    log::error!("EXCEPTION: INVALID TSS (selector {error_code:#x})");
    dump_and_halt("INVALID TSS", &f);
}
extern "x86-interrupt" fn exception_segment_not_present(f: InterruptStackFrame, error_code: u64) {
    log::error!("EXCEPTION: SEGMENT NOT PRESENT (selector {error_code:#x})");
    dump_and_halt("SEGMENT NOT PRESENT", &f);
}
extern "x86-interrupt" fn exception_stack_segment_fault(f: InterruptStackFrame, error_code: u64) {
    log::error!("EXCEPTION: STACK SEGMENT FAULT (selector {error_code:#x})");
    dump_and_halt("STACK SEGMENT FAULT", &f);
}
extern "x86-interrupt" fn exception_general_protection(f: InterruptStackFrame, error_code: u64) {
    log::error!("EXCEPTION: GENERAL PROTECTION FAULT (error code {error_code:#x})");
    dump_and_halt("GENERAL PROTECTION FAULT", &f);
}
extern "x86-interrupt" fn exception_page_fault(f: InterruptStackFrame, error_code: PageFaultErrorCode) {
    use x86_64::registers::control::Cr2;
    let fault_addr = Cr2::read();
    log::error!("EXCEPTION: PAGE FAULT at {fault_addr:?}, error code {error_code:?}");
    dump_and_halt("PAGE FAULT", &f);
}
extern "x86-interrupt" fn exception_x87_fpu(f: InterruptStackFrame) {
    dump_and_halt("X87 FLOATING POINT", &f);
}
extern "x86-interrupt" fn exception_alignment_check(f: InterruptStackFrame, _error_code: u64) {
    dump_and_halt("ALIGNMENT CHECK", &f);
}
extern "x86-interrupt" fn exception_machine_check(f: InterruptStackFrame) -> ! {
    dump_and_halt("MACHINE CHECK", &f);
}
extern "x86-interrupt" fn exception_simd_fpu(f: InterruptStackFrame) {
    dump_and_halt("SIMD FLOATING POINT", &f);
}

/// `int 0x80` is not wired to the syscall dispatcher; SYSCALL/SYSRET is the
/// only supported entry path (§4.6). The gate exists only so the vector is
/// DPL=3-present rather than generating a `#GP` if something probes it.
extern "x86-interrupt" fn legacy_syscall_vector(_frame: InterruptStackFrame) {
    log::warn!("int 0x80 invoked; this kernel only supports SYSCALL/SYSRET");
}

/// Common IRQ dispatch: look up the registered handler for `vector` and run
/// it. A vector with no registered handler is silently ignored (common
/// during APIC/IOAPIC bring-up before every source has a driver yet).
fn dispatch_irq(vector: u8) {
    let handler = IRQ_HANDLERS.lock()[vector as usize];
    if let Some(handler) = handler {
        handler();
    } else {
        log::warn!("irq: unhandled vector {vector}");
    }
}

/// Generates a distinct `extern "x86-interrupt"` stub per IRQ vector, since
/// the dispatcher needs to know which vector fired and the interrupt ABI
/// gives no vector argument.
macro_rules! irq_stub {
    ($name:ident, $vector:expr) => {
        extern "x86-interrupt" fn $name(_frame: InterruptStackFrame) {
            dispatch_irq($vector);
        }
    };
}

irq_stub!(irq_32, 32);
irq_stub!(irq_33, 33);
irq_stub!(irq_34, 34);
irq_stub!(irq_35, 35);
irq_stub!(irq_36, 36);
irq_stub!(irq_37, 37);
irq_stub!(irq_38, 38);
irq_stub!(irq_39, 39);
irq_stub!(irq_40, 40);
irq_stub!(irq_41, 41);
irq_stub!(irq_42, 42);
irq_stub!(irq_43, 43);
irq_stub!(irq_44, 44);
irq_stub!(irq_45, 45);
irq_stub!(irq_46, 46);
irq_stub!(irq_47, 47);

type IsrFn = extern "x86-interrupt" fn(InterruptStackFrame);

fn irq_stub_for(vector: u8) -> IsrFn {
    match vector {
        32 => irq_32,
        33 => irq_33,
        34 => irq_34,
        35 => irq_35,
        36 => irq_36,
        37 => irq_37,
        38 => irq_38,
        39 => irq_39,
        40 => irq_40,
        41 => irq_41,
        42 => irq_42,
        43 => irq_43,
        44 => irq_44,
        45 => irq_45,
        46 => irq_46,
        47 => irq_47,
        _ => unreachable!("vector {vector} outside ISA IRQ range"),
    }
}

/// Every general-purpose register plus the CPU-pushed trap frame, as laid
/// out on the stack by [`timer_entry`]'s prologue. The scheduler reads and
/// rewrites this in place to checkpoint or resume a preempted user process;
/// `iretq` on the way out restores exactly what's here.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct InterruptFrame {
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
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl InterruptFrame {
    /// True when the interrupted context was running in ring 3. The
    /// scheduler's preemption rule only ever acts on user-mode frames.
    pub fn is_user_mode(&self) -> bool {
        self.cs & 0x3 == 0x3
    }
}

/// Naked LAPIC timer entry point. Pushes every GPR (building an
/// [`InterruptFrame`] on top of the CPU's own rip/cs/rflags/rsp/ss push),
/// calls [`timer_handler`] with a pointer to it, then pops everything back
/// and `iretq`s. Registered directly via `set_handler_addr` rather than
/// `set_handler_fn`, since the typed `extern "x86-interrupt"` ABI this
/// crate uses everywhere else has no way to expose GPRs to Rust code.
///
/// This kernel never takes a second `swapgs` after the one at boot (see
/// `percpu::init`), so unlike a multi-core kernel's entry stub, this one
/// has none to undo on the way in or out.
#[unsafe(naked)]
extern "C" fn timer_entry() -> ! {
    naked_asm!(
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
        "call {handler}",
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
        handler = sym timer_handler,
    );
}

/// Rust side of the timer tick: advances the tick counter, lets the
/// scheduler checkpoint/preempt/resume through `frame`, then signals EOI.
extern "C" fn timer_handler(frame: *mut InterruptFrame) {
    crate::apic::tick();
    // SAFETY: `frame` points at the `InterruptFrame` `timer_entry` just
    // built on its own stack; it stays valid for the duration of this call.
    unsafe {
        crate::sched::on_timer_interrupt(&mut *frame);
    }
    crate::apic::send_eoi();
}

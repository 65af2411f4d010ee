//! Kestrel kernel library crate.
//!
//! Built twice over: as the freestanding kernel binary (`main.rs`'s
//! `kernel_entry`, compiled for the `x86_64-unknown-kestrel` target) and as
//! an ordinary host-target library so `cargo test` can run the pure-logic
//! unit tests each module carries (`addr`, `mm::pmm`, `mm::vmm`, `mm::slab`,
//! `mm::heap`, `fs::path`, `fs::initramfs`, `elf`, `errno`, ...) without a
//! kernel environment. `target_os = "none"` is the switch between the two.

#![no_std]

extern crate alloc;

// Bare-metal target: the kernel heap (`mm::heap::KernelHeap`) installs
// itself as the global allocator. Host target: delegate to the system
// allocator so `alloc::{boxed, vec, string, collections}` work in unit
// tests without a kernel environment to back them.
#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static HOST_ALLOCATOR: std::alloc::System = std::alloc::System;

pub mod acpi;
pub mod addr;
pub mod apic;
pub mod config;
pub mod console;
pub mod context;
pub mod elf;
pub mod errno;
pub mod fs;
pub mod gdt;
pub mod idt;
pub mod keyboard;
pub mod klog;
pub mod mm;
pub mod msr;
pub mod percpu;
pub mod process;
pub mod sched;
pub mod sync;
pub mod syscall;

/// Runs every subsystem's boot-time initialization in the dependency order
/// the base design lays out: PFA -> VMM -> Slab/kmalloc (implicit, no init
/// step) -> (GDT, IDT, Per-CPU, ACPI) -> (APIC, Keyboard) -> Timer ->
/// (SYSCALL, VFS). Process creation and the scheduler's first dispatch are
/// left to the caller (`main.rs`), since they need the parsed initramfs.
///
/// # Safety
/// Must run exactly once, early in `kernel_entry`, before interrupts are
/// enabled and before any of these subsystems' other functions are called.
#[cfg(target_os = "none")]
pub unsafe fn arch_init(hhdm_offset: u64, rsdp_phys: addr::PhysAddr) {
    gdt::init();
    idt::init();
    percpu::init();
    context::init();

    mm::vmm::init(hhdm_offset);

    if acpi::init(rsdp_phys).is_err() {
        log::warn!("acpi: no usable RSDT/XSDT found; APIC/IOAPIC routing may be incomplete");
    }

    apic::init(idt::TIMER_VECTOR, idt::IRQ_BASE + 1);
    idt::register_irq_handler(idt::IRQ_BASE + 1, keyboard::on_keyboard_irq);

    syscall::init();
}

#[cfg(all(target_os = "none", not(test)))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    log::error!("KERNEL PANIC: {info}");
    loop {
        x86_64::instructions::interrupts::disable();
        x86_64::instructions::hlt();
    }
}

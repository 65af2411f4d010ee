//! Global Descriptor Table and Task State Segment.
//!
//! Six descriptors: null, kernel code, kernel data, TSS (two slots), user
//! data, user code. The user data/code order is fixed by SYSRET: it computes
//! `SS = STAR[63:48] + 8` and `CS = STAR[63:48] + 16`, so user data must sit
//! immediately after the selector SYSCALL's STAR value names, and user code
//! right after that.

use lazy_static::lazy_static;
use x86_64::instructions::segmentation::{Segment, CS, DS};
use x86_64::instructions::tables::load_tss;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

/// IST slot used for the double-fault handler's dedicated stack, so a fault
/// on an already-corrupt kernel stack still has somewhere valid to run.
pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

lazy_static! {
    static ref TSS: TaskStateSegment = {
        let mut tss = TaskStateSegment::new();

        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = {
            const STACK_SIZE: usize = 4096 * 5;
            #[repr(align(16))]
            struct AlignedStack([u8; STACK_SIZE]);
            static mut STACK: AlignedStack = AlignedStack([0; STACK_SIZE]);

            let stack_ptr = &raw const STACK;
            let stack_start = VirtAddr::from_ptr(stack_ptr);
            stack_start + STACK_SIZE as u64
        };
        tss
    };
}

lazy_static! {
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let mut gdt = GlobalDescriptorTable::new();
        let code_selector = gdt.append(Descriptor::kernel_code_segment());
        let data_selector = gdt.append(Descriptor::kernel_data_segment());
        let tss_selector = gdt.append(Descriptor::tss_segment(&TSS));
        let user_data_selector = gdt.append(Descriptor::user_data_segment());
        let user_code_selector = gdt.append(Descriptor::user_code_segment());
        (
            gdt,
            Selectors {
                code_selector,
                data_selector,
                tss_selector,
                user_data_selector,
                user_code_selector,
            },
        )
    };
}

/// GDT segment selectors.
///
/// Layout: 0x00 null, 0x08 kernel code, 0x10 kernel data, 0x18 TSS (two
/// slots, 0x18-0x20), 0x28 user data (RPL 3 -> 0x2B), 0x30 user code
/// (RPL 3 -> 0x33).
pub struct Selectors {
    pub code_selector: SegmentSelector,
    pub data_selector: SegmentSelector,
    pub tss_selector: SegmentSelector,
    pub user_data_selector: SegmentSelector,
    pub user_code_selector: SegmentSelector,
}

/// Loads the GDT and TSS, and reloads CS/DS to the new kernel descriptors.
/// Must run once at boot before interrupts are enabled.
pub fn init() {
    GDT.0.load();
    // SAFETY: the selectors reference descriptors in the GDT we just loaded.
    unsafe {
        CS::set_reg(GDT.1.code_selector);
        DS::set_reg(GDT.1.data_selector);
        load_tss(GDT.1.tss_selector);
    }
}

/// Returns the GDT selectors. Must only be called after [`init`].
pub fn selectors() -> &'static Selectors {
    &GDT.1
}

/// Sets the kernel stack pointer (RSP0) in the TSS, used on the next
/// ring 3 -> ring 0 transition (interrupt or syscall). Call with interrupts
/// disabled, as this races a concurrent transition otherwise.
pub fn set_kernel_stack(stack_top: u64) {
    // SAFETY: the TSS is a static initialized at boot; mutation through a
    // raw pointer is sound because callers hold interrupts disabled.
    unsafe {
        let tss_ptr = &*TSS as *const TaskStateSegment as *mut TaskStateSegment;
        (*tss_ptr).privilege_stack_table[0] = VirtAddr::new(stack_top);
    }
}

/// Reads the current kernel stack pointer (RSP0) from the TSS.
pub fn get_kernel_stack() -> u64 {
    TSS.privilege_stack_table[0].as_u64()
}

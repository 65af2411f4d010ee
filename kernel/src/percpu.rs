//! Per-CPU data, reached from assembly through the GS segment base.
//!
//! Field offsets are a hard contract: the SYSCALL entry stub (`syscall.rs`)
//! hardcodes them as immediate offsets from `%gs:0`. Do not reorder, insert,
//! or resize fields without updating that assembly.

use crate::process::Process;

/// `self` at offset 0x00 lets assembly do a single `mov rax, gs:0` and then
/// use ordinary displacement addressing for every other field — the
/// GS-base MSR trick described in the base spec's design notes.
#[repr(C)]
pub struct PerCpu {
    pub self_ptr: *mut PerCpu,
    pub kernel_rsp: u64,
    pub user_rsp: u64,
    pub process: *mut Process,
}

const _: () = assert!(core::mem::offset_of!(PerCpu, self_ptr) == 0x00);
const _: () = assert!(core::mem::offset_of!(PerCpu, kernel_rsp) == 0x08);
const _: () = assert!(core::mem::offset_of!(PerCpu, user_rsp) == 0x10);
const _: () = assert!(core::mem::offset_of!(PerCpu, process) == 0x18);

static mut PERCPU: PerCpu = PerCpu {
    self_ptr: core::ptr::null_mut(),
    kernel_rsp: 0,
    user_rsp: 0,
    process: core::ptr::null_mut(),
};

/// Installs the single per-CPU structure: fixes up its self-pointer and
/// loads `GS_BASE` to point at it. `KERNEL_GS_BASE` is left at 0, since this
/// kernel never takes a second `swapgs` before the first ring transition.
///
/// Must run once at boot, after the GDT and before enabling interrupts or
/// executing SYSCALL.
pub fn init() {
    // SAFETY: boot is single-threaded and runs before any interrupt or
    // SYSCALL can race this initialization.
    #[allow(static_mut_refs)]
    unsafe {
        let ptr = &raw mut PERCPU;
        (*ptr).self_ptr = ptr;
        install_gs_base(ptr as u64);
    }
}

#[cfg(target_os = "none")]
fn install_gs_base(addr: u64) {
    use crate::msr::{wrmsr, IA32_GS_BASE, IA32_KERNEL_GS_BASE};
    // SAFETY: programming GS_BASE to point at our own static `PerCpu` is
    // exactly the documented use of this MSR.
    unsafe {
        wrmsr(IA32_GS_BASE, addr);
        wrmsr(IA32_KERNEL_GS_BASE, 0);
    }
}

#[cfg(not(target_os = "none"))]
fn install_gs_base(_addr: u64) {}

/// Returns the current per-CPU structure.
///
/// # Safety
/// Must only be called after [`init`].
pub unsafe fn current() -> &'static mut PerCpu {
    // SAFETY: `PERCPU` is initialized exactly once at boot; all later
    // access to its fields is serialized by the single-CPU, IRQ-disabled
    // discipline the rest of the kernel follows when touching per-CPU state.
    #[allow(static_mut_refs)]
    unsafe {
        &mut *(&raw mut PERCPU)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_offsets_match_the_assembly_contract() {
        assert_eq!(core::mem::offset_of!(PerCpu, self_ptr), 0x00);
        assert_eq!(core::mem::offset_of!(PerCpu, kernel_rsp), 0x08);
        assert_eq!(core::mem::offset_of!(PerCpu, user_rsp), 0x10);
        assert_eq!(core::mem::offset_of!(PerCpu, process), 0x18);
    }
}

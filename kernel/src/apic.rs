//! Local APIC and I/O APIC driver.
//!
//! Programs the Local APIC's timer (calibrated against the legacy PIT in
//! one-shot mode, then disabled for good — this kernel's only use of the
//! 8254) and exposes `send_eoi`/`ticks` to the rest of the kernel, plus
//! `set_irq_route` so `keyboard.rs`'s IRQ1 reaches the CPU through the
//! I/O APIC rather than the PIC.

use core::ptr;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::acpi;
use crate::config::TIMER_TICK_MS;
use crate::mm::vmm::phys_to_virt_addr;
use crate::msr::{rdmsr, wrmsr};
use crate::sync::IrqSpinLock;

const IA32_APIC_BASE_MSR: u32 = 0x1B;
const IA32_APIC_BASE_ENABLE: u64 = 1 << 11;

const LAPIC_ID: u32 = 0x020;
const LAPIC_TPR: u32 = 0x080;
const LAPIC_EOI: u32 = 0x0B0;
const LAPIC_SVR: u32 = 0x0F0;
const LAPIC_LVT_TIMER: u32 = 0x320;
const LAPIC_LVT_LINT0: u32 = 0x350;
const LAPIC_LVT_LINT1: u32 = 0x360;
const LAPIC_LVT_ERROR: u32 = 0x370;
const LAPIC_TIMER_INIT_COUNT: u32 = 0x380;
const LAPIC_TIMER_CUR_COUNT: u32 = 0x390;
const LAPIC_TIMER_DIV: u32 = 0x3E0;

const LVT_MASK: u32 = 1 << 16;
const SVR_ENABLE: u32 = 1 << 8;
const SPURIOUS_VECTOR: u8 = 0xFF;
const TIMER_MODE_PERIODIC: u32 = 0b01 << 17;
/// Divide-by-16, matching the calibration run below.
const TIMER_DIVIDE_BY_16: u8 = 0x03;

const IOREGSEL: u32 = 0x00;
const IOWIN: u32 = 0x10;
const IOAPIC_REG_VER: u32 = 0x01;
const IOAPIC_REDTBL_BASE: u32 = 0x10;

/// A 64-bit I/O APIC redirection table entry, split as low/high 32-bit
/// halves for the indirect register window.
#[derive(Debug, Clone, Copy)]
struct RedirectionEntry {
    raw: u64,
}

impl RedirectionEntry {
    const fn new(vector: u8) -> Self {
        Self { raw: (vector as u64) | (1 << 16) }
    }

    fn set_masked(&mut self, masked: bool) {
        if masked {
            self.raw |= 1 << 16;
        } else {
            self.raw &= !(1u64 << 16);
        }
    }

    fn set_active_low(&mut self, active_low: bool) {
        if active_low {
            self.raw |= 1 << 13;
        } else {
            self.raw &= !(1u64 << 13);
        }
    }

    fn set_level_triggered(&mut self, level: bool) {
        if level {
            self.raw |= 1 << 15;
        } else {
            self.raw &= !(1u64 << 15);
        }
    }

    fn set_destination(&mut self, dest: u8) {
        self.raw = (self.raw & !(0xFFu64 << 56)) | ((dest as u64) << 56);
    }

    fn low(&self) -> u32 {
        self.raw as u32
    }

    fn high(&self) -> u32 {
        (self.raw >> 32) as u32
    }

    fn from_parts(low: u32, high: u32) -> Self {
        Self { raw: (low as u64) | ((high as u64) << 32) }
    }
}

/// Handle to the per-CPU Local APIC's MMIO register file.
struct LocalApic {
    base: usize,
}

impl LocalApic {
    fn read(&self, offset: u32) -> u32 {
        // SAFETY: `base + offset` names a Local APIC register mapped through
        // the HHDM; volatile access matches the MMIO programming model.
        unsafe { ptr::read_volatile((self.base + offset as usize) as *const u32) }
    }

    fn write(&self, offset: u32, value: u32) {
        // SAFETY: see `read`.
        unsafe { ptr::write_volatile((self.base + offset as usize) as *mut u32, value) }
    }

    fn read_id(&self) -> u8 {
        ((self.read(LAPIC_ID) >> 24) & 0xFF) as u8
    }

    fn mask_all_lvt(&self) {
        self.write(LAPIC_LVT_TIMER, LVT_MASK);
        self.write(LAPIC_LVT_LINT0, LVT_MASK);
        self.write(LAPIC_LVT_LINT1, LVT_MASK);
        self.write(LAPIC_LVT_ERROR, LVT_MASK);
    }

    fn enable(&self) {
        self.write(LAPIC_SVR, SVR_ENABLE | SPURIOUS_VECTOR as u32);
    }

    fn set_task_priority(&self, priority: u8) {
        self.write(LAPIC_TPR, priority as u32);
    }

    fn send_eoi(&self) {
        self.write(LAPIC_EOI, 0);
    }

    fn setup_timer(&self, vector: u8, divide: u8, initial_count: u32) {
        self.write(LAPIC_TIMER_INIT_COUNT, 0);
        self.write(LAPIC_TIMER_DIV, divide as u32);
        self.write(LAPIC_LVT_TIMER, TIMER_MODE_PERIODIC | vector as u32);
        self.write(LAPIC_TIMER_INIT_COUNT, initial_count);
    }
}

/// Handle to the I/O APIC's indirect MMIO register window.
struct IoApic {
    base: usize,
}

impl IoApic {
    fn read_register(&self, reg: u32) -> u32 {
        // SAFETY: `base` is the HHDM alias of the I/O APIC's MMIO base;
        // IOREGSEL/IOWIN is the documented indirect-access protocol.
        unsafe {
            ptr::write_volatile((self.base + IOREGSEL as usize) as *mut u32, reg);
            ptr::read_volatile((self.base + IOWIN as usize) as *const u32)
        }
    }

    fn write_register(&self, reg: u32, value: u32) {
        // SAFETY: see `read_register`.
        unsafe {
            ptr::write_volatile((self.base + IOREGSEL as usize) as *mut u32, reg);
            ptr::write_volatile((self.base + IOWIN as usize) as *mut u32, value);
        }
    }

    fn max_redirection_entries(&self) -> u8 {
        (((self.read_register(IOAPIC_REG_VER) >> 16) & 0xFF) + 1) as u8
    }

    fn write_redirection(&self, irq: u8, entry: RedirectionEntry) {
        let reg_base = IOAPIC_REDTBL_BASE + (irq as u32) * 2;
        // High dword first so a mask-clearing write never races an
        // in-flight vector/destination update.
        self.write_register(reg_base + 1, entry.high());
        self.write_register(reg_base, entry.low());
    }

    fn mask_all(&self) {
        for irq in 0..self.max_redirection_entries() {
            self.write_redirection(irq, RedirectionEntry::new(0));
        }
    }

    /// Routes GSI `gsi` to `vector` on the CPU identified by `dest`,
    /// honoring the ISA override's polarity/trigger mode.
    fn set_route(&self, gsi: u8, vector: u8, dest: u8, active_low: bool, level: bool) {
        let mut entry = RedirectionEntry::new(vector);
        entry.set_destination(dest);
        entry.set_active_low(active_low);
        entry.set_level_triggered(level);
        entry.set_masked(false);
        self.write_redirection(gsi, entry);
    }
}

struct ApicState {
    local_apic: LocalApic,
    io_apic: IoApic,
}

static APIC_STATE: IrqSpinLock<Option<ApicState>> = IrqSpinLock::new(None);
static TICKS: AtomicU64 = AtomicU64::new(0);

mod pit {
    //! 8254 PIT, channel 2, one-shot mode — used only to calibrate the
    //! Local APIC timer once at boot.

    const PIT_FREQUENCY: u32 = 1_193_182;
    const CHANNEL2_DATA: u16 = 0x42;
    const PIT_CMD: u16 = 0x43;
    const PORT_B: u16 = 0x61;

    #[cfg(target_os = "none")]
    unsafe fn outb(port: u16, value: u8) {
        unsafe {
            core::arch::asm!("out dx, al", in("dx") port, in("al") value, options(nomem, nostack, preserves_flags));
        }
    }
    #[cfg(target_os = "none")]
    unsafe fn inb(port: u16) -> u8 {
        let value: u8;
        unsafe {
            core::arch::asm!("in al, dx", out("al") value, in("dx") port, options(nomem, nostack, preserves_flags));
        }
        value
    }
    #[cfg(not(target_os = "none"))]
    unsafe fn outb(_port: u16, _value: u8) {}
    #[cfg(not(target_os = "none"))]
    unsafe fn inb(_port: u16) -> u8 {
        0x20
    }

    /// Busy-waits approximately `ms` milliseconds. Caller must have
    /// interrupts disabled; the PIT is not otherwise in use by this kernel.
    pub fn busy_wait_ms(ms: u32) {
        let count = ((PIT_FREQUENCY as u64 * ms as u64) / 1000).min(0xFFFF) as u16;
        // SAFETY: channel 2 / gate / speaker ports are not touched by any
        // other code in this kernel.
        unsafe {
            let b = inb(PORT_B);
            outb(PORT_B, (b & !0x02) | 0x01);
            outb(PIT_CMD, 0b1011_0000);
            outb(CHANNEL2_DATA, count as u8);
            outb(CHANNEL2_DATA, (count >> 8) as u8);
            let b = inb(PORT_B);
            outb(PORT_B, b & !0x01);
            outb(PORT_B, b | 0x01);
            while inb(PORT_B) & 0x20 == 0 {
                core::hint::spin_loop();
            }
        }
    }
}

/// Brings up the Local APIC and I/O APIC: masks every LVT/redirection entry,
/// enables the Local APIC via its spurious-vector register, calibrates the
/// timer against the PIT, and arms it for periodic ticks at
/// [`TIMER_TICK_MS`] on `timer_vector`. Routes the legacy keyboard IRQ (1)
/// to `keyboard_vector` through whatever GSI/polarity ACPI's ISA overrides
/// name for it.
///
/// Must run after [`acpi::init`] and before interrupts are enabled. Panics
/// if called twice.
pub fn init(timer_vector: u8, keyboard_vector: u8) {
    assert!(APIC_STATE.lock().is_none(), "apic::init called twice");

    let apic_base_msr = rdmsr(IA32_APIC_BASE_MSR);
    let apic_base_phys = apic_base_msr & 0xFFFF_F000;
    if apic_base_msr & IA32_APIC_BASE_ENABLE == 0 {
        // SAFETY: sets the documented global-enable bit of IA32_APIC_BASE.
        unsafe { wrmsr(IA32_APIC_BASE_MSR, apic_base_msr | IA32_APIC_BASE_ENABLE) };
    }

    let lapic_phys_override = acpi::with_acpi_info(|info| info.local_apic_address as u64);
    let lapic_phys = lapic_phys_override.unwrap_or(apic_base_phys);
    let ioapic_phys = acpi::with_acpi_info(|info| info.io_apic_address() as u64).unwrap_or(0xFEC0_0000);

    let lapic_base = phys_to_virt_addr(crate::addr::PhysAddr::new_truncate(lapic_phys)).as_u64() as usize;
    let ioapic_base = phys_to_virt_addr(crate::addr::PhysAddr::new_truncate(ioapic_phys)).as_u64() as usize;

    let lapic = LocalApic { base: lapic_base };
    lapic.mask_all_lvt();
    lapic.enable();
    lapic.set_task_priority(0);
    log::info!("apic: local apic id={} enabled at {:#x}", lapic.read_id(), lapic_base);

    let io_apic = IoApic { base: ioapic_base };
    io_apic.mask_all();
    log::info!("apic: io apic at {:#x} ({} lines)", ioapic_base, io_apic.max_redirection_entries());

    let (gsi, active_low, level) = acpi::with_acpi_info(|info| info.irq_to_gsi(1)).unwrap_or((1, false, false));
    io_apic.set_route(gsi as u8, keyboard_vector, lapic.read_id(), active_low, level);

    let ticks_per_ms = calibrate(&lapic);
    let initial_count = ticks_per_ms.saturating_mul(TIMER_TICK_MS).max(1);
    lapic.setup_timer(timer_vector, TIMER_DIVIDE_BY_16, initial_count);
    log::info!("apic: timer armed, {TIMER_TICK_MS}ms/tick, initial_count={initial_count}");

    *APIC_STATE.lock() = Some(ApicState { local_apic: lapic, io_apic });
}

/// Counts down from `0xFFFF_FFFF` for 10ms (PIT-timed) to learn how many
/// APIC timer ticks (at divide-by-16) elapse per millisecond.
fn calibrate(lapic: &LocalApic) -> u32 {
    const CALIBRATION_MS: u32 = 10;
    lapic.write(LAPIC_TIMER_DIV, TIMER_DIVIDE_BY_16 as u32);
    lapic.write(LAPIC_TIMER_INIT_COUNT, 0xFFFF_FFFF);
    pit::busy_wait_ms(CALIBRATION_MS);
    let elapsed = 0xFFFF_FFFFu32 - lapic.read(LAPIC_TIMER_CUR_COUNT);
    lapic.write(LAPIC_TIMER_INIT_COUNT, 0);
    (elapsed / CALIBRATION_MS).max(1)
}

/// Signals End-Of-Interrupt to the Local APIC. Every APIC-sourced interrupt
/// handler must call this exactly once.
pub fn send_eoi() {
    if let Some(state) = APIC_STATE.lock().as_ref() {
        state.local_apic.send_eoi();
    }
}

/// Number of timer ticks observed since [`init`], advanced by the timer
/// IRQ handler. Used by `/dev/random` as an entropy-free tick counter and
/// by the scheduler for wake-time comparisons.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Advances the tick counter. Called once per timer interrupt, before EOI.
pub fn tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirection_entry_starts_masked() {
        let entry = RedirectionEntry::new(0x30);
        assert!(entry.raw & (1 << 16) != 0);
        assert_eq!(entry.low() & 0xFF, 0x30);
    }

    #[test]
    fn tick_advances_the_counter() {
        let before = ticks();
        tick();
        assert_eq!(ticks(), before + 1);
    }
}

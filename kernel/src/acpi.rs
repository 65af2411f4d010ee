//! In-house ACPI/MADT parser: walks RSDP → RSDT/XSDT → MADT and extracts
//! just enough hardware topology for [`crate::apic`] to program the Local
//! APIC and I/O APIC — no ACPICA, no AML interpreter.
//!
//! Trimmed from the teacher's much larger table zoo down to the MADT, since
//! this kernel has no PCIe (MCFG), IOMMU (DMAR), or NUMA (SRAT/SLIT) code to
//! feed. Single-CPU: the Local APIC entries enumerate processors the
//! scheduler has no way to use, so only the LAPIC's MMIO base survives.

use core::mem::size_of;

use crate::addr::{PhysAddr, VirtAddr};
use crate::errno::KernelError;
use crate::mm::vmm::phys_to_virt_addr;
use crate::sync::IrqSpinLock;

const RSDP_SIGNATURE: &[u8; 8] = b"RSD PTR ";
const RSDT_SIGNATURE: &[u8; 4] = b"RSDT";
const XSDT_SIGNATURE: &[u8; 4] = b"XSDT";
const MADT_SIGNATURE: &[u8; 4] = b"APIC";

const MADT_LOCAL_APIC: u8 = 0;
const MADT_IO_APIC: u8 = 1;
const MADT_INTERRUPT_SOURCE_OVERRIDE: u8 = 2;

const MAX_IO_APICS: usize = 4;
const MAX_ISO: usize = 24;

/// One I/O APIC discovered in the MADT.
#[derive(Debug, Clone, Copy)]
pub struct MadtIoApic {
    pub id: u8,
    pub address: u32,
    pub gsi_base: u32,
}

/// One ISA Interrupt Source Override: legacy IRQ `irq_source` is actually
/// wired to global system interrupt `gsi`, with the polarity/trigger mode
/// in `flags`.
#[derive(Debug, Clone, Copy)]
pub struct MadtIso {
    pub irq_source: u8,
    pub gsi: u32,
    flags: u16,
}

impl MadtIso {
    pub fn is_active_low(&self) -> bool {
        (self.flags & 0x03) == 0x03
    }

    pub fn is_level_triggered(&self) -> bool {
        ((self.flags >> 2) & 0x03) == 0x03
    }
}

/// Parsed ACPI information, populated once by [`init`].
#[derive(Debug)]
pub struct AcpiInfo {
    pub local_apic_address: u32,
    io_apics: [Option<MadtIoApic>; MAX_IO_APICS],
    io_apic_count: usize,
    isos: [Option<MadtIso>; MAX_ISO],
    iso_count: usize,
}

impl AcpiInfo {
    const fn new() -> Self {
        Self {
            local_apic_address: 0xFEE0_0000,
            io_apics: [None; MAX_IO_APICS],
            io_apic_count: 0,
            isos: [None; MAX_ISO],
            iso_count: 0,
        }
    }

    /// The first I/O APIC's MMIO base, or the architectural default if the
    /// MADT listed none.
    pub fn io_apic_address(&self) -> u32 {
        self.io_apics[0].map_or(0xFEC0_0000, |a| a.address)
    }

    /// Resolves a legacy ISA IRQ to (gsi, active_low, level_triggered),
    /// applying any Interrupt Source Override; absent an override this is
    /// the identity map, edge-triggered, active-high.
    pub fn irq_to_gsi(&self, irq: u8) -> (u32, bool, bool) {
        for iso in self.isos[..self.iso_count].iter().flatten() {
            if iso.irq_source == irq {
                return (iso.gsi, iso.is_active_low(), iso.is_level_triggered());
            }
        }
        (irq as u32, false, false)
    }
}

static ACPI_INFO: IrqSpinLock<Option<AcpiInfo>> = IrqSpinLock::new(None);

/// Runs `f` against the parsed ACPI info, if [`init`] has completed.
pub fn with_acpi_info<R, F: FnOnce(&AcpiInfo) -> R>(f: F) -> Option<R> {
    ACPI_INFO.lock().as_ref().map(f)
}

#[repr(C, packed)]
struct Rsdp {
    signature: [u8; 8],
    checksum: u8,
    oem_id: [u8; 6],
    revision: u8,
    rsdt_address: u32,
}

#[repr(C, packed)]
struct Rsdp2 {
    base: Rsdp,
    length: u32,
    xsdt_address: u64,
    extended_checksum: u8,
    _reserved: [u8; 3],
}

#[repr(C, packed)]
struct AcpiSdtHeader {
    signature: [u8; 4],
    length: u32,
    revision: u8,
    checksum: u8,
    oem_id: [u8; 6],
    oem_table_id: [u8; 8],
    oem_revision: u32,
    creator_id: u32,
    creator_revision: u32,
}

#[repr(C, packed)]
struct MadtHeader {
    sdt: AcpiSdtHeader,
    local_apic_address: u32,
    flags: u32,
}

#[repr(C, packed)]
struct MadtEntryHeader {
    entry_type: u8,
    length: u8,
}

#[repr(C, packed)]
struct MadtIoApicEntry {
    header: MadtEntryHeader,
    id: u8,
    _reserved: u8,
    address: u32,
    gsi_base: u32,
}

#[repr(C, packed)]
struct MadtIsoEntry {
    header: MadtEntryHeader,
    bus: u8,
    source: u8,
    gsi: u32,
    flags: u16,
}

/// Sums `len` bytes starting at `vaddr` and checks they total zero mod 256,
/// the checksum rule every ACPI table header follows.
fn validate_checksum(vaddr: VirtAddr, len: usize) -> bool {
    let base = vaddr.as_u64() as *const u8;
    let mut sum: u8 = 0;
    for i in 0..len {
        // SAFETY: caller guarantees `vaddr..vaddr+len` is a mapped ACPI table.
        sum = sum.wrapping_add(unsafe { *base.add(i) });
    }
    sum == 0
}

fn phys_to_virt(phys: u64) -> VirtAddr {
    phys_to_virt_addr(PhysAddr::new_truncate(phys))
}

fn parse_madt(header_vaddr: VirtAddr, info: &mut AcpiInfo) {
    let base = header_vaddr.as_u64() as usize;
    // SAFETY: `base` points at a MADT mapped through the HHDM; the packed
    // layout matches the ACPI specification's MADT header.
    let madt = unsafe { &*(base as *const MadtHeader) };
    let table_len = { madt.sdt.length } as usize;

    info.local_apic_address = madt.local_apic_address;

    let entries_start = base + size_of::<MadtHeader>();
    let entries_end = base + table_len;
    let mut offset = entries_start;

    while offset + 2 <= entries_end {
        // SAFETY: `offset` is within the MADT bounds checked above.
        let entry_header = unsafe { &*(offset as *const MadtEntryHeader) };
        let entry_len = entry_header.length as usize;
        if entry_len < 2 || offset + entry_len > entries_end {
            break;
        }

        match entry_header.entry_type {
            MADT_IO_APIC if entry_len >= size_of::<MadtIoApicEntry>() && info.io_apic_count < MAX_IO_APICS => {
                // SAFETY: entry type 1 has the MadtIoApicEntry layout and we
                // checked its length.
                let entry = unsafe { &*(offset as *const MadtIoApicEntry) };
                info.io_apics[info.io_apic_count] = Some(MadtIoApic {
                    id: entry.id,
                    address: { entry.address },
                    gsi_base: { entry.gsi_base },
                });
                info.io_apic_count += 1;
            }
            MADT_INTERRUPT_SOURCE_OVERRIDE if entry_len >= size_of::<MadtIsoEntry>() && info.iso_count < MAX_ISO => {
                // SAFETY: entry type 2 has the MadtIsoEntry layout and we
                // checked its length.
                let entry = unsafe { &*(offset as *const MadtIsoEntry) };
                info.isos[info.iso_count] = Some(MadtIso {
                    irq_source: entry.source,
                    gsi: { entry.gsi },
                    flags: { entry.flags },
                });
                info.iso_count += 1;
            }
            MADT_LOCAL_APIC | MADT_IO_APIC | MADT_INTERRUPT_SOURCE_OVERRIDE => {
                // Recognized but dropped (CPU enumeration) or table full.
            }
            other => {
                log::debug!("acpi: unrecognized MADT entry type {other} (len {entry_len})");
            }
        }

        offset += entry_len;
    }
}

fn parse_table(table_vaddr: VirtAddr, info: &mut AcpiInfo) {
    let base = table_vaddr.as_u64() as usize;
    // SAFETY: `base` points at an ACPI table mapped through the HHDM.
    let sdt = unsafe { &*(base as *const AcpiSdtHeader) };
    let sig = sdt.signature;
    let len = { sdt.length } as usize;

    if &sig == MADT_SIGNATURE {
        if !validate_checksum(table_vaddr, len) {
            log::warn!("acpi: MADT checksum invalid");
        }
        parse_madt(table_vaddr, info);
    }
}

fn parse_rsdt(rsdt_vaddr: VirtAddr, info: &mut AcpiInfo) -> Result<(), KernelError> {
    let base = rsdt_vaddr.as_u64() as usize;
    // SAFETY: `base` points at the RSDT mapped through the HHDM.
    let sdt = unsafe { &*(base as *const AcpiSdtHeader) };
    let len = { sdt.length } as usize;

    if &{ sdt.signature } != RSDT_SIGNATURE {
        return Err(KernelError::InvalidArgument);
    }
    if !validate_checksum(rsdt_vaddr, len) {
        log::warn!("acpi: RSDT checksum invalid");
    }

    let header_size = size_of::<AcpiSdtHeader>();
    let num_entries = (len - header_size) / 4;
    for i in 0..num_entries {
        let ptr_addr = base + header_size + i * 4;
        // SAFETY: `ptr_addr` is within the RSDT bounds checked above.
        let phys = unsafe { *(ptr_addr as *const u32) } as u64;
        parse_table(phys_to_virt(phys), info);
    }
    Ok(())
}

fn parse_xsdt(xsdt_vaddr: VirtAddr, info: &mut AcpiInfo) -> Result<(), KernelError> {
    let base = xsdt_vaddr.as_u64() as usize;
    // SAFETY: `base` points at the XSDT mapped through the HHDM.
    let sdt = unsafe { &*(base as *const AcpiSdtHeader) };
    let len = { sdt.length } as usize;

    if &{ sdt.signature } != XSDT_SIGNATURE {
        return Err(KernelError::InvalidArgument);
    }
    if !validate_checksum(xsdt_vaddr, len) {
        log::warn!("acpi: XSDT checksum invalid");
    }

    let header_size = size_of::<AcpiSdtHeader>();
    let num_entries = (len - header_size) / 8;
    for i in 0..num_entries {
        let ptr_addr = base + header_size + i * 8;
        // SAFETY: `ptr_addr` is within the XSDT bounds checked above.
        let phys = unsafe { *(ptr_addr as *const u64) };
        parse_table(phys_to_virt(phys), info);
    }
    Ok(())
}

/// Parses the RSDP the bootloader handed us down through RSDT/XSDT to the
/// MADT, filling in the Local APIC's MMIO base, every I/O APIC, and every
/// ISA IRQ override. Must run after the VMM (for [`phys_to_virt_addr`]) is
/// up.
pub fn init(rsdp_phys: PhysAddr) -> Result<(), KernelError> {
    let rsdp_vaddr = phys_to_virt_addr(rsdp_phys);
    let rsdp_base = rsdp_vaddr.as_u64() as usize;
    // SAFETY: `rsdp_base` is the HHDM alias of the bootloader-provided RSDP.
    let rsdp = unsafe { &*(rsdp_base as *const Rsdp) };
    if &rsdp.signature != RSDP_SIGNATURE {
        return Err(KernelError::InvalidArgument);
    }
    if !validate_checksum(rsdp_vaddr, 20) {
        log::warn!("acpi: RSDP checksum invalid");
    }

    let mut info = AcpiInfo::new();
    let revision = rsdp.revision;

    if revision >= 2 {
        // SAFETY: an ACPI 2.0+ RSDP is at least `size_of::<Rsdp2>()` bytes.
        let rsdp2 = unsafe { &*(rsdp_base as *const Rsdp2) };
        let xsdt_phys = { rsdp2.xsdt_address };
        if xsdt_phys != 0 {
            parse_xsdt(phys_to_virt(xsdt_phys), &mut info)?;
        } else {
            parse_rsdt(phys_to_virt(rsdp.rsdt_address as u64), &mut info)?;
        }
    } else {
        parse_rsdt(phys_to_virt(rsdp.rsdt_address as u64), &mut info)?;
    }

    log::info!(
        "acpi: lapic={:#x} ioapics={} isos={}",
        info.local_apic_address,
        info.io_apic_count,
        info.iso_count
    );

    *ACPI_INFO.lock() = Some(info);
    Ok(())
}

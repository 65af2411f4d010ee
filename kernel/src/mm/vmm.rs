//! Virtual Memory Manager: 4-level page tables and the higher-half direct map.
//!
//! Grounded on `arch/x86_64/memory/vmm.cpp` in the original implementation,
//! rewritten around the typed [`PhysAddr`]/[`VirtAddr`] newtypes instead of
//! raw `uintptr_t` and a single [`IrqSpinLock`]-guarded [`VmmState`] instead
//! of file-scope statics.
//!
//! The HHDM lets the kernel read and write any physical address, including
//! the page tables of a process that is not currently installed in CR3, by
//! simple pointer arithmetic (`phys + hhdm_offset`). Every walk below reads
//! and writes page tables exclusively through HHDM-mapped pointers.

use core::mem::size_of;

use crate::addr::{PhysAddr, VirtAddr};
use crate::mm::pmm::{FRAME_SIZE, PFA};
use crate::sync::IrqSpinLock;

bitflags::bitflags! {
    /// Leaf PTE permission bits, translated from the public flag words that
    /// `map_kpage`/`map_mem_at` accept.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
        const HUGE_OR_PAT   = 1 << 7;
        const GLOBAL        = 1 << 8;
        const NO_EXECUTE    = 1 << 63;
    }
}

const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;
const FLAG_MASK: u64 = !ADDR_MASK;

/// A single 64-bit page-table entry (leaf or interior).
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn is_present(self) -> bool {
        self.0 & PageFlags::PRESENT.bits() != 0
    }

    pub const fn addr(self) -> PhysAddr {
        PhysAddr::new_truncate(self.0 & ADDR_MASK)
    }

    pub const fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0 & FLAG_MASK)
    }

    pub fn set(&mut self, phys: PhysAddr, flags: PageFlags) {
        self.0 = (phys.as_u64() & ADDR_MASK) | flags.bits();
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

/// A 512-entry page table (any of PML4/PDPT/PD/PT — they share a layout).
#[repr(C, align(4096))]
pub struct PageTable {
    pub entries: [PageTableEntry; 512],
}

struct VmmState {
    hhdm_offset: u64,
    kernel_pml4: PhysAddr,
}

static STATE: IrqSpinLock<Option<VmmState>> = IrqSpinLock::new(None);

fn state() -> impl core::ops::DerefMut<Target = Option<VmmState>> {
    STATE.lock()
}

/// Converts an HHDM-resident physical address to its virtual alias.
pub fn phys_to_virt_addr(phys: PhysAddr) -> VirtAddr {
    let offset = state().as_ref().expect("vmm not initialized").hhdm_offset;
    VirtAddr::new_truncate(phys.as_u64() + offset)
}

/// Converts an HHDM-resident virtual address back to its physical address.
pub fn hhdm_virt_to_phys(virt: VirtAddr) -> PhysAddr {
    let offset = state().as_ref().expect("vmm not initialized").hhdm_offset;
    PhysAddr::new_truncate(virt.as_u64() - offset)
}

/// Reinterprets an HHDM-resident virtual address as `&mut T`.
///
/// # Safety
/// `virt` must be HHDM-resident, properly aligned for `T`, and not aliased
/// in a way that violates Rust's mutability rules.
pub unsafe fn phys_to_virt<T>(phys: PhysAddr) -> *mut T {
    phys_to_virt_addr(phys).as_mut_ptr::<T>()
}

fn pml4_table() -> *mut PageTable {
    let offset = state().as_ref().expect("vmm not initialized").hhdm_offset;
    let kernel_pml4 = state().as_ref().unwrap().kernel_pml4;
    VirtAddr::new_truncate(kernel_pml4.as_u64() + offset).as_mut_ptr::<PageTable>()
}

fn table_at(phys: PhysAddr) -> *mut PageTable {
    phys_to_virt_addr(phys).as_mut_ptr::<PageTable>()
}

fn zero_page(phys: PhysAddr) {
    let ptr = table_at(phys) as *mut u8;
    // SAFETY: `phys` was just allocated from the PFA and is HHDM-mapped;
    // `ptr` points to a full, writable 4 KiB frame.
    unsafe { core::ptr::write_bytes(ptr, 0, FRAME_SIZE as usize) };
}

/// Ensures `entry` points to a present next-level table, allocating and
/// zeroing a fresh frame if it does not.
fn ensure_table_present(entry: &mut PageTableEntry) -> PhysAddr {
    if !entry.is_present() {
        let frame = PFA.alloc_frame();
        zero_page(frame);
        entry.set(frame, PageFlags::PRESENT | PageFlags::WRITABLE);
    }
    entry.addr()
}

/// Walks (and lazily extends) `pml4` to install `phys` at `virt` with `flags`.
///
/// This is the central algorithm: split `virt` into its four 9-bit table
/// indices, walking PML4 → PDPT → PD → PT, creating any missing intermediate
/// table along the way, then writing the leaf PTE and invalidating the TLB
/// entry for `virt`.
pub fn map_page(pml4: *mut PageTable, virt: VirtAddr, phys: PhysAddr, flags: PageFlags) {
    // SAFETY: `pml4` is a valid, HHDM-resident page table (either the kernel
    // PML4 or one created by `create_user_pml4`); every level below is
    // reached the same way, through `ensure_table_present` + `table_at`.
    unsafe {
        let l4 = &mut (*pml4).entries[virt.pml4_index()];
        let pdpt = table_at(ensure_table_present(l4));

        let l3 = &mut (*pdpt).entries[virt.pdpt_index()];
        let pd = table_at(ensure_table_present(l3));

        let l2 = &mut (*pd).entries[virt.pd_index()];
        let pt = table_at(ensure_table_present(l2));

        let leaf = &mut (*pt).entries[virt.pt_index()];
        leaf.set(phys, flags | PageFlags::PRESENT);
    }
    invlpg(virt);
}

/// Maps a page in the kernel's own PML4.
pub fn map_kpage(virt: VirtAddr, phys: PhysAddr, flags: PageFlags) {
    map_page(pml4_table(), virt, phys, flags);
}

/// Maps `phys` at its HHDM alias and returns that virtual address.
pub fn map_hhdm_page(phys: PhysAddr, flags: PageFlags) -> VirtAddr {
    let virt = phys_to_virt_addr(phys);
    map_kpage(virt, phys, flags);
    virt
}

/// Looks up the PTE mapping `virt` in `pml4`, if any.
fn walk(pml4: *mut PageTable, virt: VirtAddr) -> Option<PageTableEntry> {
    // SAFETY: same invariants as `map_page` — `pml4` and every intermediate
    // table reached below are HHDM-resident page tables.
    unsafe {
        let l4 = (*pml4).entries[virt.pml4_index()];
        if !l4.is_present() {
            return None;
        }
        let pdpt = table_at(l4.addr());
        let l3 = (*pdpt).entries[virt.pdpt_index()];
        if !l3.is_present() {
            return None;
        }
        let pd = table_at(l3.addr());
        let l2 = (*pd).entries[virt.pd_index()];
        if !l2.is_present() {
            return None;
        }
        let pt = table_at(l2.addr());
        let leaf = (*pt).entries[virt.pt_index()];
        if !leaf.is_present() {
            return None;
        }
        Some(leaf)
    }
}

/// Translates `virt` to its mapped physical page base, in `pml4`'s address
/// space. Returns `None` if unmapped.
pub fn virt_to_phys(pml4: *mut PageTable, virt: VirtAddr) -> Option<PhysAddr> {
    walk(pml4, virt).map(PageTableEntry::addr)
}

/// Unmaps `virt` in `pml4` and frees its backing frame to the PFA.
pub fn unmap_page(pml4: *mut PageTable, virt: VirtAddr) {
    let Some(pte) = walk(pml4, virt) else {
        log::warn!("vmm: unmap of unmapped address {virt}");
        return;
    };
    // SAFETY: same walk as `walk`, now writing the leaf back to empty.
    unsafe {
        let l4 = (*pml4).entries[virt.pml4_index()];
        let pdpt = table_at(l4.addr());
        let l3 = (*pdpt).entries[virt.pdpt_index()];
        let pd = table_at(l3.addr());
        let l2 = (*pd).entries[virt.pd_index()];
        let pt = table_at(l2.addr());
        (*pt).entries[virt.pt_index()].clear();
    }
    invlpg(virt);
    PFA.free_frame(pte.addr());
}

/// Maps `bytes` worth of fresh frames starting at `virt` in `pml4`. Returns
/// the number of pages mapped.
pub fn map_mem_at(pml4: *mut PageTable, virt: VirtAddr, bytes: u64, flags: PageFlags) -> usize {
    let num_pages = bytes.div_ceil(FRAME_SIZE) as usize;
    for page in 0..num_pages {
        let frame = PFA.alloc_frame();
        map_page(pml4, virt + (page as u64 * FRAME_SIZE), frame, flags);
    }
    num_pages
}

/// Unmaps `num_pages` pages starting at `virt` in `pml4`.
pub fn unmap_mem_at(pml4: *mut PageTable, virt: VirtAddr, num_pages: usize) {
    for page in 0..num_pages {
        unmap_page(pml4, virt + (page as u64 * FRAME_SIZE));
    }
}

/// Allocates a single HHDM-resident kernel page (no header).
pub fn alloc_kpage() -> *mut u8 {
    let frame = PFA.alloc_frame();
    phys_to_virt_addr(frame).as_mut_ptr::<u8>()
}

/// Frees a page allocated by [`alloc_kpage`].
pub fn free_kpage(virt: *mut u8) {
    if virt.is_null() {
        return;
    }
    let phys = hhdm_virt_to_phys(VirtAddr::new_truncate(virt as u64));
    PFA.free_frame(phys);
}

/// Allocates a contiguous run of kernel pages sized to hold `bytes`, storing
/// a leading page-count header so [`free_contiguous_kmem`] knows the extent.
pub fn alloc_contiguous_kmem(bytes: usize) -> *mut u8 {
    let total = bytes + size_of::<usize>();
    let num_pages = (total as u64).div_ceil(FRAME_SIZE) as usize;
    let phys = PFA.alloc_contiguous_frames(num_pages);
    let block = phys_to_virt_addr(phys).as_mut_ptr::<u8>();
    // SAFETY: `block` is a freshly allocated, HHDM-mapped, `num_pages`-long
    // run; it is at least `size_of::<usize>()` bytes.
    unsafe { (block as *mut usize).write(num_pages) };
    // SAFETY: header occupies the first `size_of::<usize>()` bytes of block.
    unsafe { block.add(size_of::<usize>()) }
}

/// Frees a block allocated by [`alloc_contiguous_kmem`].
pub fn free_contiguous_kmem(virt: *mut u8) {
    if virt.is_null() {
        return;
    }
    // SAFETY: `virt` was returned by `alloc_contiguous_kmem`, so the header
    // sits immediately before it.
    let block = unsafe { virt.sub(size_of::<usize>()) };
    // SAFETY: the header was written by `alloc_contiguous_kmem`.
    let num_pages = unsafe { (block as *const usize).read() };
    let phys = hhdm_virt_to_phys(VirtAddr::new_truncate(block as u64));
    PFA.free_contiguous_frames(phys, num_pages);
}

/// Allocates a new user PML4 whose upper half is an exact copy of the
/// kernel PML4's upper half; the lower half is left empty.
pub fn create_user_pml4() -> *mut PageTable {
    let frame = PFA.alloc_frame();
    zero_page(frame);
    let new_pml4 = table_at(frame);
    let kernel_pml4 = pml4_table();
    let hhdm_offset = state().as_ref().expect("vmm not initialized").hhdm_offset;
    let kernel_start = VirtAddr::new_truncate(hhdm_offset).pml4_index();
    // SAFETY: both tables are valid, HHDM-resident 512-entry page tables.
    unsafe {
        for i in kernel_start..512 {
            (*new_pml4).entries[i] = (*kernel_pml4).entries[i];
        }
    }
    new_pml4
}

/// Frees every present entry of a user PML4's lower half and the PML4 frame
/// itself. Does not walk lower-level tables still referenced elsewhere;
/// callers must have already unmapped every allocation via
/// [`unmap_mem_at`].
pub fn free_page_tables(pml4: *mut PageTable) {
    let hhdm_offset = state().as_ref().expect("vmm not initialized").hhdm_offset;
    let kernel_start = VirtAddr::new_truncate(hhdm_offset).pml4_index();
    // SAFETY: `pml4` is HHDM-resident; freeing the intermediate tables below
    // the lower half mirrors how they were allocated in `ensure_table_present`.
    unsafe {
        for l4_idx in 0..kernel_start {
            let l4 = (*pml4).entries[l4_idx];
            if !l4.is_present() {
                continue;
            }
            let pdpt = table_at(l4.addr());
            for l3_idx in 0..512usize {
                let l3 = (*pdpt).entries[l3_idx];
                if !l3.is_present() {
                    continue;
                }
                let pd = table_at(l3.addr());
                for l2_idx in 0..512usize {
                    let l2 = (*pd).entries[l2_idx];
                    if l2.is_present() {
                        PFA.free_frame(l2.addr());
                    }
                }
                PFA.free_frame(l3.addr());
            }
            PFA.free_frame(l4.addr());
        }
    }
    let phys = hhdm_virt_to_phys(VirtAddr::new_truncate(pml4 as u64));
    PFA.free_frame(phys);
}

/// Switches CR3 to `pml4`.
pub fn switch_pml4(pml4: *mut PageTable) {
    let phys = hhdm_virt_to_phys(VirtAddr::new_truncate(pml4 as u64));
    write_cr3(phys);
}

/// Switches CR3 back to the kernel's own PML4.
pub fn switch_kernel_pml4() {
    let phys = state().as_ref().expect("vmm not initialized").kernel_pml4;
    write_cr3(phys);
}

/// Captures the HHDM offset and latches the kernel PML4 from CR3. Must be
/// called exactly once, before any other VMM function.
pub fn init(hhdm_offset: u64) {
    let kernel_pml4 = read_cr3();
    *state() = Some(VmmState {
        hhdm_offset,
        kernel_pml4,
    });
    log::info!("vmm: hhdm_offset={hhdm_offset:#x} kernel_pml4={kernel_pml4}");
}

#[cfg(target_os = "none")]
fn read_cr3() -> PhysAddr {
    use x86_64::registers::control::Cr3;
    let (frame, _) = Cr3::read();
    PhysAddr::new_truncate(frame.start_address().as_u64())
}

#[cfg(target_os = "none")]
fn write_cr3(phys: PhysAddr) {
    use x86_64::registers::control::{Cr3, Cr3Flags};
    use x86_64::structures::paging::PhysFrame;
    let frame = PhysFrame::containing_address(x86_64::PhysAddr::new(phys.as_u64()));
    // SAFETY: `phys` points to a valid, fully-populated PML4 whose upper
    // half mirrors the kernel's; switching CR3 to it is the documented way
    // to change address spaces.
    unsafe { Cr3::write(frame, Cr3Flags::empty()) };
}

#[cfg(target_os = "none")]
fn invlpg(virt: VirtAddr) {
    use x86_64::instructions::tlb;
    tlb::flush(x86_64::VirtAddr::new(virt.as_u64()));
}

#[cfg(not(target_os = "none"))]
fn read_cr3() -> PhysAddr {
    PhysAddr::zero()
}

#[cfg(not(target_os = "none"))]
fn write_cr3(_phys: PhysAddr) {}

#[cfg(not(target_os = "none"))]
fn invlpg(_virt: VirtAddr) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_table_entry_roundtrip() {
        let mut pte = PageTableEntry::empty();
        assert!(!pte.is_present());
        let phys = PhysAddr::from_frame_index(42);
        pte.set(phys, PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER);
        assert!(pte.is_present());
        assert_eq!(pte.addr(), phys);
        assert!(pte.flags().contains(PageFlags::WRITABLE));
        assert!(pte.flags().contains(PageFlags::USER));
        assert!(!pte.flags().contains(PageFlags::NO_EXECUTE));
    }

    #[test]
    fn page_table_entry_clear() {
        let mut pte = PageTableEntry::empty();
        pte.set(PhysAddr::from_frame_index(1), PageFlags::PRESENT);
        pte.clear();
        assert!(!pte.is_present());
        assert_eq!(pte.addr(), PhysAddr::zero());
    }

    #[test]
    fn addr_mask_discards_flag_bits() {
        let mut pte = PageTableEntry::empty();
        let phys = PhysAddr::from_frame_index(0x1234);
        pte.set(phys, PageFlags::all());
        assert_eq!(pte.addr(), phys);
    }
}

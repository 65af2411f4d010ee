//! Freestanding entry point: the Limine request/response exchange, early
//! physical-memory bootstrap, and the boot sequence that hands off to
//! [`kestrel::arch_init`] and the scheduler.
//!
//! Everything that doesn't need bootloader-supplied data lives in `arch_init`
//! in `lib.rs`; this file only does the parts that do: harvesting the memory
//! map for the PFA, finding the HHDM offset and RSDP, loading the initramfs
//! module, and mounting the two filesystems before spawning the first
//! process.

#![no_std]
#![no_main]

extern crate alloc;

use alloc::boxed::Box;

use kestrel::addr::PhysAddr;
use kestrel::fs::{self, devfs::Devfs, initramfs};
use kestrel::mm::pmm::PFA;
use kestrel::{klog, sched};

use limine::memory_map::EntryType;
use limine::request::{HhdmRequest, MemoryMapRequest, ModuleRequest, RequestsEndMarker, RequestsStartMarker, RsdpRequest};
use limine::BaseRevision;

/// The path the first user process is loaded from; must exist in the
/// initramfs archive the build packs into `initramfs.tar`.
const INIT_PATH: &str = "/bin/a";

#[used]
#[unsafe(link_section = ".requests")]
static BASE_REVISION: BaseRevision = BaseRevision::new();

#[used]
#[unsafe(link_section = ".requests")]
static MEMORY_MAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

#[used]
#[unsafe(link_section = ".requests")]
static HHDM_REQUEST: HhdmRequest = HhdmRequest::new();

#[used]
#[unsafe(link_section = ".requests")]
static RSDP_REQUEST: RsdpRequest = RsdpRequest::new();

#[used]
#[unsafe(link_section = ".requests")]
static MODULE_REQUEST: ModuleRequest = ModuleRequest::new();

#[used]
#[unsafe(link_section = ".requests_start_marker")]
static _START_MARKER: RequestsStartMarker = RequestsStartMarker::new();
#[used]
#[unsafe(link_section = ".requests_end_marker")]
static _END_MARKER: RequestsEndMarker = RequestsEndMarker::new();

/// Walks the Limine memory map and hands every `USABLE` region to the PFA.
/// Must run before [`kestrel::arch_init`], which needs frames to allocate
/// page tables.
fn init_physical_memory() {
    let response = MEMORY_MAP_REQUEST.get_response().expect("limine: no memory map response");
    PFA.init();
    for entry in response.entries() {
        if entry.entry_type == EntryType::USABLE {
            PFA.add_free_memory(PhysAddr::new_truncate(entry.base), entry.length);
        }
    }
    log::info!("pmm: {} frames free after memory map scan", PFA.get_free_frames());
}

/// Finds the `initramfs.tar` module Limine loaded alongside the kernel (per
/// `limine.conf`'s `module_path`) and hands its bytes to [`initramfs::parse`].
///
/// # Safety
/// Must run after the bootloader-reclaimable memory described by the module
/// response is known not to be reused; Limine guarantees modules stay mapped
/// and untouched until the kernel explicitly releases that memory, which this
/// kernel never does.
fn mount_filesystems() {
    fs::mount("/", Box::new(load_initramfs()));
    fs::mount("/dev", Box::new(Devfs));
}

fn load_initramfs() -> initramfs::Initramfs {
    let response = MODULE_REQUEST.get_response().expect("limine: no module response");
    let module = response.modules().first().expect("limine: initramfs module not found");
    // SAFETY: Limine maps every module's bytes as a contiguous, permanently
    // reserved region for the kernel's entire lifetime; `addr()`/`size()` are
    // exactly that region.
    let data = unsafe { core::slice::from_raw_parts(module.addr(), module.size() as usize) };
    initramfs::parse(data)
}

/// Entry point named in `linker.ld`'s `ENTRY(kernel_entry)`. Diverges into
/// [`sched::run`]; nothing after the call to it ever executes.
#[unsafe(no_mangle)]
extern "C" fn kernel_entry() -> ! {
    klog::init(log::LevelFilter::Info);
    log::info!("kestrel: booting");

    assert!(BASE_REVISION.is_supported(), "limine: unsupported base revision");

    init_physical_memory();

    let hhdm_offset = HHDM_REQUEST.get_response().expect("limine: no HHDM response").offset();
    let rsdp_phys = PhysAddr::new_truncate(RSDP_REQUEST.get_response().expect("limine: no RSDP response").address() as u64);

    // SAFETY: runs exactly once, here, before interrupts are enabled and
    // before any subsystem it initializes is used.
    unsafe {
        kestrel::arch_init(hhdm_offset, rsdp_phys);
    }

    mount_filesystems();

    match sched::spawn(INIT_PATH) {
        Ok(pid) => log::info!("spawned {INIT_PATH} as pid {pid}"),
        Err(e) => panic!("failed to spawn {INIT_PATH}: {e:?}"),
    }

    sched::run();
}

//! `hypervisor::host::Host` for the running machine (SPEC_FULL.md 10.1).
//!
//! This is where every external collaborator spec.md 1 calls out of scope
//! for the core actually lives: SVM enablement is done in `processor.rs`
//! before this host is handed to `hypervisor::per_cpu_init`; the physical
//! memory map, kernel symbol table, and virtual-to-physical translation
//! are supplied by whatever packaging layer loads this driver (spec.md 1
//! "acquisition of the physical-memory map" / "file/driver packaging") —
//! `PlatformConfig` is the seam where that layer plugs in, so this module
//! never has to fabricate a PE-export-table walker or a physical-memory
//! enumerator to stay buildable on its own.

use core::arch::x86_64::__cpuid_count;
use core::sync::atomic::{AtomicUsize, Ordering};

use hypervisor::addresses::PhysicalAddress;
use hypervisor::host::{CpuidResult, Host, PhysicalMemoryRun, PinnedPage};
use x86_64::registers::model_specific::Msr;

/// Bump allocator over a static backing arena standing in for the
/// kernel's non-paged pool (spec.md 6 `AllocateExecutablePage`/
/// `AllocatePage`). A real driver replaces this with the host kernel's
/// pool allocator; the bump scheme here only has to satisfy this crate's
/// own contract of "zeroed, pinned, permanently resident" pages, which it
/// does by never reusing a slot.
const ARENA_PAGES: usize = 4096;

#[repr(C, align(4096))]
struct Arena([[u8; 4096]; ARENA_PAGES]);

static mut ARENA: Arena = Arena([[0u8; 4096]; ARENA_PAGES]);
static ARENA_NEXT: AtomicUsize = AtomicUsize::new(0);

fn bump_alloc_pages(count: usize) -> Option<*mut u8> {
    let start = ARENA_NEXT.fetch_add(count, Ordering::Relaxed);
    if start + count > ARENA_PAGES {
        return None;
    }
    // SAFETY: each index in `[start, start+count)` is handed out by this
    // function at most once, ever (the counter only increases), so no two
    // callers ever observe the same page.
    unsafe { Some(ARENA.0[start].as_mut_ptr()) }
}

/// Everything about the running machine the embedding loader must supply
/// because `hypervisor` deliberately stays host-agnostic (spec.md 1).
/// Resolving symbols and enumerating RAM runs requires walking kernel
/// structures this crate has no business owning.
pub struct PlatformConfig {
    pub physical_memory_runs: &'static [PhysicalMemoryRun],
    pub kernel_symbols: &'static [(&'static str, u64)],
    /// Identity or otherwise: translates a virtual address this driver
    /// allocated into the physical address the hardware NPT walker (or
    /// VMCB/MSRPM pointer fields) must see.
    pub virt_to_phys: fn(*const u8) -> PhysicalAddress,
}

pub struct PlatformHost {
    config: PlatformConfig,
}

impl PlatformHost {
    pub const fn new(config: PlatformConfig) -> Self {
        Self { config }
    }
}

impl Host for PlatformHost {
    fn physical_memory_runs(&self) -> &[PhysicalMemoryRun] {
        self.config.physical_memory_runs
    }

    fn resolve_kernel_symbol(&self, name: &'static str) -> Option<u64> {
        self.config
            .kernel_symbols
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, va)| *va)
    }

    fn pin_and_map_virtual(&self, page_va: u64) -> Option<PinnedPage> {
        // The kernel virtual address space this driver hooks into is
        // already mapped and wired by the running OS (spec.md 1, Type-2:
        // "virtualizes an already-running operating system in place");
        // pinning here means marking the page non-pageable in whatever
        // memory manager owns it, which is itself the packaging layer's
        // concern (spec.md 1 "file/driver packaging"). `pin_token` is
        // opaque to the core, so this host uses the physical address
        // itself as the token.
        let physical_address = PhysicalAddress::new((self.config.virt_to_phys)(page_va as *const u8).as_u64());
        Some(PinnedPage {
            physical_address,
            pin_token: physical_address.as_u64(),
        })
    }

    fn unpin(&self, _pin_token: u64) {}

    fn read_page(&self, page_va: u64) -> [u8; 4096] {
        let mut bytes = [0u8; 4096];
        // SAFETY: `page_va` names a 4 KiB page inside the already-running
        // kernel's mapped address space (spec.md 1), readable from ring 0.
        unsafe {
            core::ptr::copy_nonoverlapping(page_va as *const u8, bytes.as_mut_ptr(), 4096);
        }
        bytes
    }

    fn virt_to_phys(&self, va: *const u8) -> PhysicalAddress {
        (self.config.virt_to_phys)(va)
    }

    fn allocate_page(&self) -> Option<*mut u8> {
        bump_alloc_pages(1)
    }

    fn allocate_executable(&self, len: usize) -> Option<*mut u8> {
        let pages = (len + 4095) / 4096;
        bump_alloc_pages(pages.max(1))
    }

    fn free(&self, _ptr: *mut u8, _len: usize) {
        // The bump arena never reclaims; see its doc comment. A real
        // pool-backed host frees through the kernel's allocator here.
    }

    fn invalidate_all_instruction_caches(&self) {
        // SAFETY: `wbinvd` takes no operands and has no memory-safety
        // precondition beyond CPL 0, which this driver always runs at.
        unsafe { core::arch::asm!("wbinvd", options(nomem, nostack)) };
    }

    fn for_each_logical_processor(&self, f: &mut dyn FnMut(usize)) {
        // IPI broadcast to every logical processor is the packaging
        // layer's concern (spec.md 1); this host runs `f` only on the
        // calling processor, matching a single-processor deployment.
        f(0);
    }

    fn cpuid(&self, eax: u32, ecx: u32) -> CpuidResult {
        // SAFETY: `__cpuid_count` always a valid instruction on any
        // AMD64 CPU; no precondition beyond the leaf/subleaf arguments.
        let result = unsafe { __cpuid_count(eax, ecx) };
        CpuidResult {
            eax: result.eax,
            ebx: result.ebx,
            ecx: result.ecx,
            edx: result.edx,
        }
    }

    fn read_msr(&self, msr: u32) -> u64 {
        // SAFETY: reading an MSR is side-effect-free and valid at CPL 0.
        unsafe { Msr::new(msr).read() }
    }

    fn write_msr(&self, msr: u32, value: u64) {
        // SAFETY: writing EFER/VM_CR here is exactly the operation this
        // driver exists to perform, from CPL 0, before/after
        // virtualization.
        unsafe { Msr::new(msr).write(value) };
    }
}

//! Nested Page Table hierarchy manager (spec.md 4.B) — the first half of
//! the CORE.
//!
//! A 4-level, 4 KiB-granular NPT mapping guest physical addresses
//! identity-wise onto host physical addresses. Only `no-execute` is ever
//! toggled (read/write stay permanently enabled on every valid entry):
//! NPT cannot express "execute, but not read", which is the limitation
//! the whole hook engine (`hooks::state`) is built around.
//!
//! Grounded on `nickbetteridge-kernel`'s `npt.rs` (index shifts, on-demand
//! sub-table construction) and `not-matthias-amd_hypervisor`'s
//! `nested_page_table.rs` (the sibling-mask problem called out in its own
//! `change_page_permission`/`change_all_permissions` comments).

use crate::addresses::PhysicalAddress;
use crate::error::{HypervisorError, Result};
use alloc::boxed::Box;
use core::sync::atomic::{AtomicUsize, Ordering};

/// AMD64 paging index shift for each of the 4 NPT levels (PML4, PDPT, PD, PT).
const LEVEL_SHIFT: [u32; 4] = [39, 30, 21, 12];
const LEVEL_MASK: u64 = 0x1FF;

fn index_at(level: usize, pa: u64) -> usize {
    ((pa >> LEVEL_SHIFT[level]) & LEVEL_MASK) as usize
}

/// A single 64-bit NPT entry: `{valid, write, user, pfn[51:12], nx}`. This
/// is the exact byte layout a hardware table-walk reads, so it carries no
/// Rust-side bookkeeping.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct NptEntry(u64);

impl NptEntry {
    const PRESENT: u64 = 1 << 0;
    const WRITE: u64 = 1 << 1;
    const USER: u64 = 1 << 2;
    const NX: u64 = 1 << 63;
    const PFN_MASK: u64 = 0x000F_FFFF_FFFF_F000;

    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn is_valid(self) -> bool {
        self.0 & Self::PRESENT != 0
    }

    pub fn is_nx(self) -> bool {
        self.0 & Self::NX != 0
    }

    pub fn pfn(self) -> u64 {
        (self.0 & Self::PFN_MASK) >> 12
    }

    pub fn physical_address(self) -> PhysicalAddress {
        PhysicalAddress::from_pfn(self.pfn())
    }

    /// Materialize this entry as `{valid=1, write=1, user=1, pfn, nx}`.
    /// Read/write are always enabled — see the module doc comment.
    pub fn set(&mut self, pfn: u64, nx: bool) {
        let mut bits = Self::PRESENT | Self::WRITE | Self::USER;
        bits |= (pfn << 12) & Self::PFN_MASK;
        if nx {
            bits |= Self::NX;
        }
        self.0 = bits;
    }

    pub fn set_nx(&mut self, nx: bool) {
        if nx {
            self.0 |= Self::NX;
        } else {
            self.0 &= !Self::NX;
        }
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl core::fmt::Debug for NptEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NptEntry")
            .field("valid", &self.is_valid())
            .field("nx", &self.is_nx())
            .field("pfn", &format_args!("{:#x}", self.pfn()))
            .finish()
    }
}

/// The literal hardware-visible 4 KiB page: 512 entries, nothing else.
/// This is what NCr3 and every interior PFN ultimately point at.
#[repr(C, align(4096))]
pub struct NptPage {
    pub entries: [NptEntry; 512],
}

impl NptPage {
    pub fn zeroed() -> Self {
        Self {
            entries: [NptEntry::empty(); 512],
        }
    }
}

/// Host-side ownership of one NPT node plus its children. Kept separate
/// from `NptPage` so the 4 KiB hardware page never carries Rust
/// bookkeeping bytes.
pub struct NptTable {
    page: Box<NptPage>,
    children: Box<[Option<Box<NptTable>>; 512]>,
}

impl NptTable {
    fn new(page: Box<NptPage>) -> Self {
        Self {
            page,
            children: Box::new(core::array::from_fn(|_| None)),
        }
    }
}

/// Supplies zeroed pages for on-demand sub-table construction. Two
/// implementations: `FreshAllocator` (initial construction, backed by the
/// host's page allocator) and `PreAllocPool` (runtime NPF handling,
/// bounded and non-blocking).
pub trait TableSource {
    fn new_table(&mut self) -> Result<NptTable>;
}

/// Builds tables straight from the host allocator. Used only while
/// constructing the initial identity map, never from an NPF handler
/// (spec.md 7: allocation failure here surfaces upward as a load error).
pub struct FreshAllocator<'a> {
    pub allocate_page: &'a dyn Fn() -> Option<*mut u8>,
}

impl<'a> TableSource for FreshAllocator<'a> {
    fn new_table(&mut self) -> Result<NptTable> {
        let raw = (self.allocate_page)().ok_or(HypervisorError::NptAllocationFailed)?;
        // SAFETY: `raw` is a freshly allocated, exclusively-owned 4 KiB
        // page from the host allocator; `NptPage` is `repr(C, align(4096))`
        // with no invalid bit patterns (all-zero is a valid `NptEntry`).
        let page = unsafe { Box::from_raw(raw as *mut NptPage) };
        Ok(NptTable::new(page))
    }
}

/// Per-processor pre-allocated pool of zeroed 4 KiB pages consumed while
/// handling an NPF (spec.md 3 `PreAllocPool`, §9 "Pool sizing"). Sized
/// empirically for the worst-case MMIO fault burst observed during boot;
/// exhaustion is fatal rather than recoverable, because there is no safe
/// way to suspend the faulting guest instruction.
pub const PRE_ALLOC_POOL_CAPACITY: usize = 50;

pub struct PreAllocPool {
    pages: [Option<Box<NptPage>>; PRE_ALLOC_POOL_CAPACITY],
    used: AtomicUsize,
}

impl PreAllocPool {
    pub fn new(allocate_page: &dyn Fn() -> Option<*mut u8>) -> Result<Self> {
        let mut pages: [Option<Box<NptPage>>; PRE_ALLOC_POOL_CAPACITY] =
            core::array::from_fn(|_| None);
        for slot in pages.iter_mut() {
            let raw = allocate_page().ok_or(HypervisorError::NptAllocationFailed)?;
            // SAFETY: see `FreshAllocator::new_table`.
            *slot = Some(unsafe { Box::from_raw(raw as *mut NptPage) });
        }
        Ok(Self {
            pages,
            used: AtomicUsize::new(0),
        })
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        PRE_ALLOC_POOL_CAPACITY
    }

    fn take(&mut self) -> Result<Box<NptPage>> {
        let idx = self.used.load(Ordering::Relaxed);
        if idx >= PRE_ALLOC_POOL_CAPACITY {
            return Err(HypervisorError::PreAllocPoolExhausted);
        }
        let page = self.pages[idx]
            .take()
            .ok_or(HypervisorError::InvariantViolation)?;
        self.used.store(idx + 1, Ordering::Relaxed);
        Ok(page)
    }
}

impl TableSource for PreAllocPool {
    fn new_table(&mut self) -> Result<NptTable> {
        Ok(NptTable::new(self.take()?))
    }
}

/// Translates the host virtual address of an NPT node into the physical
/// address the hardware walker sees (`Host::virt_to_phys`). Boxed rather
/// than a bare fn pointer so a per-processor `NptRoot` can close over its
/// `&'static dyn Host` without the hierarchy manager itself depending on
/// the `Host` trait.
pub type TranslateFn = Box<dyn Fn(*const u8) -> PhysicalAddress>;

/// Per-processor NPT root: the owning PML4 plus the upper bound on PDPT
/// entries that `bulk_toggle` must visit (spec.md 3 `NptRoot`).
pub struct NptRoot {
    pml4: NptTable,
    pub max_pdpt_index: usize,
    translate: TranslateFn,
}

impl NptRoot {
    pub fn new(translate: TranslateFn, pml4_page: Box<NptPage>) -> Self {
        Self {
            pml4: NptTable::new(pml4_page),
            max_pdpt_index: 0,
            translate,
        }
    }

    fn table_pa(&self, table: &NptTable) -> PhysicalAddress {
        (self.translate)(table.page.as_ref() as *const NptPage as *const u8)
    }

    /// The physical address to program into VMCB.NCr3.
    pub fn ncr3(&self) -> u64 {
        self.table_pa(&self.pml4).as_u64()
    }

    /// Walk the hierarchy without materializing anything. Returns `None`
    /// if any interior entry along the walk is invalid.
    pub fn find(&mut self, pa: PhysicalAddress) -> Option<&mut NptEntry> {
        let raw = pa.align_down_to_base_page().as_u64();
        let mut table = &mut self.pml4;
        for level in 0..3 {
            let idx = index_at(level, raw);
            if !table.page.entries[idx].is_valid() {
                return None;
            }
            table = table.children[idx].as_mut()?.as_mut();
        }
        let idx = index_at(3, raw);
        if !table.page.entries[idx].is_valid() {
            return None;
        }
        Some(&mut table.page.entries[idx])
    }

    /// Walk the hierarchy, materializing any missing interior table from
    /// `source` along the way. The leaf, if newly created, is mapped
    /// identity (`pfn = pa >> 12`) and executable.
    pub fn build(&mut self, pa: PhysicalAddress, source: &mut dyn TableSource) -> Result<&mut NptEntry> {
        let raw = pa.align_down_to_base_page().as_u64();
        let translate = &self.translate;
        let mut table = &mut self.pml4;
        for level in 0..3 {
            let idx = index_at(level, raw);
            if !table.page.entries[idx].is_valid() {
                let child = source.new_table()?;
                let child_pa = translate(child.page.as_ref() as *const NptPage as *const u8);
                table.page.entries[idx].set(child_pa.pfn(), false);
                table.children[idx] = Some(Box::new(child));
            }
            table = table.children[idx]
                .as_mut()
                .ok_or(HypervisorError::InvariantViolation)?
                .as_mut();
        }
        let idx = index_at(3, raw);
        if !table.page.entries[idx].is_valid() {
            table.page.entries[idx].set(raw >> 12, false);
        }
        Ok(&mut table.page.entries[idx])
    }

    /// Locate the PT leaf for `pa` and set its `no-execute` bit. When
    /// `nx == false` and a covering PDPT or PD entry currently carries
    /// `nx = 1`, that interior entry is cleared and every one of its
    /// immediate children is forced to `nx = 1` first — effective execute
    /// permission is the AND of `!nx` across the walk, so clearing only
    /// the leaf (or only a parent) while a sibling still inherits the old
    /// permission would make the wrong range executable (spec.md 4.B).
    pub fn set_leaf_nx(&mut self, pa: PhysicalAddress, nx: bool) -> Result<()> {
        let raw = pa.align_down_to_base_page().as_u64();

        if nx {
            let entry = self.find(pa).ok_or(HypervisorError::InvariantViolation)?;
            entry.set_nx(true);
            return Ok(());
        }

        let idx0 = index_at(0, raw);
        if !self.pml4.page.entries[idx0].is_valid() {
            return Err(HypervisorError::InvariantViolation);
        }
        let pdpt = self.pml4.children[idx0]
            .as_mut()
            .ok_or(HypervisorError::InvariantViolation)?;

        let idx1 = index_at(1, raw);
        if !pdpt.page.entries[idx1].is_valid() {
            return Err(HypervisorError::InvariantViolation);
        }
        if pdpt.page.entries[idx1].is_nx() {
            pdpt.page.entries[idx1].set_nx(false);
            if let Some(pd) = pdpt.children[idx1].as_mut() {
                for e in pd.page.entries.iter_mut() {
                    e.set_nx(true);
                }
            }
        }
        let pd = pdpt.children[idx1]
            .as_mut()
            .ok_or(HypervisorError::InvariantViolation)?;

        let idx2 = index_at(2, raw);
        if !pd.page.entries[idx2].is_valid() {
            return Err(HypervisorError::InvariantViolation);
        }
        if pd.page.entries[idx2].is_nx() {
            pd.page.entries[idx2].set_nx(false);
            if let Some(pt) = pd.children[idx2].as_mut() {
                for e in pt.page.entries.iter_mut() {
                    e.set_nx(true);
                }
            }
        }
        let pt = pd.children[idx2]
            .as_mut()
            .ok_or(HypervisorError::InvariantViolation)?;

        let idx3 = index_at(3, raw);
        if !pt.page.entries[idx3].is_valid() {
            return Err(HypervisorError::InvariantViolation);
        }
        pt.page.entries[idx3].set_nx(false);
        Ok(())
    }

    /// Set `no-execute = nx` on every populated PDPT entry up to
    /// `max_pdpt_index`. When un-hiding (`nx == false`), additionally
    /// clears `nx` on every entry of the PD and PT covering `active_pa`,
    /// since those sub-tables may still carry sibling-mask bits left over
    /// from a prior `set_leaf_nx` call (spec.md 4.D, transition 2→1 step 1).
    pub fn bulk_toggle(&mut self, nx: bool, active_pa: Option<PhysicalAddress>) -> Result<()> {
        let pdpt = match self.pml4.children[0].as_mut() {
            Some(pdpt) => pdpt,
            None => return Ok(()),
        };
        for entry in pdpt.page.entries.iter_mut().take(self.max_pdpt_index) {
            if entry.is_valid() {
                entry.set_nx(nx);
            }
        }

        if !nx {
            if let Some(active_pa) = active_pa {
                let raw = active_pa.align_down_to_base_page().as_u64();
                let idx1 = index_at(1, raw);
                if let Some(pd) = pdpt.children.get_mut(idx1).and_then(|c| c.as_mut()) {
                    for e in pd.page.entries.iter_mut() {
                        e.set_nx(false);
                    }
                    let idx2 = index_at(2, raw);
                    if let Some(pt) = pd.children.get_mut(idx2).and_then(|c| c.as_mut()) {
                        for e in pt.page.entries.iter_mut() {
                            e.set_nx(false);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Identity-maps every page in `runs` plus the page containing
    /// `apic_base`, and derives `max_pdpt_index` from the highest RAM byte
    /// (spec.md 4.B init sequence). MMIO holes are deliberately left
    /// unmapped — the engine lazily materializes them on NPF.
    pub fn build_identity_map(
        &mut self,
        runs: &[crate::host::PhysicalMemoryRun],
        apic_base: PhysicalAddress,
        source: &mut dyn TableSource,
    ) -> Result<()> {
        let mut highest_byte = 0u64;
        for run in runs {
            for pa in run.pages() {
                self.build(pa, source)?;
            }
            let end = run.end_pa().as_u64();
            if end > highest_byte {
                highest_byte = end;
            }
        }
        self.build(apic_base.align_down_to_base_page(), source)?;

        const ONE_GIB: u64 = 1 << 30;
        self.max_pdpt_index = ((highest_byte + ONE_GIB - 1) / ONE_GIB) as usize;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::PhysicalMemoryRun;

    fn identity_translate(p: *const u8) -> PhysicalAddress {
        PhysicalAddress::new(p as u64)
    }

    fn new_root() -> NptRoot {
        NptRoot::new(Box::new(identity_translate), Box::new(NptPage::zeroed()))
    }

    fn fresh<'a>(alloc: &'a dyn Fn() -> Option<*mut u8>) -> FreshAllocator<'a> {
        FreshAllocator { allocate_page: alloc }
    }

    fn page_allocator() -> impl Fn() -> Option<*mut u8> {
        || {
            let b = Box::new(NptPage::zeroed());
            Some(Box::into_raw(b) as *mut u8)
        }
    }

    #[test]
    fn build_then_find_round_trips() {
        let alloc = page_allocator();
        let mut root = new_root();
        let mut source = fresh(&alloc);
        let pa = PhysicalAddress::new(0x1234_5000);
        root.build(pa, &mut source).unwrap();
        let entry = root.find(pa).unwrap();
        assert!(entry.is_valid());
        assert_eq!(entry.pfn(), pa.pfn());
        assert!(!entry.is_nx());
    }

    #[test]
    fn find_before_build_is_none() {
        let mut root = new_root();
        assert!(root.find(PhysicalAddress::new(0xA000)).is_none());
    }

    #[test]
    fn set_leaf_nx_then_clear_restores_executable_without_exposing_siblings() {
        let alloc = page_allocator();
        let mut root = new_root();
        let mut source = fresh(&alloc);

        // Two pages inside the same 2MB region so they share a PD->PT path.
        let hook_pa = PhysicalAddress::new(0x0000_0000);
        let sibling_pa = PhysicalAddress::new(0x0000_1000);
        root.build(hook_pa, &mut source).unwrap();
        root.build(sibling_pa, &mut source).unwrap();

        root.set_leaf_nx(hook_pa, true).unwrap();
        assert!(root.find(hook_pa).unwrap().is_nx());
        assert!(!root.find(sibling_pa).unwrap().is_nx());

        // Clearing NX on the hook leaf must not make the sibling executable
        // as a side effect of unmasking the parent.
        root.set_leaf_nx(hook_pa, false).unwrap();
        assert!(!root.find(hook_pa).unwrap().is_nx());
        assert!(root.find(sibling_pa).unwrap().is_nx());
    }

    #[test]
    fn bulk_toggle_nx_then_clear_round_trips_to_all_executable() {
        let alloc = page_allocator();
        let mut root = new_root();
        let mut source = fresh(&alloc);

        let runs = [PhysicalMemoryRun { base_page: 0, page_count: 4 }];
        root.build_identity_map(&runs, PhysicalAddress::new(0xFEE0_0000), &mut source)
            .unwrap();
        assert_eq!(root.max_pdpt_index, 1);

        for pa in runs[0].pages() {
            assert!(!root.find(pa).unwrap().is_nx());
        }

        root.bulk_toggle(true, None).unwrap();
        for pa in runs[0].pages() {
            assert!(root.find(pa).unwrap().is_nx());
        }

        root.bulk_toggle(false, None).unwrap();
        for pa in runs[0].pages() {
            assert!(!root.find(pa).unwrap().is_nx());
        }
    }

    #[test]
    fn pre_alloc_pool_exhaustion_is_reported() {
        let alloc = page_allocator();
        let mut pool = PreAllocPool::new(&alloc).unwrap();
        assert_eq!(pool.capacity(), PRE_ALLOC_POOL_CAPACITY);
        for _ in 0..PRE_ALLOC_POOL_CAPACITY {
            pool.take().unwrap();
        }
        assert_eq!(pool.used(), PRE_ALLOC_POOL_CAPACITY);
        assert!(matches!(pool.take(), Err(HypervisorError::PreAllocPoolExhausted)));
    }

    #[test]
    fn mmio_fault_consumes_at_most_four_pool_slots() {
        let alloc = page_allocator();
        let mut root = new_root();
        let mut pool = PreAllocPool::new(&alloc).unwrap();
        let before = pool.used();
        root.build(PhysicalAddress::new(0xE000_0000), &mut pool).unwrap();
        assert!(pool.used() - before <= 4);
    }
}

//! Per-processor hook state machine (spec.md 4.D) — the core of the
//! core. Drives NPT permission/backing-page mutations in response to NPF
//! and #BP exits so that at most one physical page is ever simultaneously
//! executable-with-hook.
//!
//! Grounded on the two-branch shape of `not-matthias-amd_hypervisor`'s
//! `handle_nested_page_fault`/`handle_break_point_exception`, generalized
//! to the exact transition algorithm spec.md 4.D describes.

use crate::addresses::PhysicalAddress;
use crate::error::{HypervisorError, Result};
use crate::hooks::registry::{HookEntry, HookRegistry};
use crate::svm::npt::{NptRoot, PreAllocPool, TableSource};
use log::trace;

/// `Off`, `HookArmedInvisible`, `HookExecVisible` (spec.md 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookState {
    Off,
    HookArmedInvisible,
    HookExecVisible,
}

/// Per-processor owner of the NPT hierarchy and the active-hook pointer
/// (spec.md 3 `HookData`). `active_hook` is a non-owning reference into
/// the process-wide `HookRegistry`; its lifetime is bounded by that
/// registry, never by this struct.
pub struct HookData {
    pub npt: NptRoot,
    pub pool: PreAllocPool,
    pub state: HookState,
    active_hook: Option<usize>,
}

/// Outcome of feeding an NPF/#BP exit to the engine, consumed by
/// `svm::vmexit` to decide whether to advance guest RIP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookAction {
    /// Retry the faulting instruction without advancing RIP.
    RetryInstruction,
    /// Rewrite guest RIP to this address and resume.
    RedirectRip(u64),
    /// Re-inject the exit as-is (a legitimate guest breakpoint).
    Forward,
}

impl HookData {
    pub fn new(npt: NptRoot, pool: PreAllocPool) -> Self {
        Self {
            npt,
            pool,
            state: HookState::Off,
            active_hook: None,
        }
    }

    pub fn active_hook<'r>(&self, registry: &'r HookRegistry) -> Option<&'r HookEntry> {
        self.active_hook.map(|idx| &registry.entries()[idx])
    }

    fn invariant_holds(&self) -> bool {
        self.active_hook.is_some() == (self.state == HookState::HookExecVisible)
    }

    /// CPUID back-door `EnableHooks` (spec.md 4.D transition 1).
    /// Requires `state == Off`.
    pub fn enable_hooks(&mut self, registry: &HookRegistry) -> Result<()> {
        if self.state != HookState::Off {
            return Err(HypervisorError::InvariantViolation);
        }
        for entry in registry.entries() {
            self.npt.set_leaf_nx(entry.orig_page_pa, true)?;
        }
        self.state = HookState::HookArmedInvisible;
        trace!("hook engine: Off -> HookArmedInvisible");
        debug_assert!(self.invariant_holds());
        Ok(())
    }

    /// CPUID back-door `DisableHooks`. Pathological (and asserted
    /// against) while `HookExecVisible`, per spec.md 4.D.
    pub fn disable_hooks(&mut self, registry: &HookRegistry) -> Result<()> {
        match self.state {
            HookState::HookArmedInvisible => {
                for entry in registry.entries() {
                    self.npt.set_leaf_nx(entry.orig_page_pa, false)?;
                }
                self.state = HookState::Off;
                trace!("hook engine: HookArmedInvisible -> Off");
                Ok(())
            }
            HookState::HookExecVisible => Err(HypervisorError::InvariantViolation),
            HookState::Off => Ok(()),
        }
    }

    /// `1 -> 2`: bulk-NX the whole address space, then make `entry`'s
    /// page executable-with-exec-backing and mark it active. Bulk-NX
    /// leaves the PDPT (and possibly PD) entry covering `entry`'s page at
    /// `nx=1`; repointing the leaf's PFN alone does not make it
    /// executable, since effective permission is the AND of `!nx` across
    /// the walk (spec.md 4.B/8) — `set_leaf_nx(.., false)` runs the same
    /// sibling-mask un-hide `2 -> 1` uses to clear that parent bit without
    /// exposing the rest of the 1 GiB/2 MiB range it covers.
    fn transition_1_to_2(&mut self, registry: &HookRegistry, entry_index: usize) -> Result<()> {
        let entry = &registry.entries()[entry_index];
        self.npt.bulk_toggle(true, None)?;
        let pfn = entry.exec_page_pa.pfn();
        let leaf = self
            .npt
            .build(entry.orig_page_pa, &mut self.pool)?;
        leaf.set(pfn, false);
        self.npt.set_leaf_nx(entry.orig_page_pa, false)?;
        self.active_hook = Some(entry_index);
        self.state = HookState::HookExecVisible;
        trace!("hook engine: HookArmedInvisible -> HookExecVisible ({})", entry.name);
        debug_assert!(self.invariant_holds());
        Ok(())
    }

    /// `2 -> 1`: restore the outgoing `active_hook` to original backing,
    /// make the whole address space executable, then re-arm every
    /// registered hook leaf NX (spec.md 4.D transition detail: bulk
    /// restore first so the subsequent per-leaf NX is a simple toggle).
    fn transition_2_to_1(&mut self, registry: &HookRegistry) -> Result<()> {
        let active_index = self.active_hook.ok_or(HypervisorError::InvariantViolation)?;
        let active = registry.entries()[active_index];

        self.npt.bulk_toggle(false, Some(active.orig_page_pa))?;
        for entry in registry.entries() {
            self.npt.set_leaf_nx(entry.orig_page_pa, true)?;
        }
        let leaf = self
            .npt
            .find(active.orig_page_pa)
            .ok_or(HypervisorError::InvariantViolation)?;
        leaf.set(active.orig_page_pa.pfn(), true);

        self.active_hook = None;
        self.state = HookState::HookArmedInvisible;
        trace!("hook engine: HookExecVisible -> HookArmedInvisible ({})", active.name);
        debug_assert!(self.invariant_holds());
        Ok(())
    }

    /// Handles one NPF exit (spec.md 4.D #2). `fault_pa` is the faulting
    /// guest physical address; `present` is `ExitInfo1.Valid`.
    pub fn handle_nested_page_fault(
        &mut self,
        registry: &HookRegistry,
        fault_pa: PhysicalAddress,
        present: bool,
    ) -> Result<HookAction> {
        if !present {
            // MMIO hole: materialize a 1:1 identity leaf, NX=0.
            self.npt.build(fault_pa, &mut self.pool)?;
            trace!("hook engine: materialized MMIO leaf at {:#x}", fault_pa.as_u64());
            return Ok(HookAction::RetryInstruction);
        }

        let fp = fault_pa.align_down_to_base_page();
        let hit = registry.entries().iter().position(|e| e.orig_page_pa == fp);

        match (self.state, hit) {
            (HookState::HookArmedInvisible, Some(idx)) if self.active_hook.is_none() => {
                self.transition_1_to_2(registry, idx)?;
                Ok(HookAction::RetryInstruction)
            }
            (HookState::HookExecVisible, Some(idx)) => {
                // Exec-jump from one hook page straight into another.
                self.transition_2_to_1(registry)?;
                self.transition_1_to_2(registry, idx)?;
                Ok(HookAction::RetryInstruction)
            }
            (HookState::HookExecVisible, None) => {
                // Exec from inside the active hook page, jumping out.
                self.transition_2_to_1(registry)?;
                Ok(HookAction::RetryInstruction)
            }
            _ => Err(HypervisorError::InvariantViolation),
        }
    }

    /// Handles one #BP exit (spec.md 4.D #3). Returns the redirect target
    /// on a hit, or `Forward` for a legitimate guest breakpoint.
    pub fn handle_breakpoint(&self, registry: &HookRegistry, guest_rip: u64) -> HookAction {
        match registry.find_by_hook_va(guest_rip) {
            Some(entry) => HookAction::RedirectRip(entry.handler),
            None => HookAction::Forward,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::registry::{HookDescriptor, HookRegistry};
    use crate::host::{Host, PhysicalMemoryRun, PinnedPage};
    use crate::svm::npt::{FreshAllocator, NptPage};
    use alloc::boxed::Box;
    use alloc::vec;
    use core::cell::RefCell;

    fn identity_translate(p: *const u8) -> PhysicalAddress {
        PhysicalAddress::new(p as u64)
    }

    struct FakeHost {
        icache_flushes: RefCell<u32>,
    }

    impl Host for FakeHost {
        fn physical_memory_runs(&self) -> &[PhysicalMemoryRun] {
            &[]
        }
        fn resolve_kernel_symbol(&self, name: &'static str) -> Option<u64> {
            match name {
                "HookA" => Some(0x0000_0000_0000_0010),
                "HookB" => Some(0x0000_0000_0020_1000),
                _ => None,
            }
        }
        fn pin_and_map_virtual(&self, page_va: u64) -> Option<PinnedPage> {
            Some(PinnedPage {
                physical_address: PhysicalAddress::new(page_va),
                pin_token: page_va,
            })
        }
        fn unpin(&self, _pin_token: u64) {}
        fn read_page(&self, _page_va: u64) -> [u8; 4096] {
            [0u8; 4096]
        }
        fn virt_to_phys(&self, va: *const u8) -> PhysicalAddress {
            PhysicalAddress::new(va as u64)
        }
        fn allocate_page(&self) -> Option<*mut u8> {
            let b = Box::new(NptPage::zeroed());
            Some(Box::into_raw(b) as *mut u8)
        }
        fn allocate_executable(&self, _len: usize) -> Option<*mut u8> {
            let b = Box::new([0u8; 4096]);
            Some(Box::into_raw(b) as *mut u8)
        }
        fn free(&self, _ptr: *mut u8, _len: usize) {}
        fn invalidate_all_instruction_caches(&self) {
            *self.icache_flushes.borrow_mut() += 1;
        }
        fn for_each_logical_processor(&self, f: &mut dyn FnMut(usize)) {
            f(0);
        }
        fn cpuid(&self, _eax: u32, _ecx: u32) -> crate::host::CpuidResult {
            crate::host::CpuidResult::default()
        }
        fn read_msr(&self, _msr: u32) -> u64 {
            0
        }
        fn write_msr(&self, _msr: u32, _value: u64) {}
    }

    /// Builds a `HookData` + a two-entry registry directly (bypassing
    /// `HookRegistry::build`'s guest-memory reads, which need a real
    /// address space) to exercise the transition algorithm in isolation.
    fn harness() -> (HookData, HookRegistry, FakeHost) {
        let host = FakeHost {
            icache_flushes: RefCell::new(0),
        };

        let entries = vec![
            HookEntry {
                name: "HookA",
                hook_va: 0x1000_0010,
                handler: 0xFFFF_1111,
                original_call: 0xFFFF_2222,
                orig_page_pa: PhysicalAddress::new(0x1000_0000),
                exec_page_pa: PhysicalAddress::new(0x2000_0000),
            },
            HookEntry {
                name: "HookB",
                hook_va: 0x3000_0010,
                handler: 0xFFFF_3333,
                original_call: 0xFFFF_4444,
                orig_page_pa: PhysicalAddress::new(0x3000_0000),
                exec_page_pa: PhysicalAddress::new(0x4000_0000),
            },
        ];
        let registry = HookRegistry::from_parts_for_test(entries, alloc::vec::Vec::new());
        let mut npt = NptRoot::new(Box::new(identity_translate), Box::new(NptPage::zeroed()));
        // Production always derives this from `build_identity_map` (RAM is
        // never 0 bytes), so `max_pdpt_index == 0` here would make
        // `bulk_toggle` a no-op and hide bugs in the 1<->2 sibling-mask
        // logic that only show up once a real PDPT entry gets toggled.
        // `2` covers every physical address this harness's tests use,
        // including the non-hook page up in the second 1 GiB range.
        npt.max_pdpt_index = 2;
        (
            HookData::new(
                npt,
                PreAllocPool::new(&|| {
                    let b = Box::new(NptPage::zeroed());
                    Some(Box::into_raw(b) as *mut u8)
                })
                .unwrap(),
            ),
            registry,
            host,
        )
    }

    #[test]
    fn enable_then_execute_then_bp_redirects() {
        let (mut data, registry, _host) = harness();
        let mut source = FreshAllocator {
            allocate_page: &(|| {
                let b = Box::new(NptPage::zeroed());
                Some(Box::into_raw(b) as *mut u8)
            }),
        };
        for entry in registry.entries() {
            data.npt.build(entry.orig_page_pa, &mut source).unwrap();
        }

        data.enable_hooks(&registry).unwrap();
        assert_eq!(data.state, HookState::HookArmedInvisible);
        assert!(data.npt.find(registry.entries()[0].orig_page_pa).unwrap().is_nx());

        let action = data
            .handle_nested_page_fault(&registry, registry.entries()[0].orig_page_pa, true)
            .unwrap();
        assert_eq!(action, HookAction::RetryInstruction);
        assert_eq!(data.state, HookState::HookExecVisible);
        assert_eq!(
            data.active_hook(&registry).unwrap().name,
            "HookA"
        );
        let leaf = data.npt.find(registry.entries()[0].orig_page_pa).unwrap();
        assert!(!leaf.is_nx());
        assert_eq!(leaf.pfn(), registry.entries()[0].exec_page_pa.pfn());

        let action = data.handle_breakpoint(&registry, 0x1000_0010);
        assert_eq!(action, HookAction::RedirectRip(0xFFFF_1111));
    }

    #[test]
    fn exit_hook_page_restores_original_backing() {
        let (mut data, registry, _host) = harness();
        let mut source = FreshAllocator {
            allocate_page: &(|| {
                let b = Box::new(NptPage::zeroed());
                Some(Box::into_raw(b) as *mut u8)
            }),
        };
        for entry in registry.entries() {
            data.npt.build(entry.orig_page_pa, &mut source).unwrap();
        }
        // A non-hook page the exec handler jumps out into.
        let other = PhysicalAddress::new(0x5000_0000);
        data.npt.build(other, &mut source).unwrap();

        data.enable_hooks(&registry).unwrap();
        data.handle_nested_page_fault(&registry, registry.entries()[0].orig_page_pa, true)
            .unwrap();
        assert_eq!(data.state, HookState::HookExecVisible);

        let action = data.handle_nested_page_fault(&registry, other, true).unwrap();
        assert_eq!(action, HookAction::RetryInstruction);
        assert_eq!(data.state, HookState::HookArmedInvisible);
        assert!(data.active_hook(&registry).is_none());
        let leaf = data.npt.find(registry.entries()[0].orig_page_pa).unwrap();
        assert!(leaf.is_nx());
        assert_eq!(leaf.pfn(), registry.entries()[0].orig_page_pa.pfn());
        assert!(!data.npt.find(other).unwrap().is_nx());
    }

    #[test]
    fn disable_hooks_while_exec_visible_is_invariant_violation() {
        let (mut data, registry, _host) = harness();
        let mut source = FreshAllocator {
            allocate_page: &(|| {
                let b = Box::new(NptPage::zeroed());
                Some(Box::into_raw(b) as *mut u8)
            }),
        };
        for entry in registry.entries() {
            data.npt.build(entry.orig_page_pa, &mut source).unwrap();
        }
        data.enable_hooks(&registry).unwrap();
        data.handle_nested_page_fault(&registry, registry.entries()[0].orig_page_pa, true)
            .unwrap();
        assert!(matches!(
            data.disable_hooks(&registry),
            Err(HypervisorError::InvariantViolation)
        ));
    }

    #[test]
    fn mmio_fault_materializes_without_state_change() {
        let (mut data, registry, _host) = harness();
        let mmio_pa = PhysicalAddress::new(0xE000_0000);
        assert!(data.npt.find(mmio_pa).is_none());
        let action = data
            .handle_nested_page_fault(&registry, mmio_pa, false)
            .unwrap();
        assert_eq!(action, HookAction::RetryInstruction);
        assert_eq!(data.state, HookState::Off);
        assert!(data.npt.find(mmio_pa).is_some());
    }
}

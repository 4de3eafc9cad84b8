//! Load-time hook registry (spec.md 3, 4.C): resolves each descriptor to
//! a concrete `HookEntry`, builds its trampoline, and pins/duplicates the
//! backing page. Read-only once `CoreInit` returns.

use crate::addresses::PhysicalAddress;
use crate::error::{HypervisorError, Result};
use crate::host::Host;
use crate::hooks::trampoline::build_original_call_stub;
use alloc::vec::Vec;

/// One entry in the fixed, load-time hook set the embedding driver
/// supplies to `CoreInit` (SPEC_FULL.md 10.4). `handler` is the address
/// the state engine rewrites guest RIP to on a hit.
#[derive(Debug, Clone, Copy)]
pub struct HookDescriptor {
    pub name: &'static str,
    pub handler: u64,
}

/// An immutable, fully-resolved hook (spec.md 3). `hook_va` is not
/// page-aligned; `orig_page_pa`/`exec_page_pa` are the 4 KiB-aligned
/// backing pages for the page containing it.
#[derive(Debug, Clone, Copy)]
pub struct HookEntry {
    pub name: &'static str,
    pub hook_va: u64,
    pub handler: u64,
    pub original_call: u64,
    pub orig_page_pa: PhysicalAddress,
    pub exec_page_pa: PhysicalAddress,
}

/// One distinct hooked physical page (spec.md 3): the exec copy, the pin
/// on the original, and the original's virtual binding. Multiple
/// `HookEntry`s may point at the same `SharedPageResource` if their hook
/// sites land on the same 4 KiB page.
#[derive(Debug)]
pub struct SharedPageResource {
    pub page_va: u64,
    pub orig_page_pa: PhysicalAddress,
    pub exec_page_pa: PhysicalAddress,
    pin_token: u64,
}

/// The fixed, read-only set of hooks built by `CoreInit`.
pub struct HookRegistry {
    entries: Vec<HookEntry>,
    shared_pages: Vec<SharedPageResource>,
}

impl HookRegistry {
    pub fn entries(&self) -> &[HookEntry] {
        &self.entries
    }

    pub fn shared_pages(&self) -> &[SharedPageResource] {
        &self.shared_pages
    }

    /// Releases every pin held by this registry. Called once from
    /// `CoreCleanup` at unload.
    pub fn unpin_all(&self, host: &dyn Host) {
        for page in &self.shared_pages {
            host.unpin(page.pin_token);
        }
    }

    pub fn find_by_hook_va(&self, va: u64) -> Option<&HookEntry> {
        self.entries.iter().find(|e| e.hook_va == va)
    }

    pub fn find_by_orig_page(&self, pa: PhysicalAddress) -> Option<&HookEntry> {
        self.entries.iter().find(|e| e.orig_page_pa == pa)
    }

    fn page_offset(va: u64) -> usize {
        (va & 0xFFF) as usize
    }

    fn find_shared_page(shared_pages: &[SharedPageResource], page_base_va: u64) -> Option<usize> {
        shared_pages.iter().position(|p| p.page_va == page_base_va)
    }

    /// Resolves, pins, and builds a trampoline for every descriptor, in
    /// order. The driver-facing unload/teardown path is not provided
    /// here: the registry is permanently resident for the process
    /// lifetime once virtualized (spec.md 3, "destroyed at unload" is the
    /// host's concern, not the registry's, since it never persists
    /// state).
    pub fn build(host: &dyn Host, descriptors: &[HookDescriptor]) -> Result<Self> {
        let mut entries = Vec::with_capacity(descriptors.len());
        let mut shared_pages: Vec<SharedPageResource> = Vec::new();

        for descriptor in descriptors {
            let hook_va = host
                .resolve_kernel_symbol(descriptor.name)
                .ok_or(HypervisorError::UnresolvedSymbol(descriptor.name))?;
            let page_base_va = hook_va & !0xFFF;
            let page_offset = Self::page_offset(hook_va);

            let existing_index = Self::find_shared_page(&shared_pages, page_base_va);

            let (orig_page_pa, exec_page_pa) = if let Some(idx) = existing_index {
                (shared_pages[idx].orig_page_pa, shared_pages[idx].exec_page_pa)
            } else {
                let pinned = host
                    .pin_and_map_virtual(page_base_va)
                    .ok_or(HypervisorError::HookAllocationFailed)?;
                let orig_page_pa = pinned.physical_address;

                let exec_raw = host
                    .allocate_executable(4096)
                    .ok_or(HypervisorError::HookAllocationFailed)?;
                let page_bytes = host.read_page(page_base_va);
                // SAFETY: `exec_raw` is a fresh, exclusively-owned 4 KiB
                // executable allocation from the host.
                unsafe {
                    core::ptr::copy_nonoverlapping(page_bytes.as_ptr(), exec_raw, 4096);
                    *exec_raw.add(page_offset) = 0xCC;
                }
                let exec_page_pa = host.virt_to_phys(exec_raw as *const u8);

                shared_pages.push(SharedPageResource {
                    page_va: page_base_va,
                    orig_page_pa,
                    exec_page_pa,
                    pin_token: pinned.pin_token,
                });
                (orig_page_pa, exec_page_pa)
            };

            let page_buf = host.read_page(page_base_va);
            let allocate_executable = |len: usize| host.allocate_executable(len);
            let original_call = build_original_call_stub(
                hook_va,
                &page_buf,
                page_offset,
                &allocate_executable,
            )? as u64;

            entries.push(HookEntry {
                name: descriptor.name,
                hook_va,
                handler: descriptor.handler,
                original_call,
                orig_page_pa,
                exec_page_pa,
            });
        }

        host.invalidate_all_instruction_caches();

        Ok(Self {
            entries,
            shared_pages,
        })
    }

    /// Test-only constructor bypassing `build`'s guest-memory reads, for
    /// exercising the hook state engine against hand-built entries.
    #[cfg(test)]
    pub(crate) fn from_parts_for_test(
        entries: Vec<HookEntry>,
        shared_pages: Vec<SharedPageResource>,
    ) -> Self {
        Self {
            entries,
            shared_pages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{PhysicalMemoryRun, PinnedPage};
    use alloc::vec;
    use core::cell::RefCell;

    /// Minimal `Host` double backing everything off heap buffers so the
    /// registry's construction order can be exercised without real
    /// kernel symbols or page tables.
    struct FakeHost {
        pages: RefCell<Vec<(u64, alloc::boxed::Box<[u8; 4096]>)>>,
        exec_pages: RefCell<Vec<alloc::boxed::Box<[u8; 4096]>>>,
        next_pa: RefCell<u64>,
        icache_flushes: RefCell<u32>,
    }

    impl FakeHost {
        fn new() -> Self {
            Self {
                pages: RefCell::new(Vec::new()),
                exec_pages: RefCell::new(Vec::new()),
                next_pa: RefCell::new(0x1000),
                icache_flushes: RefCell::new(0),
            }
        }

        fn register_page(&self, va: u64, mut bytes: [u8; 4096]) {
            let _ = &mut bytes;
            self.pages.borrow_mut().push((va, alloc::boxed::Box::new(bytes)));
        }
    }

    impl Host for FakeHost {
        fn physical_memory_runs(&self) -> &[PhysicalMemoryRun] {
            &[]
        }

        fn resolve_kernel_symbol(&self, name: &'static str) -> Option<u64> {
            match name {
                "TargetFunction" => Some(0x1000_0010),
                _ => None,
            }
        }

        fn pin_and_map_virtual(&self, page_va: u64) -> Option<PinnedPage> {
            let mut next = self.next_pa.borrow_mut();
            let pa = *next;
            *next += 0x1000;
            let _ = page_va;
            Some(PinnedPage {
                physical_address: PhysicalAddress::new(pa),
                pin_token: pa,
            })
        }

        fn unpin(&self, _pin_token: u64) {}

        fn read_page(&self, page_va: u64) -> [u8; 4096] {
            self.pages
                .borrow()
                .iter()
                .find(|(va, _)| *va == page_va)
                .map(|(_, bytes)| **bytes)
                .unwrap_or([0u8; 4096])
        }

        fn virt_to_phys(&self, va: *const u8) -> PhysicalAddress {
            PhysicalAddress::new(va as u64)
        }

        fn allocate_page(&self) -> Option<*mut u8> {
            None
        }

        fn allocate_executable(&self, len: usize) -> Option<*mut u8> {
            assert!(len <= 4096);
            let page = alloc::boxed::Box::new([0u8; 4096]);
            let ptr = alloc::boxed::Box::into_raw(page) as *mut u8;
            // Leak intentionally: the fake keeps ownership by pointer
            // only for the duration of the test.
            self.exec_pages
                .borrow_mut()
                .push(unsafe { alloc::boxed::Box::from_raw(ptr as *mut [u8; 4096]) });
            Some(ptr)
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

    #[test]
    fn build_resolves_symbol_and_stamps_0xcc() {
        let host = FakeHost::new();
        let hook_va = 0x1000_0010u64;
        let mut page = [0u8; 4096];
        page[0x10] = 0x55; // push rbp
        host.register_page(hook_va & !0xFFF, page);

        let descriptors = vec![HookDescriptor {
            name: "TargetFunction",
            handler: 0xFFFF_F000_DEAD_BEEF,
        }];
        let registry = HookRegistry::build(&host, &descriptors).unwrap();

        assert_eq!(registry.entries().len(), 1);
        let entry = &registry.entries()[0];
        assert_eq!(entry.hook_va, hook_va);
        assert_ne!(entry.orig_page_pa, entry.exec_page_pa);
        assert_eq!(*host.icache_flushes.borrow(), 1);
    }

    #[test]
    fn unresolved_symbol_is_reported() {
        let host = FakeHost::new();
        let descriptors = vec![HookDescriptor {
            name: "DoesNotExist",
            handler: 0,
        }];
        let result = HookRegistry::build(&host, &descriptors);
        assert!(matches!(result, Err(HypervisorError::UnresolvedSymbol(_))));
    }
}

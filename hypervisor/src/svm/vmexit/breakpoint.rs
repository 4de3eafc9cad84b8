//! `#BP` VM-exit handling (spec.md 4.D #3, 4.E): the hit path that
//! actually redirects guest execution into a hook handler.
//!
//! Grounded on `not-matthias-amd_hypervisor`'s
//! `handle_break_point_exception` two-branch shape (hook site vs.
//! legitimate guest breakpoint), generalized to the `HookAction` the
//! state engine already computes.

use crate::hooks::registry::HookRegistry;
use crate::hooks::state::{HookAction, HookData};
use crate::svm::events::EventInjection;
use crate::svm::vmcb::{VmcbControlArea, VmcbSaveArea};

pub fn handle(
    hook_data: &HookData,
    registry: &HookRegistry,
    control: &mut VmcbControlArea,
    save: &mut VmcbSaveArea,
) {
    match hook_data.handle_breakpoint(registry, save.rip) {
        HookAction::RedirectRip(handler) => {
            save.rip = handler;
        }
        HookAction::Forward => {
            control.event_inj = EventInjection::breakpoint().raw();
            save.rip = control.nrip;
        }
        HookAction::RetryInstruction => unreachable!("handle_breakpoint never returns RetryInstruction"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addresses::PhysicalAddress;
    use crate::hooks::registry::HookEntry;
    use crate::svm::npt::{NptPage, NptRoot, PreAllocPool};
    use alloc::boxed::Box;
    use alloc::vec;
    use alloc::vec::Vec;

    fn blank_control() -> VmcbControlArea {
        unsafe { core::mem::zeroed() }
    }

    fn blank_save() -> VmcbSaveArea {
        unsafe { core::mem::zeroed() }
    }

    fn hook_data() -> HookData {
        let translate = Box::new(|p: *const u8| PhysicalAddress::new(p as u64));
        let root = NptRoot::new(translate, Box::new(NptPage::zeroed()));
        let alloc = || {
            let b = Box::new(NptPage::zeroed());
            Some(Box::into_raw(b) as *mut u8)
        };
        let pool = PreAllocPool::new(&alloc).unwrap();
        HookData::new(root, pool)
    }

    fn registry_with_one_hook() -> HookRegistry {
        let entries = vec![HookEntry {
            name: "HookA",
            hook_va: 0x1000_0010,
            handler: 0xFFFF_F000_DEAD_BEEF,
            original_call: 0,
            orig_page_pa: PhysicalAddress::new(0x1000),
            exec_page_pa: PhysicalAddress::new(0x2000),
        }];
        HookRegistry::from_parts_for_test(entries, Vec::new())
    }

    #[test]
    fn hit_redirects_rip_to_handler() {
        let data = hook_data();
        let registry = registry_with_one_hook();
        let mut control = blank_control();
        let mut save = blank_save();
        save.rip = 0x1000_0010;

        handle(&data, &registry, &mut control, &mut save);
        assert_eq!(save.rip, 0xFFFF_F000_DEAD_BEEF);
    }

    #[test]
    fn miss_forwards_as_legitimate_breakpoint() {
        let data = hook_data();
        let registry = registry_with_one_hook();
        let mut control = blank_control();
        control.nrip = 0x5000_0001;
        let mut save = blank_save();
        save.rip = 0x5000_0000;

        handle(&data, &registry, &mut control, &mut save);
        assert_ne!(control.event_inj, 0);
        assert_eq!(save.rip, 0x5000_0001);
    }
}

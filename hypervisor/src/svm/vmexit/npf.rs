//! Nested Page Fault VM-exit handling (spec.md 4.D #2, 4.E).
//!
//! Grounded on `not-matthias-amd_hypervisor`'s `handle_nested_page_fault`
//! (exit-info bit checks, delegation to the page-table manager). RIP is
//! never advanced here: every `HookAction` the state engine returns for
//! an NPF is `RetryInstruction` by construction (spec.md 4.D), since the
//! fault is always resolved by remapping rather than by emulating.

use crate::addresses::PhysicalAddress;
use crate::error::Result;
use crate::hooks::registry::HookRegistry;
use crate::hooks::state::{HookAction, HookData};
use crate::svm::vmcb::VmcbControlArea;

/// `EXITINFO1` bit 0: the faulting access was a violation of the NPT
/// entry's permissions (mapping present but e.g. not executable), as
/// opposed to a not-present walk (spec.md 4.B MMIO handling).
const EXIT_INFO1_PRESENT: u64 = 1 << 0;

pub fn handle(hook_data: &mut HookData, registry: &HookRegistry, control: &VmcbControlArea) -> Result<()> {
    let present = control.exit_info1 & EXIT_INFO1_PRESENT != 0;
    let fault_pa = PhysicalAddress::new(control.exit_info2);

    let action = hook_data.handle_nested_page_fault(registry, fault_pa, present)?;
    debug_assert_eq!(action, HookAction::RetryInstruction);
    Ok(())
}

//! Nested `VMRUN` rejection (spec.md 6): this engine does not support a
//! guest that itself attempts to virtualize, so every intercepted
//! `VMRUN` is rejected with a `#GP(0)` rather than ever being emulated.

use crate::svm::events::EventInjection;
use crate::svm::vmcb::VmcbControlArea;
use crate::svm::vmcb::VmcbSaveArea;
use log::warn;

pub fn handle(control: &mut VmcbControlArea, save: &VmcbSaveArea) {
    warn!("guest attempted nested VMRUN at {:#x}, injecting #GP", save.rip);
    control.event_inj = EventInjection::general_protection_fault().raw();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_vmrun_is_rejected() {
        let mut control: VmcbControlArea = unsafe { core::mem::zeroed() };
        let save: VmcbSaveArea = unsafe { core::mem::zeroed() };
        handle(&mut control, &save);
        assert_ne!(control.event_inj, 0);
    }
}

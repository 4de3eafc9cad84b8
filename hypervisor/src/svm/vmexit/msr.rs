//! `MSR` VM-exit handling (spec.md 4.E, 6 `WriteMsr`).
//!
//! The MSRPM built by `svm::vmcb::build_efer_only_msrpm` traps exactly one
//! MSR: a guest write to `IA32_EFER`. Reads are never intercepted, so this
//! handler only ever sees the write side. Grounded on the teacher's
//! `intel::vmexit::msr` (RDX:RAX reconstruction, #GP injection on an
//! invalid write) narrowed to the single MSR this engine cares about
//! protecting: a guest clearing `EFER.SVME` would hand control back to
//! bare metal without the CPU leaving guest mode, rather than an orderly
//! back-door `DisableHooks`/`Unload`. Under the `vmware` feature this
//! protection is relaxed the same way the teacher's does, since nested
//! SVM under VMware Workstation's own hypervisor does not always round-
//! trip an injected `#GP` the way bare metal does.

use crate::capture::GuestRegisters;
use crate::svm::events::EventInjection;
use crate::svm::vmcb::{VmcbControlArea, VmcbSaveArea, EFER_SVME_BIT};
use log::warn;

pub fn handle(control: &mut VmcbControlArea, save: &mut VmcbSaveArea, gpr: &GuestRegisters) {
    let value = (gpr.rdx << 32) | (gpr.rax & u32::MAX as u64);

    if !cfg!(feature = "vmware") && value & EFER_SVME_BIT == 0 {
        warn!("guest attempted to clear EFER.SVME, injecting #GP");
        control.event_inj = EventInjection::general_protection_fault().raw();
        return;
    }

    save.efer = value;
    save.rip = control.nrip;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank_control() -> VmcbControlArea {
        unsafe { core::mem::zeroed() }
    }

    fn blank_save() -> VmcbSaveArea {
        unsafe { core::mem::zeroed() }
    }

    #[test]
    fn clearing_svme_injects_gp_without_advancing_rip() {
        let mut control = blank_control();
        control.nrip = 0x1000;
        let mut save = blank_save();
        save.rip = 0x0FF0;
        let mut gpr = GuestRegisters::new();
        gpr.rax = 0; // SVME bit clear
        gpr.rdx = 0;

        handle(&mut control, &mut save, &gpr);

        assert_ne!(control.event_inj, 0);
        assert_eq!(save.rip, 0x0FF0);
    }

    #[test]
    fn preserving_svme_writes_through_and_advances_rip() {
        let mut control = blank_control();
        control.nrip = 0x2000;
        let mut save = blank_save();
        save.rip = 0x1FF0;
        let mut gpr = GuestRegisters::new();
        gpr.rax = EFER_SVME_BIT | 0x1;
        gpr.rdx = 0;

        handle(&mut control, &mut save, &gpr);

        assert_eq!(control.event_inj, 0);
        assert_eq!(save.efer, EFER_SVME_BIT | 0x1);
        assert_eq!(save.rip, 0x2000);
    }
}

//! VM-exit dispatcher (spec.md 4.E, 6 `OnVmExit`).
//!
//! Grounded on the teacher's `intel::vmexit`'s overall match-and-delegate
//! shape (see `msr.rs`'s `handle_msr_access`), generalized from VMX's
//! `VM_EXIT_INSTRUCTION_LEN`-based RIP advance to SVM's `NRip` field:
//! every handler here advances `save.rip` by copying `control.nrip`
//! rather than adding a decoded instruction length.

pub mod breakpoint;
pub mod cpuid;
pub mod msr;
pub mod npf;
pub mod vmrun;

use crate::capture::GuestRegisters;
use crate::error::{HypervisorError, Result};
use crate::host::Host;
use crate::hooks::registry::HookRegistry;
use crate::hooks::state::HookData;
use crate::svm::vmcb::{VmcbControlArea, VmcbSaveArea};
use log::error;

/// AMD SVM `VMCB.ExitCode` values this dispatcher recognizes (spec.md 6).
pub mod exit_code {
    pub const CPUID: u64 = 0x72;
    pub const MSR: u64 = 0x7C;
    pub const VMRUN: u64 = 0x80;
    pub const BREAKPOINT: u64 = 0x43;
    pub const NPF: u64 = 0x400;
}

/// What the driver's host-side VMRUN loop does after `on_vm_exit` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitAction {
    /// Reload the VMCB from `control`/`save` and execute `VMRUN` again.
    Continue,
    /// Devirtualize this processor: restore the guest to running on bare
    /// metal at `rip`/`rsp`, per spec.md 4.E's `DisableHooks`-then-unload
    /// back-door path.
    Terminate(Unload),
}

/// The state the host needs to resume guest execution without VMRUN
/// (spec.md 3 "destroyed at unload").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unload {
    pub guest_rip: u64,
    pub guest_rsp: u64,
    /// The per-processor data pointer handed back to the guest in
    /// RDX:RAX (spec.md 6), so the caller that issued the back-door CPUID
    /// can free this processor's `PerCpu` once SVM is off.
    pub per_cpu_data_ptr: u64,
}

/// Routes one VM-exit to its handler. `gpr` is the shuttle populated by
/// the host's exit stub (spec.md 4.G); RAX is refreshed from the VMCB
/// save area first since the processor, not the stub, owns it across
/// `VMRUN` (see `capture` module doc comment).
pub fn on_vm_exit(
    host: &dyn Host,
    hook_data: &mut HookData,
    registry: &HookRegistry,
    control: &mut VmcbControlArea,
    save: &mut VmcbSaveArea,
    gpr: &mut GuestRegisters,
    per_cpu_data_ptr: u64,
) -> Result<ExitAction> {
    gpr.rax = save.rax;

    let action = match control.exit_code {
        exit_code::CPUID => {
            cpuid::handle(host, hook_data, registry, control, save, gpr, per_cpu_data_ptr)?
        }
        exit_code::MSR => {
            msr::handle(control, save, gpr);
            ExitAction::Continue
        }
        exit_code::VMRUN => {
            vmrun::handle(control, save);
            ExitAction::Continue
        }
        exit_code::BREAKPOINT => {
            breakpoint::handle(hook_data, registry, control, save);
            ExitAction::Continue
        }
        exit_code::NPF => {
            npf::handle(hook_data, registry, control)?;
            ExitAction::Continue
        }
        other => {
            error!("unhandled VM-exit code {:#x}", other);
            return Err(HypervisorError::UnhandledExitCode(other));
        }
    };

    save.rax = gpr.rax;
    Ok(action)
}

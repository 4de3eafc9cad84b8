//! Stealth-hooking AMD-V/NPT hypervisor core (spec.md 1).
//!
//! This crate is the CORE described by spec.md: the NPT hierarchy manager
//! (`svm::npt`), the hook registry and trampoline builder (`hooks`), the
//! per-processor hook state machine (`hooks::state`), and the VM-exit
//! dispatcher (`svm::vmexit`). It never bootstraps itself into a running
//! kernel, never captures a VMCB save-state, and never executes `VMRUN` —
//! those are the embedding `driver` crate's job, reached only through
//! `host::Host` (spec.md 1 "out of scope", spec.md 6).
//!
//! `#![no_std]` with `alloc`: the core runs in ring 0 with no OS beneath
//! it, but still needs `Box`/`Vec` for the NPT hierarchy and the hook
//! registry, exactly as the teacher's `hypervisor` crate does.
#![no_std]

extern crate alloc;

pub mod addresses;
pub mod capture;
pub mod error;
pub mod host;
pub mod hooks;
pub mod svm;

use crate::hooks::registry::{HookDescriptor, HookRegistry};
use crate::hooks::state::HookData;
use crate::svm::vm::PerCpu;
use crate::svm::vmcb::{VmcbControlArea, VmcbSaveArea};
use error::Result;

/// `CoreInit` (spec.md 6): resolves every hook descriptor, builds its
/// trampoline, and pins/duplicates its backing page. Called once, before
/// any processor is virtualized; the returned registry is read-only and
/// shared read-only across every logical processor thereafter (spec.md 5
/// "Shared-resource policy").
pub fn core_init(host: &dyn host::Host, hooks: &[HookDescriptor]) -> Result<HookRegistry> {
    HookRegistry::build(host, hooks)
}

/// `PerCpuInit` (spec.md 6): builds this processor's private NPT identity
/// map and `PreAllocPool`. Must be called once per logical processor,
/// from the processor it will run on — `PerCpu`/`HookData` are `!Sync`
/// and own no lock, since spec.md 5 guarantees no other processor ever
/// touches them.
pub fn per_cpu_init(host: &'static dyn host::Host) -> Result<PerCpu> {
    PerCpu::init(host)
}

/// `ConfigureVmcb` (spec.md 6): programs the interception bits, `NCr3`,
/// `GuestAsid`, and `MsrpmBasePa` this engine requires into a VMCB the
/// host has otherwise already prepared (segment/control-register
/// save-state capture is the host's concern, per spec.md 1).
pub fn configure_vmcb(host: &dyn host::Host, per_cpu: &PerCpu, control: &mut VmcbControlArea) {
    per_cpu.configure_vmcb(host, control)
}

/// `OnVmExit` (spec.md 6): the single VM-exit entry point. Returns what
/// the host's VMRUN loop should do next — resume the guest, or
/// devirtualize this processor (spec.md 4.E back-door unload path).
/// `per_cpu_data_ptr` is the address of `per_cpu` itself, as seen by the
/// host; it is handed back to the guest verbatim in RDX:RAX on the
/// back-door unload subleaf (spec.md 6) so the caller can free it once
/// SVM is off.
pub fn on_vm_exit(
    host: &dyn host::Host,
    per_cpu: &mut PerCpu,
    registry: &HookRegistry,
    control: &mut VmcbControlArea,
    save: &mut VmcbSaveArea,
    gpr: &mut capture::GuestRegisters,
    per_cpu_data_ptr: u64,
) -> Result<svm::vmexit::ExitAction> {
    svm::vmexit::on_vm_exit(
        host,
        &mut per_cpu.hook_data,
        registry,
        control,
        save,
        gpr,
        per_cpu_data_ptr,
    )
}

/// `PerCpuCleanup` (spec.md 6): releases this processor's NPT pages and
/// pre-allocation pool. Ordinary Rust ownership does all of the work —
/// every page `PerCpu`/`HookData` own was wrapped in a `Box` at
/// construction, so dropping `per_cpu` walks and frees the whole
/// hierarchy (spec.md 9 "Ownership of NPT pages"). This function exists
/// so the driver crate has a named call site matching spec.md 6 rather
/// than relying on an implicit scope-exit.
pub fn per_cpu_cleanup(per_cpu: PerCpu) {
    drop(per_cpu);
}

/// `CoreCleanup` (spec.md 6): releases every pin the registry holds on a
/// hooked kernel page. Called once at unload, after every processor has
/// been de-virtualized.
pub fn core_cleanup(host: &dyn host::Host, registry: HookRegistry) {
    registry.unpin_all(host);
    drop(registry);
}

/// Checks this processor supports SVM and nested paging before
/// `per_cpu_init` attempts to build anything (spec.md 7 `UnsupportedHost`).
pub fn check_host_support(host: &dyn host::Host) -> Result<()> {
    svm::vm::check_host_support(host)
}

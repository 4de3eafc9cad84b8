//! `CPUID` VM-exit handling: feature-bit virtualization and the
//! `EnableHooks`/`DisableHooks`/`Unload` back door (spec.md 4.E, 6
//! `Cpuid`).
//!
//! Grounded on the teacher's `intel::vmexit::msr::handle_msr_access`
//! shape (match on the request, forward to the host for anything it
//! doesn't itself own) and spec.md 4.E's exact leaf/subleaf protocol.

use super::ExitAction;
use crate::capture::GuestRegisters;
use crate::error::Result;
use crate::host::Host;
use crate::hooks::registry::HookRegistry;
use crate::hooks::state::HookData;
use crate::svm::vmcb::{VmcbControlArea, VmcbSaveArea};
use log::{debug, trace};

const LEAF_FEATURE_BITS: u32 = 0x0000_0001;
/// Hypervisor-present bit (ECX[31]) in `CPUID.01H`.
const HYPERVISOR_PRESENT_BIT: u32 = 1 << 31;

const LEAF_HYPERV_MAX_LEAF: u32 = 0x4000_0000;
const LEAF_HYPERV_INTERFACE: u32 = 0x4000_0001;

const LEAF_BACKDOOR: u32 = 0x4141_4141;
const SUBLEAF_UNLOAD: u32 = 0x4141_4141;
const SUBLEAF_ENABLE_HOOKS: u32 = 0x4141_4142;
const SUBLEAF_DISABLE_HOOKS: u32 = 0x4141_4143;

/// "MVSS" packed little-endian, returned in RCX on unload (spec.md 6).
const UNLOAD_MAGIC: u64 = 0x4D56_5353;

/// Guards the back door behind CPL 0 unless the caller has opted out for
/// test harnesses that never populate a real `SS` selector (spec.md 4.E;
/// SPEC_FULL.md 10.4).
fn backdoor_allowed(save: &VmcbSaveArea) -> bool {
    if cfg!(feature = "strict_dpl_check") {
        save.cpl() == 0
    } else {
        true
    }
}

pub fn handle(
    host: &dyn Host,
    hook_data: &mut HookData,
    registry: &HookRegistry,
    control: &mut VmcbControlArea,
    save: &mut VmcbSaveArea,
    gpr: &mut GuestRegisters,
    per_cpu_data_ptr: u64,
) -> Result<ExitAction> {
    let eax = gpr.rax as u32;
    let ecx = gpr.rcx as u32;
    let mut action = ExitAction::Continue;

    match eax {
        LEAF_FEATURE_BITS => {
            let mut result = host.cpuid(eax, ecx);
            result.ecx |= HYPERVISOR_PRESENT_BIT;
            write_result(gpr, result);
        }
        LEAF_HYPERV_MAX_LEAF => {
            // "SimpleSvm   " packed little-endian across EBX:ECX:EDX.
            write_result(
                gpr,
                crate::host::CpuidResult {
                    eax: LEAF_HYPERV_INTERFACE,
                    ebx: 0x706d_6953,
                    ecx: 0x7653_656c,
                    edx: 0x2020_206d,
                },
            );
        }
        LEAF_HYPERV_INTERFACE => {
            // Deliberately not "Hv#1": this is not a Hyper-V-compatible
            // interface and must not be probed as one.
            write_result(
                gpr,
                crate::host::CpuidResult {
                    eax: 0x5356_4821, // "!HVS"
                    ebx: 0,
                    ecx: 0,
                    edx: 0,
                },
            );
        }
        LEAF_BACKDOOR if backdoor_allowed(save) => {
            trace!("back-door CPUID subleaf {:#x}", ecx);
            match ecx {
                SUBLEAF_ENABLE_HOOKS => {
                    hook_data.enable_hooks(registry)?;
                    write_result(gpr, crate::host::CpuidResult::default());
                }
                SUBLEAF_DISABLE_HOOKS => {
                    hook_data.disable_hooks(registry)?;
                    write_result(gpr, crate::host::CpuidResult::default());
                }
                SUBLEAF_UNLOAD => {
                    debug!("back-door unload requested");
                    hook_data.disable_hooks(registry)?;
                    let continuation_rip = control.nrip;
                    // Full 64-bit outbound registers (spec.md 4.E item 4,
                    // 6): RDX:RAX carries the per-CPU data pointer so the
                    // caller can free it once SVM is off, RBX the
                    // continuation RIP, RCX the "MVSS" unload marker.
                    // `write_result`'s 32-bit `CpuidResult` fields can't
                    // carry these, so they are set directly here instead.
                    gpr.rax = per_cpu_data_ptr & 0xFFFF_FFFF;
                    gpr.rdx = per_cpu_data_ptr >> 32;
                    gpr.rbx = continuation_rip;
                    gpr.rcx = UNLOAD_MAGIC;
                    action = ExitAction::Terminate(super::Unload {
                        guest_rip: continuation_rip,
                        guest_rsp: save.rsp,
                        per_cpu_data_ptr,
                    });
                }
                _ => {
                    write_result(gpr, crate::host::CpuidResult::default());
                }
            }
        }
        _ => {
            let result = host.cpuid(eax, ecx);
            write_result(gpr, result);
        }
    }

    save.rip = control.nrip;
    Ok(action)
}

fn write_result(gpr: &mut GuestRegisters, result: crate::host::CpuidResult) {
    gpr.rax = result.eax as u64;
    gpr.rbx = result.ebx as u64;
    gpr.rcx = result.ecx as u64;
    gpr.rdx = result.edx as u64;
}

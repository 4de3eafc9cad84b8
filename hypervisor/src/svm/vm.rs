//! Per-processor virtualization state: host-support probing, the NPT
//! identity map construction, and the VMCB interception fields the engine
//! requires (spec.md 6 `PerCpuInit`/`ConfigureVmcb`).
//!
//! Grounded on the teacher's `intel::vm::Vm` (`init`'s staged setup:
//! region init, paging, EPT identity map, then `setup_vmcs`) restructured
//! around SVM/NPT: there is no VMXON/VMPTRLD/VMLAUNCH staging to mirror
//! since the guest is already running (spec.md 1, Type-2), so `PerCpu`
//! only ever builds the NPT side of what the teacher's `Vm::init` builds
//! for EPT, and `configure_vmcb` plays the role of `Vm::setup_vmcs`.

use crate::error::{HypervisorError, Result};
use crate::hooks::state::HookData;
use crate::host::Host;
use crate::svm::npt::{
    FreshAllocator, NptPage, NptRoot, PreAllocPool, PRE_ALLOC_POOL_CAPACITY,
};
use crate::svm::vmcb::{
    build_efer_only_msrpm, ExceptionIntercepts, InterceptMisc1, InterceptMisc2, VmcbControlArea,
};
use alloc::boxed::Box;
use log::trace;

/// `IA32_APIC_BASE`; its containing page is identity-mapped alongside RAM
/// at init (spec.md 4.B).
const MSR_APIC_BASE: u32 = 0x0000_001B;
const APIC_BASE_PFN_MASK: u64 = 0x0000_000F_FFFF_F000;

/// AMD `VM_CR`; bit 4 (`SVMDIS`) being set means SVM was disabled by
/// firmware and cannot be re-enabled until the next reset (spec.md 7
/// `UnsupportedHost`).
const MSR_VM_CR: u32 = 0xC001_0114;
const VM_CR_SVMDIS: u64 = 1 << 4;

/// `CPUID.80000001H:ECX.SVM[bit 2]`.
const CPUID_EXT_FEATURES: u32 = 0x8000_0001;
const ECX_SVM: u32 = 1 << 2;
/// `CPUID.8000000AH:EDX.NP[bit 0]`.
const CPUID_SVM_FEATURES: u32 = 0x8000_000A;
const EDX_NESTED_PAGING: u32 = 1 << 0;

/// Confirms the CPU supports SVM and nested paging, and that firmware
/// has not disabled SVM, before anything else in the core is built
/// (spec.md 7 `UnsupportedHost`). Called once per processor from
/// `per_cpu_init`.
pub fn check_host_support(host: &dyn Host) -> Result<()> {
    let ext_features = host.cpuid(CPUID_EXT_FEATURES, 0);
    if ext_features.ecx & ECX_SVM == 0 {
        return Err(HypervisorError::SvmUnsupported);
    }

    let svm_features = host.cpuid(CPUID_SVM_FEATURES, 0);
    if svm_features.edx & EDX_NESTED_PAGING == 0 {
        return Err(HypervisorError::NptUnsupported);
    }

    if host.read_msr(MSR_VM_CR) & VM_CR_SVMDIS != 0 {
        return Err(HypervisorError::SvmUnsupported);
    }

    Ok(())
}

/// Per-processor owner of everything `ConfigureVmcb` needs beyond the
/// hook engine itself: the MSR permission bitmap backing `MsrpmBasePa`.
/// `HookData` (NPT root, pre-alloc pool, hook state) is owned alongside
/// it rather than inside it, matching spec.md 3's `HookData` definition
/// exactly.
pub struct PerCpu {
    pub hook_data: HookData,
    msrpm: Box<[u8; 8192]>,
}

impl PerCpu {
    /// `PerCpuInit` (spec.md 6): builds this processor's NPT identity map
    /// — every RAM run from `Host::physical_memory_runs` plus the page
    /// containing the local APIC base — and its `PreAllocPool`.
    pub fn init(host: &'static dyn Host) -> Result<Self> {
        check_host_support(host)?;

        let pml4_raw = host.allocate_page().ok_or(HypervisorError::NptAllocationFailed)?;
        // SAFETY: `pml4_raw` is a fresh, exclusively-owned 4 KiB page from
        // the host allocator; `NptPage` has no invalid all-zero bit
        // pattern.
        let pml4_page = unsafe { Box::from_raw(pml4_raw as *mut NptPage) };
        let translate = Box::new(move |va: *const u8| host.virt_to_phys(va));
        let mut npt = NptRoot::new(translate, pml4_page);

        let allocate_page = move || host.allocate_page();
        let mut source = FreshAllocator {
            allocate_page: &allocate_page,
        };

        let apic_base = crate::addresses::PhysicalAddress::new(
            host.read_msr(MSR_APIC_BASE) & APIC_BASE_PFN_MASK,
        );
        npt.build_identity_map(host.physical_memory_runs(), apic_base, &mut source)?;

        let pool_allocate_page = move || host.allocate_page();
        let pool = PreAllocPool::new(&pool_allocate_page)?;
        trace!(
            "per-cpu NPT built: max_pdpt_index={}, pool capacity={}",
            npt.max_pdpt_index,
            PRE_ALLOC_POOL_CAPACITY
        );

        Ok(Self {
            hook_data: HookData::new(npt, pool),
            msrpm: build_efer_only_msrpm(),
        })
    }

    /// `ConfigureVmcb` (spec.md 6): sets the interception bits, `NCr3`,
    /// `GuestAsid`, and `MsrpmBasePa` this engine requires. Does not
    /// touch any field the exit dispatcher doesn't itself rely on — the
    /// rest of VMCB setup (segment/control-register save-state capture)
    /// is the driver's bootstrap concern (spec.md 1).
    pub fn configure_vmcb(&self, host: &dyn Host, control: &mut VmcbControlArea) {
        control.exception_intercepts |= ExceptionIntercepts::BP.bits();
        control.intercept_misc1 |= (InterceptMisc1::CPUID | InterceptMisc1::MSR_PROT).bits();
        control.intercept_misc2 |= InterceptMisc2::VMRUN.bits();
        control.np_enable |= 1;
        control.guest_asid = 1;
        control.ncr3 = self.hook_data.npt.ncr3();
        control.msrpm_base_pa = host.virt_to_phys(self.msrpm.as_ref() as *const _ as *const u8).as_u64();
    }
}

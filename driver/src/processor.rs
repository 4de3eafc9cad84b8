//! Per-processor virtualize/de-virtualize loop (SPEC_FULL.md 10.1
//! "driver crate"): SVM enablement, the `VMRUN` loop, and the
//! continuation path out of the back-door unload CPUID — all of the
//! machinery spec.md 1 calls out of scope for the core and leaves to
//! this external collaborator.
//!
//! Grounded on the teacher's `driver/src/processor.rs`
//! (`start_hypervisor_on_all_processors`/`start_hypervisor_on_ap`/
//! `start_hypervisor`: capture registers, check an already-virtualized
//! flag, virtualize if not) with UEFI's `MpServices` broadcast replaced
//! by `Host::for_each_logical_processor` and VMXON/VMPTRLD/VMLAUNCH
//! replaced by SVM's CLGI/VMLOAD/VMRUN/VMSAVE/STGI sequence.

use core::arch::asm;
use core::mem::size_of;

use hypervisor::capture::GuestRegisters;
use hypervisor::error::Result;
use hypervisor::hooks::registry::{HookDescriptor, HookRegistry};
use hypervisor::svm::vm::PerCpu;
use hypervisor::svm::vmcb::{VmcbControlArea, VmcbSaveArea, EFER_SVME_BIT, MSR_EFER};
use hypervisor::svm::vmexit::ExitAction;
use log::{debug, info, trace};

use crate::platform::PlatformHost;

/// AMD `VM_HSAVE_PA`: physical address of the page the processor spills
/// host state into on `VMRUN` and restores from on `#VMEXIT`.
const MSR_VM_HSAVE_PA: u32 = 0xC001_0117;

/// Continuation RIP for the final `jmp` in `devirtualize`, addressed
/// RIP-relative via `sym` so the jump target costs no GPR — every one of
/// the 16 general-purpose registers is needed to carry the guest's own
/// values at that point. Only one processor is ever mid-devirtualization
/// against this slot at a time: the back-door unload CPUID is issued on
/// each CPU in turn (spec.md 5), never broadcast concurrently.
static mut UNLOAD_CONTINUATION_RIP: u64 = 0;

/// One processor's virtualization state: its `PerCpu` (NPT + hook state,
/// owned exclusively by this processor per spec.md 5), its VMCB page, and
/// its host-save page. Never shared across processors.
pub struct VirtualizedProcessor {
    per_cpu: PerCpu,
    vmcb_va: *mut u8,
    vmcb_pa: u64,
    guest_registers: GuestRegisters,
}

/// Reads the control area out of a raw VMCB page. The hardware contract
/// is offset-based (control area at `+0x000`, state-save area at
/// `+0x400`), so this casts by offset rather than relying on a single
/// Rust struct spanning both — the two areas already exist as separate
/// types in `hypervisor::svm::vmcb` because the core only ever needs
/// `&mut` access to each independently.
unsafe fn control_area(vmcb_va: *mut u8) -> &'static mut VmcbControlArea {
    &mut *(vmcb_va as *mut VmcbControlArea)
}

unsafe fn save_area(vmcb_va: *mut u8) -> &'static mut VmcbSaveArea {
    &mut *(vmcb_va.add(0x400) as *mut VmcbSaveArea)
}

/// Builds the fixed, load-time hook registry (spec.md 3, `CoreInit`).
/// Called once, before any processor is virtualized; shared read-only
/// across every processor thereafter (spec.md 5).
pub fn build_registry(host: &PlatformHost, hooks: &[HookDescriptor]) -> Result<HookRegistry> {
    hypervisor::core_init(host, hooks)
}

/// Virtualizes the calling processor in place (spec.md 1, Type-2: the
/// guest OS is already running this code). Builds this processor's NPT
/// and pre-allocation pool, enables SVM, and enters the `VMRUN` loop.
/// Returns only once this processor has been de-virtualized via the
/// back-door unload CPUID.
pub fn virtualize_processor(host: &'static PlatformHost, registry: &HookRegistry) -> Result<()> {
    hypervisor::check_host_support(host)?;

    let per_cpu = hypervisor::per_cpu_init(host)?;

    let vmcb_va = host
        .allocate_page()
        .ok_or(hypervisor::error::HypervisorError::NptAllocationFailed)?;
    let vmcb_pa = host.virt_to_phys(vmcb_va as *const u8).as_u64();

    let hsave_va = host
        .allocate_page()
        .ok_or(hypervisor::error::HypervisorError::NptAllocationFailed)?;
    let hsave_pa = host.virt_to_phys(hsave_va as *const u8).as_u64();

    // SAFETY: `vmcb_va` is a fresh, zeroed, exclusively-owned 4 KiB page;
    // `control_area`/`save_area` view disjoint halves of it.
    let control = unsafe { control_area(vmcb_va) };
    hypervisor::configure_vmcb(host, &per_cpu, control);

    let mut processor = VirtualizedProcessor {
        per_cpu,
        vmcb_va,
        vmcb_pa,
        guest_registers: GuestRegisters::new(),
    };

    // SAFETY: capturing the current register/flag state to seed the
    // guest's initial VMCB save area is only valid from the processor
    // being virtualized, which is exactly the caller of this function.
    unsafe {
        capture_initial_guest_state(save_area(processor.vmcb_va));
    }

    enable_svm(host, hsave_pa);

    info!("processor virtualized, entering VMRUN loop");
    run_until_devirtualized(host, &mut processor, registry)
}

/// Sets `EFER.SVME` and programs `VM_HSAVE_PA` (spec.md 1 "SVM
/// enablement", an out-of-scope-for-the-core bootstrap step this crate
/// performs because it is the collaborator spec.md 1 describes).
fn enable_svm(host: &PlatformHost, hsave_pa: u64) {
    let efer = host.read_msr(MSR_EFER);
    host.write_msr(MSR_EFER, efer | EFER_SVME_BIT);
    host.write_msr(MSR_VM_HSAVE_PA, hsave_pa);
}

/// Seeds the guest's initial save-area fields from the processor's
/// current architectural state, so the first `VMRUN` resumes execution
/// exactly where this function was called from — the same trick the
/// teacher's `start_hypervisor` uses via `capture_registers`, expressed
/// directly against the VMCB save area instead of an intermediate
/// `GuestRegisters` capture.
unsafe fn capture_initial_guest_state(save: &mut VmcbSaveArea) {
    let rip: u64;
    let rsp: u64;
    let rflags: u64;
    let cr0: u64;
    let cr3: u64;
    let cr4: u64;
    asm!("lea {}, [rip]", out(reg) rip, options(nomem, nostack));
    asm!("mov {}, rsp", out(reg) rsp, options(nomem, nostack));
    asm!("pushfq; pop {}", out(reg) rflags, options(nostack));
    asm!("mov {}, cr0", out(reg) cr0, options(nomem, nostack));
    asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack));
    asm!("mov {}, cr4", out(reg) cr4, options(nomem, nostack));

    save.rip = rip;
    save.rsp = rsp;
    save.rflags = rflags;
    save.cr0 = cr0;
    save.cr3 = cr3;
    save.cr4 = cr4;
    save.efer = EFER_SVME_BIT;
}

/// `CLGI; VMLOAD; VMRUN; VMSAVE; STGI`, repeated until `OnVmExit`
/// requests de-virtualization (spec.md 4.E unload back door).
fn run_until_devirtualized(
    host: &PlatformHost,
    processor: &mut VirtualizedProcessor,
    registry: &HookRegistry,
) -> Result<()> {
    loop {
        // SAFETY: `vmcb_pa` names the processor's own VMCB, exclusively
        // owned by it; GIF is cleared for the duration of VMRUN so no
        // interrupt can observe a partially-configured VMCB (spec.md 5
        // "Scheduling model").
        unsafe {
            asm!("clgi", options(nomem, nostack));
            vmload(processor.vmcb_pa);
            vmrun(processor.vmcb_pa);
            vmsave(processor.vmcb_pa);
            asm!("stgi", options(nomem, nostack));
        }

        // SAFETY: `vmcb_va` is this processor's own page; no other
        // processor or interrupt handler touches it between VMEXIT and
        // the next VMRUN (spec.md 5).
        let control = unsafe { control_area(processor.vmcb_va) };
        let save = unsafe { save_area(processor.vmcb_va) };

        trace!("VM-exit code {:#x}", control.exit_code);

        let per_cpu_data_ptr = &processor.per_cpu as *const PerCpu as u64;
        let action = hypervisor::on_vm_exit(
            host,
            &mut processor.per_cpu,
            registry,
            control,
            save,
            &mut processor.guest_registers,
            per_cpu_data_ptr,
        )?;

        match action {
            ExitAction::Continue => continue,
            ExitAction::Terminate(unload) => {
                debug!(
                    "de-virtualizing at guest rip {:#x}, per-cpu data at {:#x}",
                    unload.guest_rip, unload.per_cpu_data_ptr
                );
                devirtualize(host, processor, unload.guest_rip, unload.guest_rsp);
                return Ok(());
            }
        }
    }
}

/// Clears `EFER.SVME` and hands control back to the guest at the
/// continuation point the back-door unload CPUID reported (spec.md 4.E
/// item 4). `PerCpuCleanup` releases this processor's NPT/pool pages
/// before the jump, since nothing will reference them once SVM is off.
fn devirtualize(
    host: &PlatformHost,
    processor: &mut VirtualizedProcessor,
    guest_rip: u64,
    guest_rsp: u64,
) {
    let efer = host.read_msr(MSR_EFER);
    host.write_msr(MSR_EFER, efer & !EFER_SVME_BIT);
    host.free(processor.vmcb_va, size_of::<[u8; 4096]>());

    // SAFETY: `guest_rip`/`guest_rsp` were reported by the dispatcher's
    // unload path from the guest's own `NRip`/`RSP` at the moment of the
    // back-door CPUID; jumping there with SVM now disabled resumes the
    // original kernel code stream exactly where it issued the CPUID.
    // `processor.guest_registers` already carries the exact RAX/RBX/RCX/
    // RDX values `cpuid::handle`'s unload subleaf computed (the unload
    // marker, the continuation RIP echoed in RBX, and the per-CPU data
    // pointer split across RAX:RDX), so the guest must see them loaded
    // into real registers, not just left in this Rust-side shuttle.
    unsafe {
        restore_guest_and_jump(&processor.guest_registers, guest_rsp, guest_rip);
    }
}

/// Loads every GPR the guest is entitled to see back from `regs`, sets
/// `RSP`, and jumps to `rip` — all in one asm block, since nothing may
/// run between loading a register and the jump without risking clobbering
/// it again. The pointer to `regs` is threaded through `RAX` and read out
/// of its own final slot last (`mov rax, [rax + 120]`), the same
/// self-referencing trick the trampoline builder's `jmp [rip+0]` stub
/// uses to reach a target without spending a spare register on it.
unsafe fn restore_guest_and_jump(regs: &GuestRegisters, guest_rsp: u64, guest_rip: u64) -> ! {
    UNLOAD_CONTINUATION_RIP = guest_rip;
    let regs_ptr = regs as *const GuestRegisters as u64;
    asm!(
        "mov r15, [rax + 0x00]",
        "mov r14, [rax + 0x08]",
        "mov r13, [rax + 0x10]",
        "mov r12, [rax + 0x18]",
        "mov r11, [rax + 0x20]",
        "mov r10, [rax + 0x28]",
        "mov r9,  [rax + 0x30]",
        "mov r8,  [rax + 0x38]",
        "mov rdi, [rax + 0x40]",
        "mov rsi, [rax + 0x48]",
        "mov rbp, [rax + 0x50]",
        "mov rbx, [rax + 0x60]",
        "mov rdx, [rax + 0x68]",
        "mov rcx, [rax + 0x70]",
        "mov rsp, {rsp}",
        "mov rax, [rax + 0x78]",
        "jmp qword ptr [{cont}]",
        rsp = in(reg) guest_rsp,
        cont = sym UNLOAD_CONTINUATION_RIP,
        inout("rax") regs_ptr => _,
        out("r15") _,
        out("r14") _,
        out("r13") _,
        out("r12") _,
        out("r11") _,
        out("r10") _,
        out("r9") _,
        out("r8") _,
        out("rdi") _,
        out("rsi") _,
        out("rbp") _,
        out("rbx") _,
        out("rdx") _,
        out("rcx") _,
        options(noreturn)
    );
}

unsafe fn vmrun(vmcb_pa: u64) {
    asm!("vmrun", in("rax") vmcb_pa, options(nostack));
}

unsafe fn vmload(vmcb_pa: u64) {
    asm!("vmload", in("rax") vmcb_pa, options(nostack));
}

unsafe fn vmsave(vmcb_pa: u64) {
    asm!("vmsave", in("rax") vmcb_pa, options(nostack));
}

/// Broadcasts virtualization to every logical processor (spec.md 5
/// "Global enable/disable is implemented by issuing the back-door CPUID
/// on each CPU in turn"; here it is virtualize-on-each-CPU instead, the
/// load-time equivalent). Per spec.md 5, CPUs may observe different
/// hook states during the broadcast gap; this is acceptable because the
/// hooks are functionally idempotent.
pub fn virtualize_all_processors(host: &'static PlatformHost, registry: &HookRegistry) {
    host.for_each_logical_processor(&mut |cpu_id| {
        info!("virtualizing logical processor {}", cpu_id);
        if let Err(e) = virtualize_processor(host, registry) {
            log::error!("processor {} failed to virtualize: {}", cpu_id, e);
        }
    });
}

/// Releases this processor's NPT hierarchy and pre-allocation pool
/// (spec.md 6 `PerCpuCleanup`). Ordinarily reached only through
/// `devirtualize`'s unload path; exposed separately so a caller that
/// aborts virtualization before entering the `VMRUN` loop can still
/// release what `virtualize_processor` already allocated.
pub fn per_cpu_cleanup(processor: VirtualizedProcessor) {
    hypervisor::per_cpu_cleanup(processor.per_cpu);
}

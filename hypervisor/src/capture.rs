//! Guest-register shuttle (spec.md 4.G).
//!
//! On VM-exit, the host assembly stub (external collaborator, not part of
//! this core) emits all 16 GPRs in a fixed order to the host stack and
//! hands the dispatcher a pointer to the resulting 128-byte block plus a
//! pointer to the per-CPU data. `GuestRegisters` is that block's Rust-side
//! view. RAX is special: the processor spills/reloads it via the VMCB
//! state-save area across VMRUN, so the dispatcher copies it between this
//! struct and the VMCB at the exit/entry boundary rather than trusting the
//! stack-saved copy.

/// General-purpose registers captured across a VM-exit, in the order the
/// host's `pushaq` stub pushes them (R15..RAX, with RSP itself replaced by
/// a dummy slot since it is read from the VMCB save area instead).
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GuestRegisters {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    /// Placeholder matching the stack slot `pushaq` leaves for RSP; the
    /// real guest RSP lives in the VMCB save area and is read from there.
    _rsp_placeholder: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,
}

impl GuestRegisters {
    pub const fn new() -> Self {
        Self {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            r11: 0,
            r10: 0,
            r9: 0,
            r8: 0,
            rdi: 0,
            rsi: 0,
            rbp: 0,
            _rsp_placeholder: 0,
            rbx: 0,
            rdx: 0,
            rcx: 0,
            rax: 0,
        }
    }
}

static_assertions::const_assert_eq!(core::mem::size_of::<GuestRegisters>(), 16 * 8);

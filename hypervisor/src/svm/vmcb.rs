//! VMCB (Virtual Machine Control Block) layout and the interception
//! configuration the core requires (spec.md 6).
//!
//! Field names and the control/save-area split follow AMD's VMCB layout
//! the same way the teacher's VMX equivalent (`vmcs.rs`) exposes the VMCS:
//! a packed control area first, a state-save area second, both inside one
//! 4 KiB-aligned structure.

use bitflags::bitflags;

bitflags! {
    /// Selected bits of VMCB `InterceptMisc1` (offset 0x010).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InterceptMisc1: u32 {
        const CPUID = 1 << 18;
        const MSR_PROT = 1 << 28;
    }
}

bitflags! {
    /// Selected bits of VMCB `InterceptMisc2` (offset 0x014).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InterceptMisc2: u32 {
        const VMRUN = 1 << 0;
    }
}

bitflags! {
    /// Selected bits of the VMCB exception-intercept bitmap (offset 0x008).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ExceptionIntercepts: u32 {
        const BP = 1 << 3;
    }
}

/// MSR `0xC0000080` (`IA32_EFER`).
pub const MSR_EFER: u32 = 0xC000_0080;
/// `IA32_EFER.SVME`, bit 12.
pub const EFER_SVME_BIT: u64 = 1 << 12;

/// VMCB control-area fields this engine reads or writes. This is a subset
/// of the full AMD64 VMCB control block — only the fields the hook engine
/// and the exit dispatcher touch are named; the rest of the 4 KiB control
/// area is reserved/opaque padding owned by the host collaborator that
/// allocated the VMCB.
#[repr(C)]
pub struct VmcbControlArea {
    pub cr_read_intercept: u16,
    pub cr_write_intercept: u16,
    pub dr_read_intercept: u16,
    pub dr_write_intercept: u16,
    pub exception_intercepts: u32,
    pub intercept_misc1: u32,
    pub intercept_misc2: u32,
    _reserved1: [u8; 40],
    pub pause_filter_count: u16,
    pub pause_filter_thresh: u16,
    pub iopm_base_pa: u64,
    pub msrpm_base_pa: u64,
    pub tsc_offset: u64,
    pub guest_asid: u32,
    pub tlb_control: u32,
    pub vintr: u64,
    pub interrupt_shadow: u64,
    pub exit_code: u64,
    pub exit_info1: u64,
    pub exit_info2: u64,
    pub exit_int_info: u64,
    pub np_enable: u64,
    _reserved2: [u8; 16],
    pub event_inj: u64,
    pub ncr3: u64,
    pub lbr_virt_enable: u64,
    pub vmcb_clean: u32,
    _reserved3: u32,
    pub nrip: u64,
    pub num_bytes_fetched: u8,
    pub guest_instruction_bytes: [u8; 15],
    _reserved4: [u8; 800],
}

/// The subset of the VMCB state-save area the core reads (guest RIP/RSP/
/// RFLAGS/SS for the back-door DPL check) or writes (EFER on a validated
/// write-through).
#[repr(C)]
pub struct VmcbSaveArea {
    pub es_selector: u16,
    pub cs_selector: u16,
    pub ss_selector: u16,
    pub ss_attrib: u16,
    pub ds_selector: u16,
    _reserved1: [u8; 0x90],
    pub efer: u64,
    _reserved2: [u8; 0x70],
    pub cr4: u64,
    pub cr3: u64,
    pub cr0: u64,
    pub dr7: u64,
    pub dr6: u64,
    pub rflags: u64,
    pub rip: u64,
    _reserved3: [u8; 0x58],
    pub rsp: u64,
    _reserved4: [u8; 0x18],
    pub rax: u64,
}

impl VmcbSaveArea {
    /// Current privilege level: `SS.DPL`, packed bits 6:5 of the VMCB's
    /// compressed segment-attribute field (spec.md 4.E's back-door CPUID
    /// check reads this, not the SS selector's RPL, since only the
    /// descriptor's DPL is guaranteed to track CPL in all cases).
    pub fn cpl(&self) -> u8 {
        ((self.ss_attrib >> 5) & 0b11) as u8
    }
}

/// Offset into the 8 KiB MSRPM bitmap selecting the write-intercept bit
/// for `IA32_EFER` (spec.md 6): `0x800*8 + ((msr - 0xC0000000) * 2 + 1)`.
pub fn efer_msrpm_bit_offset() -> usize {
    0x800 * 8 + (((MSR_EFER - 0xC000_0000) as usize) * 2 + 1)
}

/// Builds an 8 KiB MSR permission bitmap with exactly one set bit: the
/// write-intercept bit for `IA32_EFER`.
pub fn build_efer_only_msrpm() -> alloc::boxed::Box<[u8; 8192]> {
    let mut bitmap = alloc::boxed::Box::new([0u8; 8192]);
    let bit = efer_msrpm_bit_offset();
    bitmap[bit / 8] |= 1 << (bit % 8);
    bitmap
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn efer_bit_offset_matches_spec_formula() {
        // 0x800*8 + ((0xC0000080 - 0xC0000000) * 2 + 1) = 0x4000 + 257 = 16641
        assert_eq!(efer_msrpm_bit_offset(), 0x4000 + 257);
    }

    #[test]
    fn msrpm_has_exactly_one_set_bit() {
        let bitmap = build_efer_only_msrpm();
        let set_bits: u32 = bitmap.iter().map(|b| b.count_ones()).sum();
        assert_eq!(set_bits, 1);
    }
}

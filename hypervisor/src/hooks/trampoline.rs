//! Fixed first-instruction pattern table and trampoline byte builder
//! (spec.md 4.F). Deliberately not a disassembler — `PATTERNS` recognizes
//! only the handful of compiler-generated prologue shapes a hook site is
//! expected to start with, and `build` refuses to load rather than guess.

use crate::error::{HypervisorError, Result};
use alloc::boxed::Box;
use alloc::vec::Vec;

/// One recognized prologue fragment: `prefix` must match the bytes at the
/// hook site exactly; `len` is the resulting first-instruction length.
struct Pattern {
    prefix: &'static [u8],
    len: usize,
}

/// Prologue bytes this builder recognizes, longest/most-specific first so
/// a shorter prefix never shadows a longer one that starts the same way.
#[rustfmt::skip]
const PATTERNS: &[Pattern] = &[
    // mov [rsp+disp8], rbx / rdx / rcx / r8 (REX.W 89 /r, disp8 ModRM)
    Pattern { prefix: &[0x48, 0x89, 0x5C, 0x24], len: 5 }, // mov [rsp+X], rbx
    Pattern { prefix: &[0x48, 0x89, 0x54, 0x24], len: 5 }, // mov [rsp+X], rdx
    Pattern { prefix: &[0x4C, 0x89, 0x44, 0x24], len: 5 }, // mov [rsp+X], r8
    // sub rsp, imm8
    Pattern { prefix: &[0x48, 0x83, 0xEC], len: 4 },
    // mov rax, rsp
    Pattern { prefix: &[0x48, 0x8B, 0xC4], len: 3 },
    // xor edx, edx
    Pattern { prefix: &[0x33, 0xD2], len: 2 },
    // push rbx / rbp / rdi
    Pattern { prefix: &[0x53], len: 1 },
    Pattern { prefix: &[0x55], len: 1 },
    Pattern { prefix: &[0x57], len: 1 },
];

/// Longest prefix any pattern above requires, so callers know how many
/// bytes must be readable at the hook site before matching.
pub const MAX_PATTERN_LEN: usize = 5;

/// Match `bytes` (the first few bytes at the hook site) against the fixed
/// pattern table, returning the recognized instruction length.
pub fn match_prologue(bytes: &[u8]) -> Option<usize> {
    PATTERNS
        .iter()
        .find(|p| bytes.len() >= p.prefix.len() && &bytes[..p.prefix.len()] == p.prefix)
        .map(|p| p.len)
}

/// `copy(L bytes) || nop || jmp [rip+0] || qword(target)`, `L + 15` bytes
/// total (7-byte indirect jump plus an 8-byte absolute target, with one
/// `nop` pad byte so the jump's `ModRM` displacement stays naturally
/// aligned regardless of `L`).
pub fn build_trampoline(first_instruction: &[u8], target: u64) -> Vec<u8> {
    let l = first_instruction.len();
    let mut bytes = Vec::with_capacity(l + 15);
    bytes.extend_from_slice(first_instruction);
    bytes.push(0x90); // nop pad
    bytes.extend_from_slice(&[0xFF, 0x25, 0x00, 0x00, 0x00, 0x00]); // jmp qword [rip+0]
    bytes.extend_from_slice(&target.to_le_bytes());
    bytes
}

/// Builds and writes a trampoline into a freshly allocated executable
/// page, returning the page's virtual address (`original_call`). Fails
/// if the prologue at `hook_va` matches no pattern, or if the matched
/// instruction would straddle the end of `page_bytes` (the 4 KiB page
/// containing `hook_va`).
pub fn build_original_call_stub(
    hook_va: u64,
    page_bytes: &[u8; 4096],
    page_offset: usize,
    allocate_executable: &dyn Fn(usize) -> Option<*mut u8>,
) -> Result<*mut u8> {
    let probe_len = MAX_PATTERN_LEN.min(4096 - page_offset);
    let probe = &page_bytes[page_offset..page_offset + probe_len];
    let insn_len =
        match_prologue(probe).ok_or(HypervisorError::UnrecognizedPrologue { hook_va })?;
    if page_offset + insn_len > 4096 {
        return Err(HypervisorError::InstructionCrossesPageBoundary { hook_va });
    }

    let first_instruction = &page_bytes[page_offset..page_offset + insn_len];
    let stub = build_trampoline(first_instruction, hook_va + insn_len as u64);

    let raw = allocate_executable(stub.len()).ok_or(HypervisorError::HookAllocationFailed)?;
    // SAFETY: `raw` is freshly allocated by the host with at least
    // `stub.len()` executable bytes and is not yet visible to the guest.
    unsafe {
        core::ptr::copy_nonoverlapping(stub.as_ptr(), raw, stub.len());
    }
    Ok(raw)
}

/// A heap-backed stand-in for `build_original_call_stub`'s allocation,
/// used only by unit tests to exercise the byte layout without a host.
#[cfg(test)]
fn leak_stub(bytes: &[u8]) -> Box<[u8]> {
    bytes.to_vec().into_boxed_slice()
}

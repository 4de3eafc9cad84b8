//! Error taxonomy for the hook engine.
//!
//! Every variant maps to one of the kinds spec'd for the core: resource
//! exhaustion during NPT construction or hook installation, an
//! unrecognized trampoline prologue, an unsupported host, or an impossible
//! state observed by the hook state machine. `GuestFault` and
//! `GuestBreakpoint` are handled in place by the exit dispatcher (an SVM
//! event is injected) and never surface as `Err` from `OnVmExit`.

use thiserror_no_std::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HypervisorError {
    /// The CPU does not support SVM, or supports it but `VM_CR.SVMDIS` is set.
    #[error("SVM is not supported or has been disabled by the BIOS")]
    SvmUnsupported,

    /// The CPU does not support nested paging.
    #[error("nested paging (NPT) is not supported")]
    NptUnsupported,

    /// A 4 KiB page could not be allocated for an NPT interior or leaf table.
    #[error("out of memory while building the NPT hierarchy")]
    NptAllocationFailed,

    /// `PreAllocPool::take` was called with no free entries. Fatal at
    /// runtime: the faulting guest instruction cannot be retried without
    /// the mapping it needs.
    #[error("the per-processor NPT pre-allocation pool is exhausted")]
    PreAllocPoolExhausted,

    /// A hook's exec-page or trampoline page could not be allocated.
    #[error("out of memory while installing a hook")]
    HookAllocationFailed,

    /// The first instruction at the hook site matched no entry in the
    /// trampoline builder's pattern table.
    #[error("no recognized prologue at hook site {hook_va:#x}")]
    UnrecognizedPrologue { hook_va: u64 },

    /// The first instruction at the hook site straddles a page boundary.
    #[error("first instruction at hook site {hook_va:#x} crosses a page boundary")]
    InstructionCrossesPageBoundary { hook_va: u64 },

    /// The requested kernel export could not be resolved to a virtual address.
    #[error("could not resolve kernel symbol {0:?}")]
    UnresolvedSymbol(&'static str),

    /// The hook registry has reached its fixed capacity.
    #[error("hook registry is full")]
    RegistryFull,

    /// An impossible state was observed by the hook state engine, e.g.
    /// `DisableHooks` issued while `HookExecVisible` with no active hook,
    /// or an NPT walk failing where construction guaranteed it could not.
    #[error("invariant violation in the hook state engine")]
    InvariantViolation,

    /// The VM-exit dispatcher received an `ExitCode` it has no handler
    /// for. Fatal: the engine cannot safely resume the guest.
    #[error("unhandled VM-exit code {0:#x}")]
    UnhandledExitCode(u64),
}

pub type Result<T> = core::result::Result<T, HypervisorError>;

//! Thin bootstrap crate: implements `hypervisor::host::Host` for the
//! running machine and drives the per-processor virtualize/de-virtualize
//! loop (SPEC_FULL.md 10.1). Owns no hook or NPT state itself — all of
//! that lives in `hypervisor`, reached only through its public surface
//! (`core_init`/`per_cpu_init`/`on_vm_exit`/`per_cpu_cleanup`/
//! `core_cleanup`).
#![no_std]

extern crate alloc;

pub mod platform;
pub mod processor;

pub use platform::{PlatformConfig, PlatformHost};
pub use processor::{build_registry, virtualize_all_processors, virtualize_processor};

use hypervisor::error::Result;
use hypervisor::hooks::registry::{HookDescriptor, HookRegistry};

/// `DriverEntry`-style load path: builds the fixed hook registry
/// (spec.md 3, `CoreInit`) and virtualizes every logical processor. The
/// packaging layer that actually registers this as a loadable kernel
/// driver (spec.md 1 "file/driver packaging") is out of scope here —
/// this function is what that layer calls once its own initialization
/// has supplied a `PlatformHost`.
pub fn load(host: &'static PlatformHost, hooks: &'static [HookDescriptor]) -> Result<HookRegistry> {
    let registry = build_registry(host, hooks)?;
    virtualize_all_processors(host, &registry);
    Ok(registry)
}

/// `DriverEntry`-style unload path (spec.md 6 `CoreCleanup`): releases
/// every pin the registry holds. Per-processor de-virtualization itself
/// happens through the back-door unload CPUID (spec.md 4.E), not here —
/// by the time this runs, every processor has already left guest mode.
pub fn unload(host: &PlatformHost, registry: HookRegistry) {
    hypervisor::core_cleanup(host, registry);
}

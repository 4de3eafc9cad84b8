//! Stealth hook engine (spec.md 3, 4.C, 4.D, 4.F): the load-time
//! registry, the fixed-pattern trampoline builder, and the per-processor
//! state machine that drives NPT permission/backing-page mutations.

pub mod registry;
pub mod state;
pub mod trampoline;

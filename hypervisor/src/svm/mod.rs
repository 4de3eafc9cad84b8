//! AMD-V (SVM) support: the NPT hierarchy manager, VMCB layout, the
//! event-injection record, the per-processor `Vm` owner, and the exit
//! dispatcher (spec.md 4.B, 4.E, 6).

pub mod events;
pub mod npt;
pub mod vm;
pub mod vmcb;
pub mod vmexit;

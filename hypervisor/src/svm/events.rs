//! SVM event-injection record (spec.md 4.E): 8-bit vector, 3-bit type,
//! 1-bit error-code-valid, 1-bit valid, 32-bit error code, packed into the
//! VMCB's `EVENTINJ` field the way the teacher's VMX `EventInjection`
//! packs an `VM_ENTRY_INTERRUPT_INFO_FIELD`.

use bitfield::bitfield;

/// `EVENTINJ` event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventType {
    Nmi = 2,
    Exception = 3,
    SoftwareInterrupt = 4,
}

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct EventInjection(u64);
    impl Debug;
    pub vector, set_vector: 7, 0;
    pub event_type, set_event_type: 10, 8;
    pub error_code_valid, set_error_code_valid: 11;
    pub valid, set_valid: 31;
    pub error_code, set_error_code: 63, 32;
}

impl EventInjection {
    /// A #BP (vector 3) exception re-injection with no error code, as
    /// required when the engine forwards a legitimate guest breakpoint
    /// that did not land on a registered hook site.
    pub fn breakpoint() -> Self {
        let mut event = Self(0);
        event.set_vector(3);
        event.set_event_type(EventType::Exception as u64);
        event.set_error_code_valid(false);
        event.set_valid(true);
        event
    }

    /// A #GP(0) injection, used both for the nested-VMRUN rejection and
    /// for a guest write to EFER that would clear SVME.
    pub fn general_protection_fault() -> Self {
        let mut event = Self(0);
        event.set_vector(13);
        event.set_event_type(EventType::Exception as u64);
        event.set_error_code_valid(true);
        event.set_error_code(0);
        event.set_valid(true);
        event
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breakpoint_has_no_error_code() {
        let e = EventInjection::breakpoint();
        assert_eq!(e.vector(), 3);
        assert_eq!(e.event_type(), EventType::Exception as u64);
        assert!(!e.error_code_valid());
        assert!(e.valid());
    }

    #[test]
    fn gp_fault_carries_zero_error_code() {
        let e = EventInjection::general_protection_fault();
        assert_eq!(e.vector(), 13);
        assert!(e.error_code_valid());
        assert_eq!(e.error_code(), 0);
    }
}

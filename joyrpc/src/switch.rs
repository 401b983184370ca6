use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of a bound invoker. Transitions only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum InvokerState {
    New = 0,
    Opening = 1,
    Opened = 2,
    Closing = 3,
    Closed = 4,
}

impl InvokerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => InvokerState::New,
            1 => InvokerState::Opening,
            2 => InvokerState::Opened,
            3 => InvokerState::Closing,
            _ => InvokerState::Closed,
        }
    }
}

/// Single-shot forward switch guarding invoker lifecycle transitions.
///
/// Exactly one caller wins each transition, which totally orders the state
/// changes of an invoker without a lock.
#[derive(Debug, Default)]
pub struct StateSwitch(AtomicU8);

impl StateSwitch {
    #[must_use]
    pub fn state(&self) -> InvokerState {
        InvokerState::from_u8(self.0.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is(&self, state: InvokerState) -> bool {
        self.state() == state
    }

    /// Attempts `from -> to`; returns whether this caller won the switch.
    /// Backward transitions are never applied.
    pub fn transition(&self, from: InvokerState, to: InvokerState) -> bool {
        if to <= from {
            return false;
        }
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

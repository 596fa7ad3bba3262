//! Per-guest health state.

use crate::error::Error;

/// Health of one guest instance. Only ever moves `Healthy -> Sealed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RuntimeHealth {
    #[default]
    Healthy,
    Sealed,
}

impl RuntimeHealth {
    /// Gate checked before every guest invocation.
    pub fn ensure_healthy(&self) -> Result<(), Error> {
        match self {
            RuntimeHealth::Healthy => Ok(()),
            RuntimeHealth::Sealed => Err(Error::Sealed),
        }
    }

    pub fn seal(&mut self) {
        *self = RuntimeHealth::Sealed;
    }

    pub fn is_sealed(&self) -> bool {
        *self == RuntimeHealth::Sealed
    }
}

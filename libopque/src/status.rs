#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// Outcome of an operation: its state plus an operation-defined error code.
///
/// The error code is not restricted to failures. FSCK checks, for instance,
/// succeed and carry the per-object outcome bitmask in `error_code`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpStatus {
    pub state: OpState,
    pub error_code: i32,
}

impl OpStatus {
    pub const PENDING: OpStatus = OpStatus {
        state: OpState::Pending,
        error_code: 0,
    };

    pub fn success() -> Self {
        Self::success_with(0)
    }

    pub fn success_with(error_code: i32) -> Self {
        Self {
            state: OpState::Succeeded,
            error_code,
        }
    }

    pub fn failure() -> Self {
        Self::failure_with(0)
    }

    pub fn failure_with(error_code: i32) -> Self {
        Self {
            state: OpState::Failed,
            error_code,
        }
    }

    pub fn is_success(&self) -> bool {
        self.state == OpState::Succeeded
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self.state, OpState::Succeeded | OpState::Failed)
    }
}

impl Default for OpStatus {
    fn default() -> Self {
        Self::PENDING
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolved_states() {
        assert!(!OpStatus::PENDING.is_resolved());
        assert!(OpStatus::success().is_resolved());
        assert!(OpStatus::failure_with(3).is_resolved());
        assert!(!OpStatus::failure().is_success());
        assert_eq!(OpStatus::success_with(8).error_code, 8);
    }
}

use serde::{Deserialize, Serialize};
use std::fmt;

/// Coarse state of a long-running operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationState {
    InProgress,
    Succeeded,
    Failed,
    Cancelled,
}

impl OperationState {
    /// Maps a provider status string.
    ///
    /// Only the exact terminal names (any case) are terminal; every other
    /// value, including empty or unknown ones, means the operation is still
    /// running.
    pub fn from_provider_status(status: &str) -> Self {
        if status.eq_ignore_ascii_case("succeeded") {
            Self::Succeeded
        } else if status.eq_ignore_ascii_case("failed") {
            Self::Failed
        } else if status.eq_ignore_ascii_case("cancelled") || status.eq_ignore_ascii_case("canceled")
        {
            Self::Cancelled
        } else {
            Self::InProgress
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InProgress => "InProgress",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_status_mapping() {
        assert_eq!(OperationState::from_provider_status("Succeeded"), OperationState::Succeeded);
        assert_eq!(OperationState::from_provider_status("FAILED"), OperationState::Failed);
        assert_eq!(OperationState::from_provider_status("canceled"), OperationState::Cancelled);
        assert_eq!(OperationState::from_provider_status("Running"), OperationState::InProgress);
        assert_eq!(OperationState::from_provider_status(""), OperationState::InProgress);
        assert_eq!(OperationState::from_provider_status(" Succeeded"), OperationState::InProgress);
    }
}

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a workflow instance as observed by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuntimeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Terminated,
    ContinuedAsNew,
    Suspended,
    Stalled,
}

impl RuntimeStatus {
    /// Terminal instances accept no further events and may be purged or replaced.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RuntimeStatus::Completed | RuntimeStatus::Failed | RuntimeStatus::Terminated
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RuntimeStatus::Pending => "PENDING",
            RuntimeStatus::Running => "RUNNING",
            RuntimeStatus::Completed => "COMPLETED",
            RuntimeStatus::Failed => "FAILED",
            RuntimeStatus::Terminated => "TERMINATED",
            RuntimeStatus::ContinuedAsNew => "CONTINUED_AS_NEW",
            RuntimeStatus::Suspended => "SUSPENDED",
            RuntimeStatus::Stalled => "STALLED",
        }
    }
}

impl fmt::Display for RuntimeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(RuntimeStatus::Completed.is_terminal());
        assert!(RuntimeStatus::Failed.is_terminal());
        assert!(RuntimeStatus::Terminated.is_terminal());
        assert!(!RuntimeStatus::Stalled.is_terminal());
        assert!(!RuntimeStatus::Suspended.is_terminal());
        assert!(!RuntimeStatus::ContinuedAsNew.is_terminal());
        assert_eq!(RuntimeStatus::ContinuedAsNew.to_string(), "CONTINUED_AS_NEW");
    }
}

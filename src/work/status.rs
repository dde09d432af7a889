use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a work unit.
///
/// Units flow PENDING → IN_PROGRESS → COMPLETED | FAILED. The only backward
/// edges are re-queues: an in-doubt or abandoned unit returns to PENDING, and
/// an operator may re-queue a FAILED unit. COMPLETED is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitStatus::Pending => write!(f, "pending"),
            UnitStatus::InProgress => write!(f, "in_progress"),
            UnitStatus::Completed => write!(f, "completed"),
            UnitStatus::Failed => write!(f, "failed"),
        }
    }
}

impl UnitStatus {
    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(self, next: UnitStatus) -> bool {
        use UnitStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Pending)
                | (Failed, Pending)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_path_is_allowed() {
        assert!(UnitStatus::Pending.can_transition_to(UnitStatus::InProgress));
        assert!(UnitStatus::InProgress.can_transition_to(UnitStatus::Completed));
        assert!(UnitStatus::InProgress.can_transition_to(UnitStatus::Failed));
    }

    #[test]
    fn completed_never_reverts() {
        for next in [
            UnitStatus::Pending,
            UnitStatus::InProgress,
            UnitStatus::Failed,
        ] {
            assert!(!UnitStatus::Completed.can_transition_to(next));
        }
    }

    #[test]
    fn requeue_edges() {
        assert!(UnitStatus::InProgress.can_transition_to(UnitStatus::Pending));
        assert!(UnitStatus::Failed.can_transition_to(UnitStatus::Pending));
        assert!(!UnitStatus::Pending.can_transition_to(UnitStatus::Completed));
        assert!(!UnitStatus::Failed.can_transition_to(UnitStatus::Completed));
    }

    #[test]
    fn status_display_matches_serde() {
        assert_eq!(UnitStatus::InProgress.to_string(), "in_progress");
        assert_eq!(
            serde_json::to_string(&UnitStatus::InProgress).unwrap(),
            "\"in_progress\""
        );
    }
}

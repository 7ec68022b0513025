use serde::Serialize;

use staffline_core::types::{InstanceStatus, StepStatus, WorkflowStep};

/// Completion derived from a step snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub percentage: u8,
    pub status: InstanceStatus,
    pub completed: usize,
    /// Steps counted towards completion (skipped steps are excluded).
    pub total: usize,
}

/// Derive percentage and status from the steps of one instance.
///
/// Never yields `overdue` or `cancelled`; those are applied by the
/// instance manager.
pub fn aggregate(steps: &[WorkflowStep]) -> Progress {
    let total = steps
        .iter()
        .filter(|s| s.status != StepStatus::Skipped)
        .count();
    let completed = steps
        .iter()
        .filter(|s| s.status == StepStatus::Completed)
        .count();
    let any_active = steps.iter().any(|s| s.status.is_active());

    if total == 0 {
        // Every step was skipped: nothing is left to do.
        if !steps.is_empty() {
            return Progress {
                percentage: 100,
                status: InstanceStatus::Completed,
                completed,
                total,
            };
        }
        return Progress {
            percentage: 0,
            status: InstanceStatus::NotStarted,
            completed,
            total,
        };
    }

    let status = if completed == total {
        InstanceStatus::Completed
    } else if completed > 0 || any_active {
        InstanceStatus::InProgress
    } else {
        InstanceStatus::NotStarted
    };

    Progress {
        percentage: round_percentage(completed, total),
        status,
        completed,
        total,
    }
}

/// `round(100 * completed / total)`, halves rounded up.
fn round_percentage(completed: usize, total: usize) -> u8 {
    ((200 * completed + total) / (2 * total)).min(100) as u8
}

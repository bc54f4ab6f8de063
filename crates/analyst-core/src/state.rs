//! Step state machine
//!
//! ```text
//! Pending -> Generating -> Executing -> Succeeded
//!                 |            |
//!                 v            v
//!               Failed <-------+----> Generating (correction)
//! ```

use crate::error::StateMachineError;
use crate::types::StepStatus;

/// Validates a step status transition.
pub fn validate_transition(from: StepStatus, to: StepStatus) -> Result<(), StateMachineError> {
    if allowed(from, to) {
        Ok(())
    } else {
        Err(StateMachineError::IllegalTransition { from, to })
    }
}

pub fn allowed_transitions(from: StepStatus) -> Vec<StepStatus> {
    use StepStatus::*;
    match from {
        Pending => vec![Generating],
        Generating => vec![Executing, Failed],
        Executing => vec![Succeeded, Generating, Failed],
        Succeeded => vec![],
        Failed => vec![],
    }
}

fn allowed(from: StepStatus, to: StepStatus) -> bool {
    allowed_transitions(from).into_iter().any(|s| s == to)
}

//! Stable exit codes for the `mobile-use` CLI.

use crate::core::types::SessionOutcome;

/// Command succeeded, or the session reached its goal.
pub const OK: i32 = 0;
/// Invalid configuration, arguments or environment, or any other error.
pub const INVALID: i32 = 1;
/// The session ended with `failed(reason)`.
pub const FAILED: i32 = 2;
/// The session was aborted (cancelled or out of wall-clock budget).
pub const ABORTED: i32 = 3;

pub fn for_outcome(outcome: &SessionOutcome) -> i32 {
    match outcome {
        SessionOutcome::Succeeded { .. } => OK,
        SessionOutcome::Failed { .. } => FAILED,
        SessionOutcome::Aborted { .. } => ABORTED,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{AbortReason, FailureReason};

    #[test]
    fn outcomes_map_to_distinct_codes() {
        let failed = SessionOutcome::Failed {
            reason: FailureReason::NoPath,
            detail: String::new(),
        };
        let aborted = SessionOutcome::Aborted {
            reason: AbortReason::DeadlineExceeded,
            detail: String::new(),
        };
        assert_eq!(
            for_outcome(&SessionOutcome::Succeeded {
                summary: "done".into()
            }),
            OK
        );
        assert_eq!(for_outcome(&failed), FAILED);
        assert_eq!(for_outcome(&aborted), ABORTED);
    }
}

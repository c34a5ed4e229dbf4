//! Pure validation of per-phase status transitions. No I/O, no locking — the
//! table is static and the same for every phase (spec §4.1 permits
//! phase-specific specialization, but no phase currently needs it).

use crate::error::OrchestratorError;
use crate::model::{PhaseStatus, PhaseType};

/// Validates a `from -> to` move for `phase`. Self-transitions always
/// succeed (the caller is expected to treat them as a no-op, not replay
/// them here). Every other move is checked against the static table in
/// spec §3.
pub fn validate(
    from: PhaseStatus,
    to: PhaseStatus,
    phase: PhaseType,
) -> Result<(), OrchestratorError> {
    if from == to {
        return Ok(());
    }

    let allowed: &[PhaseStatus] = match from {
        PhaseStatus::NotStarted => &[
            PhaseStatus::Configured,
            PhaseStatus::InProgress,
            PhaseStatus::Skipped,
        ],
        PhaseStatus::Configured => &[PhaseStatus::InProgress, PhaseStatus::Skipped],
        PhaseStatus::InProgress => &[
            PhaseStatus::Paused,
            PhaseStatus::Completed,
            PhaseStatus::Failed,
        ],
        PhaseStatus::Paused => &[PhaseStatus::InProgress, PhaseStatus::Failed],
        PhaseStatus::Failed => &[PhaseStatus::InProgress],
        PhaseStatus::Completed => &[PhaseStatus::InProgress],
        PhaseStatus::Skipped => &[PhaseStatus::InProgress],
    };

    if allowed.contains(&to) {
        Ok(())
    } else {
        Err(OrchestratorError::TransitionInvalid { from, to, phase })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_transition_always_ok() {
        for status in [
            PhaseStatus::NotStarted,
            PhaseStatus::Configured,
            PhaseStatus::InProgress,
            PhaseStatus::Paused,
            PhaseStatus::Completed,
            PhaseStatus::Failed,
            PhaseStatus::Skipped,
        ] {
            assert!(validate(status, status, PhaseType::DnsValidation).is_ok());
        }
    }

    #[test]
    fn happy_path_transitions_are_allowed() {
        assert!(validate(
            PhaseStatus::NotStarted,
            PhaseStatus::InProgress,
            PhaseType::DomainGeneration
        )
        .is_ok());
        assert!(validate(
            PhaseStatus::InProgress,
            PhaseStatus::Completed,
            PhaseType::DomainGeneration
        )
        .is_ok());
        assert!(validate(
            PhaseStatus::InProgress,
            PhaseStatus::Paused,
            PhaseType::DomainGeneration
        )
        .is_ok());
        assert!(validate(
            PhaseStatus::Paused,
            PhaseStatus::InProgress,
            PhaseType::DomainGeneration
        )
        .is_ok());
        assert!(validate(
            PhaseStatus::Failed,
            PhaseStatus::InProgress,
            PhaseType::DomainGeneration
        )
        .is_ok());
        assert!(validate(
            PhaseStatus::Completed,
            PhaseStatus::InProgress,
            PhaseType::DomainGeneration
        )
        .is_ok());
    }

    #[test]
    fn completed_to_paused_is_rejected() {
        let err = validate(
            PhaseStatus::Completed,
            PhaseStatus::Paused,
            PhaseType::Analysis,
        )
        .unwrap_err();
        match err {
            OrchestratorError::TransitionInvalid { from, to, phase } => {
                assert_eq!(from, PhaseStatus::Completed);
                assert_eq!(to, PhaseStatus::Paused);
                assert_eq!(phase, PhaseType::Analysis);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn not_started_cannot_jump_to_paused() {
        assert!(validate(
            PhaseStatus::NotStarted,
            PhaseStatus::Paused,
            PhaseType::Extraction
        )
        .is_err());
    }

    #[test]
    fn skipped_can_only_move_to_in_progress() {
        assert!(validate(
            PhaseStatus::Skipped,
            PhaseStatus::InProgress,
            PhaseType::Enrichment
        )
        .is_ok());
        assert!(validate(
            PhaseStatus::Skipped,
            PhaseStatus::Completed,
            PhaseType::Enrichment
        )
        .is_err());
    }
}

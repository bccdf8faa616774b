use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ReviewError, Result};

/// Lifecycle phase of a review session.
///
/// `Deliberating` self-transitions on every turn advance so that the
/// transition table is the single source of truth for the loop as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    #[default]
    Idle,
    Collecting,
    Reviewing,
    Dedup,
    Deliberating,
    Fixing,
    Verifying,
    Complete,
}

impl SessionPhase {
    pub fn allowed_transitions(&self) -> &'static [SessionPhase] {
        use SessionPhase::*;
        match self {
            Idle => &[Collecting],
            Collecting => &[Reviewing],
            Reviewing => &[Dedup],
            Dedup => &[Deliberating],
            Deliberating => &[Deliberating, Fixing, Complete],
            Fixing => &[Verifying, Complete],
            Verifying => &[Fixing, Complete],
            Complete => &[],
        }
    }

    pub fn can_transition_to(&self, target: SessionPhase) -> bool {
        self.allowed_transitions().contains(&target)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionPhase::Complete)
    }

    /// Phases where reviewer subprocesses may be actively running.
    pub fn has_live_work(&self) -> bool {
        matches!(
            self,
            SessionPhase::Collecting
                | SessionPhase::Reviewing
                | SessionPhase::Deliberating
                | SessionPhase::Verifying
        )
    }

    pub fn accepts_reviews(&self) -> bool {
        matches!(self, SessionPhase::Reviewing | SessionPhase::Verifying)
    }

    pub fn accepts_opinions(&self) -> bool {
        matches!(
            self,
            SessionPhase::Reviewing | SessionPhase::Deliberating | SessionPhase::Verifying
        )
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Collecting => "collecting",
            Self::Reviewing => "reviewing",
            Self::Dedup => "dedup",
            Self::Deliberating => "deliberating",
            Self::Fixing => "fixing",
            Self::Verifying => "verifying",
            Self::Complete => "complete",
        };
        write!(f, "{}", s)
    }
}

/// Validated transition helper. Returns the new phase or a state error.
pub fn transition(current: SessionPhase, to: SessionPhase) -> Result<SessionPhase> {
    if !current.can_transition_to(to) {
        return Err(ReviewError::InvalidTransition { from: current, to });
    }
    Ok(to)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        assert!(SessionPhase::Idle.can_transition_to(SessionPhase::Collecting));
        assert!(SessionPhase::Collecting.can_transition_to(SessionPhase::Reviewing));
        assert!(SessionPhase::Reviewing.can_transition_to(SessionPhase::Dedup));
        assert!(SessionPhase::Dedup.can_transition_to(SessionPhase::Deliberating));
        assert!(SessionPhase::Deliberating.can_transition_to(SessionPhase::Complete));
    }

    #[test]
    fn test_deliberation_loop() {
        assert!(SessionPhase::Deliberating.can_transition_to(SessionPhase::Deliberating));
        assert!(SessionPhase::Deliberating.can_transition_to(SessionPhase::Fixing));
    }

    #[test]
    fn test_fix_verify_loop() {
        assert!(SessionPhase::Fixing.can_transition_to(SessionPhase::Verifying));
        assert!(SessionPhase::Verifying.can_transition_to(SessionPhase::Fixing));
        assert!(SessionPhase::Verifying.can_transition_to(SessionPhase::Complete));
    }

    #[test]
    fn test_complete_is_terminal() {
        assert!(SessionPhase::Complete.is_terminal());
        assert!(SessionPhase::Complete.allowed_transitions().is_empty());
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let err = transition(SessionPhase::Idle, SessionPhase::Deliberating).unwrap_err();
        assert_eq!(err.kind(), "state");
    }

    #[test]
    fn test_phase_skipping_rejected() {
        assert!(!SessionPhase::Reviewing.can_transition_to(SessionPhase::Deliberating));
        assert!(!SessionPhase::Collecting.can_transition_to(SessionPhase::Dedup));
    }
}

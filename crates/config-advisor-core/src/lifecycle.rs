//! Proposal and run state machines.
//!
//! Every status change in the system goes through [`next_proposal_status`]
//! or [`check_run_transition`]; stores only persist what these allow.
//!
//! ```text
//! pending  --accept--> accepted
//! pending  --reject--> rejected
//! accepted --apply---> applied
//! accepted --reject--> rejected
//! accepted --drift---> stale
//! stale    --rescan--> pending
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{ProposalStatus, RunStatus};

/// An event that moves a proposal between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposalAction {
    Accept,
    Reject,
    Apply,
    Drift,
    Rescan,
}

impl ProposalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalAction::Accept => "accept",
            ProposalAction::Reject => "reject",
            ProposalAction::Apply => "apply",
            ProposalAction::Drift => "drift",
            ProposalAction::Rescan => "rescan",
        }
    }
}

impl fmt::Display for ProposalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProposalAction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "accept" => Ok(ProposalAction::Accept),
            "reject" => Ok(ProposalAction::Reject),
            "apply" => Ok(ProposalAction::Apply),
            "drift" => Ok(ProposalAction::Drift),
            "rescan" => Ok(ProposalAction::Rescan),
            other => anyhow::bail!("unknown action: '{}'", other),
        }
    }
}

/// A requested state change that the state machine does not allow.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("cannot {action} a proposal in state '{from}'")]
    Proposal {
        from: ProposalStatus,
        action: ProposalAction,
    },

    #[error("cannot discard a proposal in state '{0}'")]
    Discard(ProposalStatus),

    #[error("cannot move a run from '{from}' to '{to}'")]
    Run { from: RunStatus, to: RunStatus },
}

/// Status reached by applying `action` to a proposal in `from`.
pub fn next_proposal_status(
    from: ProposalStatus,
    action: ProposalAction,
) -> Result<ProposalStatus, TransitionError> {
    use ProposalAction as A;
    use ProposalStatus as S;

    match (from, action) {
        (S::Pending, A::Accept) => Ok(S::Accepted),
        (S::Pending, A::Reject) => Ok(S::Rejected),
        (S::Accepted, A::Apply) => Ok(S::Applied),
        (S::Accepted, A::Reject) => Ok(S::Rejected),
        (S::Accepted, A::Drift) => Ok(S::Stale),
        (S::Stale, A::Rescan) => Ok(S::Pending),
        _ => Err(TransitionError::Proposal { from, action }),
    }
}

/// Whether a proposal in `status` may be deleted outright.
pub fn check_discard(status: ProposalStatus) -> Result<(), TransitionError> {
    match status {
        ProposalStatus::Applied | ProposalStatus::Accepted => Err(TransitionError::Discard(status)),
        _ => Ok(()),
    }
}

pub fn is_terminal_proposal(status: ProposalStatus) -> bool {
    matches!(status, ProposalStatus::Applied | ProposalStatus::Rejected)
}

pub fn is_terminal_run(status: RunStatus) -> bool {
    matches!(status, RunStatus::Completed | RunStatus::Failed)
}

pub fn check_run_transition(from: RunStatus, to: RunStatus) -> Result<(), TransitionError> {
    use RunStatus as R;

    match (from, to) {
        (R::Pending, R::Running)
        | (R::Pending, R::Failed)
        | (R::Running, R::Completed)
        | (R::Running, R::Failed) => Ok(()),
        _ => Err(TransitionError::Run { from, to }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATUSES: [ProposalStatus; 5] = [
        ProposalStatus::Pending,
        ProposalStatus::Accepted,
        ProposalStatus::Rejected,
        ProposalStatus::Applied,
        ProposalStatus::Stale,
    ];
    const ALL_ACTIONS: [ProposalAction; 5] = [
        ProposalAction::Accept,
        ProposalAction::Reject,
        ProposalAction::Apply,
        ProposalAction::Drift,
        ProposalAction::Rescan,
    ];

    #[test]
    fn test_exactly_six_proposal_transitions_are_allowed() {
        let allowed: Vec<_> = ALL_STATUSES
            .iter()
            .flat_map(|s| ALL_ACTIONS.iter().map(move |a| (*s, *a)))
            .filter_map(|(s, a)| next_proposal_status(s, a).ok().map(|to| (s, a, to)))
            .collect();
        assert_eq!(allowed.len(), 6);
        assert!(allowed.contains(&(ProposalStatus::Stale, ProposalAction::Rescan, ProposalStatus::Pending)));
        assert!(allowed.contains(&(ProposalStatus::Accepted, ProposalAction::Drift, ProposalStatus::Stale)));
    }

    #[test]
    fn test_terminal_states_reject_everything() {
        for status in [ProposalStatus::Applied, ProposalStatus::Rejected] {
            assert!(is_terminal_proposal(status));
            for action in ALL_ACTIONS {
                assert!(next_proposal_status(status, action).is_err());
            }
        }
    }

    #[test]
    fn test_apply_requires_accepted() {
        let err = next_proposal_status(ProposalStatus::Pending, ProposalAction::Apply).unwrap_err();
        assert_eq!(err.to_string(), "cannot apply a proposal in state 'pending'");
    }

    #[test]
    fn test_discard_rules() {
        assert!(check_discard(ProposalStatus::Pending).is_ok());
        assert!(check_discard(ProposalStatus::Rejected).is_ok());
        assert!(check_discard(ProposalStatus::Stale).is_ok());
        assert!(check_discard(ProposalStatus::Accepted).is_err());
        assert!(check_discard(ProposalStatus::Applied).is_err());
    }

    #[test]
    fn test_run_transitions() {
        assert!(check_run_transition(RunStatus::Pending, RunStatus::Running).is_ok());
        assert!(check_run_transition(RunStatus::Pending, RunStatus::Failed).is_ok());
        assert!(check_run_transition(RunStatus::Running, RunStatus::Completed).is_ok());
        assert!(check_run_transition(RunStatus::Running, RunStatus::Failed).is_ok());
        assert!(check_run_transition(RunStatus::Pending, RunStatus::Completed).is_err());
        assert!(check_run_transition(RunStatus::Completed, RunStatus::Failed).is_err());
        assert!(check_run_transition(RunStatus::Failed, RunStatus::Running).is_err());
        assert!(is_terminal_run(RunStatus::Failed));
        assert!(!is_terminal_run(RunStatus::Running));
    }

    #[test]
    fn test_action_parse() {
        assert_eq!("Accept".parse::<ProposalAction>().unwrap(), ProposalAction::Accept);
        assert!("approve".parse::<ProposalAction>().is_err());
    }
}

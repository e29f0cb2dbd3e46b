//! Node-instance and process-instance states.
//!
//! The transition table lives in [`NodeInstanceState::can_transition_to`];
//! every state change in the engine goes through it.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeInstanceState {
    Pending,
    /// Sending failed; waiting for the host to retry.
    FailRetry,
    Sent,
    Acknowledged,
    /// A user accepted the task.
    Taken,
    Started,
    Complete,
    Failed,
    Cancelled,
    /// Not run because its condition did not hold or a sibling won.
    Skipped,
    /// Not run because an upstream node was cancelled.
    SkippedCancel,
    /// Not run because an upstream node failed.
    SkippedFail,
    /// Not run because its condition could not be evaluated.
    SkippedInvalidated,
}

impl NodeInstanceState {
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Sent | Self::Acknowledged | Self::Taken | Self::Started
        )
    }

    pub fn is_final(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled) || self.is_skipped()
    }

    pub fn is_skipped(self) -> bool {
        matches!(
            self,
            Self::Skipped | Self::SkippedCancel | Self::SkippedFail | Self::SkippedInvalidated
        )
    }

    /// Whether a user or the engine has committed to doing the work.
    pub fn is_committed(self) -> bool {
        matches!(self, Self::Taken | Self::Started | Self::Complete | Self::Failed)
    }

    pub fn can_restart(self) -> bool {
        matches!(self, Self::Pending | Self::FailRetry)
    }

    pub fn can_transition_to(self, next: NodeInstanceState) -> bool {
        use NodeInstanceState::*;
        if self.is_final() {
            return false;
        }
        if next.is_skipped() {
            return true;
        }
        matches!(
            (self, next),
            (Pending, Sent | FailRetry)
                | (FailRetry, Sent | FailRetry)
                | (Sent, Acknowledged | Failed | Cancelled)
                | (Acknowledged, Taken | Cancelled | Failed)
                | (Taken, Started | Cancelled | Failed)
                | (Started, Complete | Failed | Cancelled)
        )
    }

    /// The skip state successors inherit from a predecessor that ended in
    /// `self` without completing. `None` for states that do not propagate a
    /// cause.
    pub fn skip_cause(self) -> Option<NodeInstanceState> {
        match self {
            Self::Failed | Self::SkippedFail => Some(Self::SkippedFail),
            Self::Cancelled | Self::SkippedCancel => Some(Self::SkippedCancel),
            Self::SkippedInvalidated => Some(Self::SkippedInvalidated),
            Self::Skipped => Some(Self::Skipped),
            _ => None,
        }
    }

    fn skip_rank(self) -> u8 {
        match self {
            Self::SkippedFail => 3,
            Self::SkippedCancel => 2,
            Self::SkippedInvalidated => 1,
            _ => 0,
        }
    }

    /// The dominant skip cause among predecessor outcomes:
    /// fail, then cancel, then invalidated, then plain skip.
    pub fn dominant_skip<I: IntoIterator<Item = NodeInstanceState>>(states: I) -> NodeInstanceState {
        states
            .into_iter()
            .filter_map(Self::skip_cause)
            .max_by_key(|s| s.skip_rank())
            .unwrap_or(Self::Skipped)
    }
}

impl fmt::Display for NodeInstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::FailRetry => "fail_retry",
            Self::Sent => "sent",
            Self::Acknowledged => "acknowledged",
            Self::Taken => "taken",
            Self::Started => "started",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Skipped => "skipped",
            Self::SkippedCancel => "skipped_cancel",
            Self::SkippedFail => "skipped_fail",
            Self::SkippedInvalidated => "skipped_invalidated",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Initialized,
    Started,
    Finished,
    Cancelled,
    Failed,
}

impl InstanceState {
    pub fn is_final(self) -> bool {
        matches!(self, Self::Finished | Self::Cancelled | Self::Failed)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initialized => "initialized",
            Self::Started => "started",
            Self::Finished => "finished",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::NodeInstanceState::*;
    use super::*;

    const ALL: [NodeInstanceState; 13] = [
        Pending, FailRetry, Sent, Acknowledged, Taken, Started, Complete, Failed, Cancelled, Skipped,
        SkippedCancel, SkippedFail, SkippedInvalidated,
    ];

    #[test]
    fn classification_table() {
        let active: Vec<_> = ALL.iter().copied().filter(|s| s.is_active()).collect();
        assert_eq!(active, vec![Pending, Sent, Acknowledged, Taken, Started]);

        let committed: Vec<_> = ALL.iter().copied().filter(|s| s.is_committed()).collect();
        assert_eq!(committed, vec![Taken, Started, Complete, Failed]);

        let restartable: Vec<_> = ALL.iter().copied().filter(|s| s.can_restart()).collect();
        assert_eq!(restartable, vec![Pending, FailRetry]);

        assert!(!FailRetry.is_active() && !FailRetry.is_final());
        for s in [Skipped, SkippedCancel, SkippedFail, SkippedInvalidated] {
            assert!(s.is_final() && s.is_skipped() && !s.is_committed());
        }
    }

    #[test]
    fn final_states_never_transition() {
        for from in ALL.iter().copied().filter(|s| s.is_final()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be illegal");
            }
        }
    }

    #[test]
    fn forward_chain_is_legal() {
        let chain = [Pending, Sent, Acknowledged, Taken, Started, Complete];
        for pair in chain.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
        assert!(!Pending.can_transition_to(Complete));
        assert!(!Started.can_transition_to(Sent));
        assert!(FailRetry.can_transition_to(FailRetry));
        assert!(!Pending.can_transition_to(Cancelled));
    }

    #[test]
    fn any_open_state_may_be_skipped() {
        for from in ALL.iter().copied().filter(|s| !s.is_final()) {
            assert!(from.can_transition_to(SkippedCancel));
            assert!(from.can_transition_to(SkippedInvalidated));
        }
    }

    #[test]
    fn skip_precedence() {
        assert_eq!(NodeInstanceState::dominant_skip([Skipped, Cancelled, Failed]), SkippedFail);
        assert_eq!(NodeInstanceState::dominant_skip([SkippedInvalidated, SkippedCancel]), SkippedCancel);
        assert_eq!(NodeInstanceState::dominant_skip([Skipped, SkippedInvalidated]), SkippedInvalidated);
        assert_eq!(NodeInstanceState::dominant_skip([Complete]), Skipped);
        assert_eq!(NodeInstanceState::dominant_skip([]), Skipped);
    }
}

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};
use tracing::trace;

use crate::errors::ServiceError;

/// Stages a usage submission moves through.
///
/// A plain commit walks `New -> Previewed -> Committed`. An edit starts from
/// `Committed` and walks `EditRequested -> Restored -> Recommitted`; a delete
/// stops at `Restored`. A recommitted transaction can be edited again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum UsageLifecycle {
    New,
    Previewed,
    Committed,
    EditRequested,
    Restored,
    Recommitted,
}

impl UsageLifecycle {
    pub fn can_transition_to(self, next: UsageLifecycle) -> bool {
        use UsageLifecycle::*;
        matches!(
            (self, next),
            (New, Previewed)
                | (Previewed, Committed)
                | (Committed, EditRequested)
                | (Recommitted, EditRequested)
                | (EditRequested, Restored)
                | (Restored, Recommitted)
        )
    }

    pub fn transition(self, next: UsageLifecycle) -> Result<UsageLifecycle, ServiceError> {
        if self.can_transition_to(next) {
            trace!(from = %self, to = %next, "usage lifecycle transition");
            Ok(next)
        } else {
            Err(ServiceError::InvalidStateTransition(format!(
                "cannot move usage from {} to {}",
                self, next
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::UsageLifecycle::*;
    use super::*;
    use assert_matches::assert_matches;
    use rstest::rstest;

    #[test]
    fn commit_and_edit_paths_are_allowed() {
        let state = New
            .transition(Previewed)
            .and_then(|s| s.transition(Committed))
            .and_then(|s| s.transition(EditRequested))
            .and_then(|s| s.transition(Restored))
            .and_then(|s| s.transition(Recommitted))
            .and_then(|s| s.transition(EditRequested));
        assert_eq!(state.unwrap(), EditRequested);
    }

    #[rstest]
    #[case(New, Committed)]
    #[case(Committed, Restored)]
    #[case(Restored, Committed)]
    #[case(Recommitted, Previewed)]
    #[case(EditRequested, Recommitted)]
    fn illegal_transitions_fail(#[case] from: UsageLifecycle, #[case] to: UsageLifecycle) {
        assert!(!from.can_transition_to(to));
        assert_matches!(from.transition(to), Err(ServiceError::InvalidStateTransition(_)));
    }

    #[test]
    fn displays_in_screaming_case() {
        assert_eq!(EditRequested.to_string(), "EDIT_REQUESTED");
    }
}

//! Notification status state machine.
//!
//! ```text
//! pending ──► sent ──► read ──► acknowledged
//!   │  ▲        │ └──────────────► acknowledged
//!   ▼  │        ▼
//! failed     escalated
//! ```
//!
//! `failed → pending` (manual retry) is the only backward edge.

use crate::db::DatabaseError;
use crate::models::enums::NotificationStatus;

use NotificationStatus::*;

const EDGES: &[(NotificationStatus, NotificationStatus)] = &[
    (Pending, Sent),
    (Pending, Failed),
    (Failed, Pending),
    (Sent, Read),
    (Sent, Acknowledged),
    (Read, Acknowledged),
    (Sent, Escalated),
];

pub fn can_transition(from: NotificationStatus, to: NotificationStatus) -> bool {
    EDGES.contains(&(from, to))
}

/// Reject any move not on the graph.
pub fn ensure_transition(
    from: NotificationStatus,
    to: NotificationStatus,
) -> Result<(), DatabaseError> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(DatabaseError::InvalidTransition {
            from: from.as_str().into(),
            to: to.as_str().into(),
        })
    }
}

/// States a notification may move to from `from`.
pub fn successors(from: NotificationStatus) -> impl Iterator<Item = NotificationStatus> {
    EDGES
        .iter()
        .filter(move |(f, _)| *f == from)
        .map(|(_, t)| *t)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_edges_allowed() {
        assert!(can_transition(Pending, Sent));
        assert!(can_transition(Sent, Read));
        assert!(can_transition(Read, Acknowledged));
        assert!(can_transition(Sent, Escalated));
        assert!(can_transition(Pending, Failed));
    }

    #[test]
    fn only_backward_edge_is_retry() {
        assert!(can_transition(Failed, Pending));
        for from in NotificationStatus::ALL {
            for to in NotificationStatus::ALL {
                if can_transition(from, to) && to == Pending {
                    assert_eq!(from, Failed);
                }
            }
        }
    }

    #[test]
    fn terminal_states_have_no_successors() {
        for status in NotificationStatus::ALL {
            assert_eq!(
                successors(status).next().is_none(),
                status.is_terminal(),
                "{status}"
            );
        }
    }

    #[test]
    fn backward_moves_rejected() {
        for (from, to) in [
            (Acknowledged, Pending),
            (Read, Sent),
            (Sent, Pending),
            (Escalated, Sent),
            (Acknowledged, Read),
        ] {
            let err = ensure_transition(from, to).unwrap_err();
            assert!(matches!(err, DatabaseError::InvalidTransition { .. }));
        }
    }

    #[test]
    fn self_loops_rejected() {
        for status in NotificationStatus::ALL {
            assert!(!can_transition(status, status));
        }
    }
}

//! Broadcast lifecycle transition table

use mailcast_common::{Error, Result};
use mailcast_storage::models::BroadcastStatus;

/// Legal (from, to) edges of the broadcast lifecycle
const TRANSITIONS: &[(BroadcastStatus, BroadcastStatus)] = &[
    (BroadcastStatus::Draft, BroadcastStatus::Scheduled),
    (BroadcastStatus::Scheduled, BroadcastStatus::Sending),
    (BroadcastStatus::Sending, BroadcastStatus::Paused),
    (BroadcastStatus::Paused, BroadcastStatus::Sending),
    (BroadcastStatus::Sending, BroadcastStatus::Sent),
    (BroadcastStatus::Draft, BroadcastStatus::Cancelled),
    (BroadcastStatus::Scheduled, BroadcastStatus::Cancelled),
    (BroadcastStatus::Sending, BroadcastStatus::Cancelled),
    (BroadcastStatus::Paused, BroadcastStatus::Cancelled),
    (BroadcastStatus::Sending, BroadcastStatus::Failed),
];

/// Whether `from -> to` is an edge of the lifecycle
pub fn can_transition(from: BroadcastStatus, to: BroadcastStatus) -> bool {
    TRANSITIONS.contains(&(from, to))
}

/// Reject anything that is not an edge of the lifecycle
pub fn ensure_transition(from: BroadcastStatus, to: BroadcastStatus) -> Result<()> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(Error::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_have_no_exits() {
        for from in [
            BroadcastStatus::Sent,
            BroadcastStatus::Cancelled,
            BroadcastStatus::Failed,
        ] {
            for to in BroadcastStatus::ALL {
                assert!(!can_transition(from, to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_sent_to_sending_rejected() {
        let err = ensure_transition(BroadcastStatus::Sent, BroadcastStatus::Sending).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition { ref from, ref to } if from == "sent" && to == "sending"
        ));
    }

    #[test]
    fn test_edge_count() {
        let legal = BroadcastStatus::ALL
            .iter()
            .flat_map(|from| BroadcastStatus::ALL.iter().map(move |to| (*from, *to)))
            .filter(|(from, to)| can_transition(*from, *to))
            .count();
        assert_eq!(legal, 10);
    }

    #[test]
    fn test_pause_resume_cycle() {
        assert!(can_transition(BroadcastStatus::Sending, BroadcastStatus::Paused));
        assert!(can_transition(BroadcastStatus::Paused, BroadcastStatus::Sending));
        assert!(!can_transition(BroadcastStatus::Paused, BroadcastStatus::Sent));
        assert!(!can_transition(BroadcastStatus::Scheduled, BroadcastStatus::Paused));
    }
}

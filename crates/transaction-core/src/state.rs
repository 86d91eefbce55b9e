//! Transaction kinds, states and the transition validator.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::{Error, Result};

/// The four transaction state machines of RFC 3261 Section 17.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionKind {
    /// Client transaction for INVITE (Section 17.1.1)
    InviteClient,
    /// Client transaction for everything else (Section 17.1.2)
    NonInviteClient,
    /// Server transaction for INVITE (Section 17.2.1)
    InviteServer,
    /// Server transaction for everything else (Section 17.2.2)
    NonInviteServer,
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionKind::InviteClient => "InviteClient",
            TransactionKind::NonInviteClient => "NonInviteClient",
            TransactionKind::InviteServer => "InviteServer",
            TransactionKind::NonInviteServer => "NonInviteServer",
        };
        f.write_str(name)
    }
}

/// The states a transaction can be in. Which subset applies depends on the
/// [`TransactionKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    /// Created, not yet started
    Initial,
    /// INVITE client: request sent, nothing heard yet
    Calling,
    /// Non-INVITE: request sent (client) or received (server)
    Trying,
    /// A provisional response has been exchanged
    Proceeding,
    /// A final response has been exchanged
    Completed,
    /// INVITE server only: ACK received for a non-2xx final
    Confirmed,
    /// Terminal state; the transaction is being torn down
    Terminated,
}

/// Thread-safe state holder shared between a transaction's event loop and
/// readers elsewhere.
#[derive(Debug)]
pub struct AtomicTransactionState(AtomicU8);

impl AtomicTransactionState {
    /// Creates a holder in the given state.
    pub fn new(state: TransactionState) -> Self {
        Self(AtomicU8::new(encode(state)))
    }

    /// Current state.
    pub fn get(&self) -> TransactionState {
        decode(self.0.load(Ordering::Acquire))
    }

    /// Stores a new state, returning the previous one.
    pub fn set(&self, state: TransactionState) -> TransactionState {
        decode(self.0.swap(encode(state), Ordering::AcqRel))
    }
}

fn encode(state: TransactionState) -> u8 {
    match state {
        TransactionState::Initial => 0,
        TransactionState::Calling => 1,
        TransactionState::Trying => 2,
        TransactionState::Proceeding => 3,
        TransactionState::Completed => 4,
        TransactionState::Confirmed => 5,
        TransactionState::Terminated => 6,
    }
}

fn decode(value: u8) -> TransactionState {
    match value {
        0 => TransactionState::Initial,
        1 => TransactionState::Calling,
        2 => TransactionState::Trying,
        3 => TransactionState::Proceeding,
        4 => TransactionState::Completed,
        5 => TransactionState::Confirmed,
        _ => TransactionState::Terminated,
    }
}

/// Validates a state transition for the given transaction kind.
///
/// Any non-terminal state may transition to `Terminated` (timeouts,
/// transport errors and forced termination can strike at any time); the
/// remaining edges follow the per-kind diagrams of RFC 3261 Section 17.
pub fn validate_transition(
    kind: TransactionKind,
    from: TransactionState,
    to: TransactionState,
) -> Result<()> {
    use TransactionState::*;

    if from == Terminated {
        return Err(invalid(kind, from, to));
    }
    if to == Terminated {
        return Ok(());
    }

    let allowed = match kind {
        TransactionKind::InviteClient => matches!(
            (from, to),
            (Initial, Calling) | (Calling, Proceeding) | (Calling, Completed) | (Proceeding, Completed)
        ),
        TransactionKind::NonInviteClient => matches!(
            (from, to),
            (Initial, Trying) | (Trying, Proceeding) | (Trying, Completed) | (Proceeding, Completed)
        ),
        TransactionKind::InviteServer => matches!(
            (from, to),
            (Initial, Proceeding) | (Proceeding, Completed) | (Completed, Confirmed)
        ),
        TransactionKind::NonInviteServer => matches!(
            (from, to),
            (Initial, Trying) | (Trying, Proceeding) | (Trying, Completed) | (Proceeding, Completed)
        ),
    };

    if allowed {
        Ok(())
    } else {
        Err(invalid(kind, from, to))
    }
}

fn invalid(kind: TransactionKind, from: TransactionState, to: TransactionState) -> Error {
    Error::TransactionGone(format!(
        "invalid {} transition {:?} -> {:?}",
        kind, from, to
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use TransactionState::*;

    #[test]
    fn atomic_state_set_returns_previous() {
        let state = AtomicTransactionState::new(Initial);
        assert_eq!(state.get(), Initial);
        assert_eq!(state.set(Calling), Initial);
        assert_eq!(state.get(), Calling);
    }

    #[test]
    fn invite_client_transitions() {
        let kind = TransactionKind::InviteClient;
        assert!(validate_transition(kind, Initial, Calling).is_ok());
        assert!(validate_transition(kind, Calling, Proceeding).is_ok());
        assert!(validate_transition(kind, Calling, Completed).is_ok());
        assert!(validate_transition(kind, Proceeding, Completed).is_ok());
        // 2xx terminates directly.
        assert!(validate_transition(kind, Calling, Terminated).is_ok());
        assert!(validate_transition(kind, Proceeding, Terminated).is_ok());

        assert!(validate_transition(kind, Initial, Trying).is_err());
        assert!(validate_transition(kind, Completed, Proceeding).is_err());
    }

    #[test]
    fn invite_server_transitions() {
        let kind = TransactionKind::InviteServer;
        assert!(validate_transition(kind, Initial, Proceeding).is_ok());
        assert!(validate_transition(kind, Proceeding, Completed).is_ok());
        assert!(validate_transition(kind, Completed, Confirmed).is_ok());
        assert!(validate_transition(kind, Confirmed, Terminated).is_ok());

        assert!(validate_transition(kind, Proceeding, Confirmed).is_err());
        assert!(validate_transition(kind, Initial, Trying).is_err());
    }

    #[test]
    fn non_invite_transitions() {
        for kind in [
            TransactionKind::NonInviteClient,
            TransactionKind::NonInviteServer,
        ] {
            assert!(validate_transition(kind, Initial, Trying).is_ok());
            assert!(validate_transition(kind, Trying, Proceeding).is_ok());
            assert!(validate_transition(kind, Trying, Completed).is_ok());
            assert!(validate_transition(kind, Proceeding, Completed).is_ok());
            assert!(validate_transition(kind, Trying, Confirmed).is_err());
        }
    }

    #[test]
    fn terminated_is_sticky() {
        assert!(validate_transition(
            TransactionKind::InviteClient,
            Terminated,
            Calling
        )
        .is_err());
        assert!(validate_transition(
            TransactionKind::InviteClient,
            Terminated,
            Terminated
        )
        .is_err());
    }
}

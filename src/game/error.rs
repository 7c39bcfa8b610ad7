//! Game rule errors
//!
//! Every failed operation on a session leaves its state untouched and
//! reports one of these.

use crate::game::state::ParticipantId;

/// A move or membership change that the rules do not allow
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Violation {
    #[error("game has not started yet")]
    NotStarted,
    #[error("game is already over")]
    GameOver,
    #[error("it is not this participant's turn")]
    NotYourTurn,
    #[error("participant is no longer active")]
    ParticipantInactive,
    #[error("session is full")]
    SessionFull,
    #[error("participant already in session")]
    DuplicateParticipant,
    #[error("not enough participants to start")]
    NotEnoughParticipants,
}

/// Session state errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GameError {
    #[error("{0}")]
    RuleViolation(#[from] Violation),
    #[error("participant {0} not found")]
    ParticipantNotFound(ParticipantId),
    #[error("invariant breach: {0}")]
    InvariantBreach(String),
}

impl GameError {
    /// The violated rule, if this is a rule violation
    pub fn violation(&self) -> Option<Violation> {
        match self {
            GameError::RuleViolation(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_rule_violation(&self) -> bool {
        matches!(self, GameError::RuleViolation(_))
    }
}

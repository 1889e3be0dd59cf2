use thiserror::Error;

pub type Result<T> = std::result::Result<T, RaffleError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RaffleError {
    #[error("Insufficient balance")]
    InsufficientBalance,
    #[error("Room is not joinable")]
    RoomNotJoinable,
    #[error("Room is paused")]
    RoomPaused,
    #[error("Already joined this round")]
    AlreadyJoined,
    #[error("Not a participant of the current round")]
    NotAParticipant,
    #[error("Round has no participants")]
    NoParticipants,
    #[error("Not enough participants")]
    NotEnoughParticipants,
    #[error("Room not found")]
    RoomNotFound,
    #[error("Round not found")]
    RoundNotFound,
    #[error("Round already completed")]
    RoundAlreadyCompleted,
    #[error("Invalid room config: {0}")]
    InvalidRoomConfig(String),
    #[error("Unknown connection")]
    UnknownConnection,
    #[error("Winner processing failed: {0}")]
    ProcessingFailed(String),
    #[error("Delivery failed: {0}")]
    DeliveryFailed(String),
}

/// Guard clause macro: bail out with the given error when the condition fails.
macro_rules! ensure {
    ($cond:expr, $err:expr) => {
        if !($cond) {
            return Err($err);
        }
    };
}
pub(crate) use ensure;

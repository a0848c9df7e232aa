use ulid::Ulid;

use crate::calendar::Rejection;
use crate::lifecycle::Denied;
use crate::model::BookingStatus;

#[derive(Debug)]
pub enum EngineError {
    /// What kind of record was missing, and its id.
    NotFound(&'static str, Ulid),
    AlreadyExists(Ulid),
    /// A calendar rule refused the interval.
    Rejected(Rejection),
    /// The slot overlaps this active booking.
    SlotTaken(Ulid),
    Forbidden,
    InvalidTransition {
        from: BookingStatus,
        to: BookingStatus,
    },
    Invalid(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Low-cardinality label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            EngineError::NotFound(..) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::Rejected(r) => r.code(),
            EngineError::SlotTaken(_) => "slot_taken",
            EngineError::Forbidden => "forbidden",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::Invalid(_) => "invalid",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal_error",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(what, id) => write!(f, "{what} not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Rejected(r) => write!(f, "{r}"),
            EngineError::SlotTaken(id) => {
                write!(f, "SLOT_TAKEN: time slot already booked (conflicts with {id})")
            }
            EngineError::Forbidden => write!(f, "FORBIDDEN: not permitted for this user"),
            EngineError::InvalidTransition { from, to } => {
                write!(f, "INVALID_TRANSITION: cannot move booking from {from} to {to}")
            }
            EngineError::Invalid(msg) => write!(f, "invalid request: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<Rejection> for EngineError {
    fn from(r: Rejection) -> Self {
        EngineError::Rejected(r)
    }
}

impl From<Denied> for EngineError {
    fn from(d: Denied) -> Self {
        match d {
            Denied::Forbidden => EngineError::Forbidden,
            Denied::InvalidTransition { from, to } => EngineError::InvalidTransition { from, to },
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::WalError(e.to_string())
    }
}

use ulid::Ulid;

use crate::model::HoldStatus;

/// Which uniqueness constraint rejected a hold insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Duplicate {
    IdempotencyKey,
    ActiveHolder,
}

/// Why a conditional hold transition matched no row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mismatch {
    Status(HoldStatus),
    Holder,
    Expired,
    NotLapsed,
}

#[derive(Debug)]
pub enum StoreError {
    EventNotFound(Ulid),
    HoldNotFound(Ulid),
    SoldOut(Ulid),
    Duplicate(Duplicate),
    /// The store already holds its maximum number of events.
    TooManyEvents(usize),
    NoMatchingRow { id: Ulid, reason: Mismatch },
    InvariantViolation(String),
    WalError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::EventNotFound(id) => write!(f, "event not found: {id}"),
            StoreError::HoldNotFound(id) => write!(f, "hold not found: {id}"),
            StoreError::SoldOut(id) => write!(f, "event {id} is sold out"),
            StoreError::Duplicate(Duplicate::IdempotencyKey) => {
                write!(f, "idempotency key already used")
            }
            StoreError::Duplicate(Duplicate::ActiveHolder) => {
                write!(f, "holder already has an active hold for this event")
            }
            StoreError::TooManyEvents(max) => write!(f, "event limit of {max} reached"),
            StoreError::NoMatchingRow { id, reason } => {
                write!(f, "no matching row for hold {id}: {reason:?}")
            }
            StoreError::InvariantViolation(msg) => write!(f, "invariant violation: {msg}"),
            StoreError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

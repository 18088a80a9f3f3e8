use ulid::Ulid;

use crate::model::HoldStatus;
use crate::store::{Duplicate, Mismatch, StoreError};

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    SoldOut(Ulid),
    AlreadyRegistered(Duplicate),
    Expired(Ulid),
    WrongHolder(Ulid),
    NotPending { id: Ulid, status: HoldStatus },
    InvalidInput(&'static str),
    LimitExceeded(&'static str),
    TransientStore(String),
    InvariantViolation(String),
}

impl EngineError {
    /// Business outcomes a transport reports as a conflict rather than a fault.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            EngineError::SoldOut(_)
                | EngineError::AlreadyRegistered(_)
                | EngineError::Expired(_)
                | EngineError::WrongHolder(_)
                | EngineError::NotPending { .. }
        )
    }

    /// The whole unit may be retried as-is; nothing was applied.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::TransientStore(_))
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::EventNotFound(id) | StoreError::HoldNotFound(id) => EngineError::NotFound(id),
            StoreError::SoldOut(id) => EngineError::SoldOut(id),
            StoreError::Duplicate(duplicate) => EngineError::AlreadyRegistered(duplicate),
            StoreError::TooManyEvents(_) => EngineError::LimitExceeded("too many events"),
            StoreError::NoMatchingRow { id, reason } => match reason {
                Mismatch::Holder => EngineError::WrongHolder(id),
                Mismatch::Expired => EngineError::Expired(id),
                Mismatch::Status(status) => EngineError::NotPending { id, status },
                // Only the reclaimer asks for lapsed holds, and a hold never un-lapses.
                Mismatch::NotLapsed => EngineError::NotPending { id, status: HoldStatus::Pending },
            },
            StoreError::InvariantViolation(msg) => EngineError::InvariantViolation(msg),
            StoreError::WalError(msg) => EngineError::TransientStore(msg),
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::SoldOut(id) => write!(f, "event {id} is sold out"),
            EngineError::AlreadyRegistered(Duplicate::IdempotencyKey) => {
                write!(f, "request already processed")
            }
            EngineError::AlreadyRegistered(Duplicate::ActiveHolder) => {
                write!(f, "holder already registered for this event")
            }
            EngineError::Expired(id) => write!(f, "hold {id} has expired"),
            EngineError::WrongHolder(id) => write!(f, "hold {id} belongs to another holder"),
            EngineError::NotPending { id, status } => {
                write!(f, "hold {id} is {status}, not pending")
            }
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::TransientStore(e) => write!(f, "store unavailable: {e}"),
            EngineError::InvariantViolation(msg) => write!(f, "invariant violation: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}

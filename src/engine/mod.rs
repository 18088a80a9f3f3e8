mod error;
mod mutations;
mod queries;
mod reclaim;
#[cfg(test)]
mod tests;

pub use error::EngineError;

use std::path::PathBuf;
use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::limits::*;
use crate::model::Ms;
use crate::store::Store;

/// The reservation engine: every register/confirm/cancel/reclaim is one
/// atomic unit against the store. The engine itself keeps no lock; all
/// serialization happens inside the store's units.
pub struct Engine {
    store: Store,
    clock: Arc<dyn Clock>,
    hold_duration: Ms,
}

impl Engine {
    /// Open (or replay) the store at `wal_path`. Must be called from within
    /// a tokio runtime. `hold_duration` must lie in `1..=MAX_HOLD_DURATION_MS`.
    pub fn new(wal_path: PathBuf, hold_duration: Ms, clock: Arc<dyn Clock>) -> std::io::Result<Self> {
        if !(1..=MAX_HOLD_DURATION_MS).contains(&hold_duration) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("hold duration {hold_duration}ms out of range"),
            ));
        }
        let store = Store::open(wal_path)?;
        metrics::gauge!(crate::observability::EVENTS_ACTIVE).set(store.event_count() as f64);
        Ok(Self {
            store,
            clock,
            hold_duration,
        })
    }

    pub fn with_system_clock(wal_path: PathBuf, hold_duration: Ms) -> std::io::Result<Self> {
        Self::new(wal_path, hold_duration, Arc::new(SystemClock))
    }

    pub fn now_ms(&self) -> Ms {
        self.clock.now_ms()
    }

    pub fn hold_duration(&self) -> Ms {
        self.hold_duration
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        self.store.wal_appends_since_compact().await
    }

    /// Compact the WAL down to the records that recreate current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        self.store.compact().await?;
        Ok(())
    }

    /// Flush every unit already handed to the WAL writer and stop it. Units
    /// started afterwards fail with `TransientStore`.
    pub async fn shutdown(&self) {
        self.store.shutdown().await;
    }
}

fn validate_text(value: &str, max_len: usize, what: &'static str) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::InvalidInput(what));
    }
    if value.len() > max_len {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

fn validate_name(name: &str) -> Result<(), EngineError> {
    validate_text(name, MAX_NAME_LEN, "event name")
}

fn validate_holder(holder: &str) -> Result<(), EngineError> {
    validate_text(holder, MAX_HOLDER_LEN, "holder identity")
}

fn validate_idempotency_key(key: &str) -> Result<(), EngineError> {
    validate_text(key, MAX_IDEMPOTENCY_KEY_LEN, "idempotency key")
}

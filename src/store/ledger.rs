//! The capacity ledger: a per-event counter with a conditional decrement.
//!
//! Both operations report rows affected, like
//! `UPDATE events SET available = available - 1 WHERE id = ? AND available > 0`.
//! The check and the write happen under the event's exclusive lock, so no
//! caller ever acts on a stale read of the counter.

use crate::model::{EventState, Record};

use super::{StoreError, Txn};

impl EventState {
    /// Take one unit if any is left. Returns rows affected (0 or 1).
    pub(crate) fn consume_unit(&mut self) -> u64 {
        if self.available_capacity == 0 {
            return 0;
        }
        self.available_capacity -= 1;
        1
    }

    /// Return one unit unless the counter is already at its ceiling.
    /// Returns rows affected (0 or 1).
    pub(crate) fn release_unit(&mut self) -> u64 {
        if self.available_capacity >= self.total_capacity {
            return 0;
        }
        self.available_capacity += 1;
        1
    }
}

impl Txn<'_> {
    /// Consume one unit of the event's capacity or report `SoldOut`.
    pub fn try_consume(&mut self) -> Result<(), StoreError> {
        let event_id = self.event_id();
        if self.state.consume_unit() == 0 {
            return Err(StoreError::SoldOut(event_id));
        }
        self.stage(Record::CapacityConsumed { event_id });
        Ok(())
    }

    /// Return one unit. Going above total capacity means a hold was released
    /// twice or never consumed for, and is never clamped away.
    pub fn release(&mut self) -> Result<(), StoreError> {
        let event_id = self.event_id();
        if self.state.release_unit() == 0 {
            tracing::error!(%event_id, "release would exceed total capacity");
            metrics::counter!(crate::observability::INVARIANT_VIOLATIONS_TOTAL).increment(1);
            return Err(StoreError::InvariantViolation(format!(
                "event {event_id} released above total capacity {}",
                self.state.total_capacity
            )));
        }
        self.stage(Record::CapacityReleased { event_id });
        Ok(())
    }
}

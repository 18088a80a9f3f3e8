use std::time::Instant;

use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::MAX_EVENTS;
use crate::model::*;
use crate::observability::{
    outcome_label, CANCELLATIONS_TOTAL, CONFIRMATIONS_TOTAL, EVENTS_ACTIVE, REGISTRATIONS_TOTAL,
    UNIT_DURATION_SECONDS,
};
use crate::store::{Expiry, HoldGuard};

use super::{validate_holder, validate_idempotency_key, validate_name, Engine, EngineError};

impl Engine {
    pub async fn create_event(&self, name: &str, total_capacity: u32) -> Result<EventInfo, EngineError> {
        validate_name(name)?;
        if total_capacity == 0 {
            return Err(EngineError::InvalidInput("total capacity must be positive"));
        }

        let info = self
            .store
            .create_event(Ulid::new(), name.to_string(), total_capacity, MAX_EVENTS)
            .await?;
        metrics::gauge!(EVENTS_ACTIVE).set(self.store.event_count() as f64);
        info!(event_id = %info.id, total_capacity, "event created");
        Ok(info)
    }

    /// Take one unit of `event_id`'s capacity and place a pending hold on it.
    ///
    /// The decrement and the insert commit together or not at all: a
    /// duplicate key or holder aborts the unit, giving the unit back.
    pub async fn register(
        &self,
        event_id: Ulid,
        holder: &str,
        idempotency_key: &str,
    ) -> Result<Ulid, EngineError> {
        let start = Instant::now();
        let result = self.register_unit(event_id, holder, idempotency_key).await;
        metrics::histogram!(UNIT_DURATION_SECONDS, "operation" => "register")
            .record(start.elapsed().as_secs_f64());
        metrics::counter!(REGISTRATIONS_TOTAL, "outcome" => outcome_label(&result)).increment(1);
        match &result {
            Ok(hold_id) => debug!(%event_id, %hold_id, holder, "hold placed"),
            Err(e) => debug!(%event_id, holder, "register rejected: {e}"),
        }
        result
    }

    async fn register_unit(
        &self,
        event_id: Ulid,
        holder: &str,
        idempotency_key: &str,
    ) -> Result<Ulid, EngineError> {
        validate_holder(holder)?;
        validate_idempotency_key(idempotency_key)?;

        let mut txn = self.store.begin(event_id).await?;
        txn.try_consume()?;

        let now = self.clock.now_ms();
        let expires_at = now
            .checked_add(self.hold_duration)
            .ok_or(EngineError::LimitExceeded("hold deadline"))?;
        let hold = Hold::pending(Ulid::new(), event_id, holder, idempotency_key, now, expires_at);
        let hold_id = hold.id;
        txn.insert_hold(hold)?;
        txn.commit().await?;
        Ok(hold_id)
    }

    /// Finalize a pending hold. Only the holder may confirm, and only before
    /// the deadline.
    pub async fn confirm(&self, hold_id: Ulid, holder: &str) -> Result<(), EngineError> {
        let start = Instant::now();
        let result = self.confirm_unit(hold_id, holder).await;
        metrics::histogram!(UNIT_DURATION_SECONDS, "operation" => "confirm")
            .record(start.elapsed().as_secs_f64());
        metrics::counter!(CONFIRMATIONS_TOTAL, "outcome" => outcome_label(&result)).increment(1);
        match &result {
            Ok(()) => debug!(%hold_id, holder, "hold finalized"),
            Err(e) => debug!(%hold_id, holder, "confirm rejected: {e}"),
        }
        result
    }

    async fn confirm_unit(&self, hold_id: Ulid, holder: &str) -> Result<(), EngineError> {
        validate_holder(holder)?;
        let mut txn = self.store.begin_for_hold(hold_id).await?;
        let now = self.clock.now_ms();
        let guard = HoldGuard {
            holder: Some(holder),
            expiry: Some(Expiry::LiveAt(now)),
        };
        txn.transition_hold(hold_id, HoldStatus::Pending, HoldStatus::Finalized, guard)?;
        txn.commit().await?;
        Ok(())
    }

    /// Give a pending hold back before its deadline. Finalized holds stay
    /// finalized.
    pub async fn cancel(&self, hold_id: Ulid, holder: &str) -> Result<(), EngineError> {
        let start = Instant::now();
        let result = self.cancel_unit(hold_id, holder).await;
        metrics::histogram!(UNIT_DURATION_SECONDS, "operation" => "cancel")
            .record(start.elapsed().as_secs_f64());
        metrics::counter!(CANCELLATIONS_TOTAL, "outcome" => outcome_label(&result)).increment(1);
        match &result {
            Ok(()) => debug!(%hold_id, holder, "hold cancelled"),
            Err(e) => debug!(%hold_id, holder, "cancel rejected: {e}"),
        }
        result
    }

    async fn cancel_unit(&self, hold_id: Ulid, holder: &str) -> Result<(), EngineError> {
        validate_holder(holder)?;
        let mut txn = self.store.begin_for_hold(hold_id).await?;
        let guard = HoldGuard {
            holder: Some(holder),
            expiry: None,
        };
        txn.transition_hold(hold_id, HoldStatus::Pending, HoldStatus::Released, guard)?;
        txn.release()?;
        txn.commit().await?;
        Ok(())
    }
}

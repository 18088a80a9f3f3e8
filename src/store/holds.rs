use dashmap::mapref::entry::Entry;
use ulid::Ulid;

use crate::model::{Hold, HoldStatus, Ms, Record};

use super::{Duplicate, Mismatch, StoreError, Txn};

/// Deadline condition on a conditional transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// The hold must still be live at this instant (`expires_at > t`).
    LiveAt(Ms),
    /// The hold must have lapsed at this instant (`expires_at <= t`).
    LapsedAt(Ms),
}

/// Extra `WHERE` conditions for [`Txn::transition_hold`].
#[derive(Debug, Clone, Copy, Default)]
pub struct HoldGuard<'a> {
    pub holder: Option<&'a str>,
    pub expiry: Option<Expiry>,
}

impl Txn<'_> {
    pub fn get_hold(&self, id: &Ulid) -> Option<&Hold> {
        self.state.holds.get(id)
    }

    /// Insert a hold, enforcing both uniqueness constraints: one hold per
    /// idempotency key across all events, and one active hold per holder per
    /// event.
    pub fn insert_hold(&mut self, hold: Hold) -> Result<(), StoreError> {
        if hold.event_id != self.event_id() {
            return Err(StoreError::InvariantViolation(format!(
                "hold {} for event {} inserted under event {}",
                hold.id,
                hold.event_id,
                self.event_id()
            )));
        }

        // The key index is shared by every event, so the claim itself is the
        // check: a vacant entry is taken atomically.
        match self.store.keys.entry(hold.idempotency_key.clone()) {
            Entry::Occupied(_) => return Err(StoreError::Duplicate(Duplicate::IdempotencyKey)),
            Entry::Vacant(slot) => {
                slot.insert(hold.id);
            }
        }
        self.claimed_keys.push(hold.idempotency_key.clone());

        if hold.status.is_active() && self.state.active_holders.contains_key(&hold.holder) {
            return Err(StoreError::Duplicate(Duplicate::ActiveHolder));
        }

        self.state.insert_hold(hold.clone());
        self.stage(Record::HoldInserted { hold });
        Ok(())
    }

    /// Conditionally move a hold from `from` to `to`. Matches no row unless the
    /// hold is currently in `from` and every guard holds. Only transitions out
    /// of `Pending` exist.
    pub fn transition_hold(
        &mut self,
        id: Ulid,
        from: HoldStatus,
        to: HoldStatus,
        guard: HoldGuard<'_>,
    ) -> Result<Hold, StoreError> {
        if from != HoldStatus::Pending || to == HoldStatus::Pending {
            return Err(StoreError::InvariantViolation(format!(
                "illegal hold transition {from} -> {to}"
            )));
        }

        let hold = self.state.holds.get(&id).ok_or(StoreError::HoldNotFound(id))?;
        if guard.holder.is_some_and(|holder| hold.holder != holder) {
            return Err(StoreError::NoMatchingRow { id, reason: Mismatch::Holder });
        }
        if hold.status != from {
            return Err(StoreError::NoMatchingRow {
                id,
                reason: Mismatch::Status(hold.status),
            });
        }
        match guard.expiry {
            Some(Expiry::LiveAt(now)) if hold.is_lapsed(now) => {
                return Err(StoreError::NoMatchingRow { id, reason: Mismatch::Expired });
            }
            Some(Expiry::LapsedAt(now)) if !hold.is_lapsed(now) => {
                return Err(StoreError::NoMatchingRow { id, reason: Mismatch::NotLapsed });
            }
            _ => {}
        }

        let event_id = self.event_id();
        self.state.set_status(id, to);
        self.stage(Record::HoldTransitioned { id, event_id, from, to });
        self.state
            .holds
            .get(&id)
            .cloned()
            .ok_or(StoreError::HoldNotFound(id))
    }
}

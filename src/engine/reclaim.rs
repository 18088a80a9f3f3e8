use std::pin::pin;
use std::time::Instant;

use futures::StreamExt;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::model::{HoldStatus, Ms};
use crate::observability::{
    HOLDS_RECLAIMED_TOTAL, RECLAIM_CYCLE_DURATION_SECONDS, RECLAIM_FAILURES_TOTAL,
};
use crate::store::{Expiry, HoldGuard};

use super::{Engine, EngineError};

impl Engine {
    /// Release every pending hold whose deadline has passed and give its unit
    /// back. Each hold is its own unit, so one failure never blocks the rest
    /// of the pass. Returns how many holds were reclaimed.
    pub async fn reclaim_once(&self) -> usize {
        let start = Instant::now();
        let now = self.clock.now_ms();
        let mut expired = pin!(self.store.list_expired_pending(now));
        let mut reclaimed = 0;

        while let Some(hold) = expired.next().await {
            match self.reclaim_hold(hold.id, now).await {
                Ok(()) => reclaimed += 1,
                // Confirmed or cancelled since the scan read it.
                Err(EngineError::NotPending { id, status }) => {
                    debug!(hold_id = %id, %status, "reclaim skipped");
                }
                Err(e) => {
                    metrics::counter!(RECLAIM_FAILURES_TOTAL).increment(1);
                    warn!(hold_id = %hold.id, "reclaim failed: {e}");
                }
            }
        }

        metrics::counter!(HOLDS_RECLAIMED_TOTAL).increment(reclaimed as u64);
        metrics::histogram!(RECLAIM_CYCLE_DURATION_SECONDS).record(start.elapsed().as_secs_f64());
        if reclaimed > 0 {
            info!(reclaimed, "reclaimed expired holds");
        }
        reclaimed
    }

    pub(super) async fn reclaim_hold(&self, hold_id: Ulid, now: Ms) -> Result<(), EngineError> {
        let mut txn = self.store.begin_for_hold(hold_id).await?;
        let guard = HoldGuard {
            holder: None,
            expiry: Some(Expiry::LapsedAt(now)),
        };
        txn.transition_hold(hold_id, HoldStatus::Pending, HoldStatus::Released, guard)?;
        txn.release()?;
        txn.commit().await?;
        Ok(())
    }
}

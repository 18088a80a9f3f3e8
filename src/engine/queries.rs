use ulid::Ulid;

use crate::model::*;
use crate::observability::INVARIANT_VIOLATIONS_TOTAL;

use super::{Engine, EngineError};

impl Engine {
    /// Every event, oldest first.
    pub async fn list_events(&self) -> Vec<EventInfo> {
        self.store.list_events().await
    }

    pub async fn get_event(&self, id: Ulid) -> Result<EventInfo, EngineError> {
        Ok(self.store.event_info(id).await?)
    }

    pub async fn get_hold(&self, id: Ulid) -> Result<Hold, EngineError> {
        Ok(self.store.get_hold(id).await?)
    }

    /// Check `available + active = total` on every event.
    pub async fn audit(&self) -> Result<(), EngineError> {
        if let Err(e) = self.store.audit().await {
            metrics::counter!(INVARIANT_VIOLATIONS_TOTAL).increment(1);
            tracing::error!("audit failed: {e}");
            return Err(e.into());
        }
        Ok(())
    }
}

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard};
use ulid::Ulid;

use crate::model::{EventState, Record};

use super::{revert_record, Store, StoreError};

/// One atomic unit on a single event.
///
/// Mutations are applied to the locked state immediately and staged as WAL
/// records. `commit` writes all staged records as one WAL entry. A unit
/// dropped before commit (an early `?`, a failed append) reverts its staged
/// records in reverse order and frees any idempotency keys it claimed.
pub struct Txn<'a> {
    pub(super) store: &'a Store,
    pub(super) state: OwnedRwLockWriteGuard<EventState>,
    _gate: OwnedRwLockReadGuard<()>,
    staged: Vec<Record>,
    pub(super) claimed_keys: Vec<String>,
    done: bool,
}

impl<'a> Txn<'a> {
    pub(super) fn new(
        store: &'a Store,
        state: OwnedRwLockWriteGuard<EventState>,
        gate: OwnedRwLockReadGuard<()>,
    ) -> Self {
        Self {
            store,
            state,
            _gate: gate,
            staged: Vec::new(),
            claimed_keys: Vec::new(),
            done: false,
        }
    }

    pub fn event_id(&self) -> Ulid {
        self.state.id
    }

    /// The event as this unit currently sees it, staged changes included.
    pub fn state(&self) -> &EventState {
        &self.state
    }

    pub fn staged(&self) -> &[Record] {
        &self.staged
    }

    pub(super) fn stage(&mut self, record: Record) {
        self.staged.push(record);
    }

    /// Durably commit every staged record as a single WAL entry.
    ///
    /// Until the writer has accepted the entry, dropping this future rolls
    /// the unit back. After that the unit is kept: the entry will be
    /// appended whether or not the caller is still waiting.
    pub async fn commit(mut self) -> Result<(), StoreError> {
        if self.staged.is_empty() {
            self.done = true;
            return Ok(());
        }

        let rx = self.store.submit(self.staged.clone()).await?;
        self.done = true;

        let event_id = self.state.id;
        let inserted: Vec<Ulid> = self
            .staged
            .iter()
            .filter_map(|r| match r {
                Record::HoldInserted { hold } => Some(hold.id),
                _ => None,
            })
            .collect();
        for id in &inserted {
            self.store.holds.insert(*id, event_id);
        }

        match Store::durable(rx).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // The writer discarded the entry, so the unit unwinds on drop.
                for id in &inserted {
                    self.store.holds.remove(id);
                }
                self.done = false;
                Err(e)
            }
        }
    }
}

impl Drop for Txn<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        for record in self.staged.iter().rev() {
            revert_record(&mut self.state, record);
        }
        for key in self.claimed_keys.drain(..) {
            self.store.keys.remove(&key);
        }
    }
}

//! Durable event and hold storage.
//!
//! All mutable state lives in per-event `RwLock`s indexed by `DashMap`s and is
//! made durable through the group-commit WAL. Mutations happen only inside a
//! [`Txn`], which holds the event's write lock for its whole lifetime, so two
//! units touching the same event never interleave. A unit is committed by a
//! single WAL entry and rolled back in memory if it is dropped uncommitted.

mod error;
mod holds;
mod ledger;
mod txn;
mod writer;

pub use error::{Duplicate, Mismatch, StoreError};
pub use holds::{Expiry, HoldGuard};
pub use txn::Txn;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use futures::stream::{self, Stream, StreamExt};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;
use writer::{wal_writer_loop, Control, WalCommand};

const WAL_QUEUE_DEPTH: usize = 4096;

pub type SharedEventState = Arc<RwLock<EventState>>;

pub struct Store {
    events: DashMap<Ulid, SharedEventState>,
    /// Hold id → event id, for committed holds.
    holds: DashMap<Ulid, Ulid>,
    /// Idempotency key → hold id. Keys are never freed, released holds included.
    keys: DashMap<String, Ulid>,
    /// Shared by every unit, taken exclusively by compaction so a snapshot
    /// never races an in-flight append.
    gate: Arc<RwLock<()>>,
    /// Serializes event creation so the event limit is checked and used
    /// by one creator at a time.
    create_lock: Mutex<()>,
    wal_tx: mpsc::Sender<WalCommand>,
}

impl Store {
    /// Replay the WAL at `wal_path` and start the writer task.
    /// Must be called from within a tokio runtime.
    pub fn open(wal_path: PathBuf) -> io::Result<Self> {
        let (wal, entries) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(WAL_QUEUE_DEPTH);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Self {
            events: DashMap::new(),
            holds: DashMap::new(),
            keys: DashMap::new(),
            gate: Arc::new(RwLock::new(())),
            create_lock: Mutex::new(()),
            wal_tx,
        };

        for record in entries.iter().flatten() {
            store
                .apply_replayed(record)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        }

        Ok(store)
    }

    /// Apply one replayed record. We're the sole owner of every lock here, so
    /// `try_write` always succeeds; never block because this may run inside
    /// an async context.
    fn apply_replayed(&self, record: &Record) -> Result<(), StoreError> {
        match record {
            Record::EventCreated { id, name, total_capacity } => {
                let state = EventState::new(*id, name.clone(), *total_capacity);
                self.events.insert(*id, Arc::new(RwLock::new(state)));
                Ok(())
            }
            Record::EventRestored { id, name, total_capacity, available_capacity } => {
                if available_capacity > total_capacity {
                    return Err(StoreError::InvariantViolation(format!(
                        "event {id} restored with {available_capacity} of {total_capacity} available"
                    )));
                }
                let mut state = EventState::new(*id, name.clone(), *total_capacity);
                state.available_capacity = *available_capacity;
                self.events.insert(*id, Arc::new(RwLock::new(state)));
                Ok(())
            }
            other => {
                let event_id = other.event_id();
                let shared = self
                    .event(&event_id)
                    .ok_or(StoreError::EventNotFound(event_id))?;
                let mut guard = shared.try_write().map_err(|_| {
                    StoreError::InvariantViolation(format!("event {event_id} locked during replay"))
                })?;
                apply_record(&mut guard, other)?;
                if let Record::HoldInserted { hold } = other {
                    self.holds.insert(hold.id, hold.event_id);
                    self.keys.insert(hold.idempotency_key.clone(), hold.id);
                }
                Ok(())
            }
        }
    }

    /// Hand one unit's records to the group-commit writer. Waits for queue
    /// space, then sends without another await point: once this returns `Ok`
    /// the writer owns the entry and will append it whether or not anyone
    /// waits on the receiver.
    pub(super) async fn submit(
        &self,
        records: Vec<Record>,
    ) -> Result<oneshot::Receiver<io::Result<()>>, StoreError> {
        let permit = self
            .wal_tx
            .reserve()
            .await
            .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
        let (tx, rx) = oneshot::channel();
        permit.send(WalCommand::Append { records, response: tx });
        Ok(rx)
    }

    /// Wait for a submitted entry to be fsynced.
    pub(super) async fn durable(rx: oneshot::Receiver<io::Result<()>>) -> Result<(), StoreError> {
        rx.await
            .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::WalError(e.to_string()))
    }

    async fn control<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Control,
    ) -> Result<T, StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Control(command(tx)))
            .await
            .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))
    }

    /// Stop the writer once every entry queued ahead of this call is
    /// flushed. Later units and compactions fail with `WalError`.
    pub async fn shutdown(&self) {
        if self.control(|response| Control::Shutdown { response }).await.is_err() {
            tracing::debug!("WAL writer already stopped");
        }
    }

    pub fn event(&self, id: &Ulid) -> Option<SharedEventState> {
        self.events.get(id).map(|e| e.value().clone())
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    pub fn event_for_hold(&self, hold_id: &Ulid) -> Option<Ulid> {
        self.holds.get(hold_id).map(|e| *e.value())
    }

    // ── Atomic units ─────────────────────────────────────────

    /// Open a unit on `event_id`, waiting for any unit already holding it.
    pub async fn begin(&self, event_id: Ulid) -> Result<Txn<'_>, StoreError> {
        let gate = self.gate.clone().read_owned().await;
        let shared = self
            .event(&event_id)
            .ok_or(StoreError::EventNotFound(event_id))?;
        let state = shared.write_owned().await;
        Ok(Txn::new(self, state, gate))
    }

    /// Open a unit on the event that owns `hold_id`.
    pub async fn begin_for_hold(&self, hold_id: Ulid) -> Result<Txn<'_>, StoreError> {
        let event_id = self
            .event_for_hold(&hold_id)
            .ok_or(StoreError::HoldNotFound(hold_id))?;
        self.begin(event_id).await
    }

    /// Durably create an event unless `max_events` already exist. Not a unit
    /// on an existing event, but it still holds the gate so compaction
    /// cannot lose it.
    pub async fn create_event(
        &self,
        id: Ulid,
        name: String,
        total_capacity: u32,
        max_events: usize,
    ) -> Result<EventInfo, StoreError> {
        let _gate = self.gate.read().await;
        let _create = self.create_lock.lock().await;
        if self.events.len() >= max_events {
            return Err(StoreError::TooManyEvents(max_events));
        }

        let record = Record::EventCreated { id, name: name.clone(), total_capacity };
        let rx = self.submit(vec![record]).await?;
        // The writer owns the entry from here, so memory follows it.
        let state = EventState::new(id, name, total_capacity);
        let info = state.info();
        self.events.insert(id, Arc::new(RwLock::new(state)));
        if let Err(e) = Self::durable(rx).await {
            self.events.remove(&id);
            return Err(e);
        }
        Ok(info)
    }

    // ── Reads ────────────────────────────────────────────────

    pub async fn event_info(&self, id: Ulid) -> Result<EventInfo, StoreError> {
        let shared = self.event(&id).ok_or(StoreError::EventNotFound(id))?;
        let guard = shared.read().await;
        Ok(guard.info())
    }

    /// Snapshot of every event, ordered by id (creation order for ULIDs).
    pub async fn list_events(&self) -> Vec<EventInfo> {
        let mut shared: Vec<(Ulid, SharedEventState)> = self
            .events
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        shared.sort_by_key(|(id, _)| *id);

        let mut out = Vec::with_capacity(shared.len());
        for (_, rs) in shared {
            out.push(rs.read().await.info());
        }
        out
    }

    pub async fn get_hold(&self, id: Ulid) -> Result<Hold, StoreError> {
        let event_id = self.event_for_hold(&id).ok_or(StoreError::HoldNotFound(id))?;
        let shared = self.event(&event_id).ok_or(StoreError::EventNotFound(event_id))?;
        let guard = shared.read().await;
        guard.holds.get(&id).cloned().ok_or(StoreError::HoldNotFound(id))
    }

    /// Pending holds lapsed at `now`, event by event. Each event is read
    /// under its own lock only when the stream reaches it, and no lock is
    /// held between items. Call again to restart the scan.
    pub fn list_expired_pending(&self, now: Ms) -> impl Stream<Item = Hold> + Send {
        let shared: Vec<SharedEventState> = self.events.iter().map(|e| e.value().clone()).collect();
        stream::iter(shared)
            .then(move |rs| async move {
                let guard = rs.read().await;
                guard.expired_pending(now).cloned().collect::<Vec<_>>()
            })
            .flat_map(stream::iter)
    }

    /// Verify `available + active = total` and the counter bounds for every event.
    pub async fn audit(&self) -> Result<(), StoreError> {
        let shared: Vec<SharedEventState> = self.events.iter().map(|e| e.value().clone()).collect();
        for rs in shared {
            let guard = rs.read().await;
            let active = guard.active_holds() as u64;
            let available = guard.available_capacity as u64;
            let total = guard.total_capacity as u64;
            if available > total || available + active != total {
                return Err(StoreError::InvariantViolation(format!(
                    "event {}: available {available} + active {active} != total {total}",
                    guard.id
                )));
            }
        }
        Ok(())
    }

    // ── Compaction ───────────────────────────────────────────

    /// Rewrite the WAL with only the records needed to recreate current state.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let _gate = self.gate.write().await;

        let mut shared: Vec<(Ulid, SharedEventState)> = self
            .events
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        shared.sort_by_key(|(id, _)| *id);

        let mut entries = Vec::with_capacity(shared.len());
        for (_, rs) in shared {
            let guard = rs.read().await;
            let mut holds: Vec<&Hold> = guard.holds.values().collect();
            holds.sort_by_key(|h| h.id);

            let mut records = Vec::with_capacity(holds.len() + 1);
            records.push(Record::EventRestored {
                id: guard.id,
                name: guard.name.clone(),
                total_capacity: guard.total_capacity,
                available_capacity: guard.available_capacity,
            });
            records.extend(holds.into_iter().map(|h| Record::HoldInserted { hold: h.clone() }));
            entries.push(records);
        }

        self.control(|response| Control::Compact { entries, response })
            .await?
            .map_err(|e| StoreError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        self.control(|response| Control::AppendsSinceCompact { response })
            .await
            .unwrap_or(0)
    }
}

/// Apply a committed record to an event's state (caller holds the lock).
fn apply_record(rs: &mut EventState, record: &Record) -> Result<(), StoreError> {
    match record {
        Record::CapacityConsumed { event_id } => {
            if rs.consume_unit() == 0 {
                return Err(StoreError::InvariantViolation(format!(
                    "event {event_id} consumed below zero"
                )));
            }
        }
        Record::CapacityReleased { event_id } => {
            if rs.release_unit() == 0 {
                return Err(StoreError::InvariantViolation(format!(
                    "event {event_id} released above total capacity"
                )));
            }
        }
        Record::HoldInserted { hold } => rs.insert_hold(hold.clone()),
        Record::HoldTransitioned { id, from, to, .. } => {
            match rs.holds.get(id).map(|h| h.status) {
                Some(status) if status == *from => {
                    rs.set_status(*id, *to);
                }
                Some(status) => {
                    return Err(StoreError::InvariantViolation(format!(
                        "hold {id} replayed {from}->{to} from {status}"
                    )));
                }
                None => return Err(StoreError::HoldNotFound(*id)),
            }
        }
        Record::EventCreated { .. } | Record::EventRestored { .. } => {}
    }
    Ok(())
}

/// Undo a record applied by an uncommitted unit.
fn revert_record(rs: &mut EventState, record: &Record) {
    match record {
        Record::CapacityConsumed { .. } => {
            rs.release_unit();
        }
        Record::CapacityReleased { .. } => {
            rs.consume_unit();
        }
        Record::HoldInserted { hold } => {
            rs.remove_hold(hold.id);
        }
        Record::HoldTransitioned { id, from, .. } => {
            rs.set_status(*id, *from);
        }
        Record::EventCreated { .. } | Record::EventRestored { .. } => {}
    }
}

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds.
pub type Ms = i64;

/// Lifecycle of a hold. `Finalized` and `Released` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HoldStatus {
    Pending,
    Finalized,
    Released,
}

impl HoldStatus {
    /// Pending and finalized holds both occupy a unit of capacity.
    pub fn is_active(self) -> bool {
        matches!(self, HoldStatus::Pending | HoldStatus::Finalized)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HoldStatus::Pending => "pending",
            HoldStatus::Finalized => "finalized",
            HoldStatus::Released => "released",
        }
    }
}

impl fmt::Display for HoldStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One consumed unit of an event's capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hold {
    pub id: Ulid,
    pub event_id: Ulid,
    pub holder: String,
    pub idempotency_key: String,
    pub status: HoldStatus,
    pub created_at: Ms,
    pub expires_at: Ms,
}

impl Hold {
    pub fn pending(
        id: Ulid,
        event_id: Ulid,
        holder: &str,
        idempotency_key: &str,
        created_at: Ms,
        expires_at: Ms,
    ) -> Self {
        Self {
            id,
            event_id,
            holder: holder.to_string(),
            idempotency_key: idempotency_key.to_string(),
            status: HoldStatus::Pending,
            created_at,
            expires_at,
        }
    }

    pub fn is_lapsed(&self, now: Ms) -> bool {
        self.expires_at <= now
    }
}

/// In-memory state of one event: its capacity counter and every hold ever
/// placed against it.
#[derive(Debug, Clone)]
pub struct EventState {
    pub id: Ulid,
    pub name: String,
    pub total_capacity: u32,
    pub available_capacity: u32,
    pub holds: HashMap<Ulid, Hold>,
    /// Holder → active (pending or finalized) hold id.
    pub active_holders: HashMap<String, Ulid>,
    /// Pending holds ordered by deadline, for the expiry scan.
    pub pending_by_expiry: BTreeSet<(Ms, Ulid)>,
}

impl EventState {
    pub fn new(id: Ulid, name: String, total_capacity: u32) -> Self {
        Self {
            id,
            name,
            total_capacity,
            available_capacity: total_capacity,
            holds: HashMap::new(),
            active_holders: HashMap::new(),
            pending_by_expiry: BTreeSet::new(),
        }
    }

    /// Insert a hold and index it according to its status.
    pub fn insert_hold(&mut self, hold: Hold) {
        self.index(&hold);
        self.holds.insert(hold.id, hold);
    }

    /// Remove a hold and its index entries.
    pub fn remove_hold(&mut self, id: Ulid) -> Option<Hold> {
        let hold = self.holds.remove(&id)?;
        self.unindex(&hold);
        Some(hold)
    }

    /// Overwrite a hold's status, keeping the indices in step.
    /// Returns the previous status.
    pub fn set_status(&mut self, id: Ulid, status: HoldStatus) -> Option<HoldStatus> {
        let mut hold = self.holds.remove(&id)?;
        self.unindex(&hold);
        let previous = hold.status;
        hold.status = status;
        self.index(&hold);
        self.holds.insert(id, hold);
        Some(previous)
    }

    fn index(&mut self, hold: &Hold) {
        if hold.status.is_active() {
            self.active_holders.insert(hold.holder.clone(), hold.id);
        }
        if hold.status == HoldStatus::Pending {
            self.pending_by_expiry.insert((hold.expires_at, hold.id));
        }
    }

    fn unindex(&mut self, hold: &Hold) {
        if self.active_holders.get(&hold.holder) == Some(&hold.id) {
            self.active_holders.remove(&hold.holder);
        }
        self.pending_by_expiry.remove(&(hold.expires_at, hold.id));
    }

    pub fn active_holds(&self) -> usize {
        self.holds.values().filter(|h| h.status.is_active()).count()
    }

    /// Pending holds whose deadline is at or before `now`, earliest first.
    pub fn expired_pending(&self, now: Ms) -> impl Iterator<Item = &Hold> {
        self.pending_by_expiry
            .iter()
            .take_while(move |(expires_at, _)| *expires_at <= now)
            .filter_map(move |(_, id)| self.holds.get(id))
    }

    pub fn info(&self) -> EventInfo {
        EventInfo {
            id: self.id,
            name: self.name.clone(),
            total_capacity: self.total_capacity,
            available_capacity: self.available_capacity,
        }
    }
}

/// WAL record types. One log entry is the batch of
/// these that committed together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Record {
    EventCreated {
        id: Ulid,
        name: String,
        total_capacity: u32,
    },
    /// Written by compaction only: an event with its counter as of the snapshot.
    EventRestored {
        id: Ulid,
        name: String,
        total_capacity: u32,
        available_capacity: u32,
    },
    CapacityConsumed {
        event_id: Ulid,
    },
    CapacityReleased {
        event_id: Ulid,
    },
    HoldInserted {
        hold: Hold,
    },
    HoldTransitioned {
        id: Ulid,
        event_id: Ulid,
        from: HoldStatus,
        to: HoldStatus,
    },
}

impl Record {
    /// The event a record mutates.
    pub fn event_id(&self) -> Ulid {
        match self {
            Record::EventCreated { id, .. } | Record::EventRestored { id, .. } => *id,
            Record::CapacityConsumed { event_id }
            | Record::CapacityReleased { event_id }
            | Record::HoldTransitioned { event_id, .. } => *event_id,
            Record::HoldInserted { hold } => hold.event_id,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventInfo {
    pub id: Ulid,
    pub name: String,
    pub total_capacity: u32,
    pub available_capacity: u32,
}

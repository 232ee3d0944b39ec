use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use crate::capabilities::{KeyNamespace, KvBackend, KvKey, TypedSlot};
use crate::model::{
    DeadLetter, Driver, EntryId, OfflineQueueEntry, ProblemId, ProblemReport, TripSession,
};

pub const DRIVER_KEY: &str = "current_driver";
pub const TRIP_KEY: &str = "current_trip";
pub const PENDING_PROBLEMS_KEY: &str = "pending_problems";
pub const OFFLINE_QUEUE_KEY: &str = "offline_queue";
pub const DEAD_LETTERS_KEY: &str = "dead_letters";
pub const LAST_SYNC_KEY: &str = "last_sync";

/// Device-local persistence for the driver app.
///
/// Every slot is one JSON document. Reads that fail (backend error or a value
/// that no longer deserializes) are treated as an empty slot, and failed
/// writes are logged and dropped: callers never see a storage error. There is
/// no atomicity across slots.
pub struct DeviceStore<K: KvBackend> {
    backend: K,
    driver: TypedSlot<Driver>,
    trip: TypedSlot<TripSession>,
    pending_problems: TypedSlot<Vec<ProblemReport>>,
    offline_queue: TypedSlot<Vec<OfflineQueueEntry>>,
    dead_letters: TypedSlot<Vec<DeadLetter>>,
    last_sync: TypedSlot<DateTime<Utc>>,
}

impl<K: KvBackend> DeviceStore<K> {
    pub fn new(backend: K) -> Self {
        Self {
            backend,
            driver: slot(DRIVER_KEY),
            trip: slot(TRIP_KEY),
            pending_problems: slot(PENDING_PROBLEMS_KEY),
            offline_queue: slot(OFFLINE_QUEUE_KEY),
            dead_letters: slot(DEAD_LETTERS_KEY),
            last_sync: slot(LAST_SYNC_KEY),
        }
    }

    pub fn backend(&self) -> &K {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut K {
        &mut self.backend
    }

    pub fn into_backend(self) -> K {
        self.backend
    }

    // --- driver ---

    pub fn set_driver(&mut self, driver: &Driver) {
        write_slot(&mut self.backend, &self.driver, driver);
    }

    pub fn driver(&self) -> Option<Driver> {
        read_slot(&self.backend, &self.driver)
    }

    pub fn clear_driver(&mut self) {
        clear_slot(&mut self.backend, &self.driver);
    }

    pub fn is_logged_in(&self) -> bool {
        self.driver().is_some_and(|d| d.logged_in)
    }

    // --- trip ---

    pub fn set_trip(&mut self, trip: &TripSession) {
        write_slot(&mut self.backend, &self.trip, trip);
    }

    pub fn trip(&self) -> Option<TripSession> {
        read_slot(&self.backend, &self.trip)
    }

    pub fn clear_trip(&mut self) {
        clear_slot(&mut self.backend, &self.trip);
    }

    pub fn has_active_trip(&self) -> bool {
        self.trip().is_some_and(|t| t.is_active)
    }

    // --- pending problems ---

    pub fn add_pending_problem(&mut self, report: &ProblemReport) {
        let mut pending = self.pending_problems();
        pending.push(report.clone());
        write_slot(&mut self.backend, &self.pending_problems, &pending);
    }

    pub fn pending_problems(&self) -> Vec<ProblemReport> {
        read_slot(&self.backend, &self.pending_problems).unwrap_or_default()
    }

    pub fn remove_pending_problem(&mut self, id: &ProblemId) {
        let mut pending = self.pending_problems();
        let before = pending.len();
        pending.retain(|p| &p.id != id);
        if pending.len() != before {
            write_slot(&mut self.backend, &self.pending_problems, &pending);
        }
    }

    pub fn clear_pending_problems(&mut self) {
        clear_slot(&mut self.backend, &self.pending_problems);
    }

    // --- offline queue ---

    pub fn add_to_offline_queue(&mut self, entry: &OfflineQueueEntry) {
        let mut queue = self.offline_queue();
        queue.push(entry.clone());
        write_slot(&mut self.backend, &self.offline_queue, &queue);
    }

    pub fn offline_queue(&self) -> Vec<OfflineQueueEntry> {
        read_slot(&self.backend, &self.offline_queue).unwrap_or_default()
    }

    /// Replaces the stored entry with the same id. Returns false if it is gone.
    pub fn update_offline_entry(&mut self, entry: &OfflineQueueEntry) -> bool {
        let mut queue = self.offline_queue();
        let Some(pos) = queue.iter().position(|e| e.id == entry.id) else {
            return false;
        };
        queue[pos] = entry.clone();
        write_slot(&mut self.backend, &self.offline_queue, &queue)
    }

    /// Returns true only if the entry was present and the write succeeded.
    pub fn remove_offline_entry(&mut self, id: &EntryId) -> bool {
        self.remove_offline_entries_where(|e| &e.id == id) > 0
    }

    /// Drops every matching entry, returning how many were removed.
    pub fn remove_offline_entries_where<F>(&mut self, mut pred: F) -> usize
    where
        F: FnMut(&OfflineQueueEntry) -> bool,
    {
        let mut queue = self.offline_queue();
        let before = queue.len();
        queue.retain(|e| !pred(e));
        let removed = before - queue.len();
        if removed == 0 || !write_slot(&mut self.backend, &self.offline_queue, &queue) {
            return 0;
        }
        removed
    }

    /// Makes every queued entry due now. Attempt counts are kept. Returns how
    /// many entries were waiting out a backoff.
    pub fn clear_backoff(&mut self) -> usize {
        let mut queue = self.offline_queue();
        let mut cleared = 0;
        for entry in queue.iter_mut().filter(|e| e.next_attempt_at.is_some()) {
            entry.next_attempt_at = None;
            cleared += 1;
        }
        if cleared == 0 || !write_slot(&mut self.backend, &self.offline_queue, &queue) {
            return 0;
        }
        cleared
    }

    pub fn clear_offline_queue(&mut self) {
        clear_slot(&mut self.backend, &self.offline_queue);
    }

    // --- dead letters ---

    pub fn add_dead_letter(&mut self, letter: &DeadLetter) {
        let mut letters = self.dead_letters();
        letters.push(letter.clone());
        write_slot(&mut self.backend, &self.dead_letters, &letters);
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        read_slot(&self.backend, &self.dead_letters).unwrap_or_default()
    }

    pub fn clear_dead_letters(&mut self) {
        clear_slot(&mut self.backend, &self.dead_letters);
    }

    // --- sync bookkeeping ---

    pub fn set_last_sync(&mut self, at: DateTime<Utc>) {
        write_slot(&mut self.backend, &self.last_sync, &at);
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        read_slot(&self.backend, &self.last_sync)
    }
}

fn slot<T: Serialize + DeserializeOwned>(key: &'static str) -> TypedSlot<T> {
    TypedSlot::new(KvKey::fixed(KeyNamespace::Mobile, key))
}

fn read_slot<K, T>(backend: &K, slot: &TypedSlot<T>) -> Option<T>
where
    K: KvBackend,
    T: Serialize + DeserializeOwned,
{
    match slot.load(backend) {
        Ok(value) => value,
        Err(e) => {
            warn!(key = %slot.key().raw(), error = %e, "treating unreadable slot as empty");
            None
        }
    }
}

fn write_slot<K, T>(backend: &mut K, slot: &TypedSlot<T>, value: &T) -> bool
where
    K: KvBackend,
    T: Serialize + DeserializeOwned,
{
    match slot.save(backend, value) {
        Ok(()) => {
            debug!(key = %slot.key().raw(), "slot written");
            true
        }
        Err(e) => {
            warn!(
                key = %slot.key().raw(),
                error = %e,
                retryable = e.is_retryable(),
                "dropping failed store write"
            );
            false
        }
    }
}

fn clear_slot<K, T>(backend: &mut K, slot: &TypedSlot<T>)
where
    K: KvBackend,
    T: Serialize + DeserializeOwned,
{
    if let Err(e) = slot.clear(backend) {
        warn!(key = %slot.key().raw(), error = %e, "dropping failed store clear");
    }
}

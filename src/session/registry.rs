//! Instance registry
//!
//! The single source of truth for "is this instance currently running".
//! Guarded by a plain mutex that is never held across an await; async
//! teardown always happens on an entry that was first taken out of the map.
//! Create/restart/delete for one id are serialized by [`OpLocks`].

use super::lifecycle::{InstanceStatus, LifecycleFlags};
use crate::store::credentials::CredentialStore;
use crate::store::instances::InstanceRecord;
use crate::store::messages::MessageStore;
use crate::transport::traits::{InstanceId, Transport};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;

/// One running instance
pub struct InstanceEntry {
    pub record: InstanceRecord,
    pub status: InstanceStatus,
    pub flags: LifecycleFlags,
    /// Identifies the transport handle; signals from older handles are ignored
    pub generation: u64,
    pub transport: Arc<dyn Transport>,
    pub credentials: Arc<CredentialStore>,
    pub messages: Arc<MessageStore>,
    pub pairing_code: Option<String>,
    pub tasks: EntryTasks,
}

/// Background tasks owned by an entry
#[derive(Default)]
pub struct EntryTasks {
    pub worker: Option<JoinHandle<()>>,
    pub watchdog: Option<JoinHandle<()>>,
    pub restart_timer: Option<JoinHandle<()>>,
    pub pairing_request: Option<JoinHandle<()>>,
}

impl EntryTasks {
    pub fn cancel_watchdog(&mut self) {
        if let Some(timer) = self.watchdog.take() {
            timer.abort();
        }
    }

    pub fn cancel_restart_timer(&mut self) {
        if let Some(timer) = self.restart_timer.take() {
            timer.abort();
        }
    }

    /// Cancel every timer and wait for the event worker to be gone.
    ///
    /// Once this returns the worker's event stream has been dropped, so the
    /// transport handle has no listener left.
    pub async fn stop(mut self) {
        self.cancel_watchdog();
        self.cancel_restart_timer();
        if let Some(request) = self.pairing_request.take() {
            request.abort();
        }
        if let Some(worker) = self.worker.take() {
            worker.abort();
            let _ = worker.await;
        }
    }
}

impl InstanceEntry {
    /// Stop background work and close the transport connection.
    pub async fn detach(self) {
        self.tasks.stop().await;
        self.transport.close().await;
    }
}

/// Snapshot of the fields the event worker needs at dispatch time
#[derive(Debug, Clone)]
pub struct DispatchTarget {
    pub callback_url: Option<String>,
    pub poll_events: bool,
}

/// Shared instance map
#[derive(Clone, Default)]
pub struct Registry {
    entries: Arc<Mutex<HashMap<InstanceId, InstanceEntry>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<InstanceId, InstanceEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn contains(&self, id: &InstanceId) -> bool {
        self.lock().contains_key(id)
    }

    pub fn insert(&self, entry: InstanceEntry) {
        self.lock().insert(entry.record.id.clone(), entry);
    }

    pub fn remove(&self, id: &InstanceId) -> Option<InstanceEntry> {
        self.lock().remove(id)
    }

    /// Remove the entry only if it still belongs to `generation`
    pub fn remove_generation(&self, id: &InstanceId, generation: u64) -> Option<InstanceEntry> {
        let mut entries = self.lock();
        match entries.get(id) {
            Some(entry) if entry.generation == generation => entries.remove(id),
            _ => None,
        }
    }

    /// Run `f` against the entry for `id`
    pub fn with<T>(&self, id: &InstanceId, f: impl FnOnce(&mut InstanceEntry) -> T) -> Option<T> {
        self.lock().get_mut(id).map(f)
    }

    /// Run `f` against the entry only if it still belongs to `generation`
    pub fn with_generation<T>(
        &self,
        id: &InstanceId,
        generation: u64,
        f: impl FnOnce(&mut InstanceEntry) -> T,
    ) -> Option<T> {
        self.lock()
            .get_mut(id)
            .filter(|entry| entry.generation == generation)
            .map(f)
    }

    pub fn status(&self, id: &InstanceId) -> Option<InstanceStatus> {
        self.with(id, |entry| entry.status)
    }

    pub fn dispatch_target(&self, id: &InstanceId, generation: u64) -> Option<DispatchTarget> {
        self.with_generation(id, generation, |entry| DispatchTarget {
            callback_url: entry.record.callback_url.clone(),
            poll_events: entry.record.poll_events,
        })
    }

    /// (id, status) of every entry
    pub fn statuses(&self) -> Vec<(InstanceId, InstanceStatus)> {
        self.lock()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.status))
            .collect()
    }

    /// Take every entry out of the map
    pub fn drain(&self) -> Vec<InstanceEntry> {
        self.lock().drain().map(|(_, entry)| entry).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-id operation locks
#[derive(Default)]
pub struct OpLocks {
    locks: Mutex<HashMap<InstanceId, Arc<tokio::sync::Mutex<()>>>>,
}

impl OpLocks {
    pub async fn acquire(&self, id: &InstanceId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(id.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Forget the lock for `id` unless someone holds it or is waiting on it.
    pub fn prune(&self, id: &InstanceId) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks.get(id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(id);
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

//! Folder change notifications.

use std::sync::{Arc, Mutex, Weak};

use tracing::warn;

use crate::types::MessageId;

/// What one step of synchronization did to a folder's summary.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FolderChanges {
    /// Messages that appeared.
    pub added: Vec<MessageId>,
    /// Messages that went away.
    pub removed: Vec<MessageId>,
    /// Messages whose flags changed.
    pub changed: Vec<MessageId>,
}

impl FolderChanges {
    /// Whether nothing happened.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }

    pub(crate) fn add(&mut self, id: MessageId) {
        self.added.push(id);
    }

    pub(crate) fn remove(&mut self, id: MessageId) {
        // a message that came and went within one batch is not worth reporting
        if let Some(pos) = self.added.iter().position(|a| *a == id) {
            self.added.remove(pos);
        } else {
            self.removed.push(id);
        }
        self.changed.retain(|c| *c != id);
    }

    pub(crate) fn change(&mut self, id: MessageId) {
        if !self.added.contains(&id) && !self.changed.contains(&id) {
            self.changed.push(id);
        }
    }
}

type Callback = Box<dyn Fn(&FolderChanges) + Send + Sync>;

struct Entry {
    id: u64,
    callback: Arc<Callback>,
}

#[derive(Default)]
struct Registry {
    next: u64,
    entries: Vec<Entry>,
}

/// The observers of one folder, plus the queue of batches waiting to be delivered.
///
/// Batches are queued while the folder's state lock is held and delivered afterwards, in
/// queue order; `emit` serializes delivery so two threads flushing at once cannot reorder
/// batches.
#[derive(Default)]
pub(crate) struct Observers {
    registry: Arc<Mutex<Registry>>,
    queue: Mutex<Vec<FolderChanges>>,
    emit: Mutex<()>,
}

impl std::fmt::Debug for Observers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers").finish_non_exhaustive()
    }
}

/// Keeps a callback registered; dropping it unsubscribes.
#[must_use = "dropping the subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            if let Ok(mut registry) = registry.lock() {
                registry.entries.retain(|e| e.id != self.id);
            }
        }
    }
}

impl Observers {
    pub(crate) fn subscribe(
        &self,
        callback: impl Fn(&FolderChanges) + Send + Sync + 'static,
    ) -> Subscription {
        let mut registry = match self.registry.lock() {
            Ok(r) => r,
            Err(poisoned) => poisoned.into_inner(),
        };
        registry.next += 1;
        let id = registry.next;
        registry.entries.push(Entry {
            id,
            callback: Arc::new(Box::new(callback)),
        });
        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Queue a batch for delivery. Empty batches are dropped.
    pub(crate) fn queue(&self, changes: FolderChanges) {
        if changes.is_empty() {
            return;
        }
        match self.queue.lock() {
            Ok(mut q) => q.push(changes),
            Err(_) => warn!("change queue poisoned; dropping notification"),
        }
    }

    /// Deliver queued batches. Must not be called with the folder state lock held.
    pub(crate) fn emit(&self) {
        let Ok(_guard) = self.emit.lock() else {
            return;
        };
        loop {
            let batch: Vec<FolderChanges> = match self.queue.lock() {
                Ok(mut q) => std::mem::take(&mut *q),
                Err(_) => return,
            };
            if batch.is_empty() {
                return;
            }
            let callbacks: Vec<Arc<Callback>> = match self.registry.lock() {
                Ok(r) => r.entries.iter().map(|e| Arc::clone(&e.callback)).collect(),
                Err(_) => return,
            };
            for changes in &batch {
                for cb in &callbacks {
                    cb(changes);
                }
            }
        }
    }
}

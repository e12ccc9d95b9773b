// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use tracing::trace;

use crate::context::Context;
use crate::entry::Entry;
use crate::error::{StoreError, StoreResult};
use crate::key::{BindingKey, EntryKey, ObjectId};

/// Callback fired exactly once per not-full to full transition, waking the
/// evictor.
pub(crate) type FullNotifier = Box<dyn Fn() + Send + Sync>;

/// The cache table: both keyspaces, per-key stripe locks and capacity
/// accounting.
///
/// The index locks only guard membership; entry state is guarded by each
/// entry's own lock. Enumeration via [`EntryIterator`] is weakly consistent.
pub(crate) struct CacheTable {
    objects: RwLock<BTreeMap<ObjectId, Arc<Entry>>>,
    bindings: RwLock<BTreeMap<BindingKey, Arc<Entry>>>,
    key_locks: Vec<Mutex<()>>,
    capacity: Mutex<Capacity>,
    capacity_cond: Condvar,
    full_notifier: FullNotifier,
    context: Arc<Context>,
}

struct Capacity {
    /// Units not held by a table entry or an outstanding reservation.
    available: usize,
    was_full: bool,
}

impl CacheTable {
    pub(crate) fn new(context: Arc<Context>, full_notifier: FullNotifier) -> Self {
        let size = context.parameters.effective_cache_size();
        let num_locks = context.parameters.num_locks;
        Self {
            objects: RwLock::new(BTreeMap::new()),
            bindings: RwLock::new(BTreeMap::new()),
            key_locks: (0..num_locks).map(|_| Mutex::new(())).collect(),
            capacity: Mutex::new(Capacity {
                available: size,
                was_full: false,
            }),
            capacity_cond: Condvar::new(),
            full_notifier,
            context,
        }
    }

    /// The stripe lock for `key`. Serializes operations driving the same key;
    /// never held across server I/O or entry waits.
    pub(crate) fn key_lock(&self, key: &EntryKey) -> MutexGuard<'_, ()> {
        self.key_locks[key.stripe(self.key_locks.len())].lock()
    }

    pub(crate) fn get_object(&self, oid: ObjectId) -> Option<Arc<Entry>> {
        self.objects.read().get(&oid).cloned()
    }

    pub(crate) fn get_binding(&self, key: &BindingKey) -> Option<Arc<Entry>> {
        self.bindings.read().get(key).cloned()
    }

    /// Smallest binding entry whose key is `>= key`.
    pub(crate) fn ceiling_binding(&self, key: &BindingKey) -> Option<Arc<Entry>> {
        self.bindings
            .read()
            .range(key.clone()..)
            .next()
            .map(|(_, entry)| entry.clone())
    }

    /// Smallest binding entry whose key is `> key`.
    pub(crate) fn higher_binding(&self, key: &BindingKey) -> Option<Arc<Entry>> {
        self.bindings
            .read()
            .range((Excluded(key.clone()), Unbounded))
            .next()
            .map(|(_, entry)| entry.clone())
    }

    /// Inserts a new entry, consuming one reserved unit. Returns `false`
    /// without inserting when the key is already present: a decached entry
    /// has to be removed before its key can be re-inserted, and concurrent
    /// operations may race to insert the same key.
    pub(crate) fn try_insert(
        &self,
        entry: Arc<Entry>,
        reservation: &mut Reservation,
    ) -> StoreResult<bool> {
        let inserted = match entry.key() {
            EntryKey::Object(oid) => {
                let mut objects = self.objects.write();
                if objects.contains_key(oid) {
                    false
                } else {
                    objects.insert(*oid, entry.clone());
                    true
                }
            }
            EntryKey::Binding(key) => {
                let mut bindings = self.bindings.write();
                if bindings.contains_key(key) {
                    false
                } else {
                    bindings.insert(key.clone(), entry.clone());
                    true
                }
            }
        };
        if inserted {
            reservation.spend()?;
            self.context.metrics.node_metrics.cache_entries.inc();
        }
        Ok(inserted)
    }

    /// Removes a decached entry from the table and returns its capacity unit.
    pub(crate) fn remove(&self, entry: &Entry) {
        debug_assert!(entry.lock().decached());
        let removed = match entry.key() {
            EntryKey::Object(oid) => self.objects.write().remove(oid).is_some(),
            EntryKey::Binding(key) => self.bindings.write().remove(key).is_some(),
        };
        if removed {
            self.context.metrics.node_metrics.cache_entries.dec();
            self.release(1);
        }
    }

    /// Number of entries currently in the table.
    pub(crate) fn len(&self) -> usize {
        self.objects.read().len() + self.bindings.read().len()
    }

    /// All binding entries in key order, for the invariant checker.
    pub(crate) fn bindings_snapshot(&self) -> Vec<Arc<Entry>> {
        self.bindings.read().values().cloned().collect()
    }

    /// Capacity units not held by an entry or a reservation.
    pub(crate) fn available(&self) -> usize {
        self.capacity.lock().available
    }

    /// Reserves `n` capacity units, blocking while the cache is over its
    /// limit. The units are returned on drop unless spent on inserts. The
    /// reservation owns its table handle, so it can be handed to a fetch
    /// completion that installs entries without ever waiting on capacity.
    pub(crate) fn reserve(self: &Arc<Self>, n: usize) -> Reservation {
        let mut capacity = self.capacity.lock();
        while capacity.available < n {
            if !capacity.was_full {
                capacity.was_full = true;
                trace!("cache full, signaling evictor");
                (self.full_notifier)();
            }
            self.capacity_cond.wait(&mut capacity);
        }
        capacity.available -= n;
        if capacity.available == 0 && !capacity.was_full {
            capacity.was_full = true;
            (self.full_notifier)();
        }
        drop(capacity);
        Reservation {
            table: self.clone(),
            remaining: n,
        }
    }

    /// Non-blocking reserve for the evictor, which must never wait on the
    /// capacity it is responsible for freeing.
    pub(crate) fn try_reserve(self: &Arc<Self>, n: usize) -> Option<Reservation> {
        let mut capacity = self.capacity.lock();
        if capacity.available < n {
            return None;
        }
        capacity.available -= n;
        if capacity.available == 0 && !capacity.was_full {
            capacity.was_full = true;
            (self.full_notifier)();
        }
        drop(capacity);
        Some(Reservation {
            table: self.clone(),
            remaining: n,
        })
    }

    /// Returns `n` capacity units.
    pub(crate) fn release(&self, n: usize) {
        let mut capacity = self.capacity.lock();
        capacity.available += n;
        capacity.was_full = false;
        self.capacity_cond.notify_all();
    }

    /// A weakly-consistent iterator over all entries, delivering up to
    /// `batch` entries per pass and wrapping around.
    pub(crate) fn entry_iterator(self: &Arc<Self>, batch: usize) -> EntryIterator {
        EntryIterator {
            table: self.clone(),
            batch,
            cursor: Cursor::Objects(None),
        }
    }
}

/// Units of reserved cache capacity, returned on drop. Keeping reserve and
/// release paired on every path is an invariant of the capacity counter.
pub(crate) struct Reservation {
    table: Arc<CacheTable>,
    remaining: usize,
}

impl Reservation {
    /// Consumes one reserved unit for an entry that now occupies a table
    /// slot. The unit is returned by [`CacheTable::remove`] at eviction.
    fn spend(&mut self) -> StoreResult<()> {
        if self.remaining == 0 {
            return Err(StoreError::CacheConsistency(
                "cache reservation underflow".to_string(),
            ));
        }
        self.remaining -= 1;
        Ok(())
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.remaining > 0 {
            self.table.release(self.remaining);
        }
    }
}

enum Cursor {
    Objects(Option<ObjectId>),
    Bindings(Option<BindingKey>),
}

pub(crate) struct EntryIterator {
    table: Arc<CacheTable>,
    batch: usize,
    cursor: Cursor,
}

impl EntryIterator {
    /// Collects up to `batch` entries, resuming where the previous pass left
    /// off and wrapping around the end of both keyspaces.
    pub(crate) fn next_batch(&mut self) -> Vec<Arc<Entry>> {
        let mut entries = Vec::with_capacity(self.batch);

        loop {
            match std::mem::replace(&mut self.cursor, Cursor::Objects(None)) {
                Cursor::Objects(last) => {
                    let objects = self.table.objects.read();
                    let range = match last {
                        Some(last) => objects.range((Excluded(last), Unbounded)),
                        None => objects.range(..),
                    };
                    for (oid, entry) in range {
                        entries.push(entry.clone());
                        if entries.len() == self.batch {
                            self.cursor = Cursor::Objects(Some(*oid));
                            return entries;
                        }
                    }
                    self.cursor = Cursor::Bindings(None);
                }
                Cursor::Bindings(last) => {
                    let bindings = self.table.bindings.read();
                    let range = match &last {
                        Some(last) => bindings.range((Excluded(last.clone()), Unbounded)),
                        None => bindings.range(..),
                    };
                    for (key, entry) in range {
                        entries.push(entry.clone());
                        if entries.len() == self.batch {
                            self.cursor = Cursor::Bindings(Some(key.clone()));
                            return entries;
                        }
                    }
                    // End of a full pass; the next call wraps around.
                    self.cursor = Cursor::Objects(None);
                    return entries;
                }
            }
        }
    }
}

// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Background requests against the server: the fetches transactions suspend
//! on, for both keyspaces, and deferred evict/downgrade tasks that wait for
//! an entry to become quiescent before going through the update queue.
//!
//! Calling threads never perform server I/O. They mark the entry state,
//! schedule a request here and block on the entry's condition bounded by the
//! transaction stop time. Completions lock the entry, install value, state
//! and range information, and wake every waiter. A permanent fetch failure
//! marks the node failed and unblocks waiters, which then observe the
//! network error on their next iteration.
//!
//! Binding consultations own the previous-key interval of their next entry
//! (held via a weak back handle, released on completion) and carry one
//! preallocated capacity unit, so installing what the server answered never
//! waits on capacity.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tokio::runtime::Handle;
use tracing::debug;

use crate::cache::{CacheTable, Reservation};
use crate::context::Context;
use crate::entry::{AccessState, Entry, EntryInner, EntryValue};
use crate::error::{StoreError, StoreResult};
use crate::key::{BindingKey, ContextId, EntryKey, NodeId, ObjectId};
use crate::server::{FailureTracker, ServerApi};
use crate::update_queue::{UpdateItem, UpdateQueue};

/// A server consultation for the binding keyspace.
pub(crate) struct BindingFetch {
    /// The queried key; also names the request sent to the server.
    pub name_key: BindingKey,
    /// The entry whose previous-key interval this fetch owns. The interval
    /// is released when the results have been installed.
    pub owner: Weak<Entry>,
    /// Context ordinal stamped on entries the answer installs.
    pub context_id: ContextId,
    /// One entry slot, preallocated by the caller.
    pub reservation: Reservation,
}

/// Which grant an upgrade of a readable binding entry rides on.
pub(crate) enum BindingUpgrade {
    /// `getBindingForUpdate` on the entry's own name.
    Exact,
    /// `getBindingForRemove` on the entry's own name.
    ExactForRemove,
    /// `getBindingForUpdate` on an unbound name this entry is the next
    /// entry for.
    Next,
    /// `getBindingForRemove` on a name this entry succeeds.
    NextForRemove,
}

pub(crate) enum FetchRequest {
    ReadObject {
        oid: ObjectId,
    },
    ReadObjectForUpdate {
        oid: ObjectId,
    },
    UpgradeObject {
        oid: ObjectId,
    },
    /// Resolve a binding the cache cannot prove; `for_update` also carries a
    /// write grant on the answer.
    ReadBinding {
        fetch: BindingFetch,
        for_update: bool,
    },
    /// Upgrade an entry already readable; the grant arrives with the answer
    /// of the matching for-update or for-remove call.
    UpgradeBinding {
        name: String,
        entry: Weak<Entry>,
        kind: BindingUpgrade,
    },
    /// Stabilize the successor of a name being removed; grants write on it.
    RemoveBinding {
        fetch: BindingFetch,
    },
    /// Resolve the next bound name above a key.
    NextBoundName {
        fetch: BindingFetch,
    },
}

impl FetchRequest {
    fn kind(&self) -> &'static str {
        match self {
            FetchRequest::ReadObject { .. } => "read_object",
            FetchRequest::ReadObjectForUpdate { .. } => "read_object_for_update",
            FetchRequest::UpgradeObject { .. } => "upgrade_object",
            FetchRequest::ReadBinding {
                for_update: false, ..
            } => "read_binding",
            FetchRequest::ReadBinding {
                for_update: true, ..
            } => "read_binding_for_update",
            FetchRequest::UpgradeBinding { .. } => "upgrade_binding",
            FetchRequest::RemoveBinding { .. } => "remove_binding",
            FetchRequest::NextBoundName { .. } => "next_bound_name",
        }
    }
}

/// Normalized shape of the server's binding answers.
struct BindingAnswer {
    found: bool,
    /// The bound oid when found.
    oid: ObjectId,
    /// The first bound name above the queried key, when not found or when
    /// the call reports the successor; `None` folds to `Last`.
    next_name: Option<BindingKey>,
    /// The oid bound to `next_name`.
    next_oid: ObjectId,
}

pub(crate) struct Fetcher {
    context: Arc<Context>,
    cache: Arc<CacheTable>,
    server: Arc<dyn ServerApi>,
    queue: Arc<UpdateQueue>,
    failure: Arc<FailureTracker>,
    node_id: NodeId,
    handle: Handle,
    stopping: Arc<AtomicBool>,
}

impl Fetcher {
    pub(crate) fn new(
        context: Arc<Context>,
        cache: Arc<CacheTable>,
        server: Arc<dyn ServerApi>,
        queue: Arc<UpdateQueue>,
        failure: Arc<FailureTracker>,
        node_id: NodeId,
        handle: Handle,
        stopping: Arc<AtomicBool>,
    ) -> Self {
        Self {
            context,
            cache,
            server,
            queue,
            failure,
            node_id,
            handle,
            stopping,
        }
    }

    /// Schedules a fetch; the caller suspends on the entry's condition.
    pub(crate) fn spawn_fetch(self: &Arc<Self>, request: FetchRequest) {
        self.context
            .metrics
            .node_metrics
            .fetches
            .with_label_values(&[request.kind()])
            .inc();
        let fetcher = self.clone();
        self.handle.spawn(async move { fetcher.run_fetch(request).await });
    }

    async fn run_fetch(self: Arc<Self>, request: FetchRequest) {
        match request {
            FetchRequest::ReadObject { oid } => {
                match self.server.get_object(self.node_id, oid).await {
                    Ok(results) => {
                        self.install_object(oid, EntryValue::Object(results.data), false);
                        if results.callback_evict {
                            self.schedule_deferred_evict(EntryKey::Object(oid));
                        }
                    }
                    Err(error) => self.fail_fetch(oid, &error),
                }
            }
            FetchRequest::ReadObjectForUpdate { oid } => {
                match self.server.get_object_for_update(self.node_id, oid).await {
                    Ok(results) => {
                        self.install_object(oid, EntryValue::Object(results.data), true);
                        if results.callback_evict {
                            self.schedule_deferred_evict(EntryKey::Object(oid));
                        }
                        if results.callback_downgrade {
                            self.schedule_deferred_downgrade(EntryKey::Object(oid));
                        }
                    }
                    Err(error) => self.fail_fetch(oid, &error),
                }
            }
            FetchRequest::UpgradeObject { oid } => {
                match self.server.upgrade_object(self.node_id, oid).await {
                    Ok(results) => {
                        if let Some(entry) = self.cache.get_object(oid) {
                            let mut inner = entry.lock();
                            if !inner.decached() {
                                inner.finish_upgrade();
                            }
                            drop(inner);
                            entry.notify_all();
                        }
                        if results.callback_evict {
                            self.schedule_deferred_evict(EntryKey::Object(oid));
                        }
                    }
                    Err(error) => {
                        self.failure.report(&error);
                        if let Some(entry) = self.cache.get_object(oid) {
                            let mut inner = entry.lock();
                            if !inner.decached() {
                                inner.fail_upgrade();
                            }
                            drop(inner);
                            entry.notify_all();
                        }
                    }
                }
            }
            FetchRequest::ReadBinding { fetch, for_update } => {
                let name = fetch_name(&fetch);
                let result = if for_update {
                    self.server
                        .get_binding_for_update(self.node_id, name)
                        .await
                        .map(|results| BindingAnswer {
                            found: results.found,
                            oid: results.oid,
                            next_name: results.next_name,
                            next_oid: results.oid,
                        })
                } else {
                    self.server
                        .get_binding(self.node_id, name)
                        .await
                        .map(|results| BindingAnswer {
                            found: results.found,
                            oid: results.oid,
                            next_name: results.next_name,
                            next_oid: results.oid,
                        })
                };
                self.complete_binding_fetch(fetch, result, for_update, true, true);
            }
            FetchRequest::RemoveBinding { fetch } => {
                let name = fetch_name(&fetch);
                let result = self
                    .server
                    .get_binding_for_remove(self.node_id, name)
                    .await
                    .map(|results| BindingAnswer {
                        found: results.found,
                        oid: results.oid,
                        next_name: Some(results.next_name),
                        next_oid: results.next_oid,
                    });
                self.complete_binding_fetch(fetch, result, true, false, false);
            }
            FetchRequest::NextBoundName { fetch } => {
                let result = self
                    .server
                    .next_bound_name(self.node_id, fetch.name_key.clone())
                    .await
                    .map(|results| BindingAnswer {
                        found: false,
                        oid: 0,
                        next_name: Some(results.next_name),
                        next_oid: results.oid,
                    });
                self.complete_binding_fetch(fetch, result, false, false, false);
            }
            FetchRequest::UpgradeBinding { name, entry, kind } => {
                let result = match kind {
                    BindingUpgrade::Exact | BindingUpgrade::Next => self
                        .server
                        .get_binding_for_update(self.node_id, name)
                        .await
                        .map(|results| (results.found, results.next_name)),
                    BindingUpgrade::ExactForRemove | BindingUpgrade::NextForRemove => self
                        .server
                        .get_binding_for_remove(self.node_id, name)
                        .await
                        .map(|results| (results.found, Some(results.next_name))),
                };
                self.complete_binding_upgrade(&entry, kind, result);
            }
        }
    }

    fn install_object(&self, oid: ObjectId, value: EntryValue, writable: bool) {
        let Some(entry) = self.cache.get_object(oid) else {
            return;
        };
        let mut inner = entry.lock();
        if !inner.decached() {
            inner.install_fetched(value, writable);
        }
        drop(inner);
        entry.notify_all();
    }

    /// Unblocks waiters of a fetch that failed permanently: the node is
    /// failed, the entry is decached and removed.
    fn fail_fetch(&self, oid: ObjectId, error: &StoreError) {
        self.failure.report(error);
        if let Some(entry) = self.cache.get_object(oid) {
            let mut inner = entry.lock();
            if !inner.decached() {
                inner.decache_immediately();
            }
            drop(inner);
            entry.notify_all();
            self.cache.remove(&entry);
        }
    }

    /// Installs a binding answer and releases the owned interval. A failed
    /// call marks the node failed; waiters are unblocked either way.
    fn complete_binding_fetch(
        &self,
        fetch: BindingFetch,
        result: StoreResult<BindingAnswer>,
        writable: bool,
        lower_unbound: bool,
        exact_installable: bool,
    ) {
        let Some(owner) = fetch.owner.upgrade() else {
            return;
        };
        let mut reservation = fetch.reservation;
        match result {
            Ok(answer) if exact_installable && answer.found => {
                self.install_found_binding(
                    &fetch.name_key,
                    fetch.context_id,
                    answer.oid,
                    writable,
                    &mut reservation,
                    &owner,
                );
            }
            Ok(answer) => {
                let next_name = answer.next_name.unwrap_or(BindingKey::Last);
                self.apply_next_info(
                    &fetch.name_key,
                    fetch.context_id,
                    &owner,
                    next_name,
                    answer.next_oid,
                    writable,
                    lower_unbound,
                    &mut reservation,
                );
            }
            Err(error) => {
                debug!("binding fetch for {} failed: {error}", fetch.name_key);
                self.failure.report(&error);
            }
        }

        let mut inner = owner.lock();
        inner.pending_previous = false;
        drop(inner);
        owner.notify_all();
    }

    /// The server answered "bound": cache an exact entry so the waiter's
    /// retry finds it.
    fn install_found_binding(
        &self,
        name_key: &BindingKey,
        context_id: ContextId,
        oid: ObjectId,
        writable: bool,
        reservation: &mut Reservation,
        owner: &Arc<Entry>,
    ) {
        let entry = Arc::new(Entry::new_fetching(
            EntryKey::Binding(name_key.clone()),
            context_id,
        ));
        entry
            .lock()
            .install_fetched(EntryValue::Binding(Some(oid)), writable);
        if let Err(error) = self.cache.try_insert(entry, reservation) {
            self.failure.report(&error);
        }
        self.collapse_provisional_last(owner);
    }

    /// The server answered with the true next bound name for `name_key`:
    /// extend the owner's certified range down when the answer matches it,
    /// or cache a closer next entry. `lower_unbound` marks whether the
    /// queried name itself was certified unbound.
    #[allow(clippy::too_many_arguments)]
    fn apply_next_info(
        &self,
        name_key: &BindingKey,
        context_id: ContextId,
        entry: &Arc<Entry>,
        next_name: BindingKey,
        next_oid: ObjectId,
        writable: bool,
        lower_unbound: bool,
        reservation: &mut Reservation,
    ) {
        let own_key = entry.binding_key().expect("binding entry").clone();
        if next_name >= own_key {
            // This entry covers the queried name; `next_name` can exceed it
            // only when the entry is a tombstone the server no longer knows.
            let mut inner = entry.lock();
            if inner.decached() {
                return;
            }
            extend_previous_key(&mut inner, name_key, lower_unbound);
            if matches!(inner.access, AccessState::FetchingRead) {
                // Promote the provisional `Last` entry.
                inner.install_fetched(EntryValue::Binding(None), writable);
            } else if writable
                && matches!(
                    inner.access,
                    AccessState::Readable {
                        fetching_upgrade: false
                    }
                )
            {
                // The server granted write access along with the answer.
                inner.start_upgrade();
                inner.finish_upgrade();
            }
            drop(inner);
            entry.notify_all();
            return;
        }

        // A closer next entry exists; cache it with the certified range.
        let new_entry = Arc::new(Entry::new_fetching(
            EntryKey::Binding(next_name),
            context_id,
        ));
        {
            let mut inner = new_entry.lock();
            inner.install_fetched(EntryValue::Binding(Some(next_oid)), writable);
            inner.previous_key = Some(name_key.clone());
            inner.previous_key_unbound = lower_unbound;
        }
        if let Err(error) = self.cache.try_insert(new_entry, reservation) {
            self.failure.report(&error);
        }
        self.collapse_provisional_last(entry);
    }

    /// Drops a provisional `Last` entry that the server's answer bypassed.
    fn collapse_provisional_last(&self, entry: &Arc<Entry>) {
        let mut inner = entry.lock();
        if inner.provisional && !inner.decached() {
            inner.decache_immediately();
            drop(inner);
            entry.notify_all();
            self.cache.remove(entry);
        }
    }

    /// Settles an in-flight binding upgrade. A not-found answer for an entry
    /// cached as bound is only coherent when it is a tombstone being
    /// re-bound; anything else is fatal.
    fn complete_binding_upgrade(
        &self,
        entry: &Weak<Entry>,
        kind: BindingUpgrade,
        result: StoreResult<(bool, Option<BindingKey>)>,
    ) {
        let Some(entry) = entry.upgrade() else {
            return;
        };
        let mut inner = entry.lock();
        if !matches!(
            inner.access,
            AccessState::Readable {
                fetching_upgrade: true
            }
        ) {
            // Decached while the call was in flight; nothing to settle.
            return;
        }
        match result {
            Ok((found, next_name)) => {
                let granted = match kind {
                    BindingUpgrade::Exact | BindingUpgrade::ExactForRemove => {
                        found || inner.binding_value() == Some(None)
                    }
                    BindingUpgrade::Next => {
                        !found && next_name.as_ref() == entry.binding_key()
                    }
                    BindingUpgrade::NextForRemove => {
                        next_name.as_ref() == entry.binding_key()
                    }
                };
                if granted {
                    inner.finish_upgrade();
                } else {
                    inner.fail_upgrade();
                    if matches!(
                        kind,
                        BindingUpgrade::Exact | BindingUpgrade::ExactForRemove
                    ) {
                        let error = StoreError::CacheConsistency(format!(
                            "binding {} cached as bound but unknown to the server",
                            entry.key()
                        ));
                        self.failure.report(&error);
                    }
                    // A mismatched next entry is not fatal; the waiter's
                    // retry re-resolves against the server's answer.
                }
            }
            Err(error) => {
                inner.fail_upgrade();
                self.failure.report(&error);
            }
        }
        drop(inner);
        entry.notify_all();
    }

    /// Evicts `key` through the update queue once the entry is quiescent.
    /// Runs on the blocking pool; bounded waits notice the settled watermark
    /// advancing without a wakeup on the entry itself.
    pub(crate) fn schedule_deferred_evict(self: &Arc<Self>, key: EntryKey) {
        self.context.metrics.node_metrics.evictions_scheduled.inc();
        let fetcher = self.clone();
        self.handle.spawn_blocking(move || fetcher.run_deferred_evict(key));
    }

    fn run_deferred_evict(&self, key: EntryKey) {
        loop {
            if self.stopping.load(Ordering::Acquire) {
                return;
            }
            let Some(entry) = self.lookup(&key) else {
                return;
            };
            let mut inner = entry.lock();
            if inner.decached() {
                return;
            }
            if !inner.in_use(self.queue.highest_settled_context_id()) {
                inner.start_decache();
                drop(inner);
                entry.notify_all();
                let item = match &key {
                    EntryKey::Object(oid) => UpdateItem::EvictObject { oid: *oid },
                    EntryKey::Binding(key) => UpdateItem::EvictBinding { key: key.clone() },
                };
                if self.queue.enqueue_blocking(item).is_err() {
                    debug!("deferred evict of {key} dropped at shutdown");
                }
                return;
            }
            entry.wait_for(&mut inner, self.context.parameters.lock_timeout);
        }
    }

    /// Downgrades `key` through the update queue once no write is
    /// outstanding.
    pub(crate) fn schedule_deferred_downgrade(self: &Arc<Self>, key: EntryKey) {
        let fetcher = self.clone();
        self.handle
            .spawn_blocking(move || fetcher.run_deferred_downgrade(key));
    }

    fn run_deferred_downgrade(&self, key: EntryKey) {
        loop {
            if self.stopping.load(Ordering::Acquire) {
                return;
            }
            let Some(entry) = self.lookup(&key) else {
                return;
            };
            let mut inner = entry.lock();
            if !inner.writable() {
                // Already readable, decached, or a downgrade is in flight.
                return;
            }
            if !inner.in_use_for_write(self.queue.highest_settled_context_id()) {
                inner.start_downgrade();
                drop(inner);
                entry.notify_all();
                let item = match &key {
                    EntryKey::Object(oid) => UpdateItem::DowngradeObject { oid: *oid },
                    EntryKey::Binding(key) => UpdateItem::DowngradeBinding { key: key.clone() },
                };
                if self.queue.enqueue_blocking(item).is_err() {
                    debug!("deferred downgrade of {key} dropped at shutdown");
                }
                return;
            }
            entry.wait_for(&mut inner, self.context.parameters.lock_timeout);
        }
    }

    fn lookup(&self, key: &EntryKey) -> Option<Arc<Entry>> {
        match key {
            EntryKey::Object(oid) => self.cache.get_object(*oid),
            EntryKey::Binding(key) => self.cache.get_binding(key),
        }
    }
}

fn fetch_name(fetch: &BindingFetch) -> String {
    fetch
        .name_key
        .name()
        .expect("binding consultations name real keys")
        .to_string()
}

/// Lowers an entry's certified range so it covers `name_key`. Existing
/// information is never discarded; the range only grows downwards.
fn extend_previous_key(inner: &mut EntryInner, name_key: &BindingKey, lower_unbound: bool) {
    match &inner.previous_key {
        Some(prev) if prev < name_key => {}
        Some(prev) if prev == name_key => {
            if lower_unbound {
                inner.previous_key_unbound = true;
            }
        }
        _ => {
            inner.previous_key = Some(name_key.clone());
            inner.previous_key_unbound = lower_unbound;
        }
    }
}

// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The caching data store facade.
//!
//! Presents the transactional key/value operations over both keyspaces and
//! assembles the node: cache table, update queue, fetcher, evictor and the
//! callback service, all sharing one I/O runtime owned by the store.
//!
//! The binding operations follow the range-search discipline of the ordered
//! keyspace: every answer is proved either by an exact cached entry or by a
//! next-entry certifying that the queried name lies in an unbound range. When
//! the cache cannot prove an answer, the owning thread takes the next entry's
//! previous-key interval, consults the server and installs what it learned,
//! then retries its outer loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use prometheus::Registry;
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::{debug, info, warn};

use datastore_config::{CheckBindings, Parameters};

use crate::cache::CacheTable;
use crate::callback::{CallbackHandle, CallbackService};
use crate::context::Context;
use crate::entry::{AccessState, AwaitResult, Entry, EntryInner, EntryValue};
use crate::error::{StoreError, StoreResult};
use crate::evictor::{Evictor, EvictorHandle, EvictorSignal};
use crate::fetch::{BindingFetch, BindingUpgrade, FetchRequest, Fetcher};
use crate::key::{BindingKey, EntryKey, NodeId, ObjectId, TxnId};
use crate::metrics::initialise_metrics;
use crate::rpc_client::TcpServerClient;
use crate::server::{
    BindingWrite, FailureReporter, FailureTracker, ObjectWrite, ServerApi,
};
use crate::transaction::{ActiveTxns, PreviousKeyUndo, TxnContext};
use crate::update_queue::{UpdateItem, UpdateQueue, UpdateQueueHandle};

/// Liveness guard for the facade search loops. The loops converge in a few
/// iterations; exhausting the guard means a bug, which is reported as a node
/// failure rather than spinning forever.
const MAX_OPERATION_RETRIES: usize = 1000;

/// Result of a binding lookup: either the bound oid, or proof of absence with
/// the next bound name when one is cached.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetBindingOutcome {
    pub oid: Option<ObjectId>,
    pub next_name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetBindingOutcome {
    /// Whether the name was bound before this write.
    pub was_bound: bool,
    /// When the name was unbound, the next bound name the cache certified the
    /// absence with.
    pub next_name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoveBindingOutcome {
    pub was_bound: bool,
    pub next_name: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ShutdownState {
    NotRequested,
    Requested,
    TxnsCompleted,
    Completed,
}

struct ShutdownSync {
    state: ShutdownState,
    txn_count: usize,
}

/// The node-local caching data store.
///
/// All transactional operations are synchronous and run on the caller's
/// thread; waits are bounded by the transaction's stop time. Server I/O runs
/// on the store's own runtime.
pub struct CachingDataStore {
    inner: Arc<StoreInner>,
    evictor: Mutex<Option<EvictorHandle>>,
    queue_handle: Mutex<Option<UpdateQueueHandle>>,
    callback: Mutex<Option<CallbackHandle>>,
    /// Dropped last so background tasks can still run during shutdown.
    runtime: Runtime,
}

pub(crate) struct StoreInner {
    pub(crate) context: Arc<Context>,
    pub(crate) cache: Arc<CacheTable>,
    pub(crate) server: Arc<dyn ServerApi>,
    pub(crate) queue: Arc<UpdateQueue>,
    pub(crate) txns: ActiveTxns,
    pub(crate) fetcher: Arc<Fetcher>,
    pub(crate) failure: Arc<FailureTracker>,
    pub(crate) node_id: NodeId,
    handle: Handle,
    stopping: Arc<AtomicBool>,
    shutdown: Mutex<ShutdownSync>,
    shutdown_cond: Condvar,
    oids: Mutex<OidRange>,
    class_ids: DashMap<Bytes, u32>,
    class_infos: DashMap<u32, Bytes>,
}

#[derive(Default)]
struct OidRange {
    next: ObjectId,
    end: ObjectId,
}

impl CachingDataStore {
    /// Builds a store against the configured TCP server.
    pub fn connect(
        parameters: Parameters,
        reporter: Arc<dyn FailureReporter>,
        registry: Registry,
    ) -> StoreResult<Self> {
        let context = Arc::new(Context::new(
            parameters,
            initialise_metrics(registry),
        ));
        let server = Arc::new(TcpServerClient::new(context.clone()));
        Self::start(context, server, reporter)
    }

    /// Builds a store against an arbitrary [`ServerApi`] implementation.
    pub fn new(
        parameters: Parameters,
        server: Arc<dyn ServerApi>,
        reporter: Arc<dyn FailureReporter>,
        registry: Registry,
    ) -> StoreResult<Self> {
        let context = Arc::new(Context::new(
            parameters,
            initialise_metrics(registry),
        ));
        Self::start(context, server, reporter)
    }

    fn start(
        context: Arc<Context>,
        server: Arc<dyn ServerApi>,
        reporter: Arc<dyn FailureReporter>,
    ) -> StoreResult<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(4)
            .thread_name("datastore-io")
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();

        // Bind the callback port before registering, so the port announced to
        // the server is live when the first callback arrives.
        let listener = handle.block_on(CallbackService::bind(
            context.parameters.callback_port,
        ))?;
        let callback_port = listener
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or(context.parameters.callback_port);

        let registration = handle.block_on(server.register_node(callback_port))?;
        let node_id = registration.node_id;
        info!("registered with the data store server as node {node_id}");

        let failure = Arc::new(FailureTracker::new(reporter, context.clone()));
        let signal = Arc::new(EvictorSignal::new());
        let cache = Arc::new(CacheTable::new(context.clone(), {
            let signal = signal.clone();
            Box::new(move || signal.notify_full())
        }));
        let (queue, queue_handle) = UpdateQueue::start(
            context.clone(),
            cache.clone(),
            server.clone(),
            node_id,
            failure.clone(),
            &handle,
        );
        let queue = Arc::new(queue);
        let stopping = Arc::new(AtomicBool::new(false));
        let fetcher = Arc::new(Fetcher::new(
            context.clone(),
            cache.clone(),
            server.clone(),
            queue.clone(),
            failure.clone(),
            node_id,
            handle.clone(),
            stopping.clone(),
        ));
        let evictor = Evictor::start(
            context.clone(),
            cache.clone(),
            queue.clone(),
            fetcher.clone(),
            signal,
        );

        let inner = Arc::new(StoreInner {
            context,
            cache,
            server,
            queue,
            txns: ActiveTxns::new(),
            fetcher,
            failure,
            node_id,
            handle: handle.clone(),
            stopping,
            shutdown: Mutex::new(ShutdownSync {
                state: ShutdownState::NotRequested,
                txn_count: 0,
            }),
            shutdown_cond: Condvar::new(),
            oids: Mutex::new(OidRange::default()),
            class_ids: DashMap::new(),
            class_infos: DashMap::new(),
        });
        let callback = CallbackService::start(listener, Arc::downgrade(&inner), &handle);

        Ok(Self {
            inner,
            evictor: Mutex::new(Some(evictor)),
            queue_handle: Mutex::new(Some(queue_handle)),
            callback: Mutex::new(Some(callback)),
            runtime,
        })
    }

    /// Joins a transaction to the store, assigning its context ordinal and
    /// the deadline every wait of the transaction honors.
    pub fn join(&self, txn_id: TxnId, timeout: Duration) -> StoreResult<()> {
        self.inner.failure.check()?;
        {
            let mut shutdown = self.inner.shutdown.lock();
            if shutdown.state != ShutdownState::NotRequested {
                return Err(StoreError::InvalidState(
                    "shutdown has been requested".to_string(),
                ));
            }
            shutdown.txn_count += 1;
        }
        match self.inner.txns.join(txn_id, Instant::now() + timeout) {
            Ok(context) => {
                self.inner.queue.context_started(context.context_id);
                self.inner
                    .context
                    .metrics
                    .node_metrics
                    .active_transactions
                    .inc();
                Ok(())
            }
            Err(error) => {
                let mut shutdown = self.inner.shutdown.lock();
                shutdown.txn_count -= 1;
                if shutdown.txn_count == 0 {
                    self.inner.shutdown_cond.notify_all();
                }
                Err(error)
            }
        }
    }

    /// Allocates a fresh object id from the locally cached batch.
    pub fn create_object(&self, txn_id: TxnId) -> StoreResult<ObjectId> {
        let txn = self.inner.begin_op(txn_id)?;
        let oid = self.inner.allocate_oid()?;
        txn.note_new_object(oid);
        Ok(oid)
    }

    pub fn get_object(&self, txn_id: TxnId, oid: ObjectId, for_update: bool) -> StoreResult<Bytes> {
        self.inner.get_object(txn_id, oid, for_update)
    }

    pub fn set_object(&self, txn_id: TxnId, oid: ObjectId, data: Bytes) -> StoreResult<()> {
        self.inner.write_object(txn_id, oid, Some(data))
    }

    /// Removes an object; a later `get_object` raises `ObjectNotFound`.
    pub fn remove_object(&self, txn_id: TxnId, oid: ObjectId) -> StoreResult<()> {
        self.inner.write_object(txn_id, oid, None)
    }

    pub fn get_binding(&self, txn_id: TxnId, name: &str) -> StoreResult<GetBindingOutcome> {
        self.inner.get_binding(txn_id, name)
    }

    pub fn set_binding(
        &self,
        txn_id: TxnId,
        name: &str,
        oid: ObjectId,
    ) -> StoreResult<SetBindingOutcome> {
        self.inner.set_binding(txn_id, name, oid)
    }

    pub fn remove_binding(&self, txn_id: TxnId, name: &str) -> StoreResult<RemoveBindingOutcome> {
        self.inner.remove_binding(txn_id, name)
    }

    /// The first bound name strictly greater than `name`, or the first bound
    /// name overall when `name` is `None`.
    pub fn next_bound_name(&self, txn_id: TxnId, name: Option<&str>) -> StoreResult<Option<String>> {
        self.inner.next_bound_name(txn_id, name)
    }

    /// Validates the transaction without I/O: no accessed entry may have been
    /// decached.
    pub fn prepare(&self, txn_id: TxnId) -> StoreResult<()> {
        let txn = self.inner.txns.get(txn_id)?;
        self.inner.validate_prepare(&txn)?;
        txn.mark_prepared()
    }

    /// Commits the transaction: installs its buffered writes into the cache
    /// and ships them through the update queue as one atomic batch.
    pub fn commit(&self, txn_id: TxnId) -> StoreResult<()> {
        self.inner.commit(txn_id)
    }

    /// Aborts the transaction: reverses its reservations and structural
    /// edits, discards its modifications and leaves cached reads in place.
    pub fn abort(&self, txn_id: TxnId) -> StoreResult<()> {
        self.inner.abort(txn_id)
    }

    /// Server-initiated callbacks. `true` means applied synchronously;
    /// `false` promises the server an eventual evict or downgrade through the
    /// update queue.
    pub fn request_evict_object(&self, oid: ObjectId) -> bool {
        self.inner.request_evict_object(oid)
    }

    pub fn request_downgrade_object(&self, oid: ObjectId) -> bool {
        self.inner.request_downgrade_object(oid)
    }

    pub fn request_evict_binding(&self, key: &BindingKey) -> bool {
        self.inner.request_evict_binding(key)
    }

    pub fn request_downgrade_binding(&self, key: &BindingKey) -> bool {
        self.inner.request_downgrade_binding(key)
    }

    /// Class registry pass-through, memoized in both directions.
    pub fn get_class_id(&self, class_info: Bytes) -> StoreResult<u32> {
        self.inner.get_class_id(class_info)
    }

    pub fn get_class_info(&self, class_id: u32) -> StoreResult<Bytes> {
        self.inner.get_class_info(class_id)
    }

    /// Shuts the node down: rejects new transactions, drains the active ones,
    /// then stops the evictor, the fetch pool, the update queue and the
    /// callback service, in that order.
    pub fn shutdown(&self) -> StoreResult<()> {
        {
            let mut shutdown = self.inner.shutdown.lock();
            if shutdown.state != ShutdownState::NotRequested {
                return Err(StoreError::InvalidState(format!(
                    "shutdown already in state {:?}",
                    shutdown.state
                )));
            }
            shutdown.state = ShutdownState::Requested;
        }
        debug!("shutdown requested, draining transactions");
        {
            let mut shutdown = self.inner.shutdown.lock();
            while shutdown.txn_count > 0 {
                self.inner.shutdown_cond.wait(&mut shutdown);
            }
            shutdown.state = ShutdownState::TxnsCompleted;
        }

        if let Some(evictor) = self.evictor.lock().take() {
            evictor.stop();
        }
        self.inner.stopping.store(true, Ordering::Release);
        self.inner.queue.close();
        if let Some(queue_handle) = self.queue_handle.lock().take() {
            self.inner.handle.block_on(queue_handle.stop());
        }
        if let Some(callback) = self.callback.lock().take() {
            callback.stop();
        }

        self.inner.shutdown.lock().state = ShutdownState::Completed;
        info!("data store node shut down");
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn test_inner(&self) -> &Arc<StoreInner> {
        &self.inner
    }

    #[cfg(test)]
    pub(crate) fn callback_port(&self) -> u16 {
        self.callback
            .lock()
            .as_ref()
            .map(|callback| callback.port())
            .unwrap_or_default()
    }
}

impl Drop for CachingDataStore {
    fn drop(&mut self) {
        // Stop background work so dropping the runtime cannot wait on tasks
        // polling for quiescence.
        self.inner.stopping.store(true, Ordering::Release);
        self.inner.queue.close();
        if let Some(evictor) = self.evictor.lock().take() {
            evictor.stop();
        }
        if let Some(callback) = self.callback.lock().take() {
            callback.stop();
        }
    }
}

impl StoreInner {
    fn begin_op(&self, txn_id: TxnId) -> StoreResult<Arc<TxnContext>> {
        self.failure.check()?;
        self.txns.get(txn_id)
    }

    fn block_on<F: std::future::Future>(&self, future: F) -> F::Output {
        self.handle.block_on(future)
    }

    /// Marks the node failed before surfacing a permanent server error.
    fn escalate(&self, error: StoreError) -> StoreError {
        self.failure.report(&error);
        error
    }

    fn liveness_failure<T>(&self, operation: &str) -> StoreResult<T> {
        let error =
            StoreError::CacheConsistency(format!("{operation} retried without converging"));
        debug_assert!(false, "{error}");
        self.failure.report(&error);
        Err(error)
    }

    fn allocate_oid(&self) -> StoreResult<ObjectId> {
        loop {
            {
                let mut oids = self.oids.lock();
                if oids.next < oids.end {
                    let oid = oids.next;
                    oids.next += 1;
                    return Ok(oid);
                }
            }
            // Refill outside the lock; a concurrent refill is harmless, the
            // unused range is simply abandoned.
            let batch = self.context.parameters.object_id_batch_size;
            let range = self
                .block_on(self.server.new_object_ids(self.node_id, batch))
                .map_err(|error| self.escalate(error))?;
            let mut oids = self.oids.lock();
            oids.next = range.first;
            oids.end = range.first + range.count;
        }
    }

    // Object operations.

    fn get_object(&self, txn_id: TxnId, oid: ObjectId, for_update: bool) -> StoreResult<Bytes> {
        let txn = self.begin_op(txn_id)?;
        if let Some(buffered) = txn.buffered_object(oid) {
            return buffered.ok_or(StoreError::ObjectNotFound(oid));
        }

        'retry: for _ in 0..MAX_OPERATION_RETRIES {
            self.failure.check()?;
            let Some(entry) = self.object_entry(&txn, oid, for_update, false)? else {
                continue;
            };
            let mut inner = entry.lock();
            loop {
                let result = if for_update {
                    entry.await_writable(&mut inner, txn_id, txn.stop_time)
                } else {
                    entry.await_readable(&mut inner, txn_id, txn.stop_time)
                };
                match self.timeout_guard(result)? {
                    AwaitResult::Decached => continue 'retry,
                    AwaitResult::Readable if for_update => {
                        self.failure.check()?;
                        inner.start_upgrade();
                        self.fetcher.spawn_fetch(FetchRequest::UpgradeObject { oid });
                    }
                    _ => break,
                }
            }
            let value = inner.object_value().cloned();
            drop(inner);
            let Some(value) = value else {
                continue;
            };
            txn.note_access(&entry);
            return match value {
                Some(data) => Ok(data),
                None => Err(StoreError::ObjectNotFound(oid)),
            };
        }
        self.liveness_failure("get_object")
    }

    fn write_object(&self, txn_id: TxnId, oid: ObjectId, data: Option<Bytes>) -> StoreResult<()> {
        let txn = self.begin_op(txn_id)?;

        'retry: for _ in 0..MAX_OPERATION_RETRIES {
            self.failure.check()?;
            let Some(entry) = self.object_entry(&txn, oid, true, txn.is_new_object(oid))? else {
                continue;
            };
            let mut inner = entry.lock();
            loop {
                match self.timeout_guard(entry.await_writable(&mut inner, txn_id, txn.stop_time))? {
                    AwaitResult::Decached => continue 'retry,
                    AwaitResult::Readable => {
                        self.failure.check()?;
                        inner.start_upgrade();
                        self.fetcher.spawn_fetch(FetchRequest::UpgradeObject { oid });
                    }
                    AwaitResult::Writable => break,
                }
            }
            inner.locker = Some(txn_id);
            drop(inner);
            txn.note_write_locked(&entry);
            txn.note_access(&entry);
            txn.note_modified_object(oid, data);
            return Ok(());
        }
        self.liveness_failure("set_object")
    }

    /// Looks up or reserves the entry for `oid`. `None` means a lost race;
    /// the caller retries. New, locally-allocated objects get a writable
    /// entry with no server fetch.
    fn object_entry(
        &self,
        txn: &TxnContext,
        oid: ObjectId,
        for_update: bool,
        new_object: bool,
    ) -> StoreResult<Option<Arc<Entry>>> {
        let metrics = &self.context.metrics.node_metrics;
        let key = EntryKey::Object(oid);
        let _stripe = self.cache.key_lock(&key);
        if let Some(entry) = self.cache.get_object(oid) {
            metrics.cache_hits.with_label_values(&["objects"]).inc();
            return Ok(Some(entry));
        }
        metrics.cache_misses.with_label_values(&["objects"]).inc();

        let mut reservation = self.cache.reserve(1);
        if new_object {
            let entry = Arc::new(Entry::new_writable_object(oid, txn.txn_id, txn.context_id));
            if !self.cache.try_insert(entry.clone(), &mut reservation)? {
                return Ok(None);
            }
            txn.note_created_object(oid);
            txn.note_write_locked(&entry);
            return Ok(Some(entry));
        }

        let entry = Arc::new(Entry::new_fetching(key, txn.context_id));
        if !self.cache.try_insert(entry.clone(), &mut reservation)? {
            return Ok(None);
        }
        self.fetcher.spawn_fetch(if for_update {
            FetchRequest::ReadObjectForUpdate { oid }
        } else {
            FetchRequest::ReadObject { oid }
        });
        Ok(Some(entry))
    }

    // Binding operations.

    fn get_binding(&self, txn_id: TxnId, name: &str) -> StoreResult<GetBindingOutcome> {
        let txn = self.begin_op(txn_id)?;
        if let Some(buffered) = txn.buffered_binding(name) {
            return Ok(GetBindingOutcome {
                oid: buffered,
                next_name: None,
            });
        }
        let name_key = BindingKey::for_name(name);

        for _ in 0..MAX_OPERATION_RETRIES {
            self.failure.check()?;
            let Some(ceiling) = self.ceiling_entry(&name_key, &txn)? else {
                continue;
            };
            let own_key = ceiling.binding_key().expect("binding entry").clone();

            if own_key == name_key {
                let mut inner = ceiling.lock();
                if let AwaitResult::Decached = self.timeout_guard(ceiling.await_readable(
                    &mut inner,
                    txn_id,
                    txn.stop_time,
                ))? {
                    continue;
                }
                match inner.binding_value() {
                    Some(bound) => {
                        drop(inner);
                        self.hit("bindings");
                        txn.note_access(&ceiling);
                        self.after_binding_op()?;
                        return Ok(GetBindingOutcome {
                            oid: bound,
                            next_name: None,
                        });
                    }
                    None => continue,
                }
            }

            {
                let inner = ceiling.lock();
                if inner.readable()
                    && inner.available_to(txn_id)
                    && ceiling.known_unbound(&inner, &name_key)
                {
                    drop(inner);
                    self.hit("bindings");
                    txn.note_access(&ceiling);
                    self.after_binding_op()?;
                    return Ok(GetBindingOutcome {
                        oid: None,
                        next_name: own_key.name_allow_last().map(str::to_string),
                    });
                }
            }
            self.resolve_binding(&txn, &name_key, &ceiling, false)?;
        }
        self.liveness_failure("get_binding")
    }

    fn set_binding(
        &self,
        txn_id: TxnId,
        name: &str,
        oid: ObjectId,
    ) -> StoreResult<SetBindingOutcome> {
        let txn = self.begin_op(txn_id)?;
        let name_key = BindingKey::for_name(name);

        for _ in 0..MAX_OPERATION_RETRIES {
            self.failure.check()?;
            let Some(ceiling) = self.ceiling_entry(&name_key, &txn)? else {
                continue;
            };
            let own_key = ceiling.binding_key().expect("binding entry").clone();

            if own_key == name_key {
                let mut inner = ceiling.lock();
                match self.timeout_guard(ceiling.await_writable(
                    &mut inner,
                    txn_id,
                    txn.stop_time,
                ))? {
                    AwaitResult::Decached => continue,
                    AwaitResult::Readable => {
                        self.failure.check()?;
                        inner.start_upgrade();
                        drop(inner);
                        self.fetcher.spawn_fetch(FetchRequest::UpgradeBinding {
                            name: name.to_string(),
                            entry: Arc::downgrade(&ceiling),
                            kind: BindingUpgrade::Exact,
                        });
                        continue;
                    }
                    AwaitResult::Writable => {}
                }
                let was_bound = match txn.buffered_binding(name) {
                    Some(buffered) => buffered.is_some(),
                    None => matches!(inner.binding_value(), Some(Some(_))),
                };
                inner.locker = Some(txn_id);
                drop(inner);
                txn.note_write_locked(&ceiling);
                txn.note_access(&ceiling);
                txn.note_modified_binding(name.to_string(), Some(oid));
                self.after_binding_op()?;
                return Ok(SetBindingOutcome {
                    was_bound,
                    next_name: None,
                });
            }

            // Absence path: the write inserts a new entry, which extends the
            // ceiling's certified range, so the ceiling must be writable and
            // the proof of absence must hold while its interval is owned.
            let (ceiling_prev, ceiling_prev_unbound) = {
                let mut inner = ceiling.lock();
                if !(inner.readable() && ceiling.known_unbound(&inner, &name_key)) {
                    drop(inner);
                    self.resolve_binding(&txn, &name_key, &ceiling, true)?;
                    continue;
                }
                match self.timeout_guard(ceiling.await_writable(
                    &mut inner,
                    txn_id,
                    txn.stop_time,
                ))? {
                    AwaitResult::Decached => continue,
                    AwaitResult::Readable => {
                        self.failure.check()?;
                        inner.start_upgrade();
                        drop(inner);
                        self.fetcher.spawn_fetch(FetchRequest::UpgradeBinding {
                            name: name.to_string(),
                            entry: Arc::downgrade(&ceiling),
                            kind: BindingUpgrade::Next,
                        });
                        continue;
                    }
                    AwaitResult::Writable => {}
                }
                self.timeout_guard(ceiling.await_not_pending_previous(
                    &mut inner,
                    txn_id,
                    txn.stop_time,
                ))?;
                // The waits released the entry lock; re-validate the whole
                // premise before mutating the range.
                if inner.decached()
                    || !inner.writable()
                    || !inner.available_to(txn_id)
                    || !self.assure_next_entry(&ceiling, &inner, &name_key)
                    || !ceiling.known_unbound(&inner, &name_key)
                {
                    continue;
                }

                inner.pending_previous = true;
                let previous = (inner.previous_key.clone(), inner.previous_key_unbound);
                txn.note_previous_key_change(PreviousKeyUndo {
                    key: own_key.clone(),
                    previous_key: previous.0.clone(),
                    previous_key_unbound: previous.1,
                    expected_previous_key: Some(name_key.clone()),
                });
                inner.previous_key = Some(name_key.clone());
                inner.previous_key_unbound = false;
                inner.locker = Some(txn_id);
                previous
            };
            txn.note_write_locked(&ceiling);

            // The new entry takes over the lower part of the ceiling's old
            // range. A degenerate lower bound equal to the new name itself
            // carries no information.
            let new_prev = match &ceiling_prev {
                Some(prev) if *prev == name_key => None,
                other => other.clone(),
            };
            let new_prev_unbound = new_prev.is_some() && ceiling_prev_unbound;
            let entry = Arc::new(Entry::new_writable_binding(
                name_key.clone(),
                txn_id,
                txn.context_id,
                new_prev,
                new_prev_unbound,
            ));
            let inserted = {
                let key = EntryKey::Binding(name_key.clone());
                let _stripe = self.cache.key_lock(&key);
                let mut reservation = self.cache.reserve(1);
                self.cache.try_insert(entry.clone(), &mut reservation)?
            };
            {
                let mut inner = ceiling.lock();
                inner.pending_previous = false;
                if !inserted {
                    // Lost a race; put the old range back and retry.
                    inner.previous_key = ceiling_prev.clone();
                    inner.previous_key_unbound = ceiling_prev_unbound;
                }
            }
            ceiling.notify_all();
            if !inserted {
                continue;
            }
            txn.note_created_binding(name_key.clone());
            txn.note_write_locked(&entry);
            txn.note_access(&ceiling);
            txn.note_access(&entry);
            txn.note_modified_binding(name.to_string(), Some(oid));
            self.after_binding_op()?;
            return Ok(SetBindingOutcome {
                was_bound: false,
                next_name: own_key.name_allow_last().map(str::to_string),
            });
        }
        self.liveness_failure("set_binding")
    }

    fn remove_binding(&self, txn_id: TxnId, name: &str) -> StoreResult<RemoveBindingOutcome> {
        let txn = self.begin_op(txn_id)?;
        let name_key = BindingKey::for_name(name);

        for _ in 0..MAX_OPERATION_RETRIES {
            self.failure.check()?;
            let Some(ceiling) = self.ceiling_entry(&name_key, &txn)? else {
                continue;
            };
            let own_key = ceiling.binding_key().expect("binding entry").clone();

            if own_key != name_key {
                // No exact entry; a remove of an unbound name only needs the
                // proof of absence.
                let inner = ceiling.lock();
                if inner.readable()
                    && inner.available_to(txn_id)
                    && ceiling.known_unbound(&inner, &name_key)
                {
                    drop(inner);
                    txn.note_access(&ceiling);
                    self.after_binding_op()?;
                    return Ok(RemoveBindingOutcome {
                        was_bound: false,
                        next_name: own_key.name_allow_last().map(str::to_string),
                    });
                }
                drop(inner);
                self.resolve_binding(&txn, &name_key, &ceiling, false)?;
                continue;
            }

            // Target first: writable and owned by this transaction.
            {
                let mut inner = ceiling.lock();
                match self.timeout_guard(ceiling.await_writable(
                    &mut inner,
                    txn_id,
                    txn.stop_time,
                ))? {
                    AwaitResult::Decached => continue,
                    AwaitResult::Readable => {
                        self.failure.check()?;
                        inner.start_upgrade();
                        drop(inner);
                        self.fetcher.spawn_fetch(FetchRequest::UpgradeBinding {
                            name: name.to_string(),
                            entry: Arc::downgrade(&ceiling),
                            kind: BindingUpgrade::ExactForRemove,
                        });
                        continue;
                    }
                    AwaitResult::Writable => {}
                }
                let unbound = match txn.buffered_binding(name) {
                    Some(buffered) => buffered.is_none(),
                    None => inner.binding_value() == Some(None),
                };
                if unbound {
                    drop(inner);
                    txn.note_access(&ceiling);
                    self.after_binding_op()?;
                    return Ok(RemoveBindingOutcome {
                        was_bound: false,
                        next_name: None,
                    });
                }
                inner.locker = Some(txn_id);
            }
            txn.note_write_locked(&ceiling);
            txn.note_access(&ceiling);

            // Then the successor, under its previous-key interval.
            let Some(next_entry) = self.acquire_remove_successor(&txn, name, &name_key)? else {
                continue;
            };
            let next_key = next_entry.binding_key().expect("binding entry").clone();

            let (target_prev, target_prev_unbound) = {
                let inner = ceiling.lock();
                (inner.previous_key.clone(), inner.previous_key_unbound)
            };
            {
                let mut inner = next_entry.lock();
                txn.note_previous_key_change(PreviousKeyUndo {
                    key: next_key.clone(),
                    previous_key: inner.previous_key.clone(),
                    previous_key_unbound: inner.previous_key_unbound,
                    expected_previous_key: target_prev.clone(),
                });
                inner.previous_key = target_prev;
                inner.previous_key_unbound = target_prev_unbound;
                inner.locker = Some(txn_id);
                inner.pending_previous = false;
            }
            next_entry.notify_all();
            txn.note_write_locked(&next_entry);
            txn.note_access(&next_entry);
            txn.note_modified_binding(name.to_string(), None);
            self.after_binding_op()?;
            return Ok(RemoveBindingOutcome {
                was_bound: true,
                next_name: next_key.name_allow_last().map(str::to_string),
            });
        }
        self.liveness_failure("remove_binding")
    }

    fn next_bound_name(&self, txn_id: TxnId, name: Option<&str>) -> StoreResult<Option<String>> {
        let txn = self.begin_op(txn_id)?;
        let mut search_key = name
            .map(BindingKey::for_name)
            .unwrap_or(BindingKey::First);

        for _ in 0..MAX_OPERATION_RETRIES {
            self.failure.check()?;
            let Some(entry) = self.cache.higher_binding(&search_key) else {
                self.create_provisional_last(&txn)?;
                continue;
            };
            let own_key = entry.binding_key().expect("binding entry").clone();

            {
                let inner = entry.lock();
                if inner.readable()
                    && inner.available_to(txn_id)
                    && entry.is_next_entry(&inner, &search_key)
                {
                    if own_key.is_last() {
                        drop(inner);
                        txn.note_access(&entry);
                        self.after_binding_op()?;
                        return Ok(None);
                    }
                    // This transaction's own writes win over the entry value,
                    // which only reflects them after commit.
                    let effective = match own_key.name().and_then(|next| txn.buffered_binding(next))
                    {
                        Some(buffered) => Some(buffered),
                        None => inner.binding_value(),
                    };
                    match effective {
                        Some(Some(_)) => {
                            drop(inner);
                            txn.note_access(&entry);
                            self.after_binding_op()?;
                            return Ok(own_key.name_allow_last().map(str::to_string));
                        }
                        Some(None) => {
                            // Tombstoned or removed in this transaction; the
                            // next bound name lies above it.
                            drop(inner);
                            txn.note_access(&entry);
                            search_key = own_key;
                            continue;
                        }
                        None => {}
                    }
                }
            }

            // The entry cannot prove it is the next one; ask the server.
            let reservation = self.cache.reserve(1);
            {
                let mut inner = entry.lock();
                self.timeout_guard(entry.await_not_pending_previous(
                    &mut inner,
                    txn_id,
                    txn.stop_time,
                ))?;
                if inner.decached() || !self.still_higher(&search_key, &entry) {
                    continue;
                }
                if matches!(
                    inner.access,
                    AccessState::Readable {
                        fetching_upgrade: true
                    }
                ) {
                    // An upgrade owns the entry state; take a bounded nap and
                    // re-examine.
                    entry.wait_for(&mut inner, self.context.parameters.lock_timeout);
                    continue;
                }
                inner.pending_previous = true;
            }
            self.miss("bindings");
            self.fetcher.spawn_fetch(FetchRequest::NextBoundName {
                fetch: BindingFetch {
                    name_key: search_key.clone(),
                    owner: Arc::downgrade(&entry),
                    context_id: txn.context_id,
                    reservation,
                },
            });

            // Wait for the fetch to release the interval, then re-examine.
            let mut inner = entry.lock();
            self.timeout_guard(entry.await_not_pending_previous(
                &mut inner,
                txn_id,
                txn.stop_time,
            ))?;
        }
        self.liveness_failure("next_bound_name")
    }

    // Binding helpers.

    fn hit(&self, keyspace: &str) {
        self.context
            .metrics
            .node_metrics
            .cache_hits
            .with_label_values(&[keyspace])
            .inc();
    }

    fn miss(&self, keyspace: &str) {
        self.context
            .metrics
            .node_metrics
            .cache_misses
            .with_label_values(&[keyspace])
            .inc();
    }

    /// Counts await timeouts before surfacing them.
    fn timeout_guard<T>(&self, result: StoreResult<T>) -> StoreResult<T> {
        if let Err(StoreError::TransactionTimeout(_)) = &result {
            self.context
                .metrics
                .node_metrics
                .transaction_timeouts
                .inc();
        }
        result
    }

    /// The smallest cached binding entry at or above `name_key`, creating the
    /// provisional `Last` entry when the upper end of the keyspace is not
    /// cached. `None` means a lost race; the caller retries.
    fn ceiling_entry(
        &self,
        name_key: &BindingKey,
        txn: &TxnContext,
    ) -> StoreResult<Option<Arc<Entry>>> {
        if let Some(entry) = self.cache.ceiling_binding(name_key) {
            return Ok(Some(entry));
        }
        self.create_provisional_last(txn)?;
        Ok(self.cache.ceiling_binding(name_key))
    }

    fn create_provisional_last(&self, txn: &TxnContext) -> StoreResult<()> {
        let key = EntryKey::Binding(BindingKey::Last);
        let _stripe = self.cache.key_lock(&key);
        if self.cache.get_binding(&BindingKey::Last).is_some() {
            return Ok(());
        }
        let mut reservation = self.cache.reserve(1);
        let entry = Arc::new(Entry::new_provisional_last(txn.context_id));
        self.cache.try_insert(entry, &mut reservation)?;
        Ok(())
    }

    /// Re-validates, under the entry lock, that `entry` is still the next
    /// entry to use for `name_key`: no lower entry has been inserted, no
    /// upgrade is in flight, and the entry is readable or still being read.
    fn assure_next_entry(
        &self,
        entry: &Arc<Entry>,
        inner: &EntryInner,
        name_key: &BindingKey,
    ) -> bool {
        match self.cache.ceiling_binding(name_key) {
            Some(current) if Arc::ptr_eq(&current, entry) => {}
            _ => return false,
        }
        match inner.access {
            AccessState::Readable {
                fetching_upgrade: true,
            } => false,
            AccessState::Readable { .. }
            | AccessState::Writable { .. }
            | AccessState::FetchingRead => true,
            _ => false,
        }
    }

    fn still_higher(&self, search_key: &BindingKey, entry: &Arc<Entry>) -> bool {
        matches!(
            self.cache.higher_binding(search_key),
            Some(current) if Arc::ptr_eq(&current, entry)
        )
    }

    /// Schedules a server consultation about `name_key` with the ceiling's
    /// previous-key interval owned by the fetch, then waits for the fetch to
    /// complete, bounded by the transaction stop time. The caller retries
    /// its outer loop afterwards; a failed fetch marks the node failed,
    /// which the retry observes.
    fn resolve_binding(
        &self,
        txn: &TxnContext,
        name_key: &BindingKey,
        ceiling: &Arc<Entry>,
        for_update: bool,
    ) -> StoreResult<()> {
        let reservation = self.cache.reserve(1);
        {
            let mut inner = ceiling.lock();
            self.timeout_guard(ceiling.await_not_pending_previous(
                &mut inner,
                txn.txn_id,
                txn.stop_time,
            ))?;
            if inner.decached() {
                return Ok(());
            }
            if !self.assure_next_entry(ceiling, &inner, name_key) {
                // Either a closer entry arrived (the retry picks it up) or
                // this entry is in a transitional state; a bounded nap
                // covers the latter without spinning.
                if matches!(
                    self.cache.ceiling_binding(name_key),
                    Some(current) if Arc::ptr_eq(&current, ceiling)
                ) {
                    ceiling.wait_for(&mut inner, self.context.parameters.lock_timeout);
                }
                return Ok(());
            }
            inner.pending_previous = true;
        }
        self.miss("bindings");
        self.fetcher.spawn_fetch(FetchRequest::ReadBinding {
            fetch: BindingFetch {
                name_key: name_key.clone(),
                owner: Arc::downgrade(ceiling),
                context_id: txn.context_id,
                reservation,
            },
            for_update,
        });

        // Wait for the fetch to release the interval.
        let mut inner = ceiling.lock();
        self.timeout_guard(ceiling.await_not_pending_previous(
            &mut inner,
            txn.txn_id,
            txn.stop_time,
        ))?;
        Ok(())
    }

    /// Stabilizes the successor of a name being removed: cached, writable,
    /// certifying no bound names in between, and its interval owned by this
    /// call. Returns the successor with `pending_previous` set.
    fn acquire_remove_successor(
        &self,
        txn: &TxnContext,
        name: &str,
        name_key: &BindingKey,
    ) -> StoreResult<Option<Arc<Entry>>> {
        for _ in 0..MAX_OPERATION_RETRIES {
            self.failure.check()?;
            let Some(next_entry) = self.cache.higher_binding(name_key) else {
                self.create_provisional_last(txn)?;
                continue;
            };
            let mut inner = next_entry.lock();
            self.timeout_guard(next_entry.await_not_pending_previous(
                &mut inner,
                txn.txn_id,
                txn.stop_time,
            ))?;
            if inner.decached() || !self.still_higher(name_key, &next_entry) {
                continue;
            }
            if !next_entry.is_next_entry(&inner, name_key)
                || matches!(inner.access, AccessState::FetchingRead)
            {
                drop(inner);
                self.resolve_remove_successor(txn, name_key, &next_entry)?;
                continue;
            }
            match self.timeout_guard(next_entry.await_writable(
                &mut inner,
                txn.txn_id,
                txn.stop_time,
            ))? {
                AwaitResult::Decached => continue,
                AwaitResult::Readable => {
                    self.failure.check()?;
                    inner.start_upgrade();
                    drop(inner);
                    self.fetcher.spawn_fetch(FetchRequest::UpgradeBinding {
                        name: name.to_string(),
                        entry: Arc::downgrade(&next_entry),
                        kind: BindingUpgrade::NextForRemove,
                    });
                    continue;
                }
                AwaitResult::Writable => {}
            }
            // The wait released the entry lock; re-validate before taking
            // the interval.
            if inner.decached()
                || inner.pending_previous
                || !self.still_higher(name_key, &next_entry)
                || !next_entry.is_next_entry(&inner, name_key)
            {
                continue;
            }
            inner.pending_previous = true;
            drop(inner);
            return Ok(Some(next_entry));
        }
        self.liveness_failure("remove_binding successor")
    }

    /// Schedules the for-remove consultation that learns the true successor
    /// (and its write grant), then waits for it to complete, bounded by the
    /// transaction stop time.
    fn resolve_remove_successor(
        &self,
        txn: &TxnContext,
        name_key: &BindingKey,
        next_entry: &Arc<Entry>,
    ) -> StoreResult<()> {
        let reservation = self.cache.reserve(1);
        {
            let mut inner = next_entry.lock();
            self.timeout_guard(next_entry.await_not_pending_previous(
                &mut inner,
                txn.txn_id,
                txn.stop_time,
            ))?;
            if inner.decached() || !self.still_higher(name_key, next_entry) {
                return Ok(());
            }
            inner.pending_previous = true;
        }
        self.miss("bindings");
        self.fetcher.spawn_fetch(FetchRequest::RemoveBinding {
            fetch: BindingFetch {
                name_key: name_key.clone(),
                owner: Arc::downgrade(next_entry),
                context_id: txn.context_id,
                reservation,
            },
        });

        let mut inner = next_entry.lock();
        self.timeout_guard(next_entry.await_not_pending_previous(
            &mut inner,
            txn.txn_id,
            txn.stop_time,
        ))?;
        Ok(())
    }

    // Transaction lifecycle.

    fn validate_prepare(&self, txn: &TxnContext) -> StoreResult<()> {
        for entry in txn.accesses() {
            if entry.lock().decached() {
                return Err(StoreError::InvalidState(format!(
                    "entry {} was evicted during transaction {}",
                    entry.key(),
                    txn.txn_id
                )));
            }
        }
        Ok(())
    }

    fn commit(&self, txn_id: TxnId) -> StoreResult<()> {
        let txn = self.txns.get(txn_id)?;
        if !txn.is_prepared() {
            self.validate_prepare(&txn)?;
        }

        let (object_mods, binding_mods) = txn.take_modifications();
        let result = self.ship_commit(&txn, object_mods, binding_mods);
        self.release_write_intent(&txn);
        if !matches!(result, Ok(true)) {
            self.queue.context_settled(txn.context_id);
        }
        self.check_after_txn();
        self.finish_txn(&txn);
        self.context
            .metrics
            .node_metrics
            .committed_transactions
            .inc();
        result.map(|_| ())
    }

    /// Installs the buffered writes into their entries and enqueues the
    /// commit batch. Returns whether anything was shipped.
    fn ship_commit(
        &self,
        txn: &TxnContext,
        object_mods: std::collections::BTreeMap<ObjectId, Option<Bytes>>,
        binding_mods: std::collections::BTreeMap<String, Option<ObjectId>>,
    ) -> StoreResult<bool> {
        if object_mods.is_empty() && binding_mods.is_empty() {
            return Ok(false);
        }

        let mut object_writes = Vec::with_capacity(object_mods.len());
        for (oid, data) in object_mods {
            let entry = self.cache.get_object(oid).ok_or_else(|| {
                StoreError::CacheConsistency(format!("modified object {oid} not cached"))
            })?;
            let mut inner = entry.lock();
            inner.install_commit(EntryValue::Object(data.clone()), txn.context_id);
            drop(inner);
            entry.notify_all();
            object_writes.push(ObjectWrite { oid, data });
        }

        let mut binding_writes = Vec::with_capacity(binding_mods.len());
        for (name, oid) in binding_mods {
            let key = BindingKey::for_name(name.clone());
            let entry = self.cache.get_binding(&key).ok_or_else(|| {
                StoreError::CacheConsistency(format!("modified binding {name:?} not cached"))
            })?;
            let mut inner = entry.lock();
            inner.install_commit(EntryValue::Binding(oid), txn.context_id);
            let previous_key = inner.previous_key.clone();
            let previous_key_unbound = inner.previous_key_unbound;
            drop(inner);
            entry.notify_all();
            binding_writes.push(BindingWrite {
                name,
                oid,
                previous_key,
                previous_key_unbound,
            });
        }

        self.queue.enqueue_blocking(UpdateItem::Commit {
            context_id: txn.context_id,
            object_writes,
            binding_writes,
        })?;
        Ok(true)
    }

    fn abort(&self, txn_id: TxnId) -> StoreResult<()> {
        let txn = self.txns.get(txn_id)?;
        let _ = txn.take_modifications();
        let (created_bindings, created_objects, undos) = txn.take_reversals();

        for undo in undos {
            if let Some(entry) = self.cache.get_binding(&undo.key) {
                let mut inner = entry.lock();
                if inner.previous_key == undo.expected_previous_key {
                    inner.previous_key = undo.previous_key;
                    inner.previous_key_unbound = undo.previous_key_unbound;
                }
                drop(inner);
                entry.notify_all();
            }
        }
        for key in created_bindings {
            if let Some(entry) = self.cache.get_binding(&key) {
                self.drop_entry(&entry);
            }
        }
        for oid in created_objects {
            if let Some(entry) = self.cache.get_object(oid) {
                self.drop_entry(&entry);
            }
        }
        self.release_write_intent(&txn);

        self.queue.context_settled(txn.context_id);
        self.check_after_txn();
        self.finish_txn(&txn);
        self.context
            .metrics
            .node_metrics
            .aborted_transactions
            .inc();
        Ok(())
    }

    fn drop_entry(&self, entry: &Arc<Entry>) {
        let mut inner = entry.lock();
        if !inner.decached() {
            inner.decache_immediately();
        }
        drop(inner);
        entry.notify_all();
        self.cache.remove(entry);
    }

    fn release_write_intent(&self, txn: &TxnContext) {
        for entry in txn.take_write_locked() {
            let mut inner = entry.lock();
            if inner.locker == Some(txn.txn_id) {
                inner.locker = None;
            }
            drop(inner);
            entry.notify_all();
        }
    }

    fn finish_txn(&self, txn: &TxnContext) {
        self.txns.remove(txn.txn_id);
        self.context
            .metrics
            .node_metrics
            .active_transactions
            .dec();
        let mut shutdown = self.shutdown.lock();
        shutdown.txn_count = shutdown.txn_count.saturating_sub(1);
        if shutdown.txn_count == 0 {
            self.shutdown_cond.notify_all();
        }
    }

    // Server-initiated callbacks.

    pub(crate) fn request_evict_object(&self, oid: ObjectId) -> bool {
        match self.cache.get_object(oid) {
            Some(entry) => self.request_evict(&entry),
            None => true,
        }
    }

    pub(crate) fn request_evict_binding(&self, key: &BindingKey) -> bool {
        match self.cache.get_binding(key) {
            Some(entry) => self.request_evict(&entry),
            None => true,
        }
    }

    fn request_evict(&self, entry: &Arc<Entry>) -> bool {
        let mut inner = entry.lock();
        if inner.decached() {
            return true;
        }
        if !inner.in_use(self.queue.highest_settled_context_id()) {
            // The server asked, so no round trip is needed to apply it.
            inner.decache_immediately();
            drop(inner);
            entry.notify_all();
            self.cache.remove(entry);
            self.context
                .metrics
                .node_metrics
                .evictions_immediate
                .inc();
            return true;
        }
        drop(inner);
        self.fetcher.schedule_deferred_evict(entry.key().clone());
        false
    }

    pub(crate) fn request_downgrade_object(&self, oid: ObjectId) -> bool {
        match self.cache.get_object(oid) {
            Some(entry) => self.request_downgrade(&entry),
            None => true,
        }
    }

    pub(crate) fn request_downgrade_binding(&self, key: &BindingKey) -> bool {
        match self.cache.get_binding(key) {
            Some(entry) => self.request_downgrade(&entry),
            None => true,
        }
    }

    fn request_downgrade(&self, entry: &Arc<Entry>) -> bool {
        let mut inner = entry.lock();
        if !inner.writable() {
            // Already readable or decached; a downgrade in flight will settle
            // the server on its own.
            return !inner.downgrading();
        }
        if !inner.in_use_for_write(self.queue.highest_settled_context_id()) {
            inner.start_downgrade();
            inner.finish_downgrade();
            drop(inner);
            entry.notify_all();
            self.context.metrics.node_metrics.downgrades.inc();
            return true;
        }
        drop(inner);
        self.fetcher.schedule_deferred_downgrade(entry.key().clone());
        false
    }

    // Class registry.

    fn get_class_id(&self, class_info: Bytes) -> StoreResult<u32> {
        if let Some(class_id) = self.class_ids.get(&class_info) {
            return Ok(*class_id);
        }
        self.failure.check()?;
        let class_id = self
            .block_on(self.server.get_class_id(self.node_id, class_info.clone()))
            .map_err(|error| self.escalate(error))?;
        self.class_ids.insert(class_info.clone(), class_id);
        self.class_infos.insert(class_id, class_info);
        Ok(class_id)
    }

    fn get_class_info(&self, class_id: u32) -> StoreResult<Bytes> {
        if let Some(class_info) = self.class_infos.get(&class_id) {
            return Ok(class_info.clone());
        }
        self.failure.check()?;
        let class_info = self
            .block_on(self.server.get_class_info(self.node_id, class_id))
            .map_err(|error| self.escalate(error))?;
        self.class_infos.insert(class_id, class_info.clone());
        self.class_ids.insert(class_info.clone(), class_id);
        Ok(class_info)
    }

    // Invariant checking.

    fn after_binding_op(&self) -> StoreResult<()> {
        if self.context.parameters.check_bindings == CheckBindings::Operation {
            self.check_bindings_now()?;
        }
        Ok(())
    }

    fn check_after_txn(&self) {
        if self.context.parameters.check_bindings == CheckBindings::Txn {
            if let Err(error) = self.check_bindings_now() {
                warn!("binding check after transaction failed: {error}");
            }
        }
    }

    /// Walks the ordered binding index and verifies the range invariants:
    /// every certified range lies strictly below its entry and claims no
    /// settled bound name. Entries under an uncommitted write are exempt;
    /// their write intent shields the intermediate state from readers.
    fn check_bindings_now(&self) -> StoreResult<()> {
        let mut previous: Option<(BindingKey, bool)> = None;
        for entry in self.cache.bindings_snapshot() {
            let inner = entry.lock();
            let own_key = entry.binding_key().expect("binding entry");
            if let Some(prev) = &inner.previous_key {
                if prev >= own_key {
                    return self.consistency_failure(format!(
                        "entry {own_key} has previous key {prev} at or above itself"
                    ));
                }
                if let Some((before_key, before_bound)) = &previous {
                    if *before_bound && prev < before_key {
                        return self.consistency_failure(format!(
                            "entry {own_key} certifies bound name {before_key} as unbound"
                        ));
                    }
                }
            }
            let bound = matches!(inner.binding_value(), Some(Some(_)))
                && inner.locker.is_none()
                && !inner.modified;
            previous = Some((own_key.clone(), bound));
        }
        Ok(())
    }

    fn consistency_failure(&self, message: String) -> StoreResult<()> {
        let error = StoreError::CacheConsistency(message);
        self.failure.report(&error);
        Err(error)
    }
}



// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The update queue ships committed changes to the server in commit order.
//!
//! A single worker consumes the queue FIFO, so a commit followed by an evict
//! of the same key reaches the server in that order and the evict completes
//! only after the commit has been acknowledged. Completions re-look up their
//! entry by key under the entry lock; the queue never holds an entry across
//! server I/O.
//!
//! The queue also maintains the settled-context watermark: a context id is
//! pending from the moment its transaction joins until the transaction aborts
//! or its commit item is acknowledged. An entry whose last-use context id is
//! at or below the watermark has no update in flight and may be evicted
//! without draining.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::CacheTable;
use crate::context::Context;
use crate::entry::Entry;
use crate::error::{StoreError, StoreResult};
use crate::key::{BindingKey, ContextId, NodeId, ObjectId};
use crate::server::{BindingWrite, FailureTracker, ObjectWrite, ServerApi};

#[derive(Debug)]
pub(crate) enum UpdateItem {
    /// One transaction's writes, shipped as an atomic batch.
    Commit {
        context_id: ContextId,
        object_writes: Vec<ObjectWrite>,
        binding_writes: Vec<BindingWrite>,
    },
    EvictObject { oid: ObjectId },
    EvictBinding { key: BindingKey },
    DowngradeObject { oid: ObjectId },
    DowngradeBinding { key: BindingKey },
}

pub(crate) struct UpdateQueue {
    /// Taken by [`UpdateQueue::close`] so the worker can drain and exit while
    /// shared handles to the queue remain alive.
    sender: Mutex<Option<mpsc::Sender<UpdateItem>>>,
    state: Arc<QueueState>,
    context: Arc<Context>,
}

pub(crate) struct UpdateQueueHandle {
    join_handle: JoinHandle<()>,
}

impl UpdateQueueHandle {
    /// Waits for the worker to drain. Every sender must have been dropped.
    pub(crate) async fn stop(self) {
        self.join_handle.await.ok();
    }
}

struct QueueState {
    pending: Mutex<PendingContexts>,
}

struct PendingContexts {
    /// Context ids joined but not yet settled.
    started: BTreeSet<ContextId>,
    highest_started: ContextId,
}

impl QueueState {
    fn settle(&self, context_id: ContextId) {
        self.pending.lock().started.remove(&context_id);
    }
}

impl UpdateQueue {
    pub(crate) fn start(
        context: Arc<Context>,
        cache: Arc<CacheTable>,
        server: Arc<dyn ServerApi>,
        node_id: NodeId,
        failure: Arc<FailureTracker>,
        handle: &Handle,
    ) -> (Self, UpdateQueueHandle) {
        let (sender, receiver) = mpsc::channel(context.parameters.update_queue_size);
        let state = Arc::new(QueueState {
            pending: Mutex::new(PendingContexts {
                started: BTreeSet::new(),
                highest_started: 0,
            }),
        });
        let worker = QueueWorker {
            context: context.clone(),
            cache,
            server,
            node_id,
            failure,
            state: state.clone(),
            receiver,
        };
        let join_handle = handle.spawn(worker.run());
        (
            Self {
                sender: Mutex::new(Some(sender)),
                state,
                context,
            },
            UpdateQueueHandle { join_handle },
        )
    }

    /// Stops accepting items; the worker drains what is already enqueued and
    /// exits.
    pub(crate) fn close(&self) {
        self.sender.lock().take();
    }

    /// Records that a transaction with `context_id` joined; its writes are
    /// considered pending until it settles.
    pub(crate) fn context_started(&self, context_id: ContextId) {
        let mut pending = self.state.pending.lock();
        pending.started.insert(context_id);
        pending.highest_started = pending.highest_started.max(context_id);
    }

    /// Settles a context that will ship nothing: an abort or a read-only
    /// commit.
    pub(crate) fn context_settled(&self, context_id: ContextId) {
        self.state.settle(context_id);
    }

    /// Highest context id with no pending update. Entries last written at or
    /// below it may be evicted without further server interaction.
    pub(crate) fn highest_settled_context_id(&self) -> ContextId {
        let pending = self.state.pending.lock();
        match pending.started.first() {
            Some(lowest_pending) => lowest_pending - 1,
            None => pending.highest_started,
        }
    }

    /// Enqueues from a transaction or evictor thread, blocking while the
    /// queue is at capacity.
    pub(crate) fn enqueue_blocking(&self, item: UpdateItem) -> StoreResult<()> {
        let sender = self.sender.lock().clone().ok_or_else(queue_stopped)?;
        self.context.metrics.node_metrics.update_queue_depth.inc();
        sender.blocking_send(item).map_err(|_| queue_stopped())
    }

    /// Enqueues from a task on the I/O runtime.
    pub(crate) async fn enqueue(&self, item: UpdateItem) -> StoreResult<()> {
        let sender = self.sender.lock().clone().ok_or_else(queue_stopped)?;
        self.context.metrics.node_metrics.update_queue_depth.inc();
        sender.send(item).await.map_err(|_| queue_stopped())
    }
}

fn queue_stopped() -> StoreError {
    StoreError::InvalidState("update queue has stopped".to_string())
}

struct QueueWorker {
    context: Arc<Context>,
    cache: Arc<CacheTable>,
    server: Arc<dyn ServerApi>,
    node_id: NodeId,
    failure: Arc<FailureTracker>,
    state: Arc<QueueState>,
    receiver: mpsc::Receiver<UpdateItem>,
}

impl QueueWorker {
    async fn run(mut self) {
        debug!("update queue started");
        while let Some(item) = self.receiver.recv().await {
            self.context.metrics.node_metrics.update_queue_depth.dec();
            self.process(item).await;
        }
        debug!("update queue stopped");
    }

    async fn process(&self, item: UpdateItem) {
        match item {
            UpdateItem::Commit {
                context_id,
                object_writes,
                binding_writes,
            } => {
                self.ship(self.server.commit(
                    self.node_id,
                    context_id,
                    object_writes.clone(),
                    binding_writes.clone(),
                ))
                .await;

                // Clear modified marks and settle even on a failed node, so
                // waiters and the evictor are not wedged.
                for write in &object_writes {
                    if let Some(entry) = self.cache.get_object(write.oid) {
                        let mut inner = entry.lock();
                        if inner.context_id <= context_id {
                            inner.modified = false;
                        }
                        drop(inner);
                        entry.notify_all();
                    }
                }
                for write in &binding_writes {
                    let key = BindingKey::for_name(write.name.clone());
                    if let Some(entry) = self.cache.get_binding(&key) {
                        let mut inner = entry.lock();
                        if inner.context_id <= context_id {
                            inner.modified = false;
                        }
                        drop(inner);
                        entry.notify_all();
                    }
                }
                self.state.settle(context_id);
            }
            UpdateItem::EvictObject { oid } => {
                self.ship(self.server.evict_object(self.node_id, oid)).await;
                if let Some(entry) = self.cache.get_object(oid) {
                    self.complete_evict(&entry);
                }
            }
            UpdateItem::EvictBinding { key } => {
                self.ship(self.server.evict_binding(self.node_id, key.clone()))
                    .await;
                if let Some(entry) = self.cache.get_binding(&key) {
                    self.complete_evict(&entry);
                }
            }
            UpdateItem::DowngradeObject { oid } => {
                self.ship(self.server.downgrade_object(self.node_id, oid))
                    .await;
                if let Some(entry) = self.cache.get_object(oid) {
                    self.complete_downgrade(&entry);
                }
            }
            UpdateItem::DowngradeBinding { key } => {
                self.ship(self.server.downgrade_binding(self.node_id, key.clone()))
                    .await;
                if let Some(entry) = self.cache.get_binding(&key) {
                    self.complete_downgrade(&entry);
                }
            }
        }
    }

    /// Runs one server call unless the node has already failed; a permanent
    /// error marks the node failed. The completion still runs either way.
    async fn ship(&self, call: impl std::future::Future<Output = StoreResult<()>>) {
        if self.failure.is_failed() {
            return;
        }
        match call.await {
            Ok(()) => {
                self.context.metrics.node_metrics.update_items_acked.inc();
            }
            Err(error) => {
                warn!("update item failed permanently: {error}");
                self.failure.report(&error);
            }
        }
    }

    fn complete_evict(&self, entry: &Entry) {
        let mut inner = entry.lock();
        if !inner.decached() {
            inner.finish_decache();
        }
        drop(inner);
        entry.notify_all();
        self.cache.remove(entry);
    }

    fn complete_downgrade(&self, entry: &Entry) {
        let mut inner = entry.lock();
        if inner.downgrading() {
            inner.finish_downgrade();
            self.context.metrics.node_metrics.downgrades.inc();
        }
        drop(inner);
        entry.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::time::sleep;

    use super::*;
    use crate::entry::{Entry, EntryValue};
    use crate::key::EntryKey;
    use crate::server::LoggingFailureReporter;
    use crate::test_server::InMemoryServer;

    struct Fixture {
        queue: UpdateQueue,
        handle: UpdateQueueHandle,
        cache: Arc<CacheTable>,
        server: Arc<InMemoryServer>,
    }

    fn fixture(server: InMemoryServer) -> Fixture {
        let context = Arc::new(Context::new_for_test());
        let cache = Arc::new(CacheTable::new(context.clone(), Box::new(|| {})));
        let server = Arc::new(server);
        let failure = Arc::new(FailureTracker::new(
            Arc::new(LoggingFailureReporter),
            context.clone(),
        ));
        let (queue, handle) = UpdateQueue::start(
            context,
            cache.clone(),
            server.clone(),
            1,
            failure,
            &Handle::current(),
        );
        Fixture {
            queue,
            handle,
            cache,
            server,
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn commit_ships_writes_and_settles_the_context() {
        let fixture = fixture(InMemoryServer::new());
        let entry = Arc::new(Entry::new_fetching(EntryKey::Object(7), 0));
        {
            let mut inner = entry.lock();
            inner.install_fetched(EntryValue::Object(Some(Bytes::from_static(b"v"))), true);
            inner.modified = true;
            inner.context_id = 3;
        }
        {
            let mut reservation = fixture.cache.reserve(1);
            fixture.cache.try_insert(entry.clone(), &mut reservation).unwrap();
        }

        fixture.queue.context_started(3);
        assert_eq!(fixture.queue.highest_settled_context_id(), 2);

        fixture
            .queue
            .enqueue(UpdateItem::Commit {
                context_id: 3,
                object_writes: vec![ObjectWrite {
                    oid: 7,
                    data: Some(Bytes::from_static(b"v")),
                }],
                binding_writes: vec![],
            })
            .await
            .unwrap();

        eventually(|| fixture.queue.highest_settled_context_id() == 3).await;
        assert!(!entry.lock().modified);
        assert_eq!(fixture.server.object(7), Some(Bytes::from_static(b"v")));
        assert_eq!(fixture.server.commits().len(), 1);
    }

    #[tokio::test]
    async fn evict_completes_after_server_ack_and_removes_the_entry() {
        let fixture = fixture(InMemoryServer::new());
        let entry = Arc::new(Entry::new_fetching(EntryKey::Object(9), 0));
        {
            let mut inner = entry.lock();
            inner.install_fetched(EntryValue::Object(Some(Bytes::from_static(b"v"))), false);
            inner.start_decache();
        }
        {
            let mut reservation = fixture.cache.reserve(1);
            fixture.cache.try_insert(entry.clone(), &mut reservation).unwrap();
        }

        fixture
            .queue
            .enqueue(UpdateItem::EvictObject { oid: 9 })
            .await
            .unwrap();

        eventually(|| fixture.cache.get_object(9).is_none()).await;
        assert!(entry.lock().decached());
        assert!(fixture
            .server
            .calls()
            .contains(&"evict_object(9)".to_string()));
    }

    #[tokio::test]
    async fn commit_then_evict_of_the_same_key_is_ordered() {
        let fixture = fixture(InMemoryServer::new());
        let entry = Arc::new(Entry::new_fetching(EntryKey::Binding(BindingKey::for_name("a")), 0));
        {
            let mut inner = entry.lock();
            inner.install_fetched(EntryValue::Binding(Some(5)), true);
            inner.modified = true;
            inner.context_id = 1;
            inner.start_decache();
        }
        {
            let mut reservation = fixture.cache.reserve(1);
            fixture.cache.try_insert(entry.clone(), &mut reservation).unwrap();
        }

        fixture.queue.context_started(1);
        fixture
            .queue
            .enqueue(UpdateItem::Commit {
                context_id: 1,
                object_writes: vec![],
                binding_writes: vec![BindingWrite {
                    name: "a".to_string(),
                    oid: Some(5),
                    previous_key: None,
                    previous_key_unbound: false,
                }],
            })
            .await
            .unwrap();
        fixture
            .queue
            .enqueue(UpdateItem::EvictBinding {
                key: BindingKey::for_name("a"),
            })
            .await
            .unwrap();

        eventually(|| fixture.cache.get_binding(&BindingKey::for_name("a")).is_none()).await;
        let calls = fixture.server.calls();
        let commit_position = calls.iter().position(|call| call == "commit(1)").unwrap();
        let evict_position = calls
            .iter()
            .position(|call| call == "evict_binding(\"a\")")
            .unwrap();
        assert!(commit_position < evict_position);
    }

    #[tokio::test]
    async fn a_permanently_failing_commit_reports_failure_and_settles() {
        use crate::server::MockServerApi;

        let context = Arc::new(Context::new_for_test());
        let cache = Arc::new(CacheTable::new(context.clone(), Box::new(|| {})));
        let failure = Arc::new(FailureTracker::new(
            Arc::new(LoggingFailureReporter),
            context.clone(),
        ));

        let mut server = MockServerApi::new();
        server
            .expect_commit()
            .times(1)
            .returning(|_, _, _, _| Err(StoreError::Network("server unreachable".to_string())));
        let (queue, _handle) = UpdateQueue::start(
            context,
            cache,
            Arc::new(server),
            1,
            failure.clone(),
            &Handle::current(),
        );

        queue.context_started(5);
        queue
            .enqueue(UpdateItem::Commit {
                context_id: 5,
                object_writes: vec![ObjectWrite {
                    oid: 1,
                    data: Some(Bytes::from_static(b"v")),
                }],
                binding_writes: vec![],
            })
            .await
            .unwrap();

        // The node fails, but the context still settles so waiters and the
        // evictor are not wedged.
        eventually(|| failure.is_failed()).await;
        eventually(|| queue.highest_settled_context_id() == 5).await;
    }

    #[tokio::test]
    async fn watermark_tracks_the_lowest_pending_context() {
        let fixture = fixture(InMemoryServer::new());
        fixture.queue.context_started(1);
        fixture.queue.context_started(2);

        assert_eq!(fixture.queue.highest_settled_context_id(), 0);
        fixture.queue.context_settled(2);
        assert_eq!(fixture.queue.highest_settled_context_id(), 0);
        fixture.queue.context_settled(1);
        assert_eq!(fixture.queue.highest_settled_context_id(), 2);

        drop(fixture.queue);
        fixture.handle.stop().await;
    }
}

// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)]
use mockall::automock;
use tracing::error;

use crate::context::Context;
use crate::error::{StoreError, StoreResult};
use crate::key::{BindingKey, ContextId, NodeId, ObjectId};

/// Typed interface to the central data store server, agnostic to the actual
/// transport. [`crate::rpc_client::TcpServerClient`] implements it over the
/// wire protocol; tests implement it in memory.
///
/// The `callback_evict` / `callback_downgrade` flags in results mean the
/// server has already scheduled a future callback for the requested entry;
/// the explicit callback will still arrive, the flag merely allows the node
/// to pre-schedule the matching task for responsiveness.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ServerApi: Send + Sync + 'static {
    /// Registers this node, announcing the port its callback service listens
    /// on.
    async fn register_node(&self, callback_port: u16) -> StoreResult<RegisterNodeResult>;

    /// Allocates a contiguous range of fresh object ids.
    async fn new_object_ids(&self, node_id: NodeId, batch_size: u64) -> StoreResult<ObjectIdRange>;

    async fn get_object(&self, node_id: NodeId, oid: ObjectId) -> StoreResult<GetObjectResults>;

    async fn get_object_for_update(
        &self,
        node_id: NodeId,
        oid: ObjectId,
    ) -> StoreResult<GetObjectForUpdateResults>;

    async fn upgrade_object(
        &self,
        node_id: NodeId,
        oid: ObjectId,
    ) -> StoreResult<UpgradeObjectResults>;

    async fn get_binding(&self, node_id: NodeId, name: String) -> StoreResult<GetBindingResults>;

    async fn get_binding_for_update(
        &self,
        node_id: NodeId,
        name: String,
    ) -> StoreResult<GetBindingForUpdateResults>;

    async fn get_binding_for_remove(
        &self,
        node_id: NodeId,
        name: String,
    ) -> StoreResult<GetBindingForRemoveResults>;

    /// The first bound name strictly greater than `name`.
    async fn next_bound_name(
        &self,
        node_id: NodeId,
        name: BindingKey,
    ) -> StoreResult<NextBoundNameResults>;

    async fn get_class_id(&self, node_id: NodeId, class_info: Bytes) -> StoreResult<u32>;

    async fn get_class_info(&self, node_id: NodeId, class_id: u32) -> StoreResult<Bytes>;

    /// Ships one transaction's writes as an atomic batch, in commit order.
    async fn commit(
        &self,
        node_id: NodeId,
        context_id: ContextId,
        object_writes: Vec<ObjectWrite>,
        binding_writes: Vec<BindingWrite>,
    ) -> StoreResult<()>;

    async fn evict_object(&self, node_id: NodeId, oid: ObjectId) -> StoreResult<()>;

    async fn evict_binding(&self, node_id: NodeId, key: BindingKey) -> StoreResult<()>;

    async fn downgrade_object(&self, node_id: NodeId, oid: ObjectId) -> StoreResult<()>;

    async fn downgrade_binding(&self, node_id: NodeId, key: BindingKey) -> StoreResult<()>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisterNodeResult {
    pub node_id: NodeId,
    /// Port on the server accepting this node's update queue connection.
    pub update_queue_port: u16,
}

/// A contiguous range of freshly allocated object ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjectIdRange {
    pub first: ObjectId,
    pub count: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetObjectResults {
    /// The object payload; `None` when the object is absent or removed.
    pub data: Option<Bytes>,
    pub callback_evict: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetObjectForUpdateResults {
    pub data: Option<Bytes>,
    pub callback_evict: bool,
    pub callback_downgrade: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UpgradeObjectResults {
    pub callback_evict: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetBindingResults {
    pub found: bool,
    /// When found, the oid bound to the requested name; otherwise the oid
    /// bound to `next_name` (zero when `next_name` is the upper sentinel).
    pub oid: ObjectId,
    /// When not found, the first bound name greater than the requested name,
    /// or `Last` when the top of the keyspace is unbound.
    pub next_name: Option<BindingKey>,
    pub callback_evict: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetBindingForUpdateResults {
    pub found: bool,
    pub oid: ObjectId,
    pub next_name: Option<BindingKey>,
    pub callback_evict: bool,
    pub callback_downgrade: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetBindingForRemoveResults {
    pub found: bool,
    pub oid: ObjectId,
    /// The first bound name greater than the requested name; write access is
    /// granted on it too, since removal lowers its previous key.
    pub next_name: BindingKey,
    pub next_oid: ObjectId,
    pub callback_evict: bool,
    pub callback_downgrade: bool,
    pub next_callback_evict: bool,
    pub next_callback_downgrade: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NextBoundNameResults {
    /// The next bound name, or `Last` when there is none.
    pub next_name: BindingKey,
    /// The oid bound to `next_name`; zero when `next_name` is `Last`.
    pub oid: ObjectId,
    pub callback_evict: bool,
}

/// One committed object write; `None` data is a removal tombstone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectWrite {
    pub oid: ObjectId,
    pub data: Option<Bytes>,
}

/// One committed binding write, carrying the range information the entry
/// certifies. `None` oid is a removal tombstone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BindingWrite {
    pub name: String,
    pub oid: Option<ObjectId>,
    pub previous_key: Option<BindingKey>,
    pub previous_key_unbound: bool,
}

/// Watchdog surface. Permanent failures are escalated here; the store marks
/// itself failed before reporting.
pub trait FailureReporter: Send + Sync + 'static {
    fn report_failure(&self, error: &StoreError);
}

/// Default reporter: logs the failure and nothing else.
pub struct LoggingFailureReporter;

impl FailureReporter for LoggingFailureReporter {
    fn report_failure(&self, error: &StoreError) {
        error!("data store node failed: {error}");
    }
}

/// Tracks whether this node has failed permanently. The first report wins and
/// is forwarded to the watchdog; afterwards every operation observes the
/// failed state and raises a network error.
pub(crate) struct FailureTracker {
    failed: AtomicBool,
    reporter: Arc<dyn FailureReporter>,
    context: Arc<Context>,
}

impl FailureTracker {
    pub(crate) fn new(reporter: Arc<dyn FailureReporter>, context: Arc<Context>) -> Self {
        Self {
            failed: AtomicBool::new(false),
            reporter,
            context,
        }
    }

    pub(crate) fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Marks the node failed and escalates the first failure.
    pub(crate) fn report(&self, error: &StoreError) {
        if !self.failed.swap(true, Ordering::AcqRel) {
            self.context.metrics.node_metrics.reported_failures.inc();
            self.reporter.report_failure(error);
        }
    }

    pub(crate) fn check(&self) -> StoreResult<()> {
        if self.is_failed() {
            return Err(StoreError::Network("node has failed".to_string()));
        }
        Ok(())
    }
}

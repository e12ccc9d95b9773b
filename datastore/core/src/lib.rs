// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Node-local caching data store of a distributed, transactional object-graph
//! server.
//!
//! The store presents one logical key/value space over two keyspaces: objects
//! addressed by 64-bit ids and an ordered namespace of bindings. Entries are
//! cached locally under a multi-reader/single-writer coherence protocol
//! coordinated by a central server; committed changes ship asynchronously
//! through an ordered update queue, and the server calls back to evict or
//! downgrade entries other nodes need.

mod cache;
mod callback;
mod context;
mod entry;
mod error;
mod evictor;
mod fetch;
mod key;
mod metrics;
mod rpc_client;
mod server;
mod store;
mod transaction;
mod update_queue;
mod wire;

#[cfg(test)]
mod test_server;
#[cfg(test)]
mod tests;

pub use error::{StoreError, StoreResult};
pub use key::{BindingKey, ContextId, NodeId, ObjectId, TxnId};
pub use server::{
    BindingWrite, FailureReporter, GetBindingForRemoveResults, GetBindingForUpdateResults,
    GetBindingResults, GetObjectForUpdateResults, GetObjectResults, LoggingFailureReporter,
    NextBoundNameResults, ObjectIdRange, ObjectWrite, RegisterNodeResult, ServerApi,
    UpgradeObjectResults,
};
pub use store::{
    CachingDataStore, GetBindingOutcome, RemoveBindingOutcome, SetBindingOutcome,
};

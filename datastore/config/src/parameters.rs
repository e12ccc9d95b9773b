// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Operational configuration of one caching node.
///
/// All fields only affect the local node: they may differ between nodes of the
/// same cluster without affecting correctness of the shared data store.
/// Coherence-relevant behavior is driven entirely by the central server.
///
/// NOTE: default values should make sense, so most operators should not need to
/// specify any field.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Parameters {
    /// Soft capacity of the cache, counted in entries across both keyspaces.
    /// Values below [`Parameters::CACHE_SIZE_FLOOR`] are raised to the floor.
    #[serde(default = "Parameters::default_cache_size")]
    pub cache_size: usize,

    /// Number of entries examined per eviction pass.
    #[serde(default = "Parameters::default_eviction_batch_size")]
    pub eviction_batch_size: usize,

    /// Number of free entries the evictor holds in reserve so that
    /// transactional operations never stall waiting for capacity.
    #[serde(default = "Parameters::default_eviction_reserve_size")]
    pub eviction_reserve_size: usize,

    /// Bound for short intra-entry waits that are not tied to a transaction
    /// stop time.
    #[serde(default = "Parameters::default_lock_timeout")]
    pub lock_timeout: Duration,

    /// Total deadline for retrying a transiently failing server call before
    /// the failure is escalated.
    #[serde(default = "Parameters::default_max_retry")]
    pub max_retry: Duration,

    /// Initial delay between retries of a failing server call. Subsequent
    /// delays back off exponentially.
    #[serde(default = "Parameters::default_retry_wait")]
    pub retry_wait: Duration,

    /// Number of stripes for per-key locks.
    #[serde(default = "Parameters::default_num_locks")]
    pub num_locks: usize,

    /// Number of object ids allocated from the server per batch.
    #[serde(default = "Parameters::default_object_id_batch_size")]
    pub object_id_batch_size: u64,

    /// Host name of the central data store server.
    #[serde(default = "Parameters::default_server_host")]
    pub server_host: String,

    /// Port of the central data store server.
    #[serde(default = "Parameters::default_server_port")]
    pub server_port: u16,

    /// Local port on which server-initiated evict and downgrade callbacks are
    /// accepted.
    #[serde(default = "Parameters::default_callback_port")]
    pub callback_port: u16,

    /// Maximum number of in-flight items in the update queue.
    #[serde(default = "Parameters::default_update_queue_size")]
    pub update_queue_size: usize,

    /// Controls internal consistency checks of the binding keyspace.
    #[serde(default)]
    pub check_bindings: CheckBindings,
}

impl Parameters {
    /// Smallest usable cache capacity.
    pub const CACHE_SIZE_FLOOR: usize = 1000;

    pub fn default_cache_size() -> usize {
        5000
    }

    pub fn default_eviction_batch_size() -> usize {
        100
    }

    pub fn default_eviction_reserve_size() -> usize {
        50
    }

    pub fn default_lock_timeout() -> Duration {
        Duration::from_millis(10)
    }

    pub fn default_max_retry() -> Duration {
        Duration::from_millis(1000)
    }

    pub fn default_retry_wait() -> Duration {
        Duration::from_millis(10)
    }

    pub fn default_num_locks() -> usize {
        20
    }

    pub fn default_object_id_batch_size() -> u64 {
        1000
    }

    pub fn default_server_host() -> String {
        "localhost".to_string()
    }

    pub fn default_server_port() -> u16 {
        44540
    }

    pub fn default_callback_port() -> u16 {
        44541
    }

    pub fn default_update_queue_size() -> usize {
        100
    }

    /// The configured cache size, raised to the floor when set too low.
    pub fn effective_cache_size(&self) -> usize {
        self.cache_size.max(Self::CACHE_SIZE_FLOOR)
    }
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            cache_size: Parameters::default_cache_size(),
            eviction_batch_size: Parameters::default_eviction_batch_size(),
            eviction_reserve_size: Parameters::default_eviction_reserve_size(),
            lock_timeout: Parameters::default_lock_timeout(),
            max_retry: Parameters::default_max_retry(),
            retry_wait: Parameters::default_retry_wait(),
            num_locks: Parameters::default_num_locks(),
            object_id_batch_size: Parameters::default_object_id_batch_size(),
            server_host: Parameters::default_server_host(),
            server_port: Parameters::default_server_port(),
            callback_port: Parameters::default_callback_port(),
            update_queue_size: Parameters::default_update_queue_size(),
            check_bindings: CheckBindings::default(),
        }
    }
}

/// When the cache verifies the internal invariants of the binding keyspace.
///
/// The checks walk the whole ordered binding index, so anything other than
/// `None` is only suitable for tests and debugging.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum CheckBindings {
    /// No checking.
    #[default]
    None,
    /// Check after every binding operation.
    Operation,
    /// Check after every transaction commit or abort.
    Txn,
}

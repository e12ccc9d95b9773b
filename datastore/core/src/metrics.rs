// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use prometheus::{
    register_histogram_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_with_registry, Histogram, IntCounter,
    IntCounterVec, IntGauge, Registry,
};

const LATENCY_SEC_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1., 2.5, 5., 10.,
];

pub(crate) struct Metrics {
    pub(crate) node_metrics: NodeMetrics,
}

pub(crate) fn initialise_metrics(registry: Registry) -> Arc<Metrics> {
    let node_metrics = NodeMetrics::new(&registry);
    Arc::new(Metrics { node_metrics })
}

#[cfg(test)]
pub(crate) fn test_metrics() -> Arc<Metrics> {
    initialise_metrics(Registry::new())
}

pub(crate) struct NodeMetrics {
    pub cache_hits: IntCounterVec,
    pub cache_misses: IntCounterVec,
    pub cache_entries: IntGauge,
    pub fetches: IntCounterVec,
    pub evictions_immediate: IntCounter,
    pub evictions_scheduled: IntCounter,
    pub downgrades: IntCounter,
    pub update_queue_depth: IntGauge,
    pub update_items_acked: IntCounter,
    pub active_transactions: IntGauge,
    pub committed_transactions: IntCounter,
    pub aborted_transactions: IntCounter,
    pub transaction_timeouts: IntCounter,
    pub server_call_retries: IntCounter,
    pub reported_failures: IntCounter,
    pub server_call_latency: Histogram,
}

impl NodeMetrics {
    fn new(registry: &Registry) -> Self {
        Self {
            cache_hits: register_int_counter_vec_with_registry!(
                "cache_hits",
                "Number of cache hits, per keyspace",
                &["keyspace"],
                registry,
            )
            .unwrap(),
            cache_misses: register_int_counter_vec_with_registry!(
                "cache_misses",
                "Number of cache misses, per keyspace",
                &["keyspace"],
                registry,
            )
            .unwrap(),
            cache_entries: register_int_gauge_with_registry!(
                "cache_entries",
                "Number of entries currently held in the cache table",
                registry,
            )
            .unwrap(),
            fetches: register_int_counter_vec_with_registry!(
                "fetches",
                "Number of fetch requests scheduled against the server, per kind",
                &["kind"],
                registry,
            )
            .unwrap(),
            evictions_immediate: register_int_counter_with_registry!(
                "evictions_immediate",
                "Number of entries evicted without waiting for quiescence",
                registry,
            )
            .unwrap(),
            evictions_scheduled: register_int_counter_with_registry!(
                "evictions_scheduled",
                "Number of evictions deferred until the entry became quiescent",
                registry,
            )
            .unwrap(),
            downgrades: register_int_counter_with_registry!(
                "downgrades",
                "Number of entries downgraded from writable to readable",
                registry,
            )
            .unwrap(),
            update_queue_depth: register_int_gauge_with_registry!(
                "update_queue_depth",
                "Number of update items currently enqueued or in flight",
                registry,
            )
            .unwrap(),
            update_items_acked: register_int_counter_with_registry!(
                "update_items_acked",
                "Number of update items acknowledged by the server",
                registry,
            )
            .unwrap(),
            active_transactions: register_int_gauge_with_registry!(
                "active_transactions",
                "Number of transactions currently joined to the store",
                registry,
            )
            .unwrap(),
            committed_transactions: register_int_counter_with_registry!(
                "committed_transactions",
                "Number of committed transactions",
                registry,
            )
            .unwrap(),
            aborted_transactions: register_int_counter_with_registry!(
                "aborted_transactions",
                "Number of aborted transactions",
                registry,
            )
            .unwrap(),
            transaction_timeouts: register_int_counter_with_registry!(
                "transaction_timeouts",
                "Number of waits that exceeded the transaction stop time",
                registry,
            )
            .unwrap(),
            server_call_retries: register_int_counter_with_registry!(
                "server_call_retries",
                "Number of server calls retried after a transient I/O error",
                registry,
            )
            .unwrap(),
            reported_failures: register_int_counter_with_registry!(
                "reported_failures",
                "Number of permanent failures escalated to the failure reporter",
                registry,
            )
            .unwrap(),
            server_call_latency: register_histogram_with_registry!(
                "server_call_latency",
                "Latency of individual server calls, in seconds",
                LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )
            .unwrap(),
        }
    }
}

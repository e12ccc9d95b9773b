// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use datastore_config::{CheckBindings, Parameters};

#[test]
fn parameters_defaults() {
    let parameters = Parameters::default();

    assert_eq!(parameters.cache_size, 5000);
    assert_eq!(parameters.eviction_batch_size, 100);
    assert_eq!(parameters.eviction_reserve_size, 50);
    assert_eq!(parameters.lock_timeout, Duration::from_millis(10));
    assert_eq!(parameters.max_retry, Duration::from_millis(1000));
    assert_eq!(parameters.retry_wait, Duration::from_millis(10));
    assert_eq!(parameters.num_locks, 20);
    assert_eq!(parameters.object_id_batch_size, 1000);
    assert_eq!(parameters.server_port, 44540);
    assert_eq!(parameters.callback_port, 44541);
    assert_eq!(parameters.update_queue_size, 100);
    assert_eq!(parameters.check_bindings, CheckBindings::None);
}

#[test]
fn cache_size_floor_is_applied() {
    let parameters = Parameters {
        cache_size: 10,
        ..Default::default()
    };
    assert_eq!(parameters.effective_cache_size(), Parameters::CACHE_SIZE_FLOOR);

    let parameters = Parameters {
        cache_size: 8000,
        ..Default::default()
    };
    assert_eq!(parameters.effective_cache_size(), 8000);
}

// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end scenarios against the in-memory server: transactional
//! visibility, range certification, server-initiated callbacks, eviction
//! under pressure and node shutdown.

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use prometheus::Registry;

use datastore_config::{CheckBindings, Parameters};

use crate::key::BindingKey;
use crate::server::LoggingFailureReporter;
use crate::store::CachingDataStore;
use crate::test_server::InMemoryServer;
use crate::error::StoreError;

const TXN_TIMEOUT: Duration = Duration::from_secs(5);

fn test_parameters() -> Parameters {
    Parameters {
        // An ephemeral callback port so tests can run concurrently.
        callback_port: 0,
        check_bindings: CheckBindings::Operation,
        ..Default::default()
    }
}

fn store_with(server: InMemoryServer) -> (Arc<CachingDataStore>, Arc<InMemoryServer>) {
    store_with_parameters(server, test_parameters())
}

fn store_with_parameters(
    server: InMemoryServer,
    parameters: Parameters,
) -> (Arc<CachingDataStore>, Arc<InMemoryServer>) {
    let server = Arc::new(server);
    let store = CachingDataStore::new(
        parameters,
        server.clone(),
        Arc::new(LoggingFailureReporter),
        Registry::new(),
    )
    .expect("store starts");
    (Arc::new(store), server)
}

fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if check() {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("condition not reached in time");
}

#[test]
fn set_binding_is_visible_to_a_later_transaction() {
    // GIVEN an empty store.
    let (store, server) = store_with(InMemoryServer::new());

    // WHEN T1 binds "a" and commits.
    store.join(1, TXN_TIMEOUT).unwrap();
    let outcome = store.set_binding(1, "a", 7).unwrap();
    assert!(!outcome.was_bound);
    store.commit(1).unwrap();

    // THEN T2 reads the bound oid, from the cache.
    store.join(2, TXN_TIMEOUT).unwrap();
    let outcome = store.get_binding(2, "a").unwrap();
    assert_eq!(outcome.oid, Some(7));
    store.commit(2).unwrap();

    assert!(store
        .test_inner()
        .cache
        .get_binding(&BindingKey::for_name("a"))
        .is_some());
    eventually(|| server.binding("a") == Some(7));
}

#[test]
fn next_bound_name_caches_the_unbound_range() {
    // GIVEN a server where only "b" is bound.
    let (store, server) = store_with(InMemoryServer::new().with_binding("b", 5));

    store.join(1, TXN_TIMEOUT).unwrap();
    assert_eq!(store.next_bound_name(1, Some("a")).unwrap(), Some("b".to_string()));

    // THEN the entry for "b" certifies ("a", "b") unbound...
    let entry = store
        .test_inner()
        .cache
        .get_binding(&BindingKey::for_name("b"))
        .unwrap();
    assert!(entry.known_unbound(&entry.lock(), &BindingKey::for_name("aa")));

    // ...so a lookup inside the range is answered without the server.
    let calls_before = server.calls().len();
    let outcome = store.get_binding(1, "aa").unwrap();
    assert_eq!(outcome.oid, None);
    assert_eq!(outcome.next_name, Some("b".to_string()));
    assert_eq!(server.calls().len(), calls_before);
    store.commit(1).unwrap();
}

#[test]
fn reader_blocks_until_the_writer_commits() {
    let (store, _server) = store_with(InMemoryServer::new().with_binding("m", 9));

    store.join(1, TXN_TIMEOUT).unwrap();
    let outcome = store.set_binding(1, "m", 3).unwrap();
    assert!(outcome.was_bound);

    let reader = {
        let store = store.clone();
        std::thread::spawn(move || {
            store.join(2, TXN_TIMEOUT).unwrap();
            let outcome = store.get_binding(2, "m").unwrap();
            store.commit(2).unwrap();
            outcome
        })
    };

    // The reader cannot see the uncommitted write.
    std::thread::sleep(Duration::from_millis(50));
    assert!(!reader.is_finished());

    store.commit(1).unwrap();
    assert_eq!(reader.join().unwrap().oid, Some(3));
}

#[test]
fn reader_sees_the_old_value_after_an_abort() {
    let (store, _server) = store_with(InMemoryServer::new().with_binding("m", 9));

    store.join(1, TXN_TIMEOUT).unwrap();
    store.set_binding(1, "m", 3).unwrap();

    let reader = {
        let store = store.clone();
        std::thread::spawn(move || {
            store.join(2, TXN_TIMEOUT).unwrap();
            let outcome = store.get_binding(2, "m").unwrap();
            store.commit(2).unwrap();
            outcome
        })
    };

    std::thread::sleep(Duration::from_millis(50));
    store.abort(1).unwrap();
    assert_eq!(reader.join().unwrap().oid, Some(9));
}

#[test]
fn evict_of_a_busy_entry_is_deferred_until_quiescent() {
    // GIVEN "k" held writable with an uncommitted write by T1.
    let (store, server) = store_with(InMemoryServer::new().with_binding("k", 9));
    store.join(1, TXN_TIMEOUT).unwrap();
    store.set_binding(1, "k", 9).unwrap();

    // WHEN the server requests an evict.
    let key = BindingKey::for_name("k");
    assert!(!store.request_evict_binding(&key));

    // THEN after commit and queue drain the entry is evicted and the server
    // acknowledged.
    store.commit(1).unwrap();
    eventually(|| store.test_inner().cache.get_binding(&key).is_none());
    eventually(|| {
        server
            .calls()
            .contains(&"evict_binding(\"k\")".to_string())
    });
}

#[test]
fn duplicate_callbacks_are_idempotent() {
    let (store, _server) = store_with(InMemoryServer::new().with_object(4, b"x"));

    // An uncached key is already settled.
    assert!(store.request_evict_object(99));
    assert!(store.request_evict_object(99));
    assert!(store.request_downgrade_object(99));

    // A cached quiescent entry: the first request applies synchronously, the
    // second sees it gone.
    store.join(1, TXN_TIMEOUT).unwrap();
    store.get_object(1, 4, false).unwrap();
    store.commit(1).unwrap();
    assert!(store.request_evict_object(4));
    assert!(store.request_evict_object(4));

    // A busy entry answers false both times.
    store.join(2, TXN_TIMEOUT).unwrap();
    store.set_object(2, 4, Bytes::from_static(b"y")).unwrap();
    assert!(!store.request_evict_object(4));
    assert!(!store.request_evict_object(4));
    store.abort(2).unwrap();
}

#[test]
fn downgrade_of_a_writable_entry() {
    let (store, _server) = store_with(InMemoryServer::new().with_object(4, b"x"));

    // Fetched for update, then the transaction commits without writing: the
    // entry stays writable but quiescent.
    store.join(1, TXN_TIMEOUT).unwrap();
    store.get_object(1, 4, true).unwrap();
    store.commit(1).unwrap();

    assert!(store.request_downgrade_object(4));
    // Idempotent: already readable.
    assert!(store.request_downgrade_object(4));

    // Still readable from cache afterwards.
    store.join(2, TXN_TIMEOUT).unwrap();
    assert_eq!(store.get_object(2, 4, false).unwrap(), Bytes::from_static(b"x"));
    store.commit(2).unwrap();
}

#[test]
fn eviction_keeps_the_cache_under_its_limit() {
    let parameters = Parameters {
        cache_size: Parameters::CACHE_SIZE_FLOOR,
        callback_port: 0,
        ..Default::default()
    };
    let mut server = InMemoryServer::new();
    for oid in 1..=1101u64 {
        server = server.with_object(oid, &oid.to_be_bytes());
    }
    let (store, server) = store_with_parameters(server, parameters);

    // One entry is held in use for write throughout the churn.
    store.join(9999, Duration::from_secs(60)).unwrap();
    store.set_object(9999, 1, Bytes::from_static(b"held")).unwrap();

    // Churn more objects through the cache than it can hold.
    for oid in 2..=1101u64 {
        let txn = oid;
        store.join(txn, TXN_TIMEOUT).unwrap();
        let data = store.get_object(txn, oid, false).unwrap();
        assert_eq!(data, Bytes::copy_from_slice(&oid.to_be_bytes()));
        store.commit(txn).unwrap();
    }

    // The capacity accounting never admits more entries than the limit.
    assert!(store.test_inner().cache.len() <= Parameters::CACHE_SIZE_FLOOR);
    // The evictor shipped evictions through the queue.
    eventually(|| server.calls().iter().any(|call| call.starts_with("evict_object")));
    // The in-use-for-write entry was never evicted.
    assert!(store.test_inner().cache.get_object(1).is_some());

    store.commit(9999).unwrap();
}

#[test]
fn remove_binding_extends_the_successor_range_down() {
    // GIVEN "x" and "y" bound, with "x" cached via a lookup that certified
    // ("w", "x") unbound.
    let (store, server) = store_with(
        InMemoryServer::new()
            .with_binding("x", 1)
            .with_binding("y", 2),
    );
    store.join(1, TXN_TIMEOUT).unwrap();
    let outcome = store.get_binding(1, "w").unwrap();
    assert_eq!(outcome.next_name, Some("x".to_string()));
    store.commit(1).unwrap();

    // WHEN T2 removes "x".
    store.join(2, TXN_TIMEOUT).unwrap();
    let outcome = store.remove_binding(2, "x").unwrap();
    assert!(outcome.was_bound);
    assert_eq!(outcome.next_name, Some("y".to_string()));

    // THEN within the transaction the name reads unbound.
    assert_eq!(store.get_binding(2, "x").unwrap().oid, None);
    store.commit(2).unwrap();

    // AND the successor's certified range was carried down to "w".
    let successor = store
        .test_inner()
        .cache
        .get_binding(&BindingKey::for_name("y"))
        .unwrap();
    {
        let inner = successor.lock();
        assert!(successor.known_unbound(&inner, &BindingKey::for_name("wz")));
    }
    eventually(|| server.binding("x").is_none());
    assert_eq!(server.binding("y"), Some(2));
}

#[test]
fn read_your_writes_within_a_transaction() {
    let (store, _server) = store_with(InMemoryServer::new());
    store.join(1, TXN_TIMEOUT).unwrap();

    store.set_binding(1, "a", 7).unwrap();
    assert_eq!(store.get_binding(1, "a").unwrap().oid, Some(7));

    store.remove_binding(1, "a").unwrap();
    assert_eq!(store.get_binding(1, "a").unwrap().oid, None);
    store.commit(1).unwrap();
}

#[test]
fn object_round_trip_through_commit() {
    let (store, server) = store_with(InMemoryServer::new());

    store.join(1, TXN_TIMEOUT).unwrap();
    let oid = store.create_object(1).unwrap();
    store
        .set_object(1, oid, Bytes::from_static(b"payload"))
        .unwrap();
    store.commit(1).unwrap();

    store.join(2, TXN_TIMEOUT).unwrap();
    assert_eq!(
        store.get_object(2, oid, false).unwrap(),
        Bytes::from_static(b"payload")
    );
    store.commit(2).unwrap();

    eventually(|| server.object(oid) == Some(Bytes::from_static(b"payload")));
}

#[test]
fn removed_object_raises_not_found() {
    let (store, _server) = store_with(InMemoryServer::new().with_object(8, b"gone"));

    store.join(1, TXN_TIMEOUT).unwrap();
    store.remove_object(1, 8).unwrap();
    assert!(matches!(
        store.get_object(1, 8, false),
        Err(StoreError::ObjectNotFound(8))
    ));
    store.commit(1).unwrap();

    store.join(2, TXN_TIMEOUT).unwrap();
    assert!(matches!(
        store.get_object(2, 8, false),
        Err(StoreError::ObjectNotFound(8))
    ));
    store.commit(2).unwrap();
}

#[test]
fn commit_ships_one_key_ordered_batch() {
    let (store, server) = store_with(InMemoryServer::new());

    store.join(1, TXN_TIMEOUT).unwrap();
    let oid = store.create_object(1).unwrap();
    store.set_object(1, oid, Bytes::from_static(b"v")).unwrap();
    store.set_binding(1, "zz", oid).unwrap();
    store.set_binding(1, "aa", oid).unwrap();
    store.commit(1).unwrap();

    eventually(|| !server.commits().is_empty());
    let commits = server.commits();
    assert_eq!(commits.len(), 1);
    let (_, object_writes, binding_writes) = &commits[0];
    assert_eq!(object_writes.len(), 1);
    assert_eq!(
        binding_writes
            .iter()
            .map(|write| write.name.as_str())
            .collect::<Vec<_>>(),
        vec!["aa", "zz"]
    );
}

#[test]
fn next_bound_name_is_monotonic() {
    let (store, _server) = store_with(
        InMemoryServer::new()
            .with_binding("b", 1)
            .with_binding("d", 2)
            .with_binding("f", 3),
    );
    store.join(1, TXN_TIMEOUT).unwrap();

    let queries = [None, Some("a"), Some("b"), Some("c"), Some("e"), Some("f")];
    let mut answers = Vec::new();
    for name in queries {
        answers.push(store.next_bound_name(1, name).unwrap());
    }
    assert_eq!(
        answers,
        vec![
            Some("b".to_string()),
            Some("b".to_string()),
            Some("d".to_string()),
            Some("d".to_string()),
            Some("f".to_string()),
            None,
        ]
    );
    store.commit(1).unwrap();
}

#[test]
fn next_bound_name_skips_names_removed_in_the_transaction() {
    let (store, _server) = store_with(
        InMemoryServer::new()
            .with_binding("b", 1)
            .with_binding("d", 2),
    );
    store.join(1, TXN_TIMEOUT).unwrap();
    store.remove_binding(1, "b").unwrap();
    assert_eq!(store.next_bound_name(1, Some("a")).unwrap(), Some("d".to_string()));
    store.commit(1).unwrap();
}

#[test]
fn shuffled_operation_orders_reach_the_same_state() {
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    // The operations touch independent names, so every order must converge
    // to the same committed state.
    for seed in 0..10u8 {
        let (store, server) = store_with(InMemoryServer::new().with_binding("b", 2));

        let mut operations = vec!["set_a", "remove_b", "set_c", "get_a", "next"];
        operations.shuffle(&mut StdRng::from_seed([seed; 32]));

        store.join(1, TXN_TIMEOUT).unwrap();
        for operation in &operations {
            match *operation {
                "set_a" => {
                    store.set_binding(1, "a", 7).unwrap();
                }
                "remove_b" => {
                    store.remove_binding(1, "b").unwrap();
                }
                "set_c" => {
                    store.set_binding(1, "c", 9).unwrap();
                }
                "get_a" => {
                    store.get_binding(1, "a").unwrap();
                }
                "next" => {
                    store.next_bound_name(1, None).unwrap();
                }
                _ => unreachable!(),
            }
        }
        store.commit(1).unwrap();

        store.join(2, TXN_TIMEOUT).unwrap();
        assert_eq!(
            store.get_binding(2, "a").unwrap().oid,
            Some(7),
            "seed {seed}"
        );
        assert_eq!(store.get_binding(2, "b").unwrap().oid, None, "seed {seed}");
        assert_eq!(store.get_binding(2, "c").unwrap().oid, Some(9), "seed {seed}");
        store.commit(2).unwrap();

        eventually(|| {
            server.binding("a") == Some(7)
                && server.binding("b").is_none()
                && server.binding("c") == Some(9)
        });
    }
}

#[test]
fn waits_time_out_at_the_transaction_stop_time() {
    let (store, _server) = store_with(InMemoryServer::new().with_binding("t", 1));

    store.join(1, TXN_TIMEOUT).unwrap();
    store.set_binding(1, "t", 2).unwrap();

    store.join(2, Duration::from_millis(100)).unwrap();
    let result = store.get_binding(2, "t");
    assert!(matches!(result, Err(StoreError::TransactionTimeout(2))));
    store.abort(2).unwrap();
    store.abort(1).unwrap();
}

#[test]
fn binding_lookup_times_out_during_a_slow_fetch() {
    // GIVEN a server that answers binding consultations slowly.
    let (store, server) = store_with(InMemoryServer::new().with_binding("s", 1));
    server.set_call_delay(Some(Duration::from_secs(2)));

    // WHEN a transaction with a short stop time misses in the cache.
    store.join(1, Duration::from_millis(100)).unwrap();
    let result = store.get_binding(1, "a");

    // THEN the wait for the fetch honors the stop time, not the retry
    // policy of the server connection.
    assert!(matches!(result, Err(StoreError::TransactionTimeout(1))));
    store.abort(1).unwrap();
}

#[test]
fn class_registry_is_memoized() {
    let (store, server) = store_with(InMemoryServer::new());

    let class_info = Bytes::from_static(b"class-descriptor");
    let class_id = store.get_class_id(class_info.clone()).unwrap();
    assert_eq!(store.get_class_id(class_info.clone()).unwrap(), class_id);
    assert_eq!(store.get_class_info(class_id).unwrap(), class_info);

    let registry_calls = server
        .calls()
        .iter()
        .filter(|call| call.as_str() == "get_class_id")
        .count();
    assert_eq!(registry_calls, 1);
}

#[test]
fn binding_fetch_failure_marks_the_node_failed() {
    let (store, server) = store_with(InMemoryServer::new());
    store.join(1, TXN_TIMEOUT).unwrap();

    server.fail_calls(true);
    let result = store.get_binding(1, "a");
    assert!(matches!(result, Err(StoreError::Network(_))));
    store.abort(1).unwrap();
}

#[test]
fn server_failure_marks_the_node_failed() {
    let (store, server) = store_with(InMemoryServer::new());
    store.join(1, TXN_TIMEOUT).unwrap();

    server.fail_calls(true);
    let result = store.get_object(1, 42, false);
    assert!(matches!(result, Err(StoreError::Network(_))));

    // Every further operation observes the failed node.
    let result = store.get_binding(1, "anything");
    assert!(matches!(result, Err(StoreError::Network(_))));
    store.abort(1).unwrap();
}

#[test]
fn shutdown_drains_active_transactions_and_rejects_new_ones() {
    let (store, _server) = store_with(InMemoryServer::new());
    store.join(1, TXN_TIMEOUT).unwrap();
    store.set_binding(1, "a", 7).unwrap();

    let shutdown = {
        let store = store.clone();
        std::thread::spawn(move || store.shutdown())
    };

    // Shutdown waits for the active transaction.
    std::thread::sleep(Duration::from_millis(50));
    assert!(!shutdown.is_finished());

    store.commit(1).unwrap();
    shutdown.join().unwrap().unwrap();

    assert!(matches!(
        store.join(2, TXN_TIMEOUT),
        Err(StoreError::InvalidState(_))
    ));
    assert!(matches!(store.shutdown(), Err(StoreError::InvalidState(_))));
}

#[test]
fn callback_service_answers_over_tcp() {
    let (store, _server) = store_with(InMemoryServer::new());
    let port = store.callback_port();
    assert_ne!(port, 0);

    let mut stream = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
    let payload = crate::wire::encode_callback(&crate::wire::CallbackRequest::EvictObject {
        oid: 1234,
    });
    stream
        .write_all(&(payload.len() as u32).to_be_bytes())
        .unwrap();
    stream.write_all(&payload).unwrap();

    let mut length = [0u8; 4];
    stream.read_exact(&mut length).unwrap();
    assert_eq!(u32::from_be_bytes(length), 1);
    let mut answer = [0u8; 1];
    stream.read_exact(&mut answer).unwrap();
    // Nothing cached for the oid, so the evict is already settled.
    assert_eq!(answer[0], 1);
}

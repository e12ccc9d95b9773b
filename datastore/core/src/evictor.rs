// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Background eviction.
//!
//! A single dedicated thread holds a reserve of capacity so transactional
//! operations never stall on a full cache. When the cache table signals a
//! full transition the thread releases the reserve, scans entries with the
//! weakly-consistent iterator and evicts the best candidates until enough
//! capacity is free, then re-acquires the reserve.

use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::cache::{CacheTable, EntryIterator};
use crate::context::Context;
use crate::entry::Entry;
use crate::fetch::Fetcher;
use crate::key::{ContextId, EntryKey};
use crate::update_queue::{UpdateItem, UpdateQueue};

/// Wakes the evictor on cache-full transitions and at shutdown.
pub(crate) struct EvictorSignal {
    state: Mutex<SignalState>,
    cond: Condvar,
}

#[derive(Default)]
struct SignalState {
    full: bool,
    stopping: bool,
}

impl EvictorSignal {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(SignalState::default()),
            cond: Condvar::new(),
        }
    }

    /// The cache table's full notifier.
    pub(crate) fn notify_full(&self) {
        let mut state = self.state.lock();
        state.full = true;
        self.cond.notify_all();
    }

    pub(crate) fn stop(&self) {
        let mut state = self.state.lock();
        state.stopping = true;
        self.cond.notify_all();
    }

    /// Blocks until the cache is full; `false` means shutdown.
    fn wait_full(&self) -> bool {
        let mut state = self.state.lock();
        loop {
            if state.stopping {
                return false;
            }
            if state.full {
                state.full = false;
                return true;
            }
            self.cond.wait(&mut state);
        }
    }

    fn stopping(&self) -> bool {
        self.state.lock().stopping
    }
}

pub(crate) struct EvictorHandle {
    signal: Arc<EvictorSignal>,
    join_handle: thread::JoinHandle<()>,
}

impl EvictorHandle {
    pub(crate) fn stop(self) {
        self.signal.stop();
        self.join_handle.join().ok();
    }
}

pub(crate) struct Evictor {
    context: Arc<Context>,
    cache: Arc<CacheTable>,
    queue: Arc<UpdateQueue>,
    fetcher: Arc<Fetcher>,
    signal: Arc<EvictorSignal>,
}

impl Evictor {
    pub(crate) fn start(
        context: Arc<Context>,
        cache: Arc<CacheTable>,
        queue: Arc<UpdateQueue>,
        fetcher: Arc<Fetcher>,
        signal: Arc<EvictorSignal>,
    ) -> EvictorHandle {
        let evictor = Evictor {
            context,
            cache,
            queue,
            fetcher,
            signal: signal.clone(),
        };
        let join_handle = thread::Builder::new()
            .name("datastore-evictor".to_string())
            .spawn(move || evictor.run())
            .expect("failed to spawn evictor thread");
        EvictorHandle {
            signal,
            join_handle,
        }
    }

    fn run(self) {
        debug!("evictor started");
        let reserve_size = self.context.parameters.eviction_reserve_size;
        let batch_size = self.context.parameters.eviction_batch_size;
        let mut iterator = self.cache.entry_iterator(batch_size);

        // The evictor must never block on capacity it is responsible for
        // freeing, so all its reserve acquisitions are non-blocking.
        let mut reserve = self.cache.try_reserve(reserve_size);
        while self.signal.wait_full() {
            // Hand the reserve back so blocked operations proceed while this
            // pass frees real capacity.
            reserve.take();

            loop {
                if self.signal.stopping() {
                    debug!("evictor stopped mid-pass");
                    return;
                }
                if self.cache.available() >= 2 * reserve_size {
                    if let Some(guard) = self.cache.try_reserve(reserve_size) {
                        reserve = Some(guard);
                        break;
                    }
                }
                if !self.evict_one(&mut iterator) {
                    // Nothing evictable right now; let deferred tasks and the
                    // update queue make progress.
                    thread::sleep(self.context.parameters.lock_timeout);
                }
            }
        }
        debug!("evictor stopped");
    }

    /// Scans one batch and evicts the best candidate. Returns whether an
    /// eviction was started without deferring.
    fn evict_one(&self, iterator: &mut EntryIterator) -> bool {
        let entries = iterator.next_batch();
        if entries.is_empty() {
            return false;
        }
        let settled = self.queue.highest_settled_context_id();
        let Some(candidate) = pick_candidate(&entries, settled) else {
            return false;
        };

        // Re-check under the lock; the scan was weakly consistent.
        let mut inner = candidate.lock();
        if !inner.readable() || inner.downgrading() {
            // Fetching, decaching or already gone; another pass will see the
            // settled state.
            return false;
        }
        if inner.in_use(settled) {
            drop(inner);
            self.fetcher.schedule_deferred_evict(candidate.key().clone());
            return false;
        }
        inner.start_decache();
        drop(inner);
        candidate.notify_all();
        self.context.metrics.node_metrics.evictions_immediate.inc();

        let item = match candidate.key() {
            EntryKey::Object(oid) => UpdateItem::EvictObject { oid: *oid },
            EntryKey::Binding(key) => UpdateItem::EvictBinding { key: key.clone() },
        };
        if self.queue.enqueue_blocking(item).is_err() {
            debug!("evict of {} dropped at shutdown", candidate.key());
        }
        true
    }
}

/// Picks the entry to evict: not in use beats in use, not in use for write
/// beats in use for write, then the oldest context id wins.
fn pick_candidate(entries: &[Arc<Entry>], settled: ContextId) -> Option<Arc<Entry>> {
    let mut best: Option<(Arc<Entry>, (bool, bool, ContextId))> = None;
    for entry in entries {
        let inner = entry.lock();
        if inner.decached() {
            continue;
        }
        let score = (
            inner.in_use(settled),
            inner.in_use_for_write(settled),
            inner.context_id,
        );
        drop(inner);
        let better = match &best {
            Some((_, best_score)) => score < *best_score,
            None => true,
        };
        if better {
            best = Some((entry.clone(), score));
        }
    }
    best.map(|(entry, _)| entry)
}

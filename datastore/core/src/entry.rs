// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::{StoreError, StoreResult};
use crate::key::{BindingKey, ContextId, EntryKey, ObjectId, TxnId};

/// Access state of a cache entry.
///
/// The only legal transitions are the ones implemented by the methods of
/// [`EntryInner`]; every transition happens under the entry lock and is
/// followed by a broadcast on the entry condition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum AccessState {
    /// A read fetch is in flight to the server; no value installed yet.
    FetchingRead,
    /// The cached value is safe to read. `fetching_upgrade` marks an upgrade
    /// request in flight to the server.
    Readable { fetching_upgrade: bool },
    /// The cached value is safe to modify. `downgrading` marks a downgrade in
    /// flight to the server, during which the value remains readable.
    Writable { downgrading: bool },
    /// An evict is in flight to the server.
    Decaching,
    /// Terminal. The entry must be removed from the cache table before its
    /// key may be re-inserted.
    Decached,
}

/// Value cached by an entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum EntryValue {
    /// Object payload; `None` means the object has been removed.
    Object(Option<Bytes>),
    /// Bound object id; `None` means the name is unbound.
    Binding(Option<ObjectId>),
}

/// Result of awaiting an entry state change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AwaitResult {
    /// The entry reached its terminal state; the caller must retry its outer
    /// loop against a fresh entry.
    Decached,
    /// The entry is readable but not writable.
    Readable,
    /// The entry is writable.
    Writable,
}

/// A cache entry for either keyspace.
///
/// The immutable key lives on the entry itself; everything mutable is behind
/// the entry lock. Threads block on `cond` for state changes, bounded by the
/// transaction stop time.
pub(crate) struct Entry {
    key: EntryKey,
    inner: Mutex<EntryInner>,
    cond: Condvar,
}

pub(crate) struct EntryInner {
    pub access: AccessState,
    pub value: Option<EntryValue>,
    /// A local transaction committed a change that the update queue has not
    /// yet shipped to the server.
    pub modified: bool,
    /// Transaction currently holding write intent on this entry. Cleared on
    /// commit or abort.
    pub locker: Option<TxnId>,
    /// Context id of the transaction that most recently touched the entry.
    pub context_id: ContextId,
    /// Binding entries only: another operation owns the previous-key interval
    /// of this entry.
    pub pending_previous: bool,
    /// Binding entries only: a provisional `Last` entry that the server has
    /// not yet confirmed.
    pub provisional: bool,
    /// Binding entries only: lower end (exclusive) of the interval this entry
    /// certifies to contain no bound names. `None` means no information.
    pub previous_key: Option<BindingKey>,
    /// Whether `previous_key` itself is also known to be unbound.
    pub previous_key_unbound: bool,
}

impl Entry {
    /// Creates an entry in `FetchingRead` for the read-miss path.
    pub(crate) fn new_fetching(key: EntryKey, context_id: ContextId) -> Self {
        Self::new(key, AccessState::FetchingRead, None, context_id)
    }

    /// Creates a writable entry for a name introduced by a local transaction.
    pub(crate) fn new_writable_binding(
        key: BindingKey,
        locker: TxnId,
        context_id: ContextId,
        previous_key: Option<BindingKey>,
        previous_key_unbound: bool,
    ) -> Self {
        let entry = Self::new(
            EntryKey::Binding(key),
            AccessState::Writable { downgrading: false },
            Some(EntryValue::Binding(None)),
            context_id,
        );
        {
            let mut inner = entry.inner.lock();
            inner.locker = Some(locker);
            inner.previous_key = previous_key;
            inner.previous_key_unbound = previous_key_unbound;
        }
        entry
    }

    /// Creates a writable entry for an object id allocated by this node and
    /// not yet known to the server.
    pub(crate) fn new_writable_object(oid: ObjectId, locker: TxnId, context_id: ContextId) -> Self {
        let entry = Self::new(
            EntryKey::Object(oid),
            AccessState::Writable { downgrading: false },
            Some(EntryValue::Object(None)),
            context_id,
        );
        entry.inner.lock().locker = Some(locker);
        entry
    }

    /// Creates the provisional `Last` entry, pending the server's answer on
    /// whether the top of the keyspace is really unbound.
    pub(crate) fn new_provisional_last(context_id: ContextId) -> Self {
        let entry = Self::new(
            EntryKey::Binding(BindingKey::Last),
            AccessState::FetchingRead,
            None,
            context_id,
        );
        entry.inner.lock().provisional = true;
        entry
    }

    fn new(
        key: EntryKey,
        access: AccessState,
        value: Option<EntryValue>,
        context_id: ContextId,
    ) -> Self {
        Self {
            key,
            inner: Mutex::new(EntryInner {
                access,
                value,
                modified: false,
                locker: None,
                context_id,
                pending_previous: false,
                provisional: false,
                previous_key: None,
                previous_key_unbound: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn key(&self) -> &EntryKey {
        &self.key
    }

    pub(crate) fn binding_key(&self) -> Option<&BindingKey> {
        match &self.key {
            EntryKey::Binding(key) => Some(key),
            EntryKey::Object(_) => None,
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, EntryInner> {
        self.inner.lock()
    }

    /// Wakes every thread blocked on this entry. Call after any state change.
    pub(crate) fn notify_all(&self) {
        self.cond.notify_all();
    }

    /// Blocks until the entry is readable, writable or decached, or until the
    /// transaction stop time passes. Also waits out a write intent held by
    /// another transaction, so readers observe committed state only.
    pub(crate) fn await_readable(
        &self,
        inner: &mut MutexGuard<'_, EntryInner>,
        txn_id: TxnId,
        stop_time: Instant,
    ) -> StoreResult<AwaitResult> {
        loop {
            match inner.access {
                AccessState::Decached => return Ok(AwaitResult::Decached),
                AccessState::Writable { .. } | AccessState::Readable { .. }
                    if inner.available_to(txn_id) =>
                {
                    return Ok(self.current_result(inner));
                }
                _ => {}
            }
            self.wait(inner, txn_id, stop_time)?;
        }
    }

    /// Blocks until the entry is writable or decached, or readable with no
    /// upgrade or downgrade in flight (the caller then schedules an upgrade),
    /// or until the transaction stop time passes.
    pub(crate) fn await_writable(
        &self,
        inner: &mut MutexGuard<'_, EntryInner>,
        txn_id: TxnId,
        stop_time: Instant,
    ) -> StoreResult<AwaitResult> {
        loop {
            match inner.access {
                AccessState::Decached => return Ok(AwaitResult::Decached),
                AccessState::Writable { downgrading: false } if inner.available_to(txn_id) => {
                    return Ok(AwaitResult::Writable);
                }
                AccessState::Readable {
                    fetching_upgrade: false,
                } if inner.available_to(txn_id) => {
                    return Ok(AwaitResult::Readable);
                }
                _ => {}
            }
            self.wait(inner, txn_id, stop_time)?;
        }
    }

    /// Binding entries: blocks until no other operation owns the
    /// previous-key interval of this entry.
    pub(crate) fn await_not_pending_previous(
        &self,
        inner: &mut MutexGuard<'_, EntryInner>,
        txn_id: TxnId,
        stop_time: Instant,
    ) -> StoreResult<()> {
        while inner.pending_previous && !matches!(inner.access, AccessState::Decached) {
            self.wait(inner, txn_id, stop_time)?;
        }
        Ok(())
    }

    fn wait(
        &self,
        inner: &mut MutexGuard<'_, EntryInner>,
        txn_id: TxnId,
        stop_time: Instant,
    ) -> StoreResult<()> {
        if self.cond.wait_until(inner, stop_time).timed_out() {
            return Err(StoreError::TransactionTimeout(txn_id));
        }
        Ok(())
    }

    /// Bounded wait for background tasks polling for quiescence; a timeout is
    /// not an error, the caller re-checks its predicate.
    pub(crate) fn wait_for(&self, inner: &mut MutexGuard<'_, EntryInner>, timeout: Duration) {
        self.cond.wait_for(inner, timeout);
    }

    fn current_result(&self, inner: &EntryInner) -> AwaitResult {
        match inner.access {
            AccessState::Writable { downgrading: false } => AwaitResult::Writable,
            _ => AwaitResult::Readable,
        }
    }

    /// Whether every name in `(previous_key, key)` is certified unbound and
    /// `name` falls in that certified range.
    pub(crate) fn known_unbound(&self, inner: &EntryInner, name: &BindingKey) -> bool {
        let EntryKey::Binding(own) = &self.key else {
            return false;
        };
        let Some(prev) = &inner.previous_key else {
            return false;
        };
        (prev < name && name < own) || (name == prev && inner.previous_key_unbound)
    }

    /// Whether this entry is the next entry for `name`: its certified range
    /// starts at or below `name`, so no name in `(name, key)` is bound.
    pub(crate) fn is_next_entry(&self, inner: &EntryInner, name: &BindingKey) -> bool {
        let EntryKey::Binding(own) = &self.key else {
            return false;
        };
        debug_assert!(name < own);
        match &inner.previous_key {
            Some(prev) => prev <= name,
            None => false,
        }
    }
}

impl EntryInner {
    /// Whether the entry may be used by `txn_id`: no other transaction holds
    /// write intent on it.
    pub(crate) fn available_to(&self, txn_id: TxnId) -> bool {
        self.locker.map_or(true, |locker| locker == txn_id)
    }

    pub(crate) fn readable(&self) -> bool {
        matches!(
            self.access,
            AccessState::Readable { .. } | AccessState::Writable { .. }
        )
    }

    pub(crate) fn writable(&self) -> bool {
        matches!(self.access, AccessState::Writable { downgrading: false })
    }

    pub(crate) fn decached(&self) -> bool {
        matches!(self.access, AccessState::Decached)
    }

    pub(crate) fn downgrading(&self) -> bool {
        matches!(self.access, AccessState::Writable { downgrading: true })
    }

    /// Whether the entry is in use: touched by a transaction whose context id
    /// the update queue has not settled, owned by a writer, covering a
    /// previous-key interval, or in a transitional state.
    pub(crate) fn in_use(&self, highest_settled: ContextId) -> bool {
        self.context_id > highest_settled
            || self.pending_previous
            || self.locker.is_some()
            || !matches!(
                self.access,
                AccessState::Readable {
                    fetching_upgrade: false
                } | AccessState::Writable { downgrading: false }
            )
    }

    /// Whether the entry has a write the update queue has not yet shipped.
    pub(crate) fn in_use_for_write(&self, highest_settled: ContextId) -> bool {
        self.locker.is_some() || (self.modified && self.context_id > highest_settled)
    }

    pub(crate) fn object_value(&self) -> Option<&Option<Bytes>> {
        match &self.value {
            Some(EntryValue::Object(data)) => Some(data),
            _ => None,
        }
    }

    pub(crate) fn binding_value(&self) -> Option<Option<ObjectId>> {
        match &self.value {
            Some(EntryValue::Binding(oid)) => Some(*oid),
            _ => None,
        }
    }

    // State transitions. Debug assertions document the only legal sources.

    /// `FetchingRead -> Readable|Writable`, installing the fetched value.
    pub(crate) fn install_fetched(&mut self, value: EntryValue, writable: bool) {
        debug_assert_eq!(self.access, AccessState::FetchingRead);
        self.value = Some(value);
        self.provisional = false;
        self.access = if writable {
            AccessState::Writable { downgrading: false }
        } else {
            AccessState::Readable {
                fetching_upgrade: false,
            }
        };
    }

    /// `Readable -> Readable+FetchingUpgrade`.
    pub(crate) fn start_upgrade(&mut self) {
        debug_assert_eq!(
            self.access,
            AccessState::Readable {
                fetching_upgrade: false
            }
        );
        self.access = AccessState::Readable {
            fetching_upgrade: true,
        };
    }

    /// `Readable+FetchingUpgrade -> Writable`.
    pub(crate) fn finish_upgrade(&mut self) {
        debug_assert_eq!(
            self.access,
            AccessState::Readable {
                fetching_upgrade: true
            }
        );
        self.access = AccessState::Writable { downgrading: false };
    }

    /// Upgrade failed; the entry stays readable.
    pub(crate) fn fail_upgrade(&mut self) {
        debug_assert_eq!(
            self.access,
            AccessState::Readable {
                fetching_upgrade: true
            }
        );
        self.access = AccessState::Readable {
            fetching_upgrade: false,
        };
    }

    /// `Writable -> Writable+Downgrading`.
    pub(crate) fn start_downgrade(&mut self) {
        debug_assert_eq!(self.access, AccessState::Writable { downgrading: false });
        self.access = AccessState::Writable { downgrading: true };
    }

    /// `Writable+Downgrading -> Readable`.
    pub(crate) fn finish_downgrade(&mut self) {
        debug_assert_eq!(self.access, AccessState::Writable { downgrading: true });
        self.access = AccessState::Readable {
            fetching_upgrade: false,
        };
    }

    /// `Readable|Writable -> Decaching`, with an evict in flight.
    pub(crate) fn start_decache(&mut self) {
        debug_assert!(matches!(
            self.access,
            AccessState::Readable {
                fetching_upgrade: false
            } | AccessState::Writable { downgrading: false }
        ));
        self.access = AccessState::Decaching;
    }

    /// `Decaching -> Decached`, after the server acknowledged the evict.
    pub(crate) fn finish_decache(&mut self) {
        debug_assert_eq!(self.access, AccessState::Decaching);
        self.access = AccessState::Decached;
    }

    /// `Readable|Writable|FetchingRead -> Decached` with no server call:
    /// there is no outstanding write and no pending previous, or the fetch
    /// failed and waiters must be unblocked.
    pub(crate) fn decache_immediately(&mut self) {
        debug_assert!(!matches!(self.access, AccessState::Decached));
        self.access = AccessState::Decached;
    }

    /// Installs a committed modification, to be shipped by the update queue.
    pub(crate) fn install_commit(&mut self, value: EntryValue, context_id: ContextId) {
        debug_assert!(self.writable());
        self.value = Some(value);
        self.modified = true;
        self.context_id = context_id;
        self.locker = None;
    }
}

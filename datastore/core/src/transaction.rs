// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Per-transaction state.
//!
//! Each joined transaction owns one [`TxnContext`] in the context map.
//! Modified values are buffered here until commit, giving read-your-writes
//! within the transaction while other transactions keep seeing the entry's
//! last committed value. Structural binding changes (new entries, lowered
//! previous keys) are applied to the cache eagerly under write intent and
//! recorded here so an abort can reverse them.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::entry::Entry;
use crate::error::{StoreError, StoreResult};
use crate::key::{BindingKey, ContextId, ObjectId, TxnId};

pub(crate) struct TxnContext {
    pub txn_id: TxnId,
    pub context_id: ContextId,
    /// Absolute deadline for every wait this transaction performs.
    pub stop_time: Instant,
    inner: Mutex<TxnInner>,
}

#[derive(Default)]
struct TxnInner {
    /// Entries touched by this transaction, for prepare validation.
    accesses: Vec<Arc<Entry>>,
    /// Buffered object writes; `None` is a removal tombstone.
    object_mods: BTreeMap<ObjectId, Option<Bytes>>,
    /// Buffered binding writes; `None` is a removal tombstone.
    binding_mods: BTreeMap<String, Option<ObjectId>>,
    /// Object ids allocated by this transaction and not yet shipped.
    new_objects: Vec<ObjectId>,
    /// Entries this transaction inserted into the cache; removed on abort.
    created_entries: Vec<BindingKey>,
    created_object_entries: Vec<ObjectId>,
    /// Entries this transaction holds write intent on.
    write_locked: Vec<Arc<Entry>>,
    /// Previous-key edits to reverse on abort, most recent last.
    previous_key_undos: Vec<PreviousKeyUndo>,
    prepared: bool,
}

pub(crate) struct PreviousKeyUndo {
    pub key: BindingKey,
    /// Value to restore on abort.
    pub previous_key: Option<BindingKey>,
    pub previous_key_unbound: bool,
    /// What this transaction set the previous key to. The restore applies
    /// only while the entry still carries it; a later edit by another
    /// operation wins over the undo.
    pub expected_previous_key: Option<BindingKey>,
}

impl TxnContext {
    fn new(txn_id: TxnId, context_id: ContextId, stop_time: Instant) -> Self {
        Self {
            txn_id,
            context_id,
            stop_time,
            inner: Mutex::new(TxnInner::default()),
        }
    }

    /// Records a read, refreshing the entry's LRU position.
    pub(crate) fn note_access(&self, entry: &Arc<Entry>) {
        {
            let mut inner = entry.lock();
            inner.context_id = inner.context_id.max(self.context_id);
        }
        let mut txn = self.inner.lock();
        if !txn.accesses.iter().any(|seen| Arc::ptr_eq(seen, entry)) {
            txn.accesses.push(entry.clone());
        }
    }

    pub(crate) fn note_new_object(&self, oid: ObjectId) {
        self.inner.lock().new_objects.push(oid);
    }

    /// Whether this transaction allocated `oid` itself; such objects have no
    /// server state to fetch yet.
    pub(crate) fn is_new_object(&self, oid: ObjectId) -> bool {
        self.inner.lock().new_objects.contains(&oid)
    }

    /// Records an entry whose `locker` this transaction holds, so commit and
    /// abort can release it.
    pub(crate) fn note_write_locked(&self, entry: &Arc<Entry>) {
        let mut inner = self.inner.lock();
        if !inner.write_locked.iter().any(|seen| Arc::ptr_eq(seen, entry)) {
            inner.write_locked.push(entry.clone());
        }
    }

    pub(crate) fn take_write_locked(&self) -> Vec<Arc<Entry>> {
        std::mem::take(&mut self.inner.lock().write_locked)
    }

    pub(crate) fn note_modified_object(&self, oid: ObjectId, data: Option<Bytes>) {
        self.inner.lock().object_mods.insert(oid, data);
    }

    pub(crate) fn note_modified_binding(&self, name: String, oid: Option<ObjectId>) {
        self.inner.lock().binding_mods.insert(name, oid);
    }

    /// Records an entry this transaction inserted, so an abort can remove it.
    pub(crate) fn note_created_binding(&self, key: BindingKey) {
        self.inner.lock().created_entries.push(key);
    }

    pub(crate) fn note_created_object(&self, oid: ObjectId) {
        self.inner.lock().created_object_entries.push(oid);
    }

    /// Records the state of an entry's previous key before this transaction
    /// changed it.
    pub(crate) fn note_previous_key_change(&self, undo: PreviousKeyUndo) {
        self.inner.lock().previous_key_undos.push(undo);
    }

    /// The buffered write for `oid`, if this transaction modified it.
    pub(crate) fn buffered_object(&self, oid: ObjectId) -> Option<Option<Bytes>> {
        self.inner.lock().object_mods.get(&oid).cloned()
    }

    /// The buffered write for `name`, if this transaction modified it.
    pub(crate) fn buffered_binding(&self, name: &str) -> Option<Option<ObjectId>> {
        self.inner.lock().binding_mods.get(name).cloned()
    }

    pub(crate) fn has_modifications(&self) -> bool {
        let inner = self.inner.lock();
        !inner.object_mods.is_empty() || !inner.binding_mods.is_empty()
    }

    pub(crate) fn mark_prepared(&self) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        if inner.prepared {
            return Err(StoreError::InvalidState(format!(
                "transaction {} already prepared",
                self.txn_id
            )));
        }
        inner.prepared = true;
        Ok(())
    }

    pub(crate) fn is_prepared(&self) -> bool {
        self.inner.lock().prepared
    }

    /// Entries accessed so far; prepare fails if any has been decached.
    pub(crate) fn accesses(&self) -> Vec<Arc<Entry>> {
        self.inner.lock().accesses.clone()
    }

    /// Buffered writes in key order, consumed at commit.
    pub(crate) fn take_modifications(
        &self,
    ) -> (
        BTreeMap<ObjectId, Option<Bytes>>,
        BTreeMap<String, Option<ObjectId>>,
    ) {
        let mut inner = self.inner.lock();
        (
            std::mem::take(&mut inner.object_mods),
            std::mem::take(&mut inner.binding_mods),
        )
    }

    /// Abort bookkeeping: entries to drop and previous-key edits to reverse,
    /// most recent edit first.
    pub(crate) fn take_reversals(
        &self,
    ) -> (Vec<BindingKey>, Vec<ObjectId>, Vec<PreviousKeyUndo>) {
        let mut inner = self.inner.lock();
        let mut undos = std::mem::take(&mut inner.previous_key_undos);
        undos.reverse();
        (
            std::mem::take(&mut inner.created_entries),
            std::mem::take(&mut inner.created_object_entries),
            undos,
        )
    }
}

/// The context map: transactions currently joined to the store.
pub(crate) struct ActiveTxns {
    contexts: DashMap<TxnId, Arc<TxnContext>>,
    next_context_id: AtomicU64,
}

impl ActiveTxns {
    pub(crate) fn new() -> Self {
        Self {
            contexts: DashMap::new(),
            next_context_id: AtomicU64::new(1),
        }
    }

    /// Joins a transaction, assigning it the next context ordinal.
    pub(crate) fn join(&self, txn_id: TxnId, stop_time: Instant) -> StoreResult<Arc<TxnContext>> {
        let context_id = self.next_context_id.fetch_add(1, Ordering::SeqCst);
        let context = Arc::new(TxnContext::new(txn_id, context_id, stop_time));
        if self.contexts.insert(txn_id, context.clone()).is_some() {
            return Err(StoreError::InvalidState(format!(
                "transaction {txn_id} already joined"
            )));
        }
        Ok(context)
    }

    pub(crate) fn get(&self, txn_id: TxnId) -> StoreResult<Arc<TxnContext>> {
        self.contexts
            .get(&txn_id)
            .map(|context| context.clone())
            .ok_or_else(|| {
                StoreError::InvalidState(format!("transaction {txn_id} is not joined"))
            })
    }

    pub(crate) fn remove(&self, txn_id: TxnId) -> Option<Arc<TxnContext>> {
        self.contexts.remove(&txn_id).map(|(_, context)| context)
    }

    pub(crate) fn len(&self) -> usize {
        self.contexts.len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::entry::EntryValue;
    use crate::key::EntryKey;

    fn txns() -> ActiveTxns {
        ActiveTxns::new()
    }

    fn stop_time() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[test]
    fn join_assigns_increasing_context_ids() {
        let txns = txns();
        let first = txns.join(10, stop_time()).unwrap();
        let second = txns.join(11, stop_time()).unwrap();
        assert!(second.context_id > first.context_id);
        assert_eq!(txns.len(), 2);
    }

    #[test]
    fn double_join_is_rejected() {
        let txns = txns();
        txns.join(10, stop_time()).unwrap();
        assert!(matches!(
            txns.join(10, stop_time()),
            Err(StoreError::InvalidState(_))
        ));
    }

    #[test]
    fn unknown_transaction_is_rejected() {
        let txns = txns();
        assert!(matches!(txns.get(42), Err(StoreError::InvalidState(_))));
    }

    #[test]
    fn buffered_writes_give_read_your_writes() {
        let txns = txns();
        let context = txns.join(10, stop_time()).unwrap();

        assert_eq!(context.buffered_object(5), None);
        context.note_modified_object(5, Some(Bytes::from_static(b"v")));
        assert_eq!(
            context.buffered_object(5),
            Some(Some(Bytes::from_static(b"v")))
        );

        context.note_modified_binding("a".to_string(), Some(7));
        assert_eq!(context.buffered_binding("a"), Some(Some(7)));
        context.note_modified_binding("a".to_string(), None);
        assert_eq!(context.buffered_binding("a"), Some(None));
    }

    #[test]
    fn modifications_are_taken_in_key_order() {
        let txns = txns();
        let context = txns.join(10, stop_time()).unwrap();
        context.note_modified_binding("b".to_string(), Some(2));
        context.note_modified_binding("a".to_string(), Some(1));
        context.note_modified_object(9, None);
        context.note_modified_object(3, Some(Bytes::from_static(b"x")));

        let (objects, bindings) = context.take_modifications();
        assert_eq!(objects.keys().copied().collect::<Vec<_>>(), vec![3, 9]);
        assert_eq!(
            bindings.keys().cloned().collect::<Vec<_>>(),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn note_access_refreshes_entry_context_id() {
        let txns = txns();
        txns.join(1, stop_time()).unwrap();
        let context = txns.join(2, stop_time()).unwrap();

        let entry = Arc::new(Entry::new_fetching(EntryKey::Object(4), 0));
        entry
            .lock()
            .install_fetched(EntryValue::Object(Some(Bytes::from_static(b"v"))), false);

        context.note_access(&entry);
        assert_eq!(entry.lock().context_id, context.context_id);

        // A later access by an older transaction does not move it backwards.
        let older = txns.get(1).unwrap();
        older.note_access(&entry);
        assert_eq!(entry.lock().context_id, context.context_id);
    }

    #[test]
    fn reversals_come_back_most_recent_first() {
        let txns = txns();
        let context = txns.join(1, stop_time()).unwrap();
        context.note_previous_key_change(PreviousKeyUndo {
            key: BindingKey::for_name("b"),
            previous_key: None,
            previous_key_unbound: false,
            expected_previous_key: Some(BindingKey::for_name("a")),
        });
        context.note_previous_key_change(PreviousKeyUndo {
            key: BindingKey::for_name("c"),
            previous_key: Some(BindingKey::for_name("a")),
            previous_key_unbound: true,
            expected_previous_key: Some(BindingKey::for_name("b")),
        });

        let (_, _, undos) = context.take_reversals();
        assert_eq!(undos[0].key, BindingKey::for_name("c"));
        assert_eq!(undos[1].key, BindingKey::for_name("b"));
    }
}

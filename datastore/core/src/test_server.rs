// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! In-memory [`ServerApi`] implementation backing unit and scenario tests.
//!
//! Holds the authoritative object and binding tables the way the real server
//! does, answers next-name queries from the ordered binding table and records
//! the calls it receives so tests can assert on the traffic.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound::{Excluded, Unbounded};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::{StoreError, StoreResult};
use crate::key::{BindingKey, ContextId, NodeId, ObjectId};
use crate::server::{
    BindingWrite, GetBindingForRemoveResults, GetBindingForUpdateResults, GetBindingResults,
    GetObjectForUpdateResults, GetObjectResults, NextBoundNameResults, ObjectIdRange, ObjectWrite,
    RegisterNodeResult, ServerApi, UpgradeObjectResults,
};

pub(crate) struct InMemoryServer {
    state: Mutex<ServerState>,
}

struct ServerState {
    objects: HashMap<ObjectId, Bytes>,
    bindings: BTreeMap<String, ObjectId>,
    classes: Vec<Bytes>,
    next_oid: ObjectId,
    calls: Vec<String>,
    commits: Vec<(ContextId, Vec<ObjectWrite>, Vec<BindingWrite>)>,
    fail_calls: bool,
    call_delay: Option<Duration>,
}

impl InMemoryServer {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(ServerState {
                objects: HashMap::new(),
                bindings: BTreeMap::new(),
                classes: Vec::new(),
                next_oid: 1,
                calls: Vec::new(),
                commits: Vec::new(),
                fail_calls: false,
                call_delay: None,
            }),
        }
    }

    pub(crate) fn with_binding(self, name: &str, oid: ObjectId) -> Self {
        self.state.lock().bindings.insert(name.to_string(), oid);
        self
    }

    pub(crate) fn with_object(self, oid: ObjectId, data: &[u8]) -> Self {
        self.state
            .lock()
            .objects
            .insert(oid, Bytes::copy_from_slice(data));
        self
    }

    pub(crate) fn object(&self, oid: ObjectId) -> Option<Bytes> {
        self.state.lock().objects.get(&oid).cloned()
    }

    pub(crate) fn binding(&self, name: &str) -> Option<ObjectId> {
        self.state.lock().bindings.get(name).copied()
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub(crate) fn commits(&self) -> Vec<(ContextId, Vec<ObjectWrite>, Vec<BindingWrite>)> {
        self.state.lock().commits.clone()
    }

    /// Makes every subsequent call fail, as an unreachable server would.
    pub(crate) fn fail_calls(&self, fail: bool) {
        self.state.lock().fail_calls = fail;
    }

    /// Delays every subsequent call, as a slow or distant server would.
    pub(crate) fn set_call_delay(&self, delay: Option<Duration>) {
        self.state.lock().call_delay = delay;
    }

    async fn record(&self, call: impl Into<String>) -> StoreResult<()> {
        let delay = {
            let mut state = self.state.lock();
            state.calls.push(call.into());
            if state.fail_calls {
                return Err(StoreError::Network("server unreachable".to_string()));
            }
            state.call_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }
}

fn next_bound(
    bindings: &BTreeMap<String, ObjectId>,
    above: &str,
) -> (BindingKey, ObjectId) {
    match bindings
        .range::<str, _>((Excluded(above), Unbounded))
        .next()
    {
        Some((name, oid)) => (BindingKey::for_name(name.clone()), *oid),
        None => (BindingKey::Last, 0),
    }
}

#[async_trait]
impl ServerApi for InMemoryServer {
    async fn register_node(&self, _callback_port: u16) -> StoreResult<RegisterNodeResult> {
        self.record("register_node").await?;
        Ok(RegisterNodeResult {
            node_id: 1,
            update_queue_port: 0,
        })
    }

    async fn new_object_ids(&self, _node_id: NodeId, batch_size: u64) -> StoreResult<ObjectIdRange> {
        self.record("new_object_ids").await?;
        let mut state = self.state.lock();
        let first = state.next_oid;
        state.next_oid += batch_size;
        Ok(ObjectIdRange {
            first,
            count: batch_size,
        })
    }

    async fn get_object(&self, _node_id: NodeId, oid: ObjectId) -> StoreResult<GetObjectResults> {
        self.record(format!("get_object({oid})")).await?;
        Ok(GetObjectResults {
            data: self.state.lock().objects.get(&oid).cloned(),
            callback_evict: false,
        })
    }

    async fn get_object_for_update(
        &self,
        _node_id: NodeId,
        oid: ObjectId,
    ) -> StoreResult<GetObjectForUpdateResults> {
        self.record(format!("get_object_for_update({oid})")).await?;
        Ok(GetObjectForUpdateResults {
            data: self.state.lock().objects.get(&oid).cloned(),
            callback_evict: false,
            callback_downgrade: false,
        })
    }

    async fn upgrade_object(
        &self,
        _node_id: NodeId,
        oid: ObjectId,
    ) -> StoreResult<UpgradeObjectResults> {
        self.record(format!("upgrade_object({oid})")).await?;
        Ok(UpgradeObjectResults {
            callback_evict: false,
        })
    }

    async fn get_binding(&self, _node_id: NodeId, name: String) -> StoreResult<GetBindingResults> {
        self.record(format!("get_binding({name})")).await?;
        let state = self.state.lock();
        match state.bindings.get(&name) {
            Some(oid) => Ok(GetBindingResults {
                found: true,
                oid: *oid,
                next_name: None,
                callback_evict: false,
            }),
            None => {
                let (next_name, oid) = next_bound(&state.bindings, &name);
                Ok(GetBindingResults {
                    found: false,
                    oid,
                    next_name: Some(next_name),
                    callback_evict: false,
                })
            }
        }
    }

    async fn get_binding_for_update(
        &self,
        _node_id: NodeId,
        name: String,
    ) -> StoreResult<GetBindingForUpdateResults> {
        self.record(format!("get_binding_for_update({name})")).await?;
        let state = self.state.lock();
        match state.bindings.get(&name) {
            Some(oid) => Ok(GetBindingForUpdateResults {
                found: true,
                oid: *oid,
                next_name: None,
                callback_evict: false,
                callback_downgrade: false,
            }),
            None => {
                let (next_name, oid) = next_bound(&state.bindings, &name);
                Ok(GetBindingForUpdateResults {
                    found: false,
                    oid,
                    next_name: Some(next_name),
                    callback_evict: false,
                    callback_downgrade: false,
                })
            }
        }
    }

    async fn get_binding_for_remove(
        &self,
        _node_id: NodeId,
        name: String,
    ) -> StoreResult<GetBindingForRemoveResults> {
        self.record(format!("get_binding_for_remove({name})")).await?;
        let state = self.state.lock();
        let (next_name, next_oid) = next_bound(&state.bindings, &name);
        Ok(GetBindingForRemoveResults {
            found: state.bindings.contains_key(&name),
            oid: state.bindings.get(&name).copied().unwrap_or(0),
            next_name,
            next_oid,
            callback_evict: false,
            callback_downgrade: false,
            next_callback_evict: false,
            next_callback_downgrade: false,
        })
    }

    async fn next_bound_name(
        &self,
        _node_id: NodeId,
        name: BindingKey,
    ) -> StoreResult<NextBoundNameResults> {
        self.record(format!("next_bound_name({name})")).await?;
        let state = self.state.lock();
        let (next_name, oid) = match &name {
            BindingKey::First => match state.bindings.iter().next() {
                Some((name, oid)) => (BindingKey::for_name(name.clone()), *oid),
                None => (BindingKey::Last, 0),
            },
            BindingKey::Name(name) => next_bound(&state.bindings, name),
            BindingKey::Last => (BindingKey::Last, 0),
        };
        Ok(NextBoundNameResults {
            next_name,
            oid,
            callback_evict: false,
        })
    }

    async fn get_class_id(&self, _node_id: NodeId, class_info: Bytes) -> StoreResult<u32> {
        self.record("get_class_id").await?;
        let mut state = self.state.lock();
        if let Some(position) = state.classes.iter().position(|info| info == &class_info) {
            return Ok(position as u32 + 1);
        }
        state.classes.push(class_info);
        Ok(state.classes.len() as u32)
    }

    async fn get_class_info(&self, _node_id: NodeId, class_id: u32) -> StoreResult<Bytes> {
        self.record("get_class_info").await?;
        let state = self.state.lock();
        state
            .classes
            .get(class_id as usize - 1)
            .cloned()
            .ok_or_else(|| StoreError::InvalidState(format!("unknown class id {class_id}")))
    }

    async fn commit(
        &self,
        _node_id: NodeId,
        context_id: ContextId,
        object_writes: Vec<ObjectWrite>,
        binding_writes: Vec<BindingWrite>,
    ) -> StoreResult<()> {
        self.record(format!("commit({context_id})")).await?;
        let mut state = self.state.lock();
        for write in &object_writes {
            match &write.data {
                Some(data) => {
                    state.objects.insert(write.oid, data.clone());
                }
                None => {
                    state.objects.remove(&write.oid);
                }
            }
        }
        for write in &binding_writes {
            match write.oid {
                Some(oid) => {
                    state.bindings.insert(write.name.clone(), oid);
                }
                None => {
                    state.bindings.remove(&write.name);
                }
            }
        }
        state.commits.push((context_id, object_writes, binding_writes));
        Ok(())
    }

    async fn evict_object(&self, _node_id: NodeId, oid: ObjectId) -> StoreResult<()> {
        self.record(format!("evict_object({oid})")).await
    }

    async fn evict_binding(&self, _node_id: NodeId, key: BindingKey) -> StoreResult<()> {
        self.record(format!("evict_binding({key})")).await
    }

    async fn downgrade_object(&self, _node_id: NodeId, oid: ObjectId) -> StoreResult<()> {
        self.record(format!("downgrade_object({oid})")).await
    }

    async fn downgrade_binding(&self, _node_id: NodeId, key: BindingKey) -> StoreResult<()> {
        self.record(format!("downgrade_binding({key})")).await
    }
}

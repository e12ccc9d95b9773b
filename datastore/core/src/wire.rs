// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Binary payload codec for the server protocol.
//!
//! Frames are length-delimited by the transport; this module encodes and
//! decodes frame payloads. Every request carries the node id, oids and
//! context ids are 64-bit, names are length-prefixed UTF-8 and the binding
//! sentinels travel as distinguished tags, never as strings.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{StoreError, StoreResult};
use crate::key::{BindingKey, ContextId, NodeId, ObjectId};
use crate::server::{
    BindingWrite, GetBindingForRemoveResults, GetBindingForUpdateResults, GetBindingResults,
    GetObjectForUpdateResults, GetObjectResults, NextBoundNameResults, ObjectIdRange, ObjectWrite,
    RegisterNodeResult, UpgradeObjectResults,
};

const TAG_REGISTER_NODE: u8 = 1;
const TAG_NEW_OBJECT_IDS: u8 = 2;
const TAG_GET_OBJECT: u8 = 3;
const TAG_GET_OBJECT_FOR_UPDATE: u8 = 4;
const TAG_UPGRADE_OBJECT: u8 = 5;
const TAG_GET_BINDING: u8 = 6;
const TAG_GET_BINDING_FOR_UPDATE: u8 = 7;
const TAG_GET_BINDING_FOR_REMOVE: u8 = 8;
const TAG_NEXT_BOUND_NAME: u8 = 9;
const TAG_GET_CLASS_ID: u8 = 10;
const TAG_GET_CLASS_INFO: u8 = 11;
const TAG_COMMIT: u8 = 12;
const TAG_EVICT_OBJECT: u8 = 13;
const TAG_EVICT_BINDING: u8 = 14;
const TAG_DOWNGRADE_OBJECT: u8 = 15;
const TAG_DOWNGRADE_BINDING: u8 = 16;

const STATUS_OK: u8 = 0;
const STATUS_FAILURE: u8 = 1;

const KEY_TAG_FIRST: u8 = 0;
const KEY_TAG_NAME: u8 = 1;
const KEY_TAG_LAST: u8 = 2;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Request {
    RegisterNode {
        callback_port: u16,
    },
    NewObjectIds {
        node_id: NodeId,
        batch_size: u64,
    },
    GetObject {
        node_id: NodeId,
        oid: ObjectId,
    },
    GetObjectForUpdate {
        node_id: NodeId,
        oid: ObjectId,
    },
    UpgradeObject {
        node_id: NodeId,
        oid: ObjectId,
    },
    GetBinding {
        node_id: NodeId,
        name: String,
    },
    GetBindingForUpdate {
        node_id: NodeId,
        name: String,
    },
    GetBindingForRemove {
        node_id: NodeId,
        name: String,
    },
    NextBoundName {
        node_id: NodeId,
        name: BindingKey,
    },
    GetClassId {
        node_id: NodeId,
        class_info: Bytes,
    },
    GetClassInfo {
        node_id: NodeId,
        class_id: u32,
    },
    Commit {
        node_id: NodeId,
        context_id: ContextId,
        object_writes: Vec<ObjectWrite>,
        binding_writes: Vec<BindingWrite>,
    },
    EvictObject {
        node_id: NodeId,
        oid: ObjectId,
    },
    EvictBinding {
        node_id: NodeId,
        key: BindingKey,
    },
    DowngradeObject {
        node_id: NodeId,
        oid: ObjectId,
    },
    DowngradeBinding {
        node_id: NodeId,
        key: BindingKey,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Response {
    RegisterNode(RegisterNodeResult),
    NewObjectIds(ObjectIdRange),
    GetObject(GetObjectResults),
    GetObjectForUpdate(GetObjectForUpdateResults),
    UpgradeObject(UpgradeObjectResults),
    GetBinding(GetBindingResults),
    GetBindingForUpdate(GetBindingForUpdateResults),
    GetBindingForRemove(GetBindingForRemoveResults),
    NextBoundName(NextBoundNameResults),
    ClassId(u32),
    ClassInfo(Bytes),
    /// Acknowledgement of a commit, evict or downgrade.
    Ack,
    /// The server rejected the request.
    Failure(String),
}

/// Server-initiated callbacks, received on the callback port.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum CallbackRequest {
    EvictObject { oid: ObjectId },
    DowngradeObject { oid: ObjectId },
    EvictBinding { key: BindingKey },
    DowngradeBinding { key: BindingKey },
}

pub(crate) fn encode_request(request: &Request) -> Bytes {
    let mut buf = BytesMut::new();
    match request {
        Request::RegisterNode { callback_port } => {
            buf.put_u8(TAG_REGISTER_NODE);
            buf.put_u16(*callback_port);
        }
        Request::NewObjectIds {
            node_id,
            batch_size,
        } => {
            buf.put_u8(TAG_NEW_OBJECT_IDS);
            buf.put_u64(*node_id);
            buf.put_u64(*batch_size);
        }
        Request::GetObject { node_id, oid } => {
            buf.put_u8(TAG_GET_OBJECT);
            buf.put_u64(*node_id);
            buf.put_u64(*oid);
        }
        Request::GetObjectForUpdate { node_id, oid } => {
            buf.put_u8(TAG_GET_OBJECT_FOR_UPDATE);
            buf.put_u64(*node_id);
            buf.put_u64(*oid);
        }
        Request::UpgradeObject { node_id, oid } => {
            buf.put_u8(TAG_UPGRADE_OBJECT);
            buf.put_u64(*node_id);
            buf.put_u64(*oid);
        }
        Request::GetBinding { node_id, name } => {
            buf.put_u8(TAG_GET_BINDING);
            buf.put_u64(*node_id);
            put_name(&mut buf, name);
        }
        Request::GetBindingForUpdate { node_id, name } => {
            buf.put_u8(TAG_GET_BINDING_FOR_UPDATE);
            buf.put_u64(*node_id);
            put_name(&mut buf, name);
        }
        Request::GetBindingForRemove { node_id, name } => {
            buf.put_u8(TAG_GET_BINDING_FOR_REMOVE);
            buf.put_u64(*node_id);
            put_name(&mut buf, name);
        }
        Request::NextBoundName { node_id, name } => {
            buf.put_u8(TAG_NEXT_BOUND_NAME);
            buf.put_u64(*node_id);
            put_binding_key(&mut buf, name);
        }
        Request::GetClassId {
            node_id,
            class_info,
        } => {
            buf.put_u8(TAG_GET_CLASS_ID);
            buf.put_u64(*node_id);
            put_bytes(&mut buf, class_info);
        }
        Request::GetClassInfo { node_id, class_id } => {
            buf.put_u8(TAG_GET_CLASS_INFO);
            buf.put_u64(*node_id);
            buf.put_u32(*class_id);
        }
        Request::Commit {
            node_id,
            context_id,
            object_writes,
            binding_writes,
        } => {
            buf.put_u8(TAG_COMMIT);
            buf.put_u64(*node_id);
            buf.put_u64(*context_id);
            buf.put_u32(object_writes.len() as u32);
            for write in object_writes {
                buf.put_u64(write.oid);
                put_opt_bytes(&mut buf, write.data.as_ref());
            }
            buf.put_u32(binding_writes.len() as u32);
            for write in binding_writes {
                put_name(&mut buf, &write.name);
                put_opt_u64(&mut buf, write.oid);
                put_opt_binding_key(&mut buf, write.previous_key.as_ref());
                buf.put_u8(write.previous_key_unbound as u8);
            }
        }
        Request::EvictObject { node_id, oid } => {
            buf.put_u8(TAG_EVICT_OBJECT);
            buf.put_u64(*node_id);
            buf.put_u64(*oid);
        }
        Request::EvictBinding { node_id, key } => {
            buf.put_u8(TAG_EVICT_BINDING);
            buf.put_u64(*node_id);
            put_binding_key(&mut buf, key);
        }
        Request::DowngradeObject { node_id, oid } => {
            buf.put_u8(TAG_DOWNGRADE_OBJECT);
            buf.put_u64(*node_id);
            buf.put_u64(*oid);
        }
        Request::DowngradeBinding { node_id, key } => {
            buf.put_u8(TAG_DOWNGRADE_BINDING);
            buf.put_u64(*node_id);
            put_binding_key(&mut buf, key);
        }
    }
    buf.freeze()
}

pub(crate) fn decode_request(mut buf: Bytes) -> StoreResult<Request> {
    let tag = get_u8(&mut buf)?;
    let request = match tag {
        TAG_REGISTER_NODE => Request::RegisterNode {
            callback_port: get_u16(&mut buf)?,
        },
        TAG_NEW_OBJECT_IDS => Request::NewObjectIds {
            node_id: get_u64(&mut buf)?,
            batch_size: get_u64(&mut buf)?,
        },
        TAG_GET_OBJECT => Request::GetObject {
            node_id: get_u64(&mut buf)?,
            oid: get_u64(&mut buf)?,
        },
        TAG_GET_OBJECT_FOR_UPDATE => Request::GetObjectForUpdate {
            node_id: get_u64(&mut buf)?,
            oid: get_u64(&mut buf)?,
        },
        TAG_UPGRADE_OBJECT => Request::UpgradeObject {
            node_id: get_u64(&mut buf)?,
            oid: get_u64(&mut buf)?,
        },
        TAG_GET_BINDING => Request::GetBinding {
            node_id: get_u64(&mut buf)?,
            name: get_name(&mut buf)?,
        },
        TAG_GET_BINDING_FOR_UPDATE => Request::GetBindingForUpdate {
            node_id: get_u64(&mut buf)?,
            name: get_name(&mut buf)?,
        },
        TAG_GET_BINDING_FOR_REMOVE => Request::GetBindingForRemove {
            node_id: get_u64(&mut buf)?,
            name: get_name(&mut buf)?,
        },
        TAG_NEXT_BOUND_NAME => Request::NextBoundName {
            node_id: get_u64(&mut buf)?,
            name: get_binding_key(&mut buf)?,
        },
        TAG_GET_CLASS_ID => Request::GetClassId {
            node_id: get_u64(&mut buf)?,
            class_info: get_bytes(&mut buf)?,
        },
        TAG_GET_CLASS_INFO => Request::GetClassInfo {
            node_id: get_u64(&mut buf)?,
            class_id: get_u32(&mut buf)?,
        },
        TAG_COMMIT => {
            let node_id = get_u64(&mut buf)?;
            let context_id = get_u64(&mut buf)?;
            let object_count = get_u32(&mut buf)? as usize;
            let mut object_writes = Vec::with_capacity(object_count);
            for _ in 0..object_count {
                object_writes.push(ObjectWrite {
                    oid: get_u64(&mut buf)?,
                    data: get_opt_bytes(&mut buf)?,
                });
            }
            let binding_count = get_u32(&mut buf)? as usize;
            let mut binding_writes = Vec::with_capacity(binding_count);
            for _ in 0..binding_count {
                binding_writes.push(BindingWrite {
                    name: get_name(&mut buf)?,
                    oid: get_opt_u64(&mut buf)?,
                    previous_key: get_opt_binding_key(&mut buf)?,
                    previous_key_unbound: get_bool(&mut buf)?,
                });
            }
            Request::Commit {
                node_id,
                context_id,
                object_writes,
                binding_writes,
            }
        }
        TAG_EVICT_OBJECT => Request::EvictObject {
            node_id: get_u64(&mut buf)?,
            oid: get_u64(&mut buf)?,
        },
        TAG_EVICT_BINDING => Request::EvictBinding {
            node_id: get_u64(&mut buf)?,
            key: get_binding_key(&mut buf)?,
        },
        TAG_DOWNGRADE_OBJECT => Request::DowngradeObject {
            node_id: get_u64(&mut buf)?,
            oid: get_u64(&mut buf)?,
        },
        TAG_DOWNGRADE_BINDING => Request::DowngradeBinding {
            node_id: get_u64(&mut buf)?,
            key: get_binding_key(&mut buf)?,
        },
        tag => {
            return Err(StoreError::WireProtocol(format!(
                "unknown request tag {tag}"
            )))
        }
    };
    expect_empty(&buf)?;
    Ok(request)
}

pub(crate) fn encode_response(response: &Response) -> Bytes {
    let mut buf = BytesMut::new();
    match response {
        Response::Failure(message) => {
            buf.put_u8(STATUS_FAILURE);
            put_name(&mut buf, message);
            return buf.freeze();
        }
        _ => buf.put_u8(STATUS_OK),
    }
    match response {
        Response::RegisterNode(results) => {
            buf.put_u8(TAG_REGISTER_NODE);
            buf.put_u64(results.node_id);
            buf.put_u16(results.update_queue_port);
        }
        Response::NewObjectIds(range) => {
            buf.put_u8(TAG_NEW_OBJECT_IDS);
            buf.put_u64(range.first);
            buf.put_u64(range.count);
        }
        Response::GetObject(results) => {
            buf.put_u8(TAG_GET_OBJECT);
            put_opt_bytes(&mut buf, results.data.as_ref());
            buf.put_u8(results.callback_evict as u8);
        }
        Response::GetObjectForUpdate(results) => {
            buf.put_u8(TAG_GET_OBJECT_FOR_UPDATE);
            put_opt_bytes(&mut buf, results.data.as_ref());
            buf.put_u8(results.callback_evict as u8);
            buf.put_u8(results.callback_downgrade as u8);
        }
        Response::UpgradeObject(results) => {
            buf.put_u8(TAG_UPGRADE_OBJECT);
            buf.put_u8(results.callback_evict as u8);
        }
        Response::GetBinding(results) => {
            buf.put_u8(TAG_GET_BINDING);
            buf.put_u8(results.found as u8);
            buf.put_u64(results.oid);
            put_opt_binding_key(&mut buf, results.next_name.as_ref());
            buf.put_u8(results.callback_evict as u8);
        }
        Response::GetBindingForUpdate(results) => {
            buf.put_u8(TAG_GET_BINDING_FOR_UPDATE);
            buf.put_u8(results.found as u8);
            buf.put_u64(results.oid);
            put_opt_binding_key(&mut buf, results.next_name.as_ref());
            buf.put_u8(results.callback_evict as u8);
            buf.put_u8(results.callback_downgrade as u8);
        }
        Response::GetBindingForRemove(results) => {
            buf.put_u8(TAG_GET_BINDING_FOR_REMOVE);
            buf.put_u8(results.found as u8);
            buf.put_u64(results.oid);
            put_binding_key(&mut buf, &results.next_name);
            buf.put_u64(results.next_oid);
            buf.put_u8(results.callback_evict as u8);
            buf.put_u8(results.callback_downgrade as u8);
            buf.put_u8(results.next_callback_evict as u8);
            buf.put_u8(results.next_callback_downgrade as u8);
        }
        Response::NextBoundName(results) => {
            buf.put_u8(TAG_NEXT_BOUND_NAME);
            put_binding_key(&mut buf, &results.next_name);
            buf.put_u64(results.oid);
            buf.put_u8(results.callback_evict as u8);
        }
        Response::ClassId(class_id) => {
            buf.put_u8(TAG_GET_CLASS_ID);
            buf.put_u32(*class_id);
        }
        Response::ClassInfo(class_info) => {
            buf.put_u8(TAG_GET_CLASS_INFO);
            put_bytes(&mut buf, class_info);
        }
        Response::Ack => {
            buf.put_u8(TAG_COMMIT);
        }
        Response::Failure(_) => unreachable!(),
    }
    buf.freeze()
}

pub(crate) fn decode_response(mut buf: Bytes) -> StoreResult<Response> {
    let status = get_u8(&mut buf)?;
    if status == STATUS_FAILURE {
        return Ok(Response::Failure(get_name(&mut buf)?));
    }
    let tag = get_u8(&mut buf)?;
    let response = match tag {
        TAG_REGISTER_NODE => Response::RegisterNode(RegisterNodeResult {
            node_id: get_u64(&mut buf)?,
            update_queue_port: get_u16(&mut buf)?,
        }),
        TAG_NEW_OBJECT_IDS => Response::NewObjectIds(ObjectIdRange {
            first: get_u64(&mut buf)?,
            count: get_u64(&mut buf)?,
        }),
        TAG_GET_OBJECT => Response::GetObject(GetObjectResults {
            data: get_opt_bytes(&mut buf)?,
            callback_evict: get_bool(&mut buf)?,
        }),
        TAG_GET_OBJECT_FOR_UPDATE => Response::GetObjectForUpdate(GetObjectForUpdateResults {
            data: get_opt_bytes(&mut buf)?,
            callback_evict: get_bool(&mut buf)?,
            callback_downgrade: get_bool(&mut buf)?,
        }),
        TAG_UPGRADE_OBJECT => Response::UpgradeObject(UpgradeObjectResults {
            callback_evict: get_bool(&mut buf)?,
        }),
        TAG_GET_BINDING => Response::GetBinding(GetBindingResults {
            found: get_bool(&mut buf)?,
            oid: get_u64(&mut buf)?,
            next_name: get_opt_binding_key(&mut buf)?,
            callback_evict: get_bool(&mut buf)?,
        }),
        TAG_GET_BINDING_FOR_UPDATE => Response::GetBindingForUpdate(GetBindingForUpdateResults {
            found: get_bool(&mut buf)?,
            oid: get_u64(&mut buf)?,
            next_name: get_opt_binding_key(&mut buf)?,
            callback_evict: get_bool(&mut buf)?,
            callback_downgrade: get_bool(&mut buf)?,
        }),
        TAG_GET_BINDING_FOR_REMOVE => Response::GetBindingForRemove(GetBindingForRemoveResults {
            found: get_bool(&mut buf)?,
            oid: get_u64(&mut buf)?,
            next_name: get_binding_key(&mut buf)?,
            next_oid: get_u64(&mut buf)?,
            callback_evict: get_bool(&mut buf)?,
            callback_downgrade: get_bool(&mut buf)?,
            next_callback_evict: get_bool(&mut buf)?,
            next_callback_downgrade: get_bool(&mut buf)?,
        }),
        TAG_NEXT_BOUND_NAME => Response::NextBoundName(NextBoundNameResults {
            next_name: get_binding_key(&mut buf)?,
            oid: get_u64(&mut buf)?,
            callback_evict: get_bool(&mut buf)?,
        }),
        TAG_GET_CLASS_ID => Response::ClassId(get_u32(&mut buf)?),
        TAG_GET_CLASS_INFO => Response::ClassInfo(get_bytes(&mut buf)?),
        TAG_COMMIT => Response::Ack,
        tag => {
            return Err(StoreError::WireProtocol(format!(
                "unknown response tag {tag}"
            )))
        }
    };
    expect_empty(&buf)?;
    Ok(response)
}

pub(crate) fn encode_callback(request: &CallbackRequest) -> Bytes {
    let mut buf = BytesMut::new();
    match request {
        CallbackRequest::EvictObject { oid } => {
            buf.put_u8(TAG_EVICT_OBJECT);
            buf.put_u64(*oid);
        }
        CallbackRequest::DowngradeObject { oid } => {
            buf.put_u8(TAG_DOWNGRADE_OBJECT);
            buf.put_u64(*oid);
        }
        CallbackRequest::EvictBinding { key } => {
            buf.put_u8(TAG_EVICT_BINDING);
            put_binding_key(&mut buf, key);
        }
        CallbackRequest::DowngradeBinding { key } => {
            buf.put_u8(TAG_DOWNGRADE_BINDING);
            put_binding_key(&mut buf, key);
        }
    }
    buf.freeze()
}

pub(crate) fn decode_callback(mut buf: Bytes) -> StoreResult<CallbackRequest> {
    let tag = get_u8(&mut buf)?;
    let request = match tag {
        TAG_EVICT_OBJECT => CallbackRequest::EvictObject {
            oid: get_u64(&mut buf)?,
        },
        TAG_DOWNGRADE_OBJECT => CallbackRequest::DowngradeObject {
            oid: get_u64(&mut buf)?,
        },
        TAG_EVICT_BINDING => CallbackRequest::EvictBinding {
            key: get_binding_key(&mut buf)?,
        },
        TAG_DOWNGRADE_BINDING => CallbackRequest::DowngradeBinding {
            key: get_binding_key(&mut buf)?,
        },
        tag => {
            return Err(StoreError::WireProtocol(format!(
                "unknown callback tag {tag}"
            )))
        }
    };
    expect_empty(&buf)?;
    Ok(request)
}

pub(crate) fn encode_callback_response(done: bool) -> Bytes {
    Bytes::copy_from_slice(&[done as u8])
}

pub(crate) fn decode_callback_response(mut buf: Bytes) -> StoreResult<bool> {
    let done = get_bool(&mut buf)?;
    expect_empty(&buf)?;
    Ok(done)
}

fn put_name(buf: &mut BytesMut, name: &str) {
    buf.put_u16(name.len() as u16);
    buf.put_slice(name.as_bytes());
}

fn get_name(buf: &mut Bytes) -> StoreResult<String> {
    let len = get_u16(buf)? as usize;
    if buf.remaining() < len {
        return Err(truncated());
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| StoreError::WireProtocol("name is not valid UTF-8".to_string()))
}

fn put_binding_key(buf: &mut BytesMut, key: &BindingKey) {
    match key {
        BindingKey::First => buf.put_u8(KEY_TAG_FIRST),
        BindingKey::Name(name) => {
            buf.put_u8(KEY_TAG_NAME);
            put_name(buf, name);
        }
        BindingKey::Last => buf.put_u8(KEY_TAG_LAST),
    }
}

fn get_binding_key(buf: &mut Bytes) -> StoreResult<BindingKey> {
    match get_u8(buf)? {
        KEY_TAG_FIRST => Ok(BindingKey::First),
        KEY_TAG_NAME => Ok(BindingKey::Name(get_name(buf)?)),
        KEY_TAG_LAST => Ok(BindingKey::Last),
        tag => Err(StoreError::WireProtocol(format!(
            "unknown binding key tag {tag}"
        ))),
    }
}

fn put_opt_binding_key(buf: &mut BytesMut, key: Option<&BindingKey>) {
    match key {
        Some(key) => {
            buf.put_u8(1);
            put_binding_key(buf, key);
        }
        None => buf.put_u8(0),
    }
}

fn get_opt_binding_key(buf: &mut Bytes) -> StoreResult<Option<BindingKey>> {
    if get_bool(buf)? {
        Ok(Some(get_binding_key(buf)?))
    } else {
        Ok(None)
    }
}

fn put_bytes(buf: &mut BytesMut, data: &Bytes) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

fn get_bytes(buf: &mut Bytes) -> StoreResult<Bytes> {
    let len = get_u32(buf)? as usize;
    if buf.remaining() < len {
        return Err(truncated());
    }
    Ok(buf.split_to(len))
}

fn put_opt_bytes(buf: &mut BytesMut, data: Option<&Bytes>) {
    match data {
        Some(data) => {
            buf.put_u8(1);
            put_bytes(buf, data);
        }
        None => buf.put_u8(0),
    }
}

fn get_opt_bytes(buf: &mut Bytes) -> StoreResult<Option<Bytes>> {
    if get_bool(buf)? {
        Ok(Some(get_bytes(buf)?))
    } else {
        Ok(None)
    }
}

fn put_opt_u64(buf: &mut BytesMut, value: Option<u64>) {
    match value {
        Some(value) => {
            buf.put_u8(1);
            buf.put_u64(value);
        }
        None => buf.put_u8(0),
    }
}

fn get_opt_u64(buf: &mut Bytes) -> StoreResult<Option<u64>> {
    if get_bool(buf)? {
        Ok(Some(get_u64(buf)?))
    } else {
        Ok(None)
    }
}

fn get_u8(buf: &mut Bytes) -> StoreResult<u8> {
    if buf.remaining() < 1 {
        return Err(truncated());
    }
    Ok(buf.get_u8())
}

fn get_bool(buf: &mut Bytes) -> StoreResult<bool> {
    match get_u8(buf)? {
        0 => Ok(false),
        1 => Ok(true),
        value => Err(StoreError::WireProtocol(format!(
            "invalid boolean {value}"
        ))),
    }
}

fn get_u16(buf: &mut Bytes) -> StoreResult<u16> {
    if buf.remaining() < 2 {
        return Err(truncated());
    }
    Ok(buf.get_u16())
}

fn get_u32(buf: &mut Bytes) -> StoreResult<u32> {
    if buf.remaining() < 4 {
        return Err(truncated());
    }
    Ok(buf.get_u32())
}

fn get_u64(buf: &mut Bytes) -> StoreResult<u64> {
    if buf.remaining() < 8 {
        return Err(truncated());
    }
    Ok(buf.get_u64())
}

fn expect_empty(buf: &Bytes) -> StoreResult<()> {
    if buf.has_remaining() {
        return Err(StoreError::WireProtocol(format!(
            "{} trailing bytes",
            buf.remaining()
        )));
    }
    Ok(())
}

fn truncated() -> StoreError {
    StoreError::WireProtocol("truncated frame".to_string())
}

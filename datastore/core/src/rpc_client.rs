// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! TCP implementation of [`ServerApi`].
//!
//! Two connection lanes are kept: one for request/response calls and one
//! dedicated to the update queue, connected to the port the server hands out
//! at registration. Each lane carries one request at a time; transient I/O
//! errors reconnect and retry with exponential backoff until the total
//! deadline passes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, warn};

use crate::context::Context;
use crate::error::{StoreError, StoreResult};
use crate::key::{BindingKey, ContextId, NodeId, ObjectId};
use crate::server::{
    BindingWrite, GetBindingForRemoveResults, GetBindingForUpdateResults, GetBindingResults,
    GetObjectForUpdateResults, GetObjectResults, NextBoundNameResults, ObjectIdRange, ObjectWrite,
    RegisterNodeResult, ServerApi, UpgradeObjectResults,
};
use crate::wire::{decode_response, encode_request, Request, Response};

type Connection = Framed<TcpStream, LengthDelimitedCodec>;

/// Which connection lane a request travels on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Lane {
    Requests,
    UpdateQueue,
}

pub(crate) struct TcpServerClient {
    context: Arc<Context>,
    request_conn: AsyncMutex<Option<Connection>>,
    update_conn: AsyncMutex<Option<Connection>>,
    /// Learned from the server at registration.
    update_queue_port: Mutex<Option<u16>>,
}

impl TcpServerClient {
    pub(crate) fn new(context: Arc<Context>) -> Self {
        Self {
            context,
            request_conn: AsyncMutex::new(None),
            update_conn: AsyncMutex::new(None),
            update_queue_port: Mutex::new(None),
        }
    }

    fn addr(&self, lane: Lane) -> StoreResult<(String, u16)> {
        let host = self.context.parameters.server_host.clone();
        let port = match lane {
            Lane::Requests => self.context.parameters.server_port,
            Lane::UpdateQueue => self.update_queue_port.lock().ok_or_else(|| {
                StoreError::InvalidState("update queue used before registration".to_string())
            })?,
        };
        Ok((host, port))
    }

    /// Sends `request` on `lane`, retrying transient I/O errors with
    /// exponential backoff until the `max_retry` deadline passes.
    async fn call(&self, lane: Lane, request: Request) -> StoreResult<Response> {
        let parameters = &self.context.parameters;
        let deadline = Instant::now() + parameters.max_retry;
        let mut wait = parameters.retry_wait;
        let max_wait = parameters.retry_wait * 8;

        loop {
            let timer = self
                .context
                .metrics
                .node_metrics
                .server_call_latency
                .start_timer();
            let result = self.try_call(lane, &request).await;
            timer.observe_duration();

            let error = match result {
                Ok(Response::Failure(message)) => return Err(StoreError::Network(message)),
                Ok(response) => return Ok(response),
                Err(error) => error,
            };
            if !error.is_transient() || Instant::now() + wait >= deadline {
                warn!("server call failed permanently: {error}");
                return Err(StoreError::Network(error.to_string()));
            }

            debug!("server call failed, retrying in {wait:?}: {error}");
            self.context.metrics.node_metrics.server_call_retries.inc();
            sleep(wait).await;
            wait = (wait * 2).min(max_wait);
        }
    }

    async fn try_call(&self, lane: Lane, request: &Request) -> StoreResult<Response> {
        let mut slot = match lane {
            Lane::Requests => self.request_conn.lock().await,
            Lane::UpdateQueue => self.update_conn.lock().await,
        };
        if slot.is_none() {
            *slot = Some(self.connect(lane).await?);
        }
        let conn = slot.as_mut().expect("connection was just established");

        let result = self.exchange(conn, request).await;
        if result.is_err() {
            // The stream may be in an undefined state; reconnect on retry.
            *slot = None;
        }
        result
    }

    async fn exchange(&self, conn: &mut Connection, request: &Request) -> StoreResult<Response> {
        conn.send(encode_request(request)).await?;
        let frame = timeout(self.io_timeout(), conn.next())
            .await
            .map_err(|_| io_timed_out())?
            .ok_or_else(connection_closed)??;
        decode_response(frame.freeze())
    }

    async fn connect(&self, lane: Lane) -> StoreResult<Connection> {
        let (host, port) = self.addr(lane)?;
        let stream = timeout(self.io_timeout(), TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| io_timed_out())??;
        stream.set_nodelay(true)?;
        Ok(Framed::new(stream, LengthDelimitedCodec::new()))
    }

    /// Bound on a single connect or response wait; the overall retry deadline
    /// is enforced by `call`.
    fn io_timeout(&self) -> Duration {
        self.context.parameters.max_retry
    }
}

fn io_timed_out() -> StoreError {
    StoreError::Io(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        "server did not answer in time",
    ))
}

fn connection_closed() -> StoreError {
    StoreError::Io(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        "server closed the connection",
    ))
}

fn unexpected(response: Response) -> StoreError {
    StoreError::WireProtocol(format!("unexpected response {response:?}"))
}

#[async_trait]
impl ServerApi for TcpServerClient {
    async fn register_node(&self, callback_port: u16) -> StoreResult<RegisterNodeResult> {
        match self
            .call(Lane::Requests, Request::RegisterNode { callback_port })
            .await?
        {
            Response::RegisterNode(results) => {
                *self.update_queue_port.lock() = Some(results.update_queue_port);
                Ok(results)
            }
            response => Err(unexpected(response)),
        }
    }

    async fn new_object_ids(&self, node_id: NodeId, batch_size: u64) -> StoreResult<ObjectIdRange> {
        match self
            .call(
                Lane::Requests,
                Request::NewObjectIds {
                    node_id,
                    batch_size,
                },
            )
            .await?
        {
            Response::NewObjectIds(range) => Ok(range),
            response => Err(unexpected(response)),
        }
    }

    async fn get_object(&self, node_id: NodeId, oid: ObjectId) -> StoreResult<GetObjectResults> {
        match self
            .call(Lane::Requests, Request::GetObject { node_id, oid })
            .await?
        {
            Response::GetObject(results) => Ok(results),
            response => Err(unexpected(response)),
        }
    }

    async fn get_object_for_update(
        &self,
        node_id: NodeId,
        oid: ObjectId,
    ) -> StoreResult<GetObjectForUpdateResults> {
        match self
            .call(Lane::Requests, Request::GetObjectForUpdate { node_id, oid })
            .await?
        {
            Response::GetObjectForUpdate(results) => Ok(results),
            response => Err(unexpected(response)),
        }
    }

    async fn upgrade_object(
        &self,
        node_id: NodeId,
        oid: ObjectId,
    ) -> StoreResult<UpgradeObjectResults> {
        match self
            .call(Lane::Requests, Request::UpgradeObject { node_id, oid })
            .await?
        {
            Response::UpgradeObject(results) => Ok(results),
            response => Err(unexpected(response)),
        }
    }

    async fn get_binding(&self, node_id: NodeId, name: String) -> StoreResult<GetBindingResults> {
        match self
            .call(Lane::Requests, Request::GetBinding { node_id, name })
            .await?
        {
            Response::GetBinding(results) => Ok(results),
            response => Err(unexpected(response)),
        }
    }

    async fn get_binding_for_update(
        &self,
        node_id: NodeId,
        name: String,
    ) -> StoreResult<GetBindingForUpdateResults> {
        match self
            .call(
                Lane::Requests,
                Request::GetBindingForUpdate { node_id, name },
            )
            .await?
        {
            Response::GetBindingForUpdate(results) => Ok(results),
            response => Err(unexpected(response)),
        }
    }

    async fn get_binding_for_remove(
        &self,
        node_id: NodeId,
        name: String,
    ) -> StoreResult<GetBindingForRemoveResults> {
        match self
            .call(
                Lane::Requests,
                Request::GetBindingForRemove { node_id, name },
            )
            .await?
        {
            Response::GetBindingForRemove(results) => Ok(results),
            response => Err(unexpected(response)),
        }
    }

    async fn next_bound_name(
        &self,
        node_id: NodeId,
        name: BindingKey,
    ) -> StoreResult<NextBoundNameResults> {
        match self
            .call(Lane::Requests, Request::NextBoundName { node_id, name })
            .await?
        {
            Response::NextBoundName(results) => Ok(results),
            response => Err(unexpected(response)),
        }
    }

    async fn get_class_id(&self, node_id: NodeId, class_info: Bytes) -> StoreResult<u32> {
        match self
            .call(
                Lane::Requests,
                Request::GetClassId {
                    node_id,
                    class_info,
                },
            )
            .await?
        {
            Response::ClassId(class_id) => Ok(class_id),
            response => Err(unexpected(response)),
        }
    }

    async fn get_class_info(&self, node_id: NodeId, class_id: u32) -> StoreResult<Bytes> {
        match self
            .call(Lane::Requests, Request::GetClassInfo { node_id, class_id })
            .await?
        {
            Response::ClassInfo(class_info) => Ok(class_info),
            response => Err(unexpected(response)),
        }
    }

    async fn commit(
        &self,
        node_id: NodeId,
        context_id: ContextId,
        object_writes: Vec<ObjectWrite>,
        binding_writes: Vec<BindingWrite>,
    ) -> StoreResult<()> {
        match self
            .call(
                Lane::UpdateQueue,
                Request::Commit {
                    node_id,
                    context_id,
                    object_writes,
                    binding_writes,
                },
            )
            .await?
        {
            Response::Ack => Ok(()),
            response => Err(unexpected(response)),
        }
    }

    async fn evict_object(&self, node_id: NodeId, oid: ObjectId) -> StoreResult<()> {
        match self
            .call(Lane::UpdateQueue, Request::EvictObject { node_id, oid })
            .await?
        {
            Response::Ack => Ok(()),
            response => Err(unexpected(response)),
        }
    }

    async fn evict_binding(&self, node_id: NodeId, key: BindingKey) -> StoreResult<()> {
        match self
            .call(Lane::UpdateQueue, Request::EvictBinding { node_id, key })
            .await?
        {
            Response::Ack => Ok(()),
            response => Err(unexpected(response)),
        }
    }

    async fn downgrade_object(&self, node_id: NodeId, oid: ObjectId) -> StoreResult<()> {
        match self
            .call(Lane::UpdateQueue, Request::DowngradeObject { node_id, oid })
            .await?
        {
            Response::Ack => Ok(()),
            response => Err(unexpected(response)),
        }
    }

    async fn downgrade_binding(&self, node_id: NodeId, key: BindingKey) -> StoreResult<()> {
        match self
            .call(Lane::UpdateQueue, Request::DowngradeBinding { node_id, key })
            .await?
        {
            Response::Ack => Ok(()),
            response => Err(unexpected(response)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use datastore_config::Parameters;
    use tokio::net::TcpListener;

    use super::*;
    use crate::wire::decode_request;

    /// Serves the wire protocol with a fixed handler, dropping the first
    /// `drop_connections` connections to exercise the retry path.
    async fn spawn_wire_server(
        drop_connections: usize,
        handler: impl Fn(Request) -> Response + Send + Sync + 'static,
    ) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dropped = AtomicUsize::new(0);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                if dropped.fetch_add(1, Ordering::SeqCst) < drop_connections {
                    drop(stream);
                    continue;
                }
                let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
                while let Some(Ok(frame)) = framed.next().await {
                    let request = decode_request(frame.freeze()).unwrap();
                    let response = handler(request);
                    if framed.send(crate::wire::encode_response(&response)).await.is_err() {
                        break;
                    }
                }
            }
        });
        addr
    }

    fn client_for(addr: SocketAddr) -> TcpServerClient {
        let parameters = Parameters {
            server_host: addr.ip().to_string(),
            server_port: addr.port(),
            max_retry: Duration::from_millis(500),
            retry_wait: Duration::from_millis(5),
            ..Default::default()
        };
        let context = Arc::new(Context::new_for_test().with_parameters(parameters));
        TcpServerClient::new(context)
    }

    #[tokio::test]
    async fn calls_round_trip_over_tcp() {
        let addr = spawn_wire_server(0, |request| match request {
            Request::GetObject { node_id: 1, oid } => Response::GetObject(GetObjectResults {
                data: Some(Bytes::from(oid.to_be_bytes().to_vec())),
                callback_evict: false,
            }),
            request => panic!("unexpected request {request:?}"),
        })
        .await;

        let client = client_for(addr);
        let results = client.get_object(1, 42).await.unwrap();
        assert_eq!(results.data, Some(Bytes::from(42u64.to_be_bytes().to_vec())));

        // A second call reuses the same connection.
        let results = client.get_object(1, 7).await.unwrap();
        assert_eq!(results.data, Some(Bytes::from(7u64.to_be_bytes().to_vec())));
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        // GIVEN a server that drops the first two connections.
        let addr = spawn_wire_server(2, |_| {
            Response::UpgradeObject(UpgradeObjectResults {
                callback_evict: false,
            })
        })
        .await;

        let client = client_for(addr);
        let results = client.upgrade_object(1, 3).await.unwrap();
        assert!(!results.callback_evict);
    }

    #[tokio::test]
    async fn retries_give_up_after_the_deadline() {
        // GIVEN a server that drops every connection.
        let addr = spawn_wire_server(usize::MAX, |_| unreachable!()).await;

        let client = client_for(addr);
        let result = client.get_object(1, 3).await;
        assert!(matches!(result, Err(StoreError::Network(_))));
    }

    #[tokio::test]
    async fn server_failures_are_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_handler = calls.clone();
        let addr = spawn_wire_server(0, move |_| {
            calls_in_handler.fetch_add(1, Ordering::SeqCst);
            Response::Failure("unknown node".to_string())
        })
        .await;

        let client = client_for(addr);
        let result = client.get_object(1, 3).await;
        assert!(matches!(result, Err(StoreError::Network(message)) if message == "unknown node"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn update_queue_lane_requires_registration() {
        let addr = spawn_wire_server(0, |request| match request {
            Request::RegisterNode { .. } => Response::RegisterNode(RegisterNodeResult {
                node_id: 9,
                update_queue_port: 0,
            }),
            Request::EvictObject { .. } => Response::Ack,
            request => panic!("unexpected request {request:?}"),
        })
        .await;

        let client = client_for(addr);
        let result = client.evict_object(9, 1).await;
        assert!(matches!(result, Err(StoreError::Network(_))));
    }
}

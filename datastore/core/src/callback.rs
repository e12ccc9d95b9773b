// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Callback service: accepts the server's evict and downgrade requests on the
//! local callback port and answers whether they were applied synchronously.
//!
//! The listener socket is bound before the node registers, so the port
//! announced to the server is live by the time callbacks can arrive. The
//! service holds the store weakly; once the store is gone connections are
//! answered no more.

use std::sync::{Arc, Weak};

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, warn};

use crate::error::StoreResult;
use crate::store::StoreInner;
use crate::wire::{decode_callback, encode_callback_response, CallbackRequest};

pub(crate) struct CallbackService;

pub(crate) struct CallbackHandle {
    local_port: u16,
    join_handle: JoinHandle<()>,
}

impl CallbackHandle {
    pub(crate) fn port(&self) -> u16 {
        self.local_port
    }

    pub(crate) fn stop(self) {
        self.join_handle.abort();
    }
}

impl CallbackService {
    /// Binds the callback port ahead of node registration.
    pub(crate) async fn bind(port: u16) -> StoreResult<TcpListener> {
        Ok(TcpListener::bind(("0.0.0.0", port)).await?)
    }

    pub(crate) fn start(
        listener: TcpListener,
        store: Weak<StoreInner>,
        handle: &Handle,
    ) -> CallbackHandle {
        let local_port = listener
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or_default();
        let join_handle = handle.spawn(Self::accept_loop(listener, store));
        CallbackHandle {
            local_port,
            join_handle,
        }
    }

    async fn accept_loop(listener: TcpListener, store: Weak<StoreInner>) {
        debug!("callback service listening");
        loop {
            let stream = match listener.accept().await {
                Ok((stream, _)) => stream,
                Err(error) => {
                    warn!("callback accept failed: {error}");
                    continue;
                }
            };
            tokio::spawn(Self::serve_connection(stream, store.clone()));
        }
    }

    async fn serve_connection(stream: TcpStream, store: Weak<StoreInner>) {
        let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
        while let Some(frame) = framed.next().await {
            let frame = match frame {
                Ok(frame) => frame.freeze(),
                Err(error) => {
                    warn!("callback connection failed: {error}");
                    return;
                }
            };
            let request = match decode_callback(frame) {
                Ok(request) => request,
                Err(error) => {
                    warn!("malformed callback: {error}");
                    return;
                }
            };
            let Some(store) = store.upgrade() else {
                return;
            };
            let done = dispatch(&store, request);
            if framed.send(encode_callback_response(done)).await.is_err() {
                return;
            }
        }
    }
}

fn dispatch(store: &Arc<StoreInner>, request: CallbackRequest) -> bool {
    match request {
        CallbackRequest::EvictObject { oid } => store.request_evict_object(oid),
        CallbackRequest::DowngradeObject { oid } => store.request_downgrade_object(oid),
        CallbackRequest::EvictBinding { key } => store.request_evict_binding(&key),
        CallbackRequest::DowngradeBinding { key } => store.request_downgrade_binding(&key),
    }
}

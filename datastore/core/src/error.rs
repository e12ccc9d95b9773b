// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

use crate::key::{ObjectId, TxnId};

/// Errors surfaced by the caching data store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The server is unreachable or this node has been marked failed. Raised
    /// after transient I/O errors have exhausted the retry policy.
    #[error("network failure communicating with the data store server: {0}")]
    Network(String),

    /// The requested object id is absent or has been removed.
    #[error("object {0} not found")]
    ObjectNotFound(ObjectId),

    /// A wait exceeded the transaction's stop time. Retryable by the
    /// transaction scheduler.
    #[error("transaction {0} exceeded its stop time")]
    TransactionTimeout(TxnId),

    /// An internal cache invariant was violated. Fatal for this node.
    #[error("cache consistency failure: {0}")]
    CacheConsistency(String),

    /// Misuse of the store, e.g. operating on an unknown transaction or
    /// joining after shutdown was requested.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A malformed frame was received from the server.
    #[error("malformed wire message: {0}")]
    WireProtocol(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Whether the error may succeed on retry over the same connection.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Io(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

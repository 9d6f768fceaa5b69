// Copyright 2025 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Object store client interface.
//!
//! The controller only ever talks to storage through [`ObjectStore`]. Each
//! store instance is bound to a single resource type and namespace scope,
//! so `list` and `watch` take no resource arguments.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use kube::core::ErrorResponse;
use thiserror::Error;

use crate::object::{ObjectError, ObjectIdentity, ObjectSnapshot, VersionToken};

/// Errors returned by an [`ObjectStore`].
#[derive(Error, Debug)]
pub enum StoreError {
    /// The stored version no longer matches the expected one.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A watch was asked to resume from a version the server no longer has.
    #[error("resource version expired: {0}")]
    Expired(String),

    /// The request exceeded its deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Any other status returned by the API server.
    #[error("api error {code} ({reason}): {message}")]
    Api {
        /// HTTP status code.
        code: u16,
        /// Machine-readable reason, e.g. `Forbidden`.
        reason: String,
        /// Human-readable message.
        message: String,
    },

    /// The request never got a response.
    #[error("transport error: {0}")]
    Transport(#[source] kube::Error),

    /// The response could not be decoded.
    #[error("malformed response: {0}")]
    Malformed(String),

    /// A returned object lacks required metadata.
    #[error(transparent)]
    Object(#[from] ObjectError),

    /// The object could not be serialized for the request body.
    #[error("failed to encode object: {0}")]
    Encode(#[from] serde_json::Error),
}

impl StoreError {
    /// Returns true for errors worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Conflict(_)
            | StoreError::Expired(_)
            | StoreError::Timeout(_)
            | StoreError::Transport(_) => true,
            StoreError::Api { code, .. } => *code == 429 || *code >= 500,
            _ => false,
        }
    }

    /// Returns true for errors that mean the store cannot be used at all.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::Api { code: 401 | 403, .. })
    }

    /// Maps an API status response onto the store taxonomy.
    pub fn from_response(resp: ErrorResponse) -> Self {
        match resp.code {
            404 => StoreError::NotFound(resp.message),
            409 => StoreError::Conflict(resp.message),
            410 => StoreError::Expired(resp.message),
            code => StoreError::Api {
                code,
                reason: resp.reason,
                message: resp.message,
            },
        }
    }
}

impl From<kube::Error> for StoreError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) => StoreError::from_response(resp),
            other => StoreError::Transport(other),
        }
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// A change event delivered by [`ObjectStore::watch`].
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    /// The object was created.
    Added(ObjectSnapshot),
    /// The object was changed.
    Modified(ObjectSnapshot),
    /// The object was removed; the payload is its last state.
    Deleted(ObjectSnapshot),
    /// Progress marker carrying only a newer resume point.
    Bookmark(VersionToken),
}

/// Result of [`ObjectStore::list`].
#[derive(Debug, Clone)]
pub struct ObjectList {
    /// Every object in scope.
    pub objects: Vec<ObjectSnapshot>,
    /// Version to start a watch from.
    pub version: VersionToken,
}

/// Stream of watch events; ends when the server closes the connection.
pub type EventStream = BoxStream<'static, Result<WatchEvent>>;

/// Storage API with resourceVersion-based optimistic locking.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Lists every object in scope, including uninitialized ones.
    async fn list(&self) -> Result<ObjectList>;

    /// Opens a watch starting after `since`.
    ///
    /// Fails with [`StoreError::Expired`] when `since` is no longer in the
    /// store's history.
    async fn watch(&self, since: &VersionToken) -> Result<EventStream>;

    /// Reads the current state of a single object.
    async fn get(&self, identity: &ObjectIdentity) -> Result<ObjectSnapshot>;

    /// Replaces `object`, provided the stored version still equals `expected`.
    async fn update(
        &self,
        object: &ObjectSnapshot,
        expected: &VersionToken,
    ) -> Result<ObjectSnapshot>;
}

/// Runs a store call with a deadline, mapping expiry to [`StoreError::Timeout`].
pub async fn with_deadline<T, F>(deadline: Duration, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(deadline)),
    }
}

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

//! Pluggable initialization logic.
//!
//! An [`Initializer`] sees a private copy of an uninitialized object and
//! returns the object it wants committed. It knows nothing about version
//! tokens, retries or the pending list; the [`CallbackAdapter`] enforces
//! that boundary.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use thiserror::Error;

use crate::config::MetadataInitializerConfig;
use crate::object::ObjectSnapshot;

/// A refusal to admit an object, recorded as the initializer result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Human-readable explanation.
    pub message: String,
    /// Machine-readable reason; defaults to the message.
    pub reason: String,
    /// HTTP status code reported to the creator; defaults to 400.
    pub code: i32,
}

impl Rejection {
    /// Creates a rejection with reason equal to `message` and code 400.
    pub fn new(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            reason: message.clone(),
            message,
            code: 400,
        }
    }

    /// Sets the machine-readable reason.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    /// Sets the HTTP status code.
    pub fn with_code(mut self, code: i32) -> Self {
        self.code = code;
        self
    }

    /// Converts to the `Status` stored in `metadata.initializers.result`.
    pub fn to_status(&self) -> Status {
        Status {
            status: Some("Failure".to_string()),
            message: Some(self.message.clone()),
            reason: Some(self.reason.clone()),
            code: Some(self.code),
            ..Default::default()
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {})", self.message, self.reason, self.code)
    }
}

/// Errors an [`Initializer`] can return.
#[derive(Error, Debug, Clone)]
pub enum InitializerError {
    /// A dependency failed transiently; the attempt is retried.
    #[error("retryable initializer error: {0}")]
    Retryable(String),

    /// The object cannot be initialized; it is left pending.
    #[error("permanent initializer error: {0}")]
    Permanent(String),

    /// The object is refused admission.
    #[error("object rejected: {0}")]
    Rejected(Rejection),
}

impl InitializerError {
    /// Creates a retryable error.
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    /// Creates a permanent error.
    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    /// Returns true if the attempt should be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

/// User-supplied initialization logic.
///
/// Implementations must be idempotent: after a conflict the same logical
/// change is replayed against a freshly fetched object, possibly many times.
///
/// # Example
///
/// ```rust,ignore
/// struct Annotate;
///
/// #[async_trait]
/// impl Initializer for Annotate {
///     async fn apply(&self, mut object: ObjectSnapshot) -> Result<ObjectSnapshot, InitializerError> {
///         object
///             .set_annotation("example.com/seen", "true")
///             .map_err(|e| InitializerError::permanent(e.to_string()))?;
///         Ok(object)
///     }
/// }
/// ```
#[async_trait]
pub trait Initializer: Send + Sync + 'static {
    /// Returns the object to commit, or why it cannot be committed.
    async fn apply(&self, object: ObjectSnapshot) -> Result<ObjectSnapshot, InitializerError>;
}

/// A wrapper that converts a function into an [`Initializer`].
pub struct FunctionInitializer<F>
where
    F: Fn(ObjectSnapshot) -> Result<ObjectSnapshot, InitializerError> + Send + Sync,
{
    apply_fn: F,
}

impl<F> FunctionInitializer<F>
where
    F: Fn(ObjectSnapshot) -> Result<ObjectSnapshot, InitializerError> + Send + Sync,
{
    /// Creates a new function-based initializer.
    pub fn new(apply_fn: F) -> Self {
        Self { apply_fn }
    }
}

impl<F> fmt::Debug for FunctionInitializer<F>
where
    F: Fn(ObjectSnapshot) -> Result<ObjectSnapshot, InitializerError> + Send + Sync,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionInitializer").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F> Initializer for FunctionInitializer<F>
where
    F: Fn(ObjectSnapshot) -> Result<ObjectSnapshot, InitializerError> + Send + Sync + 'static,
{
    async fn apply(&self, object: ObjectSnapshot) -> Result<ObjectSnapshot, InitializerError> {
        (self.apply_fn)(object)
    }
}

/// Labels and annotations initializer.
///
/// Rejects objects missing any required label, then sets default labels
/// the object does not already carry and overwrites configured annotations.
#[derive(Debug, Clone, Default)]
pub struct MetadataInitializer {
    labels: BTreeMap<String, String>,
    annotations: BTreeMap<String, String>,
    required_labels: Vec<String>,
}

impl MetadataInitializer {
    /// Builds the initializer from configuration.
    pub fn from_config(config: &MetadataInitializerConfig) -> Self {
        Self {
            labels: config.labels.clone(),
            annotations: config.annotations.clone(),
            required_labels: config.required_labels.clone(),
        }
    }
}

#[async_trait]
impl Initializer for MetadataInitializer {
    async fn apply(
        &self,
        mut object: ObjectSnapshot,
    ) -> Result<ObjectSnapshot, InitializerError> {
        let labels = object.labels();
        let missing: Vec<&str> = self
            .required_labels
            .iter()
            .filter(|key| !labels.contains_key(*key))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            let name = object.name().unwrap_or("<unnamed>");
            return Err(InitializerError::Rejected(
                Rejection::new(format!(
                    "{} is missing required labels: {}",
                    name,
                    missing.join(", ")
                ))
                .with_reason("MissingRequiredLabels"),
            ));
        }

        let invalid = |e: crate::object::ObjectError| InitializerError::permanent(e.to_string());
        for (key, value) in &self.labels {
            if !labels.contains_key(key) {
                object.set_label(key, value).map_err(invalid)?;
            }
        }
        for (key, value) in &self.annotations {
            object.set_annotation(key, value).map_err(invalid)?;
        }
        Ok(object)
    }
}

/// What the callback asked the commit engine to write.
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackOutcome {
    /// Commit this object.
    Mutated(ObjectSnapshot),
    /// Commit the unmodified object with a failure result.
    Rejected(Rejection),
}

/// Runs an [`Initializer`] on a private copy and checks what it returned.
#[derive(Clone)]
pub struct CallbackAdapter {
    initializer: Arc<dyn Initializer>,
}

impl CallbackAdapter {
    /// Wraps an initializer.
    pub fn new(initializer: Arc<dyn Initializer>) -> Self {
        Self { initializer }
    }

    /// Invokes the initializer on a deep copy of `snapshot`.
    ///
    /// A result that changed the pending list, the initializer result or
    /// the object identity is a permanent error. The version token of the
    /// result is always reset to that of `snapshot`.
    pub async fn run(
        &self,
        snapshot: &ObjectSnapshot,
    ) -> Result<CallbackOutcome, InitializerError> {
        let mut mutated = match self.initializer.apply(snapshot.clone()).await {
            Ok(mutated) => mutated,
            Err(InitializerError::Rejected(rejection)) => {
                return Ok(CallbackOutcome::Rejected(rejection))
            }
            Err(err) => return Err(err),
        };

        if mutated.pending_initializers() != snapshot.pending_initializers()
            || mutated.initializer_result() != snapshot.initializer_result()
        {
            return Err(InitializerError::permanent(
                "initializer modified metadata.initializers",
            ));
        }
        if mutated.identity().ok() != snapshot.identity().ok() {
            return Err(InitializerError::permanent(
                "initializer changed the object identity",
            ));
        }
        if let Some(version) = snapshot.resource_version() {
            mutated
                .set_resource_version(&version)
                .map_err(|e| InitializerError::permanent(e.to_string()))?;
        }

        Ok(CallbackOutcome::Mutated(mutated))
    }
}

impl fmt::Debug for CallbackAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackAdapter").finish_non_exhaustive()
    }
}

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

//! Commit engine - applies the initializer and releases the object.
//!
//! Each processing task runs the state machine
//!
//! ```text
//! Fetched -> CallbackRun -> Committing -> Committed
//!    ^                          |
//!    +------ ConflictRetry <----+----> PermanentFailure
//! ```
//!
//! The store's version check on `update` is the only mutation gate. On a
//! conflict the object is fetched again and the initializer is replayed
//! against the new body, so every attempt commits a change derived from the
//! state it was validated against.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::backoff::Backoff;
use crate::config::RetryConfig;
use crate::dispatcher::ProcessingTask;
use crate::initializer::{CallbackAdapter, CallbackOutcome, InitializerError};
use crate::object::{ObjectIdentity, ObjectSnapshot, VersionToken};
use crate::store::{with_deadline, ObjectStore, StoreError};

/// States of a single processing task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitState {
    /// A snapshot and its version token are in hand.
    Fetched,
    /// The initializer is running on a copy of the snapshot.
    CallbackRun,
    /// The versioned update is in flight.
    Committing,
    /// The update succeeded.
    Committed,
    /// The attempt failed transiently and will be replayed.
    ConflictRetry,
    /// The task gave up; the object stays pending.
    PermanentFailure,
}

/// Terminal result of a processing task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// This initializer was popped and the object written.
    Committed {
        /// Version token after the write.
        version: Option<VersionToken>,
    },
    /// The object was written with a failure result.
    Rejected {
        /// Version token after the write.
        version: Option<VersionToken>,
    },
    /// The object disappeared; nothing was written.
    Deleted,
    /// The pending list head is not this initializer; nothing was written.
    NotAddressed {
        /// Head of the pending list, if any.
        head: Option<String>,
    },
    /// The task gave up; the object stays pending until the next delivery.
    PermanentFailure {
        /// Why the task gave up.
        reason: String,
    },
    /// Shutdown began before the task finished.
    Abandoned,
}

impl TaskOutcome {
    /// Returns true if the object was written.
    pub fn is_written(&self) -> bool {
        matches!(self, Self::Committed { .. } | Self::Rejected { .. })
    }
}

/// Summary of a finished processing task.
#[derive(Debug, Clone)]
pub struct TaskReport {
    /// Identity of the processed object.
    pub identity: ObjectIdentity,
    /// Attempts made, including the successful one.
    pub attempts: u32,
    /// Terminal outcome.
    pub outcome: TaskOutcome,
}

/// Result of one pass through the state machine.
enum Step {
    Done(TaskOutcome),
    Retry(String),
}

impl Step {
    fn failed(reason: impl fmt::Display) -> Self {
        Step::Done(TaskOutcome::PermanentFailure {
            reason: reason.to_string(),
        })
    }
}

/// Drives processing tasks to a terminal state.
#[derive(Clone)]
pub struct CommitEngine {
    store: Arc<dyn ObjectStore>,
    adapter: CallbackAdapter,
    name: String,
    retry: RetryConfig,
    request_timeout: Duration,
}

impl CommitEngine {
    /// Creates an engine committing as initializer `name`.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        adapter: CallbackAdapter,
        name: impl Into<String>,
        retry: RetryConfig,
        request_timeout: Duration,
    ) -> Self {
        Self {
            store,
            adapter,
            name: name.into(),
            retry,
            request_timeout,
        }
    }

    /// Runs `task` to completion and releases its claim.
    ///
    /// Cancellation is observed after each fetch, before each update and
    /// during backoff. An update already sent is never interrupted.
    pub async fn process(
        &self,
        mut task: ProcessingTask,
        cancel: &CancellationToken,
    ) -> TaskReport {
        let outcome = self.drive(&mut task, cancel).await;
        TaskReport {
            identity: task.identity.clone(),
            attempts: task.attempts,
            outcome,
        }
    }

    async fn drive(&self, task: &mut ProcessingTask, cancel: &CancellationToken) -> TaskOutcome {
        let mut backoff = Backoff::new(&self.retry.backoff);
        // Event payloads without a version token are re-read before use.
        let mut next = task.version.as_ref().map(|_| task.snapshot.clone());

        loop {
            if cancel.is_cancelled() {
                return TaskOutcome::Abandoned;
            }
            task.attempts += 1;

            let snapshot = match next.take() {
                Some(snapshot) => Ok(snapshot),
                None => self.fetch(&task.identity).await,
            };
            if cancel.is_cancelled() {
                return TaskOutcome::Abandoned;
            }
            let step = match snapshot {
                Ok(snapshot) => self.attempt(task, snapshot, cancel).await,
                Err(step) => step,
            };

            let reason = match step {
                Step::Done(outcome) => return outcome,
                Step::Retry(reason) => reason,
            };

            if task.attempts >= self.retry.max_attempts {
                return TaskOutcome::PermanentFailure {
                    reason: format!("gave up after {} attempts: {}", task.attempts, reason),
                };
            }

            let delay = backoff.next_delay();
            debug!(
                object = %task.identity,
                attempt = task.attempts,
                state = ?CommitState::ConflictRetry,
                delay_ms = delay.as_millis() as u64,
                reason = %reason,
                "attempt failed, retrying with a fresh copy"
            );
            tokio::select! {
                _ = cancel.cancelled() => return TaskOutcome::Abandoned,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn fetch(&self, identity: &ObjectIdentity) -> Result<ObjectSnapshot, Step> {
        match with_deadline(self.request_timeout, self.store.get(identity)).await {
            Ok(snapshot) => Ok(snapshot),
            Err(StoreError::NotFound(_)) => Err(Step::Done(TaskOutcome::Deleted)),
            Err(err) if err.is_retryable() => Err(Step::Retry(err.to_string())),
            Err(err) => Err(Step::failed(format!("failed to fetch object: {}", err))),
        }
    }

    async fn attempt(
        &self,
        task: &mut ProcessingTask,
        snapshot: ObjectSnapshot,
        cancel: &CancellationToken,
    ) -> Step {
        task.version = snapshot.resource_version();
        let Some(version) = task.version.clone() else {
            return Step::failed("object has no resourceVersion");
        };
        trace!(object = %task.identity, version = %version, state = ?CommitState::Fetched);

        if !snapshot.is_addressed_to(&self.name) {
            let still_pending = snapshot
                .pending_initializers()
                .iter()
                .any(|name| name == &self.name);
            if task.attempts > 1 && still_pending {
                return Step::failed(format!(
                    "{} is pending but no longer at the head of the list (head is {})",
                    self.name,
                    snapshot.pending_head().unwrap_or("<none>")
                ));
            }
            return Step::Done(TaskOutcome::NotAddressed {
                head: snapshot.pending_head().map(str::to_string),
            });
        }

        trace!(object = %task.identity, state = ?CommitState::CallbackRun);
        let (mut object, rejected) = match self.adapter.run(&snapshot).await {
            Ok(CallbackOutcome::Mutated(object)) => (object, false),
            Ok(CallbackOutcome::Rejected(rejection)) => {
                debug!(object = %task.identity, rejection = %rejection, "initializer rejected object");
                let mut object = snapshot.clone();
                if let Err(err) = object.set_initializer_result(&rejection.to_status()) {
                    return Step::failed(err);
                }
                (object, true)
            }
            Err(InitializerError::Retryable(reason)) => return Step::Retry(reason),
            Err(err) => return Step::failed(err),
        };

        trace!(object = %task.identity, state = ?CommitState::Committing);
        if let Err(err) = object.pop_initializer(&self.name) {
            return Step::Retry(format!("conflict: {}", err));
        }
        if cancel.is_cancelled() {
            return Step::Done(TaskOutcome::Abandoned);
        }

        match with_deadline(self.request_timeout, self.store.update(&object, &version)).await {
            Ok(updated) => {
                let version = updated.resource_version();
                trace!(object = %task.identity, state = ?CommitState::Committed);
                Step::Done(if rejected {
                    TaskOutcome::Rejected { version }
                } else {
                    TaskOutcome::Committed { version }
                })
            }
            Err(StoreError::NotFound(_)) => Step::Done(TaskOutcome::Deleted),
            Err(err) if err.is_retryable() => Step::Retry(err.to_string()),
            Err(err) => Step::failed(format!("update rejected: {}", err)),
        }
    }
}

impl fmt::Debug for CommitEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommitEngine")
            .field("name", &self.name)
            .field("retry", &self.retry)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Dispatcher;
    use crate::initializer::FunctionInitializer;
    use crate::memory_store::MemoryStore;
    use serde_json::json;

    fn engine(store: Arc<MemoryStore>) -> CommitEngine {
        let adapter = CallbackAdapter::new(Arc::new(FunctionInitializer::new(|obj| Ok(obj))));
        let mut retry = RetryConfig::default();
        retry.backoff.initial = Duration::from_millis(1);
        CommitEngine::new(store, adapter, "myinit", retry, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_missing_version_is_fetched() {
        let store = Arc::new(MemoryStore::new());
        let stored = store.create(json!({
            "kind": "Pod",
            "metadata": {
                "name": "x",
                "namespace": "ns",
                "initializers": { "pending": [{ "name": "myinit" }] }
            }
        })).unwrap();

        let mut partial = stored.clone();
        partial.as_value_mut()["metadata"]
            .as_object_mut()
            .unwrap()
            .remove("resourceVersion");
        let task = Dispatcher::new().claim(partial).unwrap().unwrap();

        let report = engine(store.clone()).process(task, &CancellationToken::new()).await;
        assert!(report.outcome.is_written());
        assert_eq!(report.attempts, 1);
    }

    #[tokio::test]
    async fn test_cancelled_task_is_abandoned() {
        let store = Arc::new(MemoryStore::new());
        let stored = store.create(json!({
            "kind": "Pod",
            "metadata": {
                "name": "x",
                "namespace": "ns",
                "initializers": { "pending": [{ "name": "myinit" }] }
            }
        })).unwrap();
        let task = Dispatcher::new().claim(stored).unwrap().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = engine(store.clone()).process(task, &cancel).await;
        assert_eq!(report.outcome, TaskOutcome::Abandoned);
        assert_eq!(store.update_count(), 0);
    }
}

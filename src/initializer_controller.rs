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

//! Initializer controller.
//!
//! Wires one store's watch stream through the dispatcher into commit
//! engine tasks. One controller runs per configured resource.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, trace, warn};

use crate::commit::{CommitEngine, TaskOutcome, TaskReport};
use crate::controller::{CancellationToken, Controller, ControllerError, Result};
use crate::controller_context::ControllerContext;
use crate::dispatcher::Dispatcher;
use crate::initializer::{CallbackAdapter, Initializer};
use crate::object::ObjectSnapshot;
use crate::store::{ObjectStore, StoreError};
use crate::watcher::{is_terminal, InitializerWatch, WatchReadiness};

/// Controller that initializes one resource type.
pub struct InitializerController {
    name: String,
    store: Arc<dyn ObjectStore>,
    initializer: Arc<dyn Initializer>,
    dispatcher: Dispatcher,
    readiness: WatchReadiness,
}

impl InitializerController {
    /// Creates a controller named `name` applying `initializer` to objects
    /// in `store`.
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn ObjectStore>,
        initializer: Arc<dyn Initializer>,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            initializer,
            dispatcher: Dispatcher::new(),
            readiness: WatchReadiness::new(),
        }
    }

    /// Returns the dispatcher tracking this controller's in-flight objects.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    fn dispatch(
        &self,
        object: ObjectSnapshot,
        engine: &CommitEngine,
        workers: &Arc<Semaphore>,
        tasks: &mut JoinSet<TaskReport>,
        cancel: &CancellationToken,
    ) {
        let task = match self.dispatcher.claim(object) {
            Ok(Some(task)) => task,
            Ok(None) => {
                trace!(controller = %self.name, "object already in flight, coalescing event");
                return;
            }
            Err(err) => {
                warn!(controller = %self.name, error = %err, "ignoring object without identity");
                return;
            }
        };

        debug!(controller = %self.name, object = %task.identity, "dispatching");
        let engine = engine.clone();
        let workers = workers.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            let _permit = tokio::select! {
                permit = workers.acquire_owned() => permit.ok(),
                _ = cancel.cancelled() => None,
            };
            engine.process(task, &cancel).await
        });
    }

    fn report(&self, joined: std::result::Result<TaskReport, JoinError>) {
        let report = match joined {
            Ok(report) => report,
            Err(err) => {
                warn!(controller = %self.name, error = %err, "processing task failed");
                return;
            }
        };

        let object = &report.identity;
        let attempts = report.attempts;
        match &report.outcome {
            TaskOutcome::Committed { version } => {
                info!(controller = %self.name, %object, attempts, version = ?version, "initialized object")
            }
            TaskOutcome::Rejected { version } => {
                info!(controller = %self.name, %object, attempts, version = ?version, "rejected object")
            }
            TaskOutcome::Deleted => {
                debug!(controller = %self.name, %object, "object deleted before commit")
            }
            TaskOutcome::NotAddressed { head } => {
                debug!(controller = %self.name, %object, head = ?head, "object no longer addressed to us")
            }
            TaskOutcome::PermanentFailure { reason } => {
                warn!(controller = %self.name, %object, attempts, %reason, "leaving object uninitialized")
            }
            TaskOutcome::Abandoned => {
                debug!(controller = %self.name, %object, "abandoned on shutdown")
            }
        }
    }
}

#[async_trait]
impl Controller for InitializerController {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: ControllerContext, cancel: CancellationToken) -> Result<()> {
        let config = ctx.config.clone();
        let generic = &config.generic;

        let engine = CommitEngine::new(
            self.store.clone(),
            CallbackAdapter::new(self.initializer.clone()),
            generic.name.clone(),
            config.retry.clone(),
            generic.request_timeout,
        );
        let mut events = InitializerWatch::new(
            self.store.clone(),
            generic.name.clone(),
            config.watch.clone(),
            generic.request_timeout,
        )
        .with_resync_period_fn(ctx.resync_period_fn.clone())
        .with_readiness(self.readiness.clone())
        .stream();

        let workers = Arc::new(Semaphore::new(generic.workers));
        let mut tasks = JoinSet::new();
        let mut last_error: Option<StoreError> = None;
        // Cancelled on shutdown and when the watch fails for good.
        let task_cancel = cancel.child_token();

        info!(
            controller = %self.name,
            initializer = %generic.name,
            workers = generic.workers,
            "controller started"
        );

        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => self.report(joined),
                event = events.next() => match event {
                    Some(Ok(object)) => {
                        self.dispatch(object, &engine, &workers, &mut tasks, &task_cancel);
                    }
                    Some(Err(err)) => {
                        if is_terminal(&err) {
                            warn!(controller = %self.name, error = %err, "watch cannot continue");
                        } else {
                            debug!(controller = %self.name, error = %err, "watch error");
                        }
                        last_error = Some(err);
                    }
                    None => {
                        break Err(match last_error.take() {
                            Some(err) => ControllerError::runtime(self.name.clone(), err),
                            None => ControllerError::runtime(self.name.clone(), "watch stream ended"),
                        });
                    }
                },
            }
        };

        task_cancel.cancel();
        while let Some(joined) = tasks.join_next().await {
            self.report(joined);
        }
        result
    }

    fn health_check(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        let ready = self.readiness.is_ready();
        Box::pin(async move { ready })
    }
}

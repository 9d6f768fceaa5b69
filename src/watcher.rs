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

//! Watch multiplexer.
//!
//! Turns one store's list + watch API into an endless stream of objects
//! whose pending-initializer list is headed by a given name. The stream is
//! an explicit state machine:
//!
//! ```text
//! Relist -> Listed -> Connect -> Watching
//!   ^                   ^          |
//!   |                   +----------+  stream closed: resume from last version
//!   +------------------------------+  version expired or resync due
//! ```
//!
//! Errors are yielded as items so the consumer can log them; the stream
//! itself recovers. It only ends after yielding an error the store cannot
//! recover from (see [`is_terminal`]).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::backoff::Backoff;
use crate::config::WatchConfig;
use crate::controller_context::ResyncPeriodFn;
use crate::object::{ObjectSnapshot, VersionToken};
use crate::store::{with_deadline, EventStream, ObjectStore, StoreError, WatchEvent};

/// Stream of objects addressed to this initializer.
pub type InitializerStream = BoxStream<'static, Result<ObjectSnapshot, StoreError>>;

/// Returns true if the watch cannot continue after `err`.
///
/// Besides authorization failures this covers a resource type the server
/// does not know, which surfaces as `NotFound` on list or watch.
pub fn is_terminal(err: &StoreError) -> bool {
    err.is_fatal() || matches!(err, StoreError::NotFound(_))
}

/// Shared flag reporting whether the watch has a current view of the store.
///
/// Set after every successful list, cleared while the watch cannot list.
#[derive(Debug, Clone, Default)]
pub struct WatchReadiness(Arc<AtomicBool>);

impl WatchReadiness {
    /// Creates a flag in the not-ready state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true once the watch has listed successfully.
    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn set(&self, ready: bool) {
        self.0.store(ready, Ordering::Release);
    }
}

/// Builder for the stream of objects addressed to one initializer.
pub struct InitializerWatch {
    store: Arc<dyn ObjectStore>,
    name: String,
    config: WatchConfig,
    request_timeout: Duration,
    resync_period_fn: Option<ResyncPeriodFn>,
    readiness: WatchReadiness,
}

impl InitializerWatch {
    /// Creates a watch over `store` for objects headed by `name`.
    ///
    /// Resync is off until [`with_resync_period_fn`](Self::with_resync_period_fn)
    /// is called.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        name: impl Into<String>,
        config: WatchConfig,
        request_timeout: Duration,
    ) -> Self {
        Self {
            store,
            name: name.into(),
            config,
            request_timeout,
            resync_period_fn: None,
            readiness: WatchReadiness::new(),
        }
    }

    /// Sets the function producing the delay until the next full relist.
    pub fn with_resync_period_fn(mut self, resync_period_fn: Option<ResyncPeriodFn>) -> Self {
        self.resync_period_fn = resync_period_fn;
        self
    }

    /// Reports readiness through `readiness` instead of a private flag.
    pub fn with_readiness(mut self, readiness: WatchReadiness) -> Self {
        self.readiness = readiness;
        self
    }

    /// Returns the readiness flag this watch updates.
    pub fn readiness(&self) -> WatchReadiness {
        self.readiness.clone()
    }

    /// Starts the stream. Nothing is requested until it is first polled.
    pub fn stream(self) -> InitializerStream {
        let state = State {
            backoff: Backoff::new(&self.config.backoff),
            store: self.store,
            name: self.name,
            request_timeout: self.request_timeout,
            resync_period_fn: self.resync_period_fn,
            readiness: self.readiness,
            resync_at: None,
            phase: Phase::Relist { delay: None },
        };
        stream::unfold(state, |mut state| async move {
            let item = state.next_item().await?;
            Some((item, state))
        })
        .boxed()
    }
}

enum Phase {
    Relist {
        delay: Option<Duration>,
    },
    Listed {
        objects: std::vec::IntoIter<ObjectSnapshot>,
        version: VersionToken,
    },
    Connect {
        version: VersionToken,
        delay: Option<Duration>,
    },
    Watching {
        events: EventStream,
        version: VersionToken,
    },
    Done,
}

struct State {
    store: Arc<dyn ObjectStore>,
    name: String,
    request_timeout: Duration,
    resync_period_fn: Option<ResyncPeriodFn>,
    readiness: WatchReadiness,
    backoff: Backoff,
    resync_at: Option<Instant>,
    phase: Phase,
}

type Item = Result<ObjectSnapshot, StoreError>;

impl State {
    /// Advances the state machine until there is something to yield.
    async fn next_item(&mut self) -> Option<Item> {
        loop {
            match std::mem::replace(&mut self.phase, Phase::Done) {
                Phase::Relist { delay } => {
                    if let Some(delay) = delay {
                        tokio::time::sleep(delay).await;
                    }
                    if let Some(err) = self.relist().await {
                        return Some(Err(err));
                    }
                }
                Phase::Listed {
                    mut objects,
                    version,
                } => match objects.next() {
                    Some(object) => {
                        self.phase = Phase::Listed { objects, version };
                        if object.is_addressed_to(&self.name) {
                            return Some(Ok(object));
                        }
                    }
                    None => {
                        self.phase = Phase::Connect {
                            version,
                            delay: None,
                        }
                    }
                },
                Phase::Connect { version, delay } => {
                    if let Some(delay) = delay {
                        tokio::time::sleep(delay).await;
                    }
                    if let Some(err) = self.connect(version).await {
                        return Some(Err(err));
                    }
                }
                Phase::Watching {
                    mut events,
                    version,
                } => {
                    let resync_at = self.resync_at;
                    let event = tokio::select! {
                        event = events.next() => event,
                        _ = resync(resync_at) => {
                            debug!(initializer = %self.name, "resync due, relisting");
                            self.phase = Phase::Relist { delay: None };
                            continue;
                        }
                    };
                    if let Some(item) = self.on_event(event, events, version) {
                        return Some(item);
                    }
                }
                Phase::Done => return None,
            }
        }
    }

    async fn relist(&mut self) -> Option<StoreError> {
        match with_deadline(self.request_timeout, self.store.list()).await {
            Ok(list) => {
                info!(
                    initializer = %self.name,
                    objects = list.objects.len(),
                    version = %list.version,
                    "listed objects"
                );
                self.backoff.reset();
                self.readiness.set(true);
                self.resync_at = self
                    .resync_period_fn
                    .as_ref()
                    .map(|period| Instant::now() + period());
                self.phase = Phase::Listed {
                    objects: list.objects.into_iter(),
                    version: list.version,
                };
                None
            }
            Err(err) => {
                self.readiness.set(false);
                if is_terminal(&err) {
                    self.phase = Phase::Done;
                } else {
                    let delay = self.backoff.next_delay();
                    warn!(initializer = %self.name, error = %err, ?delay, "list failed, retrying");
                    self.phase = Phase::Relist { delay: Some(delay) };
                }
                Some(err)
            }
        }
    }

    async fn connect(&mut self, version: VersionToken) -> Option<StoreError> {
        match with_deadline(self.request_timeout, self.store.watch(&version)).await {
            Ok(events) => {
                trace!(initializer = %self.name, version = %version, "watch opened");
                self.phase = Phase::Watching { events, version };
                None
            }
            Err(err) => {
                self.phase = self.recover(&err, version);
                Some(err)
            }
        }
    }

    fn on_event(
        &mut self,
        event: Option<Result<WatchEvent, StoreError>>,
        events: EventStream,
        mut version: VersionToken,
    ) -> Option<Item> {
        let event = match event {
            None => {
                debug!(initializer = %self.name, version = %version, "watch closed, resuming");
                self.phase = Phase::Connect {
                    version,
                    delay: None,
                };
                return None;
            }
            Some(Err(err)) => {
                self.phase = self.recover(&err, version);
                return Some(Err(err));
            }
            Some(Ok(event)) => event,
        };

        self.backoff.reset();
        let addressed = match event {
            WatchEvent::Added(object) | WatchEvent::Modified(object) => {
                if let Some(v) = object.resource_version() {
                    version = v;
                }
                Some(object).filter(|object| object.is_addressed_to(&self.name))
            }
            WatchEvent::Deleted(object) => {
                if let Some(v) = object.resource_version() {
                    version = v;
                }
                None
            }
            WatchEvent::Bookmark(v) => {
                version = v;
                None
            }
        };
        self.phase = Phase::Watching { events, version };
        addressed.map(Ok)
    }

    /// Picks the phase to continue from after a watch error.
    fn recover(&mut self, err: &StoreError, version: VersionToken) -> Phase {
        if is_terminal(err) {
            self.readiness.set(false);
            return Phase::Done;
        }
        if matches!(err, StoreError::Expired(_)) {
            debug!(initializer = %self.name, version = %version, "watch version expired, relisting");
            return Phase::Relist { delay: None };
        }
        let delay = self.backoff.next_delay();
        warn!(initializer = %self.name, error = %err, ?delay, "watch failed, reconnecting");
        Phase::Connect {
            version,
            delay: Some(delay),
        }
    }
}

async fn resync(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryStore;
    use crate::store::{ObjectList, Result};
    use async_trait::async_trait;
    use serde_json::json;

    fn pod(name: &str, pending: &[&str]) -> serde_json::Value {
        let pending: Vec<_> = pending.iter().map(|n| json!({ "name": n })).collect();
        json!({
            "kind": "Pod",
            "metadata": {
                "name": name,
                "namespace": "ns",
                "initializers": { "pending": pending }
            }
        })
    }

    #[tokio::test]
    async fn test_list_filters_by_head() {
        let store = Arc::new(MemoryStore::new());
        store.create(pod("mine", &["myinit", "other"])).unwrap();
        store.create(pod("theirs", &["other", "myinit"])).unwrap();
        store.create(pod("done", &[])).unwrap();

        let watch = InitializerWatch::new(
            store.clone(),
            "myinit",
            WatchConfig::default(),
            Duration::from_secs(5),
        );
        let readiness = watch.readiness();
        assert!(!readiness.is_ready());

        let mut objects = watch.stream();
        let first = objects.next().await.unwrap().unwrap();
        assert_eq!(first.name(), Some("mine"));
        assert!(readiness.is_ready());
    }

    struct Forbidden;

    #[async_trait]
    impl ObjectStore for Forbidden {
        async fn list(&self) -> Result<ObjectList> {
            Err(StoreError::Api {
                code: 403,
                reason: "Forbidden".to_string(),
                message: "pods is forbidden".to_string(),
            })
        }

        async fn watch(&self, _since: &VersionToken) -> Result<EventStream> {
            unreachable!("watch without list")
        }

        async fn get(&self, identity: &crate::object::ObjectIdentity) -> Result<ObjectSnapshot> {
            Err(StoreError::NotFound(identity.to_string()))
        }

        async fn update(&self, _: &ObjectSnapshot, _: &VersionToken) -> Result<ObjectSnapshot> {
            unreachable!("update from watch")
        }
    }

    #[tokio::test]
    async fn test_forbidden_list_ends_stream() {
        let watch = InitializerWatch::new(
            Arc::new(Forbidden),
            "myinit",
            WatchConfig::default(),
            Duration::from_secs(5),
        );
        let mut objects = watch.stream();
        let err = objects.next().await.unwrap().unwrap_err();
        assert!(is_terminal(&err));
        assert!(objects.next().await.is_none());
    }
}

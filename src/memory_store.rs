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

//! In-memory [`ObjectStore`].
//!
//! Implements the same contract as the API server: a global revision
//! counter, conflict on stale writes, watch history that can be compacted
//! away. Versions are rendered as `v<revision>`. Used to exercise the
//! controller without a cluster; it is not meant for production traffic.
//!
//! Watch history keeps the most recent [`DEFAULT_HISTORY_LIMIT`] events,
//! so resuming from an older revision fails with
//! [`StoreError::Expired`] like an etcd compaction would.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::object::{ObjectIdentity, ObjectSnapshot, VersionToken};
use crate::store::{EventStream, ObjectList, ObjectStore, Result, StoreError, WatchEvent};

const EVENT_BUFFER: usize = 1024;

/// Number of events kept for watch resumption by default.
pub const DEFAULT_HISTORY_LIMIT: usize = 1024;

struct State {
    objects: BTreeMap<ObjectIdentity, ObjectSnapshot>,
    revision: u64,
    history: VecDeque<(u64, WatchEvent)>,
    history_limit: usize,
    compacted: u64,
    disconnect: CancellationToken,
}

/// In-memory object store with resourceVersion semantics.
pub struct MemoryStore {
    state: Mutex<State>,
    events: broadcast::Sender<(u64, WatchEvent)>,
    lists: AtomicUsize,
    watches: AtomicUsize,
    updates: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            state: Mutex::new(State {
                objects: BTreeMap::new(),
                revision: 0,
                history: VecDeque::new(),
                history_limit: DEFAULT_HISTORY_LIMIT,
                compacted: 0,
                disconnect: CancellationToken::new(),
            }),
            events,
            lists: AtomicUsize::new(0),
            watches: AtomicUsize::new(0),
            updates: AtomicUsize::new(0),
        }
    }

    /// Keeps at most `limit` events of watch history.
    pub fn with_history_limit(self, limit: usize) -> Self {
        self.lock().history_limit = limit.max(1);
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A poisoned lock only means a test panicked mid-write.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn token(revision: u64) -> VersionToken {
        VersionToken::new(format!("v{}", revision))
    }

    fn revision_of(token: &VersionToken) -> Result<u64> {
        token
            .as_str()
            .strip_prefix('v')
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| StoreError::Malformed(format!("unknown resource version {}", token)))
    }

    /// Stores `object` under a new revision and records `event`.
    fn commit(
        &self,
        state: &mut State,
        mut object: ObjectSnapshot,
        event: fn(ObjectSnapshot) -> WatchEvent,
    ) -> Result<ObjectSnapshot> {
        let identity = object.identity()?;
        state.revision += 1;
        let revision = state.revision;
        object.set_resource_version(&Self::token(revision))?;
        state.objects.insert(identity, object.clone());
        self.record(state, revision, event(object.clone()));
        Ok(object)
    }

    fn record(&self, state: &mut State, revision: u64, event: WatchEvent) {
        state.history.push_back((revision, event.clone()));
        while state.history.len() > state.history_limit {
            if let Some((dropped, _)) = state.history.pop_front() {
                state.compacted = dropped;
            }
        }
        // No receivers is not an error.
        let _ = self.events.send((revision, event));
    }

    /// Creates an object, replacing any previous one with the same identity.
    pub fn create(&self, value: Value) -> Result<ObjectSnapshot> {
        let mut state = self.lock();
        self.commit(&mut state, ObjectSnapshot::new(value), WatchEvent::Added)
    }

    /// Applies `edit` to a stored object as an out-of-band writer would.
    pub fn modify<F>(&self, identity: &ObjectIdentity, edit: F) -> Result<ObjectSnapshot>
    where
        F: FnOnce(&mut ObjectSnapshot),
    {
        let mut state = self.lock();
        let mut object = state
            .objects
            .get(identity)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(identity.to_string()))?;
        edit(&mut object);
        self.commit(&mut state, object, WatchEvent::Modified)
    }

    /// Deletes an object, returning its last state.
    pub fn delete(&self, identity: &ObjectIdentity) -> Option<ObjectSnapshot> {
        let mut state = self.lock();
        let mut object = state.objects.remove(identity)?;
        state.revision += 1;
        let revision = state.revision;
        if object.set_resource_version(&Self::token(revision)).is_err() {
            return Some(object);
        }
        self.record(&mut state, revision, WatchEvent::Deleted(object.clone()));
        Some(object)
    }

    /// Returns the stored state of an object.
    pub fn object(&self, identity: &ObjectIdentity) -> Option<ObjectSnapshot> {
        self.lock().objects.get(identity).cloned()
    }

    /// Drops all watch history up to the current revision.
    pub fn compact(&self) {
        let mut state = self.lock();
        state.compacted = state.revision;
        state.history.clear();
    }

    /// Ends every open watch stream, as a server-side timeout would.
    pub fn disconnect_watchers(&self) {
        let mut state = self.lock();
        state.disconnect.cancel();
        state.disconnect = CancellationToken::new();
    }

    /// Number of successful updates.
    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    /// Number of list calls served.
    pub fn list_count(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }

    /// Number of watches opened.
    pub fn watch_count(&self) -> usize {
        self.watches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list(&self) -> Result<ObjectList> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        let state = self.lock();
        Ok(ObjectList {
            objects: state.objects.values().cloned().collect(),
            version: Self::token(state.revision),
        })
    }

    async fn watch(&self, since: &VersionToken) -> Result<EventStream> {
        let since = Self::revision_of(since)?;
        let state = self.lock();
        if since < state.compacted {
            return Err(StoreError::Expired(format!(
                "revision v{} is older than the compacted revision v{}",
                since, state.compacted
            )));
        }
        self.watches.fetch_add(1, Ordering::SeqCst);

        // Subscribe under the lock so no event falls between replay and live.
        let receiver = self.events.subscribe();
        let replay: Vec<Result<WatchEvent>> = state
            .history
            .iter()
            .filter(|(revision, _)| *revision > since)
            .map(|(_, event)| Ok(event.clone()))
            .collect();
        let last = state.revision;
        let disconnect = state.disconnect.clone();
        drop(state);

        let live = stream::unfold(receiver, move |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok((revision, _)) if revision <= last => continue,
                    Ok((_, event)) => return Some((Ok(event), receiver)),
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        let err = StoreError::Expired("watcher fell behind".to_string());
                        return Some((Err(err), receiver));
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Ok(stream::iter(replay)
            .chain(live)
            .take_until(disconnect.cancelled_owned())
            .boxed())
    }

    async fn get(&self, identity: &ObjectIdentity) -> Result<ObjectSnapshot> {
        self.object(identity)
            .ok_or_else(|| StoreError::NotFound(identity.to_string()))
    }

    async fn update(
        &self,
        object: &ObjectSnapshot,
        expected: &VersionToken,
    ) -> Result<ObjectSnapshot> {
        let identity = object.identity()?;
        let mut state = self.lock();
        let current = state
            .objects
            .get(&identity)
            .ok_or_else(|| StoreError::NotFound(identity.to_string()))?
            .resource_version();
        if current.as_ref() != Some(expected) {
            return Err(StoreError::Conflict(format!(
                "{} is at {}, not {}",
                identity,
                current.map(|v| v.to_string()).unwrap_or_default(),
                expected
            )));
        }

        let updated = self.commit(&mut state, object.clone(), WatchEvent::Modified)?;
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pod(name: &str) -> Value {
        json!({ "kind": "Pod", "metadata": { "name": name, "namespace": "ns" } })
    }

    #[tokio::test]
    async fn test_update_checks_version() {
        let store = MemoryStore::new();
        let created = store.create(pod("x")).unwrap();
        assert_eq!(created.resource_version(), Some("v1".into()));

        let updated = store.update(&created, &"v1".into()).await.unwrap();
        assert_eq!(updated.resource_version(), Some("v2".into()));

        let err = store.update(&created, &"v1".into()).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(store.update_count(), 1);
    }

    #[tokio::test]
    async fn test_update_deleted_object() {
        let store = MemoryStore::new();
        let created = store.create(pod("x")).unwrap();
        store.delete(&created.identity().unwrap());
        let err = store.update(&created, &"v1".into()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(store.object(&created.identity().unwrap()).is_none());
    }

    #[tokio::test]
    async fn test_watch_replays_and_follows() {
        let store = MemoryStore::new();
        store.create(pod("a")).unwrap();
        let list = store.list().await.unwrap();
        store.create(pod("b")).unwrap();

        let mut events = store.watch(&list.version).await.unwrap();
        store.create(pod("c")).unwrap();

        let names: Vec<String> = vec![
            events.next().await.unwrap().unwrap(),
            events.next().await.unwrap().unwrap(),
        ]
        .into_iter()
        .map(|event| match event {
            WatchEvent::Added(obj) => obj.name().unwrap().to_string(),
            other => panic!("unexpected event: {:?}", other),
        })
        .collect();
        assert_eq!(names, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_compacted_watch_expires() {
        let store = MemoryStore::new();
        store.create(pod("a")).unwrap();
        store.create(pod("b")).unwrap();
        store.compact();
        assert!(matches!(
            store.watch(&"v1".into()).await,
            Err(StoreError::Expired(_))
        ));
        assert!(store.watch(&"v2".into()).await.is_ok());
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let store = MemoryStore::new().with_history_limit(2);
        for name in ["a", "b", "c", "d"] {
            store.create(pod(name)).unwrap();
        }
        assert!(matches!(
            store.watch(&"v1".into()).await,
            Err(StoreError::Expired(_))
        ));

        let events: Vec<_> = store
            .watch(&"v2".into())
            .await
            .unwrap()
            .take(2)
            .map(|event| match event.unwrap() {
                WatchEvent::Added(obj) => obj.name().unwrap().to_string(),
                other => panic!("unexpected event: {:?}", other),
            })
            .collect()
            .await;
        assert_eq!(events, vec!["c", "d"]);
    }

    #[tokio::test]
    async fn test_disconnect_ends_stream() {
        let store = MemoryStore::new();
        let mut events = store.watch(&"v0".into()).await.unwrap();
        store.disconnect_watchers();
        assert!(events.next().await.is_none());
    }
}

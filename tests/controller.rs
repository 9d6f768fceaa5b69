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

//! End-to-end controller runs against the in-memory store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use kube_initializer_rust::config::{InitializerConfig, MetadataInitializerConfig};
use kube_initializer_rust::store::{EventStream, ObjectList, Result};
use kube_initializer_rust::{
    Controller, ControllerContext, Initializer, InitializerController, InitializerError,
    MemoryStore, MetadataInitializer, ObjectIdentity, ObjectSnapshot, ObjectStore, StoreError,
    VersionToken,
};

const NAME: &str = "myinit";

fn pod(name: &str, pending: &[&str]) -> Value {
    let pending: Vec<Value> = pending.iter().map(|n| json!({ "name": n })).collect();
    json!({
        "kind": "Pod",
        "metadata": {
            "name": name,
            "namespace": "ns",
            "initializers": { "pending": pending }
        }
    })
}

fn id(name: &str) -> ObjectIdentity {
    ObjectIdentity::namespaced("Pod", "ns", name)
}

fn context() -> ControllerContext {
    let mut config = InitializerConfig::default();
    config.generic.name = NAME.to_string();
    config.generic.workers = 2;
    config.retry.max_attempts = 20;
    config.retry.backoff.initial = Duration::from_millis(1);
    config.retry.backoff.max = Duration::from_millis(5);
    config.watch.backoff.initial = Duration::from_millis(1);
    ControllerContext::new(Arc::new(config))
}

async fn eventually<F: Fn() -> bool>(condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn annotations() -> Arc<dyn Initializer> {
    let mut config = MetadataInitializerConfig::default();
    config
        .annotations
        .insert("initialized-by".to_string(), NAME.to_string());
    Arc::new(MetadataInitializer::from_config(&config))
}

#[tokio::test]
async fn test_initializes_listed_and_watched_objects() {
    let store = Arc::new(MemoryStore::new());
    store.create(pod("a", &[NAME, "other"])).unwrap();
    store.create(pod("b", &[NAME])).unwrap();
    let theirs = store.create(pod("theirs", &["other", NAME])).unwrap();

    let controller = Arc::new(InitializerController::new(
        "pod-initializer",
        store.clone(),
        annotations(),
    ));
    assert!(!controller.health_check().await);

    let cancel = CancellationToken::new();
    let handle = {
        let controller = controller.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { controller.run(context(), cancel).await })
    };

    store.create(pod("c", &[NAME])).unwrap();

    let released = |name: &str| {
        store
            .object(&id(name))
            .map(|obj| !obj.pending_initializers().iter().any(|n| n == NAME))
            .unwrap_or(false)
    };
    eventually(|| released("a") && released("b") && released("c")).await;
    assert!(controller.health_check().await);

    let a = store.object(&id("a")).unwrap();
    assert_eq!(a.pending_initializers(), vec!["other"]);
    assert_eq!(
        a.annotations().get("initialized-by").map(String::as_str),
        Some(NAME)
    );
    assert_eq!(store.object(&id("theirs")).unwrap(), theirs);

    cancel.cancel();
    handle.await.unwrap().unwrap();
    assert_eq!(controller.dispatcher().in_flight(), 0);
}

/// Tracks how many invocations run at once.
#[derive(Default)]
struct Slow {
    active: AtomicUsize,
    max_active: AtomicUsize,
    calls: AtomicUsize,
}

#[async_trait]
impl Initializer for Slow {
    async fn apply(&self, mut obj: ObjectSnapshot) -> std::result::Result<ObjectSnapshot, InitializerError> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(20)).await;
        obj.set_annotation("slow", "done")
            .map_err(|e| InitializerError::permanent(e.to_string()))?;

        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(obj)
    }
}

#[tokio::test]
async fn test_one_task_per_object_under_event_storm() {
    let store = Arc::new(MemoryStore::new());
    store.create(pod("x", &[NAME])).unwrap();

    let slow = Arc::new(Slow::default());
    let controller = Arc::new(InitializerController::new(
        "pod-initializer",
        store.clone(),
        slow.clone(),
    ));

    let cancel = CancellationToken::new();
    let handle = {
        let controller = controller.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { controller.run(context(), cancel).await })
    };

    // Each write produces another event for the same object while its
    // task is still running.
    eventually(|| {
        controller.dispatcher().is_in_flight(&id("x")) || slow.calls.load(Ordering::SeqCst) > 0
    })
    .await;
    for i in 0..5 {
        let touched = store.modify(&id("x"), |obj| {
            obj.set_label("touch", i.to_string()).unwrap();
        });
        if touched.is_err() || store.object(&id("x")).unwrap().pending_initializers().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    eventually(|| {
        store
            .object(&id("x"))
            .map(|obj| obj.pending_initializers().is_empty())
            .unwrap_or(false)
    })
    .await;

    cancel.cancel();
    handle.await.unwrap().unwrap();

    assert_eq!(slow.max_active.load(Ordering::SeqCst), 1);
    assert!(slow.calls.load(Ordering::SeqCst) >= 1);
    let x = store.object(&id("x")).unwrap();
    assert_eq!(x.annotations().get("slow").map(String::as_str), Some("done"));
}

struct Unauthorized;

#[async_trait]
impl ObjectStore for Unauthorized {
    async fn list(&self) -> Result<ObjectList> {
        Err(StoreError::Api {
            code: 401,
            reason: "Unauthorized".to_string(),
            message: "token expired".to_string(),
        })
    }

    async fn watch(&self, _since: &VersionToken) -> Result<EventStream> {
        unreachable!("watch without list")
    }

    async fn get(&self, identity: &ObjectIdentity) -> Result<ObjectSnapshot> {
        Err(StoreError::NotFound(identity.to_string()))
    }

    async fn update(&self, object: &ObjectSnapshot, _: &VersionToken) -> Result<ObjectSnapshot> {
        Ok(object.clone())
    }
}

#[tokio::test]
async fn test_unauthorized_store_stops_controller() {
    let controller = InitializerController::new("pod-initializer", Arc::new(Unauthorized), annotations());
    let err = controller
        .run(context(), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("token expired"), "{}", err);
    assert!(!controller.health_check().await);
}

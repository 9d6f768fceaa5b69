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

//! [`ObjectStore`] backed by the Kubernetes API server.
//!
//! Requests are built with [`kube::core::Request`] and decoded as raw JSON so
//! `metadata.initializers` survives the round trip. Updates are full
//! replaces (`PUT`): the API server refuses to change the pending list
//! through a patch.

use async_trait::async_trait;
use futures::StreamExt;
use kube::api::{DynamicObject, GetParams, ListParams, PostParams, WatchParams};
use kube::core::{ApiResource, GroupVersionKind, Request, WatchEvent as KubeWatchEvent};
use kube::{Client, Resource};
use serde_json::Value;

use crate::config::ResourceConfig;
use crate::object::{ObjectIdentity, ObjectSnapshot, VersionToken};
use crate::store::{EventStream, ObjectList, ObjectStore, Result, StoreError, WatchEvent};

/// Kubernetes API client scoped to one resource type.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    resource: ApiResource,
    namespace: Option<String>,
    include_uninitialized: bool,
    watch_timeout_secs: u32,
}

impl KubeStore {
    /// Creates a store for `resource`, limited to `namespace` when set.
    pub fn new(client: Client, resource: &ResourceConfig, namespace: Option<String>) -> Self {
        let gvk = GroupVersionKind::gvk(&resource.group, &resource.version, &resource.kind);
        let resource = match &resource.plural {
            Some(plural) => ApiResource::from_gvk_with_plural(&gvk, plural),
            None => ApiResource::from_gvk(&gvk),
        };
        Self {
            client,
            resource,
            namespace,
            include_uninitialized: true,
            watch_timeout_secs: 290,
        }
    }

    /// Controls whether list and watch ask for uninitialized objects.
    pub fn with_include_uninitialized(mut self, include: bool) -> Self {
        self.include_uninitialized = include;
        self
    }

    /// Sets the server-side watch timeout, capped at the API maximum of 295s.
    pub fn with_watch_timeout_secs(mut self, secs: u32) -> Self {
        self.watch_timeout_secs = secs.min(295);
        self
    }

    fn request(&self, namespace: Option<&str>) -> Request {
        Request::new(DynamicObject::url_path(&self.resource, namespace))
    }

    fn scoped(&self, req: http::Request<Vec<u8>>) -> Result<http::Request<Vec<u8>>> {
        if self.include_uninitialized {
            include_uninitialized(req)
        } else {
            Ok(req)
        }
    }

    fn snapshot(&self, value: Value) -> ObjectSnapshot {
        let mut object = ObjectSnapshot::new(value);
        object.ensure_type_meta(&self.resource.api_version, &self.resource.kind);
        object
    }
}

/// Adds `includeUninitialized=true` to the query of `req`.
fn include_uninitialized(req: http::Request<Vec<u8>>) -> Result<http::Request<Vec<u8>>> {
    let (mut parts, body) = req.into_parts();
    let uri = parts.uri.to_string();
    let sep = if uri.contains('?') { '&' } else { '?' };
    parts.uri = format!("{}{}includeUninitialized=true", uri, sep)
        .parse()
        .map_err(|e| StoreError::Malformed(format!("invalid request uri: {}", e)))?;
    Ok(http::Request::from_parts(parts, body))
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn list(&self) -> Result<ObjectList> {
        let req = self
            .request(self.namespace.as_deref())
            .list(&ListParams::default())
            .map_err(kube::Error::BuildRequest)?;
        let mut list: Value = self.client.request(self.scoped(req)?).await?;

        let version = list
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str)
            .map(VersionToken::new)
            .ok_or_else(|| StoreError::Malformed("list without resourceVersion".to_string()))?;
        let items = match list.get_mut("items").map(Value::take) {
            Some(Value::Array(items)) => items,
            Some(Value::Null) | None => Vec::new(),
            Some(_) => return Err(StoreError::Malformed("list items is not an array".to_string())),
        };

        Ok(ObjectList {
            objects: items.into_iter().map(|item| self.snapshot(item)).collect(),
            version,
        })
    }

    async fn watch(&self, since: &VersionToken) -> Result<EventStream> {
        let params = WatchParams::default().timeout(self.watch_timeout_secs);
        let req = self
            .request(self.namespace.as_deref())
            .watch(&params, since.as_str())
            .map_err(kube::Error::BuildRequest)?;
        let events = self
            .client
            .request_events::<Value>(self.scoped(req)?)
            .await?;

        let store = self.clone();
        let stream = events.map(move |event| match event {
            Ok(KubeWatchEvent::Added(obj)) => Ok(WatchEvent::Added(store.snapshot(obj))),
            Ok(KubeWatchEvent::Modified(obj)) => Ok(WatchEvent::Modified(store.snapshot(obj))),
            Ok(KubeWatchEvent::Deleted(obj)) => Ok(WatchEvent::Deleted(store.snapshot(obj))),
            Ok(KubeWatchEvent::Bookmark(bookmark)) => Ok(WatchEvent::Bookmark(VersionToken::new(
                bookmark.metadata.resource_version,
            ))),
            Ok(KubeWatchEvent::Error(resp)) => Err(StoreError::from_response(resp)),
            Err(err) => Err(StoreError::from(err)),
        });
        Ok(stream.boxed())
    }

    async fn get(&self, identity: &ObjectIdentity) -> Result<ObjectSnapshot> {
        let req = self
            .request(identity.namespace.as_deref())
            .get(&identity.name, &GetParams::default())
            .map_err(kube::Error::BuildRequest)?;
        let value: Value = self.client.request(req).await?;
        Ok(self.snapshot(value))
    }

    async fn update(
        &self,
        object: &ObjectSnapshot,
        expected: &VersionToken,
    ) -> Result<ObjectSnapshot> {
        let identity = object.identity()?;
        let mut body = object.clone();
        body.set_resource_version(expected)?;
        let data = serde_json::to_vec(body.as_value())?;

        let req = self
            .request(identity.namespace.as_deref())
            .replace(&identity.name, &PostParams::default(), data)
            .map_err(kube::Error::BuildRequest)?;
        let value: Value = self.client.request(req).await?;
        Ok(self.snapshot(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pods() -> ApiResource {
        ApiResource::from_gvk(&GroupVersionKind::gvk("", "v1", "Pod"))
    }

    #[test]
    fn test_list_includes_uninitialized() {
        let req = Request::new(DynamicObject::url_path(&pods(), Some("ns")))
            .list(&ListParams::default())
            .unwrap();
        let req = include_uninitialized(req).unwrap();
        assert_eq!(req.uri().path(), "/api/v1/namespaces/ns/pods");
        assert!(req
            .uri()
            .query()
            .unwrap()
            .ends_with("includeUninitialized=true"));
    }

    #[test]
    fn test_watch_keeps_existing_query() {
        let params = WatchParams::default().timeout(290);
        let req = Request::new(DynamicObject::url_path(&pods(), None))
            .watch(&params, "42")
            .unwrap();
        let req = include_uninitialized(req).unwrap();
        let query = req.uri().query().unwrap();
        assert!(query.contains("watch=true"));
        assert!(query.contains("resourceVersion=42"));
        assert!(query.contains("&includeUninitialized=true"));
    }

    #[test]
    fn test_group_resource_path() {
        let jobs = ApiResource::from_gvk(&GroupVersionKind::gvk("batch", "v1", "Job"));
        assert_eq!(
            DynamicObject::url_path(&jobs, Some("ns")),
            "/apis/batch/v1/namespaces/ns/jobs"
        );
    }
}

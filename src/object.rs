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

//! Managed object snapshots.
//!
//! Objects are carried as raw JSON rather than typed `k8s-openapi` structs:
//! the typed `ObjectMeta` has no `initializers` field, and a round trip
//! through it would silently drop the pending list this controller works on.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors raised while reading or editing an [`ObjectSnapshot`].
#[derive(Error, Debug)]
pub enum ObjectError {
    /// A required field is absent.
    #[error("object is missing {0}")]
    MissingField(&'static str),

    /// A field that must be a map holds something else.
    #[error("object field {0} is not a JSON object")]
    NotAnObject(&'static str),

    /// Only the head of the pending list may be popped.
    #[error(
        "expected initializer {expected} at the head of the pending list, found {}",
        found.as_deref().unwrap_or("<none>")
    )]
    HeadMismatch {
        /// The initializer that tried to pop itself.
        expected: String,
        /// The actual head, if the list is not empty.
        found: Option<String>,
    },

    /// The initializer result could not be converted to JSON.
    #[error("failed to encode initializer result: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Unique identity of a managed object: kind, namespace and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectIdentity {
    /// Object kind, e.g. `Pod`.
    pub kind: String,
    /// Namespace, `None` for cluster-scoped objects.
    pub namespace: Option<String>,
    /// Object name.
    pub name: String,
}

impl ObjectIdentity {
    /// Creates an identity for a namespaced object.
    pub fn namespaced(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Creates an identity for a cluster-scoped object.
    pub fn cluster(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            namespace: None,
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = self.kind.to_lowercase();
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", kind, ns, self.name),
            None => write!(f, "{}/{}", kind, self.name),
        }
    }
}

/// Opaque optimistic-concurrency token (`metadata.resourceVersion`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionToken(String);

impl VersionToken {
    /// Wraps a raw resource version.
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    /// Returns the raw resource version.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VersionToken {
    fn from(version: &str) -> Self {
        Self::new(version)
    }
}

/// A point-in-time copy of a managed object.
///
/// Cloning a snapshot is a deep copy; initializers always receive their own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectSnapshot(Value);

impl ObjectSnapshot {
    /// Wraps a raw JSON object.
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// Returns the underlying JSON.
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Returns the underlying JSON for arbitrary edits.
    pub fn as_value_mut(&mut self) -> &mut Value {
        &mut self.0
    }

    /// Consumes the snapshot, returning the underlying JSON.
    pub fn into_value(self) -> Value {
        self.0
    }

    /// Returns `kind`, if set.
    pub fn kind(&self) -> Option<&str> {
        self.0.get("kind").and_then(Value::as_str)
    }

    /// Returns `metadata.name`, if set.
    pub fn name(&self) -> Option<&str> {
        self.0.pointer("/metadata/name").and_then(Value::as_str)
    }

    /// Returns `metadata.namespace`, if set.
    pub fn namespace(&self) -> Option<&str> {
        self.0.pointer("/metadata/namespace").and_then(Value::as_str)
    }

    /// Returns the identity of this object.
    pub fn identity(&self) -> Result<ObjectIdentity, ObjectError> {
        let kind = self.kind().ok_or(ObjectError::MissingField("kind"))?;
        let name = self.name().ok_or(ObjectError::MissingField("metadata.name"))?;
        Ok(ObjectIdentity {
            kind: kind.to_string(),
            namespace: self.namespace().map(str::to_string),
            name: name.to_string(),
        })
    }

    /// Fills in `apiVersion` and `kind` when absent.
    ///
    /// List responses omit both on their items.
    pub fn ensure_type_meta(&mut self, api_version: &str, kind: &str) {
        if let Value::Object(map) = &mut self.0 {
            map.entry("apiVersion")
                .or_insert_with(|| Value::String(api_version.to_string()));
            map.entry("kind")
                .or_insert_with(|| Value::String(kind.to_string()));
        }
    }

    /// Returns `metadata.resourceVersion`, if set.
    pub fn resource_version(&self) -> Option<VersionToken> {
        self.0
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str)
            .filter(|v| !v.is_empty())
            .map(VersionToken::new)
    }

    /// Sets `metadata.resourceVersion`.
    pub fn set_resource_version(&mut self, version: &VersionToken) -> Result<(), ObjectError> {
        self.metadata_mut()?.insert(
            "resourceVersion".to_string(),
            Value::String(version.as_str().to_string()),
        );
        Ok(())
    }

    /// Returns the names in `metadata.initializers.pending`, head first.
    pub fn pending_initializers(&self) -> Vec<String> {
        self.0
            .pointer("/metadata/initializers/pending")
            .and_then(Value::as_array)
            .map(|pending| {
                pending
                    .iter()
                    .filter_map(|entry| entry.get("name").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns the head of the pending list.
    pub fn pending_head(&self) -> Option<&str> {
        self.0
            .pointer("/metadata/initializers/pending/0/name")
            .and_then(Value::as_str)
    }

    /// Returns true if `name` is at the head of the pending list.
    pub fn is_addressed_to(&self, name: &str) -> bool {
        self.pending_head() == Some(name)
    }

    /// Returns `metadata.initializers.result`, if set.
    pub fn initializer_result(&self) -> Option<&Value> {
        self.0.pointer("/metadata/initializers/result")
    }

    /// Removes `name` from the head of the pending list.
    ///
    /// Fails without touching the object if `name` is not the head. When the
    /// list becomes empty and no result is recorded, the whole
    /// `initializers` block is dropped.
    pub fn pop_initializer(&mut self, name: &str) -> Result<(), ObjectError> {
        let head = self.pending_head().map(str::to_string);
        if head.as_deref() != Some(name) {
            return Err(ObjectError::HeadMismatch {
                expected: name.to_string(),
                found: head,
            });
        }

        let metadata = self.metadata_mut()?;
        let drop_block = match metadata
            .get_mut("initializers")
            .and_then(Value::as_object_mut)
        {
            Some(initializers) => {
                if let Some(pending) = initializers
                    .get_mut("pending")
                    .and_then(Value::as_array_mut)
                {
                    pending.remove(0);
                    pending.is_empty() && !initializers.contains_key("result")
                } else {
                    false
                }
            }
            None => false,
        };

        if drop_block {
            metadata.remove("initializers");
        }
        Ok(())
    }

    /// Records a failure result in `metadata.initializers.result`.
    pub fn set_initializer_result(&mut self, status: &Status) -> Result<(), ObjectError> {
        let result = serde_json::to_value(status)?;
        let initializers = self
            .metadata_mut()?
            .entry("initializers")
            .or_insert_with(|| Value::Object(Map::new()));
        match initializers {
            Value::Object(map) => {
                map.insert("result".to_string(), result);
                Ok(())
            }
            _ => Err(ObjectError::NotAnObject("metadata.initializers")),
        }
    }

    /// Returns `metadata.labels`.
    pub fn labels(&self) -> BTreeMap<String, String> {
        self.string_map("labels")
    }

    /// Returns `metadata.annotations`.
    pub fn annotations(&self) -> BTreeMap<String, String> {
        self.string_map("annotations")
    }

    /// Sets a label, replacing any existing value.
    pub fn set_label(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), ObjectError> {
        self.insert_string("labels", key.into(), value.into())
    }

    /// Sets an annotation, replacing any existing value.
    pub fn set_annotation(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), ObjectError> {
        self.insert_string("annotations", key.into(), value.into())
    }

    fn string_map(&self, field: &str) -> BTreeMap<String, String> {
        self.0
            .get("metadata")
            .and_then(|m| m.get(field))
            .and_then(Value::as_object)
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn insert_string(
        &mut self,
        field: &'static str,
        key: String,
        value: String,
    ) -> Result<(), ObjectError> {
        let entry = self
            .metadata_mut()?
            .entry(field)
            .or_insert_with(|| Value::Object(Map::new()));
        if entry.is_null() {
            *entry = Value::Object(Map::new());
        }
        match entry {
            Value::Object(map) => {
                map.insert(key, Value::String(value));
                Ok(())
            }
            _ => Err(ObjectError::NotAnObject(field)),
        }
    }

    fn metadata_mut(&mut self) -> Result<&mut Map<String, Value>, ObjectError> {
        let root = self
            .0
            .as_object_mut()
            .ok_or(ObjectError::NotAnObject("<root>"))?;
        root.entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()))
            .as_object_mut()
            .ok_or(ObjectError::NotAnObject("metadata"))
    }
}

impl From<Value> for ObjectSnapshot {
    fn from(value: Value) -> Self {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pod(pending: &[&str]) -> ObjectSnapshot {
        let pending: Vec<Value> = pending.iter().map(|n| json!({ "name": n })).collect();
        ObjectSnapshot::new(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": "x",
                "namespace": "ns",
                "resourceVersion": "v1",
                "initializers": { "pending": pending }
            },
            "spec": { "containers": [] }
        }))
    }

    #[test]
    fn test_identity_display() {
        let identity = pod(&["myinit"]).identity().unwrap();
        assert_eq!(identity.to_string(), "pod/ns/x");
        assert_eq!(ObjectIdentity::cluster("Node", "n1").to_string(), "node/n1");
    }

    #[test]
    fn test_identity_requires_name() {
        let obj = ObjectSnapshot::new(json!({ "kind": "Pod", "metadata": {} }));
        assert!(matches!(
            obj.identity(),
            Err(ObjectError::MissingField("metadata.name"))
        ));
    }

    #[test]
    fn test_addressed_only_at_head() {
        let obj = pod(&["other", "myinit"]);
        assert!(!obj.is_addressed_to("myinit"));
        assert!(obj.is_addressed_to("other"));
        assert!(!pod(&[]).is_addressed_to("myinit"));
    }

    #[test]
    fn test_pop_removes_only_head() {
        let mut obj = pod(&["myinit", "other"]);
        obj.pop_initializer("myinit").unwrap();
        assert_eq!(obj.pending_initializers(), vec!["other".to_string()]);
    }

    #[test]
    fn test_pop_last_drops_block() {
        let mut obj = pod(&["myinit"]);
        obj.pop_initializer("myinit").unwrap();
        assert!(obj.as_value().pointer("/metadata/initializers").is_none());
        assert!(obj.pending_initializers().is_empty());
    }

    #[test]
    fn test_pop_rejects_non_head() {
        let mut obj = pod(&["other", "myinit"]);
        let before = obj.clone();
        let err = obj.pop_initializer("myinit").unwrap_err();
        assert!(matches!(
            err,
            ObjectError::HeadMismatch { found: Some(ref f), .. } if f == "other"
        ));
        assert_eq!(obj, before);
    }

    #[test]
    fn test_result_keeps_block() {
        let mut obj = pod(&["myinit"]);
        let status = Status {
            status: Some("Failure".to_string()),
            message: Some("nope".to_string()),
            ..Default::default()
        };
        obj.set_initializer_result(&status).unwrap();
        obj.pop_initializer("myinit").unwrap();
        assert!(obj.pending_initializers().is_empty());
        assert_eq!(
            obj.initializer_result().and_then(|r| r.get("message")),
            Some(&json!("nope"))
        );
    }

    #[test]
    fn test_labels_and_annotations() {
        let mut obj = pod(&["myinit"]);
        obj.set_annotation("foo", "bar").unwrap();
        obj.set_label("team", "infra").unwrap();
        assert_eq!(obj.annotations().get("foo").map(String::as_str), Some("bar"));
        assert_eq!(obj.labels().get("team").map(String::as_str), Some("infra"));
    }

    #[test]
    fn test_ensure_type_meta_keeps_existing() {
        let mut obj = ObjectSnapshot::new(json!({ "metadata": { "name": "j" } }));
        obj.ensure_type_meta("batch/v1", "Job");
        assert_eq!(obj.kind(), Some("Job"));
        obj.ensure_type_meta("v1", "Other");
        assert_eq!(obj.kind(), Some("Job"));
    }
}

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

//! Claiming qualifying events as processing tasks.

use std::sync::Arc;

use dashmap::DashSet;

use crate::object::{ObjectError, ObjectIdentity, ObjectSnapshot, VersionToken};

/// Tracks which objects currently have a processing task.
///
/// At most one [`ProcessingTask`] exists per identity. Events for an
/// identity that is already claimed are coalesced: the running task
/// re-fetches the latest state on conflict, so the event carries nothing
/// it would miss.
#[derive(Clone, Default)]
pub struct Dispatcher {
    in_flight: Arc<DashSet<ObjectIdentity>>,
}

impl Dispatcher {
    /// Creates a dispatcher with nothing in flight.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `object` for processing.
    ///
    /// Returns `Ok(None)` if a task for the same identity is already running.
    pub fn claim(&self, object: ObjectSnapshot) -> Result<Option<ProcessingTask>, ObjectError> {
        let identity = object.identity()?;
        if !self.in_flight.insert(identity.clone()) {
            return Ok(None);
        }

        Ok(Some(ProcessingTask {
            version: object.resource_version(),
            snapshot: object,
            attempts: 0,
            _claim: Claim {
                identity: identity.clone(),
                in_flight: self.in_flight.clone(),
            },
            identity,
        }))
    }

    /// Returns true if `identity` has a task in flight.
    pub fn is_in_flight(&self, identity: &ObjectIdentity) -> bool {
        self.in_flight.contains(identity)
    }

    /// Returns the number of tasks in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

/// Releases the identity when the owning task is dropped.
struct Claim {
    identity: ObjectIdentity,
    in_flight: Arc<DashSet<ObjectIdentity>>,
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.in_flight.remove(&self.identity);
    }
}

/// An object claimed for initialization.
///
/// Dropping the task, whatever its outcome, releases the claim.
pub struct ProcessingTask {
    /// Identity of the claimed object.
    pub identity: ObjectIdentity,
    /// Version token of the snapshot currently being worked on.
    pub version: Option<VersionToken>,
    /// Snapshot the task was claimed with.
    pub snapshot: ObjectSnapshot,
    /// Attempts made so far.
    pub attempts: u32,
    _claim: Claim,
}

impl std::fmt::Debug for ProcessingTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessingTask")
            .field("identity", &self.identity)
            .field("version", &self.version)
            .field("attempts", &self.attempts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pod(name: &str) -> ObjectSnapshot {
        ObjectSnapshot::new(json!({
            "kind": "Pod",
            "metadata": { "name": name, "namespace": "ns", "resourceVersion": "1" }
        }))
    }

    #[test]
    fn test_claim_coalesces_same_identity() {
        let dispatcher = Dispatcher::new();
        let first = dispatcher.claim(pod("x")).unwrap();
        assert!(first.is_some());
        assert!(dispatcher.claim(pod("x")).unwrap().is_none());
        assert!(dispatcher.claim(pod("y")).unwrap().is_some());
    }

    #[test]
    fn test_drop_releases_claim() {
        let dispatcher = Dispatcher::new();
        let task = dispatcher.claim(pod("x")).unwrap().unwrap();
        assert!(dispatcher.is_in_flight(&task.identity));
        assert_eq!(dispatcher.in_flight(), 1);

        drop(task);
        assert_eq!(dispatcher.in_flight(), 0);
        assert!(dispatcher.claim(pod("x")).unwrap().is_some());
    }

    #[test]
    fn test_claim_requires_identity() {
        let dispatcher = Dispatcher::new();
        let nameless = ObjectSnapshot::new(json!({ "kind": "Pod", "metadata": {} }));
        assert!(dispatcher.claim(nameless).is_err());
        assert_eq!(dispatcher.in_flight(), 0);
    }
}

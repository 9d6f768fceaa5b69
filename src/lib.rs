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

//! kube-initializer-rust - a Kubernetes initializer controller
//!
//! Watches resources for objects whose pending-initializer list is headed by
//! a configured name, runs an initialization callback on them and releases
//! them by popping that name under optimistic concurrency:
//! - Object store client (Kubernetes-backed and in-memory)
//! - Watch multiplexer with resume and resync
//! - Dispatcher guaranteeing one task per object
//! - Callback adapter and commit engine
//! - Controller manager and health checks

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backoff;
pub mod commit;
pub mod config;
pub mod controller;
pub mod controller_context;
pub mod controller_manager;
pub mod dispatcher;
pub mod health;
pub mod initializer;
pub mod initializer_controller;
pub mod kube_store;
pub mod memory_store;
pub mod object;
pub mod store;
pub mod watcher;

// Re-export commonly used types
pub use commit::{CommitEngine, TaskOutcome, TaskReport};
pub use config::InitializerConfig;
pub use controller::{Controller, ControllerError};
pub use controller_context::ControllerContext;
pub use controller_manager::ControllerManager;
pub use dispatcher::{Dispatcher, ProcessingTask};
pub use initializer::{
    CallbackAdapter, FunctionInitializer, Initializer, InitializerError, MetadataInitializer,
    Rejection,
};
pub use initializer_controller::InitializerController;
pub use kube_store::KubeStore;
pub use memory_store::MemoryStore;
pub use object::{ObjectIdentity, ObjectSnapshot, VersionToken};
pub use store::{ObjectStore, StoreError, WatchEvent};
pub use watcher::InitializerWatch;

/// Semantic version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

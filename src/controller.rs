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

//! Core controller traits and types.

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use thiserror::Error;

pub use tokio_util::sync::CancellationToken;

use crate::controller_context::ControllerContext;

/// Errors that can occur when running a controller.
#[derive(Error, Debug)]
pub enum ControllerError {
    /// The controller, or a component it depends on, could not start.
    #[error("controller {name} failed to start: {source}")]
    StartFailed {
        /// Controller or component name.
        name: String,
        /// Underlying error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The controller stopped with an error while running.
    #[error("controller {name} runtime error: {source}")]
    Runtime {
        /// Controller name.
        name: String,
        /// Underlying error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The configuration cannot be run with.
    #[error("invalid configuration for controller {name}: {reason}")]
    InvalidConfig {
        /// Controller or initializer name.
        name: String,
        /// What is wrong.
        reason: String,
    },
}

/// Result type for controller operations.
pub type Result<T> = std::result::Result<T, ControllerError>;

impl ControllerError {
    /// Wraps `source` as a runtime failure of controller `name`.
    pub fn runtime(
        name: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        ControllerError::Runtime {
            name: name.into(),
            source: source.into(),
        }
    }
}

/// A long-running control loop managed by the
/// [`ControllerManager`](crate::controller_manager::ControllerManager).
///
/// # Lifecycle
///
/// 1. [`Controller::run`] is called with a cancellation token
/// 2. The controller runs until the token is cancelled or an error occurs
/// 3. [`Controller::shutdown`] is called to clean up resources
#[async_trait]
pub trait Controller: Send + Sync + 'static {
    /// Returns the canonical name of this controller, used in logs and
    /// health checks.
    fn name(&self) -> &str;

    /// Runs the controller's main loop.
    ///
    /// Returns `Ok(())` after the token is cancelled, or an error if the
    /// controller cannot continue.
    async fn run(&self, ctx: ControllerContext, cancel: CancellationToken) -> Result<()>;

    /// Reports whether the controller is ready. Defaults to `true`.
    fn health_check(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        Box::pin(async { true })
    }

    /// Called after the main loop exits. Does nothing by default.
    fn shutdown(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Idle;

    #[async_trait]
    impl Controller for Idle {
        fn name(&self) -> &str {
            "idle"
        }

        async fn run(&self, _ctx: ControllerContext, cancel: CancellationToken) -> Result<()> {
            cancel.cancelled().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_default_hooks() {
        let controller = Idle;
        assert!(controller.health_check().await);
        assert!(controller.shutdown().await.is_ok());
    }

    #[test]
    fn test_runtime_error_message() {
        let err = ControllerError::runtime("pod-initializer", "watch ended");
        assert_eq!(
            err.to_string(),
            "controller pod-initializer runtime error: watch ended"
        );
    }
}

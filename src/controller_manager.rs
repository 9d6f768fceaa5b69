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

//! Controller manager - runs every registered controller to completion.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::InitializerConfig;
use crate::controller::{Controller, ControllerError, Result};
use crate::controller_context::ControllerContext;
use crate::health::{FunctionHealthChecker, HealthRegistry, HealthServer};

/// The controller manager.
///
/// Owns the root cancellation token, the health registry and the set of
/// controllers (one per initialized resource). The first controller to fail
/// stops the others.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use kube_initializer_rust::config::InitializerConfig;
/// use kube_initializer_rust::controller_manager::ControllerManager;
///
/// # async fn run(controller: Arc<dyn kube_initializer_rust::Controller>) -> anyhow::Result<()> {
/// let mut manager = ControllerManager::new(InitializerConfig::default());
/// manager.register(controller);
/// manager.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct ControllerManager {
    config: Arc<InitializerConfig>,
    controllers: Vec<Arc<dyn Controller>>,
    health: HealthRegistry,
    shutdown_token: CancellationToken,
    running_controllers: Arc<tokio::sync::RwLock<HashSet<String>>>,
}

impl ControllerManager {
    /// Creates a manager with no controllers.
    pub fn new(config: InitializerConfig) -> Self {
        Self {
            config: Arc::new(config),
            controllers: Vec::new(),
            health: HealthRegistry::new(),
            shutdown_token: CancellationToken::new(),
            running_controllers: Arc::new(tokio::sync::RwLock::new(HashSet::new())),
        }
    }

    /// Adds a controller to run.
    pub fn register(&mut self, controller: Arc<dyn Controller>) -> &mut Self {
        self.controllers.push(controller);
        self
    }

    /// Returns the shutdown cancellation token.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Returns the registry backing the health endpoints.
    pub fn health_registry(&self) -> &HealthRegistry {
        &self.health
    }

    /// Initiates a graceful shutdown.
    pub fn shutdown(&self) {
        tracing::info!("initiating graceful shutdown");
        self.shutdown_token.cancel();
    }

    /// Runs all controllers until shutdown or the first controller error.
    pub async fn run(&self) -> Result<()> {
        if self.controllers.is_empty() {
            tracing::warn!("no controllers registered, exiting");
            return Ok(());
        }
        tracing::info!(controllers = self.controllers.len(), "starting kube-initializer");

        let mut names = HashSet::new();
        for controller in &self.controllers {
            if !names.insert(controller.name()) {
                return Err(ControllerError::InvalidConfig {
                    name: controller.name().to_string(),
                    reason: "controller name is registered twice".to_string(),
                });
            }
        }

        for controller in &self.controllers {
            let controller = controller.clone();
            let checker = FunctionHealthChecker::new(controller.name().to_string(), move || {
                let controller = controller.clone();
                async move { controller.health_check().await }
            });
            self.health.register(Arc::new(checker)).await;
        }

        let health_server = if self.config.generic.enable_health_server {
            let server = HealthServer::new(
                self.health.clone(),
                self.config.generic.healthz_bind_address.clone(),
                self.config.generic.healthz_bind_port,
            );
            let handle = server
                .spawn(self.shutdown_token.child_token())
                .await
                .map_err(|e| ControllerError::StartFailed {
                    name: "health-server".to_string(),
                    source: Box::new(e),
                })?;
            Some(handle)
        } else {
            None
        };

        let ctx = ControllerContext::new(self.config.clone());
        let result = self.run_controllers(ctx).await;

        if let Some(server) = health_server {
            server.abort();
        }
        result
    }

    async fn run_controllers(&self, ctx: ControllerContext) -> Result<()> {
        let start_interval = self.config.generic.controller_start_interval;
        let mut join_set = JoinSet::new();

        for controller in self.controllers.iter().cloned() {
            let name = controller.name().to_string();
            let ctx = ctx.clone();
            let cancel = self.shutdown_token.clone();
            let running = self.running_controllers.clone();

            let jitter = rand::random::<f64>();
            let delay = Duration::from_secs_f64(start_interval.as_secs_f64() * (1.0 + jitter));

            join_set.spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => return (name, Ok(())),
                    _ = tokio::time::sleep(delay) => {}
                }
                tracing::info!(controller = %name, "starting controller");

                running.write().await.insert(name.clone());
                let result = controller.run(ctx, cancel).await;
                running.write().await.remove(&name);

                if let Err(e) = controller.shutdown().await {
                    tracing::warn!(controller = %name, error = %e, "controller shutdown hook failed");
                }
                (name, result)
            });
        }

        let mut failure = None;
        tokio::select! {
            result = async {
                while let Some(joined) = join_set.join_next().await {
                    match joined {
                        Ok((name, Ok(()))) => {
                            tracing::debug!(controller = %name, "controller finished");
                        }
                        Ok((name, Err(e))) => {
                            tracing::error!(controller = %name, error = %e, "controller failed");
                            return Err(e);
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "controller task panicked");
                            return Err(ControllerError::runtime("unknown", e));
                        }
                    }
                }
                Ok(())
            } => {
                if let Err(e) = result {
                    failure = Some(e);
                    self.shutdown_token.cancel();
                }
            }
            _ = self.shutdown_token.cancelled() => {
                tracing::info!("shutdown signal received, waiting for controllers to stop");
            }
        }

        self.wait_for_controllers(&mut join_set).await;
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Waits for the remaining controllers, up to the shutdown timeout.
    async fn wait_for_controllers(&self, join_set: &mut JoinSet<(String, Result<()>)>) {
        let deadline = tokio::time::Instant::now() + self.config.generic.shutdown_timeout;

        while !join_set.is_empty() {
            tokio::select! {
                joined = join_set.join_next() => match joined {
                    Some(Ok((name, Ok(())))) => {
                        tracing::debug!(controller = %name, "controller stopped");
                    }
                    Some(Ok((name, Err(e)))) => {
                        tracing::warn!(controller = %name, error = %e, "controller stopped with error");
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "controller task failed");
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline) => {
                    let running = self.running_controllers.read().await;
                    tracing::warn!(
                        controllers = ?running.iter().collect::<Vec<_>>(),
                        "shutdown timeout reached, controllers still running"
                    );
                    join_set.abort_all();
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Failing;

    #[async_trait]
    impl Controller for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn run(&self, _ctx: ControllerContext, _cancel: CancellationToken) -> Result<()> {
            Err(ControllerError::runtime("failing", "forbidden"))
        }
    }

    #[derive(Default)]
    struct Waiting {
        stopped: AtomicBool,
    }

    #[async_trait]
    impl Controller for Arc<Waiting> {
        fn name(&self) -> &str {
            "waiting"
        }

        async fn run(&self, _ctx: ControllerContext, cancel: CancellationToken) -> Result<()> {
            cancel.cancelled().await;
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn config() -> InitializerConfig {
        let mut config = InitializerConfig::default();
        config.generic.enable_health_server = false;
        config.generic.controller_start_interval = Duration::from_millis(1);
        config.generic.shutdown_timeout = Duration::from_secs(5);
        config
    }

    #[tokio::test]
    async fn test_failure_stops_other_controllers() {
        let waiting = Arc::new(Waiting::default());
        let mut manager = ControllerManager::new(config());
        manager.register(Arc::new(Failing));
        manager.register(Arc::new(waiting.clone()));

        let err = manager.run().await.unwrap_err();
        assert!(err.to_string().contains("forbidden"));
        assert!(manager.shutdown_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_shutdown_returns_ok() {
        let waiting = Arc::new(Waiting::default());
        let mut manager = ControllerManager::new(config());
        manager.register(Arc::new(waiting.clone()));

        let token = manager.shutdown_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });
        manager.run().await.unwrap();
        assert!(waiting.stopped.load(Ordering::SeqCst));
        assert_eq!(manager.health_registry().check_all().await.checks.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_names_are_rejected() {
        let mut manager = ControllerManager::new(config());
        manager.register(Arc::new(Arc::new(Waiting::default())));
        manager.register(Arc::new(Arc::new(Waiting::default())));

        let err = manager.run().await.unwrap_err();
        assert!(matches!(err, ControllerError::InvalidConfig { ref name, .. } if name == "waiting"));
    }

    #[tokio::test]
    async fn test_health_server_bind_failure_fails_start() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = config();
        config.generic.enable_health_server = true;
        config.generic.healthz_bind_address = "127.0.0.1".to_string();
        config.generic.healthz_bind_port = taken.local_addr().unwrap().port();

        let waiting = Arc::new(Waiting::default());
        let mut manager = ControllerManager::new(config);
        manager.register(Arc::new(waiting.clone()));

        let err = manager.run().await.unwrap_err();
        assert!(matches!(err, ControllerError::StartFailed { ref name, .. } if name == "health-server"));
        assert!(!waiting.stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_no_controllers() {
        let manager = ControllerManager::new(config());
        assert!(manager.run().await.is_ok());
    }
}

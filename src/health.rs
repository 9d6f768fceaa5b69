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

//! Health check endpoints.
//!
//! `/healthz` and `/healthz/live` answer as long as the process serves
//! requests. `/healthz/ready` fails until every registered controller's
//! watch has listed its resource; `/healthz/deep` reports each one.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use http::header::{HeaderValue, CONTENT_TYPE};
use http::StatusCode;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Boxed future for health checks.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Health check status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// The component is healthy.
    Healthy,
    /// The component is unhealthy.
    Unhealthy,
}

impl From<bool> for HealthStatus {
    fn from(healthy: bool) -> Self {
        if healthy {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }
}

/// Health check result.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    /// The overall health status.
    pub status: HealthStatus,

    /// Individual component health.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub checks: BTreeMap<String, HealthStatus>,
}

/// A component that can report its own health.
pub trait HealthChecker: Send + Sync + 'static {
    /// Returns `true` if the component is healthy.
    fn check(&self) -> BoxFuture<'_, bool>;

    /// Returns the name of this checker.
    fn name(&self) -> &str;
}

/// Adapter for implementing [`HealthChecker`] with a function.
pub struct FunctionHealthChecker<F> {
    name: String,
    check_fn: F,
}

impl<F, Fut> FunctionHealthChecker<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    /// Creates a new function-based health checker.
    pub fn new(name: impl Into<String>, check_fn: F) -> Self {
        Self {
            name: name.into(),
            check_fn,
        }
    }
}

impl<F, Fut> HealthChecker for FunctionHealthChecker<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    fn check(&self) -> BoxFuture<'_, bool> {
        Box::pin((self.check_fn)())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Set of registered health checkers.
#[derive(Clone, Default)]
pub struct HealthRegistry {
    checkers: Arc<RwLock<Vec<Arc<dyn HealthChecker>>>>,
}

impl HealthRegistry {
    /// Creates a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a health checker.
    pub async fn register(&self, checker: Arc<dyn HealthChecker>) {
        self.checkers.write().await.push(checker);
    }

    /// Runs all health checks. An empty registry is unhealthy: nothing is
    /// being watched yet.
    pub async fn check_all(&self) -> HealthCheck {
        let checkers = self.checkers.read().await;
        let mut checks = BTreeMap::new();
        for checker in checkers.iter() {
            checks.insert(checker.name().to_string(), checker.check().await.into());
        }

        let healthy =
            !checks.is_empty() && checks.values().all(|s| *s == HealthStatus::Healthy);
        HealthCheck {
            status: healthy.into(),
            checks,
        }
    }
}

/// HTTP server for the health endpoints.
pub struct HealthServer {
    registry: HealthRegistry,
    bind_address: String,
    bind_port: u16,
}

impl HealthServer {
    /// Creates a server answering from `registry`.
    pub fn new(registry: HealthRegistry, bind_address: impl Into<String>, bind_port: u16) -> Self {
        Self {
            registry,
            bind_address: bind_address.into(),
            bind_port,
        }
    }

    /// Binds and serves until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        let listener = self.bind().await?;
        self.serve(listener, cancel).await
    }

    async fn bind(&self) -> std::io::Result<TcpListener> {
        let addr = format!("{}:{}", self.bind_address, self.bind_port);
        let listener = TcpListener::bind(&addr).await?;
        tracing::info!(address = %addr, "health server listening");
        Ok(listener)
    }

    async fn serve(self, listener: TcpListener, cancel: CancellationToken) -> anyhow::Result<()> {
        loop {
            let (stream, _) = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted?,
            };
            let registry = self.registry.clone();
            let io = TokioIo::new(stream);

            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let registry = registry.clone();
                    async move {
                        Ok::<_, hyper::Error>(route(req.uri().path(), &registry).await)
                    }
                });
                if let Err(err) = hyper::server::conn::http1::Builder::new()
                    .serve_connection(io, service)
                    .await
                {
                    tracing::debug!(error = %err, "health connection closed with error");
                }
            });
        }
    }

    /// Binds the listener, then serves from a background task.
    ///
    /// Bind errors are returned here rather than from the task.
    pub async fn spawn(
        self,
        cancel: CancellationToken,
    ) -> std::io::Result<tokio::task::JoinHandle<anyhow::Result<()>>> {
        let listener = self.bind().await?;
        Ok(tokio::spawn(self.serve(listener, cancel)))
    }
}

fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

async fn route(path: &str, registry: &HealthRegistry) -> Response<Full<Bytes>> {
    match path {
        "/healthz" | "/healthz/live" => respond(StatusCode::OK, "text/plain", "ok"),
        "/healthz/ready" => match registry.check_all().await.status {
            HealthStatus::Healthy => respond(StatusCode::OK, "text/plain", "ok"),
            HealthStatus::Unhealthy => {
                respond(StatusCode::SERVICE_UNAVAILABLE, "text/plain", "not ready")
            }
        },
        "/healthz/deep" => {
            let result = registry.check_all().await;
            let status = match result.status {
                HealthStatus::Healthy => StatusCode::OK,
                HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
            };
            let json = serde_json::to_string(&result).unwrap_or_default();
            respond(status, "application/json", json)
        }
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "not found"),
    }
}

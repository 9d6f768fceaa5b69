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

//! kube-initializer - Kubernetes initializer controller in Rust
//!
//! Initializes uninitialized objects of the configured resource types by
//! applying default metadata and removing this initializer's name from
//! their pending list.

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{ArgAction, Parser};
use tracing::{error, info};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kube_initializer_rust::config::{InitializerConfig, ResourceConfig};
use kube_initializer_rust::controller::Controller;
use kube_initializer_rust::controller_manager::ControllerManager;
use kube_initializer_rust::initializer::{Initializer, MetadataInitializer};
use kube_initializer_rust::initializer_controller::InitializerController;
use kube_initializer_rust::kube_store::KubeStore;

/// Kubernetes initializer
///
/// Watches the configured resources for objects whose pending-initializer
/// list starts with this initializer's name, applies the configured labels
/// and annotations, and releases them.
#[derive(Parser, Debug)]
#[command(name = "kube-initializer")]
#[command(author = "Kubernetes Authors")]
#[command(version)]
#[command(about = "Kubernetes initializer controller", long_about = None)]
struct Args {
    /// Path to the kubeconfig file
    #[arg(long, global = true)]
    kubeconfig: Option<PathBuf>,

    /// Master URL to build a client from
    #[arg(long, global = true)]
    master: Option<String>,

    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Initializer name to act on (the pending-list entry this process owns)
    #[arg(long)]
    name: Option<String>,

    /// Namespace to watch; all namespaces when unset
    #[arg(long)]
    namespace: Option<String>,

    /// Resource to initialize, as [group/]version/Kind (repeatable)
    #[arg(long = "resource")]
    resources: Vec<ResourceConfig>,

    /// Maximum number of objects processed concurrently per resource
    #[arg(long)]
    workers: Option<usize>,

    /// Attempts per object before giving up until the next delivery
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Period of the full relist; 0s disables it
    #[arg(long, value_parser = parse_duration)]
    resync_period: Option<Duration>,

    /// Address for the health check server
    #[arg(long)]
    healthz_bind_address: Option<String>,

    /// Port for the health check server
    #[arg(long)]
    healthz_bind_port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    log_json: bool,

    /// Increase verbosity (-v debug, -vv also debug for the kube client)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    humantime::parse_duration(s).map_err(|e| anyhow::anyhow!("invalid duration: {}", e))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level, args.log_json, args.verbose)?;

    let config = load_config(args).await?;
    config.validate()?;
    info!(
        initializer = %config.generic.name,
        resources = ?config.resources.iter().map(ToString::to_string).collect::<Vec<_>>(),
        namespace = config.generic.namespace.as_deref().unwrap_or("<all>"),
        "starting kube-initializer"
    );

    let client = create_client(&config).await?;
    let version = client
        .apiserver_version()
        .await
        .context("API server is unreachable")?;
    info!(version = %version.git_version, "connected to API server");

    let initializer: Arc<dyn Initializer> =
        Arc::new(MetadataInitializer::from_config(&config.initializer));
    let controllers: Vec<Arc<dyn Controller>> = config
        .resources
        .iter()
        .map(|resource| {
            let store = KubeStore::new(client.clone(), resource, config.generic.namespace.clone())
                .with_include_uninitialized(config.generic.include_uninitialized)
                .with_watch_timeout_secs(config.watch.timeout.as_secs().min(u32::MAX as u64) as u32);
            Arc::new(InitializerController::new(
                resource.controller_name(),
                Arc::new(store),
                initializer.clone(),
            ))
                as Arc<dyn Controller>
        })
        .collect();

    let mut manager = ControllerManager::new(config);
    for controller in controllers {
        manager.register(controller);
    }

    let shutdown = shutdown_signal()?;
    let shutdown_token = manager.shutdown_token();
    tokio::spawn(async move {
        shutdown.await;
        shutdown_token.cancel();
    });

    if let Err(e) = manager.run().await {
        error!("kube-initializer failed: {:#}", e);
        return Err(e.into());
    }

    info!("kube-initializer exited successfully");
    Ok(())
}

/// Installs the global subscriber.
///
/// `-v` raises the level to debug; the kube client and its HTTP stack stay
/// at info unless `-vv` is given.
fn init_logging(level: &str, json: bool, verbose: u8) -> anyhow::Result<()> {
    let level = if verbose > 0 { "debug" } else { level };
    let mut env_filter = EnvFilter::builder()
        .with_default_directive(
            level
                .parse::<Directive>()
                .with_context(|| format!("invalid log level: {}", level))?,
        )
        .from_env_lossy();
    if verbose < 2 {
        for directive in ["kube=info", "hyper=info", "tower=info"] {
            env_filter = env_filter.add_directive(directive.parse::<Directive>()?);
        }
    }

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().pretty())
            .init();
    }
    Ok(())
}

/// Loads the configuration from file, then applies command-line overrides.
async fn load_config(mut args: Args) -> anyhow::Result<InitializerConfig> {
    let mut config = if let Some(config_path) = args.config.take() {
        let content = tokio::fs::read_to_string(&config_path)
            .await
            .with_context(|| format!("failed to read config file: {:?}", config_path))?;

        serde_yaml::from_str::<InitializerConfig>(&content)
            .with_context(|| format!("failed to parse config file: {:?}", config_path))?
    } else {
        InitializerConfig::default()
    };

    if let Some(kubeconfig) = args.kubeconfig {
        config.generic.kubeconfig = Some(kubeconfig);
    }
    if let Some(master) = args.master {
        config.generic.master = Some(master);
    }
    if let Some(name) = args.name {
        config.generic.name = name;
    }
    if let Some(namespace) = args.namespace {
        config.generic.namespace = Some(namespace);
    }
    if !args.resources.is_empty() {
        config.resources = args.resources;
    }
    if let Some(workers) = args.workers {
        config.generic.workers = workers;
    }
    if let Some(max_attempts) = args.max_attempts {
        config.retry.max_attempts = max_attempts;
    }
    if let Some(resync_period) = args.resync_period {
        config.watch.resync_period = resync_period;
    }
    if let Some(address) = args.healthz_bind_address {
        config.generic.healthz_bind_address = address;
    }
    if let Some(port) = args.healthz_bind_port {
        config.generic.healthz_bind_port = port;
    }

    Ok(config)
}

/// Creates a Kubernetes client from the configuration.
async fn create_client(config: &InitializerConfig) -> anyhow::Result<kube::Client> {
    use kube::config::{KubeConfigOptions, Kubeconfig};
    use kube::Config;

    let kube_config = if let Some(kubeconfig_path) = &config.generic.kubeconfig {
        let kubeconfig = Kubeconfig::read_from(kubeconfig_path)
            .with_context(|| format!("failed to read kubeconfig from: {:?}", kubeconfig_path))?;
        Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .with_context(|| format!("failed to load kubeconfig from: {:?}", kubeconfig_path))?
    } else if let Some(master_url) = &config.generic.master {
        let uri = master_url
            .parse::<http::Uri>()
            .with_context(|| format!("invalid master URL: {}", master_url))?;
        Config::new(uri)
    } else {
        Config::infer().await.context("failed to load kubeconfig")?
    };
    Ok(kube::Client::try_from(kube_config)?)
}

/// Returns a future that resolves on SIGINT or SIGTERM.
#[cfg(unix)]
fn shutdown_signal() -> anyhow::Result<impl Future<Output = ()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sigint =
        signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;

    Ok(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
            _ = sigint.recv() => info!("received SIGINT, shutting down"),
        }
    })
}

/// Returns a future that resolves on Ctrl+C.
#[cfg(not(unix))]
fn shutdown_signal() -> anyhow::Result<impl Future<Output = ()>> {
    Ok(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received Ctrl+C, shutting down");
        }
    })
}

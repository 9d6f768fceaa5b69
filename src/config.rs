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

//! Configuration structures for the initializer.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::controller::ControllerError;

/// Main configuration for the kube-initializer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializerConfig {
    /// Generic configuration applicable to all resources.
    #[serde(default)]
    pub generic: GenericConfig,

    /// Resource types to initialize.
    #[serde(default = "default_resources")]
    pub resources: Vec<ResourceConfig>,

    /// Watch stream configuration.
    #[serde(default)]
    pub watch: WatchConfig,

    /// Per-object commit retry configuration.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Built-in metadata initializer configuration.
    #[serde(default)]
    pub initializer: MetadataInitializerConfig,
}

impl Default for InitializerConfig {
    fn default() -> Self {
        Self {
            generic: GenericConfig::default(),
            resources: default_resources(),
            watch: WatchConfig::default(),
            retry: RetryConfig::default(),
            initializer: MetadataInitializerConfig::default(),
        }
    }
}

impl InitializerConfig {
    /// Checks the configuration for values the controller cannot run with.
    pub fn validate(&self) -> Result<(), ControllerError> {
        let invalid = |reason: &str| ControllerError::InvalidConfig {
            name: self.generic.name.clone(),
            reason: reason.to_string(),
        };

        if self.generic.name.trim().is_empty() {
            return Err(invalid("initializer name must not be empty"));
        }
        if self.resources.is_empty() {
            return Err(invalid("at least one resource must be configured"));
        }
        let mut seen = std::collections::HashSet::new();
        for resource in &self.resources {
            if !seen.insert(resource.controller_name()) {
                return Err(invalid(&format!("resource {} is listed twice", resource)));
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.maxAttempts must be at least 1"));
        }
        if self.generic.workers == 0 {
            return Err(invalid("generic.workers must be at least 1"));
        }
        Ok(())
    }
}

/// Generic configuration applicable to all resources.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenericConfig {
    /// Kubeconfig file for talking to the apiserver.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<PathBuf>,

    /// Master URL to build a client from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master: Option<String>,

    /// The initializer name looked for at the head of pending lists.
    #[serde(default)]
    pub name: String,

    /// Namespace to watch. All namespaces when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Ask list and watch for uninitialized objects.
    #[serde(default = "default_true")]
    pub include_uninitialized: bool,

    /// Maximum number of objects processed concurrently per resource.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Deadline for a single API request.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// The duration between each controller starting.
    #[serde(
        default = "default_controller_start_interval",
        with = "humantime_serde"
    )]
    pub controller_start_interval: Duration,

    /// The maximum time to wait for controllers to stop.
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// Whether to serve health endpoints.
    #[serde(default = "default_true")]
    pub enable_health_server: bool,

    /// The address to serve health endpoints on.
    #[serde(default = "default_bind_address")]
    pub healthz_bind_address: String,

    /// Port for the health check server.
    #[serde(default = "default_healthz_port")]
    pub healthz_bind_port: u16,
}

impl Default for GenericConfig {
    fn default() -> Self {
        Self {
            kubeconfig: None,
            master: None,
            name: String::new(),
            namespace: None,
            include_uninitialized: true,
            workers: default_workers(),
            request_timeout: default_request_timeout(),
            controller_start_interval: default_controller_start_interval(),
            shutdown_timeout: default_shutdown_timeout(),
            enable_health_server: true,
            healthz_bind_address: default_bind_address(),
            healthz_bind_port: default_healthz_port(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_workers() -> usize {
    4
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_controller_start_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_healthz_port() -> u16 {
    10258
}

/// A resource type, addressed by group, version and kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceConfig {
    /// API group, empty for the core group.
    #[serde(default)]
    pub group: String,

    /// API version.
    pub version: String,

    /// Kind, e.g. `Deployment`.
    pub kind: String,

    /// Plural resource name, guessed from the kind when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plural: Option<String>,
}

impl ResourceConfig {
    /// Creates a resource reference.
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
            plural: None,
        }
    }

    /// Returns `group/version`, or just `version` for the core group.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Name of the controller serving this resource, unique per
    /// group, version and kind: `job.v1.batch-initializer`, `pod.v1-initializer`.
    pub fn controller_name(&self) -> String {
        let mut name = format!("{}.{}", self.kind.to_lowercase(), self.version);
        if !self.group.is_empty() {
            name.push('.');
            name.push_str(&self.group);
        }
        name.push_str("-initializer");
        name
    }
}

impl fmt::Display for ResourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_version(), self.kind)
    }
}

impl FromStr for ResourceConfig {
    type Err = String;

    /// Parses `version/Kind` or `group/version/Kind`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('/').collect();
        match parts.as_slice() {
            [version, kind] if !version.is_empty() && !kind.is_empty() => {
                Ok(ResourceConfig::new("", version, kind))
            }
            [group, version, kind]
                if !group.is_empty() && !version.is_empty() && !kind.is_empty() =>
            {
                Ok(ResourceConfig::new(group, version, kind))
            }
            _ => Err(format!(
                "invalid resource {:?}, expected [group/]version/Kind",
                s
            )),
        }
    }
}

fn default_resources() -> Vec<ResourceConfig> {
    vec![
        ResourceConfig::new("batch", "v1", "Job"),
        ResourceConfig::new("", "v1", "Pod"),
        ResourceConfig::new("apps", "v1", "DaemonSet"),
        ResourceConfig::new("apps", "v1", "Deployment"),
    ]
}

/// Exponential backoff parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffConfig {
    /// First delay.
    #[serde(default = "default_initial_backoff", with = "humantime_serde")]
    pub initial: Duration,

    /// Upper bound for any delay.
    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max: Duration,

    /// Growth factor between consecutive delays.
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: default_initial_backoff(),
            max: default_max_backoff(),
            multiplier: default_backoff_multiplier(),
        }
    }
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(200)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(30)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

/// Watch stream configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchConfig {
    /// Server-side timeout for a single watch request.
    #[serde(default = "default_watch_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// How often to relist everything; zero disables resync.
    #[serde(default = "default_resync_period", with = "humantime_serde")]
    pub resync_period: Duration,

    /// Backoff between failed reconnects.
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            timeout: default_watch_timeout(),
            resync_period: default_resync_period(),
            backoff: BackoffConfig::default(),
        }
    }
}

fn default_watch_timeout() -> Duration {
    Duration::from_secs(290)
}

fn default_resync_period() -> Duration {
    Duration::from_secs(5 * 60)
}

/// Per-object commit retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Attempts per processing task before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff between attempts.
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: BackoffConfig::default(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

/// Built-in metadata initializer configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataInitializerConfig {
    /// Labels set on every object that does not already carry them.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Annotations set on every object.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// Labels an object must carry; objects missing any are rejected.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_labels: Vec<String>,
}

/// Module for duration serialization/deserialization with human-readable format.
mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = InitializerConfig::default();
        assert_eq!(config.resources.len(), 4);
        assert_eq!(config.retry.max_attempts, 5);
        assert!(config.generic.include_uninitialized);
    }

    #[test]
    fn test_deserialize_basic_config() {
        let yaml = r#"
generic:
  name: "labelizer.example.com"
  namespace: team-a
  requestTimeout: 10s
resources:
  - version: v1
    kind: Pod
watch:
  resyncPeriod: 10m
retry:
  maxAttempts: 3
  backoff:
    initial: 50ms
initializer:
  requiredLabels: [owner]
"#;

        let config: InitializerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.generic.name, "labelizer.example.com");
        assert_eq!(config.generic.namespace.as_deref(), Some("team-a"));
        assert_eq!(config.generic.request_timeout, Duration::from_secs(10));
        assert_eq!(config.resources, vec![ResourceConfig::new("", "v1", "Pod")]);
        assert_eq!(config.watch.resync_period, Duration::from_secs(600));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.backoff.initial, Duration::from_millis(50));
        assert_eq!(config.retry.backoff.max, Duration::from_secs(30));
        assert_eq!(config.initializer.required_labels, vec!["owner".to_string()]);
    }

    #[test]
    fn test_validate() {
        let mut config = InitializerConfig::default();
        assert!(config.validate().is_err());

        config.generic.name = "myinit".to_string();
        assert!(config.validate().is_ok());

        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());
        config.retry.max_attempts = 1;

        config.resources.push(ResourceConfig::new("", "v1", "Pod"));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("v1/Pod is listed twice"), "{}", err);
    }

    #[test]
    fn test_parse_resource() {
        let core: ResourceConfig = "v1/Pod".parse().unwrap();
        assert_eq!(core.api_version(), "v1");
        let apps: ResourceConfig = "apps/v1/Deployment".parse().unwrap();
        assert_eq!(apps.to_string(), "apps/v1/Deployment");
        assert!("Pod".parse::<ResourceConfig>().is_err());

        assert_eq!(core.controller_name(), "pod.v1-initializer");
        assert_eq!(apps.controller_name(), "deployment.v1.apps-initializer");
        let extensions: ResourceConfig = "extensions/v1beta1/Deployment".parse().unwrap();
        assert_ne!(extensions.controller_name(), apps.controller_name());
        assert!("a/b/c/d".parse::<ResourceConfig>().is_err());
    }
}

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

//! Controller context - shared resources for all controllers.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::config::InitializerConfig;

/// Generates a fresh resync period on every call.
pub type ResyncPeriodFn = Arc<dyn Fn() -> Duration + Send + Sync>;

/// Shared context for all controllers.
#[derive(Clone)]
pub struct ControllerContext {
    /// Configuration for this process.
    pub config: Arc<InitializerConfig>,

    /// Function to generate resync periods, or `None` when resync is off.
    ///
    /// Periods are randomized so watches on different resources do not
    /// relist at the same moment.
    pub resync_period_fn: Option<ResyncPeriodFn>,
}

impl ControllerContext {
    /// Creates a context, deriving the resync function from `config.watch`.
    pub fn new(config: Arc<InitializerConfig>) -> Self {
        let base = config.watch.resync_period;
        let resync_period_fn = if base.is_zero() {
            None
        } else {
            Some(Arc::new(resync_period_fn(base)) as ResyncPeriodFn)
        };
        Self {
            config,
            resync_period_fn,
        }
    }

    /// Returns the next resync period, if resync is enabled.
    pub fn resync_period(&self) -> Option<Duration> {
        self.resync_period_fn.as_ref().map(|f| f())
    }
}

/// Creates a resync period function with the given base duration.
///
/// The returned function adds between 0 and 100% jitter.
pub fn resync_period_fn(base: Duration) -> impl Fn() -> Duration + Send + Sync {
    move || {
        let jitter = rand::thread_rng().gen_range(0.0..1.0);
        Duration::from_secs_f64(base.as_secs_f64() * (1.0 + jitter))
    }
}

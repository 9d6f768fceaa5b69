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

//! Exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

use crate::config::BackoffConfig;

/// Stateful exponential backoff.
///
/// Each delay is the current base scaled by a random factor in `[0.5, 1.5)`;
/// the base then grows by the multiplier up to the configured maximum.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
}

impl Backoff {
    /// Creates a backoff starting at the configured initial delay.
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            config: config.clone(),
            current: config.initial,
        }
    }

    /// Returns the next delay and advances the base.
    pub fn next_delay(&mut self) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let delay = Duration::from_secs_f64(self.current.as_secs_f64() * jitter)
            .min(self.config.max);

        let grown = self.current.as_secs_f64() * self.config.multiplier.max(1.0);
        self.current = Duration::from_secs_f64(grown.min(self.config.max.as_secs_f64()));
        delay
    }

    /// Returns to the initial delay after a success.
    pub fn reset(&mut self) {
        self.current = self.config.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BackoffConfig {
        BackoffConfig {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }

    #[test]
    fn test_delays_grow_and_cap() {
        let mut backoff = Backoff::new(&config());

        let first = backoff.next_delay();
        assert!(first >= Duration::from_millis(50) && first < Duration::from_millis(150));

        for _ in 0..10 {
            assert!(backoff.next_delay() <= Duration::from_secs(1));
        }
        assert_eq!(backoff.current, Duration::from_secs(1));
    }

    #[test]
    fn test_reset() {
        let mut backoff = Backoff::new(&config());
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.current, Duration::from_millis(100));
    }

    #[test]
    fn test_zero_initial() {
        let mut backoff = Backoff::new(&BackoffConfig {
            initial: Duration::ZERO,
            ..config()
        });
        assert_eq!(backoff.next_delay(), Duration::ZERO);
    }
}

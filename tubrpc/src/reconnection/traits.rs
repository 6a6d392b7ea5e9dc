//
// Copyright 2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Reconnection strategy trait and metrics.

use crate::error::TubError;
use async_trait::async_trait;
use std::time::Duration;

/// Decides whether and when a [`Reconnector`](crate::reconnection::Reconnector)
/// tries again after a failed or lost connection.
///
/// # Examples
///
/// ```
/// use tubrpc::reconnection::{ReconnectionStrategy, ExponentialBackoff};
/// use std::time::Duration;
///
/// let strategy = ExponentialBackoff::builder()
///     .initial_delay(Duration::from_millis(100))
///     .max_delay(Duration::from_secs(30))
///     .build();
/// assert_eq!(strategy.name(), "ExponentialBackoff");
/// ```
#[async_trait]
pub trait ReconnectionStrategy: Send + Sync {
    /// Determine if another attempt should be made.
    ///
    /// # Arguments
    ///
    /// * `attempt` - The number of consecutive failed attempts so far (0-indexed)
    /// * `last_error` - Why the last attempt failed
    async fn should_reconnect(&self, attempt: u32, last_error: &TubError) -> bool;

    /// The delay before attempt number `attempt`.
    async fn next_delay(&self, attempt: u32) -> Duration;

    /// Called when a connection is established.
    fn on_connected(&self);

    /// Called when an attempt fails or an established connection is lost.
    fn on_disconnected(&self, error: &TubError);

    /// Reset the strategy's internal state.
    fn reset(&self);

    /// A human-readable name for logging.
    fn name(&self) -> &str;
}

/// Counters describing reconnection activity.
#[derive(Debug, Clone, Default)]
pub struct ReconnectionMetrics {
    /// Total number of attempts
    pub total_attempts: u64,
    /// Number of successful connections
    pub successful_reconnections: u64,
    /// Number of failures, including lost connections
    pub failed_reconnections: u64,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// Last error encountered
    pub last_error: Option<String>,
}

impl ReconnectionMetrics {
    /// Create a new metrics instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an attempt.
    pub fn record_attempt(&mut self) {
        self.total_attempts += 1;
    }

    /// Record a success.
    pub fn record_success(&mut self) {
        self.successful_reconnections += 1;
        self.consecutive_failures = 0;
        self.last_error = None;
    }

    /// Record a failure.
    pub fn record_failure(&mut self, error: &TubError) {
        self.failed_reconnections += 1;
        self.consecutive_failures += 1;
        self.last_error = Some(error.to_string());
    }

    /// Reset all metrics.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_record_success_clears_failures() {
        let mut metrics = ReconnectionMetrics::new();
        metrics.record_attempt();
        metrics.record_failure(&TubError::ShutDown);
        metrics.record_failure(&TubError::ShutDown);
        assert_eq!(metrics.consecutive_failures, 2);
        assert!(metrics.last_error.is_some());

        metrics.record_success();
        assert_eq!(metrics.total_attempts, 1);
        assert_eq!(metrics.successful_reconnections, 1);
        assert_eq!(metrics.failed_reconnections, 2);
        assert_eq!(metrics.consecutive_failures, 0);
        assert!(metrics.last_error.is_none());
    }

    #[test]
    fn test_metrics_reset() {
        let mut metrics = ReconnectionMetrics::new();
        metrics.total_attempts = 10;
        metrics.record_failure(&TubError::ShutDown);
        metrics.reset();
        assert_eq!(metrics.total_attempts, 0);
        assert_eq!(metrics.failed_reconnections, 0);
        assert!(metrics.last_error.is_none());
    }
}

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

//! Exponential backoff with optional jitter.

use crate::error::TubError;
use crate::reconnection::{ReconnectionMetrics, ReconnectionStrategy};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;

/// Waits `initial_delay * multiplier^attempt`, capped at `max_delay`.
///
/// With jitter enabled the delay is drawn uniformly from `[0, delay]`.
///
/// # Examples
///
/// ```
/// use tubrpc::reconnection::ExponentialBackoff;
/// use std::time::Duration;
///
/// let strategy = ExponentialBackoff::builder()
///     .initial_delay(Duration::from_millis(100))
///     .max_delay(Duration::from_secs(30))
///     .multiplier(2.0)
///     .jitter(true)
///     .max_attempts(Some(10))
///     .build();
/// # let _ = strategy;
/// ```
#[derive(Debug)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: bool,
    max_attempts: Option<u32>,
    metrics: Mutex<ReconnectionMetrics>,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        ExponentialBackoffBuilder::default().build()
    }
}

impl ExponentialBackoff {
    /// Create a new builder.
    pub fn builder() -> ExponentialBackoffBuilder {
        ExponentialBackoffBuilder::default()
    }

    /// Get the current metrics.
    pub fn metrics(&self) -> ReconnectionMetrics {
        self.metrics.lock().clone()
    }

    fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let base_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = if base_ms.is_finite() && base_ms < self.max_delay.as_millis() as f64 {
            Duration::from_millis(base_ms as u64)
        } else {
            self.max_delay
        };

        if self.jitter {
            let jitter_ms = (rand::random::<f64>() * capped.as_millis() as f64) as u64;
            Duration::from_millis(jitter_ms)
        } else {
            capped
        }
    }
}

#[async_trait]
impl ReconnectionStrategy for ExponentialBackoff {
    async fn should_reconnect(&self, attempt: u32, last_error: &TubError) -> bool {
        if !last_error.is_recoverable() {
            return false;
        }
        self.max_attempts.map_or(true, |max| attempt < max)
    }

    async fn next_delay(&self, attempt: u32) -> Duration {
        self.metrics.lock().record_attempt();
        self.calculate_delay(attempt)
    }

    fn on_connected(&self) {
        self.metrics.lock().record_success();
    }

    fn on_disconnected(&self, error: &TubError) {
        self.metrics.lock().record_failure(error);
    }

    fn reset(&self) {
        self.metrics.lock().reset();
    }

    fn name(&self) -> &str {
        "ExponentialBackoff"
    }
}

/// Builder for [`ExponentialBackoff`].
#[derive(Debug)]
pub struct ExponentialBackoffBuilder {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: bool,
    max_attempts: Option<u32>,
}

impl Default for ExponentialBackoffBuilder {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: true,
            max_attempts: None,
        }
    }
}

impl ExponentialBackoffBuilder {
    /// Set the delay before the first retry.
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the maximum delay between retries.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the growth factor.
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    pub fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set the maximum number of consecutive failed attempts.
    pub fn max_attempts(mut self, max: Option<u32>) -> Self {
        self.max_attempts = max;
        self
    }

    /// Build the strategy.
    pub fn build(self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_delay: self.initial_delay,
            max_delay: self.max_delay,
            multiplier: self.multiplier,
            jitter: self.jitter,
            max_attempts: self.max_attempts,
            metrics: Mutex::new(ReconnectionMetrics::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;

    fn lost() -> TubError {
        TubError::Transport(TransportError::refused("tcp:example.org:1"))
    }

    #[test]
    fn test_builder() {
        let strategy = ExponentialBackoff::builder()
            .initial_delay(Duration::from_millis(50))
            .max_delay(Duration::from_secs(30))
            .multiplier(3.0)
            .jitter(false)
            .max_attempts(Some(5))
            .build();

        assert_eq!(strategy.initial_delay, Duration::from_millis(50));
        assert_eq!(strategy.max_delay, Duration::from_secs(30));
        assert_eq!(strategy.multiplier, 3.0);
        assert!(!strategy.jitter);
        assert_eq!(strategy.max_attempts, Some(5));
    }

    #[tokio::test]
    async fn test_attempt_limit() {
        let strategy = ExponentialBackoff::builder().max_attempts(Some(5)).build();
        assert!(strategy.should_reconnect(0, &lost()).await);
        assert!(strategy.should_reconnect(4, &lost()).await);
        assert!(!strategy.should_reconnect(5, &lost()).await);
    }

    #[tokio::test]
    async fn test_gives_up_on_unrecoverable_errors() {
        let strategy = ExponentialBackoff::default();
        assert!(strategy.should_reconnect(100, &lost()).await);
        assert!(!strategy.should_reconnect(0, &TubError::ShutDown).await);
    }

    #[tokio::test]
    async fn test_growth_and_cap() {
        let strategy = ExponentialBackoff::builder()
            .initial_delay(Duration::from_millis(100))
            .multiplier(2.0)
            .jitter(false)
            .max_delay(Duration::from_millis(500))
            .build();

        assert_eq!(strategy.next_delay(0).await, Duration::from_millis(100));
        assert_eq!(strategy.next_delay(1).await, Duration::from_millis(200));
        assert_eq!(strategy.next_delay(2).await, Duration::from_millis(400));
        assert_eq!(strategy.next_delay(3).await, Duration::from_millis(500));
        assert_eq!(strategy.next_delay(4000).await, Duration::from_millis(500));
        assert_eq!(strategy.metrics().total_attempts, 5);
    }

    #[tokio::test]
    async fn test_jitter_stays_below_cap() {
        let strategy = ExponentialBackoff::builder()
            .initial_delay(Duration::from_millis(100))
            .max_delay(Duration::from_millis(100))
            .build();
        for attempt in 0..20 {
            assert!(strategy.next_delay(attempt).await <= Duration::from_millis(100));
        }
    }

    #[test]
    fn test_metrics_follow_callbacks() {
        let strategy = ExponentialBackoff::default();
        strategy.on_disconnected(&lost());
        strategy.on_disconnected(&lost());
        assert_eq!(strategy.metrics().consecutive_failures, 2);
        strategy.on_connected();
        assert_eq!(strategy.metrics().consecutive_failures, 0);
        strategy.reset();
        assert_eq!(strategy.metrics().successful_reconnections, 0);
    }
}

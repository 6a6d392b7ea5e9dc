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

//! Constant delay between attempts.

use crate::error::TubError;
use crate::reconnection::{ReconnectionMetrics, ReconnectionStrategy};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;

/// Waits the same delay before every attempt.
///
/// # Examples
///
/// ```
/// use tubrpc::reconnection::FixedDelay;
/// use std::time::Duration;
///
/// let strategy = FixedDelay::builder()
///     .delay(Duration::from_secs(5))
///     .max_attempts(Some(3))
///     .build();
/// # let _ = strategy;
/// ```
#[derive(Debug)]
pub struct FixedDelay {
    delay: Duration,
    max_attempts: Option<u32>,
    metrics: Mutex<ReconnectionMetrics>,
}

impl FixedDelay {
    /// A strategy retrying forever with `delay` between attempts.
    pub fn new(delay: Duration) -> Self {
        Self::builder().delay(delay).build()
    }

    /// Create a new builder.
    pub fn builder() -> FixedDelayBuilder {
        FixedDelayBuilder::default()
    }

    /// Get the current metrics.
    pub fn metrics(&self) -> ReconnectionMetrics {
        self.metrics.lock().clone()
    }
}

impl Default for FixedDelay {
    fn default() -> Self {
        FixedDelayBuilder::default().build()
    }
}

#[async_trait]
impl ReconnectionStrategy for FixedDelay {
    async fn should_reconnect(&self, attempt: u32, last_error: &TubError) -> bool {
        last_error.is_recoverable() && self.max_attempts.map_or(true, |max| attempt < max)
    }

    async fn next_delay(&self, _attempt: u32) -> Duration {
        self.metrics.lock().record_attempt();
        self.delay
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
        "FixedDelay"
    }
}

/// Builder for [`FixedDelay`].
#[derive(Debug)]
pub struct FixedDelayBuilder {
    delay: Duration,
    max_attempts: Option<u32>,
}

impl Default for FixedDelayBuilder {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(1),
            max_attempts: None,
        }
    }
}

impl FixedDelayBuilder {
    /// Set the delay between attempts.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Set the maximum number of consecutive failed attempts.
    pub fn max_attempts(mut self, max: Option<u32>) -> Self {
        self.max_attempts = max;
        self
    }

    /// Build the strategy.
    pub fn build(self) -> FixedDelay {
        FixedDelay {
            delay: self.delay,
            max_attempts: self.max_attempts,
            metrics: Mutex::new(ReconnectionMetrics::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;

    #[tokio::test]
    async fn test_constant_delay() {
        let strategy = FixedDelay::new(Duration::from_millis(250));
        assert_eq!(strategy.next_delay(0).await, Duration::from_millis(250));
        assert_eq!(strategy.next_delay(9).await, Duration::from_millis(250));
        assert_eq!(strategy.metrics().total_attempts, 2);
    }

    #[tokio::test]
    async fn test_attempt_limit() {
        let strategy = FixedDelay::builder().max_attempts(Some(2)).build();
        let error = TubError::Transport(TransportError::refused("mem:x"));
        assert!(strategy.should_reconnect(1, &error).await);
        assert!(!strategy.should_reconnect(2, &error).await);
    }

    #[test]
    fn test_name() {
        assert_eq!(FixedDelay::default().name(), "FixedDelay");
    }
}

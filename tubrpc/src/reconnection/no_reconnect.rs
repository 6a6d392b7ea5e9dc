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

use crate::error::TubError;
use crate::reconnection::{ReconnectionMetrics, ReconnectionStrategy};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;

/// A strategy that never tries again.
///
/// The first failure, or the first loss of an established connection, ends
/// the [`Reconnector`](crate::reconnection::Reconnector).
///
/// # Examples
///
/// ```
/// use tubrpc::reconnection::NoReconnect;
///
/// let strategy = NoReconnect::new();
/// # let _ = strategy;
/// ```
#[derive(Debug, Default)]
pub struct NoReconnect {
    metrics: Mutex<ReconnectionMetrics>,
}

impl NoReconnect {
    /// Create a new no-reconnect strategy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the current metrics.
    pub fn metrics(&self) -> ReconnectionMetrics {
        self.metrics.lock().clone()
    }
}

#[async_trait]
impl ReconnectionStrategy for NoReconnect {
    async fn should_reconnect(&self, _attempt: u32, _last_error: &TubError) -> bool {
        false
    }

    async fn next_delay(&self, _attempt: u32) -> Duration {
        Duration::ZERO
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
        "NoReconnect"
    }
}

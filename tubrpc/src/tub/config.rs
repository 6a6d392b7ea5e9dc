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

//! Configuration for Tubs.

use crate::identity::{SUPPORTED_VERSIONS, TubId, VersionRange};
use crate::negotiation::{
    ArbiterPolicy, DEFAULT_MAX_PREAMBLE_SIZE, DEFAULT_NEGOTIATION_TIMEOUT, Plaintext,
    TransportSecurity,
};
use crate::reconnection::{ExponentialBackoff, ReconnectionStrategy};
use crate::serialization::framing::MAX_FRAME_SIZE;
use crate::transport::{HintResolver, TcpHintResolver};
use std::sync::Arc;
use std::time::Duration;

/// Configuration for a [`Tub`](crate::tub::Tub).
///
/// # Examples
///
/// ```rust
/// use tubrpc::tub::TubConfig;
/// use tubrpc::transport::MemoryNetwork;
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let network = MemoryNetwork::new();
/// let config = TubConfig::new()
///     .with_negotiation_timeout(Duration::from_secs(10))
///     .with_resolver(Arc::new(network));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone)]
pub struct TubConfig {
    /// Fixed identity for this Tub.
    ///
    /// When a security layer proves an identity of its own (TLS), that
    /// identity is used and this field must be unset or equal to it.
    ///
    /// Default: None (random)
    pub tub_id: Option<TubId>,

    /// Deadline over a whole negotiation, preamble to decision.
    ///
    /// Default: 30 seconds
    pub negotiation_timeout: Duration,

    /// Protocol versions this Tub speaks.
    ///
    /// Default: [1, 1]
    pub version_range: VersionRange,

    /// Maximum size of a handshake block or broker frame in bytes.
    ///
    /// Default: 16 MB
    pub max_frame_size: u32,

    /// Maximum size of the plaintext preamble in bytes.
    ///
    /// Default: 4 KB
    pub max_preamble_size: usize,

    /// Accept peers that do not present an incarnation.
    ///
    /// Default: false
    pub allow_legacy_peers: bool,

    /// Minimum time since the last accepted connection before a legacy
    /// offer may replace it. Only used with `allow_legacy_peers`.
    ///
    /// Default: 60 seconds
    pub legacy_grace_window: Duration,

    /// Report violations raised by the far side as local violations.
    ///
    /// Default: false
    pub expose_remote_exception_types: bool,

    /// How long [`Tub::shutdown`](crate::tub::Tub::shutdown) waits for
    /// connections to close before cutting them.
    ///
    /// Default: 5 seconds
    pub shutdown_timeout: Duration,

    /// Strategy used by reconnectors.
    ///
    /// Default: ExponentialBackoff with default settings
    pub reconnection_strategy: Arc<dyn ReconnectionStrategy>,

    /// Upgrade applied to every connection after the preamble.
    ///
    /// Default: Plaintext
    pub security: Arc<dyn TransportSecurity>,

    /// Resolvers turning location hints into connections, tried in order.
    ///
    /// Default: TCP only
    pub resolvers: Vec<Arc<dyn HintResolver>>,
}

impl Default for TubConfig {
    fn default() -> Self {
        Self {
            tub_id: None,
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
            version_range: SUPPORTED_VERSIONS,
            max_frame_size: MAX_FRAME_SIZE,
            max_preamble_size: DEFAULT_MAX_PREAMBLE_SIZE,
            allow_legacy_peers: false,
            legacy_grace_window: Duration::from_secs(60),
            expose_remote_exception_types: false,
            shutdown_timeout: Duration::from_secs(5),
            reconnection_strategy: Arc::new(ExponentialBackoff::default()),
            security: Arc::new(Plaintext),
            resolvers: vec![Arc::new(TcpHintResolver)],
        }
    }
}

impl std::fmt::Debug for TubConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TubConfig")
            .field("tub_id", &self.tub_id)
            .field("negotiation_timeout", &self.negotiation_timeout)
            .field("version_range", &self.version_range)
            .field("max_frame_size", &self.max_frame_size)
            .field("max_preamble_size", &self.max_preamble_size)
            .field("allow_legacy_peers", &self.allow_legacy_peers)
            .field("legacy_grace_window", &self.legacy_grace_window)
            .field(
                "expose_remote_exception_types",
                &self.expose_remote_exception_types,
            )
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("reconnection_strategy", &self.reconnection_strategy.name())
            .field("security", &self.security.name())
            .field("resolvers", &self.resolvers.len())
            .finish()
    }
}

impl TubConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a fixed tub id.
    pub fn with_tub_id(mut self, tub_id: TubId) -> Self {
        self.tub_id = Some(tub_id);
        self
    }

    /// Sets the negotiation deadline.
    pub fn with_negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout = timeout;
        self
    }

    /// Sets the supported protocol versions.
    pub fn with_version_range(mut self, versions: VersionRange) -> Self {
        self.version_range = versions;
        self
    }

    /// Sets the maximum frame size.
    pub fn with_max_frame_size(mut self, size: u32) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Sets the maximum preamble size.
    pub fn with_max_preamble_size(mut self, size: usize) -> Self {
        self.max_preamble_size = size;
        self
    }

    /// Accepts legacy peers, letting them replace a connection once
    /// `grace_window` has passed since it was accepted.
    pub fn with_legacy_peers(mut self, grace_window: Duration) -> Self {
        self.allow_legacy_peers = true;
        self.legacy_grace_window = grace_window;
        self
    }

    /// Exposes remote violations as local ones.
    pub fn with_remote_exception_types(mut self, expose: bool) -> Self {
        self.expose_remote_exception_types = expose;
        self
    }

    /// Sets the shutdown grace period.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Sets the reconnection strategy.
    pub fn with_reconnection_strategy(mut self, strategy: Arc<dyn ReconnectionStrategy>) -> Self {
        self.reconnection_strategy = strategy;
        self
    }

    /// Sets the transport security layer.
    pub fn with_security(mut self, security: Arc<dyn TransportSecurity>) -> Self {
        self.security = security;
        self
    }

    /// Adds a hint resolver after the existing ones.
    pub fn with_resolver(mut self, resolver: Arc<dyn HintResolver>) -> Self {
        self.resolvers.push(resolver);
        self
    }

    /// The arbiter policy implied by this configuration.
    pub fn arbiter_policy(&self) -> ArbiterPolicy {
        ArbiterPolicy {
            allow_legacy_peers: self.allow_legacy_peers,
            legacy_grace_window: self.legacy_grace_window,
        }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns a description of the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        if self.negotiation_timeout.is_zero() {
            return Err("negotiation_timeout must be greater than 0".to_string());
        }
        if self.max_frame_size == 0 {
            return Err("max_frame_size must be greater than 0".to_string());
        }
        if self.max_preamble_size < 64 {
            return Err("max_preamble_size must be at least 64 bytes".to_string());
        }
        if self.shutdown_timeout.is_zero() {
            return Err("shutdown_timeout must be greater than 0".to_string());
        }
        if let (Some(configured), Some(proven)) = (&self.tub_id, self.security.local_tub_id()) {
            if *configured != proven {
                return Err(format!(
                    "tub_id {} does not match the {} identity {}",
                    configured,
                    self.security.name(),
                    proven
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TubConfig::default();
        assert_eq!(config.negotiation_timeout, Duration::from_secs(30));
        assert_eq!(config.version_range, SUPPORTED_VERSIONS);
        assert_eq!(config.max_frame_size, 16 * 1024 * 1024);
        assert_eq!(config.max_preamble_size, 4096);
        assert!(!config.allow_legacy_peers);
        assert_eq!(config.legacy_grace_window, Duration::from_secs(60));
        assert!(!config.expose_remote_exception_types);
        assert_eq!(config.reconnection_strategy.name(), "ExponentialBackoff");
        assert_eq!(config.security.name(), "plaintext");
        assert_eq!(config.resolvers.len(), 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builders() {
        let id = TubId::generate();
        let config = TubConfig::new()
            .with_tub_id(id.clone())
            .with_legacy_peers(Duration::from_secs(5))
            .with_remote_exception_types(true);
        assert_eq!(config.tub_id, Some(id));
        let policy = config.arbiter_policy();
        assert!(policy.allow_legacy_peers);
        assert_eq!(policy.legacy_grace_window, Duration::from_secs(5));
        assert!(config.expose_remote_exception_types);
    }

    #[test]
    fn test_validate() {
        assert!(TubConfig::new().with_negotiation_timeout(Duration::ZERO).validate().is_err());
        assert!(TubConfig::new().with_max_frame_size(0).validate().is_err());
        assert!(TubConfig::new().with_max_preamble_size(10).validate().is_err());
    }

    #[test]
    fn test_debug_names_components() {
        let text = format!("{:?}", TubConfig::default());
        assert!(text.contains("ExponentialBackoff"));
        assert!(text.contains("plaintext"));
    }
}

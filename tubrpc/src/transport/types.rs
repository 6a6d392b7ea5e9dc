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

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counter for transport ids.
static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportId(u64);

impl TransportId {
    /// Creates a transport ID from a raw value.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Allocates the next unused transport ID.
    pub fn next() -> Self {
        Self(NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Transport({})", self.0)
    }
}

/// Metadata associated with a transport connection.
///
/// Used for log lines and for the per-hint connection report.
#[derive(Debug, Clone)]
pub struct TransportMetadata {
    /// Unique identifier for this transport
    pub id: TransportId,

    /// Local socket address, if the transport has one
    pub local_addr: Option<SocketAddr>,

    /// Remote socket address, if the transport has one
    pub peer_addr: Option<SocketAddr>,

    /// Human-readable peer label for transports without socket addresses
    pub peer_label: Option<String>,

    /// Transport type ("tcp", "mem", "tls")
    pub transport_type: String,

    /// When the transport was created
    pub created_at: std::time::Instant,
}

impl TransportMetadata {
    /// Creates new transport metadata.
    pub fn new(id: TransportId, transport_type: impl Into<String>) -> Self {
        Self {
            id,
            local_addr: None,
            peer_addr: None,
            peer_label: None,
            transport_type: transport_type.into(),
            created_at: std::time::Instant::now(),
        }
    }

    /// Sets the local address.
    pub fn with_local_addr(mut self, addr: SocketAddr) -> Self {
        self.local_addr = Some(addr);
        self
    }

    /// Sets the peer address.
    pub fn with_peer_addr(mut self, addr: SocketAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    /// Sets the peer label.
    pub fn with_peer_label(mut self, label: impl Into<String>) -> Self {
        self.peer_label = Some(label.into());
        self
    }

    /// Returns the best available description of the remote end.
    pub fn peer(&self) -> String {
        match (&self.peer_addr, &self.peer_label) {
            (Some(addr), _) => addr.to_string(),
            (None, Some(label)) => label.clone(),
            (None, None) => "unknown".to_string(),
        }
    }

    /// Returns the age of this transport.
    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_id_display() {
        let id = TransportId::new(123);
        assert_eq!(format!("{}", id), "Transport(123)");
    }

    #[test]
    fn test_transport_ids_are_unique() {
        assert_ne!(TransportId::next(), TransportId::next());
    }

    #[test]
    fn test_peer_description() {
        let id = TransportId::new(1);
        let unknown = TransportMetadata::new(id, "mem");
        assert_eq!(unknown.peer(), "unknown");

        let labelled = TransportMetadata::new(id, "mem").with_peer_label("alice");
        assert_eq!(labelled.peer(), "alice");

        let peer = "127.0.0.1:9090".parse().unwrap();
        let addressed = TransportMetadata::new(id, "tcp")
            .with_peer_label("ignored")
            .with_peer_addr(peer);
        assert_eq!(addressed.peer(), "127.0.0.1:9090");
    }
}

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

//! Turning location hints into connections.
//!
//! A [`HintResolver`] recognises some hint schemes and produces a
//! [`Connector`] for each hint it understands. Hints nobody recognises are
//! skipped by the connection race.

use crate::identity::LocationHint;
use crate::transport::{BoxedTransport, MemoryNetwork, TcpTransport, TransportError};
use async_trait::async_trait;
use std::fmt;

/// A ready-to-dial endpoint produced from a location hint.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a new transport to the endpoint.
    async fn connect(&self) -> Result<BoxedTransport, TransportError>;

    /// Describes the endpoint for logs and reports.
    fn describe(&self) -> String;
}

/// Maps location hints to connectors.
///
/// # Examples
///
/// ```rust
/// use tubrpc::identity::LocationHint;
/// use tubrpc::transport::{HintResolver, TcpHintResolver};
///
/// let resolver = TcpHintResolver;
/// assert!(resolver.resolve(&LocationHint::tcp("localhost:4433")).is_some());
/// assert!(resolver.resolve(&LocationHint::new("tor", "x.onion:80")).is_none());
/// ```
pub trait HintResolver: Send + Sync {
    /// Returns a connector for `hint`, or `None` if the scheme is not
    /// recognised by this resolver.
    fn resolve(&self, hint: &LocationHint) -> Option<Box<dyn Connector>>;
}

/// Resolves `tcp:host:port` hints.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpHintResolver;

impl HintResolver for TcpHintResolver {
    fn resolve(&self, hint: &LocationHint) -> Option<Box<dyn Connector>> {
        (hint.scheme() == "tcp").then(|| {
            Box::new(TcpConnector {
                address: hint.address().to_string(),
            }) as Box<dyn Connector>
        })
    }
}

struct TcpConnector {
    address: String,
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<BoxedTransport, TransportError> {
        Ok(Box::new(TcpTransport::connect(self.address.clone()).await?))
    }

    fn describe(&self) -> String {
        format!("tcp:{}", self.address)
    }
}

impl HintResolver for MemoryNetwork {
    fn resolve(&self, hint: &LocationHint) -> Option<Box<dyn Connector>> {
        (hint.scheme() == "mem").then(|| {
            Box::new(MemoryConnector {
                network: self.clone(),
                name: hint.address().to_string(),
            }) as Box<dyn Connector>
        })
    }
}

struct MemoryConnector {
    network: MemoryNetwork,
    name: String,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<BoxedTransport, TransportError> {
        Ok(Box::new(self.network.connect(&self.name).await?))
    }

    fn describe(&self) -> String {
        format!("mem:{}", self.name)
    }
}

impl fmt::Debug for dyn Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Connector({})", self.describe())
    }
}

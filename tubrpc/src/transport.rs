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

//! Transport layer abstractions.
//!
//! The [`Transport`] trait is a bi-directional byte stream with metadata and
//! graceful shutdown. Implementations:
//!
//! - [`TcpTransport`]: TCP/IP networking
//! - [`MemoryTransport`]: in-process pipes, reachable by name through a
//!   [`MemoryNetwork`]
//! - [`TlsTransport`]: TLS over any transport, with certificates pinned to
//!   Tub ids (requires the `tls` feature)
//!
//! Location hints are turned into connections by [`HintResolver`]s:
//! [`TcpHintResolver`] handles `tcp:` hints and a [`MemoryNetwork`]
//! handles `mem:` hints.
//!
//! # Examples
//!
//! ```rust
//! use tubrpc::identity::LocationHint;
//! use tubrpc::transport::{HintResolver, MemoryNetwork, TransportListener};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let network = MemoryNetwork::new();
//! let listener = network.bind("carol")?;
//!
//! let connector = network
//!     .resolve(&LocationHint::memory("carol"))
//!     .expect("mem hints are recognised");
//! let outbound = connector.connect().await?;
//! let inbound = listener.accept().await?;
//! # let _ = (outbound, inbound);
//! # Ok(())
//! # }
//! ```

mod error;
mod memory;
mod resolver;
mod tcp;
#[cfg(feature = "tls")]
mod tls;
mod traits;
mod types;

pub use self::error::TransportError;
pub use self::memory::{MemoryListener, MemoryNetwork, MemoryTransport};
pub use self::resolver::{Connector, HintResolver, TcpHintResolver};
pub use self::tcp::{TcpTransport, TcpTransportListener};
#[cfg(feature = "tls")]
pub use self::tls::{TlsConfig, TlsIdentity, TlsTransport};
pub use self::traits::{BoxedTransport, ShutdownFuture, Transport, TransportListener};
pub use self::types::{TransportId, TransportMetadata};

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

use crate::transport::{TransportError, TransportMetadata};
use std::future::Future;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};

/// Future returned by [`Transport::shutdown`].
pub type ShutdownFuture<'a> = Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>>;

/// A type-erased transport, as produced by connectors and listeners.
pub type BoxedTransport = Box<dyn Transport>;

/// Bi-directional byte stream that a connection is negotiated over.
///
/// Transports combine Tokio's `AsyncRead` and `AsyncWrite` with metadata
/// and graceful shutdown. Security (TLS or plaintext) is layered on top by
/// the negotiation layer, not by the transport itself.
///
/// # Examples
///
/// ```rust
/// use tubrpc::transport::{MemoryTransport, Transport};
/// use tokio::io::{AsyncReadExt, AsyncWriteExt};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let (mut a, mut b) = MemoryTransport::pair_default();
/// a.write_all(b"ping").await?;
/// let mut buf = [0u8; 4];
/// b.read_exact(&mut buf).await?;
/// assert_eq!(&buf, b"ping");
/// Transport::shutdown(&mut a).await?;
/// # Ok(())
/// # }
/// ```
pub trait Transport: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static {
    /// Returns metadata about this transport.
    fn metadata(&self) -> &TransportMetadata;

    /// Gracefully shuts down the transport.
    ///
    /// After `shutdown()` the peer observes end-of-stream.
    fn shutdown(&mut self) -> ShutdownFuture<'_>;
}

impl Transport for BoxedTransport {
    fn metadata(&self) -> &TransportMetadata {
        (**self).metadata()
    }

    fn shutdown(&mut self) -> ShutdownFuture<'_> {
        (**self).shutdown()
    }
}

/// Accepts inbound transports.
#[async_trait::async_trait]
pub trait TransportListener: Send + Sync + 'static {
    /// The type of transport this listener produces
    type Transport: Transport;

    /// Waits for the next inbound connection.
    async fn accept(&self) -> Result<Self::Transport, TransportError>;

    /// Returns the address this listener is bound to.
    #[allow(clippy::result_large_err)]
    fn local_addr(&self) -> Result<String, TransportError>;

    /// Stops accepting connections.
    async fn shutdown(&self) -> Result<(), TransportError>;
}

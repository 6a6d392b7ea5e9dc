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

//! TCP transport implementation.

use crate::transport::traits::ShutdownFuture;
use crate::transport::{Transport, TransportError, TransportId, TransportListener, TransportMetadata};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};

#[cfg(feature = "tracing")]
use tracing::{debug, info, warn};

/// TCP transport.
///
/// Wraps a Tokio `TcpStream` with `TCP_NODELAY` enabled, since RPC
/// traffic is dominated by small frames.
///
/// # Examples
///
/// ```rust,no_run
/// use tubrpc::transport::{TcpTransport, TcpTransportListener, TransportListener};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let listener = TcpTransportListener::bind("127.0.0.1:0").await?;
/// let addr = listener.local_addr()?;
/// let client = TcpTransport::connect(addr).await?;
/// let server = listener.accept().await?;
/// # let _ = (client, server);
/// # Ok(())
/// # }
/// ```
pub struct TcpTransport {
    stream: TcpStream,
    metadata: TransportMetadata,
}

impl TcpTransport {
    /// Wraps an established stream.
    pub fn from_stream(stream: TcpStream) -> io::Result<Self> {
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        if let Err(_e) = stream.set_nodelay(true) {
            #[cfg(feature = "tracing")]
            warn!("failed to set TCP_NODELAY: {}", _e);
        }
        let metadata = TransportMetadata::new(TransportId::next(), "tcp")
            .with_local_addr(local_addr)
            .with_peer_addr(peer_addr);
        Ok(Self { stream, metadata })
    }

    /// Connects to `addr` (`host:port`).
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionFailed`] if the connection cannot
    /// be established.
    pub async fn connect(addr: impl Into<String>) -> Result<Self, TransportError> {
        let address = addr.into();

        #[cfg(feature = "tracing")]
        debug!("connecting to tcp:{}", address);

        let stream = TcpStream::connect(&address)
            .await
            .map_err(|source| TransportError::ConnectionFailed {
                address: address.clone(),
                source,
            })?;
        Self::from_stream(stream).map_err(TransportError::from)
    }

    /// Returns the local address of this transport.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    /// Returns the peer address of this transport.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }
}

impl Transport for TcpTransport {
    fn metadata(&self) -> &TransportMetadata {
        &self.metadata
    }

    fn shutdown(&mut self) -> ShutdownFuture<'_> {
        Box::pin(async move {
            use tokio::io::AsyncWriteExt;
            self.stream.shutdown().await.map_err(TransportError::from)
        })
    }
}

impl AsyncRead for TcpTransport {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TcpTransport {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// Accepts inbound TCP connections.
pub struct TcpTransportListener {
    listener: TcpListener,
}

impl TcpTransportListener {
    /// Binds to `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::BindFailed`] if the address cannot be bound.
    pub async fn bind(addr: impl Into<String>) -> Result<Self, TransportError> {
        let address = addr.into();
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|source| TransportError::BindFailed {
                address: address.clone(),
                source,
            })?;

        #[cfg(feature = "tracing")]
        info!("tcp listener bound to {}", address);

        Ok(Self { listener })
    }

    /// Returns the bound socket address.
    pub fn socket_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

#[async_trait::async_trait]
impl TransportListener for TcpTransportListener {
    type Transport = TcpTransport;

    async fn accept(&self) -> Result<TcpTransport, TransportError> {
        let (stream, _peer) = self.listener.accept().await?;

        #[cfg(feature = "tracing")]
        debug!("accepted tcp connection from {}", _peer);

        TcpTransport::from_stream(stream).map_err(TransportError::from)
    }

    fn local_addr(&self) -> Result<String, TransportError> {
        Ok(self.listener.local_addr()?.to_string())
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

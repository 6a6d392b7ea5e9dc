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

//! In-process transports.
//!
//! [`MemoryTransport`] is a pair of connected byte pipes built on Tokio
//! channels. [`MemoryNetwork`] is a registry of named in-process listeners so
//! that Tubs in one process can reach each other through `mem:<name>` hints
//! without touching the network stack.

use crate::transport::{Transport, TransportError, TransportId, TransportListener, TransportMetadata};
use crate::transport::traits::ShutdownFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

#[cfg(feature = "tracing")]
use tracing::debug;

/// Default buffer size (in chunks) for memory transport channels.
const DEFAULT_BUFFER_SIZE: usize = 1024;

/// One end of an in-memory byte pipe.
///
/// Writes on one end become readable on the other. Shutting down or
/// dropping one end makes the other observe end-of-stream.
///
/// # Examples
///
/// ```rust
/// use tubrpc::transport::MemoryTransport;
/// use tokio::io::{AsyncReadExt, AsyncWriteExt};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let (mut client, mut server) = MemoryTransport::pair(16);
/// client.write_all(b"Hello").await?;
/// let mut buffer = [0u8; 5];
/// server.read_exact(&mut buffer).await?;
/// assert_eq!(&buffer, b"Hello");
/// # Ok(())
/// # }
/// ```
pub struct MemoryTransport {
    metadata: TransportMetadata,
    rx: mpsc::Receiver<Vec<u8>>,
    current_chunk: Option<Vec<u8>>,
    chunk_offset: usize,
    tx: Option<mpsc::Sender<Vec<u8>>>,
}

impl MemoryTransport {
    /// Creates a pair of connected memory transports.
    ///
    /// `buffer_size` bounds the number of in-flight writes per direction;
    /// when it is reached, writers wait for the reader.
    pub fn pair(buffer_size: usize) -> (Self, Self) {
        let (tx1, rx1) = mpsc::channel(buffer_size.max(1));
        let (tx2, rx2) = mpsc::channel(buffer_size.max(1));

        let first = Self::from_parts(TransportId::next(), rx2, tx1);
        let second = Self::from_parts(TransportId::next(), rx1, tx2);

        #[cfg(feature = "tracing")]
        debug!(
            "created memory transport pair {} <-> {}",
            first.metadata.id, second.metadata.id
        );

        (first, second)
    }

    /// Creates a pair with the default buffer size.
    pub fn pair_default() -> (Self, Self) {
        Self::pair(DEFAULT_BUFFER_SIZE)
    }

    fn from_parts(id: TransportId, rx: mpsc::Receiver<Vec<u8>>, tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            metadata: TransportMetadata::new(id, "mem"),
            rx,
            current_chunk: None,
            chunk_offset: 0,
            tx: Some(tx),
        }
    }

    fn label(mut self, label: impl Into<String>) -> Self {
        self.metadata = self.metadata.with_peer_label(label);
        self
    }
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("metadata", &self.metadata)
            .field("write_open", &self.tx.is_some())
            .finish()
    }
}

impl Transport for MemoryTransport {
    fn metadata(&self) -> &TransportMetadata {
        &self.metadata
    }

    fn shutdown(&mut self) -> ShutdownFuture<'_> {
        Box::pin(async move {
            #[cfg(feature = "tracing")]
            debug!("shutting down memory transport {}", self.metadata.id);
            self.tx = None;
            Ok(())
        })
    }
}

impl AsyncRead for MemoryTransport {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if let Some(chunk) = this.current_chunk.as_ref() {
            let start = this.chunk_offset;
            let end = (start + buf.remaining()).min(chunk.len());
            buf.put_slice(&chunk[start..end]);
            if end >= chunk.len() {
                this.current_chunk = None;
                this.chunk_offset = 0;
            } else {
                this.chunk_offset = end;
            }
            return Poll::Ready(Ok(()));
        }

        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => {
                let to_read = chunk.len().min(buf.remaining());
                buf.put_slice(&chunk[..to_read]);
                if to_read < chunk.len() {
                    this.current_chunk = Some(chunk);
                    this.chunk_offset = to_read;
                }
                Poll::Ready(Ok(()))
            }
            // Every sender is gone: end-of-stream.
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for MemoryTransport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let Some(tx) = this.tx.as_ref() else {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "memory transport shut down",
            )));
        };
        match tx.try_send(buf.to_vec()) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(mpsc::error::TrySendError::Full(_)) => {
                cx.waker().wake_by_ref();
                Poll::Pending
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "memory transport closed",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().tx = None;
        Poll::Ready(Ok(()))
    }
}

type Registry = Arc<Mutex<HashMap<String, (u64, mpsc::Sender<MemoryTransport>)>>>;

/// A registry of named in-process listeners.
///
/// Cloning a `MemoryNetwork` yields a handle to the same registry. It also
/// acts as the resolver for `mem:` location hints; see
/// [`HintResolver`](crate::transport::HintResolver).
///
/// # Examples
///
/// ```rust
/// use tubrpc::transport::{MemoryNetwork, TransportListener};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let network = MemoryNetwork::new();
/// let listener = network.bind("carol")?;
/// let client = network.connect("carol").await?;
/// let server = listener.accept().await?;
/// # let _ = (client, server);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    listeners: Registry,
    next_listener: Arc<AtomicU64>,
    buffer_size: Option<usize>,
}

impl MemoryNetwork {
    /// Creates an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the per-direction buffer size of transports created by
    /// [`connect`](Self::connect).
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size);
        self
    }

    /// Registers a listener under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::BindFailed`] if a live listener already uses
    /// the name.
    #[allow(clippy::result_large_err)]
    pub fn bind(&self, name: impl Into<String>) -> Result<MemoryListener, TransportError> {
        let name = name.into();
        let mut listeners = self.listeners.lock();
        if let Some((_, existing)) = listeners.get(&name) {
            if !existing.is_closed() {
                return Err(TransportError::BindFailed {
                    address: format!("mem:{}", name),
                    source: io::Error::new(io::ErrorKind::AddrInUse, "name already bound"),
                });
            }
        }
        let (tx, rx) = mpsc::channel(64);
        let token = self.next_listener.fetch_add(1, Ordering::Relaxed);
        listeners.insert(name.clone(), (token, tx));

        #[cfg(feature = "tracing")]
        debug!("memory listener bound to mem:{}", name);

        Ok(MemoryListener {
            name,
            token,
            listeners: self.listeners.clone(),
            incoming: tokio::sync::Mutex::new(rx),
        })
    }

    /// Opens a connection to the listener registered under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionFailed`] if nobody listens there.
    pub async fn connect(&self, name: &str) -> Result<MemoryTransport, TransportError> {
        let address = format!("mem:{}", name);
        let sender = self
            .listeners
            .lock()
            .get(name)
            .map(|(_, tx)| tx.clone())
            .ok_or_else(|| TransportError::refused(address.clone()))?;

        let (client, server) = MemoryTransport::pair(self.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE));
        let client = client.label(address.clone());
        let server = server.label(format!("{} (inbound)", address));
        sender
            .send(server)
            .await
            .map_err(|_| TransportError::refused(address))?;
        Ok(client)
    }

    /// Returns `true` if a live listener is registered under `name`.
    pub fn is_bound(&self, name: &str) -> bool {
        self.listeners
            .lock()
            .get(name)
            .is_some_and(|(_, tx)| !tx.is_closed())
    }
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.listeners.lock().keys().cloned().collect();
        f.debug_struct("MemoryNetwork")
            .field("listeners", &names)
            .finish()
    }
}

/// A listener registered in a [`MemoryNetwork`].
///
/// Dropping or shutting down the listener unregisters its name.
pub struct MemoryListener {
    name: String,
    token: u64,
    listeners: Registry,
    incoming: tokio::sync::Mutex<mpsc::Receiver<MemoryTransport>>,
}

impl MemoryListener {
    /// Returns the name this listener is registered under.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn unregister(&self) {
        let mut listeners = self.listeners.lock();
        if listeners
            .get(&self.name)
            .is_some_and(|(token, _)| *token == self.token)
        {
            listeners.remove(&self.name);
        }
    }
}

#[async_trait::async_trait]
impl TransportListener for MemoryListener {
    type Transport = MemoryTransport;

    async fn accept(&self) -> Result<MemoryTransport, TransportError> {
        self.incoming.lock().await.recv().await.ok_or(TransportError::Closed)
    }

    fn local_addr(&self) -> Result<String, TransportError> {
        Ok(format!("mem:{}", self.name))
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        self.unregister();
        self.incoming.lock().await.close();
        Ok(())
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.unregister();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_memory_transport_bidirectional() {
        let (mut t1, mut t2) = MemoryTransport::pair_default();

        t1.write_all(b"Hello").await.unwrap();
        let mut buffer = vec![0u8; 1024];
        let n = t2.read(&mut buffer).await.unwrap();
        assert_eq!(&buffer[..n], b"Hello");

        t2.write_all(b"World").await.unwrap();
        let n = t1.read(&mut buffer).await.unwrap();
        assert_eq!(&buffer[..n], b"World");
    }

    #[tokio::test]
    async fn test_partial_reads_preserve_order() {
        let (mut tx, mut rx) = MemoryTransport::pair_default();
        tx.write_all(b"abcdef").await.unwrap();
        tx.write_all(b"gh").await.unwrap();

        let mut buffer = [0u8; 4];
        rx.read_exact(&mut buffer).await.unwrap();
        assert_eq!(&buffer, b"abcd");
        rx.read_exact(&mut buffer).await.unwrap();
        assert_eq!(&buffer, b"efgh");
    }

    #[tokio::test]
    async fn test_shutdown_gives_peer_eof() {
        let (mut tx, mut rx) = MemoryTransport::pair_default();
        Transport::shutdown(&mut tx).await.unwrap();

        let mut buffer = vec![0u8; 16];
        assert_eq!(rx.read(&mut buffer).await.unwrap(), 0);
        assert!(tx.write_all(b"late").await.is_err());
    }

    #[tokio::test]
    async fn test_drop_gives_peer_eof() {
        let (tx, mut rx) = MemoryTransport::pair_default();
        drop(tx);
        let mut buffer = vec![0u8; 16];
        assert_eq!(rx.read(&mut buffer).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_network_connect_and_accept() {
        let network = MemoryNetwork::new();
        let listener = network.bind("carol").unwrap();
        assert_eq!(listener.local_addr().unwrap(), "mem:carol");

        let mut client = network.connect("carol").await.unwrap();
        let mut server = listener.accept().await.unwrap();
        assert_eq!(client.metadata().peer(), "mem:carol");

        client.write_all(b"hi").await.unwrap();
        let mut buffer = [0u8; 2];
        server.read_exact(&mut buffer).await.unwrap();
        assert_eq!(&buffer, b"hi");
    }

    #[tokio::test]
    async fn test_network_refuses_unknown_name() {
        let network = MemoryNetwork::new();
        let err = network.connect("nobody").await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionFailed { .. }));

        let _listener = network.bind("somebody").unwrap();
        let client = network.connect("somebody").await.unwrap();
        let shown = format!("{:?}", client);
        assert!(shown.starts_with("MemoryTransport"));
        assert!(shown.contains("write_open: true"));
    }

    #[tokio::test]
    async fn test_bind_conflict_and_release() {
        let network = MemoryNetwork::new();
        let listener = network.bind("bob").unwrap();
        assert!(matches!(
            network.bind("bob"),
            Err(TransportError::BindFailed { .. })
        ));
        assert!(network.is_bound("bob"));

        drop(listener);
        assert!(!network.is_bound("bob"));
        assert!(network.connect("bob").await.is_err());
        assert!(network.bind("bob").is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_wakes_accept() {
        let network = MemoryNetwork::new();
        let listener = Arc::new(network.bind("alice").unwrap());
        let waiter = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.accept().await })
        };
        tokio::task::yield_now().await;
        TransportListener::shutdown(&*listener).await.unwrap();
        // shutdown needs the receiver lock held by accept; accept must
        // still finish because unregistering drops the only sender.
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(TransportError::Closed)));
    }
}

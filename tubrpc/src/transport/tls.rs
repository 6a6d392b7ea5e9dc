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

//! TLS transport with identities pinned to Tub ids.
//!
//! Tubs do not use certificate authorities. Each Tub owns a (typically
//! self-signed) certificate and its [`TubId`] is derived from that
//! certificate's digest. A client pins the server certificate to the tub id
//! it expected from the FURL; a server accepts any client certificate and
//! reports the client's derived tub id so the handshake can check it against
//! what the client claims.

use crate::identity::TubId;
use crate::transport::traits::ShutdownFuture;
use crate::transport::{Transport, TransportError, TransportMetadata};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{
    CryptoProvider, WebPkiSupportedAlgorithms, verify_tls12_signature, verify_tls13_signature,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};

/// Certificate chain and private key a Tub presents.
pub struct TlsIdentity {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl TlsIdentity {
    /// Loads an identity from PEM-encoded certificate chain and private key.
    ///
    /// # Errors
    ///
    /// Returns an error if either input cannot be parsed or the chain is
    /// empty.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, TransportError> {
        let chain = rustls_pemfile::certs(&mut &cert_pem[..])
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| invalid_data(e.to_string()))?;
        if chain.is_empty() {
            return Err(invalid_data("no certificate found"));
        }
        let key = rustls_pemfile::private_key(&mut &key_pem[..])
            .map_err(|e| invalid_data(e.to_string()))?
            .ok_or_else(|| invalid_data("no private key found"))?;
        Ok(Self { chain, key })
    }

    /// Returns the tub id bound to this identity's leaf certificate.
    pub fn tub_id(&self) -> TubId {
        TubId::from_certificate(self.chain[0].as_ref())
    }
}

impl Clone for TlsIdentity {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain.clone(),
            key: self.key.clone_key(),
        }
    }
}

impl std::fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("tub_id", &self.tub_id())
            .field("chain_len", &self.chain.len())
            .finish()
    }
}

/// TLS configuration for one side of a connection.
#[derive(Clone)]
pub enum TlsConfig {
    /// Client configuration pinned to a tub id
    Client {
        /// TLS connector
        connector: Arc<TlsConnector>,
        /// Server name sent for SNI
        server_name: ServerName<'static>,
    },
    /// Server configuration
    Server {
        /// TLS acceptor
        acceptor: Arc<TlsAcceptor>,
    },
}

impl TlsConfig {
    /// Builds a client configuration that presents `identity` and only
    /// accepts a server whose certificate derives to `expected`.
    ///
    /// # Errors
    ///
    /// Returns an error if the identity's key is unusable.
    pub fn pinned_client(identity: &TlsIdentity, expected: &TubId) -> Result<Self, TransportError> {
        let verifier = Arc::new(PinnedTubVerifier {
            expected: expected.clone(),
            algorithms: algorithms(),
        });
        let config = rustls::ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| invalid_data(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_client_auth_cert(identity.chain.clone(), identity.key.clone_key())
            .map_err(|e| invalid_data(e.to_string()))?;

        let server_name = ServerName::try_from(format!("{}.tub", expected))
            .map_err(|e| invalid_data(e.to_string()))?;

        Ok(Self::Client {
            connector: Arc::new(TlsConnector::from(Arc::new(config))),
            server_name,
        })
    }

    /// Builds a server configuration that presents `identity` and requires
    /// a client certificate.
    ///
    /// # Errors
    ///
    /// Returns an error if the identity's key is unusable.
    pub fn server(identity: &TlsIdentity) -> Result<Self, TransportError> {
        let config = rustls::ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| invalid_data(e.to_string()))?
            .with_client_cert_verifier(Arc::new(AnyTubClient {
                algorithms: algorithms(),
            }))
            .with_single_cert(identity.chain.clone(), identity.key.clone_key())
            .map_err(|e| invalid_data(e.to_string()))?;
        Ok(Self::Server {
            acceptor: Arc::new(TlsAcceptor::from(Arc::new(config))),
        })
    }
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Client { server_name, .. } => f
                .debug_struct("TlsConfig::Client")
                .field("server_name", server_name)
                .finish(),
            Self::Server { .. } => f.debug_struct("TlsConfig::Server").finish(),
        }
    }
}

/// A transport wrapped in TLS.
pub struct TlsTransport<T> {
    stream: TlsStream<T>,
    metadata: TransportMetadata,
    peer_tub_id: Option<TubId>,
}

impl<T> TlsTransport<T>
where
    T: Transport,
{
    /// Performs the client side of the TLS handshake over `transport`.
    ///
    /// # Errors
    ///
    /// Fails if `config` is not a client configuration, or the handshake
    /// fails (including when the server's certificate does not match the
    /// pinned tub id).
    pub async fn connect(transport: T, config: TlsConfig) -> Result<Self, TransportError> {
        let TlsConfig::Client {
            connector,
            server_name,
        } = config
        else {
            return Err(TransportError::InvalidConfiguration {
                reason: "expected client config, got server config".to_string(),
            });
        };

        let metadata = tls_metadata(transport.metadata());
        let stream = connector
            .connect(server_name, transport)
            .await
            .map_err(|e| TransportError::Io { source: e })?;
        let peer_tub_id = stream
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|leaf| TubId::from_certificate(leaf.as_ref()));

        Ok(Self {
            stream: TlsStream::Client(stream),
            metadata,
            peer_tub_id,
        })
    }

    /// Performs the server side of the TLS handshake over `transport`.
    ///
    /// # Errors
    ///
    /// Fails if `config` is not a server configuration or the handshake
    /// fails.
    pub async fn accept(transport: T, config: TlsConfig) -> Result<Self, TransportError> {
        let TlsConfig::Server { acceptor } = config else {
            return Err(TransportError::InvalidConfiguration {
                reason: "expected server config, got client config".to_string(),
            });
        };

        let metadata = tls_metadata(transport.metadata());
        let stream = acceptor
            .accept(transport)
            .await
            .map_err(|e| TransportError::Io { source: e })?;
        let peer_tub_id = stream
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|leaf| TubId::from_certificate(leaf.as_ref()));

        Ok(Self {
            stream: TlsStream::Server(stream),
            metadata,
            peer_tub_id,
        })
    }

    /// Returns the tub id derived from the peer's certificate.
    pub fn peer_tub_id(&self) -> Option<&TubId> {
        self.peer_tub_id.as_ref()
    }
}

fn tls_metadata(base: &TransportMetadata) -> TransportMetadata {
    let mut metadata = TransportMetadata::new(base.id, "tls");
    metadata.local_addr = base.local_addr;
    metadata.peer_addr = base.peer_addr;
    metadata.peer_label = base.peer_label.clone();
    metadata
}

impl<T> Transport for TlsTransport<T>
where
    T: Transport,
{
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

impl<T> AsyncRead for TlsTransport<T>
where
    T: Transport,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl<T> AsyncWrite for TlsTransport<T>
where
    T: Transport,
{
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

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn algorithms() -> WebPkiSupportedAlgorithms {
    rustls::crypto::ring::default_provider().signature_verification_algorithms
}

fn invalid_data(reason: impl Into<String>) -> TransportError {
    TransportError::InvalidConfiguration {
        reason: reason.into(),
    }
}

/// Accepts exactly the server certificate whose digest is the expected tub
/// id. Handshake signatures are still verified, so the server must hold the
/// certificate's key.
#[derive(Debug)]
struct PinnedTubVerifier {
    expected: TubId,
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for PinnedTubVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let actual = TubId::from_certificate(end_entity.as_ref());
        if actual == self.expected {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General(format!(
                "server certificate belongs to tub {}, expected {}",
                actual, self.expected
            )))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Accepts any client certificate; the derived tub id is checked later
/// against the client's hello.
#[derive(Debug)]
struct AnyTubClient {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ClientCertVerifier for AnyTubClient {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const ALICE_CERT: &[u8] = include_bytes!("../../tests/data/alice.cert.pem");
    const ALICE_KEY: &[u8] = include_bytes!("../../tests/data/alice.key.pem");
    const BOB_CERT: &[u8] = include_bytes!("../../tests/data/bob.cert.pem");
    const BOB_KEY: &[u8] = include_bytes!("../../tests/data/bob.key.pem");

    #[test]
    fn test_identity_tub_id_is_stable() {
        let a = TlsIdentity::from_pem(ALICE_CERT, ALICE_KEY).unwrap();
        let b = TlsIdentity::from_pem(ALICE_CERT, ALICE_KEY).unwrap();
        assert_eq!(a.tub_id(), b.tub_id());
        assert!(TlsIdentity::from_pem(b"", ALICE_KEY).is_err());
    }

    #[tokio::test]
    async fn test_pinned_handshake_succeeds() {
        let alice = TlsIdentity::from_pem(ALICE_CERT, ALICE_KEY).unwrap();
        let bob = TlsIdentity::from_pem(BOB_CERT, BOB_KEY).unwrap();
        let (client_io, server_io) = MemoryTransport::pair_default();

        let server_config = TlsConfig::server(&bob).unwrap();
        let server = tokio::spawn(async move {
            let mut tls = TlsTransport::accept(server_io, server_config).await.unwrap();
            let mut buf = [0u8; 4];
            tls.read_exact(&mut buf).await.unwrap();
            (tls.peer_tub_id().cloned(), buf)
        });

        let client_config = TlsConfig::pinned_client(&alice, &bob.tub_id()).unwrap();
        let mut client = TlsTransport::connect(client_io, client_config).await.unwrap();
        assert_eq!(client.peer_tub_id(), Some(&bob.tub_id()));
        client.write_all(b"ping").await.unwrap();
        client.flush().await.unwrap();

        let (seen_client, buf) = server.await.unwrap();
        assert_eq!(seen_client, Some(alice.tub_id()));
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_pinning_rejects_wrong_tub() {
        let alice = TlsIdentity::from_pem(ALICE_CERT, ALICE_KEY).unwrap();
        let bob = TlsIdentity::from_pem(BOB_CERT, BOB_KEY).unwrap();
        let (client_io, server_io) = MemoryTransport::pair_default();

        let server_config = TlsConfig::server(&bob).unwrap();
        tokio::spawn(async move {
            let _ = TlsTransport::accept(server_io, server_config).await;
        });

        // Expect alice's id while bob answers.
        let client_config = TlsConfig::pinned_client(&alice, &alice.tub_id()).unwrap();
        assert!(TlsTransport::connect(client_io, client_config).await.is_err());
    }
}

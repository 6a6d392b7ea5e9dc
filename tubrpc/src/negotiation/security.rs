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

//! Transport security upgrade.
//!
//! Between the plaintext preamble and the hello exchange, the negotiator asks
//! a [`TransportSecurity`] to secure the stream. [`Plaintext`] passes the
//! transport through unchanged; with the `tls` feature, [`TlsSecurity`]
//! runs a mutually authenticated TLS handshake in which each side's tub id is
//! bound to its certificate.

use crate::identity::TubId;
use crate::negotiation::NegotiationError;
use crate::transport::BoxedTransport;
use async_trait::async_trait;

/// A transport after the security upgrade.
pub struct Secured {
    /// The (possibly wrapped) transport.
    pub transport: BoxedTransport,
    /// The peer identity proven by the upgrade, if it proves one.
    pub authenticated_peer: Option<TubId>,
}

impl Secured {
    /// Wraps a transport with no proven peer identity.
    pub fn unauthenticated(transport: BoxedTransport) -> Self {
        Self {
            transport,
            authenticated_peer: None,
        }
    }
}

impl std::fmt::Debug for Secured {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secured")
            .field("transport", self.transport.metadata())
            .field("authenticated_peer", &self.authenticated_peer)
            .finish()
    }
}

/// Secures a freshly negotiated transport.
#[async_trait]
pub trait TransportSecurity: Send + Sync + 'static {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// The tub id this security layer proves for us, if any. A Tub using a
    /// security layer that returns `Some` adopts that id.
    fn local_tub_id(&self) -> Option<TubId> {
        None
    }

    /// Secures an outbound transport that must reach `expected`.
    async fn secure_outbound(
        &self,
        transport: BoxedTransport,
        expected: &TubId,
    ) -> Result<Secured, NegotiationError>;

    /// Secures an inbound transport.
    async fn secure_inbound(&self, transport: BoxedTransport) -> Result<Secured, NegotiationError>;
}

/// No upgrade: identities are taken from the hello blocks as presented.
#[derive(Debug, Clone, Copy, Default)]
pub struct Plaintext;

#[async_trait]
impl TransportSecurity for Plaintext {
    fn name(&self) -> &'static str {
        "plaintext"
    }

    async fn secure_outbound(
        &self,
        transport: BoxedTransport,
        _expected: &TubId,
    ) -> Result<Secured, NegotiationError> {
        Ok(Secured::unauthenticated(transport))
    }

    async fn secure_inbound(&self, transport: BoxedTransport) -> Result<Secured, NegotiationError> {
        Ok(Secured::unauthenticated(transport))
    }
}

#[cfg(feature = "tls")]
pub use tls::TlsSecurity;

#[cfg(feature = "tls")]
mod tls {
    use super::{Secured, TransportSecurity};
    use crate::identity::TubId;
    use crate::negotiation::NegotiationError;
    use crate::transport::{BoxedTransport, TlsConfig, TlsIdentity, TlsTransport};
    use async_trait::async_trait;

    /// Mutually authenticated TLS bound to tub ids.
    ///
    /// The outbound side only accepts a server whose certificate derives to
    /// the tub id it dialled. The inbound side learns the client's tub id from
    /// its certificate, and the negotiator checks it against the hello.
    #[derive(Debug, Clone)]
    pub struct TlsSecurity {
        identity: TlsIdentity,
        server: TlsConfig,
    }

    impl TlsSecurity {
        /// Creates a security layer presenting `identity`.
        ///
        /// # Errors
        ///
        /// Fails if the identity's key cannot be used for a server config.
        pub fn new(identity: TlsIdentity) -> Result<Self, NegotiationError> {
            let server = TlsConfig::server(&identity)?;
            Ok(Self { identity, server })
        }
    }

    fn security_error(error: impl std::fmt::Display) -> NegotiationError {
        NegotiationError::Security {
            reason: error.to_string(),
        }
    }

    #[async_trait]
    impl TransportSecurity for TlsSecurity {
        fn name(&self) -> &'static str {
            "tls"
        }

        fn local_tub_id(&self) -> Option<TubId> {
            Some(self.identity.tub_id())
        }

        async fn secure_outbound(
            &self,
            transport: BoxedTransport,
            expected: &TubId,
        ) -> Result<Secured, NegotiationError> {
            let config = TlsConfig::pinned_client(&self.identity, expected)?;
            let tls = TlsTransport::connect(transport, config)
                .await
                .map_err(security_error)?;
            Ok(Secured {
                authenticated_peer: tls.peer_tub_id().cloned(),
                transport: Box::new(tls),
            })
        }

        async fn secure_inbound(
            &self,
            transport: BoxedTransport,
        ) -> Result<Secured, NegotiationError> {
            let tls = TlsTransport::accept(transport, self.server.clone())
                .await
                .map_err(security_error)?;
            Ok(Secured {
                authenticated_peer: tls.peer_tub_id().cloned(),
                transport: Box::new(tls),
            })
        }
    }
}

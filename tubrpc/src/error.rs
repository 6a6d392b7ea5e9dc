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

//! Top-level error type for tubrpc.
//!
//! Each layer has its own error type, and [`TubError`] composes them:
//!
//! 1. **Transport**: opening or using a byte stream ([`TransportError`])
//! 2. **Negotiation**: the handshake failed or was refused
//!    ([`NegotiationError`])
//! 3. **Race**: every location hint of a FURL failed
//!    ([`ConnectionRaceExhausted`])
//! 4. **Call**: a remote call did not produce a value ([`CallError`])
//!
//! plus errors of the Tub itself: bad FURLs, configuration and naming
//! problems, and use after shutdown.
//!
//! # Examples
//!
//! ```rust
//! use tubrpc::TubError;
//! use tubrpc::transport::TransportError;
//!
//! let error: TubError = TransportError::Closed.into();
//! assert!(error.is_transport_error());
//! assert!(!TubError::ShutDown.is_recoverable());
//! ```

use crate::broker::CallError;
use crate::identity::FurlError;
use crate::negotiation::NegotiationError;
use crate::transport::TransportError;
use crate::tub::ConnectionRaceExhausted;
use std::error::Error as StdError;
use std::fmt;

/// Top-level error type for Tub operations.
#[derive(Debug)]
pub enum TubError {
    /// A transport could not be opened or failed.
    Transport(TransportError),

    /// A connection handshake failed or was refused by the peer.
    Negotiation(NegotiationError),

    /// No location hint of a FURL led to a connection.
    ///
    /// The error carries one report per hint.
    RaceExhausted(ConnectionRaceExhausted),

    /// A remote call failed, including the root lookup behind
    /// [`Tub::get_reference`](crate::tub::Tub::get_reference).
    Call(CallError),

    /// A FURL could not be parsed.
    Furl(FurlError),

    /// The configuration is invalid.
    Config {
        /// What is wrong
        reason: String,
    },

    /// Another object is already registered under this name.
    NameInUse {
        /// The contested name
        name: String,
    },

    /// The name cannot appear in a FURL.
    InvalidName {
        /// The rejected name
        name: String,
    },

    /// The Tub has been shut down.
    ShutDown,
}

impl TubError {
    /// Returns `true` if this is a transport error.
    #[must_use]
    pub const fn is_transport_error(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Returns `true` if the connection handshake failed.
    #[must_use]
    pub const fn is_negotiation_error(&self) -> bool {
        matches!(self, Self::Negotiation(_))
    }

    /// Returns `true` if a connection race ran out of hints.
    #[must_use]
    pub const fn is_race_exhausted(&self) -> bool {
        matches!(self, Self::RaceExhausted(_))
    }

    /// Returns `true` if this is a dead-reference call error.
    #[must_use]
    pub fn is_dead_reference(&self) -> bool {
        matches!(self, Self::Call(e) if e.is_dead_reference())
    }

    /// Returns `true` if trying again later may succeed.
    ///
    /// Lost connections and failed races are recoverable; malformed input,
    /// naming conflicts, schema violations and shutdown are not.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use tubrpc::TubError;
    /// use tubrpc::transport::TransportError;
    ///
    /// let refused = TubError::Transport(TransportError::refused("tcp:127.0.0.1:1"));
    /// assert!(refused.is_recoverable());
    ///
    /// let taken = TubError::NameInUse { name: "calc".to_string() };
    /// assert!(!taken.is_recoverable());
    /// ```
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_recoverable(),
            Self::Negotiation(e) => e.is_recoverable(),
            Self::RaceExhausted(_) => true,
            Self::Call(e) => matches!(
                e,
                CallError::DeadReference(_) | CallError::GiftUnavailable { .. }
            ),
            Self::Furl(_)
            | Self::Config { .. }
            | Self::NameInUse { .. }
            | Self::InvalidName { .. }
            | Self::ShutDown => false,
        }
    }
}

impl fmt::Display for TubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "transport error: {}", e),
            Self::Negotiation(e) => write!(f, "negotiation failed: {}", e),
            Self::RaceExhausted(e) => write!(f, "{}", e),
            Self::Call(e) => write!(f, "call failed: {}", e),
            Self::Furl(e) => write!(f, "invalid FURL: {}", e),
            Self::Config { reason } => write!(f, "invalid configuration: {}", reason),
            Self::NameInUse { name } => write!(f, "name '{}' is already registered", name),
            Self::InvalidName { name } => write!(f, "'{}' is not a valid object name", name),
            Self::ShutDown => write!(f, "the tub has been shut down"),
        }
    }
}

impl StdError for TubError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            Self::Negotiation(e) => Some(e),
            Self::RaceExhausted(e) => Some(e),
            Self::Call(e) => Some(e),
            Self::Furl(e) => Some(e),
            Self::Config { .. }
            | Self::NameInUse { .. }
            | Self::InvalidName { .. }
            | Self::ShutDown => None,
        }
    }
}

impl From<TransportError> for TubError {
    fn from(error: TransportError) -> Self {
        Self::Transport(error)
    }
}

impl From<NegotiationError> for TubError {
    fn from(error: NegotiationError) -> Self {
        Self::Negotiation(error)
    }
}

impl From<ConnectionRaceExhausted> for TubError {
    fn from(error: ConnectionRaceExhausted) -> Self {
        Self::RaceExhausted(error)
    }
}

impl From<CallError> for TubError {
    fn from(error: CallError) -> Self {
        Self::Call(error)
    }
}

impl From<FurlError> for TubError {
    fn from(error: FurlError) -> Self {
        Self::Furl(error)
    }
}

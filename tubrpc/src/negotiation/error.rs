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

//! Negotiation error types.

use crate::identity::{SequenceNumber, TubId, VersionRange};
use crate::negotiation::{NegotiationPhase, RejectReason};
use crate::serialization::{DeserializationError, SerializationError};
use crate::transport::TransportError;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Why a negotiation attempt failed.
///
/// Failures detected locally use the dedicated variants; a refusal sent by
/// the peer is wrapped as [`NegotiationError::Remote`] so callers can tell
/// the two apart.
#[derive(Debug, Error)]
pub enum NegotiationError {
    /// Opening or securing the transport failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Reading or writing the negotiation stream failed.
    #[error("I/O error during negotiation: {0}")]
    Io(#[from] io::Error),

    /// The peer sent a malformed preamble or negotiation message.
    #[error("protocol error: {reason}")]
    Protocol {
        /// What was wrong
        reason: String,
    },

    /// The listener refused the upgrade request.
    #[error("upgrade refused by listener: {status}")]
    UpgradeRefused {
        /// Status line sent by the listener
        status: String,
    },

    /// An inbound connection asked for a tub that does not live here.
    #[error("no tub '{requested}' at this address")]
    UnknownTub {
        /// The tub id the initiator asked for
        requested: String,
    },

    /// The peer's identity does not match the one expected.
    #[error("expected tub {expected}, but the peer is {actual}")]
    WrongPeer {
        /// Identity we wanted to reach
        expected: TubId,
        /// Identity the peer presented
        actual: TubId,
    },

    /// The peer presented our own tub id.
    #[error("refusing a connection to our own tub {0}")]
    SelfConnection(TubId),

    /// The version ranges do not intersect.
    #[error("no common protocol version: ours {ours}, theirs {theirs}")]
    VersionMismatch {
        /// Our supported range
        ours: VersionRange,
        /// The peer's supported range
        theirs: VersionRange,
    },

    /// The deadline for the whole handshake expired.
    #[error("negotiation timed out after {0:?}")]
    Timeout(Duration),

    /// The transport closed before the handshake finished.
    #[error("connection closed during {phase}")]
    ConnectionClosed {
        /// Phase in which the close was observed
        phase: NegotiationPhase,
    },

    /// The security upgrade failed.
    #[error("security upgrade failed: {reason}")]
    Security {
        /// Description of the failure
        reason: String,
    },

    /// As master, we refused the peer's offer.
    #[error("offer refused: {0}")]
    Rejected(RejectReason),

    /// The attempt lost a connection race and was dropped.
    #[error("negotiation abandoned")]
    Abandoned,

    /// An accept decision arrived after a newer connection was recorded.
    #[error("stale accept decision (sequence {seq})")]
    StaleDecision {
        /// Sequence number carried by the stale decision
        seq: SequenceNumber,
    },

    /// The peer refused our offer.
    #[error(transparent)]
    Remote(#[from] RemoteNegotiationError),
}

impl NegotiationError {
    /// Returns `true` if the attempt ran out of time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Returns `true` if the peer refused the offer.
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }

    /// Returns `true` if a later attempt could succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_recoverable(),
            Self::Io(_)
            | Self::Timeout(_)
            | Self::ConnectionClosed { .. }
            | Self::Abandoned
            | Self::StaleDecision { .. }
            | Self::Rejected(_)
            | Self::Remote(_) => true,
            Self::Protocol { .. }
            | Self::UpgradeRefused { .. }
            | Self::UnknownTub { .. }
            | Self::WrongPeer { .. }
            | Self::SelfConnection(_)
            | Self::VersionMismatch { .. }
            | Self::Security { .. } => false,
        }
    }

    /// Returns the terminal phase an attempt ending with this error reports.
    pub fn terminal_phase(&self) -> NegotiationPhase {
        match self {
            Self::Transport(_)
            | Self::Io(_)
            | Self::Timeout(_)
            | Self::ConnectionClosed { .. }
            | Self::Abandoned
            | Self::StaleDecision { .. } => NegotiationPhase::Abandoned,
            _ => NegotiationPhase::Rejected,
        }
    }

    pub(crate) fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }

    pub(crate) fn from_read(error: DeserializationError, phase: NegotiationPhase) -> Self {
        if error.is_eof() {
            Self::ConnectionClosed { phase }
        } else {
            Self::protocol(error.to_string())
        }
    }
}

impl From<SerializationError> for NegotiationError {
    fn from(error: SerializationError) -> Self {
        Self::protocol(error.to_string())
    }
}

/// The peer, acting as master, refused our offer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("peer rejected the connection: {reason}")]
pub struct RemoteNegotiationError {
    /// Reason given by the master
    pub reason: String,
    /// The master's current sequence number for this pair, if it sent one
    pub current_seq: Option<SequenceNumber>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(NegotiationError::Timeout(Duration::from_secs(1)).is_timeout());
        let remote: NegotiationError = RemoteNegotiationError {
            reason: "duplicate connection".to_string(),
            current_seq: Some(SequenceNumber::new(4)),
        }
        .into();
        assert!(remote.is_remote());
        assert!(remote.is_recoverable());
        assert_eq!(
            remote.to_string(),
            "peer rejected the connection: duplicate connection"
        );
    }

    #[test]
    fn test_terminal_phase() {
        assert_eq!(
            NegotiationError::Abandoned.terminal_phase(),
            NegotiationPhase::Abandoned
        );
        let mismatch = NegotiationError::VersionMismatch {
            ours: VersionRange::exactly(1),
            theirs: VersionRange::exactly(2),
        };
        assert_eq!(mismatch.terminal_phase(), NegotiationPhase::Rejected);
        assert!(!mismatch.is_recoverable());
    }

    #[test]
    fn test_eof_maps_to_closed() {
        let eof = DeserializationError::from_io(
            "read",
            io::Error::new(io::ErrorKind::UnexpectedEof, "eof"),
        );
        assert!(matches!(
            NegotiationError::from_read(eof, NegotiationPhase::Encrypted),
            NegotiationError::ConnectionClosed {
                phase: NegotiationPhase::Encrypted
            }
        ));
    }
}

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

//! Negotiation phases.

use std::fmt;

/// Phase of one negotiation attempt.
///
/// Every attempt walks `Start -> Plaintext -> Encrypted -> Deciding` and
/// ends in exactly one of the terminal phases. Phases are published through a
/// `tokio::sync::watch` channel so that a connection race can observe them.
///
/// Phases are ordered, so "has this attempt reached DECIDING yet" is
/// `phase >= NegotiationPhase::Deciding`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NegotiationPhase {
    /// Transport connected, nothing exchanged yet.
    Start,
    /// Exchanging the plaintext upgrade preamble.
    Plaintext,
    /// Security upgrade done; exchanging hello blocks.
    Encrypted,
    /// The master is arbitrating, or the slave awaits the decision.
    Deciding,
    /// Terminal: the connection was accepted.
    Accepted,
    /// Terminal: the attempt was dropped (abandoned, timed out or lost).
    Abandoned,
    /// Terminal: the offer was refused.
    Rejected,
}

impl NegotiationPhase {
    /// Returns `true` for `Accepted`, `Abandoned` and `Rejected`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Accepted | Self::Abandoned | Self::Rejected)
    }

    /// Returns the phase name in upper case, as it appears in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "START",
            Self::Plaintext => "PLAINTEXT",
            Self::Encrypted => "ENCRYPTED",
            Self::Deciding => "DECIDING",
            Self::Accepted => "ACCEPTED",
            Self::Abandoned => "ABANDONED",
            Self::Rejected => "REJECTED",
        }
    }
}

impl fmt::Display for NegotiationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

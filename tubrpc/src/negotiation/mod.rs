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

//! Connection negotiation.
//!
//! Turns a raw transport into an accepted, secured connection with a known
//! peer, or fails with a reason:
//!
//! - [`Negotiator`]: the handshake state machine, phases in
//!   [`NegotiationPhase`]
//! - [`messages`]: the plaintext preamble, [`Hello`] and [`Decision`]
//! - [`TransportSecurity`]: the security upgrade ([`Plaintext`], or TLS with
//!   the `tls` feature)
//! - [`DuplicateConnectionArbiter`]: the master's accept/replace/reject rules

mod arbiter;
mod error;
pub mod messages;
mod negotiator;
mod phase;
mod security;

pub use arbiter::{
    ArbiterPolicy, ArbiterSlot, DuplicateConnectionArbiter, LastKnown, NegotiationRecord, Offer,
    RejectReason, ReplaceReason, SlaveSlot, SlaveTable, Verdict, arbitrate,
};
pub use error::{NegotiationError, RemoteNegotiationError};
pub use messages::{Decision, Hello};
pub use negotiator::{
    ConnectionInfo, DEFAULT_MAX_PREAMBLE_SIZE, DEFAULT_NEGOTIATION_TIMEOUT, DecisionHold,
    Established, NegotiationContext, NegotiationHandle, Negotiator, PeerActivity, Role,
};
pub use phase::NegotiationPhase;
#[cfg(feature = "tls")]
pub use security::TlsSecurity;
pub use security::{Plaintext, Secured, TransportSecurity};

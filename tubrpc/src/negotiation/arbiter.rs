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

//! Duplicate-connection arbitration.
//!
//! When two tubs end up with more than one connection between them (both
//! dialled at once, a reconnect raced a half-open link, a decision message
//! was lost), the master decides which connection survives. The decision is
//! [`arbitrate`], a pure function of the stored [`NegotiationRecord`] and the
//! incoming [`Offer`]. [`DuplicateConnectionArbiter`] makes the
//! evaluate-then-commit step atomic per peer.
//!
//! The slave keeps the counterpart bookkeeping in [`SlaveTable`]: the last
//! sequence number the master assigned, used to build the next offer.

use crate::identity::{Incarnation, SequenceNumber, TubId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// The master's memory of the most recently accepted connection with a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiationRecord {
    /// Incarnation the peer presented, `None` for a legacy peer.
    pub incarnation: Option<Incarnation>,
    /// Sequence number assigned to that connection.
    pub seq: SequenceNumber,
    /// When the connection was accepted.
    pub accepted_at: Instant,
}

/// What a slave offers for a new connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Offer {
    /// The slave's incarnation; `None` when the peer sent no incarnation.
    pub incarnation: Option<Incarnation>,
    /// The sequence number the slave expects this connection to get.
    pub seq: SequenceNumber,
}

/// Tunables for legacy-peer handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArbiterPolicy {
    /// Accept offers without an incarnation at all.
    pub allow_legacy_peers: bool,
    /// Minimum time since the last accepted connection before a legacy offer
    /// may replace it.
    pub legacy_grace_window: Duration,
}

impl Default for ArbiterPolicy {
    fn default() -> Self {
        Self {
            allow_legacy_peers: false,
            legacy_grace_window: Duration::from_secs(60),
        }
    }
}

/// Why an accepted offer replaces an earlier connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplaceReason {
    /// The peer presented a different incarnation.
    PeerRestarted,
    /// The offer is the next sequence number of the same incarnation.
    Reconnect,
    /// A legacy peer came back after the grace window.
    LegacyAfterGrace,
}

/// Why an offer was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// The offer does not advance past the recorded sequence number.
    Duplicate,
    /// The offer skips at least one sequence number.
    UnexpectedSequence,
    /// The peer sent no incarnation and legacy peers are not admitted now.
    LegacyPeer,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Duplicate => "duplicate connection",
            Self::UnexpectedSequence => "unexpected sequence number",
            Self::LegacyPeer => "legacy peer without incarnation",
        })
    }
}

/// Outcome of [`arbitrate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// No earlier connection is known; accept with the given sequence number.
    Accept {
        /// Sequence number assigned to the new connection
        seq: SequenceNumber,
    },
    /// Accept and tear down whatever connection the record describes.
    Replace {
        /// Sequence number assigned to the new connection
        seq: SequenceNumber,
        /// Which rule matched
        reason: ReplaceReason,
    },
    /// Refuse the offer and leave any existing connection alone.
    Reject(RejectReason),
}

impl Verdict {
    /// Returns the assigned sequence number for accepting verdicts.
    pub fn accepted_seq(&self) -> Option<SequenceNumber> {
        match self {
            Self::Accept { seq } | Self::Replace { seq, .. } => Some(*seq),
            Self::Reject(_) => None,
        }
    }
}

/// Decides the fate of `offer` given the stored `record`.
///
/// Rules, first match wins:
///
/// 1. no record: accept and store the offer;
/// 2. no incarnation in the offer: reject, unless legacy peers are allowed
///    and at least `legacy_grace_window` has passed since the record;
/// 3. different incarnation: the peer restarted, accept and replace;
/// 4. `seq == known + 1`: normal reconnect, accept and replace;
/// 5. `seq <= known`: stale or duplicate, reject;
/// 6. `seq > known + 1`: gap, reject.
pub fn arbitrate(
    record: Option<&NegotiationRecord>,
    offer: &Offer,
    policy: &ArbiterPolicy,
    now: Instant,
) -> Verdict {
    let Some(record) = record else {
        return Verdict::Accept { seq: offer.seq };
    };
    let Some(offered) = offer.incarnation else {
        let elapsed = now.saturating_duration_since(record.accepted_at);
        if policy.allow_legacy_peers && elapsed >= policy.legacy_grace_window {
            return Verdict::Replace {
                seq: record.seq.next(),
                reason: ReplaceReason::LegacyAfterGrace,
            };
        }
        return Verdict::Reject(RejectReason::LegacyPeer);
    };
    if record.incarnation != Some(offered) {
        return Verdict::Replace {
            seq: offer.seq,
            reason: ReplaceReason::PeerRestarted,
        };
    }
    if offer.seq == record.seq.next() {
        Verdict::Replace {
            seq: offer.seq,
            reason: ReplaceReason::Reconnect,
        }
    } else if offer.seq <= record.seq {
        Verdict::Reject(RejectReason::Duplicate)
    } else {
        Verdict::Reject(RejectReason::UnexpectedSequence)
    }
}

type Slot<T> = Arc<AsyncMutex<Option<T>>>;

/// Master-side table of [`NegotiationRecord`]s, one per peer.
///
/// Each peer has its own async lock. A negotiation holds it from evaluating
/// the offer until the resulting connection is attached, so at most one
/// decision per peer is in flight. Records belong to one tub instance.
#[derive(Debug, Default)]
pub struct DuplicateConnectionArbiter {
    slots: Mutex<HashMap<TubId, Slot<NegotiationRecord>>>,
}

impl DuplicateConnectionArbiter {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `peer`'s record.
    pub async fn lock(&self, peer: &TubId) -> ArbiterSlot {
        let slot = Arc::clone(self.slots.lock().entry(peer.clone()).or_default());
        ArbiterSlot {
            peer: peer.clone(),
            guard: slot.lock_owned().await,
        }
    }

    /// Returns a copy of `peer`'s current record.
    ///
    /// Waits while an [`Established`](crate::negotiation::Established) for
    /// `peer` still holds its decision.
    pub async fn record(&self, peer: &TubId) -> Option<NegotiationRecord> {
        *self.lock(peer).await.guard
    }
}

/// Exclusive access to one peer's record.
#[derive(Debug)]
pub struct ArbiterSlot {
    peer: TubId,
    guard: OwnedMutexGuard<Option<NegotiationRecord>>,
}

impl ArbiterSlot {
    /// Evaluates `offer` and, if accepted, stores it as the new record.
    pub fn decide(&mut self, offer: &Offer, policy: &ArbiterPolicy, now: Instant) -> Verdict {
        let verdict = arbitrate(self.guard.as_ref(), offer, policy, now);
        if let Some(seq) = verdict.accepted_seq() {
            *self.guard = Some(NegotiationRecord {
                incarnation: offer.incarnation,
                seq,
                accepted_at: now,
            });
        }

        #[cfg(feature = "tracing")]
        tracing::info!(peer = %self.peer.short(), offer = %offer.seq, ?verdict, "arbitrated offer");

        verdict
    }

    /// Returns the sequence number of the current record.
    pub fn current_seq(&self) -> Option<SequenceNumber> {
        self.guard.as_ref().map(|r| r.seq)
    }

    /// Returns the peer this slot belongs to.
    pub fn peer(&self) -> &TubId {
        &self.peer
    }
}

/// The last connection a slave had with a master, as reported by the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastKnown {
    /// The master's incarnation at that time.
    pub incarnation: Option<Incarnation>,
    /// Sequence number the master assigned.
    pub seq: SequenceNumber,
}

/// Slave-side counterpart of [`DuplicateConnectionArbiter`].
///
/// Accept decisions are applied under the same kind of per-peer lock so that
/// two decisions for one master are applied in order.
#[derive(Debug, Default)]
pub struct SlaveTable {
    slots: Mutex<HashMap<TubId, Slot<LastKnown>>>,
}

impl SlaveTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `master`'s entry.
    pub async fn lock(&self, master: &TubId) -> SlaveSlot {
        let slot = Arc::clone(self.slots.lock().entry(master.clone()).or_default());
        SlaveSlot {
            guard: slot.lock_owned().await,
        }
    }

    /// Returns what we remember of the last connection with `master`.
    ///
    /// Waits while an [`Established`](crate::negotiation::Established) with
    /// `master` still holds its decision.
    pub async fn last_known(&self, master: &TubId) -> Option<LastKnown> {
        *self.lock(master).await.guard
    }
}

/// Exclusive access to one master's entry in the [`SlaveTable`].
#[derive(Debug)]
pub struct SlaveSlot {
    guard: OwnedMutexGuard<Option<LastKnown>>,
}

impl SlaveSlot {
    /// Records an accept decision. Returns `false` if a newer connection from
    /// the same master incarnation was already recorded.
    pub fn record_accept(&mut self, incarnation: Option<Incarnation>, seq: SequenceNumber) -> bool {
        if let Some(known) = *self.guard {
            if known.incarnation == incarnation && seq <= known.seq {
                return false;
            }
        }
        *self.guard = Some(LastKnown { incarnation, seq });
        true
    }

    /// Moves our sequence number forward to what a rejecting master reported.
    pub fn resync(&mut self, incarnation: Option<Incarnation>, current: SequenceNumber) {
        match *self.guard {
            Some(known) if known.incarnation == incarnation && known.seq >= current => {}
            _ => *self.guard = Some(LastKnown { incarnation, seq: current }),
        }
    }

    /// Returns the current entry.
    pub fn get(&self) -> Option<LastKnown> {
        *self.guard
    }
}

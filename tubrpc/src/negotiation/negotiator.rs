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

//! The connection handshake.
//!
//! A [`Negotiator`] drives one transport through
//! `START -> PLAINTEXT -> ENCRYPTED -> DECIDING` to a terminal phase, in
//! either the initiator role ([`Negotiator::initiate`]) or the listener role
//! ([`Negotiator::respond`]). The whole exchange runs under a single deadline.
//!
//! Whichever side has the larger tub id is the master: it alone consults the
//! [`DuplicateConnectionArbiter`] and sends the [`Decision`]; the slave
//! applies that decision verbatim.

use crate::identity::{
    Incarnation, SequenceNumber, TubId, VersionRange, is_master, negotiate_version,
};
use crate::negotiation::messages::{self, Decision, Hello};
use crate::negotiation::{
    ArbiterPolicy, ArbiterSlot, DuplicateConnectionArbiter, LastKnown, NegotiationError,
    NegotiationPhase, Offer, Plaintext, RejectReason, RemoteNegotiationError, SlaveSlot,
    SlaveTable, TransportSecurity, Verdict,
};
use crate::serialization::framing::{MAX_FRAME_SIZE, read_message, write_message};
use crate::serialization::JsonSerializer;
use crate::transport::BoxedTransport;
use futures_util::future::BoxFuture;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

#[cfg(feature = "tracing")]
use tracing::debug;

/// Default deadline for one handshake.
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Default cap on the plaintext preamble.
pub const DEFAULT_MAX_PREAMBLE_SIZE: usize = 4 * 1024;

/// Observes which peers have a negotiation in progress.
///
/// A connection race uses this to tell "every attempt failed" apart from
/// "our attempts lost to a connection the peer is still completing".
pub trait PeerActivity: Send + Sync {
    /// A negotiation with `peer` has identified it.
    fn negotiation_started(&self, peer: &TubId);

    /// That negotiation ended; for accepted connections this happens after
    /// the connection was attached.
    fn negotiation_finished(&self, peer: &TubId);

    /// Resolves once no outbound attempt of ours to `peer` is running.
    ///
    /// A master arbitrates offers on connections the peer opened only after
    /// this resolves, so its own connection wins a simultaneous connect.
    fn outbound_settled(&self, _peer: &TubId) -> BoxFuture<'static, ()> {
        Box::pin(std::future::ready(()))
    }
}

struct ActivityGuard {
    activity: Arc<dyn PeerActivity>,
    peer: TubId,
}

impl ActivityGuard {
    fn new(activity: &Arc<dyn PeerActivity>, peer: &TubId) -> Self {
        activity.negotiation_started(peer);
        Self {
            activity: Arc::clone(activity),
            peer: peer.clone(),
        }
    }
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        self.activity.negotiation_finished(&self.peer);
    }
}

/// State shared by every negotiation of one tub.
///
/// Settings are public fields in the manner of a config struct; the arbiter
/// and slave tables belong to this tub only.
pub struct NegotiationContext {
    /// Our tub id.
    pub local_id: TubId,
    /// Our incarnation.
    pub incarnation: Incarnation,
    /// Protocol versions we speak.
    pub versions: VersionRange,
    /// Deadline for one whole handshake.
    pub timeout: Duration,
    /// Cap on hello and decision frames.
    pub max_frame_size: u32,
    /// Cap on the plaintext preamble.
    pub max_preamble_size: usize,
    /// Legacy-peer policy.
    pub policy: ArbiterPolicy,
    /// Security upgrade.
    pub security: Arc<dyn TransportSecurity>,
    /// Master-side records.
    pub arbiter: DuplicateConnectionArbiter,
    /// Slave-side records.
    pub slave_table: SlaveTable,
    /// Optional in-progress tracking.
    pub activity: Option<Arc<dyn PeerActivity>>,
}

impl NegotiationContext {
    /// Creates a context with default settings and plaintext security.
    pub fn new(local_id: TubId, incarnation: Incarnation) -> Self {
        Self {
            local_id,
            incarnation,
            versions: VersionRange::default(),
            timeout: DEFAULT_NEGOTIATION_TIMEOUT,
            max_frame_size: MAX_FRAME_SIZE,
            max_preamble_size: DEFAULT_MAX_PREAMBLE_SIZE,
            policy: ArbiterPolicy::default(),
            security: Arc::new(Plaintext),
            arbiter: DuplicateConnectionArbiter::new(),
            slave_table: SlaveTable::new(),
            activity: None,
        }
    }

    /// Sets the supported version range.
    pub fn with_versions(mut self, versions: VersionRange) -> Self {
        self.versions = versions;
        self
    }

    /// Sets the handshake deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the frame and preamble caps.
    pub fn with_limits(mut self, max_frame_size: u32, max_preamble_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self.max_preamble_size = max_preamble_size;
        self
    }

    /// Sets the legacy-peer policy.
    pub fn with_policy(mut self, policy: ArbiterPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets the security upgrade.
    pub fn with_security(mut self, security: Arc<dyn TransportSecurity>) -> Self {
        self.security = security;
        self
    }

    /// Sets the in-progress tracker.
    pub fn with_activity(mut self, activity: Arc<dyn PeerActivity>) -> Self {
        self.activity = Some(activity);
        self
    }
}

impl std::fmt::Debug for NegotiationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegotiationContext")
            .field("local_id", &self.local_id)
            .field("incarnation", &self.incarnation)
            .field("versions", &self.versions)
            .field("timeout", &self.timeout)
            .field("security", &self.security.name())
            .finish()
    }
}

/// Which side of the pair made the decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// We arbitrated.
    Master,
    /// We applied the peer's decision.
    Slave,
}

/// Facts about an accepted connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// The peer's tub id.
    pub peer: TubId,
    /// The peer's incarnation, `None` for legacy peers.
    pub peer_incarnation: Option<Incarnation>,
    /// Agreed protocol version.
    pub version: u32,
    /// Sequence number assigned by the master.
    pub seq: SequenceNumber,
    /// Our role.
    pub role: Role,
    /// `true` if we opened the transport.
    pub initiated: bool,
    /// The master's verdict, when we were master.
    pub verdict: Option<Verdict>,
}

enum DecisionLock {
    Master(#[allow(dead_code)] ArbiterSlot),
    Slave(#[allow(dead_code)] SlaveSlot),
}

/// Locks held from the decision until the connection is attached.
///
/// Dropping it lets the next decision for the same peer proceed and marks
/// the negotiation finished, in that order.
pub struct DecisionHold {
    lock: Option<DecisionLock>,
    activity: Option<ActivityGuard>,
}

impl DecisionHold {
    /// Releases the locks.
    pub fn release(self) {}
}

impl std::fmt::Debug for DecisionHold {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionHold")
            .field("locked", &self.lock.is_some())
            .field("tracked", &self.activity.is_some())
            .finish()
    }
}

/// A transport that completed the handshake and was accepted.
pub struct Established {
    /// Connection facts.
    pub info: ConnectionInfo,
    /// The secured transport, positioned after the decision.
    pub transport: BoxedTransport,
    /// Held until the caller has attached the connection.
    pub hold: DecisionHold,
}

impl std::fmt::Debug for Established {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Established")
            .field("info", &self.info)
            .field("transport", self.transport.metadata())
            .finish()
    }
}

/// Observes and controls a running [`Negotiator`].
#[derive(Debug)]
pub struct NegotiationHandle {
    phase: watch::Receiver<NegotiationPhase>,
    abandon: watch::Sender<bool>,
}

impl NegotiationHandle {
    /// Returns the current phase.
    pub fn phase(&self) -> NegotiationPhase {
        *self.phase.borrow()
    }

    /// Returns a receiver of phase events.
    pub fn subscribe(&self) -> watch::Receiver<NegotiationPhase> {
        self.phase.clone()
    }

    /// Asks the negotiator to give up.
    ///
    /// Before DECIDING the negotiator stops at its next step and drops the
    /// transport without sending anything. Once DECIDING it finishes
    /// normally; the caller is expected to discard that result. Returns the
    /// phase observed when the request was made.
    pub fn abandon(&self) -> NegotiationPhase {
        self.abandon.send_replace(true);
        self.phase()
    }
}

/// Runs one handshake.
pub struct Negotiator {
    ctx: Arc<NegotiationContext>,
    label: String,
    peer: Option<TubId>,
    last_known: Option<Option<LastKnown>>,
    phase: watch::Sender<NegotiationPhase>,
    abandon: watch::Receiver<bool>,
}

impl Negotiator {
    /// Creates a negotiator; `label` names the hint or listener in logs.
    pub fn new(ctx: Arc<NegotiationContext>, label: impl Into<String>) -> (Self, NegotiationHandle) {
        let (phase_tx, phase_rx) = watch::channel(NegotiationPhase::Start);
        let (abandon_tx, abandon_rx) = watch::channel(false);
        let negotiator = Self {
            ctx,
            label: label.into(),
            peer: None,
            last_known: None,
            phase: phase_tx,
            abandon: abandon_rx,
        };
        let handle = NegotiationHandle {
            phase: phase_rx,
            abandon: abandon_tx,
        };
        (negotiator, handle)
    }

    /// Fixes what a slave initiator reports as its last known connection,
    /// instead of reading it when the hello is sent. Attempts of one race
    /// share a snapshot so that a loser cannot offer the winner's successor.
    #[must_use]
    pub fn with_last_known(mut self, last_known: Option<LastKnown>) -> Self {
        self.last_known = Some(last_known);
        self
    }

    /// Runs the initiator role over a freshly opened transport to `target`.
    ///
    /// # Errors
    ///
    /// Returns the reason the attempt did not reach ACCEPTED. A refusal sent
    /// by the master is [`NegotiationError::Remote`].
    pub async fn initiate(
        self,
        transport: BoxedTransport,
        target: &TubId,
    ) -> Result<Established, NegotiationError> {
        let deadline = tokio::time::Instant::now() + self.ctx.timeout;
        self.initiate_until(transport, target, deadline).await
    }

    /// Like [`initiate`](Self::initiate), but under a deadline that started
    /// earlier, typically before the transport was opened.
    ///
    /// # Errors
    ///
    /// Returns the reason the attempt did not reach ACCEPTED, or
    /// [`NegotiationError::Timeout`] once `deadline` passes.
    pub async fn initiate_until(
        mut self,
        transport: BoxedTransport,
        target: &TubId,
        deadline: tokio::time::Instant,
    ) -> Result<Established, NegotiationError> {
        self.peer = Some(target.clone());
        let limit = self.ctx.timeout;
        let result =
            match tokio::time::timeout_at(deadline, self.run_initiator(transport, target)).await {
                Ok(result) => result,
                Err(_) => Err(NegotiationError::Timeout(limit)),
            };
        self.finish(result)
    }

    /// Runs the listener role over an accepted transport.
    ///
    /// # Errors
    ///
    /// Returns the reason the attempt did not reach ACCEPTED.
    pub async fn respond(mut self, transport: BoxedTransport) -> Result<Established, NegotiationError> {
        let deadline = self.ctx.timeout;
        let result = match tokio::time::timeout(deadline, self.run_listener(transport)).await {
            Ok(result) => result,
            Err(_) => Err(NegotiationError::Timeout(deadline)),
        };
        self.finish(result)
    }

    async fn run_initiator(
        &mut self,
        mut transport: BoxedTransport,
        target: &TubId,
    ) -> Result<Established, NegotiationError> {
        let ctx = Arc::clone(&self.ctx);
        if *target == ctx.local_id {
            return Err(NegotiationError::SelfConnection(target.clone()));
        }

        self.enter(NegotiationPhase::Plaintext);
        self.interruptible(async {
            messages::write_request(&mut transport, target).await?;
            messages::read_response(&mut transport, ctx.max_preamble_size).await
        })
        .await?;

        let secured = self
            .interruptible(ctx.security.secure_outbound(transport, target))
            .await?;
        if let Some(proven) = secured.authenticated_peer.as_ref().filter(|p| *p != target) {
            return Err(NegotiationError::WrongPeer {
                expected: target.clone(),
                actual: proven.clone(),
            });
        }
        self.enter(NegotiationPhase::Encrypted);

        let mut transport = secured.transport;
        let last_known = if is_master(&ctx.local_id, target) {
            None
        } else if let Some(snapshot) = self.last_known.take() {
            snapshot
        } else {
            ctx.slave_table.last_known(target).await
        };
        let ours = Hello::new(ctx.local_id.clone(), ctx.incarnation, ctx.versions, last_known);
        let theirs: Hello = self
            .interruptible(async {
                send(&mut transport, &ours, ctx.max_frame_size, NegotiationPhase::Encrypted).await?;
                receive(&mut transport, ctx.max_frame_size, NegotiationPhase::Encrypted).await
            })
            .await?;
        if theirs.tub_id != *target {
            return Err(NegotiationError::WrongPeer {
                expected: target.clone(),
                actual: theirs.tub_id,
            });
        }

        self.decide(transport, theirs, true).await
    }

    async fn run_listener(&mut self, mut transport: BoxedTransport) -> Result<Established, NegotiationError> {
        let ctx = Arc::clone(&self.ctx);

        self.enter(NegotiationPhase::Plaintext);
        let requested = messages::read_request(&mut transport, ctx.max_preamble_size).await?;
        if requested != ctx.local_id.as_str() {
            messages::write_refusal(&mut transport).await?;
            return Err(NegotiationError::UnknownTub { requested });
        }
        messages::write_switching(&mut transport).await?;

        let secured = ctx.security.secure_inbound(transport).await?;
        self.enter(NegotiationPhase::Encrypted);

        let mut transport = secured.transport;
        let theirs: Hello =
            receive(&mut transport, ctx.max_frame_size, NegotiationPhase::Encrypted).await?;
        if theirs.tub_id == ctx.local_id {
            return Err(NegotiationError::SelfConnection(theirs.tub_id));
        }
        if let Some(proven) = secured.authenticated_peer {
            if proven != theirs.tub_id {
                return Err(NegotiationError::WrongPeer {
                    expected: proven,
                    actual: theirs.tub_id,
                });
            }
        }
        self.peer = Some(theirs.tub_id.clone());

        let last_known = if is_master(&ctx.local_id, &theirs.tub_id) {
            None
        } else {
            ctx.slave_table.last_known(&theirs.tub_id).await
        };
        let ours = Hello::new(ctx.local_id.clone(), ctx.incarnation, ctx.versions, last_known);
        send(&mut transport, &ours, ctx.max_frame_size, NegotiationPhase::Encrypted).await?;

        self.decide(transport, theirs, false).await
    }

    /// DECIDING: no longer interruptible.
    async fn decide(
        &mut self,
        mut transport: BoxedTransport,
        theirs: Hello,
        initiated: bool,
    ) -> Result<Established, NegotiationError> {
        let ctx = Arc::clone(&self.ctx);
        let peer = theirs.tub_id.clone();
        let activity = ctx.activity.as_ref().map(|a| ActivityGuard::new(a, &peer));
        let their_versions = theirs.versions()?;
        let version = negotiate_version(ctx.versions, their_versions);
        let mismatch = || NegotiationError::VersionMismatch {
            ours: ctx.versions,
            theirs: their_versions,
        };

        self.enter(NegotiationPhase::Deciding);

        if is_master(&ctx.local_id, &peer) {
            let Some(version) = version else {
                let decision = Decision::reject("no common protocol version", None);
                // Best effort; the slave detects the mismatch by itself.
                let _ = send(&mut transport, &decision, ctx.max_frame_size, NegotiationPhase::Deciding).await;
                return Err(mismatch());
            };

            let offer = Offer {
                incarnation: theirs.incarnation,
                seq: theirs.offered_seq(),
            };
            if !initiated {
                if let Some(activity) = &ctx.activity {
                    activity.outbound_settled(&peer).await;
                }
            }
            let mut slot = ctx.arbiter.lock(&peer).await;
            if *self.abandon.borrow() {
                // Our race already has a winner; answer instead of leaving
                // the slave waiting.
                let decision = Decision::reject(RejectReason::Duplicate.to_string(), slot.current_seq());
                let _ = send(&mut transport, &decision, ctx.max_frame_size, NegotiationPhase::Deciding).await;
                return Err(NegotiationError::Abandoned);
            }
            let verdict = slot.decide(&offer, &ctx.policy, Instant::now());
            match verdict {
                Verdict::Accept { seq } | Verdict::Replace { seq, .. } => {
                    send(
                        &mut transport,
                        &Decision::accept(version, seq),
                        ctx.max_frame_size,
                        NegotiationPhase::Deciding,
                    )
                    .await?;
                    Ok(Established {
                        info: ConnectionInfo {
                            peer,
                            peer_incarnation: theirs.incarnation,
                            version,
                            seq,
                            role: Role::Master,
                            initiated,
                            verdict: Some(verdict),
                        },
                        transport,
                        hold: DecisionHold {
                            lock: Some(DecisionLock::Master(slot)),
                            activity,
                        },
                    })
                }
                Verdict::Reject(reason) => {
                    let decision = Decision::reject(reason.to_string(), slot.current_seq());
                    send(&mut transport, &decision, ctx.max_frame_size, NegotiationPhase::Deciding)
                        .await?;
                    Err(NegotiationError::Rejected(reason))
                }
            }
        } else {
            if version.is_none() {
                return Err(mismatch());
            }
            let decision: Decision =
                receive(&mut transport, ctx.max_frame_size, NegotiationPhase::Deciding).await?;
            let master_incarnation = theirs.incarnation;
            let mut slot = ctx.slave_table.lock(&peer).await;

            if !decision.accepted {
                if let Some(current) = decision.seq {
                    slot.resync(master_incarnation, current);
                }
                return Err(RemoteNegotiationError {
                    reason: decision
                        .reason
                        .unwrap_or_else(|| "no reason given".to_string()),
                    current_seq: decision.seq,
                }
                .into());
            }

            let (Some(version), Some(seq)) = (decision.version, decision.seq) else {
                return Err(NegotiationError::protocol(
                    "accept decision lacks version or sequence number",
                ));
            };
            if !ctx.versions.contains(version) || !their_versions.contains(version) {
                return Err(NegotiationError::protocol(format!(
                    "master chose version {} outside the common range",
                    version
                )));
            }
            if !slot.record_accept(master_incarnation, seq) {
                return Err(NegotiationError::StaleDecision { seq });
            }

            Ok(Established {
                info: ConnectionInfo {
                    peer,
                    peer_incarnation: master_incarnation,
                    version,
                    seq,
                    role: Role::Slave,
                    initiated,
                    verdict: None,
                },
                transport,
                hold: DecisionHold {
                    lock: Some(DecisionLock::Slave(slot)),
                    activity,
                },
            })
        }
    }

    /// Runs `fut` unless the handle asks to abandon first.
    async fn interruptible<F, T>(&self, fut: F) -> Result<T, NegotiationError>
    where
        F: Future<Output = Result<T, NegotiationError>>,
    {
        let mut abandon = self.abandon.clone();
        tokio::select! {
            biased;
            _ = abandoned(&mut abandon) => Err(NegotiationError::Abandoned),
            result = fut => result,
        }
    }

    fn enter(&mut self, phase: NegotiationPhase) {
        self.phase.send_replace(phase);

        #[cfg(feature = "tracing")]
        debug!(
            local = %self.ctx.local_id.short(),
            peer = self.peer.as_ref().map(|p| p.short()).unwrap_or("?"),
            hint = %self.label,
            %phase,
            "negotiation phase"
        );
    }

    fn finish(
        &mut self,
        result: Result<Established, NegotiationError>,
    ) -> Result<Established, NegotiationError> {
        match &result {
            Ok(_) => self.enter(NegotiationPhase::Accepted),
            Err(error) => {
                #[cfg(feature = "tracing")]
                debug!(hint = %self.label, %error, "negotiation failed");
                self.enter(error.terminal_phase());
            }
        }
        result
    }
}

/// Resolves once abandonment is requested. A dropped handle never abandons.
async fn abandoned(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|flag| *flag).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn send<T: Serialize>(
    transport: &mut BoxedTransport,
    message: &T,
    max_frame_size: u32,
    phase: NegotiationPhase,
) -> Result<(), NegotiationError> {
    write_message(transport, &JsonSerializer, message, max_frame_size)
        .await
        .map_err(|e| {
            if e.is_io() {
                NegotiationError::ConnectionClosed { phase }
            } else {
                e.into()
            }
        })
}

async fn receive<T: serde::de::DeserializeOwned>(
    transport: &mut BoxedTransport,
    max_frame_size: u32,
    phase: NegotiationPhase,
) -> Result<T, NegotiationError> {
    read_message(transport, &JsonSerializer, max_frame_size)
        .await
        .map_err(|e| NegotiationError::from_read(e, phase))
}

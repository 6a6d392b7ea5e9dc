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

//! Handshake tests over in-memory transports.
//!
//! These drive [`Negotiator`] directly, one initiator against one listener,
//! and check the decisions the master makes across reconnects, restarts and
//! malformed offers.

use std::sync::Arc;
use std::time::Duration;
use tubrpc::identity::{Incarnation, SequenceNumber, TubId, VersionRange};
use tubrpc::negotiation::{
    Established, LastKnown, NegotiationContext, NegotiationError, NegotiationPhase, Negotiator,
    RejectReason, ReplaceReason, Role, Verdict,
};
use tubrpc::transport::MemoryTransport;

type Outcome = Result<Established, NegotiationError>;

/// Returns `(slave, master)` ids.
fn ids() -> (TubId, TubId) {
    let a = TubId::generate();
    let b = TubId::generate();
    if a < b { (a, b) } else { (b, a) }
}

fn context(id: &TubId) -> Arc<NegotiationContext> {
    Arc::new(NegotiationContext::new(id.clone(), Incarnation::generate()))
}

/// Runs one handshake in which `initiator` dials `listener`.
async fn handshake(
    initiator: Negotiator,
    listener: &Arc<NegotiationContext>,
    target: &TubId,
) -> (Outcome, Outcome) {
    let (a, b) = MemoryTransport::pair_default();
    let (responder, _) = Negotiator::new(Arc::clone(listener), "listener");
    let inbound = tokio::spawn(async move { responder.respond(Box::new(b)).await });
    let outbound = initiator.initiate(Box::new(a), target).await;
    (outbound, inbound.await.unwrap())
}

async fn dial(from: &Arc<NegotiationContext>, to: &Arc<NegotiationContext>) -> (Outcome, Outcome) {
    let (initiator, _) = Negotiator::new(Arc::clone(from), "test");
    handshake(initiator, to, &to.local_id).await
}

/// Successive connections from the same incarnation get consecutive
/// sequence numbers and each one replaces the last.
#[tokio::test]
async fn test_reconnect_increments_sequence() {
    let (small, large) = ids();
    let slave = context(&small);
    let master = context(&large);

    let (outbound, inbound) = dial(&slave, &master).await;
    let (outbound, inbound) = (outbound.unwrap(), inbound.unwrap());
    assert_eq!(outbound.info.role, Role::Slave);
    assert_eq!(inbound.info.role, Role::Master);
    assert_eq!(outbound.info.seq, SequenceNumber::FIRST);
    assert_eq!(
        inbound.info.verdict,
        Some(Verdict::Accept {
            seq: SequenceNumber::FIRST
        })
    );
    drop((outbound, inbound));

    let (outbound, inbound) = dial(&slave, &master).await;
    let (outbound, inbound) = (outbound.unwrap(), inbound.unwrap());
    assert_eq!(outbound.info.seq, SequenceNumber::new(2));
    assert_eq!(
        inbound.info.verdict,
        Some(Verdict::Replace {
            seq: SequenceNumber::new(2),
            reason: ReplaceReason::Reconnect,
        })
    );
}

/// A restarted slave starts over at the first sequence number and the
/// master replaces the old connection because the incarnation changed.
#[tokio::test]
async fn test_restarted_peer_replaces_old_connection() {
    let (small, large) = ids();
    let master = context(&large);

    let before = context(&small);
    for _ in 0..3 {
        let (outbound, inbound) = dial(&before, &master).await;
        outbound.unwrap();
        inbound.unwrap();
    }
    assert_eq!(
        master.arbiter.record(&small).await.unwrap().seq,
        SequenceNumber::new(3)
    );

    let after = context(&small);
    let (outbound, inbound) = dial(&after, &master).await;
    let (outbound, inbound) = (outbound.unwrap(), inbound.unwrap());
    assert_eq!(outbound.info.seq, SequenceNumber::FIRST);
    assert_eq!(
        inbound.info.verdict,
        Some(Verdict::Replace {
            seq: SequenceNumber::FIRST,
            reason: ReplaceReason::PeerRestarted,
        })
    );
    // The record stays locked until both ends let go of their decision.
    drop((outbound, inbound));
    let record = master.arbiter.record(&small).await.unwrap();
    assert_eq!(record.incarnation, Some(after.incarnation));
}

/// A slave that skips a sequence number is refused and the master keeps
/// its record.
#[tokio::test]
async fn test_sequence_gap_is_rejected() {
    let (small, large) = ids();
    let slave = context(&small);
    let master = context(&large);

    let (outbound, inbound) = dial(&slave, &master).await;
    outbound.unwrap();
    inbound.unwrap();

    // Claim seq 2 was accepted, so seq 3 is offered while the master holds 1.
    let (initiator, _) = Negotiator::new(Arc::clone(&slave), "gap");
    let initiator = initiator.with_last_known(Some(LastKnown {
        incarnation: Some(master.incarnation),
        seq: SequenceNumber::new(2),
    }));
    let (outbound, inbound) = handshake(initiator, &master, &large).await;
    assert!(matches!(
        inbound,
        Err(NegotiationError::Rejected(RejectReason::UnexpectedSequence))
    ));
    match outbound {
        Err(NegotiationError::Remote(remote)) => {
            assert_eq!(remote.current_seq, Some(SequenceNumber::FIRST));
            assert!(remote.reason.contains("unexpected sequence"));
        }
        other => panic!("expected a remote rejection, got {:?}", other),
    }
    assert_eq!(
        master.arbiter.record(&small).await.unwrap().seq,
        SequenceNumber::FIRST
    );
}

/// A slave that lost its table offers a stale number, learns the master's
/// current one from the refusal and succeeds on the next try.
#[tokio::test]
async fn test_rejection_resyncs_the_slave() {
    let (small, large) = ids();
    let master = context(&large);
    let slave = context(&small);
    for _ in 0..3 {
        let (outbound, inbound) = dial(&slave, &master).await;
        outbound.unwrap();
        inbound.unwrap();
    }

    let forgetful = Arc::new(NegotiationContext::new(small.clone(), slave.incarnation));
    let (outbound, inbound) = dial(&forgetful, &master).await;
    assert!(matches!(
        inbound,
        Err(NegotiationError::Rejected(RejectReason::Duplicate))
    ));
    assert_eq!(
        outbound.unwrap_err().to_string(),
        "peer rejected the connection: duplicate connection"
    );
    assert_eq!(
        forgetful.slave_table.last_known(&large).await.map(|k| k.seq),
        Some(SequenceNumber::new(3))
    );

    let (outbound, inbound) = dial(&forgetful, &master).await;
    assert_eq!(outbound.unwrap().info.seq, SequenceNumber::new(4));
    assert!(matches!(
        inbound.unwrap().info.verdict,
        Some(Verdict::Replace {
            reason: ReplaceReason::Reconnect,
            ..
        })
    ));
}

/// Replaying an already-accepted sequence number is a duplicate.
#[tokio::test]
async fn test_stale_offer_is_duplicate() {
    let (small, large) = ids();
    let slave = context(&small);
    let master = context(&large);
    for _ in 0..2 {
        let (outbound, inbound) = dial(&slave, &master).await;
        outbound.unwrap();
        inbound.unwrap();
    }

    let (initiator, _) = Negotiator::new(Arc::clone(&slave), "stale");
    let initiator = initiator.with_last_known(None);
    let (outbound, inbound) = handshake(initiator, &master, &large).await;
    assert!(matches!(
        inbound,
        Err(NegotiationError::Rejected(RejectReason::Duplicate))
    ));
    assert!(outbound.unwrap_err().is_remote());
}

/// Disjoint version ranges fail on both sides.
#[tokio::test]
async fn test_version_mismatch() {
    let (small, large) = ids();
    let slave = Arc::new(
        NegotiationContext::new(small.clone(), Incarnation::generate())
            .with_versions(VersionRange::exactly(1)),
    );
    let master = Arc::new(
        NegotiationContext::new(large.clone(), Incarnation::generate())
            .with_versions(VersionRange::exactly(2)),
    );

    let (outbound, inbound) = dial(&slave, &master).await;
    assert!(matches!(outbound, Err(NegotiationError::VersionMismatch { .. })));
    assert!(matches!(inbound, Err(NegotiationError::VersionMismatch { .. })));
    assert!(master.arbiter.record(&small).await.is_none());
}

/// The master dialing the slave works the same way, with roles swapped.
#[tokio::test]
async fn test_master_initiated_connection() {
    let (small, large) = ids();
    let slave = context(&small);
    let master = context(&large);

    let (outbound, inbound) = dial(&master, &slave).await;
    let (outbound, inbound) = (outbound.unwrap(), inbound.unwrap());
    assert_eq!(outbound.info.role, Role::Master);
    assert_eq!(inbound.info.role, Role::Slave);
    assert_eq!(inbound.info.seq, outbound.info.seq);
    drop((outbound, inbound));

    assert_eq!(
        slave.slave_table.last_known(&large).await.map(|k| k.seq),
        Some(SequenceNumber::FIRST)
    );
}

/// The whole handshake has one deadline, not one per step.
#[tokio::test]
async fn test_single_deadline() {
    let (small, large) = ids();
    let slave = Arc::new(
        NegotiationContext::new(small, Incarnation::generate())
            .with_timeout(Duration::from_millis(100)),
    );
    let (a, _b) = MemoryTransport::pair_default();
    let (initiator, handle) = Negotiator::new(slave, "silent");

    let started = std::time::Instant::now();
    let error = initiator.initiate(Box::new(a), &large).await.unwrap_err();
    assert!(error.is_timeout());
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(handle.phase(), NegotiationPhase::Abandoned);
}

/// A listener refuses requests for a tub it does not host.
#[tokio::test]
async fn test_unknown_tub_is_refused() {
    let (small, large) = ids();
    let slave = context(&small);
    let master = context(&large);
    let elsewhere = TubId::generate();

    let (initiator, _) = Negotiator::new(Arc::clone(&slave), "wrong");
    let (outbound, inbound) = handshake(initiator, &master, &elsewhere).await;
    assert!(matches!(outbound, Err(NegotiationError::UpgradeRefused { .. })));
    assert!(matches!(inbound, Err(NegotiationError::UnknownTub { .. })));
}

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

//! Property tests for the duplicate-connection rules.
//!
//! Every row of the arbitration table is checked against arbitrary records
//! and offers, and the per-peer lock is checked to commit exactly one of
//! several identical concurrent offers.

use proptest::prelude::*;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tubrpc::identity::{Incarnation, SequenceNumber, TubId};
use tubrpc::negotiation::{
    ArbiterPolicy, DuplicateConnectionArbiter, NegotiationRecord, Offer, RejectReason,
    ReplaceReason, Verdict, arbitrate,
};

fn record(incarnation: u128, seq: u64, age: Duration, now: Instant) -> NegotiationRecord {
    NegotiationRecord {
        incarnation: Some(Incarnation::from_u128(incarnation)),
        seq: SequenceNumber::new(seq),
        accepted_at: now.checked_sub(age).unwrap_or(now),
    }
}

fn offer(incarnation: u128, seq: u64) -> Offer {
    Offer {
        incarnation: Some(Incarnation::from_u128(incarnation)),
        seq: SequenceNumber::new(seq),
    }
}

proptest! {
    #[test]
    fn no_record_accepts_the_offer(incarnation in any::<u128>(), seq in 1u64..1_000_000) {
        let verdict = arbitrate(None, &offer(incarnation, seq), &ArbiterPolicy::default(), Instant::now());
        prop_assert_eq!(verdict, Verdict::Accept { seq: SequenceNumber::new(seq) });
    }

    #[test]
    fn new_incarnation_replaces(
        known in any::<u128>(),
        offered in any::<u128>(),
        known_seq in 1u64..1_000_000,
        offered_seq in 1u64..1_000_000,
    ) {
        prop_assume!(known != offered);
        let now = Instant::now();
        let existing = record(known, known_seq, Duration::ZERO, now);
        let verdict = arbitrate(Some(&existing), &offer(offered, offered_seq), &ArbiterPolicy::default(), now);
        prop_assert_eq!(verdict, Verdict::Replace {
            seq: SequenceNumber::new(offered_seq),
            reason: ReplaceReason::PeerRestarted,
        });
    }

    #[test]
    fn same_incarnation_follows_the_sequence(
        incarnation in any::<u128>(),
        known_seq in 1u64..1_000_000,
        offered_seq in 1u64..1_000_010,
    ) {
        let now = Instant::now();
        let existing = record(incarnation, known_seq, Duration::ZERO, now);
        let verdict = arbitrate(Some(&existing), &offer(incarnation, offered_seq), &ArbiterPolicy::default(), now);
        let expected = if offered_seq == known_seq + 1 {
            Verdict::Replace { seq: SequenceNumber::new(offered_seq), reason: ReplaceReason::Reconnect }
        } else if offered_seq <= known_seq {
            Verdict::Reject(RejectReason::Duplicate)
        } else {
            Verdict::Reject(RejectReason::UnexpectedSequence)
        };
        prop_assert_eq!(verdict, expected);
    }

    #[test]
    fn legacy_offers_need_the_flag_and_the_grace_window(
        incarnation in any::<u128>(),
        known_seq in 1u64..1_000_000,
        allowed in any::<bool>(),
        age_secs in 0u64..120,
        window_secs in 0u64..120,
    ) {
        let now = Instant::now();
        let existing = record(incarnation, known_seq, Duration::from_secs(age_secs), now);
        // Instant cannot always reach back that far on a fresh host.
        prop_assume!(existing.accepted_at + Duration::from_secs(age_secs) == now);
        let policy = ArbiterPolicy {
            allow_legacy_peers: allowed,
            legacy_grace_window: Duration::from_secs(window_secs),
        };
        let legacy = Offer { incarnation: None, seq: SequenceNumber::new(known_seq + 1) };
        let verdict = arbitrate(Some(&existing), &legacy, &policy, now);
        if allowed && age_secs >= window_secs {
            prop_assert_eq!(verdict, Verdict::Replace {
                seq: SequenceNumber::new(known_seq + 1),
                reason: ReplaceReason::LegacyAfterGrace,
            });
        } else {
            prop_assert_eq!(verdict, Verdict::Reject(RejectReason::LegacyPeer));
        }
    }

    #[test]
    fn rejections_never_change_the_record(
        incarnation in any::<u128>(),
        known_seq in 2u64..1_000,
        offered_seq in 1u64..1_000,
    ) {
        prop_assume!(offered_seq != known_seq + 1);
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        runtime.block_on(async {
            let arbiter = DuplicateConnectionArbiter::new();
            let peer = TubId::generate();
            let now = Instant::now();
            let policy = ArbiterPolicy::default();
            arbiter.lock(&peer).await.decide(&offer(incarnation, known_seq), &policy, now);

            let verdict = arbiter.lock(&peer).await.decide(&offer(incarnation, offered_seq), &policy, now);
            assert!(matches!(verdict, Verdict::Reject(_)));
            let stored = arbiter.record(&peer).await.unwrap();
            assert_eq!(stored.seq, SequenceNumber::new(known_seq));
        });
    }
}

#[test]
fn test_gap_of_two_is_rejected() {
    let now = Instant::now();
    let existing = record(7, 5, Duration::ZERO, now);
    let verdict = arbitrate(Some(&existing), &offer(7, 7), &ArbiterPolicy::default(), now);
    assert_eq!(verdict, Verdict::Reject(RejectReason::UnexpectedSequence));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_identical_offers_commit_once() {
    let arbiter = Arc::new(DuplicateConnectionArbiter::new());
    let peer = TubId::generate();
    let policy = ArbiterPolicy::default();
    arbiter
        .lock(&peer)
        .await
        .decide(&offer(1, 1), &policy, Instant::now());

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let arbiter = Arc::clone(&arbiter);
        let peer = peer.clone();
        tasks.push(tokio::spawn(async move {
            let mut slot = arbiter.lock(&peer).await;
            tokio::task::yield_now().await;
            slot.decide(&offer(1, 2), &policy, Instant::now())
        }));
    }

    let mut accepted = 0;
    for task in tasks {
        match task.await.unwrap() {
            Verdict::Replace { reason, .. } => {
                assert_eq!(reason, ReplaceReason::Reconnect);
                accepted += 1;
            }
            Verdict::Reject(reason) => assert_eq!(reason, RejectReason::Duplicate),
            Verdict::Accept { .. } => panic!("a record exists"),
        }
    }
    assert_eq!(accepted, 1);
    assert_eq!(arbiter.record(&peer).await.unwrap().seq, SequenceNumber::new(2));
}

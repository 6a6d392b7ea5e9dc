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

//! Connection races between Tubs on an in-memory network.
//!
//! Covers hint racing, per-hint failure reports, sharing one connection
//! among concurrent lookups, and two Tubs dialing each other at once.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tubrpc::broker::{Failure, Referenceable, Value};
use tubrpc::identity::{Furl, LocationHint, SequenceNumber, TubId};
use tubrpc::negotiation::{NegotiationError, NegotiationPhase, Role};
use tubrpc::transport::{BoxedTransport, Connector, HintResolver, MemoryNetwork, TransportError};
use tubrpc::tub::{HintOutcome, Tub, TubConfig};
use tubrpc::TubError;

struct Echo;

#[async_trait]
impl Referenceable for Echo {
    async fn remote_call(&self, method: &str, args: Vec<Value>) -> Result<Value, Failure> {
        match method {
            "echo" => Ok(args.into_iter().next().unwrap_or(Value::None)),
            _ => Err(Failure::no_such_method(method)),
        }
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn tub(network: &MemoryNetwork) -> Tub {
    Tub::new(TubConfig::new().with_resolver(Arc::new(network.clone()))).unwrap()
}

fn serve(network: &MemoryNetwork, name: &str) -> (Tub, Furl) {
    let server = tub(network);
    server
        .listen(network.bind(name).unwrap(), LocationHint::memory(name))
        .unwrap();
    let furl = server.register(Arc::new(Echo), Some("echo")).unwrap();
    (server, furl)
}

async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..250 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

/// One reachable hint among unreachable and unknown ones is enough.
#[tokio::test]
async fn test_one_reachable_hint_wins() {
    let network = MemoryNetwork::new();
    let (server, _) = serve(&network, "server");
    let furl = Furl::new(
        server.tub_id().clone(),
        vec![
            LocationHint::memory("nowhere-1"),
            LocationHint::new("tor", "abcdefgh.onion:80"),
            LocationHint::memory("server"),
            LocationHint::memory("nowhere-2"),
        ],
        "echo",
    )
    .unwrap();

    let client = tub(&network);
    let echo = client.get_reference(&furl).await.unwrap();
    let answer = echo.call_remote("echo", vec![Value::Int(42)]).await.unwrap();
    assert_eq!(answer, Value::Int(42));
    assert_eq!(client.connected_peers(), vec![server.tub_id().clone()]);

    client.shutdown().await;
    server.shutdown().await;
}

/// When every hint fails the error reports each hint, in listed order.
#[tokio::test]
async fn test_exhausted_race_reports_every_hint() {
    let network = MemoryNetwork::new();
    let hints = vec![
        LocationHint::memory("gone-a"),
        LocationHint::new("i2p", "somewhere.i2p"),
        LocationHint::memory("gone-b"),
    ];
    let furl = Furl::new(TubId::generate(), hints.clone(), "thing").unwrap();

    let client = tub(&network);
    let error = client.get_reference(&furl).await.unwrap_err();
    assert!(error.is_race_exhausted());
    let TubError::RaceExhausted(exhausted) = error else {
        unreachable!()
    };
    assert_eq!(&exhausted.target, furl.tub_id());
    let listed: Vec<_> = exhausted.reports.iter().map(|r| r.hint.clone()).collect();
    assert_eq!(listed, hints);
    assert!(matches!(
        exhausted.reports[0].outcome,
        HintOutcome::Failed {
            phase: NegotiationPhase::Start,
            ..
        }
    ));
    assert_eq!(exhausted.reports[1].outcome, HintOutcome::Unrecognized);
    assert!(matches!(
        exhausted.reports[2].outcome,
        HintOutcome::Failed { .. }
    ));
    assert!(client.connected_peers().is_empty());
}

/// Resolves `slow:<name>` hints to memory connections that take a while to
/// open.
struct SlowResolver {
    network: MemoryNetwork,
    delay: Duration,
}

struct SlowConnector {
    network: MemoryNetwork,
    name: String,
    delay: Duration,
}

impl HintResolver for SlowResolver {
    fn resolve(&self, hint: &LocationHint) -> Option<Box<dyn Connector>> {
        (hint.scheme() == "slow").then(|| {
            Box::new(SlowConnector {
                network: self.network.clone(),
                name: hint.address().to_string(),
                delay: self.delay,
            }) as Box<dyn Connector>
        })
    }
}

#[async_trait]
impl Connector for SlowConnector {
    async fn connect(&self) -> Result<BoxedTransport, TransportError> {
        tokio::time::sleep(self.delay).await;
        Ok(Box::new(self.network.connect(&self.name).await?))
    }

    fn describe(&self) -> String {
        format!("slow:{}", self.name)
    }
}

/// Time spent opening the transport counts against the negotiation
/// deadline.
#[tokio::test]
async fn test_deadline_covers_transport_setup() {
    let network = MemoryNetwork::new();
    // Accepts connections into its queue but never answers them.
    let _silent = network.bind("silent").unwrap();
    let client = Tub::new(
        TubConfig::new()
            .with_resolver(Arc::new(SlowResolver {
                network: network.clone(),
                delay: Duration::from_millis(800),
            }))
            .with_negotiation_timeout(Duration::from_secs(1)),
    )
    .unwrap();
    let furl = Furl::new(
        TubId::generate(),
        vec![LocationHint::new("slow", "silent")],
        "thing",
    )
    .unwrap();

    let started = tokio::time::Instant::now();
    let error = client.get_reference(&furl).await.unwrap_err();
    let elapsed = started.elapsed();
    assert!(elapsed < Duration::from_millis(1300), "took {:?}", elapsed);

    let TubError::RaceExhausted(exhausted) = error else {
        panic!("unexpected error: {}", error);
    };
    match &exhausted.reports[0].outcome {
        HintOutcome::Failed { reason, .. } => assert!(reason.contains("timed out"), "{}", reason),
        other => panic!("unexpected outcome: {:?}", other),
    }
}

/// A FURL whose hints nobody understands fails without trying anything.
#[tokio::test]
async fn test_only_unrecognized_hints() {
    let network = MemoryNetwork::new();
    let furl = Furl::new(
        TubId::generate(),
        vec![LocationHint::new("tor", "a.onion:1"), LocationHint::new("i2p", "b.i2p")],
        "thing",
    )
    .unwrap();

    let client = tub(&network);
    match client.get_reference(&furl).await {
        Err(TubError::RaceExhausted(exhausted)) => {
            assert!(exhausted
                .reports
                .iter()
                .all(|r| r.outcome == HintOutcome::Unrecognized));
            assert!(exhausted.to_string().contains("unrecognized scheme"));
        }
        other => panic!("expected an exhausted race, got {:?}", other),
    }
}

/// A FURL without hints cannot be reached unless already connected.
#[tokio::test]
async fn test_no_hints() {
    let network = MemoryNetwork::new();
    let furl = Furl::new(TubId::generate(), Vec::new(), "thing").unwrap();
    let error = tub(&network).get_reference(&furl).await.unwrap_err();
    assert!(error.to_string().ends_with("no location hints"));
}

/// Looking up one of our own objects through its FURL is refused.
#[tokio::test]
async fn test_self_connection_refused() {
    let network = MemoryNetwork::new();
    let (server, furl) = serve(&network, "self");
    match server.get_reference(&furl).await {
        Err(TubError::Negotiation(NegotiationError::SelfConnection(id))) => {
            assert_eq!(&id, server.tub_id());
        }
        other => panic!("expected a self-connection error, got {:?}", other),
    }
    server.shutdown().await;
}

/// Concurrent lookups of objects in one Tub share one connection.
#[tokio::test]
async fn test_concurrent_lookups_share_a_connection() {
    let network = MemoryNetwork::new();
    let (server, furl) = serve(&network, "shared");
    let other = server.register(Arc::new(Echo), Some("other")).unwrap();
    let client = tub(&network);

    let lookups = (0..8).map(|i| {
        let client = client.clone();
        let furl = if i % 2 == 0 { furl.clone() } else { other.clone() };
        tokio::spawn(async move { client.get_reference(&furl).await })
    });
    let references: Vec<_> = futures_util::future::join_all(lookups)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    assert_eq!(client.connected_peers().len(), 1);
    let broker = client.broker_for(server.tub_id()).unwrap();
    assert_eq!(broker.info().seq, SequenceNumber::FIRST);
    for reference in &references {
        assert_eq!(reference.peer(), server.tub_id());
        assert!(reference.is_connected());
    }
    assert!(eventually(|| server.connected_peers() == vec![client.tub_id().clone()]).await);

    // Lookups through a different FURL of a connected Tub reuse the link.
    let bare = Furl::new(server.tub_id().clone(), Vec::new(), "echo").unwrap();
    client.get_reference(&bare).await.unwrap();
    assert!(client
        .broker_for(server.tub_id())
        .unwrap()
        .same_connection(&broker));

    client.shutdown().await;
    server.shutdown().await;
}

/// A Tub on `network` listening as `name`, dialing `slow:` hints with
/// `delay`. Returns it with a FURL for its echo object over a `slow:` hint.
fn serve_slow(network: &MemoryNetwork, name: &str, delay: Duration) -> (Tub, Furl) {
    let server = Tub::new(
        TubConfig::new()
            .with_resolver(Arc::new(network.clone()))
            .with_resolver(Arc::new(SlowResolver {
                network: network.clone(),
                delay,
            })),
    )
    .unwrap();
    server
        .listen(network.bind(name).unwrap(), LocationHint::memory(name))
        .unwrap();
    server.register(Arc::new(Echo), Some("echo")).unwrap();
    let furl = Furl::new(
        server.tub_id().clone(),
        vec![LocationHint::new("slow", name)],
        "echo",
    )
    .unwrap();
    (server, furl)
}

/// Two Tubs dialing each other at once end up with a single connection
/// that both agree on. The one the master opened survives, whichever
/// transport came up first.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mutual_connect_converges() {
    init_tracing();
    for round in 0..6 {
        let network = MemoryNetwork::new();
        // Alternate which side's transport opens first.
        let (fast, slow) = (Duration::from_millis(50), Duration::from_millis(150));
        let (alice_delay, bob_delay) = if round % 2 == 0 { (fast, slow) } else { (slow, fast) };
        let (alice, alice_furl) = serve_slow(&network, &format!("alice-{}", round), alice_delay);
        let (bob, bob_furl) = serve_slow(&network, &format!("bob-{}", round), bob_delay);

        let (a, b) = {
            let (alice, bob) = (alice.clone(), bob.clone());
            let (alice_furl, bob_furl) = (alice_furl.clone(), bob_furl.clone());
            tokio::join!(
                tokio::spawn(async move { alice.get_reference(&bob_furl).await }),
                tokio::spawn(async move { bob.get_reference(&alice_furl).await }),
            )
        };
        // Either lookup may have raced a replacement; what matters is
        // where both sides settle.
        let _ = (a.unwrap(), b.unwrap());

        let settled = eventually(|| {
            match (alice.broker_for(bob.tub_id()), bob.broker_for(alice.tub_id())) {
                (Some(x), Some(y)) => x.info().seq == y.info().seq,
                _ => false,
            }
        })
        .await;
        assert!(settled, "round {} did not converge", round);

        let on_alice = alice.broker_for(bob.tub_id()).unwrap();
        let on_bob = bob.broker_for(alice.tub_id()).unwrap();
        let (master, slave) = if alice.tub_id() > bob.tub_id() {
            (&on_alice, &on_bob)
        } else {
            (&on_bob, &on_alice)
        };
        assert_eq!(master.info().role, Role::Master);
        assert_eq!(slave.info().role, Role::Slave);
        assert!(master.info().initiated, "round {}: the slave's connection won", round);
        assert!(!slave.info().initiated);

        // Fresh lookups ride the settled connection.
        let echo = alice.get_reference(&bob_furl).await.unwrap();
        assert_eq!(
            echo.call_remote("echo", vec!["hi".into()]).await.unwrap(),
            Value::from("hi")
        );
        let echo = bob.get_reference(&alice_furl).await.unwrap();
        assert_eq!(echo.call_remote("echo", vec![Value::Int(1)]).await.unwrap(), Value::Int(1));
        assert!(alice
            .broker_for(bob.tub_id())
            .unwrap()
            .same_connection(&on_alice));
        assert_eq!(alice.connected_peers().len(), 1);
        assert_eq!(bob.connected_peers().len(), 1);

        alice.shutdown().await;
        bob.shutdown().await;
    }
}

/// A restarted peer, same id but new incarnation, replaces the connection
/// its previous life left behind.
#[tokio::test]
async fn test_restarted_peer_replaces_connection() {
    init_tracing();
    let network = MemoryNetwork::new();
    let (server, furl) = serve(&network, "restart");
    let id = TubId::generate();

    let config = || {
        TubConfig::new()
            .with_tub_id(id.clone())
            .with_resolver(Arc::new(network.clone()))
    };
    let first = Tub::new(config()).unwrap();
    let old_reference = first.get_reference(&furl).await.unwrap();
    assert!(eventually(|| server.broker_for(&id).is_some()).await);
    let old = server.broker_for(&id).unwrap();

    // The first life never closes its connection.
    let second = Tub::new(config()).unwrap();
    assert_ne!(first.incarnation(), second.incarnation());
    let echo = second.get_reference(&furl).await.unwrap();
    assert_eq!(echo.call_remote("echo", vec![Value::Int(7)]).await.unwrap(), Value::Int(7));

    assert!(eventually(|| !old.is_attached()).await);
    assert_eq!(
        old.detach_reason().as_deref(),
        Some("superseded by a newer connection")
    );
    let current = server.broker_for(&id).unwrap();
    assert!(!current.same_connection(&old));
    assert_eq!(current.info().peer_incarnation, Some(second.incarnation()));

    assert!(eventually(|| !old_reference.is_connected()).await);
    let error = old_reference
        .call_remote("echo", vec![Value::Int(1)])
        .await
        .unwrap_err();
    assert!(error.is_dead_reference());

    first.shutdown().await;
    second.shutdown().await;
    server.shutdown().await;
}

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

//! Reconnectors keeping references alive across lost connections.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tubrpc::broker::{Failure, Referenceable, RemoteReference, Value};
use tubrpc::identity::{Furl, LocationHint};
use tubrpc::reconnection::{FixedDelay, NoReconnect, ReconnectionStrategy};
use tubrpc::transport::MemoryNetwork;
use tubrpc::tub::{HintOutcome, Tub, TubConfig};

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

fn client(network: &MemoryNetwork, strategy: Arc<dyn ReconnectionStrategy>) -> Tub {
    Tub::new(
        TubConfig::new()
            .with_resolver(Arc::new(network.clone()))
            .with_reconnection_strategy(strategy)
            .with_shutdown_timeout(Duration::from_secs(1)),
    )
    .unwrap()
}

fn fast() -> Arc<dyn ReconnectionStrategy> {
    Arc::new(FixedDelay::new(Duration::from_millis(20)))
}

fn collect(tx: mpsc::UnboundedSender<RemoteReference>) -> impl Fn(RemoteReference) + Send + Sync {
    move |reference| {
        let _ = tx.send(reference);
    }
}

async fn next(rx: &mut mpsc::UnboundedReceiver<RemoteReference>) -> RemoteReference {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no reference within 5s")
        .expect("reconnector stopped")
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

/// A lost connection is replaced and the callback sees the new reference.
#[tokio::test]
async fn test_reconnects_after_loss() {
    let network = MemoryNetwork::new();
    let server = Tub::new(TubConfig::new()).unwrap();
    server
        .listen(network.bind("server").unwrap(), LocationHint::memory("server"))
        .unwrap();
    let furl = server.register(Arc::new(Echo), Some("echo")).unwrap();

    let client = client(&network, fast());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let reconnector = client.connect_to(furl.clone(), collect(tx));
    assert_eq!(reconnector.furl(), &furl);

    let first = next(&mut rx).await;
    assert_eq!(
        first.call_remote("echo", vec![Value::Int(1)]).await.unwrap(),
        Value::Int(1)
    );
    assert!(reconnector.reference().is_some_and(|r| r.same_object(&first)));

    client
        .broker_for(server.tub_id())
        .unwrap()
        .terminate("cable pulled");
    let second = next(&mut rx).await;
    assert!(!second.same_object(&first));
    assert!(!first.is_connected());
    assert_eq!(
        second.call_remote("echo", vec![Value::Int(2)]).await.unwrap(),
        Value::Int(2)
    );

    let metrics = reconnector.metrics();
    assert_eq!(metrics.successful_reconnections, 2);
    assert_eq!(metrics.consecutive_failures, 0);
    assert!(reconnector.is_running());

    client.shutdown().await;
    assert!(eventually(|| !reconnector.is_running()).await);
    server.shutdown().await;
}

/// A reconnector started before its target listens connects once it does.
#[tokio::test]
async fn test_waits_for_late_listener() {
    let network = MemoryNetwork::new();
    let server = Tub::new(TubConfig::new()).unwrap();
    server.register(Arc::new(Echo), Some("echo")).unwrap();
    let furl = Furl::new(
        server.tub_id().clone(),
        vec![LocationHint::memory("late")],
        "echo",
    )
    .unwrap();

    let client = client(&network, fast());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let reconnector = client.connect_to(furl, collect(tx));

    assert!(eventually(|| reconnector.metrics().failed_reconnections >= 2).await);
    assert!(reconnector.reference().is_none());
    let report = reconnector.last_report();
    assert_eq!(report.len(), 1);
    assert!(matches!(report[0].outcome, HintOutcome::Failed { .. }));

    server
        .listen(network.bind("late").unwrap(), LocationHint::memory("late"))
        .unwrap();
    let echo = next(&mut rx).await;
    assert_eq!(
        echo.call_remote("echo", vec!["up".into()]).await.unwrap(),
        Value::from("up")
    );
    assert_eq!(reconnector.last_report()[0].outcome, HintOutcome::Connected);
    assert!(reconnector.last_error().is_none());

    client.shutdown().await;
    server.shutdown().await;
}

/// The strategy's attempt limit ends the reconnector, keeping the last
/// race report.
#[tokio::test]
async fn test_gives_up_after_attempt_limit() {
    let network = MemoryNetwork::new();
    let hints = vec![LocationHint::memory("void"), LocationHint::new("tor", "x.onion:1")];
    let furl = Furl::new(tubrpc::identity::TubId::generate(), hints, "thing").unwrap();
    let strategy = FixedDelay::builder()
        .delay(Duration::from_millis(10))
        .max_attempts(Some(2))
        .build();

    let client = client(&network, Arc::new(strategy));
    let reconnector = client.connect_to(furl, |_| {});
    assert!(eventually(|| !reconnector.is_running()).await);

    let metrics = reconnector.metrics();
    assert_eq!(metrics.total_attempts, 3);
    assert_eq!(metrics.failed_reconnections, 3);
    assert!(reconnector
        .last_error()
        .is_some_and(|e| e.contains("could not connect")));
    let report = reconnector.last_report();
    assert_eq!(report.len(), 2);
    assert_eq!(report[1].outcome, HintOutcome::Unrecognized);

    client.shutdown().await;
}

/// With no reconnection a lost connection ends the reconnector.
#[tokio::test]
async fn test_no_reconnect_strategy() {
    let network = MemoryNetwork::new();
    let server = Tub::new(TubConfig::new()).unwrap();
    server
        .listen(network.bind("once").unwrap(), LocationHint::memory("once"))
        .unwrap();
    let furl = server.register(Arc::new(Echo), Some("echo")).unwrap();

    let client = client(&network, Arc::new(NoReconnect::new()));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let reconnector = client.connect_to(furl, collect(tx));
    let reference = next(&mut rx).await;

    server.shutdown().await;
    assert!(eventually(|| !reconnector.is_running()).await);
    assert!(!reference.is_connected());
    assert!(reconnector.reference().is_none());
    assert!(reconnector
        .last_error()
        .is_some_and(|e| e.contains("connection lost")));

    client.shutdown().await;
}

/// Stopping is immediate and idempotent.
#[tokio::test]
async fn test_stop() {
    let network = MemoryNetwork::new();
    let server = Tub::new(TubConfig::new()).unwrap();
    server
        .listen(network.bind("stop").unwrap(), LocationHint::memory("stop"))
        .unwrap();
    let furl = server.register(Arc::new(Echo), Some("echo")).unwrap();

    let client = client(&network, fast());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let reconnector = client.connect_to(furl.clone(), collect(tx));
    next(&mut rx).await;

    reconnector.stop();
    reconnector.stop();
    assert!(!reconnector.is_running());
    assert!(reconnector.reference().is_none());

    client.shutdown().await;
    let late = client.connect_to(furl, |_| {});
    assert!(!late.is_running());
    server.shutdown().await;
}

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

//! Per-peer connection status of one Tub.

use crate::broker::Broker;
use crate::identity::TubId;
use crate::negotiation::PeerActivity;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

/// What a Tub knows about one peer.
#[derive(Clone, Default)]
pub(crate) struct PeerStatus {
    /// The live connection, if any.
    pub(crate) broker: Option<Broker>,
    /// Negotiations with this peer currently past the hello exchange.
    pub(crate) negotiating: usize,
    /// A connection race of ours to this peer still has attempts running.
    pub(crate) outbound_attempting: bool,
}

impl PeerStatus {
    pub(crate) fn live(&self) -> Option<&Broker> {
        self.broker.as_ref().filter(|b| b.is_attached())
    }
}

/// Status of every peer, observable per peer.
#[derive(Default)]
pub(crate) struct PeerTable {
    peers: Mutex<HashMap<TubId, Arc<watch::Sender<PeerStatus>>>>,
}

impl PeerTable {
    fn entry(&self, peer: &TubId) -> Arc<watch::Sender<PeerStatus>> {
        let mut peers = self.peers.lock();
        Arc::clone(
            peers
                .entry(peer.clone())
                .or_insert_with(|| Arc::new(watch::channel(PeerStatus::default()).0)),
        )
    }

    pub(crate) fn subscribe(&self, peer: &TubId) -> watch::Receiver<PeerStatus> {
        self.entry(peer).subscribe()
    }

    /// The attached broker to `peer`, if there is one.
    pub(crate) fn live(&self, peer: &TubId) -> Option<Broker> {
        self.peers
            .lock()
            .get(peer)
            .and_then(|status| status.borrow().live().cloned())
    }

    pub(crate) fn set_outbound(&self, peer: &TubId, attempting: bool) {
        self.entry(peer).send_if_modified(|status| {
            let changed = status.outbound_attempting != attempting;
            status.outbound_attempting = attempting;
            changed
        });
    }

    /// Records `broker` as the connection to its peer and returns the one
    /// it replaces.
    pub(crate) fn attach(&self, broker: &Broker) -> Option<Broker> {
        let mut previous = None;
        self.entry(broker.peer()).send_modify(|status| {
            previous = status.broker.replace(broker.clone());
        });
        previous.filter(|old| !old.same_connection(broker))
    }

    /// Forgets `broker` unless a newer connection already took its place.
    pub(crate) fn detach(&self, broker: &Broker) {
        self.entry(broker.peer()).send_if_modified(|status| {
            if status
                .broker
                .as_ref()
                .is_some_and(|current| current.same_connection(broker))
            {
                status.broker = None;
                true
            } else {
                false
            }
        });
    }

    pub(crate) fn connected(&self) -> Vec<TubId> {
        self.peers
            .lock()
            .iter()
            .filter(|(_, status)| status.borrow().live().is_some())
            .map(|(peer, _)| peer.clone())
            .collect()
    }

    pub(crate) fn brokers(&self) -> Vec<Broker> {
        self.peers
            .lock()
            .values()
            .filter_map(|status| status.borrow().broker.clone())
            .collect()
    }
}

impl PeerActivity for PeerTable {
    fn negotiation_started(&self, peer: &TubId) {
        self.entry(peer).send_modify(|status| status.negotiating += 1);
    }

    fn negotiation_finished(&self, peer: &TubId) {
        self.entry(peer)
            .send_modify(|status| status.negotiating = status.negotiating.saturating_sub(1));
    }

    fn outbound_settled(&self, peer: &TubId) -> BoxFuture<'static, ()> {
        let mut status = self.subscribe(peer);
        Box::pin(async move {
            let _ = status.wait_for(|s| !s.outbound_attempting).await;
        })
    }
}

/// Clears the outbound flag when a race ends, however it ends.
pub(crate) struct OutboundGuard {
    peers: Arc<PeerTable>,
    peer: TubId,
    active: bool,
}

impl OutboundGuard {
    pub(crate) fn new(peers: &Arc<PeerTable>, peer: &TubId) -> Self {
        peers.set_outbound(peer, true);
        Self {
            peers: Arc::clone(peers),
            peer: peer.clone(),
            active: true,
        }
    }

    pub(crate) fn settle(&mut self) {
        if self.active {
            self.active = false;
            self.peers.set_outbound(&self.peer, false);
        }
    }
}

impl Drop for OutboundGuard {
    fn drop(&mut self) {
        self.settle();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_outbound_settled_waits_for_the_race() {
        let peers = Arc::new(PeerTable::default());
        let peer = TubId::generate();

        peers.outbound_settled(&peer).await;

        let mut guard = OutboundGuard::new(&peers, &peer);
        let waiter = tokio::spawn(peers.outbound_settled(&peer));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        guard.settle();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        drop(guard);
        assert!(!peers.subscribe(&peer).borrow().outbound_attempting);
    }

    #[test]
    fn test_negotiation_counter() {
        let peers = PeerTable::default();
        let peer = TubId::generate();
        peers.negotiation_started(&peer);
        peers.negotiation_started(&peer);
        peers.negotiation_finished(&peer);
        assert_eq!(peers.subscribe(&peer).borrow().negotiating, 1);
        peers.negotiation_finished(&peer);
        peers.negotiation_finished(&peer);
        assert_eq!(peers.subscribe(&peer).borrow().negotiating, 0);
        assert!(peers.live(&peer).is_none());
        assert!(peers.connected().is_empty());
    }
}

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

//! Racing every location hint of a FURL.
//!
//! One negotiation is started per recognised hint, all at once. The first to
//! be accepted wins and the rest are abandoned: attempts that have not
//! reached DECIDING drop their transport silently, attempts already deciding
//! finish so the peer is not left half-open, and their result is discarded.

use crate::broker::Broker;
use crate::identity::{LocationHint, TubId};
use crate::negotiation::{
    Established, NegotiationContext, NegotiationError, NegotiationHandle, NegotiationPhase,
    Negotiator,
};
use crate::transport::{BoxedTransport, Connector, HintResolver, TransportError};
use crate::tub::peers::{OutboundGuard, PeerTable};
use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use futures_util::stream::FuturesUnordered;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

#[cfg(feature = "tracing")]
use tracing::debug;

/// How one hint fared in a race.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HintOutcome {
    /// No resolver recognises the hint's scheme.
    Unrecognized,
    /// This hint produced the winning connection.
    Connected,
    /// Another hint won first.
    Abandoned,
    /// The attempt failed.
    Failed {
        /// Phase the attempt ended in; `Start` when the transport could
        /// not be opened.
        phase: NegotiationPhase,
        /// What went wrong.
        reason: String,
    },
}

/// One line of a race report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HintReport {
    /// The hint as listed in the FURL.
    pub hint: LocationHint,
    /// What happened to it.
    pub outcome: HintOutcome,
}

impl fmt::Display for HintReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            HintOutcome::Unrecognized => write!(f, "{}: unrecognized scheme", self.hint),
            HintOutcome::Connected => write!(f, "{}: connected", self.hint),
            HintOutcome::Abandoned => write!(f, "{}: abandoned", self.hint),
            HintOutcome::Failed { phase, reason } => {
                write!(f, "{}: failed in {}: {}", self.hint, phase, reason)
            }
        }
    }
}

/// Every hint of a race failed.
#[derive(Debug, Clone, Error)]
#[error("could not connect to tub {target}: {}", summarize(.reports))]
pub struct ConnectionRaceExhausted {
    /// The Tub we tried to reach.
    pub target: TubId,
    /// One report per listed hint, in listed order.
    pub reports: Vec<HintReport>,
}

fn summarize(reports: &[HintReport]) -> String {
    if reports.is_empty() {
        return "no location hints".to_string();
    }
    reports
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

enum AttemptError {
    Connect(TransportError),
    Negotiation(NegotiationError),
}

type AttemptFuture = BoxFuture<'static, (usize, Result<Established, AttemptError>)>;

/// A race to one peer over a set of hints.
pub(crate) struct ConnectionRace {
    ctx: Arc<NegotiationContext>,
    peers: Arc<PeerTable>,
    resolvers: Vec<Arc<dyn HintResolver>>,
    target: TubId,
    hints: Vec<LocationHint>,
}

impl ConnectionRace {
    pub(crate) fn new(
        ctx: Arc<NegotiationContext>,
        peers: Arc<PeerTable>,
        resolvers: Vec<Arc<dyn HintResolver>>,
        target: TubId,
        hints: Vec<LocationHint>,
    ) -> Self {
        Self {
            ctx,
            peers,
            resolvers,
            target,
            hints,
        }
    }

    fn connector(&self, hint: &LocationHint) -> Option<Box<dyn Connector>> {
        self.resolvers.iter().find_map(|resolver| resolver.resolve(hint))
    }

    /// Runs the race. `attach` turns the winning negotiation into a broker
    /// and releases its decision hold.
    pub(crate) async fn run<F>(
        self,
        attach: F,
    ) -> Result<(Broker, Vec<HintReport>), ConnectionRaceExhausted>
    where
        F: FnOnce(Established) -> Broker + Send,
    {
        if let Some(broker) = self.peers.live(&self.target) {
            return Ok((broker, Vec::new()));
        }

        let mut reports: Vec<HintReport> = self
            .hints
            .iter()
            .map(|hint| HintReport {
                hint: hint.clone(),
                outcome: HintOutcome::Abandoned,
            })
            .collect();

        let mut outbound = OutboundGuard::new(&self.peers, &self.target);
        let last_known = self.ctx.slave_table.last_known(&self.target).await;
        // An inbound connection may have been attached while we waited for
        // the snapshot.
        if let Some(broker) = self.peers.live(&self.target) {
            return Ok((broker, Vec::new()));
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut handles: Vec<Option<NegotiationHandle>> = Vec::with_capacity(self.hints.len());
        let mut attempts = FuturesUnordered::<AttemptFuture>::new();

        for (index, hint) in self.hints.iter().enumerate() {
            let Some(connector) = self.connector(hint) else {
                reports[index].outcome = HintOutcome::Unrecognized;
                handles.push(None);
                continue;
            };
            let (negotiator, handle) = Negotiator::new(Arc::clone(&self.ctx), hint.to_string());
            let negotiator = negotiator.with_last_known(last_known);
            handles.push(Some(handle));

            let target = self.target.clone();
            let timeout = self.ctx.timeout;
            let mut stop = stop_rx.clone();
            attempts.push(Box::pin(async move {
                // One deadline covers opening the transport and the handshake.
                let deadline = Instant::now() + timeout;
                let opened: Result<BoxedTransport, AttemptError> = tokio::select! {
                    biased;
                    _ = stop.wait_for(|stop| *stop) => {
                        Err(AttemptError::Negotiation(NegotiationError::Abandoned))
                    }
                    opened = tokio::time::timeout_at(deadline, connector.connect()) => match opened {
                        Ok(Ok(transport)) => Ok(transport),
                        Ok(Err(e)) => Err(AttemptError::Connect(e)),
                        Err(_) => Err(AttemptError::Connect(TransportError::Timeout {
                            duration: timeout,
                        })),
                    },
                };
                let result = match opened {
                    Ok(transport) => negotiator
                        .initiate_until(transport, &target, deadline)
                        .await
                        .map_err(AttemptError::Negotiation),
                    Err(e) => Err(e),
                };
                (index, result)
            }));
        }

        if attempts.is_empty() {
            #[cfg(feature = "tracing")]
            debug!(
                peer = %self.target.short(),
                "no recognised location hints"
            );
            return Err(self.exhausted(reports));
        }

        let mut winner = None;
        while let Some((index, result)) = attempts.next().await {
            match result {
                Ok(established) => {
                    stop_tx.send_replace(true);
                    for (other, handle) in handles.iter().enumerate() {
                        if other != index {
                            if let Some(handle) = handle {
                                let _phase = handle.abandon();

                                #[cfg(feature = "tracing")]
                                debug!(hint = %self.hints[other], phase = %_phase, "abandoning attempt");
                            }
                        }
                    }
                    reports[index].outcome = HintOutcome::Connected;
                    winner = Some(attach(established));
                    break;
                }
                Err(error) => {
                    reports[index].outcome = outcome(error);

                    #[cfg(feature = "tracing")]
                    debug!(
                        peer = %self.target.short(),
                        "attempt via {}",
                        reports[index]
                    );
                }
            }
        }
        outbound.settle();

        if let Some(broker) = winner {
            if !attempts.is_empty() {
                tokio::spawn(async move {
                    // Results of abandoned attempts are discarded.
                    attempts.for_each(|_| async {}).await;
                });
            }
            return Ok((broker, reports));
        }

        // Every attempt of ours failed, possibly because a connection the
        // peer opened is taking its place. Wait for that one to settle.
        let mut status = self.peers.subscribe(&self.target);
        let settled = status
            .wait_for(|s| s.live().is_some() || s.negotiating == 0)
            .await
            .ok()
            .and_then(|s| s.live().cloned());
        match settled {
            Some(broker) => Ok((broker, reports)),
            None => Err(self.exhausted(reports)),
        }
    }

    fn exhausted(&self, reports: Vec<HintReport>) -> ConnectionRaceExhausted {
        ConnectionRaceExhausted {
            target: self.target.clone(),
            reports,
        }
    }
}

fn outcome(error: AttemptError) -> HintOutcome {
    match error {
        AttemptError::Connect(e) => HintOutcome::Failed {
            phase: NegotiationPhase::Start,
            reason: e.to_string(),
        },
        AttemptError::Negotiation(NegotiationError::Abandoned) => HintOutcome::Abandoned,
        AttemptError::Negotiation(e) => HintOutcome::Failed {
            phase: e.terminal_phase(),
            reason: e.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhausted_lists_every_hint() {
        let error = ConnectionRaceExhausted {
            target: TubId::generate(),
            reports: vec![
                HintReport {
                    hint: LocationHint::tcp("10.0.0.1:1"),
                    outcome: HintOutcome::Failed {
                        phase: NegotiationPhase::Start,
                        reason: "connection refused".to_string(),
                    },
                },
                HintReport {
                    hint: LocationHint::new("tor", "abc.onion:80"),
                    outcome: HintOutcome::Unrecognized,
                },
            ],
        };
        let text = error.to_string();
        assert!(text.contains("tcp:10.0.0.1:1: failed in START: connection refused"));
        assert!(text.contains("tor:abc.onion:80: unrecognized scheme"));
    }

    #[test]
    fn test_empty_report() {
        let error = ConnectionRaceExhausted {
            target: TubId::generate(),
            reports: Vec::new(),
        };
        assert!(error.to_string().ends_with("no location hints"));
    }
}

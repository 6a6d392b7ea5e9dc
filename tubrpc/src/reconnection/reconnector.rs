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

//! Keeping a reference to a FURL alive.

use crate::broker::{CallError, RemoteReference};
use crate::error::TubError;
use crate::identity::Furl;
use crate::reconnection::{ReconnectionMetrics, ReconnectionStrategy};
use crate::tub::{HintReport, TubInner};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

#[cfg(feature = "tracing")]
use tracing::{debug, info};

#[derive(Default)]
struct State {
    reference: Option<RemoteReference>,
    last_report: Vec<HintReport>,
    metrics: ReconnectionMetrics,
}

struct Shared {
    furl: Furl,
    state: Mutex<State>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Holds a reference to a FURL, fetching it again whenever it is lost.
///
/// Created by [`Tub::connect_to`](crate::tub::Tub::connect_to). Every time a
/// reference is obtained the callback runs with it. When the connection
/// behind it is lost the Tub's [`ReconnectionStrategy`] decides whether and
/// when to race the FURL's hints again.
///
/// Cloning yields another handle to the same reconnector.
#[derive(Clone)]
pub struct Reconnector {
    shared: Arc<Shared>,
}

impl Reconnector {
    pub(crate) fn start<F>(
        tub: Weak<TubInner>,
        furl: Furl,
        strategy: Arc<dyn ReconnectionStrategy>,
        callback: F,
    ) -> Self
    where
        F: Fn(RemoteReference) + Send + Sync + 'static,
    {
        let shared = Arc::new(Shared {
            furl,
            state: Mutex::new(State::default()),
            task: Mutex::new(None),
        });
        let task = tokio::spawn(run(tub, Arc::downgrade(&shared), strategy, callback));
        *shared.task.lock() = Some(task);
        Self { shared }
    }

    /// The FURL being kept alive.
    pub fn furl(&self) -> &Furl {
        &self.shared.furl
    }

    /// The current reference, while connected.
    pub fn reference(&self) -> Option<RemoteReference> {
        self.shared
            .state
            .lock()
            .reference
            .clone()
            .filter(RemoteReference::is_connected)
    }

    /// Per-hint report of the most recent connection race.
    pub fn last_report(&self) -> Vec<HintReport> {
        self.shared.state.lock().last_report.clone()
    }

    /// Why the most recent attempt failed or the connection was lost.
    pub fn last_error(&self) -> Option<String> {
        self.shared.state.lock().metrics.last_error.clone()
    }

    /// Attempt and failure counters.
    pub fn metrics(&self) -> ReconnectionMetrics {
        self.shared.state.lock().metrics.clone()
    }

    /// Returns `true` until the reconnector is stopped or gives up.
    pub fn is_running(&self) -> bool {
        self.shared
            .task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Stops reconnecting and lets go of the current reference. Idempotent.
    pub fn stop(&self) {
        if let Some(task) = self.shared.task.lock().take() {
            task.abort();
        }
        let reference = self.shared.state.lock().reference.take();
        drop(reference);
    }
}

impl fmt::Debug for Reconnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconnector")
            .field("furl", &self.shared.furl.to_string())
            .field("running", &self.is_running())
            .field("connected", &self.reference().is_some())
            .finish()
    }
}

async fn run<F>(
    tub: Weak<TubInner>,
    shared: Weak<Shared>,
    strategy: Arc<dyn ReconnectionStrategy>,
    callback: F,
) where
    F: Fn(RemoteReference) + Send + Sync + 'static,
{
    let mut attempt: u32 = 0;
    loop {
        let (Some(this), Some(tub)) = (shared.upgrade(), tub.upgrade()) else {
            return;
        };
        this.state.lock().metrics.record_attempt();
        let result = tub.fetch(&this.furl).await;
        drop(tub);

        let error = match result {
            Ok((reference, report)) => {
                attempt = 0;
                strategy.on_connected();
                {
                    let mut state = this.state.lock();
                    state.reference = Some(reference.clone());
                    state.last_report = report;
                    state.metrics.record_success();
                }

                #[cfg(feature = "tracing")]
                info!("connected to {}", this.furl);

                let (lost_tx, lost_rx) = oneshot::channel();
                let _token = reference.on_disconnect(move || {
                    let _ = lost_tx.send(());
                });
                callback(reference);
                drop(this);
                let _ = lost_rx.await;

                let Some(this) = shared.upgrade() else {
                    return;
                };
                this.state.lock().reference = None;
                TubError::Call(CallError::dead("connection lost"))
            }
            Err(error) => {
                if let TubError::RaceExhausted(exhausted) = &error {
                    this.state.lock().last_report = exhausted.reports.clone();
                }
                drop(this);
                error
            }
        };

        #[cfg(feature = "tracing")]
        debug!(strategy = strategy.name(), "lost {}: {}", shared_furl(&shared), error);

        strategy.on_disconnected(&error);
        if let Some(this) = shared.upgrade() {
            this.state.lock().metrics.record_failure(&error);
        }
        if !strategy.should_reconnect(attempt, &error).await {
            #[cfg(feature = "tracing")]
            info!("giving up on {}: {}", shared_furl(&shared), error);
            return;
        }
        let delay = strategy.next_delay(attempt).await;
        attempt = attempt.saturating_add(1);
        tokio::time::sleep(delay).await;
    }
}

#[cfg(feature = "tracing")]
fn shared_furl(shared: &Weak<Shared>) -> String {
    shared
        .upgrade()
        .map(|s| s.furl.to_string())
        .unwrap_or_default()
}

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

//! Disconnect notification.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Identifies a registered disconnect callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DisconnectToken(u64);

#[derive(Default)]
struct State {
    fired: bool,
    next: u64,
    callbacks: BTreeMap<u64, Callback>,
}

/// Runs callbacks once when a connection is lost.
///
/// Every callback runs exactly once, including those registered after the
/// connection was already lost; those are scheduled on the runtime instead
/// of running inside the registration call. Cancelling is idempotent.
#[derive(Clone, Default)]
pub struct DisconnectNotifier {
    state: Arc<Mutex<State>>,
}

impl DisconnectNotifier {
    /// Creates a notifier that has not fired.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback`; arguments are captured by the closure.
    pub fn on_disconnect<F>(&self, callback: F) -> DisconnectToken
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.state.lock();
        let id = state.next;
        state.next += 1;
        state.callbacks.insert(id, Box::new(callback));
        let fired = state.fired;
        drop(state);

        if fired {
            self.schedule(id);
        }
        DisconnectToken(id)
    }

    /// Unregisters a callback. Returns `true` if it had not run yet.
    pub fn cancel(&self, token: DisconnectToken) -> bool {
        self.state.lock().callbacks.remove(&token.0).is_some()
    }

    /// Runs every registered callback. Later calls do nothing.
    pub fn fire(&self) {
        let callbacks = {
            let mut state = self.state.lock();
            if state.fired {
                return;
            }
            state.fired = true;
            std::mem::take(&mut state.callbacks)
        };
        for (_, callback) in callbacks {
            callback();
        }
    }

    /// Returns `true` once [`fire`](Self::fire) ran.
    pub fn has_fired(&self) -> bool {
        self.state.lock().fired
    }

    /// Returns the number of callbacks still waiting to run.
    pub fn pending(&self) -> usize {
        self.state.lock().callbacks.len()
    }

    fn schedule(&self, id: u64) {
        let state = Arc::clone(&self.state);
        let run = move || {
            let callback = state.lock().callbacks.remove(&id);
            if let Some(callback) = callback {
                callback();
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { run() });
            }
            Err(_) => run(),
        }
    }
}

impl std::fmt::Debug for DisconnectNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DisconnectNotifier")
            .field("fired", &state.fired)
            .field("pending", &state.callbacks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    #[test]
    fn test_fires_once() {
        let notifier = DisconnectNotifier::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        notifier.on_disconnect(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        notifier.fire();
        notifier.fire();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(notifier.has_fired());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let notifier = DisconnectNotifier::new();
        let token = notifier.on_disconnect(|| panic!("cancelled callback ran"));
        assert!(notifier.cancel(token));
        assert!(!notifier.cancel(token));
        notifier.fire();
        assert!(!notifier.cancel(token));
    }

    #[tokio::test]
    async fn test_late_registration_still_runs() {
        let notifier = DisconnectNotifier::new();
        notifier.fire();
        let (tx, rx) = oneshot::channel();
        let token = notifier.on_disconnect(move || {
            let _ = tx.send("late");
        });
        assert_eq!(rx.await.unwrap(), "late");
        // Already ran: cancelling is a no-op.
        assert!(!notifier.cancel(token));
    }

    #[tokio::test]
    async fn test_late_registration_can_be_cancelled_before_it_runs() {
        let notifier = DisconnectNotifier::new();
        notifier.fire();
        let token = notifier.on_disconnect(|| panic!("cancelled callback ran"));
        assert!(notifier.cancel(token));
        tokio::task::yield_now().await;
        assert_eq!(notifier.pending(), 0);
    }
}

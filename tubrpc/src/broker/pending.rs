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

//! Outstanding calls awaiting answers.

use crate::broker::{CallError, InterfaceSchema, Value};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Result delivered to a caller.
pub type CallResult = Result<Value, CallError>;

/// Generates request ids for calls that expect an answer.
///
/// Ids start at 1 and increase monotonically for the lifetime of a broker.
///
/// # Examples
///
/// ```rust
/// use tubrpc::broker::RequestIdGenerator;
///
/// let ids = RequestIdGenerator::new();
/// assert_eq!(ids.next(), 1);
/// assert_eq!(ids.next(), 2);
/// ```
#[derive(Debug)]
pub struct RequestIdGenerator {
    next_id: AtomicU64,
}

impl RequestIdGenerator {
    /// Creates a generator starting at 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
        }
    }

    /// Returns the next id.
    #[must_use]
    pub fn next(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns the id the next call will get.
    #[must_use]
    pub fn current(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed)
    }
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Waiters for outstanding calls, keyed by request id.
///
/// Once closed by [`fail_all`](Self::fail_all), registration is refused so
/// no waiter can be left behind by a call racing the teardown.
#[derive(Debug)]
pub struct PendingCalls {
    waiters: Mutex<Option<HashMap<u64, oneshot::Sender<CallResult>>>>,
}

impl PendingCalls {
    /// Creates an open, empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            waiters: Mutex::new(Some(HashMap::new())),
        }
    }

    /// Records a waiter for `req_id`. Returns `None` once closed.
    pub fn register(&self, req_id: u64) -> Option<oneshot::Receiver<CallResult>> {
        let mut waiters = self.waiters.lock();
        let waiters = waiters.as_mut()?;
        let (tx, rx) = oneshot::channel();
        waiters.insert(req_id, tx);
        Some(rx)
    }

    /// Removes and returns the waiter for `req_id`.
    pub fn take(&self, req_id: u64) -> Option<oneshot::Sender<CallResult>> {
        self.waiters.lock().as_mut()?.remove(&req_id)
    }

    /// Delivers `result` to the waiter for `req_id`.
    ///
    /// Returns `false` if there is no such waiter or it stopped listening.
    pub fn complete(&self, req_id: u64, result: CallResult) -> bool {
        match self.take(req_id) {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }

    /// Forgets the waiter for `req_id`.
    pub fn cancel(&self, req_id: u64) -> bool {
        self.take(req_id).is_some()
    }

    /// Fails every waiter with `error` and closes the table.
    ///
    /// Returns the number of waiters failed.
    pub fn fail_all(&self, error: &CallError) -> usize {
        let waiters = self.waiters.lock().take().unwrap_or_default();
        let count = waiters.len();
        for (_, tx) in waiters {
            let _ = tx.send(Err(error.clone()));
        }
        count
    }

    /// Returns the number of outstanding calls.
    pub fn len(&self) -> usize {
        self.waiters.lock().as_ref().map_or(0, HashMap::len)
    }

    /// Returns `true` if no call is outstanding.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` once [`fail_all`](Self::fail_all) ran.
    pub fn is_closed(&self) -> bool {
        self.waiters.lock().is_none()
    }
}

impl Default for PendingCalls {
    fn default() -> Self {
        Self::new()
    }
}

/// The answer to a remote call, as a future.
///
/// Dropping it before completion forgets the waiter; a late answer is then
/// discarded by the broker.
#[must_use = "a call's answer is lost unless the PendingCall is awaited"]
pub struct PendingCall {
    state: State,
}

enum State {
    Ready(Option<CallResult>),
    Waiting {
        req_id: u64,
        rx: oneshot::Receiver<CallResult>,
        calls: Arc<PendingCalls>,
        returns: Option<(Arc<InterfaceSchema>, String)>,
    },
}

impl PendingCall {
    /// A call that already has its result.
    pub(crate) fn ready(result: CallResult) -> Self {
        Self {
            state: State::Ready(Some(result)),
        }
    }

    pub(crate) fn waiting(
        req_id: u64,
        rx: oneshot::Receiver<CallResult>,
        calls: Arc<PendingCalls>,
        returns: Option<(Arc<InterfaceSchema>, String)>,
    ) -> Self {
        Self {
            state: State::Waiting {
                req_id,
                rx,
                calls,
                returns,
            },
        }
    }

    /// Returns the request id, if the call was sent.
    pub fn request_id(&self) -> Option<u64> {
        match &self.state {
            State::Waiting { req_id, .. } => Some(*req_id),
            State::Ready(_) => None,
        }
    }
}

impl Future for PendingCall {
    type Output = CallResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            State::Ready(result) => Poll::Ready(
                result
                    .take()
                    .unwrap_or_else(|| Err(CallError::dead("call already completed"))),
            ),
            State::Waiting { rx, returns, .. } => {
                let result = match Pin::new(rx).poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Ok(result)) => result,
                    Poll::Ready(Err(_)) => Err(CallError::dead("connection lost")),
                };
                let result = match (result, returns.as_ref()) {
                    (Ok(value), Some((schema, method))) => schema
                        .check_return(method, &value)
                        .map(|()| value)
                        .map_err(CallError::from),
                    (result, _) => result,
                };
                this.state = State::Ready(None);
                Poll::Ready(result)
            }
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if let State::Waiting { req_id, calls, .. } = &self.state {
            calls.cancel(*req_id);
        }
    }
}

impl std::fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("request_id", &self.request_id())
            .finish()
    }
}

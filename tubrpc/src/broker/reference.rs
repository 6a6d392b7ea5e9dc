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

//! Objects that can be called remotely, and references to remote objects.

use crate::broker::connection::BrokerShared;
use crate::broker::{
    CallError, DisconnectToken, Failure, InterfaceSchema, PendingCall, Value,
};
use crate::identity::{Furl, TubId};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// An object whose methods can be invoked by remote peers.
///
/// Implementations receive the method name and positional arguments and
/// return a value or a [`Failure`]. Objects passed as [`Value::Local`] are
/// exported automatically; objects registered with a Tub are also reachable
/// by FURL.
///
/// # Examples
///
/// ```rust
/// use async_trait::async_trait;
/// use tubrpc::broker::{Failure, Referenceable, Value};
///
/// struct Adder;
///
/// #[async_trait]
/// impl Referenceable for Adder {
///     async fn remote_call(&self, method: &str, args: Vec<Value>) -> Result<Value, Failure> {
///         match method {
///             "add" => {
///                 let sum = args.iter().filter_map(Value::as_int).sum::<i64>();
///                 Ok(Value::Int(sum))
///             }
///             _ => Err(Failure::no_such_method(method)),
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait Referenceable: Send + Sync + 'static {
    /// Handles one remote invocation.
    async fn remote_call(&self, method: &str, args: Vec<Value>) -> Result<Value, Failure>;

    /// Interface checked against inbound calls and outgoing results.
    fn schema(&self) -> Option<Arc<InterfaceSchema>> {
        None
    }
}

/// Hooks a broker uses to reach the rest of its Tub.
#[async_trait]
pub trait ReferenceResolver: Send + Sync + 'static {
    /// The FURL under which `object` is registered, if any.
    fn furl_for(&self, object: &Arc<dyn Referenceable>) -> Option<Furl>;

    /// Fetches the object named by a gift FURL, connecting to its Tub when
    /// needed.
    async fn resolve_gift(&self, furl: &Furl) -> Result<Value, CallError>;
}

pub(crate) struct RemoteInner {
    pub(crate) broker: Arc<BrokerShared>,
    pub(crate) clid: u64,
    pub(crate) furl: Option<Furl>,
    pub(crate) received: AtomicU32,
    pub(crate) tracked: bool,
}

impl Drop for RemoteInner {
    fn drop(&mut self) {
        if self.tracked {
            let count = self.received.load(Ordering::Acquire);
            self.broker.release_import(self.clid, self as *const RemoteInner, count);
        }
    }
}

/// A reference to an object living in another Tub.
///
/// Clones share one proxy. When the last clone is dropped (or
/// [`release`](Self::release)d) the owner is told it may forget the object.
/// Once the connection the reference came over is gone every call fails with
/// [`CallError::DeadReference`]; references never migrate to a newer
/// connection.
#[derive(Clone)]
pub struct RemoteReference {
    inner: Arc<RemoteInner>,
    interface: Option<Arc<InterfaceSchema>>,
}

impl RemoteReference {
    pub(crate) fn from_inner(inner: Arc<RemoteInner>) -> Self {
        Self {
            inner,
            interface: None,
        }
    }

    /// Invokes `method` and returns a future for its result.
    ///
    /// The request is queued before this returns, so calls made one after
    /// another reach the far side in that order.
    pub fn call_remote(&self, method: &str, args: Vec<Value>) -> PendingCall {
        self.inner
            .broker
            .call(self.inner.clid, method, args, self.interface.as_ref())
    }

    /// Invokes `method` without asking for an answer.
    ///
    /// Failures of any kind are dropped.
    pub fn call_remote_only(&self, method: &str, args: Vec<Value>) {
        self.inner
            .broker
            .call_only(self.inner.clid, method, args, self.interface.as_ref());
    }

    /// Attaches an interface that outgoing calls and their results are
    /// checked against.
    #[must_use]
    pub fn with_interface(mut self, schema: Arc<InterfaceSchema>) -> Self {
        self.interface = Some(schema);
        self
    }

    /// The interface attached with [`with_interface`](Self::with_interface).
    pub fn interface(&self) -> Option<&Arc<InterfaceSchema>> {
        self.interface.as_ref()
    }

    /// The FURL of the target, when its owner registered it.
    pub fn furl(&self) -> Option<&Furl> {
        self.inner.furl.as_ref()
    }

    /// The owner's id for the target on this connection.
    pub fn clid(&self) -> u64 {
        self.inner.clid
    }

    /// The Tub the target lives in.
    pub fn peer(&self) -> &TubId {
        self.inner.broker.peer()
    }

    /// Returns `false` once the connection has begun shutting down.
    pub fn is_connected(&self) -> bool {
        self.inner.broker.is_attached()
    }

    /// Runs `callback` once when the connection is lost. Registering after
    /// the loss still runs the callback, asynchronously.
    pub fn on_disconnect<F>(&self, callback: F) -> DisconnectToken
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.broker.notifier().on_disconnect(callback)
    }

    /// Cancels a callback registered with
    /// [`on_disconnect`](Self::on_disconnect). Returns `true` if it had not
    /// run yet; cancelling twice is harmless.
    pub fn cancel_disconnect(&self, token: DisconnectToken) -> bool {
        self.inner.broker.notifier().cancel(token)
    }

    /// Drops this handle. When it was the last one the owner is told.
    pub fn release(self) {}

    /// Returns `true` if both handles point at the same proxy.
    pub fn same_object(&self, other: &RemoteReference) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn belongs_to(&self, broker: &BrokerShared) -> bool {
        std::ptr::eq(Arc::as_ptr(&self.inner.broker), broker)
    }
}

impl fmt::Debug for RemoteReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteReference")
            .field("peer", &self.inner.broker.peer().short())
            .field("clid", &self.inner.clid)
            .field("furl", &self.inner.furl.as_ref().map(ToString::to_string))
            .field("interface", &self.interface.as_ref().map(|s| s.name().to_string()))
            .finish()
    }
}

impl PartialEq for RemoteReference {
    fn eq(&self, other: &Self) -> bool {
        self.same_object(other)
    }
}

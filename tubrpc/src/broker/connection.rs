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

//! The per-connection broker.
//!
//! A [`Broker`] owns one accepted connection. It serialises calls and
//! answers into frames, keeps the reference tables for the connection, and
//! routes inbound messages. Its lifecycle is one way:
//!
//! ```text
//! ATTACHED ──disconnect()──> DISCONNECTING ──peer closes──> DETACHED
//!     └──────────── connection lost / terminate() ───────────────┘
//! ```
//!
//! Entering DETACHED poisons the connection synchronously: outstanding calls
//! fail with [`CallError::DeadReference`], both reference tables are dropped
//! and every disconnect callback is scheduled, all before the transition is
//! observable.

use crate::broker::messages::BrokerMessage;
use crate::broker::notifier::DisconnectNotifier;
use crate::broker::pending::{PendingCalls, RequestIdGenerator};
use crate::broker::reference::RemoteInner;
use crate::broker::tables::{Decref, ExportStage, ExportTable, GiftTable, ROOT_CLID};
use crate::broker::value::PathSegment;
use crate::broker::{
    CallError, DisconnectToken, Failure, InterfaceSchema, PendingCall, ReferenceResolver,
    Referenceable, RemoteException, RemoteReference, Value, Violation, WireValue,
};
use crate::identity::{Furl, TubId};
use crate::negotiation::ConnectionInfo;
use crate::serialization::framing::{MAX_FRAME_SIZE, encode_frame, read_frame};
use crate::serialization::{PostcardSerializer, Serializer};
use crate::transport::BoxedTransport;
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

#[cfg(feature = "tracing")]
use tracing::{debug, info, warn};

/// Lifecycle of a [`Broker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    /// Calls flow both ways.
    Attached,
    /// We asked to close; no new calls are sent.
    Disconnecting,
    /// The connection is gone and every reference over it is dead.
    Detached,
}

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    /// Largest accepted message frame.
    pub max_frame_size: u32,
    /// Report schema violations raised by the far side as
    /// [`CallError::Violation`] instead of a generic remote exception.
    pub expose_remote_exception_types: bool,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
            expose_remote_exception_types: false,
        }
    }
}

impl BrokerSettings {
    /// Sets the largest accepted frame.
    #[must_use]
    pub fn with_max_frame_size(mut self, max_frame_size: u32) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Enables or disables exposing remote violation types.
    #[must_use]
    pub fn with_remote_exception_types(mut self, expose: bool) -> Self {
        self.expose_remote_exception_types = expose;
        self
    }
}

/// A third-party reference waiting to be fetched, and where it goes.
struct PendingGift {
    path: Vec<PathSegment>,
    furl: String,
    gift_id: u64,
}

/// An inbound call queued for invocation.
struct InboundCall {
    req_id: Option<u64>,
    object: Arc<dyn Referenceable>,
    method: String,
    args: Value,
    gifts: Vec<PendingGift>,
}

type Invocation = Pin<Box<dyn Future<Output = ()> + Send>>;

pub(crate) struct BrokerShared {
    info: ConnectionInfo,
    settings: BrokerSettings,
    serializer: PostcardSerializer,
    state: watch::Sender<BrokerState>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    inbound: Mutex<Option<mpsc::UnboundedSender<InboundCall>>>,
    exports: Mutex<ExportTable>,
    imports: Mutex<HashMap<u64, Weak<RemoteInner>>>,
    gifts: Mutex<GiftTable>,
    next_gift: AtomicU64,
    calls: Arc<PendingCalls>,
    ids: RequestIdGenerator,
    notifier: DisconnectNotifier,
    resolver: Weak<dyn ReferenceResolver>,
    detach_reason: Mutex<Option<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Builds the wire form of outbound values, staging exports and gifts.
struct Exporter<'a> {
    broker: &'a BrokerShared,
    table: &'a mut ExportTable,
    stage: ExportStage,
    gifts: Vec<(u64, RemoteReference)>,
}

impl Exporter<'_> {
    fn export(&mut self, value: &Value) -> Result<WireValue, CallError> {
        Ok(match value {
            Value::None => WireValue::None,
            Value::Bool(b) => WireValue::Bool(*b),
            Value::Int(i) => WireValue::Int(*i),
            Value::Float(f) => WireValue::Float(*f),
            Value::Str(s) => WireValue::Str(s.clone()),
            Value::Bytes(b) => WireValue::Bytes(b.clone()),
            Value::List(items) => WireValue::List(
                items
                    .iter()
                    .map(|item| self.export(item))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Dict(entries) => WireValue::Dict(
                entries
                    .iter()
                    .map(|(key, item)| Ok((key.clone(), self.export(item)?)))
                    .collect::<Result<_, CallError>>()?,
            ),
            Value::Local(object) => {
                let clid = self.table.stage(&mut self.stage, object);
                let furl = self
                    .broker
                    .resolver
                    .upgrade()
                    .and_then(|resolver| resolver.furl_for(object))
                    .map(|furl| furl.to_string());
                WireValue::MyReference { clid, furl }
            }
            Value::Remote(reference) if reference.belongs_to(self.broker) => {
                WireValue::YourReference {
                    clid: reference.clid(),
                }
            }
            Value::Remote(reference) => {
                let furl = reference.furl().ok_or_else(|| {
                    Violation::new(
                        "argument",
                        "a reference without a FURL cannot be passed to a third party",
                    )
                })?;
                let gift_id = self.broker.next_gift.fetch_add(1, Ordering::Relaxed);
                self.gifts.push((gift_id, reference.clone()));
                WireValue::TheirReference {
                    furl: furl.to_string(),
                    gift_id,
                }
            }
        })
    }
}

fn describe(root: &str, path: &[PathSegment]) -> String {
    let mut location = root.to_string();
    for segment in path {
        match segment {
            PathSegment::Index(i) => location.push_str(&format!("[{}]", i)),
            PathSegment::Key(k) => location.push_str(&format!("[{:?}]", k)),
        }
    }
    location
}

impl BrokerShared {
    pub(crate) fn peer(&self) -> &TubId {
        &self.info.peer
    }

    pub(crate) fn notifier(&self) -> &DisconnectNotifier {
        &self.notifier
    }

    pub(crate) fn state(&self) -> BrokerState {
        *self.state.borrow()
    }

    pub(crate) fn is_attached(&self) -> bool {
        self.state() == BrokerState::Attached
    }

    fn dead_error(&self) -> CallError {
        let reason = self
            .detach_reason
            .lock()
            .clone()
            .unwrap_or_else(|| "connection is shutting down".to_string());
        CallError::dead(reason)
    }

    fn queue(&self, frame: Vec<u8>) -> Result<(), CallError> {
        let outgoing = self.outgoing.lock();
        match outgoing.as_ref() {
            Some(tx) => tx.send(frame).map_err(|_| self.dead_error()),
            None => Err(self.dead_error()),
        }
    }

    fn encode(&self, message: &BrokerMessage) -> Result<Vec<u8>, CallError> {
        let payload = self
            .serializer
            .serialize(message)
            .map_err(|e| CallError::Encoding(e.to_string()))?;
        encode_frame(&payload, self.settings.max_frame_size)
            .map_err(|e| CallError::Encoding(e.to_string()))
    }

    /// Sends a message that carries no values.
    fn send_plain(&self, message: BrokerMessage) -> Result<(), CallError> {
        let frame = self.encode(&message)?;
        self.queue(frame)
    }

    /// Sends a message built from values. Exports are committed only once
    /// the frame is queued; the export lock is held across both so a decref
    /// cannot overtake the commit.
    fn send_with<F>(&self, build: F) -> Result<(), CallError>
    where
        F: FnOnce(&mut Exporter<'_>) -> Result<BrokerMessage, CallError>,
    {
        let mut table = self.exports.lock();
        let mut exporter = Exporter {
            broker: self,
            table: &mut table,
            stage: ExportStage::default(),
            gifts: Vec::new(),
        };
        let message = build(&mut exporter)?;
        let Exporter { stage, gifts, .. } = exporter;
        let frame = self.encode(&message)?;

        // Gift markers go in before the frame can reach the recipient.
        let gift_ids: Vec<u64> = gifts.iter().map(|(id, _)| *id).collect();
        {
            let mut pending = self.gifts.lock();
            for (id, reference) in gifts {
                pending.insert(id, reference);
            }
        }
        if let Err(e) = self.queue(frame) {
            let removed: Vec<RemoteReference> = {
                let mut pending = self.gifts.lock();
                gift_ids.iter().filter_map(|id| pending.remove(*id)).collect()
            };
            drop(table);
            drop(removed);
            return Err(e);
        }
        table.commit(stage);
        Ok(())
    }

    pub(crate) fn call(
        &self,
        target: u64,
        method: &str,
        args: Vec<Value>,
        interface: Option<&Arc<InterfaceSchema>>,
    ) -> PendingCall {
        if !self.is_attached() {
            return PendingCall::ready(Err(self.dead_error()));
        }
        if let Some(schema) = interface {
            if let Err(violation) = schema.check_call(method, &args) {
                return PendingCall::ready(Err(violation.into()));
            }
        }
        let req_id = self.ids.next();
        let Some(rx) = self.calls.register(req_id) else {
            return PendingCall::ready(Err(self.dead_error()));
        };
        let returns = interface.map(|schema| (Arc::clone(schema), method.to_string()));
        let pending = PendingCall::waiting(req_id, rx, Arc::clone(&self.calls), returns);

        let sent = self.send_with(|exporter| {
            Ok(BrokerMessage::Call {
                req_id: Some(req_id),
                target,
                method: method.to_string(),
                args: args
                    .iter()
                    .map(|arg| exporter.export(arg))
                    .collect::<Result<_, _>>()?,
            })
        });
        match sent {
            Ok(()) => pending,
            Err(e) => {
                drop(pending);
                PendingCall::ready(Err(e))
            }
        }
    }

    pub(crate) fn call_only(
        &self,
        target: u64,
        method: &str,
        args: Vec<Value>,
        interface: Option<&Arc<InterfaceSchema>>,
    ) {
        if !self.is_attached() {
            return;
        }
        if let Some(schema) = interface {
            if schema.check_call(method, &args).is_err() {
                return;
            }
        }
        let sent = self.send_with(|exporter| {
            Ok(BrokerMessage::Call {
                req_id: None,
                target,
                method: method.to_string(),
                args: args
                    .iter()
                    .map(|arg| exporter.export(arg))
                    .collect::<Result<_, _>>()?,
            })
        });
        #[cfg(feature = "tracing")]
        if let Err(e) = &sent {
            debug!("dropped fire-and-forget call {}: {}", method, e);
        }
        let _ = sent;
    }

    /// Called when the last handle to an imported reference goes away.
    pub(crate) fn release_import(&self, clid: u64, proxy: *const RemoteInner, count: u32) {
        {
            let mut imports = self.imports.lock();
            if imports
                .get(&clid)
                .is_some_and(|weak| std::ptr::eq(weak.as_ptr(), proxy))
            {
                imports.remove(&clid);
            }
        }
        if count > 0 && self.is_attached() {
            let _ = self.send_plain(BrokerMessage::Decref { clid, count });
        }
    }

    fn import_reference(self: &Arc<Self>, clid: u64, furl: Option<String>) -> RemoteReference {
        let mut imports = self.imports.lock();
        if let Some(existing) = imports.get(&clid).and_then(Weak::upgrade) {
            existing.received.fetch_add(1, Ordering::AcqRel);
            return RemoteReference::from_inner(existing);
        }
        let inner = Arc::new(RemoteInner {
            broker: Arc::clone(self),
            clid,
            furl: furl.and_then(|f| f.parse::<Furl>().ok()),
            received: AtomicU32::new(1),
            tracked: true,
        });
        imports.insert(clid, Arc::downgrade(&inner));
        RemoteReference::from_inner(inner)
    }

    /// Converts a wire value, importing every reference in it even when an
    /// earlier part is bad, so that dropping the result balances the counts.
    fn import_value(
        self: &Arc<Self>,
        wire: WireValue,
        root: &str,
        path: &mut Vec<PathSegment>,
        gifts: &mut Vec<PendingGift>,
        violation: &mut Option<Violation>,
    ) -> Value {
        match wire {
            WireValue::None => Value::None,
            WireValue::Bool(b) => Value::Bool(b),
            WireValue::Int(i) => Value::Int(i),
            WireValue::Float(f) => Value::Float(f),
            WireValue::Str(s) => Value::Str(s),
            WireValue::Bytes(b) => Value::Bytes(b),
            WireValue::List(items) => Value::List(
                items
                    .into_iter()
                    .enumerate()
                    .map(|(index, item)| {
                        path.push(PathSegment::Index(index));
                        let value = self.import_value(item, root, path, gifts, violation);
                        path.pop();
                        value
                    })
                    .collect(),
            ),
            WireValue::Dict(entries) => Value::Dict(
                entries
                    .into_iter()
                    .map(|(key, item)| {
                        path.push(PathSegment::Key(key.clone()));
                        let value = self.import_value(item, root, path, gifts, violation);
                        path.pop();
                        (key, value)
                    })
                    .collect(),
            ),
            WireValue::MyReference { clid, furl } => {
                Value::Remote(self.import_reference(clid, furl))
            }
            WireValue::YourReference { clid } => match self.exports.lock().get(clid) {
                Some(object) => Value::Local(object),
                None => {
                    violation.get_or_insert_with(|| {
                        Violation::new(describe(root, path), format!("unknown reference {}", clid))
                    });
                    Value::None
                }
            },
            WireValue::TheirReference { furl, gift_id } => {
                gifts.push(PendingGift {
                    path: path.clone(),
                    furl,
                    gift_id,
                });
                Value::None
            }
        }
    }

    fn import(
        self: &Arc<Self>,
        wire: WireValue,
        root: &str,
    ) -> (Value, Vec<PendingGift>, Option<Violation>) {
        let mut gifts = Vec::new();
        let mut violation = None;
        let value = self.import_value(wire, root, &mut Vec::new(), &mut gifts, &mut violation);
        (value, gifts, violation)
    }

    /// Tells the sender of unclaimed gifts to drop its markers.
    fn decline_gifts(&self, gifts: Vec<PendingGift>) {
        for gift in gifts {
            let _ = self.send_plain(BrokerMessage::DecGift {
                gift_id: gift.gift_id,
            });
        }
    }

    /// Fetches each gift through the Tub and patches it into `root`.
    async fn resolve_gifts(&self, root: &mut Value, gifts: Vec<PendingGift>) -> Result<(), CallError> {
        let resolver = self.resolver.upgrade();
        let mut first_error = None;
        for gift in gifts {
            let result = match (&resolver, gift.furl.parse::<Furl>()) {
                (Some(resolver), Ok(furl)) => resolver.resolve_gift(&furl).await,
                (None, _) => Err(CallError::GiftUnavailable {
                    furl: gift.furl.clone(),
                    reason: "the Tub is gone".to_string(),
                }),
                (_, Err(e)) => Err(CallError::GiftUnavailable {
                    furl: gift.furl.clone(),
                    reason: e.to_string(),
                }),
            };
            let _ = self.send_plain(BrokerMessage::DecGift {
                gift_id: gift.gift_id,
            });
            match result {
                Ok(value) => {
                    if let Some(slot) = root.at_path_mut(&gift.path) {
                        *slot = value;
                    }
                }
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    warn!("gift {} from {} unavailable: {}", gift.furl, self.peer().short(), e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn dispatch(self: &Arc<Self>, message: BrokerMessage) {
        if self.state() == BrokerState::Detached {
            return;
        }
        match message {
            BrokerMessage::Call {
                req_id,
                target,
                method,
                args,
            } => self.receive_call(req_id, target, method, args),
            BrokerMessage::Answer { req_id, value } => self.receive_answer(req_id, value),
            BrokerMessage::Error { req_id, failure } => {
                let Some(waiter) = self.calls.take(req_id) else {
                    #[cfg(feature = "tracing")]
                    warn!("error for unknown request {} from {}", req_id, self.peer().short());
                    return;
                };
                let error = match failure.violation.clone() {
                    Some(violation) if self.settings.expose_remote_exception_types => {
                        CallError::Violation(violation)
                    }
                    _ => CallError::Remote(RemoteException(failure)),
                };
                let _ = waiter.send(Err(error));
            }
            BrokerMessage::Decref { clid, count } => {
                if clid == ROOT_CLID {
                    return;
                }
                let outcome = self.exports.lock().decref(clid, count);
                match outcome {
                    Decref::Unknown => {
                        #[cfg(feature = "tracing")]
                        warn!("decref of unknown clid {} from {}", clid, self.peer().short());
                    }
                    Decref::Remaining(_remaining) => {
                        #[cfg(feature = "tracing")]
                        debug!("clid {} still held {} times by {}", clid, _remaining, self.peer().short());
                    }
                    Decref::Released(object) => {
                        #[cfg(feature = "tracing")]
                        debug!("released clid {} for {}", clid, self.peer().short());
                        drop(object);
                    }
                }
            }
            BrokerMessage::DecGift { gift_id } => {
                let gift = self.gifts.lock().remove(gift_id);
                #[cfg(feature = "tracing")]
                if gift.is_none() {
                    debug!("decgift for unknown gift {} from {}", gift_id, self.peer().short());
                }
                drop(gift);
            }
        }
    }

    fn receive_call(
        self: &Arc<Self>,
        req_id: Option<u64>,
        target: u64,
        method: String,
        args: Vec<WireValue>,
    ) {
        let object = self.exports.lock().get(target);
        let (args, gifts, violation) = self.import(WireValue::List(args), "args");
        let Some(object) = object else {
            #[cfg(feature = "tracing")]
            warn!("call {} on unknown clid {} from {}", method, target, self.peer().short());
            drop(args);
            self.decline_gifts(gifts);
            if let Some(req_id) = req_id {
                self.reply(
                    req_id,
                    Err(Failure::new(
                        "UnknownReference",
                        format!("no object with clid {}", target),
                    )),
                );
            }
            return;
        };
        if let Some(violation) = violation {
            drop(args);
            self.decline_gifts(gifts);
            if let Some(req_id) = req_id {
                self.reply(req_id, Err(violation.into()));
            }
            return;
        }
        let call = InboundCall {
            req_id,
            object,
            method,
            args,
            gifts,
        };
        let queued = self.inbound.lock().as_ref().map(|tx| tx.send(call));
        #[cfg(feature = "tracing")]
        if !matches!(queued, Some(Ok(()))) {
            debug!("dropping inbound call from {}: broker is closing", self.peer().short());
        }
        drop(queued);
    }

    fn receive_answer(self: &Arc<Self>, req_id: u64, value: WireValue) {
        let waiter = self.calls.take(req_id);
        let (mut value, gifts, violation) = self.import(value, "result");
        let Some(waiter) = waiter else {
            #[cfg(feature = "tracing")]
            warn!("answer for unknown request {} from {}", req_id, self.peer().short());
            drop(value);
            self.decline_gifts(gifts);
            return;
        };
        if let Some(violation) = violation {
            drop(value);
            self.decline_gifts(gifts);
            let _ = waiter.send(Err(violation.into()));
            return;
        }
        if gifts.is_empty() {
            let _ = waiter.send(Ok(value));
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let result = this.resolve_gifts(&mut value, gifts).await.map(|()| value);
            let _ = waiter.send(result);
        });
    }

    async fn invoke(&self, call: InboundCall) -> Result<Value, Failure> {
        let InboundCall {
            object,
            method,
            mut args,
            gifts,
            ..
        } = call;
        self.resolve_gifts(&mut args, gifts)
            .await
            .map_err(CallError::into_failure)?;
        let args = match args {
            Value::List(args) => args,
            _ => Vec::new(),
        };
        let schema = object.schema();
        if let Some(schema) = &schema {
            schema.check_call(&method, &args)?;
        }
        let result = object.remote_call(&method, args).await?;
        if let Some(schema) = &schema {
            schema.check_return(&method, &result)?;
        }
        Ok(result)
    }

    fn reply(&self, req_id: u64, result: Result<Value, Failure>) {
        let failure = match result {
            Ok(value) => {
                let sent = self.send_with(|exporter| {
                    Ok(BrokerMessage::Answer {
                        req_id,
                        value: exporter.export(&value)?,
                    })
                });
                match sent {
                    Ok(()) => return,
                    Err(e) if e.is_dead_reference() => return,
                    Err(e) => e.into_failure(),
                }
            }
            Err(failure) => failure,
        };
        let _ = self.send_plain(BrokerMessage::Error { req_id, failure });
    }

    /// Poisons the connection. Idempotent.
    fn finalize(&self, reason: &str) {
        if self.state.send_replace(BrokerState::Detached) == BrokerState::Detached {
            return;
        }
        *self.detach_reason.lock() = Some(reason.to_string());

        let outgoing = self.outgoing.lock().take();
        let inbound = self.inbound.lock().take();
        drop(outgoing);
        drop(inbound);

        let failed = self.calls.fail_all(&CallError::dead(reason));
        let exports = self.exports.lock().clear();
        let imports = std::mem::take(&mut *self.imports.lock());
        let gifts = self.gifts.lock().take_all();
        drop(exports);
        drop(imports);
        drop(gifts);

        self.notifier.fire();

        #[cfg(feature = "tracing")]
        info!(
            "connection to {} detached: {} ({} calls failed)",
            self.peer().short(),
            reason,
            failed
        );
        let _ = failed;
    }
}

async fn read_loop(shared: Arc<BrokerShared>, mut reader: ReadHalf<BoxedTransport>) {
    let reason = loop {
        match read_frame(&mut reader, shared.settings.max_frame_size).await {
            Ok(frame) => match shared.serializer.deserialize::<BrokerMessage>(&frame) {
                Ok(message) => shared.dispatch(message),
                Err(e) => break format!("undecodable message: {}", e),
            },
            Err(e) if e.is_eof() => break "connection closed".to_string(),
            Err(e) => break format!("connection lost: {}", e),
        }
    };
    shared.finalize(&reason);
}

async fn write_loop(mut writer: WriteHalf<BoxedTransport>, mut frames: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(frame) = frames.recv().await {
        if let Err(_e) = writer.write_all(&frame).await {
            #[cfg(feature = "tracing")]
            debug!("write failed: {}", _e);
            return;
        }
    }
    let _ = writer.shutdown().await;
}

/// Runs inbound calls, starting them in arrival order.
async fn serve_calls(shared: Weak<BrokerShared>, mut calls: mpsc::UnboundedReceiver<InboundCall>) {
    let mut running: FuturesUnordered<Invocation> = FuturesUnordered::new();
    loop {
        tokio::select! {
            biased;
            call = calls.recv() => {
                let Some(call) = call else { break };
                let Some(shared) = shared.upgrade() else { break };
                running.push(Box::pin(async move {
                    let req_id = call.req_id;
                    let result = shared.invoke(call).await;
                    match req_id {
                        Some(req_id) => shared.reply(req_id, result),
                        None => {
                            #[cfg(feature = "tracing")]
                            if let Err(failure) = &result {
                                debug!("fire-and-forget call failed: {}", failure);
                            }
                        }
                    }
                }));
            }
            Some(()) = running.next(), if !running.is_empty() => {}
        }
    }
    while running.next().await.is_some() {}
}

/// One live connection to a peer Tub.
///
/// Cloning a `Broker` yields another handle to the same connection.
#[derive(Clone)]
pub struct Broker {
    shared: Arc<BrokerShared>,
}

impl Broker {
    /// Takes over an accepted connection and starts serving it.
    ///
    /// `root` answers calls on CLID 0. `resolver` is consulted for FURLs of
    /// exported objects and for fetching gifts.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        transport: BoxedTransport,
        info: ConnectionInfo,
        root: Arc<dyn Referenceable>,
        resolver: Weak<dyn ReferenceResolver>,
        settings: BrokerSettings,
    ) -> Self {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(BrokerState::Attached);
        let label = transport.metadata().peer();

        let shared = Arc::new(BrokerShared {
            info,
            settings,
            serializer: PostcardSerializer::new(),
            state,
            outgoing: Mutex::new(Some(outgoing_tx)),
            inbound: Mutex::new(Some(inbound_tx)),
            exports: Mutex::new(ExportTable::new(root)),
            imports: Mutex::new(HashMap::new()),
            gifts: Mutex::new(GiftTable::default()),
            next_gift: AtomicU64::new(1),
            calls: Arc::new(PendingCalls::new()),
            ids: RequestIdGenerator::new(),
            notifier: DisconnectNotifier::new(),
            resolver,
            detach_reason: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        });

        #[cfg(feature = "tracing")]
        info!(
            "attached to {} via {} (seq {}, {:?})",
            shared.info.peer.short(),
            label,
            shared.info.seq,
            shared.info.role
        );
        let _ = label;

        let (reader, writer) = tokio::io::split(transport);
        let tasks = vec![
            tokio::spawn(read_loop(Arc::clone(&shared), reader)),
            tokio::spawn(write_loop(writer, outgoing_rx)),
            tokio::spawn(serve_calls(Arc::downgrade(&shared), inbound_rx)),
        ];
        *shared.tasks.lock() = tasks;

        Self { shared }
    }

    /// The connected Tub.
    pub fn peer(&self) -> &TubId {
        self.shared.peer()
    }

    /// What negotiation agreed on.
    pub fn info(&self) -> &ConnectionInfo {
        &self.shared.info
    }

    /// Current lifecycle state.
    pub fn state(&self) -> BrokerState {
        self.shared.state()
    }

    /// Returns `true` while calls can be sent.
    pub fn is_attached(&self) -> bool {
        self.shared.is_attached()
    }

    /// Why the connection detached, once it has.
    pub fn detach_reason(&self) -> Option<String> {
        self.shared.detach_reason.lock().clone()
    }

    /// A reference to the peer's root object.
    pub fn root(&self) -> RemoteReference {
        RemoteReference::from_inner(Arc::new(RemoteInner {
            broker: Arc::clone(&self.shared),
            clid: ROOT_CLID,
            furl: None,
            received: AtomicU32::new(0),
            tracked: false,
        }))
    }

    /// How many times the object under `clid` has been sent and not yet
    /// released by the peer.
    pub fn exported_count(&self, clid: u64) -> Option<u32> {
        self.shared.exports.lock().refcount(clid)
    }

    /// Number of objects currently exported over this connection.
    pub fn exported_objects(&self) -> usize {
        self.shared.exports.lock().len()
    }

    /// Number of live proxies for objects of the peer.
    pub fn imported_count(&self) -> usize {
        self.shared
            .imports
            .lock()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Number of gifts sent and not yet claimed.
    pub fn pending_gifts(&self) -> usize {
        self.shared.gifts.lock().len()
    }

    /// Number of calls awaiting an answer.
    pub fn pending_calls(&self) -> usize {
        self.shared.calls.len()
    }

    /// Runs `callback` once when the connection is lost.
    pub fn on_disconnect<F>(&self, callback: F) -> DisconnectToken
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.notifier.on_disconnect(callback)
    }

    /// Cancels a disconnect callback. Idempotent.
    pub fn cancel_disconnect(&self, token: DisconnectToken) -> bool {
        self.shared.notifier.cancel(token)
    }

    /// Begins an orderly close: no new calls are sent, queued frames are
    /// flushed, and the broker detaches when the peer closes its side.
    pub fn disconnect(&self) {
        let changed = self.shared.state.send_if_modified(|state| {
            if *state == BrokerState::Attached {
                *state = BrokerState::Disconnecting;
                true
            } else {
                false
            }
        });
        if changed {
            #[cfg(feature = "tracing")]
            info!("disconnecting from {}", self.peer().short());
            let outgoing = self.shared.outgoing.lock().take();
            drop(outgoing);
        }
    }

    /// Detaches immediately and stops the connection's tasks.
    pub fn terminate(&self, reason: &str) {
        self.shared.finalize(reason);
        for task in self.shared.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Waits until the broker is detached.
    pub async fn wait_detached(&self) {
        let mut state = self.shared.state.subscribe();
        let _ = state.wait_for(|s| *s == BrokerState::Detached).await;
    }

    /// Returns `true` if both handles drive the same connection.
    pub fn same_connection(&self, other: &Broker) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("peer", &self.peer().short())
            .field("seq", &self.shared.info.seq)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MethodSchema, ValueKind};
    use crate::identity::SequenceNumber;
    use crate::negotiation::Role;
    use crate::transport::MemoryTransport;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Root object: echoes, keeps values, or hangs.
    #[derive(Default)]
    struct Keeper {
        kept: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl Referenceable for Keeper {
        async fn remote_call(&self, method: &str, mut args: Vec<Value>) -> Result<Value, Failure> {
            match method {
                "echo" => Ok(args.pop().unwrap_or_default()),
                "keep" => {
                    self.kept.lock().extend(args);
                    Ok(Value::None)
                }
                "clear" => {
                    let kept = std::mem::take(&mut *self.kept.lock());
                    drop(kept);
                    Ok(Value::None)
                }
                "hang" => {
                    std::future::pending::<()>().await;
                    Ok(Value::None)
                }
                _ => Err(Failure::no_such_method(method)),
            }
        }
    }

    struct NoResolver;

    #[async_trait]
    impl ReferenceResolver for NoResolver {
        fn furl_for(&self, _object: &Arc<dyn Referenceable>) -> Option<Furl> {
            None
        }

        async fn resolve_gift(&self, furl: &Furl) -> Result<Value, CallError> {
            Err(CallError::GiftUnavailable {
                furl: furl.to_string(),
                reason: "no resolver".to_string(),
            })
        }
    }

    fn info(peer: &TubId) -> ConnectionInfo {
        ConnectionInfo {
            peer: peer.clone(),
            peer_incarnation: None,
            version: 1,
            seq: SequenceNumber::FIRST,
            role: Role::Master,
            initiated: true,
            verdict: None,
        }
    }

    fn pair_with(left_root: Arc<Keeper>, right_root: Arc<Keeper>) -> (Broker, Broker) {
        let (a, b) = MemoryTransport::pair_default();
        let none: Weak<dyn ReferenceResolver> = Weak::<NoResolver>::new();
        let left = Broker::start(
            Box::new(a),
            info(&TubId::generate()),
            left_root,
            none.clone(),
            BrokerSettings::default(),
        );
        let right = Broker::start(
            Box::new(b),
            info(&TubId::generate()),
            right_root,
            none,
            BrokerSettings::default(),
        );
        (left, right)
    }

    fn pair() -> (Broker, Broker) {
        pair_with(Arc::default(), Arc::default())
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    #[tokio::test]
    async fn test_call_root() {
        let (left, _right) = pair();
        let answer = left.root().call_remote("echo", vec![Value::from("hi")]).await;
        assert_eq!(answer.unwrap(), Value::from("hi"));

        let err = left.root().call_remote("nope", vec![]).await.unwrap_err();
        assert!(err.is_remote());
    }

    #[tokio::test]
    async fn test_echoed_object_comes_home() {
        let (left, right) = pair();
        let object = Value::local(Keeper::default());
        let answer = left
            .root()
            .call_remote("echo", vec![Value::List(vec![object.clone(), object.clone()])])
            .await
            .unwrap();

        let items = answer.as_list().unwrap();
        assert_eq!(items[0], object);
        assert_eq!(items[1], object);

        // The far side dropped its proxy once the call returned.
        assert!(eventually(|| left.exported_objects() == 0).await);
        assert_eq!(right.imported_count(), 0);
    }

    #[tokio::test]
    async fn test_refcount_follows_sends() {
        let right_root = Arc::new(Keeper::default());
        let (left, right) = pair_with(Arc::default(), right_root.clone());
        let object = Value::local(Keeper::default());

        for _ in 0..3 {
            left.root()
                .call_remote("keep", vec![object.clone()])
                .await
                .unwrap();
        }
        assert_eq!(left.exported_objects(), 1);
        assert_eq!(left.exported_count(1), Some(3));
        assert_eq!(right.imported_count(), 1);

        // Every kept value is the same proxy.
        {
            let kept = right_root.kept.lock();
            assert_eq!(kept.len(), 3);
            assert_eq!(kept[0], kept[2]);
        }

        left.root().call_remote("clear", vec![]).await.unwrap();
        assert!(eventually(|| left.exported_count(1).is_none()).await);
        assert_eq!(right.imported_count(), 0);

        // Sent again after release, it gets a fresh id.
        left.root()
            .call_remote("keep", vec![object.clone()])
            .await
            .unwrap();
        assert_eq!(left.exported_count(2), Some(1));
    }

    #[tokio::test]
    async fn test_teardown_poisons_everything() {
        let right_root = Arc::new(Keeper::default());
        let (left, right) = pair_with(Arc::default(), right_root.clone());
        left.root()
            .call_remote("keep", vec![Value::local(Keeper::default())])
            .await
            .unwrap();
        let proxy = right_root.kept.lock()[0].as_remote().cloned().unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let root = left.root();
        let token = root.on_disconnect(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let hanging = root.call_remote("hang", vec![]);
        tokio::task::yield_now().await;
        right.terminate("test");

        assert!(hanging.await.unwrap_err().is_dead_reference());
        left.wait_detached().await;
        assert_eq!(left.state(), BrokerState::Detached);
        assert!(!root.is_connected());
        assert!(!proxy.is_connected());
        assert!(root.call_remote("echo", vec![]).await.unwrap_err().is_dead_reference());
        assert!(proxy.call_remote("echo", vec![]).await.unwrap_err().is_dead_reference());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(left.exported_objects(), 0);
        assert_eq!(right.imported_count(), 0);

        assert!(!root.cancel_disconnect(token));
        assert!(!root.cancel_disconnect(token));
        assert!(left.detach_reason().is_some());
    }

    #[tokio::test]
    async fn test_graceful_disconnect() {
        let (left, right) = pair();
        left.disconnect();
        assert_eq!(left.state(), BrokerState::Disconnecting);
        assert!(left
            .root()
            .call_remote("echo", vec![])
            .await
            .unwrap_err()
            .is_dead_reference());
        right.wait_detached().await;
        left.wait_detached().await;
    }

    #[tokio::test]
    async fn test_interface_checked_before_sending() {
        let (left, _right) = pair();
        let schema = Arc::new(
            InterfaceSchema::new("Keeper")
                .method("echo", MethodSchema::new(vec![ValueKind::Int], ValueKind::Int)),
        );
        let root = left.root().with_interface(schema);

        let call = root.call_remote("echo", vec![Value::from("x")]);
        assert!(call.request_id().is_none());
        assert!(call.await.unwrap_err().is_violation());

        let answer = root.call_remote("echo", vec![Value::Int(3)]).await.unwrap();
        assert_eq!(answer, Value::Int(3));
    }

    #[tokio::test]
    async fn test_fire_and_forget() {
        let right_root = Arc::new(Keeper::default());
        let (left, _right) = pair_with(Arc::default(), right_root.clone());
        left.root().call_remote_only("keep", vec![Value::Int(5)]);
        left.root().call_remote_only("nope", vec![]);
        assert_eq!(left.pending_calls(), 0);
        assert!(eventually(|| right_root.kept.lock().len() == 1).await);
        assert_eq!(right_root.kept.lock()[0], Value::Int(5));
    }
}

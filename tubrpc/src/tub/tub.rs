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

use crate::broker::{
    Broker, BrokerSettings, CallError, Failure, InterfaceSchema, MethodSchema,
    ReferenceResolver, Referenceable, RemoteReference, Value, ValueKind, Violation,
};
use crate::error::TubError;
use crate::identity::{Furl, Incarnation, LocationHint, TubId};
use crate::negotiation::{Established, NegotiationContext, NegotiationError, Negotiator};
use crate::reconnection::Reconnector;
use crate::transport::{Transport, TransportError, TransportListener};
use crate::tub::peers::PeerTable;
use crate::tub::race::{ConnectionRace, ConnectionRaceExhausted, HintReport};
use crate::tub::registry::Registry;
use crate::tub::TubConfig;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[cfg(feature = "tracing")]
use tracing::{debug, info, warn};

/// Method of every root object that looks up a registered name.
pub const GET_REFERENCE_BY_NAME: &str = "get_reference_by_name";

type RaceOutcome = Result<(Broker, Vec<HintReport>), ConnectionRaceExhausted>;

struct RaceSlot {
    id: u64,
    result: watch::Receiver<Option<RaceOutcome>>,
    task: JoinHandle<()>,
}

/// A secure RPC endpoint.
///
/// A Tub owns a [`TubId`], publishes objects under names (reachable from
/// other Tubs through FURLs), accepts connections on any number of
/// listeners and keeps at most one live connection per peer Tub.
///
/// Cloning a `Tub` yields another handle to the same endpoint.
///
/// # Examples
///
/// ```rust
/// use async_trait::async_trait;
/// use std::sync::Arc;
/// use tubrpc::broker::{Failure, Referenceable, Value};
/// use tubrpc::identity::LocationHint;
/// use tubrpc::transport::MemoryNetwork;
/// use tubrpc::tub::{Tub, TubConfig};
///
/// struct Greeter;
///
/// #[async_trait]
/// impl Referenceable for Greeter {
///     async fn remote_call(&self, method: &str, args: Vec<Value>) -> Result<Value, Failure> {
///         match (method, args.first().and_then(Value::as_str)) {
///             ("greet", Some(name)) => Ok(Value::Str(format!("hello, {}", name))),
///             _ => Err(Failure::no_such_method(method)),
///         }
///     }
/// }
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let network = MemoryNetwork::new();
/// let server = Tub::new(TubConfig::new().with_resolver(Arc::new(network.clone())))?;
/// server.listen(network.bind("server")?, LocationHint::memory("server"))?;
/// let furl = server.register(Arc::new(Greeter), Some("greeter"))?;
///
/// let client = Tub::new(TubConfig::new().with_resolver(Arc::new(network.clone())))?;
/// let greeter = client.get_reference(&furl).await?;
/// let answer = greeter.call_remote("greet", vec!["bob".into()]).await?;
/// assert_eq!(answer.as_str(), Some("hello, bob"));
///
/// client.shutdown().await;
/// server.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Tub {
    inner: Arc<TubInner>,
}

pub(crate) struct TubInner {
    config: TubConfig,
    id: TubId,
    ctx: Arc<NegotiationContext>,
    peers: Arc<PeerTable>,
    registry: Mutex<Registry>,
    hints: Mutex<Vec<LocationHint>>,
    races: Mutex<HashMap<TubId, RaceSlot>>,
    next_race: AtomicU64,
    listeners: Mutex<Vec<JoinHandle<()>>>,
    reconnectors: Mutex<Vec<Reconnector>>,
    root: Arc<dyn Referenceable>,
    this: Weak<TubInner>,
    shut_down: AtomicBool,
}

impl Tub {
    /// Creates a Tub.
    ///
    /// The identity comes from the security layer when it proves one (TLS),
    /// otherwise from `config.tub_id`, otherwise it is generated.
    ///
    /// # Errors
    ///
    /// Returns [`TubError::Config`] if the configuration does not validate.
    pub fn new(config: TubConfig) -> Result<Self, TubError> {
        config
            .validate()
            .map_err(|reason| TubError::Config { reason })?;

        let id = config
            .security
            .local_tub_id()
            .or_else(|| config.tub_id.clone())
            .unwrap_or_else(TubId::generate);
        let incarnation = Incarnation::generate();
        let peers = Arc::new(PeerTable::default());
        let ctx = Arc::new(
            NegotiationContext::new(id.clone(), incarnation)
                .with_versions(config.version_range)
                .with_timeout(config.negotiation_timeout)
                .with_limits(config.max_frame_size, config.max_preamble_size)
                .with_policy(config.arbiter_policy())
                .with_security(Arc::clone(&config.security))
                .with_activity(Arc::clone(&peers) as _),
        );

        #[cfg(feature = "tracing")]
        info!(
            "tub {} created (incarnation {}, {})",
            id.short(),
            incarnation,
            config.security.name()
        );

        let inner = Arc::new_cyclic(|this: &Weak<TubInner>| TubInner {
            config,
            id,
            ctx,
            peers,
            registry: Mutex::new(Registry::default()),
            hints: Mutex::new(Vec::new()),
            races: Mutex::new(HashMap::new()),
            next_race: AtomicU64::new(0),
            listeners: Mutex::new(Vec::new()),
            reconnectors: Mutex::new(Vec::new()),
            root: Arc::new(RootObject { tub: this.clone() }),
            this: this.clone(),
            shut_down: AtomicBool::new(false),
        });
        Ok(Self { inner })
    }

    /// This Tub's identity.
    pub fn tub_id(&self) -> &TubId {
        &self.inner.id
    }

    /// This Tub's incarnation, new for every constructed Tub.
    pub fn incarnation(&self) -> Incarnation {
        self.inner.ctx.incarnation
    }

    /// The configuration the Tub was created with.
    pub fn config(&self) -> &TubConfig {
        &self.inner.config
    }

    /// Publishes `object` and returns its FURL.
    ///
    /// With `None` an unguessable name is generated (or the name the object
    /// already has is reused). The FURL lists the hints of every listener
    /// started so far.
    ///
    /// # Errors
    ///
    /// Returns [`TubError::NameInUse`] when another object holds the name,
    /// [`TubError::InvalidName`] for an empty name or one containing `/`,
    /// and [`TubError::ShutDown`] after shutdown.
    pub fn register(
        &self,
        object: Arc<dyn Referenceable>,
        name: Option<&str>,
    ) -> Result<Furl, TubError> {
        self.inner.check_running()?;
        let name = self
            .inner
            .registry
            .lock()
            .register(object, name.map(str::to_string))?;

        #[cfg(feature = "tracing")]
        debug!("registered '{}'", name);

        Ok(Furl::new(self.inner.id.clone(), self.inner.advertised(), name)?)
    }

    /// Removes a published name. Returns `false` if it was not registered.
    ///
    /// References peers already hold stay valid; new lookups fail.
    pub fn unregister(&self, name: &str) -> bool {
        self.inner.registry.lock().unregister(name)
    }

    /// The FURL of a registered object, if it has one.
    pub fn furl_for(&self, object: &Arc<dyn Referenceable>) -> Option<Furl> {
        let name = self.inner.registry.lock().name_of(object)?;
        Furl::new(self.inner.id.clone(), self.inner.advertised(), name).ok()
    }

    /// Accepts connections from `listener` and advertises `hint` in FURLs
    /// created from now on.
    ///
    /// Each inbound transport is negotiated in the listener role; accepted
    /// connections become brokers like outbound ones. The accept loop runs
    /// until [`shutdown`](Self::shutdown) or until the listener closes.
    ///
    /// # Errors
    ///
    /// Returns [`TubError::ShutDown`] after shutdown.
    pub fn listen<L>(&self, listener: L, hint: LocationHint) -> Result<(), TubError>
    where
        L: TransportListener,
    {
        self.inner.check_running()?;

        #[cfg(feature = "tracing")]
        info!("tub {} listening on {}", self.inner.id.short(), hint);

        self.inner.hints.lock().push(hint.clone());
        let task = tokio::spawn(accept_loop(Arc::downgrade(&self.inner), listener, hint));
        self.inner.listeners.lock().push(task);
        Ok(())
    }

    /// Connects to the Tub named by `furl` and looks up the object.
    ///
    /// An already-live connection to that Tub is reused, whatever hints the
    /// FURL lists. Otherwise every hint is raced and the first accepted
    /// connection is used.
    ///
    /// # Errors
    ///
    /// - [`TubError::RaceExhausted`] with a per-hint report when no hint
    ///   led to a connection
    /// - [`TubError::Call`] when the peer does not know the name
    /// - [`TubError::Negotiation`] for a FURL of this Tub itself
    /// - [`TubError::ShutDown`] after shutdown
    pub async fn get_reference(&self, furl: &Furl) -> Result<RemoteReference, TubError> {
        self.inner
            .fetch(furl)
            .await
            .map(|(reference, _report)| reference)
    }

    /// Keeps a reference to `furl` alive, calling `callback` with every
    /// fresh reference.
    ///
    /// After a loss the configured reconnection strategy decides when to try
    /// again. The reconnector stops on [`Reconnector::stop`], when the
    /// strategy gives up, or at shutdown.
    pub fn connect_to<F>(&self, furl: Furl, callback: F) -> Reconnector
    where
        F: Fn(RemoteReference) + Send + Sync + 'static,
    {
        let reconnector = Reconnector::start(
            Arc::downgrade(&self.inner),
            furl,
            Arc::clone(&self.inner.config.reconnection_strategy),
            callback,
        );
        self.inner.reconnectors.lock().push(reconnector.clone());
        if self.is_shut_down() {
            reconnector.stop();
        }
        reconnector
    }

    /// The live connection to `peer`, if there is one.
    pub fn broker_for(&self, peer: &TubId) -> Option<Broker> {
        self.inner.peers.live(peer)
    }

    /// Peers with a live connection.
    pub fn connected_peers(&self) -> Vec<TubId> {
        self.inner.peers.connected()
    }

    /// Returns `true` once [`shutdown`](Self::shutdown) has been called.
    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    /// Stops accepting connections and closes every connection.
    ///
    /// Connections are first closed in an orderly way; those still open
    /// after `shutdown_timeout` are torn down. Either way every pending
    /// call fails with a dead-reference error. Idempotent.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        #[cfg(feature = "tracing")]
        info!("tub {} shutting down", self.inner.id.short());

        for task in self.inner.listeners.lock().drain(..) {
            task.abort();
        }
        let reconnectors: Vec<Reconnector> = self.inner.reconnectors.lock().drain(..).collect();
        for reconnector in reconnectors {
            reconnector.stop();
        }
        let races: Vec<RaceSlot> = self.inner.races.lock().drain().map(|(_, slot)| slot).collect();
        for race in races {
            race.task.abort();
        }

        let brokers = self.inner.peers.brokers();
        for broker in &brokers {
            broker.disconnect();
        }
        let drained = futures_util::future::join_all(brokers.iter().map(Broker::wait_detached));
        if tokio::time::timeout(self.inner.config.shutdown_timeout, drained)
            .await
            .is_err()
        {
            #[cfg(feature = "tracing")]
            warn!("connections still open after {:?}", self.inner.config.shutdown_timeout);
        }
        for broker in brokers {
            broker.terminate("tub shut down");
        }
    }
}

impl fmt::Debug for Tub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tub")
            .field("tub_id", &self.inner.id)
            .field("incarnation", &self.inner.ctx.incarnation)
            .field("hints", &*self.inner.hints.lock())
            .field("connected_peers", &self.connected_peers().len())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl TubInner {
    fn check_running(&self) -> Result<(), TubError> {
        if self.shut_down.load(Ordering::Acquire) {
            Err(TubError::ShutDown)
        } else {
            Ok(())
        }
    }

    fn advertised(&self) -> Vec<LocationHint> {
        self.hints.lock().clone()
    }

    /// Connects to `furl`'s Tub and looks up its name.
    pub(crate) async fn fetch(
        self: &Arc<Self>,
        furl: &Furl,
    ) -> Result<(RemoteReference, Vec<HintReport>), TubError> {
        let (broker, report) = self.connect(furl).await?;
        let value = broker
            .root()
            .call_remote(GET_REFERENCE_BY_NAME, vec![Value::Str(furl.name().to_string())])
            .await?;
        let reference = value.into_remote().ok_or_else(|| {
            CallError::from(Violation::new(
                GET_REFERENCE_BY_NAME,
                "the peer answered with something other than a reference",
            ))
        })?;
        Ok((reference, report))
    }

    /// Returns the live broker to `furl`'s Tub, racing its hints if needed.
    ///
    /// Concurrent callers for the same Tub join one race.
    async fn connect(self: &Arc<Self>, furl: &Furl) -> Result<(Broker, Vec<HintReport>), TubError> {
        self.check_running()?;
        let target = furl.tub_id();
        if *target == self.id {
            return Err(NegotiationError::SelfConnection(target.clone()).into());
        }
        if let Some(broker) = self.peers.live(target) {
            return Ok((broker, Vec::new()));
        }

        let mut result = {
            let mut races = self.races.lock();
            match races.get(target) {
                Some(slot) => slot.result.clone(),
                None => {
                    let id = self.next_race.fetch_add(1, Ordering::Relaxed);
                    let (tx, rx) = watch::channel(None);
                    let race = ConnectionRace::new(
                        Arc::clone(&self.ctx),
                        Arc::clone(&self.peers),
                        self.config.resolvers.clone(),
                        target.clone(),
                        furl.hints().to_vec(),
                    );
                    let tub = Arc::clone(self);
                    let peer = target.clone();
                    let task = tokio::spawn(async move {
                        let outcome = race.run(|established| tub.attach(established)).await;
                        tx.send_replace(Some(outcome));
                        let mut races = tub.races.lock();
                        if races.get(&peer).is_some_and(|slot| slot.id == id) {
                            races.remove(&peer);
                        }
                    });
                    races.insert(
                        target.clone(),
                        RaceSlot {
                            id,
                            result: rx.clone(),
                            task,
                        },
                    );
                    rx
                }
            }
        };

        let outcome = match result.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        match outcome {
            Some(Ok(connected)) => Ok(connected),
            Some(Err(exhausted)) => Err(exhausted.into()),
            None => Err(TubError::ShutDown),
        }
    }

    /// Starts a broker on an accepted connection.
    fn attach(&self, established: Established) -> Broker {
        let Established {
            info,
            transport,
            hold,
        } = established;
        let settings = BrokerSettings::default()
            .with_max_frame_size(self.config.max_frame_size)
            .with_remote_exception_types(self.config.expose_remote_exception_types);
        let resolver: Weak<dyn ReferenceResolver> = self.this.clone();
        let broker = Broker::start(transport, info, Arc::clone(&self.root), resolver, settings);

        if let Some(old) = self.peers.attach(&broker) {
            #[cfg(feature = "tracing")]
            info!(
                "connection to {} (seq {}) superseded by seq {}",
                old.peer().short(),
                old.info().seq,
                broker.info().seq
            );
            old.terminate("superseded by a newer connection");
        }

        let peers = Arc::clone(&self.peers);
        let watched = broker.clone();
        tokio::spawn(async move {
            watched.wait_detached().await;
            peers.detach(&watched);
        });
        hold.release();

        if self.shut_down.load(Ordering::Acquire) {
            broker.terminate("tub shut down");
        }
        broker
    }
}

#[async_trait]
impl ReferenceResolver for TubInner {
    fn furl_for(&self, object: &Arc<dyn Referenceable>) -> Option<Furl> {
        let name = self.registry.lock().name_for_export(object);
        Furl::new(self.id.clone(), self.advertised(), name).ok()
    }

    async fn resolve_gift(&self, furl: &Furl) -> Result<Value, CallError> {
        let unavailable = |reason: String| CallError::GiftUnavailable {
            furl: furl.to_string(),
            reason,
        };
        if *furl.tub_id() == self.id {
            return self
                .registry
                .lock()
                .lookup(furl.name())
                .map(Value::Local)
                .ok_or_else(|| unavailable(format!("no object named '{}'", furl.name())));
        }
        let this = self
            .this
            .upgrade()
            .ok_or_else(|| unavailable("the tub is gone".to_string()))?;
        this.fetch(furl)
            .await
            .map(|(reference, _)| Value::Remote(reference))
            .map_err(|e| unavailable(e.to_string()))
    }
}

async fn accept_loop<L>(tub: Weak<TubInner>, listener: L, hint: LocationHint)
where
    L: TransportListener,
{
    loop {
        let transport = match listener.accept().await {
            Ok(transport) => transport,
            Err(TransportError::Closed) => break,
            Err(_e) => {
                #[cfg(feature = "tracing")]
                warn!("accept on {} failed: {}", hint, _e);
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };
        let Some(inner) = tub.upgrade() else {
            break;
        };
        let label = format!("{} from {}", hint, transport.metadata().peer());
        tokio::spawn(async move {
            let (negotiator, _handle) = Negotiator::new(Arc::clone(&inner.ctx), label);
            match negotiator.respond(Box::new(transport)).await {
                Ok(established) => {
                    inner.attach(established);
                }
                Err(_e) => {
                    #[cfg(feature = "tracing")]
                    debug!("inbound negotiation failed: {}", _e);
                }
            }
        });
    }

    #[cfg(feature = "tracing")]
    info!("stopped listening on {}", hint);
    let _ = listener.shutdown().await;
}

/// CLID 0 of every connection: looks up registered names.
struct RootObject {
    tub: Weak<TubInner>,
}

#[async_trait]
impl Referenceable for RootObject {
    async fn remote_call(&self, method: &str, args: Vec<Value>) -> Result<Value, Failure> {
        if method != GET_REFERENCE_BY_NAME {
            return Err(Failure::no_such_method(method));
        }
        let Some(name) = args.first().and_then(Value::as_str) else {
            return Err(Violation::new(GET_REFERENCE_BY_NAME, "expected a name").into());
        };
        let tub = self
            .tub
            .upgrade()
            .ok_or_else(|| Failure::new("DeadReferenceError", "the tub has been shut down"))?;
        let object = tub.registry.lock().lookup(name);
        object
            .map(Value::Local)
            .ok_or_else(|| Failure::new("KeyError", format!("no object named '{}'", name)))
    }

    fn schema(&self) -> Option<Arc<InterfaceSchema>> {
        Some(Arc::new(InterfaceSchema::new("root").method(
            GET_REFERENCE_BY_NAME,
            MethodSchema::new(vec![ValueKind::Str], ValueKind::Reference),
        )))
    }
}

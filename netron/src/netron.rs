//! The runtime owning local contexts and live peers.
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────────────────────────────┐
//!                 │               Netron                 │
//!                 │  stubs: ctx name / def id ──► Stub   │
//!                 │  peers: uid ──► Peer                 │
//!                 └───────┬──────────────────────┬───────┘
//!            GET/SET from │                      │ CONTEXT_ATTACH /
//!            any peer     ▼                      ▼ DETACH broadcast
//!                 ┌──────────────┐        ┌──────────────┐
//!                 │  Peer (uid A)│  ...   │  Peer (uid B)│
//!                 └──────────────┘        └──────────────┘
//! ```
//!
//! Contexts attached with [`Netron::attach_context`] are announced to every
//! online peer. Objects returned from calls get stubs minted for the calling
//! peer; those stubs are released when that peer goes offline, or earlier
//! with [`Netron::release_context`].
//!
//! Peers may also subscribe to named runtime events: [`Netron::emit`]
//! forwards an event to every peer that asked for it through
//! [`Netron::on_remote`].

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::rc::{Rc, Weak};

use uuid::Uuid;

use crate::config::PeerOptions;
use crate::context::{Context, Stub, StubTarget};
use crate::definition::{DefId, Defined, Definition, DefinitionRegistry};
use crate::error::{NetronError, NetronResult};
use crate::marshal::PendingStub;
use crate::peer::{Peer, Reply, Status};
use crate::sequence::SequenceId;
use crate::transport::{FrameReceiver, LocalTransport, Transport};
use crate::value::Value;
use crate::wire::{Envelope, Handshake, Payload};

type EventHandler = Rc<dyn Fn(&Peer, &[Value])>;

struct Subscription {
    id: u64,
    handler: EventHandler,
}

pub(crate) struct NetronInner {
    uid: Uuid,
    options: PeerOptions,
    def_ids: SequenceId,
    stubs: RefCell<DefinitionRegistry<Stub>>,
    peers: RefCell<HashMap<Uuid, Peer>>,
    listener_ids: SequenceId,
    // events each peer asked this runtime to forward
    subscribers: RefCell<HashMap<Uuid, BTreeSet<String>>>,
    // handlers for events emitted by each peer's runtime
    remote_events: RefCell<HashMap<Uuid, HashMap<String, Vec<Subscription>>>>,
}

/// Peer runtime.
///
/// Cloning is cheap; every clone refers to the same runtime. Peers hold only
/// a weak reference back, so dropping the last handle stops serving.
#[derive(Clone)]
pub struct Netron {
    inner: Rc<NetronInner>,
}

impl Netron {
    /// Create a runtime with a fresh uid.
    pub fn new(options: PeerOptions) -> Self {
        Self::with_uid(Uuid::new_v4(), options)
    }

    /// Create a runtime with a fixed uid.
    pub fn with_uid(uid: Uuid, options: PeerOptions) -> Self {
        Self {
            inner: Rc::new(NetronInner {
                uid,
                options,
                def_ids: SequenceId::new(),
                stubs: RefCell::new(DefinitionRegistry::new()),
                peers: RefCell::new(HashMap::new()),
                listener_ids: SequenceId::new(),
                subscribers: RefCell::new(HashMap::new()),
                remote_events: RefCell::new(HashMap::new()),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Rc<NetronInner>) -> Self {
        Self { inner }
    }

    fn downgrade(&self) -> Weak<NetronInner> {
        Rc::downgrade(&self.inner)
    }

    /// Uid announced to peers.
    pub fn uid(&self) -> Uuid {
        self.inner.uid
    }

    /// Options used for new peers.
    pub fn options(&self) -> &PeerOptions {
        &self.inner.options
    }

    // Contexts

    /// Expose `context` to every peer under `ctx_id`.
    ///
    /// Online peers are notified right away; peers connecting later receive
    /// it in the handshake.
    pub async fn attach_context(&self, context: Rc<dyn Context>, ctx_id: &str) -> NetronResult<DefId> {
        let definition = Definition::describe(self.next_def_id(), context.as_ref());
        let def_id = self
            .inner
            .stubs
            .borrow_mut()
            .register_local(ctx_id, Stub::local(definition.clone(), context))?;
        tracing::debug!(ctx_id, def_id, "context attached");

        self.broadcast(Payload::ContextAttach {
            ctx_id: ctx_id.to_string(),
            definition,
        })
        .await;
        Ok(def_id)
    }

    /// Withdraw a context and every stub derived from it.
    pub async fn detach_context(&self, ctx_id: &str) -> NetronResult<()> {
        let stub = self.inner.stubs.borrow_mut().detach(ctx_id)?;
        let def_id = stub.definition().id;
        let removed = self.inner.stubs.borrow_mut().remove_tree(def_id);
        tracing::debug!(ctx_id, def_id, derived = removed.len(), "context detached");

        self.broadcast(Payload::ContextDetach {
            ctx_id: ctx_id.to_string(),
        })
        .await;
        Ok(())
    }

    async fn broadcast(&self, payload: Payload) {
        for peer in self.peers() {
            if peer.status() != Status::Online {
                continue;
            }
            if let Err(error) = peer.send(Envelope::oneway(0, payload.clone())).await {
                tracing::warn!(peer = ?peer.uid(), %error, "failed to broadcast context change");
            }
        }
    }

    /// Whether a context is attached under `ctx_id`.
    pub fn has_context(&self, ctx_id: &str) -> bool {
        self.inner.stubs.borrow().has_context(ctx_id)
    }

    /// Names of the attached contexts, sorted.
    pub fn context_names(&self) -> Vec<String> {
        self.inner.stubs.borrow().context_names()
    }

    /// Definition of an attached context.
    pub fn get_definition_by_name(&self, ctx_id: &str) -> NetronResult<Definition> {
        self.inner
            .stubs
            .borrow()
            .lookup_by_context(ctx_id)
            .map(|stub| stub.definition().clone())
    }

    /// Release every stub minted for `context` when it was passed to peers,
    /// along with proxies derived from them.
    ///
    /// Attached contexts stay; use [`Netron::detach_context`] for those.
    /// Returns the number of stubs removed.
    pub fn release_context(&self, context: &Rc<dyn Context>) -> usize {
        let mut stubs = self.inner.stubs.borrow_mut();
        let roots = stubs.anonymous_matching(|stub| stub.exposes(context));
        let released: usize = roots
            .into_iter()
            .map(|def_id| stubs.remove_tree(def_id).len())
            .sum();
        tracing::debug!(released, "context released");
        released
    }

    /// Number of registered stubs, attached contexts included.
    pub fn stub_count(&self) -> usize {
        self.inner.stubs.borrow().len()
    }

    // Peers

    /// Create a peer over `transport` using the runtime options.
    pub fn create_peer(&self, transport: impl Transport + 'static) -> Peer {
        self.create_peer_with(transport, self.inner.options.clone())
    }

    /// Create a peer over `transport` with its own options.
    pub fn create_peer_with(&self, transport: impl Transport + 'static, options: PeerOptions) -> Peer {
        Peer::attached(Box::new(transport), options, self.downgrade())
    }

    /// Connect `peer`, serve `rx` and run the handshake.
    ///
    /// Must run inside a [`tokio::task::LocalSet`].
    pub async fn connect_peer(&self, peer: &Peer, rx: FrameReceiver) -> NetronResult<()> {
        peer.set_status(Status::Connecting);
        if let Err(error) = peer.connect().await {
            peer.set_status(Status::Offline);
            return Err(error);
        }

        peer.set_status(Status::Handshaking);
        tokio::task::spawn_local(peer.clone().serve(rx));

        let reply = match peer.request(Payload::Handshake(self.handshake())).await {
            Ok(reply) => reply,
            Err(error) => {
                if let Err(error) = peer.disconnect().await {
                    tracing::debug!(%error, "disconnect after failed handshake");
                }
                return Err(error);
            }
        };

        match reply {
            Reply::Handshake(handshake) => {
                tracing::debug!(remote = %handshake.uid, "handshake completed");
                peer.complete_handshake(handshake);
                peer.set_status(Status::Online);
                Ok(())
            }
            Reply::Value(_) => {
                if let Err(error) = peer.disconnect().await {
                    tracing::debug!(%error, "disconnect after failed handshake");
                }
                Err(NetronError::Protocol("unexpected handshake reply".into()))
            }
        }
    }

    /// Create a peer over `transport` and connect it.
    pub async fn connect(&self, transport: impl Transport + 'static, rx: FrameReceiver) -> NetronResult<Peer> {
        let peer = self.create_peer(transport);
        self.connect_peer(&peer, rx).await?;
        Ok(peer)
    }

    /// Serve an inbound connection; the remote side drives the handshake.
    ///
    /// Must run inside a [`tokio::task::LocalSet`].
    pub fn accept(&self, transport: impl Transport + 'static, rx: FrameReceiver) -> Peer {
        let peer = self.create_peer(transport);
        peer.set_status(Status::Handshaking);
        tokio::task::spawn_local(peer.clone().serve(rx));
        peer
    }

    /// Connect to another runtime in the same process.
    ///
    /// Returns this side's peer and the other side's peer.
    pub async fn connect_local(&self, other: &Netron) -> NetronResult<(Peer, Peer)> {
        let ((client, client_rx), (server, server_rx)) = LocalTransport::pair();
        let accepted = other.accept(server, server_rx);
        let connected = self.connect(client, client_rx).await?;
        Ok((connected, accepted))
    }

    /// Online peer with the given uid.
    pub fn peer(&self, uid: Uuid) -> NetronResult<Peer> {
        self.inner
            .peers
            .borrow()
            .get(&uid)
            .cloned()
            .ok_or(NetronError::UnknownPeer(uid))
    }

    /// Every online peer.
    pub fn peers(&self) -> Vec<Peer> {
        self.inner.peers.borrow().values().cloned().collect()
    }

    pub(crate) fn handshake(&self) -> Handshake {
        Handshake {
            uid: self.inner.uid,
            contexts: self.inner.stubs.borrow().contexts(),
        }
    }

    pub(crate) fn peer_online(&self, peer: &Peer) {
        let Some(uid) = peer.uid() else {
            tracing::warn!("online peer without uid");
            return;
        };
        let replaced = self.inner.peers.borrow_mut().insert(uid, peer.clone());
        if replaced.is_some_and(|old| !old.same_peer(peer)) {
            tracing::warn!(peer = %uid, "replacing session of a connected peer");
        }
        tracing::debug!(peer = %uid, "peer online");
    }

    pub(crate) fn peer_offline(&self, peer: &Peer) {
        let Some(uid) = peer.uid() else {
            return;
        };

        let superseded = {
            let mut peers = self.inner.peers.borrow_mut();
            match peers.get(&uid) {
                Some(current) if current.same_peer(peer) => {
                    peers.remove(&uid);
                    false
                }
                Some(_) => true,
                None => false,
            }
        };
        // Stubs are keyed by uid; a newer session for the same uid keeps them.
        if superseded {
            tracing::debug!(peer = %uid, "stale session offline");
            return;
        }
        let released = self.inner.stubs.borrow_mut().release_peer(uid);
        self.inner.subscribers.borrow_mut().remove(&uid);
        self.inner.remote_events.borrow_mut().remove(&uid);
        tracing::debug!(peer = %uid, released = released.len(), "peer offline");
    }

    // Events

    /// Run `handler` whenever the runtime behind peer `uid` emits `event`.
    ///
    /// The first handler registered for an event subscribes on the remote
    /// side. Returns the id to pass to [`Netron::off_remote`].
    pub async fn on_remote(
        &self,
        uid: Uuid,
        event: &str,
        handler: impl Fn(&Peer, &[Value]) + 'static,
    ) -> NetronResult<u64> {
        let peer = self.peer(uid)?;
        let id = self.inner.listener_ids.next();
        let first = {
            let mut remote_events = self.inner.remote_events.borrow_mut();
            let handlers = remote_events
                .entry(uid)
                .or_default()
                .entry(event.to_string())
                .or_default();
            handlers.push(Subscription {
                id,
                handler: Rc::new(handler),
            });
            handlers.len() == 1
        };

        if first {
            let subscribe = Payload::EventOn {
                event: event.to_string(),
            };
            if let Err(error) = peer.request(subscribe).await {
                self.remove_handler(uid, event, id);
                return Err(error);
            }
        }
        Ok(id)
    }

    /// Drop a handler added with [`Netron::on_remote`].
    ///
    /// Removing the last handler of an event unsubscribes on the remote
    /// side. Unknown ids are ignored.
    pub async fn off_remote(&self, uid: Uuid, event: &str, listener: u64) -> NetronResult<()> {
        let peer = self.peer(uid)?;
        if self.remove_handler(uid, event, listener) == Some(true) {
            peer.request(Payload::EventOff {
                event: event.to_string(),
            })
            .await?;
        }
        Ok(())
    }

    // Some(true) when the removed handler was the last one for `event`.
    fn remove_handler(&self, uid: Uuid, event: &str, listener: u64) -> Option<bool> {
        let mut remote_events = self.inner.remote_events.borrow_mut();
        let events = remote_events.get_mut(&uid)?;
        let handlers = events.get_mut(event)?;
        let before = handlers.len();
        handlers.retain(|subscription| subscription.id != listener);
        if handlers.len() == before {
            return None;
        }

        let last = handlers.is_empty();
        if last {
            events.remove(event);
            if events.is_empty() {
                remote_events.remove(&uid);
            }
        }
        Some(last)
    }

    /// Forward `event` to every online peer subscribed to it.
    ///
    /// Returns the number of peers that acknowledged delivery.
    pub async fn emit(&self, event: &str, args: Vec<Value>) -> usize {
        let targets: Vec<Peer> = {
            let subscribers = self.inner.subscribers.borrow();
            self.peers()
                .into_iter()
                .filter(|peer| {
                    peer.uid()
                        .and_then(|uid| subscribers.get(&uid))
                        .is_some_and(|events| events.contains(event))
                })
                .collect()
        };

        let mut delivered = 0;
        for peer in targets {
            let result = match args
                .iter()
                .cloned()
                .map(|arg| peer.marshal(arg))
                .collect::<NetronResult<Vec<_>>>()
            {
                Ok(args) => peer
                    .request(Payload::EventEmit {
                        event: event.to_string(),
                        args,
                    })
                    .await
                    .map(|_| ()),
                Err(error) => Err(error),
            };
            match result {
                Ok(()) => delivered += 1,
                Err(error) => {
                    tracing::warn!(peer = ?peer.uid(), event, %error, "event not delivered")
                }
            }
        }
        delivered
    }

    pub(crate) fn subscribe_remote(&self, peer: &Peer, event: String) -> NetronResult<()> {
        let uid = peer
            .uid()
            .ok_or_else(|| NetronError::IllegalState("event subscription before handshake".into()))?;
        tracing::debug!(peer = %uid, event = %event, "remote subscribed");
        self.inner
            .subscribers
            .borrow_mut()
            .entry(uid)
            .or_default()
            .insert(event);
        Ok(())
    }

    pub(crate) fn unsubscribe_remote(&self, peer: &Peer, event: &str) {
        let Some(uid) = peer.uid() else {
            return;
        };
        let mut subscribers = self.inner.subscribers.borrow_mut();
        if let Some(events) = subscribers.get_mut(&uid) {
            events.remove(event);
            if events.is_empty() {
                subscribers.remove(&uid);
            }
        }
    }

    /// Run the handlers registered for `event` from `peer`; returns how many
    /// ran.
    pub(crate) fn deliver_event(&self, peer: &Peer, event: &str, args: &[Value]) -> usize {
        let Some(uid) = peer.uid() else {
            return 0;
        };
        let handlers: Vec<EventHandler> = self
            .inner
            .remote_events
            .borrow()
            .get(&uid)
            .and_then(|events| events.get(event))
            .map(|subscriptions| {
                subscriptions
                    .iter()
                    .map(|subscription| subscription.handler.clone())
                    .collect()
            })
            .unwrap_or_default();

        for handler in &handlers {
            handler(peer, args);
        }
        handlers.len()
    }

    // Stubs

    pub(crate) fn next_def_id(&self) -> DefId {
        self.inner.def_ids.next()
    }

    /// Register a stub for `context` minted for `owner`.
    pub(crate) fn expose(&self, context: Rc<dyn Context>, owner: Option<Uuid>) -> Definition {
        let definition =
            Definition::describe(self.next_def_id(), context.as_ref()).with_owner(owner);
        self.inner
            .stubs
            .borrow_mut()
            .register_weak(Stub::local(definition.clone(), context));
        definition
    }

    pub(crate) fn release(&self, def_id: DefId) {
        self.inner.stubs.borrow_mut().remove_tree(def_id);
    }

    fn stub(&self, def_id: DefId) -> Option<Stub> {
        self.inner.stubs.borrow().lookup_by_id(def_id).ok().cloned()
    }

    /// Definition of the stub exposing `context` to `owner`, if any.
    ///
    /// Attached contexts have no owner and are shared by every peer.
    pub(crate) fn definition_of(
        &self,
        context: &Rc<dyn Context>,
        owner: Option<Uuid>,
    ) -> Option<Definition> {
        self.inner
            .stubs
            .borrow()
            .find(|stub| {
                let stub_owner = stub.definition().owner;
                stub.exposes(context) && (stub_owner.is_none() || stub_owner == owner)
            })
            .map(|stub| stub.definition().clone())
    }

    pub(crate) fn proxy_for(&self, origin_peer: Uuid, origin_id: DefId, owner: Uuid) -> Option<Definition> {
        self.inner
            .stubs
            .borrow()
            .proxy_for(origin_peer, origin_id, owner)
            .map(|stub| stub.definition().clone())
    }

    pub(crate) fn commit(&self, pending: Vec<PendingStub>) {
        let mut stubs = self.inner.stubs.borrow_mut();
        for entry in pending {
            match entry {
                PendingStub::Context {
                    definition,
                    context,
                } => {
                    stubs.register_weak(Stub::local(definition, context));
                }
                PendingStub::Proxy {
                    origin,
                    origin_peer,
                    owner,
                    proxy,
                    interface,
                } => {
                    stubs.create_proxy(&origin, origin_peer, owner, proxy.id, |definition| {
                        Stub::proxy(definition, interface)
                    });
                }
            }
        }
    }

    /// Object behind a definition id this runtime handed out.
    pub(crate) fn resolve_local_reference(&self, def_id: DefId) -> NetronResult<Value> {
        let stub = self
            .stub(def_id)
            .ok_or(NetronError::UnknownDefinition(def_id))?;
        Ok(match stub.target() {
            StubTarget::Local(context) => Value::Context(context.clone()),
            StubTarget::Proxy(interface) => Value::Interface(interface.clone()),
        })
    }

    pub(crate) async fn serve_get(
        &self,
        peer: &Peer,
        def_id: DefId,
        name: &str,
        default: Value,
    ) -> NetronResult<Value> {
        let stub = self
            .stub(def_id)
            .ok_or_else(|| NetronError::NotExists("Context not exists".into()))?;
        let arg = peer.process_result(default)?;
        let result = stub.get(name, arg).await?;
        peer.marshal(result)
    }

    pub(crate) async fn serve_set(
        &self,
        peer: &Peer,
        def_id: DefId,
        name: &str,
        value: Value,
    ) -> NetronResult<()> {
        let stub = self
            .stub(def_id)
            .ok_or_else(|| NetronError::NotExists("Context not exists".into()))?;
        let value = peer.process_result(value)?;
        stub.set(name, value).await
    }
}

impl std::fmt::Debug for Netron {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Netron")
            .field("uid", &self.inner.uid)
            .field("contexts", &self.context_names())
            .field("peers", &self.inner.peers.borrow().len())
            .finish()
    }
}

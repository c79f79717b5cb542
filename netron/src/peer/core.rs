use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use bytes::Bytes;
use tokio::sync::{oneshot, Mutex, Notify};
use uuid::Uuid;

use super::observer::Observers;
use super::Status;
use crate::awaiter::TimedoutAwaiterMap;
use crate::config::PeerOptions;
use crate::context::Context;
use crate::definition::{DefId, Definition, DefinitionRegistry};
use crate::error::{NetronError, NetronResult, RemoteError};
use crate::interface::Interface;
use crate::marshal;
use crate::netron::{Netron, NetronInner};
use crate::sequence::SequenceId;
use crate::stream::{NetronStream, StreamManager, StreamOptions};
use crate::transport::{FrameReceiver, Transport};
use crate::value::Value;
use crate::wire::{
    serialize_frame, try_deserialize_frame, Action, DataFlags, Envelope, Handshake, Payload,
};

/// Reply delivered to a pending request.
pub(crate) enum Reply {
    Value(Value),
    Handshake(Handshake),
}

pub(crate) struct PeerInner {
    uid: Cell<Option<Uuid>>,
    status: Cell<Status>,
    options: PeerOptions,
    stream_ids: SequenceId,
    request_ids: SequenceId,
    awaiters: TimedoutAwaiterMap<Reply>,
    definitions: RefCell<DefinitionRegistry<Definition>>,
    streams: StreamManager,
    transport: Box<dyn Transport>,
    write_lock: Mutex<()>,
    observers: Observers,
    runtime: Weak<NetronInner>,
    shutdown: Notify,
}

/// One end of a session.
///
/// Cloning is cheap; every clone drives the same session.
#[derive(Clone)]
pub struct Peer {
    inner: Rc<PeerInner>,
}

/// Deletes a pending request however the waiting future ends.
struct PendingGuard<'a> {
    awaiters: &'a TimedoutAwaiterMap<Reply>,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.awaiters.delete(self.id);
    }
}

impl Peer {
    /// Create a standalone peer over `transport`.
    ///
    /// A standalone peer can issue requests but cannot expose local contexts
    /// or serve inbound calls; use [`Netron::create_peer`] for that.
    pub fn new(transport: impl Transport + 'static, options: PeerOptions) -> Self {
        Self::attached(Box::new(transport), options, Weak::new())
    }

    pub(crate) fn attached(
        transport: Box<dyn Transport>,
        options: PeerOptions,
        runtime: Weak<NetronInner>,
    ) -> Self {
        let awaiters = TimedoutAwaiterMap::with_timeout_rejection(options.response_timeout);
        Self {
            inner: Rc::new(PeerInner {
                uid: Cell::new(None),
                status: Cell::new(Status::Offline),
                options,
                stream_ids: SequenceId::new(),
                request_ids: SequenceId::new(),
                awaiters,
                definitions: RefCell::new(DefinitionRegistry::new()),
                streams: StreamManager::default(),
                transport,
                write_lock: Mutex::new(()),
                observers: Observers::default(),
                runtime,
                shutdown: Notify::new(),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Rc<PeerInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<PeerInner> {
        Rc::downgrade(&self.inner)
    }

    fn runtime(&self) -> Option<Netron> {
        self.inner.runtime.upgrade().map(Netron::from_inner)
    }

    fn require_runtime(&self) -> NetronResult<Netron> {
        self.runtime().ok_or_else(|| {
            NetronError::IllegalState("peer is not attached to a runtime".into())
        })
    }

    /// Uid of the remote runtime, known once the handshake completed.
    pub fn uid(&self) -> Option<Uuid> {
        self.inner.uid.get()
    }

    /// Current session status.
    pub fn status(&self) -> Status {
        self.inner.status.get()
    }

    /// Options the peer was created with.
    pub fn options(&self) -> &PeerOptions {
        &self.inner.options
    }

    /// Number of requests waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.inner.awaiters.len()
    }

    /// Check whether both handles drive the same session.
    pub fn same_peer(&self, other: &Peer) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn streams(&self) -> &StreamManager {
        &self.inner.streams
    }

    pub(crate) fn next_stream_id(&self) -> u64 {
        self.inner.stream_ids.next()
    }

    // Transport delegation

    /// Connect the underlying transport.
    pub async fn connect(&self) -> NetronResult<()> {
        self.inner.transport.connect().await
    }

    /// Close the session.
    pub async fn disconnect(&self) -> NetronResult<()> {
        let result = self.inner.transport.disconnect().await;
        self.set_status(Status::Offline);
        result
    }

    /// Whether the underlying transport reports a live connection.
    pub fn is_connected(&self) -> NetronResult<bool> {
        self.inner.transport.is_connected()
    }

    /// Write raw bytes. Concurrent writes are serialized.
    pub async fn write(&self, data: &[u8]) -> NetronResult<()> {
        let _guard = self.inner.write_lock.lock().await;
        self.inner.transport.write(data).await
    }

    pub(crate) async fn send(&self, envelope: Envelope) -> NetronResult<()> {
        let status = self.status();
        if !status.can_send() {
            return Err(NetronError::IllegalState(format!(
                "cannot send while {status}"
            )));
        }

        let frame = serialize_frame(&envelope.encode()?)?;
        tracing::trace!(
            peer = ?self.uid(),
            id = envelope.id,
            action = ?envelope.payload.action(),
            "send"
        );
        self.write(&frame).await
    }

    pub(crate) async fn request(&self, payload: Payload) -> NetronResult<Reply> {
        let id = self.inner.request_ids.next();
        let (tx, rx) = oneshot::channel();
        self.inner.awaiters.set(
            id,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        let _guard = PendingGuard {
            awaiters: &self.inner.awaiters,
            id,
        };

        self.send(Envelope::request(id, payload)).await?;
        rx.await.map_err(|_| NetronError::PeerDisconnected)?
    }

    // Requests

    /// Write a property, or call a method discarding its result.
    ///
    /// Resolves once the envelope is written; the remote side sends no
    /// reply.
    pub async fn set(&self, def_id: DefId, name: &str, value: Value) -> NetronResult<()> {
        self.definition(def_id)?.check_writable(name)?;
        let value = self.marshal(value)?;

        let id = self.inner.request_ids.next();
        let payload = Payload::Set {
            def_id,
            name: name.to_string(),
            value,
        };
        self.send(Envelope::oneway(id, payload)).await
    }

    /// Read a property, or call a method with `default` as its arguments.
    ///
    /// Fails with `RequestTimeout` when no reply arrives within the
    /// response timeout.
    pub async fn get(&self, def_id: DefId, name: &str, default: Value) -> NetronResult<Value> {
        self.definition(def_id)?.member(name)?;
        let default = self.marshal(default)?;

        let payload = Payload::Get {
            def_id,
            name: name.to_string(),
            default,
        };
        match self.request(payload).await? {
            Reply::Value(value) => self.process_result(value),
            Reply::Handshake(_) => Err(NetronError::Protocol(
                "handshake reply to a get request".into(),
            )),
        }
    }

    /// Call a method and wait for its result.
    pub async fn call(&self, def_id: DefId, method: &str, args: Vec<Value>) -> NetronResult<Value> {
        self.get(def_id, method, Value::List(args)).await
    }

    /// Call a method without waiting for the remote side.
    pub async fn call_void(&self, def_id: DefId, method: &str, args: Vec<Value>) -> NetronResult<()> {
        self.set(def_id, method, Value::List(args)).await
    }

    /// Round trip to the remote side.
    pub async fn ping(&self) -> NetronResult<()> {
        self.request(Payload::Ping).await?;
        Ok(())
    }

    // Contexts

    /// Definition announced by the remote side.
    pub fn definition(&self, def_id: DefId) -> NetronResult<Definition> {
        self.inner
            .definitions
            .borrow()
            .lookup_by_id(def_id)
            .cloned()
    }

    /// Names of the contexts the remote side announced.
    pub fn remote_contexts(&self) -> Vec<String> {
        self.inner.definitions.borrow().context_names()
    }

    /// Handle to a remote object by definition id.
    pub fn get_interface_by_id(&self, def_id: DefId) -> NetronResult<Interface> {
        Ok(Interface::new(self.definition(def_id)?, self.clone()))
    }

    /// Handle to a remote context by name.
    pub fn get_interface_by_name(&self, ctx_id: &str) -> NetronResult<Interface> {
        let definition = self
            .inner
            .definitions
            .borrow()
            .lookup_by_context(ctx_id)
            .cloned()?;
        Ok(Interface::new(definition, self.clone()))
    }

    /// Expose `context` to this peer only, under `ctx_id`.
    ///
    /// Returns the definition id minted for it.
    pub async fn attach_context_remote(
        &self,
        context: Rc<dyn Context>,
        ctx_id: &str,
    ) -> NetronResult<DefId> {
        let runtime = self.require_runtime()?;
        if self.inner.definitions.borrow().own(ctx_id).is_some() {
            return Err(NetronError::ContextExists(ctx_id.to_string()));
        }

        let definition = runtime.expose(context, self.uid());
        let def_id = definition.id;
        self.inner
            .definitions
            .borrow_mut()
            .expose_own(ctx_id, def_id)?;

        let payload = Payload::ContextAttach {
            ctx_id: ctx_id.to_string(),
            definition,
        };
        if let Err(error) = self.request(payload).await {
            self.inner.definitions.borrow_mut().withdraw_own(ctx_id);
            runtime.release(def_id);
            return Err(error);
        }
        Ok(def_id)
    }

    /// Withdraw a context exposed with [`Peer::attach_context_remote`].
    pub async fn detach_context_remote(&self, ctx_id: &str) -> NetronResult<()> {
        let runtime = self.require_runtime()?;
        let def_id = self
            .inner
            .definitions
            .borrow_mut()
            .withdraw_own(ctx_id)
            .ok_or_else(|| NetronError::NotExists(format!("context '{ctx_id}' is not attached")))?;
        runtime.release(def_id);

        self.request(Payload::ContextDetach {
            ctx_id: ctx_id.to_string(),
        })
        .await?;
        Ok(())
    }

    /// Forget a handle received in a result.
    ///
    /// Later calls through handles to the same object fail with
    /// `UnknownDefinition`. Contexts the remote side announced by name are
    /// kept; returns whether a definition was dropped.
    pub fn release_interface(&self, interface: &Interface) -> bool {
        if !interface.peer().same_peer(self) {
            return false;
        }
        let def_id = interface.def_id();
        let mut definitions = self.inner.definitions.borrow_mut();
        if definitions.is_named(def_id) {
            return false;
        }
        definitions.remove_by_id(def_id).is_some()
    }

    /// Register a context announced by the remote side.
    pub fn on_remote_context_attach(
        &self,
        ctx_id: &str,
        definition: Definition,
    ) -> NetronResult<()> {
        self.inner
            .definitions
            .borrow_mut()
            .register_local(ctx_id, definition.clone())?;
        tracing::debug!(peer = ?self.uid(), ctx_id, def_id = definition.id, "remote context attached");
        self.inner.observers.context_attached(ctx_id, &definition);
        Ok(())
    }

    /// Unregister a context withdrawn by the remote side.
    pub fn on_remote_context_detach(&self, ctx_id: &str) -> NetronResult<Definition> {
        let definition = self
            .inner
            .definitions
            .borrow_mut()
            .detach(ctx_id)
            .map_err(|_| NetronError::NotExists(format!("context '{ctx_id}' not exists")))?;
        tracing::debug!(peer = ?self.uid(), ctx_id, "remote context detached");
        self.inner.observers.context_detached(ctx_id);
        Ok(definition)
    }

    pub(crate) fn complete_handshake(&self, handshake: Handshake) {
        self.inner.uid.set(Some(handshake.uid));
        let mut definitions = self.inner.definitions.borrow_mut();
        for (ctx_id, definition) in handshake.contexts {
            definitions.redefine(&ctx_id, definition);
        }
    }

    pub(crate) fn marshal(&self, value: Value) -> NetronResult<Value> {
        marshal::marshal(self.runtime().as_ref(), self, value)
    }

    /// Turn object references in a received value into usable handles.
    pub(crate) fn process_result(&self, value: Value) -> NetronResult<Value> {
        match value {
            Value::Definition(definition) => {
                self.inner
                    .definitions
                    .borrow_mut()
                    .register_weak(definition.clone());
                Ok(Value::Interface(Interface::new(definition, self.clone())))
            }
            Value::Reference(def_id) => match self.runtime() {
                Some(runtime) => runtime.resolve_local_reference(def_id),
                None => Err(NetronError::UnknownDefinition(def_id)),
            },
            Value::List(values) => values
                .into_iter()
                .map(|value| self.process_result(value))
                .collect::<NetronResult<_>>()
                .map(Value::List),
            Value::Map(values) => values
                .into_iter()
                .map(|(key, value)| Ok((key, self.process_result(value)?)))
                .collect::<NetronResult<_>>()
                .map(Value::Map),
            other => Ok(other),
        }
    }

    // Streams

    /// Open a stream, or accept the one requested under
    /// [`StreamOptions::remote_stream_id`].
    ///
    /// An opened stream stays `Requested` until the remote side accepts it;
    /// writes made meanwhile are queued.
    pub async fn create_stream(&self, options: StreamOptions) -> NetronResult<NetronStream> {
        match options.remote_stream_id {
            Some(remote_id) => {
                self.inner
                    .streams
                    .accept_incoming(self, remote_id, &options)
                    .await
            }
            None => self.inner.streams.open_outgoing(self, &options).await,
        }
    }

    /// Remote stream ids waiting to be accepted.
    pub fn pending_stream_requests(&self) -> Vec<u64> {
        self.inner.streams.awaiting()
    }

    /// Number of streams bound on both sides and not yet finished.
    pub fn active_streams(&self) -> usize {
        self.inner.streams.active()
    }

    // Status

    /// Move to `status`, running its side effects. Setting the current
    /// status again does nothing.
    pub fn set_status(&self, status: Status) {
        let previous = self.inner.status.replace(status);
        if previous == status {
            return;
        }
        tracing::debug!(peer = ?self.uid(), from = %previous, to = %status, "status change");

        match status {
            Status::Offline => {
                self.inner
                    .awaiters
                    .reject_all(|| NetronError::PeerDisconnected);
                self.inner.streams.teardown();
                if let Some(runtime) = self.runtime() {
                    runtime.peer_offline(self);
                }
                self.inner.shutdown.notify_waiters();
            }
            Status::Online => {
                if let Some(runtime) = self.runtime() {
                    runtime.peer_online(self);
                }
            }
            Status::Connecting | Status::Handshaking => {}
        }

        self.inner.observers.status_changed(status);
    }

    /// Observe status changes.
    pub fn on_status_change(&self, observer: impl Fn(Status) + 'static) {
        self.inner.observers.add_status(Rc::new(observer));
    }

    /// Observe stream open requests from the remote side.
    pub fn on_stream_request(&self, observer: impl Fn(u64) + 'static) {
        self.inner.observers.add_stream_request(Rc::new(observer));
    }

    /// Observe contexts announced by the remote side.
    pub fn on_context_attach(&self, observer: impl Fn(&str, &Definition) + 'static) {
        self.inner.observers.add_context_attach(Rc::new(observer));
    }

    /// Observe contexts withdrawn by the remote side.
    pub fn on_context_detach(&self, observer: impl Fn(&str) + 'static) {
        self.inner.observers.add_context_detach(Rc::new(observer));
    }

    // Inbound

    /// Read frames from `rx` until the transport closes or the peer goes
    /// offline.
    pub(crate) async fn serve(self, mut rx: FrameReceiver) {
        let mut buffer = Vec::new();
        loop {
            if self.status() == Status::Offline {
                break;
            }
            tokio::select! {
                chunk = rx.recv() => match chunk {
                    Some(chunk) => {
                        buffer.extend_from_slice(&chunk);
                        if let Err(error) = self.drain_frames(&mut buffer).await {
                            tracing::warn!(peer = ?self.uid(), %error, "corrupt frame, closing");
                            break;
                        }
                    }
                    None => {
                        tracing::debug!(peer = ?self.uid(), "transport closed");
                        break;
                    }
                },
                _ = self.inner.shutdown.notified() => break,
            }
        }

        if self.status() != Status::Offline {
            if let Err(error) = self.inner.transport.disconnect().await {
                tracing::debug!(peer = ?self.uid(), %error, "disconnect failed");
            }
            self.set_status(Status::Offline);
        }
    }

    async fn drain_frames(&self, buffer: &mut Vec<u8>) -> NetronResult<()> {
        while let Some((body, consumed)) = try_deserialize_frame(buffer)? {
            buffer.drain(..consumed);
            self.handle_frame(&body).await;
        }
        Ok(())
    }

    /// Decode and dispatch one frame body. Malformed bodies are logged and
    /// dropped.
    pub async fn handle_frame(&self, body: &[u8]) {
        match Envelope::decode(body) {
            Ok(envelope) => self.dispatch(envelope).await,
            Err(error) => tracing::warn!(peer = ?self.uid(), %error, "dropping malformed packet"),
        }
    }

    async fn dispatch(&self, envelope: Envelope) {
        let Envelope { id, flags, payload } = envelope;
        let expects_reply = flags.contains(DataFlags::REPLY_EXPECTED);

        match payload {
            Payload::Reply { outcome, .. } => {
                self.resolve(id, outcome.map(Reply::Value).map_err(NetronError::Remote))
            }
            Payload::HandshakeReply(handshake) => self.resolve(id, Ok(Reply::Handshake(handshake))),
            Payload::Get {
                def_id,
                name,
                default,
            } => self.spawn_get(id, def_id, name, default),
            Payload::Set {
                def_id,
                name,
                value,
            } => self.spawn_set(def_id, name, value),
            Payload::Ping => self.reply(id, Action::Ping, Ok(Value::Null)).await,
            Payload::Handshake(handshake) => self.accept_handshake(id, handshake).await,
            Payload::ContextAttach { ctx_id, definition } => {
                let result = self.on_remote_context_attach(&ctx_id, definition);
                self.acknowledge(id, Action::ContextAttach, expects_reply, result)
                    .await
            }
            Payload::ContextDetach { ctx_id } => {
                let result = self.on_remote_context_detach(&ctx_id).map(|_| ());
                self.acknowledge(id, Action::ContextDetach, expects_reply, result)
                    .await
            }
            Payload::EventOn { event } => {
                let result = self
                    .require_runtime()
                    .and_then(|runtime| runtime.subscribe_remote(self, event));
                self.acknowledge(id, Action::EventOn, expects_reply, result)
                    .await
            }
            Payload::EventOff { event } => {
                let result = self
                    .require_runtime()
                    .map(|runtime| runtime.unsubscribe_remote(self, &event));
                self.acknowledge(id, Action::EventOff, expects_reply, result)
                    .await
            }
            Payload::EventEmit { event, args } => {
                let result = self.deliver_event(&event, args);
                self.acknowledge(id, Action::EventEmit, expects_reply, result)
                    .await
            }
            Payload::StreamRequest { stream_id } => {
                if self.inner.streams.on_request(stream_id) {
                    self.inner.observers.stream_requested(stream_id);
                }
            }
            Payload::StreamAccept { origin, remote } => {
                self.inner.streams.on_accept(origin, remote).await
            }
            Payload::StreamData {
                stream_id,
                packet_id,
                chunk,
            } => {
                self.inner
                    .streams
                    .on_data(stream_id, packet_id, Bytes::from(chunk))
                    .await
            }
            Payload::StreamPause { stream_id } => self.inner.streams.on_pause(stream_id),
            Payload::StreamResume { stream_id } => self.inner.streams.on_resume(stream_id).await,
            Payload::StreamEnd {
                stream_id,
                packet_id,
            } => self.inner.streams.on_end(stream_id, packet_id).await,
        }
    }

    fn resolve(&self, id: u64, result: NetronResult<Reply>) {
        match self.inner.awaiters.take(id) {
            Some(continuation) => continuation(result),
            None => tracing::debug!(peer = ?self.uid(), id, "reply for unknown request"),
        }
    }

    async fn reply(&self, id: u64, action: Action, outcome: NetronResult<Value>) {
        let outcome = outcome.map_err(|error| RemoteError::from(&error));
        if let Err(error) = self.send(Envelope::reply(id, action, outcome)).await {
            tracing::warn!(peer = ?self.uid(), id, %error, "failed to send reply");
        }
    }

    async fn acknowledge(
        &self,
        id: u64,
        action: Action,
        expects_reply: bool,
        result: NetronResult<()>,
    ) {
        if expects_reply {
            self.reply(id, action, result.map(|()| Value::Null)).await;
        } else if let Err(error) = result {
            tracing::warn!(peer = ?self.uid(), ?action, %error, "request rejected");
        }
    }

    fn deliver_event(&self, event: &str, args: Vec<Value>) -> NetronResult<()> {
        let runtime = self.require_runtime()?;
        let args = args
            .into_iter()
            .map(|arg| self.process_result(arg))
            .collect::<NetronResult<Vec<_>>>()?;
        let handled = runtime.deliver_event(self, event, &args);
        tracing::trace!(peer = ?self.uid(), event, handled, "event delivered");
        Ok(())
    }

    fn spawn_get(&self, id: u64, def_id: DefId, name: String, default: Value) {
        let peer = self.clone();
        tokio::task::spawn_local(async move {
            let outcome = match peer.runtime() {
                Some(runtime) => runtime.serve_get(&peer, def_id, &name, default).await,
                None => Err(NetronError::NotExists("Context not exists".into())),
            };
            peer.reply(id, Action::Get, outcome).await;
        });
    }

    fn spawn_set(&self, def_id: DefId, name: String, value: Value) {
        let Some(runtime) = self.runtime() else {
            tracing::warn!(peer = ?self.uid(), def_id, "set without runtime dropped");
            return;
        };
        let peer = self.clone();
        tokio::task::spawn_local(async move {
            if let Err(error) = runtime.serve_set(&peer, def_id, &name, value).await {
                tracing::warn!(peer = ?peer.uid(), def_id, name = %name, %error, "set failed");
            }
        });
    }

    async fn accept_handshake(&self, id: u64, handshake: Handshake) {
        let Some(runtime) = self.runtime() else {
            tracing::warn!("handshake received by a standalone peer");
            return;
        };

        tracing::debug!(remote = %handshake.uid, "handshake received");
        self.complete_handshake(handshake);
        self.set_status(Status::Online);

        let reply = Envelope::oneway(id, Payload::HandshakeReply(runtime.handshake()));
        if let Err(error) = self.send(reply).await {
            tracing::warn!(peer = ?self.uid(), %error, "failed to answer handshake");
        }
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("uid", &self.uid())
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::task::LocalSet;

    use super::*;
    use crate::stream::StreamState;
    use crate::wire::deserialize_frame;

    type Frames = Rc<RefCell<Vec<Vec<u8>>>>;

    struct RecordingTransport {
        frames: Frames,
    }

    #[async_trait(?Send)]
    impl Transport for RecordingTransport {
        async fn disconnect(&self) -> NetronResult<()> {
            Ok(())
        }

        fn is_connected(&self) -> NetronResult<bool> {
            Ok(true)
        }

        async fn write(&self, data: &[u8]) -> NetronResult<()> {
            self.frames.borrow_mut().push(data.to_vec());
            Ok(())
        }
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .try_init();
    }

    fn online_peer(response_timeout: Duration) -> (Peer, Frames) {
        let frames = Frames::default();
        let peer = Peer::new(
            RecordingTransport {
                frames: frames.clone(),
            },
            PeerOptions::new(response_timeout),
        );
        peer.set_status(Status::Online);
        peer.on_remote_context_attach(
            "calc",
            Definition::new(1, "Calculator")
                .with_method("add")
                .with_property("precision", false)
                .with_property("version", true),
        )
        .expect("attach");
        (peer, frames)
    }

    fn sent(frames: &Frames) -> Vec<Envelope> {
        frames
            .borrow()
            .iter()
            .map(|frame| {
                let body = deserialize_frame(frame).expect("frame");
                Envelope::decode(&body).expect("envelope")
            })
            .collect()
    }

    fn body(envelope: Envelope) -> Vec<u8> {
        envelope.encode().expect("encode")
    }

    async fn wait_pending(peer: &Peer) {
        while peer.pending_requests() == 0 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_times_out() {
        init_tracing();
        LocalSet::new()
            .run_until(async {
                let (peer, frames) = online_peer(Duration::from_millis(500));

                let start = tokio::time::Instant::now();
                let result = peer.get(1, "precision", Value::Null).await;

                assert_eq!(
                    result,
                    Err(NetronError::RequestTimeout {
                        timeout: Duration::from_millis(500)
                    })
                );
                assert_eq!(
                    result.expect_err("timeout").to_string(),
                    "Response timeout 500ms exceeded"
                );
                assert!(start.elapsed() >= Duration::from_millis(500));
                assert_eq!(peer.pending_requests(), 0);
                assert_eq!(sent(&frames).len(), 1);
            })
            .await;
    }

    #[tokio::test]
    async fn test_unknown_definition_sends_nothing() {
        LocalSet::new()
            .run_until(async {
                let (peer, frames) = online_peer(Duration::from_secs(1));

                let result = peer.get(99, "x", Value::Null).await;

                assert_eq!(result, Err(NetronError::UnknownDefinition(99)));
                assert!(frames.borrow().is_empty());
                assert_eq!(peer.pending_requests(), 0);
            })
            .await;
    }

    #[tokio::test]
    async fn test_readonly_and_unknown_members_rejected_locally() {
        LocalSet::new()
            .run_until(async {
                let (peer, frames) = online_peer(Duration::from_secs(1));

                let result = peer.set(1, "version", Value::Int(2)).await;
                assert!(matches!(result, Err(NetronError::InvalidAccess(_))));

                let result = peer.set(1, "missing", Value::Int(2)).await;
                assert!(matches!(result, Err(NetronError::UnknownMember { .. })));

                assert!(frames.borrow().is_empty());
            })
            .await;
    }

    #[tokio::test]
    async fn test_set_is_oneway() {
        LocalSet::new()
            .run_until(async {
                let (peer, frames) = online_peer(Duration::from_secs(1));

                peer.set(1, "precision", Value::Int(4)).await.expect("set");

                let envelopes = sent(&frames);
                assert_eq!(envelopes.len(), 1);
                assert!(!envelopes[0].expects_reply());
                assert_eq!(peer.pending_requests(), 0);
            })
            .await;
    }

    #[tokio::test]
    async fn test_reply_resolves_request() {
        LocalSet::new()
            .run_until(async {
                let (peer, frames) = online_peer(Duration::from_secs(5));

                let caller = peer.clone();
                let call = tokio::task::spawn_local(async move {
                    caller.call(1, "add", vec![Value::Int(2), Value::Int(3)]).await
                });
                wait_pending(&peer).await;

                let request = sent(&frames).remove(0);
                assert!(request.expects_reply());
                peer.handle_frame(&body(Envelope::reply(
                    request.id,
                    Action::Get,
                    Ok(Value::Int(5)),
                )))
                .await;

                assert_eq!(call.await.expect("join"), Ok(Value::Int(5)));
                assert_eq!(peer.pending_requests(), 0);
            })
            .await;
    }

    #[tokio::test]
    async fn test_remote_error_surfaces() {
        LocalSet::new()
            .run_until(async {
                let (peer, frames) = online_peer(Duration::from_secs(5));

                let caller = peer.clone();
                let call = tokio::task::spawn_local(async move {
                    caller.get(1, "precision", Value::Null).await
                });
                wait_pending(&peer).await;

                let request = sent(&frames).remove(0);
                let error = RemoteError::new("NotExists", "Context not exists");
                peer.handle_frame(&body(Envelope::reply(
                    request.id,
                    Action::Get,
                    Err(error.clone()),
                )))
                .await;

                assert_eq!(call.await.expect("join"), Err(NetronError::Remote(error)));
            })
            .await;
    }

    #[tokio::test]
    async fn test_offline_rejects_pending_requests() {
        LocalSet::new()
            .run_until(async {
                let (peer, _frames) = online_peer(Duration::from_secs(60));

                let caller = peer.clone();
                let first = tokio::task::spawn_local(async move {
                    caller.get(1, "precision", Value::Null).await
                });
                let caller = peer.clone();
                let second = tokio::task::spawn_local(async move { caller.ping().await });
                while peer.pending_requests() < 2 {
                    tokio::task::yield_now().await;
                }

                peer.set_status(Status::Offline);

                assert_eq!(
                    first.await.expect("join"),
                    Err(NetronError::PeerDisconnected)
                );
                assert_eq!(
                    second.await.expect("join"),
                    Err(NetronError::PeerDisconnected)
                );
                assert_eq!(peer.pending_requests(), 0);
            })
            .await;
    }

    #[tokio::test]
    async fn test_send_requires_session() {
        LocalSet::new()
            .run_until(async {
                let (peer, frames) = online_peer(Duration::from_secs(1));
                peer.set_status(Status::Offline);

                let result = peer.ping().await;

                assert!(matches!(result, Err(NetronError::IllegalState(_))));
                assert!(frames.borrow().is_empty());
                assert_eq!(peer.pending_requests(), 0);
            })
            .await;
    }

    #[test]
    fn test_status_observers() {
        let frames = Frames::default();
        let peer = Peer::new(RecordingTransport { frames }, PeerOptions::default());
        let seen = Rc::new(RefCell::new(Vec::new()));
        let record = seen.clone();
        peer.on_status_change(move |status| record.borrow_mut().push(status));

        peer.set_status(Status::Connecting);
        peer.set_status(Status::Connecting);
        peer.set_status(Status::Handshaking);
        peer.set_status(Status::Online);

        assert_eq!(
            *seen.borrow(),
            vec![Status::Connecting, Status::Handshaking, Status::Online]
        );
    }

    #[test]
    fn test_remote_context_bookkeeping() {
        let (peer, _frames) = online_peer(Duration::from_secs(1));

        let result = peer.on_remote_context_attach("calc", Definition::new(2, "Other"));
        assert!(matches!(result, Err(NetronError::ContextExists(_))));

        let interface = peer.get_interface_by_name("calc").expect("interface");
        assert_eq!(interface.def_id(), 1);

        let removed = peer.on_remote_context_detach("calc").expect("detach");
        assert_eq!(removed.id, 1);
        assert!(matches!(
            peer.get_interface_by_name("calc"),
            Err(NetronError::UnknownContext(_))
        ));
        assert!(matches!(
            peer.on_remote_context_detach("calc"),
            Err(NetronError::NotExists(_))
        ));
    }

    #[tokio::test]
    async fn test_stream_writes_queue_until_accepted() {
        LocalSet::new()
            .run_until(async {
                let (peer, frames) = online_peer(Duration::from_secs(1));

                let stream = peer
                    .create_stream(StreamOptions::default())
                    .await
                    .expect("open");
                assert_eq!(stream.state(), StreamState::Requested);

                stream.write(&b"abc"[..]).await.expect("write");
                assert_eq!(stream.queued(), 1);
                let envelopes = sent(&frames);
                assert_eq!(envelopes.len(), 1);
                assert_eq!(
                    envelopes[0].payload,
                    Payload::StreamRequest {
                        stream_id: stream.id()
                    }
                );

                peer.handle_frame(&body(Envelope::oneway(
                    7,
                    Payload::StreamAccept {
                        origin: stream.id(),
                        remote: 7,
                    },
                )))
                .await;

                assert_eq!(stream.state(), StreamState::Active);
                assert_eq!(stream.remote_id(), Some(7));
                assert_eq!(stream.queued(), 0);
                let envelopes = sent(&frames);
                assert_eq!(
                    envelopes[1].payload,
                    Payload::StreamData {
                        stream_id: stream.id(),
                        packet_id: 1,
                        chunk: b"abc".to_vec(),
                    }
                );
            })
            .await;
    }

    #[tokio::test]
    async fn test_accept_requires_awaiting_request() {
        LocalSet::new()
            .run_until(async {
                let (peer, frames) = online_peer(Duration::from_secs(1));
                peer.handle_frame(&body(Envelope::oneway(
                    5,
                    Payload::StreamRequest { stream_id: 5 },
                )))
                .await;
                assert_eq!(peer.pending_stream_requests(), vec![5]);

                let result = peer.create_stream(StreamOptions::accept(6)).await;
                assert!(matches!(result, Err(NetronError::NotExists(_))));
                assert_eq!(peer.pending_stream_requests(), vec![5]);
                assert!(frames.borrow().is_empty());

                let stream = peer
                    .create_stream(StreamOptions::accept(5))
                    .await
                    .expect("accept");
                assert_eq!(stream.state(), StreamState::Active);
                assert!(peer.pending_stream_requests().is_empty());
                assert_eq!(
                    sent(&frames)[0].payload,
                    Payload::StreamAccept {
                        origin: 5,
                        remote: stream.id(),
                    }
                );
            })
            .await;
    }

    #[tokio::test]
    async fn test_duplicate_and_unknown_stream_packets_dropped() {
        LocalSet::new()
            .run_until(async {
                let (peer, _frames) = online_peer(Duration::from_secs(1));
                peer.handle_frame(&body(Envelope::oneway(
                    5,
                    Payload::StreamRequest { stream_id: 5 },
                )))
                .await;
                let stream = peer
                    .create_stream(StreamOptions::accept(5))
                    .await
                    .expect("accept");

                let data = |packet_id: u64, chunk: &[u8]| {
                    body(Envelope::oneway(
                        5,
                        Payload::StreamData {
                            stream_id: 5,
                            packet_id,
                            chunk: chunk.to_vec(),
                        },
                    ))
                };
                peer.handle_frame(&data(2, b"second")).await;
                peer.handle_frame(&data(1, b"first")).await;
                peer.handle_frame(&data(1, b"again")).await;
                peer.handle_frame(&body(Envelope::oneway(
                    42,
                    Payload::StreamData {
                        stream_id: 42,
                        packet_id: 1,
                        chunk: b"stray".to_vec(),
                    },
                )))
                .await;

                assert_eq!(stream.buffered(), 2);
                assert_eq!(stream.read().await, Some(Bytes::from_static(b"first")));
                assert_eq!(stream.read().await, Some(Bytes::from_static(b"second")));
            })
            .await;
    }

    #[tokio::test]
    async fn test_failed_stream_write_keeps_packet_sequence() {
        LocalSet::new()
            .run_until(async {
                let (peer, frames) = online_peer(Duration::from_secs(1));
                peer.handle_frame(&body(Envelope::oneway(
                    5,
                    Payload::StreamRequest { stream_id: 5 },
                )))
                .await;
                let stream = peer
                    .create_stream(StreamOptions::accept(5))
                    .await
                    .expect("accept");

                peer.set_status(Status::Connecting);
                assert!(matches!(
                    stream.write(&b"lost"[..]).await,
                    Err(NetronError::IllegalState(_))
                ));
                peer.set_status(Status::Online);
                stream.write(&b"kept"[..]).await.expect("write");
                stream.end().await.expect("end");

                let packets: Vec<Payload> = sent(&frames)
                    .into_iter()
                    .map(|envelope| envelope.payload)
                    .filter(|payload| {
                        matches!(
                            payload,
                            Payload::StreamData { .. } | Payload::StreamEnd { .. }
                        )
                    })
                    .collect();
                assert_eq!(
                    packets,
                    vec![
                        Payload::StreamData {
                            stream_id: stream.id(),
                            packet_id: 1,
                            chunk: b"kept".to_vec(),
                        },
                        Payload::StreamEnd {
                            stream_id: stream.id(),
                            packet_id: 1,
                        },
                    ]
                );
            })
            .await;
    }

    #[tokio::test]
    async fn test_offline_aborts_streams() {
        LocalSet::new()
            .run_until(async {
                let (peer, _frames) = online_peer(Duration::from_secs(1));
                let stream = peer
                    .create_stream(StreamOptions::default())
                    .await
                    .expect("open");

                peer.set_status(Status::Offline);

                assert_eq!(stream.state(), StreamState::Ended);
                assert_eq!(stream.read().await, None);
                assert_eq!(
                    stream.write(&b"late"[..]).await,
                    Err(NetronError::PeerDisconnected)
                );
            })
            .await;
    }

    #[tokio::test]
    async fn test_malformed_frame_is_dropped() {
        LocalSet::new()
            .run_until(async {
                let (peer, frames) = online_peer(Duration::from_secs(1));

                peer.handle_frame(b"not json").await;
                peer.handle_frame(br#"[0, 1, 0, 99, null]"#).await;

                assert_eq!(peer.status(), Status::Online);
                assert!(frames.borrow().is_empty());
            })
            .await;
    }
}

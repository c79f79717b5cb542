use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};

use bytes::Bytes;

use super::{NetronStream, StreamOptions};
use crate::error::{NetronError, NetronResult};
use crate::peer::Peer;
use crate::wire::{Envelope, Payload};

/// Per-peer stream tables.
///
/// `streams` is keyed by local id; `by_remote` maps the id the remote side
/// puts on its packets to the local id.
#[derive(Default)]
pub(crate) struct StreamManager {
    awaiting: RefCell<BTreeSet<u64>>,
    pending_local: RefCell<HashMap<u64, NetronStream>>,
    streams: RefCell<HashMap<u64, NetronStream>>,
    by_remote: RefCell<HashMap<u64, u64>>,
}

impl StreamManager {
    /// Open a new outgoing stream and send `STREAM_REQUEST`.
    pub(crate) async fn open_outgoing(
        &self,
        peer: &Peer,
        options: &StreamOptions,
    ) -> NetronResult<NetronStream> {
        let id = peer.next_stream_id();
        let stream = NetronStream::new(
            id,
            None,
            options
                .high_water_mark
                .unwrap_or(peer.options().high_water_mark),
            options.allow_half_open,
            peer.downgrade(),
        );

        self.pending_local.borrow_mut().insert(id, stream.clone());
        if let Err(error) = peer
            .send(Envelope::oneway(id, Payload::StreamRequest { stream_id: id }))
            .await
        {
            self.pending_local.borrow_mut().remove(&id);
            return Err(error);
        }

        tracing::debug!(peer = ?peer.uid(), stream = id, "stream requested");
        Ok(stream)
    }

    /// Accept a stream the remote side requested and send `STREAM_ACCEPT`.
    pub(crate) async fn accept_incoming(
        &self,
        peer: &Peer,
        remote_id: u64,
        options: &StreamOptions,
    ) -> NetronResult<NetronStream> {
        if !self.awaiting.borrow().contains(&remote_id) {
            return Err(NetronError::NotExists(format!(
                "No awaiting stream with id {remote_id}"
            )));
        }

        let id = peer.next_stream_id();
        let stream = NetronStream::new(
            id,
            Some(remote_id),
            options
                .high_water_mark
                .unwrap_or(peer.options().high_water_mark),
            options.allow_half_open,
            peer.downgrade(),
        );

        let accept = Payload::StreamAccept {
            origin: remote_id,
            remote: id,
        };
        peer.send(Envelope::oneway(id, accept)).await?;

        self.awaiting.borrow_mut().remove(&remote_id);
        self.streams.borrow_mut().insert(id, stream.clone());
        self.by_remote.borrow_mut().insert(remote_id, id);

        tracing::debug!(peer = ?peer.uid(), stream = id, remote = remote_id, "stream accepted");
        Ok(stream)
    }

    /// Record a remote open request. Returns `false` for a repeated id.
    pub(crate) fn on_request(&self, remote_id: u64) -> bool {
        self.awaiting.borrow_mut().insert(remote_id)
    }

    pub(crate) async fn on_accept(&self, origin: u64, remote: u64) {
        let stream = self.pending_local.borrow_mut().remove(&origin);
        let Some(stream) = stream else {
            tracing::warn!(stream = origin, "accept for unknown stream");
            return;
        };

        self.streams.borrow_mut().insert(origin, stream.clone());
        self.by_remote.borrow_mut().insert(remote, origin);
        if let Err(error) = stream.bind(remote).await {
            tracing::warn!(stream = origin, %error, "failed to flush accepted stream");
        }
    }

    fn lookup(&self, remote_id: u64) -> Option<NetronStream> {
        let local_id = *self.by_remote.borrow().get(&remote_id)?;
        self.streams.borrow().get(&local_id).cloned()
    }

    pub(crate) async fn on_data(&self, remote_id: u64, packet_id: u64, chunk: Bytes) {
        match self.lookup(remote_id) {
            Some(stream) => stream.on_data(packet_id, chunk).await,
            None => tracing::debug!(remote = remote_id, packet_id, "data for unknown stream"),
        }
    }

    pub(crate) fn on_pause(&self, remote_id: u64) {
        match self.lookup(remote_id) {
            Some(stream) => stream.on_pause(),
            None => tracing::debug!(remote = remote_id, "pause for unknown stream"),
        }
    }

    pub(crate) async fn on_resume(&self, remote_id: u64) {
        let Some(stream) = self.lookup(remote_id) else {
            tracing::debug!(remote = remote_id, "resume for unknown stream");
            return;
        };
        if let Err(error) = stream.on_resume().await {
            tracing::warn!(stream = stream.id(), %error, "failed to flush resumed stream");
        }
    }

    pub(crate) async fn on_end(&self, remote_id: u64, packet_id: u64) {
        let Some(stream) = self.lookup(remote_id) else {
            tracing::debug!(remote = remote_id, "end for unknown stream");
            return;
        };
        if let Err(error) = stream.on_remote_end(packet_id).await {
            tracing::warn!(stream = stream.id(), %error, "failed to end stream");
        }
    }

    /// Drop bookkeeping for a stream finished on both sides.
    pub(crate) fn forget(&self, stream: &NetronStream) {
        self.streams.borrow_mut().remove(&stream.id());
        if let Some(remote_id) = stream.remote_id() {
            self.by_remote.borrow_mut().remove(&remote_id);
        }
    }

    /// Abort every stream; used when the session goes offline.
    pub(crate) fn teardown(&self) {
        let pending: Vec<_> = self.pending_local.borrow_mut().drain().map(|(_, s)| s).collect();
        let streams: Vec<_> = self.streams.borrow_mut().drain().map(|(_, s)| s).collect();
        self.by_remote.borrow_mut().clear();
        self.awaiting.borrow_mut().clear();

        for stream in pending.iter().chain(streams.iter()) {
            stream.abort();
        }
    }

    /// Remote stream ids waiting to be accepted, in ascending order.
    pub(crate) fn awaiting(&self) -> Vec<u64> {
        self.awaiting.borrow().iter().copied().collect()
    }

    /// Number of streams bound on both sides.
    pub(crate) fn active(&self) -> usize {
        self.streams.borrow().len()
    }
}

//! Flow-controlled byte streams multiplexed over a peer session.
//!
//! # Lifecycle
//!
//! ```text
//!  initiator                                  acceptor
//!  ─────────                                  ────────
//!  create_stream()
//!   REQUESTED ── STREAM_REQUEST(id) ──────────► awaiting set
//!                                              create_stream(accept(id))
//!   ACTIVE    ◄── STREAM_ACCEPT{origin,remote} ─ ACTIVE
//!   queued writes flushed
//!            ◄──────── STREAM_DATA ──────────►
//!            ◄──── STREAM_PAUSE / RESUME ────►
//!   ENDED    ◄──────── STREAM_END ───────────► ENDED
//! ```
//!
//! Every packet carries the sender's own stream id; the receiver maps it to
//! its local stream through the id bound at accept time.
//!
//! # Backpressure
//!
//! The reader buffers packets ordered by `packet_id`. Once the buffer holds
//! `high_water_mark` packets it sends `STREAM_PAUSE`; the writer then queues
//! further writes locally until `STREAM_RESUME` arrives, which the reader
//! sends after draining below half the mark.
//!
//! Writes larger than [`MAX_CHUNK_SIZE`] are split, so a reader may see one
//! write as several chunks.

/// Stream bookkeeping owned by a peer.
pub(crate) mod manager;

pub(crate) use manager::StreamManager;

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::rc::{Rc, Weak};

use bytes::Bytes;
use tokio::sync::{Mutex, Notify};

use crate::error::{NetronError, NetronResult};
use crate::peer::{Peer, PeerInner};
use crate::wire::{Envelope, Payload};

/// Largest chunk carried by one data packet.
pub const MAX_CHUNK_SIZE: usize = 64 * 1024;

/// Stream state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Open request sent, no accept received yet.
    Requested,
    /// Both sides bound their ids.
    Active,
    /// The remote side ended, and so did this side unless half-open streams
    /// are allowed.
    Ended,
}

/// Options for [`Peer::create_stream`].
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    /// Accept the stream the remote side requested under this id instead of
    /// opening a new one.
    pub remote_stream_id: Option<u64>,
    /// Buffered packet count that triggers a pause. Defaults to the peer's
    /// configured mark.
    pub high_water_mark: Option<usize>,
    /// Keep the write side open after the remote side ended.
    pub allow_half_open: bool,
}

impl StreamOptions {
    /// Options accepting the remote stream `remote_stream_id`.
    pub fn accept(remote_stream_id: u64) -> Self {
        Self {
            remote_stream_id: Some(remote_stream_id),
            ..Self::default()
        }
    }

    /// Override the high water mark.
    pub fn with_high_water_mark(mut self, high_water_mark: usize) -> Self {
        self.high_water_mark = Some(high_water_mark.max(1));
        self
    }

    /// Allow or forbid half-open streams.
    pub fn with_allow_half_open(mut self, allow_half_open: bool) -> Self {
        self.allow_half_open = allow_half_open;
        self
    }
}

struct StreamShared {
    id: u64,
    remote_id: Cell<Option<u64>>,
    state: Cell<StreamState>,
    high_water_mark: usize,
    allow_half_open: bool,
    peer: Weak<PeerInner>,

    queue: RefCell<VecDeque<Bytes>>,
    sending: Mutex<()>,
    sent: Cell<u64>,
    paused: Cell<bool>,
    local_ended: Cell<bool>,
    end_sent: Cell<bool>,

    buffer: RefCell<BTreeMap<u64, Bytes>>,
    next_read: Cell<u64>,
    remote_end: Cell<Option<u64>>,
    pause_sent: Cell<bool>,

    broken: Cell<bool>,
    readable: Notify,
    activated: Notify,
}

/// Handle to a stream.
///
/// The peer's stream manager owns the bookkeeping; dropping the handle does
/// not end the stream.
#[derive(Clone)]
pub struct NetronStream {
    shared: Rc<StreamShared>,
}

impl NetronStream {
    pub(crate) fn new(
        id: u64,
        remote_id: Option<u64>,
        high_water_mark: usize,
        allow_half_open: bool,
        peer: Weak<PeerInner>,
    ) -> Self {
        let state = if remote_id.is_some() {
            StreamState::Active
        } else {
            StreamState::Requested
        };
        Self {
            shared: Rc::new(StreamShared {
                id,
                remote_id: Cell::new(remote_id),
                state: Cell::new(state),
                high_water_mark: high_water_mark.max(1),
                allow_half_open,
                peer,
                queue: RefCell::new(VecDeque::new()),
                sending: Mutex::new(()),
                sent: Cell::new(0),
                paused: Cell::new(false),
                local_ended: Cell::new(false),
                end_sent: Cell::new(false),
                buffer: RefCell::new(BTreeMap::new()),
                next_read: Cell::new(1),
                remote_end: Cell::new(None),
                pause_sent: Cell::new(false),
                broken: Cell::new(false),
                readable: Notify::new(),
                activated: Notify::new(),
            }),
        }
    }

    /// Local stream id.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Remote stream id, once bound.
    pub fn remote_id(&self) -> Option<u64> {
        self.shared.remote_id.get()
    }

    /// Current state.
    pub fn state(&self) -> StreamState {
        self.shared.state.get()
    }

    /// Whether the remote side asked this side to stop writing.
    pub fn is_paused(&self) -> bool {
        self.shared.paused.get()
    }

    /// Number of writes waiting to be sent.
    pub fn queued(&self) -> usize {
        self.shared.queue.borrow().len()
    }

    /// Number of received packets not yet read.
    pub fn buffered(&self) -> usize {
        self.shared.buffer.borrow().len()
    }

    fn peer(&self) -> NetronResult<Peer> {
        self.shared
            .peer
            .upgrade()
            .map(Peer::from_inner)
            .ok_or(NetronError::PeerDisconnected)
    }

    async fn send(&self, payload: Payload) -> NetronResult<()> {
        self.peer()?
            .send(Envelope::oneway(self.shared.id, payload))
            .await
    }

    fn can_send(&self) -> bool {
        self.shared.remote_id.get().is_some()
            && !self.shared.paused.get()
            && !self.shared.broken.get()
    }

    /// Wait until the remote side accepted the stream.
    ///
    /// Fails with `RequestTimeout` after the peer's response timeout.
    pub async fn accepted(&self) -> NetronResult<()> {
        let timeout = self.peer()?.options().response_timeout;
        let wait = async {
            loop {
                if self.shared.remote_id.get().is_some() {
                    return Ok(());
                }
                if self.shared.broken.get() {
                    return Err(NetronError::PeerDisconnected);
                }
                self.shared.activated.notified().await;
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| NetronError::RequestTimeout { timeout })?
    }

    /// Write a chunk.
    ///
    /// Chunks written before the stream is accepted, or while the remote
    /// side paused it, are queued and sent in order later. A failed send
    /// leaves the packet sequence untouched.
    pub async fn write(&self, chunk: impl Into<Bytes>) -> NetronResult<()> {
        if self.shared.broken.get() {
            return Err(NetronError::PeerDisconnected);
        }
        if self.shared.local_ended.get() {
            return Err(NetronError::IllegalState(format!(
                "stream {} already ended",
                self.shared.id
            )));
        }

        for piece in split_chunk(chunk.into()) {
            if !self.can_send() || !self.shared.queue.borrow().is_empty() {
                self.shared.queue.borrow_mut().push_back(piece);
                continue;
            }
            self.send_data(piece).await?;
        }
        Ok(())
    }

    async fn send_data(&self, chunk: Bytes) -> NetronResult<()> {
        let _sending = self.shared.sending.lock().await;
        let packet_id = self.shared.sent.get() + 1;
        self.send(Payload::StreamData {
            stream_id: self.shared.id,
            packet_id,
            chunk: chunk.to_vec(),
        })
        .await?;
        self.shared.sent.set(packet_id);
        Ok(())
    }

    /// End the write side.
    ///
    /// The end marker follows any queued chunks.
    pub async fn end(&self) -> NetronResult<()> {
        if self.shared.local_ended.get() {
            return Ok(());
        }
        self.shared.local_ended.set(true);

        if self.can_send() && self.shared.queue.borrow().is_empty() {
            self.send_end().await?;
        }
        self.check_finished();
        Ok(())
    }

    async fn send_end(&self) -> NetronResult<()> {
        let _sending = self.shared.sending.lock().await;
        if self.shared.end_sent.get() {
            return Ok(());
        }
        self.send(Payload::StreamEnd {
            stream_id: self.shared.id,
            packet_id: self.shared.sent.get(),
        })
        .await?;
        self.shared.end_sent.set(true);
        Ok(())
    }

    /// Read the next chunk in packet order.
    ///
    /// Returns `None` once the remote side ended and every chunk it sent was
    /// read, or when the session went offline.
    pub async fn read(&self) -> Option<Bytes> {
        loop {
            let next = self.shared.next_read.get();
            let chunk = self.shared.buffer.borrow_mut().remove(&next);
            if let Some(chunk) = chunk {
                self.shared.next_read.set(next + 1);
                self.maybe_resume().await;
                return Some(chunk);
            }

            if self.shared.broken.get() {
                return None;
            }
            if self.shared.remote_end.get().is_some_and(|end| next > end) {
                return None;
            }
            self.shared.readable.notified().await;
        }
    }

    async fn maybe_resume(&self) {
        if !self.shared.pause_sent.get() {
            return;
        }
        if self.buffered() > self.shared.high_water_mark / 2 {
            return;
        }
        self.shared.pause_sent.set(false);
        let resume = Payload::StreamResume {
            stream_id: self.shared.id,
        };
        if let Err(error) = self.send(resume).await {
            tracing::warn!(stream = self.shared.id, %error, "failed to resume stream");
        }
    }

    pub(crate) async fn bind(&self, remote_id: u64) -> NetronResult<()> {
        self.shared.remote_id.set(Some(remote_id));
        self.shared.state.set(StreamState::Active);
        self.shared.activated.notify_one();
        self.flush().await
    }

    async fn flush(&self) -> NetronResult<()> {
        while self.can_send() {
            let next = self.shared.queue.borrow_mut().pop_front();
            match next {
                Some(chunk) => self.send_data(chunk).await?,
                None => break,
            }
        }

        if self.shared.local_ended.get()
            && !self.shared.end_sent.get()
            && self.can_send()
            && self.shared.queue.borrow().is_empty()
        {
            self.send_end().await?;
            self.check_finished();
        }
        Ok(())
    }

    pub(crate) async fn on_data(&self, packet_id: u64, chunk: Bytes) {
        let id = self.shared.id;
        if packet_id < self.shared.next_read.get()
            || self.shared.remote_end.get().is_some_and(|end| packet_id > end)
        {
            tracing::debug!(stream = id, packet_id, "dropping stale stream packet");
            return;
        }

        let buffered = {
            let mut buffer = self.shared.buffer.borrow_mut();
            if buffer.contains_key(&packet_id) {
                tracing::debug!(stream = id, packet_id, "dropping duplicate stream packet");
                return;
            }
            buffer.insert(packet_id, chunk);
            buffer.len()
        };
        self.shared.readable.notify_one();

        if buffered >= self.shared.high_water_mark && !self.shared.pause_sent.get() {
            self.shared.pause_sent.set(true);
            if let Err(error) = self.send(Payload::StreamPause { stream_id: id }).await {
                tracing::warn!(stream = id, %error, "failed to pause stream");
            }
        }
    }

    pub(crate) fn on_pause(&self) {
        self.shared.paused.set(true);
    }

    pub(crate) async fn on_resume(&self) -> NetronResult<()> {
        self.shared.paused.set(false);
        self.flush().await
    }

    pub(crate) async fn on_remote_end(&self, packet_id: u64) -> NetronResult<()> {
        self.shared.remote_end.set(Some(packet_id));
        self.shared.readable.notify_one();

        if !self.shared.allow_half_open && !self.shared.local_ended.get() {
            self.end().await
        } else {
            self.check_finished();
            Ok(())
        }
    }

    fn check_finished(&self) {
        if self.shared.remote_end.get().is_none() {
            return;
        }
        if self.shared.end_sent.get() {
            self.shared.state.set(StreamState::Ended);
            if let Ok(peer) = self.peer() {
                peer.streams().forget(self);
            }
        } else if self.shared.allow_half_open {
            self.shared.state.set(StreamState::Ended);
        }
    }

    pub(crate) fn abort(&self) {
        self.shared.broken.set(true);
        self.shared.state.set(StreamState::Ended);
        self.shared.readable.notify_one();
        self.shared.activated.notify_one();
    }
}

impl fmt::Debug for NetronStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetronStream")
            .field("id", &self.shared.id)
            .field("remote_id", &self.shared.remote_id.get())
            .field("state", &self.shared.state.get())
            .finish()
    }
}

fn split_chunk(mut chunk: Bytes) -> Vec<Bytes> {
    let mut pieces = Vec::with_capacity(chunk.len() / MAX_CHUNK_SIZE + 1);
    while chunk.len() > MAX_CHUNK_SIZE {
        pieces.push(chunk.split_to(MAX_CHUNK_SIZE));
    }
    pieces.push(chunk);
    pieces
}

//! Pending-response bookkeeping with per-entry expiry.
//!
//! # Architecture
//!
//! ```text
//! Request Flow:
//!   1. Allocate correlation id
//!   2. set(id, continuation)      -> spawns the expiry timer
//!   3. Send request over the transport
//!
//! Reply Flow:
//!   4. Reply arrives with the same id
//!   5. take(id)                   -> timer aborted
//!   6. continuation(Ok(reply))
//!
//! Expiry Flow:
//!   4. Timer fires before any reply
//!   5. Entry removed, expiry callback invoked with (id, continuation)
//!   6. continuation(Err(RequestTimeout))
//! ```
//!
//! Timers are spawned with `tokio::task::spawn_local`, so the map must be
//! used from inside a `LocalSet`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::error::{NetronError, NetronResult};

/// Callback completing a pending request.
pub type Continuation<T> = Box<dyn FnOnce(NetronResult<T>)>;

/// Callback invoked when an entry expires, receiving the key and the
/// continuation that was removed from the map.
pub type ExpiryCallback<T> = Rc<dyn Fn(u64, Continuation<T>)>;

struct Entry<T> {
    continuation: Continuation<T>,
    timer: JoinHandle<()>,
}

struct Inner<T> {
    ttl: Duration,
    entries: RefCell<HashMap<u64, Entry<T>>>,
    on_expire: ExpiryCallback<T>,
}

impl<T> Inner<T> {
    fn expire(&self, key: u64) {
        let entry = self.entries.borrow_mut().remove(&key);
        if let Some(entry) = entry {
            (self.on_expire)(key, entry.continuation);
        }
    }
}

/// Map from correlation id to continuation, where every entry expires after
/// a fixed TTL.
pub struct TimedoutAwaiterMap<T: 'static> {
    inner: Rc<Inner<T>>,
}

impl<T: 'static> TimedoutAwaiterMap<T> {
    /// Create a map whose entries expire after `ttl`, handing expired
    /// continuations to `on_expire`.
    pub fn new(ttl: Duration, on_expire: impl Fn(u64, Continuation<T>) + 'static) -> Self {
        Self {
            inner: Rc::new(Inner {
                ttl,
                entries: RefCell::new(HashMap::new()),
                on_expire: Rc::new(on_expire),
            }),
        }
    }

    /// Create a map that rejects expired entries with
    /// [`NetronError::RequestTimeout`].
    pub fn with_timeout_rejection(ttl: Duration) -> Self {
        Self::new(ttl, move |key, continuation| {
            tracing::debug!(key, timeout_ms = ttl.as_millis() as u64, "awaiter expired");
            continuation(Err(NetronError::RequestTimeout { timeout: ttl }));
        })
    }

    /// TTL applied to every entry.
    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    /// Register a continuation under `key` and start its expiry timer.
    ///
    /// An existing entry under the same key is replaced and its timer
    /// restarted.
    pub fn set(&self, key: u64, continuation: Continuation<T>) {
        let weak = Rc::downgrade(&self.inner);
        let ttl = self.inner.ttl;
        let timer = tokio::task::spawn_local(async move {
            tokio::time::sleep(ttl).await;
            if let Some(inner) = weak.upgrade() {
                inner.expire(key);
            }
        });

        let previous = self
            .inner
            .entries
            .borrow_mut()
            .insert(key, Entry { continuation, timer });
        if let Some(previous) = previous {
            previous.timer.abort();
        }
    }

    /// Remove and return the continuation for `key`, cancelling its timer.
    pub fn take(&self, key: u64) -> Option<Continuation<T>> {
        let entry = self.inner.entries.borrow_mut().remove(&key)?;
        entry.timer.abort();
        Some(entry.continuation)
    }

    /// Remove the entry for `key` without invoking it.
    ///
    /// Returns `true` if an entry was present.
    pub fn delete(&self, key: u64) -> bool {
        self.take(key).is_some()
    }

    /// Check whether `key` has a pending entry.
    pub fn contains(&self, key: u64) -> bool {
        self.inner.entries.borrow().contains_key(&key)
    }

    /// Number of pending entries.
    pub fn len(&self) -> usize {
        self.inner.entries.borrow().len()
    }

    /// Check whether no entry is pending.
    pub fn is_empty(&self) -> bool {
        self.inner.entries.borrow().is_empty()
    }

    /// Cancel every timer and drop every entry without invoking it.
    pub fn clear(&self) {
        let drained: Vec<Entry<T>> = self
            .inner
            .entries
            .borrow_mut()
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for entry in drained {
            entry.timer.abort();
        }
    }

    /// Fail every pending entry with the error produced by `make_error`,
    /// leaving the map empty.
    pub fn reject_all(&self, make_error: impl Fn() -> NetronError) {
        let drained: Vec<(u64, Entry<T>)> = self.inner.entries.borrow_mut().drain().collect();
        for (key, entry) in drained {
            entry.timer.abort();
            tracing::debug!(key, "rejecting pending awaiter");
            (entry.continuation)(Err(make_error()));
        }
        self.clear();
    }
}

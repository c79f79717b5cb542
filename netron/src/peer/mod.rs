//! One end of a bidirectional RPC session.
//!
//! # Overview
//!
//! A [`Peer`] wraps a [`Transport`](crate::transport::Transport) and speaks
//! the envelope protocol over it. It handles:
//! - **Requests**: `get`, `set`, `call`, `ping` with per-request timeouts
//! - **Serving**: inbound `get`/`set` are dispatched to the runtime's stubs
//! - **Contexts**: remote definitions announced through handshake and
//!   attach/detach
//! - **Streams**: multiplexed byte streams with backpressure
//!
//! # Session Lifecycle
//!
//! ```text
//! ┌─────────┐ connect ┌────────────┐ transport up ┌─────────────┐
//! │ Offline ├────────►│ Connecting ├─────────────►│ Handshaking │
//! └────▲────┘         └──────┬─────┘              └──────┬──────┘
//!      │                     │ failure                   │ handshake reply
//!      │◄────────────────────┘                           ▼
//!      │            transport closed / disconnect  ┌──────────┐
//!      └───────────────────────────────────────────┤  Online  │
//!                                                  └──────────┘
//! ```
//!
//! Going offline rejects every pending request with `PeerDisconnected`,
//! aborts open streams and releases the stubs minted for the remote side.

/// Peer handle, request plumbing and inbound dispatch.
pub mod core;

/// Event callbacks.
mod observer;

/// Session status.
pub mod status;

pub use self::core::Peer;
pub(crate) use self::core::{PeerInner, Reply};
pub use status::Status;

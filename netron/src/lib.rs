//! # Netron
//!
//! Bidirectional RPC peer runtime.
//!
//! This crate provides:
//! - **Netron**: Runtime exposing local contexts, tracking live peers and
//!   relaying remote events
//! - **Peer**: One end of a session issuing `get`/`set`/`call` requests
//! - **Streams**: Multiplexed byte streams with pause/resume backpressure
//! - **Wire format**: Length-prefixed frames with CRC32C checksums
//! - **Transports**: In-memory pairs and TCP with reconnect backoff
//!
//! Everything runs on a single thread: peers and the runtime must be driven
//! inside a [`tokio::task::LocalSet`].

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

// =============================================================================
// Modules
// =============================================================================

/// Pending-response map with per-entry expiry.
pub mod awaiter;

/// Peer and transport options.
pub mod config;

/// Local objects exposed to peers.
pub mod context;

/// Object definitions and their registry.
pub mod definition;

/// Error types.
pub mod error;

/// Handles to remote objects.
pub mod interface;

mod marshal;

/// Runtime owning contexts and peers.
pub mod netron;

/// Session endpoints.
pub mod peer;

/// Monotonic id allocation.
pub mod sequence;

/// Multiplexed byte streams.
pub mod stream;

/// Byte transports.
pub mod transport;

/// Dynamically typed values.
pub mod value;

/// Frame and envelope encoding.
pub mod wire;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use awaiter::TimedoutAwaiterMap;
pub use config::PeerOptions;
pub use context::{Context, Stub, StubTarget};
pub use definition::{DefId, Definition, DefinitionRegistry, Member, Reference};
pub use error::{NetronError, NetronResult, RemoteError};
pub use interface::Interface;
pub use netron::Netron;
pub use peer::{Peer, Status};
pub use sequence::SequenceId;
pub use stream::{NetronStream, StreamOptions, StreamState};
pub use transport::{FrameReceiver, LocalTransport, TcpTransport, Transport};
pub use value::Value;
pub use wire::{
    deserialize_frame, serialize_frame, try_deserialize_frame, Action, DataFlags, Envelope,
    Handshake, Payload, WireError, HEADER_SIZE, MAX_BODY_SIZE,
};

//! Error types for peer and runtime operations.
//!
//! Every failure of a request surfaces to the caller as a [`NetronError`].
//! Errors that cross the wire travel as a [`RemoteError`], which only keeps
//! the kind and the rendered message.

use std::fmt;
use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::definition::DefId;
use crate::wire::WireError;

/// Errors that can occur during netron operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NetronError {
    /// An operation the underlying transport does not provide.
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    /// No definition with this id is registered.
    #[error("unknown definition: {0}")]
    UnknownDefinition(DefId),

    /// The definition exists but has no member with this name.
    #[error("unknown member '{name}' of definition {def_id}")]
    UnknownMember {
        /// Definition that was looked up.
        def_id: DefId,
        /// Missing member name.
        name: String,
    },

    /// No context is registered under this name.
    #[error("unknown context: {0}")]
    UnknownContext(String),

    /// No peer is registered under this uid.
    #[error("unknown peer: {0}")]
    UnknownPeer(Uuid),

    /// Write attempted on a readonly property.
    #[error("invalid access: {0}")]
    InvalidAccess(String),

    /// The referenced object does not exist.
    #[error("not exists: {0}")]
    NotExists(String),

    /// A context with this name is already registered.
    #[error("context already exists: {0}")]
    ContextExists(String),

    /// No reply arrived within the configured response timeout.
    #[error("Response timeout {}ms exceeded", .timeout.as_millis())]
    RequestTimeout {
        /// The configured response timeout.
        timeout: Duration,
    },

    /// The peer went offline while the request was outstanding.
    #[error("peer disconnected")]
    PeerDisconnected,

    /// Operation not allowed in the current peer state.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// The remote side reported a failure.
    #[error("remote error: {0}")]
    Remote(RemoteError),

    /// Transport level failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Frame could not be encoded or decoded.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Envelope or payload did not match the protocol.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl NetronError {
    /// Stable name of the error kind, carried in [`RemoteError::kind`].
    pub fn kind(&self) -> &'static str {
        match self {
            NetronError::NotImplemented(_) => "NotImplemented",
            NetronError::UnknownDefinition(_) => "UnknownDefinition",
            NetronError::UnknownMember { .. } => "UnknownMember",
            NetronError::UnknownContext(_) => "UnknownContext",
            NetronError::UnknownPeer(_) => "UnknownPeer",
            NetronError::InvalidAccess(_) => "InvalidAccess",
            NetronError::NotExists(_) => "NotExists",
            NetronError::ContextExists(_) => "ContextExists",
            NetronError::RequestTimeout { .. } => "RequestTimeout",
            NetronError::PeerDisconnected => "PeerDisconnected",
            NetronError::IllegalState(_) => "IllegalState",
            NetronError::Remote(_) => "Remote",
            NetronError::Transport(_) => "Transport",
            NetronError::Wire(_) => "Wire",
            NetronError::Protocol(_) => "Protocol",
        }
    }
}

impl From<io::Error> for NetronError {
    fn from(error: io::Error) -> Self {
        NetronError::Transport(error.to_string())
    }
}

impl From<serde_json::Error> for NetronError {
    fn from(error: serde_json::Error) -> Self {
        NetronError::Protocol(error.to_string())
    }
}

/// Result type for netron operations.
pub type NetronResult<T> = Result<T, NetronError>;

/// Error as it travels inside a reply payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Kind of the original error, see [`NetronError::kind`].
    pub kind: String,
    /// Rendered message of the original error.
    pub message: String,
}

impl RemoteError {
    /// Create a remote error from its parts.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl From<&NetronError> for RemoteError {
    fn from(error: &NetronError) -> Self {
        match error {
            // Forwarded failures keep their original kind across hops.
            NetronError::Remote(remote) => remote.clone(),
            other => RemoteError::new(other.kind(), other.to_string()),
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RemoteError {}

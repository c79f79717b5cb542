//! Byte transports carrying frames between peers.
//!
//! A transport only writes. Inbound bytes are delivered through the
//! [`FrameReceiver`] handed out when the transport is created; the peer's
//! serve loop reassembles frames from it.

/// In-memory transport pair.
pub mod local;
/// TCP transport with reconnect backoff.
pub mod tcp;

pub use local::LocalTransport;
pub use tcp::TcpTransport;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{NetronError, NetronResult};

/// Receiving end of a transport: raw byte chunks in arrival order.
///
/// The channel closes when the connection is gone.
pub type FrameReceiver = mpsc::UnboundedReceiver<Vec<u8>>;

/// Connection primitives a peer delegates to.
///
/// Every method defaults to `NotImplemented`, so a transport only provides
/// what it supports.
#[async_trait(?Send)]
pub trait Transport {
    /// Establish the connection.
    async fn connect(&self) -> NetronResult<()> {
        Err(NetronError::NotImplemented("connect"))
    }

    /// Close the connection.
    async fn disconnect(&self) -> NetronResult<()> {
        Err(NetronError::NotImplemented("disconnect"))
    }

    /// Report whether the connection is up.
    fn is_connected(&self) -> NetronResult<bool> {
        Err(NetronError::NotImplemented("is_connected"))
    }

    /// Write raw bytes.
    async fn write(&self, _data: &[u8]) -> NetronResult<()> {
        Err(NetronError::NotImplemented("write"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Bare;

    #[async_trait(?Send)]
    impl Transport for Bare {}

    #[tokio::test]
    async fn test_default_methods_are_not_implemented() {
        let transport = Bare;

        assert_eq!(
            transport.connect().await,
            Err(NetronError::NotImplemented("connect"))
        );
        assert_eq!(
            transport.disconnect().await,
            Err(NetronError::NotImplemented("disconnect"))
        );
        assert_eq!(
            transport.is_connected(),
            Err(NetronError::NotImplemented("is_connected"))
        );
        assert_eq!(
            transport.write(b"data").await,
            Err(NetronError::NotImplemented("write"))
        );
    }

    #[test]
    fn test_not_implemented_message() {
        assert_eq!(
            NetronError::NotImplemented("connect").to_string(),
            "not implemented: connect"
        );
    }
}

use std::cell::RefCell;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{FrameReceiver, Transport};
use crate::error::{NetronError, NetronResult};

/// One end of an in-memory connection.
///
/// Created in pairs by [`LocalTransport::pair`]; bytes written on one end
/// show up on the other end's [`FrameReceiver`]. Disconnecting either end
/// closes the other end's receiver.
pub struct LocalTransport {
    outbound: RefCell<Option<mpsc::UnboundedSender<Vec<u8>>>>,
}

impl LocalTransport {
    /// Create two connected ends, each with the receiver for its inbound
    /// bytes.
    pub fn pair() -> ((LocalTransport, FrameReceiver), (LocalTransport, FrameReceiver)) {
        let (to_right, right_rx) = mpsc::unbounded_channel();
        let (to_left, left_rx) = mpsc::unbounded_channel();

        let left = LocalTransport {
            outbound: RefCell::new(Some(to_right)),
        };
        let right = LocalTransport {
            outbound: RefCell::new(Some(to_left)),
        };
        ((left, left_rx), (right, right_rx))
    }

    fn sender(&self) -> Option<mpsc::UnboundedSender<Vec<u8>>> {
        self.outbound
            .borrow()
            .as_ref()
            .filter(|tx| !tx.is_closed())
            .cloned()
    }
}

#[async_trait(?Send)]
impl Transport for LocalTransport {
    async fn connect(&self) -> NetronResult<()> {
        match self.sender() {
            Some(_) => Ok(()),
            None => Err(NetronError::Transport("local channel closed".into())),
        }
    }

    async fn disconnect(&self) -> NetronResult<()> {
        self.outbound.borrow_mut().take();
        Ok(())
    }

    fn is_connected(&self) -> NetronResult<bool> {
        Ok(self.sender().is_some())
    }

    async fn write(&self, data: &[u8]) -> NetronResult<()> {
        let tx = self.sender().ok_or(NetronError::PeerDisconnected)?;
        tx.send(data.to_vec())
            .map_err(|_| NetronError::PeerDisconnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_delivers_to_other_end() {
        let ((left, _left_rx), (_right, mut right_rx)) = LocalTransport::pair();

        left.write(b"ping").await.expect("write");
        assert_eq!(right_rx.recv().await, Some(b"ping".to_vec()));
    }

    #[tokio::test]
    async fn test_disconnect_closes_remote_receiver() {
        let ((left, _left_rx), (right, mut right_rx)) = LocalTransport::pair();

        left.disconnect().await.expect("disconnect");

        assert_eq!(right_rx.recv().await, None);
        assert_eq!(left.is_connected(), Ok(false));
        assert_eq!(
            left.write(b"late").await,
            Err(NetronError::PeerDisconnected)
        );
        assert!(right.is_connected().expect("supported"));
    }
}

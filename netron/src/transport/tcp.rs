use std::cell::{Cell, RefCell};
use std::rc::Rc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::{FrameReceiver, Transport};
use crate::config::PeerOptions;
use crate::error::{NetronError, NetronResult};

const READ_BUFFER_SIZE: usize = 8192;

/// TCP connection to a remote runtime.
///
/// Outbound transports dial with exponential backoff: the delay starts at
/// `retry_timeout`, doubles after each failure up to `retry_max_timeout`,
/// and dialing gives up after `reconnects` retries. Each attempt is bounded
/// by `connect_timeout`.
///
/// The read half runs in a local task and must be driven inside a
/// [`tokio::task::LocalSet`].
pub struct TcpTransport {
    addr: Option<String>,
    options: PeerOptions,
    writer: Mutex<Option<OwnedWriteHalf>>,
    inbound: RefCell<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    reader: RefCell<Option<JoinHandle<()>>>,
    connected: Rc<Cell<bool>>,
}

impl TcpTransport {
    /// Transport that dials `addr` on [`Transport::connect`].
    pub fn new(addr: impl Into<String>, options: PeerOptions) -> (Self, FrameReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Self {
            addr: Some(addr.into()),
            options,
            writer: Mutex::new(None),
            inbound: RefCell::new(Some(tx)),
            reader: RefCell::new(None),
            connected: Rc::new(Cell::new(false)),
        };
        (transport, rx)
    }

    /// Transport around an accepted connection.
    pub fn from_stream(stream: TcpStream) -> (Self, FrameReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Err(error) = stream.set_nodelay(true) {
            tracing::warn!(%error, "failed to set TCP_NODELAY");
        }
        let (read_half, write_half) = stream.into_split();
        let connected = Rc::new(Cell::new(true));
        let reader = tokio::task::spawn_local(read_loop(read_half, tx, connected.clone()));

        let transport = Self {
            addr: None,
            options: PeerOptions::default(),
            writer: Mutex::new(Some(write_half)),
            inbound: RefCell::new(None),
            reader: RefCell::new(Some(reader)),
            connected,
        };
        (transport, rx)
    }

    async fn dial(&self, addr: &str) -> NetronResult<TcpStream> {
        let mut delay = self.options.retry_timeout;
        let mut failures = 0;

        loop {
            let error = match tokio::time::timeout(
                self.options.connect_timeout,
                TcpStream::connect(addr),
            )
            .await
            {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(error)) => NetronError::from(error),
                Err(_) => NetronError::Transport(format!("connection to {addr} timed out")),
            };

            failures += 1;
            if failures > self.options.reconnects {
                return Err(error);
            }
            tracing::debug!(addr, failures, ?delay, %error, "connection attempt failed");

            tokio::time::sleep(delay).await;
            delay = std::cmp::min(delay * 2, self.options.retry_max_timeout);
        }
    }
}

#[async_trait(?Send)]
impl Transport for TcpTransport {
    async fn connect(&self) -> NetronResult<()> {
        if self.connected.get() {
            return Ok(());
        }
        let Some(addr) = self.addr.clone() else {
            return Err(NetronError::IllegalState(
                "accepted connection cannot be redialed".into(),
            ));
        };
        if self.inbound.borrow().is_none() {
            return Err(NetronError::IllegalState(format!(
                "transport to {addr} was already used"
            )));
        }

        let stream = self.dial(&addr).await?;
        stream.set_nodelay(true)?;

        let tx = self
            .inbound
            .borrow_mut()
            .take()
            .ok_or_else(|| NetronError::IllegalState(format!("transport to {addr} was already used")))?;
        let (read_half, write_half) = stream.into_split();
        *self.writer.lock().await = Some(write_half);
        self.connected.set(true);

        let reader = tokio::task::spawn_local(read_loop(read_half, tx, self.connected.clone()));
        *self.reader.borrow_mut() = Some(reader);

        tracing::debug!(addr = %addr, "connected");
        Ok(())
    }

    async fn disconnect(&self) -> NetronResult<()> {
        self.connected.set(false);
        let reader = self.reader.borrow_mut().take();
        if let Some(reader) = reader {
            reader.abort();
        }

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(error) = writer.shutdown().await {
                tracing::debug!(%error, "shutdown failed");
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> NetronResult<bool> {
        Ok(self.connected.get())
    }

    async fn write(&self, data: &[u8]) -> NetronResult<()> {
        let mut writer = self.writer.lock().await;
        let stream = writer.as_mut().ok_or(NetronError::PeerDisconnected)?;
        stream.write_all(data).await?;
        Ok(())
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    connected: Rc<Cell<bool>>,
) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!("connection closed by remote");
                break;
            }
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(error) => {
                tracing::warn!(%error, "read failed");
                break;
            }
        }
    }
    connected.set(false);
}

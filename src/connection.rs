use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use log::{info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::error::SwitchError;
use crate::frame::{EthernetFrame, MAX_FRAME_SIZE};
use crate::pool::BufferPool;

/// One VM attached to a VLAN over a stream socket.
///
/// The reader half is only ever used by the connection's reader task; the
/// writer half is locked per frame so that concurrent forwards to the same
/// destination keep the length prefix and body contiguous and deliver frames
/// in write order.
pub struct Connection {
    id: String,
    remote: String,
    reader: tokio::sync::Mutex<OwnedReadHalf>,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    closed: AtomicBool,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    last_seen: Mutex<Instant>,
}

impl Connection {
    pub fn new(id: String, remote: String, stream: TcpStream) -> Arc<Self> {
        let (reader, writer) = stream.into_split();
        Arc::new(Self {
            id,
            remote,
            reader: tokio::sync::Mutex::new(reader),
            writer: tokio::sync::Mutex::new(writer),
            closed: AtomicBool::new(false),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            last_seen: Mutex::new(Instant::now()),
        })
    }

    /// Read one length-prefixed Ethernet frame.
    ///
    /// A clean end-of-stream between frames yields `ConnectionClosed`; a
    /// stream that ends inside a prefix or body yields `ShortRead`. Both are
    /// non-recoverable on this connection, as is `InvalidLength`.
    pub async fn read_frame(&self, pool: &Arc<BufferPool>) -> Result<EthernetFrame, SwitchError> {
        if self.is_closed() {
            return Err(SwitchError::ConnectionClosed);
        }

        let mut reader = self.reader.lock().await;

        let len = Self::read_length_prefix(&mut reader).await?;
        if len == 0 || len as usize > MAX_FRAME_SIZE {
            return Err(SwitchError::InvalidLength(len));
        }

        let mut buf = pool.acquire();
        reader
            .read_exact(&mut buf[..len as usize])
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => SwitchError::ShortRead,
                _ => SwitchError::Io(e),
            })?;
        drop(reader);

        let frame = EthernetFrame::parse(buf, len as usize)?;

        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(len as u64, Ordering::Relaxed);
        self.touch();

        Ok(frame)
    }

    /// Write one frame as a 4-byte big-endian length prefix plus the body.
    pub async fn write_frame(&self, frame: &EthernetFrame) -> Result<(), SwitchError> {
        if self.is_closed() {
            return Err(SwitchError::ConnectionClosed);
        }

        let data = frame.bytes();
        let prefix = (data.len() as u32).to_be_bytes();

        let mut writer = self.writer.lock().await;
        writer
            .write_all(&prefix)
            .await
            .map_err(SwitchError::WriteFailed)?;
        writer
            .write_all(data)
            .await
            .map_err(SwitchError::WriteFailed)?;
        drop(writer);

        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(data.len() as u64, Ordering::Relaxed);

        Ok(())
    }

    /// Mark the connection closed and shut down the socket. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            warn!("Error closing connection {}: {}", self.id, e);
        }
        drop(writer);

        info!(
            "Connection {} closed (sent: {} frames/{} bytes, received: {} frames/{} bytes)",
            self.id,
            self.frames_sent.load(Ordering::Relaxed),
            self.bytes_sent.load(Ordering::Relaxed),
            self.frames_received.load(Ordering::Relaxed),
            self.bytes_received.load(Ordering::Relaxed),
        );
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn last_seen(&self) -> Instant {
        *self
            .last_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn touch(&self) {
        *self
            .last_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Distinguishes clean EOF (no bytes of the next frame arrived yet) from
    /// a prefix truncated mid-way.
    async fn read_length_prefix(reader: &mut OwnedReadHalf) -> Result<u32, SwitchError> {
        let mut prefix = [0u8; 4];
        let mut filled = 0;
        while filled < prefix.len() {
            let n = reader.read(&mut prefix[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Err(SwitchError::ConnectionClosed);
                }
                return Err(SwitchError::ShortRead);
            }
            filled += n;
        }
        Ok(u32::from_be_bytes(prefix))
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Connection[{}, remote={}, frames_rx={}, frames_tx={}, closed={}]",
            self.id,
            self.remote,
            self.frames_received.load(Ordering::Relaxed),
            self.frames_sent.load(Ordering::Relaxed),
            self.is_closed(),
        )
    }
}

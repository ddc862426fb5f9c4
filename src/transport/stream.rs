//! WebTransport stream abstraction (component C).
//!
//! Generic over the underlying transport so it can be driven by a real
//! `h3`/QUIC stream in production and by an in-memory duplex pipe in tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::TransportError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Readable and writable.
    Bidirectional,
    /// Writable only (opened locally).
    UnidirectionalSend,
    /// Readable only (initiated by the peer).
    UnidirectionalRecv,
}

impl Direction {
    fn readable(self) -> bool {
        matches!(self, Self::Bidirectional | Self::UnidirectionalRecv)
    }

    fn writable(self) -> bool {
        matches!(self, Self::Bidirectional | Self::UnidirectionalSend)
    }
}

const INBOUND_QUEUE_CAPACITY: usize = 16;

/// A single inbound record: a chunk of bytes plus whether the stream ended
/// with it.
type InboundRecord = (Bytes, bool);

/// One WebTransport stream. Writes go straight to the underlying sink;
/// reads come from a bounded inbound queue fed by a pump task (see
/// [`spawn_pump`]) so the drop-newest overflow policy is enforced
/// independently of how fast the underlying transport is read from.
pub struct WtStream {
    id: u64,
    direction: Direction,
    closed: Arc<AtomicBool>,
    inbound_tx: mpsc::Sender<InboundRecord>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<InboundRecord>>,
    sink: tokio::sync::Mutex<Option<Box<dyn AsyncWrite + Send + Unpin>>>,
}

impl WtStream {
    pub fn new(
        id: u64,
        direction: Direction,
        sink: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
        Arc::new(Self {
            id,
            direction,
            closed: Arc::new(AtomicBool::new(false)),
            inbound_tx: tx,
            inbound_rx: tokio::sync::Mutex::new(rx),
            sink: tokio::sync::Mutex::new(sink),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Writes `bytes` to the underlying stream, optionally ending it. Fails
    /// with [`TransportError::StreamClosed`] if already closed.
    pub async fn write(&self, bytes: Bytes, end: bool) -> Result<(), TransportError> {
        if !self.direction.writable() {
            return Err(TransportError::StreamClosed);
        }
        if self.is_closed() {
            return Err(TransportError::StreamClosed);
        }
        let mut guard = self.sink.lock().await;
        let Some(sink) = guard.as_mut() else {
            return Err(TransportError::StreamClosed);
        };
        if sink.write_all(&bytes).await.is_err() {
            drop(guard);
            self.close();
            return Err(TransportError::StreamClosed);
        }
        if end {
            let _ = sink.shutdown().await;
            drop(guard);
            self.close();
        }
        Ok(())
    }

    /// Awaits the next inbound record. Returns empty bytes once closed and
    /// drained, without error, for readable streams.
    pub async fn read(&self) -> Result<Bytes, TransportError> {
        if !self.direction.readable() {
            return Err(TransportError::NotReadable);
        }
        let mut rx = self.inbound_rx.lock().await;
        match rx.recv().await {
            Some((bytes, _end)) => Ok(bytes),
            None => Ok(Bytes::new()),
        }
    }

    /// Deposits data read off the underlying transport by the pump task.
    /// Drop-newest on overflow: if the bounded inbound queue is full, the
    /// new chunk is dropped. If the dropped chunk carried `end = true`, the
    /// stream is still marked closed so readers observe termination.
    pub fn feed_data(&self, bytes: Bytes, end: bool) {
        if self.is_closed() {
            return;
        }
        match self.inbound_tx.try_send((bytes, end)) {
            Ok(()) => {
                if end {
                    self.close();
                }
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(stream_id = self.id, "inbound queue full, dropped chunk");
                if end {
                    self.close();
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.close();
            }
        }
    }

    /// Idempotent local close. If the stream was open, wakes a pending
    /// reader with a terminal empty record.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.inbound_tx.try_send((Bytes::new(), true));
    }
}

/// Drives `reader` into `stream.feed_data` until EOF or error, translating
/// the underlying transport's pull-based interface into the push-based
/// bounded queue [`WtStream`] exposes to callers.
pub async fn spawn_pump(stream: Arc<WtStream>, mut reader: Box<dyn AsyncRead + Send + Unpin>) {
    let mut buf = vec![0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                stream.feed_data(Bytes::new(), true);
                break;
            }
            Ok(n) => {
                stream.feed_data(Bytes::copy_from_slice(&buf[..n]), false);
            }
            Err(_) => {
                stream.feed_data(Bytes::new(), true);
                break;
            }
        }
    }
}

//! WebTransport Session lifecycle (component D).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::error::HandlerError;

use super::handler::WebTransportHandler;
use super::stream::{Direction, WtStream, spawn_pump};
use crate::error::TransportError;

/// The underlying transport capability a [`Session`] is built on. Production
/// code implements this over a `salvo::proto::WebTransportSession`; tests
/// substitute an in-memory fake so the state machine can be exercised
/// without a live QUIC connection.
#[async_trait]
pub trait WtTransport: Send + Sync {
    async fn open_uni(&self) -> Result<Box<dyn AsyncWrite + Send + Unpin>, TransportError>;
    async fn open_bi(
        &self,
    ) -> Result<
        (
            Box<dyn AsyncWrite + Send + Unpin>,
            Box<dyn AsyncRead + Send + Unpin>,
        ),
        TransportError,
    >;
    async fn send_datagram(&self, bytes: Bytes) -> Result<(), TransportError>;
    /// Ends the CONNECT request stream carrying this session.
    async fn close(&self, code: u32, reason: &str);
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Pending = 0,
    Accepted = 1,
    Closed = 2,
}

/// Wraps a caught panic's message so it can flow through [`HandlerError`],
/// which requires a `Send + Sync` `std::error::Error`.
#[derive(Debug)]
struct PanicPayload(String);

impl PanicPayload {
    fn from_payload(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self(message)
    }
}

impl std::fmt::Display for PanicPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for PanicPayload {}

/// Allocates a locally-initiated stream id, unique across every session in
/// this process. Per-session counters would collide: every session's first
/// locally-created stream would land on the same id, which the broadcast
/// handler uses as its hub subscriber key.
fn next_local_stream_id() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(1 << 62);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

impl From<u8> for State {
    fn from(v: u8) -> Self {
        match v {
            0 => State::Pending,
            1 => State::Accepted,
            _ => State::Closed,
        }
    }
}

/// One accepted (or pending) WebTransport session. Owns its child streams;
/// dropped when the adapter's per-connection accept loop deregisters it on
/// close.
pub struct Session {
    id: u64,
    transport: Arc<dyn WtTransport>,
    state: AtomicU8,
    streams: DashMap<u64, Arc<WtStream>>,
    handler: tokio::sync::OnceCell<Arc<dyn WebTransportHandler>>,
    close_notify: Notify,
    closed_once: std::sync::atomic::AtomicBool,
    close_code: AtomicU8,
    close_reason: Mutex<String>,
    /// Handles for dispatch/pump/datagram tasks spawned off this session,
    /// aborted in `finalize` so none outlive the session that spawned them.
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Cheap-to-clone reference to a session, handed to handler hooks.
pub type SessionHandle = Arc<Session>;

impl Session {
    pub fn new(id: u64, transport: Arc<dyn WtTransport>) -> Arc<Self> {
        Arc::new(Self {
            id,
            transport,
            state: AtomicU8::new(State::Pending as u8),
            streams: DashMap::new(),
            handler: tokio::sync::OnceCell::new(),
            close_notify: Notify::new(),
            closed_once: std::sync::atomic::AtomicBool::new(false),
            close_code: AtomicU8::new(0),
            close_reason: Mutex::new(String::new()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn session_id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        State::from(self.state.load(Ordering::Acquire)) == State::Closed
    }

    /// Marks the session `Accepted` (the adapter has already sent
    /// `:status 200` by the time this runs — see the module-level note on
    /// the collapsed accept step), invokes `on_session_ready`, then awaits
    /// the close signal before finalizing. A handler that panics inside
    /// `on_session_ready` closes the session with code 1, reason
    /// "handler error" rather than tearing down the whole request task.
    pub async fn run(self: &Arc<Self>, handler: Arc<dyn WebTransportHandler>) {
        self.state
            .store(State::Accepted as u8, Ordering::Release);
        let _ = self.handler.set(Arc::clone(&handler));

        let ready = handler.on_session_ready(Arc::clone(self));
        if let Err(panic) = std::panic::AssertUnwindSafe(ready).catch_unwind().await {
            let err = HandlerError(Box::new(PanicPayload::from_payload(panic)));
            warn!(session_id = self.id, error = %err, "handler panicked in on_session_ready");
            self.mark_closed_with_reason(1, "handler error");
        }

        self.close_notify.notified().await;

        for entry in self.streams.iter() {
            entry.value().close();
        }
        self.streams.clear();

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        self.finalize(handler).await;
    }

    async fn finalize(self: &Arc<Self>, handler: Arc<dyn WebTransportHandler>) {
        if self.closed_once.swap(true, Ordering::AcqRel) {
            return;
        }
        let code = self.close_code.load(Ordering::Acquire) as u32;
        let reason = self.close_reason.lock().clone();
        handler
            .on_session_closed(Arc::clone(self), code, &reason)
            .await;
    }

    /// Marks the session closed and wakes `run()`'s finalization, if not
    /// already closed. `code` is clamped to a `u8` here; the adapter maps
    /// richer `h3` error codes to the handful of codes this server emits.
    /// Reason defaults: 0 → "client closed", 1 → "handler error", anything
    /// else → "connection terminated" (the code a transport-layer failure,
    /// as opposed to a panicking handler, should close with).
    pub fn mark_closed(self: &Arc<Self>, code: u32) {
        let reason = match code {
            0 => "client closed",
            1 => "handler error",
            _ => "connection terminated",
        };
        self.mark_closed_with_reason(code, reason);
    }

    fn mark_closed_with_reason(self: &Arc<Self>, code: u32, reason: &str) {
        if self
            .state
            .swap(State::Closed as u8, Ordering::AcqRel)
            == State::Closed as u8
        {
            return;
        }
        self.close_code.store(code as u8, Ordering::Release);
        *self.close_reason.lock() = reason.to_string();
        self.close_notify.notify_one();
    }

    /// Explicit close requested by handler code.
    pub async fn close_session(self: &Arc<Self>, code: u32, reason: &str) {
        self.transport.close(code, reason).await;
        self.mark_closed_with_reason(code, reason);
    }

    /// Allocates a new locally-initiated stream. Fails with
    /// [`TransportError::SessionClosed`] after close.
    pub async fn create_stream(
        self: &Arc<Self>,
        bidirectional: bool,
    ) -> Result<Arc<WtStream>, TransportError> {
        if self.is_closed() {
            return Err(TransportError::SessionClosed);
        }
        let id = next_local_stream_id();
        let stream = if bidirectional {
            let (send, recv) = self.transport.open_bi().await?;
            let stream = WtStream::new(id, Direction::Bidirectional, Some(send));
            let handle = tokio::spawn(spawn_pump(Arc::clone(&stream), recv));
            self.tasks.lock().push(handle);
            stream
        } else {
            let send = self.transport.open_uni().await?;
            WtStream::new(id, Direction::UnidirectionalSend, Some(send))
        };
        self.streams.insert(id, Arc::clone(&stream));
        Ok(stream)
    }

    /// Discarded silently after close, matching the datagram contract.
    pub async fn send_datagram(&self, bytes: Bytes) -> Result<(), TransportError> {
        if self.is_closed() {
            return Ok(());
        }
        self.transport.send_datagram(bytes).await
    }

    /// Called by the adapter when the peer initiates a new stream.
    pub async fn handle_peer_stream(
        self: &Arc<Self>,
        id: u64,
        direction: Direction,
        reader: Box<dyn AsyncRead + Send + Unpin>,
        writer: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    ) {
        let stream = WtStream::new(id, direction, writer);
        self.streams.insert(id, Arc::clone(&stream));

        if let Some(handler) = self.handler.get() {
            let handler = Arc::clone(handler);
            let session = Arc::clone(self);
            let stream_for_dispatch = Arc::clone(&stream);
            let handle = tokio::spawn(async move {
                match direction {
                    Direction::Bidirectional => {
                        handler
                            .on_stream_bidirectional(session, stream_for_dispatch)
                            .await
                    }
                    _ => {
                        handler
                            .on_stream_unidirectional(session, stream_for_dispatch)
                            .await
                    }
                }
            });
            self.tasks.lock().push(handle);
        } else {
            warn!(session_id = self.id, "peer stream accepted before handler attached");
        }

        let pump_handle = tokio::spawn(spawn_pump(stream, reader));
        self.tasks.lock().push(pump_handle);
    }

    /// Called by the adapter when a datagram arrives for this session.
    pub async fn handle_datagram(self: &Arc<Self>, bytes: Bytes) {
        if let Some(handler) = self.handler.get() {
            let handler = Arc::clone(handler);
            let session = Arc::clone(self);
            let handle = tokio::spawn(async move { handler.on_datagram(session, bytes).await });
            self.tasks.lock().push(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct FakeTransport {
        closed: AtomicUsize,
    }

    #[async_trait]
    impl WtTransport for FakeTransport {
        async fn open_uni(&self) -> Result<Box<dyn AsyncWrite + Send + Unpin>, TransportError> {
            let (a, _b) = tokio::io::duplex(64);
            Ok(Box::new(a))
        }
        async fn open_bi(
            &self,
        ) -> Result<
            (
                Box<dyn AsyncWrite + Send + Unpin>,
                Box<dyn AsyncRead + Send + Unpin>,
            ),
            TransportError,
        > {
            let (a, b) = tokio::io::duplex(64);
            let (_r, w) = tokio::io::split(a);
            let (r2, _w2) = tokio::io::split(b);
            Ok((Box::new(w), Box::new(r2)))
        }
        async fn send_datagram(&self, _bytes: Bytes) -> Result<(), TransportError> {
            Ok(())
        }
        async fn close(&self, _code: u32, _reason: &str) {
            self.closed.fetch_add(1, Ordering::Relaxed);
        }
    }

    struct RecordingHandler {
        ready: AtomicUsize,
        closed: AtomicUsize,
    }

    #[async_trait]
    impl WebTransportHandler for RecordingHandler {
        async fn on_session_ready(&self, _session: SessionHandle) {
            self.ready.fetch_add(1, Ordering::Relaxed);
        }
        async fn on_session_closed(&self, _session: SessionHandle, _code: u32, _reason: &str) {
            self.closed.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[tokio::test]
    async fn closes_exactly_once() {
        let transport = Arc::new(FakeTransport {
            closed: AtomicUsize::new(0),
        });
        let session = Session::new(1, transport);
        let handler = Arc::new(RecordingHandler {
            ready: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
        });

        let session_clone = Arc::clone(&session);
        let handler_clone = Arc::clone(&handler) as Arc<dyn WebTransportHandler>;
        let run_task = tokio::spawn(async move { session_clone.run(handler_clone).await });

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        session.mark_closed(0);
        session.mark_closed(0); // idempotent second close
        run_task.await.unwrap();

        assert_eq!(handler.ready.load(Ordering::Relaxed), 1);
        assert_eq!(handler.closed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn create_stream_fails_after_close() {
        let transport = Arc::new(FakeTransport {
            closed: AtomicUsize::new(0),
        });
        let session = Session::new(2, transport);
        session.mark_closed(0);
        let err = session.create_stream(false).await.unwrap_err();
        assert_eq!(err, TransportError::SessionClosed);
    }

    #[tokio::test]
    async fn send_datagram_after_close_is_silently_ok() {
        let transport = Arc::new(FakeTransport {
            closed: AtomicUsize::new(0),
        });
        let session = Session::new(3, transport);
        session.mark_closed(0);
        assert!(session.send_datagram(Bytes::new()).await.is_ok());
    }

    #[tokio::test]
    async fn peer_stream_dispatches_handler_exactly_once() {
        struct CountingHandler {
            uni: AtomicUsize,
        }
        #[async_trait]
        impl WebTransportHandler for CountingHandler {
            async fn on_stream_unidirectional(
                &self,
                _session: SessionHandle,
                _stream: Arc<WtStream>,
            ) {
                self.uni.fetch_add(1, Ordering::Relaxed);
            }
        }

        let transport = Arc::new(FakeTransport {
            closed: AtomicUsize::new(0),
        });
        let session = Session::new(4, transport);
        let handler = Arc::new(CountingHandler {
            uni: AtomicUsize::new(0),
        });
        let _ = session.handler.set(Arc::clone(&handler) as Arc<dyn WebTransportHandler>);

        let (_a, b) = tokio::io::duplex(64);
        session
            .handle_peer_stream(10, Direction::UnidirectionalRecv, Box::new(b), None)
            .await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert_eq!(handler.uni.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn run_aborts_in_flight_peer_stream_tasks_on_close() {
        struct BlockingHandler {
            dispatched: AtomicUsize,
        }
        #[async_trait]
        impl WebTransportHandler for BlockingHandler {
            async fn on_stream_unidirectional(&self, _session: SessionHandle, _stream: Arc<WtStream>) {
                self.dispatched.fetch_add(1, Ordering::Relaxed);
                std::future::pending::<()>().await;
            }
        }

        let transport = Arc::new(FakeTransport {
            closed: AtomicUsize::new(0),
        });
        let session = Session::new(5, transport);
        let handler = Arc::new(BlockingHandler {
            dispatched: AtomicUsize::new(0),
        });

        let session_clone = Arc::clone(&session);
        let handler_clone = Arc::clone(&handler) as Arc<dyn WebTransportHandler>;
        let run_task = tokio::spawn(async move { session_clone.run(handler_clone).await });
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let (_a, b) = tokio::io::duplex(64);
        session
            .handle_peer_stream(20, Direction::UnidirectionalRecv, Box::new(b), None)
            .await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert_eq!(handler.dispatched.load(Ordering::Relaxed), 1);
        assert!(!session.tasks.lock().is_empty());

        session.mark_closed(0);
        run_task.await.unwrap();
        // The dispatch task is still stuck on `pending::<()>()`; if `run()`
        // hadn't aborted it, it would still be sitting in this list.
        assert!(session.tasks.lock().is_empty());
    }
}

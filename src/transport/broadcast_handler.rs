//! Broadcast Handler (component G).
//!
//! The only handler this server mounts. On session ready it opens one
//! server-initiated unidirectional stream and subscribes it to the
//! [`FanoutHub`]; on session close it unsubscribes. It never looks at
//! inbound data.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::warn;

use crate::hub::FanoutHub;

use super::handler::{HandlerFactory, RouteParams, WebTransportHandler};
use super::session::SessionHandle;
use super::stream::WtStream;

/// Builds a [`BroadcastHandler`] bound to the process-wide hub for every
/// accepted CONNECT on the route it is registered under.
pub struct BroadcastHandlerFactory {
    hub: Arc<FanoutHub>,
}

impl BroadcastHandlerFactory {
    pub fn new(hub: Arc<FanoutHub>) -> Self {
        Self { hub }
    }
}

impl HandlerFactory for BroadcastHandlerFactory {
    fn build(&self, _params: &RouteParams) -> Arc<dyn WebTransportHandler> {
        Arc::new(BroadcastHandler {
            hub: Arc::clone(&self.hub),
            subscriber_id: Mutex::new(None),
        })
    }
}

pub struct BroadcastHandler {
    hub: Arc<FanoutHub>,
    /// The hub subscriber key this handler registered under, set in
    /// `on_session_ready`. Must be read back in `on_session_closed` rather
    /// than re-derived from the session id — stream ids and session ids are
    /// disjoint counters, and the hub is keyed by the former.
    subscriber_id: Mutex<Option<u64>>,
}

#[async_trait]
impl WebTransportHandler for BroadcastHandler {
    async fn on_session_ready(&self, session: SessionHandle) {
        let stream = match session.create_stream(false).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(error = ?err, "failed to open broadcast stream for new subscriber");
                return;
            }
        };

        let subscriber_id = stream.id();
        *self.subscriber_id.lock() = Some(subscriber_id);
        let push_stream: Arc<WtStream> = Arc::clone(&stream);
        let closed = Arc::new(AtomicBool::new(false));

        self.hub.subscribe(
            subscriber_id,
            Box::new(move |block: Bytes| {
                let stream = Arc::clone(&push_stream);
                let closed = Arc::clone(&closed);
                Box::pin(async move {
                    if closed.load(Ordering::Acquire) || stream.is_closed() {
                        closed.store(true, Ordering::Release);
                        return Err(());
                    }
                    stream.write(block, false).await.map_err(|_| {
                        closed.store(true, Ordering::Release);
                    })
                })
            }),
        );
    }

    async fn on_session_closed(&self, _session: SessionHandle, _code: u32, _reason: &str) {
        if let Some(subscriber_id) = self.subscriber_id.lock().take() {
            self.hub.unsubscribe(subscriber_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CaptureConfig;
    use crate::transport::session::{Session, WtTransport};
    use async_trait::async_trait;
    use tokio::io::{AsyncRead, AsyncWrite};

    struct FakeTransport;

    #[async_trait]
    impl WtTransport for FakeTransport {
        async fn open_uni(
            &self,
        ) -> Result<Box<dyn AsyncWrite + Send + Unpin>, crate::error::TransportError> {
            let (a, _b) = tokio::io::duplex(256);
            Ok(Box::new(a))
        }
        async fn open_bi(
            &self,
        ) -> Result<
            (
                Box<dyn AsyncWrite + Send + Unpin>,
                Box<dyn AsyncRead + Send + Unpin>,
            ),
            crate::error::TransportError,
        > {
            unreachable!("broadcast handler only opens uni streams")
        }
        async fn send_datagram(&self, _bytes: Bytes) -> Result<(), crate::error::TransportError> {
            Ok(())
        }
        async fn close(&self, _code: u32, _reason: &str) {}
    }

    #[tokio::test]
    async fn subscribes_on_ready_and_unsubscribes_on_close() {
        let hub = Arc::new(FanoutHub::new(&CaptureConfig::default()));
        let handler = BroadcastHandler {
            hub: Arc::clone(&hub),
            subscriber_id: Mutex::new(None),
        };

        let session = Session::new(1, Arc::new(FakeTransport));
        handler.on_session_ready(Arc::clone(&session)).await;
        assert_eq!(hub.subscriber_count(), 1);

        handler.on_session_closed(Arc::clone(&session), 0, "client closed").await;
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_sessions_keep_independent_subscriptions() {
        let hub = Arc::new(FanoutHub::new(&CaptureConfig::default()));
        let handler_a = BroadcastHandler {
            hub: Arc::clone(&hub),
            subscriber_id: Mutex::new(None),
        };
        let handler_b = BroadcastHandler {
            hub: Arc::clone(&hub),
            subscriber_id: Mutex::new(None),
        };

        let session_a = Session::new(1, Arc::new(FakeTransport));
        let session_b = Session::new(2, Arc::new(FakeTransport));
        handler_a.on_session_ready(Arc::clone(&session_a)).await;
        handler_b.on_session_ready(Arc::clone(&session_b)).await;

        // Both sessions' first locally-created stream must land on distinct
        // hub keys, not collide on a shared per-session counter.
        assert_eq!(hub.subscriber_count(), 2);

        handler_a
            .on_session_closed(Arc::clone(&session_a), 0, "client closed")
            .await;
        assert_eq!(hub.subscriber_count(), 1);

        handler_b
            .on_session_closed(Arc::clone(&session_b), 0, "client closed")
            .await;
        assert_eq!(hub.subscriber_count(), 0);
    }
}

//! Handler extensibility (component G's base) and the factory/route-params
//! machinery the router hands out.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use super::session::SessionHandle;

/// Fixed parameters a route was registered with, handed to the handler
/// factory at CONNECT time.
#[derive(Clone, Debug, Default)]
pub struct RouteParams(HashMap<String, String>);

impl RouteParams {
    pub fn insert(&mut self, key: String, value: String) {
        self.0.insert(key, value);
    }

    pub fn get(&self, key: &str) -> Option<&String> {
        self.0.get(key)
    }
}

/// Builds a handler instance for a newly accepted session. A route's
/// factory is invoked once per accepted CONNECT for that path.
pub trait HandlerFactory: Send + Sync {
    fn build(&self, params: &RouteParams) -> Arc<dyn WebTransportHandler>;
}

/// Capability set a session dispatches into. Every hook has a no-op
/// default so a handler only needs to implement what it cares about.
#[async_trait]
pub trait WebTransportHandler: Send + Sync {
    async fn on_session_ready(&self, _session: SessionHandle) {}

    async fn on_session_closed(&self, _session: SessionHandle, _code: u32, _reason: &str) {}

    async fn on_stream_unidirectional(
        &self,
        _session: SessionHandle,
        _stream: Arc<super::stream::WtStream>,
    ) {
    }

    async fn on_stream_bidirectional(
        &self,
        _session: SessionHandle,
        _stream: Arc<super::stream::WtStream>,
    ) {
    }

    async fn on_datagram(&self, _session: SessionHandle, _bytes: Bytes) {}
}

/// A handler that does nothing; used for routes under construction and in
/// tests of the router itself.
pub struct NoopHandler;

#[async_trait]
impl WebTransportHandler for NoopHandler {}

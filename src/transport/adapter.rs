//! HTTP/3 Protocol Adapter (component E).
//!
//! Accepts extended-CONNECT WebTransport requests, performs the router
//! lookup *before* the underlying codec accepts the session (the codec's
//! `web_transport_mut()` collapses "parse CONNECT" and "send `:status 200`"
//! into one call — see the design notes on the collapsed accept step), then
//! drives one session's entire lifetime inline in this request handler's
//! own task.
//!
//! The codec only ever hands back a borrowed `&mut WebTransportSession`
//! scoped to this handler call, never an owned, 'static handle. To let
//! [`Session`] still be an ordinary `Arc<Session>` that can be stored,
//! cloned into spawned dispatch tasks, and looked up from a registry, the
//! transport side of [`crate::transport::session::WtTransport`] is
//! implemented over a command channel serviced by this same function's
//! event loop — the same pattern the stream manager this was grounded on
//! uses for its own command channel between a registry entry and the
//! connection task that owns the live session.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashSet;
use h3_quinn::Connection as QuinnConnection;
use salvo::prelude::*;
use salvo::proto::WebTransportSession;
use salvo::proto::quic::BidiStream as _;
use salvo::proto::webtransport::server::AcceptedBi;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use super::handler::WebTransportHandler;
use super::router::Router;
use super::session::{Session, WtTransport};
use super::stream::Direction;
use crate::error::TransportError;

type WtSession = WebTransportSession<QuinnConnection, Bytes>;
type WtSend = salvo::webtransport::stream::SendStream<h3_quinn::SendStream<Bytes>, Bytes>;
type WtRecv = salvo::webtransport::stream::RecvStream<h3_quinn::RecvStream, Bytes>;

/// Tracks the ids of every `Accepted` session for this process. Bookkeeping
/// only — the live session objects never leave the request task that owns
/// them (see the module doc comment).
#[derive(Default)]
pub struct SessionRegistry {
    ids: DashSet<u64>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }
}

enum TransportCommand {
    OpenUni(oneshot::Sender<Result<WtSend, TransportError>>),
    OpenBi(oneshot::Sender<Result<(WtSend, WtRecv), TransportError>>),
    SendDatagram(Bytes, oneshot::Sender<Result<(), TransportError>>),
    Close(u32, String),
}

struct ChannelTransport {
    tx: mpsc::Sender<TransportCommand>,
}

#[async_trait]
impl WtTransport for ChannelTransport {
    async fn open_uni(&self) -> Result<Box<dyn AsyncWrite + Send + Unpin>, TransportError> {
        let (respond_tx, respond_rx) = oneshot::channel();
        self.tx
            .send(TransportCommand::OpenUni(respond_tx))
            .await
            .map_err(|_| TransportError::SessionClosed)?;
        let send = respond_rx.await.map_err(|_| TransportError::SessionClosed)??;
        Ok(Box::new(send))
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
        let (respond_tx, respond_rx) = oneshot::channel();
        self.tx
            .send(TransportCommand::OpenBi(respond_tx))
            .await
            .map_err(|_| TransportError::SessionClosed)?;
        let (send, recv) = respond_rx.await.map_err(|_| TransportError::SessionClosed)??;
        Ok((Box::new(send), Box::new(recv)))
    }

    async fn send_datagram(&self, bytes: Bytes) -> Result<(), TransportError> {
        let (respond_tx, respond_rx) = oneshot::channel();
        self.tx
            .send(TransportCommand::SendDatagram(bytes, respond_tx))
            .await
            .map_err(|_| TransportError::SessionClosed)?;
        respond_rx.await.map_err(|_| TransportError::SessionClosed)?
    }

    async fn close(&self, code: u32, reason: &str) {
        let _ = self
            .tx
            .send(TransportCommand::Close(code, reason.to_string()))
            .await;
    }
}

/// Close code for a codec/connection failure (`accept_bi`/`accept_uni`/
/// `accept_datagram` returning `Err`). Distinct from `1`, which `Session`
/// reserves for a panicking handler hook, so the two failure kinds never
/// collapse into the same reported reason.
const CARRIER_ERROR_CODE: u32 = 2;

fn next_session_id() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

fn next_stream_id() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Endpoint mounted on every WebTransport-bearing route. Performs the route
/// lookup using only the request's path (available before accepting),
/// rejects unknown paths with a plain 404 and no session, and otherwise
/// accepts the session and drives its lifetime to completion.
#[handler]
pub async fn accept_connection(
    req: &mut Request,
    res: &mut Response,
    depot: &Depot,
) -> Result<(), salvo::Error> {
    let router = depot
        .obtain::<Arc<Router>>()
        .ok()
        .cloned()
        .expect("router must be stored in depot");
    let registry = depot
        .obtain::<Arc<SessionRegistry>>()
        .ok()
        .cloned()
        .expect("session registry must be stored in depot");

    let path = req.uri().path().to_string();
    let Some((factory, params)) = router.route(&path) else {
        res.status_code(salvo::http::StatusCode::NOT_FOUND);
        return Ok(());
    };

    // This call both validates the CONNECT request and sends `:status 200`;
    // there is no way to observe one without the other with this codec.
    let wt_session = req
        .web_transport_mut()
        .await
        .map_err(salvo::Error::other)?;
    let wt_session: &WtSession = &*wt_session;
    let session_id = wt_session.session_id();
    let synthetic_id = next_session_id();

    let (cmd_tx, mut cmd_rx) = mpsc::channel::<TransportCommand>(16);
    let transport = Arc::new(ChannelTransport { tx: cmd_tx });
    let session = Session::new(synthetic_id, transport);
    registry.ids.insert(synthetic_id);

    let handler: Arc<dyn WebTransportHandler> = factory.build(&params);

    info!(path, session_id = synthetic_id, "webtransport session accepted");

    let run_handler = Arc::clone(&handler);
    let run_fut = session.run(run_handler);
    tokio::pin!(run_fut);
    let mut run_done = false;

    loop {
        if run_done {
            break;
        }
        tokio::select! {
            _ = &mut run_fut => {
                run_done = true;
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(TransportCommand::OpenUni(respond)) => {
                        let result = wt_session
                            .open_uni(session_id)
                            .await
                            .map_err(|e| {
                                warn!(error = %e, "failed to open unidirectional stream");
                                TransportError::SessionClosed
                            });
                        let _ = respond.send(result);
                    }
                    Some(TransportCommand::OpenBi(respond)) => {
                        let result = wt_session
                            .open_bi(session_id)
                            .await
                            .map(|stream| {
                                let (send, recv): (WtSend, WtRecv) = stream.split();
                                (send, recv)
                            })
                            .map_err(|e| {
                                warn!(error = %e, "failed to open bidirectional stream");
                                TransportError::SessionClosed
                            });
                        let _ = respond.send(result);
                    }
                    Some(TransportCommand::SendDatagram(bytes, respond)) => {
                        let result = wt_session.send_datagram(bytes).map_err(|e| {
                            warn!(error = %e, "failed to send datagram");
                            TransportError::SessionClosed
                        });
                        let _ = respond.send(result);
                    }
                    Some(TransportCommand::Close(code, _reason)) => {
                        session.mark_closed(code);
                    }
                    None => {
                        session.mark_closed(0);
                    }
                }
            }
            accepted = wt_session.accept_bi() => {
                match accepted {
                    Ok(Some(AcceptedBi::BidiStream(_sid, stream))) => {
                        let stream_id = next_stream_id();
                        let (send, recv): (WtSend, WtRecv) = stream.split();
                        session
                            .handle_peer_stream(stream_id, Direction::Bidirectional, Box::new(recv), Some(Box::new(send)))
                            .await;
                    }
                    Ok(Some(AcceptedBi::Request(_req, _resp))) => {
                        // Out of scope: this server only ever serves the
                        // WebTransport endpoint on this connection.
                    }
                    Ok(None) => session.mark_closed(0),
                    Err(e) => {
                        warn!(error = %e, "accept_bi failed, closing session");
                        session.mark_closed(CARRIER_ERROR_CODE);
                    }
                }
            }
            accepted = wt_session.accept_uni() => {
                match accepted {
                    Ok(Some((_sid, recv))) => {
                        let stream_id = next_stream_id();
                        let recv: WtRecv = recv;
                        session
                            .handle_peer_stream(stream_id, Direction::UnidirectionalRecv, Box::new(recv), None)
                            .await;
                    }
                    Ok(None) => session.mark_closed(0),
                    Err(e) => {
                        warn!(error = %e, "accept_uni failed, closing session");
                        session.mark_closed(CARRIER_ERROR_CODE);
                    }
                }
            }
            datagram = wt_session.accept_datagram() => {
                match datagram {
                    Ok(Some((_sid, data))) => {
                        session.handle_datagram(data).await;
                    }
                    Ok(None) => session.mark_closed(0),
                    Err(e) => {
                        warn!(error = %e, "accept_datagram failed, closing session");
                        session.mark_closed(CARRIER_ERROR_CODE);
                    }
                }
            }
        }
    }

    registry.ids.remove(&synthetic_id);
    info!(path, session_id = synthetic_id, "webtransport session closed");

    Ok(())
}

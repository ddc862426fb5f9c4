use std::net::ToSocketAddrs;
use std::sync::Arc;

use salvo::conn::Acceptor;
use salvo::conn::rustls::{Keycert, RustlsConfig};
use salvo::prelude::*;
use salvo::server::ServerHandle;
use tokio::signal;
use tracing::info;

mod capture;
mod config;
mod error;
mod hub;
mod transport;
mod utils;

use crate::config::{ServerConfig, TlsConfig};
use crate::hub::FanoutHub;
use crate::transport::broadcast_handler::BroadcastHandlerFactory;
use crate::transport::handler::RouteParams;
use crate::transport::{Router as WtRouter, SessionRegistry};

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    if let Err(err) = crate::config::init() {
        eprintln!("fatal: {err}");
        std::process::exit(1);
    }
    let config = crate::config::get();

    let _guard = config.log.guard();
    tracing::info!("log level: {}", &config.log.filter_level);

    let hub = Arc::new(FanoutHub::new(&config.capture));
    if let Err(err) = hub.start(&config.capture) {
        tracing::error!(error = %err, "fatal: failed to start audio capture");
        std::process::exit(1);
    }

    let wt_router = Arc::new(WtRouter::new());
    wt_router.add_route(
        "/broadcast",
        Arc::new(BroadcastHandlerFactory::new(Arc::clone(&hub))),
        RouteParams::default(),
    );
    let registry = SessionRegistry::new();

    let service = Service::new(build_router(wt_router, registry))
        .catcher(salvo::catcher::Catcher::default());

    let Some(tls) = &config.tls else {
        tracing::error!("fatal: tls configuration is required");
        std::process::exit(1);
    };

    let acceptor = match setup_acceptor_socket(config, tls).await {
        Ok(acceptor) => acceptor,
        Err(err) => {
            tracing::error!(error = %err, "fatal: failed to bind listener");
            std::process::exit(1);
        }
    };

    println!(
        "🚀 Server listening on https://{}:{}/",
        config.listen_addr.replace("0.0.0.0", "127.0.0.1"),
        config.listen_port,
    );

    let server = Server::new(acceptor);
    let handle = server.handle();
    tokio::spawn(shutdown_signal(handle, Arc::clone(&hub)));
    server.serve(service).await;
}

fn build_router(wt_router: Arc<WtRouter>, registry: Arc<SessionRegistry>) -> Router {
    Router::new()
        .hoop(crate::utils::logger::Logger)
        .hoop(salvo::extra::affix_state::inject(wt_router).inject(registry))
        .push(
            Router::with_path("{*path}")
                .filter(salvo::routing::MethodFilter::new(salvo::http::Method::CONNECT))
                .goal(crate::transport::accept_connection),
        )
}

async fn setup_acceptor_socket(
    cfg: &ServerConfig,
    tls: &TlsConfig,
) -> Result<impl Acceptor, crate::error::BindError> {
    let (cert, key) = tokio::join!(tokio::fs::read(&tls.cert), tokio::fs::read(&tls.key));
    let cert = cert.map_err(crate::error::BindError::Tls)?;
    let key = key.map_err(crate::error::BindError::Tls)?;
    let rustls_config = RustlsConfig::new(Keycert::new().cert(cert).key(key));

    let addr = format!("{}:{}", cfg.listen_addr, cfg.listen_port);
    (cfg.listen_addr.as_str(), cfg.listen_port)
        .to_socket_addrs()
        .map_err(|source| crate::error::BindError::Bind {
            addr: addr.clone(),
            source,
        })?
        .next()
        .ok_or_else(|| crate::error::BindError::Bind {
            addr: addr.clone(),
            source: std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                "address resolved to no socket addresses",
            ),
        })?;

    let tcp = TcpListener::new((cfg.listen_addr.as_str(), cfg.listen_port))
        .rustls(rustls_config.clone());
    let quic = QuinnListener::new(rustls_config, (cfg.listen_addr.as_str(), cfg.listen_port));

    let acceptor = quic.join(tcp).bind().await;
    info!(
        addr = %cfg.listen_addr,
        port = cfg.listen_port,
        "quic/http3 and tcp listeners bound"
    );
    Ok(acceptor)
}

/// Waits for an external shutdown signal, then stops the hub (no further
/// capture callbacks, subscribers cleared) and drains the server gracefully.
async fn shutdown_signal(handle: ServerHandle, hub: Arc<FanoutHub>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("ctrl_c signal received"),
        _ = terminate => info!("terminate signal received"),
    }

    hub.stop();
    handle.stop_graceful(std::time::Duration::from_secs(10));
}

use thiserror::Error;

/// Fatal startup errors. Any of these abort the process before a socket is
/// opened, with a non-zero exit code.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Device-open / format-negotiation failure. Fatal for the hub instance that
/// reports it, surfaced from [`crate::hub::FanoutHub::start`].
#[derive(Error, Debug)]
pub enum CaptureOpenError {
    #[error("no input device available (index {0})")]
    NoSuchDevice(usize),
    #[error("device does not support the requested format: {0}")]
    UnsupportedFormat(String),
    #[error("failed to build input stream: {0}")]
    BuildStream(#[from] cpal::BuildStreamError),
    #[error("failed to start input stream: {0}")]
    PlayStream(#[from] cpal::PlayStreamError),
}

/// Listener bind failure. Fatal, logged at `error` with the offending host.
#[derive(Error, Debug)]
pub enum BindError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read tls material: {0}")]
    Tls(#[source] std::io::Error),
}

/// Misuse errors local to one session or stream. Never fatal to the
/// connection; returned to the caller that made the offending call.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    #[error("stream is closed")]
    StreamClosed,
    #[error("stream has no read capability")]
    NotReadable,
    #[error("session is closed")]
    SessionClosed,
}

/// An uncaught failure raised from inside a [`crate::transport::handler::WebTransportHandler`]
/// hook. Closes the session with code 1, reason "handler error"; never
/// propagates past the session's event loop.
#[derive(Error, Debug)]
#[error("handler error: {0}")]
pub struct HandlerError(#[from] pub Box<dyn std::error::Error + Send + Sync>);

//! WebTransport session layer: route dispatch, session lifecycle, per-session
//! stream creation, and per-stream backpressure (components C through G).

pub mod adapter;
pub mod broadcast_handler;
pub mod handler;
pub mod router;
pub mod session;
pub mod stream;

pub use adapter::{SessionRegistry, accept_connection};
pub use router::Router;

//! HTTP transport: accept loop and per-connection sessions
//!
//! The [`Listener`] owns the bound socket and spawns one [`Session`] per
//! accepted connection. Each session drives a single HTTP/1.1 connection
//! through the axum app until the peer closes it, keep-alive ends, or the
//! server shuts down.

pub mod listener;
pub mod session;

pub use listener::Listener;
pub use session::Session;

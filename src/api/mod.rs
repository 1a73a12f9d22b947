//! HTTP API: routing table, JSON codec, handlers and app assembly

pub mod handlers;
pub mod json;
pub mod models;
pub mod router;
pub mod routes;

pub use router::{Resolution, RouteError, RouteParams, Routes};
pub use routes::{AppState, create_router};

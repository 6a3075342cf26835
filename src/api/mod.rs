//! HTTP surface of the click fraud service.
//! Ingest, rule and IP management, blocklist, analytics and diagnostics routes.

mod handlers;
mod routes;
pub mod types;

pub use routes::{build_router, AppState};

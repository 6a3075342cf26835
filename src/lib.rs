//! Click fraud decision engine.
//!
//! Every ingested ad click is evaluated against the owning website's
//! whitelist, blocklist and threshold rules, then counted into the website's
//! analytics rollup.

pub mod api;
pub mod config;
pub mod core;
pub mod error;
pub mod service;
pub mod store;
pub mod utils;

pub use crate::error::{ApiError, ApiResult};
pub use crate::service::{ClickFraudService, ClickSubmission, TrackOutcome};

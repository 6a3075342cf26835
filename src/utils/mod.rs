//! Utility modules for the click fraud service.
//! This module contains common utilities used across the application.

mod error;
mod logging;

pub use logging::{
    create_request_span, init_logging, log_block_inserted, log_decision, log_eviction,
    log_service_event, log_store_failure,
};

pub use error::{
    EngineError, EngineResult, StoreContext, StoreError, StoreResult, ValidationError,
};

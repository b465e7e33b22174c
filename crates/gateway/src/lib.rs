//! HTTP API for the synchro scheduler.
//!
//! Routes are thin: every handler parses its input, calls one
//! [`synchro_scheduler::Scheduler`] operation and maps the error through
//! [`error::ApiError`].

pub mod error;
pub mod routes;
pub mod server;

pub use {
    error::ApiError,
    server::{AppState, build_app, serve},
};

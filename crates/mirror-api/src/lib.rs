//! lazy-mirror HTTP surface
//!
//! This crate provides the Axum-based request dispatch for the mirror: the
//! five-shape route matcher, cache-file serving, pass-through proxying, and
//! the error-to-response mapping.

pub mod error;
pub mod router;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use routes::create_router;
pub use state::AppState;

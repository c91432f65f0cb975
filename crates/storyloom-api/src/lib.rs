//! Storyloom dispatch API
//!
//! Admits story requests, creates the initial text-stage job, and returns
//! job identifiers synchronously while the work proceeds asynchronously on
//! the worker. Read-only job and failure endpoints serve the admin UI.

pub mod error;
pub mod routes;
pub mod server;
pub mod state;

pub use error::ApiError;
pub use routes::create_router;
pub use state::AppState;

//! HTTP surface: intake webhook, return links, chat and operator actions.

pub mod routes;

pub use routes::{AppState, TRY_AGAIN, pipeline_routes};

//! Lead Pipeline: abandonment-to-CRM lead lifecycle orchestration.

pub mod activity;
pub mod api;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod external;
pub mod model;
pub mod pipeline;
pub mod stages;
pub mod store;

//! Event plumbing between pipeline stages.

pub mod bus;
pub mod types;

pub use bus::{EventBus, Subscription};
pub use types::{EventEnvelope, EventKind, PipelineEvent};

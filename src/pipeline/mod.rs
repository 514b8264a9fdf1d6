//! Orchestration: routes bus events to the stage that consumes them and
//! runs the background sweepers.

pub mod runner;
pub mod sweeper;

pub use runner::{PipelineRunner, RunnerHandle};
pub use sweeper::{
    next_cron_fire, spawn_cache_purger, spawn_dead_letter_sweeper, spawn_inactivity_sweeper,
};

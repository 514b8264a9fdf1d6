//! Periodic background work: the inactivity sweep, credit cache purging
//! and scheduled dead-letter reprocessing.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::stages::{AbandonmentDetector, CreditEvaluator, LeadSubmitter};

/// Next fire time of a 6-field cron expression (seconds first).
pub fn next_cron_fire(schedule: &str) -> Result<Option<DateTime<Utc>>, String> {
    let cron_schedule =
        cron::Schedule::from_str(schedule).map_err(|e| format!("invalid cron: {e}"))?;
    Ok(cron_schedule.upcoming(Utc).next())
}

/// Spawn the inactivity sweeper.
pub fn spawn_inactivity_sweeper(
    detector: Arc<AbandonmentDetector>,
    clock: Arc<dyn Clock>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if let Err(e) = detector.sweep_inactive(clock.now()).await {
                warn!(error = %e, "Inactivity sweep failed");
            }
        }
    })
}

/// Spawn the ticker that releases expired credit cache slots.
pub fn spawn_cache_purger(credit: Arc<CreditEvaluator>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            credit.purge_cache().await;
        }
    })
}

/// Spawn the dead-letter sweeper on a cron schedule.
///
/// Fails fast on an invalid expression so a typo never silently disables
/// reprocessing.
pub fn spawn_dead_letter_sweeper(
    submitter: Arc<LeadSubmitter>,
    schedule: String,
) -> Result<JoinHandle<()>, String> {
    next_cron_fire(&schedule)?;
    info!(schedule = %schedule, "Dead-letter sweeper scheduled");

    Ok(tokio::spawn(async move {
        loop {
            let next = match next_cron_fire(&schedule) {
                Ok(Some(next)) => next,
                Ok(None) => {
                    info!(schedule = %schedule, "Cron schedule has no further fire times");
                    return;
                }
                Err(e) => {
                    error!(error = %e, "Dead-letter schedule became invalid");
                    return;
                }
            };
            let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::time::sleep(wait).await;

            match submitter.reprocess_dead_letters().await {
                Ok(summary) if summary.still_failing > 0 => {
                    warn!(
                        attempted = summary.attempted,
                        still_failing = summary.still_failing,
                        "Dead letters remain after reprocessing"
                    );
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Dead-letter reprocessing failed"),
            }
        }
    }))
}

//! Event routing between stages.
//!
//! Each consuming stage gets its own subscription and loop. Every event is
//! handled on its own task, so visitors progress independently and a slow
//! external call for one visitor never holds up another.

use std::sync::Arc;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::events::{EventBus, EventEnvelope, EventKind, PipelineEvent, Subscription};
use crate::stages::{CreditEvaluator, Dispatcher, LeadSubmitter, SubmissionOutcome};

/// Wires the bus to stages 2, 4 and 5. Stages 1 and 3 are driven from
/// outside (HTTP intake, sweeps, chat).
pub struct PipelineRunner {
    bus: Arc<EventBus>,
    dispatcher: Arc<Dispatcher>,
    credit: Arc<CreditEvaluator>,
    submitter: Arc<LeadSubmitter>,
}

/// Background routing tasks started by [`PipelineRunner::start`].
pub struct RunnerHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl RunnerHandle {
    pub fn abort(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }

    /// Wait for every routing loop to finish (they end when the bus is dropped).
    pub async fn join(self) {
        for result in join_all(self.tasks).await {
            if let Err(e) = result {
                if !e.is_cancelled() {
                    error!(error = %e, "Pipeline routing task panicked");
                }
            }
        }
    }
}

impl PipelineRunner {
    pub fn new(
        bus: Arc<EventBus>,
        dispatcher: Arc<Dispatcher>,
        credit: Arc<CreditEvaluator>,
        submitter: Arc<LeadSubmitter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            dispatcher,
            credit,
            submitter,
        })
    }

    /// Subscribe every route, then spawn the routing loops.
    ///
    /// Subscriptions exist by the time this returns, so events published
    /// afterwards are never missed.
    pub async fn start(self: &Arc<Self>) -> RunnerHandle {
        let routes = [
            vec![EventKind::LeadReady],
            vec![EventKind::CreditCheckRequested],
            vec![EventKind::CreditApproved],
            vec![
                EventKind::MessageSent,
                EventKind::CreditDeclined,
                EventKind::LeadSubmitted,
                EventKind::LeadDeadLettered,
            ],
        ];

        let mut tasks = Vec::with_capacity(routes.len());
        for kinds in routes {
            let subscription = self.bus.subscribe(&kinds).await;
            tasks.push(self.spawn_route(subscription));
        }
        info!(routes = tasks.len(), "Pipeline runner started");
        RunnerHandle { tasks }
    }

    fn spawn_route(self: &Arc<Self>, mut subscription: Subscription) -> JoinHandle<()> {
        let runner = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(envelope) = subscription.recv().await {
                let runner = Arc::clone(&runner);
                tokio::spawn(async move { runner.handle(envelope).await });
            }
            debug!("Event bus closed; routing loop exiting");
        })
    }

    /// Run the stage that consumes `envelope`. Failures are logged here;
    /// the stages have already written the audit record.
    pub async fn handle(&self, envelope: EventEnvelope) {
        let event_id = envelope.id;
        match envelope.event {
            PipelineEvent::LeadReady { visitor_id, .. } => {
                if let Err(e) = self.dispatcher.dispatch(visitor_id).await {
                    warn!(%event_id, visitor_id = %visitor_id, error = %e, retryable = e.is_retryable(), "Dispatch failed");
                }
            }
            PipelineEvent::CreditCheckRequested { visitor_id, phone } => {
                if let Err(e) = self.credit.evaluate(phone.as_str(), visitor_id).await {
                    warn!(%event_id, visitor_id = %visitor_id, error = %e, retryable = e.is_retryable(), "Credit evaluation failed");
                }
            }
            PipelineEvent::CreditApproved { visitor_id, result } => {
                let lead = match self.submitter.package(visitor_id, &result).await {
                    Ok(lead) => lead,
                    Err(e) => {
                        warn!(%event_id, visitor_id = %visitor_id, error = %e, "Lead packaging failed");
                        return;
                    }
                };
                match self.submitter.submit(lead.id).await {
                    Ok(SubmissionOutcome::InFlight) => {
                        debug!(lead_id = %lead.id, "Submission already in flight")
                    }
                    Ok(outcome) => debug!(lead_id = %lead.id, ?outcome, "Submission finished"),
                    Err(e) => warn!(lead_id = %lead.id, error = %e, "Lead submission errored"),
                }
            }
            PipelineEvent::CreditDeclined { visitor_id, .. } => {
                info!(visitor_id = %visitor_id, "Credit declined; journey ends without a lead");
            }
            PipelineEvent::MessageSent { visitor_id, .. } => {
                debug!(visitor_id = %visitor_id, "Re-engagement message delivered");
            }
            PipelineEvent::LeadSubmitted {
                lead_id, reference, ..
            } => {
                debug!(lead_id = %lead_id, reference = %reference, "Lead journey complete");
            }
            PipelineEvent::LeadDeadLettered { lead_id, .. } => {
                debug!(lead_id = %lead_id, "Lead awaiting dead-letter reprocessing");
            }
        }
    }
}

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use lead_pipeline::activity::AuditSink;
use lead_pipeline::api::{AppState, pipeline_routes};
use lead_pipeline::clock::{Clock, SystemClock};
use lead_pipeline::config::PipelineConfig;
use lead_pipeline::events::EventBus;
use lead_pipeline::external::{
    CreditScorer, CrmSubmitter, HttpCreditScorer, HttpCrmSubmitter, LoggingSender, MessageSender,
    SmtpSender,
};
use lead_pipeline::pipeline::{
    PipelineRunner, spawn_cache_purger, spawn_dead_letter_sweeper, spawn_inactivity_sweeper,
};
use lead_pipeline::stages::{
    AbandonmentDetector, CreditEvaluator, Dispatcher, LeadSubmitter, RetryPolicy, SessionRecovery,
    StageContext,
};
use lead_pipeline::store::{LibSqlStore, MemoryStore, PipelineStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let _log_guard = init_tracing();

    let config = PipelineConfig::from_env().context("Invalid configuration")?;

    eprintln!("Lead Pipeline v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   HTTP: http://0.0.0.0:{}", config.http_port);
    eprintln!("   Return links: {}", config.return_base_url);

    // ── Storage ───────────────────────────────────────────────────────────
    let (store, audit): (Arc<dyn PipelineStore>, Arc<dyn AuditSink>) = match &config.db_path {
        Some(path) => {
            let contact_key = config
                .contact_key
                .as_ref()
                .context("LEAD_PIPELINE_CONTACT_KEY must be set with LEAD_PIPELINE_DB_PATH")?;
            let db = Arc::new(LibSqlStore::new_local(path, contact_key).await?);
            eprintln!("   Store: libSQL at {}", path.display());
            let store: Arc<dyn PipelineStore> = db.clone();
            let audit: Arc<dyn AuditSink> = db;
            (store, audit)
        }
        None => {
            warn!("LEAD_PIPELINE_DB_PATH not set; state will not survive a restart");
            eprintln!("   Store: in-memory");
            let mem = Arc::new(MemoryStore::new());
            let store: Arc<dyn PipelineStore> = mem.clone();
            let audit: Arc<dyn AuditSink> = mem;
            (store, audit)
        }
    };

    // ── External capabilities ─────────────────────────────────────────────
    let sender: Arc<dyn MessageSender> = match config.email.clone() {
        Some(email) => {
            eprintln!("   Email: SMTP via {}", email.smtp_host);
            Arc::new(SmtpSender::new(email))
        }
        None => {
            eprintln!("   Email: disabled (messages are logged only)");
            Arc::new(LoggingSender)
        }
    };
    let scorer_endpoint = config
        .scorer
        .clone()
        .context("CREDIT_SCORER_URL and CREDIT_SCORER_API_KEY must be set")?;
    let scorer: Arc<dyn CreditScorer> =
        Arc::new(HttpCreditScorer::new(scorer_endpoint, config.external_timeout)?);
    let crm_endpoint = config
        .crm
        .clone()
        .context("CRM_URL and CRM_API_KEY must be set")?;
    let crm: Arc<dyn CrmSubmitter> =
        Arc::new(HttpCrmSubmitter::new(crm_endpoint, config.external_timeout)?);

    // ── Stages ────────────────────────────────────────────────────────────
    let bus = EventBus::new();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let ctx = StageContext::new(store, audit, Arc::clone(&bus), Arc::clone(&clock));

    let detector = Arc::new(AbandonmentDetector::new(
        ctx.clone(),
        config.metadata_whitelist.clone(),
        config.inactivity_threshold,
    )?);
    let dispatcher = Arc::new(Dispatcher::new(
        ctx.clone(),
        sender,
        config.return_base_url.clone(),
        config.external_timeout,
    ));
    let recovery = Arc::new(SessionRecovery::new(ctx.clone()));
    let credit = Arc::new(CreditEvaluator::new(ctx.clone(), scorer, config.external_timeout));
    let submitter = Arc::new(LeadSubmitter::new(
        ctx,
        crm,
        RetryPolicy::new(config.submit_max_attempts, config.submit_initial_delay),
        config.external_timeout,
    ));

    // ── Background work ───────────────────────────────────────────────────
    let runner = PipelineRunner::new(bus, dispatcher, Arc::clone(&credit), Arc::clone(&submitter));
    let runner_handle = runner.start().await;

    let _sweep_handle = spawn_inactivity_sweeper(
        Arc::clone(&detector),
        clock,
        config.inactivity_sweep_interval,
    );
    let _purge_handle = spawn_cache_purger(credit, config.inactivity_sweep_interval);
    eprintln!(
        "   Inactivity sweep: every {}s (threshold {} min)",
        config.inactivity_sweep_interval.as_secs(),
        config.inactivity_threshold.as_secs() / 60,
    );

    let _dead_letter_handle = match config.dead_letter_schedule.clone() {
        Some(schedule) => {
            eprintln!("   Dead-letter reprocessing: {schedule}");
            Some(spawn_dead_letter_sweeper(Arc::clone(&submitter), schedule).map_err(anyhow::Error::msg)?)
        }
        None => {
            eprintln!("   Dead-letter reprocessing: manual only");
            None
        }
    };

    // ── HTTP ──────────────────────────────────────────────────────────────
    let app = pipeline_routes(AppState {
        detector,
        recovery,
        submitter,
    });
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.http_port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.http_port))?;
    info!(port = config.http_port, "Lead pipeline HTTP server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await?;

    info!("Shutting down");
    runner_handle.abort();
    Ok(())
}

/// Console logging, plus a daily rolling file when `LEAD_PIPELINE_LOG_DIR`
/// is set. The returned guard must live until exit.
fn init_tracing() -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = tracing_subscriber::fmt::layer().with_target(false);

    let (file_layer, guard) = match std::env::var("LEAD_PIPELINE_LOG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "lead-pipeline.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .init();
    guard
}

//! PromptSouq Reconciliation Worker
//!
//! Scans subscriptions with a billing reference and reconciles them
//! against Stripe.
//!
//! ## Usage
//! ```bash
//! # Dry run, single pass (report drift, write nothing)
//! promptsouq-worker --once
//!
//! # Apply fixes in a single pass
//! promptsouq-worker --once --fix
//!
//! # Run on a recurring schedule (RECONCILE_CRON, default every 6 hours)
//! promptsouq-worker --fix
//! ```
//!
//! Exit code (with `--once`): 0 on a clean pass, 1 if any row's
//! reconciliation attempt failed. Per-row failures never abort the batch.

use std::sync::Arc;
use std::time::Duration;

use promptsouq_billing::{
    AuditLogger, PgStore, ReconcileMode, ReconcileOptions, ReconcileSummary, ReconciliationEngine,
    RowOutcome, StripeGateway, SubscriptionService,
};
use promptsouq_shared::create_pool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

#[derive(Debug, Clone, Copy)]
struct WorkerFlags {
    once: bool,
    fix: bool,
    verbose: bool,
}

impl WorkerFlags {
    fn from_args() -> Self {
        let args: Vec<String> = std::env::args().collect();
        Self {
            once: args.iter().any(|a| a == "--once"),
            fix: args.iter().any(|a| a == "--fix"),
            verbose: args.iter().any(|a| a == "--verbose"),
        }
    }

    fn options(self) -> ReconcileOptions {
        ReconcileOptions {
            mode: if self.fix {
                ReconcileMode::Fix
            } else {
                ReconcileMode::DryRun
            },
            verbose: self.verbose,
        }
    }
}

/// Log results of a reconciliation pass.
fn log_summary(summary: &ReconcileSummary) {
    info!(
        mode = ?summary.mode,
        scanned = summary.scanned,
        clean = summary.clean,
        drifted = summary.drifted,
        fixed = summary.fixed,
        failed = summary.failed,
        "Reconciliation cycle complete"
    );

    // Log individual failures
    for row in &summary.rows {
        if let RowOutcome::Failed { error, transient } = &row.outcome {
            error!(
                subscription_id = %row.subscription_id,
                user_id = %row.user_id,
                transient = *transient,
                error = %error,
                "Failed to reconcile subscription"
            );
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    let flags = WorkerFlags::from_args();
    info!(?flags, "Starting PromptSouq Worker");

    if !flags.fix {
        info!("Dry-run mode: drift is reported, nothing is written (pass --fix to apply)");
    }

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&database_url).await?;

    let gateway =
        StripeGateway::from_env().map_err(|e| anyhow::anyhow!("Stripe not configured: {}", e))?;

    let store = Arc::new(PgStore::new(pool));
    let audit = AuditLogger::new(store.clone());
    let subscriptions = SubscriptionService::new(store.clone(), Arc::new(gateway.clone()), audit);
    let engine = ReconciliationEngine::new(store, Arc::new(gateway), subscriptions);

    if flags.once {
        let summary = engine.run(flags.options()).await?;
        log_summary(&summary);
        std::process::exit(summary.exit_code());
    }

    // Recurring mode: reconcile on a schedule
    let scheduler = JobScheduler::new().await?;

    let cron_expr =
        std::env::var("RECONCILE_CRON").unwrap_or_else(|_| "0 0 */6 * * *".to_string());
    let options = flags.options();

    let engine_job = engine.clone();
    scheduler
        .add(Job::new_async(cron_expr.as_str(), move |_uuid, _l| {
            let engine = engine_job.clone();
            Box::pin(async move {
                info!("Running scheduled reconciliation pass");
                match engine.run(options).await {
                    Ok(summary) => log_summary(&summary),
                    Err(e) => error!(error = %e, "Reconciliation pass failed to start"),
                }
            })
        })?)
        .await?;
    info!(cron = %cron_expr, "Scheduled: subscription reconciliation");

    // Heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: health check heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    // Keep the main task running; the scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}

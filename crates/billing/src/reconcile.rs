//! Reconciliation Engine
//!
//! Resolves drift between the billing provider (source of truth for
//! billing facts) and local subscription rows (source of truth for the
//! user mapping). Reconciliation always pulls from the provider and writes
//! into the local row, field by field, last-fetched-wins.
//!
//! The scan runs in two modes. Dry-run (the default) computes and reports
//! discrepancies without writing anything; fix mode applies them through
//! the sync operation. Per-row failures are isolated: one bad row never
//! aborts the batch, and the summary carries a per-row tally.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;

use crate::audit::Actor;
use crate::client::{BillingProvider, ProviderSubscription};
use crate::error::BillingResult;
use crate::store::{SubscriptionRecord, SubscriptionStore};
use crate::subscriptions::{SubscriptionService, SyncOutcome};

/// Whether the scan writes fixes or only reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileMode {
    DryRun,
    Fix,
}

#[derive(Debug, Clone, Copy)]
pub struct ReconcileOptions {
    pub mode: ReconcileMode,
    /// Emit per-row diagnostic detail instead of just the summary.
    pub verbose: bool,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            mode: ReconcileMode::DryRun,
            verbose: false,
        }
    }
}

/// One field that differs between the local row and the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldDrift {
    pub field: &'static str,
    pub local: String,
    pub remote: String,
}

/// Per-row reconciliation result.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum RowOutcome {
    /// Local row matches the provider.
    Clean,
    /// Drift found, not written (dry-run).
    Drifted { drift: Vec<FieldDrift> },
    /// Drift found and overwritten from the provider.
    Fixed { drift: Vec<FieldDrift> },
    /// This row's reconciliation attempt failed; the batch continued.
    Failed { error: String, transient: bool },
}

/// One scanned row with its outcome.
#[derive(Debug, Clone, Serialize)]
pub struct RowReport {
    pub subscription_id: uuid::Uuid,
    pub user_id: uuid::Uuid,
    pub stripe_subscription_id: String,
    #[serde(flatten)]
    pub outcome: RowOutcome,
}

/// Result of a full reconciliation pass.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileSummary {
    pub started_at: OffsetDateTime,
    pub finished_at: OffsetDateTime,
    pub mode: ReconcileMode,
    pub scanned: usize,
    pub clean: usize,
    pub drifted: usize,
    pub fixed: usize,
    pub failed: usize,
    pub rows: Vec<RowReport>,
}

impl ReconcileSummary {
    /// Process exit code for the CLI: clean pass is 0, any per-row
    /// failure is 1. Drift alone does not fail a dry-run.
    pub fn exit_code(&self) -> i32 {
        if self.failed > 0 {
            1
        } else {
            0
        }
    }
}

/// Compute the field-by-field difference between a local row and the
/// provider's snapshot. Pure; drives both sync writes and dry-run reports.
pub fn compute_drift(local: &SubscriptionRecord, remote: &ProviderSubscription) -> Vec<FieldDrift> {
    let mut drift = Vec::new();

    if local.status != remote.status {
        drift.push(FieldDrift {
            field: "status",
            local: local.status.to_string(),
            remote: remote.status.to_string(),
        });
    }
    if local.cancel_at_period_end != remote.cancel_at_period_end {
        drift.push(FieldDrift {
            field: "cancel_at_period_end",
            local: local.cancel_at_period_end.to_string(),
            remote: remote.cancel_at_period_end.to_string(),
        });
    }
    if local.current_period_start.unix_timestamp() != remote.current_period_start.unix_timestamp() {
        drift.push(FieldDrift {
            field: "current_period_start",
            local: local.current_period_start.to_string(),
            remote: remote.current_period_start.to_string(),
        });
    }
    if local.current_period_end.unix_timestamp() != remote.current_period_end.unix_timestamp() {
        drift.push(FieldDrift {
            field: "current_period_end",
            local: local.current_period_end.to_string(),
            remote: remote.current_period_end.to_string(),
        });
    }
    if let Some(ref price_id) = remote.price_id {
        if local.stripe_price_id.as_deref() != Some(price_id.as_str()) {
            drift.push(FieldDrift {
                field: "stripe_price_id",
                local: local.stripe_price_id.clone().unwrap_or_default(),
                remote: price_id.clone(),
            });
        }
    }
    if let Some(interval) = remote.interval {
        if local.billing_interval != interval {
            drift.push(FieldDrift {
                field: "billing_interval",
                local: local.billing_interval.to_string(),
                remote: interval.to_string(),
            });
        }
    }

    drift
}

/// Overwrite the local row's billing fields with the provider snapshot.
/// Price and interval are only overwritten when the provider reports them.
pub fn apply_remote(
    mut local: SubscriptionRecord,
    remote: &ProviderSubscription,
) -> SubscriptionRecord {
    local.status = remote.status;
    local.cancel_at_period_end = remote.cancel_at_period_end;
    local.current_period_start = remote.current_period_start;
    local.current_period_end = remote.current_period_end;
    if let Some(ref price_id) = remote.price_id {
        local.stripe_price_id = Some(price_id.clone());
    }
    if let Some(interval) = remote.interval {
        local.billing_interval = interval;
    }
    local
}

#[derive(Clone)]
pub struct ReconciliationEngine {
    store: Arc<dyn SubscriptionStore>,
    provider: Arc<dyn BillingProvider>,
    subscriptions: SubscriptionService,
}

impl ReconciliationEngine {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        provider: Arc<dyn BillingProvider>,
        subscriptions: SubscriptionService,
    ) -> Self {
        Self {
            store,
            provider,
            subscriptions,
        }
    }

    /// Scan every subscription with a billing reference and reconcile it.
    pub async fn run(&self, options: ReconcileOptions) -> BillingResult<ReconcileSummary> {
        let started_at = OffsetDateTime::now_utc();
        let records = self.store.list_with_billing_ref().await?;

        tracing::info!(
            mode = ?options.mode,
            count = records.len(),
            "Starting reconciliation pass"
        );

        let mut rows = Vec::with_capacity(records.len());
        let (mut clean, mut drifted, mut fixed, mut failed) = (0usize, 0usize, 0usize, 0usize);

        for record in records {
            let Some(stripe_id) = record.stripe_subscription_id.clone() else {
                // list_with_billing_ref filters these out; skip defensively
                continue;
            };

            let outcome = self.reconcile_row(&record, &stripe_id, options.mode).await;

            match &outcome {
                RowOutcome::Clean => clean += 1,
                RowOutcome::Drifted { .. } => drifted += 1,
                RowOutcome::Fixed { .. } => fixed += 1,
                RowOutcome::Failed { error, .. } => {
                    failed += 1;
                    tracing::error!(
                        subscription_id = %record.id,
                        user_id = %record.user_id,
                        error = %error,
                        "Row reconciliation failed"
                    );
                }
            }

            if options.verbose {
                tracing::info!(
                    subscription_id = %record.id,
                    user_id = %record.user_id,
                    outcome = ?outcome,
                    "Reconciled row"
                );
            }

            rows.push(RowReport {
                subscription_id: record.id,
                user_id: record.user_id,
                stripe_subscription_id: stripe_id,
                outcome,
            });
        }

        let summary = ReconcileSummary {
            started_at,
            finished_at: OffsetDateTime::now_utc(),
            mode: options.mode,
            scanned: rows.len(),
            clean,
            drifted,
            fixed,
            failed,
            rows,
        };

        tracing::info!(
            mode = ?summary.mode,
            scanned = summary.scanned,
            clean = summary.clean,
            drifted = summary.drifted,
            fixed = summary.fixed,
            failed = summary.failed,
            "Reconciliation pass complete"
        );
        Ok(summary)
    }

    async fn reconcile_row(
        &self,
        record: &SubscriptionRecord,
        stripe_id: &str,
        mode: ReconcileMode,
    ) -> RowOutcome {
        match mode {
            ReconcileMode::DryRun => match self.provider.retrieve_subscription(stripe_id).await {
                Ok(remote) => {
                    let drift = compute_drift(record, &remote);
                    if drift.is_empty() {
                        RowOutcome::Clean
                    } else {
                        RowOutcome::Drifted { drift }
                    }
                }
                Err(e) => RowOutcome::Failed {
                    transient: e.is_transient(),
                    error: e.to_string(),
                },
            },
            ReconcileMode::Fix => match self.subscriptions.sync_record(record, Actor::system()).await
            {
                Ok(SyncOutcome::Clean { .. }) => RowOutcome::Clean,
                Ok(SyncOutcome::Applied { drift, .. }) => RowOutcome::Fixed { drift },
                Err(e) => RowOutcome::Failed {
                    transient: e.is_transient(),
                    error: e.to_string(),
                },
            },
        }
    }
}

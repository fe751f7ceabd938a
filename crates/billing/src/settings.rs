//! Global settings, currently just the Pro-content override flag.
//!
//! The flag is re-read from the store on every entitlement check rather
//! than cached: its lifecycle (default off, flipped by admin action) stays
//! observable without a process restart.

use std::sync::Arc;

use crate::audit::{Actor, AuditEntry, AuditLogger};
use crate::error::BillingResult;
use crate::store::SettingStore;

/// Setting key for the "show Pro content to everyone" switch.
pub const SHOW_PRO_TO_ALL_KEY: &str = "show_pro_to_all";

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "on" | "yes"
    )
}

#[derive(Clone)]
pub struct SettingsService {
    store: Arc<dyn SettingStore>,
    audit: AuditLogger,
}

impl SettingsService {
    pub fn new(store: Arc<dyn SettingStore>, audit: AuditLogger) -> Self {
        Self { store, audit }
    }

    /// Current value of the override flag. Missing row reads as `false`.
    pub async fn show_pro_to_all(&self) -> BillingResult<bool> {
        let value = self.store.get(SHOW_PRO_TO_ALL_KEY).await?;
        Ok(value.as_deref().map(parse_flag).unwrap_or(false))
    }

    /// Flip the override flag. Admin-only; appends one audit entry.
    pub async fn set_show_pro_to_all(&self, enabled: bool, actor: Actor) -> BillingResult<()> {
        let previous = self.show_pro_to_all().await?;
        self.store
            .set(SHOW_PRO_TO_ALL_KEY, if enabled { "true" } else { "false" })
            .await?;

        self.audit
            .append(
                AuditEntry::new("setting.updated", "setting", SHOW_PRO_TO_ALL_KEY)
                    .actor(actor)
                    .details(serde_json::json!({
                        "previous": previous,
                        "value": enabled,
                    })),
            )
            .await?;

        tracing::info!(enabled = enabled, "Pro-content override flag updated");
        Ok(())
    }
}

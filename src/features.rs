//! Per-tenant feature flags.
//!
//! Flags are part of the permission surface: a feature that is absent or
//! disabled for a tenant removes every permission it gates (see
//! [`crate::permission::PermissionPolicy::gating_feature`]).

use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::info;

use crate::audit::{format_timestamp, AuditAction, AuditRecorder, NewAuditEntry};
use crate::error::KernelResult;
use crate::identity::{Principal, TenantId, UserId};
use crate::permission::FeatureSnapshot;

/// Stored state of one tenant feature flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlag {
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Feature name.
    pub feature_name: String,
    /// Whether the feature is on.
    pub enabled: bool,
    /// Who last changed it.
    pub changed_by: UserId,
    /// RFC 3339 time of the last change.
    pub changed_at: String,
}

/// Raw row tuple from the `feature_flags` table.
type FlagRow = (i64, String, i64, i64, String);

fn flag_row_into_flag(row: FlagRow) -> KernelResult<FeatureFlag> {
    let (tenant_id, feature_name, enabled, changed_by, changed_at) = row;
    Ok(FeatureFlag {
        tenant_id: TenantId::new(tenant_id)?,
        feature_name,
        enabled: enabled != 0,
        changed_by: UserId::new(changed_by),
        changed_at,
    })
}

/// Feature flag table access with audited writes.
#[derive(Debug, Clone)]
pub struct FeatureFlagStore {
    pool: SqlitePool,
    audit: AuditRecorder,
}

impl FeatureFlagStore {
    /// Build a store sharing the recorder's pool.
    pub fn new(audit: AuditRecorder) -> Self {
        Self {
            pool: audit.pool().clone(),
            audit,
        }
    }

    /// Whether `feature` is enabled for `tenant_id`. Absent flags are off.
    ///
    /// # Errors
    ///
    /// Returns storage errors unchanged.
    pub async fn is_feature_enabled(&self, tenant_id: TenantId, feature: &str) -> KernelResult<bool> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT enabled FROM feature_flags WHERE tenant_id = ?1 AND feature_name = ?2",
        )
        .bind(tenant_id.get())
        .bind(feature)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some_and(|(enabled,)| enabled != 0))
    }

    /// All flags of one tenant, by name.
    ///
    /// # Errors
    ///
    /// Returns storage errors unchanged.
    pub async fn list(&self, tenant_id: TenantId) -> KernelResult<Vec<FeatureFlag>> {
        let rows: Vec<FlagRow> = sqlx::query_as(
            "SELECT tenant_id, feature_name, enabled, changed_by, changed_at \
             FROM feature_flags WHERE tenant_id = ?1 ORDER BY feature_name",
        )
        .bind(tenant_id.get())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(flag_row_into_flag).collect()
    }

    /// Snapshot of a tenant's flags for the permission gate.
    ///
    /// # Errors
    ///
    /// Returns storage errors unchanged.
    pub async fn snapshot(&self, tenant_id: TenantId) -> KernelResult<FeatureSnapshot> {
        let mut conn = self.pool.acquire().await?;
        snapshot_on(&mut conn, tenant_id).await
    }

    /// Turn a feature on or off for the principal's tenant, with audit.
    ///
    /// The flag write and its audit entry commit in one transaction.
    ///
    /// # Errors
    ///
    /// Returns storage errors, or [`crate::KernelError::AuditWriteFailed`]
    /// in which case the flag is left unchanged.
    pub async fn set_feature(
        &self,
        principal: &Principal,
        feature: &str,
        enabled: bool,
    ) -> KernelResult<FeatureFlag> {
        let tenant_id = principal.tenant_id();
        let mut tx = self.pool.begin().await?;

        let before: Option<FlagRow> = sqlx::query_as(
            "SELECT tenant_id, feature_name, enabled, changed_by, changed_at \
             FROM feature_flags WHERE tenant_id = ?1 AND feature_name = ?2",
        )
        .bind(tenant_id.get())
        .bind(feature)
        .fetch_optional(&mut *tx)
        .await?;
        let before = before.map(flag_row_into_flag).transpose()?;

        let flag = FeatureFlag {
            tenant_id,
            feature_name: feature.to_owned(),
            enabled,
            changed_by: principal.user_id(),
            changed_at: format_timestamp(self.audit.now()),
        };
        sqlx::query(
            "INSERT INTO feature_flags (tenant_id, feature_name, enabled, changed_by, changed_at) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(tenant_id, feature_name) DO UPDATE SET \
                enabled = ?3, changed_by = ?4, changed_at = ?5",
        )
        .bind(tenant_id.get())
        .bind(&flag.feature_name)
        .bind(i64::from(enabled))
        .bind(flag.changed_by.get())
        .bind(&flag.changed_at)
        .execute(&mut *tx)
        .await?;

        let entry = NewAuditEntry::by(principal, AuditAction::SetFeature, "feature_flags", feature)
            .before(before.map(|f| json!({ "enabled": f.enabled })))
            .after(Some(json!({ "enabled": enabled })));
        self.audit.record_on(&mut *tx, &entry).await?;
        tx.commit().await?;

        info!(tenant_id = %tenant_id, feature, enabled, changed_by = %flag.changed_by, "feature flag changed");
        Ok(flag)
    }
}

/// Load a tenant's flags on an existing connection.
///
/// # Errors
///
/// Returns storage errors unchanged.
pub async fn snapshot_on(conn: &mut SqliteConnection, tenant_id: TenantId) -> KernelResult<FeatureSnapshot> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT feature_name, enabled FROM feature_flags WHERE tenant_id = ?1")
            .bind(tenant_id.get())
            .fetch_all(&mut *conn)
            .await?;
    Ok(FeatureSnapshot::new(
        tenant_id,
        rows.into_iter().map(|(name, enabled)| (name, enabled != 0)),
    ))
}

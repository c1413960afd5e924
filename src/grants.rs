//! Explicit permission grants.
//!
//! Grants are append-only: revocation stamps `revoked_at` instead of
//! deleting the row. Every grant and revocation is audited in the same
//! transaction. Lookups are always keyed by tenant, so a grant recorded for
//! one tenant is never loaded for a principal of another.

use serde_json::json;
use sqlx::SqlitePool;
use tracing::info;

use crate::audit::{format_timestamp, AuditAction, AuditRecorder, NewAuditEntry};
use crate::error::KernelResult;
use crate::identity::{Principal, TenantId, UserId};
use crate::permission::{PermissionGrant, PermissionKey};

/// Raw row tuple from the `permission_grants` table.
type GrantRow = (i64, i64, i64, String, i64, String, Option<String>);

fn grant_row_into_grant(row: GrantRow) -> KernelResult<(i64, PermissionGrant)> {
    let (id, tenant_id, user_id, permission_key, granted_by, granted_at, revoked_at) = row;
    Ok((
        id,
        PermissionGrant {
            tenant_id: TenantId::new(tenant_id)?,
            user_id: UserId::new(user_id),
            permission_key: PermissionKey::new(permission_key),
            granted_by: UserId::new(granted_by),
            granted_at,
            revoked_at,
        },
    ))
}

/// Permission grant table access with audited writes.
#[derive(Debug, Clone)]
pub struct GrantStore {
    pool: SqlitePool,
    audit: AuditRecorder,
}

impl GrantStore {
    /// Build a store sharing the recorder's pool.
    pub fn new(audit: AuditRecorder) -> Self {
        Self {
            pool: audit.pool().clone(),
            audit,
        }
    }

    /// Active grants of `user_id` within `tenant_id`.
    ///
    /// # Errors
    ///
    /// Returns storage errors unchanged.
    pub async fn active_grants(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
    ) -> KernelResult<Vec<PermissionGrant>> {
        let rows: Vec<GrantRow> = sqlx::query_as(
            "SELECT id, tenant_id, user_id, permission_key, granted_by, granted_at, revoked_at \
             FROM permission_grants \
             WHERE tenant_id = ?1 AND user_id = ?2 AND revoked_at IS NULL \
             ORDER BY id",
        )
        .bind(tenant_id.get())
        .bind(user_id.get())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| grant_row_into_grant(row).map(|(_, grant)| grant))
            .collect()
    }

    /// Return `principal` with its own-tenant grants attached.
    ///
    /// # Errors
    ///
    /// Returns storage errors unchanged.
    pub async fn load_into(&self, principal: Principal) -> KernelResult<Principal> {
        let grants = self
            .active_grants(principal.tenant_id(), principal.user_id())
            .await?;
        Ok(principal.with_grants(grants))
    }

    /// Grant `key` to `user_id` in the granter's tenant.
    ///
    /// Granting an already active permission is a no-op and writes no audit
    /// entry. Returns the grant row id.
    ///
    /// # Errors
    ///
    /// Returns storage errors, or [`crate::KernelError::AuditWriteFailed`]
    /// in which case no grant is stored.
    pub async fn grant(
        &self,
        granter: &Principal,
        user_id: UserId,
        key: &PermissionKey,
    ) -> KernelResult<i64> {
        let tenant_id = granter.tenant_id();
        let mut tx = self.pool.begin().await?;

        let existing: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM permission_grants \
             WHERE tenant_id = ?1 AND user_id = ?2 AND permission_key = ?3 AND revoked_at IS NULL",
        )
        .bind(tenant_id.get())
        .bind(user_id.get())
        .bind(key.as_str())
        .fetch_optional(&mut *tx)
        .await?;
        if let Some((id,)) = existing {
            return Ok(id);
        }

        let granted_at = format_timestamp(self.audit.now());
        let result = sqlx::query(
            "INSERT INTO permission_grants (tenant_id, user_id, permission_key, granted_by, granted_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(tenant_id.get())
        .bind(user_id.get())
        .bind(key.as_str())
        .bind(granter.user_id().get())
        .bind(&granted_at)
        .execute(&mut *tx)
        .await?;
        let id = result.last_insert_rowid();

        let entry = NewAuditEntry::by(
            granter,
            AuditAction::GrantPermission,
            "permission_grants",
            id.to_string(),
        )
        .after(Some(json!({
            "user_id": user_id,
            "permission_key": key,
            "granted_at": granted_at,
        })));
        self.audit.record_on(&mut *tx, &entry).await?;
        tx.commit().await?;

        info!(tenant_id = %tenant_id, user_id = %user_id, permission = %key, granted_by = %granter.user_id(), "permission granted");
        Ok(id)
    }

    /// Revoke an active grant. Returns `false` if there was none.
    ///
    /// # Errors
    ///
    /// Returns storage errors, or [`crate::KernelError::AuditWriteFailed`]
    /// in which case the grant stays active.
    pub async fn revoke(
        &self,
        revoker: &Principal,
        user_id: UserId,
        key: &PermissionKey,
    ) -> KernelResult<bool> {
        let tenant_id = revoker.tenant_id();
        let mut tx = self.pool.begin().await?;

        let row: Option<GrantRow> = sqlx::query_as(
            "SELECT id, tenant_id, user_id, permission_key, granted_by, granted_at, revoked_at \
             FROM permission_grants \
             WHERE tenant_id = ?1 AND user_id = ?2 AND permission_key = ?3 AND revoked_at IS NULL",
        )
        .bind(tenant_id.get())
        .bind(user_id.get())
        .bind(key.as_str())
        .fetch_optional(&mut *tx)
        .await?;
        let Some((id, before)) = row.map(grant_row_into_grant).transpose()? else {
            return Ok(false);
        };

        let revoked_at = format_timestamp(self.audit.now());
        sqlx::query("UPDATE permission_grants SET revoked_at = ?1 WHERE id = ?2 AND tenant_id = ?3")
            .bind(&revoked_at)
            .bind(id)
            .bind(tenant_id.get())
            .execute(&mut *tx)
            .await?;

        let after = PermissionGrant {
            revoked_at: Some(revoked_at),
            ..before.clone()
        };
        let entry = NewAuditEntry::by(
            revoker,
            AuditAction::RevokePermission,
            "permission_grants",
            id.to_string(),
        )
        .before(Some(serde_json::to_value(&before)?))
        .after(Some(serde_json::to_value(&after)?));
        self.audit.record_on(&mut *tx, &entry).await?;
        tx.commit().await?;

        info!(tenant_id = %tenant_id, user_id = %user_id, permission = %key, revoked_by = %revoker.user_id(), "permission revoked");
        Ok(true)
    }
}

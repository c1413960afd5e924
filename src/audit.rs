//! Audit recorder.
//!
//! Appends one immutable [`AuditEntry`] per state-changing operation and
//! serves the tenant-scoped read path. Entries are written on the caller's
//! transaction so that a mutation and its audit record commit together.
//! The table itself rejects UPDATE and DELETE via triggers.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use tracing::{debug, error};

use crate::config::AuditConfig;
use crate::error::{KernelError, KernelResult};
use crate::identity::{Origin, Principal, TenantId, UserId};

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Time source for audit timestamps.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock frozen at one instant (tests, replay).
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Fixed-width, lexically sortable timestamp format used in storage.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

// ---------------------------------------------------------------------------
// Domain types
// ---------------------------------------------------------------------------

/// Kind of state change recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditAction {
    /// A row was inserted.
    #[serde(rename = "create")]
    Create,
    /// A row was updated.
    #[serde(rename = "update")]
    Update,
    /// A row was deleted.
    #[serde(rename = "delete")]
    Delete,
    /// A permission grant was recorded.
    #[serde(rename = "permission.grant")]
    GrantPermission,
    /// A permission grant was revoked.
    #[serde(rename = "permission.revoke")]
    RevokePermission,
    /// A feature flag was toggled.
    #[serde(rename = "feature.set")]
    SetFeature,
}

impl AuditAction {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::GrantPermission => "permission.grant",
            Self::RevokePermission => "permission.revoke",
            Self::SetFeature => "feature.set",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised action.
    pub fn parse(s: &str) -> KernelResult<Self> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            "permission.grant" => Ok(Self::GrantPermission),
            "permission.revoke" => Ok(Self::RevokePermission),
            "feature.set" => Ok(Self::SetFeature),
            other => Err(KernelError::InvalidEnum {
                field: "action",
                value: other.to_owned(),
            }),
        }
    }
}

impl std::str::FromStr for AuditAction {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// An audit entry about to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAuditEntry {
    /// Tenant the change happened in.
    pub tenant_id: TenantId,
    /// Acting user.
    pub user_id: UserId,
    /// Kind of change.
    pub action: AuditAction,
    /// Entity class or kernel table affected.
    pub resource_type: String,
    /// Identifier of the affected resource.
    pub resource_id: String,
    /// State before the change.
    pub before_value: Option<Value>,
    /// State after the change.
    pub after_value: Option<Value>,
    /// Request origin metadata.
    pub origin: Origin,
}

impl NewAuditEntry {
    /// Start an entry for an action taken by `principal`.
    pub fn by(
        principal: &Principal,
        action: AuditAction,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: principal.tenant_id(),
            user_id: principal.user_id(),
            action,
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            before_value: None,
            after_value: None,
            origin: principal.origin().clone(),
        }
    }

    /// Attach the prior state.
    pub fn before(mut self, value: Option<Value>) -> Self {
        self.before_value = value;
        self
    }

    /// Attach the resulting state.
    pub fn after(mut self, value: Option<Value>) -> Self {
        self.after_value = value;
        self
    }
}

/// A stored, immutable audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Row id.
    pub id: i64,
    /// Tenant the change happened in.
    pub tenant_id: TenantId,
    /// Acting user.
    pub user_id: UserId,
    /// Kind of change.
    pub action: AuditAction,
    /// Entity class or kernel table affected.
    pub resource_type: String,
    /// Identifier of the affected resource.
    pub resource_id: String,
    /// State before the change (possibly a truncation summary).
    pub before_value: Option<Value>,
    /// State after the change (possibly a truncation summary).
    pub after_value: Option<Value>,
    /// Whether either value was summarized to fit the size cap.
    pub truncated: bool,
    /// Request origin metadata.
    pub origin: Origin,
    /// When the entry was written.
    pub timestamp: DateTime<Utc>,
}

/// Optional filters for the audit read path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditFilter {
    /// Only entries by this user.
    pub user_id: Option<UserId>,
    /// Only entries about this resource type.
    pub resource_type: Option<String>,
    /// Only entries about this resource id.
    pub resource_id: Option<String>,
    /// Only entries of this action.
    pub action: Option<AuditAction>,
    /// Inclusive lower time bound.
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper time bound.
    pub until: Option<DateTime<Utc>>,
}

/// Limit/offset pagination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    /// Maximum entries returned; clamped to the configured page size.
    pub limit: u32,
    /// Entries skipped.
    pub offset: u32,
}

impl Page {
    /// A page of `limit` entries starting at `offset`.
    pub fn new(limit: u32, offset: u32) -> Self {
        Self { limit, offset }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(50, 0)
    }
}

// ---------------------------------------------------------------------------
// Truncation
// ---------------------------------------------------------------------------

/// Marker key present in summarized values.
pub const TRUNCATED_MARKER: &str = "_truncated";

/// Serialize `value`, replacing it with a summary if it exceeds `max_bytes`.
///
/// Returns the stored JSON text and whether it was summarized.
fn bounded_json(value: &Value, max_bytes: usize) -> KernelResult<(String, bool)> {
    let text = serde_json::to_string(value)?;
    if text.len() <= max_bytes {
        return Ok((text, false));
    }

    let mut end = max_bytes.checked_div(2).unwrap_or(0).min(text.len());
    while !text.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    let summary = serde_json::json!({
        TRUNCATED_MARKER: true,
        "original_bytes": text.len(),
        "preview": &text[..end],
    });
    Ok((serde_json::to_string(&summary)?, true))
}

// ---------------------------------------------------------------------------
// Recorder
// ---------------------------------------------------------------------------

/// Raw row tuple from the `audit_log` table.
type AuditRow = (
    i64,
    i64,
    i64,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    i64,
    String,
    String,
);

const AUDIT_COLUMNS: &str = "id, tenant_id, user_id, action, resource_type, resource_id, \
                             before_value, after_value, truncated, origin, created_at";

/// Append-only audit log over the shared pool.
#[derive(Debug, Clone)]
pub struct AuditRecorder {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    config: AuditConfig,
}

impl AuditRecorder {
    /// Build a recorder.
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>, config: AuditConfig) -> Self {
        Self {
            pool,
            clock,
            config,
        }
    }

    /// Append an entry in its own transaction.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::AuditWriteFailed`] if the entry was not stored.
    pub async fn record(&self, entry: &NewAuditEntry) -> KernelResult<i64> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| audit_failed(entry, e))?;
        let id = self.record_on(&mut *tx, entry).await?;
        tx.commit().await.map_err(|e| audit_failed(entry, e))?;
        Ok(id)
    }

    /// Append an entry on the caller's connection or transaction.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::AuditWriteFailed`] if the entry was not stored;
    /// the caller must then roll back the mutation it describes.
    pub async fn record_on(
        &self,
        conn: &mut SqliteConnection,
        entry: &NewAuditEntry,
    ) -> KernelResult<i64> {
        let max = self.config.max_value_bytes;
        let before = entry
            .before_value
            .as_ref()
            .map(|v| bounded_json(v, max))
            .transpose()
            .map_err(|e| audit_failed(entry, e))?;
        let after = entry
            .after_value
            .as_ref()
            .map(|v| bounded_json(v, max))
            .transpose()
            .map_err(|e| audit_failed(entry, e))?;
        let truncated = before.as_ref().is_some_and(|(_, t)| *t)
            || after.as_ref().is_some_and(|(_, t)| *t);
        let origin = serde_json::to_string(&entry.origin).map_err(|e| audit_failed(entry, e))?;

        let result = sqlx::query(
            "INSERT INTO audit_log (tenant_id, user_id, action, resource_type, resource_id, \
             before_value, after_value, truncated, origin, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )
        .bind(entry.tenant_id.get())
        .bind(entry.user_id.get())
        .bind(entry.action.as_str())
        .bind(&entry.resource_type)
        .bind(&entry.resource_id)
        .bind(before.map(|(text, _)| text))
        .bind(after.map(|(text, _)| text))
        .bind(i64::from(truncated))
        .bind(origin)
        .bind(format_timestamp(self.clock.now()))
        .execute(&mut *conn)
        .await
        .map_err(|e| audit_failed(entry, e))?;

        debug!(
            tenant_id = %entry.tenant_id,
            action = entry.action.as_str(),
            resource_type = %entry.resource_type,
            resource_id = %entry.resource_id,
            truncated,
            "audit entry recorded"
        );
        Ok(result.last_insert_rowid())
    }

    /// Read a tenant's audit log, newest first.
    ///
    /// # Errors
    ///
    /// Returns storage errors, or [`KernelError::InvalidEnum`] /
    /// [`KernelError::Serialization`] for corrupt rows.
    pub async fn get_audit_log(
        &self,
        tenant_id: TenantId,
        filter: &AuditFilter,
        page: Page,
    ) -> KernelResult<Vec<AuditEntry>> {
        let limit = page.limit.min(self.config.max_page_size);
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut qb = QueryBuilder::<Sqlite>::new("SELECT ");
        qb.push(AUDIT_COLUMNS);
        qb.push(" FROM audit_log WHERE tenant_id = ");
        qb.push_bind(tenant_id.get());
        if let Some(user_id) = filter.user_id {
            qb.push(" AND user_id = ").push_bind(user_id.get());
        }
        if let Some(resource_type) = &filter.resource_type {
            qb.push(" AND resource_type = ").push_bind(resource_type.clone());
        }
        if let Some(resource_id) = &filter.resource_id {
            qb.push(" AND resource_id = ").push_bind(resource_id.clone());
        }
        if let Some(action) = filter.action {
            qb.push(" AND action = ").push_bind(action.as_str());
        }
        if let Some(since) = filter.since {
            qb.push(" AND created_at >= ").push_bind(format_timestamp(since));
        }
        if let Some(until) = filter.until {
            qb.push(" AND created_at < ").push_bind(format_timestamp(until));
        }
        qb.push(" ORDER BY created_at DESC, id DESC LIMIT ");
        qb.push_bind(i64::from(limit));
        qb.push(" OFFSET ");
        qb.push_bind(i64::from(page.offset));

        let rows: Vec<AuditRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(audit_row_into_entry).collect()
    }

    /// The pool the recorder writes to.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Current time from the recorder's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

fn audit_failed(entry: &NewAuditEntry, err: impl Into<KernelError>) -> KernelError {
    let err = err.into();
    error!(
        tenant_id = %entry.tenant_id,
        action = entry.action.as_str(),
        resource_type = %entry.resource_type,
        resource_id = %entry.resource_id,
        error = %err,
        "audit write failed"
    );
    KernelError::AuditWriteFailed {
        source: Box::new(err),
    }
}

fn parse_json(text: Option<String>) -> KernelResult<Option<Value>> {
    text.map(|t| serde_json::from_str(&t))
        .transpose()
        .map_err(KernelError::from)
}

/// Convert a raw `audit_log` row tuple into an [`AuditEntry`].
fn audit_row_into_entry(row: AuditRow) -> KernelResult<AuditEntry> {
    let (
        id,
        tenant_id,
        user_id,
        action,
        resource_type,
        resource_id,
        before_value,
        after_value,
        truncated,
        origin,
        created_at,
    ) = row;
    let timestamp = DateTime::parse_from_rfc3339(&created_at)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| KernelError::InvalidEnum {
            field: "created_at",
            value: created_at.clone(),
        })?;
    Ok(AuditEntry {
        id,
        tenant_id: TenantId::new(tenant_id)?,
        user_id: UserId::new(user_id),
        action: AuditAction::parse(&action)?,
        resource_type,
        resource_id,
        before_value: parse_json(before_value)?,
        after_value: parse_json(after_value)?,
        truncated: truncated != 0,
        origin: serde_json::from_str(&origin)?,
        timestamp,
    })
}

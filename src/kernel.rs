//! Kernel facade and unit of work.
//!
//! [`Kernel`] wires the components together over one shared pool and is the
//! surface CRUD controllers call. Every mutation runs the fixed order
//! permission gate -> cross-reference validator -> scoped executor -> audit
//! recorder, with the last three inside one SQLite transaction. Dropping the
//! future before commit rolls back both the write and its audit entry;
//! after commit both exist.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::audit::{
    AuditAction, AuditEntry, AuditFilter, AuditRecorder, Clock, NewAuditEntry, Page, SystemClock,
};
use crate::config::{Config, RetryConfig};
use crate::error::{KernelError, KernelResult};
use crate::features::{FeatureFlag, FeatureFlagStore};
use crate::grants::GrantStore;
use crate::identity::{Principal, TenantId, UserId};
use crate::integrity::{IntegrityMonitor, IntegrityReport, SweepPlan};
use crate::permission::{
    check_permission, PermissionDecision, PermissionKey, PermissionPolicy, Requirement,
    AUDIT_READ, FEATURES_MANAGE, PERMISSIONS_MANAGE,
};
use crate::query::{row_id, Operation, Row, ScopedExecutor, ScopedQuery};
use crate::references::{references_in, ReferenceValidator, ResourceRef};
use crate::schema::EntityRegistry;

/// Result of an accepted mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationOutcome {
    /// Rows after an insert/update, or as they were before a delete.
    pub rows: Vec<Row>,
    /// One audit entry id per affected row, in row order.
    pub audit_ids: Vec<i64>,
}

/// The tenant isolation, permission, reference and audit kernel.
#[derive(Debug, Clone)]
pub struct Kernel {
    pool: SqlitePool,
    registry: Arc<EntityRegistry>,
    policy: Arc<PermissionPolicy>,
    executor: ScopedExecutor,
    validator: ReferenceValidator,
    audit: AuditRecorder,
    features: FeatureFlagStore,
    grants: GrantStore,
    integrity: IntegrityMonitor,
    retry: RetryConfig,
}

impl Kernel {
    /// Build a kernel over the clinic schema with the wall clock.
    pub fn new(pool: SqlitePool, config: &Config) -> Self {
        Self::with_parts(
            pool,
            config,
            EntityRegistry::clinic(),
            Arc::new(SystemClock),
        )
    }

    /// Build a kernel with an explicit registry and clock.
    pub fn with_parts(
        pool: SqlitePool,
        config: &Config,
        registry: EntityRegistry,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let registry = Arc::new(registry);
        let audit = AuditRecorder::new(pool.clone(), clock, config.audit.clone());
        Self {
            executor: ScopedExecutor::new(Arc::clone(&registry)),
            validator: ReferenceValidator::new(Arc::clone(&registry)),
            features: FeatureFlagStore::new(audit.clone()),
            grants: GrantStore::new(audit.clone()),
            integrity: IntegrityMonitor::new(
                pool.clone(),
                Arc::clone(&registry),
                config.integrity.sample_size,
            ),
            policy: Arc::new(PermissionPolicy::from_config(&config.permissions)),
            retry: config.retry.clone(),
            audit,
            registry,
            pool,
        }
    }

    // -- Identity -----------------------------------------------------------

    /// Attach the principal's stored own-tenant grants.
    ///
    /// # Errors
    ///
    /// Returns storage errors unchanged.
    pub async fn load_principal(&self, principal: Principal) -> KernelResult<Principal> {
        self.grants.load_into(principal).await
    }

    // -- Permission gate ----------------------------------------------------

    /// Evaluate `requirement` for `principal` against its tenant's flags.
    ///
    /// # Errors
    ///
    /// Returns storage errors from loading the feature snapshot. A denial is
    /// a successful [`PermissionDecision::Deny`], not an error.
    pub async fn check_permission(
        &self,
        principal: &Principal,
        requirement: &Requirement,
    ) -> KernelResult<PermissionDecision> {
        let features = self.features.snapshot(principal.tenant_id()).await?;
        Ok(check_permission(principal, requirement, &features, &self.policy))
    }

    async fn require(&self, principal: &Principal, requirement: Requirement) -> KernelResult<()> {
        let decision = self.check_permission(principal, &requirement).await?;
        if let PermissionDecision::Deny { missing } = &decision {
            info!(
                tenant_id = %principal.tenant_id(),
                user_id = %principal.user_id(),
                missing = ?missing,
                "permission denied"
            );
        }
        decision.into_result()
    }

    // -- Cross-reference validator -----------------------------------------

    /// Check that every reference exists within the principal's tenant.
    ///
    /// # Errors
    ///
    /// [`KernelError::ReferenceNotFound`] or
    /// [`KernelError::CrossTenantReference`] for the first failing reference.
    pub async fn validate_references(
        &self,
        principal: &Principal,
        refs: &[ResourceRef],
    ) -> KernelResult<()> {
        let mut conn = self.pool.acquire().await?;
        self.validator.validate(&mut *conn, principal, refs).await
    }

    // -- Scoped queries and mutations --------------------------------------

    /// Run a scoped query on behalf of `principal`.
    ///
    /// Selects require the entity's read permission. Inserts, updates and
    /// deletes go through [`Kernel::mutate`] and are audited.
    ///
    /// # Errors
    ///
    /// Any kernel error from the gates involved.
    pub async fn scoped_query(
        &self,
        principal: &Principal,
        query: &ScopedQuery,
    ) -> KernelResult<Vec<Row>> {
        if query.operation().is_mutation() {
            return Ok(self.mutate(principal, query, &[]).await?.rows);
        }
        check_scope(principal, query)?;
        let entity = self.registry.get(query.entity())?;
        self.require(principal, Requirement::key(entity.read_permission))
            .await?;
        self.with_retry("select", || self.executor.run(&self.pool, query))
            .await
    }

    /// Perform an audited mutation as one unit of work.
    ///
    /// References found in the assigned values via the entity's foreign
    /// keys, plus `extra_refs`, are validated on the write transaction.
    /// A delete is refused while rows of the same tenant still reference a
    /// row it would remove.
    /// Each affected row gets exactly one audit entry; if an audit write
    /// fails the whole mutation is rolled back with
    /// [`KernelError::AuditWriteFailed`]. Transient storage errors are
    /// retried per the configured policy; nothing else is.
    ///
    /// # Errors
    ///
    /// Any kernel error from the gates involved.
    pub async fn mutate(
        &self,
        principal: &Principal,
        query: &ScopedQuery,
        extra_refs: &[ResourceRef],
    ) -> KernelResult<MutationOutcome> {
        if !query.operation().is_mutation() {
            return Err(KernelError::InvalidValue {
                column: "*".to_owned(),
                reason: "select is not a mutation".to_owned(),
            });
        }
        check_scope(principal, query)?;
        let entity = self.registry.get(query.entity())?;
        self.require(principal, Requirement::key(entity.write_permission))
            .await?;

        let mut refs = references_in(entity, query.value_fields())?;
        refs.extend_from_slice(extra_refs);

        let outcome = self
            .with_retry(query.operation().as_str(), || {
                self.mutate_once(principal, query, &refs)
            })
            .await?;
        info!(
            tenant_id = %principal.tenant_id(),
            user_id = %principal.user_id(),
            entity = query.entity(),
            operation = query.operation().as_str(),
            rows = outcome.rows.len(),
            "mutation committed"
        );
        Ok(outcome)
    }

    async fn mutate_once(
        &self,
        principal: &Principal,
        query: &ScopedQuery,
        refs: &[ResourceRef],
    ) -> KernelResult<MutationOutcome> {
        self.executor.check(query)?;
        let mut tx = self.pool.begin().await?;

        self.validator.validate(&mut *tx, principal, refs).await?;

        let before = match query.operation() {
            Operation::Update | Operation::Delete => {
                self.executor.execute(&mut *tx, &query.as_select()).await?
            }
            _ => Vec::new(),
        };
        if query.operation() == Operation::Delete {
            let ids: Vec<i64> = before.iter().filter_map(row_id).collect();
            self.validator
                .ensure_unreferenced(&mut *tx, principal, query.entity(), &ids)
                .await?;
        }
        let rows = self.executor.execute(&mut *tx, query).await?;
        if query.operation() == Operation::Insert && rows.is_empty() {
            return Err(KernelError::Storage(sqlx::Error::RowNotFound));
        }

        let action = match query.operation() {
            Operation::Insert => AuditAction::Create,
            Operation::Update => AuditAction::Update,
            _ => AuditAction::Delete,
        };
        let mut audit_ids = Vec::with_capacity(rows.len());
        for row in &rows {
            let id = row_id(row).ok_or_else(|| KernelError::Storage(sqlx::Error::RowNotFound))?;
            let (before_value, after_value) = match action {
                AuditAction::Delete => (Some(Value::Object(row.clone())), None),
                AuditAction::Update => (
                    before
                        .iter()
                        .find(|b| row_id(b) == Some(id))
                        .map(|b| Value::Object(b.clone())),
                    Some(Value::Object(row.clone())),
                ),
                _ => (None, Some(Value::Object(row.clone()))),
            };
            let entry = NewAuditEntry::by(principal, action, query.entity(), id.to_string())
                .before(before_value)
                .after(after_value);
            audit_ids.push(self.audit.record_on(&mut *tx, &entry).await?);
        }

        tx.commit().await?;
        Ok(MutationOutcome { rows, audit_ids })
    }

    /// Run `op`, retrying transient storage errors with linear backoff.
    async fn with_retry<T, F, Fut>(&self, label: &'static str, mut op: F) -> KernelResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = KernelResult<T>>,
    {
        let mut attempt: u32 = 1;
        loop {
            match op().await {
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.backoff_ms.saturating_mul(u64::from(attempt));
                    warn!(operation = label, attempt, delay_ms = delay, error = %e, "transient storage error, retrying");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt = attempt.saturating_add(1);
                }
                other => return other,
            }
        }
    }

    // -- Audit --------------------------------------------------------------

    /// Append an audit entry in its own transaction.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::AuditWriteFailed`] if the entry was not stored.
    pub async fn record_audit(&self, entry: &NewAuditEntry) -> KernelResult<i64> {
        self.audit.record(entry).await
    }

    /// Read the principal's tenant audit log. Requires `audit.read`.
    ///
    /// # Errors
    ///
    /// [`KernelError::PermissionDenied`], or storage errors.
    pub async fn get_audit_log(
        &self,
        principal: &Principal,
        filter: &AuditFilter,
        page: Page,
    ) -> KernelResult<Vec<AuditEntry>> {
        self.require(principal, Requirement::key(AUDIT_READ)).await?;
        self.audit
            .get_audit_log(principal.tenant_id(), filter, page)
            .await
    }

    /// The underlying recorder, for trusted callers that already hold a
    /// tenant id (reconciliation jobs, the operator CLI).
    pub fn audit(&self) -> &AuditRecorder {
        &self.audit
    }

    // -- Feature flags ------------------------------------------------------

    /// Whether a feature is enabled for a tenant.
    ///
    /// # Errors
    ///
    /// Returns storage errors unchanged.
    pub async fn is_feature_enabled(&self, tenant_id: TenantId, feature: &str) -> KernelResult<bool> {
        self.features.is_feature_enabled(tenant_id, feature).await
    }

    /// All feature flags of a tenant.
    ///
    /// # Errors
    ///
    /// Returns storage errors unchanged.
    pub async fn list_features(&self, tenant_id: TenantId) -> KernelResult<Vec<FeatureFlag>> {
        self.features.list(tenant_id).await
    }

    /// Toggle a feature for `tenant_id`. Requires `features.manage` and a
    /// principal scoped to that tenant (operators use
    /// [`Principal::assume_tenant`]).
    ///
    /// # Errors
    ///
    /// [`KernelError::TenantMismatch`], [`KernelError::PermissionDenied`],
    /// [`KernelError::AuditWriteFailed`], or storage errors.
    pub async fn set_feature(
        &self,
        principal: &Principal,
        tenant_id: TenantId,
        feature: &str,
        enabled: bool,
    ) -> KernelResult<FeatureFlag> {
        if tenant_id != principal.tenant_id() {
            return Err(KernelError::TenantMismatch {
                expected: principal.tenant_id(),
                supplied: tenant_id.to_string(),
            });
        }
        self.require(principal, Requirement::key(FEATURES_MANAGE))
            .await?;
        self.with_retry("set_feature", || {
            self.features.set_feature(principal, feature, enabled)
        })
        .await
    }

    // -- Permission grants --------------------------------------------------

    /// Grant a permission to a user of the principal's tenant.
    ///
    /// # Errors
    ///
    /// [`KernelError::PermissionDenied`], [`KernelError::AuditWriteFailed`],
    /// or storage errors.
    pub async fn grant_permission(
        &self,
        principal: &Principal,
        user_id: UserId,
        key: &PermissionKey,
    ) -> KernelResult<i64> {
        self.require(principal, Requirement::key(PERMISSIONS_MANAGE))
            .await?;
        self.with_retry("grant_permission", || {
            self.grants.grant(principal, user_id, key)
        })
        .await
    }

    /// Revoke a permission from a user of the principal's tenant.
    ///
    /// # Errors
    ///
    /// [`KernelError::PermissionDenied`], [`KernelError::AuditWriteFailed`],
    /// or storage errors.
    pub async fn revoke_permission(
        &self,
        principal: &Principal,
        user_id: UserId,
        key: &PermissionKey,
    ) -> KernelResult<bool> {
        self.require(principal, Requirement::key(PERMISSIONS_MANAGE))
            .await?;
        self.with_retry("revoke_permission", || {
            self.grants.revoke(principal, user_id, key)
        })
        .await
    }

    // -- Integrity ----------------------------------------------------------

    /// Sweep one tenant for references the write path should have rejected.
    ///
    /// # Errors
    ///
    /// Schema errors for unregistered relationships, or storage errors.
    pub async fn run_integrity_sweep(
        &self,
        tenant_id: TenantId,
        plan: &SweepPlan,
    ) -> KernelResult<IntegrityReport> {
        self.integrity.run_integrity_sweep(tenant_id, plan).await
    }

    /// Plan covering every registered relationship and entity.
    pub fn full_sweep_plan(&self) -> SweepPlan {
        SweepPlan::full(&self.registry)
    }

    /// The integrity monitor, for periodic sweeps.
    pub fn integrity(&self) -> &IntegrityMonitor {
        &self.integrity
    }

    /// The shared pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// A query built for one principal must not be run for another tenant.
fn check_scope(principal: &Principal, query: &ScopedQuery) -> KernelResult<()> {
    if query.tenant_id() == principal.tenant_id() {
        Ok(())
    } else {
        Err(KernelError::TenantMismatch {
            expected: principal.tenant_id(),
            supplied: query.tenant_id().to_string(),
        })
    }
}

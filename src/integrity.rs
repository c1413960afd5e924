//! Integrity monitor.
//!
//! A read-only sweep that looks for rows the write path should have
//! prevented: foreign keys pointing nowhere, foreign keys pointing into
//! another tenant, and rows without a `create` audit entry. Findings are
//! data, never errors, and nothing is repaired. An empty report means no
//! violation was *detected* among the checks that ran.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audit::AuditAction;
use crate::error::KernelResult;
use crate::identity::TenantId;
use crate::schema::{EntityRegistry, Relationship, ID_COLUMN, TENANT_COLUMN};

/// What kind of violation a finding describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    /// The referenced row does not exist.
    Orphaned,
    /// The referenced row belongs to another tenant.
    CrossTenant,
    /// The row has no `create` audit entry.
    Unaudited,
}

/// One detected violation class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    /// Relationship (`child.column -> parent`) or entity checked.
    pub relationship: String,
    /// Violation kind.
    pub kind: FindingKind,
    /// Number of offending rows.
    pub offending_rows: u64,
    /// Up to the configured sample size of offending row ids.
    pub sample_ids: Vec<i64>,
}

/// Result of one sweep over one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    /// Tenant swept.
    pub tenant_id: TenantId,
    /// When the sweep started.
    pub checked_at: DateTime<Utc>,
    /// Relationships checked.
    pub relationships_checked: usize,
    /// Entities checked for audit coverage.
    pub entities_checked: usize,
    /// Detected violations.
    pub findings: Vec<Finding>,
}

impl IntegrityReport {
    /// Whether no violation was detected.
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

/// Which checks a sweep runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepPlan {
    /// Foreign key relationships to check.
    pub relationships: Vec<Relationship>,
    /// Entities whose rows must each have a `create` audit entry.
    pub audited_entities: Vec<&'static str>,
}

impl SweepPlan {
    /// Check only the given relationships.
    pub fn relationships(relationships: Vec<Relationship>) -> Self {
        Self {
            relationships,
            audited_entities: Vec::new(),
        }
    }

    /// Every relationship and every entity in the registry.
    pub fn full(registry: &EntityRegistry) -> Self {
        Self {
            relationships: registry.relationships(),
            audited_entities: registry.entities().map(|e| e.name).collect(),
        }
    }
}

/// Runs integrity sweeps against the shared pool.
#[derive(Debug, Clone)]
pub struct IntegrityMonitor {
    pool: SqlitePool,
    registry: Arc<EntityRegistry>,
    sample_size: u32,
}

impl IntegrityMonitor {
    /// Build a monitor.
    pub fn new(pool: SqlitePool, registry: Arc<EntityRegistry>, sample_size: u32) -> Self {
        Self {
            pool,
            registry,
            sample_size,
        }
    }

    /// Sweep one tenant.
    ///
    /// # Errors
    ///
    /// Returns schema errors for relationships or entities not in the
    /// registry, and storage errors. Violations themselves are reported in
    /// the returned [`IntegrityReport`].
    pub async fn run_integrity_sweep(
        &self,
        tenant_id: TenantId,
        plan: &SweepPlan,
    ) -> KernelResult<IntegrityReport> {
        let checked_at = Utc::now();
        let mut findings = Vec::new();

        for rel in &plan.relationships {
            // Only registered identifiers ever reach the SQL text.
            let child = self.registry.get(rel.child)?;
            child.column(rel.column)?;
            let parent = self.registry.get(rel.parent)?;

            let orphaned = self
                .measure(|qb| {
                    push_child_scope(qb, child.name, rel.column, tenant_id);
                    qb.push(" AND NOT EXISTS (SELECT 1 FROM ");
                    qb.push(parent.name);
                    qb.push(" p WHERE p.");
                    qb.push(ID_COLUMN);
                    qb.push(" = c.");
                    qb.push(rel.column);
                    qb.push(")");
                })
                .await?;
            push_finding(&mut findings, rel.to_string(), FindingKind::Orphaned, orphaned);

            let cross = self
                .measure(|qb| {
                    push_child_scope(qb, child.name, rel.column, tenant_id);
                    qb.push(" AND EXISTS (SELECT 1 FROM ");
                    qb.push(parent.name);
                    qb.push(" p WHERE p.");
                    qb.push(ID_COLUMN);
                    qb.push(" = c.");
                    qb.push(rel.column);
                    qb.push(" AND p.");
                    qb.push(TENANT_COLUMN);
                    qb.push(" != c.");
                    qb.push(TENANT_COLUMN);
                    qb.push(")");
                })
                .await?;
            push_finding(&mut findings, rel.to_string(), FindingKind::CrossTenant, cross);
        }

        for name in &plan.audited_entities {
            let entity = self.registry.get(name)?;
            let unaudited = self
                .measure(|qb| {
                    qb.push(" FROM ");
                    qb.push(entity.name);
                    qb.push(" c WHERE c.");
                    qb.push(TENANT_COLUMN);
                    qb.push(" = ");
                    qb.push_bind(tenant_id.get());
                    qb.push(
                        " AND NOT EXISTS (SELECT 1 FROM audit_log a \
                         WHERE a.tenant_id = c.tenant_id AND a.resource_type = ",
                    );
                    qb.push_bind(entity.name);
                    qb.push(" AND a.action = ");
                    qb.push_bind(AuditAction::Create.as_str());
                    qb.push(" AND a.resource_id = CAST(c.id AS TEXT))");
                })
                .await?;
            push_finding(&mut findings, entity.name.to_owned(), FindingKind::Unaudited, unaudited);
        }

        let report = IntegrityReport {
            tenant_id,
            checked_at,
            relationships_checked: plan.relationships.len(),
            entities_checked: plan.audited_entities.len(),
            findings,
        };
        if report.is_clean() {
            info!(tenant_id = %tenant_id, relationships = report.relationships_checked, "integrity sweep clean");
        } else {
            for finding in &report.findings {
                if finding.kind == FindingKind::CrossTenant {
                    warn!(
                        tenant_id = %tenant_id,
                        relationship = %finding.relationship,
                        kind = ?finding.kind,
                        offending_rows = finding.offending_rows,
                        security_event = true,
                        "integrity violation detected"
                    );
                } else {
                    warn!(
                        tenant_id = %tenant_id,
                        relationship = %finding.relationship,
                        kind = ?finding.kind,
                        offending_rows = finding.offending_rows,
                        "integrity violation detected"
                    );
                }
            }
        }
        Ok(report)
    }

    /// Count matching rows and sample their ids.
    ///
    /// `from_where` must push ` FROM <table> c WHERE ...`.
    async fn measure(
        &self,
        from_where: impl Fn(&mut QueryBuilder<'_, Sqlite>),
    ) -> KernelResult<(u64, Vec<i64>)> {
        let mut count_qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*)");
        from_where(&mut count_qb);
        let (count,): (i64,) = count_qb.build_query_as().fetch_one(&self.pool).await?;
        if count == 0 {
            return Ok((0, Vec::new()));
        }

        let mut sample_qb = QueryBuilder::<Sqlite>::new("SELECT c.id");
        from_where(&mut sample_qb);
        sample_qb.push(" ORDER BY c.id LIMIT ");
        sample_qb.push_bind(i64::from(self.sample_size));
        let ids: Vec<(i64,)> = sample_qb.build_query_as().fetch_all(&self.pool).await?;

        Ok((
            u64::try_from(count).unwrap_or(0),
            ids.into_iter().map(|(id,)| id).collect(),
        ))
    }

    /// Sweep the given tenants every `interval`, starting immediately.
    ///
    /// Reports are sent on the returned channel; the task stops when the
    /// receiver is dropped. A failed sweep is logged and retried on the
    /// next tick.
    pub fn spawn_periodic(
        &self,
        tenants: Vec<TenantId>,
        plan: SweepPlan,
        interval: Duration,
    ) -> (JoinHandle<()>, mpsc::Receiver<IntegrityReport>) {
        let (tx, rx) = mpsc::channel(16);
        let monitor = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                for tenant_id in &tenants {
                    match monitor.run_integrity_sweep(*tenant_id, &plan).await {
                        Ok(report) => {
                            if tx.send(report).await.is_err() {
                                debug!("integrity report receiver dropped; stopping sweeps");
                                return;
                            }
                        }
                        Err(e) => warn!(tenant_id = %tenant_id, error = %e, "integrity sweep failed"),
                    }
                }
            }
        });
        (handle, rx)
    }
}

/// Push ` FROM <child> c WHERE c.tenant_id = ? AND c.<column> IS NOT NULL`.
fn push_child_scope(
    qb: &mut QueryBuilder<'_, Sqlite>,
    child: &'static str,
    column: &'static str,
    tenant_id: TenantId,
) {
    qb.push(" FROM ");
    qb.push(child);
    qb.push(" c WHERE c.");
    qb.push(TENANT_COLUMN);
    qb.push(" = ");
    qb.push_bind(tenant_id.get());
    qb.push(" AND c.");
    qb.push(column);
    qb.push(" IS NOT NULL");
}

fn push_finding(
    findings: &mut Vec<Finding>,
    relationship: String,
    kind: FindingKind,
    (offending_rows, sample_ids): (u64, Vec<i64>),
) {
    if offending_rows > 0 {
        findings.push(Finding {
            relationship,
            kind,
            offending_rows,
            sample_ids,
        });
    }
}

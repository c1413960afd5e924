//! Cross-reference validator.
//!
//! Before a write links one entity to another, every referenced row must
//! exist and belong to the acting principal's tenant. Validation is
//! all-or-nothing: the first failing reference rejects the whole payload.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{QueryBuilder, Row as _, Sqlite, SqliteConnection};
use tracing::{debug, warn};

use crate::error::{KernelError, KernelResult};
use crate::identity::Principal;
use crate::query::Fields;
use crate::schema::{EntityDef, EntityRegistry, ID_COLUMN, TENANT_COLUMN};

/// An `(entity class, id)` pair found in a mutation payload.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    /// Referenced entity class.
    pub entity: String,
    /// Referenced row id.
    pub id: i64,
}

impl ResourceRef {
    /// Build a reference.
    pub fn new(entity: impl Into<String>, id: i64) -> Self {
        Self {
            entity: entity.into(),
            id,
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity, self.id)
    }
}

/// Extract the references a payload makes through `entity`'s foreign keys.
///
/// Null foreign key values are skipped.
///
/// # Errors
///
/// Returns [`KernelError::InvalidValue`] if a foreign key value is not an
/// integer id.
pub fn references_in(entity: &EntityDef, fields: &Fields) -> KernelResult<Vec<ResourceRef>> {
    let mut refs = Vec::new();
    for (column, value) in fields {
        let Some(fk) = entity.foreign_key(column) else {
            continue;
        };
        match value {
            Value::Null => {}
            other => {
                let id = other.as_i64().ok_or_else(|| KernelError::InvalidValue {
                    column: column.clone(),
                    reason: "foreign key must be an integer id".to_owned(),
                })?;
                refs.push(ResourceRef::new(fk.target, id));
            }
        }
    }
    Ok(refs)
}

/// Resolves reference ownership against the store.
#[derive(Debug, Clone)]
pub struct ReferenceValidator {
    registry: Arc<EntityRegistry>,
}

impl ReferenceValidator {
    /// Build a validator over the given entity registry.
    pub fn new(registry: Arc<EntityRegistry>) -> Self {
        Self { registry }
    }

    /// Check that every reference exists and is owned by the principal's tenant.
    ///
    /// Call this on the same transaction as the write it guards so that
    /// ownership is re-read at write time.
    ///
    /// # Errors
    ///
    /// [`KernelError::ReferenceNotFound`] for a missing row,
    /// [`KernelError::CrossTenantReference`] for a row of another tenant,
    /// [`KernelError::UnknownEntity`] for an unregistered entity class.
    pub async fn validate(
        &self,
        conn: &mut SqliteConnection,
        principal: &Principal,
        refs: &[ResourceRef],
    ) -> KernelResult<()> {
        // Resolve schema first so an unknown entity fails before any read.
        for reference in refs {
            self.registry.get(&reference.entity)?;
        }

        let mut seen = BTreeSet::new();
        for reference in refs {
            if !seen.insert(reference) {
                continue;
            }
            let entity = self.registry.get(&reference.entity)?;
            match owner_of(conn, entity, reference.id).await? {
                None => {
                    debug!(
                        tenant_id = %principal.tenant_id(),
                        reference = %reference,
                        "reference not found"
                    );
                    return Err(KernelError::ReferenceNotFound {
                        entity: reference.entity.clone(),
                        id: reference.id,
                    });
                }
                Some(owner) if owner != principal.tenant_id().get() => {
                    warn!(
                        tenant_id = %principal.tenant_id(),
                        user_id = %principal.user_id(),
                        reference = %reference,
                        security_event = true,
                        "cross-tenant reference rejected"
                    );
                    return Err(KernelError::CrossTenantReference {
                        entity: reference.entity.clone(),
                        id: reference.id,
                    });
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Check that no row in the principal's tenant still points at any of
    /// `ids` through a registered foreign key into `entity`.
    ///
    /// Call this on the delete's transaction, before the delete runs.
    ///
    /// # Errors
    ///
    /// [`KernelError::ReferencedByOtherRows`] naming the first relationship
    /// found holding a reference, [`KernelError::UnknownEntity`] for an
    /// unregistered entity class.
    pub async fn ensure_unreferenced(
        &self,
        conn: &mut SqliteConnection,
        principal: &Principal,
        entity: &str,
        ids: &[i64],
    ) -> KernelResult<()> {
        let parent = self.registry.get(entity)?;
        if ids.is_empty() {
            return Ok(());
        }

        for relationship in self.registry.relationships() {
            if relationship.parent != parent.name {
                continue;
            }
            let mut qb = QueryBuilder::<Sqlite>::new("SELECT ");
            qb.push(relationship.column);
            qb.push(" FROM ");
            qb.push(relationship.child);
            qb.push(" WHERE ");
            qb.push(TENANT_COLUMN);
            qb.push(" = ");
            qb.push_bind(principal.tenant_id().get());
            qb.push(" AND ");
            qb.push(relationship.column);
            qb.push(" IN (");
            push_ids(&mut qb, ids);
            qb.push(")");
            // Rows deleted alongside their parent do not count.
            if relationship.child == parent.name {
                qb.push(" AND ");
                qb.push(ID_COLUMN);
                qb.push(" NOT IN (");
                push_ids(&mut qb, ids);
                qb.push(")");
            }
            qb.push(" LIMIT 1");

            if let Some(row) = qb.build().fetch_optional(&mut *conn).await? {
                let id: i64 = row.try_get(0)?;
                debug!(
                    tenant_id = %principal.tenant_id(),
                    entity = parent.name,
                    id,
                    relationship = %relationship,
                    "delete blocked by referencing rows"
                );
                return Err(KernelError::ReferencedByOtherRows {
                    entity: parent.name.to_owned(),
                    id,
                    relationship: relationship.to_string(),
                });
            }
        }
        Ok(())
    }
}

fn push_ids(qb: &mut QueryBuilder<'_, Sqlite>, ids: &[i64]) {
    let mut separated = qb.separated(", ");
    for id in ids {
        separated.push_bind(*id);
    }
}

/// Owning tenant of a row, regardless of the caller's scope.
///
/// This is the kernel's only unscoped read; it returns nothing but the
/// owner id so that "absent" and "foreign" can be told apart.
async fn owner_of(
    conn: &mut SqliteConnection,
    entity: &EntityDef,
    id: i64,
) -> KernelResult<Option<i64>> {
    let mut qb = QueryBuilder::<Sqlite>::new("SELECT ");
    qb.push(TENANT_COLUMN);
    qb.push(" FROM ");
    qb.push(entity.name);
    qb.push(" WHERE ");
    qb.push(ID_COLUMN);
    qb.push(" = ");
    qb.push_bind(id);
    let row = qb.build().fetch_optional(&mut *conn).await?;
    row.map(|r| r.try_get::<i64, _>(0).map_err(KernelError::from))
        .transpose()
}

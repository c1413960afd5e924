//! Kernel error taxonomy.
//!
//! Every kernel component fails closed: an ambiguous state surfaces as one of
//! these variants, never as a silent allow.

use crate::identity::TenantId;
use crate::permission::PermissionKey;

/// Errors from kernel operations.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    /// No tenant could be established for the request.
    #[error("missing tenant context")]
    MissingTenantContext,

    /// A caller tried to read or write outside the principal's tenant.
    #[error("tenant mismatch: principal is scoped to tenant {expected}, caller supplied {supplied}")]
    TenantMismatch {
        /// Tenant of the acting principal.
        expected: TenantId,
        /// Tenant id the caller attempted to use.
        supplied: String,
    },

    /// The permission gate denied the operation.
    #[error("permission denied: missing {}", format_keys(.missing))]
    PermissionDenied {
        /// Permission keys any one of which would have allowed the operation.
        missing: Vec<PermissionKey>,
    },

    /// A referenced entity does not exist.
    #[error("{entity} {id} not found")]
    ReferenceNotFound {
        /// Entity class of the reference.
        entity: String,
        /// Referenced row id.
        id: i64,
    },

    /// A referenced entity belongs to a different tenant.
    #[error("{entity} {id} is not accessible from this tenant")]
    CrossTenantReference {
        /// Entity class of the reference.
        entity: String,
        /// Referenced row id.
        id: i64,
    },

    /// The audit entry for a mutation could not be written.
    #[error("audit write failed: {source}")]
    AuditWriteFailed {
        /// What stopped the write.
        #[source]
        source: Box<KernelError>,
    },

    /// A delete would leave rows in the tenant pointing at nothing.
    #[error("{entity} {id} is still referenced by {relationship}")]
    ReferencedByOtherRows {
        /// Entity class of the row being deleted.
        entity: String,
        /// Row id being deleted.
        id: i64,
        /// First relationship found holding a reference to the row.
        relationship: String,
    },

    /// The entity class is not registered.
    #[error("unknown entity: {0}")]
    UnknownEntity(String),

    /// The column is not part of the entity's registered schema.
    #[error("unknown column {column} on {entity}")]
    UnknownColumn {
        /// Entity class.
        entity: String,
        /// Offending column name.
        column: String,
    },

    /// A field value does not fit the column type.
    #[error("invalid value for {column}: {reason}")]
    InvalidValue {
        /// Column the value was destined for.
        column: String,
        /// What was wrong with it.
        reason: String,
    },

    /// An update or delete carried no filter beyond the tenant scope.
    #[error("refusing unbounded {operation} on {entity}")]
    UnboundedMutation {
        /// Operation kind.
        operation: &'static str,
        /// Entity class.
        entity: String,
    },

    /// An invalid enum value was read from the database.
    #[error("invalid {field} value: {value:?}")]
    InvalidEnum {
        /// Which field contained the bad value.
        field: &'static str,
        /// The unexpected value.
        value: String,
    },

    /// Underlying storage error, passed through unmodified.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// JSON encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl KernelError {
    /// Whether retrying the same operation could succeed.
    ///
    /// Only storage contention and pool exhaustion qualify, including when
    /// they stopped an audit write. Authorization and referential failures
    /// never change on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Storage(sqlx::Error::PoolTimedOut) => true,
            Self::Storage(sqlx::Error::Database(db)) => {
                let message = db.message();
                message.contains("database is locked") || message.contains("database is busy")
            }
            Self::AuditWriteFailed { source } => source.is_transient(),
            _ => false,
        }
    }

    /// Whether this error may indicate an attempted tenant boundary violation.
    pub fn is_security_event(&self) -> bool {
        matches!(
            self,
            Self::CrossTenantReference { .. } | Self::TenantMismatch { .. }
        )
    }
}

fn format_keys(keys: &[PermissionKey]) -> String {
    keys.iter()
        .map(PermissionKey::as_str)
        .collect::<Vec<_>>()
        .join(" | ")
}

/// Convenience alias for kernel results.
pub type KernelResult<T> = Result<T, KernelError>;

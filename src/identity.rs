//! Identity context: the per-request [`Principal`].
//!
//! A principal is built once per inbound request by an external
//! authentication collaborator (see [`IdentityProvider`]) and passed by
//! reference through every kernel call. There is no ambient "current user".

use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{KernelError, KernelResult};
use crate::permission::{PermissionGrant, PermissionKey};

/// Opaque identifier of one clinic's data partition. Always positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct TenantId(i64);

impl TenantId {
    /// Validate a raw tenant id.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::MissingTenantContext`] for zero or negative ids.
    pub fn new(raw: i64) -> KernelResult<Self> {
        if raw > 0 {
            Ok(Self(raw))
        } else {
            Err(KernelError::MissingTenantContext)
        }
    }

    /// The raw id as stored in the database.
    pub fn get(self) -> i64 {
        self.0
    }
}

impl TryFrom<i64> for TenantId {
    type Error = KernelError;

    fn try_from(raw: i64) -> Result<Self, Self::Error> {
        Self::new(raw)
    }
}

impl From<TenantId> for i64 {
    fn from(id: TenantId) -> Self {
        id.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an authenticated user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(i64);

impl UserId {
    /// Wrap a raw user id.
    pub fn new(raw: i64) -> Self {
        Self(raw)
    }

    /// The raw id as stored in the database.
    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role granted to a user within a clinic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Platform operator. Bypasses the permission gate, never tenant scoping.
    Operator,
    /// Clinic administrator.
    Admin,
    /// Physician.
    Doctor,
    /// Nursing staff.
    Nurse,
    /// Front desk.
    Receptionist,
    /// Billing clerk.
    Billing,
    /// Generic staff member.
    Staff,
}

impl Role {
    /// Returns the string representation used in config and claims.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Operator => "operator",
            Self::Admin => "admin",
            Self::Doctor => "doctor",
            Self::Nurse => "nurse",
            Self::Receptionist => "receptionist",
            Self::Billing => "billing",
            Self::Staff => "staff",
        }
    }

    /// Parse from a claim value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised role.
    pub fn parse(s: &str) -> KernelResult<Self> {
        match s {
            "operator" => Ok(Self::Operator),
            "admin" => Ok(Self::Admin),
            "doctor" => Ok(Self::Doctor),
            "nurse" => Ok(Self::Nurse),
            "receptionist" => Ok(Self::Receptionist),
            "billing" => Ok(Self::Billing),
            "staff" => Ok(Self::Staff),
            other => Err(KernelError::InvalidEnum {
                field: "role",
                value: other.to_owned(),
            }),
        }
    }
}

/// Request origin metadata copied into every audit entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    /// Correlation id of the inbound request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Client address as seen by the HTTP layer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    /// Client user agent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// Set when an operator assumed this tenant from another one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub home_tenant: Option<TenantId>,
}

/// Authenticated identity plus tenant, role and grant context for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    tenant_id: TenantId,
    user_id: UserId,
    roles: BTreeSet<Role>,
    grants: Vec<PermissionGrant>,
    origin: Origin,
}

impl Principal {
    /// Build a principal with no explicit grants.
    pub fn new(tenant_id: TenantId, user_id: UserId, roles: impl IntoIterator<Item = Role>) -> Self {
        Self {
            tenant_id,
            user_id,
            roles: roles.into_iter().collect(),
            grants: Vec::new(),
            origin: Origin::default(),
        }
    }

    /// Build a principal from raw session claims.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::MissingTenantContext`] if the claims carry no
    /// valid tenant, or [`KernelError::InvalidEnum`] for an unknown role.
    pub fn from_claims(claims: &SessionClaims) -> KernelResult<Self> {
        let tenant_id = claims
            .tenant_id
            .ok_or(KernelError::MissingTenantContext)
            .and_then(TenantId::new)?;
        let roles = claims
            .roles
            .iter()
            .map(|r| Role::parse(r))
            .collect::<KernelResult<BTreeSet<_>>>()?;
        Ok(Self {
            tenant_id,
            user_id: UserId::new(claims.user_id),
            roles,
            grants: Vec::new(),
            origin: Origin {
                request_id: claims.request_id.clone(),
                ..Origin::default()
            },
        })
    }

    /// Attach explicit permission grants loaded for this user.
    pub fn with_grants(mut self, grants: Vec<PermissionGrant>) -> Self {
        self.grants = grants;
        self
    }

    /// Attach request origin metadata.
    pub fn with_origin(mut self, origin: Origin) -> Self {
        let home_tenant = self.origin.home_tenant;
        self.origin = Origin {
            home_tenant,
            ..origin
        };
        self
    }

    /// Tenant every kernel operation of this principal is scoped to.
    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    /// Acting user.
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Granted roles.
    pub fn roles(&self) -> &BTreeSet<Role> {
        &self.roles
    }

    /// Whether the principal holds the given role.
    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    /// Whether the principal holds the operator (bypass) role.
    pub fn is_operator(&self) -> bool {
        self.has_role(Role::Operator)
    }

    /// Request origin metadata.
    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    /// Active grants recorded for this principal's own tenant.
    ///
    /// Grants carried for any other tenant are never returned.
    pub fn active_grants(&self) -> impl Iterator<Item = &PermissionKey> {
        let tenant = self.tenant_id;
        let user = self.user_id;
        self.grants
            .iter()
            .filter(move |g| g.tenant_id == tenant && g.user_id == user && g.revoked_at.is_none())
            .map(|g| &g.permission_key)
    }

    /// Switch an operator into another tenant's scope.
    ///
    /// The returned principal is scoped to `target` like any other; the
    /// original tenant is kept in [`Origin::home_tenant`] so that every audit
    /// entry records the crossing. Grants are dropped because they belong to
    /// the home tenant.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::PermissionDenied`] if the principal is not an
    /// operator.
    pub fn assume_tenant(&self, target: TenantId) -> KernelResult<Self> {
        if !self.is_operator() {
            return Err(KernelError::PermissionDenied {
                missing: vec![PermissionKey::new(ASSUME_TENANT_PERMISSION)],
            });
        }
        let home = self.origin.home_tenant.unwrap_or(self.tenant_id);
        warn!(
            user_id = %self.user_id,
            home_tenant = %home,
            target_tenant = %target,
            security_event = true,
            "operator assuming tenant scope"
        );
        Ok(Self {
            tenant_id: target,
            user_id: self.user_id,
            roles: self.roles.clone(),
            grants: Vec::new(),
            origin: Origin {
                home_tenant: Some(home),
                ..self.origin.clone()
            },
        })
    }
}

/// Permission key reported when a non-operator tries to switch tenants.
pub const ASSUME_TENANT_PERMISSION: &str = "operator.assume_tenant";

/// Raw claims produced by the authentication layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Tenant the session was opened for.
    pub tenant_id: Option<i64>,
    /// Authenticated user.
    pub user_id: i64,
    /// Role names.
    #[serde(default)]
    pub roles: Vec<String>,
    /// Correlation id of the request.
    #[serde(default)]
    pub request_id: Option<String>,
}

/// External collaborator that authenticates a request and yields a principal.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Resolve a bearer credential into a principal, grants included.
    async fn authenticate(&self, credential: &str) -> KernelResult<Principal>;
}

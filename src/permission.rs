//! Permission gate.
//!
//! [`check_permission`] is a pure function of the principal, the required
//! permission keys, the tenant's feature snapshot and the role policy. It
//! performs no I/O; callers load the [`FeatureSnapshot`] beforehand.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::PermissionsConfig;
use crate::error::{KernelError, KernelResult};
use crate::identity::{Principal, Role, TenantId, UserId};

/// Dotted permission identifier such as `patients.write` or `lab.results`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionKey(String);

impl PermissionKey {
    /// Wrap a permission key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this key equals `namespace` or lives beneath it
    /// (`lab` covers `lab.results` but not `laboratory`).
    pub fn is_within(&self, namespace: &str) -> bool {
        self.0 == namespace
            || self
                .0
                .strip_prefix(namespace)
                .is_some_and(|rest| rest.starts_with('.'))
    }
}

impl fmt::Display for PermissionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PermissionKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

/// Explicit tenant-scoped authorization given to a user beyond role defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionGrant {
    /// Tenant the grant is valid in. Never consulted under another tenant.
    pub tenant_id: TenantId,
    /// Grantee.
    pub user_id: UserId,
    /// Granted permission.
    pub permission_key: PermissionKey,
    /// Who granted it.
    pub granted_by: UserId,
    /// RFC 3339 grant time.
    pub granted_at: String,
    /// RFC 3339 revocation time, if revoked.
    pub revoked_at: Option<String>,
}

impl PermissionGrant {
    /// Build an active grant stamped with the current time.
    pub fn new(
        tenant_id: TenantId,
        user_id: UserId,
        permission_key: impl Into<PermissionKey>,
        granted_by: UserId,
    ) -> Self {
        Self {
            tenant_id,
            user_id,
            permission_key: permission_key.into(),
            granted_by,
            granted_at: Utc::now().to_rfc3339(),
            revoked_at: None,
        }
    }
}

/// One or more acceptable permission keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    /// Exactly this key.
    Key(PermissionKey),
    /// Any one of these keys.
    AnyOf(Vec<PermissionKey>),
}

impl Requirement {
    /// Require a single key.
    pub fn key(key: impl Into<PermissionKey>) -> Self {
        Self::Key(key.into())
    }

    /// Accept any of the given keys.
    pub fn any_of<K: Into<PermissionKey>>(keys: impl IntoIterator<Item = K>) -> Self {
        Self::AnyOf(keys.into_iter().map(Into::into).collect())
    }

    fn keys(&self) -> &[PermissionKey] {
        match self {
            Self::Key(key) => std::slice::from_ref(key),
            Self::AnyOf(keys) => keys,
        }
    }
}

/// Outcome of a permission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionDecision {
    /// The operation is authorized.
    Allow,
    /// The operation is denied; any one of `missing` would have allowed it.
    Deny {
        /// Keys the principal lacked.
        missing: Vec<PermissionKey>,
    },
}

impl PermissionDecision {
    /// Whether the decision allows the operation.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }

    /// Convert a denial into [`KernelError::PermissionDenied`].
    ///
    /// # Errors
    ///
    /// Returns the denial as an error.
    pub fn into_result(self) -> KernelResult<()> {
        match self {
            Self::Allow => Ok(()),
            Self::Deny { missing } => Err(KernelError::PermissionDenied { missing }),
        }
    }
}

/// Point-in-time view of one tenant's feature flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureSnapshot {
    tenant_id: TenantId,
    flags: BTreeMap<String, bool>,
}

impl FeatureSnapshot {
    /// Build a snapshot from `(feature, enabled)` pairs.
    pub fn new(tenant_id: TenantId, flags: impl IntoIterator<Item = (String, bool)>) -> Self {
        Self {
            tenant_id,
            flags: flags.into_iter().collect(),
        }
    }

    /// Tenant the snapshot was taken for.
    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    /// Whether a feature is enabled. Absent features are disabled.
    pub fn is_enabled(&self, feature: &str) -> bool {
        self.flags.get(feature).copied().unwrap_or(false)
    }
}

/// Role defaults and feature gating rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionPolicy {
    role_defaults: BTreeMap<Role, BTreeSet<PermissionKey>>,
    /// Permission namespace -> feature that must be enabled for it.
    feature_gates: BTreeMap<String, String>,
}

/// Read access to patient records.
pub const PATIENTS_READ: &str = "patients.read";
/// Write access to patient records.
pub const PATIENTS_WRITE: &str = "patients.write";
/// Read access to visits.
pub const VISITS_READ: &str = "visits.read";
/// Write access to visits.
pub const VISITS_WRITE: &str = "visits.write";
/// Read access to the staff roster.
pub const STAFF_READ: &str = "staff.read";
/// Write access to the staff roster.
pub const STAFF_WRITE: &str = "staff.write";
/// Read access to lab results.
pub const LAB_RESULTS_READ: &str = "lab.results.read";
/// Write access to lab results.
pub const LAB_RESULTS_WRITE: &str = "lab.results";
/// Read access to invoices.
pub const BILLING_READ: &str = "billing.read";
/// Write access to invoices.
pub const BILLING_WRITE: &str = "billing.write";
/// Read access to prescriptions.
pub const PRESCRIPTIONS_READ: &str = "prescriptions.read";
/// Write access to prescriptions.
pub const PRESCRIPTIONS_WRITE: &str = "prescriptions.write";
/// Manage explicit permission grants.
pub const PERMISSIONS_MANAGE: &str = "permissions.manage";
/// Toggle tenant feature flags.
pub const FEATURES_MANAGE: &str = "features.manage";
/// Read the audit log.
pub const AUDIT_READ: &str = "audit.read";

impl PermissionPolicy {
    /// Build a policy from explicit tables.
    pub fn new(
        role_defaults: BTreeMap<Role, BTreeSet<PermissionKey>>,
        feature_gates: BTreeMap<String, String>,
    ) -> Self {
        Self {
            role_defaults,
            feature_gates,
        }
    }

    /// The built-in clinic role table.
    pub fn clinic_defaults() -> Self {
        fn keys(list: &[&str]) -> BTreeSet<PermissionKey> {
            list.iter().copied().map(PermissionKey::new).collect()
        }

        let mut roles = BTreeMap::new();
        roles.insert(
            Role::Admin,
            keys(&[
                PATIENTS_READ,
                PATIENTS_WRITE,
                VISITS_READ,
                VISITS_WRITE,
                STAFF_READ,
                STAFF_WRITE,
                LAB_RESULTS_READ,
                LAB_RESULTS_WRITE,
                BILLING_READ,
                BILLING_WRITE,
                PRESCRIPTIONS_READ,
                PRESCRIPTIONS_WRITE,
                PERMISSIONS_MANAGE,
                FEATURES_MANAGE,
                AUDIT_READ,
            ]),
        );
        roles.insert(
            Role::Doctor,
            keys(&[
                PATIENTS_READ,
                PATIENTS_WRITE,
                VISITS_READ,
                VISITS_WRITE,
                STAFF_READ,
                LAB_RESULTS_READ,
                LAB_RESULTS_WRITE,
                PRESCRIPTIONS_READ,
                PRESCRIPTIONS_WRITE,
            ]),
        );
        roles.insert(
            Role::Nurse,
            keys(&[
                PATIENTS_READ,
                VISITS_READ,
                VISITS_WRITE,
                LAB_RESULTS_READ,
                LAB_RESULTS_WRITE,
                PRESCRIPTIONS_READ,
            ]),
        );
        roles.insert(
            Role::Receptionist,
            keys(&[PATIENTS_READ, PATIENTS_WRITE, VISITS_READ, VISITS_WRITE, STAFF_READ]),
        );
        roles.insert(
            Role::Billing,
            keys(&[PATIENTS_READ, VISITS_READ, BILLING_READ, BILLING_WRITE]),
        );
        roles.insert(Role::Staff, keys(&[PATIENTS_READ, VISITS_READ, VISITS_WRITE]));
        roles.insert(Role::Operator, BTreeSet::new());

        let feature_gates = [
            ("lab", "labs"),
            ("billing", "billing"),
            ("prescriptions", "e_prescribing"),
        ]
        .into_iter()
        .map(|(ns, feature)| (ns.to_owned(), feature.to_owned()))
        .collect();

        Self::new(roles, feature_gates)
    }

    /// Build from configuration: configured roles replace the built-in entry
    /// for that role, configured gates are added to the built-in ones.
    pub fn from_config(config: &PermissionsConfig) -> Self {
        let mut policy = Self::clinic_defaults();
        for (role, keys) in &config.roles {
            policy.role_defaults.insert(
                *role,
                keys.iter().map(|k| PermissionKey::new(k.as_str())).collect(),
            );
        }
        for (namespace, feature) in &config.feature_gates {
            policy
                .feature_gates
                .insert(namespace.clone(), feature.clone());
        }
        policy
    }

    /// Feature that must be enabled for `key`, if any.
    ///
    /// The most specific matching namespace wins.
    pub fn gating_feature(&self, key: &PermissionKey) -> Option<&str> {
        self.feature_gates
            .iter()
            .filter(|(namespace, _)| key.is_within(namespace))
            .max_by_key(|(namespace, _)| namespace.len())
            .map(|(_, feature)| feature.as_str())
    }

    /// Whether `role` implies `key` by default.
    pub fn role_allows(&self, role: Role, key: &PermissionKey) -> bool {
        self.role_defaults
            .get(&role)
            .is_some_and(|keys| keys.contains(key))
    }
}

impl Default for PermissionPolicy {
    fn default() -> Self {
        Self::clinic_defaults()
    }
}

/// Decide whether `principal` satisfies `requirement`.
///
/// Order: the operator role allows unconditionally; otherwise each candidate
/// key is skipped if its gating feature is not enabled for the tenant, then
/// checked against the principal's own-tenant grants and its role defaults.
/// A snapshot taken for a different tenant than the principal's denies.
pub fn check_permission(
    principal: &Principal,
    requirement: &Requirement,
    features: &FeatureSnapshot,
    policy: &PermissionPolicy,
) -> PermissionDecision {
    if principal.is_operator() {
        return PermissionDecision::Allow;
    }

    let candidates = requirement.keys();
    if features.tenant_id() == principal.tenant_id() {
        for key in candidates {
            if let Some(feature) = policy.gating_feature(key) {
                if !features.is_enabled(feature) {
                    continue;
                }
            }
            if principal.active_grants().any(|granted| granted == key) {
                return PermissionDecision::Allow;
            }
            if principal
                .roles()
                .iter()
                .any(|role| policy.role_allows(*role, key))
            {
                return PermissionDecision::Allow;
            }
        }
    }

    PermissionDecision::Deny {
        missing: candidates.to_vec(),
    }
}

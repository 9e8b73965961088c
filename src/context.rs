//! Request context: who is acting, passed explicitly into every core call.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, ValidationError};

/// Staff roles known to the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    CareProvider,
    CareCoordinator,
    Onboarding,
    DataEntry,
    /// Primary Care Provider Manager, assigned at TV scheduling.
    Pcpm,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::CareProvider => "care_provider",
            Self::CareCoordinator => "care_coordinator",
            Self::Onboarding => "onboarding",
            Self::DataEntry => "data_entry",
            Self::Pcpm => "pcpm",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Self::Admin),
            "care_provider" => Ok(Self::CareProvider),
            "care_coordinator" => Ok(Self::CareCoordinator),
            "onboarding" => Ok(Self::Onboarding),
            "data_entry" => Ok(Self::DataEntry),
            "pcpm" => Ok(Self::Pcpm),
            other => Err(ValidationError::InvalidValue {
                field: "role",
                value: other.to_string(),
            }),
        }
    }
}

/// Per-request identity: the acting user and the roles they hold.
#[derive(Debug, Clone, Serialize)]
pub struct RequestContext {
    /// Correlation id for logs.
    pub request_id: Uuid,
    pub user_id: i64,
    pub roles: Vec<Role>,
}

impl RequestContext {
    pub fn new(user_id: i64, roles: impl IntoIterator<Item = Role>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            user_id,
            roles: roles.into_iter().collect(),
        }
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    /// Fail with `PermissionDenied` unless the user holds one of `allowed`.
    pub fn require_any(&self, allowed: &[Role], action: &str) -> Result<(), Error> {
        if allowed.iter().any(|r| self.has_role(*r)) {
            Ok(())
        } else {
            Err(Error::PermissionDenied {
                action: action.to_string(),
                user_id: self.user_id,
            })
        }
    }
}

/// Roles allowed to register new referrals.
pub const INTAKE_ROLES: &[Role] = &[
    Role::Admin,
    Role::Onboarding,
    Role::DataEntry,
    Role::CareCoordinator,
];

/// Roles allowed to drive an onboarding record through its stages.
pub const ONBOARDING_ROLES: &[Role] = &[Role::Admin, Role::Onboarding, Role::CareCoordinator];

/// Roles allowed to change region data and patient region links.
pub const REGION_ROLES: &[Role] = &[Role::Admin, Role::DataEntry, Role::Onboarding];

/// Roles allowed to create patients, change their status and caseloads.
pub const PATIENT_ROLES: &[Role] = &[Role::Admin, Role::DataEntry, Role::Onboarding];

/// Roles allowed to append task log entries.
pub const TASK_LOG_ROLES: &[Role] = &[Role::Admin, Role::CareProvider, Role::CareCoordinator];

/// Roles allowed to rebuild summaries and caches and to manage staff.
pub const ADMIN_ROLES: &[Role] = &[Role::Admin];

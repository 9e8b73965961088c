//! Patient and staff data model.

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::context::Role;
use crate::error::ValidationError;

/// Patient lifecycle status. Free text in legacy data; closed here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatientStatus {
    Active,
    #[serde(rename = "Active-Geri")]
    ActiveGeri,
    #[serde(rename = "Active-PCP")]
    ActivePcp,
    Inactive,
    Pending,
    Discharged,
    Deceased,
}

impl PatientStatus {
    pub const ALL: [PatientStatus; 7] = [
        Self::Active,
        Self::ActiveGeri,
        Self::ActivePcp,
        Self::Inactive,
        Self::Pending,
        Self::Discharged,
        Self::Deceased,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "Active",
            Self::ActiveGeri => "Active-Geri",
            Self::ActivePcp => "Active-PCP",
            Self::Inactive => "Inactive",
            Self::Pending => "Pending",
            Self::Discharged => "Discharged",
            Self::Deceased => "Deceased",
        }
    }

    /// Any of the `Active*` variants.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active | Self::ActiveGeri | Self::ActivePcp)
    }
}

impl Default for PatientStatus {
    fn default() -> Self {
        Self::Active
    }
}

impl std::fmt::Display for PatientStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PatientStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "Active" => Ok(Self::Active),
            "Active-Geri" => Ok(Self::ActiveGeri),
            "Active-PCP" => Ok(Self::ActivePcp),
            "Inactive" => Ok(Self::Inactive),
            "Pending" => Ok(Self::Pending),
            "Discharged" => Ok(Self::Discharged),
            "Deceased" => Ok(Self::Deceased),
            other => Err(ValidationError::InvalidValue {
                field: "status",
                value: other.to_string(),
            }),
        }
    }
}

/// Postal address as captured at intake.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Address {
    pub street: String,
    pub city: String,
    pub state: String,
    pub zip: String,
}

/// Clinical flags that decide specialist requirements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClinicalFlags {
    pub hypertension: bool,
    pub mental_health_concerns: bool,
    pub dementia: bool,
}

/// Intake document checklist carried from onboarding into the patient row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentFlags {
    pub medical_records_requested: bool,
    pub referral_documents_received: bool,
    pub insurance_cards_received: bool,
    pub signature_received: bool,
}

/// A row of the canonical `patients` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patient {
    pub patient_id: i64,
    pub first_name: String,
    pub last_name: String,
    pub date_of_birth: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_primary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub address: Address,
    pub status: PatientStatus,
    pub clinical: ClinicalFlags,
    pub documents: DocumentFlags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enrollment_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discharge_date: Option<NaiveDate>,
    pub created_date: DateTime<Utc>,
    pub updated_date: DateTime<Utc>,
}

impl Patient {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

/// Fields for inserting a patient directly (Data Entry path and handoff).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPatient {
    pub first_name: String,
    pub last_name: String,
    pub date_of_birth: NaiveDate,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub phone_primary: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub emergency_contact_name: Option<String>,
    #[serde(default)]
    pub emergency_contact_phone: Option<String>,
    pub address: Address,
    #[serde(default)]
    pub insurance_primary: Option<String>,
    #[serde(default)]
    pub insurance_policy_number: Option<String>,
    #[serde(default)]
    pub status: PatientStatus,
    #[serde(default)]
    pub clinical: ClinicalFlags,
    #[serde(default)]
    pub documents: DocumentFlags,
    #[serde(default)]
    pub enrollment_date: Option<NaiveDate>,
}

impl NewPatient {
    /// Minimal patient for seeding and tests.
    pub fn new(
        first_name: impl Into<String>,
        last_name: impl Into<String>,
        date_of_birth: NaiveDate,
        zip: impl Into<String>,
    ) -> Self {
        Self {
            first_name: first_name.into(),
            last_name: last_name.into(),
            date_of_birth,
            gender: None,
            phone_primary: None,
            email: None,
            emergency_contact_name: None,
            emergency_contact_phone: None,
            address: Address {
                zip: zip.into(),
                ..Default::default()
            },
            insurance_primary: None,
            insurance_policy_number: None,
            status: PatientStatus::Active,
            clinical: ClinicalFlags::default(),
            documents: DocumentFlags::default(),
            enrollment_date: None,
        }
    }

    /// Names required; birth date may not be after `today`.
    pub fn validate(&self, today: NaiveDate) -> Result<(), ValidationError> {
        if self.first_name.trim().is_empty() {
            return Err(ValidationError::MissingField { field: "first_name" });
        }
        if self.last_name.trim().is_empty() {
            return Err(ValidationError::MissingField { field: "last_name" });
        }
        if self.date_of_birth > today {
            return Err(ValidationError::InvalidValue {
                field: "date_of_birth",
                value: self.date_of_birth.to_string(),
            });
        }
        Ok(())
    }
}

/// One selectable patient status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusType {
    pub status: PatientStatus,
    pub active: bool,
}

/// A patient on a staff member's caseload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatientAssignment {
    pub user_id: i64,
    pub patient_id: i64,
    pub patient_name: String,
    pub status: PatientStatus,
    pub address: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_primary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub assignment_date: DateTime<Utc>,
}

/// A staff user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub user_id: i64,
    pub username: String,
    pub full_name: String,
    pub roles: Vec<Role>,
}

/// Fields for creating a staff user.
#[derive(Debug, Clone, Deserialize)]
pub struct NewUser {
    pub username: String,
    pub full_name: String,
    #[serde(default)]
    pub roles: Vec<Role>,
}

impl NewUser {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.username.trim().is_empty() {
            return Err(ValidationError::MissingField { field: "username" });
        }
        if self.full_name.trim().is_empty() {
            return Err(ValidationError::MissingField { field: "full_name" });
        }
        if self.roles.is_empty() {
            return Err(ValidationError::MissingField { field: "roles" });
        }
        Ok(())
    }
}

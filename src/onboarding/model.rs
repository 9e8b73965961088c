//! Onboarding records, tasks, and the per-stage forms.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::patients::{Address, ClinicalFlags, DocumentFlags};

use super::state::{OnboardingStage, StageFlags};

/// Referral data captured at registration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntakeData {
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub date_of_birth: Option<NaiveDate>,
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
    #[serde(default)]
    pub address: Address,
    #[serde(default)]
    pub insurance_provider: Option<String>,
    #[serde(default)]
    pub policy_number: Option<String>,
    #[serde(default)]
    pub group_number: Option<String>,
    #[serde(default)]
    pub referral_source: Option<String>,
    #[serde(default)]
    pub referring_provider: Option<String>,
    #[serde(default)]
    pub referral_date: Option<NaiveDate>,
    #[serde(default)]
    pub facility_assignment: Option<String>,
}

impl IntakeData {
    /// Check required registration fields. Runs before any write.
    pub fn validate(&self) -> Result<(), ValidationError> {
        fn blank(s: &str) -> bool {
            s.trim().is_empty()
        }

        if blank(&self.first_name) {
            return Err(ValidationError::MissingField { field: "first_name" });
        }
        if blank(&self.last_name) {
            return Err(ValidationError::MissingField { field: "last_name" });
        }
        if self.date_of_birth.is_none() {
            return Err(ValidationError::MissingField {
                field: "date_of_birth",
            });
        }
        if self.phone_primary.as_deref().is_none_or(blank) {
            return Err(ValidationError::MissingField {
                field: "phone_primary",
            });
        }
        if blank(&self.address.street) {
            return Err(ValidationError::MissingField {
                field: "address_street",
            });
        }
        if blank(&self.address.city) {
            return Err(ValidationError::MissingField {
                field: "address_city",
            });
        }
        if blank(&self.address.zip) {
            return Err(ValidationError::MissingField {
                field: "address_zip",
            });
        }
        Ok(())
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name.trim(), self.last_name.trim())
    }
}

/// Outcome of the insurance eligibility check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EligibilityStatus {
    Eligible,
    #[serde(rename = "Not Eligible")]
    NotEligible,
    #[serde(rename = "Pending Verification")]
    PendingVerification,
    #[serde(rename = "Needs Follow-up")]
    NeedsFollowUp,
}

impl EligibilityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eligible => "Eligible",
            Self::NotEligible => "Not Eligible",
            Self::PendingVerification => "Pending Verification",
            Self::NeedsFollowUp => "Needs Follow-up",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        match s {
            "Eligible" => Ok(Self::Eligible),
            "Not Eligible" => Ok(Self::NotEligible),
            "Pending Verification" => Ok(Self::PendingVerification),
            "Needs Follow-up" => Ok(Self::NeedsFollowUp),
            other => Err(ValidationError::InvalidValue {
                field: "eligibility_status",
                value: other.to_string(),
            }),
        }
    }
}

impl Default for EligibilityStatus {
    fn default() -> Self {
        Self::PendingVerification
    }
}

/// Stage 2 form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EligibilityForm {
    #[serde(default)]
    pub status: EligibilityStatus,
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Stage 3 form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartCreationForm {
    #[serde(default)]
    pub chart_created: bool,
    #[serde(default)]
    pub chart_id: Option<String>,
    #[serde(default)]
    pub facility_confirmed: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Stage 4 form: document checklist, prescreen call, clinical flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntakeChecklist {
    #[serde(flatten)]
    pub documents: DocumentFlags,
    #[serde(default)]
    pub prescreen_completed: bool,
    #[serde(default)]
    pub patient_contacted: bool,
    #[serde(flatten)]
    pub clinical: ClinicalFlags,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Stage 5 form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TvSchedulingForm {
    #[serde(default)]
    pub tv_scheduled: bool,
    #[serde(default)]
    pub tv_date: Option<NaiveDate>,
    #[serde(default)]
    pub tv_time: Option<NaiveTime>,
    #[serde(default)]
    pub assigned_pcpm_user_id: Option<i64>,
    #[serde(default)]
    pub patient_notified: bool,
    #[serde(default)]
    pub handoff_notes: Option<String>,
}

/// A form submitted against one stage. Stage 1 has no form: it completes
/// at registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StageSubmission {
    Eligibility(EligibilityForm),
    ChartCreation(ChartCreationForm),
    Intake(IntakeChecklist),
    TvScheduling(TvSchedulingForm),
}

impl StageSubmission {
    pub fn stage(&self) -> u8 {
        match self {
            Self::Eligibility(_) => 2,
            Self::ChartCreation(_) => 3,
            Self::Intake(_) => 4,
            Self::TvScheduling(_) => 5,
        }
    }

    /// The completion gate for this stage.
    ///
    /// Stage 4 only requires the prescreen call and referral documents; the
    /// other checklist items are recorded but never block completion.
    pub fn check_gate(&self) -> Result<(), ValidationError> {
        let (ok, reason) = match self {
            Self::Eligibility(f) => (
                f.status == EligibilityStatus::Eligible && f.verified,
                "eligibility must be verified with status Eligible",
            ),
            Self::ChartCreation(f) => (
                f.chart_created && f.facility_confirmed,
                "chart must be created and facility assignment confirmed",
            ),
            Self::Intake(f) => (
                f.prescreen_completed && f.documents.referral_documents_received,
                "prescreen call and referral documents are required",
            ),
            Self::TvScheduling(f) => (
                f.tv_scheduled && f.patient_notified,
                "TV visit must be scheduled and the patient notified",
            ),
        };
        if ok {
            Ok(())
        } else {
            Err(ValidationError::GateNotMet {
                stage: self.stage(),
                reason,
            })
        }
    }
}

/// Status of a workflow instance row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowStatus {
    #[serde(rename = "In Progress")]
    InProgress,
    Completed,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "In Progress",
            Self::Completed => "Completed",
        }
    }
}

/// A patient moving through onboarding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnboardingRecord {
    pub onboarding_id: i64,
    pub workflow_instance_id: i64,
    pub intake: IntakeData,
    pub flags: StageFlags,
    pub eligibility: EligibilityForm,
    pub chart: ChartCreationForm,
    pub checklist: IntakeChecklist,
    pub tv: TvSchedulingForm,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_pot_user_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patient_id: Option<i64>,
    pub created_date: DateTime<Utc>,
    pub updated_date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_date: Option<DateTime<Utc>>,
}

impl OnboardingRecord {
    pub fn current_stage(&self) -> OnboardingStage {
        self.flags.current_stage()
    }

    pub fn is_handed_off(&self) -> bool {
        self.completed_date.is_some()
    }
}

/// Status of an onboarding task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Complete,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Complete => "Complete",
        }
    }
}

/// One checklist task created from a workflow template step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnboardingTask {
    pub task_id: i64,
    pub onboarding_id: i64,
    pub workflow_step_id: i64,
    pub task_name: String,
    pub task_stage: u8,
    pub task_order: i64,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deliverable: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_by_user_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Requested change to one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub status: TaskStatus,
    #[serde(default)]
    pub notes: Option<String>,
}

/// A row of the work queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub onboarding_id: i64,
    pub patient_name: String,
    pub flags: StageFlags,
    pub current_stage: OnboardingStage,
    pub stage_label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_pot_user_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_pot_name: Option<String>,
    pub created_date: DateTime<Utc>,
    pub updated_date: DateTime<Utc>,
}

/// Records waiting at one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCount {
    pub stage: OnboardingStage,
    pub label: String,
    pub count: u64,
}

/// Summary counts over the open queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub total_open: u64,
    pub by_stage: Vec<StageCount>,
    pub unassigned: u64,
    pub ready_for_handoff: u64,
}

/// A record with its ordered tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnboardingDetails {
    pub record: OnboardingRecord,
    pub current_stage: OnboardingStage,
    pub tasks: Vec<OnboardingTask>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intake() -> IntakeData {
        IntakeData {
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            date_of_birth: NaiveDate::from_ymd_opt(1950, 12, 10),
            phone_primary: Some("555-0100".into()),
            address: Address {
                street: "1 Main St".into(),
                city: "Springfield".into(),
                state: "CA".into(),
                zip: "94110".into(),
            },
            ..Default::default()
        }
    }

    #[test]
    fn intake_validation_names_missing_field() {
        assert!(intake().validate().is_ok());

        let mut missing_phone = intake();
        missing_phone.phone_primary = Some("  ".into());
        assert_eq!(
            missing_phone.validate(),
            Err(ValidationError::MissingField {
                field: "phone_primary"
            })
        );

        let mut missing_dob = intake();
        missing_dob.date_of_birth = None;
        assert_eq!(
            missing_dob.validate(),
            Err(ValidationError::MissingField {
                field: "date_of_birth"
            })
        );
    }

    #[test]
    fn eligibility_gate_requires_status_and_verification() {
        let verified_only = StageSubmission::Eligibility(EligibilityForm {
            status: EligibilityStatus::NeedsFollowUp,
            verified: true,
            notes: None,
        });
        assert!(matches!(
            verified_only.check_gate(),
            Err(ValidationError::GateNotMet { stage: 2, .. })
        ));

        let ok = StageSubmission::Eligibility(EligibilityForm {
            status: EligibilityStatus::Eligible,
            verified: true,
            notes: None,
        });
        assert!(ok.check_gate().is_ok());
    }

    #[test]
    fn intake_gate_ignores_other_documents() {
        let mut checklist = IntakeChecklist {
            prescreen_completed: true,
            ..Default::default()
        };
        checklist.documents.referral_documents_received = true;
        // Insurance cards and signature still missing.
        assert!(StageSubmission::Intake(checklist.clone()).check_gate().is_ok());

        checklist.prescreen_completed = false;
        let err = StageSubmission::Intake(checklist).check_gate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Stage 4 cannot be completed: prescreen call and referral documents are required"
        );
    }

    #[test]
    fn submission_json_is_tagged_by_stage() {
        let json = serde_json::json!({
            "stage": "tv_scheduling",
            "tv_scheduled": true,
            "tv_date": "2026-03-02",
            "patient_notified": true
        });
        let submission: StageSubmission = serde_json::from_value(json).unwrap();
        assert_eq!(submission.stage(), 5);
        assert!(submission.check_gate().is_ok());

        let json = serde_json::json!({
            "stage": "intake",
            "referral_documents_received": true,
            "dementia": true
        });
        let submission: StageSubmission = serde_json::from_value(json).unwrap();
        match submission {
            StageSubmission::Intake(c) => {
                assert!(c.documents.referral_documents_received);
                assert!(c.clinical.dementia);
                assert!(!c.prescreen_completed);
            }
            other => panic!("unexpected submission: {other:?}"),
        }
    }

    #[test]
    fn eligibility_status_strings() {
        for s in ["Eligible", "Not Eligible", "Pending Verification", "Needs Follow-up"] {
            let parsed = EligibilityStatus::parse(s).unwrap();
            assert_eq!(parsed.as_str(), s);
            assert_eq!(serde_json::to_string(&parsed).unwrap(), format!("\"{s}\""));
        }
        assert!(EligibilityStatus::parse("Maybe").is_err());
    }
}

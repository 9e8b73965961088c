//! Unified `Database` trait: one async interface for all persistence.
//!
//! Multi-statement writes (record creation, stage completion, handoff,
//! summary and cache refreshes) are single methods so a backend can run each
//! inside one transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::aggregation::model::{
    BillingCode, Granularity, RollupReport, StaffKind, SummaryRow, TaskLogEntry, TaskLogRow,
};
use crate::context::Role;
use crate::error::DatabaseError;
use crate::onboarding::model::{
    IntakeData, OnboardingRecord, OnboardingTask, QueueEntry, StageSubmission, TaskUpdate,
};
use crate::patients::{NewPatient, Patient, PatientAssignment, PatientStatus, User};
use crate::regions::model::{CountyCount, NewRegion, Region, ServiceAreaRefresh, ZipCount};

/// Backend-agnostic database trait covering staff, patients, regions,
/// onboarding, and task logs.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Staff ───────────────────────────────────────────────────────

    /// Insert a user with its roles. Returns the new user id.
    async fn create_user(
        &self,
        username: &str,
        full_name: &str,
        roles: &[Role],
    ) -> Result<i64, DatabaseError>;

    async fn get_user(&self, user_id: i64) -> Result<Option<User>, DatabaseError>;

    /// Register a user as a provider. Returns the provider id.
    async fn create_provider(&self, user_id: i64) -> Result<i64, DatabaseError>;

    /// Register a user as a coordinator. Returns the coordinator id.
    async fn create_coordinator(&self, user_id: i64) -> Result<i64, DatabaseError>;

    async fn provider_exists(&self, provider_id: i64) -> Result<bool, DatabaseError>;

    // ── Patients ────────────────────────────────────────────────────

    async fn insert_patient(
        &self,
        patient: &NewPatient,
        now: DateTime<Utc>,
    ) -> Result<i64, DatabaseError>;

    async fn get_patient(&self, patient_id: i64) -> Result<Option<Patient>, DatabaseError>;

    /// Store (or clear) a patient's region.
    async fn set_patient_region(
        &self,
        patient_id: i64,
        region_id: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Update a patient's status. `NotFound` when no such patient.
    async fn set_patient_status(
        &self,
        patient_id: i64,
        status: PatientStatus,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Put a patient on a user's caseload. Returns false if already there.
    async fn assign_user_patient(
        &self,
        user_id: i64,
        patient_id: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    async fn list_user_patient_assignments(
        &self,
        user_id: i64,
    ) -> Result<Vec<PatientAssignment>, DatabaseError>;

    // ── Regions ─────────────────────────────────────────────────────

    /// Insert a region. A second active region for the same zip is a
    /// constraint violation.
    async fn insert_region(&self, region: &NewRegion) -> Result<i64, DatabaseError>;

    async fn get_region(&self, region_id: i64) -> Result<Option<Region>, DatabaseError>;

    async fn list_active_regions(&self) -> Result<Vec<Region>, DatabaseError>;

    async fn assign_provider_region(
        &self,
        provider_id: i64,
        region_id: i64,
    ) -> Result<(), DatabaseError>;

    async fn list_provider_region_ids(&self, provider_id: i64) -> Result<Vec<i64>, DatabaseError>;

    /// Distinct non-blank counties of the provider's regions, read live.
    async fn list_provider_region_counties(
        &self,
        provider_id: i64,
    ) -> Result<Vec<String>, DatabaseError>;

    /// Rebuild both provider service-area caches in one transaction.
    async fn refresh_service_area_maps(
        &self,
        now: DateTime<Utc>,
    ) -> Result<ServiceAreaRefresh, DatabaseError>;

    /// Cached counties for a provider.
    async fn list_cached_provider_counties(
        &self,
        provider_id: i64,
    ) -> Result<Vec<CountyCount>, DatabaseError>;

    /// Cached zip codes for a provider.
    async fn list_cached_provider_zip_codes(
        &self,
        provider_id: i64,
    ) -> Result<Vec<ZipCount>, DatabaseError>;

    // ── Onboarding ──────────────────────────────────────────────────

    /// Create the workflow instance, the record (stage 1 complete) and one
    /// task per template step, atomically. Stage 1 tasks are marked complete
    /// by `created_by`.
    async fn create_onboarding(
        &self,
        intake: &IntakeData,
        assigned_user_id: Option<i64>,
        created_by: i64,
        now: DateTime<Utc>,
    ) -> Result<i64, DatabaseError>;

    async fn get_onboarding(
        &self,
        onboarding_id: i64,
    ) -> Result<Option<OnboardingRecord>, DatabaseError>;

    /// Tasks for a record in template order.
    async fn list_onboarding_tasks(
        &self,
        onboarding_id: i64,
    ) -> Result<Vec<OnboardingTask>, DatabaseError>;

    async fn get_onboarding_task(
        &self,
        task_id: i64,
    ) -> Result<Option<OnboardingTask>, DatabaseError>;

    /// Set one stage flag and stamp `updated_date`.
    async fn set_stage_complete(
        &self,
        onboarding_id: i64,
        stage: u8,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Persist a stage form, set its flag, and complete its tasks,
    /// atomically.
    async fn complete_stage(
        &self,
        onboarding_id: i64,
        submission: &StageSubmission,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Persist a stage form without touching flags.
    async fn save_stage_fields(
        &self,
        onboarding_id: i64,
        submission: &StageSubmission,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    async fn update_onboarding_task(
        &self,
        task_id: i64,
        update: &TaskUpdate,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    async fn assign_onboarding_owner(
        &self,
        onboarding_id: i64,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Records not yet handed off: furthest stage first, then newest.
    async fn list_onboarding_queue(&self) -> Result<Vec<QueueEntry>, DatabaseError>;

    /// Merge into or create the patient, link it, stamp `completed_date`,
    /// and complete the workflow instance, atomically. Returns the patient id.
    async fn complete_handoff(
        &self,
        onboarding_id: i64,
        now: DateTime<Utc>,
    ) -> Result<i64, DatabaseError>;

    // ── Task logs & summaries ───────────────────────────────────────

    /// Append log rows. Returns the number inserted.
    async fn insert_task_logs(
        &self,
        kind: StaffKind,
        entries: &[TaskLogEntry],
    ) -> Result<u64, DatabaseError>;

    async fn list_task_logs(&self, kind: StaffKind) -> Result<Vec<TaskLogRow>, DatabaseError>;

    /// Recompute every summary row of `kind`/`granularity` from the log and
    /// swap them in. The log read and the swap share one transaction, so rows
    /// ingested concurrently land either in this rebuild or the next.
    async fn rebuild_summaries(
        &self,
        kind: StaffKind,
        granularity: Granularity,
        now: DateTime<Utc>,
    ) -> Result<RollupReport, DatabaseError>;

    async fn list_summaries(
        &self,
        kind: StaffKind,
        granularity: Granularity,
        staff_id: Option<i64>,
    ) -> Result<Vec<SummaryRow>, DatabaseError>;

    async fn insert_billing_code(
        &self,
        billing_code: &str,
        description: Option<&str>,
        min_minutes: i64,
        max_minutes: i64,
    ) -> Result<i64, DatabaseError>;

    async fn list_billing_codes(&self) -> Result<Vec<BillingCode>, DatabaseError>;
}

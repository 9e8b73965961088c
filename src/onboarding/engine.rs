//! `OnboardingEngine` drives referrals through the five onboarding stages
//! and hands finished records off to the patient table.
//!
//! Every mutating call checks the caller's roles, then validates against the
//! stored record, and only then writes. Multi-row writes are single
//! `Database` calls so they commit or roll back together.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::context::{INTAKE_ROLES, ONBOARDING_ROLES, RequestContext};
use crate::error::{Error, Result, ValidationError};
use crate::store::Database;

use super::model::{
    IntakeData, OnboardingDetails, OnboardingRecord, OnboardingTask, QueueEntry, QueueStats,
    StageCount, StageSubmission, TaskUpdate,
};
use super::state::OnboardingStage;

/// Coordinates onboarding records, their stage flags, and their tasks.
pub struct OnboardingEngine {
    db: Arc<dyn Database>,
}

impl OnboardingEngine {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    async fn load(&self, onboarding_id: i64) -> Result<OnboardingRecord> {
        self.db
            .get_onboarding(onboarding_id)
            .await?
            .ok_or_else(|| Error::not_found("onboarding", onboarding_id))
    }

    /// Load a record that can still be worked on.
    async fn load_open(&self, onboarding_id: i64) -> Result<OnboardingRecord> {
        let record = self.load(onboarding_id).await?;
        if record.is_handed_off() {
            return Err(ValidationError::AlreadyHandedOff { onboarding_id }.into());
        }
        Ok(record)
    }

    async fn require_user(&self, user_id: i64) -> Result<()> {
        match self.db.get_user(user_id).await? {
            Some(_) => Ok(()),
            None => Err(Error::not_found("user", user_id)),
        }
    }

    /// Register a referral. Stage 1 is complete on return.
    pub async fn create_record(
        &self,
        ctx: &RequestContext,
        intake: &IntakeData,
        assigned_user_id: Option<i64>,
    ) -> Result<i64> {
        ctx.require_any(INTAKE_ROLES, "create onboarding records")?;
        intake.validate()?;
        if let Some(user_id) = assigned_user_id {
            self.require_user(user_id).await?;
        }

        let onboarding_id = self
            .db
            .create_onboarding(intake, assigned_user_id, ctx.user_id, Utc::now())
            .await?;

        info!(
            request_id = %ctx.request_id,
            onboarding_id,
            created_by = ctx.user_id,
            patient = %intake.full_name(),
            "Onboarding record created"
        );
        Ok(onboarding_id)
    }

    /// Set a stage flag without checking the stage's form gate.
    ///
    /// Returns `false` when the stage was already complete.
    pub async fn advance_stage(
        &self,
        ctx: &RequestContext,
        onboarding_id: i64,
        stage: u8,
    ) -> Result<bool> {
        ctx.require_any(ONBOARDING_ROLES, "advance onboarding stages")?;
        let record = self.load_open(onboarding_id).await?;

        let mut flags = record.flags;
        if !flags.complete(stage)? {
            return Ok(false);
        }
        self.db
            .set_stage_complete(onboarding_id, stage, Utc::now())
            .await?;

        info!(
            request_id = %ctx.request_id,
            onboarding_id,
            stage,
            current = %flags.current_stage(),
            "Onboarding stage advanced"
        );
        Ok(true)
    }

    /// Submit the current stage's form: gate, persist, flag, and close the
    /// stage's tasks. Returns the record's new current stage.
    pub async fn complete_stage(
        &self,
        ctx: &RequestContext,
        onboarding_id: i64,
        submission: &StageSubmission,
    ) -> Result<OnboardingStage> {
        ctx.require_any(ONBOARDING_ROLES, "complete onboarding stages")?;
        let record = self.load_open(onboarding_id).await?;
        check_targets_current(&record, submission)?;

        if let Err(err) = submission.check_gate() {
            warn!(
                request_id = %ctx.request_id,
                onboarding_id,
                stage = submission.stage(),
                error = %err,
                "Stage gate not met"
            );
            return Err(err.into());
        }
        if let StageSubmission::TvScheduling(form) = submission {
            if let Some(pcpm) = form.assigned_pcpm_user_id {
                self.require_user(pcpm).await?;
            }
        }

        self.db
            .complete_stage(onboarding_id, submission, ctx.user_id, Utc::now())
            .await?;

        let mut flags = record.flags;
        flags.complete(submission.stage())?;
        let current = flags.current_stage();
        info!(
            request_id = %ctx.request_id,
            onboarding_id,
            stage = submission.stage(),
            current = %current,
            "Onboarding stage completed"
        );
        Ok(current)
    }

    /// Persist the current stage's form without completing it.
    pub async fn save_progress(
        &self,
        ctx: &RequestContext,
        onboarding_id: i64,
        submission: &StageSubmission,
    ) -> Result<()> {
        ctx.require_any(ONBOARDING_ROLES, "save onboarding progress")?;
        let record = self.load_open(onboarding_id).await?;
        check_targets_current(&record, submission)?;

        self.db
            .save_stage_fields(onboarding_id, submission, Utc::now())
            .await?;
        info!(
            request_id = %ctx.request_id,
            onboarding_id,
            stage = submission.stage(),
            "Onboarding progress saved"
        );
        Ok(())
    }

    /// Change one task's status. Never moves the parent record's stage.
    pub async fn update_task_status(
        &self,
        ctx: &RequestContext,
        task_id: i64,
        update: &TaskUpdate,
    ) -> Result<OnboardingTask> {
        ctx.require_any(ONBOARDING_ROLES, "update onboarding tasks")?;
        if self.db.get_onboarding_task(task_id).await?.is_none() {
            return Err(Error::not_found("onboarding task", task_id));
        }

        self.db
            .update_onboarding_task(task_id, update, ctx.user_id, Utc::now())
            .await?;
        info!(
            request_id = %ctx.request_id,
            task_id,
            status = update.status.as_str(),
            "Onboarding task updated"
        );

        self.db
            .get_onboarding_task(task_id)
            .await?
            .ok_or_else(|| Error::not_found("onboarding task", task_id))
    }

    /// Reassign the owning staff member, at any stage.
    pub async fn assign_owner(
        &self,
        ctx: &RequestContext,
        onboarding_id: i64,
        user_id: i64,
    ) -> Result<()> {
        ctx.require_any(ONBOARDING_ROLES, "assign onboarding owners")?;
        self.load(onboarding_id).await?;
        self.require_user(user_id).await?;

        self.db
            .assign_onboarding_owner(onboarding_id, user_id, Utc::now())
            .await?;
        info!(
            request_id = %ctx.request_id,
            onboarding_id,
            owner = user_id,
            "Onboarding owner assigned"
        );
        Ok(())
    }

    /// Open records, furthest along first, newest first within a tier.
    pub async fn list_queue(&self) -> Result<Vec<QueueEntry>> {
        Ok(self.db.list_onboarding_queue().await?)
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        let queue = self.list_queue().await?;
        Ok(summarize_queue(&queue))
    }

    pub async fn details(&self, onboarding_id: i64) -> Result<OnboardingDetails> {
        let record = self.load(onboarding_id).await?;
        let tasks = self.db.list_onboarding_tasks(onboarding_id).await?;
        Ok(OnboardingDetails {
            current_stage: record.current_stage(),
            record,
            tasks,
        })
    }

    /// Move a finished record into the patient table. Returns the patient id.
    pub async fn complete_handoff(&self, ctx: &RequestContext, onboarding_id: i64) -> Result<i64> {
        ctx.require_any(ONBOARDING_ROLES, "complete onboarding handoffs")?;
        let record = self.load_open(onboarding_id).await?;
        if let Some(missing) = record.flags.first_missing() {
            return Err(ValidationError::HandoffNotReady {
                onboarding_id,
                missing,
            }
            .into());
        }

        let patient_id = self.db.complete_handoff(onboarding_id, Utc::now()).await?;
        info!(
            request_id = %ctx.request_id,
            onboarding_id,
            patient_id,
            merged = record.patient_id == Some(patient_id),
            "Onboarding handed off"
        );
        Ok(patient_id)
    }
}

fn check_targets_current(
    record: &OnboardingRecord,
    submission: &StageSubmission,
) -> std::result::Result<(), ValidationError> {
    let current = record.current_stage().number();
    if submission.stage() != current {
        return Err(ValidationError::WrongStage {
            submitted: submission.stage(),
            current,
        });
    }
    Ok(())
}

fn summarize_queue(queue: &[QueueEntry]) -> QueueStats {
    let by_stage = OnboardingStage::ALL
        .iter()
        .skip(1)
        .map(|stage| StageCount {
            stage: *stage,
            label: stage.label().to_string(),
            count: queue.iter().filter(|e| e.current_stage == *stage).count() as u64,
        })
        .collect();

    QueueStats {
        total_open: queue.len() as u64,
        by_stage,
        unassigned: queue
            .iter()
            .filter(|e| e.assigned_pot_user_id.is_none())
            .count() as u64,
        ready_for_handoff: queue
            .iter()
            .filter(|e| e.current_stage == OnboardingStage::HandoffReady)
            .count() as u64,
    }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, TimeZone};

    use super::*;
    use crate::context::Role;
    use crate::error::DatabaseError;
    use crate::onboarding::model::{
        ChartCreationForm, EligibilityForm, EligibilityStatus, IntakeChecklist, TaskStatus,
        TvSchedulingForm,
    };
    use crate::patients::{Address, DocumentFlags};
    use crate::store::LibSqlBackend;

    async fn setup() -> (OnboardingEngine, Arc<dyn Database>, RequestContext) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let user_id = db
            .create_user("pot", "Pat Pot", &[Role::Onboarding])
            .await
            .unwrap();
        let ctx = RequestContext::new(user_id, [Role::Onboarding]);
        (OnboardingEngine::new(Arc::clone(&db)), db, ctx)
    }

    fn intake(first: &str) -> IntakeData {
        IntakeData {
            first_name: first.into(),
            last_name: "Referral".into(),
            date_of_birth: NaiveDate::from_ymd_opt(1940, 2, 3),
            phone_primary: Some("555-0199".into()),
            address: Address {
                street: "1 Main St".into(),
                city: "Oakland".into(),
                state: "CA".into(),
                zip: "94607".into(),
            },
            ..Default::default()
        }
    }

    fn eligible() -> StageSubmission {
        StageSubmission::Eligibility(EligibilityForm {
            status: EligibilityStatus::Eligible,
            verified: true,
            notes: None,
        })
    }

    fn chart() -> StageSubmission {
        StageSubmission::ChartCreation(ChartCreationForm {
            chart_created: true,
            chart_id: Some("EMR-77".into()),
            facility_confirmed: true,
            notes: None,
        })
    }

    fn checklist() -> StageSubmission {
        StageSubmission::Intake(IntakeChecklist {
            documents: DocumentFlags {
                referral_documents_received: true,
                ..Default::default()
            },
            prescreen_completed: true,
            ..Default::default()
        })
    }

    fn tv() -> StageSubmission {
        StageSubmission::TvScheduling(TvSchedulingForm {
            tv_scheduled: true,
            tv_date: NaiveDate::from_ymd_opt(2024, 5, 1),
            patient_notified: true,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_new_record_waits_on_eligibility() {
        let (engine, _db, ctx) = setup().await;
        let id = engine.create_record(&ctx, &intake("Ada"), None).await.unwrap();

        let queue = engine.list_queue().await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].onboarding_id, id);
        assert_eq!(queue[0].current_stage, OnboardingStage::EligibilityVerification);
        assert_eq!(queue[0].stage_label, "Eligibility Verification");
    }

    #[tokio::test]
    async fn test_create_validates_before_writing() {
        let (engine, _db, ctx) = setup().await;
        let mut missing_phone = intake("Ada");
        missing_phone.phone_primary = Some("  ".into());

        let err = engine.create_record(&ctx, &missing_phone, None).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::MissingField {
                field: "phone_primary"
            })
        ));
        assert!(engine.list_queue().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_requires_intake_role() {
        let (engine, _db, _ctx) = setup().await;
        let provider = RequestContext::new(1, [Role::CareProvider]);
        let err = engine.create_record(&provider, &intake("Ada"), None).await.unwrap_err();
        assert!(matches!(err, Error::PermissionDenied { .. }));

        let err = engine
            .create_record(&RequestContext::new(1, [Role::DataEntry]), &intake("Ada"), Some(404))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Database(DatabaseError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_full_flow_to_handoff() {
        let (engine, db, ctx) = setup().await;
        let id = engine.create_record(&ctx, &intake("Grace"), Some(ctx.user_id)).await.unwrap();

        assert_eq!(
            engine.complete_stage(&ctx, id, &eligible()).await.unwrap(),
            OnboardingStage::ChartCreation
        );
        assert_eq!(
            engine.complete_stage(&ctx, id, &chart()).await.unwrap(),
            OnboardingStage::IntakeProcessing
        );
        assert_eq!(
            engine.complete_stage(&ctx, id, &checklist()).await.unwrap(),
            OnboardingStage::TvScheduling
        );
        assert_eq!(
            engine.complete_stage(&ctx, id, &tv()).await.unwrap(),
            OnboardingStage::HandoffReady
        );

        let stats = engine.queue_stats().await.unwrap();
        assert_eq!(stats.total_open, 1);
        assert_eq!(stats.ready_for_handoff, 1);

        let details = engine.details(id).await.unwrap();
        assert!(details.tasks.iter().all(|t| t.status == TaskStatus::Complete));

        let patient_id = engine.complete_handoff(&ctx, id).await.unwrap();
        let patient = db.get_patient(patient_id).await.unwrap().unwrap();
        assert_eq!(patient.first_name, "Grace");
        assert!(patient.documents.referral_documents_received);
        assert!(engine.list_queue().await.unwrap().is_empty());

        let err = engine.complete_handoff(&ctx, id).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::AlreadyHandedOff { .. })
        ));
        let err = engine.advance_stage(&ctx, id, 5).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::AlreadyHandedOff { .. })
        ));
    }

    #[tokio::test]
    async fn test_gates_report_specific_messages() {
        let (engine, _db, ctx) = setup().await;
        let id = engine.create_record(&ctx, &intake("Gate"), None).await.unwrap();

        let pending = StageSubmission::Eligibility(EligibilityForm {
            status: EligibilityStatus::Eligible,
            verified: false,
            notes: None,
        });
        let err = engine.complete_stage(&ctx, id, &pending).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Validation failed: Stage 2 cannot be completed: eligibility must be verified with status Eligible"
        );

        let err = engine.complete_stage(&ctx, id, &chart()).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::WrongStage {
                submitted: 3,
                current: 2
            })
        ));

        engine.complete_stage(&ctx, id, &eligible()).await.unwrap();
        engine.complete_stage(&ctx, id, &chart()).await.unwrap();

        // Only prescreen and referral documents gate stage 4.
        let partial = StageSubmission::Intake(IntakeChecklist {
            prescreen_completed: true,
            patient_contacted: true,
            documents: DocumentFlags {
                medical_records_requested: true,
                insurance_cards_received: true,
                signature_received: true,
                referral_documents_received: false,
            },
            ..Default::default()
        });
        let err = engine.complete_stage(&ctx, id, &partial).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::GateNotMet { stage: 4, .. })
        ));
        assert_eq!(
            engine.complete_stage(&ctx, id, &checklist()).await.unwrap(),
            OnboardingStage::TvScheduling
        );
    }

    #[tokio::test]
    async fn test_advance_stage_is_ordered_and_idempotent() {
        let (engine, _db, ctx) = setup().await;
        let id = engine.create_record(&ctx, &intake("Adv"), None).await.unwrap();

        let err = engine.advance_stage(&ctx, id, 3).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::StageOutOfOrder {
                stage: 3,
                required: 2
            })
        ));
        let err = engine.advance_stage(&ctx, id, 6).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::InvalidValue { field: "stage", .. })
        ));

        assert!(!engine.advance_stage(&ctx, id, 1).await.unwrap());
        assert!(engine.advance_stage(&ctx, id, 2).await.unwrap());
        assert!(!engine.advance_stage(&ctx, id, 2).await.unwrap());
        assert_eq!(
            engine.details(id).await.unwrap().current_stage,
            OnboardingStage::ChartCreation
        );
    }

    #[tokio::test]
    async fn test_handoff_requires_every_stage() {
        let (engine, _db, ctx) = setup().await;
        let id = engine.create_record(&ctx, &intake("Early"), None).await.unwrap();
        engine.advance_stage(&ctx, id, 2).await.unwrap();

        let err = engine.complete_handoff(&ctx, id).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::HandoffNotReady { missing: 3, .. })
        ));
        assert_eq!(engine.list_queue().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_queue_ranks_progress_over_recency() {
        let (engine, db, ctx) = setup().await;
        let at = |day| Utc.with_ymd_and_hms(2024, 1, day, 8, 0, 0).unwrap();

        let mut ids = Vec::new();
        for (day, stages) in [(1, 1u8), (2, 3), (3, 5), (4, 5)] {
            let id = db
                .create_onboarding(&intake("Q"), None, ctx.user_id, at(day))
                .await
                .unwrap();
            for stage in 2..=stages {
                db.set_stage_complete(id, stage, at(day)).await.unwrap();
            }
            ids.push(id);
        }

        let order: Vec<i64> = engine
            .list_queue()
            .await
            .unwrap()
            .iter()
            .map(|e| e.onboarding_id)
            .collect();
        assert_eq!(order, vec![ids[3], ids[2], ids[1], ids[0]]);

        let stats = engine.queue_stats().await.unwrap();
        assert_eq!(stats.total_open, 4);
        assert_eq!(stats.unassigned, 4);
        assert_eq!(stats.ready_for_handoff, 2);
        let eligibility = stats
            .by_stage
            .iter()
            .find(|c| c.stage == OnboardingStage::EligibilityVerification)
            .unwrap();
        assert_eq!(eligibility.count, 1);
    }

    #[tokio::test]
    async fn test_task_update_leaves_stage_alone() {
        let (engine, _db, ctx) = setup().await;
        let id = engine.create_record(&ctx, &intake("Tasks"), None).await.unwrap();
        let details = engine.details(id).await.unwrap();
        let stage_two: Vec<_> = details.tasks.iter().filter(|t| t.task_stage == 2).collect();

        for task in &stage_two {
            let update = TaskUpdate {
                status: TaskStatus::Complete,
                notes: None,
            };
            let stored = engine.update_task_status(&ctx, task.task_id, &update).await.unwrap();
            assert_eq!(stored.completed_by_user_id, Some(ctx.user_id));
        }
        assert_eq!(
            engine.details(id).await.unwrap().current_stage,
            OnboardingStage::EligibilityVerification
        );

        let update = TaskUpdate {
            status: TaskStatus::Complete,
            notes: None,
        };
        let err = engine.update_task_status(&ctx, 9999, &update).await.unwrap_err();
        assert!(matches!(err, Error::Database(DatabaseError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_assign_owner_checks_user() {
        let (engine, db, ctx) = setup().await;
        let id = engine.create_record(&ctx, &intake("Owner"), None).await.unwrap();
        let other = db
            .create_user("cc", "Cam Coord", &[Role::CareCoordinator])
            .await
            .unwrap();

        engine.assign_owner(&ctx, id, other).await.unwrap();
        let queue = engine.list_queue().await.unwrap();
        assert_eq!(queue[0].assigned_pot_name.as_deref(), Some("Cam Coord"));

        let err = engine.assign_owner(&ctx, id, 999).await.unwrap_err();
        assert!(matches!(err, Error::Database(DatabaseError::NotFound { .. })));
        let err = engine.assign_owner(&ctx, 999, other).await.unwrap_err();
        assert!(matches!(err, Error::Database(DatabaseError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_save_progress_keeps_stage() {
        let (engine, _db, ctx) = setup().await;
        let id = engine.create_record(&ctx, &intake("Draft"), None).await.unwrap();
        let draft = StageSubmission::Eligibility(EligibilityForm {
            status: EligibilityStatus::NeedsFollowUp,
            verified: false,
            notes: Some("waiting on payer".into()),
        });
        engine.save_progress(&ctx, id, &draft).await.unwrap();

        let details = engine.details(id).await.unwrap();
        assert_eq!(details.current_stage, OnboardingStage::EligibilityVerification);
        assert_eq!(details.record.eligibility.status, EligibilityStatus::NeedsFollowUp);

        let err = engine.save_progress(&ctx, id, &tv()).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::WrongStage { .. })
        ));
    }
}

//! `PatientRegistry`: direct patient entry, status changes, caseloads, and
//! staff records.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use crate::context::{ADMIN_ROLES, PATIENT_ROLES, RequestContext, Role};
use crate::error::{Error, Result, ValidationError};
use crate::store::Database;

use super::model::{
    NewPatient, NewUser, Patient, PatientAssignment, PatientStatus, StatusType, User,
};

pub struct PatientRegistry {
    db: Arc<dyn Database>,
}

impl PatientRegistry {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    pub async fn get(&self, patient_id: i64) -> Result<Patient> {
        self.db
            .get_patient(patient_id)
            .await?
            .ok_or_else(|| Error::not_found("patient", patient_id))
    }

    pub async fn get_user(&self, user_id: i64) -> Result<User> {
        self.db
            .get_user(user_id)
            .await?
            .ok_or_else(|| Error::not_found("user", user_id))
    }

    /// Insert a patient without going through onboarding.
    pub async fn create(&self, ctx: &RequestContext, patient: &NewPatient) -> Result<i64> {
        ctx.require_any(PATIENT_ROLES, "create patients")?;
        patient.validate(Utc::now().date_naive())?;

        let patient_id = self.db.insert_patient(patient, Utc::now()).await?;
        info!(
            request_id = %ctx.request_id,
            patient_id,
            created_by = ctx.user_id,
            status = %patient.status,
            "Patient created"
        );
        Ok(patient_id)
    }

    /// Change a patient's status. Unknown status names are rejected.
    pub async fn update_status(
        &self,
        ctx: &RequestContext,
        patient_id: i64,
        status: &str,
    ) -> Result<Patient> {
        ctx.require_any(PATIENT_ROLES, "change patient status")?;
        let status: PatientStatus = status.parse()?;
        let before = self.get(patient_id).await?;

        if before.status != status {
            self.db
                .set_patient_status(patient_id, status, Utc::now())
                .await?;
            info!(
                request_id = %ctx.request_id,
                patient_id,
                from = %before.status,
                to = %status,
                "Patient status changed"
            );
        }
        self.get(patient_id).await
    }

    pub fn status_types(&self) -> Vec<StatusType> {
        PatientStatus::ALL
            .into_iter()
            .map(|status| StatusType {
                status,
                active: status.is_active(),
            })
            .collect()
    }

    /// Add an active patient to a user's caseload.
    ///
    /// Returns `false` when the patient was already assigned.
    pub async fn assign_user(
        &self,
        ctx: &RequestContext,
        patient_id: i64,
        user_id: i64,
    ) -> Result<bool> {
        ctx.require_any(PATIENT_ROLES, "assign patients")?;
        let patient = self.get(patient_id).await?;
        self.get_user(user_id).await?;
        if !patient.status.is_active() {
            return Err(ValidationError::InvalidValue {
                field: "status",
                value: patient.status.to_string(),
            }
            .into());
        }

        let added = self
            .db
            .assign_user_patient(user_id, patient_id, Utc::now())
            .await?;
        if added {
            info!(request_id = %ctx.request_id, patient_id, user_id, "Patient assigned");
        }
        Ok(added)
    }

    pub async fn assignments(&self, user_id: i64) -> Result<Vec<PatientAssignment>> {
        self.get_user(user_id).await?;
        Ok(self.db.list_user_patient_assignments(user_id).await?)
    }

    pub async fn create_user(&self, ctx: &RequestContext, user: &NewUser) -> Result<i64> {
        ctx.require_any(ADMIN_ROLES, "create users")?;
        user.validate()?;
        let user_id = self
            .db
            .create_user(user.username.trim(), user.full_name.trim(), &user.roles)
            .await?;
        info!(
            request_id = %ctx.request_id,
            user_id,
            username = %user.username.trim(),
            roles = ?user.roles,
            "User created"
        );
        Ok(user_id)
    }

    /// Register a user holding `care_provider` as a provider.
    pub async fn create_provider(&self, ctx: &RequestContext, user_id: i64) -> Result<i64> {
        ctx.require_any(ADMIN_ROLES, "register providers")?;
        self.require_role(user_id, Role::CareProvider).await?;
        let provider_id = self.db.create_provider(user_id).await?;
        info!(request_id = %ctx.request_id, user_id, provider_id, "Provider registered");
        Ok(provider_id)
    }

    /// Register a user holding `care_coordinator` as a coordinator.
    pub async fn create_coordinator(&self, ctx: &RequestContext, user_id: i64) -> Result<i64> {
        ctx.require_any(ADMIN_ROLES, "register coordinators")?;
        self.require_role(user_id, Role::CareCoordinator).await?;
        let coordinator_id = self.db.create_coordinator(user_id).await?;
        info!(
            request_id = %ctx.request_id,
            user_id,
            coordinator_id,
            "Coordinator registered"
        );
        Ok(coordinator_id)
    }

    async fn require_role(&self, user_id: i64, role: Role) -> Result<()> {
        let user = self.get_user(user_id).await?;
        if user.roles.contains(&role) {
            Ok(())
        } else {
            Err(ValidationError::InvalidValue {
                field: "roles",
                value: format!("user {user_id} lacks {role}"),
            }
            .into())
        }
    }
}

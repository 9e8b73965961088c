//! libSQL backend for the async `Database` trait.
//!
//! Supports local file and in-memory databases. A single connection is
//! shared behind `lock`: writes hold the write guard across `BEGIN IMMEDIATE`
//! and `COMMIT` (rolling back on the first error) and reads hold a read guard,
//! so a reader never observes a half-applied transaction.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use libsql::params::IntoParams;
use libsql::{Connection, Database as LibSqlDatabase, params};
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::aggregation::model::{
    BillingCode, Granularity, RollupReport, StaffKind, SummaryRow, TaskLogEntry, TaskLogRow,
};
use crate::aggregation::rollup::aggregate;
use crate::context::Role;
use crate::error::DatabaseError;
use crate::onboarding::model::{
    ChartCreationForm, EligibilityForm, EligibilityStatus, IntakeChecklist, IntakeData,
    OnboardingRecord, OnboardingTask, QueueEntry, StageSubmission, TaskStatus, TaskUpdate,
    TvSchedulingForm, WorkflowStatus,
};
use crate::onboarding::state::{StageFlags, stage_for_step_order};
use crate::patients::{
    Address, ClinicalFlags, DocumentFlags, NewPatient, Patient, PatientAssignment, PatientStatus,
    User,
};
use crate::regions::model::{
    CountyCount, NewRegion, Region, RegionStatus, ServiceAreaRefresh, ZipCount,
};
use crate::regions::zip::compare_zip_codes;
use crate::store::migrations;
use crate::store::traits::Database;

/// Template seeded by the `onboarding_workflow` migration.
const ONBOARDING_TEMPLATE_ID: i64 = 1;

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    lock: RwLock<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
            lock: RwLock::new(()),
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
            lock: RwLock::new(()),
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .map(|ndt| ndt.and_utc())
        .map_err(|e| DatabaseError::Serialization(format!("datetime '{s}': {e}")))
}

fn parse_optional_datetime(s: &Option<String>) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    s.as_deref().map(parse_datetime).transpose()
}

fn parse_date(s: &str, column: &str) -> Result<NaiveDate, DatabaseError> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| DatabaseError::Serialization(format!("{column} '{s}': {e}")))
}

fn parse_optional_date(s: Option<String>) -> Option<NaiveDate> {
    s.and_then(|s| NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok())
}

fn row_err(e: libsql::Error) -> DatabaseError {
    DatabaseError::Serialization(format!("Failed to decode row: {e}"))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Convert `Option<i64>` to libsql Value.
fn opt_int(v: Option<i64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Integer(v),
        None => libsql::Value::Null,
    }
}

fn opt_date(d: Option<NaiveDate>) -> libsql::Value {
    match d {
        Some(d) => libsql::Value::Text(d.format("%Y-%m-%d").to_string()),
        None => libsql::Value::Null,
    }
}

fn flag(b: bool) -> i64 {
    i64::from(b)
}

fn task_status_to_str(status: TaskStatus) -> &'static str {
    status.as_str()
}

fn str_to_task_status(s: &str) -> Result<TaskStatus, DatabaseError> {
    match s {
        "Pending" => Ok(TaskStatus::Pending),
        "Complete" => Ok(TaskStatus::Complete),
        other => Err(DatabaseError::Serialization(format!(
            "unknown task status '{other}'"
        ))),
    }
}

fn checked_flags(flags: StageFlags) -> Result<StageFlags, DatabaseError> {
    if !flags.is_ordered() {
        return Err(DatabaseError::Serialization(format!(
            "stage flags out of order: {:?}",
            flags.0
        )));
    }
    Ok(flags)
}

/// Column holding the flag for `stage`.
fn stage_column(stage: u8) -> Result<&'static str, DatabaseError> {
    match stage {
        1 => Ok("stage1_complete"),
        2 => Ok("stage2_complete"),
        3 => Ok("stage3_complete"),
        4 => Ok("stage4_complete"),
        5 => Ok("stage5_complete"),
        other => Err(DatabaseError::Query(format!("No stage column for stage {other}"))),
    }
}

/// Table and column names of one task log.
struct LogTable {
    table: &'static str,
    id: &'static str,
    staff: &'static str,
    minutes: &'static str,
}

fn log_table(kind: StaffKind) -> LogTable {
    match kind {
        StaffKind::Coordinator => LogTable {
            table: "coordinator_tasks",
            id: "coordinator_task_id",
            staff: "coordinator_id",
            minutes: "duration_minutes",
        },
        StaffKind::Provider => LogTable {
            table: "provider_tasks",
            id: "provider_task_id",
            staff: "provider_id",
            minutes: "minutes_of_service",
        },
    }
}

async fn begin(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute("BEGIN IMMEDIATE", ())
        .await
        .map_err(|e| DatabaseError::Query(format!("Failed to begin transaction: {e}")))?;
    Ok(())
}

/// Commit on success, roll back on failure.
async fn finish<T>(
    conn: &Connection,
    result: Result<T, DatabaseError>,
) -> Result<T, DatabaseError> {
    match result {
        Ok(value) => {
            conn.execute("COMMIT", ())
                .await
                .map_err(|e| DatabaseError::Query(format!("Failed to commit: {e}")))?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback) = conn.execute("ROLLBACK", ()).await {
                warn!(error = %rollback, "Rollback failed");
            }
            debug!(error = %err, "Transaction rolled back");
            Err(err)
        }
    }
}

/// Run a query and map every row.
async fn query_all<T>(
    conn: &Connection,
    sql: &str,
    params: impl IntoParams,
    context: &str,
    map: fn(&libsql::Row) -> Result<T, DatabaseError>,
) -> Result<Vec<T>, DatabaseError> {
    let mut rows = conn
        .query(sql, params)
        .await
        .map_err(|e| DatabaseError::Query(format!("{context}: {e}")))?;
    let mut out = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("{context}: {e}")))?
    {
        out.push(map(&row)?);
    }
    Ok(out)
}

/// Run a query and map the first row, if any.
async fn query_one<T>(
    conn: &Connection,
    sql: &str,
    params: impl IntoParams,
    context: &str,
    map: fn(&libsql::Row) -> Result<T, DatabaseError>,
) -> Result<Option<T>, DatabaseError> {
    let mut rows = conn
        .query(sql, params)
        .await
        .map_err(|e| DatabaseError::Query(format!("{context}: {e}")))?;
    match rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("{context}: {e}")))?
    {
        Some(row) => Ok(Some(map(&row)?)),
        None => Ok(None),
    }
}

fn not_found(entity: &str, id: i64) -> DatabaseError {
    DatabaseError::NotFound {
        entity: entity.to_string(),
        id: id.to_string(),
    }
}

// ── Row mappers ─────────────────────────────────────────────────────

const PATIENT_COLUMNS: &str = "patient_id, first_name, last_name, date_of_birth, gender, \
    phone_primary, email, address_street, address_city, address_state, address_zip, status, \
    medical_records_requested, referral_documents_received, insurance_cards_received, \
    emed_signature_received, hypertension, mental_health_concerns, dementia, region_id, \
    enrollment_date, discharge_date, created_date, updated_date";

fn row_to_patient(row: &libsql::Row) -> Result<Patient, DatabaseError> {
    let b = |i: i32| -> Result<bool, DatabaseError> { Ok(row.get::<i64>(i).map_err(row_err)? != 0) };
    let text = |i: i32| -> Option<String> { row.get::<String>(i).ok() };

    let dob: String = row.get(3).map_err(row_err)?;
    let status: String = row.get(11).map_err(row_err)?;
    let created: String = row.get(22).map_err(row_err)?;
    let updated: String = row.get(23).map_err(row_err)?;

    Ok(Patient {
        patient_id: row.get(0).map_err(row_err)?,
        first_name: row.get(1).map_err(row_err)?,
        last_name: row.get(2).map_err(row_err)?,
        date_of_birth: parse_date(&dob, "date_of_birth")?,
        gender: text(4),
        phone_primary: text(5),
        email: text(6),
        address: Address {
            street: text(7).unwrap_or_default(),
            city: text(8).unwrap_or_default(),
            state: text(9).unwrap_or_default(),
            zip: text(10).unwrap_or_default(),
        },
        status: PatientStatus::from_str(&status)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
        documents: DocumentFlags {
            medical_records_requested: b(12)?,
            referral_documents_received: b(13)?,
            insurance_cards_received: b(14)?,
            signature_received: b(15)?,
        },
        clinical: ClinicalFlags {
            hypertension: b(16)?,
            mental_health_concerns: b(17)?,
            dementia: b(18)?,
        },
        region_id: row.get::<i64>(19).ok(),
        enrollment_date: parse_optional_date(text(20)),
        discharge_date: parse_optional_date(text(21)),
        created_date: parse_datetime(&created)?,
        updated_date: parse_datetime(&updated)?,
    })
}

fn row_to_assignment(row: &libsql::Row) -> Result<PatientAssignment, DatabaseError> {
    let first: String = row.get(2).map_err(row_err)?;
    let last: String = row.get(3).map_err(row_err)?;
    let status: String = row.get(4).map_err(row_err)?;
    let assigned: String = row.get(11).map_err(row_err)?;
    Ok(PatientAssignment {
        user_id: row.get(0).map_err(row_err)?,
        patient_id: row.get(1).map_err(row_err)?,
        patient_name: format!("{first} {last}"),
        status: PatientStatus::from_str(&status)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
        address: Address {
            street: row.get(5).map_err(row_err)?,
            city: row.get(6).map_err(row_err)?,
            state: row.get(7).map_err(row_err)?,
            zip: row.get(8).map_err(row_err)?,
        },
        phone_primary: row.get(9).ok(),
        email: row.get(10).ok(),
        assignment_date: parse_datetime(&assigned)?,
    })
}

const REGION_COLUMNS: &str = "region_id, zip_code, city, state, county, status";

fn row_to_region(row: &libsql::Row) -> Result<Region, DatabaseError> {
    let status: String = row.get(5).map_err(row_err)?;
    Ok(Region {
        region_id: row.get(0).map_err(row_err)?,
        zip_code: row.get(1).map_err(row_err)?,
        city: row.get(2).ok(),
        state: row.get(3).ok(),
        county: row.get(4).ok(),
        status: RegionStatus::parse(&status)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
    })
}

const ONBOARDING_COLUMNS: &str = "onboarding_id, workflow_instance_id, patient_id, \
    first_name, last_name, date_of_birth, gender, phone_primary, email, \
    emergency_contact_name, emergency_contact_phone, address_street, address_city, \
    address_state, address_zip, insurance_provider, policy_number, group_number, \
    referral_source, referring_provider, referral_date, facility_assignment, \
    assigned_pot_user_id, \
    eligibility_status, eligibility_verified, eligibility_notes, \
    emed_chart_created, chart_id, facility_confirmed, chart_notes, \
    medical_records_requested, referral_documents_received, insurance_cards_received, \
    emed_signature_received, prescreen_completed, patient_contacted, hypertension, \
    mental_health_concerns, dementia, intake_notes, \
    tv_scheduled, tv_date, tv_time, assigned_pcpm_user_id, patient_notified, handoff_notes, \
    stage1_complete, stage2_complete, stage3_complete, stage4_complete, stage5_complete, \
    created_date, updated_date, completed_date";

fn row_to_onboarding(row: &libsql::Row) -> Result<OnboardingRecord, DatabaseError> {
    let b = |i: i32| -> Result<bool, DatabaseError> { Ok(row.get::<i64>(i).map_err(row_err)? != 0) };
    let text = |i: i32| -> Option<String> { row.get::<String>(i).ok() };
    let int = |i: i32| -> Option<i64> { row.get::<i64>(i).ok() };

    let intake = IntakeData {
        first_name: row.get(3).map_err(row_err)?,
        last_name: row.get(4).map_err(row_err)?,
        date_of_birth: parse_optional_date(text(5)),
        gender: text(6),
        phone_primary: text(7),
        email: text(8),
        emergency_contact_name: text(9),
        emergency_contact_phone: text(10),
        address: Address {
            street: text(11).unwrap_or_default(),
            city: text(12).unwrap_or_default(),
            state: text(13).unwrap_or_default(),
            zip: text(14).unwrap_or_default(),
        },
        insurance_provider: text(15),
        policy_number: text(16),
        group_number: text(17),
        referral_source: text(18),
        referring_provider: text(19),
        referral_date: parse_optional_date(text(20)),
        facility_assignment: text(21),
    };

    let eligibility_status = text(23).unwrap_or_default();
    let created: String = row.get(51).map_err(row_err)?;
    let updated: String = row.get(52).map_err(row_err)?;

    Ok(OnboardingRecord {
        onboarding_id: row.get(0).map_err(row_err)?,
        workflow_instance_id: row.get(1).map_err(row_err)?,
        patient_id: int(2),
        intake,
        assigned_pot_user_id: int(22),
        eligibility: EligibilityForm {
            status: EligibilityStatus::parse(&eligibility_status)
                .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
            verified: b(24)?,
            notes: text(25),
        },
        chart: ChartCreationForm {
            chart_created: b(26)?,
            chart_id: text(27),
            facility_confirmed: b(28)?,
            notes: text(29),
        },
        checklist: IntakeChecklist {
            documents: DocumentFlags {
                medical_records_requested: b(30)?,
                referral_documents_received: b(31)?,
                insurance_cards_received: b(32)?,
                signature_received: b(33)?,
            },
            prescreen_completed: b(34)?,
            patient_contacted: b(35)?,
            clinical: ClinicalFlags {
                hypertension: b(36)?,
                mental_health_concerns: b(37)?,
                dementia: b(38)?,
            },
            notes: text(39),
        },
        tv: TvSchedulingForm {
            tv_scheduled: b(40)?,
            tv_date: parse_optional_date(text(41)),
            tv_time: text(42).and_then(|t| NaiveTime::parse_from_str(&t, "%H:%M:%S").ok()),
            assigned_pcpm_user_id: int(43),
            patient_notified: b(44)?,
            handoff_notes: text(45),
        },
        flags: checked_flags(StageFlags([b(46)?, b(47)?, b(48)?, b(49)?, b(50)?]))?,
        created_date: parse_datetime(&created)?,
        updated_date: parse_datetime(&updated)?,
        completed_date: parse_optional_datetime(&text(53))?,
    })
}

const TASK_COLUMNS: &str = "ot.task_id, ot.onboarding_id, ot.workflow_step_id, ot.task_name, \
    ot.task_stage, ot.task_order, ot.status, ws.deliverable, ot.completed_by_user_id, \
    ot.completed_date, ot.notes";

fn row_to_task(row: &libsql::Row) -> Result<OnboardingTask, DatabaseError> {
    let stage: i64 = row.get(4).map_err(row_err)?;
    let status: String = row.get(6).map_err(row_err)?;
    let completed: Option<String> = row.get(9).ok();
    Ok(OnboardingTask {
        task_id: row.get(0).map_err(row_err)?,
        onboarding_id: row.get(1).map_err(row_err)?,
        workflow_step_id: row.get(2).map_err(row_err)?,
        task_name: row.get(3).map_err(row_err)?,
        task_stage: u8::try_from(stage)
            .map_err(|_| DatabaseError::Serialization(format!("task_stage {stage}")))?,
        task_order: row.get(5).map_err(row_err)?,
        status: str_to_task_status(&status)?,
        deliverable: row.get(7).ok(),
        completed_by_user_id: row.get(8).ok(),
        completed_date: parse_optional_datetime(&completed)?,
        notes: row.get(10).ok(),
    })
}

fn row_to_queue_entry(row: &libsql::Row) -> Result<QueueEntry, DatabaseError> {
    let b = |i: i32| -> Result<bool, DatabaseError> { Ok(row.get::<i64>(i).map_err(row_err)? != 0) };
    let first: String = row.get(1).map_err(row_err)?;
    let last: String = row.get(2).map_err(row_err)?;
    let flags = checked_flags(StageFlags([b(3)?, b(4)?, b(5)?, b(6)?, b(7)?]))?;
    let created: String = row.get(10).map_err(row_err)?;
    let updated: String = row.get(11).map_err(row_err)?;
    let current_stage = flags.current_stage();
    Ok(QueueEntry {
        onboarding_id: row.get(0).map_err(row_err)?,
        patient_name: format!("{first} {last}"),
        flags,
        current_stage,
        stage_label: current_stage.label().to_string(),
        assigned_pot_user_id: row.get(8).ok(),
        assigned_pot_name: row.get(9).ok(),
        created_date: parse_datetime(&created)?,
        updated_date: parse_datetime(&updated)?,
    })
}

const SUMMARY_COLUMNS: &str = "staff_kind, granularity, staff_id, year, period, period_start, \
    period_end, total_minutes, total_tasks, distinct_patients, avg_minutes_per_task, \
    minutes_per_patient";

fn row_to_summary(row: &libsql::Row) -> Result<SummaryRow, DatabaseError> {
    let kind: String = row.get(0).map_err(row_err)?;
    let granularity: String = row.get(1).map_err(row_err)?;
    let year: i64 = row.get(3).map_err(row_err)?;
    let period: i64 = row.get(4).map_err(row_err)?;
    let start: String = row.get(5).map_err(row_err)?;
    let end: String = row.get(6).map_err(row_err)?;
    let avg: String = row.get(10).map_err(row_err)?;
    let per_patient: String = row.get(11).map_err(row_err)?;
    let decimal = |s: &str| {
        Decimal::from_str(s).map_err(|e| DatabaseError::Serialization(format!("decimal '{s}': {e}")))
    };

    Ok(SummaryRow {
        staff_kind: StaffKind::parse(&kind)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
        granularity: Granularity::parse(&granularity)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
        staff_id: row.get(2).map_err(row_err)?,
        year: i32::try_from(year).map_err(|_| DatabaseError::Serialization(format!("year {year}")))?,
        period: u32::try_from(period)
            .map_err(|_| DatabaseError::Serialization(format!("period {period}")))?,
        period_start: parse_date(&start, "period_start")?,
        period_end: parse_date(&end, "period_end")?,
        total_minutes: row.get(7).map_err(row_err)?,
        total_tasks: row.get(8).map_err(row_err)?,
        distinct_patients: row.get(9).map_err(row_err)?,
        avg_minutes_per_task: decimal(&avg)?,
        minutes_per_patient: decimal(&per_patient)?,
    })
}

fn row_to_task_log(row: &libsql::Row) -> Result<TaskLogRow, DatabaseError> {
    Ok(TaskLogRow {
        task_id: row.get(0).map_err(row_err)?,
        entry: TaskLogEntry {
            staff_id: row.get(1).map_err(row_err)?,
            patient_id: row.get(2).ok(),
            task_date: row.get::<String>(3).unwrap_or_default(),
            minutes: row.get(4).ok(),
            task_description: row.get(5).ok(),
            notes: row.get(6).ok(),
        },
    })
}

fn row_to_billing_code(row: &libsql::Row) -> Result<BillingCode, DatabaseError> {
    Ok(BillingCode {
        code_id: row.get(0).map_err(row_err)?,
        billing_code: row.get(1).map_err(row_err)?,
        description: row.get(2).ok(),
        min_minutes: row.get(3).map_err(row_err)?,
        max_minutes: row.get(4).map_err(row_err)?,
    })
}

// ── Statement helpers shared by transactional methods ───────────────

async fn fetch_onboarding(
    conn: &Connection,
    onboarding_id: i64,
) -> Result<Option<OnboardingRecord>, DatabaseError> {
    query_one(
        conn,
        &format!("SELECT {ONBOARDING_COLUMNS} FROM onboarding_patients WHERE onboarding_id = ?1"),
        params![onboarding_id],
        "Failed to get onboarding record",
        row_to_onboarding,
    )
    .await
}

async fn insert_patient_row(
    conn: &Connection,
    patient: &NewPatient,
    now: DateTime<Utc>,
) -> Result<i64, DatabaseError> {
    let now = now.to_rfc3339();
    conn.execute(
        "INSERT INTO patients (first_name, last_name, date_of_birth, gender, phone_primary, email,
            emergency_contact_name, emergency_contact_phone,
            address_street, address_city, address_state, address_zip,
            insurance_primary, insurance_policy_number, status,
            medical_records_requested, referral_documents_received, insurance_cards_received,
            emed_signature_received, hypertension, mental_health_concerns, dementia,
            enrollment_date, created_date, updated_date)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
            ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?24)",
        params![
            patient.first_name.as_str(),
            patient.last_name.as_str(),
            patient.date_of_birth.format("%Y-%m-%d").to_string(),
            opt_text(patient.gender.as_deref()),
            opt_text(patient.phone_primary.as_deref()),
            opt_text(patient.email.as_deref()),
            opt_text(patient.emergency_contact_name.as_deref()),
            opt_text(patient.emergency_contact_phone.as_deref()),
            patient.address.street.as_str(),
            patient.address.city.as_str(),
            patient.address.state.as_str(),
            patient.address.zip.as_str(),
            opt_text(patient.insurance_primary.as_deref()),
            opt_text(patient.insurance_policy_number.as_deref()),
            patient.status.as_str(),
            flag(patient.documents.medical_records_requested),
            flag(patient.documents.referral_documents_received),
            flag(patient.documents.insurance_cards_received),
            flag(patient.documents.signature_received),
            flag(patient.clinical.hypertension),
            flag(patient.clinical.mental_health_concerns),
            flag(patient.clinical.dementia),
            opt_date(patient.enrollment_date),
            now
        ],
    )
    .await
    .map_err(|e| DatabaseError::from_write("Failed to insert patient", e))?;
    Ok(conn.last_insert_rowid())
}

async fn insert_onboarding_rows(
    conn: &Connection,
    intake: &IntakeData,
    assigned_user_id: Option<i64>,
    created_by: i64,
    now: DateTime<Utc>,
) -> Result<i64, DatabaseError> {
    let now = now.to_rfc3339();

    conn.execute(
        "INSERT INTO workflow_instances (template_id, status, created_at) VALUES (?1, ?2, ?3)",
        params![
            ONBOARDING_TEMPLATE_ID,
            WorkflowStatus::InProgress.as_str(),
            now.clone()
        ],
    )
    .await
    .map_err(|e| DatabaseError::from_write("Failed to create workflow instance", e))?;
    let instance_id = conn.last_insert_rowid();

    conn.execute(
        "INSERT INTO onboarding_patients (workflow_instance_id, first_name, last_name,
            date_of_birth, gender, phone_primary, email, emergency_contact_name,
            emergency_contact_phone, address_street, address_city, address_state, address_zip,
            insurance_provider, policy_number, group_number, referral_source,
            referring_provider, referral_date, facility_assignment, assigned_pot_user_id,
            stage1_complete, created_date, updated_date)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
            ?18, ?19, ?20, ?21, 1, ?22, ?22)",
        params![
            instance_id,
            intake.first_name.trim(),
            intake.last_name.trim(),
            opt_date(intake.date_of_birth),
            opt_text(intake.gender.as_deref()),
            opt_text(intake.phone_primary.as_deref()),
            opt_text(intake.email.as_deref()),
            opt_text(intake.emergency_contact_name.as_deref()),
            opt_text(intake.emergency_contact_phone.as_deref()),
            intake.address.street.as_str(),
            intake.address.city.as_str(),
            intake.address.state.as_str(),
            intake.address.zip.trim(),
            opt_text(intake.insurance_provider.as_deref()),
            opt_text(intake.policy_number.as_deref()),
            opt_text(intake.group_number.as_deref()),
            opt_text(intake.referral_source.as_deref()),
            opt_text(intake.referring_provider.as_deref()),
            opt_date(intake.referral_date),
            opt_text(intake.facility_assignment.as_deref()),
            opt_int(assigned_user_id),
            now.clone()
        ],
    )
    .await
    .map_err(|e| DatabaseError::from_write("Failed to insert onboarding record", e))?;
    let onboarding_id = conn.last_insert_rowid();

    let steps = query_all(
        conn,
        "SELECT step_id, step_order, task_name FROM workflow_steps
         WHERE template_id = ?1 ORDER BY step_order",
        params![ONBOARDING_TEMPLATE_ID],
        "Failed to load workflow steps",
        |row| {
            Ok((
                row.get::<i64>(0).map_err(row_err)?,
                row.get::<i64>(1).map_err(row_err)?,
                row.get::<String>(2).map_err(row_err)?,
            ))
        },
    )
    .await?;

    if steps.is_empty() {
        return Err(DatabaseError::Constraint(format!(
            "Workflow template {ONBOARDING_TEMPLATE_ID} has no steps"
        )));
    }

    for (step_id, step_order, task_name) in steps {
        let stage = stage_for_step_order(step_order);
        let done = stage == 1;
        let status = if done {
            TaskStatus::Complete
        } else {
            TaskStatus::Pending
        };
        conn.execute(
            "INSERT INTO onboarding_tasks (onboarding_id, workflow_step_id, task_name,
                task_stage, task_order, status, completed_by_user_id, completed_date,
                created_date, updated_date)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            params![
                onboarding_id,
                step_id,
                task_name,
                i64::from(stage),
                step_order,
                task_status_to_str(status),
                opt_int(done.then_some(created_by)),
                opt_text(done.then_some(now.as_str())),
                now.clone()
            ],
        )
        .await
        .map_err(|e| DatabaseError::from_write("Failed to insert onboarding task", e))?;
    }

    Ok(onboarding_id)
}

async fn write_stage_fields(
    conn: &Connection,
    onboarding_id: i64,
    submission: &StageSubmission,
    now: &str,
) -> Result<(), DatabaseError> {
    let affected = match submission {
        StageSubmission::Eligibility(f) => {
            conn.execute(
                "UPDATE onboarding_patients SET eligibility_status = ?2,
                    eligibility_verified = ?3, eligibility_notes = ?4, updated_date = ?5
                 WHERE onboarding_id = ?1",
                params![
                    onboarding_id,
                    f.status.as_str(),
                    flag(f.verified),
                    opt_text(f.notes.as_deref()),
                    now
                ],
            )
            .await
        }
        StageSubmission::ChartCreation(f) => {
            conn.execute(
                "UPDATE onboarding_patients SET emed_chart_created = ?2, chart_id = ?3,
                    facility_confirmed = ?4, chart_notes = ?5, updated_date = ?6
                 WHERE onboarding_id = ?1",
                params![
                    onboarding_id,
                    flag(f.chart_created),
                    opt_text(f.chart_id.as_deref()),
                    flag(f.facility_confirmed),
                    opt_text(f.notes.as_deref()),
                    now
                ],
            )
            .await
        }
        StageSubmission::Intake(f) => {
            conn.execute(
                "UPDATE onboarding_patients SET medical_records_requested = ?2,
                    referral_documents_received = ?3, insurance_cards_received = ?4,
                    emed_signature_received = ?5, prescreen_completed = ?6,
                    patient_contacted = ?7, hypertension = ?8, mental_health_concerns = ?9,
                    dementia = ?10, intake_notes = ?11, updated_date = ?12
                 WHERE onboarding_id = ?1",
                params![
                    onboarding_id,
                    flag(f.documents.medical_records_requested),
                    flag(f.documents.referral_documents_received),
                    flag(f.documents.insurance_cards_received),
                    flag(f.documents.signature_received),
                    flag(f.prescreen_completed),
                    flag(f.patient_contacted),
                    flag(f.clinical.hypertension),
                    flag(f.clinical.mental_health_concerns),
                    flag(f.clinical.dementia),
                    opt_text(f.notes.as_deref()),
                    now
                ],
            )
            .await
        }
        StageSubmission::TvScheduling(f) => {
            let tv_time = f.tv_time.map(|t| t.format("%H:%M:%S").to_string());
            conn.execute(
                "UPDATE onboarding_patients SET tv_scheduled = ?2, tv_date = ?3, tv_time = ?4,
                    assigned_pcpm_user_id = ?5, patient_notified = ?6, handoff_notes = ?7,
                    updated_date = ?8
                 WHERE onboarding_id = ?1",
                params![
                    onboarding_id,
                    flag(f.tv_scheduled),
                    opt_date(f.tv_date),
                    opt_text(tv_time.as_deref()),
                    opt_int(f.assigned_pcpm_user_id),
                    flag(f.patient_notified),
                    opt_text(f.handoff_notes.as_deref()),
                    now
                ],
            )
            .await
        }
    }
    .map_err(|e| DatabaseError::from_write("Failed to save stage fields", e))?;

    if affected == 0 {
        return Err(not_found("onboarding", onboarding_id));
    }
    Ok(())
}

async fn write_stage_flag(
    conn: &Connection,
    onboarding_id: i64,
    stage: u8,
    now: &str,
) -> Result<(), DatabaseError> {
    let column = stage_column(stage)?;
    let affected = conn
        .execute(
            &format!(
                "UPDATE onboarding_patients SET {column} = 1, updated_date = ?2
                 WHERE onboarding_id = ?1 AND completed_date IS NULL"
            ),
            params![onboarding_id, now],
        )
        .await
        .map_err(|e| DatabaseError::from_write("Failed to set stage flag", e))?;
    if affected == 0 {
        return Err(not_found("onboarding", onboarding_id));
    }
    Ok(())
}

fn patient_from_onboarding(
    record: &OnboardingRecord,
    today: NaiveDate,
) -> Result<NewPatient, DatabaseError> {
    let intake = &record.intake;
    let date_of_birth = intake.date_of_birth.ok_or_else(|| {
        DatabaseError::Constraint(format!(
            "Onboarding {} has no date of birth",
            record.onboarding_id
        ))
    })?;
    Ok(NewPatient {
        first_name: intake.first_name.clone(),
        last_name: intake.last_name.clone(),
        date_of_birth,
        gender: intake.gender.clone(),
        phone_primary: intake.phone_primary.clone(),
        email: intake.email.clone(),
        emergency_contact_name: intake.emergency_contact_name.clone(),
        emergency_contact_phone: intake.emergency_contact_phone.clone(),
        address: intake.address.clone(),
        insurance_primary: intake.insurance_provider.clone(),
        insurance_policy_number: intake.policy_number.clone(),
        status: PatientStatus::Active,
        clinical: record.checklist.clinical,
        documents: record.checklist.documents,
        enrollment_date: Some(today),
    })
}

async fn handoff_rows(
    conn: &Connection,
    onboarding_id: i64,
    now: DateTime<Utc>,
) -> Result<i64, DatabaseError> {
    let record = fetch_onboarding(conn, onboarding_id)
        .await?
        .ok_or_else(|| not_found("onboarding", onboarding_id))?;
    if record.completed_date.is_some() {
        return Err(DatabaseError::Constraint(format!(
            "Onboarding {onboarding_id} already handed off"
        )));
    }
    if !record.flags.all_complete() {
        return Err(DatabaseError::Constraint(format!(
            "Onboarding {onboarding_id} has incomplete stages"
        )));
    }

    let now_str = now.to_rfc3339();
    let existing = match record.patient_id {
        Some(patient_id) => query_one(
            conn,
            "SELECT patient_id FROM patients WHERE patient_id = ?1",
            params![patient_id],
            "Failed to look up linked patient",
            |row| row.get::<i64>(0).map_err(row_err),
        )
        .await?,
        None => None,
    };

    let patient_id = match existing {
        Some(patient_id) => {
            let docs = record.checklist.documents;
            let clinical = record.checklist.clinical;
            conn.execute(
                "UPDATE patients SET medical_records_requested = ?2,
                    referral_documents_received = ?3, insurance_cards_received = ?4,
                    emed_signature_received = ?5, hypertension = ?6,
                    mental_health_concerns = ?7, dementia = ?8, updated_date = ?9
                 WHERE patient_id = ?1",
                params![
                    patient_id,
                    flag(docs.medical_records_requested),
                    flag(docs.referral_documents_received),
                    flag(docs.insurance_cards_received),
                    flag(docs.signature_received),
                    flag(clinical.hypertension),
                    flag(clinical.mental_health_concerns),
                    flag(clinical.dementia),
                    now_str.clone()
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_write("Failed to merge patient", e))?;
            patient_id
        }
        None => {
            let patient = patient_from_onboarding(&record, now.date_naive())?;
            let patient_id = insert_patient_row(conn, &patient, now).await?;
            conn.execute(
                "UPDATE onboarding_patients SET patient_id = ?2 WHERE onboarding_id = ?1",
                params![onboarding_id, patient_id],
            )
            .await
            .map_err(|e| DatabaseError::from_write("Failed to link patient", e))?;
            patient_id
        }
    };

    conn.execute(
        "UPDATE onboarding_patients SET completed_date = ?2, updated_date = ?2
         WHERE onboarding_id = ?1 AND completed_date IS NULL",
        params![onboarding_id, now_str.clone()],
    )
    .await
    .map_err(|e| DatabaseError::from_write("Failed to stamp completion", e))?;

    conn.execute(
        "UPDATE workflow_instances SET status = ?2, completed_at = ?3 WHERE instance_id = ?1",
        params![
            record.workflow_instance_id,
            WorkflowStatus::Completed.as_str(),
            now_str
        ],
    )
    .await
    .map_err(|e| DatabaseError::from_write("Failed to complete workflow instance", e))?;

    Ok(patient_id)
}

async fn rebuild_service_area_rows(
    conn: &Connection,
    now: &str,
) -> Result<ServiceAreaRefresh, DatabaseError> {
    conn.execute("DELETE FROM dashboard_provider_county_map", ())
        .await
        .map_err(|e| DatabaseError::Query(format!("Failed to clear county map: {e}")))?;
    conn.execute("DELETE FROM dashboard_provider_zip_map", ())
        .await
        .map_err(|e| DatabaseError::Query(format!("Failed to clear zip map: {e}")))?;

    let county_rows = conn
        .execute(
            "INSERT INTO dashboard_provider_county_map
                (provider_id, county, state, patient_count, updated_date)
             SELECT rp.provider_id, TRIM(r.county), r.state, COUNT(DISTINCT p.patient_id), ?1
             FROM region_providers rp
             JOIN regions r ON rp.region_id = r.region_id
             LEFT JOIN patients p ON p.region_id = r.region_id
             WHERE r.county IS NOT NULL AND TRIM(r.county) != ''
             GROUP BY rp.provider_id, TRIM(r.county), r.state",
            params![now],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("Failed to rebuild county map: {e}")))?;

    let zip_rows = conn
        .execute(
            "INSERT INTO dashboard_provider_zip_map
                (provider_id, zip_code, city, state, patient_count, updated_date)
             SELECT rp.provider_id, TRIM(r.zip_code), r.city, r.state,
                    COUNT(DISTINCT p.patient_id), ?1
             FROM region_providers rp
             JOIN regions r ON rp.region_id = r.region_id
             LEFT JOIN patients p ON p.region_id = r.region_id
             WHERE r.zip_code IS NOT NULL AND TRIM(r.zip_code) != ''
             GROUP BY rp.provider_id, TRIM(r.zip_code), r.city, r.state",
            params![now],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("Failed to rebuild zip map: {e}")))?;

    Ok(ServiceAreaRefresh {
        county_rows,
        zip_rows,
    })
}

async fn select_task_logs(
    conn: &Connection,
    kind: StaffKind,
) -> Result<Vec<TaskLogRow>, DatabaseError> {
    let t = log_table(kind);
    query_all(
        conn,
        &format!(
            "SELECT {}, {}, patient_id, task_date, {}, task_description, notes
             FROM {} ORDER BY {}",
            t.id, t.staff, t.minutes, t.table, t.id
        ),
        (),
        "Failed to list task logs",
        row_to_task_log,
    )
    .await
}

/// Swap every summary row of `kind`/`granularity` for `rows`.
async fn write_summary_rows(
    conn: &Connection,
    kind: StaffKind,
    granularity: Granularity,
    rows: &[SummaryRow],
    now: &str,
) -> Result<u64, DatabaseError> {
    conn.execute(
        "DELETE FROM task_summaries WHERE staff_kind = ?1 AND granularity = ?2",
        params![kind.as_str(), granularity.as_str()],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("Failed to clear summaries: {e}")))?;

    let sql = format!(
        "INSERT INTO task_summaries ({SUMMARY_COLUMNS}, refreshed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
    );
    let mut written = 0u64;
    for row in rows {
        written += conn
            .execute(
                &sql,
                params![
                    row.staff_kind.as_str(),
                    row.granularity.as_str(),
                    row.staff_id,
                    i64::from(row.year),
                    i64::from(row.period),
                    row.period_start.format("%Y-%m-%d").to_string(),
                    row.period_end.format("%Y-%m-%d").to_string(),
                    row.total_minutes,
                    row.total_tasks,
                    row.distinct_patients,
                    row.avg_minutes_per_task.to_string(),
                    row.minutes_per_patient.to_string(),
                    now
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_write("Failed to insert summary", e))?;
    }
    Ok(written)
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let _guard = self.lock.write().await;
        migrations::run_migrations(self.conn()).await
    }

    // ── Staff ───────────────────────────────────────────────────────

    async fn create_user(
        &self,
        username: &str,
        full_name: &str,
        roles: &[Role],
    ) -> Result<i64, DatabaseError> {
        let _guard = self.lock.write().await;
        let conn = self.conn();
        begin(conn).await?;
        let result = async {
            conn.execute(
                "INSERT INTO users (username, full_name) VALUES (?1, ?2)",
                params![username, full_name],
            )
            .await
            .map_err(|e| DatabaseError::from_write("Failed to insert user", e))?;
            let user_id = conn.last_insert_rowid();
            for role in roles {
                conn.execute(
                    "INSERT OR IGNORE INTO user_roles (user_id, role) VALUES (?1, ?2)",
                    params![user_id, role.as_str()],
                )
                .await
                .map_err(|e| DatabaseError::from_write("Failed to insert user role", e))?;
            }
            Ok::<_, DatabaseError>(user_id)
        }
        .await;
        finish(conn, result).await
    }

    async fn get_user(&self, user_id: i64) -> Result<Option<User>, DatabaseError> {
        let _guard = self.lock.read().await;
        let conn = self.conn();
        let user = query_one(
            conn,
            "SELECT user_id, username, full_name FROM users WHERE user_id = ?1",
            params![user_id],
            "Failed to get user",
            |row| {
                Ok(User {
                    user_id: row.get(0).map_err(row_err)?,
                    username: row.get(1).map_err(row_err)?,
                    full_name: row.get(2).map_err(row_err)?,
                    roles: Vec::new(),
                })
            },
        )
        .await?;

        let Some(mut user) = user else {
            return Ok(None);
        };
        user.roles = query_all(
            conn,
            "SELECT role FROM user_roles WHERE user_id = ?1 ORDER BY role",
            params![user_id],
            "Failed to list user roles",
            |row| {
                let role: String = row.get(0).map_err(row_err)?;
                Role::from_str(&role).map_err(|e| DatabaseError::Serialization(e.to_string()))
            },
        )
        .await?;
        Ok(Some(user))
    }

    async fn create_provider(&self, user_id: i64) -> Result<i64, DatabaseError> {
        let _guard = self.lock.write().await;
        self.conn()
            .execute(
                "INSERT INTO providers (user_id) VALUES (?1)",
                params![user_id],
            )
            .await
            .map_err(|e| DatabaseError::from_write("Failed to insert provider", e))?;
        Ok(self.conn().last_insert_rowid())
    }

    async fn create_coordinator(&self, user_id: i64) -> Result<i64, DatabaseError> {
        let _guard = self.lock.write().await;
        self.conn()
            .execute(
                "INSERT INTO coordinators (user_id) VALUES (?1)",
                params![user_id],
            )
            .await
            .map_err(|e| DatabaseError::from_write("Failed to insert coordinator", e))?;
        Ok(self.conn().last_insert_rowid())
    }

    async fn provider_exists(&self, provider_id: i64) -> Result<bool, DatabaseError> {
        let _guard = self.lock.read().await;
        let found = query_one(
            self.conn(),
            "SELECT 1 FROM providers WHERE provider_id = ?1",
            params![provider_id],
            "Failed to look up provider",
            |row| row.get::<i64>(0).map_err(row_err),
        )
        .await?;
        Ok(found.is_some())
    }

    // ── Patients ────────────────────────────────────────────────────

    async fn insert_patient(
        &self,
        patient: &NewPatient,
        now: DateTime<Utc>,
    ) -> Result<i64, DatabaseError> {
        let _guard = self.lock.write().await;
        insert_patient_row(self.conn(), patient, now).await
    }

    async fn get_patient(&self, patient_id: i64) -> Result<Option<Patient>, DatabaseError> {
        let _guard = self.lock.read().await;
        query_one(
            self.conn(),
            &format!("SELECT {PATIENT_COLUMNS} FROM patients WHERE patient_id = ?1"),
            params![patient_id],
            "Failed to get patient",
            row_to_patient,
        )
        .await
    }

    async fn set_patient_region(
        &self,
        patient_id: i64,
        region_id: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let _guard = self.lock.write().await;
        let affected = self
            .conn()
            .execute(
                "UPDATE patients SET region_id = ?2, updated_date = ?3 WHERE patient_id = ?1",
                params![patient_id, opt_int(region_id), now.to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::from_write("Failed to set patient region", e))?;
        if affected == 0 {
            return Err(not_found("patient", patient_id));
        }
        Ok(())
    }

    async fn set_patient_status(
        &self,
        patient_id: i64,
        status: PatientStatus,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let _guard = self.lock.write().await;
        let affected = self
            .conn()
            .execute(
                "UPDATE patients SET status = ?2, updated_date = ?3 WHERE patient_id = ?1",
                params![patient_id, status.as_str(), now.to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::from_write("Failed to set patient status", e))?;
        if affected == 0 {
            return Err(not_found("patient", patient_id));
        }
        Ok(())
    }

    async fn assign_user_patient(
        &self,
        user_id: i64,
        patient_id: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.lock.write().await;
        let inserted = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO user_patient_assignments
                    (user_id, patient_id, assignment_date)
                 VALUES (?1, ?2, ?3)",
                params![user_id, patient_id, now.to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::from_write("Failed to assign patient", e))?;
        Ok(inserted > 0)
    }

    async fn list_user_patient_assignments(
        &self,
        user_id: i64,
    ) -> Result<Vec<PatientAssignment>, DatabaseError> {
        let _guard = self.lock.read().await;
        query_all(
            self.conn(),
            "SELECT upa.user_id, upa.patient_id, p.first_name, p.last_name, p.status,
                    p.address_street, p.address_city, p.address_state, p.address_zip,
                    p.phone_primary, p.email, upa.assignment_date
             FROM user_patient_assignments upa
             JOIN patients p ON upa.patient_id = p.patient_id
             WHERE upa.user_id = ?1
             ORDER BY p.last_name, p.first_name, upa.patient_id",
            params![user_id],
            "Failed to list patient assignments",
            row_to_assignment,
        )
        .await
    }

    // ── Regions ─────────────────────────────────────────────────────

    async fn insert_region(&self, region: &NewRegion) -> Result<i64, DatabaseError> {
        let _guard = self.lock.write().await;
        self.conn()
            .execute(
                "INSERT INTO regions (zip_code, city, state, county, status)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    region.zip_code.trim(),
                    opt_text(region.city.as_deref()),
                    opt_text(region.state.as_deref()),
                    opt_text(region.county.as_deref()),
                    region.status.as_str()
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_write("Failed to insert region", e))?;
        Ok(self.conn().last_insert_rowid())
    }

    async fn get_region(&self, region_id: i64) -> Result<Option<Region>, DatabaseError> {
        let _guard = self.lock.read().await;
        query_one(
            self.conn(),
            &format!("SELECT {REGION_COLUMNS} FROM regions WHERE region_id = ?1"),
            params![region_id],
            "Failed to get region",
            row_to_region,
        )
        .await
    }

    async fn list_active_regions(&self) -> Result<Vec<Region>, DatabaseError> {
        let _guard = self.lock.read().await;
        query_all(
            self.conn(),
            &format!(
                "SELECT {REGION_COLUMNS} FROM regions WHERE status = 'active' ORDER BY region_id"
            ),
            (),
            "Failed to list regions",
            row_to_region,
        )
        .await
    }

    async fn assign_provider_region(
        &self,
        provider_id: i64,
        region_id: i64,
    ) -> Result<(), DatabaseError> {
        let _guard = self.lock.write().await;
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO region_providers (region_id, provider_id) VALUES (?1, ?2)",
                params![region_id, provider_id],
            )
            .await
            .map_err(|e| DatabaseError::from_write("Failed to assign provider region", e))?;
        Ok(())
    }

    async fn list_provider_region_ids(&self, provider_id: i64) -> Result<Vec<i64>, DatabaseError> {
        let _guard = self.lock.read().await;
        query_all(
            self.conn(),
            "SELECT region_id FROM region_providers WHERE provider_id = ?1 ORDER BY region_id",
            params![provider_id],
            "Failed to list provider regions",
            |row| row.get::<i64>(0).map_err(row_err),
        )
        .await
    }

    async fn list_provider_region_counties(
        &self,
        provider_id: i64,
    ) -> Result<Vec<String>, DatabaseError> {
        let _guard = self.lock.read().await;
        query_all(
            self.conn(),
            "SELECT DISTINCT TRIM(r.county) FROM region_providers rp
             JOIN regions r ON rp.region_id = r.region_id
             WHERE rp.provider_id = ?1 AND r.county IS NOT NULL AND TRIM(r.county) != ''
             ORDER BY 1",
            params![provider_id],
            "Failed to list provider counties",
            |row| row.get::<String>(0).map_err(row_err),
        )
        .await
    }

    async fn refresh_service_area_maps(
        &self,
        now: DateTime<Utc>,
    ) -> Result<ServiceAreaRefresh, DatabaseError> {
        let _guard = self.lock.write().await;
        let conn = self.conn();
        begin(conn).await?;
        let result = rebuild_service_area_rows(conn, &now.to_rfc3339()).await;
        finish(conn, result).await
    }

    async fn list_cached_provider_counties(
        &self,
        provider_id: i64,
    ) -> Result<Vec<CountyCount>, DatabaseError> {
        let _guard = self.lock.read().await;
        query_all(
            self.conn(),
            "SELECT county, state, SUM(patient_count) FROM dashboard_provider_county_map
             WHERE provider_id = ?1
             GROUP BY county, state
             ORDER BY county COLLATE NOCASE, state",
            params![provider_id],
            "Failed to list cached counties",
            |row| {
                Ok(CountyCount {
                    county: row.get(0).map_err(row_err)?,
                    state: row.get(1).ok(),
                    patient_count: row.get(2).map_err(row_err)?,
                })
            },
        )
        .await
    }

    async fn list_cached_provider_zip_codes(
        &self,
        provider_id: i64,
    ) -> Result<Vec<ZipCount>, DatabaseError> {
        let _guard = self.lock.read().await;
        let mut zips = query_all(
            self.conn(),
            "SELECT zip_code, MAX(city), MAX(state), SUM(patient_count)
             FROM dashboard_provider_zip_map
             WHERE provider_id = ?1
             GROUP BY zip_code",
            params![provider_id],
            "Failed to list cached zip codes",
            |row| {
                Ok(ZipCount {
                    zip_code: row.get(0).map_err(row_err)?,
                    city: row.get(1).ok(),
                    state: row.get(2).ok(),
                    patient_count: row.get(3).map_err(row_err)?,
                })
            },
        )
        .await?;
        zips.sort_by(|a, b| compare_zip_codes(&a.zip_code, &b.zip_code));
        Ok(zips)
    }

    // ── Onboarding ──────────────────────────────────────────────────

    async fn create_onboarding(
        &self,
        intake: &IntakeData,
        assigned_user_id: Option<i64>,
        created_by: i64,
        now: DateTime<Utc>,
    ) -> Result<i64, DatabaseError> {
        let _guard = self.lock.write().await;
        let conn = self.conn();
        begin(conn).await?;
        let result = insert_onboarding_rows(conn, intake, assigned_user_id, created_by, now).await;
        finish(conn, result).await
    }

    async fn get_onboarding(
        &self,
        onboarding_id: i64,
    ) -> Result<Option<OnboardingRecord>, DatabaseError> {
        let _guard = self.lock.read().await;
        fetch_onboarding(self.conn(), onboarding_id).await
    }

    async fn list_onboarding_tasks(
        &self,
        onboarding_id: i64,
    ) -> Result<Vec<OnboardingTask>, DatabaseError> {
        let _guard = self.lock.read().await;
        query_all(
            self.conn(),
            &format!(
                "SELECT {TASK_COLUMNS} FROM onboarding_tasks ot
                 LEFT JOIN workflow_steps ws ON ot.workflow_step_id = ws.step_id
                 WHERE ot.onboarding_id = ?1
                 ORDER BY ot.task_order, ot.task_id"
            ),
            params![onboarding_id],
            "Failed to list onboarding tasks",
            row_to_task,
        )
        .await
    }

    async fn get_onboarding_task(
        &self,
        task_id: i64,
    ) -> Result<Option<OnboardingTask>, DatabaseError> {
        let _guard = self.lock.read().await;
        query_one(
            self.conn(),
            &format!(
                "SELECT {TASK_COLUMNS} FROM onboarding_tasks ot
                 LEFT JOIN workflow_steps ws ON ot.workflow_step_id = ws.step_id
                 WHERE ot.task_id = ?1"
            ),
            params![task_id],
            "Failed to get onboarding task",
            row_to_task,
        )
        .await
    }

    async fn set_stage_complete(
        &self,
        onboarding_id: i64,
        stage: u8,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let _guard = self.lock.write().await;
        write_stage_flag(self.conn(), onboarding_id, stage, &now.to_rfc3339()).await
    }

    async fn complete_stage(
        &self,
        onboarding_id: i64,
        submission: &StageSubmission,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let _guard = self.lock.write().await;
        let conn = self.conn();
        let now = now.to_rfc3339();
        let stage = submission.stage();
        begin(conn).await?;
        let result = async {
            write_stage_fields(conn, onboarding_id, submission, &now).await?;
            write_stage_flag(conn, onboarding_id, stage, &now).await?;
            conn.execute(
                "UPDATE onboarding_tasks SET status = 'Complete', completed_by_user_id = ?3,
                    completed_date = ?4, updated_date = ?4
                 WHERE onboarding_id = ?1 AND task_stage = ?2 AND status = 'Pending'",
                params![onboarding_id, i64::from(stage), user_id, now.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::from_write("Failed to complete stage tasks", e))?;
            Ok::<_, DatabaseError>(())
        }
        .await;
        finish(conn, result).await
    }

    async fn save_stage_fields(
        &self,
        onboarding_id: i64,
        submission: &StageSubmission,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let _guard = self.lock.write().await;
        write_stage_fields(self.conn(), onboarding_id, submission, &now.to_rfc3339()).await
    }

    async fn update_onboarding_task(
        &self,
        task_id: i64,
        update: &TaskUpdate,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let _guard = self.lock.write().await;
        let affected = self
            .conn()
            .execute(
                "UPDATE onboarding_tasks SET status = ?2, completed_by_user_id = ?3,
                    completed_date = CASE WHEN ?2 = 'Complete' THEN ?4 ELSE NULL END,
                    notes = COALESCE(?5, notes), updated_date = ?4
                 WHERE task_id = ?1",
                params![
                    task_id,
                    task_status_to_str(update.status),
                    user_id,
                    now.to_rfc3339(),
                    opt_text(update.notes.as_deref())
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_write("Failed to update onboarding task", e))?;
        if affected == 0 {
            return Err(not_found("onboarding task", task_id));
        }
        Ok(())
    }

    async fn assign_onboarding_owner(
        &self,
        onboarding_id: i64,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let _guard = self.lock.write().await;
        let affected = self
            .conn()
            .execute(
                "UPDATE onboarding_patients SET assigned_pot_user_id = ?2, updated_date = ?3
                 WHERE onboarding_id = ?1",
                params![onboarding_id, user_id, now.to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::from_write("Failed to assign onboarding owner", e))?;
        if affected == 0 {
            return Err(not_found("onboarding", onboarding_id));
        }
        Ok(())
    }

    async fn list_onboarding_queue(&self) -> Result<Vec<QueueEntry>, DatabaseError> {
        let _guard = self.lock.read().await;
        query_all(
            self.conn(),
            "SELECT op.onboarding_id, op.first_name, op.last_name,
                    op.stage1_complete, op.stage2_complete, op.stage3_complete,
                    op.stage4_complete, op.stage5_complete,
                    op.assigned_pot_user_id, u.full_name,
                    op.created_date, op.updated_date
             FROM onboarding_patients op
             LEFT JOIN users u ON op.assigned_pot_user_id = u.user_id
             WHERE op.completed_date IS NULL
             ORDER BY (op.stage1_complete + op.stage2_complete + op.stage3_complete
                       + op.stage4_complete + op.stage5_complete) DESC,
                      op.created_date DESC,
                      op.onboarding_id DESC",
            (),
            "Failed to list onboarding queue",
            row_to_queue_entry,
        )
        .await
    }

    async fn complete_handoff(
        &self,
        onboarding_id: i64,
        now: DateTime<Utc>,
    ) -> Result<i64, DatabaseError> {
        let _guard = self.lock.write().await;
        let conn = self.conn();
        begin(conn).await?;
        let result = handoff_rows(conn, onboarding_id, now).await;
        finish(conn, result).await
    }

    // ── Task logs & summaries ───────────────────────────────────────

    async fn insert_task_logs(
        &self,
        kind: StaffKind,
        entries: &[TaskLogEntry],
    ) -> Result<u64, DatabaseError> {
        let _guard = self.lock.write().await;
        let conn = self.conn();
        let t = log_table(kind);
        let sql = format!(
            "INSERT INTO {} ({}, patient_id, task_date, {}, task_description, notes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            t.table, t.staff, t.minutes
        );
        begin(conn).await?;
        let result = async {
            let mut inserted = 0u64;
            for entry in entries {
                inserted += conn
                    .execute(
                        &sql,
                        params![
                            entry.staff_id.trim(),
                            opt_text(entry.patient_id.as_deref()),
                            entry.task_date.as_str(),
                            opt_int(entry.minutes),
                            opt_text(entry.task_description.as_deref()),
                            opt_text(entry.notes.as_deref())
                        ],
                    )
                    .await
                    .map_err(|e| DatabaseError::from_write("Failed to insert task log", e))?;
            }
            Ok::<_, DatabaseError>(inserted)
        }
        .await;
        finish(conn, result).await
    }

    async fn list_task_logs(&self, kind: StaffKind) -> Result<Vec<TaskLogRow>, DatabaseError> {
        let _guard = self.lock.read().await;
        select_task_logs(self.conn(), kind).await
    }

    async fn rebuild_summaries(
        &self,
        kind: StaffKind,
        granularity: Granularity,
        now: DateTime<Utc>,
    ) -> Result<RollupReport, DatabaseError> {
        let _guard = self.lock.write().await;
        let conn = self.conn();
        begin(conn).await?;
        let result = async {
            let logs = select_task_logs(conn, kind).await?;
            let rollup = aggregate(kind, granularity, logs.iter().map(|row| &row.entry));
            let rows_written =
                write_summary_rows(conn, kind, granularity, &rollup.rows, &now.to_rfc3339())
                    .await?;
            Ok::<_, DatabaseError>(RollupReport {
                staff_kind: kind,
                granularity,
                rows_written,
                skipped: rollup.skipped,
            })
        }
        .await;
        finish(conn, result).await
    }

    async fn list_summaries(
        &self,
        kind: StaffKind,
        granularity: Granularity,
        staff_id: Option<i64>,
    ) -> Result<Vec<SummaryRow>, DatabaseError> {
        let _guard = self.lock.read().await;
        query_all(
            self.conn(),
            &format!(
                "SELECT {SUMMARY_COLUMNS} FROM task_summaries
                 WHERE staff_kind = ?1 AND granularity = ?2 AND (?3 IS NULL OR staff_id = ?3)
                 ORDER BY staff_id, year, period"
            ),
            params![kind.as_str(), granularity.as_str(), opt_int(staff_id)],
            "Failed to list summaries",
            row_to_summary,
        )
        .await
    }

    async fn insert_billing_code(
        &self,
        billing_code: &str,
        description: Option<&str>,
        min_minutes: i64,
        max_minutes: i64,
    ) -> Result<i64, DatabaseError> {
        let _guard = self.lock.write().await;
        self.conn()
            .execute(
                "INSERT INTO coordinator_billing_codes
                    (billing_code, description, min_minutes, max_minutes)
                 VALUES (?1, ?2, ?3, ?4)",
                params![billing_code, opt_text(description), min_minutes, max_minutes],
            )
            .await
            .map_err(|e| DatabaseError::from_write("Failed to insert billing code", e))?;
        Ok(self.conn().last_insert_rowid())
    }

    async fn list_billing_codes(&self) -> Result<Vec<BillingCode>, DatabaseError> {
        let _guard = self.lock.read().await;
        query_all(
            self.conn(),
            "SELECT code_id, billing_code, description, min_minutes, max_minutes
             FROM coordinator_billing_codes ORDER BY min_minutes, code_id",
            (),
            "Failed to list billing codes",
            row_to_billing_code,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::onboarding::state::OnboardingStage;

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, hour, 0, 0).unwrap()
    }

    fn intake(first: &str, last: &str) -> IntakeData {
        IntakeData {
            first_name: first.into(),
            last_name: last.into(),
            date_of_birth: NaiveDate::from_ymd_opt(1948, 6, 2),
            phone_primary: Some("555-0100".into()),
            address: Address {
                street: "12 Elm St".into(),
                city: "Springfield".into(),
                state: "IL".into(),
                zip: "62701".into(),
            },
            ..Default::default()
        }
    }

    async fn count(backend: &LibSqlBackend, sql: &str) -> i64 {
        query_one(backend.conn(), sql, (), "count", |row| {
            row.get::<i64>(0).map_err(row_err)
        })
        .await
        .unwrap()
        .unwrap()
    }

    async fn finish_all_stages(backend: &LibSqlBackend, id: i64, now: DateTime<Utc>) {
        for stage in 2..=5 {
            backend.set_stage_complete(id, stage, now).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_local_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("care.db");
        {
            let backend = LibSqlBackend::new_local(&path).await.unwrap();
            backend
                .create_user("jdoe", "Jane Doe", &[Role::Onboarding])
                .await
                .unwrap();
        }
        let backend = LibSqlBackend::new_local(&path).await.unwrap();
        let user = backend.get_user(1).await.unwrap().unwrap();
        assert_eq!(user.username, "jdoe");
    }

    #[tokio::test]
    async fn test_user_roles_round_trip() {
        let backend = LibSqlBackend::new_memory().await.unwrap();
        let id = backend
            .create_user("cc1", "Casey Coord", &[Role::CareCoordinator, Role::Admin])
            .await
            .unwrap();
        let user = backend.get_user(id).await.unwrap().unwrap();
        assert_eq!(user.full_name, "Casey Coord");
        assert!(user.roles.contains(&Role::Admin));
        assert!(user.roles.contains(&Role::CareCoordinator));
        assert!(backend.get_user(id + 100).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_onboarding_seeds_tasks() {
        let backend = LibSqlBackend::new_memory().await.unwrap();
        let creator = backend.create_user("pot", "Pat Pot", &[Role::Onboarding]).await.unwrap();
        let id = backend
            .create_onboarding(&intake("Ada", "Lovelace"), Some(creator), creator, at(1, 9))
            .await
            .unwrap();

        let record = backend.get_onboarding(id).await.unwrap().unwrap();
        assert_eq!(record.flags, StageFlags([true, false, false, false, false]));
        assert_eq!(record.current_stage(), OnboardingStage::EligibilityVerification);
        assert_eq!(record.intake.address.zip, "62701");
        assert_eq!(record.eligibility.status, EligibilityStatus::PendingVerification);
        assert!(record.completed_date.is_none());

        let tasks = backend.list_onboarding_tasks(id).await.unwrap();
        assert_eq!(tasks.len(), 15);
        for task in &tasks {
            if task.task_stage == 1 {
                assert_eq!(task.status, TaskStatus::Complete);
                assert_eq!(task.completed_by_user_id, Some(creator));
            } else {
                assert_eq!(task.status, TaskStatus::Pending);
                assert!(task.completed_date.is_none());
            }
        }
        assert_eq!(tasks.iter().filter(|t| t.task_stage == 1).count(), 3);
        assert_eq!(tasks.last().unwrap().task_stage, 5);
        assert!(tasks[0].deliverable.is_some());
    }

    #[tokio::test]
    async fn test_create_onboarding_rolls_back_without_steps() {
        let backend = LibSqlBackend::new_memory().await.unwrap();
        backend
            .conn()
            .execute("DELETE FROM workflow_steps", ())
            .await
            .unwrap();

        let err = backend
            .create_onboarding(&intake("No", "Steps"), None, 1, at(1, 9))
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));
        assert_eq!(count(&backend, "SELECT COUNT(*) FROM onboarding_patients").await, 0);
        assert_eq!(count(&backend, "SELECT COUNT(*) FROM workflow_instances").await, 0);

        // The connection is usable again after the rollback.
        backend.create_user("after", "After Rollback", &[]).await.unwrap();
    }

    #[tokio::test]
    async fn test_queue_orders_by_progress_then_recency() {
        let backend = LibSqlBackend::new_memory().await.unwrap();
        let owner = backend.create_user("pot", "Pat Pot", &[Role::Onboarding]).await.unwrap();

        let oldest = backend
            .create_onboarding(&intake("Old", "One"), Some(owner), owner, at(1, 9))
            .await
            .unwrap();
        let middle = backend
            .create_onboarding(&intake("Mid", "Two"), None, owner, at(2, 9))
            .await
            .unwrap();
        let newest = backend
            .create_onboarding(&intake("New", "Three"), None, owner, at(3, 9))
            .await
            .unwrap();
        backend.set_stage_complete(oldest, 2, at(4, 9)).await.unwrap();

        let queue = backend.list_onboarding_queue().await.unwrap();
        let ids: Vec<i64> = queue.iter().map(|e| e.onboarding_id).collect();
        assert_eq!(ids, vec![oldest, newest, middle]);
        assert_eq!(queue[0].current_stage, OnboardingStage::ChartCreation);
        assert_eq!(queue[0].stage_label, "Chart Creation");
        assert_eq!(queue[0].assigned_pot_name.as_deref(), Some("Pat Pot"));
        assert_eq!(queue[0].patient_name, "Old One");
        assert!(queue[1].assigned_pot_user_id.is_none());
    }

    #[tokio::test]
    async fn test_stage_flags_cannot_skip() {
        let backend = LibSqlBackend::new_memory().await.unwrap();
        let id = backend
            .create_onboarding(&intake("Skip", "Ahead"), None, 1, at(1, 9))
            .await
            .unwrap();
        let err = backend.set_stage_complete(id, 3, at(1, 10)).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));

        let err = backend.set_stage_complete(999, 2, at(1, 10)).await.unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    #[test]
    fn test_parse_datetime_formats() {
        assert_eq!(parse_datetime("2024-03-01T09:00:00+00:00").unwrap(), at(1, 9));
        assert_eq!(parse_datetime("2024-03-01 09:00:00").unwrap(), at(1, 9));
        assert_eq!(parse_datetime("2024-03-01 09:00:00.000").unwrap(), at(1, 9));
        assert!(matches!(
            parse_datetime("last tuesday"),
            Err(DatabaseError::Serialization(_))
        ));
        assert_eq!(parse_optional_datetime(&None).unwrap(), None);
    }

    #[tokio::test]
    async fn test_unreadable_timestamp_fails_load() {
        let backend = LibSqlBackend::new_memory().await.unwrap();
        let id = backend
            .create_onboarding(&intake("Bad", "Clock"), None, 1, at(1, 9))
            .await
            .unwrap();
        backend
            .conn()
            .execute(
                "UPDATE onboarding_patients SET updated_date = 'last tuesday' WHERE onboarding_id = ?1",
                params![id],
            )
            .await
            .unwrap();

        assert!(matches!(
            backend.get_onboarding(id).await,
            Err(DatabaseError::Serialization(_))
        ));
        assert!(matches!(
            backend.list_onboarding_queue().await,
            Err(DatabaseError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_task_status_fails_load() {
        let backend = LibSqlBackend::new_memory().await.unwrap();
        let id = backend
            .create_onboarding(&intake("Odd", "Status"), None, 1, at(1, 9))
            .await
            .unwrap();
        let task_id = backend.list_onboarding_tasks(id).await.unwrap()[5].task_id;
        backend
            .conn()
            .execute("PRAGMA ignore_check_constraints = ON", ())
            .await
            .unwrap();
        backend
            .conn()
            .execute(
                "UPDATE onboarding_tasks SET status = 'Skipped' WHERE task_id = ?1",
                params![task_id],
            )
            .await
            .unwrap();

        assert!(matches!(
            backend.list_onboarding_tasks(id).await,
            Err(DatabaseError::Serialization(_))
        ));
        assert!(matches!(
            backend.get_onboarding_task(task_id).await,
            Err(DatabaseError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn test_out_of_order_flags_fail_load() {
        let backend = LibSqlBackend::new_memory().await.unwrap();
        let id = backend
            .create_onboarding(&intake("Gap", "Flags"), None, 1, at(1, 9))
            .await
            .unwrap();
        backend
            .conn()
            .execute("PRAGMA ignore_check_constraints = ON", ())
            .await
            .unwrap();
        backend
            .conn()
            .execute(
                "UPDATE onboarding_patients SET stage3_complete = 1 WHERE onboarding_id = ?1",
                params![id],
            )
            .await
            .unwrap();

        assert!(matches!(
            backend.get_onboarding(id).await,
            Err(DatabaseError::Serialization(_))
        ));
        assert!(matches!(
            backend.list_onboarding_queue().await,
            Err(DatabaseError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn test_complete_stage_persists_form_and_tasks() {
        let backend = LibSqlBackend::new_memory().await.unwrap();
        let worker = backend.create_user("pot", "Pat Pot", &[Role::Onboarding]).await.unwrap();
        let id = backend
            .create_onboarding(&intake("Eli", "Gible"), None, worker, at(1, 9))
            .await
            .unwrap();

        let submission = StageSubmission::Eligibility(EligibilityForm {
            status: EligibilityStatus::Eligible,
            verified: true,
            notes: Some("Medicare A/B".into()),
        });
        backend.complete_stage(id, &submission, worker, at(2, 9)).await.unwrap();

        let record = backend.get_onboarding(id).await.unwrap().unwrap();
        assert!(record.flags.is_complete(2));
        assert_eq!(record.eligibility.status, EligibilityStatus::Eligible);
        assert_eq!(record.eligibility.notes.as_deref(), Some("Medicare A/B"));
        assert_eq!(record.updated_date, at(2, 9));

        let tasks = backend.list_onboarding_tasks(id).await.unwrap();
        assert!(
            tasks
                .iter()
                .filter(|t| t.task_stage == 2)
                .all(|t| t.status == TaskStatus::Complete && t.completed_by_user_id == Some(worker))
        );
        assert!(
            tasks
                .iter()
                .filter(|t| t.task_stage > 2)
                .all(|t| t.status == TaskStatus::Pending)
        );
    }

    #[tokio::test]
    async fn test_complete_stage_rolls_back_form_when_flag_rejected() {
        let backend = LibSqlBackend::new_memory().await.unwrap();
        let id = backend
            .create_onboarding(&intake("Roll", "Back"), None, 1, at(1, 9))
            .await
            .unwrap();
        let submission = StageSubmission::ChartCreation(ChartCreationForm {
            chart_created: true,
            chart_id: Some("CH-1".into()),
            facility_confirmed: true,
            notes: None,
        });
        let err = backend.complete_stage(id, &submission, 1, at(2, 9)).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));

        let record = backend.get_onboarding(id).await.unwrap().unwrap();
        assert!(!record.chart.chart_created);
        assert!(record.chart.chart_id.is_none());
    }

    #[tokio::test]
    async fn test_save_stage_fields_keeps_flags() {
        let backend = LibSqlBackend::new_memory().await.unwrap();
        let id = backend
            .create_onboarding(&intake("Tv", "Draft"), None, 1, at(1, 9))
            .await
            .unwrap();
        let submission = StageSubmission::TvScheduling(TvSchedulingForm {
            tv_scheduled: true,
            tv_date: NaiveDate::from_ymd_opt(2024, 4, 2),
            tv_time: NaiveTime::from_hms_opt(14, 30, 0),
            assigned_pcpm_user_id: None,
            patient_notified: false,
            handoff_notes: Some("call first".into()),
        });
        backend.save_stage_fields(id, &submission, at(1, 10)).await.unwrap();

        let record = backend.get_onboarding(id).await.unwrap().unwrap();
        assert_eq!(record.flags.completed_count(), 1);
        assert!(record.tv.tv_scheduled);
        assert_eq!(record.tv.tv_time, NaiveTime::from_hms_opt(14, 30, 0));
        assert_eq!(record.tv.handoff_notes.as_deref(), Some("call first"));
    }

    #[tokio::test]
    async fn test_update_task_and_assign_owner() {
        let backend = LibSqlBackend::new_memory().await.unwrap();
        let owner = backend.create_user("pot", "Pat Pot", &[Role::Onboarding]).await.unwrap();
        let id = backend
            .create_onboarding(&intake("Task", "Edit"), None, owner, at(1, 9))
            .await
            .unwrap();
        let task = backend
            .list_onboarding_tasks(id)
            .await
            .unwrap()
            .into_iter()
            .find(|t| t.task_stage == 2)
            .unwrap();

        let done = TaskUpdate {
            status: TaskStatus::Complete,
            notes: Some("verified by phone".into()),
        };
        backend.update_onboarding_task(task.task_id, &done, owner, at(1, 11)).await.unwrap();
        let stored = backend.get_onboarding_task(task.task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Complete);
        assert_eq!(stored.completed_date, Some(at(1, 11)));
        assert_eq!(stored.notes.as_deref(), Some("verified by phone"));

        let reopen = TaskUpdate {
            status: TaskStatus::Pending,
            notes: None,
        };
        backend.update_onboarding_task(task.task_id, &reopen, owner, at(1, 12)).await.unwrap();
        let stored = backend.get_onboarding_task(task.task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
        assert!(stored.completed_date.is_none());
        assert_eq!(stored.notes.as_deref(), Some("verified by phone"));

        backend.assign_onboarding_owner(id, owner, at(1, 13)).await.unwrap();
        let record = backend.get_onboarding(id).await.unwrap().unwrap();
        assert_eq!(record.assigned_pot_user_id, Some(owner));

        let err = backend.update_onboarding_task(9999, &done, owner, at(1, 14)).await.unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_handoff_creates_patient() {
        let backend = LibSqlBackend::new_memory().await.unwrap();
        let id = backend
            .create_onboarding(&intake("Grace", "Hopper"), None, 1, at(1, 9))
            .await
            .unwrap();
        let checklist = StageSubmission::Intake(IntakeChecklist {
            documents: DocumentFlags {
                referral_documents_received: true,
                ..Default::default()
            },
            prescreen_completed: true,
            clinical: ClinicalFlags {
                dementia: true,
                ..Default::default()
            },
            ..Default::default()
        });
        backend.save_stage_fields(id, &checklist, at(2, 9)).await.unwrap();
        finish_all_stages(&backend, id, at(3, 9)).await;

        let patient_id = backend.complete_handoff(id, at(5, 15)).await.unwrap();
        let patient = backend.get_patient(patient_id).await.unwrap().unwrap();
        assert_eq!(patient.full_name(), "Grace Hopper");
        assert_eq!(patient.status, PatientStatus::Active);
        assert_eq!(patient.enrollment_date, NaiveDate::from_ymd_opt(2024, 3, 5));
        assert!(patient.clinical.dementia);
        assert!(patient.documents.referral_documents_received);
        assert!(patient.region_id.is_none());

        let record = backend.get_onboarding(id).await.unwrap().unwrap();
        assert_eq!(record.patient_id, Some(patient_id));
        assert_eq!(record.completed_date, Some(at(5, 15)));
        assert!(backend.list_onboarding_queue().await.unwrap().is_empty());
        assert_eq!(
            count(&backend, "SELECT COUNT(*) FROM workflow_instances WHERE status = 'Completed'").await,
            1
        );

        let err = backend.complete_handoff(id, at(6, 9)).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));
        assert_eq!(count(&backend, "SELECT COUNT(*) FROM patients").await, 1);
    }

    #[tokio::test]
    async fn test_handoff_merges_into_linked_patient() {
        let backend = LibSqlBackend::new_memory().await.unwrap();
        let existing = NewPatient::new(
            "Grace",
            "Hopper",
            NaiveDate::from_ymd_opt(1948, 6, 2).unwrap(),
            "62701",
        );
        let patient_id = backend.insert_patient(&existing, at(1, 8)).await.unwrap();

        let id = backend
            .create_onboarding(&intake("Grace", "Hopper"), None, 1, at(1, 9))
            .await
            .unwrap();
        backend
            .conn()
            .execute(
                "UPDATE onboarding_patients SET patient_id = ?1, hypertension = 1,
                    insurance_cards_received = 1 WHERE onboarding_id = ?2",
                params![patient_id, id],
            )
            .await
            .unwrap();
        finish_all_stages(&backend, id, at(2, 9)).await;

        let merged = backend.complete_handoff(id, at(3, 9)).await.unwrap();
        assert_eq!(merged, patient_id);
        assert_eq!(count(&backend, "SELECT COUNT(*) FROM patients").await, 1);

        let patient = backend.get_patient(patient_id).await.unwrap().unwrap();
        assert!(patient.clinical.hypertension);
        assert!(patient.documents.insurance_cards_received);
        assert_eq!(patient.updated_date, at(3, 9));
    }

    #[tokio::test]
    async fn test_handoff_requires_all_stages() {
        let backend = LibSqlBackend::new_memory().await.unwrap();
        let id = backend
            .create_onboarding(&intake("Not", "Ready"), None, 1, at(1, 9))
            .await
            .unwrap();
        backend.set_stage_complete(id, 2, at(1, 10)).await.unwrap();
        let err = backend.complete_handoff(id, at(2, 9)).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));
        assert_eq!(count(&backend, "SELECT COUNT(*) FROM patients").await, 0);
    }

    #[tokio::test]
    async fn test_active_zip_is_unique() {
        let backend = LibSqlBackend::new_memory().await.unwrap();
        backend
            .insert_region(&NewRegion::active("94110", "San Francisco"))
            .await
            .unwrap();
        let err = backend
            .insert_region(&NewRegion {
                county: None,
                ..NewRegion::active("94110", "")
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));

        let mut retired = NewRegion::active("94110", "San Francisco");
        retired.status = RegionStatus::Inactive;
        let retired_id = backend.insert_region(&retired).await.unwrap();
        let stored = backend.get_region(retired_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RegionStatus::Inactive);
        assert_eq!(backend.list_active_regions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_service_area_cache_counts_patients() {
        let backend = LibSqlBackend::new_memory().await.unwrap();
        let user = backend.create_user("doc", "Dr Who", &[Role::CareProvider]).await.unwrap();
        let provider = backend.create_provider(user).await.unwrap();
        assert!(backend.provider_exists(provider).await.unwrap());
        assert!(!backend.provider_exists(provider + 1).await.unwrap());

        let mission = backend
            .insert_region(&NewRegion::active("94110", "San Francisco"))
            .await
            .unwrap();
        let soma = backend
            .insert_region(&NewRegion::active("94103", "San Francisco"))
            .await
            .unwrap();
        let oakland = backend
            .insert_region(&NewRegion::active("94607", "Alameda"))
            .await
            .unwrap();
        let blank = backend.insert_region(&NewRegion::active("9999", "  ")).await.unwrap();
        for region in [mission, soma, oakland, blank] {
            backend.assign_provider_region(provider, region).await.unwrap();
        }
        backend.assign_provider_region(provider, mission).await.unwrap();

        for (i, region) in [mission, mission, soma].into_iter().enumerate() {
            let patient = NewPatient::new(
                &format!("P{i}"),
                "Test",
                NaiveDate::from_ymd_opt(1950, 1, 1).unwrap(),
                "94110",
            );
            let id = backend.insert_patient(&patient, at(1, 9)).await.unwrap();
            backend.set_patient_region(id, Some(region), at(1, 9)).await.unwrap();
        }

        let refresh = backend.refresh_service_area_maps(at(2, 9)).await.unwrap();
        assert_eq!(refresh.county_rows, 2);
        assert_eq!(refresh.zip_rows, 4);

        let counties = backend.list_cached_provider_counties(provider).await.unwrap();
        let names: Vec<&str> = counties.iter().map(|c| c.county.as_str()).collect();
        assert_eq!(names, vec!["Alameda", "San Francisco"]);
        assert_eq!(counties[0].patient_count, 0);
        assert_eq!(counties[1].patient_count, 3);

        let zips = backend.list_cached_provider_zip_codes(provider).await.unwrap();
        let codes: Vec<&str> = zips.iter().map(|z| z.zip_code.as_str()).collect();
        assert_eq!(codes, vec!["9999", "94103", "94110", "94607"]);
        assert_eq!(zips[2].patient_count, 2);

        let live = backend.list_provider_region_counties(provider).await.unwrap();
        assert_eq!(live, vec!["Alameda".to_string(), "San Francisco".to_string()]);
        assert_eq!(
            backend.list_provider_region_ids(provider).await.unwrap(),
            vec![mission, soma, oakland, blank]
        );

        // A second refresh replaces rather than appends.
        backend.refresh_service_area_maps(at(3, 9)).await.unwrap();
        assert_eq!(
            count(&backend, "SELECT COUNT(*) FROM dashboard_provider_county_map").await,
            2
        );
    }

    #[tokio::test]
    async fn test_task_logs_keep_raw_values() {
        let backend = LibSqlBackend::new_memory().await.unwrap();
        let entries = vec![
            TaskLogEntry {
                staff_id: "12".into(),
                patient_id: Some("300".into()),
                task_date: "2024-01-05".into(),
                minutes: Some(25),
                task_description: Some("Care plan review".into()),
                notes: None,
            },
            TaskLogEntry {
                staff_id: "legacy-7".into(),
                patient_id: None,
                task_date: "not a date".into(),
                minutes: None,
                task_description: None,
                notes: Some("imported".into()),
            },
        ];
        let inserted = backend
            .insert_task_logs(StaffKind::Coordinator, &entries)
            .await
            .unwrap();
        assert_eq!(inserted, 2);

        let rows = backend.list_task_logs(StaffKind::Coordinator).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].entry.staff_id, "12");
        assert_eq!(rows[0].entry.minutes, Some(25));
        assert_eq!(rows[1].entry.staff_id, "legacy-7");
        assert!(rows[1].entry.minutes.is_none());
        assert!(backend.list_task_logs(StaffKind::Provider).await.unwrap().is_empty());
    }

    fn log(staff: &str, patient: &str, date: &str, minutes: i64) -> TaskLogEntry {
        TaskLogEntry {
            staff_id: staff.into(),
            patient_id: Some(patient.into()),
            task_date: date.into(),
            minutes: Some(minutes),
            task_description: None,
            notes: None,
        }
    }

    #[tokio::test]
    async fn test_rebuild_summaries_drops_previous_rows() {
        let backend = LibSqlBackend::new_memory().await.unwrap();
        backend
            .insert_task_logs(
                StaffKind::Coordinator,
                &[
                    log("1", "100", "2024-01-05", 30),
                    log("1", "101", "2024-01-09", 45),
                    log("2", "100", "2024-01-10", 40),
                    log("x9", "100", "2024-01-10", 40),
                ],
            )
            .await
            .unwrap();

        let report = backend
            .rebuild_summaries(StaffKind::Coordinator, Granularity::Monthly, at(1, 9))
            .await
            .unwrap();
        assert_eq!(report.rows_written, 2);
        assert_eq!(report.skipped.invalid_staff_id, 1);

        // Staff 2's only row is gone from the log; its summary must go too.
        backend
            .conn()
            .execute("DELETE FROM coordinator_tasks WHERE CAST(coordinator_id AS TEXT) = '2'", ())
            .await
            .unwrap();
        let report = backend
            .rebuild_summaries(StaffKind::Coordinator, Granularity::Monthly, at(2, 9))
            .await
            .unwrap();
        assert_eq!(report.rows_written, 1);

        let rows = backend
            .list_summaries(StaffKind::Coordinator, Granularity::Monthly, None)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].staff_id, 1);
        assert_eq!(rows[0].total_minutes, 75);
        assert_eq!(rows[0].avg_minutes_per_task, dec!(37.50));

        assert!(
            backend
                .list_summaries(StaffKind::Coordinator, Granularity::Monthly, Some(2))
                .await
                .unwrap()
                .is_empty()
        );
        assert!(
            backend
                .list_summaries(StaffKind::Coordinator, Granularity::Weekly, None)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_readers_never_see_partial_onboarding() {
        use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

        let backend = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let creator = backend.create_user("pot", "Pat Pot", &[Role::Onboarding]).await.unwrap();
        let done = Arc::new(AtomicBool::new(false));
        let partial = Arc::new(AtomicUsize::new(0));
        let observed = Arc::new(AtomicUsize::new(0));

        let mut readers = Vec::new();
        for _ in 0..3 {
            let backend = Arc::clone(&backend);
            let done = Arc::clone(&done);
            let partial = Arc::clone(&partial);
            let observed = Arc::clone(&observed);
            readers.push(tokio::spawn(async move {
                loop {
                    let finished = done.load(Ordering::Acquire);
                    for entry in backend.list_onboarding_queue().await.unwrap() {
                        let tasks = backend.list_onboarding_tasks(entry.onboarding_id).await.unwrap();
                        observed.fetch_add(1, Ordering::Relaxed);
                        if tasks.len() != 15 {
                            partial.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    if finished {
                        break;
                    }
                    tokio::task::yield_now().await;
                }
            }));
        }

        let mut writers = Vec::new();
        for w in 0..4 {
            let backend = Arc::clone(&backend);
            writers.push(tokio::spawn(async move {
                for i in 0..10 {
                    backend
                        .create_onboarding(
                            &intake(&format!("W{w}"), &format!("N{i}")),
                            None,
                            creator,
                            at(1, 9),
                        )
                        .await
                        .unwrap();
                }
            }));
        }
        for writer in writers {
            writer.await.unwrap();
        }
        done.store(true, Ordering::Release);
        for reader in readers {
            reader.await.unwrap();
        }

        assert_eq!(backend.list_onboarding_queue().await.unwrap().len(), 40);
        assert!(observed.load(Ordering::Relaxed) > 0);
        assert_eq!(partial.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_billing_codes_ordered_by_band() {
        let backend = LibSqlBackend::new_memory().await.unwrap();
        backend.insert_billing_code("99439", Some("add-on"), 40, 59).await.unwrap();
        backend.insert_billing_code("99490", None, 20, 39).await.unwrap();
        let err = backend.insert_billing_code("bad", None, 50, 10).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));

        let codes = backend.list_billing_codes().await.unwrap();
        let names: Vec<&str> = codes.iter().map(|c| c.billing_code.as_str()).collect();
        assert_eq!(names, vec!["99490", "99439"]);
    }
}

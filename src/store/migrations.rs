//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "people_and_regions",
        sql: r#"
            CREATE TABLE IF NOT EXISTS users (
                user_id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE,
                full_name TEXT NOT NULL,
                created_date TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS user_roles (
                user_id INTEGER NOT NULL REFERENCES users(user_id),
                role TEXT NOT NULL,
                UNIQUE (user_id, role)
            );

            CREATE TABLE IF NOT EXISTS providers (
                provider_id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL UNIQUE REFERENCES users(user_id)
            );

            CREATE TABLE IF NOT EXISTS coordinators (
                coordinator_id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL UNIQUE REFERENCES users(user_id)
            );

            CREATE TABLE IF NOT EXISTS regions (
                region_id INTEGER PRIMARY KEY AUTOINCREMENT,
                zip_code TEXT NOT NULL,
                city TEXT,
                state TEXT,
                county TEXT,
                status TEXT NOT NULL DEFAULT 'active'
                    CHECK (status IN ('active', 'inactive')),
                created_date TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_regions_active_zip
                ON regions(zip_code) WHERE status = 'active';
            CREATE INDEX IF NOT EXISTS idx_regions_county ON regions(county);

            CREATE TABLE IF NOT EXISTS patients (
                patient_id INTEGER PRIMARY KEY AUTOINCREMENT,
                first_name TEXT NOT NULL,
                last_name TEXT NOT NULL,
                date_of_birth TEXT NOT NULL,
                gender TEXT,
                phone_primary TEXT,
                email TEXT,
                emergency_contact_name TEXT,
                emergency_contact_phone TEXT,
                address_street TEXT NOT NULL DEFAULT '',
                address_city TEXT NOT NULL DEFAULT '',
                address_state TEXT NOT NULL DEFAULT '',
                address_zip TEXT NOT NULL DEFAULT '',
                insurance_primary TEXT,
                insurance_policy_number TEXT,
                status TEXT NOT NULL DEFAULT 'Active',
                medical_records_requested INTEGER NOT NULL DEFAULT 0,
                referral_documents_received INTEGER NOT NULL DEFAULT 0,
                insurance_cards_received INTEGER NOT NULL DEFAULT 0,
                emed_signature_received INTEGER NOT NULL DEFAULT 0,
                hypertension INTEGER NOT NULL DEFAULT 0,
                mental_health_concerns INTEGER NOT NULL DEFAULT 0,
                dementia INTEGER NOT NULL DEFAULT 0,
                region_id INTEGER REFERENCES regions(region_id),
                enrollment_date TEXT,
                discharge_date TEXT,
                created_date TEXT NOT NULL,
                updated_date TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_patients_region ON patients(region_id);

            CREATE TABLE IF NOT EXISTS region_providers (
                region_id INTEGER NOT NULL REFERENCES regions(region_id),
                provider_id INTEGER NOT NULL REFERENCES providers(provider_id),
                UNIQUE (region_id, provider_id)
            );
            CREATE INDEX IF NOT EXISTS idx_region_providers_provider
                ON region_providers(provider_id);

            CREATE TABLE IF NOT EXISTS user_patient_assignments (
                user_id INTEGER NOT NULL REFERENCES users(user_id),
                patient_id INTEGER NOT NULL REFERENCES patients(patient_id),
                assignment_date TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE (user_id, patient_id)
            );
        "#,
    },
    Migration {
        version: 2,
        name: "onboarding_workflow",
        sql: r#"
            CREATE TABLE IF NOT EXISTS workflow_templates (
                template_id INTEGER PRIMARY KEY,
                template_name TEXT NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS workflow_steps (
                step_id INTEGER PRIMARY KEY AUTOINCREMENT,
                template_id INTEGER NOT NULL REFERENCES workflow_templates(template_id),
                step_order INTEGER NOT NULL,
                task_name TEXT NOT NULL,
                deliverable TEXT,
                UNIQUE (template_id, step_order)
            );

            CREATE TABLE IF NOT EXISTS workflow_instances (
                instance_id INTEGER PRIMARY KEY AUTOINCREMENT,
                template_id INTEGER NOT NULL REFERENCES workflow_templates(template_id),
                status TEXT NOT NULL DEFAULT 'In Progress'
                    CHECK (status IN ('In Progress', 'Completed')),
                created_at TEXT NOT NULL,
                completed_at TEXT
            );

            CREATE TABLE IF NOT EXISTS onboarding_patients (
                onboarding_id INTEGER PRIMARY KEY AUTOINCREMENT,
                workflow_instance_id INTEGER NOT NULL REFERENCES workflow_instances(instance_id),
                patient_id INTEGER REFERENCES patients(patient_id),
                first_name TEXT NOT NULL,
                last_name TEXT NOT NULL,
                date_of_birth TEXT NOT NULL,
                gender TEXT,
                phone_primary TEXT,
                email TEXT,
                emergency_contact_name TEXT,
                emergency_contact_phone TEXT,
                address_street TEXT NOT NULL DEFAULT '',
                address_city TEXT NOT NULL DEFAULT '',
                address_state TEXT NOT NULL DEFAULT '',
                address_zip TEXT NOT NULL DEFAULT '',
                insurance_provider TEXT,
                policy_number TEXT,
                group_number TEXT,
                referral_source TEXT,
                referring_provider TEXT,
                referral_date TEXT,
                facility_assignment TEXT,
                assigned_pot_user_id INTEGER REFERENCES users(user_id),

                eligibility_status TEXT NOT NULL DEFAULT 'Pending Verification',
                eligibility_verified INTEGER NOT NULL DEFAULT 0,
                eligibility_notes TEXT,

                emed_chart_created INTEGER NOT NULL DEFAULT 0,
                chart_id TEXT,
                facility_confirmed INTEGER NOT NULL DEFAULT 0,
                chart_notes TEXT,

                medical_records_requested INTEGER NOT NULL DEFAULT 0,
                referral_documents_received INTEGER NOT NULL DEFAULT 0,
                insurance_cards_received INTEGER NOT NULL DEFAULT 0,
                emed_signature_received INTEGER NOT NULL DEFAULT 0,
                prescreen_completed INTEGER NOT NULL DEFAULT 0,
                patient_contacted INTEGER NOT NULL DEFAULT 0,
                hypertension INTEGER NOT NULL DEFAULT 0,
                mental_health_concerns INTEGER NOT NULL DEFAULT 0,
                dementia INTEGER NOT NULL DEFAULT 0,
                intake_notes TEXT,

                tv_scheduled INTEGER NOT NULL DEFAULT 0,
                tv_date TEXT,
                tv_time TEXT,
                assigned_pcpm_user_id INTEGER REFERENCES users(user_id),
                patient_notified INTEGER NOT NULL DEFAULT 0,
                handoff_notes TEXT,

                stage1_complete INTEGER NOT NULL DEFAULT 0,
                stage2_complete INTEGER NOT NULL DEFAULT 0 CHECK (stage2_complete <= stage1_complete),
                stage3_complete INTEGER NOT NULL DEFAULT 0 CHECK (stage3_complete <= stage2_complete),
                stage4_complete INTEGER NOT NULL DEFAULT 0 CHECK (stage4_complete <= stage3_complete),
                stage5_complete INTEGER NOT NULL DEFAULT 0 CHECK (stage5_complete <= stage4_complete),

                created_date TEXT NOT NULL,
                updated_date TEXT NOT NULL,
                completed_date TEXT,
                CHECK (
                    completed_date IS NULL
                    OR (stage1_complete = 1 AND stage2_complete = 1 AND stage3_complete = 1
                        AND stage4_complete = 1 AND stage5_complete = 1)
                )
            );
            CREATE INDEX IF NOT EXISTS idx_onboarding_open
                ON onboarding_patients(completed_date, created_date);

            CREATE TABLE IF NOT EXISTS onboarding_tasks (
                task_id INTEGER PRIMARY KEY AUTOINCREMENT,
                onboarding_id INTEGER NOT NULL REFERENCES onboarding_patients(onboarding_id),
                workflow_step_id INTEGER NOT NULL REFERENCES workflow_steps(step_id),
                task_name TEXT NOT NULL,
                task_stage INTEGER NOT NULL CHECK (task_stage BETWEEN 1 AND 5),
                task_order INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'Pending' CHECK (status IN ('Pending', 'Complete')),
                completed_by_user_id INTEGER REFERENCES users(user_id),
                completed_date TEXT,
                notes TEXT,
                created_date TEXT NOT NULL,
                updated_date TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_onboarding_tasks_record
                ON onboarding_tasks(onboarding_id, task_order);

            INSERT OR IGNORE INTO workflow_templates (template_id, template_name)
                VALUES (1, 'Patient Onboarding');

            INSERT OR IGNORE INTO workflow_steps (template_id, step_order, task_name, deliverable) VALUES
                (1, 1, 'Receive referral', 'Referral logged'),
                (1, 2, 'Enter patient demographics', 'Registration record'),
                (1, 3, 'Assign onboarding owner', 'Owner assigned'),
                (1, 4, 'Verify insurance coverage', 'Coverage confirmed'),
                (1, 5, 'Confirm eligibility status', 'Eligibility decision'),
                (1, 6, 'Record eligibility notes', 'Eligibility notes'),
                (1, 7, 'Create EMed chart', 'Chart ID'),
                (1, 8, 'Confirm facility assignment', 'Facility confirmed'),
                (1, 9, 'Record chart notes', 'Chart notes'),
                (1, 10, 'Request medical records', 'Records request'),
                (1, 11, 'Collect referral and insurance documents', 'Documents on file'),
                (1, 12, 'Complete prescreen call', 'Prescreen notes'),
                (1, 13, 'Schedule initial TV visit', 'TV appointment'),
                (1, 14, 'Assign PCPM', 'PCPM assigned'),
                (1, 15, 'Notify patient of TV visit', 'Patient notified');
        "#,
    },
    Migration {
        version: 3,
        name: "task_logs_and_summaries",
        sql: r#"
            CREATE TABLE IF NOT EXISTS coordinator_tasks (
                coordinator_task_id INTEGER PRIMARY KEY AUTOINCREMENT,
                coordinator_id TEXT NOT NULL,
                patient_id TEXT,
                task_date TEXT NOT NULL,
                duration_minutes INTEGER,
                task_description TEXT,
                notes TEXT,
                created_date TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_coordinator_tasks_staff
                ON coordinator_tasks(coordinator_id, task_date);

            CREATE TABLE IF NOT EXISTS provider_tasks (
                provider_task_id INTEGER PRIMARY KEY AUTOINCREMENT,
                provider_id TEXT NOT NULL,
                patient_id TEXT,
                task_date TEXT NOT NULL,
                minutes_of_service INTEGER,
                task_description TEXT,
                notes TEXT,
                created_date TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_provider_tasks_staff
                ON provider_tasks(provider_id, task_date);

            CREATE TABLE IF NOT EXISTS coordinator_billing_codes (
                code_id INTEGER PRIMARY KEY AUTOINCREMENT,
                billing_code TEXT NOT NULL,
                description TEXT,
                min_minutes INTEGER NOT NULL,
                max_minutes INTEGER NOT NULL,
                CHECK (min_minutes <= max_minutes)
            );

            CREATE TABLE IF NOT EXISTS task_summaries (
                summary_id INTEGER PRIMARY KEY AUTOINCREMENT,
                staff_kind TEXT NOT NULL CHECK (staff_kind IN ('coordinator', 'provider')),
                granularity TEXT NOT NULL CHECK (granularity IN ('monthly', 'weekly')),
                staff_id INTEGER NOT NULL,
                year INTEGER NOT NULL,
                period INTEGER NOT NULL,
                period_start TEXT NOT NULL,
                period_end TEXT NOT NULL,
                total_minutes INTEGER NOT NULL,
                total_tasks INTEGER NOT NULL,
                distinct_patients INTEGER NOT NULL,
                avg_minutes_per_task TEXT NOT NULL,
                minutes_per_patient TEXT NOT NULL,
                refreshed_at TEXT NOT NULL,
                UNIQUE (staff_kind, granularity, staff_id, year, period)
            );
        "#,
    },
    Migration {
        version: 4,
        name: "service_area_caches",
        sql: r#"
            CREATE TABLE IF NOT EXISTS dashboard_provider_county_map (
                map_id INTEGER PRIMARY KEY AUTOINCREMENT,
                provider_id INTEGER NOT NULL,
                county TEXT NOT NULL,
                state TEXT,
                patient_count INTEGER NOT NULL DEFAULT 0,
                updated_date TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_provider_county_map_provider
                ON dashboard_provider_county_map(provider_id);

            CREATE TABLE IF NOT EXISTS dashboard_provider_zip_map (
                map_id INTEGER PRIMARY KEY AUTOINCREMENT,
                provider_id INTEGER NOT NULL,
                zip_code TEXT NOT NULL,
                city TEXT,
                state TEXT,
                patient_count INTEGER NOT NULL DEFAULT 0,
                updated_date TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_provider_zip_map_provider
                ON dashboard_provider_zip_map(provider_id);
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn).await?;
    tracing::debug!(version, "Database migrations complete");
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => row.get(0).map_err(|e| {
            DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
        }),
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

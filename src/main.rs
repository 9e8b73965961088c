use std::sync::Arc;

use care_ops::aggregation::TaskAggregator;
use care_ops::config::AppConfig;
use care_ops::onboarding::OnboardingEngine;
use care_ops::patients::PatientRegistry;
use care_ops::regions::RegionReconciler;
use care_ops::server::{AppState, app};
use care_ops::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = AppConfig::from_env()?;

    eprintln!("Care Ops v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://0.0.0.0:{}/api", config.http_port);

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .unwrap_or_else(|e| {
                eprintln!(
                    "Error: Failed to open database at {}: {}",
                    config.db_path.display(),
                    e
                );
                std::process::exit(1);
            }),
    );
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!(
        "   Regions: min prefix {}, unassigned providers {:?}\n",
        config.regions.zip_min_prefix_len, config.regions.unassigned_provider_policy
    );

    // ── Services ─────────────────────────────────────────────────────────
    let state = AppState {
        onboarding: Arc::new(OnboardingEngine::new(Arc::clone(&db))),
        regions: Arc::new(RegionReconciler::new(Arc::clone(&db), config.regions.clone())),
        aggregation: Arc::new(TaskAggregator::new(Arc::clone(&db))),
        patients: Arc::new(PatientRegistry::new(Arc::clone(&db))),
    };

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.http_port)).await?;
    tracing::info!(port = config.http_port, "HTTP server started");
    axum::serve(listener, app(state)).await?;

    Ok(())
}

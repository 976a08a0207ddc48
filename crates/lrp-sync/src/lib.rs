//! CRM reconciliation for Lead Router Pro: environment configuration, the reconciliation
//! engine, its run report, and an optional cron scheduler.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use lrp_storage::SqliteStore;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

mod config;
mod engine;
mod report;

pub use config::{LeadRouterConfig, DEFAULT_GHL_BASE_URL, MAX_PAGE_LIMIT};
pub use engine::{
    classify_contact, ContactRole, ReconcileOptions, ReconciliationEngine, SyncError,
    SYNC_LEAD_SOURCE,
};
pub use report::{EntityCounts, SyncReport};

pub const CRATE_NAME: &str = "lrp-sync";

/// Connects and migrates the configured SQLite database.
pub async fn open_store(config: &LeadRouterConfig) -> Result<Arc<SqliteStore>> {
    let store = SqliteStore::connect(&config.database_url)
        .await
        .with_context(|| format!("connecting to {}", config.database_url))?;
    store.migrate().await.context("running migrations")?;
    Ok(Arc::new(store))
}

/// Engine wired from configuration; `fixture` swaps the live CRM for a JSON fixture.
pub async fn build_engine(
    config: &LeadRouterConfig,
    fixture: Option<&Path>,
) -> Result<ReconciliationEngine> {
    let store = open_store(config).await?;
    let crm = config.crm_client(fixture)?;
    let zips = Arc::new(config.zip_database()?);
    Ok(ReconciliationEngine::new(store, crm, zips).with_options(config.reconcile_options()))
}

pub async fn run_sync_once_from_env() -> Result<SyncReport> {
    let config = LeadRouterConfig::from_env();
    let engine = build_engine(&config, None).await?;
    Ok(engine.run().await?)
}

/// `None` unless `LRP_SCHEDULER_ENABLED` is set.
pub async fn maybe_build_scheduler(
    config: &LeadRouterConfig,
    engine: Arc<ReconciliationEngine>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sync_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let engine = engine.clone();
        Box::pin(async move {
            match engine.run().await {
                Ok(report) => info!(
                    run_id = %report.run_id,
                    vendor_changes = report.vendors.changes(),
                    lead_changes = report.leads.changes(),
                    "scheduled crm sync finished"
                ),
                Err(err) => error!(error = %err, "scheduled crm sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    info!(cron, "crm sync scheduled");
    Ok(Some(sched))
}

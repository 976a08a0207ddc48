use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use lrp_adapters::{CrmClient, FixtureCrmClient, GhlClient, GhlConfig};
use lrp_routing::{ServiceMatcher, ZipDatabase};
use lrp_storage::HttpClientConfig;

use crate::engine::ReconcileOptions;

pub const DEFAULT_GHL_BASE_URL: &str = "https://services.leadconnectorhq.com";
/// Largest page the contact search endpoint accepts.
pub const MAX_PAGE_LIMIT: usize = 500;

#[derive(Debug, Clone)]
pub struct LeadRouterConfig {
    pub database_url: String,
    pub ghl_base_url: String,
    pub ghl_private_token: Option<String>,
    pub ghl_location_id: Option<String>,
    pub ghl_pipeline_id: Option<String>,
    pub ghl_pipeline_stage_id: Option<String>,
    pub http_timeout_secs: u64,
    pub rate_limit_ms: u64,
    pub fetch_workers: usize,
    pub search_page_limit: usize,
    pub list_scan_cap: usize,
    pub zip_database: Option<PathBuf>,
    pub taxonomy_file: Option<PathBuf>,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub log_level: String,
}

impl LeadRouterConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`LeadRouterConfig::from_env`] with an injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let number = |key: &str| var(key).and_then(|v| v.trim().parse::<u64>().ok());

        Self {
            database_url: var("DATABASE_URL")
                .unwrap_or_else(|| "sqlite://lead_router.db".to_string()),
            ghl_base_url: var("GHL_API_BASE_URL")
                .unwrap_or_else(|| DEFAULT_GHL_BASE_URL.to_string()),
            ghl_private_token: var("GHL_PRIVATE_TOKEN"),
            ghl_location_id: var("GHL_LOCATION_ID"),
            ghl_pipeline_id: var("GHL_PIPELINE_ID"),
            ghl_pipeline_stage_id: var("GHL_PIPELINE_STAGE_ID"),
            http_timeout_secs: number("LRP_HTTP_TIMEOUT_SECS").unwrap_or(15),
            rate_limit_ms: number("LRP_RATE_LIMIT_MS").unwrap_or(120),
            fetch_workers: number("LRP_FETCH_WORKERS")
                .map(|n| (n as usize).max(1))
                .unwrap_or(3),
            search_page_limit: number("LRP_SEARCH_PAGE_LIMIT")
                .map(|n| (n as usize).clamp(1, MAX_PAGE_LIMIT))
                .unwrap_or(MAX_PAGE_LIMIT),
            list_scan_cap: number("LRP_LIST_SCAN_CAP")
                .map(|n| n as usize)
                .unwrap_or(15_000),
            zip_database: var("LRP_ZIP_DATABASE").map(PathBuf::from),
            taxonomy_file: var("LRP_TAXONOMY_FILE").map(PathBuf::from),
            scheduler_enabled: var("LRP_SCHEDULER_ENABLED")
                .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: var("LRP_SYNC_CRON").unwrap_or_else(|| "0 0 */6 * * *".to_string()),
            log_level: var("LRP_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            concurrency: self.fetch_workers,
            min_interval: Duration::from_millis(self.rate_limit_ms),
            ..HttpClientConfig::default()
        }
    }

    pub fn reconcile_options(&self) -> ReconcileOptions {
        ReconcileOptions {
            fetch_workers: self.fetch_workers,
            min_interval: Duration::from_millis(self.rate_limit_ms),
            page_limit: self.search_page_limit,
            scan_cap: self.list_scan_cap,
        }
    }

    pub fn ghl_config(&self) -> Result<GhlConfig> {
        Ok(GhlConfig {
            base_url: self.ghl_base_url.clone(),
            private_token: self
                .ghl_private_token
                .clone()
                .context("GHL_PRIVATE_TOKEN is not set")?,
            location_id: self
                .ghl_location_id
                .clone()
                .context("GHL_LOCATION_ID is not set")?,
            pipeline_id: self.ghl_pipeline_id.clone(),
            pipeline_stage_id: self.ghl_pipeline_stage_id.clone(),
        })
    }

    /// The live CRM, or the fixture CRM when `fixture` is given.
    pub fn crm_client(&self, fixture: Option<&std::path::Path>) -> Result<Arc<dyn CrmClient>> {
        match fixture {
            Some(path) => Ok(Arc::new(FixtureCrmClient::load(path)?)),
            None => Ok(Arc::new(GhlClient::new(
                self.ghl_config()?,
                self.http_client_config(),
            )?)),
        }
    }

    pub fn zip_database(&self) -> Result<ZipDatabase> {
        match &self.zip_database {
            Some(path) => ZipDatabase::load(path),
            None => ZipDatabase::embedded(),
        }
    }

    pub fn service_matcher(&self) -> Result<ServiceMatcher> {
        match &self.taxonomy_file {
            Some(path) => ServiceMatcher::load(path)
                .with_context(|| format!("loading service taxonomy {}", path.display())),
            None => ServiceMatcher::embedded().context("loading embedded service taxonomy"),
        }
    }
}

//! CRM capability contract, the GoHighLevel client, and a fixture-first CRM for tests and dry runs.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use lrp_core::OpportunityId;
use lrp_storage::FetchError;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

mod contact;
mod fixture;
mod ghl;
mod profile;

pub use contact::{normalize_tags, CrmContact};
pub use fixture::{FixtureCrmClient, FixtureDataset};
pub use ghl::{GhlClient, GhlConfig, GHL_API_VERSION};
pub use profile::{
    contact_zip, lead_profile, lead_status_from_tags, looks_like_vendor, parse_coverage,
    vendor_profile, vendor_status_from_tags, CrmFieldMap, TagRule, NEW_LEAD_TAG,
    VENDOR_SOURCE_MARKER, VENDOR_STATUS_RULES, VENDOR_TAGS,
};

pub const CRATE_NAME: &str = "lrp-adapters";

/// A failed create/update/fetch against the CRM, naming what was attempted.
#[derive(Debug, Error)]
#[error("crm {operation} failed for {entity}: {source}")]
pub struct ExternalApiError {
    pub entity: String,
    pub operation: &'static str,
    #[source]
    pub source: FetchError,
}

#[derive(Debug, Error)]
pub enum CrmError {
    #[error(transparent)]
    Api(#[from] ExternalApiError),
    #[error("malformed crm payload: {0}")]
    Payload(String),
    #[error("crm client is not configured: {0} missing")]
    NotConfigured(&'static str),
}

impl CrmError {
    pub fn api(entity: impl Into<String>, operation: &'static str, source: FetchError) -> Self {
        CrmError::Api(ExternalApiError {
            entity: entity.into(),
            operation,
            source,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrmContext {
    pub run_id: Uuid,
}

impl CrmContext {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
        }
    }
}

impl Default for CrmContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Opaque cursor returned by a paginated contact scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageCursor(pub Value);

#[derive(Debug, Clone, Default)]
pub struct ContactPage {
    pub contacts: Vec<CrmContact>,
    /// `None` once the scan is exhausted.
    pub next_cursor: Option<PageCursor>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContactDraft {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub company_name: Option<String>,
    pub source: Option<String>,
    pub tags: Vec<String>,
    pub custom_fields: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpportunityDraft {
    pub contact_id: String,
    pub name: String,
    pub source: Option<String>,
    pub monetary_value: Option<f64>,
}

/// Owner change carried by an [`OpportunityUpdate`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Assignee {
    #[default]
    Unchanged,
    User(String),
    Cleared,
}

impl Assignee {
    pub fn user(&self) -> Option<&str> {
        match self {
            Assignee::User(id) => Some(id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpportunityUpdate {
    pub assigned_to: Assignee,
    pub status: Option<String>,
    pub custom_fields: BTreeMap<String, String>,
}

/// Everything the routing and reconciliation engines need from the CRM.
#[async_trait]
pub trait CrmClient: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Ok(None)` means the CRM answered that the contact does not exist.
    async fn get_contact(
        &self,
        ctx: &CrmContext,
        contact_id: &str,
    ) -> Result<Option<CrmContact>, CrmError>;

    /// First contact whose email matches exactly, ignoring case.
    async fn search_contact_by_email(
        &self,
        ctx: &CrmContext,
        email: &str,
    ) -> Result<Option<CrmContact>, CrmError>;

    async fn list_contacts_page(
        &self,
        ctx: &CrmContext,
        cursor: Option<&PageCursor>,
        limit: usize,
    ) -> Result<ContactPage, CrmError>;

    async fn create_contact(
        &self,
        ctx: &CrmContext,
        draft: &ContactDraft,
    ) -> Result<CrmContact, CrmError>;

    async fn update_contact(
        &self,
        ctx: &CrmContext,
        contact_id: &str,
        draft: &ContactDraft,
    ) -> Result<(), CrmError>;

    async fn create_opportunity(
        &self,
        ctx: &CrmContext,
        draft: &OpportunityDraft,
    ) -> Result<OpportunityId, CrmError>;

    async fn update_opportunity(
        &self,
        ctx: &CrmContext,
        opportunity_id: &OpportunityId,
        update: &OpportunityUpdate,
    ) -> Result<(), CrmError>;

    /// Outbound calls made so far.
    fn external_calls(&self) -> u64;
}

pub fn read_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing json {}", path.display()))
}

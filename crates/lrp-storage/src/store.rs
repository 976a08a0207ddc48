use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lrp_core::{
    InvalidPercentage, Lead, LeadStatus, NewLead, NewVendor, OpportunityId, RoutingConfig,
    Vendor, VendorStatus,
};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt {column} value '{value}'")]
    Decode { column: &'static str, value: String },
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
    #[error(transparent)]
    InvalidSetting(#[from] InvalidPercentage),
}

/// Persistence seam shared by routing, intake and reconciliation.
#[async_trait]
pub trait LeadRouterStore: Send + Sync {
    async fn list_vendors(&self) -> Result<Vec<Vendor>, StoreError>;
    async fn get_vendor(&self, id: Uuid) -> Result<Option<Vendor>, StoreError>;
    async fn find_vendor_by_contact_id(
        &self,
        contact_id: &str,
    ) -> Result<Option<Vendor>, StoreError>;
    async fn find_vendor_by_email(&self, email: &str) -> Result<Option<Vendor>, StoreError>;
    async fn insert_vendor(&self, vendor: NewVendor) -> Result<Vendor, StoreError>;
    /// Writes every profile field. `last_lead_assigned` is only ever written by [`Self::claim_vendor`].
    async fn update_vendor(&self, vendor: &Vendor) -> Result<(), StoreError>;
    async fn set_vendor_status(&self, id: Uuid, status: VendorStatus) -> Result<(), StoreError>;
    /// Compare-and-swap on `last_lead_assigned`; `false` means another assignment won the race.
    async fn claim_vendor(
        &self,
        id: Uuid,
        expected: Option<DateTime<Utc>>,
        assigned_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn list_leads(&self) -> Result<Vec<Lead>, StoreError>;
    async fn get_lead(&self, id: Uuid) -> Result<Option<Lead>, StoreError>;
    async fn find_lead_by_contact_id(&self, contact_id: &str) -> Result<Option<Lead>, StoreError>;
    async fn find_lead_by_opportunity_id(
        &self,
        opportunity_id: &OpportunityId,
    ) -> Result<Option<Lead>, StoreError>;
    async fn find_lead_by_email(&self, email: &str) -> Result<Option<Lead>, StoreError>;
    async fn insert_lead(&self, lead: NewLead) -> Result<Lead, StoreError>;
    async fn update_lead(&self, lead: &Lead) -> Result<(), StoreError>;
    async fn set_lead_status(&self, id: Uuid, status: LeadStatus) -> Result<(), StoreError>;
    async fn assign_lead(&self, id: Uuid, vendor_id: Uuid) -> Result<(), StoreError>;
    /// Drops the vendor and marks the lead `unassigned`.
    async fn release_lead(&self, id: Uuid) -> Result<(), StoreError>;
    async fn attach_opportunity(
        &self,
        id: Uuid,
        opportunity_id: &OpportunityId,
    ) -> Result<(), StoreError>;

    async fn routing_config(&self) -> Result<RoutingConfig, StoreError>;
    async fn set_routing_config(&self, config: RoutingConfig) -> Result<(), StoreError>;
}

//! Opportunity-first lead intake and reassignment.

use std::collections::BTreeMap;
use std::sync::Arc;

use lrp_adapters::{
    Assignee, ContactDraft, CrmClient, CrmContext, CrmError, CrmFieldMap, OpportunityDraft,
    OpportunityUpdate, NEW_LEAD_TAG,
};
use lrp_core::{Lead, LeadDetails, LeadStatus, NewLead, OpportunityId, Vendor};
use lrp_storage::StoreError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::router::{RouteDecision, RoutingError, RoutingRequest, RoutingService};
use crate::selector::NoEligibleVendor;

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error(transparent)]
    Crm(#[from] CrmError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Routing(RoutingError),
    #[error("lead {0} not found")]
    LeadNotFound(Uuid),
    #[error("lead {0} has neither a crm contact nor an email to create one")]
    LeadWithoutContact(Uuid),
}

/// A normalized inbound lead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntakeRequest {
    pub customer_name: String,
    pub customer_email: Option<String>,
    pub customer_phone: Option<String>,
    pub category: String,
    pub specific_service: Option<String>,
    pub zip_code: String,
    pub source: String,
}

#[derive(Debug, Clone)]
pub enum IntakeOutcome {
    Assigned { lead: Lead, decision: RouteDecision },
    /// No vendor qualified; a lead without a vendor is stored as `unassigned`. Not an error.
    Unassigned { lead: Lead },
}

impl IntakeOutcome {
    pub fn lead(&self) -> &Lead {
        match self {
            IntakeOutcome::Assigned { lead, .. } | IntakeOutcome::Unassigned { lead } => lead,
        }
    }
}

pub struct LeadIntakeService {
    crm: Arc<dyn CrmClient>,
    routing: RoutingService,
    fields: CrmFieldMap,
}

impl LeadIntakeService {
    pub fn new(crm: Arc<dyn CrmClient>, routing: RoutingService, fields: CrmFieldMap) -> Self {
        Self {
            crm,
            routing,
            fields,
        }
    }

    /// Contact, then opportunity, then the local lead row, then routing.
    pub async fn intake(
        &self,
        ctx: &CrmContext,
        request: &IntakeRequest,
    ) -> Result<IntakeOutcome, IntakeError> {
        let span = info_span!("lead_intake", run_id = %ctx.run_id, category = %request.category);
        self.intake_inner(ctx, request).instrument(span).await
    }

    async fn intake_inner(
        &self,
        ctx: &CrmContext,
        request: &IntakeRequest,
    ) -> Result<IntakeOutcome, IntakeError> {
        let contact_id = self.ensure_contact(ctx, request).await?;
        let service = request
            .specific_service
            .clone()
            .unwrap_or_else(|| request.category.clone());
        let opportunity_id = self
            .crm
            .create_opportunity(
                ctx,
                &OpportunityDraft {
                    contact_id: contact_id.clone(),
                    name: format!("{service} - {}", request.customer_name),
                    source: Some(request.source.clone()),
                    monetary_value: None,
                },
            )
            .await?;

        let mut details = LeadDetails {
            customer_name: request.customer_name.clone(),
            customer_email: request
                .customer_email
                .as_deref()
                .and_then(lrp_core::normalize_email),
            customer_phone: request.customer_phone.clone(),
            primary_service_category: request.category.clone(),
            specific_service_requested: request.specific_service.clone(),
            service_zip_code: Some(request.zip_code.clone()).filter(|z| !z.trim().is_empty()),
            service_state: None,
            service_county: None,
        };
        self.enrich_location(&mut details);

        let lead = self
            .routing
            .store()
            .insert_lead(NewLead::for_opportunity(
                opportunity_id.clone(),
                contact_id,
                details,
                request.source.clone(),
            ))
            .await?;
        info!(lead_id = %lead.id, opportunity_id = %opportunity_id, "lead stored");

        let routing_request = RoutingRequest {
            category: request.category.clone(),
            specific_service: request.specific_service.clone(),
            zip_code: request.zip_code.clone(),
        };
        self.route_new_lead(ctx, lead, &opportunity_id, &routing_request)
            .await
    }

    /// Routes an existing lead to a vendor other than its current one.
    ///
    /// When no other vendor qualifies the previous assignment is released, locally and on the
    /// opportunity, and the lead is left `unassigned`.
    pub async fn reassign(
        &self,
        ctx: &CrmContext,
        lead_id: Uuid,
    ) -> Result<IntakeOutcome, IntakeError> {
        let store = self.routing.store();
        let mut lead = store
            .get_lead(lead_id)
            .await?
            .ok_or(IntakeError::LeadNotFound(lead_id))?;

        let opportunity_id = match lead.opportunity_id.clone() {
            Some(id) => id,
            None => {
                let id = self.create_opportunity_for(ctx, &lead).await?;
                store.attach_opportunity(lead.id, &id).await?;
                lead.opportunity_id = Some(id.clone());
                id
            }
        };

        if lead.details.service_county.is_none() {
            self.enrich_location(&mut lead.details);
            store.update_lead(&lead).await?;
        }

        let request = RoutingRequest::for_lead(&lead);
        let previous_vendor = lead.vendor_id;
        match self.routing.assign(&request, previous_vendor).await {
            Ok(decision) => self.record_assignment(ctx, lead, &opportunity_id, decision).await,
            Err(RoutingError::NoEligibleVendor(NoEligibleVendor)) => {
                match previous_vendor {
                    Some(vendor_id) => {
                        info!(lead_id = %lead.id, %vendor_id, "no other eligible vendor; releasing lead");
                        store.release_lead(lead.id).await?;
                        let update = OpportunityUpdate {
                            assigned_to: Assignee::Cleared,
                            ..OpportunityUpdate::default()
                        };
                        self.crm
                            .update_opportunity(ctx, &opportunity_id, &update)
                            .await?;
                    }
                    None => store.set_lead_status(lead.id, LeadStatus::Unassigned).await?,
                }
                let lead = store.get_lead(lead.id).await?.unwrap_or(lead);
                Ok(IntakeOutcome::Unassigned { lead })
            }
            Err(err) => Err(IntakeError::Routing(err)),
        }
    }

    async fn route_new_lead(
        &self,
        ctx: &CrmContext,
        lead: Lead,
        opportunity_id: &OpportunityId,
        request: &RoutingRequest,
    ) -> Result<IntakeOutcome, IntakeError> {
        match self.routing.assign(request, None).await {
            Ok(decision) => self.record_assignment(ctx, lead, opportunity_id, decision).await,
            Err(RoutingError::NoEligibleVendor(NoEligibleVendor)) => {
                info!(lead_id = %lead.id, zip = %request.zip_code, "no eligible vendor; lead left unassigned");
                let store = self.routing.store();
                store.set_lead_status(lead.id, LeadStatus::Unassigned).await?;
                let lead = store.get_lead(lead.id).await?.unwrap_or(lead);
                Ok(IntakeOutcome::Unassigned { lead })
            }
            Err(err) => Err(IntakeError::Routing(err)),
        }
    }

    async fn record_assignment(
        &self,
        ctx: &CrmContext,
        lead: Lead,
        opportunity_id: &OpportunityId,
        decision: RouteDecision,
    ) -> Result<IntakeOutcome, IntakeError> {
        let store = self.routing.store();
        store.assign_lead(lead.id, decision.vendor.id).await?;
        match assignment_update(&decision.vendor) {
            Some(update) => self.crm.update_opportunity(ctx, opportunity_id, &update).await?,
            None => warn!(
                vendor_id = %decision.vendor.id,
                %opportunity_id,
                "vendor has no crm user; opportunity owner left unchanged"
            ),
        }
        let lead = store.get_lead(lead.id).await?.unwrap_or(lead);
        Ok(IntakeOutcome::Assigned { lead, decision })
    }

    async fn ensure_contact(
        &self,
        ctx: &CrmContext,
        request: &IntakeRequest,
    ) -> Result<String, IntakeError> {
        if let Some(email) = request.customer_email.as_deref().filter(|e| !e.trim().is_empty()) {
            if let Some(existing) = self.crm.search_contact_by_email(ctx, email).await? {
                return Ok(existing.id);
            }
        }

        let (first_name, last_name) = split_name(&request.customer_name);
        let mut custom_fields = BTreeMap::new();
        custom_fields.insert(
            self.fields.primary_service_category.clone(),
            request.category.clone(),
        );
        if let Some(specific) = &request.specific_service {
            custom_fields.insert(self.fields.lead_specific_service.clone(), specific.clone());
        }
        if let Some(zip_field) = self.fields.lead_zip_fields.first() {
            custom_fields.insert(zip_field.clone(), request.zip_code.clone());
        }
        let draft = ContactDraft {
            first_name,
            last_name,
            email: request.customer_email.clone(),
            phone: request.customer_phone.clone(),
            company_name: None,
            source: Some(request.source.clone()),
            tags: vec![NEW_LEAD_TAG.to_string()],
            custom_fields,
        };
        Ok(self.crm.create_contact(ctx, &draft).await?.id)
    }

    async fn create_opportunity_for(
        &self,
        ctx: &CrmContext,
        lead: &Lead,
    ) -> Result<OpportunityId, IntakeError> {
        let contact_id = match &lead.ghl_contact_id {
            Some(id) => id.clone(),
            None => {
                let request = IntakeRequest {
                    customer_name: lead.details.customer_name.clone(),
                    customer_email: lead.details.customer_email.clone(),
                    customer_phone: lead.details.customer_phone.clone(),
                    category: lead.details.primary_service_category.clone(),
                    specific_service: lead.details.specific_service_requested.clone(),
                    zip_code: lead.details.service_zip_code.clone().unwrap_or_default(),
                    source: lead.source.clone(),
                };
                if request.customer_email.is_none() {
                    return Err(IntakeError::LeadWithoutContact(lead.id));
                }
                self.ensure_contact(ctx, &request).await?
            }
        };
        let service = lead
            .details
            .specific_service_requested
            .clone()
            .unwrap_or_else(|| lead.details.primary_service_category.clone());
        Ok(self
            .crm
            .create_opportunity(
                ctx,
                &OpportunityDraft {
                    contact_id,
                    name: format!("{service} - {}", lead.details.customer_name),
                    source: Some(lead.source.clone()),
                    monetary_value: None,
                },
            )
            .await?)
    }

    fn enrich_location(&self, details: &mut LeadDetails) {
        let Some(zip) = details.service_zip_code.as_deref() else {
            return;
        };
        if let Ok(location) = self.routing.router().zips().resolve(zip) {
            details.service_zip_code = Some(location.zip.clone());
            details.service_state = Some(location.state.clone());
            details.service_county = Some(location.county.clone());
        }
    }
}

/// `None` when the vendor has no CRM user to own the opportunity.
fn assignment_update(vendor: &Vendor) -> Option<OpportunityUpdate> {
    let user = vendor
        .ghl_user_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())?;
    Some(OpportunityUpdate {
        assigned_to: Assignee::User(user.to_string()),
        status: None,
        custom_fields: BTreeMap::new(),
    })
}

fn split_name(full: &str) -> (Option<String>, Option<String>) {
    let mut parts = full.split_whitespace();
    let first = parts.next().map(str::to_string);
    let rest = parts.collect::<Vec<_>>().join(" ");
    (first, Some(rest).filter(|r| !r.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use lrp_adapters::FixtureCrmClient;
    use lrp_core::{CoverageType, NewVendor, VendorStatus};
    use lrp_storage::{LeadRouterStore, SqliteStore};
    use tempfile::TempDir;

    use crate::{FixedDraw, LeadRouter, ServiceMatcher, ZipDatabase};

    async fn service(crm: Arc<FixtureCrmClient>) -> (TempDir, Arc<SqliteStore>, LeadIntakeService) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open_path(dir.path().join("intake.db"))
            .await
            .unwrap();
        store.migrate().await.unwrap();
        let store = Arc::new(store);
        let router = LeadRouter::new(
            Arc::new(ZipDatabase::embedded().unwrap()),
            Arc::new(ServiceMatcher::embedded().unwrap()),
        )
        .with_random(Arc::new(FixedDraw(0.0)));
        let intake = LeadIntakeService::new(
            crm,
            RoutingService::new(store.clone(), router),
            CrmFieldMap::default(),
        );
        (dir, store, intake)
    }

    fn detailer(user_id: Option<&str>) -> NewVendor {
        NewVendor {
            ghl_contact_id: Some("ghl-v-dock".into()),
            ghl_user_id: user_id.map(str::to_string),
            name: "Dockside".into(),
            email: Some("dock@vendors.test".into()),
            phone: None,
            company_name: "Dockside Detail".into(),
            services_offered: BTreeSet::from(["Boat Detailing".to_string()]),
            primary_service_category: Some("Boat Maintenance".into()),
            coverage_type: CoverageType::Global,
            coverage_states: BTreeSet::new(),
            coverage_counties: BTreeSet::new(),
            coverage_zips: BTreeSet::new(),
            status: VendorStatus::Active,
            taking_new_work: true,
            lead_close_percentage: 0.0,
        }
    }

    fn details(email: Option<&str>) -> LeadDetails {
        LeadDetails {
            customer_name: "Owen Park".into(),
            customer_email: email.map(str::to_string),
            primary_service_category: "Boat Maintenance".into(),
            specific_service_requested: Some("Boat Detailing".into()),
            service_zip_code: Some("33139".into()),
            ..LeadDetails::default()
        }
    }

    #[tokio::test]
    async fn reassigning_an_unknown_lead_fails() {
        let (_dir, _store, intake) = service(Arc::new(FixtureCrmClient::default())).await;
        let missing = Uuid::new_v4();
        let err = intake
            .reassign(&CrmContext::new(), missing)
            .await
            .unwrap_err();
        assert!(matches!(err, IntakeError::LeadNotFound(id) if id == missing));
    }

    #[tokio::test]
    async fn reassignment_creates_a_missing_opportunity_first() {
        let crm = Arc::new(FixtureCrmClient::default());
        let (_dir, store, intake) = service(crm.clone()).await;
        let vendor = store.insert_vendor(detailer(Some("usr-dock"))).await.unwrap();
        let lead = store
            .insert_lead(NewLead::from_contact(
                "ghl-l-owen",
                details(None),
                LeadStatus::Unassigned,
                "crm sync",
            ))
            .await
            .unwrap();

        let outcome = intake.reassign(&CrmContext::new(), lead.id).await.unwrap();
        let IntakeOutcome::Assigned { lead, decision } = outcome else {
            panic!("expected assignment");
        };
        assert_eq!(decision.vendor.id, vendor.id);
        let opportunity = lead.opportunity_id.expect("opportunity attached");
        let created = crm.opportunities().await;
        assert_eq!(created[&opportunity].contact_id, "ghl-l-owen");
        assert_eq!(lead.details.service_county.as_deref(), Some("Miami-Dade"));
    }

    #[tokio::test]
    async fn lead_without_contact_or_email_cannot_get_an_opportunity() {
        let crm = Arc::new(FixtureCrmClient::default());
        let (_dir, store, intake) = service(crm.clone()).await;
        let mut lead = store
            .insert_lead(NewLead::from_contact(
                "ghl-l-anon",
                details(None),
                LeadStatus::Unassigned,
                "crm sync",
            ))
            .await
            .unwrap();
        lead.ghl_contact_id = None;
        store.update_lead(&lead).await.unwrap();

        let err = intake
            .reassign(&CrmContext::new(), lead.id)
            .await
            .unwrap_err();
        assert!(matches!(err, IntakeError::LeadWithoutContact(id) if id == lead.id));
        assert!(crm.opportunities().await.is_empty());
        assert_eq!(crm.external_calls(), 0);
    }

    #[tokio::test]
    async fn vendor_without_crm_user_skips_the_opportunity_update() {
        let crm = Arc::new(FixtureCrmClient::default());
        let (_dir, store, intake) = service(crm.clone()).await;
        let vendor = store.insert_vendor(detailer(None)).await.unwrap();
        let request = IntakeRequest {
            customer_name: "Owen Park".into(),
            customer_email: Some("owen@example.com".into()),
            customer_phone: None,
            category: "Boat Maintenance".into(),
            specific_service: Some("Boat Detailing".into()),
            zip_code: "33139".into(),
            source: "Boat Maintenance Form".into(),
        };

        let outcome = intake.intake(&CrmContext::new(), &request).await.unwrap();
        assert_eq!(outcome.lead().vendor_id, Some(vendor.id));
        assert_eq!(outcome.lead().status, LeadStatus::Assigned);
        assert!(crm.opportunity_updates().await.is_empty());
    }

    #[test]
    fn assignment_update_needs_a_crm_user() {
        let now = chrono::Utc::now();
        let vendor = detailer(Some(" ")).into_vendor(Uuid::new_v4(), now);
        assert!(assignment_update(&vendor).is_none());

        let vendor = detailer(Some("usr-dock")).into_vendor(Uuid::new_v4(), now);
        let update = assignment_update(&vendor).unwrap();
        assert_eq!(update.assigned_to, Assignee::User("usr-dock".into()));
    }

    #[test]
    fn names_split_on_first_space() {
        assert_eq!(
            split_name("Carla  de la Cruz"),
            (Some("Carla".into()), Some("de la Cruz".into()))
        );
        assert_eq!(split_name("Cher"), (Some("Cher".into()), None));
        assert_eq!(split_name("  "), (None, None));
    }
}

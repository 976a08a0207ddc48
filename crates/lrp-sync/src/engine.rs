//! CRM reconciliation ("Sync V3").
//!
//! One run walks Collect Identifiers -> Unified Fetch -> Classify -> Vendor Reconcile ->
//! Lead Reconcile -> Report. The unified fetch has three phases, each entered only while local
//! identifiers remain unresolved: fetch by id through a bounded, rate-gated pool, one email
//! search per unresolved email, then a capped paginated scan of the whole contact list.
//!
//! Per-contact failures are collected into the report; only failing to read the local store
//! aborts a run.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use lrp_adapters::{
    lead_profile, looks_like_vendor, vendor_profile, CrmClient, CrmContact, CrmContext,
    CrmFieldMap, PageCursor,
};
use lrp_core::{Lead, LeadDetails, LeadProfile, LeadStatus, NewLead, NewVendor, Vendor, VendorStatus};
use lrp_routing::ZipDatabase;
use lrp_storage::{LeadRouterStore, MinIntervalGate, RateLimitedPool, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::report::{EntityCounts, SyncReport};

/// Source recorded on leads first seen through reconciliation.
pub const SYNC_LEAD_SOURCE: &str = "crm sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOptions {
    pub fetch_workers: usize,
    /// Minimum spacing between CRM calls made by the engine.
    pub min_interval: Duration,
    pub page_limit: usize,
    /// Contacts scanned before phase 3 gives up.
    pub scan_cap: usize,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            fetch_workers: 3,
            min_interval: Duration::from_millis(120),
            page_limit: 500,
            scan_cap: 15_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactRole {
    Vendor,
    Lead,
    Neither,
}

/// Staff never sync; vendor evidence beats lead evidence.
pub fn classify_contact(contact: &CrmContact, local_vendor: bool, local_lead: bool) -> ContactRole {
    if contact.is_staff() {
        ContactRole::Neither
    } else if local_vendor || looks_like_vendor(contact) {
        ContactRole::Vendor
    } else if local_lead {
        ContactRole::Lead
    } else {
        ContactRole::Neither
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum LocalKey {
    Vendor(Uuid),
    Lead(Uuid),
}

/// The identifiers a local record can be found by in the CRM.
#[derive(Debug, Clone)]
struct LocalIdentity {
    key: LocalKey,
    contact_id: Option<String>,
    email: Option<String>,
    opportunity_id: Option<String>,
}

impl LocalIdentity {
    fn matches(&self, contact: &CrmContact) -> bool {
        self.contact_id.as_deref() == Some(contact.id.as_str())
            || (self.email.is_some() && self.email == contact.normalized_email())
            || self.opportunity_id.as_deref().is_some_and(|opportunity| {
                contact.custom_fields.values().any(|v| v.trim() == opportunity)
            })
    }
}

fn collect_identities(vendors: &[Vendor], leads: &[Lead]) -> Vec<LocalIdentity> {
    let vendors = vendors.iter().map(|v| LocalIdentity {
        key: LocalKey::Vendor(v.id),
        contact_id: v.ghl_contact_id.clone(),
        email: v.normalized_email(),
        opportunity_id: None,
    });
    let leads = leads.iter().map(|l| LocalIdentity {
        key: LocalKey::Lead(l.id),
        contact_id: l.ghl_contact_id.clone(),
        email: l.normalized_email(),
        opportunity_id: l.opportunity_id.as_ref().map(|o| o.as_str().to_string()),
    });
    vendors
        .chain(leads)
        .filter(|i| i.contact_id.is_some() || i.email.is_some() || i.opportunity_id.is_some())
        .collect()
}

/// Position of local records by contact id, email and opportunity id. First record wins.
#[derive(Debug, Default)]
struct RecordIndex {
    by_contact_id: BTreeMap<String, usize>,
    by_email: BTreeMap<String, usize>,
    by_opportunity: BTreeMap<String, usize>,
}

impl RecordIndex {
    fn insert(
        &mut self,
        pos: usize,
        contact_id: Option<&str>,
        email: Option<String>,
        opportunity_id: Option<&str>,
    ) {
        if let Some(id) = contact_id {
            self.by_contact_id.entry(id.to_string()).or_insert(pos);
        }
        if let Some(email) = email {
            self.by_email.entry(email).or_insert(pos);
        }
        if let Some(opportunity) = opportunity_id {
            self.by_opportunity.entry(opportunity.to_string()).or_insert(pos);
        }
    }

    fn vendors(vendors: &[Vendor]) -> Self {
        let mut index = Self::default();
        for (pos, v) in vendors.iter().enumerate() {
            index.insert(pos, v.ghl_contact_id.as_deref(), v.normalized_email(), None);
        }
        index
    }

    fn leads(leads: &[Lead]) -> Self {
        let mut index = Self::default();
        for (pos, l) in leads.iter().enumerate() {
            index.insert(
                pos,
                l.ghl_contact_id.as_deref(),
                l.normalized_email(),
                l.opportunity_id.as_ref().map(|o| o.as_str()),
            );
        }
        index
    }

    /// By contact id, then email, then an opportunity id stored in a custom field.
    fn find(&self, contact: &CrmContact) -> Option<usize> {
        self.by_contact_id
            .get(&contact.id)
            .or_else(|| {
                contact
                    .normalized_email()
                    .and_then(|email| self.by_email.get(&email))
            })
            .or_else(|| {
                contact
                    .custom_fields
                    .values()
                    .find_map(|v| self.by_opportunity.get(v.trim()))
            })
            .copied()
    }
}

#[derive(Debug, Default)]
struct FetchOutcome {
    contacts: BTreeMap<String, CrmContact>,
    /// Ids the CRM answered "not found" for.
    not_found: BTreeSet<String>,
    fetch_failed: BTreeSet<String>,
    pages_scanned: usize,
    scan_incomplete: bool,
    errors: Vec<String>,
}

impl FetchOutcome {
    fn insert(&mut self, contact: CrmContact) {
        self.contacts.entry(contact.id.clone()).or_insert(contact);
    }

    fn resolves(&self, identity: &LocalIdentity) -> bool {
        if let Some(id) = &identity.contact_id {
            if self.contacts.contains_key(id) {
                return true;
            }
        }
        self.contacts.values().any(|c| identity.matches(c))
    }

    fn unresolved<'a>(&self, identities: &'a [LocalIdentity]) -> Vec<&'a LocalIdentity> {
        identities.iter().filter(|i| !self.resolves(i)).collect()
    }

    /// Absent from the CRM as far as this run can tell.
    ///
    /// A failed fetch is never proof of deletion. When the scan stopped early only a
    /// not-found answer for the record's own contact id counts.
    fn is_missing(&self, identity: &LocalIdentity) -> bool {
        if self.resolves(identity) {
            return false;
        }
        if let Some(id) = &identity.contact_id {
            if self.fetch_failed.contains(id) {
                return false;
            }
        }
        if self.scan_incomplete {
            return identity
                .contact_id
                .as_ref()
                .is_some_and(|id| self.not_found.contains(id));
        }
        true
    }
}

pub struct ReconciliationEngine {
    store: Arc<dyn LeadRouterStore>,
    crm: Arc<dyn CrmClient>,
    zips: Arc<ZipDatabase>,
    fields: CrmFieldMap,
    options: ReconcileOptions,
    gate: Arc<MinIntervalGate>,
}

impl ReconciliationEngine {
    pub fn new(
        store: Arc<dyn LeadRouterStore>,
        crm: Arc<dyn CrmClient>,
        zips: Arc<ZipDatabase>,
    ) -> Self {
        let options = ReconcileOptions::default();
        Self {
            store,
            crm,
            zips,
            fields: CrmFieldMap::default(),
            gate: Arc::new(MinIntervalGate::new(options.min_interval)),
            options,
        }
    }

    pub fn with_fields(mut self, fields: CrmFieldMap) -> Self {
        self.fields = fields;
        self
    }

    pub fn with_options(mut self, options: ReconcileOptions) -> Self {
        self.gate = Arc::new(MinIntervalGate::new(options.min_interval));
        self.options = options;
        self
    }

    pub fn options(&self) -> &ReconcileOptions {
        &self.options
    }

    pub async fn run(&self) -> Result<SyncReport, SyncError> {
        let ctx = CrmContext::new();
        let span = info_span!("crm_sync", run_id = %ctx.run_id, crm = self.crm.name());
        self.run_with(&ctx).instrument(span).await
    }

    async fn run_with(&self, ctx: &CrmContext) -> Result<SyncReport, SyncError> {
        let started_at = Utc::now();
        let calls_before = self.crm.external_calls();

        let vendors = self.store.list_vendors().await?;
        let leads = self.store.list_leads().await?;
        let identities = collect_identities(&vendors, &leads);
        info!(
            vendors = vendors.len(),
            leads = leads.len(),
            identifiers = identities.len(),
            "collected local identifiers"
        );

        let mut fetched = FetchOutcome::default();
        if !identities.is_empty() {
            self.fetch_by_id(ctx, &identities, &mut fetched).await;
            self.search_by_email(ctx, &identities, &mut fetched).await;
            self.scan_pages(ctx, &identities, &mut fetched).await;
        }

        let mut errors = std::mem::take(&mut fetched.errors);
        let vendor_index = RecordIndex::vendors(&vendors);
        let lead_index = RecordIndex::leads(&leads);
        let mut vendor_contacts = Vec::new();
        let mut lead_contacts = Vec::new();
        for contact in fetched.contacts.values() {
            match classify_contact(
                contact,
                vendor_index.find(contact).is_some(),
                lead_index.find(contact).is_some(),
            ) {
                ContactRole::Vendor => vendor_contacts.push(contact),
                ContactRole::Lead => lead_contacts.push(contact),
                ContactRole::Neither => debug!(contact_id = %contact.id, "contact skipped"),
            }
        }
        info!(
            fetched = fetched.contacts.len(),
            vendors = vendor_contacts.len(),
            leads = lead_contacts.len(),
            "classified contacts"
        );

        let mut vendor_counts = self
            .reconcile_vendors(&vendor_contacts, vendors.clone(), &mut errors)
            .await;
        let mut lead_counts = self
            .reconcile_leads(&lead_contacts, leads.clone(), &mut errors)
            .await;

        // The fetch-failed exemption covers vendor identities as well as leads.
        let missing: BTreeSet<LocalKey> = identities
            .iter()
            .filter(|i| fetched.is_missing(i))
            .map(|i| i.key)
            .collect();
        vendor_counts.missing = self
            .mark_missing_vendors(&vendors, &missing, &mut errors)
            .await;
        lead_counts.missing = self.mark_missing_leads(&leads, &missing, &mut errors).await;

        let finished_at = Utc::now();
        let report = SyncReport {
            run_id: ctx.run_id,
            started_at,
            finished_at,
            elapsed_ms: (finished_at - started_at).num_milliseconds(),
            local_identifiers: identities.len(),
            contacts_fetched: fetched.contacts.len(),
            pages_scanned: fetched.pages_scanned,
            scan_incomplete: fetched.scan_incomplete,
            external_calls: self.crm.external_calls().saturating_sub(calls_before),
            vendors: vendor_counts,
            leads: lead_counts,
            fetch_failed: fetched.fetch_failed.into_iter().collect(),
            errors,
            success: true,
        };
        info!(
            vendors_created = report.vendors.created,
            vendors_updated = report.vendors.updated,
            vendors_missing = report.vendors.missing,
            leads_created = report.leads.created,
            leads_updated = report.leads.updated,
            leads_missing = report.leads.missing,
            errors = report.errors.len(),
            elapsed_ms = report.elapsed_ms,
            "crm sync finished"
        );
        Ok(report)
    }

    fn pool(&self) -> RateLimitedPool {
        RateLimitedPool::new(self.options.fetch_workers).with_gate(self.gate.clone())
    }

    async fn fetch_by_id(
        &self,
        ctx: &CrmContext,
        identities: &[LocalIdentity],
        fetched: &mut FetchOutcome,
    ) {
        let ids: BTreeSet<String> = identities
            .iter()
            .filter_map(|i| i.contact_id.clone())
            .collect();
        if ids.is_empty() {
            return;
        }
        let requested = ids.len();
        let results = self
            .pool()
            .run(ids.into_iter().collect(), |id: String| async move {
                let result = self.crm.get_contact(ctx, &id).await;
                (id, result)
            })
            .await;

        for (id, result) in results {
            match result {
                Ok(Some(contact)) => fetched.insert(contact),
                Ok(None) => {
                    fetched.not_found.insert(id);
                }
                Err(err) => {
                    warn!(contact_id = %id, error = %err, "contact fetch failed; exempt from missing checks");
                    fetched.errors.push(err.to_string());
                    fetched.fetch_failed.insert(id);
                }
            }
        }
        info!(
            requested,
            found = fetched.contacts.len(),
            not_found = fetched.not_found.len(),
            failed = fetched.fetch_failed.len(),
            "phase 1: fetch by id"
        );
    }

    async fn search_by_email(
        &self,
        ctx: &CrmContext,
        identities: &[LocalIdentity],
        fetched: &mut FetchOutcome,
    ) {
        let emails: BTreeSet<String> = fetched
            .unresolved(identities)
            .into_iter()
            .filter_map(|i| i.email.clone())
            .collect();
        if emails.is_empty() {
            return;
        }
        let searched = emails.len();
        let results = self
            .pool()
            .run(emails.into_iter().collect(), |email: String| async move {
                let result = self.crm.search_contact_by_email(ctx, &email).await;
                (email, result)
            })
            .await;

        let mut found = 0usize;
        for (email, result) in results {
            match result {
                Ok(Some(contact)) => {
                    found += 1;
                    fetched.insert(contact);
                }
                Ok(None) => debug!(%email, "no contact for email"),
                Err(err) => {
                    warn!(%email, error = %err, "email search failed");
                    fetched.errors.push(err.to_string());
                }
            }
        }
        info!(searched, found, "phase 2: search by email");
    }

    async fn scan_pages(
        &self,
        ctx: &CrmContext,
        identities: &[LocalIdentity],
        fetched: &mut FetchOutcome,
    ) {
        let mut pending = fetched.unresolved(identities);
        if pending.is_empty() {
            return;
        }
        let unresolved = pending.len();
        let mut cursor: Option<PageCursor> = None;
        let mut scanned = 0usize;

        loop {
            if scanned >= self.options.scan_cap {
                warn!(scanned, cap = self.options.scan_cap, "contact scan cap reached");
                fetched.scan_incomplete = true;
                break;
            }
            self.gate.wait().await;
            let page = match self
                .crm
                .list_contacts_page(ctx, cursor.as_ref(), self.options.page_limit)
                .await
            {
                Ok(page) => page,
                Err(err) => {
                    warn!(error = %err, pages = fetched.pages_scanned, "contact scan aborted");
                    fetched.errors.push(err.to_string());
                    fetched.scan_incomplete = true;
                    break;
                }
            };
            fetched.pages_scanned += 1;
            if page.contacts.is_empty() {
                break;
            }
            scanned += page.contacts.len();

            for contact in page.contacts {
                if pending.iter().any(|i| i.matches(&contact)) {
                    pending.retain(|i| !i.matches(&contact));
                    fetched.insert(contact);
                }
            }
            if pending.is_empty() {
                break;
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        info!(
            unresolved,
            resolved = unresolved - pending.len(),
            scanned,
            pages = fetched.pages_scanned,
            "phase 3: paginated scan"
        );
    }

    async fn reconcile_vendors(
        &self,
        contacts: &[&CrmContact],
        mut vendors: Vec<Vendor>,
        errors: &mut Vec<String>,
    ) -> EntityCounts {
        let mut counts = EntityCounts::default();
        let mut index = RecordIndex::vendors(&vendors);
        let mut seen = BTreeSet::new();

        for contact in contacts {
            counts.checked += 1;
            let profile = vendor_profile(contact, &self.fields);
            match index.find(contact) {
                Some(pos) => {
                    if !seen.insert(pos) {
                        debug!(contact_id = %contact.id, "vendor already reconciled from another contact");
                        continue;
                    }
                    let vendor = &mut vendors[pos];
                    if !vendor.apply_profile(&profile) {
                        continue;
                    }
                    match self.store.update_vendor(vendor).await {
                        Ok(()) => counts.updated += 1,
                        Err(err) => errors.push(format!("vendor {}: {err}", vendor.id)),
                    }
                }
                None => match self.store.insert_vendor(NewVendor::from_profile(&profile)).await {
                    Ok(vendor) => {
                        info!(vendor_id = %vendor.id, contact_id = %contact.id, status = %vendor.status, "vendor created from crm");
                        let pos = vendors.len();
                        index.insert(
                            pos,
                            vendor.ghl_contact_id.as_deref(),
                            vendor.normalized_email(),
                            None,
                        );
                        seen.insert(pos);
                        vendors.push(vendor);
                        counts.created += 1;
                    }
                    Err(err) => errors.push(format!("vendor contact {}: {err}", contact.id)),
                },
            }
        }
        info!(
            checked = counts.checked,
            created = counts.created,
            updated = counts.updated,
            "vendors reconciled"
        );
        counts
    }

    async fn reconcile_leads(
        &self,
        contacts: &[&CrmContact],
        mut leads: Vec<Lead>,
        errors: &mut Vec<String>,
    ) -> EntityCounts {
        let mut counts = EntityCounts::default();
        let mut index = RecordIndex::leads(&leads);
        let mut seen = BTreeSet::new();

        for contact in contacts {
            counts.checked += 1;
            let profile = lead_profile(contact, &self.fields);
            match index.find(contact) {
                Some(pos) => {
                    if !seen.insert(pos) {
                        continue;
                    }
                    let lead = &mut leads[pos];
                    let changed = lead.apply_profile(&profile);
                    let enriched = enrich_location(&self.zips, &mut lead.details);
                    if !(changed || enriched) {
                        continue;
                    }
                    match self.store.update_lead(lead).await {
                        Ok(()) => counts.updated += 1,
                        Err(err) => errors.push(format!("lead {}: {err}", lead.id)),
                    }
                }
                None => {
                    let mut details = details_from_profile(&profile);
                    enrich_location(&self.zips, &mut details);
                    let new_lead = NewLead::from_contact(
                        contact.id.clone(),
                        details,
                        profile.status_from_tags.unwrap_or(LeadStatus::Unassigned),
                        contact
                            .source
                            .clone()
                            .unwrap_or_else(|| SYNC_LEAD_SOURCE.to_string()),
                    );
                    match self.store.insert_lead(new_lead).await {
                        Ok(lead) => {
                            let pos = leads.len();
                            index.insert(pos, lead.ghl_contact_id.as_deref(), lead.normalized_email(), None);
                            seen.insert(pos);
                            leads.push(lead);
                            counts.created += 1;
                        }
                        Err(err) => errors.push(format!("lead contact {}: {err}", contact.id)),
                    }
                }
            }
        }
        info!(
            checked = counts.checked,
            created = counts.created,
            updated = counts.updated,
            "leads reconciled"
        );
        counts
    }

    async fn mark_missing_vendors(
        &self,
        vendors: &[Vendor],
        missing: &BTreeSet<LocalKey>,
        errors: &mut Vec<String>,
    ) -> usize {
        let mut marked = 0;
        for vendor in vendors {
            if vendor.status == VendorStatus::InactiveGhlDeleted
                || !missing.contains(&LocalKey::Vendor(vendor.id))
            {
                continue;
            }
            match self
                .store
                .set_vendor_status(vendor.id, VendorStatus::InactiveGhlDeleted)
                .await
            {
                Ok(()) => {
                    info!(vendor_id = %vendor.id, contact_id = ?vendor.ghl_contact_id, "vendor missing from crm");
                    marked += 1;
                }
                Err(err) => errors.push(format!("vendor {}: {err}", vendor.id)),
            }
        }
        marked
    }

    async fn mark_missing_leads(
        &self,
        leads: &[Lead],
        missing: &BTreeSet<LocalKey>,
        errors: &mut Vec<String>,
    ) -> usize {
        let mut marked = 0;
        for lead in leads {
            if lead.status == LeadStatus::InactiveGhlDeleted
                || !missing.contains(&LocalKey::Lead(lead.id))
            {
                continue;
            }
            match self
                .store
                .set_lead_status(lead.id, LeadStatus::InactiveGhlDeleted)
                .await
            {
                Ok(()) => {
                    info!(lead_id = %lead.id, contact_id = ?lead.ghl_contact_id, "lead missing from crm");
                    marked += 1;
                }
                Err(err) => errors.push(format!("lead {}: {err}", lead.id)),
            }
        }
        marked
    }
}

fn details_from_profile(profile: &LeadProfile) -> LeadDetails {
    LeadDetails {
        customer_name: profile.customer_name.clone().unwrap_or_default(),
        customer_email: profile.customer_email.clone(),
        customer_phone: profile.customer_phone.clone(),
        primary_service_category: profile.primary_service_category.clone().unwrap_or_default(),
        specific_service_requested: profile.specific_service_requested.clone(),
        service_zip_code: profile.service_zip_code.clone(),
        service_state: None,
        service_county: None,
    }
}

/// Fills state and county from the ZIP when either is missing. Returns whether anything changed.
fn enrich_location(zips: &ZipDatabase, details: &mut LeadDetails) -> bool {
    if details.service_state.is_some() && details.service_county.is_some() {
        return false;
    }
    let Some(location) = details
        .service_zip_code
        .as_deref()
        .and_then(|zip| zips.resolve(zip).ok())
    else {
        return false;
    };
    let before = (details.service_state.clone(), details.service_county.clone());
    details.service_state = Some(location.state);
    details.service_county = Some(location.county);
    before != (details.service_state.clone(), details.service_county.clone())
}

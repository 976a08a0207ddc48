//! Routing orchestration: eligibility filtering, selection and the atomic vendor claim.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, SubsecRound, Utc};
use lrp_core::{Lead, LeadStatus, RoutingConfig, Vendor, VendorStatus};
use lrp_storage::{LeadRouterStore, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::coverage::{coverage_reason, ZipLookup};
use crate::location::ZipDatabase;
use crate::selector::{select, NoEligibleVendor, RandomSource, SelectionMethod, SystemRandom};
use crate::taxonomy::{ServiceMatch, ServiceMatcher, ServiceRequest};

pub const MAX_CLAIM_ATTEMPTS: usize = 5;

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error(transparent)]
    NoEligibleVendor(#[from] NoEligibleVendor),
    #[error("vendor claim lost {attempts} times in a row")]
    ClaimContention { attempts: usize },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Which vendor statuses may receive leads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    /// Only `active` vendors.
    #[default]
    Live,
    /// Everything except deactivated and CRM-deleted vendors, for admin dry runs.
    Test,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRequest {
    pub category: String,
    pub specific_service: Option<String>,
    pub zip_code: String,
}

impl RoutingRequest {
    pub fn for_lead(lead: &Lead) -> Self {
        Self {
            category: lead.details.primary_service_category.clone(),
            specific_service: lead.details.specific_service_requested.clone(),
            zip_code: lead.details.service_zip_code.clone().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EligibleVendor {
    pub vendor: Vendor,
    pub coverage_reason: String,
    pub service_match: ServiceMatch,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouteDecision {
    pub vendor: Vendor,
    pub method: SelectionMethod,
    pub coverage_reason: String,
    pub service_match: ServiceMatch,
    pub pool_size: usize,
}

/// Pure routing over a vendor snapshot.
#[derive(Clone)]
pub struct LeadRouter {
    zips: Arc<ZipDatabase>,
    services: Arc<ServiceMatcher>,
    random: Arc<dyn RandomSource>,
    mode: RoutingMode,
}

impl LeadRouter {
    pub fn new(zips: Arc<ZipDatabase>, services: Arc<ServiceMatcher>) -> Self {
        Self {
            zips,
            services,
            random: Arc::new(SystemRandom),
            mode: RoutingMode::Live,
        }
    }

    pub fn with_random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = random;
        self
    }

    pub fn with_mode(mut self, mode: RoutingMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn zips(&self) -> &ZipDatabase {
        &self.zips
    }

    pub fn services(&self) -> &ServiceMatcher {
        &self.services
    }

    fn admits(&self, vendor: &Vendor) -> bool {
        let status_ok = match self.mode {
            RoutingMode::Live => vendor.status == VendorStatus::Active,
            RoutingMode::Test => !matches!(
                vendor.status,
                VendorStatus::Deactivated | VendorStatus::InactiveGhlDeleted
            ),
        };
        status_ok && vendor.taking_new_work
    }

    /// Status, then service, then coverage. Related-term matches are only used when no vendor
    /// passes with an exact service match.
    pub fn eligible_vendors(
        &self,
        request: &RoutingRequest,
        vendors: &[Vendor],
        exclude_vendor_id: Option<Uuid>,
    ) -> Vec<EligibleVendor> {
        let service = self
            .services
            .resolve_request(&request.category, request.specific_service.as_deref());
        let lookup = ZipLookup::resolve(&self.zips, &request.zip_code);
        if lookup.location.is_none() {
            debug!(zip = %request.zip_code, "zip unresolved; only global and national coverage applies");
        }

        let candidates: Vec<&Vendor> = vendors
            .iter()
            .filter(|v| Some(v.id) != exclude_vendor_id)
            .filter(|v| self.admits(v))
            .collect();

        let exact = self.tier(&candidates, &service, &lookup, ServiceMatch::Exact);
        if !exact.is_empty() {
            return exact;
        }
        self.tier(&candidates, &service, &lookup, ServiceMatch::Related)
    }

    fn tier(
        &self,
        candidates: &[&Vendor],
        service: &ServiceRequest,
        lookup: &ZipLookup,
        level: ServiceMatch,
    ) -> Vec<EligibleVendor> {
        candidates
            .iter()
            .filter(|v| match level {
                ServiceMatch::Exact => self.services.exact_match(&v.services_offered, service),
                ServiceMatch::Related => self.services.related_match(&v.services_offered, service),
            })
            .filter_map(|v| {
                coverage_reason(v, lookup).map(|reason| EligibleVendor {
                    vendor: (*v).clone(),
                    coverage_reason: reason,
                    service_match: level,
                })
            })
            .collect()
    }

    pub fn route(
        &self,
        request: &RoutingRequest,
        vendors: &[Vendor],
        config: &RoutingConfig,
        exclude_vendor_id: Option<Uuid>,
    ) -> Result<RouteDecision, NoEligibleVendor> {
        let eligible = self.eligible_vendors(request, vendors, exclude_vendor_id);
        let pool: Vec<Vendor> = eligible.iter().map(|e| e.vendor.clone()).collect();
        let selection = select(&pool, config, self.random.as_ref())?;
        let chosen = eligible
            .iter()
            .find(|e| e.vendor.id == selection.vendor.id)
            .ok_or(NoEligibleVendor)?;

        info!(
            method = %selection.method,
            pool_size = pool.len(),
            vendor_id = %chosen.vendor.id,
            vendor = chosen.vendor.display_name(),
            reason = %chosen.coverage_reason,
            "vendor selected"
        );
        Ok(RouteDecision {
            vendor: chosen.vendor.clone(),
            method: selection.method,
            coverage_reason: chosen.coverage_reason.clone(),
            service_match: chosen.service_match,
            pool_size: pool.len(),
        })
    }
}

/// Store-backed routing: fresh snapshot, selection, then a compare-and-swap claim.
#[derive(Clone)]
pub struct RoutingService {
    store: Arc<dyn LeadRouterStore>,
    router: LeadRouter,
}

impl RoutingService {
    pub fn new(store: Arc<dyn LeadRouterStore>, router: LeadRouter) -> Self {
        Self { store, router }
    }

    pub fn router(&self) -> &LeadRouter {
        &self.router
    }

    pub fn store(&self) -> &Arc<dyn LeadRouterStore> {
        &self.store
    }

    /// Selects a vendor and bumps its `last_lead_assigned`. A lost race re-reads and re-selects.
    pub async fn assign(
        &self,
        request: &RoutingRequest,
        exclude_vendor_id: Option<Uuid>,
    ) -> Result<RouteDecision, RoutingError> {
        for attempt in 1..=MAX_CLAIM_ATTEMPTS {
            let vendors = self.store.list_vendors().await?;
            let config = self.store.routing_config().await?;
            let mut decision = self
                .router
                .route(request, &vendors, &config, exclude_vendor_id)?;

            let expected = decision.vendor.last_lead_assigned;
            let assigned_at = claim_timestamp(expected);
            if self
                .store
                .claim_vendor(decision.vendor.id, expected, assigned_at)
                .await?
            {
                decision.vendor.last_lead_assigned = Some(assigned_at);
                return Ok(decision);
            }
            warn!(
                attempt,
                vendor_id = %decision.vendor.id,
                "vendor claimed concurrently; retrying with fresh state"
            );
        }
        Err(RoutingError::ClaimContention {
            attempts: MAX_CLAIM_ATTEMPTS,
        })
    }

    pub async fn stats(&self) -> Result<RoutingStats, RoutingError> {
        let vendors = self.store.list_vendors().await?;
        let leads = self.store.list_leads().await?;
        let config = self.store.routing_config().await?;
        Ok(RoutingStats::collect(&vendors, &leads, &config))
    }
}

/// Millisecond precision, strictly after the previous assignment.
fn claim_timestamp(previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now().trunc_subsecs(3);
    match previous {
        Some(previous) if now <= previous => previous + Duration::milliseconds(1),
        _ => now,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingStats {
    pub total_vendors: usize,
    pub active_vendors: usize,
    pub taking_new_work: usize,
    pub vendors_by_status: BTreeMap<String, usize>,
    pub vendors_by_coverage_type: BTreeMap<String, usize>,
    pub total_leads: usize,
    pub assigned_leads: usize,
    pub unassigned_leads: usize,
    pub performance_percentage: f64,
    pub round_robin_percentage: f64,
}

impl RoutingStats {
    pub fn collect(vendors: &[Vendor], leads: &[Lead], config: &RoutingConfig) -> Self {
        let mut vendors_by_status = BTreeMap::new();
        let mut vendors_by_coverage_type = BTreeMap::new();
        for vendor in vendors {
            *vendors_by_status
                .entry(vendor.status.as_str().to_string())
                .or_insert(0) += 1;
            *vendors_by_coverage_type
                .entry(vendor.coverage_type.as_str().to_string())
                .or_insert(0) += 1;
        }
        Self {
            total_vendors: vendors.len(),
            active_vendors: vendors
                .iter()
                .filter(|v| v.status == VendorStatus::Active)
                .count(),
            taking_new_work: vendors
                .iter()
                .filter(|v| v.status == VendorStatus::Active && v.taking_new_work)
                .count(),
            vendors_by_status,
            vendors_by_coverage_type,
            total_leads: leads.len(),
            assigned_leads: leads.iter().filter(|l| l.vendor_id.is_some()).count(),
            unassigned_leads: leads
                .iter()
                .filter(|l| l.status == LeadStatus::Unassigned)
                .count(),
            performance_percentage: config.performance_percentage(),
            round_robin_percentage: config.round_robin_percentage(),
        }
    }
}

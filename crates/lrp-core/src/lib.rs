//! Core domain model for Lead Router Pro: vendors, leads, coverage and routing settings.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "lrp-core";

/// Country every resolvable location belongs to.
pub const SUPPORTED_COUNTRY: &str = "US";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} value '{value}'")]
pub struct ParseStatusError {
    pub kind: &'static str,
    pub value: String,
}

/// Geographic granularity a vendor serves at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoverageType {
    Global,
    National,
    State,
    County,
    Zip,
}

impl CoverageType {
    pub const ALL: [CoverageType; 5] = [
        CoverageType::Global,
        CoverageType::National,
        CoverageType::State,
        CoverageType::County,
        CoverageType::Zip,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CoverageType::Global => "global",
            CoverageType::National => "national",
            CoverageType::State => "state",
            CoverageType::County => "county",
            CoverageType::Zip => "zip",
        }
    }
}

impl fmt::Display for CoverageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CoverageType {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "global" => Ok(CoverageType::Global),
            "national" => Ok(CoverageType::National),
            "state" => Ok(CoverageType::State),
            "county" => Ok(CoverageType::County),
            "zip" => Ok(CoverageType::Zip),
            _ => Err(ParseStatusError {
                kind: "coverage type",
                value: s.to_string(),
            }),
        }
    }
}

/// Vendor lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VendorStatus {
    NewApplication,
    OnboardingInProcess,
    Pending,
    Active,
    Deactivated,
    InactiveGhlDeleted,
}

impl VendorStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            VendorStatus::NewApplication => "new application",
            VendorStatus::OnboardingInProcess => "onboarding in process",
            VendorStatus::Pending => "pending",
            VendorStatus::Active => "active",
            VendorStatus::Deactivated => "deactivated",
            VendorStatus::InactiveGhlDeleted => "inactive_ghl_deleted",
        }
    }
}

impl fmt::Display for VendorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VendorStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "new application" => Ok(VendorStatus::NewApplication),
            "onboarding in process" => Ok(VendorStatus::OnboardingInProcess),
            "pending" => Ok(VendorStatus::Pending),
            "active" => Ok(VendorStatus::Active),
            "deactivated" => Ok(VendorStatus::Deactivated),
            "inactive_ghl_deleted" => Ok(VendorStatus::InactiveGhlDeleted),
            _ => Err(ParseStatusError {
                kind: "vendor status",
                value: s.to_string(),
            }),
        }
    }
}

/// Lead lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    PendingAssignment,
    Unassigned,
    Assigned,
    NewLead,
    InactiveGhlDeleted,
}

impl LeadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LeadStatus::PendingAssignment => "pending_assignment",
            LeadStatus::Unassigned => "unassigned",
            LeadStatus::Assigned => "assigned",
            LeadStatus::NewLead => "new lead",
            LeadStatus::InactiveGhlDeleted => "inactive_ghl_deleted",
        }
    }
}

impl fmt::Display for LeadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LeadStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending_assignment" => Ok(LeadStatus::PendingAssignment),
            "unassigned" => Ok(LeadStatus::Unassigned),
            "assigned" => Ok(LeadStatus::Assigned),
            "new lead" => Ok(LeadStatus::NewLead),
            "inactive_ghl_deleted" => Ok(LeadStatus::InactiveGhlDeleted),
            _ => Err(ParseStatusError {
                kind: "lead status",
                value: s.to_string(),
            }),
        }
    }
}

/// Opportunity identifier issued by the CRM.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpportunityId(String);

impl OpportunityId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OpportunityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of resolving a postal code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub zip: String,
    pub city: String,
    pub state: String,
    pub county: String,
    pub country: String,
}

impl Location {
    pub fn is_supported_country(&self) -> bool {
        self.country.eq_ignore_ascii_case(SUPPORTED_COUNTRY)
    }

    /// `"County, ST"` label used by county-scoped coverage.
    pub fn county_label(&self) -> String {
        format!("{}, {}", self.county, self.state)
    }
}

/// Coverage declaration parsed from CRM data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageArea {
    pub coverage_type: CoverageType,
    pub states: BTreeSet<String>,
    pub counties: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vendor {
    pub id: Uuid,
    pub ghl_contact_id: Option<String>,
    pub ghl_user_id: Option<String>,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub company_name: String,
    pub services_offered: BTreeSet<String>,
    pub primary_service_category: Option<String>,
    pub coverage_type: CoverageType,
    pub coverage_states: BTreeSet<String>,
    pub coverage_counties: BTreeSet<String>,
    /// Legacy ZIP-level coverage.
    pub coverage_zips: BTreeSet<String>,
    pub status: VendorStatus,
    pub taking_new_work: bool,
    pub last_lead_assigned: Option<DateTime<Utc>>,
    /// Close rate, 0-100.
    pub lead_close_percentage: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Vendor {
    pub fn display_name(&self) -> &str {
        if self.company_name.trim().is_empty() {
            &self.name
        } else {
            &self.company_name
        }
    }

    pub fn normalized_email(&self) -> Option<String> {
        self.email.as_deref().and_then(normalize_email)
    }

    /// Merge CRM-derived values into this record. Returns whether anything changed.
    ///
    /// Empty CRM values never overwrite local data; the status always follows the CRM tags.
    pub fn apply_profile(&mut self, profile: &VendorProfile) -> bool {
        let before = self.clone();

        if self.ghl_contact_id.is_none() {
            self.ghl_contact_id = Some(profile.ghl_contact_id.clone());
        }
        if self.ghl_user_id.is_none() {
            if let Some(user) = &profile.ghl_user_id {
                self.ghl_user_id = Some(user.clone());
            }
        }
        overwrite_string(&mut self.name, &profile.name);
        overwrite_option(&mut self.email, &profile.email);
        overwrite_option(&mut self.phone, &profile.phone);
        overwrite_string(&mut self.company_name, &profile.company_name);
        overwrite_option(
            &mut self.primary_service_category,
            &profile.primary_service_category,
        );
        if let Some(services) = profile.services_offered.as_ref().filter(|s| !s.is_empty()) {
            self.services_offered = services.clone();
        }
        if let Some(coverage) = &profile.coverage {
            self.coverage_type = coverage.coverage_type;
            if !coverage.states.is_empty() {
                self.coverage_states = coverage.states.clone();
            }
            if !coverage.counties.is_empty() {
                self.coverage_counties = coverage.counties.clone();
            }
        }
        if let Some(taking) = profile.taking_new_work {
            self.taking_new_work = taking;
        }
        if let Some(rate) = profile.lead_close_percentage {
            self.lead_close_percentage = rate;
        }
        self.status = profile.status;

        *self != before
    }
}

/// Vendor fields as presented by the CRM, after parsing the raw contact payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VendorProfile {
    pub ghl_contact_id: String,
    pub ghl_user_id: Option<String>,
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub company_name: Option<String>,
    pub services_offered: Option<BTreeSet<String>>,
    pub primary_service_category: Option<String>,
    pub coverage: Option<CoverageArea>,
    pub taking_new_work: Option<bool>,
    pub lead_close_percentage: Option<f64>,
    pub status: VendorStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewVendor {
    pub ghl_contact_id: Option<String>,
    pub ghl_user_id: Option<String>,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub company_name: String,
    pub services_offered: BTreeSet<String>,
    pub primary_service_category: Option<String>,
    pub coverage_type: CoverageType,
    pub coverage_states: BTreeSet<String>,
    pub coverage_counties: BTreeSet<String>,
    pub coverage_zips: BTreeSet<String>,
    pub status: VendorStatus,
    pub taking_new_work: bool,
    pub lead_close_percentage: f64,
}

impl NewVendor {
    pub fn from_profile(profile: &VendorProfile) -> Self {
        let coverage = profile.coverage.clone().unwrap_or(CoverageArea {
            coverage_type: CoverageType::County,
            states: BTreeSet::new(),
            counties: BTreeSet::new(),
        });
        Self {
            ghl_contact_id: Some(profile.ghl_contact_id.clone()),
            ghl_user_id: profile.ghl_user_id.clone(),
            name: profile.name.clone().unwrap_or_default(),
            email: profile.email.clone(),
            phone: profile.phone.clone(),
            company_name: profile.company_name.clone().unwrap_or_default(),
            services_offered: profile.services_offered.clone().unwrap_or_default(),
            primary_service_category: profile.primary_service_category.clone(),
            coverage_type: coverage.coverage_type,
            coverage_states: coverage.states,
            coverage_counties: coverage.counties,
            coverage_zips: BTreeSet::new(),
            status: profile.status,
            taking_new_work: profile.taking_new_work.unwrap_or(true),
            lead_close_percentage: profile.lead_close_percentage.unwrap_or(0.0),
        }
    }

    pub fn into_vendor(self, id: Uuid, now: DateTime<Utc>) -> Vendor {
        Vendor {
            id,
            ghl_contact_id: self.ghl_contact_id,
            ghl_user_id: self.ghl_user_id,
            name: self.name,
            email: self.email,
            phone: self.phone,
            company_name: self.company_name,
            services_offered: self.services_offered,
            primary_service_category: self.primary_service_category,
            coverage_type: self.coverage_type,
            coverage_states: self.coverage_states,
            coverage_counties: self.coverage_counties,
            coverage_zips: self.coverage_zips,
            status: self.status,
            taking_new_work: self.taking_new_work,
            last_lead_assigned: None,
            lead_close_percentage: self.lead_close_percentage,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Customer and service fields shared by every way a lead comes into existence.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LeadDetails {
    pub customer_name: String,
    pub customer_email: Option<String>,
    pub customer_phone: Option<String>,
    pub primary_service_category: String,
    pub specific_service_requested: Option<String>,
    pub service_zip_code: Option<String>,
    pub service_state: Option<String>,
    pub service_county: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    pub id: Uuid,
    pub ghl_contact_id: Option<String>,
    pub opportunity_id: Option<OpportunityId>,
    pub details: LeadDetails,
    pub vendor_id: Option<Uuid>,
    pub status: LeadStatus,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Lead {
    pub fn normalized_email(&self) -> Option<String> {
        self.details.customer_email.as_deref().and_then(normalize_email)
    }

    /// Merge CRM-derived values into this lead. Returns whether anything changed.
    pub fn apply_profile(&mut self, profile: &LeadProfile) -> bool {
        let before = self.clone();

        if self.ghl_contact_id.is_none() {
            self.ghl_contact_id = Some(profile.ghl_contact_id.clone());
        }
        let details = &mut self.details;
        overwrite_string(&mut details.customer_name, &profile.customer_name);
        overwrite_option(&mut details.customer_email, &profile.customer_email);
        overwrite_option(&mut details.customer_phone, &profile.customer_phone);
        overwrite_string(
            &mut details.primary_service_category,
            &profile.primary_service_category,
        );
        overwrite_option(
            &mut details.specific_service_requested,
            &profile.specific_service_requested,
        );
        overwrite_option(&mut details.service_zip_code, &profile.service_zip_code);
        if let Some(status) = profile.status_from_tags {
            self.status = status;
        }

        *self != before
    }
}

/// Lead fields as presented by the CRM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadProfile {
    pub ghl_contact_id: String,
    pub customer_name: Option<String>,
    pub customer_email: Option<String>,
    pub customer_phone: Option<String>,
    pub primary_service_category: Option<String>,
    pub specific_service_requested: Option<String>,
    pub service_zip_code: Option<String>,
    /// `None` leaves the local status untouched.
    pub status_from_tags: Option<LeadStatus>,
}

/// A lead that has not been persisted yet.
///
/// The opportunity id can only be attached through [`NewLead::for_opportunity`], so a lead row
/// referencing an opportunity is never built before the CRM has issued that opportunity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLead {
    pub details: LeadDetails,
    pub status: LeadStatus,
    pub source: String,
    ghl_contact_id: Option<String>,
    opportunity_id: Option<OpportunityId>,
}

impl NewLead {
    /// Lead mirrored from an existing CRM contact, without an opportunity.
    pub fn from_contact(
        ghl_contact_id: impl Into<String>,
        details: LeadDetails,
        status: LeadStatus,
        source: impl Into<String>,
    ) -> Self {
        Self {
            details,
            status,
            source: source.into(),
            ghl_contact_id: Some(ghl_contact_id.into()),
            opportunity_id: None,
        }
    }

    /// Lead created after its CRM opportunity exists.
    pub fn for_opportunity(
        opportunity_id: OpportunityId,
        ghl_contact_id: impl Into<String>,
        details: LeadDetails,
        source: impl Into<String>,
    ) -> Self {
        Self {
            details,
            status: LeadStatus::PendingAssignment,
            source: source.into(),
            ghl_contact_id: Some(ghl_contact_id.into()),
            opportunity_id: Some(opportunity_id),
        }
    }

    pub fn ghl_contact_id(&self) -> Option<&str> {
        self.ghl_contact_id.as_deref()
    }

    pub fn opportunity_id(&self) -> Option<&OpportunityId> {
        self.opportunity_id.as_ref()
    }

    pub fn into_lead(self, id: Uuid, now: DateTime<Utc>) -> Lead {
        Lead {
            id,
            ghl_contact_id: self.ghl_contact_id,
            opportunity_id: self.opportunity_id,
            details: self.details,
            vendor_id: None,
            status: self.status,
            source: self.source,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("performance percentage must be within 0..=100, got {0}")]
pub struct InvalidPercentage(pub f64);

/// Tenant-scoped routing setting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawRoutingConfig")]
pub struct RoutingConfig {
    performance_percentage: f64,
}

#[derive(Deserialize)]
struct RawRoutingConfig {
    performance_percentage: f64,
}

impl TryFrom<RawRoutingConfig> for RoutingConfig {
    type Error = InvalidPercentage;

    fn try_from(raw: RawRoutingConfig) -> Result<Self, Self::Error> {
        RoutingConfig::new(raw.performance_percentage)
    }
}

impl RoutingConfig {
    pub fn new(performance_percentage: f64) -> Result<Self, InvalidPercentage> {
        if !(0.0..=100.0).contains(&performance_percentage) {
            return Err(InvalidPercentage(performance_percentage));
        }
        Ok(Self {
            performance_percentage,
        })
    }

    pub fn performance_percentage(&self) -> f64 {
        self.performance_percentage
    }

    pub fn round_robin_percentage(&self) -> f64 {
        100.0 - self.performance_percentage
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            performance_percentage: 0.0,
        }
    }
}

/// Lowercased, trimmed email; `None` when blank.
pub fn normalize_email(raw: &str) -> Option<String> {
    let email = raw.trim().to_ascii_lowercase();
    if email.is_empty() {
        None
    } else {
        Some(email)
    }
}

fn overwrite_string(target: &mut String, value: &Option<String>) {
    if let Some(value) = value.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
        if target != value {
            *target = value.to_string();
        }
    }
}

fn overwrite_option(target: &mut Option<String>, value: &Option<String>) {
    if let Some(value) = value.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
        if target.as_deref() != Some(value) {
            *target = Some(value.to_string());
        }
    }
}

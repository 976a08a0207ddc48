//! Extraction of vendor and lead profiles from parsed CRM contacts.

use std::collections::BTreeSet;

use lrp_core::{
    normalize_email, CoverageArea, CoverageType, LeadProfile, LeadStatus, VendorProfile,
    VendorStatus,
};
use serde::{Deserialize, Serialize};

use crate::contact::CrmContact;

/// Substring of the contact `source` that marks a vendor application.
pub const VENDOR_SOURCE_MARKER: &str = "vendor application";

/// Tags that mark a contact as a vendor regardless of local records.
pub const VENDOR_TAGS: [&str; 3] = ["new vendor", "new vendor application", "manually approved"];

pub const NEW_LEAD_TAG: &str = "new lead";

/// One row of the vendor status table: any of `tags` present yields `status`.
#[derive(Debug, Clone, Copy)]
pub struct TagRule {
    pub tags: &'static [&'static str],
    pub status: VendorStatus,
}

/// Highest priority first. The first rule with a matching tag decides the status.
pub const VENDOR_STATUS_RULES: [TagRule; 6] = [
    TagRule {
        tags: &["reactivated"],
        status: VendorStatus::Active,
    },
    TagRule {
        tags: &["manually approved"],
        status: VendorStatus::Active,
    },
    TagRule {
        tags: &["deactivated"],
        status: VendorStatus::Deactivated,
    },
    TagRule {
        tags: &["manual approval", "manual approval pending", "pending approval"],
        status: VendorStatus::Pending,
    },
    TagRule {
        tags: &["onboarding in process"],
        status: VendorStatus::OnboardingInProcess,
    },
    TagRule {
        tags: &["new vendor application"],
        status: VendorStatus::NewApplication,
    },
];

pub fn vendor_status_from_tags(tags: &[String]) -> VendorStatus {
    VENDOR_STATUS_RULES
        .iter()
        .find(|rule| rule.tags.iter().any(|tag| tags.iter().any(|t| t == tag)))
        .map(|rule| rule.status)
        .unwrap_or(VendorStatus::Pending)
}

pub fn lead_status_from_tags(tags: &[String]) -> Option<LeadStatus> {
    tags.iter()
        .any(|t| t == NEW_LEAD_TAG)
        .then_some(LeadStatus::NewLead)
}

/// Source marker or vendor tag, independent of any local record.
pub fn looks_like_vendor(contact: &CrmContact) -> bool {
    let by_source = contact
        .source
        .as_deref()
        .is_some_and(|s| s.to_lowercase().contains(VENDOR_SOURCE_MARKER));
    by_source || VENDOR_TAGS.iter().any(|tag| contact.has_tag(tag))
}

/// Custom field ids configured in the CRM account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrmFieldMap {
    pub vendor_user_id: String,
    pub vendor_company_name: String,
    pub vendor_service_categories: Vec<String>,
    pub vendor_services_offered: String,
    pub vendor_service_area: String,
    pub vendor_taking_new_work: String,
    pub vendor_last_lead_assigned: String,
    pub vendor_close_percentage: String,
    pub primary_service_category: String,
    pub lead_specific_service: String,
    /// Service ZIP fields, first non-empty wins.
    pub lead_zip_fields: Vec<String>,
}

impl Default for CrmFieldMap {
    fn default() -> Self {
        Self {
            vendor_user_id: "HXVNT4y8OynNokWAfO2D".into(),
            vendor_company_name: "JexVrg2VNhnwIX7YlyJV".into(),
            vendor_service_categories: vec![
                "72qwwzy4AUfTCBJvBIEf".into(),
                "O84LyhN1QjZ8Zz5mteCM".into(),
            ],
            vendor_services_offered: "pAq9WBsIuFUAZuwz3YY4".into(),
            vendor_service_area: "yDcN0FmwI3xacyxAuTWs".into(),
            vendor_taking_new_work: "bTFOs5zXYt85AvDJJUAb".into(),
            vendor_last_lead_assigned: "NbsJTMv3EkxqNfwx8Jh4".into(),
            vendor_close_percentage: "OwHQipU7xdrHCpVswtnW".into(),
            primary_service_category: "HRqfv0HnUydNRLKWhk27".into(),
            lead_specific_service: "FT85QGi0tBq1AfVGNJ9v".into(),
            lead_zip_fields: vec![
                "RmAja1dnU0u42ECXhCo9".into(),
                "y3Xo7qsFEQumoFugTeCq".into(),
            ],
        }
    }
}

/// Parses the free-text service-area field.
///
/// `GLOBAL` wins, then `NATIONAL`/`USA`/`UNITED STATES`, then a `;`-separated list of
/// `County, ST` entries, then a `,`-separated list of two-letter state codes.
pub fn parse_coverage(raw: &str) -> Option<CoverageArea> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let upper = trimmed.to_uppercase();
    if upper.contains("GLOBAL") {
        return Some(area(CoverageType::Global, BTreeSet::new(), BTreeSet::new()));
    }
    if ["NATIONAL", "USA", "UNITED STATES"]
        .iter()
        .any(|marker| upper.contains(marker))
    {
        return Some(area(CoverageType::National, BTreeSet::new(), BTreeSet::new()));
    }

    let parts: Vec<&str> = trimmed
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    if !trimmed.contains(';') && !parts.is_empty() && parts.iter().all(|p| is_state_code(p)) {
        let states = parts.iter().map(|p| p.to_ascii_uppercase()).collect();
        return Some(area(CoverageType::State, states, BTreeSet::new()));
    }

    let mut states = BTreeSet::new();
    let mut counties = BTreeSet::new();
    for entry in trimmed.split(';') {
        let Some((county, state)) = entry.rsplit_once(',') else {
            continue;
        };
        let (county, state) = (county.trim(), state.trim());
        if county.is_empty() || !is_state_code(state) {
            continue;
        }
        let state = state.to_ascii_uppercase();
        counties.insert(format!("{county}, {state}"));
        states.insert(state);
    }
    if counties.is_empty() {
        None
    } else {
        Some(area(CoverageType::County, states, counties))
    }
}

fn area(
    coverage_type: CoverageType,
    states: BTreeSet<String>,
    counties: BTreeSet<String>,
) -> CoverageArea {
    CoverageArea {
        coverage_type,
        states,
        counties,
    }
}

fn is_state_code(value: &str) -> bool {
    value.len() == 2 && value.chars().all(|c| c.is_ascii_alphabetic())
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "yes" | "true" | "1" | "y" => Some(true),
        "no" | "false" | "0" | "n" => Some(false),
        _ => None,
    }
}

fn parse_percentage(raw: &str) -> Option<f64> {
    raw.trim()
        .trim_end_matches('%')
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .map(|v| v.clamp(0.0, 100.0))
}

fn split_services(raw: &str) -> BTreeSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn vendor_profile(contact: &CrmContact, fields: &CrmFieldMap) -> VendorProfile {
    let custom = |id: &str| contact.custom_field(id).map(str::to_string);

    let services_offered = custom(&fields.vendor_services_offered)
        .map(|raw| split_services(&raw))
        .filter(|s| !s.is_empty());
    let primary_service_category = custom(&fields.primary_service_category).or_else(|| {
        fields
            .vendor_service_categories
            .iter()
            .find_map(|id| contact.custom_field(id))
            .and_then(|raw| raw.split(',').map(str::trim).find(|s| !s.is_empty()))
            .map(str::to_string)
    });

    VendorProfile {
        ghl_contact_id: contact.id.clone(),
        ghl_user_id: custom(&fields.vendor_user_id),
        name: contact.full_name(),
        email: contact.normalized_email(),
        phone: contact.phone.clone(),
        company_name: contact
            .company_name
            .clone()
            .or_else(|| custom(&fields.vendor_company_name)),
        services_offered,
        primary_service_category,
        coverage: contact
            .custom_field(&fields.vendor_service_area)
            .and_then(parse_coverage),
        taking_new_work: contact
            .custom_field(&fields.vendor_taking_new_work)
            .and_then(parse_flag),
        lead_close_percentage: contact
            .custom_field(&fields.vendor_close_percentage)
            .and_then(parse_percentage),
        status: vendor_status_from_tags(&contact.tags),
    }
}

pub fn lead_profile(contact: &CrmContact, fields: &CrmFieldMap) -> LeadProfile {
    LeadProfile {
        ghl_contact_id: contact.id.clone(),
        customer_name: contact.full_name(),
        customer_email: contact.email.as_deref().and_then(normalize_email),
        customer_phone: contact.phone.clone(),
        primary_service_category: contact
            .custom_field(&fields.primary_service_category)
            .map(str::to_string),
        specific_service_requested: contact
            .custom_field(&fields.lead_specific_service)
            .map(str::to_string),
        service_zip_code: contact_zip(contact, fields),
        status_from_tags: lead_status_from_tags(&contact.tags),
    }
}

/// Postal code, then the service-ZIP custom fields, then a 5-digit run in `address1`.
pub fn contact_zip(contact: &CrmContact, fields: &CrmFieldMap) -> Option<String> {
    let candidates = contact
        .postal_code
        .iter()
        .map(String::as_str)
        .chain(
            fields
                .lead_zip_fields
                .iter()
                .filter_map(|id| contact.custom_field(id)),
        );
    for candidate in candidates {
        if let Some(zip) = first_five_digit_run(candidate) {
            return Some(zip);
        }
    }
    contact.address1.as_deref().and_then(first_five_digit_run)
}

fn first_five_digit_run(text: &str) -> Option<String> {
    let mut run = String::new();
    for c in text.chars().chain(std::iter::once(' ')) {
        if c.is_ascii_digit() {
            run.push(c);
            continue;
        }
        // Also covers ZIP+4, where the run ends at the dash.
        if run.len() == 5 {
            return Some(run);
        }
        run.clear();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tags(list: &[&str]) -> Vec<String> {
        list.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn highest_priority_tag_wins() {
        assert_eq!(
            vendor_status_from_tags(&tags(&["new vendor application", "manually approved"])),
            VendorStatus::Active
        );
        assert_eq!(
            vendor_status_from_tags(&tags(&["deactivated", "onboarding in process"])),
            VendorStatus::Deactivated
        );
        assert_eq!(
            vendor_status_from_tags(&tags(&["deactivated", "reactivated"])),
            VendorStatus::Active
        );
        assert_eq!(
            vendor_status_from_tags(&tags(&["manual approval", "new vendor application"])),
            VendorStatus::Pending
        );
        assert_eq!(vendor_status_from_tags(&tags(&["boat owner"])), VendorStatus::Pending);
    }

    #[test]
    fn only_the_new_lead_tag_sets_lead_status() {
        assert_eq!(
            lead_status_from_tags(&tags(&["new lead"])),
            Some(LeadStatus::NewLead)
        );
        assert_eq!(lead_status_from_tags(&tags(&["vip"])), None);
    }

    #[test]
    fn coverage_text_is_classified() {
        assert_eq!(
            parse_coverage("Global").map(|c| c.coverage_type),
            Some(CoverageType::Global)
        );
        assert_eq!(
            parse_coverage("United States").map(|c| c.coverage_type),
            Some(CoverageType::National)
        );

        let states = parse_coverage("fl, GA ,al").unwrap();
        assert_eq!(states.coverage_type, CoverageType::State);
        assert_eq!(
            states.states,
            BTreeSet::from(["AL".to_string(), "FL".to_string(), "GA".to_string()])
        );

        let counties = parse_coverage("Miami-Dade, FL; Broward, fl; Chatham, GA").unwrap();
        assert_eq!(counties.coverage_type, CoverageType::County);
        assert!(counties.counties.contains("Broward, FL"));
        assert_eq!(
            counties.states,
            BTreeSet::from(["FL".to_string(), "GA".to_string()])
        );

        let single = parse_coverage("Monroe, FL").unwrap();
        assert_eq!(single.coverage_type, CoverageType::County);

        assert!(parse_coverage("somewhere nice").is_none());
        assert!(parse_coverage("  ").is_none());
    }

    #[test]
    fn vendor_profile_reads_custom_fields() {
        let fields = CrmFieldMap::default();
        let contact = CrmContact::from_json(&json!({
            "id": "v-1",
            "firstName": "Rita",
            "lastName": "Gomez",
            "email": "Rita@Shine.test",
            "source": "Vendor Application Form",
            "tags": ["manually approved"],
            "customFields": [
                {"id": fields.vendor_services_offered, "value": "Boat Detailing, Ceramic Coating"},
                {"id": fields.vendor_service_area, "value": "Miami-Dade, FL; Broward, FL"},
                {"id": fields.vendor_taking_new_work, "value": "Yes"},
                {"id": fields.vendor_close_percentage, "value": "62%"},
                {"id": fields.vendor_company_name, "value": "Shine Marine"}
            ]
        }))
        .unwrap();

        assert!(looks_like_vendor(&contact));
        let profile = vendor_profile(&contact, &fields);
        assert_eq!(profile.status, VendorStatus::Active);
        assert_eq!(profile.email.as_deref(), Some("rita@shine.test"));
        assert_eq!(profile.company_name.as_deref(), Some("Shine Marine"));
        assert_eq!(profile.taking_new_work, Some(true));
        assert_eq!(profile.lead_close_percentage, Some(62.0));
        assert_eq!(
            profile.coverage.map(|c| c.coverage_type),
            Some(CoverageType::County)
        );
        assert_eq!(profile.services_offered.map(|s| s.len()), Some(2));
    }

    #[test]
    fn lead_zip_falls_back_to_address_digits() {
        let fields = CrmFieldMap::default();
        let contact = CrmContact::from_json(&json!({
            "id": "l-1",
            "address1": "1200 Ocean Dr, Miami Beach FL 33139-4521"
        }))
        .unwrap();
        assert_eq!(contact_zip(&contact, &fields).as_deref(), Some("33139"));

        let with_field = CrmContact::from_json(&json!({
            "id": "l-2",
            "customFields": [{"id": fields.lead_zip_fields[0], "value": "33316"}]
        }))
        .unwrap();
        assert_eq!(contact_zip(&with_field, &fields).as_deref(), Some("33316"));
    }
}

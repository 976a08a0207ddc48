//! Geographic coverage checks.

use lrp_core::{CoverageType, Location, Vendor};

use crate::location::{normalize_zip, state_code, strip_county_suffix, ZipDatabase};

/// A ZIP code resolved once per routing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZipLookup {
    pub raw: String,
    pub normalized: Option<String>,
    pub location: Option<Location>,
}

impl ZipLookup {
    pub fn resolve(zips: &ZipDatabase, raw: &str) -> Self {
        Self {
            raw: raw.to_string(),
            normalized: normalize_zip(raw),
            location: zips.resolve(raw).ok(),
        }
    }
}

/// Why a vendor covers a location, or `None` when it does not.
///
/// Only the coverage fields relevant to the vendor's coverage type are consulted.
pub fn coverage_reason(vendor: &Vendor, lookup: &ZipLookup) -> Option<String> {
    match vendor.coverage_type {
        CoverageType::Global => Some("Global coverage".to_string()),
        CoverageType::National => match &lookup.location {
            Some(location) if !location.is_supported_country() => None,
            _ => Some("National coverage (US)".to_string()),
        },
        CoverageType::State => {
            let location = lookup.location.as_ref()?;
            vendor
                .coverage_states
                .iter()
                .any(|s| state_code(s).is_some_and(|code| code == location.state))
                .then(|| format!("State coverage: {}", location.state))
        }
        CoverageType::County => {
            let location = lookup.location.as_ref()?;
            vendor
                .coverage_counties
                .iter()
                .any(|entry| county_matches(entry, location))
                .then(|| format!("County coverage: {}", location.county_label()))
        }
        CoverageType::Zip => {
            // Unresolvable ZIPs exclude ZIP-scoped vendors too.
            let zip = lookup.location.as_ref().map(|l| l.zip.as_str())?;
            vendor
                .coverage_zips
                .iter()
                .any(|z| normalize_zip(z).as_deref() == Some(zip))
                .then(|| format!("ZIP coverage: {zip}"))
        }
    }
}

pub fn covers(vendor: &Vendor, zips: &ZipDatabase, zip_code: &str) -> bool {
    coverage_reason(vendor, &ZipLookup::resolve(zips, zip_code)).is_some()
}

/// `"Miami-Dade, FL"`, `"Miami-Dade County, FL"` and `"miami-dade, Florida"` all match
/// Miami-Dade in Florida.
fn county_matches(entry: &str, location: &Location) -> bool {
    let Some((county, state)) = entry.rsplit_once(',') else {
        return false;
    };
    let Some(state) = state_code(state) else {
        return false;
    };
    state.eq_ignore_ascii_case(&location.state)
        && strip_county_suffix(county).eq_ignore_ascii_case(location.county.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use lrp_core::VendorStatus;
    use std::collections::BTreeSet;
    use uuid::Uuid;

    fn vendor(coverage_type: CoverageType) -> Vendor {
        let now = Utc::now();
        Vendor {
            id: Uuid::new_v4(),
            ghl_contact_id: None,
            ghl_user_id: None,
            name: "Test".into(),
            email: None,
            phone: None,
            company_name: String::new(),
            services_offered: BTreeSet::new(),
            primary_service_category: None,
            coverage_type,
            coverage_states: BTreeSet::new(),
            coverage_counties: BTreeSet::new(),
            coverage_zips: BTreeSet::new(),
            status: VendorStatus::Active,
            taking_new_work: true,
            last_lead_assigned: None,
            lead_close_percentage: 0.0,
            created_at: now,
            updated_at: now,
        }
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn global_and_national_survive_unresolvable_zips() {
        let zips = ZipDatabase::embedded().unwrap();
        for zip in ["33139", "99999", "not-a-zip", ""] {
            assert!(covers(&vendor(CoverageType::Global), &zips, zip));
            assert!(covers(&vendor(CoverageType::National), &zips, zip));
        }
    }

    #[test]
    fn county_entries_accept_several_spellings() {
        let zips = ZipDatabase::embedded().unwrap();
        for entry in ["Miami-Dade, FL", "miami-dade county, fl", " Miami-Dade , Florida "] {
            let mut v = vendor(CoverageType::County);
            v.coverage_counties = set(&[entry]);
            assert!(covers(&v, &zips, "33139"), "{entry}");
        }

        let mut broward = vendor(CoverageType::County);
        broward.coverage_counties = set(&["Broward, FL"]);
        assert!(!covers(&broward, &zips, "33139"));
        assert!(!covers(&broward, &zips, "99999"));
    }

    #[test]
    fn state_coverage_ignores_county_fields() {
        let zips = ZipDatabase::embedded().unwrap();
        let mut v = vendor(CoverageType::State);
        v.coverage_states = set(&["Georgia"]);
        v.coverage_counties = set(&["Miami-Dade, FL"]);
        assert!(!covers(&v, &zips, "33139"));
        assert!(covers(&v, &zips, "31401"));
        let lookup = ZipLookup::resolve(&zips, "31401");
        assert_eq!(coverage_reason(&v, &lookup).as_deref(), Some("State coverage: GA"));
    }

    #[test]
    fn legacy_zip_coverage_compares_normalized_codes() {
        let zips = ZipDatabase::embedded().unwrap();
        let mut v = vendor(CoverageType::Zip);
        v.coverage_zips = set(&["33139-1234", "501"]);
        assert!(covers(&v, &zips, "33139"));
        assert!(covers(&v, &zips, "00501"));
        assert!(!covers(&v, &zips, "33140"));
        assert!(!covers(&v, &zips, "garbage"));
    }
}

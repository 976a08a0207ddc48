//! ZIP code resolution against a CSV ZIP database.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use anyhow::Context;
use lrp_core::{Location, SUPPORTED_COUNTRY};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

const EMBEDDED_ZIP_DATABASE: &str = include_str!("../data/zip_codes.csv");

/// US state and territory codes with their names.
pub const US_STATES: [(&str, &str); 53] = [
    ("AL", "Alabama"),
    ("AK", "Alaska"),
    ("AZ", "Arizona"),
    ("AR", "Arkansas"),
    ("CA", "California"),
    ("CO", "Colorado"),
    ("CT", "Connecticut"),
    ("DE", "Delaware"),
    ("DC", "District of Columbia"),
    ("FL", "Florida"),
    ("GA", "Georgia"),
    ("HI", "Hawaii"),
    ("ID", "Idaho"),
    ("IL", "Illinois"),
    ("IN", "Indiana"),
    ("IA", "Iowa"),
    ("KS", "Kansas"),
    ("KY", "Kentucky"),
    ("LA", "Louisiana"),
    ("ME", "Maine"),
    ("MD", "Maryland"),
    ("MA", "Massachusetts"),
    ("MI", "Michigan"),
    ("MN", "Minnesota"),
    ("MS", "Mississippi"),
    ("MO", "Missouri"),
    ("MT", "Montana"),
    ("NE", "Nebraska"),
    ("NV", "Nevada"),
    ("NH", "New Hampshire"),
    ("NJ", "New Jersey"),
    ("NM", "New Mexico"),
    ("NY", "New York"),
    ("NC", "North Carolina"),
    ("ND", "North Dakota"),
    ("OH", "Ohio"),
    ("OK", "Oklahoma"),
    ("OR", "Oregon"),
    ("PA", "Pennsylvania"),
    ("RI", "Rhode Island"),
    ("SC", "South Carolina"),
    ("SD", "South Dakota"),
    ("TN", "Tennessee"),
    ("TX", "Texas"),
    ("UT", "Utah"),
    ("VT", "Vermont"),
    ("VA", "Virginia"),
    ("WA", "Washington"),
    ("WV", "West Virginia"),
    ("WI", "Wisconsin"),
    ("WY", "Wyoming"),
    ("PR", "Puerto Rico"),
    ("VI", "Virgin Islands"),
];

/// Two-letter code for a state given as code or full name, case-insensitive.
pub fn state_code(value: &str) -> Option<&'static str> {
    let value = value.trim();
    US_STATES
        .iter()
        .find(|(code, name)| code.eq_ignore_ascii_case(value) || name.eq_ignore_ascii_case(value))
        .map(|(code, _)| *code)
}

pub fn state_name(code: &str) -> Option<&'static str> {
    US_STATES
        .iter()
        .find(|(c, _)| c.eq_ignore_ascii_case(code.trim()))
        .map(|(_, name)| *name)
}

/// Canonical 5-digit ZIP.
///
/// Non-digits are dropped; ZIP+4 keeps its first five digits; three or four digits are
/// zero-padded on the left (leading zeros lost to number coercion).
pub fn normalize_zip(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    match digits.len() {
        5 => Some(digits),
        9 => Some(digits[..5].to_string()),
        3 | 4 => Some(format!("{digits:0>5}")),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocationUnresolved {
    #[error("'{0}' is not a valid ZIP code")]
    Malformed(String),
    #[error("ZIP code {0} is not in the ZIP database")]
    Unknown(String),
}

#[derive(Debug, Deserialize)]
struct ZipRow {
    zip: String,
    city: String,
    state: String,
    county: String,
}

/// Immutable ZIP lookup table, loaded once and shared.
#[derive(Debug, Clone, Default)]
pub struct ZipDatabase {
    entries: HashMap<String, Location>,
}

impl ZipDatabase {
    /// The sample database compiled into the crate.
    pub fn embedded() -> anyhow::Result<Self> {
        Self::from_reader(EMBEDDED_ZIP_DATABASE.as_bytes()).context("parsing embedded ZIP database")
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .with_context(|| format!("opening ZIP database {}", path.display()))?;
        Self::from_reader(file).with_context(|| format!("parsing ZIP database {}", path.display()))
    }

    pub fn from_reader<R: Read>(reader: R) -> anyhow::Result<Self> {
        let mut csv = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let mut entries = HashMap::new();
        for (line, row) in csv.deserialize::<ZipRow>().enumerate() {
            let row = row.with_context(|| format!("ZIP database row {}", line + 2))?;
            let Some(zip) = normalize_zip(&row.zip) else {
                debug!(zip = row.zip, "skipping malformed ZIP database row");
                continue;
            };
            let state = state_code(&row.state).unwrap_or(row.state.as_str()).to_string();
            entries.insert(
                zip.clone(),
                Location {
                    zip,
                    city: row.city,
                    state,
                    county: strip_county_suffix(&row.county).to_string(),
                    country: SUPPORTED_COUNTRY.to_string(),
                },
            );
        }
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn resolve(&self, raw_zip: &str) -> Result<Location, LocationUnresolved> {
        let zip =
            normalize_zip(raw_zip).ok_or_else(|| LocationUnresolved::Malformed(raw_zip.to_string()))?;
        self.entries
            .get(&zip)
            .cloned()
            .ok_or(LocationUnresolved::Unknown(zip))
    }
}

/// `"Miami-Dade County"` and `"Orleans Parish"` become `"Miami-Dade"` and `"Orleans"`.
pub fn strip_county_suffix(county: &str) -> &str {
    let county = county.trim();
    for suffix in [" County", " Parish", " Borough"] {
        let cut = county.len().saturating_sub(suffix.len());
        if cut > 0
            && county
                .get(cut..)
                .is_some_and(|tail| tail.eq_ignore_ascii_case(suffix))
        {
            return county[..cut].trim_end();
        }
    }
    county
}

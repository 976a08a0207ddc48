//! Typed view of a CRM contact. Raw payload shapes stop here.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::CrmError;

/// A CRM contact parsed once from the loosely-structured API payload.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CrmContact {
    pub id: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub contact_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub company_name: Option<String>,
    pub source: Option<String>,
    pub contact_type: Option<String>,
    /// Lowercased, trimmed, deduplicated.
    pub tags: Vec<String>,
    /// Custom field id to flattened string value.
    pub custom_fields: BTreeMap<String, String>,
    pub address1: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
    /// Opaque pagination cursor attached by list scans.
    pub search_after: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawContact {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    last_name: Option<String>,
    #[serde(default)]
    contact_name: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    phone: Option<String>,
    #[serde(default)]
    company_name: Option<String>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default, rename = "type")]
    contact_type: Option<String>,
    #[serde(default)]
    tags: Value,
    #[serde(default, alias = "customField")]
    custom_fields: Vec<RawCustomField>,
    #[serde(default)]
    address1: Option<String>,
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    postal_code: Option<String>,
    #[serde(default)]
    search_after: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawCustomField {
    id: String,
    #[serde(default, alias = "field_value", alias = "fieldValue")]
    value: Value,
}

impl CrmContact {
    pub fn from_json(payload: &Value) -> Result<Self, CrmError> {
        let raw: RawContact = serde_json::from_value(payload.clone())
            .map_err(|err| CrmError::Payload(format!("contact: {err}")))?;
        let id = raw
            .id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| CrmError::Payload("contact without id".to_string()))?;

        let custom_fields = raw
            .custom_fields
            .into_iter()
            .filter_map(|field| flatten_value(&field.value).map(|value| (field.id, value)))
            .collect();

        Ok(Self {
            id,
            first_name: non_blank(raw.first_name),
            last_name: non_blank(raw.last_name),
            contact_name: non_blank(raw.contact_name),
            email: non_blank(raw.email),
            phone: non_blank(raw.phone),
            company_name: non_blank(raw.company_name),
            source: non_blank(raw.source),
            contact_type: non_blank(raw.contact_type),
            tags: normalize_tags(&raw.tags),
            custom_fields,
            address1: non_blank(raw.address1),
            city: non_blank(raw.city),
            state: non_blank(raw.state),
            postal_code: non_blank(raw.postal_code),
            search_after: raw.search_after.filter(|v| !v.is_null()),
        })
    }

    /// `contactName`, falling back to first and last name.
    pub fn full_name(&self) -> Option<String> {
        if let Some(name) = &self.contact_name {
            return Some(name.clone());
        }
        let joined = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");
        if joined.is_empty() {
            None
        } else {
            Some(joined)
        }
    }

    pub fn normalized_email(&self) -> Option<String> {
        self.email.as_deref().and_then(lrp_core::normalize_email)
    }

    pub fn custom_field(&self, id: &str) -> Option<&str> {
        self.custom_fields.get(id).map(String::as_str)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    pub fn is_staff(&self) -> bool {
        self.contact_type
            .as_deref()
            .is_some_and(|t| t.eq_ignore_ascii_case("staff"))
    }
}

/// Tags arrive as a list of strings, a list of `{name}`/`{tag}` objects, or a comma string.
pub fn normalize_tags(raw: &Value) -> Vec<String> {
    let mut tags: Vec<String> = match raw {
        Value::String(joined) => joined.split(',').map(normalize_tag).collect(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(tag) => Some(normalize_tag(tag)),
                Value::Object(map) => map
                    .get("name")
                    .or_else(|| map.get("tag"))
                    .and_then(Value::as_str)
                    .map(normalize_tag),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };
    tags.retain(|t| !t.is_empty());
    tags.sort();
    tags.dedup();
    tags
}

fn normalize_tag(tag: &str) -> String {
    tag.trim().to_lowercase()
}

fn flatten_value(value: &Value) -> Option<String> {
    let flat = match value {
        Value::Null => return None,
        Value::String(s) => s.trim().to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => items
            .iter()
            .filter_map(flatten_value)
            .collect::<Vec<_>>()
            .join(", "),
        Value::Object(_) => value.to_string(),
    };
    if flat.is_empty() {
        None
    } else {
        Some(flat)
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

//! Three-level service taxonomy and service matching.
//!
//! The taxonomy is loaded once from YAML and injected read-only. A request is first
//! canonicalized against it ([`ServiceMatcher::resolve_request`]); matching then tries exact
//! names (with the subcategory and category umbrella rules) before related keyword groups.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use thiserror::Error;

const EMBEDDED_TAXONOMY: &str = include_str!("../data/service_taxonomy.yaml");

/// Minimum Jaro-Winkler similarity for snapping a free-text service onto a taxonomy name.
pub const FUZZY_THRESHOLD: f64 = 0.93;

#[derive(Debug, Error)]
pub enum TaxonomyError {
    #[error("reading taxonomy {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing taxonomy yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("taxonomy defines no categories")]
    Empty,
    #[error("category '{0}' is defined twice")]
    DuplicateCategory(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub name: String,
    #[serde(default)]
    pub subcategories: Vec<Subcategory>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subcategory {
    pub name: String,
    /// Level-3 services. Empty means the subcategory is itself the specific service.
    #[serde(default)]
    pub services: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TaxonomyFile {
    categories: Vec<Category>,
    #[serde(default)]
    related_terms: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaxonomyLevel {
    Category,
    Subcategory,
    Service,
}

#[derive(Debug, Clone)]
struct Entry {
    name: String,
    level: TaxonomyLevel,
    category: String,
    subcategory: Option<String>,
}

/// Read-only Category -> Subcategory -> Service hierarchy.
#[derive(Debug, Clone)]
pub struct ServiceTaxonomy {
    categories: Vec<Category>,
    // Lowercased name to entries; the same Level-3 label ("Other") appears under many parents.
    index: HashMap<String, Vec<Entry>>,
}

impl ServiceTaxonomy {
    pub fn new(categories: Vec<Category>) -> Result<Self, TaxonomyError> {
        if categories.is_empty() {
            return Err(TaxonomyError::Empty);
        }
        let mut index: HashMap<String, Vec<Entry>> = HashMap::new();
        let mut seen = BTreeSet::new();
        for category in &categories {
            if !seen.insert(category.name.to_lowercase()) {
                return Err(TaxonomyError::DuplicateCategory(category.name.clone()));
            }
            push(&mut index, &category.name, TaxonomyLevel::Category, &category.name, None);
            for sub in &category.subcategories {
                push(
                    &mut index,
                    &sub.name,
                    TaxonomyLevel::Subcategory,
                    &category.name,
                    None,
                );
                for service in &sub.services {
                    push(
                        &mut index,
                        service,
                        TaxonomyLevel::Service,
                        &category.name,
                        Some(&sub.name),
                    );
                }
            }
        }
        Ok(Self { categories, index })
    }

    pub fn categories(&self) -> &[Category] {
        &self.categories
    }

    pub fn category(&self, name: &str) -> Option<&Category> {
        self.categories
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name.trim()))
    }

    pub fn is_known_service(&self, name: &str) -> bool {
        self.index.contains_key(&name.trim().to_lowercase())
    }

    /// Level-1 category a name belongs to, if the name is in the taxonomy.
    pub fn category_of(&self, name: &str) -> Option<&str> {
        self.entries(name).first().map(|e| e.category.as_str())
    }

    fn entries(&self, name: &str) -> &[Entry] {
        self.index
            .get(&name.trim().to_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn at_level(&self, name: &str, level: TaxonomyLevel) -> Option<&Entry> {
        self.entries(name).iter().find(|e| e.level == level)
    }

    fn subcategory(&self, category: &str, name: &str) -> Option<&Subcategory> {
        self.category(category)?
            .subcategories
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(name.trim()))
    }

    /// Canonical taxonomy spelling: Level-3, then Level-2, then Level-1 exact matches, then the
    /// closest name above [`FUZZY_THRESHOLD`], else the trimmed input.
    pub fn canonical_name(&self, input: &str) -> String {
        let trimmed = input.trim();
        for level in [
            TaxonomyLevel::Service,
            TaxonomyLevel::Subcategory,
            TaxonomyLevel::Category,
        ] {
            if let Some(entry) = self.at_level(trimmed, level) {
                return entry.name.clone();
            }
        }

        let wanted = trimmed.to_lowercase();
        let best = self
            .index
            .iter()
            .map(|(key, entries)| (jaro_winkler(&wanted, key), entries))
            .filter(|(score, _)| *score >= FUZZY_THRESHOLD)
            .max_by(|a, b| a.0.total_cmp(&b.0));
        match best.and_then(|(_, entries)| entries.first()) {
            Some(entry) => entry.name.clone(),
            None => trimmed.to_string(),
        }
    }
}

fn push(
    index: &mut HashMap<String, Vec<Entry>>,
    name: &str,
    level: TaxonomyLevel,
    category: &str,
    subcategory: Option<&str>,
) {
    index.entry(name.trim().to_lowercase()).or_default().push(Entry {
        name: name.trim().to_string(),
        level,
        category: category.to_string(),
        subcategory: subcategory.map(str::to_string),
    });
}

/// Keyword groups; two service names are related when both mention a keyword of one group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelatedTermGroups {
    groups: Vec<(String, Vec<String>)>,
}

impl RelatedTermGroups {
    pub fn new(groups: BTreeMap<String, Vec<String>>) -> Self {
        Self {
            groups: groups
                .into_iter()
                .map(|(name, terms)| {
                    let terms = terms
                        .into_iter()
                        .map(|t| t.trim().to_lowercase())
                        .filter(|t| !t.is_empty())
                        .collect();
                    (name, terms)
                })
                .collect(),
        }
    }

    pub fn group_names(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().map(|(name, _)| name.as_str())
    }

    pub fn related(&self, a: &str, b: &str) -> bool {
        let (a, b) = (a.to_lowercase(), b.to_lowercase());
        self.groups.iter().any(|(_, terms)| {
            terms.iter().any(|t| a.contains(t.as_str())) && terms.iter().any(|t| b.contains(t.as_str()))
        })
    }
}

/// A request after canonicalization: `service` is the token vendors are matched on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRequest {
    pub category: String,
    pub service: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceMatch {
    Exact,
    Related,
}

/// Taxonomy plus related-term vocabulary.
#[derive(Debug, Clone)]
pub struct ServiceMatcher {
    taxonomy: ServiceTaxonomy,
    related: RelatedTermGroups,
}

impl ServiceMatcher {
    pub fn new(taxonomy: ServiceTaxonomy, related: RelatedTermGroups) -> Self {
        Self { taxonomy, related }
    }

    pub fn embedded() -> Result<Self, TaxonomyError> {
        Self::from_yaml_str(EMBEDDED_TAXONOMY)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TaxonomyError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| TaxonomyError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, TaxonomyError> {
        let file: TaxonomyFile = serde_yaml::from_str(text)?;
        Ok(Self::new(
            ServiceTaxonomy::new(file.categories)?,
            RelatedTermGroups::new(file.related_terms),
        ))
    }

    pub fn taxonomy(&self) -> &ServiceTaxonomy {
        &self.taxonomy
    }

    pub fn related_terms(&self) -> &RelatedTermGroups {
        &self.related
    }

    /// An empty specific service falls back to the category as the matching token.
    pub fn resolve_request(&self, category: &str, specific: Option<&str>) -> ServiceRequest {
        let category = self.taxonomy.canonical_name(category);
        let service = match specific.map(str::trim).filter(|s| !s.is_empty()) {
            Some(specific) => self.taxonomy.canonical_name(specific),
            None => category.clone(),
        };
        ServiceRequest { category, service }
    }

    pub fn exact_match(&self, offered: &BTreeSet<String>, request: &ServiceRequest) -> bool {
        let token = request.service.as_str();
        if offered.iter().any(|s| s.trim().eq_ignore_ascii_case(token)) {
            return true;
        }

        let taxonomy = &self.taxonomy;

        // A category-level request takes any vendor offering something in that category.
        if taxonomy.category(token).is_some() {
            return offered
                .iter()
                .any(|s| taxonomy.category_of(s).is_some_and(|c| c.eq_ignore_ascii_case(token)));
        }

        let Some(entry) = taxonomy.at_level(token, TaxonomyLevel::Subcategory) else {
            return false;
        };
        let Some(sub) = taxonomy.subcategory(&entry.category, &entry.name) else {
            return false;
        };

        if !sub.services.is_empty() {
            return sub
                .services
                .iter()
                .any(|svc| offered.iter().any(|s| s.trim().eq_ignore_ascii_case(svc)));
        }

        // Leaf subcategory: vendors that registered only at category level still qualify.
        let lists_specific_services = offered
            .iter()
            .any(|s| taxonomy.at_level(s, TaxonomyLevel::Service).is_some());
        !lists_specific_services
            && offered
                .iter()
                .any(|s| s.trim().eq_ignore_ascii_case(&entry.category))
    }

    pub fn related_match(&self, offered: &BTreeSet<String>, request: &ServiceRequest) -> bool {
        offered
            .iter()
            .any(|s| self.related.related(s, &request.service))
    }

    /// Exact match first, related terms otherwise.
    pub fn service_match(
        &self,
        offered: &BTreeSet<String>,
        request: &ServiceRequest,
    ) -> Option<ServiceMatch> {
        if self.exact_match(offered, request) {
            Some(ServiceMatch::Exact)
        } else if self.related_match(offered, request) {
            Some(ServiceMatch::Related)
        } else {
            None
        }
    }

    pub fn matches(&self, offered: &BTreeSet<String>, category: &str, specific: Option<&str>) -> bool {
        let request = self.resolve_request(category, specific);
        self.service_match(offered, &request).is_some()
    }
}

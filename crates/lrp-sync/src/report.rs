use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityCounts {
    /// Fetched contacts classified as this entity.
    pub checked: usize,
    pub created: usize,
    pub updated: usize,
    /// Local records newly marked `inactive_ghl_deleted`.
    pub missing: usize,
}

impl EntityCounts {
    pub fn changes(&self) -> usize {
        self.created + self.updated + self.missing
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: i64,
    pub local_identifiers: usize,
    pub contacts_fetched: usize,
    pub pages_scanned: usize,
    /// The paginated scan stopped before it was exhausted (error or scan cap).
    pub scan_incomplete: bool,
    pub external_calls: u64,
    pub vendors: EntityCounts,
    pub leads: EntityCounts,
    /// Contact ids whose fetch-by-id failed this run.
    pub fetch_failed: Vec<String>,
    pub errors: Vec<String>,
    pub success: bool,
}

impl SyncReport {
    pub fn is_noop(&self) -> bool {
        self.vendors.changes() == 0 && self.leads.changes() == 0
    }

    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("# CRM sync {}\n\n", self.run_id));
        out.push_str(&format!(
            "- Started: {}\n- Finished: {}\n- Elapsed: {} ms\n",
            self.started_at.to_rfc3339(),
            self.finished_at.to_rfc3339(),
            self.elapsed_ms
        ));
        out.push_str(&format!(
            "- Local identifiers: {}\n- Contacts fetched: {}\n- Pages scanned: {}{}\n- CRM calls: {}\n\n",
            self.local_identifiers,
            self.contacts_fetched,
            self.pages_scanned,
            if self.scan_incomplete { " (incomplete)" } else { "" },
            self.external_calls
        ));
        out.push_str("| Entity | Checked | Created | Updated | Missing |\n");
        out.push_str("|---|---:|---:|---:|---:|\n");
        for (name, counts) in [("vendors", &self.vendors), ("leads", &self.leads)] {
            out.push_str(&format!(
                "| {} | {} | {} | {} | {} |\n",
                name, counts.checked, counts.created, counts.updated, counts.missing
            ));
        }
        if !self.fetch_failed.is_empty() {
            out.push_str(&format!(
                "\nFetch failed ({}): {}\n",
                self.fetch_failed.len(),
                self.fetch_failed.join(", ")
            ));
        }
        if !self.errors.is_empty() {
            out.push_str("\n## Errors\n\n");
            for error in &self.errors {
                out.push_str(&format!("- {error}\n"));
            }
        }
        out
    }
}

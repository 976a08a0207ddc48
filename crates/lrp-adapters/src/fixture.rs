//! In-process CRM backed by a JSON fixture, used by tests and `--fixture` dry runs.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use lrp_core::OpportunityId;
use lrp_storage::FetchError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::{
    read_json_file, ContactDraft, ContactPage, CrmClient, CrmContact, CrmContext, CrmError,
    OpportunityDraft, OpportunityUpdate, PageCursor,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureDataset {
    #[serde(default)]
    pub contacts: Vec<Value>,
    /// Contact ids whose fetch-by-id fails with a server error.
    #[serde(default)]
    pub failing_contact_ids: Vec<String>,
}

#[derive(Debug, Default)]
struct FixtureState {
    contacts: BTreeMap<String, CrmContact>,
    opportunities: BTreeMap<OpportunityId, OpportunityDraft>,
    opportunity_updates: Vec<(OpportunityId, OpportunityUpdate)>,
    next_id: u64,
}

#[derive(Debug, Default)]
pub struct FixtureCrmClient {
    state: Mutex<FixtureState>,
    failing_ids: BTreeSet<String>,
    fail_writes: bool,
    calls: AtomicU64,
}

impl FixtureCrmClient {
    pub fn new(contacts: Vec<CrmContact>) -> Self {
        let contacts = contacts.into_iter().map(|c| (c.id.clone(), c)).collect();
        Self {
            state: Mutex::new(FixtureState {
                contacts,
                ..FixtureState::default()
            }),
            ..Self::default()
        }
    }

    pub fn from_dataset(dataset: FixtureDataset) -> Result<Self, CrmError> {
        let contacts = dataset
            .contacts
            .iter()
            .map(CrmContact::from_json)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(contacts).with_failing_ids(dataset.failing_contact_ids))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let dataset: FixtureDataset = read_json_file(path)?;
        Self::from_dataset(dataset)
            .with_context(|| format!("parsing crm fixture contacts in {}", path.display()))
    }

    pub fn with_failing_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.failing_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    /// Every create/update call fails with a server error.
    pub fn with_failing_writes(mut self) -> Self {
        self.fail_writes = true;
        self
    }

    pub async fn upsert_contact(&self, contact: CrmContact) {
        self.state
            .lock()
            .await
            .contacts
            .insert(contact.id.clone(), contact);
    }

    pub async fn remove_contact(&self, contact_id: &str) -> Option<CrmContact> {
        self.state.lock().await.contacts.remove(contact_id)
    }

    pub async fn contact(&self, contact_id: &str) -> Option<CrmContact> {
        self.state.lock().await.contacts.get(contact_id).cloned()
    }

    pub async fn opportunities(&self) -> BTreeMap<OpportunityId, OpportunityDraft> {
        self.state.lock().await.opportunities.clone()
    }

    pub async fn opportunity_updates(&self) -> Vec<(OpportunityId, OpportunityUpdate)> {
        self.state.lock().await.opportunity_updates.clone()
    }

    fn record_call(&self) {
        self.calls.fetch_add(1, Ordering::Relaxed);
    }

    fn server_error(path: &str) -> FetchError {
        FetchError::HttpStatus {
            status: 503,
            url: format!("fixture://{path}"),
            body: String::new(),
        }
    }

    fn check_write(&self, entity: String, operation: &'static str) -> Result<(), CrmError> {
        if self.fail_writes {
            return Err(CrmError::api(entity, operation, Self::server_error("write")));
        }
        Ok(())
    }
}

fn apply_draft(contact: &mut CrmContact, draft: &ContactDraft) {
    let fields = [
        (&mut contact.first_name, &draft.first_name),
        (&mut contact.last_name, &draft.last_name),
        (&mut contact.email, &draft.email),
        (&mut contact.phone, &draft.phone),
        (&mut contact.company_name, &draft.company_name),
        (&mut contact.source, &draft.source),
    ];
    for (target, value) in fields {
        if value.is_some() {
            target.clone_from(value);
        }
    }
    if !draft.tags.is_empty() {
        contact.tags = crate::normalize_tags(&Value::from(draft.tags.clone()));
    }
    contact.custom_fields.extend(
        draft
            .custom_fields
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );
}

#[async_trait]
impl CrmClient for FixtureCrmClient {
    fn name(&self) -> &'static str {
        "fixture"
    }

    async fn get_contact(
        &self,
        _ctx: &CrmContext,
        contact_id: &str,
    ) -> Result<Option<CrmContact>, CrmError> {
        self.record_call();
        if self.failing_ids.contains(contact_id) {
            return Err(CrmError::api(
                format!("contact {contact_id}"),
                "fetch",
                Self::server_error(&format!("contacts/{contact_id}")),
            ));
        }
        Ok(self.contact(contact_id).await)
    }

    async fn search_contact_by_email(
        &self,
        _ctx: &CrmContext,
        email: &str,
    ) -> Result<Option<CrmContact>, CrmError> {
        self.record_call();
        let wanted = email.trim().to_lowercase();
        let state = self.state.lock().await;
        Ok(state
            .contacts
            .values()
            .find(|c| c.normalized_email().as_deref() == Some(wanted.as_str()))
            .cloned())
    }

    async fn list_contacts_page(
        &self,
        _ctx: &CrmContext,
        cursor: Option<&PageCursor>,
        limit: usize,
    ) -> Result<ContactPage, CrmError> {
        self.record_call();
        let limit = limit.max(1);
        let after = cursor.and_then(|c| c.0.as_str()).map(str::to_string);
        let state = self.state.lock().await;
        let contacts: Vec<CrmContact> = state
            .contacts
            .values()
            .filter(|c| after.as_deref().map_or(true, |after| c.id.as_str() > after))
            .take(limit)
            .cloned()
            .collect();
        let next_cursor = if contacts.len() < limit {
            None
        } else {
            contacts
                .last()
                .map(|c| PageCursor(Value::String(c.id.clone())))
        };
        Ok(ContactPage {
            contacts,
            next_cursor,
        })
    }

    async fn create_contact(
        &self,
        _ctx: &CrmContext,
        draft: &ContactDraft,
    ) -> Result<CrmContact, CrmError> {
        self.record_call();
        self.check_write("contact".to_string(), "create")?;
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let mut contact = CrmContact {
            id: format!("fx-contact-{}", state.next_id),
            ..CrmContact::default()
        };
        apply_draft(&mut contact, draft);
        state.contacts.insert(contact.id.clone(), contact.clone());
        Ok(contact)
    }

    async fn update_contact(
        &self,
        _ctx: &CrmContext,
        contact_id: &str,
        draft: &ContactDraft,
    ) -> Result<(), CrmError> {
        self.record_call();
        self.check_write(format!("contact {contact_id}"), "update")?;
        let mut state = self.state.lock().await;
        let contact = state.contacts.get_mut(contact_id).ok_or_else(|| {
            CrmError::api(
                format!("contact {contact_id}"),
                "update",
                FetchError::HttpStatus {
                    status: 404,
                    url: format!("fixture://contacts/{contact_id}"),
                    body: String::new(),
                },
            )
        })?;
        apply_draft(contact, draft);
        Ok(())
    }

    async fn create_opportunity(
        &self,
        _ctx: &CrmContext,
        draft: &OpportunityDraft,
    ) -> Result<OpportunityId, CrmError> {
        self.record_call();
        self.check_write(format!("opportunity for {}", draft.contact_id), "create")?;
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let id = OpportunityId::new(format!("fx-opp-{}", state.next_id));
        state.opportunities.insert(id.clone(), draft.clone());
        Ok(id)
    }

    async fn update_opportunity(
        &self,
        _ctx: &CrmContext,
        opportunity_id: &OpportunityId,
        update: &OpportunityUpdate,
    ) -> Result<(), CrmError> {
        self.record_call();
        self.check_write(format!("opportunity {opportunity_id}"), "update")?;
        let mut state = self.state.lock().await;
        state
            .opportunity_updates
            .push((opportunity_id.clone(), update.clone()));
        Ok(())
    }

    fn external_calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

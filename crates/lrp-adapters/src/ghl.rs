//! GoHighLevel v2 REST client.

use std::sync::Arc;

use async_trait::async_trait;
use lrp_core::OpportunityId;
use lrp_storage::{FetchError, HttpClientConfig, HttpFetcher, JsonResponse, Method, Replay, Url};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::{
    Assignee, ContactDraft, ContactPage, CrmClient, CrmContact, CrmContext, CrmError,
    OpportunityDraft, OpportunityUpdate, PageCursor,
};

pub const GHL_API_VERSION: &str = "2021-07-28";

#[derive(Debug, Clone)]
pub struct GhlConfig {
    pub base_url: String,
    pub private_token: String,
    pub location_id: String,
    pub pipeline_id: Option<String>,
    pub pipeline_stage_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GhlClient {
    http: Arc<HttpFetcher>,
    base: Url,
    config: GhlConfig,
}

impl GhlClient {
    pub fn new(config: GhlConfig, mut http: HttpClientConfig) -> anyhow::Result<Self> {
        if config.private_token.trim().is_empty() {
            anyhow::bail!("GHL_PRIVATE_TOKEN is required for the GoHighLevel client");
        }
        if config.location_id.trim().is_empty() {
            anyhow::bail!("GHL_LOCATION_ID is required for the GoHighLevel client");
        }
        let base = Url::parse(config.base_url.trim())
            .map_err(|err| anyhow::anyhow!("invalid GHL base url '{}': {err}", config.base_url))?;
        if base.cannot_be_a_base() {
            anyhow::bail!("GHL base url '{}' cannot carry a path", config.base_url);
        }
        http.default_headers
            .push(("Version".to_string(), GHL_API_VERSION.to_string()));
        http.default_headers
            .push(("Accept".to_string(), "application/json".to_string()));
        Ok(Self {
            http: Arc::new(HttpFetcher::new(http)?),
            base,
            config,
        })
    }

    /// Appends percent-encoded path segments to the base url.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        // `new` rejects cannot-be-a-base urls.
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn call(
        &self,
        ctx: &CrmContext,
        method: Method,
        replay: Replay,
        segments: &[&str],
        body: Option<&Value>,
    ) -> Result<JsonResponse, FetchError> {
        self.http
            .send_json(
                ctx.run_id,
                method,
                replay,
                self.endpoint(segments).as_str(),
                Some(&self.config.private_token),
                body,
            )
            .await
    }

    fn parse_contacts(body: &Value) -> Result<Vec<CrmContact>, CrmError> {
        body.get("contacts")
            .and_then(Value::as_array)
            .map(|items| items.iter().map(CrmContact::from_json).collect())
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    fn contact_body(&self, draft: &ContactDraft, include_location: bool) -> Value {
        let mut body = Map::new();
        if include_location {
            body.insert("locationId".into(), json!(self.config.location_id));
        }
        let optional = [
            ("firstName", &draft.first_name),
            ("lastName", &draft.last_name),
            ("email", &draft.email),
            ("phone", &draft.phone),
            ("companyName", &draft.company_name),
            ("source", &draft.source),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                body.insert(key.into(), json!(value));
            }
        }
        if !draft.tags.is_empty() {
            body.insert("tags".into(), json!(draft.tags));
        }
        if !draft.custom_fields.is_empty() {
            body.insert("customFields".into(), custom_fields_json(&draft.custom_fields));
        }
        Value::Object(body)
    }
}

fn custom_fields_json(fields: &std::collections::BTreeMap<String, String>) -> Value {
    Value::Array(
        fields
            .iter()
            .map(|(id, value)| json!({ "id": id, "field_value": value }))
            .collect(),
    )
}

fn opportunity_body(update: &OpportunityUpdate) -> Value {
    let mut body = Map::new();
    match &update.assigned_to {
        Assignee::Unchanged => {}
        Assignee::User(user) => {
            body.insert("assignedTo".into(), json!(user));
        }
        Assignee::Cleared => {
            body.insert("assignedTo".into(), Value::Null);
        }
    }
    if let Some(status) = &update.status {
        body.insert("status".into(), json!(status));
    }
    if !update.custom_fields.is_empty() {
        body.insert("customFields".into(), custom_fields_json(&update.custom_fields));
    }
    Value::Object(body)
}

#[async_trait]
impl CrmClient for GhlClient {
    fn name(&self) -> &'static str {
        "gohighlevel"
    }

    async fn get_contact(
        &self,
        ctx: &CrmContext,
        contact_id: &str,
    ) -> Result<Option<CrmContact>, CrmError> {
        match self
            .call(ctx, Method::GET, Replay::Safe, &["contacts", contact_id], None)
            .await
        {
            Ok(resp) => match resp.body.get("contact") {
                Some(contact) if !contact.is_null() => Ok(Some(CrmContact::from_json(contact)?)),
                _ => Ok(None),
            },
            Err(err) if err.is_not_found() => {
                debug!(contact_id, "contact not found in crm");
                Ok(None)
            }
            Err(err) => Err(CrmError::api(format!("contact {contact_id}"), "fetch", err)),
        }
    }

    async fn search_contact_by_email(
        &self,
        ctx: &CrmContext,
        email: &str,
    ) -> Result<Option<CrmContact>, CrmError> {
        let wanted = email.trim().to_lowercase();
        let body = json!({
            "locationId": self.config.location_id,
            "query": wanted,
            "limit": 20,
        });
        let resp = self
            .call(ctx, Method::POST, Replay::Safe, &["contacts", "search"], Some(&body))
            .await
            .map_err(|err| CrmError::api(format!("contact <{wanted}>"), "search", err))?;
        Ok(Self::parse_contacts(&resp.body)?
            .into_iter()
            .find(|c| c.normalized_email().as_deref() == Some(wanted.as_str())))
    }

    async fn list_contacts_page(
        &self,
        ctx: &CrmContext,
        cursor: Option<&PageCursor>,
        limit: usize,
    ) -> Result<ContactPage, CrmError> {
        let limit = limit.clamp(1, 500);
        let mut body = json!({
            "locationId": self.config.location_id,
            "limit": limit,
        });
        if let Some(cursor) = cursor {
            body["searchAfter"] = cursor.0.clone();
        }
        let resp = self
            .call(ctx, Method::POST, Replay::Safe, &["contacts", "search"], Some(&body))
            .await
            .map_err(|err| CrmError::api("contact list", "scan", err))?;
        let contacts = Self::parse_contacts(&resp.body)?;
        let next_cursor = if contacts.len() < limit {
            None
        } else {
            contacts
                .last()
                .and_then(|c| c.search_after.clone())
                .map(PageCursor)
        };
        Ok(ContactPage {
            contacts,
            next_cursor,
        })
    }

    async fn create_contact(
        &self,
        ctx: &CrmContext,
        draft: &ContactDraft,
    ) -> Result<CrmContact, CrmError> {
        let body = self.contact_body(draft, true);
        let resp = self
            .call(ctx, Method::POST, Replay::Once, &["contacts", ""], Some(&body))
            .await
            .map_err(|err| CrmError::api("contact", "create", err))?;
        let contact = resp
            .body
            .get("contact")
            .ok_or_else(|| CrmError::Payload("create contact response without contact".into()))?;
        CrmContact::from_json(contact)
    }

    async fn update_contact(
        &self,
        ctx: &CrmContext,
        contact_id: &str,
        draft: &ContactDraft,
    ) -> Result<(), CrmError> {
        let body = self.contact_body(draft, false);
        self.call(
            ctx,
            Method::PUT,
            Replay::Safe,
            &["contacts", contact_id],
            Some(&body),
        )
        .await
        .map_err(|err| CrmError::api(format!("contact {contact_id}"), "update", err))?;
        Ok(())
    }

    async fn create_opportunity(
        &self,
        ctx: &CrmContext,
        draft: &OpportunityDraft,
    ) -> Result<OpportunityId, CrmError> {
        let pipeline_id = self
            .config
            .pipeline_id
            .as_deref()
            .ok_or(CrmError::NotConfigured("GHL_PIPELINE_ID"))?;
        let mut body = json!({
            "locationId": self.config.location_id,
            "pipelineId": pipeline_id,
            "contactId": draft.contact_id,
            "name": draft.name,
            "status": "open",
        });
        if let Some(stage) = &self.config.pipeline_stage_id {
            body["pipelineStageId"] = json!(stage);
        }
        if let Some(source) = &draft.source {
            body["source"] = json!(source);
        }
        if let Some(value) = draft.monetary_value {
            body["monetaryValue"] = json!(value);
        }
        let resp = self
            .call(ctx, Method::POST, Replay::Once, &["opportunities", ""], Some(&body))
            .await
            .map_err(|err| {
                CrmError::api(format!("opportunity for {}", draft.contact_id), "create", err)
            })?;
        resp.body
            .pointer("/opportunity/id")
            .or_else(|| resp.body.get("id"))
            .and_then(Value::as_str)
            .map(OpportunityId::new)
            .ok_or_else(|| CrmError::Payload("create opportunity response without id".into()))
    }

    async fn update_opportunity(
        &self,
        ctx: &CrmContext,
        opportunity_id: &OpportunityId,
        update: &OpportunityUpdate,
    ) -> Result<(), CrmError> {
        let body = opportunity_body(update);
        self.call(
            ctx,
            Method::PUT,
            Replay::Safe,
            &["opportunities", opportunity_id.as_str()],
            Some(&body),
        )
        .await
        .map_err(|err| CrmError::api(format!("opportunity {opportunity_id}"), "update", err))?;
        Ok(())
    }

    fn external_calls(&self) -> u64 {
        self.http.requests_sent()
    }
}

//! SQLite-backed [`LeadRouterStore`].

use std::collections::BTreeSet;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lrp_core::{
    CoverageType, Lead, LeadDetails, LeadStatus, NewLead, NewVendor, OpportunityId,
    RoutingConfig, Vendor, VendorStatus,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::types::Json;
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

use crate::store::{LeadRouterStore, StoreError};

pub const PERFORMANCE_PERCENTAGE_KEY: &str = "lead_routing_performance_percentage";

const VENDOR_COLUMNS: &str = "id, ghl_contact_id, ghl_user_id, name, email, phone, company_name, \
    services_offered, primary_service_category, coverage_type, coverage_states, \
    coverage_counties, coverage_zips, status, taking_new_work, last_lead_assigned_ms, \
    lead_close_percentage, created_at, updated_at";

const LEAD_COLUMNS: &str = "id, ghl_contact_id, ghl_opportunity_id, customer_name, \
    customer_email, customer_phone, primary_service_category, specific_service_requested, \
    service_zip_code, service_state, service_county, vendor_id, status, source, created_at, \
    updated_at";

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connects to a `sqlite://` URL, creating the database file when missing.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?;
        Self::connect_with(options).await
    }

    pub async fn open_path(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new().filename(path.as_ref());
        Self::connect_with(options).await
    }

    async fn connect_with(options: SqliteConnectOptions) -> Result<Self, StoreError> {
        let options = options
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn fetch_vendor(&self, clause: &str, value: &str) -> Result<Option<Vendor>, StoreError> {
        let sql = format!("SELECT {VENDOR_COLUMNS} FROM vendors WHERE {clause} LIMIT 1");
        let row = sqlx::query(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(vendor_from_row).transpose()
    }

    async fn fetch_lead(&self, clause: &str, value: &str) -> Result<Option<Lead>, StoreError> {
        let sql =
            format!("SELECT {LEAD_COLUMNS} FROM leads WHERE {clause} ORDER BY created_at LIMIT 1");
        let row = sqlx::query(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(lead_from_row).transpose()
    }

    async fn touch(
        &self,
        sql: &str,
        entity: &'static str,
        id: Uuid,
        value: &str,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(sql)
            .bind(value)
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { entity, id });
        }
        Ok(())
    }
}

#[async_trait]
impl LeadRouterStore for SqliteStore {
    async fn list_vendors(&self) -> Result<Vec<Vendor>, StoreError> {
        let sql = format!("SELECT {VENDOR_COLUMNS} FROM vendors ORDER BY created_at, id");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(vendor_from_row).collect()
    }

    async fn get_vendor(&self, id: Uuid) -> Result<Option<Vendor>, StoreError> {
        self.fetch_vendor("id = ?", &id.to_string()).await
    }

    async fn find_vendor_by_contact_id(
        &self,
        contact_id: &str,
    ) -> Result<Option<Vendor>, StoreError> {
        self.fetch_vendor("ghl_contact_id = ?", contact_id).await
    }

    async fn find_vendor_by_email(&self, email: &str) -> Result<Option<Vendor>, StoreError> {
        self.fetch_vendor("lower(email) = lower(?)", email.trim())
            .await
    }

    async fn insert_vendor(&self, vendor: NewVendor) -> Result<Vendor, StoreError> {
        let vendor = vendor.into_vendor(Uuid::new_v4(), Utc::now());
        let sql = format!(
            "INSERT INTO vendors ({VENDOR_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        );
        sqlx::query(&sql)
            .bind(vendor.id.to_string())
            .bind(&vendor.ghl_contact_id)
            .bind(&vendor.ghl_user_id)
            .bind(&vendor.name)
            .bind(&vendor.email)
            .bind(&vendor.phone)
            .bind(&vendor.company_name)
            .bind(Json(&vendor.services_offered))
            .bind(&vendor.primary_service_category)
            .bind(vendor.coverage_type.as_str())
            .bind(Json(&vendor.coverage_states))
            .bind(Json(&vendor.coverage_counties))
            .bind(Json(&vendor.coverage_zips))
            .bind(vendor.status.as_str())
            .bind(vendor.taking_new_work)
            .bind(vendor.last_lead_assigned.map(|ts| ts.timestamp_millis()))
            .bind(vendor.lead_close_percentage)
            .bind(vendor.created_at)
            .bind(vendor.updated_at)
            .execute(&self.pool)
            .await?;
        debug!(vendor_id = %vendor.id, "vendor inserted");
        Ok(vendor)
    }

    async fn update_vendor(&self, vendor: &Vendor) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE vendors SET ghl_contact_id = ?, ghl_user_id = ?, name = ?, email = ?, \
             phone = ?, company_name = ?, services_offered = ?, primary_service_category = ?, \
             coverage_type = ?, coverage_states = ?, coverage_counties = ?, coverage_zips = ?, \
             status = ?, taking_new_work = ?, lead_close_percentage = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(&vendor.ghl_contact_id)
        .bind(&vendor.ghl_user_id)
        .bind(&vendor.name)
        .bind(&vendor.email)
        .bind(&vendor.phone)
        .bind(&vendor.company_name)
        .bind(Json(&vendor.services_offered))
        .bind(&vendor.primary_service_category)
        .bind(vendor.coverage_type.as_str())
        .bind(Json(&vendor.coverage_states))
        .bind(Json(&vendor.coverage_counties))
        .bind(Json(&vendor.coverage_zips))
        .bind(vendor.status.as_str())
        .bind(vendor.taking_new_work)
        .bind(vendor.lead_close_percentage)
        .bind(Utc::now())
        .bind(vendor.id.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "vendor",
                id: vendor.id,
            });
        }
        Ok(())
    }

    async fn set_vendor_status(&self, id: Uuid, status: VendorStatus) -> Result<(), StoreError> {
        self.touch(
            "UPDATE vendors SET status = ?, updated_at = ? WHERE id = ?",
            "vendor",
            id,
            status.as_str(),
        )
        .await
    }

    async fn claim_vendor(
        &self,
        id: Uuid,
        expected: Option<DateTime<Utc>>,
        assigned_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE vendors SET last_lead_assigned_ms = ?, updated_at = ? \
             WHERE id = ? AND last_lead_assigned_ms IS ?",
        )
        .bind(assigned_at.timestamp_millis())
        .bind(Utc::now())
        .bind(id.to_string())
        .bind(expected.map(|ts| ts.timestamp_millis()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_leads(&self) -> Result<Vec<Lead>, StoreError> {
        let sql = format!("SELECT {LEAD_COLUMNS} FROM leads ORDER BY created_at, id");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(lead_from_row).collect()
    }

    async fn get_lead(&self, id: Uuid) -> Result<Option<Lead>, StoreError> {
        self.fetch_lead("id = ?", &id.to_string()).await
    }

    async fn find_lead_by_contact_id(&self, contact_id: &str) -> Result<Option<Lead>, StoreError> {
        self.fetch_lead("ghl_contact_id = ?", contact_id).await
    }

    async fn find_lead_by_opportunity_id(
        &self,
        opportunity_id: &OpportunityId,
    ) -> Result<Option<Lead>, StoreError> {
        self.fetch_lead("ghl_opportunity_id = ?", opportunity_id.as_str())
            .await
    }

    async fn find_lead_by_email(&self, email: &str) -> Result<Option<Lead>, StoreError> {
        self.fetch_lead("lower(customer_email) = lower(?)", email.trim())
            .await
    }

    async fn insert_lead(&self, lead: NewLead) -> Result<Lead, StoreError> {
        let lead = lead.into_lead(Uuid::new_v4(), Utc::now());
        let sql = format!(
            "INSERT INTO leads ({LEAD_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        );
        let details = &lead.details;
        sqlx::query(&sql)
            .bind(lead.id.to_string())
            .bind(&lead.ghl_contact_id)
            .bind(lead.opportunity_id.as_ref().map(OpportunityId::as_str))
            .bind(&details.customer_name)
            .bind(&details.customer_email)
            .bind(&details.customer_phone)
            .bind(&details.primary_service_category)
            .bind(&details.specific_service_requested)
            .bind(&details.service_zip_code)
            .bind(&details.service_state)
            .bind(&details.service_county)
            .bind(lead.vendor_id.map(|id| id.to_string()))
            .bind(lead.status.as_str())
            .bind(&lead.source)
            .bind(lead.created_at)
            .bind(lead.updated_at)
            .execute(&self.pool)
            .await?;
        debug!(lead_id = %lead.id, "lead inserted");
        Ok(lead)
    }

    async fn update_lead(&self, lead: &Lead) -> Result<(), StoreError> {
        let details = &lead.details;
        let result = sqlx::query(
            "UPDATE leads SET ghl_contact_id = ?, ghl_opportunity_id = ?, customer_name = ?, \
             customer_email = ?, customer_phone = ?, primary_service_category = ?, \
             specific_service_requested = ?, service_zip_code = ?, service_state = ?, \
             service_county = ?, vendor_id = ?, status = ?, source = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(&lead.ghl_contact_id)
        .bind(lead.opportunity_id.as_ref().map(OpportunityId::as_str))
        .bind(&details.customer_name)
        .bind(&details.customer_email)
        .bind(&details.customer_phone)
        .bind(&details.primary_service_category)
        .bind(&details.specific_service_requested)
        .bind(&details.service_zip_code)
        .bind(&details.service_state)
        .bind(&details.service_county)
        .bind(lead.vendor_id.map(|id| id.to_string()))
        .bind(lead.status.as_str())
        .bind(&lead.source)
        .bind(Utc::now())
        .bind(lead.id.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "lead",
                id: lead.id,
            });
        }
        Ok(())
    }

    async fn set_lead_status(&self, id: Uuid, status: LeadStatus) -> Result<(), StoreError> {
        self.touch(
            "UPDATE leads SET status = ?, updated_at = ? WHERE id = ?",
            "lead",
            id,
            status.as_str(),
        )
        .await
    }

    async fn assign_lead(&self, id: Uuid, vendor_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE leads SET vendor_id = ?, status = ?, updated_at = ? WHERE id = ?",
        )
        .bind(vendor_id.to_string())
        .bind(LeadStatus::Assigned.as_str())
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { entity: "lead", id });
        }
        Ok(())
    }

    async fn release_lead(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE leads SET vendor_id = NULL, status = ?, updated_at = ? WHERE id = ?",
        )
        .bind(LeadStatus::Unassigned.as_str())
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { entity: "lead", id });
        }
        Ok(())
    }

    async fn attach_opportunity(
        &self,
        id: Uuid,
        opportunity_id: &OpportunityId,
    ) -> Result<(), StoreError> {
        self.touch(
            "UPDATE leads SET ghl_opportunity_id = ?, updated_at = ? WHERE id = ?",
            "lead",
            id,
            opportunity_id.as_str(),
        )
        .await
    }

    async fn routing_config(&self) -> Result<RoutingConfig, StoreError> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
            .bind(PERFORMANCE_PERCENTAGE_KEY)
            .fetch_optional(&self.pool)
            .await?;
        let Some(value) = value else {
            return Ok(RoutingConfig::default());
        };
        let percentage: f64 = value.trim().parse().map_err(|_| StoreError::Decode {
            column: "settings.value",
            value: value.clone(),
        })?;
        Ok(RoutingConfig::new(percentage)?)
    }

    async fn set_routing_config(&self, config: RoutingConfig) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO settings (key, value, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(PERFORMANCE_PERCENTAGE_KEY)
        .bind(config.performance_percentage().to_string())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        info!(
            performance_percentage = config.performance_percentage(),
            "routing configuration updated"
        );
        Ok(())
    }
}

fn parse_uuid(column: &'static str, value: String) -> Result<Uuid, StoreError> {
    Uuid::parse_str(&value).map_err(|_| StoreError::Decode { column, value })
}

fn parse_label<T: FromStr>(column: &'static str, value: String) -> Result<T, StoreError> {
    value
        .parse()
        .map_err(|_| StoreError::Decode { column, value })
}

fn string_set(row: &SqliteRow, column: &'static str) -> Result<BTreeSet<String>, StoreError> {
    let Json(set) = row.try_get::<Json<BTreeSet<String>>, _>(column)?;
    Ok(set)
}

fn vendor_from_row(row: &SqliteRow) -> Result<Vendor, StoreError> {
    let last_ms: Option<i64> = row.try_get("last_lead_assigned_ms")?;
    let last_lead_assigned = match last_ms {
        Some(ms) => Some(DateTime::from_timestamp_millis(ms).ok_or(StoreError::Decode {
            column: "vendors.last_lead_assigned_ms",
            value: ms.to_string(),
        })?),
        None => None,
    };

    Ok(Vendor {
        id: parse_uuid("vendors.id", row.try_get("id")?)?,
        ghl_contact_id: row.try_get("ghl_contact_id")?,
        ghl_user_id: row.try_get("ghl_user_id")?,
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        phone: row.try_get("phone")?,
        company_name: row.try_get("company_name")?,
        services_offered: string_set(row, "services_offered")?,
        primary_service_category: row.try_get("primary_service_category")?,
        coverage_type: parse_label::<CoverageType>(
            "vendors.coverage_type",
            row.try_get("coverage_type")?,
        )?,
        coverage_states: string_set(row, "coverage_states")?,
        coverage_counties: string_set(row, "coverage_counties")?,
        coverage_zips: string_set(row, "coverage_zips")?,
        status: parse_label::<VendorStatus>("vendors.status", row.try_get("status")?)?,
        taking_new_work: row.try_get("taking_new_work")?,
        last_lead_assigned,
        lead_close_percentage: row.try_get("lead_close_percentage")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn lead_from_row(row: &SqliteRow) -> Result<Lead, StoreError> {
    let vendor_id: Option<String> = row.try_get("vendor_id")?;
    let opportunity_id: Option<String> = row.try_get("ghl_opportunity_id")?;

    Ok(Lead {
        id: parse_uuid("leads.id", row.try_get("id")?)?,
        ghl_contact_id: row.try_get("ghl_contact_id")?,
        opportunity_id: opportunity_id.map(OpportunityId::new),
        details: LeadDetails {
            customer_name: row.try_get("customer_name")?,
            customer_email: row.try_get("customer_email")?,
            customer_phone: row.try_get("customer_phone")?,
            primary_service_category: row.try_get("primary_service_category")?,
            specific_service_requested: row.try_get("specific_service_requested")?,
            service_zip_code: row.try_get("service_zip_code")?,
            service_state: row.try_get("service_state")?,
            service_county: row.try_get("service_county")?,
        },
        vendor_id: vendor_id
            .map(|id| parse_uuid("leads.vendor_id", id))
            .transpose()?,
        status: parse_label::<LeadStatus>("leads.status", row.try_get("status")?)?,
        source: row.try_get("source")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    async fn store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempdir().expect("tempdir");
        let store = SqliteStore::open_path(dir.path().join("lrp.db"))
            .await
            .expect("open");
        store.migrate().await.expect("migrate");
        (dir, store)
    }

    fn new_vendor(email: &str) -> NewVendor {
        NewVendor {
            ghl_contact_id: Some(format!("contact-{email}")),
            ghl_user_id: None,
            name: "Dock Pros".into(),
            email: Some(email.into()),
            phone: None,
            company_name: "Dock Pros LLC".into(),
            services_offered: BTreeSet::from(["Dock Repair".to_string()]),
            primary_service_category: Some("Docks, Seawalls and Lifts".into()),
            coverage_type: CoverageType::County,
            coverage_states: BTreeSet::from(["FL".to_string()]),
            coverage_counties: BTreeSet::from(["Broward, FL".to_string()]),
            coverage_zips: BTreeSet::new(),
            status: VendorStatus::Active,
            taking_new_work: true,
            lead_close_percentage: 12.5,
        }
    }

    #[tokio::test]
    async fn vendors_round_trip_through_sqlite() {
        let (_dir, store) = store().await;
        let inserted = store.insert_vendor(new_vendor("ops@dockpros.test")).await.unwrap();

        let by_email = store
            .find_vendor_by_email("OPS@dockpros.test")
            .await
            .unwrap()
            .expect("vendor by email");
        assert_eq!(by_email.id, inserted.id);
        assert_eq!(by_email.coverage_counties, inserted.coverage_counties);
        assert_eq!(by_email.status, VendorStatus::Active);
        assert!(by_email.last_lead_assigned.is_none());

        store
            .set_vendor_status(inserted.id, VendorStatus::Deactivated)
            .await
            .unwrap();
        let reloaded = store.get_vendor(inserted.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, VendorStatus::Deactivated);
    }

    #[tokio::test]
    async fn claim_is_a_compare_and_swap() {
        let (_dir, store) = store().await;
        let vendor = store.insert_vendor(new_vendor("a@b.test")).await.unwrap();
        let first = Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).single().unwrap();
        let second = Utc.with_ymd_and_hms(2026, 5, 1, 9, 5, 0).single().unwrap();

        assert!(store.claim_vendor(vendor.id, None, first).await.unwrap());
        // A stale snapshot loses.
        assert!(!store.claim_vendor(vendor.id, None, second).await.unwrap());
        assert!(store
            .claim_vendor(vendor.id, Some(first), second)
            .await
            .unwrap());

        let reloaded = store.get_vendor(vendor.id).await.unwrap().unwrap();
        assert_eq!(reloaded.last_lead_assigned, Some(second));
    }

    #[tokio::test]
    async fn profile_updates_never_touch_the_claim_column() {
        let (_dir, store) = store().await;
        let vendor = store.insert_vendor(new_vendor("c@d.test")).await.unwrap();
        let at = Utc.with_ymd_and_hms(2026, 5, 2, 10, 0, 0).single().unwrap();
        assert!(store.claim_vendor(vendor.id, None, at).await.unwrap());

        let mut stale = vendor.clone();
        stale.company_name = "Renamed".into();
        store.update_vendor(&stale).await.unwrap();

        let reloaded = store.get_vendor(vendor.id).await.unwrap().unwrap();
        assert_eq!(reloaded.company_name, "Renamed");
        assert_eq!(reloaded.last_lead_assigned, Some(at));
    }

    #[tokio::test]
    async fn leads_track_opportunities_and_assignment() {
        let (_dir, store) = store().await;
        let vendor = store.insert_vendor(new_vendor("e@f.test")).await.unwrap();
        let lead = store
            .insert_lead(NewLead::for_opportunity(
                OpportunityId::new("opp-77"),
                "contact-77",
                LeadDetails {
                    customer_name: "Pat".into(),
                    customer_email: Some("pat@example.com".into()),
                    primary_service_category: "Boat Maintenance".into(),
                    ..Default::default()
                },
                "webhook",
            ))
            .await
            .unwrap();

        store.assign_lead(lead.id, vendor.id).await.unwrap();
        let reloaded = store
            .find_lead_by_opportunity_id(&OpportunityId::new("opp-77"))
            .await
            .unwrap()
            .expect("lead by opportunity");
        assert_eq!(reloaded.vendor_id, Some(vendor.id));
        assert_eq!(reloaded.status, LeadStatus::Assigned);
        assert!(store
            .find_lead_by_email("PAT@example.com")
            .await
            .unwrap()
            .is_some());

        store.release_lead(lead.id).await.unwrap();
        let released = store.get_lead(lead.id).await.unwrap().unwrap();
        assert_eq!(released.vendor_id, None);
        assert_eq!(released.status, LeadStatus::Unassigned);
        assert!(matches!(
            store.release_lead(Uuid::new_v4()).await,
            Err(StoreError::NotFound { entity: "lead", .. })
        ));
    }

    #[tokio::test]
    async fn routing_config_defaults_to_pure_round_robin() {
        let (_dir, store) = store().await;
        assert_eq!(
            store.routing_config().await.unwrap().performance_percentage(),
            0.0
        );
        store
            .set_routing_config(RoutingConfig::new(35.0).unwrap())
            .await
            .unwrap();
        store
            .set_routing_config(RoutingConfig::new(40.0).unwrap())
            .await
            .unwrap();
        assert_eq!(
            store.routing_config().await.unwrap().performance_percentage(),
            40.0
        );
    }

    #[tokio::test]
    async fn missing_rows_are_reported() {
        let (_dir, store) = store().await;
        let err = store
            .set_lead_status(Uuid::new_v4(), LeadStatus::Unassigned)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { entity: "lead", .. }));
    }
}

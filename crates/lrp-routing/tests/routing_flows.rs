use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{Duration, SubsecRound, Utc};
use lrp_adapters::{Assignee, CrmContact, CrmContext, CrmFieldMap, FixtureCrmClient};
use lrp_core::{CoverageType, LeadStatus, NewVendor, RoutingConfig, Vendor, VendorStatus};
use lrp_routing::{
    FixedDraw, IntakeOutcome, IntakeRequest, LeadIntakeService, LeadRouter, RoutingError,
    RoutingRequest, RoutingService, SelectionMethod, ServiceMatcher, ZipDatabase,
};
use lrp_storage::{LeadRouterStore, SqliteStore};
use tempfile::TempDir;

async fn store() -> (TempDir, Arc<SqliteStore>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SqliteStore::open_path(dir.path().join("routing.db"))
        .await
        .expect("open store");
    store.migrate().await.expect("migrate");
    (dir, Arc::new(store))
}

fn router(draw: f64) -> LeadRouter {
    LeadRouter::new(
        Arc::new(ZipDatabase::embedded().expect("zip db")),
        Arc::new(ServiceMatcher::embedded().expect("taxonomy")),
    )
    .with_random(Arc::new(FixedDraw(draw)))
}

fn new_vendor(name: &str) -> NewVendor {
    NewVendor {
        ghl_contact_id: Some(format!("ghl-{name}")),
        ghl_user_id: Some(format!("usr-{name}")),
        name: name.to_string(),
        email: Some(format!("{name}@vendors.test")),
        phone: None,
        company_name: name.to_string(),
        services_offered: BTreeSet::from(["Boat Detailing".to_string()]),
        primary_service_category: Some("Boat Maintenance".into()),
        coverage_type: CoverageType::Global,
        coverage_states: BTreeSet::new(),
        coverage_counties: BTreeSet::new(),
        coverage_zips: BTreeSet::new(),
        status: VendorStatus::Active,
        taking_new_work: true,
        lead_close_percentage: 0.0,
    }
}

async fn insert_idle(store: &SqliteStore, name: &str, hours_idle: i64, close: f64) -> Vendor {
    let mut vendor = new_vendor(name);
    vendor.lead_close_percentage = close;
    let vendor = store.insert_vendor(vendor).await.expect("insert vendor");
    let at = (Utc::now() - Duration::hours(hours_idle)).trunc_subsecs(3);
    assert!(store.claim_vendor(vendor.id, None, at).await.expect("claim"));
    store.get_vendor(vendor.id).await.expect("get").expect("vendor")
}

fn detailing(zip: &str) -> RoutingRequest {
    RoutingRequest {
        category: "Boat Maintenance".into(),
        specific_service: Some("Boat Detailing".into()),
        zip_code: zip.into(),
    }
}

#[tokio::test]
async fn miami_beach_lead_goes_to_the_miami_dade_vendor() {
    let (_dir, store) = store().await;

    let mut county = new_vendor("county");
    county.coverage_type = CoverageType::County;
    county.coverage_counties = BTreeSet::from(["Miami-Dade, FL".to_string()]);
    let county = store.insert_vendor(county).await.unwrap();

    let mut georgia = new_vendor("georgia");
    georgia.coverage_type = CoverageType::State;
    georgia.coverage_states = BTreeSet::from(["GA".to_string()]);
    store.insert_vendor(georgia).await.unwrap();

    let service = RoutingService::new(store.clone(), router(0.0));
    let eligible = service
        .router()
        .eligible_vendors(&detailing("33139"), &store.list_vendors().await.unwrap(), None);
    assert_eq!(eligible.len(), 1);

    let decision = service.assign(&detailing("33139"), None).await.unwrap();
    assert_eq!(decision.vendor.id, county.id);
    assert_eq!(decision.coverage_reason, "County coverage: Miami-Dade, FL");
}

#[tokio::test]
async fn round_robin_rotates_to_the_next_oldest_vendor() {
    let (_dir, store) = store().await;
    let three_hours = insert_idle(&store, "three", 3, 0.0).await;
    insert_idle(&store, "one", 1, 0.0).await;
    let five_hours = insert_idle(&store, "five", 5, 0.0).await;

    let service = RoutingService::new(store.clone(), router(50.0));
    let first = service.assign(&detailing("33139"), None).await.unwrap();
    assert_eq!(first.method, SelectionMethod::RoundRobin);
    assert_eq!(first.vendor.id, five_hours.id);

    let bumped = store.get_vendor(five_hours.id).await.unwrap().unwrap();
    assert!(bumped.last_lead_assigned > five_hours.last_lead_assigned);
    assert!(bumped.last_lead_assigned.unwrap() > Utc::now() - Duration::minutes(1));

    let second = service.assign(&detailing("33139"), None).await.unwrap();
    assert_eq!(second.vendor.id, three_hours.id);
}

#[tokio::test]
async fn performance_mode_breaks_ties_by_recency() {
    let (_dir, store) = store().await;
    insert_idle(&store, "two", 2, 80.0).await;
    let four = insert_idle(&store, "four", 4, 80.0).await;
    insert_idle(&store, "low", 10, 20.0).await;
    store
        .set_routing_config(RoutingConfig::new(100.0).unwrap())
        .await
        .unwrap();

    let service = RoutingService::new(store.clone(), router(99.9));
    let decision = service.assign(&detailing("33139"), None).await.unwrap();
    assert_eq!(decision.method, SelectionMethod::Performance);
    assert_eq!(decision.vendor.id, four.id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_assignments_never_share_a_vendor() {
    let (_dir, store) = store().await;
    for name in ["a", "b", "c", "d"] {
        store.insert_vendor(new_vendor(name)).await.unwrap();
    }
    let service = RoutingService::new(store.clone(), router(0.0));

    let mut handles = Vec::new();
    for _ in 0..4 {
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            service.assign(&detailing("33139"), None).await
        }));
    }

    let mut chosen = BTreeSet::new();
    for handle in handles {
        let decision = handle.await.expect("join").expect("assign");
        chosen.insert(decision.vendor.id);
    }
    assert_eq!(chosen.len(), 4);
}

#[tokio::test]
async fn unresolvable_zip_still_reaches_global_vendors() {
    let (_dir, store) = store().await;
    let global = store.insert_vendor(new_vendor("global")).await.unwrap();
    let mut county = new_vendor("county");
    county.coverage_type = CoverageType::County;
    county.coverage_counties = BTreeSet::from(["Miami-Dade, FL".to_string()]);
    store.insert_vendor(county).await.unwrap();

    let service = RoutingService::new(store.clone(), router(0.0));
    let decision = service.assign(&detailing("not a zip"), None).await.unwrap();
    assert_eq!(decision.vendor.id, global.id);

    let err = service
        .assign(
            &RoutingRequest {
                category: "Boat Towing".into(),
                specific_service: None,
                zip_code: "33139".into(),
            },
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RoutingError::NoEligibleVendor(_)));
}

fn intake_request(zip: &str) -> IntakeRequest {
    IntakeRequest {
        customer_name: "Carla Diaz".into(),
        customer_email: Some("carla.diaz@example.com".into()),
        customer_phone: Some("+13055550123".into()),
        category: "Boat Maintenance".into(),
        specific_service: Some("Boat Detailing".into()),
        zip_code: zip.into(),
        source: "Boat Maintenance Form".into(),
    }
}

#[tokio::test]
async fn intake_creates_the_opportunity_before_the_lead() {
    let (_dir, store) = store().await;
    let vendor = store.insert_vendor(new_vendor("shine")).await.unwrap();
    let crm = Arc::new(FixtureCrmClient::default());
    let intake = LeadIntakeService::new(
        crm.clone(),
        RoutingService::new(store.clone(), router(0.0)),
        CrmFieldMap::default(),
    );

    let outcome = intake
        .intake(&CrmContext::new(), &intake_request("33139"))
        .await
        .unwrap();
    let IntakeOutcome::Assigned { lead, decision } = outcome else {
        panic!("expected assignment");
    };
    assert_eq!(decision.vendor.id, vendor.id);
    assert_eq!(lead.status, LeadStatus::Assigned);
    assert_eq!(lead.vendor_id, Some(vendor.id));
    assert_eq!(lead.details.service_county.as_deref(), Some("Miami-Dade"));
    assert_eq!(lead.details.service_state.as_deref(), Some("FL"));

    let opportunity = lead.opportunity_id.clone().expect("opportunity id");
    assert!(crm.opportunities().await.contains_key(&opportunity));
    let updates = crm.opportunity_updates().await;
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].0, opportunity);
    assert_eq!(updates[0].1.assigned_to.user(), Some("usr-shine"));
}

#[tokio::test]
async fn intake_without_vendors_is_an_unassigned_outcome() {
    let (_dir, store) = store().await;
    let intake = LeadIntakeService::new(
        Arc::new(FixtureCrmClient::default()),
        RoutingService::new(store.clone(), router(0.0)),
        CrmFieldMap::default(),
    );

    let outcome = intake
        .intake(&CrmContext::new(), &intake_request("33139"))
        .await
        .unwrap();
    let IntakeOutcome::Unassigned { lead } = outcome else {
        panic!("expected unassigned");
    };
    assert_eq!(lead.status, LeadStatus::Unassigned);
    assert!(lead.opportunity_id.is_some());
    assert!(lead.vendor_id.is_none());
}

#[tokio::test]
async fn failed_opportunity_creation_leaves_no_lead_row() {
    let (_dir, store) = store().await;
    store.insert_vendor(new_vendor("shine")).await.unwrap();
    let crm = FixtureCrmClient::default().with_failing_writes();
    crm.upsert_contact(CrmContact {
        id: "ghl-l-carla".into(),
        email: Some("carla.diaz@example.com".into()),
        ..CrmContact::default()
    })
    .await;
    let intake = LeadIntakeService::new(
        Arc::new(crm),
        RoutingService::new(store.clone(), router(0.0)),
        CrmFieldMap::default(),
    );

    let err = intake
        .intake(&CrmContext::new(), &intake_request("33139"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("crm create failed for opportunity for ghl-l-carla"));
    assert!(store.list_leads().await.unwrap().is_empty());
}

#[tokio::test]
async fn reassignment_skips_the_current_vendor() {
    let (_dir, store) = store().await;
    let first = store.insert_vendor(new_vendor("first")).await.unwrap();
    let second = insert_idle(&store, "second", 1, 0.0).await;
    let crm = Arc::new(FixtureCrmClient::default());
    let intake = LeadIntakeService::new(
        crm.clone(),
        RoutingService::new(store.clone(), router(0.0)),
        CrmFieldMap::default(),
    );
    let ctx = CrmContext::new();

    let lead = intake
        .intake(&ctx, &intake_request("33139"))
        .await
        .unwrap()
        .lead()
        .clone();
    assert_eq!(lead.vendor_id, Some(first.id));

    let reassigned = intake.reassign(&ctx, lead.id).await.unwrap();
    let IntakeOutcome::Assigned { lead, .. } = reassigned else {
        panic!("expected reassignment");
    };
    assert_eq!(lead.vendor_id, Some(second.id));

    // With `first` deactivated and `second` excluded nobody qualifies.
    store
        .set_vendor_status(first.id, VendorStatus::Deactivated)
        .await
        .unwrap();
    let outcome = intake.reassign(&ctx, lead.id).await.unwrap();
    let IntakeOutcome::Unassigned { lead: returned } = outcome else {
        panic!("expected unassigned");
    };
    assert_eq!(returned.vendor_id, None);
    assert_eq!(returned.status, LeadStatus::Unassigned);

    let stored = store.get_lead(lead.id).await.unwrap().unwrap();
    assert_eq!(stored.vendor_id, None);
    assert_eq!(stored.status, LeadStatus::Unassigned);

    let updates = crm.opportunity_updates().await;
    let (opportunity, last) = updates.last().expect("opportunity updates");
    assert_eq!(Some(opportunity), stored.opportunity_id.as_ref());
    assert_eq!(last.assigned_to, Assignee::Cleared);
}

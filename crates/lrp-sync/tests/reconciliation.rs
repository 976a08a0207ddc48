use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use lrp_adapters::FixtureCrmClient;
use lrp_core::{CoverageType, LeadDetails, LeadStatus, NewLead, NewVendor, Vendor, VendorStatus};
use lrp_routing::ZipDatabase;
use lrp_storage::{LeadRouterStore, SqliteStore};
use lrp_sync::{ReconcileOptions, ReconciliationEngine};
use tempfile::TempDir;

fn fixture_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/crm/contacts.json")
}

async fn store() -> (TempDir, Arc<SqliteStore>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SqliteStore::open_path(dir.path().join("sync.db"))
        .await
        .expect("open store");
    store.migrate().await.expect("migrate");
    (dir, Arc::new(store))
}

fn options(page_limit: usize, scan_cap: usize) -> ReconcileOptions {
    ReconcileOptions {
        fetch_workers: 3,
        min_interval: Duration::ZERO,
        page_limit,
        scan_cap,
    }
}

fn engine(
    store: &Arc<SqliteStore>,
    crm: &Arc<FixtureCrmClient>,
    options: ReconcileOptions,
) -> ReconciliationEngine {
    ReconciliationEngine::new(
        store.clone(),
        crm.clone(),
        Arc::new(ZipDatabase::embedded().expect("zip db")),
    )
    .with_options(options)
}

fn vendor(contact_id: Option<&str>, email: Option<&str>, status: VendorStatus) -> NewVendor {
    NewVendor {
        ghl_contact_id: contact_id.map(str::to_string),
        ghl_user_id: None,
        name: String::new(),
        email: email.map(str::to_string),
        phone: None,
        company_name: String::new(),
        services_offered: BTreeSet::new(),
        primary_service_category: None,
        coverage_type: CoverageType::County,
        coverage_states: BTreeSet::new(),
        coverage_counties: BTreeSet::new(),
        coverage_zips: BTreeSet::new(),
        status,
        taking_new_work: true,
        lead_close_percentage: 0.0,
    }
}

fn lead(contact_id: &str, email: Option<&str>, zip: Option<&str>) -> NewLead {
    NewLead::from_contact(
        contact_id,
        LeadDetails {
            customer_name: "Customer".into(),
            customer_email: email.map(str::to_string),
            primary_service_category: "Boat Maintenance".into(),
            service_zip_code: zip.map(str::to_string),
            ..LeadDetails::default()
        },
        LeadStatus::Unassigned,
        "Boat Maintenance Form",
    )
}

async fn vendor_by_contact(store: &SqliteStore, contact_id: &str) -> Vendor {
    store
        .find_vendor_by_contact_id(contact_id)
        .await
        .expect("query")
        .unwrap_or_else(|| panic!("vendor {contact_id}"))
}

#[tokio::test]
async fn full_run_reconciles_then_second_run_is_a_noop() {
    let (_dir, store) = store().await;
    let atlantic = store
        .insert_vendor(vendor(Some("ghl-v-atlantic"), None, VendorStatus::Pending))
        .await
        .unwrap();
    store
        .insert_vendor(vendor(Some("ghl-v-fleet"), None, VendorStatus::Deactivated))
        .await
        .unwrap();
    let shine = store
        .insert_vendor(vendor(None, Some("rita@shinemarine.test"), VendorStatus::Pending))
        .await
        .unwrap();
    let gone = store
        .insert_vendor(vendor(Some("ghl-v-gone"), None, VendorStatus::Active))
        .await
        .unwrap();
    let staff = store
        .insert_vendor(vendor(Some("ghl-staff-ops"), None, VendorStatus::Active))
        .await
        .unwrap();

    let carla = store
        .insert_lead(lead("ghl-l-carla", None, Some("33139")))
        .await
        .unwrap();
    let harbor_lead = store
        .insert_lead(lead("ghl-l-merged", Some("june@harborhands.test"), None))
        .await
        .unwrap();
    let vanished = store
        .insert_lead(lead("ghl-l-vanished", None, None))
        .await
        .unwrap();
    let deleted = store
        .insert_lead(lead("ghl-l-deleted", None, None))
        .await
        .unwrap();

    let crm = Arc::new(
        FixtureCrmClient::load(fixture_path())
            .expect("fixture")
            .with_failing_ids(["ghl-l-vanished"]),
    );
    let engine = engine(&store, &crm, options(3, 15_000));

    let first = engine.run().await.expect("first run");
    assert!(first.success);
    assert_eq!(first.fetch_failed, vec!["ghl-l-vanished".to_string()]);
    assert!(!first.scan_incomplete);
    assert_eq!(first.pages_scanned, 3);
    // atlantic, fleet, shine, and harbor (tagged as a vendor); staff is skipped.
    assert_eq!(first.vendors.checked, 4);
    assert_eq!(first.vendors.created, 1);
    assert_eq!(first.vendors.updated, 3);
    assert_eq!(first.vendors.missing, 1);
    assert_eq!(first.leads.checked, 1);
    assert_eq!(first.leads.updated, 1);
    assert_eq!(first.leads.missing, 1);

    let atlantic = store.get_vendor(atlantic.id).await.unwrap().unwrap();
    assert_eq!(atlantic.status, VendorStatus::Active);
    assert_eq!(atlantic.coverage_type, CoverageType::State);
    assert_eq!(atlantic.company_name, "Atlantic Glass & Gelcoat");
    assert_eq!(atlantic.lead_close_percentage, 48.0);
    assert_eq!(
        vendor_by_contact(&store, "ghl-v-fleet").await.status,
        VendorStatus::Active
    );

    let shine = store.get_vendor(shine.id).await.unwrap().unwrap();
    assert_eq!(shine.ghl_contact_id.as_deref(), Some("ghl-v-shine"));
    assert_eq!(shine.ghl_user_id.as_deref(), Some("usr-shine"));
    assert!(shine.coverage_counties.contains("Miami-Dade, FL"));

    let harbor = vendor_by_contact(&store, "ghl-v-harbor").await;
    assert_eq!(harbor.status, VendorStatus::OnboardingInProcess);
    assert_eq!(harbor.coverage_type, CoverageType::County);

    assert_eq!(
        store.get_vendor(gone.id).await.unwrap().unwrap().status,
        VendorStatus::InactiveGhlDeleted
    );
    assert_eq!(
        store.get_vendor(staff.id).await.unwrap().unwrap().status,
        VendorStatus::Active
    );

    let carla = store.get_lead(carla.id).await.unwrap().unwrap();
    assert_eq!(carla.status, LeadStatus::NewLead);
    assert_eq!(carla.details.customer_email.as_deref(), Some("carla.diaz@example.com"));
    assert_eq!(carla.details.specific_service_requested.as_deref(), Some("Boat Detailing"));
    assert_eq!(carla.details.service_county.as_deref(), Some("Miami-Dade"));
    assert_eq!(carla.details.service_state.as_deref(), Some("FL"));

    assert_eq!(
        store.get_lead(vanished.id).await.unwrap().unwrap().status,
        LeadStatus::Unassigned
    );
    assert_eq!(
        store.get_lead(deleted.id).await.unwrap().unwrap().status,
        LeadStatus::InactiveGhlDeleted
    );
    assert_eq!(
        store.get_lead(harbor_lead.id).await.unwrap().unwrap().status,
        LeadStatus::Unassigned
    );

    let second = engine.run().await.expect("second run");
    assert!(second.is_noop(), "{second:#?}");
    assert_eq!(second.fetch_failed, vec!["ghl-l-vanished".to_string()]);
    assert_eq!(
        store.get_lead(vanished.id).await.unwrap().unwrap().status,
        LeadStatus::Unassigned
    );
}

#[tokio::test]
async fn empty_store_is_a_successful_noop() {
    let (_dir, store) = store().await;
    let crm = Arc::new(FixtureCrmClient::load(fixture_path()).unwrap());
    let report = engine(&store, &crm, options(500, 15_000))
        .run()
        .await
        .unwrap();
    assert!(report.success);
    assert!(report.is_noop());
    assert_eq!(report.local_identifiers, 0);
    assert_eq!(report.external_calls, 0);
    assert_eq!(report.pages_scanned, 0);
}

#[tokio::test]
async fn resolved_ids_skip_the_paginated_scan() {
    let (_dir, store) = store().await;
    store
        .insert_vendor(vendor(Some("ghl-v-shine"), None, VendorStatus::Active))
        .await
        .unwrap();
    let crm = Arc::new(FixtureCrmClient::load(fixture_path()).unwrap());
    let report = engine(&store, &crm, options(2, 15_000))
        .run()
        .await
        .unwrap();
    assert_eq!(report.external_calls, 1);
    assert_eq!(report.pages_scanned, 0);
    assert_eq!(report.vendors.updated, 1);
}

#[tokio::test]
async fn truncated_scan_only_trusts_not_found_answers() {
    let (_dir, store) = store().await;
    let gone = store
        .insert_vendor(vendor(Some("ghl-v-gone"), None, VendorStatus::Active))
        .await
        .unwrap();
    let unknown = store
        .insert_vendor(vendor(None, Some("nobody@example.com"), VendorStatus::Active))
        .await
        .unwrap();
    let crm = Arc::new(FixtureCrmClient::load(fixture_path()).unwrap());

    let report = engine(&store, &crm, options(2, 2)).run().await.unwrap();
    assert!(report.scan_incomplete);
    assert_eq!(report.pages_scanned, 1);
    assert_eq!(report.vendors.missing, 1);
    assert_eq!(
        store.get_vendor(gone.id).await.unwrap().unwrap().status,
        VendorStatus::InactiveGhlDeleted
    );
    assert_eq!(
        store.get_vendor(unknown.id).await.unwrap().unwrap().status,
        VendorStatus::Active
    );

    let full = engine(&store, &crm, options(2, 15_000)).run().await.unwrap();
    assert!(!full.scan_incomplete);
    assert_eq!(full.vendors.missing, 1);
    assert_eq!(
        store.get_vendor(unknown.id).await.unwrap().unwrap().status,
        VendorStatus::InactiveGhlDeleted
    );
}

#[tokio::test]
async fn deleted_contact_found_by_email_is_not_missing() {
    let (_dir, store) = store().await;
    let moved = store
        .insert_vendor(vendor(
            Some("ghl-v-old-id"),
            Some("dispatch@atlanticglass.test"),
            VendorStatus::Pending,
        ))
        .await
        .unwrap();
    let crm = Arc::new(FixtureCrmClient::load(fixture_path()).unwrap());

    let report = engine(&store, &crm, options(500, 15_000))
        .run()
        .await
        .unwrap();
    assert_eq!(report.vendors.missing, 0);
    assert_eq!(report.pages_scanned, 0);
    let moved = store.get_vendor(moved.id).await.unwrap().unwrap();
    assert_eq!(moved.status, VendorStatus::Active);
    // The local contact id is kept; only empty fields are filled from the CRM.
    assert_eq!(moved.ghl_contact_id.as_deref(), Some("ghl-v-old-id"));
}

#[tokio::test]
async fn vendor_whose_fetch_failed_is_not_marked_missing() {
    let (_dir, store) = store().await;
    let flaky = store
        .insert_vendor(vendor(Some("ghl-v-flaky"), None, VendorStatus::Active))
        .await
        .unwrap();
    let crm = Arc::new(
        FixtureCrmClient::load(fixture_path())
            .unwrap()
            .with_failing_ids(["ghl-v-flaky"]),
    );

    let report = engine(&store, &crm, options(500, 15_000))
        .run()
        .await
        .unwrap();
    assert!(!report.scan_incomplete);
    assert_eq!(report.fetch_failed, vec!["ghl-v-flaky".to_string()]);
    assert_eq!(report.vendors.missing, 0);
    assert_eq!(
        store.get_vendor(flaky.id).await.unwrap().unwrap().status,
        VendorStatus::Active
    );
}

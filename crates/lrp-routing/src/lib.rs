//! Lead routing engine for Lead Router Pro.
//!
//! Leaf-first: [`location`] resolves ZIP codes, [`taxonomy`] canonicalizes and matches services,
//! [`coverage`] decides geographic eligibility, [`selector`] picks from a pool, [`router`]
//! combines them and claims the vendor atomically, and [`intake`] wires routing to the CRM with
//! the opportunity created before the lead row.

pub mod coverage;
pub mod intake;
pub mod location;
pub mod router;
pub mod selector;
pub mod taxonomy;

pub use coverage::{coverage_reason, covers, ZipLookup};
pub use intake::{IntakeError, IntakeOutcome, IntakeRequest, LeadIntakeService};
pub use location::{normalize_zip, state_code, state_name, LocationUnresolved, ZipDatabase};
pub use router::{
    EligibleVendor, LeadRouter, RouteDecision, RoutingError, RoutingMode, RoutingRequest,
    RoutingService, RoutingStats, MAX_CLAIM_ATTEMPTS,
};
pub use selector::{
    choose_method, select, FixedDraw, NoEligibleVendor, RandomSource, SelectionMethod,
    SystemRandom,
};
pub use taxonomy::{
    RelatedTermGroups, ServiceMatch, ServiceMatcher, ServiceRequest, ServiceTaxonomy,
    TaxonomyError,
};

pub const CRATE_NAME: &str = "lrp-routing";

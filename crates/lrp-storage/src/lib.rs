//! Persistence and outbound HTTP plumbing for Lead Router Pro.
//!
//! - [`SqliteStore`] implements the [`LeadRouterStore`] seam over SQLite (sqlx, runtime queries).
//! - [`HttpFetcher`] is the rate-limited, retrying JSON client every CRM call goes through.
//! - [`RateLimitedPool`] bounds fan-out when many contacts are fetched by id.

mod http;
mod sqlite;
mod store;
mod throttle;

pub use http::{
    classify_status, CrmStatusClass, FetchError, HttpClientConfig, HttpFetcher, JsonResponse,
    Replay, RetryBudget,
};
pub use sqlite::{SqliteStore, PERFORMANCE_PERCENTAGE_KEY};
pub use store::{LeadRouterStore, StoreError};
pub use throttle::{MinIntervalGate, RateLimitedPool};

pub use reqwest::{Method, Url};

pub const CRATE_NAME: &str = "lrp-storage";

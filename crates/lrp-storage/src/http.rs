//! Rate-limited JSON client used for every CRM call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

use crate::throttle::MinIntervalGate;

/// How the CRM answered, as far as the caller needs to know.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrmStatusClass {
    Success,
    NotFound,
    /// Bad or revoked token; repeating the call cannot help.
    AuthRejected,
    /// Rate limited before the request was processed.
    Throttled,
    /// The CRM may or may not have applied the request.
    Unavailable,
    Rejected,
}

pub fn classify_status(status: StatusCode) -> CrmStatusClass {
    match status {
        s if s.is_success() => CrmStatusClass::Success,
        StatusCode::NOT_FOUND => CrmStatusClass::NotFound,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => CrmStatusClass::AuthRejected,
        StatusCode::TOO_MANY_REQUESTS => CrmStatusClass::Throttled,
        s if s.is_server_error() || s == StatusCode::REQUEST_TIMEOUT => {
            CrmStatusClass::Unavailable
        }
        _ => CrmStatusClass::Rejected,
    }
}

/// Whether a request may be sent again after an ambiguous failure.
///
/// Creates are `Once`: a timeout or 5xx after the CRM committed the write would otherwise
/// produce a duplicate contact or opportunity. Reads, searches and full-field updates are
/// `Safe`. A throttled answer or a failed connect is retried either way, since the CRM
/// never processed the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Replay {
    Safe,
    Once,
}

impl Replay {
    pub fn for_method(method: &Method) -> Self {
        if method == Method::POST || method == Method::PATCH {
            Replay::Once
        } else {
            Replay::Safe
        }
    }

    fn allows(self, class: CrmStatusClass) -> bool {
        match class {
            CrmStatusClass::Throttled => true,
            CrmStatusClass::Unavailable => self == Replay::Safe,
            _ => false,
        }
    }

    fn allows_transport(self, err: &reqwest::Error) -> bool {
        err.is_connect() || (self == Replay::Safe && err.is_timeout())
    }
}

/// Retry allowance for one call. Delays grow linearly by `step`; a `Retry-After` header wins
/// when the CRM sends one. Both are capped at `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct RetryBudget {
    pub max_retries: usize,
    pub step: Duration,
    pub max_delay: Duration,
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self {
            max_retries: 3,
            step: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryBudget {
    pub fn delay(&self, attempt: usize, retry_after: Option<Duration>) -> Duration {
        let fallback = self.step.saturating_mul(attempt as u32 + 1);
        retry_after.unwrap_or(fallback).min(self.max_delay)
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
    /// Minimum spacing between two outbound requests.
    pub min_interval: Duration,
    pub retry: RetryBudget,
    pub default_headers: Vec<(String, String)>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: Some(format!("lead-router-pro/{}", env!("CARGO_PKG_VERSION"))),
            concurrency: 3,
            min_interval: Duration::from_millis(120),
            retry: RetryBudget::default(),
            default_headers: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("crm rejected credentials ({status}) for {url}")]
    Auth { status: u16, url: String },
    #[error("http status {status} for {url}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("invalid json from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } | FetchError::Auth { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }

    fn class(&self) -> Option<CrmStatusClass> {
        self.status()
            .and_then(|code| StatusCode::from_u16(code).ok())
            .map(classify_status)
    }

    /// The CRM definitively answered that the record does not exist.
    pub fn is_not_found(&self) -> bool {
        self.class() == Some(CrmStatusClass::NotFound)
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, FetchError::Auth { .. })
    }
}

#[derive(Debug, Clone)]
pub struct JsonResponse {
    pub status: StatusCode,
    pub url: String,
    pub body: Value,
}

/// Authenticated JSON client with bounded concurrency, request spacing and per-call retries.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    gate: Arc<MinIntervalGate>,
    retry: RetryBudget,
    requests_sent: AtomicU64,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.default_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("invalid header name {name}"))?;
            let value = HeaderValue::from_str(value)
                .with_context(|| format!("invalid value for header {name}"))?;
            headers.insert(name, value);
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            gate: Arc::new(MinIntervalGate::new(config.min_interval)),
            retry: config.retry,
            requests_sent: AtomicU64::new(0),
        })
    }

    /// Number of HTTP attempts made so far, retries included.
    pub fn requests_sent(&self) -> u64 {
        self.requests_sent.load(Ordering::Relaxed)
    }

    pub async fn send_json(
        &self,
        run_id: Uuid,
        method: Method,
        replay: Replay,
        url: &str,
        bearer: Option<&str>,
        body: Option<&Value>,
    ) -> Result<JsonResponse, FetchError> {
        let span = info_span!("crm_request", %run_id, method = %method, url, ?replay);
        self.send_json_inner(method, replay, url, bearer, body)
            .instrument(span)
            .await
    }

    async fn send_json_inner(
        &self,
        method: Method,
        replay: Replay,
        url: &str,
        bearer: Option<&str>,
        body: Option<&Value>,
    ) -> Result<JsonResponse, FetchError> {
        // The semaphore is never closed.
        let _permit = self.limit.acquire().await.ok();
        let mut attempt = 0;

        loop {
            self.gate.wait().await;
            self.requests_sent.fetch_add(1, Ordering::Relaxed);

            let mut request = self.client.request(method.clone(), url);
            if let Some(token) = bearer {
                request = request.bearer_auth(token);
            }
            if let Some(body) = body {
                request = request.json(body);
            }
            let retries_left = attempt < self.retry.max_retries;

            let resp = match request.send().await {
                Ok(resp) => resp,
                Err(err) if retries_left && replay.allows_transport(&err) => {
                    warn!(error = %err, attempt, "retrying crm request");
                    tokio::time::sleep(self.retry.delay(attempt, None)).await;
                    attempt += 1;
                    continue;
                }
                Err(err) => return Err(FetchError::Request(err)),
            };

            let status = resp.status();
            let final_url = resp.url().to_string();
            match classify_status(status) {
                CrmStatusClass::Success => {
                    let bytes = resp.bytes().await?;
                    let body = if bytes.is_empty() {
                        Value::Null
                    } else {
                        serde_json::from_slice(&bytes).map_err(|source| FetchError::Decode {
                            url: final_url.clone(),
                            source,
                        })?
                    };
                    debug!(status = status.as_u16(), attempt, "crm request succeeded");
                    return Ok(JsonResponse {
                        status,
                        url: final_url,
                        body,
                    });
                }
                CrmStatusClass::AuthRejected => {
                    return Err(FetchError::Auth {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                class if retries_left && replay.allows(class) => {
                    let delay = self.retry.delay(attempt, retry_after(resp.headers()));
                    warn!(status = status.as_u16(), attempt, ?delay, "retrying crm request");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                _ => {
                    let body = resp.text().await.unwrap_or_default();
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                        body,
                    });
                }
            }
        }
    }
}

//! Authenticated HTTP client for the billing API

use std::time::Duration;

use async_trait::async_trait;
use chargeback_common::{BillingError, ChargebackError, Result, TimeRange, UsageRecord};
use reqwest::{header, StatusCode};
use tracing::{debug, info, instrument, warn};

use super::retry::{retry_with_backoff, RetryPolicy};
use super::wire::{CostPage, PageCursor};
use super::BillingSource;
use crate::config::BillingSettings;

/// Costs endpoint, relative to the configured base URL
pub const COSTS_PATH: &str = "/billing/v1/costs";

/// Upper bound on pages per fetch, guards against cursor loops
const MAX_PAGES: usize = 10_000;

/// Billing API key pair, read-only after startup
#[derive(Clone)]
struct Credentials {
    api_key: String,
    api_secret: String,
}

/// Billing API client
pub struct BillingClient {
    http: reqwest::Client,
    base_url: String,
    credentials: Credentials,
    page_size: u32,
    retry: RetryPolicy,
    default_currency: String,
}

impl BillingClient {
    /// Create a client; fails with a configuration error when credentials are absent
    pub fn new(settings: &BillingSettings, default_currency: &str) -> Result<Self> {
        if settings.api_key.trim().is_empty() || settings.api_secret.trim().is_empty() {
            return Err(ChargebackError::Config(
                "billing API key and secret must be non-empty".into(),
            ));
        }

        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout())
            .user_agent(concat!("chargeback-exporter/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ChargebackError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: settings.url.trim_end_matches('/').to_string(),
            credentials: Credentials {
                api_key: settings.api_key.clone(),
                api_secret: settings.api_secret.clone(),
            },
            page_size: settings.page_size.max(1),
            retry: RetryPolicy::from_settings(settings),
            default_currency: default_currency.to_string(),
        })
    }

    /// Override the retry policy
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Fetch one page; the cursor is untouched so a retry re-reads the same page
    async fn fetch_page(&self, cursor: &PageCursor, window: &TimeRange) -> std::result::Result<CostPage, BillingError> {
        let request = match cursor {
            PageCursor::Url(url) => self.http.get(url),
            PageCursor::First | PageCursor::Token(_) => {
                let mut query = vec![
                    ("start_date", window.start_datetime().to_rfc3339()),
                    ("end_date", window.end_datetime().to_rfc3339()),
                    ("page_size", self.page_size.to_string()),
                ];
                if let PageCursor::Token(token) = cursor {
                    query.push(("page_token", token.clone()));
                }
                self.http
                    .get(format!("{}{}", self.base_url, COSTS_PATH))
                    .query(&query)
            }
        };

        let response = request
            .basic_auth(&self.credentials.api_key, Some(&self.credentials.api_secret))
            .header(header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| BillingError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<CostPage>()
                .await
                .map_err(|e| BillingError::Protocol(format!("invalid cost page: {}", e)));
        }

        let retry_after = retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, retry_after, body))
    }
}

#[async_trait]
impl BillingSource for BillingClient {
    #[instrument(skip(self), fields(window = %window))]
    async fn fetch(&self, window: &TimeRange) -> std::result::Result<Vec<UsageRecord>, BillingError> {
        let mut records = Vec::new();
        let mut skipped = 0usize;
        let mut cursor = PageCursor::First;
        let mut pages = 0usize;

        loop {
            let page = retry_with_backoff(&self.retry, "billing_page", || {
                self.fetch_page(&cursor, window)
            })
            .await?;
            pages += 1;

            for line in page.data {
                match line.into_record(&self.default_currency) {
                    Ok(record) => records.push(record),
                    Err(e) => {
                        skipped += 1;
                        warn!(error = %e, "Skipping malformed cost line");
                    }
                }
            }

            match page.metadata.next_cursor() {
                Some(next) if next == cursor => {
                    return Err(BillingError::Protocol("billing API repeated the same page cursor".into()));
                }
                Some(next) => {
                    if pages >= MAX_PAGES {
                        return Err(BillingError::Protocol(format!(
                            "billing API exceeded {} pages",
                            MAX_PAGES
                        )));
                    }
                    debug!(pages, records = records.len(), "Following next page");
                    cursor = next;
                }
                None => break,
            }
        }

        info!(pages, records = records.len(), skipped, "Fetched billing records");
        Ok(records)
    }
}

fn retry_after(headers: &header::HeaderMap) -> Option<Duration> {
    headers
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Map a non-success status onto the billing error taxonomy
fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: String) -> BillingError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => BillingError::Auth {
            status: status.as_u16(),
            message: body,
        },
        StatusCode::TOO_MANY_REQUESTS => BillingError::RateLimited { retry_after },
        StatusCode::REQUEST_TIMEOUT => BillingError::Transient(format!("HTTP {}", status.as_u16())),
        s if s.is_server_error() => BillingError::Transient(format!("HTTP {}: {}", s.as_u16(), body)),
        s => BillingError::Protocol(format!("unexpected HTTP {}: {}", s.as_u16(), body)),
    }
}

//! Billing API wire format
//!
//! Page shape:
//!
//! ```text
//! { "data": [ { "start_date", "end_date", "resource": { "id" }, "product",
//!               "line_type", "quantity", "price", ... } ],
//!   "metadata": { "next": <url|null>, "next_page_token": <token|null> } }
//! ```

use chargeback_common::{BillingError, TimeRange, UsageRecord};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;

/// One page of cost lines
#[derive(Debug, Deserialize)]
pub struct CostPage {
    #[serde(default)]
    pub data: Vec<CostLine>,
    #[serde(default)]
    pub metadata: PageMetadata,
}

#[derive(Debug, Default, Deserialize)]
pub struct PageMetadata {
    /// Absolute URL of the next page
    pub next: Option<String>,
    /// Opaque cursor for the next page
    pub next_page_token: Option<String>,
}

/// Where to read the next page from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageCursor {
    First,
    Url(String),
    Token(String),
}

impl PageMetadata {
    /// Cursor for the following page, `None` at end of results
    pub fn next_cursor(&self) -> Option<PageCursor> {
        if let Some(url) = self.next.as_deref().filter(|u| !u.is_empty()) {
            return Some(PageCursor::Url(url.to_string()));
        }
        self.next_page_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .map(|t| PageCursor::Token(t.to_string()))
    }
}

#[derive(Debug, Deserialize)]
pub struct CostLine {
    pub id: Option<String>,
    pub start_date: String,
    pub end_date: String,
    pub resource: Option<LineResource>,
    pub product: Option<String>,
    pub line_type: Option<String>,
    pub quantity: Decimal,
    pub price: Decimal,
    pub currency: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LineResource {
    pub id: String,
}

impl CostLine {
    /// SKU combines product and line type when both are reported
    pub fn sku(&self) -> Option<String> {
        match (self.product.as_deref(), self.line_type.as_deref()) {
            (Some(p), Some(l)) if !p.is_empty() && !l.is_empty() => Some(format!("{p}:{l}")),
            (Some(p), _) if !p.is_empty() => Some(p.to_string()),
            (_, Some(l)) if !l.is_empty() => Some(l.to_string()),
            _ => None,
        }
    }

    pub fn into_record(self, default_currency: &str) -> Result<UsageRecord, BillingError> {
        let sku = self
            .sku()
            .ok_or_else(|| BillingError::Protocol("cost line without product or line_type".into()))?;
        let resource_id = self
            .resource
            .as_ref()
            .map(|r| r.id.clone())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| BillingError::Protocol("cost line without resource id".into()))?;

        let start = parse_timestamp(&self.start_date)?;
        let end = parse_timestamp(&self.end_date)?;
        let window = TimeRange::new(start, end)
            .map_err(|e| BillingError::Protocol(format!("invalid billing window: {}", e)))?;

        let currency = self
            .currency
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| default_currency.to_string());

        let mut record =
            UsageRecord::new(resource_id, sku, self.quantity, self.price, window).with_currency(currency);
        if let Some(id) = self.id.filter(|id| !id.is_empty()) {
            record = record.with_provider_id(id);
        }
        Ok(record)
    }
}

/// Accept RFC 3339 timestamps or bare `YYYY-MM-DD` dates (UTC midnight)
pub fn parse_timestamp(value: &str) -> Result<i64, BillingError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc).timestamp_millis());
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp_millis())
        .ok_or_else(|| BillingError::Protocol(format!("unparseable timestamp: {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chargeback_common::HOUR_MS;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_page() {
        let body = r#"{
            "data": [{
                "id": "line-1",
                "start_date": "2024-03-01T00:00:00Z",
                "end_date": "2024-03-01T01:00:00Z",
                "resource": { "id": "lkc-abc", "display_name": "orders" },
                "product": "KAFKA",
                "line_type": "KAFKA_NUM_CKUS",
                "quantity": 2,
                "price": "0.75",
                "unit": "CKU-hour"
            }],
            "metadata": { "next": null, "next_page_token": "abc" }
        }"#;

        let page: CostPage = serde_json::from_str(body).unwrap();
        assert_eq!(page.metadata.next_cursor(), Some(PageCursor::Token("abc".into())));

        let record = page.data.into_iter().next().unwrap().into_record("USD").unwrap();
        assert_eq!(record.resource_id, "lkc-abc");
        assert_eq!(record.sku, "KAFKA:KAFKA_NUM_CKUS");
        assert_eq!(record.cost(), dec!(1.50));
        assert_eq!(record.window.duration_ms(), HOUR_MS);
        assert_eq!(record.identity(), "id:line-1");
    }

    #[test]
    fn test_next_url_wins_over_token() {
        let meta = PageMetadata {
            next: Some("https://billing/next".into()),
            next_page_token: Some("t".into()),
        };
        assert_eq!(meta.next_cursor(), Some(PageCursor::Url("https://billing/next".into())));
        assert_eq!(PageMetadata::default().next_cursor(), None);
    }

    #[test]
    fn test_parse_date_only() {
        assert_eq!(parse_timestamp("1970-01-02").unwrap(), 24 * HOUR_MS);
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn test_missing_resource_is_protocol_error() {
        let line = CostLine {
            id: None,
            start_date: "1970-01-01".into(),
            end_date: "1970-01-02".into(),
            resource: None,
            product: Some("KAFKA".into()),
            line_type: None,
            quantity: dec!(1),
            price: dec!(1),
            currency: None,
        };
        assert!(matches!(line.into_record("USD"), Err(BillingError::Protocol(_))));
    }
}

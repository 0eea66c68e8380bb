//! Billing usage records as reported by the provider

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::time_range::TimeRange;
use crate::error::{ChargebackError, Result};

/// One externally reported billing line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Line identifier supplied by the provider, if any
    pub provider_id: Option<String>,
    /// Billed resource (cluster, connector, ...)
    pub resource_id: String,
    /// Billed SKU
    pub sku: String,
    pub quantity: Decimal,
    pub unit_cost: Decimal,
    /// ISO 4217 currency code
    pub currency: String,
    /// Billing window `[start, end)`
    pub window: TimeRange,
}

impl UsageRecord {
    pub fn new(
        resource_id: impl Into<String>,
        sku: impl Into<String>,
        quantity: Decimal,
        unit_cost: Decimal,
        window: TimeRange,
    ) -> Self {
        Self {
            provider_id: None,
            resource_id: resource_id.into(),
            sku: sku.into(),
            quantity,
            unit_cost,
            currency: crate::DEFAULT_CURRENCY.to_string(),
            window,
        }
    }

    pub fn with_currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = currency.into();
        self
    }

    pub fn with_provider_id(mut self, id: impl Into<String>) -> Self {
        self.provider_id = Some(id.into());
        self
    }

    /// Total cost of the line
    pub fn cost(&self) -> Decimal {
        self.quantity * self.unit_cost
    }

    /// Stable identity used for deduplication across overlapping fetches
    ///
    /// The provider id wins when present; otherwise a blake3 digest of the
    /// canonical fields.
    pub fn identity(&self) -> String {
        match &self.provider_id {
            Some(id) => format!("id:{id}"),
            None => format!("fp:{}", self.fingerprint()),
        }
    }

    fn fingerprint(&self) -> String {
        let canonical = format!(
            "{}\u{1f}{}\u{1f}{}\u{1f}{}\u{1f}{}\u{1f}{}\u{1f}{}",
            self.resource_id,
            self.sku,
            self.quantity.normalize(),
            self.unit_cost.normalize(),
            self.currency,
            self.window.start,
            self.window.end
        );
        blake3::hash(canonical.as_bytes()).to_hex().to_string()
    }

    /// Validate the record
    pub fn validate(&self) -> Result<()> {
        if self.resource_id.is_empty() {
            return Err(ChargebackError::Validation("resource_id is required".into()));
        }
        if self.sku.is_empty() {
            return Err(ChargebackError::Validation("sku is required".into()));
        }
        if self.currency.is_empty() {
            return Err(ChargebackError::Validation("currency is required".into()));
        }
        if self.quantity < Decimal::ZERO {
            return Err(ChargebackError::Validation("quantity cannot be negative".into()));
        }
        if self.unit_cost < Decimal::ZERO {
            return Err(ChargebackError::Validation("unit_cost cannot be negative".into()));
        }
        if self.window.start >= self.window.end {
            return Err(ChargebackError::Validation("billing window is empty".into()));
        }
        Ok(())
    }
}

//! Token pricing.

use serde::{Deserialize, Serialize};

use crate::config::PricingConfig;
use crate::models::tier::Tier;

/// Token counts reported for a unit of work.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    /// Prompt tokens.
    pub input_tokens: u64,
    /// Completion tokens.
    pub output_tokens: u64,
}

/// Pure conversion from token usage to currency.
pub trait Pricing: Send + Sync {
    /// Cost of `usage` at `tier`.
    fn cost(&self, tier: Tier, usage: &TokenUsage) -> f64;
}

/// Per-tier, per-million-token flat rates.
#[derive(Debug, Clone, Default)]
pub struct FlatRatePricing {
    rates: PricingConfig,
}

impl FlatRatePricing {
    /// Create pricing from the configured rate table.
    #[must_use]
    pub fn new(rates: PricingConfig) -> Self {
        Self { rates }
    }
}

impl Pricing for FlatRatePricing {
    #[allow(clippy::cast_precision_loss)] // token counts stay far below 2^52
    fn cost(&self, tier: Tier, usage: &TokenUsage) -> f64 {
        let rate = self.rates.rate(tier);
        (usage.input_tokens as f64 * rate.input_per_mtok
            + usage.output_tokens as f64 * rate.output_per_mtok)
            / 1_000_000.0
    }
}

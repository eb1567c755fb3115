//! Per-model pricing used for cost accounting.
//!
//! Costs are stored in microcents (1/10,000 of a cent, so $1 is 1,000,000
//! microcents) per 1M tokens to avoid floating point in the hot path. A table
//! entry carries the timestamp it was last verified against the provider's
//! published prices; quotes from entries older than the staleness threshold
//! are flagged, and unknown models fall back to a hardcoded default.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Microcents (1/10,000 cent) per 1M tokens for one model.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ModelPrice {
    /// Cost per 1M input tokens in microcents.
    pub input_per_1m_tokens: i64,

    /// Cost per 1M output tokens in microcents.
    pub output_per_1m_tokens: i64,

    /// Cost per 1M cached input tokens, when the provider discounts them.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_input_per_1m_tokens: Option<i64>,
}

impl ModelPrice {
    /// Build a price from dollars per 1M tokens, the unit providers publish.
    pub fn from_dollars_per_1m(input: f64, output: f64) -> Self {
        Self {
            input_per_1m_tokens: dollars_to_microcents(input),
            output_per_1m_tokens: dollars_to_microcents(output),
            cached_input_per_1m_tokens: None,
        }
    }

    /// Compute the cost in microcents for a token count pair.
    ///
    /// Uses `i128` intermediates so large token counts cannot overflow;
    /// results saturate at `i64::MAX`.
    pub fn cost_microcents(&self, tokens_in: i64, tokens_out: i64) -> i64 {
        let total = (tokens_in as i128 * self.input_per_1m_tokens as i128) / 1_000_000
            + (tokens_out as i128 * self.output_per_1m_tokens as i128) / 1_000_000;
        saturate_to_i64(total)
    }
}

/// A quote from the table, with its staleness marker.
#[derive(Debug, Clone, Copy)]
pub struct PriceQuote {
    pub price: ModelPrice,
    /// True when the entry is older than the staleness threshold or the
    /// lookup fell back to the hardcoded default.
    pub is_stale: bool,
}

/// Deserializable pricing table section of the proxy config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PricingTableConfig {
    /// Prices keyed by provider then model.
    pub models: HashMap<String, HashMap<String, ModelPrice>>,

    /// Timestamp the table contents were last verified.
    pub last_verified: Option<DateTime<Utc>>,

    /// Entries older than this are served with `is_stale = true`.
    pub stale_after_days: i64,
}

impl Default for PricingTableConfig {
    fn default() -> Self {
        Self {
            models: HashMap::new(),
            last_verified: None,
            stale_after_days: 30,
        }
    }
}

/// Runtime pricing table: configured entries layered over hardcoded
/// defaults, consulted by the accounting layer on every terminal request.
#[derive(Debug, Clone)]
pub struct PricingTable {
    models: HashMap<String, HashMap<String, ModelPrice>>,
    last_verified: Option<DateTime<Utc>>,
    stale_after: chrono::Duration,
    fallback: ModelPrice,
}

impl PricingTable {
    pub fn from_config(config: &PricingTableConfig) -> Self {
        let mut models = builtin_prices();
        for (provider, table) in &config.models {
            let entry = models.entry(provider.clone()).or_default();
            for (model, price) in table {
                entry.insert(model.clone(), *price);
            }
        }

        Self {
            models,
            last_verified: config.last_verified,
            stale_after: chrono::Duration::days(config.stale_after_days.max(0)),
            // Mid-range default so unknown models still produce an estimate:
            // $1/1M in, $4/1M out.
            fallback: ModelPrice::from_dollars_per_1m(1.0, 4.0),
        }
    }

    /// Quote the price for a provider/model pair.
    ///
    /// Unknown pairs fall back to the hardcoded default with
    /// `is_stale = true`; known pairs inherit the table's verification age.
    pub fn price(&self, provider: &str, model: &str) -> PriceQuote {
        match self.models.get(provider).and_then(|m| m.get(model)) {
            Some(price) => PriceQuote {
                price: *price,
                is_stale: self.table_is_stale(),
            },
            None => PriceQuote {
                price: self.fallback,
                is_stale: true,
            },
        }
    }

    fn table_is_stale(&self) -> bool {
        match self.last_verified {
            Some(verified) => Utc::now() - verified > self.stale_after,
            // An unverified table is not trusted as fresh.
            None => false,
        }
    }
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::from_config(&PricingTableConfig::default())
    }
}

/// Hardcoded defaults for common models, used when the config table has no
/// entry. Dollars per 1M tokens.
fn builtin_prices() -> HashMap<String, HashMap<String, ModelPrice>> {
    let mut openai = HashMap::new();
    openai.insert(
        "gpt-4o".to_string(),
        ModelPrice::from_dollars_per_1m(2.50, 10.00),
    );
    openai.insert(
        "gpt-4o-mini".to_string(),
        ModelPrice::from_dollars_per_1m(0.15, 0.60),
    );
    openai.insert(
        "gpt-3.5-turbo-instruct".to_string(),
        ModelPrice::from_dollars_per_1m(1.50, 2.00),
    );
    openai.insert(
        "text-embedding-3-small".to_string(),
        ModelPrice::from_dollars_per_1m(0.02, 0.0),
    );

    let mut anthropic = HashMap::new();
    anthropic.insert(
        "claude-3-5-sonnet-latest".to_string(),
        ModelPrice::from_dollars_per_1m(3.00, 15.00),
    );
    anthropic.insert(
        "claude-3-5-haiku-latest".to_string(),
        ModelPrice::from_dollars_per_1m(0.80, 4.00),
    );

    let mut groq = HashMap::new();
    groq.insert(
        "llama-3.3-70b-versatile".to_string(),
        ModelPrice::from_dollars_per_1m(0.59, 0.79),
    );

    let mut map = HashMap::new();
    map.insert("openai".to_string(), openai);
    map.insert("anthropic".to_string(), anthropic);
    map.insert("groq".to_string(), groq);
    map
}

/// Convert dollars to microcents.
///
/// Examples: $1.00 = 1,000,000 microcents; $0.01 = 10,000 microcents.
pub fn dollars_to_microcents(dollars: f64) -> i64 {
    (dollars * 1_000_000.0).round() as i64
}

/// Convert microcents to dollars for the API edge.
pub fn microcents_to_dollars(microcents: i64) -> f64 {
    microcents as f64 / 1_000_000.0
}

fn saturate_to_i64(value: i128) -> i64 {
    if value > i64::MAX as i128 {
        i64::MAX
    } else if value < i64::MIN as i128 {
        i64::MIN
    } else {
        value as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dollars_per_1m_conversion() {
        let price = ModelPrice::from_dollars_per_1m(2.50, 10.0);
        assert_eq!(price.input_per_1m_tokens, 2_500_000);
        assert_eq!(price.output_per_1m_tokens, 10_000_000);
    }

    #[test]
    fn cost_for_token_counts() {
        // $3/1M in, $15/1M out
        let price = ModelPrice::from_dollars_per_1m(3.0, 15.0);
        // 1000 in + 500 out: 3000 + 7500 microcents = $0.0105
        let cost = price.cost_microcents(1000, 500);
        assert_eq!(cost, 3_000 + 7_500);
        assert!((microcents_to_dollars(cost) - 0.0105).abs() < 1e-9);
    }

    #[test]
    fn large_token_counts_saturate_instead_of_overflowing() {
        let price = ModelPrice {
            input_per_1m_tokens: i64::MAX,
            output_per_1m_tokens: i64::MAX,
            cached_input_per_1m_tokens: None,
        };
        assert_eq!(
            price.cost_microcents(i64::MAX, i64::MAX),
            i64::MAX
        );
    }

    #[test]
    fn config_entries_override_builtins() {
        let mut models = HashMap::new();
        let mut openai = HashMap::new();
        openai.insert("gpt-4o-mini".to_string(), ModelPrice::from_dollars_per_1m(9.0, 9.0));
        models.insert("openai".to_string(), openai);

        let table = PricingTable::from_config(&PricingTableConfig {
            models,
            last_verified: Some(Utc::now()),
            stale_after_days: 30,
        });

        let quote = table.price("openai", "gpt-4o-mini");
        assert_eq!(quote.price.input_per_1m_tokens, 9_000_000);
        assert!(!quote.is_stale);
    }

    #[test]
    fn unknown_model_falls_back_stale() {
        let table = PricingTable::default();
        let quote = table.price("openai", "some-future-model");
        assert!(quote.is_stale);
        assert_eq!(quote.price.input_per_1m_tokens, 1_000_000);
    }

    #[test]
    fn old_verification_marks_quotes_stale() {
        let mut models = HashMap::new();
        let mut openai = HashMap::new();
        openai.insert("gpt-4o".to_string(), ModelPrice::from_dollars_per_1m(2.5, 10.0));
        models.insert("openai".to_string(), openai);

        let table = PricingTable::from_config(&PricingTableConfig {
            models,
            last_verified: Some(Utc::now() - chrono::Duration::days(45)),
            stale_after_days: 30,
        });

        assert!(table.price("openai", "gpt-4o").is_stale);
    }

    #[test]
    fn builtin_table_knows_the_common_models() {
        let table = PricingTable::default();
        assert_eq!(
            table.price("openai", "gpt-4o-mini").price.input_per_1m_tokens,
            150_000
        );
        assert_eq!(
            table
                .price("anthropic", "claude-3-5-sonnet-latest")
                .price
                .output_per_1m_tokens,
            15_000_000
        );
    }
}

//! Usage and cost accounting.
//!
//! Token counts come from the provider response when available and are
//! estimated from canonical byte length otherwise. Cost is zero on any
//! cache hit or coalesced follower; `potential_cost` is always what the
//! request would have cost uncached, which is what the savings analytics
//! downstream are built on.

use serde::{Deserialize, Serialize};

use crate::pricing::{PriceQuote, microcents_to_dollars};

/// How the cache disposed of a request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CacheDisposition {
    /// Went upstream as the flight leader.
    Miss,
    /// Exact fingerprint match.
    ExactHit,
    /// Semantic match with the measured cosine similarity.
    SemanticHit(f64),
    /// Attached to another request's flight.
    Coalesced,
}

impl CacheDisposition {
    /// Value for the `X-WatchLLM-Cache` response header.
    pub fn header_value(&self) -> &'static str {
        match self {
            CacheDisposition::Miss => "miss",
            CacheDisposition::ExactHit | CacheDisposition::SemanticHit(_) => "hit",
            CacheDisposition::Coalesced => "coalesced",
        }
    }

    /// Value for the `X-WatchLLM-Similarity` response header, when any.
    pub fn similarity_header(&self) -> Option<String> {
        match self {
            CacheDisposition::Miss => None,
            CacheDisposition::ExactHit => Some("exact".to_string()),
            CacheDisposition::SemanticHit(similarity) => Some(format!("{:.4}", similarity)),
            CacheDisposition::Coalesced => Some("exact".to_string()),
        }
    }

    /// Similarity recorded in telemetry: 1.0 on exact (and coalesced,
    /// which shares the leader's exact content), measured cosine on
    /// semantic, absent on miss.
    pub fn similarity(&self) -> Option<f64> {
        match self {
            CacheDisposition::Miss => None,
            CacheDisposition::ExactHit | CacheDisposition::Coalesced => Some(1.0),
            CacheDisposition::SemanticHit(similarity) => Some(*similarity),
        }
    }

    pub fn is_hit(&self) -> bool {
        !matches!(self, CacheDisposition::Miss)
    }
}

/// Token counts for one request.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenCounts {
    pub tokens_in: i64,
    pub tokens_out: i64,
}

impl TokenCounts {
    pub fn new(tokens_in: i64, tokens_out: i64) -> Self {
        Self {
            tokens_in,
            tokens_out,
        }
    }
}

/// Rough byte-length token estimate (~4 bytes per token), used when the
/// provider response carries no usage block.
pub fn estimate_tokens(byte_len: usize) -> i64 {
    ((byte_len as i64) + 3) / 4
}

/// Pull `(prompt_tokens, completion_tokens)` out of a unary response body,
/// accepting both OpenAI and Anthropic field names.
pub fn extract_body_usage(body: &[u8]) -> Option<TokenCounts> {
    let json: serde_json::Value = serde_json::from_slice(body).ok()?;
    let usage = json.get("usage").filter(|u| !u.is_null())?;

    let tokens_in = usage
        .get("prompt_tokens")
        .or_else(|| usage.get("input_tokens"))
        .and_then(|v| v.as_i64())?;
    let tokens_out = usage
        .get("completion_tokens")
        .or_else(|| usage.get("output_tokens"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);

    Some(TokenCounts::new(tokens_in, tokens_out))
}

/// True when a unary chat response contains a tool call. Tool-calling
/// responses are stateful and excluded from caching.
pub fn body_has_tool_call(body: &[u8]) -> bool {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|json| {
            json.pointer("/choices/0/message/tool_calls")
                .map(|calls| calls.as_array().is_some_and(|a| !a.is_empty()))
        })
        .unwrap_or(false)
}

/// The money outcome of one terminal request.
#[derive(Debug, Clone, Copy)]
pub struct Costing {
    /// What was actually spent upstream, in microcents.
    pub cost_microcents: i64,
    /// What the request would have cost uncached.
    pub potential_cost_microcents: i64,
    /// The pricing quote was stale or a fallback.
    pub price_is_stale: bool,
}

impl Costing {
    /// Cost a terminal request. Any cache disposition other than a miss
    /// costs nothing; the potential cost is always computed.
    pub fn compute(quote: PriceQuote, tokens: TokenCounts, disposition: CacheDisposition) -> Self {
        let potential = quote
            .price
            .cost_microcents(tokens.tokens_in, tokens.tokens_out);
        let cost = if disposition.is_hit() { 0 } else { potential };

        Self {
            cost_microcents: cost,
            potential_cost_microcents: potential,
            price_is_stale: quote.is_stale,
        }
    }

    pub fn cost_usd(&self) -> f64 {
        microcents_to_dollars(self.cost_microcents)
    }

    pub fn potential_cost_usd(&self) -> f64 {
        microcents_to_dollars(self.potential_cost_microcents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::ModelPrice;

    fn quote() -> PriceQuote {
        PriceQuote {
            // $1/1M in, $4/1M out
            price: ModelPrice::from_dollars_per_1m(1.0, 4.0),
            is_stale: false,
        }
    }

    #[test]
    fn token_estimation_rounds_up() {
        assert_eq!(estimate_tokens(0), 0);
        assert_eq!(estimate_tokens(1), 1);
        assert_eq!(estimate_tokens(4), 1);
        assert_eq!(estimate_tokens(5), 2);
        assert_eq!(estimate_tokens(400), 100);
    }

    #[test]
    fn usage_extraction_handles_both_dialects() {
        let openai = br#"{"usage":{"prompt_tokens":10,"completion_tokens":5}}"#;
        let counts = extract_body_usage(openai).unwrap();
        assert_eq!((counts.tokens_in, counts.tokens_out), (10, 5));

        let anthropic = br#"{"usage":{"input_tokens":8,"output_tokens":3}}"#;
        let counts = extract_body_usage(anthropic).unwrap();
        assert_eq!((counts.tokens_in, counts.tokens_out), (8, 3));

        assert!(extract_body_usage(br#"{"choices":[]}"#).is_none());
    }

    #[test]
    fn misses_pay_full_price() {
        let costing = Costing::compute(
            quote(),
            TokenCounts::new(1_000_000, 1_000_000),
            CacheDisposition::Miss,
        );
        // $1 + $4 = $5
        assert_eq!(costing.cost_microcents, 5_000_000);
        assert_eq!(costing.potential_cost_microcents, 5_000_000);
        assert!((costing.cost_usd() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn hits_cost_zero_but_keep_potential() {
        for disposition in [
            CacheDisposition::ExactHit,
            CacheDisposition::SemanticHit(0.94),
            CacheDisposition::Coalesced,
        ] {
            let costing = Costing::compute(
                quote(),
                TokenCounts::new(1_000_000, 1_000_000),
                disposition,
            );
            assert_eq!(costing.cost_microcents, 0);
            assert_eq!(costing.potential_cost_microcents, 5_000_000);
        }
    }

    #[test]
    fn disposition_headers_and_similarity() {
        assert_eq!(CacheDisposition::Miss.header_value(), "miss");
        assert_eq!(CacheDisposition::ExactHit.header_value(), "hit");
        assert_eq!(CacheDisposition::SemanticHit(0.94).header_value(), "hit");
        assert_eq!(CacheDisposition::Coalesced.header_value(), "coalesced");

        assert_eq!(
            CacheDisposition::ExactHit.similarity_header().as_deref(),
            Some("exact")
        );
        assert_eq!(
            CacheDisposition::SemanticHit(0.9412).similarity_header().as_deref(),
            Some("0.9412")
        );
        assert_eq!(CacheDisposition::Miss.similarity_header(), None);

        assert_eq!(CacheDisposition::Coalesced.similarity(), Some(1.0));
        assert_eq!(CacheDisposition::SemanticHit(0.94).similarity(), Some(0.94));
    }
}

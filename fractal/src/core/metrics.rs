//! Token accounting and cost derivation.

use std::ops::AddAssign;

use serde::{Deserialize, Serialize};

/// Token counts reported by an agent run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub cache_creation_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.cache_read_tokens + self.cache_creation_tokens
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
        self.cache_read_tokens += rhs.cache_read_tokens;
        self.cache_creation_tokens += rhs.cache_creation_tokens;
    }
}

/// Accumulated resource usage for an attempt, a task, or a subtree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    #[serde(default)]
    pub tokens: TokenUsage,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub duration_ms: u64,
}

impl AddAssign for Metrics {
    fn add_assign(&mut self, rhs: Self) {
        self.tokens += rhs.tokens;
        self.cost_usd += rhs.cost_usd;
        self.duration_ms += rhs.duration_ms;
    }
}

/// USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pricing {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
    pub cache_read_per_mtok: f64,
    pub cache_creation_per_mtok: f64,
}

impl Default for Pricing {
    fn default() -> Self {
        Self {
            input_per_mtok: 3.00,
            output_per_mtok: 15.00,
            cache_read_per_mtok: 0.30,
            cache_creation_per_mtok: 3.75,
        }
    }
}

impl Pricing {
    pub fn cost(&self, usage: &TokenUsage) -> f64 {
        let per = |tokens: u64, rate: f64| tokens as f64 / 1_000_000.0 * rate;
        per(usage.input_tokens, self.input_per_mtok)
            + per(usage.output_tokens, self.output_per_mtok)
            + per(usage.cache_read_tokens, self.cache_read_per_mtok)
            + per(usage.cache_creation_tokens, self.cache_creation_per_mtok)
    }

    pub fn metrics(&self, usage: TokenUsage, duration_ms: u64) -> Metrics {
        Metrics {
            tokens: usage,
            cost_usd: self.cost(&usage),
            duration_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pricing_cost() {
        let usage = TokenUsage {
            input_tokens: 1_000_000,
            output_tokens: 100_000,
            cache_read_tokens: 2_000_000,
            cache_creation_tokens: 0,
        };
        let cost = Pricing::default().cost(&usage);
        // 3.00 + 1.50 + 0.60
        assert!((cost - 5.10).abs() < 1e-9, "cost {cost}");
    }

    #[test]
    fn metrics_accumulate() {
        let mut total = Metrics::default();
        let pricing = Pricing::default();
        total += pricing.metrics(
            TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
                ..TokenUsage::default()
            },
            100,
        );
        total += pricing.metrics(
            TokenUsage {
                input_tokens: 1,
                cache_creation_tokens: 4,
                ..TokenUsage::default()
            },
            50,
        );
        assert_eq!(total.tokens.input_tokens, 11);
        assert_eq!(total.tokens.total(), 20);
        assert_eq!(total.duration_ms, 150);
        assert!(total.cost_usd > 0.0);
    }
}

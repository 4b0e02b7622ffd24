//! Usage accounting and pricing.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

/// One provider call worth of usage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub provider: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub user_id: String,
    pub pipeline_id: String,
    pub execution_id: Uuid,
}

/// Records usage and returns its cost in USD
#[async_trait]
pub trait CostTracker: Send + Sync {
    async fn record_usage(&self, usage: UsageRecord) -> Result<f64>;
}

/// USD per 1k tokens
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

impl ModelPrice {
    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 / 1000.0) * self.input_per_1k
            + (output_tokens as f64 / 1000.0) * self.output_per_1k
    }
}

/// Per-model prices, matched by longest model-id prefix
#[derive(Debug, Clone, PartialEq)]
pub struct PricingTable {
    prices: HashMap<String, ModelPrice>,
    default_price: ModelPrice,
}

impl Default for PricingTable {
    fn default() -> Self {
        let prices = [
            ("gpt-4o-mini", 0.000_15, 0.000_6),
            ("gpt-4o", 0.002_5, 0.01),
            ("gpt-4", 0.03, 0.06),
            ("gpt-3.5", 0.000_5, 0.001_5),
            ("o1", 0.015, 0.06),
            ("claude-3-haiku", 0.000_25, 0.001_25),
            ("claude-3-5-haiku", 0.000_8, 0.004),
            ("claude-3-5-sonnet", 0.003, 0.015),
            ("claude-3-opus", 0.015, 0.075),
        ]
        .into_iter()
        .map(|(model, input, output)| {
            (
                model.to_string(),
                ModelPrice {
                    input_per_1k: input,
                    output_per_1k: output,
                },
            )
        })
        .collect();

        Self {
            prices,
            default_price: ModelPrice {
                input_per_1k: 0.001,
                output_per_1k: 0.002,
            },
        }
    }
}

impl PricingTable {
    /// Add or replace a model price
    pub fn set_price(&mut self, model: impl Into<String>, price: ModelPrice) {
        self.prices.insert(model.into(), price);
    }

    /// Price for a model; unknown models use the default rate
    pub fn price(&self, model: &str) -> ModelPrice {
        self.prices
            .iter()
            .filter(|(prefix, _)| model.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, price)| *price)
            .unwrap_or(self.default_price)
    }

    pub fn cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        self.price(model).cost(input_tokens, output_tokens)
    }
}

/// Cost tracker keeping every record in memory, keyed by execution id
#[derive(Default)]
pub struct InMemoryCostTracker {
    pricing: PricingTable,
    records: RwLock<HashMap<Uuid, Vec<(UsageRecord, f64)>>>,
}

impl InMemoryCostTracker {
    pub fn new(pricing: PricingTable) -> Self {
        Self {
            pricing,
            records: RwLock::new(HashMap::new()),
        }
    }

    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }

    /// Total cost recorded for an execution
    pub async fn execution_cost(&self, execution_id: Uuid) -> f64 {
        self.records
            .read()
            .await
            .get(&execution_id)
            .map(|records| records.iter().map(|(_, cost)| cost).sum())
            .unwrap_or(0.0)
    }

    /// Records for an execution, in insertion order
    pub async fn usage_for(&self, execution_id: Uuid) -> Vec<UsageRecord> {
        self.records
            .read()
            .await
            .get(&execution_id)
            .map(|records| records.iter().map(|(usage, _)| usage.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CostTracker for InMemoryCostTracker {
    async fn record_usage(&self, usage: UsageRecord) -> Result<f64> {
        let cost = self
            .pricing
            .cost(&usage.model, usage.input_tokens, usage.output_tokens);

        self.records
            .write()
            .await
            .entry(usage.execution_id)
            .or_default()
            .push((usage, cost));

        Ok(cost)
    }
}

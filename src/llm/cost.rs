//! Per-token pricing used to attach a dollar cost to each completion.
//!
//! Rates come from the provider's `/models` listing, where OpenRouter
//! reports prompt and completion prices per token as decimal strings.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::litellm::{LiteLlmClient, ModelListing, Usage};

/// Prefix some callers put in front of OpenRouter model ids.
const OPENROUTER_PREFIX: &str = "openrouter/";

/// Dollar rates per token for one model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Dollars per prompt token.
    pub prompt: f64,
    /// Dollars per completion token.
    pub completion: f64,
}

impl ModelPricing {
    pub fn new(prompt: f64, completion: f64) -> Self {
        Self { prompt, completion }
    }

    /// Cost in dollars of the given usage.
    pub fn cost(&self, usage: &Usage) -> f64 {
        usage.prompt_tokens as f64 * self.prompt + usage.completion_tokens as f64 * self.completion
    }
}

/// Pricing keyed by model id.
///
/// Lookups accept ids with or without the `openrouter/` prefix.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PricingTable {
    rates: BTreeMap<String, ModelPricing>,
}

impl PricingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rate(mut self, model: impl Into<String>, pricing: ModelPricing) -> Self {
        self.insert(model, pricing);
        self
    }

    pub fn insert(&mut self, model: impl Into<String>, pricing: ModelPricing) {
        self.rates.insert(model.into(), pricing);
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rates.len()
    }

    /// Rates for `model`, trying the id as given and with the prefix toggled.
    pub fn get(&self, model: &str) -> Option<&ModelPricing> {
        self.rates.get(model).or_else(|| match model.strip_prefix(OPENROUTER_PREFIX) {
            Some(bare) => self.rates.get(bare),
            None => self.rates.get(&format!("{OPENROUTER_PREFIX}{model}")),
        })
    }

    /// Cost of `usage` under `model`'s rates, if known.
    pub fn cost_for(&self, model: &str, usage: &Usage) -> Option<f64> {
        self.get(model).map(|p| p.cost(usage))
    }

    /// Rates for each of `models` that has pricing, keyed by the id as given.
    pub fn for_models(&self, models: &[String]) -> BTreeMap<String, ModelPricing> {
        models
            .iter()
            .filter_map(|m| self.get(m).map(|p| (m.clone(), *p)))
            .collect()
    }

    /// Build a table from a provider listing, keeping only `models`.
    pub fn from_listing(listing: &[ModelListing], models: &[String]) -> Self {
        let mut table = Self::new();
        for entry in listing {
            let prefixed = format!("{OPENROUTER_PREFIX}{}", entry.id);
            if !models.iter().any(|m| *m == entry.id || *m == prefixed) {
                continue;
            }
            let Some(pricing) = entry.pricing.as_ref() else {
                continue;
            };
            match (rate(pricing, "prompt"), rate(pricing, "completion")) {
                (Some(prompt), Some(completion)) => {
                    table.insert(entry.id.clone(), ModelPricing::new(prompt, completion));
                }
                _ => debug!(model = %entry.id, "Skipping model with unparseable pricing"),
            }
        }
        table
    }

    /// Fetch pricing for `models` from the provider.
    ///
    /// Failures yield an empty table: cost is reported as unknown rather
    /// than failing the run.
    pub async fn fetch(client: &LiteLlmClient, models: &[String]) -> Self {
        match client.list_models().await {
            Ok(listing) => {
                let table = Self::from_listing(&listing, models);
                debug!(priced_models = table.len(), "Fetched model pricing");
                table
            }
            Err(e) => {
                warn!(error = %e, "Failed to fetch model pricing; costs will be omitted");
                Self::new()
            }
        }
    }
}

fn rate(pricing: &serde_json::Value, key: &str) -> Option<f64> {
    match pricing.get(key)? {
        serde_json::Value::String(s) => s.trim().parse().ok(),
        serde_json::Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

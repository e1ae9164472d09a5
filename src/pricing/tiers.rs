use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One band of a tiered price schedule. Bounds are in thousands of input tokens,
/// half-open `[min_tokens, max_tokens)`; `max_tokens == -1` means unbounded.
/// Prices are per million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceTier {
    pub min_tokens: i64,
    pub max_tokens: i64,
    pub input_price: f64,
    pub output_price: f64,
    #[serde(default)]
    pub cache_hit_price: f64,
    #[serde(default)]
    pub cache_store_price: f64,
}

impl PriceTier {
    pub fn is_unbounded(&self) -> bool {
        self.max_tokens == -1
    }

    pub fn contains(&self, input_tokens_k: i64) -> bool {
        input_tokens_k >= self.min_tokens
            && (self.is_unbounded() || input_tokens_k < self.max_tokens)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TieredPricing {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub tiers: Vec<PriceTier>,
}

impl TieredPricing {
    fn sort_tiers(&mut self) {
        self.tiers.sort_by_key(|tier| tier.min_tokens);
    }
}

/// key: pricing-tiers -> model pattern to tier schedule.
///
/// Patterns are exact model names or `prefix*` wildcards. An exact entry always
/// wins over wildcards, even when disabled; wildcards only match enabled entries
/// and the longest matching prefix is used.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(
    from = "BTreeMap<String, TieredPricing>",
    into = "BTreeMap<String, TieredPricing>"
)]
pub struct TieredPricingTable {
    entries: BTreeMap<String, TieredPricing>,
}

impl From<BTreeMap<String, TieredPricing>> for TieredPricingTable {
    fn from(mut entries: BTreeMap<String, TieredPricing>) -> Self {
        for pricing in entries.values_mut() {
            pricing.sort_tiers();
        }
        Self { entries }
    }
}

impl From<TieredPricingTable> for BTreeMap<String, TieredPricing> {
    fn from(table: TieredPricingTable) -> Self {
        table.entries
    }
}

impl TieredPricingTable {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn insert(&mut self, pattern: impl Into<String>, mut pricing: TieredPricing) {
        pricing.sort_tiers();
        self.entries.insert(pattern.into(), pricing);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, model: &str) -> Option<&TieredPricing> {
        if let Some(exact) = self.entries.get(model) {
            return Some(exact);
        }

        self.entries
            .iter()
            .filter(|(_, pricing)| pricing.enabled)
            .filter_map(|(pattern, pricing)| {
                let prefix = pattern.strip_suffix('*')?;
                model.starts_with(prefix).then_some((prefix.len(), pricing))
            })
            .max_by_key(|(prefix_len, _)| *prefix_len)
            .map(|(_, pricing)| pricing)
    }

    pub fn is_enabled(&self, model: &str) -> bool {
        self.lookup(model)
            .map(|pricing| pricing.enabled && !pricing.tiers.is_empty())
            .unwrap_or(false)
    }

    /// Selects the tier for `input_tokens_k` thousand input tokens. Outside every
    /// band, falls back to the last unbounded tier, then to the last tier.
    pub fn tier_for(&self, model: &str, input_tokens_k: i64) -> Option<&PriceTier> {
        let pricing = self.lookup(model)?;
        if !pricing.enabled || pricing.tiers.is_empty() {
            return None;
        }

        pricing
            .tiers
            .iter()
            .find(|tier| tier.contains(input_tokens_k))
            .or_else(|| pricing.tiers.iter().rev().find(|tier| tier.is_unbounded()))
            .or_else(|| pricing.tiers.last())
    }
}

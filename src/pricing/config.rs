use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::PricingError;

use super::features::FeatureScaleTable;
use super::long_context::LongContextPolicy;
use super::tiers::TieredPricingTable;

/// Quota units per one unit of currency.
pub const QUOTA_PER_UNIT: f64 = 500_000.0;

/// Immutable pricing snapshot. Every settlement reads from exactly one snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    pub quota_per_unit: f64,
    pub model_ratios: HashMap<String, f64>,
    pub model_prices: HashMap<String, f64>,
    pub completion_ratios: HashMap<String, f64>,
    pub cache_ratios: HashMap<String, f64>,
    pub group_ratios: HashMap<String, f64>,
    /// Overrides keyed by the user's own group, then the group being billed.
    pub group_group_ratios: HashMap<String, HashMap<String, f64>>,
    pub tiered_pricing: TieredPricingTable,
    pub long_context: LongContextPolicy,
    pub feature_scales: FeatureScaleTable,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            quota_per_unit: QUOTA_PER_UNIT,
            model_ratios: HashMap::new(),
            model_prices: HashMap::new(),
            completion_ratios: HashMap::new(),
            cache_ratios: HashMap::new(),
            group_ratios: HashMap::new(),
            group_group_ratios: HashMap::new(),
            tiered_pricing: TieredPricingTable::default(),
            long_context: LongContextPolicy::default(),
            feature_scales: FeatureScaleTable::default(),
        }
    }
}

impl PricingConfig {
    pub fn from_json(raw: &str) -> Result<Self, PricingError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn load(path: &Path) -> Result<Self, PricingError> {
        let raw = fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn model_ratio(&self, model: &str) -> Result<f64, PricingError> {
        self.model_ratios
            .get(model)
            .copied()
            .ok_or_else(|| PricingError::ModelRatioMissing(model.to_string()))
    }

    pub fn model_price(&self, model: &str) -> Result<f64, PricingError> {
        self.model_prices
            .get(model)
            .copied()
            .ok_or_else(|| PricingError::ModelPriceMissing(model.to_string()))
    }

    /// Ratio for billing `group`, honoring a pair override for the user's own group.
    pub fn group_ratio(&self, group: &str, user_group: &str) -> Result<f64, PricingError> {
        if let Some(ratio) = self
            .group_group_ratios
            .get(user_group)
            .and_then(|overrides| overrides.get(group))
        {
            return Ok(*ratio);
        }
        self.group_ratios
            .get(group)
            .copied()
            .ok_or_else(|| PricingError::GroupRatioMissing(group.to_string()))
    }
}

/// Shared, atomically swappable pricing configuration.
#[derive(Debug)]
pub struct PricingHandle {
    source: Option<PathBuf>,
    current: RwLock<Arc<PricingConfig>>,
}

impl PricingHandle {
    pub fn new(config: PricingConfig) -> Self {
        Self {
            source: None,
            current: RwLock::new(Arc::new(config)),
        }
    }

    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self, PricingError> {
        let path = path.into();
        let config = PricingConfig::load(&path)?;
        Ok(Self {
            source: Some(path),
            current: RwLock::new(Arc::new(config)),
        })
    }

    pub fn snapshot(&self) -> Arc<PricingConfig> {
        let guard = self
            .current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&guard)
    }

    pub fn replace(&self, config: PricingConfig) {
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(config);
    }

    /// Re-reads the backing file. Returns whether the active snapshot changed.
    /// On error the previous snapshot stays active.
    pub fn reload(&self) -> Result<bool, PricingError> {
        let Some(path) = self.source.as_deref() else {
            return Ok(false);
        };
        let next = PricingConfig::load(path)?;
        if *self.snapshot() == next {
            return Ok(false);
        }
        self.replace(next);
        info!(path = %path.display(), "pricing configuration reloaded");
        Ok(true)
    }
}

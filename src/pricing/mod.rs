//! key: pricing -> ratios, tiers, long-context surcharge and feature scales

pub mod calculator;
pub mod config;
pub mod features;
pub mod long_context;
pub mod tiers;

pub use calculator::{Metering, ModelPriceCalculator, PriceRequest, PricingPath, QuotaBreakdown, Usage};
pub use config::{PricingConfig, PricingHandle, QUOTA_PER_UNIT};
pub use features::{billing_model_name, FeatureRequest, FeatureScaleTable, Mode, TaskAction};
pub use long_context::LongContextPolicy;
pub use tiers::{PriceTier, TieredPricing, TieredPricingTable};

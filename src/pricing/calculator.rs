use serde::Serialize;

use crate::error::PricingError;

use super::config::PricingConfig;
use super::tiers::PriceTier;

/// Token counts for one request. `prompt_tokens` is the whole input and
/// `cached_tokens` the part of it served from cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub prompt_tokens: i64,
    pub cached_tokens: i64,
    pub completion_tokens: i64,
}

impl Usage {
    pub fn non_cached_prompt(&self) -> i64 {
        (self.prompt_tokens - self.cached_tokens).max(0)
    }
}

/// What is being charged for.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Metering {
    Tokens(Usage),
    /// Provider-reported units such as video seconds, priced by model ratio.
    Units(f64),
    /// Fixed model price times a per-request scale.
    PerCall { price_scale: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PricingPath {
    Ratio,
    Tiered,
    PerCall,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PriceRequest<'a> {
    pub model: &'a str,
    pub group: &'a str,
    /// The user's own group, for pair overrides. Defaults to `group`.
    pub user_group: Option<&'a str>,
    pub metering: Metering,
    pub feature_scale: Option<f64>,
}

impl<'a> PriceRequest<'a> {
    pub fn new(model: &'a str, group: &'a str, metering: Metering) -> Self {
        Self {
            model,
            group,
            user_group: None,
            metering,
            feature_scale: None,
        }
    }

    pub fn with_feature_scale(mut self, scale: f64) -> Self {
        self.feature_scale = Some(scale);
        self
    }

    pub fn with_user_group(mut self, user_group: &'a str) -> Self {
        self.user_group = Some(user_group);
        self
    }
}

/// Quota plus the factors that produced it. Ratio fields stay at 1.0 on the
/// tiered path, where group and model ratios do not apply.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaBreakdown {
    pub quota: i64,
    pub path: PricingPath,
    pub model_ratio: f64,
    pub group_ratio: f64,
    pub completion_ratio: f64,
    pub feature_scale: f64,
    pub input_multiplier: f64,
    pub output_multiplier: f64,
    pub tier: Option<PriceTier>,
}

impl QuotaBreakdown {
    fn new(path: PricingPath) -> Self {
        Self {
            quota: 0,
            path,
            model_ratio: 1.0,
            group_ratio: 1.0,
            completion_ratio: 1.0,
            feature_scale: 1.0,
            input_multiplier: 1.0,
            output_multiplier: 1.0,
            tier: None,
        }
    }
}

/// Turns usage into quota against one pricing snapshot. Pure; never mutates state.
pub struct ModelPriceCalculator<'a> {
    config: &'a PricingConfig,
}

impl<'a> ModelPriceCalculator<'a> {
    pub fn new(config: &'a PricingConfig) -> Self {
        Self { config }
    }

    pub fn quota(&self, request: &PriceRequest<'_>) -> Result<QuotaBreakdown, PricingError> {
        match request.metering {
            Metering::Tokens(usage) => self.token_quota(request, usage),
            Metering::Units(units) => self.unit_quota(request, units),
            Metering::PerCall { price_scale } => self.per_call_quota(request, price_scale),
        }
    }

    fn group_ratio(&self, request: &PriceRequest<'_>) -> Result<f64, PricingError> {
        self.config
            .group_ratio(request.group, request.user_group.unwrap_or(request.group))
    }

    fn token_quota(
        &self,
        request: &PriceRequest<'_>,
        usage: Usage,
    ) -> Result<QuotaBreakdown, PricingError> {
        let (input_multiplier, output_multiplier) = self
            .config
            .long_context
            .multipliers(request.model, usage.prompt_tokens);

        if let Some(tier) = self
            .config
            .tiered_pricing
            .tier_for(request.model, usage.prompt_tokens / 1000)
        {
            let input = usage.non_cached_prompt() as f64 * tier.input_price * input_multiplier;
            let cached = usage.cached_tokens as f64 * tier.cache_hit_price * input_multiplier;
            let output = usage.completion_tokens as f64 * tier.output_price * output_multiplier;
            // Prices are per million tokens.
            let quota = truncate_quota(
                request.model,
                (input + cached + output) * self.config.quota_per_unit / 1_000_000.0,
            )?;
            // A zero tiered charge falls through to ratio pricing.
            if quota > 0 {
                return Ok(QuotaBreakdown {
                    quota,
                    input_multiplier,
                    output_multiplier,
                    tier: Some(*tier),
                    ..QuotaBreakdown::new(PricingPath::Tiered)
                });
            }
        }

        let model_ratio = self.config.model_ratio(request.model)?;
        let group_ratio = self.group_ratio(request)?;
        let completion_ratio = match self.config.completion_ratios.get(request.model) {
            Some(ratio) => *ratio,
            None if usage.completion_tokens == 0 => 0.0,
            None => return Err(PricingError::CompletionRatioMissing(request.model.to_string())),
        };
        let cache_ratio = match self.config.cache_ratios.get(request.model) {
            Some(ratio) => *ratio,
            None if usage.cached_tokens == 0 => 0.0,
            None => return Err(PricingError::CacheRatioMissing(request.model.to_string())),
        };
        let feature_scale = request.feature_scale.unwrap_or(1.0);

        let prompt_units =
            usage.non_cached_prompt() as f64 + usage.cached_tokens as f64 * cache_ratio;
        let completion_units = usage.completion_tokens as f64 * completion_ratio;
        let ratio = model_ratio * feature_scale * group_ratio;

        let quota = if input_multiplier != 1.0 || output_multiplier != 1.0 {
            prompt_units * ratio * input_multiplier + completion_units * ratio * output_multiplier
        } else {
            (prompt_units + completion_units) * ratio
        };

        Ok(QuotaBreakdown {
            quota: truncate_quota(request.model, quota)?,
            model_ratio,
            group_ratio,
            completion_ratio,
            feature_scale,
            input_multiplier,
            output_multiplier,
            ..QuotaBreakdown::new(PricingPath::Ratio)
        })
    }

    fn unit_quota(
        &self,
        request: &PriceRequest<'_>,
        units: f64,
    ) -> Result<QuotaBreakdown, PricingError> {
        let model_ratio = self.config.model_ratio(request.model)?;
        let group_ratio = self.group_ratio(request)?;
        let feature_scale = request.feature_scale.unwrap_or(1.0);
        let quota = units * (feature_scale * model_ratio) * group_ratio;

        Ok(QuotaBreakdown {
            quota: truncate_quota(request.model, quota)?,
            model_ratio,
            group_ratio,
            feature_scale,
            ..QuotaBreakdown::new(PricingPath::Ratio)
        })
    }

    fn per_call_quota(
        &self,
        request: &PriceRequest<'_>,
        price_scale: f64,
    ) -> Result<QuotaBreakdown, PricingError> {
        let price = self.config.model_price(request.model)?;
        let group_ratio = self.group_ratio(request)?;
        let quota = price * self.config.quota_per_unit * group_ratio * price_scale;

        Ok(QuotaBreakdown {
            quota: truncate_quota(request.model, quota)?,
            group_ratio,
            feature_scale: price_scale,
            ..QuotaBreakdown::new(PricingPath::PerCall)
        })
    }
}

/// Truncates toward zero. Values that do not fit an `i64` are rejected rather
/// than saturated.
fn truncate_quota(model: &str, value: f64) -> Result<i64, PricingError> {
    if !value.is_finite() || value >= i64::MAX as f64 || value <= i64::MIN as f64 {
        return Err(PricingError::QuotaOutOfRange {
            model: model.to_string(),
            value,
        });
    }
    Ok(value as i64)
}

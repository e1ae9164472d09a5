use serde::{Deserialize, Serialize};

pub const LONG_CONTEXT_THRESHOLD: i64 = 200_000;
pub const LONG_CONTEXT_INPUT_MULTIPLIER: f64 = 2.0;
pub const LONG_CONTEXT_OUTPUT_MULTIPLIER: f64 = 1.5;

/// Surcharge for vendors that bill long prompts at a higher rate. Applies when the
/// model name contains one of `vendors` (case-insensitive) and total input tokens
/// strictly exceed `threshold_tokens`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LongContextPolicy {
    pub vendors: Vec<String>,
    pub threshold_tokens: i64,
    pub input_multiplier: f64,
    pub output_multiplier: f64,
}

impl Default for LongContextPolicy {
    fn default() -> Self {
        Self {
            vendors: vec!["claude".to_string()],
            threshold_tokens: LONG_CONTEXT_THRESHOLD,
            input_multiplier: LONG_CONTEXT_INPUT_MULTIPLIER,
            output_multiplier: LONG_CONTEXT_OUTPUT_MULTIPLIER,
        }
    }
}

impl LongContextPolicy {
    pub fn applies_to(&self, model: &str) -> bool {
        let model = model.to_ascii_lowercase();
        self.vendors
            .iter()
            .map(|vendor| vendor.trim().to_ascii_lowercase())
            .any(|vendor| !vendor.is_empty() && model.contains(&vendor))
    }

    /// Returns `(input, output)` multipliers; `(1.0, 1.0)` when the surcharge is off.
    pub fn multipliers(&self, model: &str, total_input_tokens: i64) -> (f64, f64) {
        if total_input_tokens > self.threshold_tokens && self.applies_to(model) {
            (self.input_multiplier, self.output_multiplier)
        } else {
            (1.0, 1.0)
        }
    }
}

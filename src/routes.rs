use std::sync::Arc;

use axum::{
    routing::{get, post},
    Extension, Json, Router,
};
use serde_json::{json, Value};

use crate::error::PricingError;
use crate::pricing::{PricingConfig, PricingHandle};

/// Operational endpoints. Expects an `Extension<Arc<PricingHandle>>` layer.
pub fn api_routes() -> Router {
    Router::new()
        .route("/api/pricing", get(current_pricing))
        .route("/api/pricing/reload", post(reload_pricing))
}

async fn current_pricing(Extension(pricing): Extension<Arc<PricingHandle>>) -> Json<PricingConfig> {
    Json(pricing.snapshot().as_ref().clone())
}

async fn reload_pricing(
    Extension(pricing): Extension<Arc<PricingHandle>>,
) -> Result<Json<Value>, PricingError> {
    let changed = pricing.reload()?;
    Ok(Json(json!({ "changed": changed })))
}

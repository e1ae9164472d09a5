use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Extension, Router};
use axum_prometheus::PrometheusMetricLayer;
use sqlx::postgres::PgPoolOptions;
use task_settlement::adaptor::DefaultAdaptors;
use task_settlement::pricing::{PricingConfig, PricingHandle};
use task_settlement::routes::api_routes;
use task_settlement::{config, scheduler};
use tracing_subscriber::{fmt, EnvFilter};

async fn root() -> &'static str {
    "Task Settlement Daemon"
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(config::DATABASE_URL.as_str())
        .await?;

    if let Err(error) = sqlx::migrate!().run(&pool).await {
        if *config::ALLOW_MIGRATION_FAILURE {
            tracing::warn!(
                ?error,
                "Database migrations failed but continuing due to ALLOW_MIGRATION_FAILURE"
            );
        } else {
            return Err(Box::new(error) as Box<dyn std::error::Error>);
        }
    }

    let pricing = Arc::new(match config::PRICING_CONFIG_PATH.as_deref() {
        Some(path) => PricingHandle::from_path(path)?,
        None => {
            tracing::warn!("PRICING_CONFIG_PATH not set; settling against an empty price table");
            PricingHandle::new(PricingConfig::default())
        }
    });
    let adaptors = Arc::new(DefaultAdaptors::new(
        Duration::from_secs(*config::TASK_HTTP_TIMEOUT_SECS),
        config::SERVER_ADDRESS.as_str(),
    )?);
    scheduler::spawn(pool.clone(), pricing.clone(), adaptors);

    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    let app = Router::new()
        .route("/", get(root))
        .route(
            "/metrics",
            get(move || async move { metrics_handle.render() }),
        )
        .merge(api_routes())
        .layer(prometheus_layer)
        .layer(Extension(pricing));

    let addr: SocketAddr = format!("{}:{}", config::BIND_ADDRESS.as_str(), *config::BIND_PORT)
        .parse()
        .map_err(|error| Box::new(error) as Box<dyn std::error::Error>)?;
    tracing::info!(%addr, "Listening for incoming connections");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}

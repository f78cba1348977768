mod api;
mod auth;
mod cache;
mod config;
mod correlator;
mod error;
mod geo;
mod health;
mod local_threats;
mod metrics;
mod model;
mod preprocessor;
mod reputation;
mod taxii;

use anyhow::Result;
use dotenvy::dotenv;
use std::sync::Arc;
use tokio::net::TcpListener;

use auth::AdminTokenValidator;
use cache::Cache;
use config::AppConfig;
use correlator::Correlator;
use geo::GeoEnricher;
use health::HealthManager;
use local_threats::LocalThreatReader;
use preprocessor::Preprocessor;
use reputation::ReputationClient;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenv().ok();

    // Configuration is validated up front; an invalid weight split or a
    // missing credential stops the process here.
    let app_config = AppConfig::from_env()?;

    if app_config.log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(app_config.log_level.as_str())
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(app_config.log_level.as_str())
            .init();
    }

    tracing::info!("configuration loaded and validated");

    let cache = Arc::new(Cache::new(&app_config.redis_url)?);
    let health_manager = Arc::new(HealthManager::new(
        cache.clone(),
        app_config.preprocess_interval,
    ));

    tracing::info!("performing startup health validation");
    if let Err(e) = health_manager.validate_startup().await {
        tracing::error!("startup health validation failed: {}", e);
        return Err(e.into());
    }

    let reader = LocalThreatReader::connect(&app_config.database_url).await?;
    let reputation = ReputationClient::new(
        cache.clone(),
        app_config.abuseipdb_api_key.clone(),
        app_config.reputation_daily_limit,
    )?;
    let geo = GeoEnricher::new(cache.clone(), app_config.geo_request_delay)?;
    let correlator = Correlator::new(
        app_config.local_confidence_weight,
        app_config.external_confidence_weight,
        app_config.local_confidence_boost,
        app_config.minimum_final_confidence,
    )?;

    let preprocessor = Arc::new(Preprocessor::new(
        reader,
        reputation,
        geo,
        correlator,
        cache.clone(),
        &app_config,
    ));
    preprocessor
        .clone()
        .spawn_scheduler(app_config.auto_start_processing);
    tracing::info!(
        "preprocessor scheduled every {}s (auto start: {})",
        app_config.preprocess_interval.as_secs(),
        app_config.auto_start_processing
    );

    let admin_auth = Arc::new(AdminTokenValidator::new(app_config.admin_token.clone()));
    let listen = format!("{}:{}", app_config.listen_addr, app_config.port);
    let state = api::AppState {
        cache,
        preprocessor,
        health: health_manager,
        auth: admin_auth,
        config: Arc::new(app_config),
    };
    let app = api::create_router(state);

    let listener = TcpListener::bind(&listen).await?;
    tracing::info!("threatwatch serving TAXII 2.1 feed on {}", listen);

    axum::serve(listener, app).await?;

    Ok(())
}

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::{bearer_token, AdminTokenValidator};
use crate::cache::Cache;
use crate::config::AppConfig;
use crate::health::{self, HealthManager};
use crate::metrics;
use crate::preprocessor::Preprocessor;
use crate::taxii;

#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<Cache>,
    pub preprocessor: Arc<Preprocessor>,
    pub health: Arc<HealthManager>,
    pub auth: Arc<AdminTokenValidator>,
    pub config: Arc<AppConfig>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/taxii2", get(taxii::discovery))
        .route("/taxii2/iocs/", get(taxii::api_root))
        .route("/taxii2/iocs/collections/", get(taxii::collections_index))
        .route("/taxii2/iocs/collections/:id/", get(taxii::collection_detail))
        .route(
            "/taxii2/iocs/collections/:id/objects/",
            get(taxii::objects::collection_objects),
        )
        .route(
            "/taxii2/iocs/collections/:id/manifest/",
            get(taxii::objects::collection_manifest),
        )
        .route("/health", get(health::health))
        .route("/stats", get(health::stats))
        .route("/metrics", get(metrics::metrics_handler))
        .route("/admin/preprocess", post(trigger_preprocess))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET]),
        )
        .with_state(state)
}

/// Internal trigger for an on-demand rebuild. Never exposed to untrusted
/// consumers: it requires the admin bearer token.
async fn trigger_preprocess(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let token = bearer_token(&headers).unwrap_or("");
    if !state.auth.validate(token) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"title": "unauthorized", "error_code": "unauthorized"})),
        )
            .into_response();
    }

    let started = state.preprocessor.trigger_background();
    let body = if started {
        json!({"started": true})
    } else {
        json!({"started": false, "reason": "a rebuild cycle is already running"})
    };
    (StatusCode::ACCEPTED, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use std::time::Duration;
    use tower::util::ServiceExt;

    use crate::correlator::Correlator;
    use crate::geo::GeoEnricher;
    use crate::local_threats::LocalThreatReader;
    use crate::reputation::ReputationClient;
    use crate::taxii::TAXII_CONTENT_TYPE;

    fn test_config() -> AppConfig {
        AppConfig {
            database_url: "postgres://reader@localhost/threats".to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            listen_addr: "0.0.0.0".to_string(),
            port: 8080,
            log_level: "info".to_string(),
            log_format: "plain".to_string(),
            abuseipdb_api_key: "test-key".to_string(),
            reputation_daily_limit: 1000,
            reputation_min_confidence: 50,
            local_confidence_weight: 0.8,
            external_confidence_weight: 0.2,
            local_confidence_boost: 10,
            minimum_final_confidence: 85,
            preprocess_interval: Duration::from_secs(300),
            preprocessing_ttl: Duration::from_secs(900),
            batch_size: 100,
            geo_request_delay: Duration::from_millis(1000),
            auto_start_processing: false,
            admin_token: None,
        }
    }

    /// Wires the real components without touching Redis or Postgres; the
    /// routes exercised below never reach either.
    fn test_state() -> AppState {
        let config = test_config();
        let cache = Arc::new(Cache::new(&config.redis_url).unwrap());
        let reader = LocalThreatReader::connect_lazy(&config.database_url).unwrap();
        let reputation = ReputationClient::new(
            cache.clone(),
            config.abuseipdb_api_key.clone(),
            config.reputation_daily_limit,
        )
        .unwrap();
        let geo = GeoEnricher::new(cache.clone(), config.geo_request_delay).unwrap();
        let correlator = Correlator::new(
            config.local_confidence_weight,
            config.external_confidence_weight,
            config.local_confidence_boost,
            config.minimum_final_confidence,
        )
        .unwrap();
        let preprocessor = Arc::new(Preprocessor::new(
            reader,
            reputation,
            geo,
            correlator,
            cache.clone(),
            &config,
        ));
        let health = Arc::new(HealthManager::new(
            cache.clone(),
            config.preprocess_interval,
        ));
        AppState {
            cache,
            preprocessor,
            health,
            auth: Arc::new(AdminTokenValidator::new(None)),
            config: Arc::new(config),
        }
    }

    #[tokio::test]
    async fn test_discovery_route_serves_taxii_media_type() {
        let app = create_router(test_state());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/taxii2")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            TAXII_CONTENT_TYPE
        );
    }

    #[tokio::test]
    async fn test_collections_index_route() {
        let app = create_router(test_state());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/taxii2/iocs/collections/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_collection_route_is_not_found() {
        let app = create_router(test_state());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/taxii2/iocs/collections/no-such-collection/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_admin_trigger_without_token_is_unauthorized() {
        let app = create_router(test_state());

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/admin/preprocess")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}

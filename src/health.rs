use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::timeout;

use crate::api::AppState;
use crate::cache::{
    Cache, GEO_CACHE_HITS, GEO_CACHE_MISSES, HIGH_CONFIDENCE_KEY, LAST_REBUILD_KEY,
    REP_CACHE_HITS, REP_CACHE_MISSES, SNAPSHOT_KEY,
};
use crate::error::IntelError;
use crate::model::Indicator;
use crate::preprocessor::RebuildSummary;
use crate::reputation::ReputationClient;

const CACHE_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServiceStatus {
    Ok,
    Degraded,
    Fail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: ServiceStatus,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub uptime_seconds: u64,
    pub cache_reachable: bool,
    pub last_rebuild_finished_at: Option<DateTime<Utc>>,
    pub last_rebuild_age_seconds: Option<i64>,
}

/// Liveness and freshness checks over the cache and the rebuild summary.
pub struct HealthManager {
    cache: Arc<Cache>,
    preprocess_interval: Duration,
    startup_instant: tokio::time::Instant,
}

impl HealthManager {
    pub fn new(cache: Arc<Cache>, preprocess_interval: Duration) -> Self {
        Self {
            cache,
            preprocess_interval,
            startup_instant: tokio::time::Instant::now(),
        }
    }

    /// Startup gate: the service refuses to come up without a reachable
    /// cache, since every endpoint depends on it.
    pub async fn validate_startup(&self) -> Result<(), IntelError> {
        tracing::info!("validating startup dependencies");
        match timeout(CACHE_CHECK_TIMEOUT, self.cache.ping()).await {
            Ok(Ok(())) => {
                tracing::info!("startup validation passed: cache reachable");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(IntelError::ServiceUnavailable(
                "cache health check timed out".to_string(),
            )),
        }
    }

    pub async fn check(&self) -> HealthReport {
        let now = Utc::now();
        let cache_reachable = matches!(
            timeout(CACHE_CHECK_TIMEOUT, self.cache.ping()).await,
            Ok(Ok(()))
        );

        let last_rebuild = if cache_reachable {
            self.cache
                .get_json::<RebuildSummary>(LAST_REBUILD_KEY)
                .await
                .unwrap_or_default()
        } else {
            None
        };
        let last_finished = last_rebuild.map(|s| s.finished_at);
        let age_seconds = last_finished.map(|at| (now - at).num_seconds());

        let status = if !cache_reachable {
            ServiceStatus::Fail
        } else {
            // OK while the last rebuild landed within three intervals.
            let freshness_limit = (self.preprocess_interval.as_secs() * 3) as i64;
            match age_seconds {
                Some(age) if age <= freshness_limit => ServiceStatus::Ok,
                _ => ServiceStatus::Degraded,
            }
        };

        HealthReport {
            status,
            timestamp: now,
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: self.startup_instant.elapsed().as_secs(),
            cache_reachable,
            last_rebuild_finished_at: last_finished,
            last_rebuild_age_seconds: age_seconds,
        }
    }
}

pub async fn health(State(state): State<AppState>) -> Response {
    let report = state.health.check().await;
    let status = match report.status {
        ServiceStatus::Fail => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (status, Json(report)).into_response()
}

pub async fn stats(State(state): State<AppState>) -> Result<Json<Value>, IntelError> {
    let cache = &state.cache;
    let snapshot_len = cache
        .get_json::<Vec<Indicator>>(SNAPSHOT_KEY)
        .await?
        .map(|s| s.len())
        .unwrap_or(0);
    let high_confidence_len = cache
        .get_json::<Vec<Indicator>>(HIGH_CONFIDENCE_KEY)
        .await?
        .map(|s| s.len())
        .unwrap_or(0);
    let last_rebuild = cache
        .get_json::<RebuildSummary>(LAST_REBUILD_KEY)
        .await
        .unwrap_or_default();

    let day = Utc::now().date_naive();
    let requests_used = cache
        .get_counter(&ReputationClient::budget_key_for(day))
        .await?;
    let limit = state.config.reputation_daily_limit;
    let budget_exhausted = requests_used >= limit
        || last_rebuild
            .as_ref()
            .map(|s| s.budget_exhausted)
            .unwrap_or(false);

    let rep_hits = cache.get_counter(REP_CACHE_HITS).await.unwrap_or(0);
    let rep_misses = cache.get_counter(REP_CACHE_MISSES).await.unwrap_or(0);
    let geo_hits = cache.get_counter(GEO_CACHE_HITS).await.unwrap_or(0);
    let geo_misses = cache.get_counter(GEO_CACHE_MISSES).await.unwrap_or(0);

    Ok(Json(json!({
        "indicators": {
            "total": snapshot_len,
            "high_confidence": high_confidence_len,
        },
        "budget": {
            "day": day.format("%Y-%m-%d").to_string(),
            "requests_used": requests_used,
            "limit": limit,
            "budget_exhausted": budget_exhausted,
        },
        "cache": {
            "reputation_hit_ratio": hit_ratio(rep_hits, rep_misses),
            "geo_hit_ratio": hit_ratio(geo_hits, geo_misses),
        },
        "last_rebuild": last_rebuild,
    })))
}

fn hit_ratio(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

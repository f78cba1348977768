use once_cell::sync::Lazy;
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder,
};
use axum::{
    body::Body,
    http::StatusCode,
    response::Response,
};

// Global metrics
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();

    registry.register(Box::new(REBUILD_TOTAL.clone())).unwrap();
    registry.register(Box::new(REBUILD_FAILURES.clone())).unwrap();
    registry.register(Box::new(REBUILD_DURATION.clone())).unwrap();
    registry.register(Box::new(INDICATORS.clone())).unwrap();
    registry.register(Box::new(HIGH_CONFIDENCE_INDICATORS.clone())).unwrap();
    registry.register(Box::new(REPUTATION_REQUESTS.clone())).unwrap();
    registry.register(Box::new(GEO_REQUESTS.clone())).unwrap();
    registry.register(Box::new(BUDGET_USED.clone())).unwrap();

    registry
});

pub static REBUILD_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("threatwatch_rebuild_total", "Total number of completed rebuild cycles")
        .expect("metric can be created")
});

pub static REBUILD_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("threatwatch_rebuild_failures_total", "Total number of aborted rebuild cycles")
        .expect("metric can be created")
});

pub static REBUILD_DURATION: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(
        HistogramOpts::new("threatwatch_rebuild_duration_seconds", "Rebuild cycle duration in seconds")
            .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0])
    ).expect("metric can be created")
});

pub static INDICATORS: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("threatwatch_indicators", "Indicators in the current snapshot")
        .expect("metric can be created")
});

pub static HIGH_CONFIDENCE_INDICATORS: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("threatwatch_high_confidence_indicators", "High-confidence indicators in the current snapshot")
        .expect("metric can be created")
});

pub static REPUTATION_REQUESTS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("threatwatch_reputation_requests_total", "Outbound reputation API requests")
        .expect("metric can be created")
});

pub static GEO_REQUESTS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("threatwatch_geo_requests_total", "Outbound geolocation requests")
        .expect("metric can be created")
});

pub static BUDGET_USED: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("threatwatch_reputation_budget_used", "Reputation requests used today")
        .expect("metric can be created")
});

pub async fn metrics_handler() -> Result<Response, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    match encoder.encode_to_string(&metric_families) {
        Ok(output) => {
            let response = Response::builder()
                .status(200)
                .header("content-type", "text/plain; version=0.0.4")
                .body(Body::from(output))
                .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
            Ok(response)
        }
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

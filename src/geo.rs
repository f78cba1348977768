use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::cache::{Cache, GEO_CACHE_HITS, GEO_CACHE_MISSES};
use crate::error::IntelError;
use crate::metrics;
use crate::model::GeoInfo;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const GEO_CACHE_TTL: Duration = Duration::from_secs(24 * 3600);

/// A cached geolocation lookup result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoRecord {
    pub ip: String,
    pub geo: GeoInfo,
    pub provider_name: String,
    pub fetched_at: DateTime<Utc>,
}

/// Capability implemented by each geolocation service.
#[async_trait]
pub trait GeoProvider: Send + Sync {
    fn name(&self) -> &'static str;
    /// `Ok(None)` when the provider answered but had no usable data for this
    /// address; `Err` when the request itself failed.
    async fn fetch(&self, http: &reqwest::Client, ip: &str) -> Result<Option<GeoInfo>, IntelError>;
}

/// Enforces the minimum spacing between outbound geo requests, process-wide.
/// Callers serialize on the mutex, so two requests can never start closer
/// together than `min_delay`.
pub struct RequestPacer {
    min_delay: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(min_delay: Duration) -> Self {
        Self {
            min_delay,
            last_request: Mutex::new(None),
        }
    }

    pub async fn pace(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_delay {
                tokio::time::sleep(self.min_delay - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// Per-IP geolocation through an ordered chain of free providers. The cache
/// short-circuits the chain entirely; a full chain failure is non-fatal and
/// yields an indicator without geo data.
pub struct GeoEnricher {
    providers: Vec<Box<dyn GeoProvider>>,
    http: reqwest::Client,
    cache: Arc<Cache>,
    pacer: RequestPacer,
}

impl GeoEnricher {
    pub fn new(cache: Arc<Cache>, request_delay: Duration) -> Result<Self, IntelError> {
        let providers: Vec<Box<dyn GeoProvider>> = vec![
            Box::new(IpApiProvider),
            Box::new(IpWhoIsProvider),
            Box::new(IpApiCoProvider),
        ];
        Self::with_providers(cache, request_delay, providers)
    }

    pub fn with_providers(
        cache: Arc<Cache>,
        request_delay: Duration,
        providers: Vec<Box<dyn GeoProvider>>,
    ) -> Result<Self, IntelError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| IntelError::Config(format!("failed to build http client: {e}")))?;
        Ok(Self {
            providers,
            http,
            cache,
            pacer: RequestPacer::new(request_delay),
        })
    }

    pub async fn enrich(&self, ip: &str) -> Result<Option<GeoRecord>, IntelError> {
        let key = format!("geo:{ip}");
        match self.cache.get_json::<GeoRecord>(&key).await {
            Ok(Some(record)) => {
                self.cache.bump_stat(GEO_CACHE_HITS).await;
                return Ok(Some(record));
            }
            Ok(None) => {
                self.cache.bump_stat(GEO_CACHE_MISSES).await;
            }
            Err(e) => {
                // A cache outage degrades to a live lookup instead of losing
                // the indicator's geo data outright.
                tracing::warn!("geo cache read failed for {}: {}", ip, e);
            }
        }

        for provider in &self.providers {
            self.pacer.pace().await;
            metrics::GEO_REQUESTS.inc();
            match provider.fetch(&self.http, ip).await {
                Ok(Some(geo)) if is_usable(&geo) => {
                    let record = GeoRecord {
                        ip: ip.to_string(),
                        geo,
                        provider_name: provider.name().to_string(),
                        fetched_at: Utc::now(),
                    };
                    if let Err(e) = self.cache.put_json(&key, &record, GEO_CACHE_TTL).await {
                        tracing::warn!("failed to cache geo record for {}: {}", ip, e);
                    }
                    return Ok(Some(record));
                }
                Ok(Some(_)) => {
                    tracing::debug!(
                        "geo provider {} returned an unusable record for {}",
                        provider.name(),
                        ip
                    );
                }
                Ok(None) => {
                    tracing::debug!("geo provider {} has no data for {}", provider.name(), ip);
                }
                Err(e) => {
                    tracing::warn!("geo provider {} failed for {}: {}", provider.name(), ip, e);
                }
            }
        }
        Ok(None)
    }
}

/// Usable means at least a country code plus coordinates within range.
pub(crate) fn is_usable(geo: &GeoInfo) -> bool {
    !geo.country_code.is_empty()
        && (-90.0..=90.0).contains(&geo.lat)
        && (-180.0..=180.0).contains(&geo.lon)
}

// Providers. Each one owns its response shape and parses defensively: a
// missing or malformed field yields `None` rather than an error.

pub struct IpApiProvider;

#[derive(Debug, Deserialize)]
struct IpApiResponse {
    status: Option<String>,
    country: Option<String>,
    #[serde(rename = "countryCode")]
    country_code: Option<String>,
    city: Option<String>,
    lat: Option<f64>,
    lon: Option<f64>,
    isp: Option<String>,
    #[serde(rename = "as")]
    as_field: Option<String>,
}

#[async_trait]
impl GeoProvider for IpApiProvider {
    fn name(&self) -> &'static str {
        "ip-api.com"
    }

    async fn fetch(&self, http: &reqwest::Client, ip: &str) -> Result<Option<GeoInfo>, IntelError> {
        let url = format!(
            "http://ip-api.com/json/{ip}?fields=status,country,countryCode,city,lat,lon,isp,as"
        );
        let body: serde_json::Value = http.get(&url).send().await?.json().await?;
        Ok(parse_ip_api(&body))
    }
}

pub(crate) fn parse_ip_api(body: &serde_json::Value) -> Option<GeoInfo> {
    let parsed: IpApiResponse = serde_json::from_value(body.clone()).ok()?;
    if parsed.status.as_deref() != Some("success") {
        return None;
    }
    Some(GeoInfo {
        country_code: parsed.country_code?,
        country_name: parsed.country,
        city: parsed.city,
        lat: parsed.lat?,
        lon: parsed.lon?,
        asn: parsed.as_field.as_deref().and_then(parse_asn_prefix),
        isp: parsed.isp,
    })
}

pub struct IpWhoIsProvider;

#[derive(Debug, Deserialize)]
struct IpWhoIsResponse {
    success: Option<bool>,
    country: Option<String>,
    country_code: Option<String>,
    city: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    connection: Option<IpWhoIsConnection>,
}

#[derive(Debug, Deserialize)]
struct IpWhoIsConnection {
    asn: Option<u32>,
    isp: Option<String>,
}

#[async_trait]
impl GeoProvider for IpWhoIsProvider {
    fn name(&self) -> &'static str {
        "ipwho.is"
    }

    async fn fetch(&self, http: &reqwest::Client, ip: &str) -> Result<Option<GeoInfo>, IntelError> {
        let url = format!("https://ipwho.is/{ip}");
        let body: serde_json::Value = http.get(&url).send().await?.json().await?;
        Ok(parse_ipwhois(&body))
    }
}

pub(crate) fn parse_ipwhois(body: &serde_json::Value) -> Option<GeoInfo> {
    let parsed: IpWhoIsResponse = serde_json::from_value(body.clone()).ok()?;
    if parsed.success == Some(false) {
        return None;
    }
    let connection = parsed.connection;
    Some(GeoInfo {
        country_code: parsed.country_code?,
        country_name: parsed.country,
        city: parsed.city,
        lat: parsed.latitude?,
        lon: parsed.longitude?,
        asn: connection.as_ref().and_then(|c| c.asn),
        isp: connection.and_then(|c| c.isp),
    })
}

pub struct IpApiCoProvider;

#[derive(Debug, Deserialize)]
struct IpApiCoResponse {
    error: Option<bool>,
    country_code: Option<String>,
    country_name: Option<String>,
    city: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    asn: Option<String>,
    org: Option<String>,
}

#[async_trait]
impl GeoProvider for IpApiCoProvider {
    fn name(&self) -> &'static str {
        "ipapi.co"
    }

    async fn fetch(&self, http: &reqwest::Client, ip: &str) -> Result<Option<GeoInfo>, IntelError> {
        let url = format!("https://ipapi.co/{ip}/json/");
        let body: serde_json::Value = http.get(&url).send().await?.json().await?;
        Ok(parse_ipapi_co(&body))
    }
}

pub(crate) fn parse_ipapi_co(body: &serde_json::Value) -> Option<GeoInfo> {
    let parsed: IpApiCoResponse = serde_json::from_value(body.clone()).ok()?;
    if parsed.error == Some(true) {
        return None;
    }
    Some(GeoInfo {
        country_code: parsed.country_code?,
        country_name: parsed.country_name,
        city: parsed.city,
        lat: parsed.latitude?,
        lon: parsed.longitude?,
        asn: parsed.asn.as_deref().and_then(parse_asn_prefix),
        isp: parsed.org,
    })
}

/// "AS15169 Google LLC" -> 15169
fn parse_asn_prefix(value: &str) -> Option<u32> {
    value
        .trim_start_matches("AS")
        .split_whitespace()
        .next()?
        .parse()
        .ok()
}

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::cache::{Cache, REP_CACHE_HITS, REP_CACHE_MISSES};
use crate::error::IntelError;
use crate::metrics;

const DEFAULT_BASE_URL: &str = "https://api.abuseipdb.com/api/v2";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const RESPONSE_CACHE_TTL: Duration = Duration::from_secs(3600);
const RETRY_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const RETRY_MAX_BACKOFF: Duration = Duration::from_secs(30);
const MAX_RETRIES: u32 = 3;
const CHECK_MAX_AGE_DAYS: u32 = 90;

const BLACKLIST_CACHE_KEY: &str = "rep:blacklist";

/// External reputation for one address, as returned by the blacklist or
/// check endpoint and cached for an hour to amortize the daily budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReputationRecord {
    pub ip: String,
    pub confidence: u8,
    pub categories: Vec<String>,
    pub reporter_count: u32,
    pub last_seen: Option<DateTime<Utc>>,
    pub raw: serde_json::Value,
}

/// Usage of the UTC-day request budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetState {
    pub day: NaiveDate,
    pub requests_used: u64,
    pub limit: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlacklistEntry {
    ip_address: Option<String>,
    abuse_confidence_score: Option<i64>,
    last_reported_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckData {
    ip_address: Option<String>,
    abuse_confidence_score: Option<i64>,
    usage_type: Option<String>,
    isp: Option<String>,
    total_reports: Option<u32>,
    last_reported_at: Option<DateTime<Utc>>,
}

/// Client for the external IP reputation service. Every outbound request is
/// gated by the UTC-day budget counter in the cache.
pub struct ReputationClient {
    http: reqwest::Client,
    cache: Arc<Cache>,
    api_key: String,
    base_url: String,
    daily_limit: u64,
}

impl ReputationClient {
    pub fn new(cache: Arc<Cache>, api_key: String, daily_limit: u64) -> Result<Self, IntelError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| IntelError::Config(format!("failed to build http client: {e}")))?;
        Ok(Self {
            http,
            cache,
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            daily_limit,
        })
    }

    pub fn budget_key_for(day: NaiveDate) -> String {
        format!("rep:budget:{}", day.format("%Y-%m-%d"))
    }

    /// The per-day key makes the UTC-midnight reset implicit: a new day reads
    /// a fresh counter, and yesterday's key ages out on its own TTL.
    fn budget_key_today() -> String {
        Self::budget_key_for(Utc::now().date_naive())
    }

    pub async fn budget_state(&self) -> Result<BudgetState, IntelError> {
        let day = Utc::now().date_naive();
        let requests_used = self
            .cache
            .get_counter(&Self::budget_key_for(day))
            .await?;
        Ok(BudgetState {
            day,
            requests_used,
            limit: self.daily_limit,
        })
    }

    /// Fetches the full blacklist at or above `min_confidence`. Served from
    /// the cached response when one is still fresh; otherwise one budgeted
    /// request, retried on 429/5xx.
    pub async fn get_blacklist(
        &self,
        min_confidence: u8,
    ) -> Result<Vec<ReputationRecord>, IntelError> {
        if let Some(cached) = self
            .cache
            .get_json::<Vec<ReputationRecord>>(BLACKLIST_CACHE_KEY)
            .await?
        {
            self.cache.bump_stat(REP_CACHE_HITS).await;
            tracing::debug!("serving blacklist from cache ({} records)", cached.len());
            return Ok(cached);
        }
        self.cache.bump_stat(REP_CACHE_MISSES).await;

        let url = format!("{}/blacklist", self.base_url);
        let body = self
            .request_with_retry(&url, &[("confidenceMinimum", min_confidence.to_string())])
            .await?;
        let records = parse_blacklist(&body);
        tracing::info!(
            "fetched reputation blacklist: {} usable records",
            records.len()
        );
        if let Err(e) = self
            .cache
            .put_json(BLACKLIST_CACHE_KEY, &records, RESPONSE_CACHE_TTL)
            .await
        {
            tracing::warn!("failed to cache blacklist response: {}", e);
        }
        Ok(records)
    }

    /// Looks up one address. `Ok(None)` means the service knows nothing about
    /// it (zero reports). Cached per IP with the standard response TTL.
    pub async fn check(&self, ip: &str) -> Result<Option<ReputationRecord>, IntelError> {
        let key = format!("rep:{ip}");
        if let Some(record) = self.cache.get_json::<ReputationRecord>(&key).await? {
            self.cache.bump_stat(REP_CACHE_HITS).await;
            return Ok(to_hit(record));
        }
        self.cache.bump_stat(REP_CACHE_MISSES).await;

        let url = format!("{}/check", self.base_url);
        let body = self
            .request_with_retry(
                &url,
                &[
                    ("ipAddress", ip.to_string()),
                    ("maxAgeInDays", CHECK_MAX_AGE_DAYS.to_string()),
                ],
            )
            .await?;
        match parse_check(&body) {
            Some(record) => {
                if let Err(e) = self.cache.put_json(&key, &record, RESPONSE_CACHE_TTL).await {
                    tracing::warn!("failed to cache reputation record for {}: {}", ip, e);
                }
                Ok(to_hit(record))
            }
            None => {
                tracing::warn!("reputation check for {} returned an unusable record", ip);
                Ok(None)
            }
        }
    }

    /// One budgeted GET with exponential backoff. The budget is claimed
    /// before every attempt, so retries are accounted like first tries.
    async fn request_with_retry(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<serde_json::Value, IntelError> {
        let mut backoff = RETRY_INITIAL_BACKOFF;
        let mut attempt = 0u32;
        loop {
            if !self
                .cache
                .try_consume_budget(&Self::budget_key_today(), self.daily_limit)
                .await?
            {
                tracing::warn!(
                    "reputation daily budget of {} exhausted",
                    self.daily_limit
                );
                return Err(IntelError::BudgetExhausted);
            }
            metrics::REPUTATION_REQUESTS.inc();

            let outcome = self
                .http
                .get(url)
                .header("Key", &self.api_key)
                .header("Accept", "application/json")
                .query(query)
                .send()
                .await;

            let retriable = match outcome {
                Ok(response) if response.status().is_success() => {
                    return response
                        .json::<serde_json::Value>()
                        .await
                        .map_err(|e| IntelError::Transient(format!("malformed reputation response: {e}")));
                }
                Ok(response)
                    if response.status().as_u16() == 429
                        || response.status().is_server_error() =>
                {
                    format!("reputation api returned {}", response.status())
                }
                Ok(response) => {
                    return Err(IntelError::Transient(format!(
                        "reputation api returned {}",
                        response.status()
                    )));
                }
                Err(e) => format!("reputation request failed: {e}"),
            };

            attempt += 1;
            if attempt > MAX_RETRIES {
                return Err(IntelError::Transient(format!(
                    "{retriable} after {MAX_RETRIES} retries"
                )));
            }
            let jitter_ms = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 2);
            let delay = backoff + Duration::from_millis(jitter_ms);
            tracing::debug!(
                "retrying reputation request in {:?} (attempt {}): {}",
                delay,
                attempt,
                retriable
            );
            tokio::time::sleep(delay).await;
            backoff = (backoff * 2).min(RETRY_MAX_BACKOFF);
        }
    }
}

/// Zero reports means the service has nothing on this address.
fn to_hit(record: ReputationRecord) -> Option<ReputationRecord> {
    if record.reporter_count == 0 && record.confidence == 0 {
        None
    } else {
        Some(record)
    }
}

/// Parses a blacklist response. Unknown fields are ignored; entries missing
/// the address or score are skipped with a warning rather than failing the
/// batch.
pub(crate) fn parse_blacklist(body: &serde_json::Value) -> Vec<ReputationRecord> {
    let Some(entries) = body.get("data").and_then(|d| d.as_array()) else {
        tracing::warn!("blacklist response carried no data array");
        return Vec::new();
    };
    let mut records = Vec::with_capacity(entries.len());
    for entry in entries {
        let parsed: BlacklistEntry = match serde_json::from_value(entry.clone()) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!("skipping unparseable blacklist entry: {}", e);
                continue;
            }
        };
        let (Some(ip), Some(score)) = (parsed.ip_address, parsed.abuse_confidence_score) else {
            tracing::warn!("skipping blacklist entry missing ipAddress or abuseConfidenceScore");
            continue;
        };
        records.push(ReputationRecord {
            ip,
            confidence: score.clamp(0, 100) as u8,
            categories: Vec::new(),
            reporter_count: 1,
            last_seen: parsed.last_reported_at,
            raw: entry.clone(),
        });
    }
    records
}

pub(crate) fn parse_check(body: &serde_json::Value) -> Option<ReputationRecord> {
    let data = body.get("data")?;
    let parsed: CheckData = serde_json::from_value(data.clone()).ok()?;
    let ip = parsed.ip_address?;
    let score = parsed.abuse_confidence_score?;
    let categories = parsed
        .usage_type
        .iter()
        .chain(parsed.isp.iter())
        .filter(|v| !v.is_empty())
        .cloned()
        .collect();
    Some(ReputationRecord {
        ip,
        confidence: score.clamp(0, 100) as u8,
        categories,
        reporter_count: parsed.total_reports.unwrap_or(0),
        last_seen: parsed.last_reported_at,
        raw: data.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_blacklist_skips_bad_entries() {
        let body = json!({
            "meta": {"generatedAt": "2024-03-06T00:00:00+00:00"},
            "data": [
                {"ipAddress": "198.51.100.7", "abuseConfidenceScore": 75,
                 "lastReportedAt": "2024-03-05T10:00:00+00:00"},
                {"abuseConfidenceScore": 90},
                {"ipAddress": "203.0.113.99"},
                {"ipAddress": "192.0.2.5", "abuseConfidenceScore": 100,
                 "someFutureField": true}
            ]
        });
        let records = parse_blacklist(&body);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].ip, "198.51.100.7");
        assert_eq!(records[0].confidence, 75);
        assert!(records[0].last_seen.is_some());
        assert_eq!(records[1].ip, "192.0.2.5");
        assert_eq!(records[1].confidence, 100);
    }

    #[test]
    fn test_parse_blacklist_without_data_is_empty() {
        assert!(parse_blacklist(&json!({"unexpected": true})).is_empty());
        assert!(parse_blacklist(&json!({"data": "nope"})).is_empty());
    }

    #[test]
    fn test_parse_check_reads_report() {
        let body = json!({
            "data": {
                "ipAddress": "192.0.2.5",
                "abuseConfidenceScore": 75,
                "countryCode": "NL",
                "usageType": "Data Center/Web Hosting/Transit",
                "isp": "Example Hosting",
                "totalReports": 42,
                "lastReportedAt": "2024-03-05T10:00:00+00:00"
            }
        });
        let record = parse_check(&body).unwrap();
        assert_eq!(record.ip, "192.0.2.5");
        assert_eq!(record.confidence, 75);
        assert_eq!(record.reporter_count, 42);
        assert_eq!(record.categories.len(), 2);
    }

    #[test]
    fn test_parse_check_clamps_out_of_range_scores() {
        let body = json!({
            "data": {"ipAddress": "192.0.2.5", "abuseConfidenceScore": 400}
        });
        assert_eq!(parse_check(&body).unwrap().confidence, 100);
    }

    #[test]
    fn test_clean_address_maps_to_not_found() {
        let record = ReputationRecord {
            ip: "192.0.2.1".to_string(),
            confidence: 0,
            categories: Vec::new(),
            reporter_count: 0,
            last_seen: None,
            raw: serde_json::Value::Null,
        };
        assert!(to_hit(record).is_none());
    }

    #[test]
    fn test_budget_key_uses_utc_day() {
        let day = NaiveDate::from_ymd_opt(2024, 3, 6).unwrap();
        assert_eq!(
            ReputationClient::budget_key_for(day),
            "rep:budget:2024-03-06"
        );
    }
}

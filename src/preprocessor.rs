use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::cache::{Cache, HIGH_CONFIDENCE_KEY, LAST_REBUILD_KEY, SNAPSHOT_KEY};
use crate::config::AppConfig;
use crate::correlator::Correlator;
use crate::error::IntelError;
use crate::geo::GeoEnricher;
use crate::local_threats::{LocalRecord, LocalThreatReader};
use crate::metrics;
use crate::model::{Indicator, Provenance, Source, HIGH_CONFIDENCE_THRESHOLD};
use crate::reputation::{ReputationClient, ReputationRecord};

const LOCAL_SOURCE_NAME: &str = "local-reports";
const EXTERNAL_SOURCE_NAME: &str = "AbuseIPDB";

/// The rebuild summary outlives the snapshot so freshness checks keep
/// working while a replacement cycle is still running.
const SUMMARY_TTL: Duration = Duration::from_secs(7 * 86400);

/// Outcome of the most recent completed rebuild, persisted for /health and
/// /stats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebuildSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub total_indicators: usize,
    pub high_confidence: usize,
    pub local_count: usize,
    pub external_count: usize,
    pub geo_enriched: usize,
    pub geo_success_ratio: f64,
    pub budget_exhausted: bool,
}

#[derive(Debug)]
pub enum CycleOutcome {
    Completed(RebuildSummary),
    /// A cycle was already running; this trigger was absorbed by it.
    Coalesced,
}

/// Orchestrates the rebuild cycle: fetch, correlate, enrich, commit.
/// Cycles are strictly serialized; concurrent triggers coalesce.
pub struct Preprocessor {
    reader: LocalThreatReader,
    reputation: ReputationClient,
    geo: GeoEnricher,
    correlator: Correlator,
    cache: Arc<Cache>,
    interval: Duration,
    snapshot_ttl: Duration,
    batch_size: usize,
    reputation_min_confidence: u8,
    cycle_lock: Mutex<()>,
}

impl Preprocessor {
    pub fn new(
        reader: LocalThreatReader,
        reputation: ReputationClient,
        geo: GeoEnricher,
        correlator: Correlator,
        cache: Arc<Cache>,
        config: &AppConfig,
    ) -> Self {
        Self {
            reader,
            reputation,
            geo,
            correlator,
            cache,
            interval: config.preprocess_interval,
            snapshot_ttl: config.preprocessing_ttl,
            batch_size: config.batch_size,
            reputation_min_confidence: config.reputation_min_confidence,
            cycle_lock: Mutex::new(()),
        }
    }

    /// Runs one rebuild cycle unless one is already in flight.
    pub async fn trigger(&self) -> Result<CycleOutcome, IntelError> {
        let Ok(_guard) = self.cycle_lock.try_lock() else {
            tracing::info!("rebuild cycle already running, trigger coalesced");
            return Ok(CycleOutcome::Coalesced);
        };
        match self.run_cycle().await {
            Ok(summary) => Ok(CycleOutcome::Completed(summary)),
            Err(e) => {
                metrics::REBUILD_FAILURES.inc();
                tracing::error!(
                    "rebuild cycle aborted, previous snapshot remains served: {}",
                    e
                );
                Err(e)
            }
        }
    }

    /// Fire-and-forget variant for the admin trigger. Returns false when a
    /// running cycle absorbed the request.
    pub fn trigger_background(self: &Arc<Self>) -> bool {
        if self.cycle_lock.try_lock().is_err() {
            return false;
        }
        let preprocessor = Arc::clone(self);
        tokio::spawn(async move {
            match preprocessor.trigger().await {
                Ok(CycleOutcome::Completed(summary)) => {
                    tracing::info!(
                        "admin-triggered rebuild completed with {} indicators",
                        summary.total_indicators
                    );
                }
                Ok(CycleOutcome::Coalesced) => {}
                Err(e) => {
                    tracing::error!("admin-triggered rebuild failed: {}", e);
                }
            }
        });
        true
    }

    /// Periodic scheduling plus the optional startup rebuild.
    pub fn spawn_scheduler(self: Arc<Self>, auto_start: bool) {
        tokio::spawn(async move {
            if auto_start {
                if let Err(e) = self.trigger().await {
                    tracing::error!("startup rebuild failed: {}", e);
                }
            }
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; the startup rebuild
            // already covered it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = self.trigger().await {
                    tracing::error!("scheduled rebuild failed: {}", e);
                }
            }
        });
    }

    async fn run_cycle(&self) -> Result<RebuildSummary, IntelError> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let soft_deadline = std::cmp::max(self.interval * 3, Duration::from_secs(15 * 60));
        tracing::info!("starting rebuild cycle");

        let locals = self.reader.fetch_all().await?;
        let (externals, mut budget_exhausted) = match self
            .reputation
            .get_blacklist(self.reputation_min_confidence)
            .await
        {
            Ok(records) => (records, false),
            Err(IntelError::BudgetExhausted) => {
                tracing::warn!("reputation budget exhausted, continuing with cached externals only");
                (Vec::new(), true)
            }
            Err(IntelError::Transient(e)) => {
                tracing::warn!("reputation blacklist unavailable, continuing without it: {}", e);
                (Vec::new(), false)
            }
            Err(e) => return Err(e),
        };
        let local_count = locals.len();
        let external_count = externals.len();

        let (keys, local_map, external_map) = build_keyset(locals, externals);
        let mut indicators: Vec<Indicator> = Vec::with_capacity(keys.len());
        let mut geo_attempts = 0usize;
        let mut geo_enriched = 0usize;
        let mut deadline_warned = false;

        for batch in keys.chunks(self.batch_size) {
            for ip in batch {
                let local = local_map.get(ip);
                let mut external = external_map.get(ip).cloned();
                // A locally-reported address missing from the blacklist still
                // gets an individual reputation lookup, until the budget runs
                // dry; from then on the cycle is local-evidence only.
                if external.is_none() && local.is_some() && !budget_exhausted {
                    match self.reputation.check(ip).await {
                        Ok(hit) => external = hit,
                        Err(IntelError::BudgetExhausted) => {
                            tracing::warn!(
                                "reputation budget exhausted mid-cycle, skipping further lookups"
                            );
                            budget_exhausted = true;
                        }
                        Err(e) => {
                            tracing::warn!("reputation check failed for {}: {}", ip, e);
                        }
                    }
                }
                let Some(mut indicator) = correlate_sources(
                    ip,
                    local,
                    external.as_ref(),
                    &self.correlator,
                    started_at,
                ) else {
                    continue;
                };
                geo_attempts += 1;
                match self.geo.enrich(ip).await {
                    Ok(Some(record)) => {
                        geo_enriched += 1;
                        indicator.geo = Some(record.geo);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        // The indicator still ships, just without geo data.
                        tracing::warn!("geo enrichment failed for {}: {}", ip, e);
                    }
                }
                indicators.push(indicator);
            }
            if !deadline_warned && clock.elapsed() > soft_deadline {
                tracing::warn!(
                    "rebuild cycle exceeded its soft deadline of {:?}, continuing",
                    soft_deadline
                );
                deadline_warned = true;
            }
        }

        let high_confidence: Vec<Indicator> = indicators
            .iter()
            .filter(|i| i.final_confidence >= HIGH_CONFIDENCE_THRESHOLD)
            .cloned()
            .collect();

        // Commit: each key is replaced in one atomic write, so readers see
        // either the previous snapshot or this one in full.
        self.cache
            .put_json(SNAPSHOT_KEY, &indicators, self.snapshot_ttl)
            .await?;
        self.cache
            .put_json(HIGH_CONFIDENCE_KEY, &high_confidence, self.snapshot_ttl)
            .await?;

        let finished_at = Utc::now();
        let summary = RebuildSummary {
            started_at,
            finished_at,
            duration_ms: clock.elapsed().as_millis() as u64,
            total_indicators: indicators.len(),
            high_confidence: high_confidence.len(),
            local_count,
            external_count,
            geo_enriched,
            geo_success_ratio: if geo_attempts > 0 {
                geo_enriched as f64 / geo_attempts as f64
            } else {
                0.0
            },
            budget_exhausted,
        };
        if let Err(e) = self.cache.put_json(LAST_REBUILD_KEY, &summary, SUMMARY_TTL).await {
            tracing::warn!("failed to record rebuild summary: {}", e);
        }

        metrics::REBUILD_TOTAL.inc();
        metrics::REBUILD_DURATION.observe(summary.duration_ms as f64 / 1000.0);
        metrics::INDICATORS.set(summary.total_indicators as i64);
        metrics::HIGH_CONFIDENCE_INDICATORS.set(summary.high_confidence as i64);
        if let Ok(budget) = self.reputation.budget_state().await {
            metrics::BUDGET_USED.set(budget.requests_used as i64);
        }

        tracing::info!(
            "rebuild cycle complete: {} indicators ({} high-confidence, {} local, {} external, {:.0}% geo) in {}ms",
            summary.total_indicators,
            summary.high_confidence,
            summary.local_count,
            summary.external_count,
            summary.geo_success_ratio * 100.0,
            summary.duration_ms
        );
        Ok(summary)
    }
}

/// Union of both sources keyed by IP, locals first in recency order.
fn build_keyset(
    locals: Vec<LocalRecord>,
    externals: Vec<ReputationRecord>,
) -> (
    Vec<String>,
    HashMap<String, LocalRecord>,
    HashMap<String, ReputationRecord>,
) {
    let mut keys: Vec<String> = Vec::with_capacity(locals.len() + externals.len());
    let mut local_map = HashMap::with_capacity(locals.len());
    for record in locals {
        keys.push(record.ip.clone());
        local_map.insert(record.ip.clone(), record);
    }
    let mut external_map = HashMap::with_capacity(externals.len());
    for record in externals {
        if !local_map.contains_key(&record.ip) && !external_map.contains_key(&record.ip) {
            keys.push(record.ip.clone());
        }
        external_map.insert(record.ip.clone(), record);
    }
    (keys, local_map, external_map)
}

/// Fuses one address's local and external evidence into an indicator,
/// without geo data. Returns `None` when neither source contributed.
pub(crate) fn correlate_sources(
    ip: &str,
    local: Option<&LocalRecord>,
    external: Option<&ReputationRecord>,
    correlator: &Correlator,
    processed_at: DateTime<Utc>,
) -> Option<Indicator> {
    let local_confidence = local.map(|l| l.confidence());
    let external_confidence = external.map(|e| e.confidence);
    let final_confidence = correlator.score(local_confidence, external_confidence)?;

    let mut source_set = BTreeSet::new();
    if local.is_some() {
        source_set.insert(Source::Local);
    }
    if external.is_some() {
        source_set.insert(Source::External);
    }

    let mut categories: Vec<String> = local.map(|l| l.categories.clone()).unwrap_or_default();
    if let Some(external) = external {
        categories.extend(external.categories.iter().cloned());
    }
    categories.sort();
    categories.dedup();

    let last_reported_at = match (
        local.map(|l| l.last_reported_at),
        external.and_then(|e| e.last_seen),
    ) {
        (Some(local_at), Some(external_at)) => Some(local_at.max(external_at)),
        (Some(local_at), None) => Some(local_at),
        (None, external_at) => external_at,
    };

    let mut provenance = Vec::new();
    if let Some(local) = local {
        provenance.push(Provenance {
            source_name: LOCAL_SOURCE_NAME.to_string(),
            source_url: None,
            observed_at: local.last_reported_at,
        });
    }
    if let Some(external) = external {
        provenance.push(Provenance {
            source_name: EXTERNAL_SOURCE_NAME.to_string(),
            source_url: Some(format!("https://www.abuseipdb.com/check/{ip}")),
            observed_at: external.last_seen.unwrap_or(processed_at),
        });
    }

    Some(Indicator {
        ip: ip.to_string(),
        source_set,
        local_confidence,
        external_confidence,
        final_confidence,
        first_reported_at: local.map(|l| l.first_reported_at),
        last_reported_at,
        categories,
        geo: None,
        provenance,
        processed_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn correlator() -> Correlator {
        Correlator::new(0.8, 0.2, 10, 85).unwrap()
    }

    fn local(ip: &str, confidence: i32) -> LocalRecord {
        LocalRecord {
            ip: ip.to_string(),
            confidence,
            categories: vec!["brute-force".to_string()],
            first_reported_at: Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
            last_reported_at: Utc.with_ymd_and_hms(2024, 3, 5, 0, 0, 0).unwrap(),
            report_count: 3,
        }
    }

    fn external(ip: &str, confidence: u8) -> ReputationRecord {
        ReputationRecord {
            ip: ip.to_string(),
            confidence,
            categories: vec!["scanner".to_string()],
            reporter_count: 12,
            last_seen: Some(Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap()),
            raw: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_local_only_indicator() {
        let record = local("203.0.113.10", 90);
        let indicator = correlate_sources(
            "203.0.113.10",
            Some(&record),
            None,
            &correlator(),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(indicator.local_confidence, Some(90));
        assert_eq!(indicator.external_confidence, None);
        // 90 + 10 boost clamps at 100.
        assert_eq!(indicator.final_confidence, 100);
        assert_eq!(indicator.source_set, BTreeSet::from([Source::Local]));
        assert_eq!(indicator.provenance.len(), 1);
        assert_eq!(indicator.provenance[0].source_name, "local-reports");
    }

    #[test]
    fn test_external_only_indicator() {
        let record = external("198.51.100.7", 75);
        let indicator = correlate_sources(
            "198.51.100.7",
            None,
            Some(&record),
            &correlator(),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(indicator.final_confidence, 15);
        assert_eq!(indicator.source_set, BTreeSet::from([Source::External]));
        assert!(indicator.first_reported_at.is_none());
        assert_eq!(
            indicator.provenance[0].source_url.as_deref(),
            Some("https://www.abuseipdb.com/check/198.51.100.7")
        );
    }

    #[test]
    fn test_dual_source_indicator() {
        let l = local("192.0.2.5", 85);
        let e = external("192.0.2.5", 75);
        let indicator =
            correlate_sources("192.0.2.5", Some(&l), Some(&e), &correlator(), Utc::now()).unwrap();
        // round(85*0.8 + 75*0.2) = 83, floored at 85 by the local boost.
        assert_eq!(indicator.final_confidence, 85);
        assert_eq!(
            indicator.source_set,
            BTreeSet::from([Source::Local, Source::External])
        );
        assert_eq!(
            indicator.categories,
            vec!["brute-force".to_string(), "scanner".to_string()]
        );
        assert_eq!(indicator.provenance.len(), 2);
        // Local report is more recent than the external sighting here.
        assert_eq!(
            indicator.last_reported_at,
            Some(Utc.with_ymd_and_hms(2024, 3, 5, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_keyset_unions_without_duplicates() {
        let locals = vec![local("192.0.2.5", 85), local("203.0.113.10", 90)];
        let externals = vec![external("192.0.2.5", 75), external("198.51.100.7", 60)];
        let (keys, local_map, external_map) = build_keyset(locals, externals);
        assert_eq!(keys, vec!["192.0.2.5", "203.0.113.10", "198.51.100.7"]);
        assert_eq!(local_map.len(), 2);
        assert_eq!(external_map.len(), 2);
    }

    #[test]
    fn test_empty_sources_produce_empty_keyset() {
        let (keys, local_map, external_map) = build_keyset(Vec::new(), Vec::new());
        assert!(keys.is_empty());
        assert!(local_map.is_empty());
        assert!(external_map.is_empty());
    }

    #[test]
    fn test_high_confidence_filter_matches_threshold() {
        let correlator = correlator();
        let now = Utc::now();
        let confidences = [90u8, 85, 80, 79, 50];
        let indicators: Vec<Indicator> = confidences
            .iter()
            .enumerate()
            .map(|(i, &c)| {
                let ip = format!("203.0.113.{i}");
                let mut record = external(&ip, 0);
                record.confidence = 0;
                let mut indicator =
                    correlate_sources(&ip, None, Some(&record), &correlator, now).unwrap();
                indicator.final_confidence = c;
                indicator
            })
            .collect();
        let high: Vec<&Indicator> = indicators
            .iter()
            .filter(|i| i.final_confidence >= HIGH_CONFIDENCE_THRESHOLD)
            .collect();
        assert_eq!(high.len(), 3);
        assert!(high.iter().all(|i| i.final_confidence >= 80));
    }
}

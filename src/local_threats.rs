use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};

use crate::error::IntelError;

const FETCH_SQL: &str = "SELECT ip, confidence, categories, first_reported_at, \
     last_reported_at, report_count FROM reported_threats \
     ORDER BY last_reported_at DESC";

/// One locally-reported attacker address as stored in the upstream table.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct LocalRecord {
    pub ip: String,
    pub confidence: i32,
    pub categories: Vec<String>,
    pub first_reported_at: DateTime<Utc>,
    pub last_reported_at: DateTime<Utc>,
    pub report_count: i32,
}

impl LocalRecord {
    /// The stored value is trusted to be within [0, 100] but is clamped
    /// anyway so a bad row cannot poison the correlator.
    pub fn confidence(&self) -> u8 {
        self.confidence.clamp(0, 100) as u8
    }
}

/// Read-only projection of the locally-reported threat table. Never issues
/// writes; the connection string should carry read-only credentials.
pub struct LocalThreatReader {
    pool: PgPool,
}

impl LocalThreatReader {
    pub async fn connect(database_url: &str) -> Result<Self, IntelError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await
            .map_err(|e| {
                IntelError::Transient(format!("local threat database unreachable: {e}"))
            })?;
        Ok(Self { pool })
    }

    /// Lazy pool for router-level tests: nothing connects until a query runs.
    #[cfg(test)]
    pub fn connect_lazy(database_url: &str) -> Result<Self, IntelError> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect_lazy(database_url)
            .map_err(|e| IntelError::Config(format!("invalid database url: {e}")))?;
        Ok(Self { pool })
    }

    /// Fetches every reported address, deduplicated by IP.
    pub async fn fetch_all(&self) -> Result<Vec<LocalRecord>, IntelError> {
        let rows = sqlx::query_as::<_, LocalRecord>(FETCH_SQL)
            .fetch_all(&self.pool)
            .await
            .map_err(map_fetch_error)?;
        let total = rows.len();
        let deduped = dedupe_by_ip(rows);
        if deduped.len() < total {
            tracing::debug!(
                "deduplicated {} local threat rows down to {} addresses",
                total,
                deduped.len()
            );
        }
        Ok(deduped)
    }
}

fn map_fetch_error(e: sqlx::Error) -> IntelError {
    match e {
        // A shape the reader does not understand is not retriable.
        sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::TypeNotFound { .. }
        | sqlx::Error::Decode(_) => {
            IntelError::Fatal(format!("local threat table schema mismatch: {e}"))
        }
        other => IntelError::Transient(format!("local threat query failed: {other}")),
    }
}

/// Keeps one record per IP: the most recent `last_reported_at` wins, ties
/// broken by the higher confidence. Output is ordered most recent first.
pub(crate) fn dedupe_by_ip(rows: Vec<LocalRecord>) -> Vec<LocalRecord> {
    let mut best: HashMap<String, LocalRecord> = HashMap::with_capacity(rows.len());
    for row in rows {
        match best.get(&row.ip) {
            Some(current)
                if (current.last_reported_at, current.confidence)
                    >= (row.last_reported_at, row.confidence) => {}
            _ => {
                best.insert(row.ip.clone(), row);
            }
        }
    }
    let mut out: Vec<LocalRecord> = best.into_values().collect();
    out.sort_by(|a, b| b.last_reported_at.cmp(&a.last_reported_at));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(ip: &str, confidence: i32, day: u32) -> LocalRecord {
        LocalRecord {
            ip: ip.to_string(),
            confidence,
            categories: vec!["ssh".to_string()],
            first_reported_at: Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
            last_reported_at: Utc.with_ymd_and_hms(2024, 3, day, 0, 0, 0).unwrap(),
            report_count: 1,
        }
    }

    #[test]
    fn test_dedupe_keeps_most_recent_report() {
        let rows = vec![
            record("203.0.113.10", 40, 5),
            record("203.0.113.10", 90, 2),
        ];
        let deduped = dedupe_by_ip(rows);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].confidence, 40);
    }

    #[test]
    fn test_dedupe_breaks_ties_by_confidence() {
        let rows = vec![
            record("203.0.113.10", 40, 5),
            record("203.0.113.10", 90, 5),
        ];
        let deduped = dedupe_by_ip(rows);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].confidence, 90);
    }

    #[test]
    fn test_dedupe_orders_most_recent_first() {
        let rows = vec![
            record("198.51.100.7", 50, 2),
            record("203.0.113.10", 50, 5),
            record("192.0.2.5", 50, 3),
        ];
        let deduped = dedupe_by_ip(rows);
        let ips: Vec<&str> = deduped.iter().map(|r| r.ip.as_str()).collect();
        assert_eq!(ips, vec!["203.0.113.10", "192.0.2.5", "198.51.100.7"]);
    }

    #[test]
    fn test_confidence_is_clamped() {
        let mut row = record("203.0.113.10", 140, 1);
        assert_eq!(row.confidence(), 100);
        row.confidence = -3;
        assert_eq!(row.confidence(), 0);
    }
}

use axum::extract::{Path, Query, State};
use axum::response::Response;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::AppState;
use crate::cache::{Cache, SNAPSHOT_KEY};
use crate::error::IntelError;
use crate::model::{stix_timestamp, Indicator, StixIndicator};
use crate::taxii::collections::{self, Collection};
use crate::taxii::{taxii_json, STIX_MEDIA_TYPE};

/// Query parameters shared by the objects and manifest endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct ObjectsQuery {
    pub limit: Option<usize>,
    pub added_after: Option<String>,
    pub next: Option<String>,
}

/// Outer wire envelope for paginated payloads.
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub more: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub next: Option<String>,
    pub data: T,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Bundle {
    #[serde(rename = "type")]
    pub bundle_type: String,
    pub id: String,
    pub spec_version: String,
    pub objects: Vec<StixIndicator>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Manifest {
    pub objects: Vec<ManifestEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub id: String,
    pub date_added: String,
    pub version: String,
    pub media_type: String,
}

pub async fn collection_objects(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ObjectsQuery>,
) -> Result<Response, IntelError> {
    let collection = resolve(&id)?;
    let snapshot = load_snapshot(&state.cache).await?;
    let (page, more, next) = page_snapshot(&snapshot, collection, &query);
    let bundle = Bundle {
        bundle_type: "bundle".to_string(),
        id: format!("bundle--{}", Uuid::new_v4()),
        spec_version: "2.1".to_string(),
        objects: page.iter().map(|i| i.to_stix()).collect(),
    };
    taxii_json(&Envelope {
        more,
        next,
        data: bundle,
    })
}

pub async fn collection_manifest(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ObjectsQuery>,
) -> Result<Response, IntelError> {
    let collection = resolve(&id)?;
    let snapshot = load_snapshot(&state.cache).await?;
    let (page, more, next) = page_snapshot(&snapshot, collection, &query);
    let manifest = Manifest {
        objects: page
            .iter()
            .map(|indicator| ManifestEntry {
                id: Indicator::stix_id(&indicator.ip),
                date_added: stix_timestamp(indicator.processed_at),
                version: stix_timestamp(indicator.processed_at),
                media_type: STIX_MEDIA_TYPE.to_string(),
            })
            .collect(),
    };
    taxii_json(&Envelope {
        more,
        next,
        data: manifest,
    })
}

fn resolve(id: &str) -> Result<&'static Collection, IntelError> {
    collections::find(id).ok_or_else(|| IntelError::NotFound(format!("collection {id}")))
}

/// The server never serves without a snapshot; consumers retry on 503 until
/// the first rebuild lands.
pub(crate) async fn load_snapshot(cache: &Cache) -> Result<Vec<Indicator>, IntelError> {
    cache
        .get_json::<Vec<Indicator>>(SNAPSHOT_KEY)
        .await?
        .ok_or_else(|| IntelError::ServiceUnavailable("no indicator snapshot available".to_string()))
}

/// Applies the collection predicate, `added_after` filter and pagination.
pub(crate) fn page_snapshot(
    snapshot: &[Indicator],
    collection: &Collection,
    query: &ObjectsQuery,
) -> (Vec<Indicator>, bool, Option<String>) {
    let added_after = query.added_after.as_deref().and_then(parse_added_after);
    let fingerprint = snapshot_fingerprint(snapshot);
    let filtered: Vec<Indicator> = snapshot
        .iter()
        .filter(|i| collection.matches(i))
        .filter(|i| added_after.map_or(true, |after| i.processed_at > after))
        .cloned()
        .collect();
    paginate(filtered, fingerprint, query.limit, query.next.as_deref())
}

fn parse_added_after(raw: &str) -> Option<DateTime<Utc>> {
    match DateTime::parse_from_rfc3339(raw) {
        Ok(parsed) => Some(parsed.with_timezone(&Utc)),
        Err(_) => {
            tracing::debug!("ignoring unparseable added_after value: {}", raw);
            None
        }
    }
}

/// The snapshot is identified by the rebuild timestamp every indicator in it
/// shares. Binding cursors to it keeps pages from one generation from ever
/// mixing with another: a rotated snapshot truncates the walk instead.
fn snapshot_fingerprint(snapshot: &[Indicator]) -> i64 {
    snapshot
        .first()
        .map(|i| i.processed_at.timestamp_millis())
        .unwrap_or(0)
}

fn paginate(
    filtered: Vec<Indicator>,
    fingerprint: i64,
    limit: Option<usize>,
    cursor: Option<&str>,
) -> (Vec<Indicator>, bool, Option<String>) {
    let offset = match cursor {
        None => 0,
        Some(raw) => match parse_cursor(raw) {
            Some((cursor_fingerprint, offset)) if cursor_fingerprint == fingerprint => offset,
            // The snapshot rotated underneath the consumer's cursor.
            Some(_) => return (Vec::new(), false, None),
            // A malformed cursor restarts the walk from the beginning.
            None => 0,
        },
    };

    let remaining: Vec<Indicator> = filtered.into_iter().skip(offset).collect();
    match limit {
        Some(limit) if limit < remaining.len() => {
            let page: Vec<Indicator> = remaining.into_iter().take(limit).collect();
            let next = format!("{fingerprint}:{}", offset + limit);
            (page, true, Some(next))
        }
        _ => (remaining, false, None),
    }
}

fn parse_cursor(raw: &str) -> Option<(i64, usize)> {
    let (fingerprint, offset) = raw.split_once(':')?;
    Some((fingerprint.parse().ok()?, offset.parse().ok()?))
}

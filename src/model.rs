use std::collections::BTreeSet;
use std::net::IpAddr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace for deriving stable indicator ids from IP addresses. Changing
/// this value changes every published id, so it is fixed for the lifetime of
/// the feed.
const INDICATOR_NAMESPACE: Uuid = Uuid::from_bytes(*b"threatwatch-ioc!");

pub const MALICIOUS_ACTIVITY_LABEL: &str = "malicious-activity";

/// Indicators scoring at or above this value belong to the high-confidence
/// collection.
pub const HIGH_CONFIDENCE_THRESHOLD: u8 = 80;

/// Where an indicator's evidence came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Source {
    Local,
    External,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Local => "LOCAL",
            Source::External => "EXTERNAL",
        }
    }
}

/// Geolocation attributes attached to an indicator. A record is only kept
/// when the provider returned at least a country code and coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoInfo {
    pub country_code: String,
    pub country_name: Option<String>,
    pub city: Option<String>,
    pub lat: f64,
    pub lon: f64,
    pub asn: Option<u32>,
    pub isp: Option<String>,
}

/// One contributing source, surfaced to consumers as an external reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub source_name: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub source_url: Option<String>,
    pub observed_at: DateTime<Utc>,
}

/// A fully enriched, scored threat indicator. Built by the preprocessor,
/// immutable once committed to the snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Indicator {
    pub ip: String,
    pub source_set: BTreeSet<Source>,
    pub local_confidence: Option<u8>,
    pub external_confidence: Option<u8>,
    pub final_confidence: u8,
    pub first_reported_at: Option<DateTime<Utc>>,
    pub last_reported_at: Option<DateTime<Utc>>,
    pub categories: Vec<String>,
    pub geo: Option<GeoInfo>,
    pub provenance: Vec<Provenance>,
    pub processed_at: DateTime<Utc>,
}

impl Indicator {
    /// Stable id: the same address always maps to the same indicator id,
    /// across rebuilds and across processes.
    pub fn stix_id(ip: &str) -> String {
        format!(
            "indicator--{}",
            Uuid::new_v5(&INDICATOR_NAMESPACE, ip.as_bytes())
        )
    }

    /// STIX pattern matching this address, `ipv6-addr` for v6 addresses.
    pub fn stix_pattern(ip: &str) -> String {
        match ip.parse::<IpAddr>() {
            Ok(IpAddr::V6(_)) => format!("[ipv6-addr:value = '{ip}']"),
            _ => format!("[ipv4-addr:value = '{ip}']"),
        }
    }

    pub fn to_stix(&self) -> StixIndicator {
        let geo = self.geo.as_ref();
        let point = geo.map(|g| GeoPoint { lat: g.lat, lon: g.lon });
        StixIndicator {
            object_type: "indicator".to_string(),
            spec_version: "2.1".to_string(),
            id: Self::stix_id(&self.ip),
            created: stix_timestamp(self.processed_at),
            modified: stix_timestamp(self.processed_at),
            pattern: Self::stix_pattern(&self.ip),
            pattern_type: "stix".to_string(),
            valid_from: stix_timestamp(self.first_reported_at.unwrap_or(self.processed_at)),
            labels: vec![MALICIOUS_ACTIVITY_LABEL.to_string()],
            confidence: self.final_confidence,
            x_local_confidence: self.local_confidence,
            x_external_confidence: self.external_confidence,
            x_source_set: self.source_set.iter().map(|s| s.as_str().to_string()).collect(),
            x_categories: self.categories.clone(),
            x_elastic_geo_country_code: geo.map(|g| g.country_code.clone()),
            x_elastic_geo_country_name: geo.and_then(|g| g.country_name.clone()),
            x_elastic_geo_city: geo.and_then(|g| g.city.clone()),
            x_elastic_geo_coordinates: point.clone(),
            x_elastic_geo_location: point,
            // Longitude first: the analytics platform expects GeoJSON order.
            x_elastic_geo_point: geo.map(|g| [g.lon, g.lat]),
            external_references: self
                .provenance
                .iter()
                .map(|p| ExternalReference {
                    source_name: p.source_name.clone(),
                    url: p.source_url.clone(),
                    description: Some(format!(
                        "Observed at {}",
                        stix_timestamp(p.observed_at)
                    )),
                })
                .collect(),
        }
    }
}

/// STIX timestamps carry millisecond precision and a literal `Z` suffix.
pub fn stix_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalReference {
    pub source_name: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub description: Option<String>,
}

/// The wire shape of an indicator: the standard STIX 2.1 fields plus the
/// `x_` extension fields consumed by the analytics platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StixIndicator {
    #[serde(rename = "type")]
    pub object_type: String,
    pub spec_version: String,
    pub id: String,
    pub created: String,
    pub modified: String,
    pub pattern: String,
    pub pattern_type: String,
    pub valid_from: String,
    pub labels: Vec<String>,
    pub confidence: u8,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub x_local_confidence: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub x_external_confidence: Option<u8>,
    pub x_source_set: Vec<String>,
    pub x_categories: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub x_elastic_geo_country_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub x_elastic_geo_country_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub x_elastic_geo_city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub x_elastic_geo_coordinates: Option<GeoPoint>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub x_elastic_geo_location: Option<GeoPoint>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub x_elastic_geo_point: Option<[f64; 2]>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub external_references: Vec<ExternalReference>,
}

use serde::{Deserialize, Serialize};

use crate::model::{Indicator, HIGH_CONFIDENCE_THRESHOLD};
use crate::taxii::STIX_MEDIA_TYPE;

/// A named, filtered view over the snapshot. The registry is static for the
/// process lifetime; consumers cannot create or modify collections.
pub struct Collection {
    pub id: &'static str,
    pub title: &'static str,
    pub description: &'static str,
    predicate: fn(&Indicator) -> bool,
}

impl Collection {
    pub fn matches(&self, indicator: &Indicator) -> bool {
        (self.predicate)(indicator)
    }

    pub fn descriptor(&self) -> CollectionDescriptor {
        CollectionDescriptor {
            id: self.id.to_string(),
            title: self.title.to_string(),
            description: self.description.to_string(),
            can_read: true,
            can_write: false,
            media_types: vec![STIX_MEDIA_TYPE.to_string()],
        }
    }
}

fn every_indicator(_: &Indicator) -> bool {
    true
}

fn high_confidence(indicator: &Indicator) -> bool {
    indicator.final_confidence >= HIGH_CONFIDENCE_THRESHOLD
}

pub static COLLECTIONS: &[Collection] = &[
    Collection {
        id: "all-indicators",
        title: "All indicators",
        description: "Every enriched indicator from the latest rebuild cycle",
        predicate: every_indicator,
    },
    Collection {
        id: "high-confidence",
        title: "High-confidence indicators",
        description: "Indicators with a final confidence of 80 or above",
        predicate: high_confidence,
    },
];

pub fn find(id: &str) -> Option<&'static Collection> {
    COLLECTIONS.iter().find(|c| c.id == id)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionDescriptor {
    pub id: String,
    pub title: String,
    pub description: String,
    pub can_read: bool,
    pub can_write: bool,
    pub media_types: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeSet;

    use crate::model::Source;

    fn indicator(final_confidence: u8) -> Indicator {
        Indicator {
            ip: "203.0.113.10".to_string(),
            source_set: BTreeSet::from([Source::Local]),
            local_confidence: Some(final_confidence),
            external_confidence: None,
            final_confidence,
            first_reported_at: None,
            last_reported_at: None,
            categories: Vec::new(),
            geo: None,
            provenance: Vec::new(),
            processed_at: Utc::now(),
        }
    }

    #[test]
    fn test_find_known_collections() {
        assert!(find("all-indicators").is_some());
        assert!(find("high-confidence").is_some());
        assert!(find("does-not-exist").is_none());
    }

    #[test]
    fn test_high_confidence_predicate_boundary() {
        let collection = find("high-confidence").unwrap();
        assert!(collection.matches(&indicator(80)));
        assert!(collection.matches(&indicator(90)));
        assert!(!collection.matches(&indicator(79)));
    }

    #[test]
    fn test_all_indicators_accepts_everything() {
        let collection = find("all-indicators").unwrap();
        assert!(collection.matches(&indicator(0)));
        assert!(collection.matches(&indicator(100)));
    }

    #[test]
    fn test_descriptors_are_read_only() {
        for collection in COLLECTIONS {
            let descriptor = collection.descriptor();
            assert!(descriptor.can_read);
            assert!(!descriptor.can_write);
            assert_eq!(descriptor.media_types, vec![STIX_MEDIA_TYPE.to_string()]);
        }
    }
}

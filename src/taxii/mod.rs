use axum::extract::Path;
use axum::http::{header, StatusCode};
use axum::response::Response;
use serde::Serialize;
use serde_json::json;

use crate::error::IntelError;

pub mod collections;
pub mod objects;

pub const TAXII_CONTENT_TYPE: &str = "application/taxii+json;version=2.1";
pub const STIX_MEDIA_TYPE: &str = "application/stix+json;version=2.1";
pub const API_ROOT_PATH: &str = "/taxii2/iocs/";

const MAX_CONTENT_LENGTH: u64 = 104_857_600;

/// Serializes a payload with the TAXII media type.
pub(crate) fn taxii_json<T: Serialize>(value: &T) -> Result<Response, IntelError> {
    let body = serde_json::to_string(value)
        .map_err(|e| IntelError::Fatal(format!("failed to serialize response: {e}")))?;
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, TAXII_CONTENT_TYPE)
        .body(body.into())
        .map_err(|e| IntelError::Fatal(format!("failed to build response: {e}")))
}

pub async fn discovery() -> Result<Response, IntelError> {
    taxii_json(&json!({
        "title": "ThreatWatch TAXII Server",
        "description": "Locally-observed attacker addresses enriched with external reputation and geolocation",
        "default": API_ROOT_PATH,
        "api_roots": [API_ROOT_PATH],
    }))
}

pub async fn api_root() -> Result<Response, IntelError> {
    taxii_json(&json!({
        "title": "Indicators of compromise",
        "versions": [TAXII_CONTENT_TYPE],
        "max_content_length": MAX_CONTENT_LENGTH,
    }))
}

pub async fn collections_index() -> Result<Response, IntelError> {
    let descriptors: Vec<_> = collections::COLLECTIONS
        .iter()
        .map(|c| c.descriptor())
        .collect();
    taxii_json(&json!({ "collections": descriptors }))
}

pub async fn collection_detail(Path(id): Path<String>) -> Result<Response, IntelError> {
    let collection = collections::find(&id)
        .ok_or_else(|| IntelError::NotFound(format!("collection {id}")))?;
    taxii_json(&collection.descriptor())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_discovery_points_at_the_api_root() {
        let response = discovery().await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            TAXII_CONTENT_TYPE
        );
    }

    #[tokio::test]
    async fn test_unknown_collection_detail_is_not_found() {
        let err = collection_detail(Path("missing".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[tokio::test]
    async fn test_collection_detail_returns_descriptor() {
        let response = collection_detail(Path("all-indicators".to_string()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}

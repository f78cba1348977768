use axum::http::HeaderMap;
use blake3::Hasher;
use constant_time_eq::constant_time_eq;

/// Validates the bearer token guarding the internal admin trigger. The
/// trigger stays closed when no token is configured.
pub struct AdminTokenValidator {
    token: Option<String>,
}

impl AdminTokenValidator {
    pub fn new(token: Option<String>) -> Self {
        if token.is_none() {
            tracing::warn!("ADMIN_TOKEN not configured - admin trigger is disabled");
        }
        Self { token }
    }

    pub fn validate(&self, presented: &str) -> bool {
        let Some(expected) = &self.token else {
            return false;
        };
        if presented.is_empty() {
            return false;
        }
        if constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
            // Log the hash, never the token itself.
            let hash = Self::hash_token(presented);
            tracing::debug!("admin token accepted (hash: {})", &hash[..8]);
            true
        } else {
            tracing::debug!("admin token rejected");
            false
        }
    }

    pub fn hash_token(token: &str) -> String {
        let mut hasher = Hasher::new();
        hasher.update(token.as_bytes());
        hasher.update(b"threatwatch_admin_token");
        hex::encode(hasher.finalize().as_bytes())
    }
}

/// Extracts the token from an `Authorization: Bearer ...` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
}

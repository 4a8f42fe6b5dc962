//! Bearer token authentication for mutating endpoints

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use sha2::{Digest, Sha256};

use crate::api::error::ApiError;
use crate::state::AppState;

/// Reject requests without `Authorization: Bearer <API_KEY>`
pub async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match token {
        Some(token) if keys_match(token, &state.settings.api_key) => Ok(next.run(request).await),
        _ => {
            tracing::warn!(
                "Rejected unauthenticated {} {}",
                request.method(),
                request.uri().path()
            );
            Err(ApiError::Unauthorized)
        }
    }
}

/// Compare fixed-length digests so timing leaks neither length nor prefix
fn keys_match(provided: &str, expected: &str) -> bool {
    let a = Sha256::digest(provided.as_bytes());
    let b = Sha256::digest(expected.as_bytes());
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_match() {
        assert!(keys_match("secret", "secret"));
        assert!(!keys_match("secret", "secreT"));
        assert!(!keys_match("", "secret"));
        assert!(!keys_match("secret-but-longer", "secret"));
    }
}

//! Bearer-token guard for operator routes.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use classbell_common::error::AppError;

use crate::state::AppState;

/// Proof that the request carried the operator token.
///
/// Add as an extractor to any handler that must be protected:
/// ```ignore
/// async fn handler(_auth: OpsAuth) -> impl IntoResponse { ... }
/// ```
#[derive(Debug, Clone, Copy)]
pub struct OpsAuth;

impl FromRequestParts<AppState> for OpsAuth {
    type Rejection = AppError;

    fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        let result = match state.ops_token.as_deref() {
            None => Ok(OpsAuth),
            Some(expected) => {
                let presented = parts
                    .headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.strip_prefix("Bearer "));
                match presented {
                    Some(token) if token_matches(token, expected) => Ok(OpsAuth),
                    Some(_) => Err(AppError::Auth("Invalid operator token".to_string())),
                    None => Err(AppError::Auth(
                        "Missing Authorization header. Use 'Bearer <OPS_API_TOKEN>'".to_string(),
                    )),
                }
            }
        };

        async move { result }
    }
}

/// Compare without short-circuiting on the first differing byte.
fn token_matches(presented: &str, expected: &str) -> bool {
    let (a, b) = (presented.as_bytes(), expected.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

use crate::models::ApiError;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use std::{convert::Infallible, sync::Arc};
use tracing::warn;

pub const TOKEN_HEADER: &str = "X-Scrape-Token";

/// Shared-secret check for the scrape endpoints.
#[derive(Clone)]
pub struct AuthState {
    token: Arc<str>,
}

impl AuthState {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Arc::from(token.into()),
        }
    }

    fn authenticate(&self, presented: &str) -> bool {
        constant_time_eq(presented.as_bytes(), self.token.as_bytes())
    }
}

pub async fn require_scrape_token(
    State(state): State<AuthState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let Some(presented) = extract_token(request.headers()) else {
        return Ok(unauthorized_response(
            "missing_token",
            "Provide Authorization (Bearer or Basic) or X-Scrape-Token",
        ));
    };

    if !state.authenticate(&presented) {
        warn!(target = "catalog.api", path = %request.uri().path(), "rejected scrape token");
        return Ok(unauthorized_response("invalid_token", "Token not recognized"));
    }

    Ok(next.run(request).await)
}

/// Bearer token, Basic auth password (username is ignored), or the
/// dedicated header, in that order.
fn extract_token(headers: &http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
    {
        let raw = raw.trim();
        if raw.len() >= 7 && raw[..6].eq_ignore_ascii_case("bearer") {
            return Some(raw[6..].trim().to_string()).filter(|t| !t.is_empty());
        }
        if raw.len() >= 6 && raw[..5].eq_ignore_ascii_case("basic") {
            return basic_password(raw[5..].trim());
        }
    }
    headers
        .get(TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn basic_password(encoded: &str) -> Option<String> {
    let decoded = BASE64.decode(encoded).ok()?;
    let pair = String::from_utf8(decoded).ok()?;
    let (_, password) = pair.split_once(':')?;
    Some(password.to_string()).filter(|p| !p.is_empty())
}

pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn unauthorized_response(code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (StatusCode::UNAUTHORIZED, Json(payload)).into_response()
}

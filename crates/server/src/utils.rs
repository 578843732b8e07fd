use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::error;

use crate::error::EngineError;
use crate::state::{ErrorResponse, HealthResponse};

pub const DEFAULT_PAGE_LIMIT: usize = 50;
pub const MAX_PAGE_LIMIT: usize = 500;

pub fn json_error(
    status: StatusCode,
    message: impl Into<String>,
) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

pub fn json_error_response(status: StatusCode, message: impl Into<String>) -> Response {
    json_error(status, message).into_response()
}

pub fn json_ok_response() -> Response {
    Json(HealthResponse { status: "ok" }).into_response()
}

pub fn engine_status(err: &EngineError) -> StatusCode {
    match err {
        EngineError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        EngineError::Invalid(_) => StatusCode::BAD_REQUEST,
        EngineError::Conflict(_) => StatusCode::CONFLICT,
        EngineError::DataCorruption(_)
        | EngineError::Store(_)
        | EngineError::Object(_)
        | EngineError::Payload(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn engine_error(err: EngineError) -> (StatusCode, Json<ErrorResponse>) {
    let status = engine_status(&err);
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!("Request failed: {}", err);
    }
    json_error(status, err.to_string())
}

pub fn extract_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// Clamps list paging parameters to `(limit, offset)`.
pub fn page_bounds(limit: Option<usize>, offset: Option<usize>) -> (usize, usize) {
    let limit = limit
        .filter(|limit| *limit > 0)
        .unwrap_or(DEFAULT_PAGE_LIMIT)
        .min(MAX_PAGE_LIMIT);
    (limit, offset.unwrap_or(0))
}

pub fn now_millis() -> u64 {
    let nanos = time::OffsetDateTime::now_utc().unix_timestamp_nanos();
    u64::try_from(nanos / 1_000_000).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::{engine_status, extract_token, page_bounds};
    use crate::error::EngineError;
    use axum::http::{header, HeaderMap, HeaderValue, StatusCode};

    #[test]
    fn bearer_token_is_extracted() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_token(&headers), None);
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc "));
        assert_eq!(extract_token(&headers).as_deref(), Some("abc"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(extract_token(&headers), None);
    }

    #[test]
    fn paging_is_clamped() {
        assert_eq!(page_bounds(None, None), (50, 0));
        assert_eq!(page_bounds(Some(0), Some(5)), (50, 5));
        assert_eq!(page_bounds(Some(10_000), None), (500, 0));
    }

    #[test]
    fn errors_map_to_statuses() {
        let cases = [
            (EngineError::Unauthenticated("x".into()), StatusCode::UNAUTHORIZED),
            (EngineError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (EngineError::UpstreamUnavailable("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (EngineError::DataCorruption("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
            (EngineError::Invalid("x".into()), StatusCode::BAD_REQUEST),
            (EngineError::Conflict("x".into()), StatusCode::CONFLICT),
        ];
        for (err, status) in cases {
            assert_eq!(engine_status(&err), status);
        }
    }
}

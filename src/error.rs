use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use thiserror::Error;
use tracing::{error, warn};

use crate::fetch::FetchError;
use crate::lot::LotError;
use crate::types::ErrorResponse;

const INTERNAL_MESSAGE: &str = "An unexpected error occurred while processing the request";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    InvalidLot(#[from] LotError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("No test data found for lot {lot}")]
    NoTestData { lot: String },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidLot(_) => StatusCode::BAD_REQUEST,
            ApiError::NoTestData { .. } => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Fetch(err) => match err {
                FetchError::Timeout { .. } => StatusCode::REQUEST_TIMEOUT,
                FetchError::Unreachable { .. } | FetchError::Blocked { .. } => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                FetchError::NotFound { .. } => StatusCode::NOT_FOUND,
                FetchError::UpstreamStatus { status, .. } => upstream_status(*status),
                FetchError::Body { .. } => StatusCode::BAD_GATEWAY,
                FetchError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    /// Stable machine-readable code for the `error` field.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidLot(_) => "invalid_lot",
            ApiError::NoTestData { .. } => "no_test_data",
            ApiError::Internal(_) => "internal_error",
            ApiError::Fetch(err) => match err {
                FetchError::Timeout { .. } => "upstream_timeout",
                FetchError::Unreachable { .. } | FetchError::Blocked { .. } => {
                    "upstream_unavailable"
                }
                FetchError::NotFound { .. } => "certificate_not_found",
                FetchError::UpstreamStatus { status, .. } => match upstream_status(*status) {
                    StatusCode::SERVICE_UNAVAILABLE => "upstream_unavailable",
                    StatusCode::BAD_GATEWAY => "bad_gateway",
                    _ => "upstream_error",
                },
                FetchError::Body { .. } => "bad_gateway",
                FetchError::Config(_) => "internal_error",
            },
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::InvalidLot(err) => err.to_string(),
            ApiError::NoTestData { .. } => self.to_string(),
            ApiError::Internal(_) => INTERNAL_MESSAGE.to_string(),
            ApiError::Fetch(err) => match err {
                FetchError::Timeout { .. } => {
                    "The certificate server did not respond in time".to_string()
                }
                FetchError::Unreachable { .. } | FetchError::Blocked { .. } => {
                    "The certificate server is currently unavailable".to_string()
                }
                FetchError::NotFound { lot } => {
                    format!("No certificate of analysis found for lot {}", lot)
                }
                FetchError::UpstreamStatus { status, .. } if *status >= 500 => {
                    "The certificate server is currently unavailable".to_string()
                }
                FetchError::UpstreamStatus { status, .. } => {
                    format!("The certificate server answered with HTTP {}", status)
                }
                FetchError::Body { .. } => {
                    "The certificate server sent an unreadable response".to_string()
                }
                FetchError::Config(_) => INTERNAL_MESSAGE.to_string(),
            },
        }
    }

    fn details(&self) -> String {
        match self {
            ApiError::Internal(err) => format!("{:#}", err),
            other => other.to_string(),
        }
    }

    /// Renders the error envelope. `expose_details` adds the underlying error
    /// text and is only set outside production.
    pub fn into_response_with(self, expose_details: bool) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("{} ({}): {}", status, self.code(), self.details());
        } else {
            warn!("{} ({}): {}", status, self.code(), self.details());
        }

        let body = ErrorResponse {
            success: false,
            error: self.code().to_string(),
            message: self.message(),
            details: expose_details.then(|| self.details()),
        };
        error_response(status, body)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        self.into_response_with(false)
    }
}

/// 5xx becomes 503, 4xx passes through and anything else is a bad gateway.
fn upstream_status(status: u16) -> StatusCode {
    match status {
        500..=599 => StatusCode::SERVICE_UNAVAILABLE,
        400..=499 => StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY),
        _ => StatusCode::BAD_GATEWAY,
    }
}

pub fn error_response(status: StatusCode, body: ErrorResponse) -> Response {
    let mut response = (status, Json(body)).into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

/// 500 envelope used when a handler panics.
pub fn panic_response(details: Option<String>) -> Response {
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        ErrorResponse {
            success: false,
            error: "internal_error".to_string(),
            message: INTERNAL_MESSAGE.to_string(),
            details,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetch(err: FetchError) -> ApiError {
        ApiError::Fetch(err)
    }

    #[test]
    fn test_status_table() {
        let cases = vec![
            (ApiError::InvalidLot(LotError::Missing), 400, "invalid_lot"),
            (
                fetch(FetchError::Timeout { url: "u".into() }),
                408,
                "upstream_timeout",
            ),
            (
                fetch(FetchError::Unreachable {
                    url: "u".into(),
                    reason: "refused".into(),
                }),
                503,
                "upstream_unavailable",
            ),
            (
                fetch(FetchError::Blocked {
                    url: "u".into(),
                    reason: "captcha".into(),
                }),
                503,
                "upstream_unavailable",
            ),
            (
                fetch(FetchError::NotFound { lot: "A1".into() }),
                404,
                "certificate_not_found",
            ),
            (
                fetch(FetchError::UpstreamStatus {
                    url: "u".into(),
                    status: 500,
                }),
                503,
                "upstream_unavailable",
            ),
            (
                fetch(FetchError::UpstreamStatus {
                    url: "u".into(),
                    status: 410,
                }),
                410,
                "upstream_error",
            ),
            (
                fetch(FetchError::UpstreamStatus {
                    url: "u".into(),
                    status: 302,
                }),
                502,
                "bad_gateway",
            ),
            (
                fetch(FetchError::Body {
                    url: "u".into(),
                    reason: "decode".into(),
                }),
                502,
                "bad_gateway",
            ),
            (
                fetch(FetchError::Config("bad".into())),
                500,
                "internal_error",
            ),
            (
                ApiError::NoTestData { lot: "A1".into() },
                404,
                "no_test_data",
            ),
            (
                ApiError::Internal(anyhow::anyhow!("boom")),
                500,
                "internal_error",
            ),
        ];

        for (err, status, code) in cases {
            assert_eq!(err.status().as_u16(), status, "{:?}", err);
            assert_eq!(err.code(), code, "{:?}", err);
        }
    }

    #[test]
    fn test_not_found_message_names_lot() {
        let err = fetch(FetchError::NotFound { lot: "Z9".into() });
        assert!(err.message().contains("Z9"));
        let err = ApiError::NoTestData { lot: "Z9".into() };
        assert!(err.message().contains("Z9"));
    }

    #[test]
    fn test_internal_details_hidden_by_default() {
        let response = ApiError::Internal(anyhow::anyhow!("database exploded")).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-store");
    }
}

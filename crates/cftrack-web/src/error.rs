use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use cftrack_storage::StoreError;
use cftrack_sync::{ScheduleError, SyncError};
use serde::Serialize;

/// JSON body returned by every endpoint on failure.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug)]
pub enum ApiError {
    Validation(String),
    NotFound(String),
    Conflict(String),
    /// The judge is throttling us; the client should retry later.
    UpstreamBlocked(String),
    UpstreamNotFound(String),
    Upstream(String),
    Internal(String),
}

impl ApiError {
    fn status_and_body(self) -> (StatusCode, ErrorBody) {
        match self {
            ApiError::Validation(message) => (
                StatusCode::BAD_REQUEST,
                ErrorBody {
                    code: "VALIDATION_ERROR",
                    message,
                },
            ),
            ApiError::NotFound(message) => (
                StatusCode::NOT_FOUND,
                ErrorBody {
                    code: "NOT_FOUND",
                    message,
                },
            ),
            ApiError::Conflict(message) => (
                StatusCode::CONFLICT,
                ErrorBody {
                    code: "CONFLICT",
                    message,
                },
            ),
            ApiError::UpstreamBlocked(message) => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorBody {
                    code: "UPSTREAM_BLOCKED",
                    message,
                },
            ),
            ApiError::UpstreamNotFound(message) => (
                StatusCode::NOT_FOUND,
                ErrorBody {
                    code: "UPSTREAM_NOT_FOUND",
                    message,
                },
            ),
            ApiError::Upstream(message) => (
                StatusCode::BAD_GATEWAY,
                ErrorBody {
                    code: "UPSTREAM_ERROR",
                    message,
                },
            ),
            ApiError::Internal(detail) => {
                tracing::error!(%detail, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorBody {
                        code: "INTERNAL_ERROR",
                        message: "An unexpected error occurred".into(),
                    },
                )
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = self.status_and_body();
        (status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => ApiError::NotFound(format!("{what} not found")),
            StoreError::Conflict(msg) => ApiError::Conflict(msg),
            StoreError::Validation(msg) => ApiError::Validation(msg),
            StoreError::Backend(err) => ApiError::Internal(format!("{err:#}")),
        }
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        let message = err.to_string();
        match err {
            SyncError::StudentNotFound(_) => ApiError::NotFound(message),
            SyncError::UpstreamBlocked(_) => ApiError::UpstreamBlocked(
                "Codeforces is rate limiting requests, try again later".to_string(),
            ),
            SyncError::UpstreamNotFound(_) => ApiError::UpstreamNotFound(message),
            SyncError::UpstreamTransient(_)
            | SyncError::UpstreamRejected(_)
            | SyncError::UpstreamMalformed(_) => ApiError::Upstream(message),
            SyncError::Store(store) => store.into(),
        }
    }
}

impl From<ScheduleError> for ApiError {
    fn from(err: ScheduleError) -> Self {
        match err {
            ScheduleError::Validation { .. } => ApiError::Validation(err.to_string()),
            ScheduleError::Scheduler(msg) => ApiError::Internal(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocked_is_distinct_from_server_error() {
        let (status, body) =
            ApiError::from(SyncError::UpstreamBlocked("http 429".into())).status_and_body();
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body.code, "UPSTREAM_BLOCKED");

        let (status, _) =
            ApiError::from(SyncError::UpstreamTransient("timeout".into())).status_and_body();
        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn store_errors_map_to_client_statuses() {
        let (status, body) =
            ApiError::from(StoreError::Conflict("handle taken".into())).status_and_body();
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body.message, "handle taken");

        let (status, body) =
            ApiError::from(StoreError::Backend(anyhow::anyhow!("pool timed out"))).status_and_body();
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!body.message.contains("pool"));
    }
}

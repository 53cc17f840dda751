///! Standardized error handling for API responses
///!
///! Maps the shared error kinds onto the common JSON envelope with stable
///! string codes and the HTTP statuses the cluster mesh relies on.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sylve_common::{ApiEnvelope, Error};
use tracing::error;

/// API error wrapper carrying the shared error kind.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl ApiError {
    /// HTTP status for each error kind: validation 400, not-found 404,
    /// conflict 409, leader transition 503, forward failure 502,
    /// restore pre-check 500, everything else 500.
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::Conflict { .. } => StatusCode::CONFLICT,
            Error::LeaderUnknown | Error::NotLeader => StatusCode::SERVICE_UNAVAILABLE,
            Error::RemoteForward { .. } => StatusCode::BAD_GATEWAY,
            Error::RestorePrecheck(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Transient(_) | Error::Fatal(_) | Error::Database(_) | Error::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("API error: {}", self.0);
        }
        let envelope: ApiEnvelope<()> = ApiEnvelope::error(self.0.code(), self.0.to_string());
        (status, Json(envelope)).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        ApiError(Error::Database(err.to_string()))
    }
}

impl From<std::io::Error> for ApiError {
    fn from(err: std::io::Error) -> Self {
        ApiError(Error::Io(err))
    }
}

/// Handler result alias.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Success envelope shortcut.
pub fn ok<T: serde::Serialize>(data: T) -> Json<ApiEnvelope<T>> {
    Json(ApiEnvelope::success("ok", data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError(Error::validation("bad")).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError(Error::not_found("backup_target_not_found", "3")).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError(Error::conflict("already_running", "policy 1")).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError(Error::LeaderUnknown).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError(Error::RemoteForward {
                node: "n2".into(),
                detail: "refused".into()
            })
            .status(),
            StatusCode::BAD_GATEWAY
        );
        // The restore pre-check split: placement conflicts are 409, a
        // failed cluster-details load is 500.
        assert_eq!(
            ApiError(Error::conflict("restore_guest_id_conflict", "100")).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError(Error::RestorePrecheck("db down".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}

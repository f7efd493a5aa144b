use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use task_core::Error;
use task_wire::ErrorEnvelope;

/// Local newtype so `IntoResponse` can be implemented for the domain `Error`
/// despite it living in `task-core` (orphan rules forbid the impl there
/// directly, since neither the trait nor the error type belong to this
/// crate).
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let body = ErrorEnvelope::from(&self.0);
        (status, Json(body)).into_response()
    }
}

/// Maps a domain error code to an HTTP status (spec.md §7).
fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::Validation(_) => StatusCode::BAD_REQUEST,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::ConflictState(_) => StatusCode::CONFLICT,
        Error::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::MalformedResponse(_) => StatusCode::BAD_GATEWAY,
        Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        Error::QuotaExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
        Error::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

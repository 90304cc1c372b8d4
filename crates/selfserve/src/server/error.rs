//! HTTP error mapping.
//!
//! User-facing failures become `{success: false, message}` with a status
//! code per variant. Infrastructure faults are tagged with a [`Fault`]
//! extension and rewritten by [`report_faults`] according to the
//! configured [`ErrorReporting`] policy.

use crate::config::ErrorReporting;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use selfserve_engine::RequestError;
use selfserve_ids::ErrorId;
use tracing::error;

pub const MSG_UNAUTHENTICATED: &str = "Please authenticate yourself first!";

#[derive(Debug)]
pub enum ApiError {
    Request(RequestError),
    /// No authenticated actor on a route that needs one
    Unauthenticated,
    /// Rejected before reaching the engine (body too large, bad encoding)
    Rejected { status: StatusCode, message: String },
}

impl ApiError {
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Request(RequestError::unauthorized(msg))
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::Request(RequestError::validation(msg))
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Request(err) => match err {
                RequestError::Validation(_) => StatusCode::BAD_REQUEST,
                RequestError::Unauthorized(_) => StatusCode::FORBIDDEN,
                RequestError::NotFound(_) => StatusCode::NOT_FOUND,
                RequestError::Conflict(_) => StatusCode::CONFLICT,
                RequestError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
                RequestError::Downstream(_) => StatusCode::BAD_GATEWAY,
                RequestError::Store(_) | RequestError::Io(_) | RequestError::Queue(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            ApiError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ApiError::Rejected { status, .. } => *status,
        }
    }
}

impl From<RequestError> for ApiError {
    fn from(err: RequestError) -> Self {
        Self::Request(err)
    }
}

/// Detail of an infrastructure fault, waiting for [`report_faults`].
#[derive(Debug, Clone)]
pub struct Fault(pub String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match self {
            ApiError::Request(err) if !err.is_user_facing() => {
                let mut resp = status.into_response();
                resp.extensions_mut().insert(Fault(err.to_string()));
                resp
            }
            ApiError::Request(err) => failure(status, err.to_string()),
            ApiError::Unauthenticated => plain(status, format!("{}\n", MSG_UNAUTHENTICATED)),
            ApiError::Rejected { message, .. } => plain(status, message),
        }
    }
}

fn failure(status: StatusCode, message: String) -> Response {
    (
        status,
        Json(serde_json::json!({ "success": false, "message": message })),
    )
        .into_response()
}

fn plain(status: StatusCode, text: String) -> Response {
    (status, [(header::CONTENT_TYPE, "text/plain")], text).into_response()
}

/// Render tagged faults: detail to the caller (`show`), or detail to the
/// log and only a correlation id to the caller (`journal`).
pub async fn report_faults(
    State(policy): State<ErrorReporting>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    let mut resp = next.run(request).await;
    let Some(Fault(detail)) = resp.extensions_mut().remove::<Fault>() else {
        return resp;
    };

    let text = match policy {
        ErrorReporting::Show => format!("API error occurred: {}", detail),
        ErrorReporting::Journal => {
            let eid = ErrorId::new();
            error!(error_id = %eid.as_str(), path = %path, error = %detail, "API endpoint failed");
            format!(
                "API error occurred. The application journal will have information. Error ID: {}",
                eid.as_str()
            )
        }
    };
    let (mut parts, _) = resp.into_parts();
    parts.headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain"),
    );
    parts.headers.remove(header::CONTENT_LENGTH);
    Response::from_parts(parts, Body::from(text))
}

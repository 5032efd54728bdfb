mod options;
mod post;

use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use actix_web::ResponseError;
pub use options::*;
pub use post::*;
use serde::Serialize;

use crate::square_client::SquareError;
use crate::square_client::FALLBACK_MESSAGE;
use crate::utils::error_chain_fmt;

/// Everything that can end a `/api/newsletter` request early. Each variant is
/// rendered as `{"error": "<message>"}`.
#[derive(thiserror::Error)]
pub enum SubscribeError {
    #[error("Method not allowed")]
    MethodNotAllowed,
    #[error("Forbidden origin")]
    ForbiddenOrigin,
    #[error("{0}")]
    ValidationError(String),
    /// The body could not be parsed at all
    #[error(transparent)]
    MalformedBody(anyhow::Error),
    /// `email` was given, but is not a string
    #[error("Expected email to be a string, got {0}")]
    MalformedEmail(&'static str),
    /// Search, update or create failed. Failures of the best-effort steps
    /// never end up here.
    #[error(transparent)]
    UpstreamError(#[from] SquareError),
}

impl std::fmt::Debug for SubscribeError {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl ResponseError for SubscribeError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::ForbiddenOrigin => StatusCode::FORBIDDEN,
            Self::ValidationError(_) => StatusCode::BAD_REQUEST,
            Self::MalformedBody(_) | Self::MalformedEmail(_) | Self::UpstreamError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        let error = match self.to_string() {
            m if m.is_empty() => FALLBACK_MESSAGE.to_string(),
            m => m,
        };
        HttpResponse::build(self.status_code()).json(ErrorBody { error })
    }
}

/// Fallback for `/api/newsletter`: anything but `POST` and `OPTIONS`
pub async fn method_not_allowed() -> Result<HttpResponse, SubscribeError> {
    Err(SubscribeError::MethodNotAllowed)
}

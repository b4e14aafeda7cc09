use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::error;

pub type AppResult<T> = Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// token failed to decode, authenticate or deserialize
    #[error("invalid token")]
    InvalidToken,

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// connection was dropped before a response, retried and still failing
    #[error("transient network error after {attempts} attempts: {message}")]
    TransientNetworkError { attempts: u32, message: String },

    /// backend answered with a non success status, body is kept for the logs only
    #[error("upstream rejected request with status {status}")]
    UpstreamRejected { status: u16, body: String },

    #[error("channel not found: {0}")]
    ChannelNotFound(String),

    #[error("unknown quality: {0}")]
    UnknownQuality(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal server error")]
    InternalServerError,

    #[error("internal server error: {0}")]
    InternalServerErrorWithContext(String),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidToken => StatusCode::FORBIDDEN,
            Self::UnsupportedFormat(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::MalformedResponse(_) | Self::UpstreamRejected { .. } => StatusCode::BAD_GATEWAY,
            Self::TransientNetworkError { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::ChannelNotFound(_) | Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::UnknownQuality(_) | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::InternalServerError | Self::InternalServerErrorWithContext(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::InternalServerErrorWithContext(format!("io error: {}", err))
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // the upstream body can contain tokens, it stays in our logs and never reaches players
        let message = match &self {
            Self::UpstreamRejected { status, body } => {
                error!("upstream rejected with {}: {}", status, body);
                self.to_string()
            }
            Self::InternalServerErrorWithContext(context) => {
                error!("internal error: {}", context);
                "internal server error".to_string()
            }
            _ => self.to_string(),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

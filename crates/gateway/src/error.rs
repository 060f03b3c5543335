use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use {tracing::warn, wagate_whatsapp::Error as SessionError};

use crate::{media::DataUrlError, qr::QrError};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Store(#[from] wagate_store::StoreError),

    #[error(transparent)]
    Qr(#[from] QrError),
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        Self::BadRequest(format!("body data is invalid: {}", e.body_text()))
    }
}

impl From<DataUrlError> for ApiError {
    fn from(e: DataUrlError) -> Self {
        Self::BadRequest(e.to_string())
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Session(e) => match e {
                SessionError::Validation(_) => StatusCode::BAD_REQUEST,
                SessionError::NotAuthenticated(_)
                | SessionError::NotConnected(_)
                | SessionError::NotInQrState(_) => StatusCode::CONFLICT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Store(_) | Self::Qr(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self, "request failed");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

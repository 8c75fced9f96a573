use axum::{
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use reqwest;
use std::io;

use crate::path_utils::PathError;

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("bad object path: {0}")]
    BadPath(#[from] PathError),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("no namespace registered for this path")]
    UnknownNamespace,
    #[error("no server is exporting this object")]
    NoCandidates,
    #[error("advertisement signature rejected")]
    BadSignature,
    #[error("conflict: server identity is owned by another party")]
    IdentityConflict,
    #[error("all matching servers are filtered or down")]
    AllUnavailable { retry_after: u32 },
    #[error("director is still warming up")]
    WarmingUp { retry_after: u32 },
    #[error("overloaded")]
    Overloaded { retry_after: u32 },
    #[error("upstream request failed")]
    UpstreamReq(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Any(#[from] anyhow::Error),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadPath(_) => StatusCode::BAD_REQUEST,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::UnknownNamespace => StatusCode::NOT_FOUND,
            ApiError::NoCandidates => StatusCode::NOT_FOUND,
            ApiError::BadSignature => StatusCode::UNAUTHORIZED,
            ApiError::IdentityConflict => StatusCode::CONFLICT,
            ApiError::AllUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::WarmingUp { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Overloaded { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::UpstreamReq(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Any(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn retry_after(&self) -> Option<u32> {
        match self {
            ApiError::AllUnavailable { retry_after }
            | ApiError::WarmingUp { retry_after }
            | ApiError::Overloaded { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status_code = self.status_code();
        let retry_after = self.retry_after();

        let mut response = (status_code, self.to_string()).into_response();
        if let Some(secs) = retry_after
            && let Ok(v) = HeaderValue::from_str(&secs.to_string())
        {
            response.headers_mut().insert(RETRY_AFTER, v);
        }
        response
    }
}

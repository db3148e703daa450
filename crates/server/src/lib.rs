pub mod controller;
pub mod discover;
pub mod msg_url;
pub mod shard;
pub mod shard_client;
pub mod types;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::error;

use vox_common::VoxError;

/// Maps the error taxonomy onto HTTP status codes at the RPC boundary.
pub struct ApiError(pub VoxError);

impl From<VoxError> for ApiError {
    fn from(err: VoxError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            VoxError::NotFound(_) => StatusCode::NOT_FOUND,
            VoxError::BadRequest(_) => StatusCode::BAD_REQUEST,
            VoxError::AlreadyJoined | VoxError::MaxChatsExceeded => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("request failed: {}", self.0);
        }

        (status, self.0.to_string()).into_response()
    }
}

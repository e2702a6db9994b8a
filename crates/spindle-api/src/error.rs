// XRPC error envelope
//
// Every error that leaves the HTTP surface is `{error: <tag>, message}` with
// a tag from the closed ErrorTag set. Internal details never leak; the
// message is the human-readable part of the contract.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

use spindle_core::{ErrorTag, VaultError};

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    /// Closed tag enum, e.g. "AccessControl"
    pub error: String,
    pub message: String,
}

#[derive(Debug)]
pub struct XrpcError {
    pub status: StatusCode,
    pub tag: ErrorTag,
    pub message: String,
}

impl XrpcError {
    pub fn new(status: StatusCode, tag: ErrorTag, message: impl Into<String>) -> Self {
        Self {
            status,
            tag,
            message: message.into(),
        }
    }

    pub fn missing_actor() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            ErrorTag::MissingActorDid,
            "no actor DID in request context",
        )
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, ErrorTag::Auth, message)
    }

    pub fn invalid_repo(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, ErrorTag::InvalidRepo, message)
    }

    pub fn access_denied() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            ErrorTag::AccessControl,
            "DID does not have sufficient access permissions for this operation",
        )
    }

    pub fn generic(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorTag::Generic,
            message,
        )
    }
}

impl From<VaultError> for XrpcError {
    fn from(err: VaultError) -> Self {
        let status = match &err {
            VaultError::KeyAlreadyPresent => StatusCode::CONFLICT,
            VaultError::KeyNotFound => StatusCode::NOT_FOUND,
            VaultError::InvalidKeyIdent(_) => StatusCode::BAD_REQUEST,
            VaultError::Backend(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let tag = ErrorTag::from(&err);
        let message = match &err {
            // Backend details stay in the logs
            VaultError::Backend(_) => "secret store operation failed".to_string(),
            other => other.to_string(),
        };
        Self::new(status, tag, message)
    }
}

impl IntoResponse for XrpcError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.tag.as_str().to_string(),
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

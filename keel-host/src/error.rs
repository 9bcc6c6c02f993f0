//! Error types for the host crate.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use keel_store::{BlobError, DatabaseError};
use serde_json::json;

/// Errors raised by host lifecycle operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum HostError {
    /// Binding or listening on the resolved address failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The server task failed while the listener was being closed.
    #[error("listener failed while closing: {0}")]
    Close(String),

    /// The configured identity header value is not a valid header value.
    #[error("invalid identity header value '{0}'")]
    InvalidIdentity(String),

    /// Configuration could not be resolved.
    #[error(transparent)]
    Config(#[from] keel_core::CoreError),
}

/// A failure raised by application route logic.
///
/// Returned from handlers as `Result<_, RouteError>`. Without the error
/// handling stage it renders as a bare status with an empty body; with it,
/// the failure is logged and rendered as `{"error": "<message>"}`.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct RouteError {
    status: StatusCode,
    message: String,
    details: String,
}

impl RouteError {
    #[must_use]
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        let message = message.into();
        Self { status, details: message.clone(), message }
    }

    /// A 500 whose log details carry the full error chain of `error`.
    #[must_use]
    pub fn internal(error: &(dyn std::error::Error + 'static)) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, error.to_string()).with_details(error_chain(error))
    }

    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    /// Replace the text written to the error log.
    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    #[must_use]
    pub fn details(&self) -> &str {
        &self.details
    }

    /// Render as the JSON error body used by the error handling stage.
    #[must_use]
    pub fn to_json_response(&self) -> Response {
        (self.status, Json(json!({"error": self.message}))).into_response()
    }
}

/// Response extension carrying a route failure to the error handling stage.
#[derive(Debug, Clone)]
pub struct RouteFailure(pub Arc<RouteError>);

impl IntoResponse for RouteError {
    fn into_response(self) -> Response {
        let mut response = self.status.into_response();
        response.extensions_mut().insert(RouteFailure(Arc::new(self)));
        response
    }
}

impl From<DatabaseError> for RouteError {
    fn from(error: DatabaseError) -> Self {
        let status = match &error {
            DatabaseError::Connection { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, error.to_string()).with_details(error_chain(&error))
    }
}

impl From<BlobError> for RouteError {
    fn from(error: BlobError) -> Self {
        let status = match &error {
            BlobError::NotFound(_) => StatusCode::NOT_FOUND,
            BlobError::InvalidPath { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, error.to_string()).with_details(error_chain(&error))
    }
}

fn error_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut out = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        out.push_str("\ncaused by: ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

//! Middleware for the optional pipeline stages.
//!
//! Body parsing lives in [`crate::body`]; everything else is here. Each
//! function is installed by [`crate::pipeline::Pipeline::build`] around the
//! `/api` router.

use std::any::Any;

use axum::{
    extract::{OriginalUri, Request, State},
    http::{HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use keel_core::{Authorizer, RequestMeta};
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::{debug, error};

use crate::config::ErrorSink;
use crate::error::{HostError, RouteError, RouteFailure};

// ── Identity header ──────────────────────────────────────────────────────────

/// Layer that sets `name: value` on every response, replacing any value the
/// handler set.
///
/// # Errors
/// Returns [`HostError::InvalidIdentity`] if `value` is not a valid header
/// value.
pub fn identity_layer(
    name: HeaderName,
    value: &str,
) -> Result<SetResponseHeaderLayer<HeaderValue>, HostError> {
    let value =
        HeaderValue::from_str(value).map_err(|_| HostError::InvalidIdentity(value.to_owned()))?;
    Ok(SetResponseHeaderLayer::overriding(name, value))
}

// ── Authorization ────────────────────────────────────────────────────────────

/// Evaluate the authorization predicate before calling through.
///
/// A denial is a 401 with an empty body. A predicate error is not a denial:
/// it is logged and answered with a bare 500.
pub async fn authorize(
    State(authorizer): State<Authorizer>,
    request: Request,
    next: Next,
) -> Response {
    let (parts, body) = request.into_parts();
    let meta = RequestMeta::from_parts(&parts);

    match authorizer.check(&meta).await {
        Ok(true) => next.run(Request::from_parts(parts, body)).await,
        Ok(false) => {
            debug!(method = %parts.method, uri = %parts.uri, "request not authorized");
            StatusCode::UNAUTHORIZED.into_response()
        }
        Err(e) => {
            error!(method = %parts.method, uri = %parts.uri, error = %e, "authorization check failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

// ── Development diagnostics ──────────────────────────────────────────────────

/// Log method, query parameters and headers of every request.
pub async fn log_request(request: Request, next: Next) -> Response {
    let query: Vec<(String, String)> = request
        .uri()
        .query()
        .and_then(|q| serde_urlencoded::from_str(q).ok())
        .unwrap_or_default();
    debug!(
        method = %request.method(),
        path = %request.uri().path(),
        query = ?query,
        headers = ?request.headers(),
        "incoming request"
    );
    next.run(request).await
}

// ── Error handling ───────────────────────────────────────────────────────────

/// Turn a [`RouteFailure`] attached by the routes into a logged JSON error.
///
/// The report goes to `sink` when one is configured, otherwise to the
/// `tracing` error log.
pub async fn handle_route_errors(
    State(sink): State<Option<ErrorSink>>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let uri = request
        .extensions()
        .get::<OriginalUri>()
        .map_or_else(|| request.uri().to_string(), |original| original.0.to_string());

    let mut response = next.run(request).await;
    let Some(RouteFailure(failure)) = response.extensions_mut().remove::<RouteFailure>() else {
        return response;
    };

    let report = format_report(method.as_str(), &uri, failure.details());
    match &sink {
        Some(sink) => sink(&report),
        None => error!(status = %failure.status(), "{report}"),
    }
    failure.to_json_response()
}

/// `Error in [METHOD] 'URL':` followed by a blank line and the details.
#[must_use]
pub fn format_report(method: &str, uri: &str, details: &str) -> String {
    format!("Error in [{method}] '{uri}':\n\n{details}")
}

/// Convert a handler panic into a route failure for [`handle_route_errors`].
#[allow(clippy::needless_pass_by_value)]
pub fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let message = if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else {
        "non-string panic payload".to_owned()
    };
    RouteError::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        .with_details(format!("handler panicked: {message}"))
        .into_response()
}

//! Authorization predicates and the credential adapters built on them.
//!
//! An [`Authorizer`] decides, per request, whether the request may proceed.
//! The adapters here turn a token or username/password check into an
//! [`Authorizer`] by parsing the `Authorization` header:
//!
//! - [`prefixed_token`] / [`bearer`] match `"<scheme> <token>"`.
//! - [`basic_auth`] decodes RFC 7617 Basic credentials and never fails:
//!   malformed credentials are a denial, not an error.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use base64::Engine as _;
use futures::future::{self, BoxFuture, Either, FutureExt};
use http::header::AUTHORIZATION;
use http::{HeaderMap, Method};

/// Scheme used by [`bearer`].
pub const DEFAULT_SCHEME: &str = "bearer";

/// Scheme used by [`basic_auth`].
pub const BASIC_SCHEME: &str = "basic";

/// Errors raised by an authorization check itself (not a denial).
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum AuthError {
    /// The check could not reach a decision.
    #[error("authorization check failed: {0}")]
    Check(String),

    /// An error from whatever backs the check (token store, directory, ...).
    #[error("authorization backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// The parts of a request an authorization predicate may inspect.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    method: Method,
    headers: HeaderMap,
    query: Vec<(String, String)>,
}

impl RequestMeta {
    #[must_use]
    pub fn new(method: Method, headers: HeaderMap, query: Vec<(String, String)>) -> Self {
        Self { method, headers, query }
    }

    /// Capture method, headers and decoded query pairs from request parts.
    ///
    /// A query string that fails to decode is treated as empty.
    #[must_use]
    pub fn from_parts(parts: &http::request::Parts) -> Self {
        let query = parts
            .uri
            .query()
            .map(|raw| {
                serde_urlencoded::from_str::<Vec<(String, String)>>(raw).unwrap_or_else(|e| {
                    tracing::debug!(error = %e, "ignoring undecodable query string");
                    Vec::new()
                })
            })
            .unwrap_or_default();
        Self::new(parts.method.clone(), parts.headers.clone(), query)
    }

    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    #[must_use]
    pub fn query(&self) -> &[(String, String)] {
        &self.query
    }

    /// First value of query parameter `name`.
    #[must_use]
    pub fn query_value(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Header value as text. Non-visible-ASCII values yield `None`.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

type Predicate =
    dyn Fn(&RequestMeta) -> BoxFuture<'static, Result<bool, AuthError>> + Send + Sync;

/// A shared authorization predicate.
///
/// `Ok(true)` lets the request through, `Ok(false)` denies it, `Err` means
/// the check itself broke.
#[derive(Clone)]
pub struct Authorizer(Arc<Predicate>);

impl Authorizer {
    /// Wrap an async predicate.
    ///
    /// The predicate borrows the request only synchronously; anything the
    /// returned future needs must be cloned out of it first.
    pub fn from_fn<F, Fut>(predicate: F) -> Self
    where
        F: Fn(&RequestMeta) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool, AuthError>> + Send + 'static,
    {
        Self(Arc::new(move |request: &RequestMeta| predicate(request).boxed()))
    }

    /// An authorizer that always answers `allowed`.
    #[must_use]
    pub fn constant(allowed: bool) -> Self {
        Self::from_fn(move |_| future::ready(Ok(allowed)))
    }

    /// Evaluate the predicate for `request`.
    ///
    /// # Errors
    /// Propagates any [`AuthError`] raised by the predicate.
    pub async fn check(&self, request: &RequestMeta) -> Result<bool, AuthError> {
        (self.0)(request).await
    }
}

impl fmt::Debug for Authorizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authorizer").finish_non_exhaustive()
    }
}

/// Return the token after `"<scheme> "` in the `Authorization` header.
///
/// `prefix` must already be lowercased and include the trailing space.
fn strip_scheme(headers: &HeaderMap, prefix: &str) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let head = value.get(..prefix.len())?;
    if !head.eq_ignore_ascii_case(prefix) {
        return None;
    }
    value.get(prefix.len()..).map(str::to_owned)
}

/// Build an authorizer for `Authorization: <scheme> <token>` headers.
///
/// The scheme is matched case-insensitively. A missing header or another
/// scheme denies without calling `check`. Errors from `check` propagate.
pub fn prefixed_token<F, Fut>(scheme: &str, check: F) -> Authorizer
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool, AuthError>> + Send + 'static,
{
    let prefix = format!("{} ", scheme.trim().to_ascii_lowercase());
    Authorizer::from_fn(move |request| match strip_scheme(request.headers(), &prefix) {
        Some(token) => Either::Left(check(token)),
        None => Either::Right(future::ready(Ok(false))),
    })
}

/// [`prefixed_token`] with the `bearer` scheme.
pub fn bearer<F, Fut>(check: F) -> Authorizer
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool, AuthError>> + Send + 'static,
{
    prefixed_token(DEFAULT_SCHEME, check)
}

/// Username and password carried by Basic credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Trimmed and lowercased.
    pub username: String,
    pub password: String,
}

/// Why a Basic token could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum DecodeFailure {
    #[error("credentials are not valid base64: {0}")]
    Base64(String),

    #[error("credentials are not valid UTF-8")]
    Utf8,
}

/// Decode a Basic token into [`Credentials`].
///
/// The decoded text is split on the first `:`; without one the whole text
/// is the username and the password is empty.
///
/// # Errors
/// Returns a [`DecodeFailure`] for invalid base64 or non-UTF-8 payloads.
pub fn decode_basic(token: &str) -> Result<Credentials, DecodeFailure> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(token.trim())
        .map_err(|e| DecodeFailure::Base64(e.to_string()))?;
    let text = String::from_utf8(bytes).map_err(|_| DecodeFailure::Utf8)?;
    let (username, password) = text.split_once(':').unwrap_or((text.as_str(), ""));
    Ok(Credentials {
        username: username.trim().to_lowercase(),
        password: password.to_owned(),
    })
}

/// Tagged result of a Basic credential check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Granted,
    /// Well-formed credentials that the checker rejected.
    Denied,
    /// Malformed credentials, or the checker itself failed.
    Error(String),
}

impl AuthOutcome {
    #[must_use]
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted)
    }
}

/// Decode `token` and run `check`, keeping denial and failure apart.
pub async fn basic_auth_outcome<F, Fut>(token: &str, check: &F) -> AuthOutcome
where
    F: Fn(String, String) -> Fut,
    Fut: Future<Output = Result<bool, AuthError>>,
{
    let credentials = match decode_basic(token) {
        Ok(c) => c,
        Err(e) => return AuthOutcome::Error(e.to_string()),
    };
    match check(credentials.username, credentials.password).await {
        Ok(true) => AuthOutcome::Granted,
        Ok(false) => AuthOutcome::Denied,
        Err(e) => AuthOutcome::Error(e.to_string()),
    }
}

/// Build an authorizer for `Authorization: Basic <base64>` headers.
///
/// `check` receives the normalized username and the password. Any decoding
/// problem or checker error is logged and treated as a denial.
pub fn basic_auth<F, Fut>(check: F) -> Authorizer
where
    F: Fn(String, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool, AuthError>> + Send + 'static,
{
    let check = Arc::new(check);
    prefixed_token(BASIC_SCHEME, move |token| {
        let check = Arc::clone(&check);
        async move {
            let outcome = basic_auth_outcome(&token, &*check).await;
            if let AuthOutcome::Error(reason) = &outcome {
                tracing::debug!(%reason, "basic credentials rejected");
            }
            Ok(outcome.is_granted())
        }
    })
}

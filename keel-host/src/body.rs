//! Request body parsing stage.
//!
//! Buffers JSON, url-encoded and plain-text bodies, inflates compressed
//! ones, and stores the decoded value in the request extensions as a
//! [`ParsedBody`]. The (inflated) raw bytes are re-attached so handlers can
//! still read the body themselves. Other content types pass through
//! untouched.

use std::io::Read;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{FromRequestParts, Request, State},
    http::{
        header::{CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE},
        request::Parts,
        HeaderMap, HeaderValue, StatusCode,
    },
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use flate2::read::{GzDecoder, ZlibDecoder};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use indexmap::IndexMap;
use serde_json::{json, Value};

use crate::config::BodyParserOptions;

/// A decoded request body.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedBody {
    Json(Value),
    /// Url-encoded fields in arrival order; repeated keys keep every value.
    Form(IndexMap<String, Vec<String>>),
    Text(String),
}

impl<S: Send + Sync> FromRequestParts<S> for ParsedBody {
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<ParsedBody>()
            .cloned()
            .ok_or(StatusCode::UNSUPPORTED_MEDIA_TYPE)
    }
}

/// Why a body was refused.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum BodyRejection {
    #[error("request body exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("unsupported charset \"{0}\"")]
    UnsupportedCharset(String),

    #[error("unsupported content encoding \"{0}\"")]
    UnsupportedEncoding(String),

    #[error("malformed request body: {0}")]
    Malformed(String),

    #[error("failed to read request body: {0}")]
    Read(String),
}

impl IntoResponse for BodyRejection {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::UnsupportedCharset(_) | Self::UnsupportedEncoding(_) => {
                StatusCode::UNSUPPORTED_MEDIA_TYPE
            }
            Self::Malformed(_) | Self::Read(_) => StatusCode::BAD_REQUEST,
        };
        (status, Json(json!({"error": self.to_string()}))).into_response()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyKind {
    Json,
    Form,
    Text,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Identity,
    Gzip,
    Deflate,
}

/// Middleware entry point for the body parsing stage.
pub async fn parse_body(
    State(options): State<Arc<BodyParserOptions>>,
    request: Request,
    next: Next,
) -> Response {
    match read_body(&options, request).await {
        Ok(request) => next.run(request).await,
        Err(rejection) => {
            tracing::debug!(error = %rejection, "request body rejected");
            rejection.into_response()
        }
    }
}

async fn read_body(options: &BodyParserOptions, request: Request) -> Result<Request, BodyRejection> {
    let Some((kind, charset)) = classify(request.headers()) else {
        return Ok(request);
    };
    let charset = charset.unwrap_or_else(|| options.default_charset.to_ascii_lowercase());
    if !matches!(charset.as_str(), "utf-8" | "utf8") {
        return Err(BodyRejection::UnsupportedCharset(charset));
    }
    let encoding = content_encoding(request.headers())?;
    if encoding != Encoding::Identity && !options.inflate {
        return Err(BodyRejection::UnsupportedEncoding(
            header_text(request.headers(), &CONTENT_ENCODING).unwrap_or_default(),
        ));
    }

    let (mut parts, body) = request.into_parts();
    let raw = collect_limited(body, options.limit).await?;
    let bytes = match encoding {
        Encoding::Identity => raw,
        other => Bytes::from(inflate(other, &raw, options.limit)?),
    };

    if !bytes.is_empty() {
        parts.extensions.insert(decode(kind, &bytes, options.strict)?);
    }
    parts.headers.remove(CONTENT_ENCODING);
    parts.headers.insert(CONTENT_LENGTH, HeaderValue::from(bytes.len()));
    Ok(Request::from_parts(parts, Body::from(bytes)))
}

fn header_text(headers: &HeaderMap, name: &axum::http::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_ascii_lowercase())
}

/// Body kind and declared charset, or `None` for types this stage ignores.
fn classify(headers: &HeaderMap) -> Option<(BodyKind, Option<String>)> {
    let content_type = header_text(headers, &CONTENT_TYPE)?;
    let mut params = content_type.split(';').map(str::trim);
    let essence = params.next()?;
    let kind = match essence {
        "application/json" => BodyKind::Json,
        e if e.starts_with("application/") && e.ends_with("+json") => BodyKind::Json,
        "application/x-www-form-urlencoded" => BodyKind::Form,
        "text/plain" => BodyKind::Text,
        _ => return None,
    };
    let charset = params
        .filter_map(|p| p.split_once('='))
        .find(|(k, _)| k.trim() == "charset")
        .map(|(_, v)| v.trim().trim_matches('"').to_owned());
    Some((kind, charset))
}

fn content_encoding(headers: &HeaderMap) -> Result<Encoding, BodyRejection> {
    match header_text(headers, &CONTENT_ENCODING).as_deref() {
        None | Some("" | "identity") => Ok(Encoding::Identity),
        Some("gzip" | "x-gzip") => Ok(Encoding::Gzip),
        Some("deflate") => Ok(Encoding::Deflate),
        Some(other) => Err(BodyRejection::UnsupportedEncoding(other.to_owned())),
    }
}

async fn collect_limited(body: Body, limit: usize) -> Result<Bytes, BodyRejection> {
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            Err(BodyRejection::TooLarge { limit })
        }
        Err(e) => Err(BodyRejection::Read(e.to_string())),
    }
}

fn inflate(encoding: Encoding, raw: &[u8], limit: usize) -> Result<Vec<u8>, BodyRejection> {
    let cap = u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1);
    let mut out = Vec::new();
    let read = match encoding {
        Encoding::Gzip => GzDecoder::new(raw).take(cap).read_to_end(&mut out),
        Encoding::Deflate => ZlibDecoder::new(raw).take(cap).read_to_end(&mut out),
        Encoding::Identity => return Ok(raw.to_vec()),
    };
    read.map_err(|e| BodyRejection::Malformed(format!("cannot inflate body: {e}")))?;
    if out.len() > limit {
        return Err(BodyRejection::TooLarge { limit });
    }
    Ok(out)
}

fn decode(kind: BodyKind, bytes: &[u8], strict: bool) -> Result<ParsedBody, BodyRejection> {
    match kind {
        BodyKind::Json => {
            let value: Value = serde_json::from_slice(bytes)
                .map_err(|e| BodyRejection::Malformed(e.to_string()))?;
            if strict && !(value.is_object() || value.is_array()) {
                return Err(BodyRejection::Malformed(
                    "strict mode accepts only JSON objects and arrays".to_owned(),
                ));
            }
            Ok(ParsedBody::Json(value))
        }
        BodyKind::Form => {
            let pairs: Vec<(String, String)> = serde_urlencoded::from_bytes(bytes)
                .map_err(|e| BodyRejection::Malformed(e.to_string()))?;
            let mut fields: IndexMap<String, Vec<String>> = IndexMap::new();
            for (key, value) in pairs {
                fields.entry(key).or_default().push(value);
            }
            Ok(ParsedBody::Form(fields))
        }
        BodyKind::Text => String::from_utf8(bytes.to_vec())
            .map(ParsedBody::Text)
            .map_err(|_| BodyRejection::Malformed("body is not valid UTF-8".to_owned())),
    }
}

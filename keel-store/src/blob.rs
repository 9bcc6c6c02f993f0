//! Blob storage interface and the path/content helpers shared by backends.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

use crate::BlobError;

/// Content type used when the extension is unknown.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Payload accepted by [`BlobStore::save`].
pub enum BlobData {
    Bytes(Bytes),
    Text(String),
    Stream(Pin<Box<dyn AsyncRead + Send>>),
}

impl BlobData {
    /// Buffer the payload fully.
    ///
    /// # Errors
    /// Returns [`BlobError::Io`] if reading a stream fails.
    pub async fn into_bytes(self) -> Result<Bytes, BlobError> {
        match self {
            Self::Bytes(bytes) => Ok(bytes),
            Self::Text(text) => Ok(Bytes::from(text)),
            Self::Stream(mut reader) => {
                let mut buf = Vec::new();
                reader.read_to_end(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
        }
    }
}

impl fmt::Debug for BlobData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            Self::Text(t) => f.debug_tuple("Text").field(&t.len()).finish(),
            Self::Stream(_) => f.write_str("Stream"),
        }
    }
}

impl From<Bytes> for BlobData {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<Vec<u8>> for BlobData {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(bytes))
    }
}

impl From<String> for BlobData {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for BlobData {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

/// Metadata about a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobInfo {
    /// Logical path, before any prefixing by the path resolver.
    pub path: String,
    pub size: u64,
    pub content_type: String,
    /// Base64 SHA-256 of the payload.
    pub digest: String,
    pub last_modified: DateTime<Utc>,
}

/// Maps a normalized logical path to the key stored in the backend.
pub trait PathResolver: Send + Sync {
    fn resolve(&self, path: &str) -> String;
}

impl<F> PathResolver for F
where
    F: Fn(&str) -> String + Send + Sync,
{
    fn resolve(&self, path: &str) -> String {
        self(path)
    }
}

/// Prefixes every path with the deployment tag, e.g. `prod/avatars/a.png`.
#[derive(Debug, Clone)]
pub struct EnvPrefixResolver {
    prefix: String,
}

impl EnvPrefixResolver {
    /// An empty tag falls back to `prod`.
    #[must_use]
    pub fn new(deploy_env: &str) -> Self {
        let tag = deploy_env.trim();
        let prefix = if tag.is_empty() { keel_core::DEFAULT_DEPLOY_ENV } else { tag };
        Self { prefix: prefix.to_owned() }
    }
}

impl Default for EnvPrefixResolver {
    fn default() -> Self {
        Self::new(keel_core::DEFAULT_DEPLOY_ENV)
    }
}

impl PathResolver for EnvPrefixResolver {
    fn resolve(&self, path: &str) -> String {
        format!("{}/{path}", self.prefix)
    }
}

/// Shared handle to a resolver.
pub type SharedResolver = Arc<dyn PathResolver>;

/// Trim whitespace and leading slashes; reject paths that escape the root.
///
/// # Errors
/// Returns [`BlobError::InvalidPath`] for empty paths and for `.`, `..` or
/// empty segments.
pub fn normalize_path(path: &str) -> Result<String, BlobError> {
    let trimmed = path.trim().trim_start_matches('/');
    let invalid = |reason| BlobError::InvalidPath { path: path.to_owned(), reason };
    if trimmed.is_empty() {
        return Err(invalid("path is empty"));
    }
    if trimmed.ends_with('/') {
        return Err(invalid("path names a directory"));
    }
    if trimmed.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..") {
        return Err(invalid("path contains an empty, '.' or '..' segment"));
    }
    Ok(trimmed.to_owned())
}

/// Infer a content type from the path's extension.
#[must_use]
pub fn content_type_for(path: &str) -> &'static str {
    let ext = split_name(path).2.map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("json") => "application/json",
        Some("txt") => "text/plain",
        Some("html" | "htm") => "text/html",
        Some("css") => "text/css",
        Some("csv") => "text/csv",
        Some("js") => "text/javascript",
        Some("xml") => "application/xml",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("svg") => "image/svg+xml",
        _ => DEFAULT_CONTENT_TYPE,
    }
}

/// Base64 SHA-256 of `payload`, attached to every saved object.
#[must_use]
pub fn digest(payload: &[u8]) -> String {
    let hash = Sha256::digest(payload);
    base64::engine::general_purpose::STANDARD.encode(hash)
}

/// Derive a collision-resistant sibling of `path`.
///
/// `avatars/me.png` becomes `avatars/me-<uuid>.png`: same directory, same
/// extension.
#[must_use]
pub fn unique_name(path: &str) -> String {
    let (dir, stem, ext) = split_name(path);
    let id = Uuid::new_v4().simple();
    let file = match ext {
        Some(ext) => format!("{stem}-{id}.{ext}"),
        None => format!("{stem}-{id}"),
    };
    match dir {
        Some(dir) => format!("{dir}/{file}"),
        None => file,
    }
}

/// Split into `(directory, stem, extension)`. Dotfiles have no extension.
fn split_name(path: &str) -> (Option<&str>, &str, Option<&str>) {
    let (dir, file) = match path.rsplit_once('/') {
        Some((dir, file)) => (Some(dir), file),
        None => (None, path),
    };
    match file.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (dir, stem, Some(ext)),
        _ => (dir, file, None),
    }
}

/// Object storage used by hosted services.
///
/// Paths are logical: implementations normalize them with
/// [`normalize_path`] and map them through their [`PathResolver`].
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Metadata for `path`, or `None` when nothing is stored there.
    ///
    /// # Errors
    /// Returns [`BlobError::InvalidPath`] or a backend error.
    async fn exists(&self, path: &str) -> Result<Option<BlobInfo>, BlobError>;

    /// Load the full payload at `path`.
    ///
    /// # Errors
    /// Returns [`BlobError::NotFound`] if nothing is stored at `path`.
    async fn load(&self, path: &str) -> Result<Bytes, BlobError>;

    /// Store `data` at `path`, replacing any previous object.
    ///
    /// # Errors
    /// Returns [`BlobError::InvalidPath`] or a backend error.
    async fn save(&self, path: &str, data: BlobData) -> Result<(), BlobError>;

    /// Store `data` under a fresh name derived from `path` and return it.
    ///
    /// # Errors
    /// Same as [`BlobStore::save`].
    async fn save_with_unique_name(&self, path: &str, data: BlobData) -> Result<String, BlobError> {
        let unique = unique_name(&normalize_path(path)?);
        self.save(&unique, data).await?;
        Ok(unique)
    }
}

//! Filesystem-backed [`BlobStore`].
//!
//! Objects live under `<root>/<container>/<resolved path>`; their metadata is
//! kept as JSON in a parallel `<root>/<container>/.meta/` tree so that the
//! object tree holds payloads only.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use keel_core::HostEnv;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::blob::{
    content_type_for, digest, normalize_path, BlobData, BlobInfo, BlobStore, EnvPrefixResolver,
    PathResolver, SharedResolver,
};
use crate::BlobError;

const META_DIR: &str = ".meta";

#[derive(Debug, Serialize, Deserialize)]
struct StoredMeta {
    content_type: String,
    digest: String,
}

/// Blob store rooted at a local directory.
#[derive(Clone)]
pub struct LocalBlobStore {
    container_dir: PathBuf,
    resolver: SharedResolver,
}

impl LocalBlobStore {
    /// Store under `<root>/<container>`, prefixing paths with `prod`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, container: &str) -> Self {
        Self {
            container_dir: root.into().join(container.trim()),
            resolver: Arc::new(EnvPrefixResolver::default()),
        }
    }

    /// Store configured from the environment: root, container and the
    /// deployment tag used as path prefix.
    #[must_use]
    pub fn from_env(env: &HostEnv) -> Self {
        Self::new(&env.blob_root, &env.blob_container)
            .with_resolver(EnvPrefixResolver::new(&env.deploy_env))
    }

    /// Replace the full-path resolver.
    #[must_use]
    pub fn with_resolver(mut self, resolver: impl PathResolver + 'static) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    #[must_use]
    pub fn container_dir(&self) -> &Path {
        &self.container_dir
    }

    fn locate(&self, path: &str) -> Result<(String, PathBuf, PathBuf), BlobError> {
        let logical = normalize_path(path)?;
        let key = self.resolver.resolve(&logical);
        let object = self.container_dir.join(&key);
        let meta = self.container_dir.join(META_DIR).join(format!("{key}.json"));
        Ok((logical, object, meta))
    }
}

impl std::fmt::Debug for LocalBlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBlobStore")
            .field("container_dir", &self.container_dir)
            .finish_non_exhaustive()
    }
}

async fn write_file(path: &Path, contents: &[u8]) -> Result<(), BlobError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, contents).await?;
    Ok(())
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn exists(&self, path: &str) -> Result<Option<BlobInfo>, BlobError> {
        let (logical, object, meta_path) = self.locate(path)?;
        let fs_meta = match tokio::fs::metadata(&object).await {
            Ok(m) if m.is_file() => m,
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        // Objects written outside this store have no sidecar; derive it.
        let stored = match tokio::fs::read(&meta_path).await {
            Ok(raw) => serde_json::from_slice::<StoredMeta>(&raw)?,
            Err(e) if e.kind() == ErrorKind::NotFound => StoredMeta {
                content_type: content_type_for(&logical).to_owned(),
                digest: digest(&tokio::fs::read(&object).await?),
            },
            Err(e) => return Err(e.into()),
        };

        let last_modified = fs_meta.modified().map(DateTime::<Utc>::from)?;
        Ok(Some(BlobInfo {
            path: logical,
            size: fs_meta.len(),
            content_type: stored.content_type,
            digest: stored.digest,
            last_modified,
        }))
    }

    async fn load(&self, path: &str) -> Result<Bytes, BlobError> {
        let (logical, object, _) = self.locate(path)?;
        match tokio::fs::read(&object).await {
            Ok(raw) => Ok(Bytes::from(raw)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(BlobError::NotFound(logical)),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, path: &str, data: BlobData) -> Result<(), BlobError> {
        let (logical, object, meta_path) = self.locate(path)?;
        let payload = data.into_bytes().await?;
        let meta = StoredMeta {
            content_type: content_type_for(&logical).to_owned(),
            digest: digest(&payload),
        };

        write_file(&object, &payload).await?;
        write_file(&meta_path, &serde_json::to_vec(&meta)?).await?;

        debug!(
            path = %logical,
            size = payload.len(),
            content_type = %meta.content_type,
            "blob saved"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, LocalBlobStore) {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("tempdir failed: {e}"),
        };
        let store = LocalBlobStore::new(dir.path(), "assets");
        (dir, store)
    }

    #[tokio::test]
    async fn save_then_load_returns_payload() {
        let (_dir, store) = store();
        if let Err(e) = store.save("notes/hello.txt", BlobData::from("hello")).await {
            panic!("save failed: {e}");
        }
        let loaded = match store.load(" /notes/hello.txt ").await {
            Ok(b) => b,
            Err(e) => panic!("load failed: {e}"),
        };
        assert_eq!(&loaded[..], b"hello", "trimmed path must resolve to the same object");
    }

    #[tokio::test]
    async fn save_with_unique_name_round_trips() {
        let (_dir, store) = store();
        let data = vec![0_u8, 1, 2, 254, 255];
        let saved = match store
            .save_with_unique_name("avatars/me.png", BlobData::from(data.clone()))
            .await
        {
            Ok(p) => p,
            Err(e) => panic!("save failed: {e}"),
        };
        assert_ne!(saved, "avatars/me.png", "unique path must differ from the input");
        assert!(saved.starts_with("avatars/"), "directory must be preserved: {saved}");
        assert!(saved.ends_with(".png"), "extension must be preserved: {saved}");

        let loaded = match store.load(&saved).await {
            Ok(b) => b,
            Err(e) => panic!("load failed: {e}"),
        };
        assert_eq!(loaded.to_vec(), data);
    }

    #[tokio::test]
    async fn exists_reports_metadata_and_missing_objects() {
        let (_dir, store) = store();
        assert!(matches!(store.exists("reports/q1.json").await, Ok(None)));

        if let Err(e) = store.save("reports/q1.json", BlobData::from("{}")).await {
            panic!("save failed: {e}");
        }
        let info = match store.exists("reports/q1.json").await {
            Ok(Some(info)) => info,
            other => panic!("expected blob info, got {other:?}"),
        };
        assert_eq!(info.path, "reports/q1.json");
        assert_eq!(info.size, 2);
        assert_eq!(info.content_type, "application/json");
        assert_eq!(info.digest, digest(b"{}"));
    }

    #[tokio::test]
    async fn objects_are_prefixed_with_deploy_tag() {
        let (dir, store) = store();
        let store = store.with_resolver(EnvPrefixResolver::new("staging"));
        if let Err(e) = store.save("a.bin", BlobData::from(vec![1_u8])).await {
            panic!("save failed: {e}");
        }
        assert!(dir.path().join("assets/staging/a.bin").is_file());
    }

    #[tokio::test]
    async fn custom_resolver_is_used() {
        let (dir, store) = store();
        let store = store.with_resolver(|path: &str| format!("tenant-1/{path}"));
        if let Err(e) = store.save("a.txt", BlobData::from("x")).await {
            panic!("save failed: {e}");
        }
        assert!(dir.path().join("assets/tenant-1/a.txt").is_file());
    }

    #[tokio::test]
    async fn load_missing_is_not_found() {
        let (_dir, store) = store();
        assert!(matches!(store.load("nope.txt").await, Err(BlobError::NotFound(p)) if p == "nope.txt"));
    }

    #[tokio::test]
    async fn traversal_is_rejected_before_touching_disk() {
        let (_dir, store) = store();
        let result = store.save("../escape.txt", BlobData::from("x")).await;
        assert!(matches!(result, Err(BlobError::InvalidPath { .. })));
    }
}

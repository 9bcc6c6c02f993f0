//! Routes served by the `keel-host` binary.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json,
};
use futures::FutureExt;
use keel_store::{BlobData, BlobStore, Connector, SessionManager};
use serde::Serialize;
use serde_json::json;

use crate::error::RouteError;
use crate::pipeline::{RouteRegistrar, Routes};

// ── Shared state ─────────────────────────────────────────────────────────────

type Sessions<K> = Arc<SessionManager<K>>;
type Blobs = Arc<dyn BlobStore>;

// ── Response types ───────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct DatabaseHealth {
    pub status: &'static str,
    pub database: String,
}

#[derive(Debug, Serialize)]
pub struct SavedBlob {
    pub path: String,
}

// ── Registrar ────────────────────────────────────────────────────────────────

/// Health checks plus blob upload and download under `/api`.
pub fn service_routes<K>(sessions: Sessions<K>, blobs: Blobs) -> impl RouteRegistrar
where
    K: Connector + 'static,
{
    move |routes: &mut Routes| {
        routes
            .api("/health", get(health))
            .api("/db/health", get(database_health::<K>).with_state(Arc::clone(&sessions)))
            .api(
                "/blobs/{*path}",
                get(load_blob).post(save_blob).with_state(Arc::clone(&blobs)),
            );
    }
}

// ── Handlers ─────────────────────────────────────────────────────────────────

/// `GET /api/health`: Liveness check.
pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"status": "ok"})))
}

/// `GET /api/db/health`: Open a session, ping it, close it.
///
/// # Errors
/// Returns 503 if the database cannot be reached.
pub async fn database_health<K: Connector + 'static>(
    State(sessions): State<Sessions<K>>,
) -> Result<Json<DatabaseHealth>, RouteError> {
    let pinger = Arc::clone(&sessions);
    let database = sessions
        .with_database::<_, RouteError, _>(None, |session| {
            async move {
                let options = session.options().clone();
                pinger.connector().ping(&options, session.connection()).await?;
                Ok(options.database)
            }
            .boxed()
        })
        .await?;
    Ok(Json(DatabaseHealth { status: "ok", database }))
}

/// `GET /api/blobs/{*path}`: Download a blob with its stored content type.
///
/// # Errors
/// Returns 404 if the blob does not exist, 400 for an invalid path.
pub async fn load_blob(
    State(blobs): State<Blobs>,
    Path(path): Path<String>,
) -> Result<impl IntoResponse, RouteError> {
    let Some(info) = blobs.exists(&path).await? else {
        return Err(RouteError::not_found(format!("blob '{path}' not found")));
    };
    let payload = blobs.load(&path).await?;
    Ok(([(header::CONTENT_TYPE, info.content_type)], payload))
}

/// `POST /api/blobs/{*path}`: Store the raw body under a unique name.
///
/// # Errors
/// Returns 400 for an invalid path or an empty body.
pub async fn save_blob(
    State(blobs): State<Blobs>,
    Path(path): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, RouteError> {
    if body.is_empty() {
        return Err(RouteError::bad_request("blob body is empty"));
    }
    let path = blobs.save_with_unique_name(&path, BlobData::from(body)).await?;
    Ok((StatusCode::CREATED, Json(SavedBlob { path })))
}

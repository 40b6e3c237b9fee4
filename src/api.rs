//! HTTP sync API.
//!
//! The primary serves `/prepare_diff` and `/diff`; a replica serves
//! `/sync` (and calls its configured primary); both serve `/cleanup`.
//! Patches are cached under `<basedir>/booster/<fingerprint>`, where
//! the fingerprint is the SHA-512 of the sorted old and new path
//! listings joined by six forward slashes. Concurrent requests for the
//! same fingerprint build the patch at most once.

use std::collections::HashMap;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Form, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio_util::io::ReaderStream;
use tracing::{error, info};

use crate::container::AcceptListFilter;
use crate::error::{BoosterError, Result};
use crate::fileset::FileSet;
use crate::patch::{apply, create_patch};
use crate::recompress::{clean, decompress_walking, recompress_all_in, CACHE_DIR};

/// Shared state of the HTTP API.
pub struct ApiState {
    basedir: PathBuf,
    primary: Option<Url>,
    client: reqwest::Client,
    /// Per-fingerprint build locks: the second concurrent
    /// `/prepare_diff` for a fingerprint waits instead of rebuilding.
    build_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ApiState {
    /// Build API state for `basedir`, optionally configured as a
    /// replica of `primary`.
    ///
    /// # Errors
    ///
    /// Fails if the primary URL does not parse.
    pub fn new<P: Into<PathBuf>>(basedir: P, primary: Option<&str>) -> Result<Self> {
        let primary = match primary {
            None | Some("") => None,
            Some(raw) => {
                // A trailing slash makes Url::join append instead of
                // replacing the last path segment.
                let normalized = if raw.ends_with('/') {
                    raw.to_string()
                } else {
                    format!("{raw}/")
                };
                Some(
                    Url::parse(&normalized)
                        .map_err(|e| BoosterError::Validation(format!("primary URL: {e}")))?,
                )
            }
        };
        Ok(Self {
            basedir: basedir.into(),
            primary,
            client: reqwest::Client::new(),
            build_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Directory holding cached patches.
    #[must_use]
    pub fn cache_dir(&self) -> PathBuf {
        self.basedir.join(CACHE_DIR)
    }

    fn staging_parent() -> PathBuf {
        std::env::temp_dir().join(CACHE_DIR).join("staging")
    }
}

/// Compute the diff fingerprint over two sorted path listings.
#[must_use]
pub fn fingerprint(old: &[String], new: &[String]) -> String {
    let mut hasher = Sha512::new();
    for file in old {
        hasher.update(file.as_bytes());
    }
    hasher.update(b"//////");
    for file in new {
        hasher.update(file.as_bytes());
    }
    hex::encode(hasher.finalize())
}

fn valid_fingerprint(hash: &str) -> bool {
    hash.len() == 128
        && hash
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Outcome of a `/prepare_diff` computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareOutcome {
    /// Fingerprint of the cached patch.
    pub hash: String,
    /// False when the patch was already cached.
    pub built: bool,
}

/// Body of `/prepare_diff` and of the primary's response to it.
#[derive(Debug, Serialize, Deserialize)]
pub struct DiffHash {
    /// Patch fingerprint, 128 lowercase hex characters.
    #[serde(rename = "Hash")]
    pub hash: String,
}

#[derive(Debug, Deserialize)]
struct PrepareDiffForm {
    #[serde(default)]
    old: String,
}

#[derive(Debug, Deserialize)]
struct DiffQuery {
    hash: String,
}

/// Body of the `/sync` response.
#[derive(Debug, Serialize, Deserialize)]
pub struct SyncReport {
    /// Patch bytes transferred, in whole MiB.
    #[serde(rename = "TransferredMB")]
    pub transferred_mb: u64,
}

/// Compute (or fetch from cache) the patch between the caller's old
/// path listing and this tree's decompressed view.
///
/// # Errors
///
/// Fails on decompression-walk, patch-computation, or cache I/O
/// errors. No cache entry is left behind on failure.
pub async fn prepare_diff_op(state: &ApiState, old_list: &str) -> Result<PrepareOutcome> {
    let basedir = state.basedir.clone();
    let new_view = run_blocking({
        let basedir = basedir.clone();
        move || decompress_walking(&basedir)
    })
    .await?;

    let mut old_view = FileSet::new(&basedir);
    for line in old_list.split('\n').filter(|l| !l.is_empty()) {
        old_view.add(line);
    }

    let hash = fingerprint(&old_view.sorted(), &new_view.sorted());
    let cache_path = state.cache_dir().join(&hash);
    if cache_path.exists() {
        return Ok(PrepareOutcome { hash, built: false });
    }

    let lock = {
        let mut locks = state.build_locks.lock().await;
        locks.entry(hash.clone()).or_default().clone()
    };
    let _guard = lock.lock().await;
    if cache_path.exists() {
        return Ok(PrepareOutcome { hash, built: false });
    }

    let cache_dir = state.cache_dir();
    run_blocking(move || {
        std::fs::create_dir_all(&cache_dir)?;
        let mut staged = tempfile::NamedTempFile::new_in(&cache_dir)?;
        create_patch(
            &basedir,
            &AcceptListFilter::new(&old_view),
            &basedir,
            &AcceptListFilter::new(&new_view),
            staged.as_file_mut(),
        )?;
        staged.as_file_mut().flush()?;
        staged
            .persist(&cache_path)
            .map_err(|e| BoosterError::Io(e.error))?;
        Ok(())
    })
    .await?;

    Ok(PrepareOutcome { hash, built: true })
}

/// Replica sync: negotiate a patch with the primary, apply it through
/// staging, and re-gzip the tree. Returns the patch size in bytes.
///
/// # Errors
///
/// Fails on transport, apply, or recompression errors; a failed apply
/// leaves the local tree untouched.
pub async fn sync_op(state: &ApiState) -> Result<u64> {
    let primary = state.primary.as_ref().ok_or(BoosterError::NoPrimary)?;

    let basedir = state.basedir.clone();
    let view = run_blocking({
        let basedir = basedir.clone();
        move || decompress_walking(&basedir)
    })
    .await?;
    let old = view.sorted().join("\n");

    let prepare_url = primary
        .join("prepare_diff")
        .map_err(|e| BoosterError::Validation(format!("primary URL: {e}")))?;
    let response = state
        .client
        .post(prepare_url)
        .form(&[("old", old.as_str())])
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(BoosterError::BadResponse(format!(
            "prepare_diff returned {}",
            response.status()
        )));
    }
    let DiffHash { hash } = response
        .json()
        .await
        .map_err(|e| BoosterError::BadResponse(format!("prepare_diff body: {e}")))?;
    if !valid_fingerprint(&hash) {
        return Err(BoosterError::BadResponse(format!(
            "primary sent malformed hash {hash}"
        )));
    }

    let diff_url = primary
        .join("diff")
        .map_err(|e| BoosterError::Validation(format!("primary URL: {e}")))?;
    let mut download = state
        .client
        .get(diff_url)
        .query(&[("hash", hash.as_str())])
        .send()
        .await?;
    if !download.status().is_success() {
        return Err(BoosterError::BadResponse(format!(
            "diff returned {}",
            download.status()
        )));
    }

    let staging_parent = ApiState::staging_parent();
    tokio::fs::create_dir_all(&staging_parent).await?;
    let patch_path = staging_parent.join(format!("download-{hash}"));
    let mut patch_file = tokio::fs::File::create(&patch_path).await?;
    while let Some(chunk) = download.chunk().await? {
        patch_file.write_all(&chunk).await?;
    }
    patch_file.flush().await?;
    drop(patch_file);

    let transferred = run_blocking({
        let basedir = basedir.clone();
        let patch_path = patch_path.clone();
        move || {
            let patch = std::fs::File::open(&patch_path)?;
            let size = apply(
                io::BufReader::new(patch),
                &basedir,
                &ApiState::staging_parent(),
            )?;
            recompress_all_in(&basedir)?;
            Ok(size)
        }
    })
    .await;
    let _ = tokio::fs::remove_file(&patch_path).await;
    let transferred = transferred?;

    info!(transferred, "sync complete");
    Ok(transferred)
}

/// Delete the patch cache and every decompressed sibling.
///
/// # Errors
///
/// Fails on filesystem errors.
pub async fn cleanup_op(state: &ApiState) -> Result<()> {
    let cache = state.cache_dir();
    let basedir = state.basedir.clone();
    run_blocking(move || {
        match std::fs::remove_dir_all(&cache) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        clean(&basedir)
    })
    .await
}

async fn run_blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| BoosterError::Io(io::Error::other(e)))?
}

/// Build the API router over shared state.
#[must_use]
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/prepare_diff", post(prepare_diff_handler))
        .route("/diff", get(diff_handler))
        .route("/sync", post(sync_handler).get(sync_handler))
        .route("/cleanup", post(cleanup_handler).get(cleanup_handler))
        .with_state(state)
}

/// Bind and serve the API on `port`.
///
/// # Errors
///
/// Fails if the socket cannot be bound or the server dies.
pub async fn serve(basedir: PathBuf, port: u16, primary: Option<&str>) -> Result<()> {
    let state = Arc::new(ApiState::new(basedir, primary)?);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn prepare_diff_handler(
    State(state): State<Arc<ApiState>>,
    Form(form): Form<PrepareDiffForm>,
) -> std::result::Result<Json<DiffHash>, ApiError> {
    let outcome = prepare_diff_op(&state, &form.old).await?;
    Ok(Json(DiffHash { hash: outcome.hash }))
}

async fn diff_handler(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<DiffQuery>,
) -> std::result::Result<Response, ApiError> {
    if !valid_fingerprint(&query.hash) {
        return Err(BoosterError::Validation(format!("bad hash {}", query.hash)).into());
    }

    let path = state.cache_dir().join(&query.hash);
    match tokio::fs::File::open(&path).await {
        Ok(file) => Ok(Body::from_stream(ReaderStream::new(file)).into_response()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            Ok(StatusCode::NOT_FOUND.into_response())
        }
        Err(err) => Err(BoosterError::Io(err).into()),
    }
}

async fn sync_handler(
    State(state): State<Arc<ApiState>>,
) -> std::result::Result<Json<SyncReport>, ApiError> {
    let transferred = sync_op(&state).await?;
    Ok(Json(SyncReport {
        transferred_mb: transferred / 1024 / 1024,
    }))
}

async fn cleanup_handler(
    State(state): State<Arc<ApiState>>,
) -> std::result::Result<StatusCode, ApiError> {
    cleanup_op(&state).await?;
    Ok(StatusCode::OK)
}

/// Handler-boundary error: logs the full chain once and renders the
/// outermost message as a plain-text 500 body.
struct ApiError(BoosterError);

impl From<BoosterError> for ApiError {
    fn from(err: BoosterError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut chain = self.0.to_string();
        let mut source = std::error::Error::source(&self.0);
        while let Some(err) = source {
            chain.push_str(": ");
            chain.push_str(&err.to_string());
            source = err.source();
        }
        error!(error = %chain, "request failed");

        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Unexpected error: {}\n", self.0),
        )
            .into_response()
    }
}

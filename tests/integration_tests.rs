//! Integration tests for booster.

use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use booster::api::{self, prepare_diff_op, sync_op, ApiState};
use booster::recompress::{self, SUFFIX};
use booster::{apply, create_patch, AcceptListFilter, KeepAll, BLOCK_SIZE};

/// Deterministic pseudo-random bytes; incompressible enough to stand
/// in for encrypted or already-compressed payloads.
fn noise(len: usize, mut seed: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    for _ in 0..len {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        out.push((seed >> 33) as u8);
    }
    out
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    recompress::compress(&mut std::io::Cursor::new(data), &mut out).unwrap();
    out
}

/// The registry view of a tree: every regular file except decompressed
/// siblings and the patch cache, with contents.
fn registry_view(root: &Path) -> Vec<(String, Vec<u8>)> {
    let mut result = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for item in fs::read_dir(&dir).unwrap() {
            let item = item.unwrap();
            let path = item.path();
            let name = path.strip_prefix(root).unwrap().to_str().unwrap().to_string();
            if item.file_type().unwrap().is_dir() {
                if name != "booster" {
                    stack.push(path);
                }
            } else if !name.ends_with(SUFFIX) {
                result.push((name, fs::read(&path).unwrap()));
            }
        }
    }
    result.sort();
    result
}

async fn spawn_api(state: Arc<ApiState>) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, api::router(state)).await.unwrap();
    });
    addr
}

// =============================================================================
// TREE PATCH ROUND TRIPS
// =============================================================================

#[test]
fn patch_round_trip_over_decompressed_view() {
    let payload = noise(512 * 1024, 7);

    let old_dir = TempDir::new().unwrap();
    let new_dir = TempDir::new().unwrap();
    fs::write(old_dir.path().join("layer.gz"), gzip(&payload)).unwrap();
    let mut grown = payload.clone();
    grown.extend_from_slice(&noise(64 * 1024, 11));
    fs::write(new_dir.path().join("layer.gz"), gzip(&grown)).unwrap();

    // Decompress both sides, diff the decompressed views.
    let old_view = recompress::decompress_walking(old_dir.path()).unwrap();
    let new_view = recompress::decompress_walking(new_dir.path()).unwrap();

    let mut patch = Vec::new();
    create_patch(
        old_dir.path(),
        &AcceptListFilter::new(&old_view),
        new_dir.path(),
        &AcceptListFilter::new(&new_view),
        &mut patch,
    )
    .unwrap();

    // The shared 512 KiB travels as block copies, not literals.
    assert!(
        patch.len() < 128 * 1024,
        "patch of {} bytes should be dominated by the 64 KiB of new data",
        patch.len()
    );

    let scratch = TempDir::new().unwrap();
    apply(&patch[..], old_dir.path(), scratch.path()).unwrap();

    // Drop stale originals (as the recompression pass would recreate
    // them) and re-gzip.
    fs::remove_file(old_dir.path().join("layer.gz")).unwrap();
    recompress::recompress_all_in(old_dir.path()).unwrap();

    assert_eq!(
        fs::read(old_dir.path().join("layer.gz")).unwrap(),
        fs::read(new_dir.path().join("layer.gz")).unwrap()
    );
}

#[test]
fn patch_across_many_small_files() {
    let old_dir = TempDir::new().unwrap();
    let new_dir = TempDir::new().unwrap();

    for i in 0..20 {
        let content = noise(BLOCK_SIZE / 2, i);
        fs::write(old_dir.path().join(format!("f{i:02}")), &content).unwrap();
        fs::write(new_dir.path().join(format!("f{i:02}")), &content).unwrap();
    }
    fs::write(new_dir.path().join("extra"), b"appended file").unwrap();
    fs::remove_file(new_dir.path().join("f07")).unwrap();

    let mut patch = Vec::new();
    create_patch(old_dir.path(), &KeepAll, new_dir.path(), &KeepAll, &mut patch).unwrap();

    let scratch = TempDir::new().unwrap();
    apply(&patch[..], old_dir.path(), scratch.path()).unwrap();

    assert_eq!(registry_view(old_dir.path()), registry_view(new_dir.path()));
}

// =============================================================================
// PREPARE_DIFF CACHE
// =============================================================================

#[tokio::test]
async fn prepare_diff_caches_by_fingerprint() {
    let base = TempDir::new().unwrap();
    fs::write(base.path().join("a"), noise(BLOCK_SIZE, 1)).unwrap();
    let state = ApiState::new(base.path(), None).unwrap();

    let first = prepare_diff_op(&state, "a").await.unwrap();
    assert!(first.built);
    assert!(state.cache_dir().join(&first.hash).exists());

    let second = prepare_diff_op(&state, "a").await.unwrap();
    assert!(!second.built);
    assert_eq!(first.hash, second.hash);
}

#[tokio::test]
async fn prepare_diff_concurrent_builds_once() {
    let base = TempDir::new().unwrap();
    fs::write(base.path().join("a"), noise(4 * BLOCK_SIZE, 2)).unwrap();
    let state = Arc::new(ApiState::new(base.path(), None).unwrap());

    let (r1, r2) = tokio::join!(
        prepare_diff_op(&state, "a"),
        prepare_diff_op(&state, "a"),
    );
    let (r1, r2) = (r1.unwrap(), r2.unwrap());

    assert_eq!(r1.hash, r2.hash);
    assert_eq!(
        u8::from(r1.built) + u8::from(r2.built),
        1,
        "exactly one of two concurrent requests must build the patch"
    );
}

#[tokio::test]
async fn prepare_diff_bytes_are_deterministic() {
    let base = TempDir::new().unwrap();
    fs::write(base.path().join("a"), noise(3 * BLOCK_SIZE, 3)).unwrap();
    let state = ApiState::new(base.path(), None).unwrap();

    let first = prepare_diff_op(&state, "a").await.unwrap();
    let bytes_1 = fs::read(state.cache_dir().join(&first.hash)).unwrap();

    fs::remove_file(state.cache_dir().join(&first.hash)).unwrap();
    let second = prepare_diff_op(&state, "a").await.unwrap();
    assert!(second.built);
    let bytes_2 = fs::read(state.cache_dir().join(&second.hash)).unwrap();

    assert_eq!(bytes_1, bytes_2);
}

// =============================================================================
// END-TO-END SYNC
// =============================================================================

#[tokio::test]
async fn sync_end_to_end() {
    // Shared content: `new.gz` on the primary overlaps `old.gz` (on
    // both sides) by 896 KiB of uncompressed payload.
    let shared = noise(896 * 1024, 42);
    let mut newer = shared.clone();
    newer.extend_from_slice(&noise(128 * 1024, 43));

    let primary_dir = TempDir::new().unwrap();
    fs::write(primary_dir.path().join("a"), b"metadata a").unwrap();
    fs::write(primary_dir.path().join("b"), b"metadata b").unwrap();
    fs::write(primary_dir.path().join("old.gz"), gzip(&shared)).unwrap();
    fs::write(primary_dir.path().join("new.gz"), gzip(&newer)).unwrap();

    let replica_dir = TempDir::new().unwrap();
    fs::write(replica_dir.path().join("a"), b"metadata a").unwrap();
    fs::write(replica_dir.path().join("b"), b"metadata b").unwrap();
    fs::write(replica_dir.path().join("old.gz"), gzip(&shared)).unwrap();

    let primary_state = Arc::new(ApiState::new(primary_dir.path(), None).unwrap());
    let addr = spawn_api(primary_state).await;

    let replica_state =
        ApiState::new(replica_dir.path(), Some(&format!("http://{addr}"))).unwrap();
    let transferred = sync_op(&replica_state).await.unwrap();

    // The 896 KiB of shared payload must not travel.
    assert!(
        transferred < 300 * 1024,
        "transferred {transferred} bytes, expected roughly the new 128 KiB"
    );
    assert_eq!(
        registry_view(replica_dir.path()),
        registry_view(primary_dir.path())
    );
    assert_eq!(
        fs::read(replica_dir.path().join("new.gz")).unwrap(),
        fs::read(primary_dir.path().join("new.gz")).unwrap()
    );
}

#[tokio::test]
async fn sync_is_idempotent() {
    let payload = noise(256 * 1024, 5);

    let primary_dir = TempDir::new().unwrap();
    fs::write(primary_dir.path().join("layer.gz"), gzip(&payload)).unwrap();
    let replica_dir = TempDir::new().unwrap();

    let primary_state = Arc::new(ApiState::new(primary_dir.path(), None).unwrap());
    let addr = spawn_api(primary_state).await;
    let replica_state =
        ApiState::new(replica_dir.path(), Some(&format!("http://{addr}"))).unwrap();

    sync_op(&replica_state).await.unwrap();
    let after_first = registry_view(replica_dir.path());
    assert_eq!(after_first, registry_view(primary_dir.path()));

    sync_op(&replica_state).await.unwrap();
    assert_eq!(registry_view(replica_dir.path()), after_first);
}

// =============================================================================
// HTTP SURFACE
// =============================================================================

#[tokio::test]
async fn diff_endpoint_validates_and_404s() {
    let base = TempDir::new().unwrap();
    let state = Arc::new(ApiState::new(base.path(), None).unwrap());
    let addr = spawn_api(state).await;
    let client = reqwest::Client::new();

    // Malformed fingerprints are rejected outright.
    let response = client
        .get(format!("http://{addr}/diff"))
        .query(&[("hash", "nope")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 500);
    let body = response.text().await.unwrap();
    assert!(body.starts_with("Unexpected error: "));

    // Well-formed but unknown fingerprints are a 404.
    let response = client
        .get(format!("http://{addr}/diff"))
        .query(&[("hash", "0123456789abcdef".repeat(8))])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn cleanup_removes_cache_and_siblings() {
    let base = TempDir::new().unwrap();
    fs::write(base.path().join("layer.gz"), gzip(&noise(64 * 1024, 9))).unwrap();
    let state = Arc::new(ApiState::new(base.path(), None).unwrap());

    // Populate cache and siblings.
    prepare_diff_op(&state, "").await.unwrap();
    assert!(state.cache_dir().exists());
    assert!(base.path().join(format!("layer.gz{SUFFIX}")).exists());

    let addr = spawn_api(state.clone()).await;
    let response = reqwest::Client::new()
        .post(format!("http://{addr}/cleanup"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    assert!(!state.cache_dir().exists());
    assert!(!base.path().join(format!("layer.gz{SUFFIX}")).exists());
    assert!(base.path().join("layer.gz").exists());
}

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{open_cache, sha_of, MemorySource};
use lifecycle_engine::{EngineError, ResolveRequest};

const URI: &str = "https://models.example/a.bin";

fn tmp_is_empty(cache_dir: &std::path::Path) -> bool {
    std::fs::read_dir(cache_dir.join("tmp")).unwrap().next().is_none()
}

#[tokio::test]
async fn concurrent_resolves_share_one_fetch() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(MemorySource::new());
    source.put(URI, b"shared weights");
    source.set_delay(Duration::from_millis(100));
    let cache = open_cache(dir.path(), 1 << 20, source.clone());

    let mut tasks = Vec::new();
    for _ in 0..12 {
        let cache = cache.clone();
        tasks.push(tokio::spawn(async move {
            cache.resolve(ResolveRequest::new(URI).expect(Some(sha_of(b"shared weights")), None)).await
        }));
    }
    let mut results = Vec::new();
    for t in tasks { results.push(t.await.unwrap().unwrap()); }

    assert_eq!(source.opens(), 1);
    let first = &results[0];
    assert_eq!(first.sha256, sha_of(b"shared weights"));
    for r in &results {
        assert_eq!(r.sha256, first.sha256);
        assert_eq!(r.local_path, first.local_path);
    }
    assert_eq!(cache.stats().in_flight, 0);
}

#[tokio::test]
async fn checksum_mismatch_installs_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(MemorySource::new());
    source.put(URI, b"tampered bytes");
    let cache = open_cache(dir.path(), 1 << 20, source.clone());

    let expected = sha_of(b"genuine bytes");
    let err = cache.resolve(ResolveRequest::new(URI).expect(Some(expected.clone()), None)).await.unwrap_err();
    match &err {
        EngineError::IntegrityMismatch { expected_sha256, actual_sha256, actual_size, .. } => {
            assert_eq!(expected_sha256.as_deref(), Some(expected.as_str()));
            assert_eq!(actual_sha256, &sha_of(b"tampered bytes"));
            assert_eq!(*actual_size, 14);
        }
        other => panic!("expected IntegrityMismatch, got {other:?}"),
    }
    assert!(!err.is_retryable());
    assert_eq!(source.opens(), 1, "integrity failures are not retried");
    assert!(!cache.object_path(&expected).exists());
    assert!(!cache.object_path(&sha_of(b"tampered bytes")).exists());
    assert!(tmp_is_empty(dir.path()));
    assert_eq!(cache.stats().entries, 0);
}

#[tokio::test]
async fn size_mismatch_is_an_integrity_error() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(MemorySource::new());
    source.put(URI, b"12345");
    let cache = open_cache(dir.path(), 1 << 20, source);
    let err = cache.resolve(ResolveRequest::new(URI).expect(None, Some(6))).await.unwrap_err();
    assert!(matches!(err, EngineError::IntegrityMismatch { expected_size: Some(6), actual_size: 5, .. }));
}

#[tokio::test]
async fn second_resolve_is_served_from_cache() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(MemorySource::new());
    source.put(URI, b"weights");
    let cache = open_cache(dir.path(), 1 << 20, source.clone());

    let first = cache.resolve(ResolveRequest::new(URI).expect(Some(sha_of(b"weights")), Some(7))).await.unwrap();
    assert!(!first.cached);
    let second = cache.resolve(ResolveRequest::new(URI).expect(Some(sha_of(b"weights")), Some(7))).await.unwrap();
    assert!(second.cached);
    // no expected checksum: the reference mapping still hits
    let third = cache.resolve(ResolveRequest::new(URI)).await.unwrap();
    assert!(third.cached);
    assert_eq!(source.opens(), 1);
    assert_eq!(second.local_path, first.local_path);
    assert_eq!(second.size_bytes, 7);
}

#[tokio::test]
async fn corrupted_object_is_reverified_and_refetched() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(MemorySource::new());
    source.put(URI, b"original content");
    let cache = open_cache(dir.path(), 1 << 20, source.clone());
    let first = cache.resolve(ResolveRequest::new(URI)).await.unwrap();

    std::fs::write(&first.local_path, b"bitrot").unwrap();
    let again = cache.resolve(ResolveRequest::new(URI)).await.unwrap();
    assert!(!again.cached);
    assert_eq!(std::fs::read(&again.local_path).unwrap(), b"original content");
    assert_eq!(source.opens(), 2);

    std::fs::remove_file(&again.local_path).unwrap();
    let third = cache.resolve(ResolveRequest::new(URI)).await.unwrap();
    assert!(!third.cached);
    assert_eq!(source.opens(), 3);
}

#[tokio::test]
async fn eviction_skips_pinned_entries() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(MemorySource::new());
    let uri = |name: char| format!("https://models.example/{name}.bin");
    for name in ['a', 'b', 'c', 'e'] {
        source.put(&uri(name), &[name as u8; 40]);
    }
    let cache = open_cache(dir.path(), 100, source.clone());

    let a = cache.resolve(ResolveRequest::new(uri('a'))).await.unwrap();
    let (b, pin_b) = cache.resolve_pinned(ResolveRequest::new(uri('b'))).await.unwrap();
    assert!(cache.is_pinned(&b.sha256));

    // 40 + 40 + 40 > 100: a is the least recently resolved unpinned entry
    let c = cache.resolve(ResolveRequest::new(uri('c'))).await.unwrap();
    assert!(!a.local_path.exists());
    assert!(b.local_path.exists());
    assert!(c.local_path.exists());
    assert_eq!(cache.stats().used_bytes, 80);

    let (_, pin_c) = cache.resolve_pinned(ResolveRequest::new(uri('c'))).await.unwrap();
    let err = cache.resolve(ResolveRequest::new(uri('e'))).await.unwrap_err();
    assert!(matches!(err, EngineError::CacheStorageError { .. }));
    assert!(b.local_path.exists() && c.local_path.exists());
    assert!(tmp_is_empty(dir.path()));

    drop(pin_b);
    drop(pin_c);
    let e = cache.resolve(ResolveRequest::new(uri('e'))).await.unwrap();
    assert!(e.local_path.exists());
    assert!(!b.local_path.exists(), "b was resolved before c and is evicted first");
    assert!(cache.stats().used_bytes <= 100);
}

#[tokio::test]
async fn oversized_artifact_is_a_storage_error() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(MemorySource::new());
    source.put(URI, &[0u8; 64]);
    let cache = open_cache(dir.path(), 32, source);
    let err = cache.resolve(ResolveRequest::new(URI)).await.unwrap_err();
    assert!(matches!(err, EngineError::CacheStorageError { .. }));
    assert!(tmp_is_empty(dir.path()));
}

#[tokio::test]
async fn transient_failures_retry_with_a_bound() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(MemorySource::new());
    source.put(URI, b"eventually");
    let cache = open_cache(dir.path(), 1 << 20, source.clone());

    source.fail_next(2);
    cache.resolve(ResolveRequest::new(URI)).await.unwrap();
    assert_eq!(source.opens(), 3);

    let other = "https://models.example/flaky.bin";
    source.put(other, b"never arrives");
    source.fail_next(10);
    let err = cache.resolve(ResolveRequest::new(other)).await.unwrap_err();
    assert!(matches!(err, EngineError::FetchFailed { attempts: 3, retryable: true, .. }));
    assert_eq!(source.opens(), 6);
}

#[tokio::test]
async fn missing_remote_is_not_retried() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(MemorySource::new());
    let cache = open_cache(dir.path(), 1 << 20, source.clone());
    let err = cache.resolve(ResolveRequest::new("https://models.example/missing.bin")).await.unwrap_err();
    assert!(matches!(err, EngineError::FetchFailed { retryable: false, .. }));
    assert_eq!(source.opens(), 1);
}

#[tokio::test]
async fn timed_out_fetch_releases_the_uri() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(MemorySource::new());
    source.put(URI, b"slow bytes");
    source.set_delay(Duration::from_millis(500));
    let cache = open_cache(dir.path(), 1 << 20, source.clone());

    let err = cache.resolve(ResolveRequest::new(URI).with_timeout(Duration::from_millis(50))).await.unwrap_err();
    assert!(matches!(err, EngineError::Timeout { .. }));
    assert_eq!(cache.stats().entries, 0);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(tmp_is_empty(dir.path()));

    source.set_delay(Duration::ZERO);
    let ok = cache.resolve(ResolveRequest::new(URI)).await.unwrap();
    assert!(!ok.cached);
}

#[tokio::test]
async fn remote_object_store_reference_needs_fingerprint() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open_cache(dir.path(), 1 << 20, Arc::new(MemorySource::new()));
    let err = cache.resolve(ResolveRequest::new("s3://models/onyx.bin").expect(Some(sha_of(b"x")), None)).await.unwrap_err();
    assert!(matches!(err, EngineError::BadRequest { .. }));
}

#[tokio::test]
async fn followers_do_not_inherit_a_leaders_expectation() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(MemorySource::new());
    source.put(URI, b"weights");
    source.set_delay(Duration::from_millis(100));
    let cache = open_cache(dir.path(), 1 << 20, source.clone());

    let wrong = sha_of(b"wrong");
    let leader = {
        let cache = cache.clone();
        let wrong = wrong.clone();
        tokio::spawn(async move { cache.resolve(ResolveRequest::new(URI).expect(Some(wrong), None)).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let unchecked = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.resolve(ResolveRequest::new(URI)).await })
    };
    let checked = cache.resolve(ResolveRequest::new(URI).expect(Some(sha_of(b"weights")), Some(7))).await.unwrap();

    match leader.await.unwrap() {
        Err(EngineError::IntegrityMismatch { expected_sha256, .. }) => assert_eq!(expected_sha256, Some(wrong)),
        other => panic!("expected IntegrityMismatch for the leader, got {other:?}"),
    }
    let unchecked = unchecked.await.unwrap().unwrap();
    assert_eq!(unchecked.sha256, sha_of(b"weights"));
    assert_eq!(checked.sha256, sha_of(b"weights"));
    assert_eq!(std::fs::read(&checked.local_path).unwrap(), b"weights");
    assert_eq!(cache.stats().in_flight, 0);
}

#[tokio::test]
async fn overlong_download_is_cut_at_the_expected_size() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(MemorySource::new());
    source.put_endless(URI);
    let cache = open_cache(dir.path(), 1 << 20, source.clone());

    let resolve = cache.resolve(ResolveRequest::new(URI).expect(None, Some(20)));
    let err = tokio::time::timeout(Duration::from_secs(2), resolve).await.expect("stream was not cut off").unwrap_err();
    assert!(matches!(err, EngineError::IntegrityMismatch { expected_size: Some(20), actual_size: 24, .. }));
    assert_eq!(source.opens(), 1);
    assert!(tmp_is_empty(dir.path()));
    assert_eq!(cache.stats().entries, 0);
}

#[tokio::test]
async fn unbounded_download_stops_at_the_cache_budget() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(MemorySource::new());
    source.put_endless(URI);
    let cache = open_cache(dir.path(), 64, source.clone());

    let resolve = cache.resolve(ResolveRequest::new(URI));
    let err = tokio::time::timeout(Duration::from_secs(2), resolve).await.expect("stream was not cut off").unwrap_err();
    assert!(matches!(err, EngineError::CacheStorageError { .. }));
    assert!(tmp_is_empty(dir.path()));
    assert_eq!(cache.stats().reserved_bytes, 0);
}

//! End-to-end tests of the resource read path.

mod common;

use axum::http::Method;
use common::fixtures::{artifact_fixture, gzip, hashes_of, mock_resource, tar_fixture};
use common::{TestServer, body_bytes};
use depot_core::{ResourceKey, TreeHash};
use httpmock::Method::{GET, HEAD};
use httpmock::MockServer;

#[tokio::test]
async fn miss_fetches_from_single_upstream() {
    let upstream = MockServer::start();
    let (key, gz) = artifact_fixture(b"first artifact payload").await;
    mock_resource(&upstream, &key, &gz);

    let server = TestServer::new(vec![upstream.base_url()]);
    let response = server.request(Method::GET, &key.to_string(), &[]).await;

    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["content-type"], "application/x-tar");
    assert_eq!(response.headers()["content-encoding"], "gzip");
    assert_eq!(response.headers()["content-length"], gz.len().to_string());
    assert_eq!(body_bytes(response).await, gz);

    server.wait_until(|state| state.cache.contains(&key)).await;
    assert_eq!(server.state.cache.entry_count(), 1);
    assert_eq!(server.state.cache.resident_bytes(), gz.len() as u64);
    assert_eq!(server.state.coordinator.fetch_failures(), 0);
}

#[tokio::test]
async fn concurrent_requests_issue_one_upstream_get() {
    let upstream = MockServer::start();
    let (key, gz) = artifact_fixture(&[b'z'; 200_000]).await;
    let path = key.to_string();
    upstream.mock(|when, then| {
        when.method(HEAD).path(&path);
        then.status(200)
            .header("content-length", gz.len().to_string());
    });
    let get_mock = upstream.mock(|when, then| {
        when.method(GET).path(&path);
        then.status(200).body(gz.clone());
    });

    let server = TestServer::new(vec![upstream.base_url()]);
    let (a, b) = tokio::join!(
        server.request(Method::GET, &path, &[]),
        server.request(Method::GET, &path, &[])
    );

    assert_eq!(a.status(), 200);
    assert_eq!(b.status(), 200);
    let (a, b) = tokio::join!(body_bytes(a), body_bytes(b));
    assert_eq!(a, gz);
    assert_eq!(b, gz);

    get_mock.assert_hits(1);
    server.wait_until(|state| state.cache.contains(&key)).await;
    assert_eq!(server.state.cache.entry_count(), 1);
}

#[tokio::test]
async fn archaic_skip_empty_hash_installs_both_entries() {
    let upstream = MockServer::start();
    let tar = tar_fixture(true, b"legacy tarball");
    let gz = gzip(&tar).await;
    let pair = hashes_of(&tar);
    assert_ne!(pair.skip_empty, pair.no_skip);
    let requested = ResourceKey::artifact(pair.skip_empty);
    let canonical = requested.with_hash(pair.no_skip);
    mock_resource(&upstream, &requested, &gz);

    let server = TestServer::new(vec![upstream.base_url()]);
    let response = server.request(Method::GET, &requested.to_string(), &[]).await;
    assert_eq!(response.status(), 200);
    assert_eq!(body_bytes(response).await, gz);

    server
        .wait_until(|state| state.cache.contains(&requested) && state.cache.contains(&canonical))
        .await;
    assert_eq!(server.state.cache.entry_count(), 2);

    // The canonical address now hits the cache without upstream contact.
    let response = server.request(Method::GET, &canonical.to_string(), &[]).await;
    assert_eq!(response.status(), 200);
    assert_eq!(body_bytes(response).await, gz);
}

#[tokio::test]
async fn hash_mismatch_is_remembered_until_forgotten() {
    let upstream = MockServer::start();
    let tar = tar_fixture(false, b"not what was asked for");
    let gz = gzip(&tar).await;
    let key = ResourceKey::artifact(TreeHash::from_bytes([0x1d; 20]));
    let path = key.to_string();
    let head_mock = upstream.mock(|when, then| {
        when.method(HEAD).path(&path);
        then.status(200)
            .header("content-length", gz.len().to_string());
    });
    let get_mock = upstream.mock(|when, then| {
        when.method(GET).path(&path);
        then.status(200).body(gz.clone());
    });

    let server = TestServer::new(vec![upstream.base_url()]);
    let first = server.request(Method::GET, &path, &[]).await;
    drop(first);
    server
        .wait_until(|state| state.coordinator.fetch_failures() == 1)
        .await;
    assert!(!server.state.cache.contains(&key));

    // The failure sentinel answers without contacting upstream again.
    let head_hits = head_mock.hits();
    let get_hits = get_mock.hits();
    let second = server.request(Method::GET, &path, &[]).await;
    assert_eq!(second.status(), 404);
    assert_eq!(head_mock.hits(), head_hits);
    assert_eq!(get_mock.hits(), get_hits);

    // forget-failures reopens the retry window.
    let cleared = server
        .request(Method::POST, "/admin/forget-failures", &[])
        .await;
    assert_eq!(cleared.status(), 200);
    let body: serde_json::Value =
        serde_json::from_slice(&body_bytes(cleared).await).expect("json body");
    assert_eq!(body["cleared"], 1);

    let third = server.request(Method::GET, &path, &[]).await;
    assert_eq!(third.status(), 200);
    server
        .wait_until(|state| state.coordinator.fetch_failures() == 2)
        .await;
}

#[tokio::test]
async fn no_advertising_upstream_is_404_and_retryable() {
    let upstream = MockServer::start();
    let key = ResourceKey::artifact(TreeHash::from_bytes([0x2e; 20]));
    let head_mock = upstream.mock(|when, then| {
        when.method(HEAD).path(key.to_string());
        then.status(404);
    });

    let server = TestServer::new(vec![upstream.base_url()]);
    let response = server.request(Method::GET, &key.to_string(), &[]).await;
    assert_eq!(response.status(), 404);
    head_mock.assert_hits(1);

    // Not recorded as a failure: the next request probes upstream again.
    let response = server.request(Method::GET, &key.to_string(), &[]).await;
    assert_eq!(response.status(), 404);
    head_mock.assert_hits(2);
}

#[tokio::test]
async fn malformed_paths_404_without_upstream_contact() {
    let upstream = MockServer::start();
    let probe = upstream.mock(|when, then| {
        when.method(HEAD);
        then.status(200).header("content-length", "1");
    });

    let server = TestServer::new(vec![upstream.base_url()]);
    for path in [
        "/artifact/nothex",
        "/artifact/DEADBEEFDEADBEEFDEADBEEFDEADBEEFDEADBEEF",
        "/registry/not-a-uuid/deadbeefdeadbeefdeadbeefdeadbeefdeadbeef",
        "/bundle/deadbeefdeadbeefdeadbeefdeadbeefdeadbeef",
    ] {
        let response = server.request(Method::GET, path, &[]).await;
        assert_eq!(response.status(), 404, "{path} should 404");
    }
    probe.assert_hits(0);
}

#[tokio::test]
async fn cached_file_serves_ranges() {
    let upstream = MockServer::start();
    let (key, gz) = artifact_fixture(&[b'r'; 5000]).await;
    mock_resource(&upstream, &key, &gz);

    let server = TestServer::new(vec![upstream.base_url()]);
    let path = key.to_string();
    let warmup = server.request(Method::GET, &path, &[]).await;
    assert_eq!(body_bytes(warmup).await, gz);
    server.wait_until(|state| state.cache.contains(&key)).await;

    // Plain range.
    let response = server
        .request(Method::GET, &path, &[("range", "bytes=10-19")])
        .await;
    assert_eq!(response.status(), 206);
    assert_eq!(
        response.headers()["content-range"],
        format!("bytes 10-19/{}", gz.len())
    );
    assert_eq!(body_bytes(response).await, &gz[10..20]);

    // Open-ended range.
    let response = server
        .request(Method::GET, &path, &[("range", "bytes=100-")])
        .await;
    assert_eq!(response.status(), 206);
    assert_eq!(body_bytes(response).await, &gz[100..]);

    // Suffix range larger than the file clamps to the whole file.
    let response = server
        .request(
            Method::GET,
            &path,
            &[("range", format!("bytes=-{}", gz.len() * 2).as_str())],
        )
        .await;
    assert_eq!(response.status(), 206);
    assert_eq!(body_bytes(response).await, gz);

    // Inverted range is ignored.
    let response = server
        .request(Method::GET, &path, &[("range", "bytes=9-3")])
        .await;
    assert_eq!(response.status(), 200);
    assert_eq!(body_bytes(response).await, gz);
}

#[tokio::test]
async fn head_request_reports_headers_only() {
    let upstream = MockServer::start();
    let (key, gz) = artifact_fixture(b"head test").await;
    mock_resource(&upstream, &key, &gz);

    let server = TestServer::new(vec![upstream.base_url()]);
    let path = key.to_string();
    let warmup = server.request(Method::GET, &path, &[]).await;
    let _ = body_bytes(warmup).await;
    server.wait_until(|state| state.cache.contains(&key)).await;

    let response = server.request(Method::HEAD, &path, &[]).await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["content-length"], gz.len().to_string());
    assert_eq!(response.headers()["accept-ranges"], "bytes");
    assert!(body_bytes(response).await.is_empty());
}

#[tokio::test]
async fn health_and_metrics_endpoints_respond() {
    let upstream = MockServer::start();
    let server = TestServer::new(vec![upstream.base_url()]);

    let response = server.request(Method::GET, "/healthz", &[]).await;
    assert_eq!(response.status(), 200);

    let response = server.request(Method::GET, "/metrics", &[]).await;
    assert_eq!(response.status(), 200);
    let text = String::from_utf8(body_bytes(response).await).expect("utf8 metrics");
    assert!(text.contains("depot_cache_resident_bytes"));
}

#[tokio::test]
async fn metrics_endpoint_can_be_disabled() {
    let upstream = MockServer::start();
    let server = TestServer::with_config(vec![upstream.base_url()], |config| {
        config.server.metrics_enabled = false;
    });

    let response = server.request(Method::GET, "/metrics", &[]).await;
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn registries_index_404s_before_first_publish() {
    let upstream = MockServer::start();
    let server = TestServer::new(vec![upstream.base_url()]);

    let response = server.request(Method::GET, "/registries", &[]).await;
    assert_eq!(response.status(), 404);
}

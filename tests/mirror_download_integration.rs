//! Integration tests for mirror fallback against mock image hosts.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use scraper_extensions::{
    DownloadError, HttpClient, MirrorDownloader, PageRequest, RetryPolicy, TransportRebuilder,
};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

mod support;
use support::socket_guard::start_mock_server_or_skip;

const PNG_BODY: &[u8] = b"\x89PNG\r\n\x1a\nfake page";

fn downloader(max_attempts: u32) -> MirrorDownloader {
    MirrorDownloader::new(
        HttpClient::new().expect("client builds"),
        RetryPolicy::without_delays(max_attempts),
    )
}

/// Rebuilds a plain client and counts how often it was asked to.
struct PlainRebuilder {
    rebuilds: AtomicUsize,
}

#[async_trait]
impl TransportRebuilder for PlainRebuilder {
    async fn rebuild(&self) -> Result<HttpClient, DownloadError> {
        self.rebuilds.fetch_add(1, Ordering::SeqCst);
        HttpClient::new()
    }
}

async fn request_count(server: &MockServer) -> usize {
    server
        .received_requests()
        .await
        .map_or(0, |requests| requests.len())
}

#[tokio::test]
async fn test_rate_limited_then_failing_mirror_falls_through_to_second() {
    let Some(mirror1) = start_mock_server_or_skip().await else {
        return;
    };
    let Some(mirror2) = start_mock_server_or_skip().await else {
        return;
    };

    Mock::given(method("GET"))
        .and(path("/galleries/5/1.png"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(1)
        .mount(&mirror1)
        .await;
    Mock::given(method("GET"))
        .and(path("/galleries/5/1.png"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&mirror1)
        .await;
    Mock::given(method("GET"))
        .and(path("/galleries/5/1.png"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(PNG_BODY.to_vec()))
        .mount(&mirror2)
        .await;

    let temp_dir = TempDir::new().expect("temp dir");
    let destination = temp_dir.path().join("Alice").join("(5) Foo").join("1.png");
    let request = PageRequest {
        gallery: 5,
        page: 1,
        mirrors: vec![
            format!("{}/galleries/5/1.png", mirror1.uri()),
            format!("{}/galleries/5/1.png", mirror2.uri()),
        ],
        destination: destination.clone(),
    };

    let ok = downloader(2).download_page(&request).await;

    assert!(ok, "second mirror should have served the page");
    assert_eq!(std::fs::read(&destination).expect("page written"), PNG_BODY);
    assert_eq!(request_count(&mirror1).await, 2);
    assert_eq!(request_count(&mirror2).await, 1);
}

#[tokio::test]
async fn test_all_mirrors_failing_costs_mirrors_times_retries_plus_fallback_pass() {
    let Some(mirror1) = start_mock_server_or_skip().await else {
        return;
    };
    let Some(mirror2) = start_mock_server_or_skip().await else {
        return;
    };
    for server in [&mirror1, &mirror2] {
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(server)
            .await;
    }

    let temp_dir = TempDir::new().expect("temp dir");
    let destination = temp_dir.path().join("1.jpg");
    let mirrors = vec![
        format!("{}/1.jpg", mirror1.uri()),
        format!("{}/1.jpg", mirror2.uri()),
    ];
    let rebuilder = Arc::new(PlainRebuilder {
        rebuilds: AtomicUsize::new(0),
    });

    let ok = downloader(3)
        .with_fallback(rebuilder.clone())
        .download(&mirrors, &destination)
        .await;

    assert!(!ok);
    assert!(!destination.exists(), "no partial page may be left behind");
    assert_eq!(request_count(&mirror1).await, 3 + 1);
    assert_eq!(request_count(&mirror2).await, 3 + 1);
    assert_eq!(rebuilder.rebuilds.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_all_mirrors_failing_without_fallback() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let temp_dir = TempDir::new().expect("temp dir");
    let mirrors = vec![
        format!("{}/a/1.jpg", server.uri()),
        format!("{}/b/1.jpg", server.uri()),
    ];

    let ok = downloader(2)
        .download(&mirrors, &temp_dir.path().join("1.jpg"))
        .await;

    assert!(!ok);
    assert_eq!(request_count(&server).await, 2 * 2);
}

#[tokio::test]
async fn test_second_download_of_existing_page_makes_no_requests() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/1.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(PNG_BODY.to_vec()))
        .mount(&server)
        .await;

    let temp_dir = TempDir::new().expect("temp dir");
    let destination = temp_dir.path().join("1.jpg");
    let mirrors = vec![format!("{}/1.jpg", server.uri())];
    let downloader = downloader(3);

    assert!(downloader.download(&mirrors, &destination).await);
    assert!(downloader.download(&mirrors, &destination).await);
    assert_eq!(request_count(&server).await, 1);
}

//! Baseline strategies: round-robin rotation and single-connection
//! multiplexing. Neither may ever issue a byte-range sub-request.

mod common;

use std::collections::HashSet;

use url::Url;

use common::{Event, MockOrigin, patterned_body};
use qfan_client::client::Http3Client;
use qfan_client::http::HttpRequest;
use qfan_client::{SchedulerConfig, Strategy};

const ORIGIN: &str = "https://example.com";

fn request(path: &str) -> HttpRequest {
    HttpRequest::get(Url::parse(&format!("{ORIGIN}{path}")).unwrap())
}

fn sessions_used(origin: &MockOrigin) -> HashSet<u64> {
    origin
        .events()
        .into_iter()
        .filter_map(|e| match e {
            Event::Open { session, .. } => Some(session),
            _ => None,
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn round_robin_rotates_sessions_without_splitting() {
    let origin = MockOrigin::new();
    let paths: Vec<String> = (0..6).map(|i| format!("/file-{i}.bin")).collect();
    let mut bodies = Vec::new();
    for path in &paths {
        let body = patterned_body(64 * 1024);
        origin.insert(path, body.clone());
        bodies.push(body);
    }

    let config = SchedulerConfig {
        strategy: Strategy::RoundRobin,
        max_sessions: 2,
        max_parallel_streams: 2,
        ..SchedulerConfig::default()
    };
    let client = Http3Client::with_dialer(ORIGIN, config, origin.dialer()).unwrap();

    for (path, body) in paths.iter().zip(&bodies) {
        let mut response = client.fetch(request(path)).await.unwrap();
        let delivered = response.read_to_end().await.unwrap();
        assert_eq!(&delivered, body, "{path} body mismatch");
    }

    // requests rotated over the pool and never fanned out
    assert!(sessions_used(&origin).len() >= 2);
    for path in &paths {
        assert!(origin.ranges_requested(path).is_empty());
    }
    client.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_connection_multiplexes_on_one_session() {
    let origin = MockOrigin::new();
    let paths: Vec<String> = (0..5).map(|i| format!("/file-{i}.bin")).collect();
    let mut bodies = Vec::new();
    for path in &paths {
        let body = patterned_body(48 * 1024);
        origin.insert(path, body.clone());
        bodies.push(body);
    }

    let config = SchedulerConfig {
        strategy: Strategy::SingleConnection,
        ..SchedulerConfig::default()
    };
    let client = Http3Client::with_dialer(ORIGIN, config, origin.dialer()).unwrap();

    for (path, body) in paths.iter().zip(&bodies) {
        let mut response = client.fetch(request(path)).await.unwrap();
        let delivered = response.read_to_end().await.unwrap();
        assert_eq!(&delivered, body, "{path} body mismatch");
    }

    assert_eq!(sessions_used(&origin).len(), 1, "exactly one session");
    for path in &paths {
        assert!(origin.ranges_requested(path).is_empty());
    }
    client.close().await.unwrap();
}

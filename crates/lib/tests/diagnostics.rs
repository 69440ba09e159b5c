//! Probe battery against a mock backend.

use lib::config::DiagnosticsConfig;
use lib::diagnostics::{DiagnosticResult, DiagnosticStatus, Diagnostics};
use lib::logger::Logger;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fast_config() -> DiagnosticsConfig {
    DiagnosticsConfig {
        probe_delay_ms: 0,
        timeout_secs: 2,
        ..DiagnosticsConfig::default()
    }
}

#[tokio::test]
async fn options_405_is_a_warning_and_results_keep_declared_order() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("OPTIONS"))
        .and(path("/v1"))
        .respond_with(ResponseTemplate::new(405))
        .mount(&server)
        .await;
    // Slowest probe is the last one; ordering must not depend on latency.
    Mock::given(method("GET"))
        .and(path("/v1/chat-messages"))
        .respond_with(ResponseTemplate::new(401).set_delay(Duration::from_millis(200)))
        .mount(&server)
        .await;

    let diagnostics = Diagnostics::new(format!("{}/v1", server.uri()), fast_config(), Logger::default());
    let mut snapshots: Vec<Vec<DiagnosticResult>> = Vec::new();
    let results = diagnostics
        .run(&mut |r: &[DiagnosticResult]| snapshots.push(r.to_vec()))
        .await;

    let names: Vec<&str> = results.iter().map(|r| r.test_name.as_str()).collect();
    assert_eq!(names, vec!["network", "cors-preflight", "api-endpoint"]);
    assert_eq!(results[0].status, DiagnosticStatus::Success);
    assert_eq!(results[1].status, DiagnosticStatus::Warning);
    assert!(results[1].message.contains("not supported"));
    assert_eq!(results[2].status, DiagnosticStatus::Warning);

    // pending + resolved for each probe
    assert_eq!(snapshots.len(), 6);
    assert_eq!(snapshots[0].len(), 1);
    assert_eq!(snapshots[0][0].status, DiagnosticStatus::Pending);
    assert_eq!(snapshots[2].len(), 2);
    assert_eq!(snapshots[2][1].status, DiagnosticStatus::Pending);
    assert_eq!(snapshots[5], results);
}

#[tokio::test]
async fn preflight_success_reports_cors_headers() {
    let server = MockServer::start().await;
    Mock::given(method("OPTIONS"))
        .and(path("/v1"))
        .respond_with(
            ResponseTemplate::new(204)
                .insert_header("access-control-allow-origin", "*")
                .insert_header("access-control-allow-methods", "POST, GET"),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/chat-messages"))
        .respond_with(ResponseTemplate::new(405))
        .mount(&server)
        .await;

    let diagnostics = Diagnostics::new(format!("{}/v1", server.uri()), fast_config(), Logger::default());
    let results = diagnostics.run(&mut |_: &[DiagnosticResult]| {}).await;

    // Unmatched GET on the base gets wiremock's 404, which still proves reachability.
    assert_eq!(results[0].status, DiagnosticStatus::Success);
    assert_eq!(results[1].status, DiagnosticStatus::Success);
    let details = results[1].details.as_deref().unwrap();
    assert!(details.contains("Allowed origin: *"));
    assert!(details.contains("Allowed methods: POST, GET"));
    assert!(details.contains("Allowed headers: not set"));
    assert_eq!(results[2].status, DiagnosticStatus::Success);

    let requests = server.received_requests().await.unwrap();
    let preflight = requests
        .iter()
        .find(|r| r.method.as_str() == "OPTIONS")
        .expect("preflight sent");
    assert_eq!(
        preflight
            .headers
            .get("access-control-request-method")
            .and_then(|v| v.to_str().ok()),
        Some("POST")
    );
    assert_eq!(
        preflight.headers.get("origin").and_then(|v| v.to_str().ok()),
        Some("http://localhost:5173")
    );
}

#[tokio::test]
async fn unreachable_backend_yields_one_error_per_probe() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind free port");
        listener.local_addr().expect("local_addr").port()
    };
    let diagnostics = Diagnostics::new(
        format!("http://127.0.0.1:{}/v1", port),
        fast_config(),
        Logger::default(),
    );
    let results = diagnostics.run(&mut |_: &[DiagnosticResult]| {}).await;
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| r.status == DiagnosticStatus::Error));
    assert!(results[0].details.as_deref().unwrap().contains("Cannot connect"));
}

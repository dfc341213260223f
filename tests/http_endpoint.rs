//! HTTP endpoint tests against the router, no sockets involved.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use s7_exporter_prometheus::config::ExporterConfig;
use s7_exporter_prometheus::http;
use s7_exporter_prometheus::registry::MetricRegistry;

fn registry_with_value() -> Arc<MetricRegistry> {
    let json = r#"{
        targets: [
            {
                ip: "192.168.0.10",
                label: "line1",
                db: [
                    { number: 100, metrics: [ { name: "Temperature", type: "float", offset: 0, help: "Oven temperature" } ] }
                ]
            }
        ]
    }"#;

    let config = ExporterConfig::parse(json).unwrap();
    let registry = Arc::new(MetricRegistry::build(&config.targets).unwrap());
    registry
        .set_value("192.168.0.10", "Temperature", "line1", 21.5)
        .unwrap();
    registry
}

#[tokio::test]
async fn test_metrics_endpoint_serves_exposition() {
    let app = http::router(registry_with_value(), "/metrics");

    let response = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(content_type.contains("openmetrics-text"));

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = String::from_utf8(bytes.to_vec()).unwrap();

    assert!(body.contains("Temperature{target=\"line1\"} 21.5"));
    assert!(body.trim_end().ends_with("# EOF"));
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = http::router(registry_with_value(), "/metrics");

    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_custom_metrics_path() {
    let app = http::router(registry_with_value(), "/prometheus/metrics");

    let hit = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/prometheus/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(hit.status(), StatusCode::OK);

    let miss = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(miss.status(), StatusCode::NOT_FOUND);
}

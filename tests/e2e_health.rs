//! E2E tests for health and metrics endpoints

mod common;

use common::TestServer;

#[tokio::test]
async fn test_health_check() {
    let server = TestServer::new().await;

    let response = server.client.get(server.url("/health")).send().await.unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "OK");
}

#[tokio::test]
async fn test_metrics_exposes_federation_gauges() {
    let server = TestServer::new().await;

    let response = server.client.get(server.url("/metrics")).send().await.unwrap();

    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    assert!(body.contains("fedipost_delivery_queue_depth"));
    assert!(body.contains("fedipost_outbound_backlog"));
    assert!(body.contains("fedipost_app_uptime_seconds"));
}

#[tokio::test]
async fn test_unknown_route_is_not_found() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(server.url("/api/v1/instance"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 404);
}

//! Integration tests for the HTTP cloud and registry adapters.
//!
//! Uses wiremock to verify wire shapes, boundary validation, and the
//! absent-as-value contracts (404 is a value for get/delete, never an
//! error).

use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use fleet_manager::cloud::{CloudBackend, CreateInstance, HttpCloud, InstanceStatus, ServerId};
use fleet_manager::registry::{HttpRegistry, JobRegistry, Token};

#[tokio::test]
async fn test_cloud_list_validates_statuses() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/instances"))
        .and(query_param("name_prefix", "ci-large"))
        .and(header("authorization", "Bearer cloud-secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "instances": [
                {"id": "srv-1", "name": "ci-large-0-aaa", "status": "ACTIVE"},
                {"id": "srv-2", "name": "ci-large-0-bbb", "status": "frobnicating"}
            ]
        })))
        .mount(&server)
        .await;

    let cloud = HttpCloud::new(server.uri(), "cloud-secret");
    let instances = cloud.list_instances("ci-large").await.unwrap();

    assert_eq!(instances.len(), 2);
    assert_eq!(instances[0].status, InstanceStatus::Active);
    // Unknown status strings downgrade to building rather than failing the listing
    assert_eq!(instances[1].status, InstanceStatus::Building);
}

#[tokio::test]
async fn test_cloud_get_absent_is_a_value() {
    let server = MockServer::start().await;
    let cloud = HttpCloud::new(server.uri(), "cloud-secret");

    let instance = cloud.get_instance(&ServerId::new("srv-9")).await.unwrap();
    assert!(instance.is_none());
}

#[tokio::test]
async fn test_cloud_delete_absent_is_idempotent() {
    let server = MockServer::start().await;
    let cloud = HttpCloud::new(server.uri(), "cloud-secret");

    cloud.delete_instance(&ServerId::new("srv-9")).await.unwrap();
}

#[tokio::test]
async fn test_cloud_server_error_is_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/instances"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let cloud = HttpCloud::new(server.uri(), "cloud-secret");
    let err = cloud.list_instances("ci-large").await.unwrap_err();
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_cloud_create_sends_boot_script() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/instances"))
        .and(body_partial_json(json!({
            "name": "ci-large-0-abc123de",
            "image": "runner-image",
            "flavor": "large",
            "network": "net-1"
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": "srv-42",
            "name": "ci-large-0-abc123de",
            "status": "building"
        })))
        .mount(&server)
        .await;

    let cloud = HttpCloud::new(server.uri(), "cloud-secret");
    let instance = cloud
        .create_instance(&CreateInstance {
            name: "ci-large-0-abc123de".to_string(),
            image: "runner-image".to_string(),
            flavor: "large".to_string(),
            network: "net-1".to_string(),
            boot_script: "#!/bin/sh\nsetup --token reg-1\n".to_string(),
        })
        .await
        .unwrap();

    assert_eq!(instance.id.as_str(), "srv-42");
    assert_eq!(instance.status, InstanceStatus::Building);
}

#[tokio::test]
async fn test_registry_token_fetch() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/acme/runners/registration-token"))
        .and(header("authorization", "Bearer registry-secret"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "token": "tok-1",
            "expires_at": "2026-08-05T12:00:00Z"
        })))
        .mount(&server)
        .await;

    let registry = HttpRegistry::new(server.uri(), "registry-secret");
    let token = registry.get_registration_token("acme").await.unwrap();

    assert_eq!(token.value, "tok-1");
    assert!(token.expires_at.is_some());
}

#[tokio::test]
async fn test_registry_forbidden_is_credential_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/acme/runners/removal-token"))
        .respond_with(ResponseTemplate::new(403).set_body_string("token expired"))
        .mount(&server)
        .await;

    let registry = HttpRegistry::new(server.uri(), "registry-secret");
    let err = registry.get_removal_token("acme").await.unwrap_err();
    assert!(err.is_credential());
}

#[tokio::test]
async fn test_registry_list_registered() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/acme/runners"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "runners": [
                {"id": 1, "name": "ci-large-0-aaa", "online": true, "busy": false},
                {"id": 2, "name": "ci-large-0-bbb", "online": false, "busy": false}
            ]
        })))
        .mount(&server)
        .await;

    let registry = HttpRegistry::new(server.uri(), "registry-secret");
    let registered = registry.list_registered("acme").await.unwrap();

    assert_eq!(registered.len(), 2);
    assert!(registered[0].online);
    assert!(!registered[1].online);
}

#[tokio::test]
async fn test_registry_delete_authenticates_with_removal_token() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/acme/runners/7"))
        .and(header("authorization", "Bearer rm-tok"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let registry = HttpRegistry::new(server.uri(), "registry-secret");
    let token = Token {
        value: "rm-tok".to_string(),
        expires_at: None,
    };
    registry.delete_registration("acme", 7, &token).await.unwrap();
}

#[tokio::test]
async fn test_registry_queue_duration_absent_run() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/acme/runs/42"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "queue_duration_secs": 7.5
        })))
        .mount(&server)
        .await;

    let registry = HttpRegistry::new(server.uri(), "registry-secret");
    assert_eq!(
        registry.job_queue_duration("acme", 42).await.unwrap(),
        Some(7.5)
    );
    // Unknown run: absence is a value
    assert_eq!(registry.job_queue_duration("acme", 43).await.unwrap(), None);
}

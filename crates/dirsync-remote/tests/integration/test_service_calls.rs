//! Plain JSON service calls and status-code classification

use dirsync_core::ports::{services, RemoteError, RemoteTransport, ServiceRequest};
use serde_json::json;

use crate::common;

#[tokio::test]
async fn test_json_call_returns_result() {
    let (server, transport) = common::setup_token_transport().await;
    common::mount_service(
        &server,
        services::ASSET_EXISTS,
        json!({"paths": ["/ns/a", "/ns/b"]}),
        200,
        json!({"exists": [true, false]}),
    )
    .await;

    let response = transport
        .call(ServiceRequest::new(
            services::ASSET_EXISTS,
            json!({"paths": ["/ns/a", "/ns/b"]}),
        ))
        .await
        .expect("call failed");

    assert_eq!(response.result["exists"], json!([true, false]));
    assert!(response.output.is_none());
}

#[tokio::test]
async fn test_unauthorized_is_session_invalid() {
    let (server, transport) = common::setup_token_transport().await;
    common::mount_service(
        &server,
        services::SERVER_PING,
        json!({}),
        401,
        json!({"error": "session expired"}),
    )
    .await;

    let err = transport
        .call(ServiceRequest::new(services::SERVER_PING, json!({})))
        .await
        .unwrap_err();
    assert!(err.is_session_invalid());
    assert_eq!(err.to_string(), "session invalid: session expired");
}

#[tokio::test]
async fn test_server_error_is_retryable() {
    let (server, transport) = common::setup_token_transport().await;
    common::mount_service(&server, services::SERVER_PING, json!({}), 503, json!({"error": "busy"}))
        .await;

    let err = transport
        .call(ServiceRequest::new(services::SERVER_PING, json!({})))
        .await
        .unwrap_err();
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_client_error_is_rejection_with_message() {
    let (server, transport) = common::setup_token_transport().await;
    common::mount_service(
        &server,
        services::NAMESPACE_CREATE,
        json!({"path": "/ns"}),
        409,
        json!({"error": "namespace already exists: /ns"}),
    )
    .await;

    let err = transport
        .call(ServiceRequest::new(services::NAMESPACE_CREATE, json!({"path": "/ns"})))
        .await
        .unwrap_err();
    match err {
        RemoteError::Rejected { service, message } => {
            assert_eq!(service, "namespace.create");
            assert_eq!(message, "namespace already exists: /ns");
        }
        other => panic!("expected rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn test_unreachable_endpoint_is_connection_error() {
    let transport = dirsync_remote::HttpTransport::new(
        "http://127.0.0.1:1",
        dirsync_remote::http::Credentials::Token("t".into()),
    )
    .unwrap();
    let err = transport
        .call(ServiceRequest::new(services::SERVER_PING, json!({})))
        .await
        .unwrap_err();
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_empty_body_is_empty_object() {
    let (server, transport) = common::setup_token_transport().await;
    wiremock::Mock::given(wiremock::matchers::method("POST"))
        .and(wiremock::matchers::path("/service"))
        .respond_with(wiremock::ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let response = transport
        .call(ServiceRequest::new(services::SERVER_PING, json!({})))
        .await
        .unwrap();
    assert_eq!(response.result, json!({}));
}

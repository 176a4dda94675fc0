//! Session logon and logoff

use dirsync_core::ports::{services, RemoteTransport, ServiceRequest};
use dirsync_remote::http::{Credentials, HttpTransport};
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn password_credentials() -> Credentials {
    Credentials::Password {
        domain: Some("corp".into()),
        user: "alice".into(),
        password: "secret".into(),
    }
}

#[tokio::test]
async fn test_authenticate_stores_token_for_later_calls() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/session"))
        .and(body_json(json!({"domain": "corp", "user": "alice", "password": "secret"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "issued"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/service"))
        .and(header("authorization", "Bearer issued"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let transport = HttpTransport::new(server.uri(), password_credentials()).unwrap();
    transport.authenticate().await.expect("logon failed");
    transport
        .call(ServiceRequest::new(services::SERVER_PING, json!({})))
        .await
        .expect("ping failed");
}

#[tokio::test]
async fn test_rejected_logon_is_not_session_invalid() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/session"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"error": "bad password"})))
        .mount(&server)
        .await;

    let transport = HttpTransport::new(server.uri(), password_credentials()).unwrap();
    let err = transport.authenticate().await.unwrap_err();
    assert!(!err.is_session_invalid());
    assert_eq!(err.message(), Some("bad password"));
}

#[tokio::test]
async fn test_logoff_deletes_session() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/session"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "issued"})))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/session"))
        .and(header("authorization", "Bearer issued"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let transport = HttpTransport::new(server.uri(), password_credentials()).unwrap();
    transport.authenticate().await.unwrap();
    transport.logoff().await.expect("logoff failed");
    // Second logoff has no session left to discard
    transport.logoff().await.expect("second logoff failed");
}

#[tokio::test]
async fn test_token_credentials_skip_logon() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/session"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let transport = HttpTransport::new(server.uri(), Credentials::Token("t".into())).unwrap();
    transport.authenticate().await.unwrap();
}

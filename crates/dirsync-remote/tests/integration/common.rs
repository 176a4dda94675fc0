//! Shared test helpers for HTTP transport integration tests
//!
//! Each helper mounts the endpoints a test needs and returns a transport
//! pointing at the mock server.

use dirsync_remote::http::{Credentials, HttpTransport};
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Starts a mock server and a token-authenticated transport against it
pub async fn setup_token_transport() -> (MockServer, HttpTransport) {
    let server = MockServer::start().await;
    let transport = HttpTransport::new(server.uri(), Credentials::Token("test-token".into()))
        .expect("build transport");
    (server, transport)
}

/// Mounts `POST /service` answering `result` for exactly this service call
pub async fn mount_service(
    server: &MockServer,
    service: &str,
    args: serde_json::Value,
    status: u16,
    body: serde_json::Value,
) {
    Mock::given(method("POST"))
        .and(path("/service"))
        .and(header("authorization", "Bearer test-token"))
        .and(body_json(serde_json::json!({ "service": service, "args": args })))
        .respond_with(ResponseTemplate::new(status).set_body_json(body))
        .mount(server)
        .await;
}

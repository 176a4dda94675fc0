//! Streamed uploads and downloads

use dirsync_core::ports::{services, RemoteTransport, ServiceInput, ServiceRequest};
use dirsync_remote::http::RESULT_HEADER;
use futures_util::{stream, StreamExt};
use serde_json::json;
use wiremock::matchers::{body_bytes, body_json, method, path, query_param};
use wiremock::{Mock, ResponseTemplate};

use crate::common;

#[tokio::test]
async fn test_upload_streams_body_and_passes_args_in_query() {
    let (server, transport) = common::setup_token_transport().await;
    let args = json!({"path": "/ns/a.txt", "auto_create_namespace": true});

    Mock::given(method("POST"))
        .and(path("/service/upload"))
        .and(query_param("service", "asset.create"))
        .and(query_param("args", args.to_string()))
        .and(query_param("length", "11"))
        .and(body_bytes(b"hello world".to_vec()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "asset": {"id": "a1", "path": "/ns/a.txt", "content": {"size": 11, "csum": 222957957}}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let chunks = vec![Ok(b"hello ".to_vec()), Ok(b"world".to_vec())];
    let request = ServiceRequest::new(services::ASSET_CREATE, args).with_input(ServiceInput {
        length: 11,
        stream: stream::iter(chunks).boxed(),
    });

    let response = transport.call(request).await.expect("upload failed");
    assert_eq!(response.result["asset"]["id"], "a1");
}

#[tokio::test]
async fn test_download_returns_stream_and_header_result() {
    let (server, transport) = common::setup_token_transport().await;
    let content: Vec<u8> = (0..100_000).map(|i| (i % 251) as u8).collect();

    Mock::given(method("POST"))
        .and(path("/service/download"))
        .and(body_json(json!({"service": "asset.get", "args": {"path": "/ns/big"}})))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header(RESULT_HEADER, r#"{"asset":{"id":"b1","path":"/ns/big"}}"#)
                .set_body_bytes(content.clone()),
        )
        .mount(&server)
        .await;

    let response = transport
        .call(ServiceRequest::new(services::ASSET_GET, json!({"path": "/ns/big"})).with_output())
        .await
        .expect("download failed");
    assert_eq!(response.result["asset"]["id"], "b1");

    let mut output = response.output.expect("no output stream");
    assert_eq!(output.length, Some(content.len() as u64));
    let mut received = Vec::new();
    while let Some(chunk) = output.stream.next().await {
        received.extend(chunk.expect("chunk failed"));
    }
    assert_eq!(received, content);
}

#[tokio::test]
async fn test_download_error_status_is_classified() {
    let (server, transport) = common::setup_token_transport().await;
    Mock::given(method("POST"))
        .and(path("/service/download"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"error": "asset not found"})))
        .mount(&server)
        .await;

    let err = transport
        .call(ServiceRequest::new(services::ASSET_GET, json!({"path": "/ns/x"})).with_output())
        .await
        .unwrap_err();
    assert_eq!(err.message(), Some("asset not found"));
}

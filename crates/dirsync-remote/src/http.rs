//! HTTP/JSON transport
//!
//! Speaks the store's service protocol over HTTP:
//!
//! ```text
//!   POST {endpoint}/session            {domain,user,password}  ─► {token}
//!   DELETE {endpoint}/session
//!   POST {endpoint}/service            {service,args}          ─► result JSON
//!   POST {endpoint}/service/upload?service=..&args=..&length=..  (raw body) ─► result JSON
//!   POST {endpoint}/service/download   {service,args}          ─► raw body
//!                                                                 + X-Service-Result header
//! ```
//!
//! Failed calls answer with `{"error": "..."}`. Status codes map onto
//! [`RemoteError`]: 401 is session-invalid, 5xx and transport failures are
//! connection errors, any other non-success status is a rejection.

use std::io;
use std::sync::RwLock;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use dirsync_core::config::RemoteConfig;
use dirsync_core::ports::{
    RemoteError, RemoteTransport, ServiceOutput, ServiceRequest, ServiceResponse,
};
use futures_util::{StreamExt, TryStreamExt};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

/// Header carrying the JSON result of a download call
pub const RESULT_HEADER: &str = "x-service-result";

/// Service name used in errors raised while logging on
const LOGON: &str = "session.logon";

/// How the transport proves its identity
#[derive(Debug, Clone)]
pub enum Credentials {
    /// A pre-issued session token
    Token(String),
    /// Logon with user and password, optionally within a domain
    Password {
        domain: Option<String>,
        user: String,
        password: String,
    },
}

#[derive(Debug, Deserialize)]
struct LogonResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// JSON-over-HTTP [`RemoteTransport`]
pub struct HttpTransport {
    client: Client,
    endpoint: String,
    credentials: Credentials,
    token: RwLock<Option<String>>,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>, credentials: Credentials) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;
        let token = match &credentials {
            Credentials::Token(token) => Some(token.clone()),
            Credentials::Password { .. } => None,
        };
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            credentials,
            token: RwLock::new(token),
        })
    }

    /// Builds a transport from the `remote` configuration section
    pub fn from_config(config: &RemoteConfig) -> Result<Self> {
        let credentials = match (&config.token, &config.user, &config.password) {
            (Some(token), _, _) => Credentials::Token(token.clone()),
            (None, Some(user), Some(password)) => Credentials::Password {
                domain: config.domain.clone(),
                user: user.clone(),
                password: password.clone(),
            },
            _ => anyhow::bail!("remote: either a token or user and password are required"),
        };
        Self::new(&config.endpoint, credentials)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn current_token(&self) -> Option<String> {
        self.token.read().ok().and_then(|t| t.clone())
    }

    fn set_token(&self, token: Option<String>) {
        if let Ok(mut guard) = self.token.write() {
            *guard = token;
        }
    }

    fn post(&self, path: &str) -> RequestBuilder {
        let builder = self.client.post(format!("{}{}", self.endpoint, path));
        match self.current_token() {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Turns a non-success response into the matching [`RemoteError`]
    async fn check(service: &str, response: Response) -> Result<Response, RemoteError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&text)
            .map(|b| b.error)
            .unwrap_or_else(|_| {
                if text.is_empty() {
                    status.to_string()
                } else {
                    text
                }
            });

        Err(match status {
            StatusCode::UNAUTHORIZED => RemoteError::SessionInvalid(message),
            s if s.is_server_error() => RemoteError::Connection(format!("{s}: {message}")),
            _ => RemoteError::rejected(service, message),
        })
    }

    async fn json_result(service: &str, response: Response) -> Result<Value, RemoteError> {
        let response = Self::check(service, response).await?;
        let bytes = response.bytes().await.map_err(transport_error)?;
        if bytes.is_empty() {
            return Ok(json!({}));
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| RemoteError::Protocol(format!("{service}: invalid JSON result: {e}")))
    }
}

fn transport_error(e: reqwest::Error) -> RemoteError {
    RemoteError::Connection(e.to_string())
}

#[async_trait]
impl RemoteTransport for HttpTransport {
    async fn authenticate(&self) -> Result<(), RemoteError> {
        let Credentials::Password {
            domain,
            user,
            password,
        } = &self.credentials
        else {
            debug!("Using configured session token");
            return Ok(());
        };

        let response = self
            .client
            .post(format!("{}/session", self.endpoint))
            .json(&json!({ "domain": domain, "user": user, "password": password }))
            .send()
            .await
            .map_err(transport_error)?;
        let response = match Self::check(LOGON, response).await {
            Err(RemoteError::SessionInvalid(message)) => {
                return Err(RemoteError::rejected(LOGON, message))
            }
            other => other?,
        };
        let logon: LogonResponse = response
            .json()
            .await
            .map_err(|e| RemoteError::Protocol(format!("{LOGON}: {e}")))?;

        self.set_token(Some(logon.token));
        info!(user = %user, "Logged on to remote store");
        Ok(())
    }

    async fn call(&self, request: ServiceRequest) -> Result<ServiceResponse, RemoteError> {
        let ServiceRequest {
            service,
            args,
            input,
            want_output,
        } = request;
        debug!(service = %service, upload = input.is_some(), download = want_output, "HTTP service call");

        if let Some(input) = input {
            let args_text = serde_json::to_string(&args)
                .map_err(|e| RemoteError::Protocol(e.to_string()))?;
            let length = input.length.to_string();
            let body = reqwest::Body::wrap_stream(input.stream);
            let response = self
                .post("/service/upload")
                .query(&[
                    ("service", service.as_str()),
                    ("args", args_text.as_str()),
                    ("length", length.as_str()),
                ])
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .body(body)
                .send()
                .await
                .map_err(|e| {
                    if is_interrupted(&e) {
                        RemoteError::Aborted
                    } else {
                        transport_error(e)
                    }
                })?;
            return Ok(ServiceResponse::json(Self::json_result(&service, response).await?));
        }

        if want_output {
            let response = self
                .post("/service/download")
                .json(&json!({ "service": service, "args": args }))
                .send()
                .await
                .map_err(transport_error)?;
            let response = Self::check(&service, response).await?;

            let result = match response.headers().get(RESULT_HEADER) {
                Some(value) => serde_json::from_slice(value.as_bytes()).map_err(|e| {
                    RemoteError::Protocol(format!("{service}: invalid {RESULT_HEADER} header: {e}"))
                })?,
                None => {
                    warn!(service = %service, "Download response without result header");
                    json!({})
                }
            };
            let length = response.content_length();
            let stream = response
                .bytes_stream()
                .map_ok(|bytes| bytes.to_vec())
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
                .boxed();
            return Ok(ServiceResponse {
                result,
                output: Some(ServiceOutput { length, stream }),
            });
        }

        let response = self
            .post("/service")
            .json(&json!({ "service": service, "args": args }))
            .send()
            .await
            .map_err(transport_error)?;
        Ok(ServiceResponse::json(Self::json_result(&service, response).await?))
    }

    async fn logoff(&self) -> Result<(), RemoteError> {
        if matches!(self.credentials, Credentials::Token(_)) {
            return Ok(());
        }
        if self.current_token().is_none() {
            return Ok(());
        }
        let mut builder = self.client.delete(format!("{}/session", self.endpoint));
        if let Some(token) = self.current_token() {
            builder = builder.bearer_auth(token);
        }
        let result = builder.send().await;
        self.set_token(None);
        match result {
            Ok(response) => Self::check(LOGON, response).await.map(|_| ()),
            Err(e) => Err(transport_error(e)),
        }
    }
}

/// Whether a request failed because the upload stream was interrupted
fn is_interrupted(e: &reqwest::Error) -> bool {
    let mut source = std::error::Error::source(e);
    while let Some(err) = source {
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            if io_err.kind() == io::ErrorKind::Interrupted {
                return true;
            }
        }
        source = err.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_prefers_token() {
        let config = RemoteConfig {
            token: Some("t".into()),
            user: Some("u".into()),
            password: Some("p".into()),
            ..RemoteConfig::default()
        };
        let transport = HttpTransport::from_config(&config).unwrap();
        assert!(matches!(transport.credentials, Credentials::Token(_)));
        assert_eq!(transport.current_token().as_deref(), Some("t"));
    }

    #[test]
    fn test_from_config_requires_credentials() {
        assert!(HttpTransport::from_config(&RemoteConfig::default()).is_err());
    }

    #[test]
    fn test_endpoint_trailing_slash_is_trimmed() {
        let transport =
            HttpTransport::new("http://localhost:1/api/", Credentials::Token("t".into())).unwrap();
        assert_eq!(transport.endpoint(), "http://localhost:1/api");
    }
}

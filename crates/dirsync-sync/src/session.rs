//! Remote session
//!
//! [`RemoteSession`] wraps a [`RemoteTransport`] with the recovery policy
//! every call goes through:
//!
//! ```text
//! execute ──► call ──ok──────────────────────────────► result
//!               │
//!               ├─ connection error ─► wait interval ─► call again (≤ connect_retries)
//!               ├─ session invalid ──► authenticate ──► call again (once)
//!               └─ other ─────────────────────────────► error
//! ```
//!
//! Requests are rebuilt from a factory on every attempt because an upload
//! stream can only be sent once. An optional abort token cancels the call in
//! flight and any retry wait.

use std::sync::Arc;
use std::time::Duration;

use dirsync_core::config::RemoteConfig;
use dirsync_core::ports::{RemoteError, RemoteTransport, ServiceRequest, ServiceResponse};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Retry and keep-alive settings of a session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Extra attempts after a connection failure
    pub connect_retries: u32,
    /// Wait between attempts
    pub retry_interval: Duration,
    /// Period of the `server.ping` keep-alive
    pub keep_alive_interval: Duration,
    /// Host name of the store, used as the mail sender domain
    pub server_host: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_remote(&RemoteConfig::default())
    }
}

impl SessionConfig {
    pub fn from_remote(config: &RemoteConfig) -> Self {
        Self {
            connect_retries: config.connect_retries,
            retry_interval: Duration::from_millis(config.retry_interval_ms),
            keep_alive_interval: Duration::from_millis(config.keep_alive_interval_ms),
            server_host: host_of(&config.endpoint),
        }
    }
}

/// Extracts the host part of an endpoint URL
fn host_of(endpoint: &str) -> String {
    let rest = endpoint
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(endpoint);
    let authority = rest.split('/').next().unwrap_or_default();
    let authority = authority.rsplit('@').next().unwrap_or(authority);
    let host = authority.split(':').next().unwrap_or_default();
    if host.is_empty() {
        "localhost".to_string()
    } else {
        host.to_string()
    }
}

/// A reconnectable session shared by every task of a run
pub struct RemoteSession {
    transport: Arc<dyn RemoteTransport>,
    config: SessionConfig,
}

impl RemoteSession {
    pub fn new(transport: Arc<dyn RemoteTransport>, config: SessionConfig) -> Self {
        Self { transport, config }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Establishes the session, retrying connection failures
    ///
    /// # Errors
    /// Returns the last error once retries are exhausted, or any
    /// non-retryable error (rejected credentials) immediately
    pub async fn connect(&self) -> Result<(), RemoteError> {
        self.authenticate(None).await?;
        info!("Remote session established");
        Ok(())
    }

    async fn authenticate(&self, abort: Option<&CancellationToken>) -> Result<(), RemoteError> {
        let mut retries_left = self.config.connect_retries;
        loop {
            match self.transport.authenticate().await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_retryable() && retries_left > 0 => {
                    retries_left -= 1;
                    warn!(error = %err, retries_left, "Failed to connect, retrying");
                    self.pause(abort).await?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Executes one service call with the session's recovery policy
    ///
    /// `make_request` is invoked once per attempt.
    ///
    /// # Errors
    /// Returns [`RemoteError::Aborted`] when `abort` fires, otherwise the
    /// error of the last attempt
    #[instrument(skip(self, make_request, abort))]
    pub async fn execute<F>(
        &self,
        service: &str,
        mut make_request: F,
        abort: Option<&CancellationToken>,
    ) -> Result<ServiceResponse, RemoteError>
    where
        F: FnMut() -> ServiceRequest + Send,
    {
        let mut retries_left = self.config.connect_retries;
        let mut reauthenticated = false;

        loop {
            if abort.is_some_and(CancellationToken::is_cancelled) {
                return Err(RemoteError::Aborted);
            }

            let request = make_request();
            let result = match abort {
                Some(token) => tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(RemoteError::Aborted),
                    result = self.transport.call(request) => result,
                },
                None => self.transport.call(request).await,
            };

            match result {
                Ok(response) => return Ok(response),
                Err(err) if err.is_retryable() && retries_left > 0 => {
                    retries_left -= 1;
                    warn!(error = %err, retries_left, "Connection failed, retrying call");
                    self.pause(abort).await?;
                }
                Err(err) if err.is_session_invalid() && !reauthenticated => {
                    reauthenticated = true;
                    warn!(error = %err, "Session invalid, re-authenticating");
                    self.pause(abort).await?;
                    self.authenticate(abort).await?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Waits one retry interval unless aborted first
    async fn pause(&self, abort: Option<&CancellationToken>) -> Result<(), RemoteError> {
        if self.config.retry_interval.is_zero() {
            return Ok(());
        }
        match abort {
            Some(token) => tokio::select! {
                _ = token.cancelled() => Err(RemoteError::Aborted),
                _ = tokio::time::sleep(self.config.retry_interval) => Ok(()),
            },
            None => {
                tokio::time::sleep(self.config.retry_interval).await;
                Ok(())
            }
        }
    }

    /// Pings the store every keep-alive interval until `cancel` fires
    pub fn spawn_keep_alive(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let session = Arc::clone(self);
        let period = self.config.keep_alive_interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Keep-alive stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = session.ping().await {
                            warn!(error = %e, "Keep-alive ping failed");
                        }
                    }
                }
            }
        })
    }

    /// Discards the session on the store side
    pub async fn logoff(&self) -> Result<(), RemoteError> {
        self.transport.logoff().await?;
        info!("Remote session closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dirsync_core::ports::services;
    use dirsync_remote::InMemoryStore;
    use serde_json::json;

    fn session(store: &Arc<InMemoryStore>, retries: u32) -> RemoteSession {
        RemoteSession::new(
            store.clone(),
            SessionConfig {
                connect_retries: retries,
                retry_interval: Duration::from_millis(1),
                keep_alive_interval: Duration::from_millis(20),
                server_host: "localhost".into(),
            },
        )
    }

    fn ping() -> ServiceRequest {
        ServiceRequest::new(services::SERVER_PING, json!({}))
    }

    #[test]
    fn test_host_of_endpoint() {
        assert_eq!(host_of("https://store.example.org:8443/api"), "store.example.org");
        assert_eq!(host_of("http://user@10.0.0.1/api"), "10.0.0.1");
        assert_eq!(host_of("store"), "store");
        assert_eq!(host_of(""), "localhost");
    }

    #[tokio::test]
    async fn test_connection_failures_are_retried() {
        let store = Arc::new(InMemoryStore::new());
        store.fail_next_connections(3);
        let session = session(&store, 3);

        session.execute(services::SERVER_PING, ping, None).await.unwrap();
        assert_eq!(store.calls_to(services::SERVER_PING), 4);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let store = Arc::new(InMemoryStore::new());
        store.fail_next_connections(5);
        let session = session(&store, 2);

        let err = session.execute(services::SERVER_PING, ping, None).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(store.calls_to(services::SERVER_PING), 3);
    }

    #[tokio::test]
    async fn test_session_invalid_reauthenticates_once() {
        let store = Arc::new(InMemoryStore::new());
        store.invalidate_session();
        let session = session(&store, 0);

        session.execute(services::SERVER_PING, ping, None).await.unwrap();
        assert_eq!(store.authentications(), 1);
        assert_eq!(store.calls_to(services::SERVER_PING), 2);
    }

    #[tokio::test]
    async fn test_rejections_are_not_retried() {
        let store = Arc::new(InMemoryStore::new());
        store.reject_service(services::SERVER_PING, "maintenance");
        let session = session(&store, 5);

        let err = session.execute(services::SERVER_PING, ping, None).await.unwrap_err();
        assert_eq!(err.message(), Some("maintenance"));
        assert_eq!(store.calls_to(services::SERVER_PING), 1);
    }

    #[tokio::test]
    async fn test_cancelled_token_aborts_before_calling() {
        let store = Arc::new(InMemoryStore::new());
        let session = session(&store, 0);
        let token = CancellationToken::new();
        token.cancel();

        let err = session
            .execute(services::SERVER_PING, ping, Some(&token))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Aborted));
        assert_eq!(store.calls_to(services::SERVER_PING), 0);
    }

    #[tokio::test]
    async fn test_keep_alive_pings_until_cancelled() {
        let store = Arc::new(InMemoryStore::new());
        let session = Arc::new(session(&store, 0));
        let cancel = CancellationToken::new();

        let handle = session.spawn_keep_alive(cancel.clone());
        tokio::time::sleep(Duration::from_millis(90)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        let pings = store.calls_to(services::SERVER_PING);
        assert!(pings >= 1, "expected at least one ping, got {pings}");
    }
}

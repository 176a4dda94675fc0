//! Typed service calls
//!
//! Thin wrappers that build the JSON arguments of each store service, run
//! them through [`RemoteSession::execute`] and decode the result. A result
//! that does not have the expected shape is a [`RemoteError::Protocol`].

use dirsync_core::domain::{AssetMetadata, PosixAttributes, RemotePath};
use dirsync_core::ports::{services, RemoteError, ServiceInput, ServiceOutput, ServiceRequest};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::session::RemoteSession;

/// One page of an `asset.query` listing
#[derive(Debug, Clone)]
pub struct AssetPage {
    pub assets: Vec<AssetMetadata>,
    /// Assets left after this page
    pub remaining: u64,
}

/// Decodes `result[name]`
fn field<T: DeserializeOwned>(service: &str, result: &Value, name: &str) -> Result<T, RemoteError> {
    let value = result
        .get(name)
        .ok_or_else(|| RemoteError::Protocol(format!("{service}: result has no '{name}'")))?;
    serde_json::from_value(value.clone())
        .map_err(|e| RemoteError::Protocol(format!("{service}: invalid '{name}': {e}")))
}

fn paths_json(paths: &[RemotePath]) -> Vec<&str> {
    paths.iter().map(RemotePath::as_str).collect()
}

impl RemoteSession {
    async fn call_json(
        &self,
        service: &str,
        args: Value,
        abort: Option<&CancellationToken>,
    ) -> Result<Value, RemoteError> {
        let response = self
            .execute(service, || ServiceRequest::new(service, args.clone()), abort)
            .await?;
        Ok(response.result)
    }

    // ------------------------------------------------------------------
    // Namespaces
    // ------------------------------------------------------------------

    pub async fn namespace_exists(
        &self,
        namespace: &RemotePath,
        abort: Option<&CancellationToken>,
    ) -> Result<bool, RemoteError> {
        let service = services::NAMESPACE_EXISTS;
        let result = self
            .call_json(service, json!({ "path": namespace.as_str() }), abort)
            .await?;
        field(service, &result, "exists")
    }

    pub async fn namespace_create(
        &self,
        namespace: &RemotePath,
        abort: Option<&CancellationToken>,
    ) -> Result<(), RemoteError> {
        self.call_json(
            services::NAMESPACE_CREATE,
            json!({ "path": namespace.as_str() }),
            abort,
        )
        .await
        .map(|_| ())
    }

    // ------------------------------------------------------------------
    // Asset metadata
    // ------------------------------------------------------------------

    /// Existence of every path, in request order
    pub async fn assets_exist(
        &self,
        paths: &[RemotePath],
        abort: Option<&CancellationToken>,
    ) -> Result<Vec<bool>, RemoteError> {
        if paths.is_empty() {
            return Ok(Vec::new());
        }
        let service = services::ASSET_EXISTS;
        let result = self
            .call_json(service, json!({ "paths": paths_json(paths) }), abort)
            .await?;
        let exists: Vec<bool> = field(service, &result, "exists")?;
        if exists.len() != paths.len() {
            return Err(RemoteError::Protocol(format!(
                "{service}: asked for {} paths, got {} answers",
                paths.len(),
                exists.len()
            )));
        }
        Ok(exists)
    }

    pub async fn asset_exists(
        &self,
        path: &RemotePath,
        abort: Option<&CancellationToken>,
    ) -> Result<bool, RemoteError> {
        let exists = self.assets_exist(std::slice::from_ref(path), abort).await?;
        Ok(exists.first().copied().unwrap_or(false))
    }

    /// Metadata of the existing assets among `paths`
    pub async fn assets_get(
        &self,
        paths: &[RemotePath],
        abort: Option<&CancellationToken>,
    ) -> Result<Vec<AssetMetadata>, RemoteError> {
        if paths.is_empty() {
            return Ok(Vec::new());
        }
        let service = services::ASSET_GET;
        let result = self
            .call_json(service, json!({ "paths": paths_json(paths) }), abort)
            .await?;
        field(service, &result, "assets")
    }

    pub async fn asset_get(
        &self,
        path: &RemotePath,
        abort: Option<&CancellationToken>,
    ) -> Result<Option<AssetMetadata>, RemoteError> {
        let assets = self.assets_get(std::slice::from_ref(path), abort).await?;
        Ok(assets.into_iter().find(|a| &a.path == path))
    }

    // ------------------------------------------------------------------
    // Content
    // ------------------------------------------------------------------

    /// Creates an asset from a content stream, creating missing namespaces
    pub async fn asset_create<F>(
        &self,
        path: &RemotePath,
        posix: &PosixAttributes,
        mut make_input: F,
        abort: Option<&CancellationToken>,
    ) -> Result<AssetMetadata, RemoteError>
    where
        F: FnMut() -> ServiceInput + Send,
    {
        let service = services::ASSET_CREATE;
        let args = json!({
            "path": path.as_str(),
            "auto_create_namespace": true,
            "posix": posix,
        });
        let response = self
            .execute(
                service,
                || ServiceRequest::new(service, args.clone()).with_input(make_input()),
                abort,
            )
            .await?;
        field(service, &response.result, "asset")
    }

    /// Replaces the content and attributes of an existing asset
    pub async fn asset_set<F>(
        &self,
        id: &str,
        posix: &PosixAttributes,
        mut make_input: F,
        abort: Option<&CancellationToken>,
    ) -> Result<AssetMetadata, RemoteError>
    where
        F: FnMut() -> ServiceInput + Send,
    {
        let service = services::ASSET_SET;
        let args = json!({ "id": id, "posix": posix });
        let response = self
            .execute(
                service,
                || ServiceRequest::new(service, args.clone()).with_input(make_input()),
                abort,
            )
            .await?;
        field(service, &response.result, "asset")
    }

    /// Opens the content stream of an asset
    pub async fn asset_download(
        &self,
        path: &RemotePath,
        abort: Option<&CancellationToken>,
    ) -> Result<(AssetMetadata, ServiceOutput), RemoteError> {
        let service = services::ASSET_GET;
        let args = json!({ "path": path.as_str() });
        let response = self
            .execute(
                service,
                || ServiceRequest::new(service, args.clone()).with_output(),
                abort,
            )
            .await?;
        let asset = field(service, &response.result, "asset")?;
        let output = response
            .output
            .ok_or_else(|| RemoteError::Protocol(format!("{service}: no content stream")))?;
        Ok((asset, output))
    }

    // ------------------------------------------------------------------
    // Soft deletion
    // ------------------------------------------------------------------

    pub async fn soft_destroy(
        &self,
        paths: &[RemotePath],
        abort: Option<&CancellationToken>,
    ) -> Result<u64, RemoteError> {
        let service = services::ASSET_SOFT_DESTROY;
        let result = self
            .call_json(service, json!({ "paths": paths_json(paths) }), abort)
            .await?;
        field(service, &result, "count")
    }

    /// Soft-destroys every asset in the subtree of `namespace`
    pub async fn soft_destroy_namespace(
        &self,
        namespace: &RemotePath,
        abort: Option<&CancellationToken>,
    ) -> Result<u64, RemoteError> {
        let service = services::ASSET_SOFT_DESTROY;
        let result = self
            .call_json(service, json!({ "namespace": namespace.as_str() }), abort)
            .await?;
        field(service, &result, "count")
    }

    pub async fn soft_undestroy(
        &self,
        ids: &[String],
        abort: Option<&CancellationToken>,
    ) -> Result<u64, RemoteError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let service = services::ASSET_SOFT_UNDESTROY;
        let result = self.call_json(service, json!({ "ids": ids }), abort).await?;
        field(service, &result, "count")
    }

    // ------------------------------------------------------------------
    // Listing, ping, mail
    // ------------------------------------------------------------------

    pub async fn asset_query(
        &self,
        namespace: &RemotePath,
        idx: u64,
        size: u64,
        abort: Option<&CancellationToken>,
    ) -> Result<AssetPage, RemoteError> {
        let service = services::ASSET_QUERY;
        let result = self
            .call_json(
                service,
                json!({ "namespace": namespace.as_str(), "idx": idx, "size": size }),
                abort,
            )
            .await?;
        let assets = field(service, &result, "assets")?;
        let cursor: Value = field(service, &result, "cursor")?;
        let remaining = field(service, &cursor, "remaining")?;
        Ok(AssetPage { assets, remaining })
    }

    pub async fn ping(&self) -> Result<(), RemoteError> {
        self.call_json(services::SERVER_PING, json!({}), None)
            .await
            .map(|_| ())
    }

    pub async fn send_mail(
        &self,
        from: &str,
        to: &[String],
        subject: &str,
        body: &str,
    ) -> Result<(), RemoteError> {
        self.call_json(
            services::MAIL_SEND,
            json!({ "from": from, "to": to, "subject": subject, "body": body }),
            None,
        )
        .await
        .map(|_| ())
    }
}

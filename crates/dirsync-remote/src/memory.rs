//! In-memory remote store
//!
//! [`InMemoryStore`] implements every service of the wire contract against
//! process-local maps. It backs the engine's tests and also offers fault
//! injection: dropped connections, expired sessions, forced rejections,
//! corrupted checksums and slow uploads.
//!
//! The root namespace `/` always exists. Creating a namespace also creates
//! its missing ancestors.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use dirsync_core::domain::{AssetMetadata, ContentInfo, PosixAttributes, RemotePath};
use dirsync_core::ports::{
    services, RemoteError, RemoteTransport, ServiceInput, ServiceOutput, ServiceRequest,
    ServiceResponse,
};
use futures_util::{stream, StreamExt};
use serde_json::{json, Value};
use tracing::debug;

/// Chunk size of downloaded content streams
const OUTPUT_CHUNK_SIZE: usize = 8192;

#[derive(Debug, Clone)]
struct StoredAsset {
    meta: AssetMetadata,
    content: Vec<u8>,
}

/// A remote store held entirely in memory
#[derive(Debug)]
pub struct InMemoryStore {
    namespaces: DashSet<String>,
    /// Keyed by asset path
    assets: DashMap<String, StoredAsset>,
    /// Asset id to path
    ids: DashMap<String, String>,
    mails: Mutex<Vec<Value>>,
    calls: Mutex<Vec<String>>,
    rejections: Mutex<HashMap<String, String>>,
    session_valid: AtomicBool,
    authentications: AtomicUsize,
    connection_failures: AtomicUsize,
    checksum_corruptions: AtomicUsize,
    /// Pause after each received upload chunk, in milliseconds
    input_chunk_delay_ms: AtomicU64,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            namespaces: DashSet::new(),
            assets: DashMap::new(),
            ids: DashMap::new(),
            mails: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            rejections: Mutex::new(HashMap::new()),
            session_valid: AtomicBool::new(true),
            authentications: AtomicUsize::new(0),
            connection_failures: AtomicUsize::new(0),
            checksum_corruptions: AtomicUsize::new(0),
            input_chunk_delay_ms: AtomicU64::new(0),
        }
    }

    // ------------------------------------------------------------------
    // Seeding and inspection
    // ------------------------------------------------------------------

    /// Creates `path` and its ancestors
    pub fn put_namespace(&self, path: &RemotePath) {
        let mut current = Some(path.clone());
        while let Some(ns) = current {
            if ns.is_root() {
                break;
            }
            self.namespaces.insert(ns.as_str().to_string());
            current = ns.parent();
        }
    }

    pub fn has_namespace(&self, path: &RemotePath) -> bool {
        path.is_root() || self.namespaces.contains(path.as_str())
    }

    /// Sorted list of every namespace except the root
    pub fn namespaces(&self) -> Vec<String> {
        let mut all: Vec<String> = self.namespaces.iter().map(|n| n.key().clone()).collect();
        all.sort();
        all
    }

    /// Stores an asset directly, creating its namespace
    pub fn put_asset(
        &self,
        path: &RemotePath,
        content: &[u8],
        posix: Option<PosixAttributes>,
    ) -> AssetMetadata {
        if let Some(parent) = path.parent() {
            self.put_namespace(&parent);
        }
        let meta = AssetMetadata {
            id: uuid::Uuid::new_v4().to_string(),
            path: path.clone(),
            destroyed: false,
            content: Some(ContentInfo {
                size: content.len() as u64,
                csum: Some(crc32fast::hash(content)),
            }),
            posix,
        };
        self.insert(meta.clone(), content.to_vec());
        meta
    }

    /// Stores an asset that has metadata but no content
    pub fn put_empty_asset(&self, path: &RemotePath, posix: Option<PosixAttributes>) -> AssetMetadata {
        if let Some(parent) = path.parent() {
            self.put_namespace(&parent);
        }
        let meta = AssetMetadata {
            id: uuid::Uuid::new_v4().to_string(),
            path: path.clone(),
            destroyed: false,
            content: None,
            posix,
        };
        self.insert(meta.clone(), Vec::new());
        meta
    }

    fn insert(&self, meta: AssetMetadata, content: Vec<u8>) {
        let key = meta.path.as_str().to_string();
        if let Some(old) = self.assets.get(&key) {
            self.ids.remove(&old.meta.id);
        }
        self.ids.insert(meta.id.clone(), key.clone());
        self.assets.insert(key, StoredAsset { meta, content });
    }

    pub fn asset(&self, path: &str) -> Option<AssetMetadata> {
        self.assets.get(path).map(|a| a.meta.clone())
    }

    pub fn content(&self, path: &str) -> Option<Vec<u8>> {
        self.assets.get(path).map(|a| a.content.clone())
    }

    pub fn asset_count(&self) -> usize {
        self.assets.len()
    }

    /// Marks the asset at `path` soft-destroyed
    pub fn soft_destroy(&self, path: &str) -> bool {
        match self.assets.get_mut(path) {
            Some(mut asset) => {
                asset.meta.destroyed = true;
                true
            }
            None => false,
        }
    }

    /// Every `mail.send` argument object received so far
    pub fn mails(&self) -> Vec<Value> {
        self.mails.lock().map(|m| m.clone()).unwrap_or_default()
    }

    /// Service names of every call received, in arrival order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn calls_to(&self, service: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == service).count()
    }

    pub fn authentications(&self) -> usize {
        self.authentications.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------

    /// The next `n` calls fail with a connection error
    pub fn fail_next_connections(&self, n: usize) {
        self.connection_failures.store(n, Ordering::SeqCst);
    }

    /// Calls fail with session-invalid until the next authentication
    pub fn invalidate_session(&self) {
        self.session_valid.store(false, Ordering::SeqCst);
    }

    /// The next `n` content writes report a wrong checksum
    pub fn corrupt_next_checksums(&self, n: usize) {
        self.checksum_corruptions.store(n, Ordering::SeqCst);
    }

    /// Every received upload chunk is followed by a pause of `delay`
    pub fn delay_input_chunks(&self, delay: Duration) {
        self.input_chunk_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    fn input_chunk_delay(&self) -> Duration {
        Duration::from_millis(self.input_chunk_delay_ms.load(Ordering::SeqCst))
    }

    /// Every call to `service` is rejected with `message`
    pub fn reject_service(&self, service: &str, message: &str) {
        if let Ok(mut rejections) = self.rejections.lock() {
            rejections.insert(service.to_string(), message.to_string());
        }
    }

    pub fn clear_rejections(&self) {
        if let Ok(mut rejections) = self.rejections.lock() {
            rejections.clear();
        }
    }

    fn take_one(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    // ------------------------------------------------------------------
    // Services
    // ------------------------------------------------------------------

    fn namespace_exists(&self, args: &Value) -> Result<Value, RemoteError> {
        let path = path_arg(services::NAMESPACE_EXISTS, args, "path")?;
        Ok(json!({ "exists": self.has_namespace(&path) }))
    }

    fn namespace_create(&self, args: &Value) -> Result<Value, RemoteError> {
        let path = path_arg(services::NAMESPACE_CREATE, args, "path")?;
        if self.has_namespace(&path) {
            return Err(RemoteError::rejected(
                services::NAMESPACE_CREATE,
                format!("namespace already exists: {path}"),
            ));
        }
        self.put_namespace(&path);
        Ok(json!({}))
    }

    fn asset_exists(&self, args: &Value) -> Result<Value, RemoteError> {
        let paths = paths_arg(services::ASSET_EXISTS, args)?;
        let exists: Vec<bool> = paths
            .iter()
            .map(|p| self.assets.contains_key(p.as_str()))
            .collect();
        Ok(json!({ "exists": exists }))
    }

    fn asset_get(&self, args: &Value, want_output: bool) -> Result<ServiceResponse, RemoteError> {
        if want_output {
            let path = path_arg(services::ASSET_GET, args, "path")?;
            let asset = self.assets.get(path.as_str()).map(|a| a.value().clone()).ok_or_else(|| {
                RemoteError::rejected(services::ASSET_GET, format!("asset not found: {path}"))
            })?;
            let length = asset.content.len() as u64;
            let chunks: Vec<std::io::Result<Vec<u8>>> = asset
                .content
                .chunks(OUTPUT_CHUNK_SIZE)
                .map(|c| Ok(c.to_vec()))
                .collect();
            return Ok(ServiceResponse {
                result: json!({ "asset": asset.meta }),
                output: Some(ServiceOutput {
                    length: Some(length),
                    stream: stream::iter(chunks).boxed(),
                }),
            });
        }

        let paths = paths_arg(services::ASSET_GET, args)?;
        let assets: Vec<AssetMetadata> = paths
            .iter()
            .filter_map(|p| self.assets.get(p.as_str()).map(|a| a.meta.clone()))
            .collect();
        Ok(ServiceResponse::json(json!({ "assets": assets })))
    }

    async fn asset_create(
        &self,
        args: &Value,
        input: Option<ServiceInput>,
    ) -> Result<Value, RemoteError> {
        let path = path_arg(services::ASSET_CREATE, args, "path")?;
        let auto_create = args
            .get("auto_create_namespace")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let posix = posix_arg(services::ASSET_CREATE, args)?;

        let parent = path.parent().unwrap_or_else(RemotePath::root);
        if !self.has_namespace(&parent) {
            if auto_create {
                self.put_namespace(&parent);
            } else {
                return Err(RemoteError::rejected(
                    services::ASSET_CREATE,
                    format!("namespace not found: {parent}"),
                ));
            }
        }
        if self.assets.contains_key(path.as_str()) {
            return Err(RemoteError::rejected(
                services::ASSET_CREATE,
                format!("asset already exists: {path}"),
            ));
        }

        let content = read_input(input, self.input_chunk_delay()).await?;
        let meta = AssetMetadata {
            id: uuid::Uuid::new_v4().to_string(),
            path,
            destroyed: false,
            content: content.as_deref().map(|c| self.describe(c)),
            posix,
        };
        self.insert(meta.clone(), content.unwrap_or_default());
        Ok(json!({ "asset": meta }))
    }

    async fn asset_set(
        &self,
        args: &Value,
        input: Option<ServiceInput>,
    ) -> Result<Value, RemoteError> {
        let id = str_arg(services::ASSET_SET, args, "id")?;
        let posix = posix_arg(services::ASSET_SET, args)?;
        let path = self.ids.get(id).map(|p| p.value().clone()).ok_or_else(|| {
            RemoteError::rejected(services::ASSET_SET, format!("asset not found: {id}"))
        })?;

        let content = read_input(input, self.input_chunk_delay()).await?;
        let mut asset = self.assets.get_mut(&path).ok_or_else(|| {
            RemoteError::rejected(services::ASSET_SET, format!("asset not found: {id}"))
        })?;
        if let Some(content) = content {
            asset.meta.content = Some(self.describe(&content));
            asset.content = content;
        }
        if posix.is_some() {
            asset.meta.posix = posix;
        }
        Ok(json!({ "asset": asset.meta }))
    }

    fn describe(&self, content: &[u8]) -> ContentInfo {
        let mut csum = crc32fast::hash(content);
        if Self::take_one(&self.checksum_corruptions) {
            csum ^= 0xFFFF_FFFF;
        }
        ContentInfo {
            size: content.len() as u64,
            csum: Some(csum),
        }
    }

    fn asset_soft_destroy(&self, args: &Value) -> Result<Value, RemoteError> {
        let mut count = 0usize;
        if let Some(ns) = args.get("namespace") {
            let ns = ns
                .as_str()
                .ok_or_else(|| bad_arg(services::ASSET_SOFT_DESTROY, "namespace"))
                .and_then(|s| parse_path(services::ASSET_SOFT_DESTROY, s))?;
            for mut asset in self.assets.iter_mut() {
                if asset.meta.path.is_or_is_descendant_of(&ns) && !asset.meta.destroyed {
                    asset.meta.destroyed = true;
                    count += 1;
                }
            }
        } else {
            for path in paths_arg(services::ASSET_SOFT_DESTROY, args)? {
                if self.soft_destroy(path.as_str()) {
                    count += 1;
                }
            }
        }
        Ok(json!({ "count": count }))
    }

    fn asset_soft_undestroy(&self, args: &Value) -> Result<Value, RemoteError> {
        let ids = args
            .get("ids")
            .and_then(Value::as_array)
            .ok_or_else(|| bad_arg(services::ASSET_SOFT_UNDESTROY, "ids"))?;
        let mut count = 0usize;
        for id in ids.iter().filter_map(Value::as_str) {
            let Some(path) = self.ids.get(id).map(|p| p.value().clone()) else {
                continue;
            };
            if let Some(mut asset) = self.assets.get_mut(&path) {
                asset.meta.destroyed = false;
                count += 1;
            }
        }
        Ok(json!({ "count": count }))
    }

    fn asset_query(&self, args: &Value) -> Result<Value, RemoteError> {
        let ns = path_arg(services::ASSET_QUERY, args, "namespace")?;
        let idx = args.get("idx").and_then(Value::as_u64).unwrap_or(0) as usize;
        let size = args.get("size").and_then(Value::as_u64).unwrap_or(100).max(1) as usize;

        let mut matching: Vec<AssetMetadata> = self
            .assets
            .iter()
            .filter(|a| !a.meta.destroyed && a.meta.path.is_or_is_descendant_of(&ns))
            .map(|a| a.meta.clone())
            .collect();
        matching.sort_by(|a, b| a.path.cmp(&b.path));

        let total = matching.len();
        let page: Vec<AssetMetadata> = matching.into_iter().skip(idx).take(size).collect();
        let remaining = total.saturating_sub(idx + page.len());
        Ok(json!({
            "assets": page,
            "cursor": { "idx": idx, "size": size, "remaining": remaining, "complete": remaining == 0 },
        }))
    }

    fn mail_send(&self, args: &Value) -> Result<Value, RemoteError> {
        for field in ["from", "to", "subject", "body"] {
            if args.get(field).is_none() {
                return Err(bad_arg(services::MAIL_SEND, field));
            }
        }
        if let Ok(mut mails) = self.mails.lock() {
            mails.push(args.clone());
        }
        Ok(json!({}))
    }
}

#[async_trait]
impl RemoteTransport for InMemoryStore {
    async fn authenticate(&self) -> Result<(), RemoteError> {
        self.authentications.fetch_add(1, Ordering::SeqCst);
        self.session_valid.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn call(&self, request: ServiceRequest) -> Result<ServiceResponse, RemoteError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(request.service.clone());
        }
        debug!(service = %request.service, "In-memory store call");

        if Self::take_one(&self.connection_failures) {
            return Err(RemoteError::Connection("injected connection failure".into()));
        }
        if !self.session_valid.load(Ordering::SeqCst) {
            return Err(RemoteError::SessionInvalid("session expired".into()));
        }
        let rejection = self
            .rejections
            .lock()
            .ok()
            .and_then(|r| r.get(&request.service).cloned());
        if let Some(message) = rejection {
            return Err(RemoteError::rejected(&request.service, message));
        }

        let ServiceRequest {
            service,
            args,
            input,
            want_output,
        } = request;

        let result = match service.as_str() {
            services::NAMESPACE_EXISTS => self.namespace_exists(&args)?,
            services::NAMESPACE_CREATE => self.namespace_create(&args)?,
            services::ASSET_EXISTS => self.asset_exists(&args)?,
            services::ASSET_GET => return self.asset_get(&args, want_output),
            services::ASSET_CREATE => self.asset_create(&args, input).await?,
            services::ASSET_SET => self.asset_set(&args, input).await?,
            services::ASSET_SOFT_DESTROY => self.asset_soft_destroy(&args)?,
            services::ASSET_SOFT_UNDESTROY => self.asset_soft_undestroy(&args)?,
            services::ASSET_QUERY => self.asset_query(&args)?,
            services::SERVER_PING => json!({}),
            services::MAIL_SEND => self.mail_send(&args)?,
            other => {
                return Err(RemoteError::rejected(other, "unknown service"));
            }
        };
        Ok(ServiceResponse::json(result))
    }

    async fn logoff(&self) -> Result<(), RemoteError> {
        self.session_valid.store(false, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Argument helpers
// ============================================================================

fn bad_arg(service: &str, field: &str) -> RemoteError {
    RemoteError::rejected(service, format!("missing or invalid argument '{field}'"))
}

fn parse_path(service: &str, raw: &str) -> Result<RemotePath, RemoteError> {
    RemotePath::new(raw).map_err(|e| RemoteError::rejected(service, e.to_string()))
}

fn str_arg<'a>(service: &str, args: &'a Value, field: &str) -> Result<&'a str, RemoteError> {
    args.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| bad_arg(service, field))
}

fn path_arg(service: &str, args: &Value, field: &str) -> Result<RemotePath, RemoteError> {
    parse_path(service, str_arg(service, args, field)?)
}

fn paths_arg(service: &str, args: &Value) -> Result<Vec<RemotePath>, RemoteError> {
    args.get("paths")
        .and_then(Value::as_array)
        .ok_or_else(|| bad_arg(service, "paths"))?
        .iter()
        .map(|p| {
            p.as_str()
                .ok_or_else(|| bad_arg(service, "paths"))
                .and_then(|s| parse_path(service, s))
        })
        .collect()
}

fn posix_arg(service: &str, args: &Value) -> Result<Option<PosixAttributes>, RemoteError> {
    match args.get("posix") {
        None | Some(Value::Null) => Ok(None),
        Some(v) => serde_json::from_value(v.clone())
            .map(Some)
            .map_err(|e| RemoteError::rejected(service, format!("invalid posix attributes: {e}"))),
    }
}

/// Drains an upload stream, checking the announced length
async fn read_input(
    input: Option<ServiceInput>,
    chunk_delay: Duration,
) -> Result<Option<Vec<u8>>, RemoteError> {
    let Some(mut input) = input else {
        return Ok(None);
    };
    let mut data = Vec::with_capacity(input.length as usize);
    while let Some(chunk) = input.stream.next().await {
        match chunk {
            Ok(bytes) => {
                data.extend_from_slice(&bytes);
                if !chunk_delay.is_zero() {
                    tokio::time::sleep(chunk_delay).await;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => return Err(RemoteError::Aborted),
            Err(e) => return Err(RemoteError::Protocol(format!("upload stream failed: {e}"))),
        }
    }
    if data.len() as u64 != input.length {
        return Err(RemoteError::Protocol(format!(
            "upload length mismatch: announced {} bytes, received {}",
            input.length,
            data.len()
        )));
    }
    Ok(Some(data))
}

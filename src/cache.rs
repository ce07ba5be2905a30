//! Per-tenant package item cache
//!
//! Items are keyed by full request path and never evicted one at a time.
//! Advancing the cache epoch drops everything at once; the epoch also tags
//! module specifiers so stale module instances are not reused.

use crate::error::{empty_response, HttpResponse, RepoError};
use crate::repo::RepoProvider;
use crate::tenant::{PackageItemConfig, Tenant};
use dashmap::DashMap;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Resolved, immutable content for one package path
#[derive(Debug, Clone, PartialEq)]
pub struct PackageItem {
    pub content: Bytes,
    pub content_type: String,
    /// Content hash, either supplied by the source or computed locally
    pub etag: String,
    /// Cache epoch the item was resolved under
    pub epoch: i64,
    pub cache_control: Option<String>,
    pub allow_origin: Option<String>,
}

impl PackageItem {
    /// Build an item, computing the content hash when the source supplied none
    pub fn new(name: &str, content: Bytes, sha: Option<String>, epoch: i64) -> Self {
        let etag = sha.unwrap_or_else(|| content_digest(&content));
        Self {
            content_type: content_type_for(name),
            content,
            etag,
            epoch,
            cache_control: None,
            allow_origin: None,
        }
    }

    /// Entity tag presented to clients: the content hash qualified by the
    /// cache epoch, so a reset or epoch advance changes it
    pub fn entity_tag(&self) -> String {
        format!("{}-{}", self.etag, self.epoch)
    }

    fn apply(&mut self, overrides: &PackageItemConfig) {
        if let Some(cache_control) = &overrides.cache_control {
            self.cache_control = Some(cache_control.clone());
        }
        if let Some(allow_origin) = &overrides.allow_origin {
            self.allow_origin = Some(allow_origin.clone());
        }
    }

    /// True when an `If-None-Match` header value names this item's entity tag
    pub fn matches_etag(&self, if_none_match: &str) -> bool {
        let entity_tag = self.entity_tag();
        if_none_match.split(',').any(|candidate| {
            let candidate = candidate.trim();
            if candidate == "*" {
                return true;
            }
            let candidate = candidate.strip_prefix("W/").unwrap_or(candidate);
            candidate.trim_matches('"') == entity_tag
        })
    }

    /// Static asset response honoring conditional requests
    pub fn to_response(&self, if_none_match: Option<&str>) -> HttpResponse {
        if if_none_match.is_some_and(|value| self.matches_etag(value)) {
            return empty_response(StatusCode::NOT_MODIFIED);
        }

        let mut builder = Response::builder()
            .status(StatusCode::OK)
            .header("etag", format!("\"{}\"", self.entity_tag()))
            .header("content-type", &self.content_type);
        if let Some(cache_control) = &self.cache_control {
            builder = builder.header("cache-control", cache_control);
        }
        if let Some(allow_origin) = &self.allow_origin {
            builder = builder.header("access-control-allow-origin", allow_origin);
        }

        builder
            .body(Full::new(self.content.clone()))
            .unwrap_or_else(|_| {
                // Overrides come from tenant config and may not be valid header values
                Response::builder()
                    .status(StatusCode::OK)
                    .header("content-type", &self.content_type)
                    .body(Full::new(self.content.clone()))
                    .expect("valid response with StatusCode enum")
            })
    }
}

#[derive(Debug, Clone)]
struct CachedItem {
    epoch: i64,
    item: Arc<PackageItem>,
}

/// Package items for one tenant, valid for a single cache epoch
#[derive(Debug)]
pub struct PackageItemCache {
    epoch: AtomicI64,
    items: DashMap<String, CachedItem>,
}

impl PackageItemCache {
    pub fn new() -> Self {
        Self {
            epoch: AtomicI64::new(next_epoch()),
            items: DashMap::new(),
        }
    }

    pub fn epoch(&self) -> i64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Cached item for `path` at the current epoch
    pub fn get(&self, path: &str) -> Option<Arc<PackageItem>> {
        let epoch = self.epoch();
        self.items
            .get(path)
            .filter(|cached| cached.epoch == epoch)
            .map(|cached| Arc::clone(&cached.item))
    }

    /// Store an item resolved during `epoch`. Items resolved under an epoch
    /// that has since been advanced are returned but not stored.
    pub fn insert(&self, path: &str, item: PackageItem, epoch: i64) -> Arc<PackageItem> {
        let item = Arc::new(item);
        if epoch == self.epoch() {
            self.items.insert(
                path.to_string(),
                CachedItem {
                    epoch,
                    item: Arc::clone(&item),
                },
            );
        }
        item
    }

    /// Invalidate every cached item, returning the new epoch
    pub fn advance_epoch(&self) -> i64 {
        let epoch = next_epoch();
        self.epoch.store(epoch, Ordering::Release);
        self.items.retain(|_, cached| cached.epoch == epoch);
        epoch
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl Default for PackageItemCache {
    fn default() -> Self {
        Self::new()
    }
}

static LAST_EPOCH: AtomicI64 = AtomicI64::new(0);

/// Wall-clock milliseconds, bumped when needed so every call returns a value
/// strictly greater than the one before
pub fn next_epoch() -> i64 {
    let now = chrono::Utc::now().timestamp_millis();
    let mut prev = LAST_EPOCH.load(Ordering::Relaxed);
    loop {
        let next = now.max(prev + 1);
        match LAST_EPOCH.compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => prev = actual,
        }
    }
}

/// SHA-256 of the content as lowercase hex
pub fn content_digest(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// Content type for a file name.
///
/// Only textual types carry `; charset=utf-8`. Binary types such as images,
/// fonts and archives are sent without a charset parameter.
pub fn content_type_for(name: &str) -> String {
    let extension = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    let mime = match extension.as_str() {
        "ts" => "application/typescript",
        "js" | "mjs" => "application/javascript",
        "json" | "map" => "application/json",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "txt" => "text/plain",
        "md" => "text/markdown",
        "csv" => "text/csv",
        "xml" => "application/xml",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "otf" => "font/otf",
        "pdf" => "application/pdf",
        "wasm" => "application/wasm",
        "zip" => "application/zip",
        "mp4" => "video/mp4",
        "mp3" => "audio/mpeg",
        _ => "text/plain",
    };

    if is_textual(mime) {
        format!("{}; charset=utf-8", mime)
    } else {
        mime.to_string()
    }
}

fn is_textual(mime: &str) -> bool {
    mime.starts_with("text/")
        || matches!(
            mime,
            "application/typescript"
                | "application/javascript"
                | "application/json"
                | "application/xml"
                | "image/svg+xml"
        )
}

/// Resolve a package path for `tenant`, consulting the cache first.
///
/// The package is the first path segment. Its manifest selects the ref and
/// whether content comes from the platform repository or the tenant's own.
pub async fn resolve_package_item(
    tenant: &Tenant,
    platform_repo: &dyn RepoProvider,
    path: &str,
) -> Result<Option<Arc<PackageItem>>, RepoError> {
    if let Some(item) = tenant.cache.get(path) {
        return Ok(Some(item));
    }
    let epoch = tenant.cache.epoch();

    let Some(package_key) = path.split('/').nth(1).filter(|key| !key.is_empty()) else {
        return Ok(None);
    };
    let Some(package) = tenant.app.packages.get(package_key) else {
        debug!(hostname = %tenant.hostname, package = %package_key, "Package not declared");
        return Ok(None);
    };

    let mut file_path = path
        .get(package_key.len() + 2..)
        .unwrap_or_default()
        .to_string();
    if let Some(tag) = package.tag.as_deref().filter(|tag| !tag.is_empty()) {
        file_path.push_str("?ref=");
        file_path.push_str(tag);
    }

    let repo: &dyn RepoProvider = if package.use_local_repo {
        platform_repo
    } else {
        tenant.repo.as_ref()
    };
    let Some(file) = repo.get_file(&file_path, package_key).await? else {
        return Ok(None);
    };

    let mut item = PackageItem::new(&file.name, file.content, file.sha, epoch);

    // Less specific prefixes first so the longest matching prefix wins
    let mut overrides: Vec<(&String, &PackageItemConfig)> = package
        .package_item_config
        .iter()
        .filter(|(prefix, _)| {
            path.strip_prefix('/')
                .and_then(|p| p.strip_prefix(package_key))
                .is_some_and(|rest| rest.starts_with(prefix.as_str()))
        })
        .collect();
    overrides.sort_by_key(|(prefix, _)| prefix.len());
    for (_, config) in overrides {
        item.apply(config);
    }

    debug!(hostname = %tenant.hostname, path = %path, etag = %item.etag, "Package item resolved");
    Ok(Some(tenant.cache.insert(path, item, epoch)))
}

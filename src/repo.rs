//! Repository providers: the uniform interface over package content sources

use crate::error::RepoError;
use async_trait::async_trait;
use hyper::body::Bytes;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Provider name used when none is configured
pub const DEFAULT_PROVIDER: &str = "FileSystem";

/// A file fetched from a repository
#[derive(Debug, Clone)]
pub struct RepoFile {
    /// Base name of the file, used for content-type lookup
    pub name: String,
    pub content: Bytes,
    /// Content hash supplied by the source, when it has one
    pub sha: Option<String>,
}

/// Capability set every repository backend offers.
///
/// `Ok(None)` means the file is confirmed absent. `Err` means the fetch itself
/// failed and the caller may retry.
#[async_trait]
pub trait RepoProvider: Send + Sync {
    /// Provider name as it appears in configuration
    fn name(&self) -> &str;

    /// Fetch raw file bytes. `path` may carry a `?ref=<tag>` suffix.
    async fn get_file(&self, path: &str, package: &str) -> Result<Option<RepoFile>, RepoError>;

    /// Fetch a file and decode it as UTF-8 text
    async fn get_config_file(
        &self,
        path: &str,
        package: &str,
    ) -> Result<Option<String>, RepoError> {
        let Some(file) = self.get_file(path, package).await? else {
            return Ok(None);
        };
        String::from_utf8(file.content.to_vec())
            .map(Some)
            .map_err(|e| RepoError::InvalidContent {
                location: format!("{}/{}", package, path),
                reason: e.to_string(),
            })
    }
}

/// Split a provider path into the file path and its optional `ref` query value
pub fn split_ref(path: &str) -> (&str, Option<&str>) {
    match path.split_once('?') {
        Some((file, query)) => {
            let git_ref = query
                .split('&')
                .filter_map(|pair| pair.split_once('='))
                .find(|(key, _)| *key == "ref")
                .map(|(_, value)| value)
                .filter(|value| !value.is_empty());
            (file, git_ref)
        }
        None => (path, None),
    }
}

/// Settings that select and configure a repository provider.
///
/// Appears both in the process TOML config and inside tenant JSON documents.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RepoSettings {
    /// Registered provider name (default: FileSystem)
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Directory for FileSystem, account or organization for GitHub
    #[serde(default)]
    pub root: String,

    /// Access credential for authenticated remote fetches
    pub credentials: Option<String>,

    /// Override for the remote contents API base URL
    #[serde(alias = "api_url")]
    pub api_url: Option<String>,

    /// Override for the remote raw content base URL
    #[serde(alias = "raw_url")]
    pub raw_url: Option<String>,
}

impl Default for RepoSettings {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            root: String::new(),
            credentials: None,
            api_url: None,
            raw_url: None,
        }
    }
}

fn default_provider() -> String {
    DEFAULT_PROVIDER.to_string()
}

type ProviderFactory = Arc<dyn Fn(&RepoSettings) -> Arc<dyn RepoProvider> + Send + Sync>;

/// Named provider constructors. Tenant configs select their provider by name.
#[derive(Clone)]
pub struct ProviderRegistry {
    factories: HashMap<String, ProviderFactory>,
}

impl ProviderRegistry {
    /// Create a registry with no providers
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a provider constructor under `name`, replacing any previous one
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&RepoSettings) -> Arc<dyn RepoProvider> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Construct the provider named in `settings`, if registered
    pub fn build(&self, settings: &RepoSettings) -> Option<Arc<dyn RepoProvider>> {
        self.factories
            .get(&settings.provider)
            .map(|factory| factory(settings))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered provider names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(DEFAULT_PROVIDER, |settings| {
            Arc::new(FileSystemProvider::new(&settings.root)) as Arc<dyn RepoProvider>
        });
        registry.register(crate::github::PROVIDER_NAME, |settings| {
            Arc::new(crate::github::GitHubProvider::new(settings)) as Arc<dyn RepoProvider>
        });
        registry
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.names())
            .finish()
    }
}

/// Serves packages from `<root>/<package>/<path>` on local disk
#[derive(Debug, Clone)]
pub struct FileSystemProvider {
    root: PathBuf,
}

impl FileSystemProvider {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str, package: &str) -> Result<PathBuf, RepoError> {
        let (file, _) = split_ref(path);
        let relative = Path::new(package).join(file.trim_start_matches('/'));

        // Only plain segments may appear below the root
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(RepoError::InvalidPath(format!("{}/{}", package, file)));
        }

        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl RepoProvider for FileSystemProvider {
    fn name(&self) -> &str {
        DEFAULT_PROVIDER
    }

    async fn get_file(&self, path: &str, package: &str) -> Result<Option<RepoFile>, RepoError> {
        let full_path = self.resolve(path, package)?;

        match tokio::fs::read(&full_path).await {
            Ok(content) => {
                let name = full_path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                Ok(Some(RepoFile {
                    name,
                    content: Bytes::from(content),
                    sha: None,
                }))
            }
            Err(e) if is_absent(&e) => {
                debug!(path = %full_path.display(), "File not found in repository");
                Ok(None)
            }
            Err(e) => Err(RepoError::Io {
                path: full_path.display().to_string(),
                source: e,
            }),
        }
    }
}

/// Directories and paths below regular files are not files either
fn is_absent(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::NotFound | ErrorKind::IsADirectory | ErrorKind::NotADirectory
    )
}

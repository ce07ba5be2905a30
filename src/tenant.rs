use crate::cache::PackageItemCache;
use crate::error::InitError;
use crate::repo::{ProviderRegistry, RepoProvider, RepoSettings};
use crate::route::{RouteMapping, RouteTable};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Tenant document stored at `.tenants/<hostname>.json` in the platform repo
#[derive(Debug, Deserialize, Clone, Default)]
pub struct TenantConfig {
    /// Stable tenant identifier (defaults to the hostname)
    pub id: Option<String>,

    pub application: Option<ApplicationRef>,

    /// Tenant-level settings, kept as-is
    #[serde(default)]
    pub settings: Map<String, Value>,
}

/// The application a tenant runs and where its repository lives
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ApplicationRef {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub repo: RepoSettings,
}

/// Application document stored at `.applications/<name>.json` in the
/// application's own repository
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default)]
    pub packages: HashMap<String, PackageConfig>,

    #[serde(default)]
    pub route_mappings: Vec<RouteMapping>,

    #[serde(default)]
    pub app_settings: Map<String, Value>,
}

impl AppConfig {
    /// Default feature flags from `appSettings.featureFlags`, given either as
    /// a colon-separated string or a list
    pub fn feature_flags(&self) -> Vec<String> {
        match self.app_settings.get("featureFlags") {
            Some(Value::String(flags)) => flags
                .split(':')
                .filter(|flag| !flag.is_empty())
                .map(String::from)
                .collect(),
            Some(Value::Array(flags)) => flags
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Package manifest entry
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct PackageConfig {
    /// Ref (branch or tag) to fetch package files at
    pub tag: Option<String>,

    /// Serve from the platform repository instead of the tenant's
    #[serde(default)]
    pub use_local_repo: bool,

    /// Header overrides keyed by path prefix within the package
    #[serde(default)]
    pub package_item_config: HashMap<String, PackageItemConfig>,
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PackageItemConfig {
    pub cache_control: Option<String>,
    pub allow_origin: Option<String>,
}

/// A ready tenant: one hostname's configuration, repository and cache
pub struct Tenant {
    pub hostname: String,
    pub config: TenantConfig,
    pub app: AppConfig,
    /// Provider bound to the tenant's application repository
    pub repo: Arc<dyn RepoProvider>,
    pub routes: RouteTable,
    pub cache: PackageItemCache,
}

impl Tenant {
    pub fn new(
        hostname: impl Into<String>,
        config: TenantConfig,
        app: AppConfig,
        repo: Arc<dyn RepoProvider>,
    ) -> Self {
        let routes = RouteTable::new(&app.route_mappings);
        Self {
            hostname: hostname.into(),
            config,
            app,
            repo,
            routes,
            cache: PackageItemCache::new(),
        }
    }

    pub fn id(&self) -> &str {
        self.config.id.as_deref().unwrap_or(&self.hostname)
    }

    pub fn application_name(&self) -> &str {
        self.config
            .application
            .as_ref()
            .map(|app| app.name.as_str())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for Tenant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tenant")
            .field("hostname", &self.hostname)
            .field("application", &self.application_name())
            .field("repo", &self.repo.name())
            .field("routes", &self.routes.len())
            .field("epoch", &self.cache.epoch())
            .finish()
    }
}

/// Lifecycle state of a hostname. A failed initialization goes straight
/// back to `Unknown` so the next request retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TenantState {
    /// Never seen, evicted, or last initialization failed
    Unknown,
    /// Configuration fetch in progress
    Initializing,
    /// Tenant is registered and addressable
    Ready,
}

/// Process-wide map from hostname to tenant
#[derive(Debug, Default)]
pub struct TenantRegistry {
    tenants: DashMap<String, Arc<Tenant>>,
    /// Hostnames with an initialization in flight, and when it started
    initializing: DashMap<String, Instant>,
}

impl TenantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, hostname: &str) -> Option<Arc<Tenant>> {
        self.tenants.get(hostname).map(|t| Arc::clone(t.value()))
    }

    pub fn state(&self, hostname: &str) -> TenantState {
        if self.tenants.contains_key(hostname) {
            TenantState::Ready
        } else if self.initializing.contains_key(hostname) {
            TenantState::Initializing
        } else {
            TenantState::Unknown
        }
    }

    /// Claim initialization of `hostname`.
    ///
    /// Returns `None` when the tenant is already ready or another request
    /// holds the claim. At most one claim per hostname exists at a time.
    pub fn try_begin(&self, hostname: &str) -> Option<InitClaim<'_>> {
        match self.initializing.entry(hostname.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(entry) => {
                if self.tenants.contains_key(hostname) {
                    return None;
                }
                entry.insert(Instant::now());
                debug!(hostname = %hostname, "Tenant initializing");
                Some(InitClaim {
                    registry: self,
                    hostname: hostname.to_string(),
                    completed: false,
                })
            }
        }
    }

    /// Remove a ready tenant and its cache. Evicting an absent hostname is a no-op.
    pub fn evict(&self, hostname: &str) -> Option<Arc<Tenant>> {
        self.tenants.remove(hostname).map(|(_, tenant)| tenant)
    }

    /// Register an already-built tenant, replacing any existing one
    pub fn insert(&self, tenant: Tenant) -> Arc<Tenant> {
        let tenant = Arc::new(tenant);
        self.tenants
            .insert(tenant.hostname.clone(), Arc::clone(&tenant));
        tenant
    }

    pub fn len(&self) -> usize {
        self.tenants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tenants.is_empty()
    }

    pub fn hostnames(&self) -> Vec<String> {
        self.tenants.iter().map(|t| t.key().clone()).collect()
    }
}

/// Exclusive right to initialize one hostname.
///
/// Dropping the claim without completing it returns the hostname to `Unknown`.
pub struct InitClaim<'a> {
    registry: &'a TenantRegistry,
    hostname: String,
    completed: bool,
}

impl InitClaim<'_> {
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Register the tenant as ready and release the claim
    pub fn complete(mut self, tenant: Tenant) -> Arc<Tenant> {
        let started = self
            .registry
            .initializing
            .get(&self.hostname)
            .map(|s| *s.value());
        let tenant = self.registry.insert(tenant);
        self.registry.initializing.remove(&self.hostname);
        self.completed = true;

        info!(
            hostname = %self.hostname,
            application = %tenant.application_name(),
            routes = tenant.routes.len(),
            elapsed_ms = started.map(|s| s.elapsed().as_millis() as u64).unwrap_or(0),
            "Tenant ready"
        );
        tenant
    }
}

impl Drop for InitClaim<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.registry.initializing.remove(&self.hostname);
            debug!(hostname = %self.hostname, "Tenant initialization released");
        }
    }
}

/// Fetch and assemble a tenant.
///
/// The tenant document comes from the platform repository. The application
/// document comes from the repository the tenant document points at.
pub async fn load_tenant(
    hostname: &str,
    platform_repo: &dyn RepoProvider,
    providers: &ProviderRegistry,
    config_package: &str,
) -> Result<Tenant, InitError> {
    let tenant_path = format!(".tenants/{}.json", hostname);
    let text = platform_repo
        .get_config_file(&tenant_path, config_package)
        .await?
        .ok_or_else(|| InitError::TenantNotRegistered(hostname.to_string()))?;
    let config: TenantConfig = serde_json::from_str(&text).map_err(|source| {
        InitError::InvalidConfig {
            what: "tenant",
            source,
        }
    })?;

    let application = config
        .application
        .as_ref()
        .filter(|app| !app.name.is_empty())
        .ok_or_else(|| InitError::ApplicationNotSpecified(hostname.to_string()))?;

    let repo = providers.build(&application.repo).ok_or_else(|| {
        warn!(
            hostname = %hostname,
            provider = %application.repo.provider,
            registered = ?providers.names(),
            "Tenant names an unregistered repo provider"
        );
        InitError::UnknownProvider(application.repo.provider.clone())
    })?;

    let app_path = format!(".applications/{}.json", application.name);
    let text = repo
        .get_config_file(&app_path, config_package)
        .await?
        .ok_or_else(|| InitError::ApplicationNotFound(application.name.clone()))?;
    let app: AppConfig = serde_json::from_str(&text).map_err(|source| InitError::InvalidConfig {
        what: "application",
        source,
    })?;

    Ok(Tenant::new(hostname, config, app, repo))
}

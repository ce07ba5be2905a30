//! Server modules: compiled handlers addressed by package module path
//!
//! A module is importable for a tenant only when its source resolves through
//! the tenant's packages. Instances are keyed by a specifier carrying the
//! hostname and cache epoch, so advancing the epoch yields fresh instances.

use crate::cache::resolve_package_item;
use crate::context::InvocationContext;
use crate::error::{HttpResponse, ModuleError};
use crate::repo::RepoProvider;
use crate::request::LOOPBACK_HOST;
use crate::tenant::Tenant;
use crate::testrunner::TestRunner;
use dashmap::DashMap;
use futures::future::BoxFuture;
use hyper::Method;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// Module extension appended to server paths
pub const MODULE_EXTENSION: &str = ".ts";

/// Result of a server function: a response, or `None` for 204
pub type HandlerFuture = BoxFuture<'static, anyhow::Result<Option<HttpResponse>>>;

type Handler = Arc<dyn Fn(InvocationContext) -> HandlerFuture + Send + Sync>;

/// Registers test tasks on a runner
pub type SuiteFn = Arc<dyn Fn(&mut TestRunner) + Send + Sync>;

/// An exported function and the method it answers
#[derive(Clone)]
pub struct ServerFunction {
    pub method: Method,
    handler: Handler,
}

impl ServerFunction {
    pub fn call(&self, ctx: InvocationContext) -> HandlerFuture {
        (self.handler)(ctx)
    }
}

impl std::fmt::Debug for ServerFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerFunction")
            .field("method", &self.method)
            .finish_non_exhaustive()
    }
}

/// A module's exports
#[derive(Clone, Default)]
pub struct ServerModule {
    functions: HashMap<String, ServerFunction>,
    test_suite: Option<SuiteFn>,
}

impl ServerModule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Export `name`, answering `method`
    pub fn export<F, Fut>(mut self, name: impl Into<String>, method: Method, f: F) -> Self
    where
        F: Fn(InvocationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<HttpResponse>>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |ctx| -> HandlerFuture { Box::pin(f(ctx)) });
        self.functions
            .insert(name.into(), ServerFunction { method, handler });
        self
    }

    /// Default export used by the test runner
    pub fn test_suite<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut TestRunner) + Send + Sync + 'static,
    {
        self.test_suite = Some(Arc::new(f));
        self
    }

    pub fn function(&self, name: &str) -> Option<&ServerFunction> {
        self.functions.get(name)
    }

    pub fn suite(&self) -> Option<&SuiteFn> {
        self.test_suite.as_ref()
    }

    pub fn exports(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for ServerModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerModule")
            .field("exports", &self.exports())
            .field("test_suite", &self.test_suite.is_some())
            .finish()
    }
}

type ModuleFactory = Arc<dyn Fn() -> ServerModule + Send + Sync>;

/// Module constructors keyed by module path (`/<package>/.../<name>.ts`)
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    factories: HashMap<String, ModuleFactory>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, path: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> ServerModule + Send + Sync + 'static,
    {
        self.factories.insert(path.into(), Arc::new(factory));
        self
    }

    pub fn contains(&self, path: &str) -> bool {
        self.factories.contains_key(path)
    }

    pub fn paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        paths.sort_unstable();
        paths
    }

    fn instantiate(&self, path: &str) -> Option<ServerModule> {
        self.factories.get(path).map(|factory| factory())
    }
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.paths())
            .finish()
    }
}

/// Specifier a module is cached under for one tenant epoch
pub fn module_specifier(module_path: &str, hostname: &str, epoch: i64) -> String {
    format!(
        "http://{}{}?eTag={}:{}",
        LOOPBACK_HOST, module_path, hostname, epoch
    )
}

fn specifier_prefix(module_path: &str, hostname: &str) -> String {
    format!("http://{}{}?eTag={}:", LOOPBACK_HOST, module_path, hostname)
}

/// Split a server path into its module path and exported function name.
///
/// `/app/server/endpoint/message` names `message` in `/app/server/endpoint.ts`.
pub fn split_function_path(path: &str) -> Option<(String, &str)> {
    let (module, function) = path.rsplit_once('/')?;
    if module.is_empty() || function.is_empty() {
        return None;
    }
    Some((format!("{}{}", module, MODULE_EXTENSION), function))
}

/// Imports modules for tenants, caching one instance per specifier
#[derive(Debug)]
pub struct ModuleLoader {
    registry: ModuleRegistry,
    instances: DashMap<String, Arc<ServerModule>>,
}

impl ModuleLoader {
    pub fn new(registry: ModuleRegistry) -> Self {
        Self {
            registry,
            instances: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    /// Import `module_path` for `tenant` at its current cache epoch
    pub async fn import(
        &self,
        tenant: &Tenant,
        platform_repo: &dyn RepoProvider,
        module_path: &str,
    ) -> Result<Arc<ServerModule>, ModuleError> {
        let epoch = tenant.cache.epoch();
        let specifier = module_specifier(module_path, &tenant.hostname, epoch);

        if let Some(instance) = self.instances.get(&specifier) {
            return Ok(Arc::clone(instance.value()));
        }

        if resolve_package_item(tenant, platform_repo, module_path)
            .await?
            .is_none()
        {
            return Err(ModuleError::NotFound(module_path.to_string()));
        }
        let module = self
            .registry
            .instantiate(module_path)
            .ok_or_else(|| ModuleError::NotFound(module_path.to_string()))?;

        // Instances from earlier epochs of this tenant are never reachable again
        let stale = specifier_prefix(module_path, &tenant.hostname);
        self.instances
            .retain(|key, _| key == &specifier || !key.starts_with(&stale));

        debug!(hostname = %tenant.hostname, specifier = %specifier, "Module instantiated");
        let instance = self
            .instances
            .entry(specifier)
            .or_insert_with(|| Arc::new(module));
        Ok(Arc::clone(instance.value()))
    }

    /// Drop every cached instance belonging to `hostname`
    pub fn forget_tenant(&self, hostname: &str) {
        let marker = format!("?eTag={}:", hostname);
        self.instances.retain(|key, _| !key.contains(&marker));
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }
}

/// Suffix relative `.ts` specifiers in `import`/`export ... from` statements
/// with `?eTag=<etag>` so the loader fetches them at the same epoch
pub fn tag_module_imports(source: &str, etag: &str) -> String {
    let mut out = String::with_capacity(source.len());
    for line in source.split_inclusive('\n') {
        out.push_str(&tag_line(line, etag).unwrap_or_else(|| line.to_string()));
    }
    out
}

fn tag_line(line: &str, etag: &str) -> Option<String> {
    let trimmed = line.trim_start();
    if !(trimmed.starts_with("import ") || trimmed.starts_with("export ")) {
        return None;
    }

    let from = line.find(" from ")? + " from ".len();
    let rest = &line[from..];
    let quote_offset = rest.find(['"', '\''])?;
    let quote = rest[quote_offset..].chars().next()?;
    let start = from + quote_offset + 1;
    let len = line[start..].find(quote)?;
    let specifier = &line[start..start + len];

    if !specifier.ends_with(MODULE_EXTENSION) {
        return None;
    }

    let end = start + len;
    Some(format!(
        "{}?eTag={}{}",
        &line[..end],
        etag,
        &line[end..]
    ))
}

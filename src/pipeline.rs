//! Request pipeline: a fixed sequence of stages, each either answering the
//! request or passing it on.

use crate::cache::resolve_package_item;
use crate::config::ServerConfig;
use crate::context::build_context;
use crate::error::{
    empty_response, error_response, json_response, text_response, GatewayErrorCode, HttpResponse,
    ModuleError, RepoError,
};
use crate::module::{
    split_function_path, tag_module_imports, ModuleLoader, ModuleRegistry, MODULE_EXTENSION,
};
use crate::repo::{ProviderRegistry, RepoProvider};
use crate::request::GatewayRequest;
use crate::route::RouteTarget;
use crate::tenant::{load_tenant, TenantRegistry, TenantState};
use crate::testrunner::{run_tests, TestRunRequest};
use futures::FutureExt;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Method, Response, StatusCode};
use parking_lot::RwLock;
use serde_json::{json, Map, Value};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const INITIALIZING_MESSAGE: &str =
    "Oops.  Your application is initializing. Please wait, then try your request again.";

/// Pipeline stages in the order they run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Reject requests for a tenant that is mid-initialization
    Guard,
    /// Initialize the tenant on first contact
    Bootstrap,
    /// `/~/` endpoints
    Operational,
    /// Module sources requested by the loader on the loopback host
    ModuleSource,
    /// Map the request path through the tenant's route table
    RouteResolution,
    StaticAsset,
    ServerFunction,
}

pub const PIPELINE: [Stage; 7] = [
    Stage::Guard,
    Stage::Bootstrap,
    Stage::Operational,
    Stage::ModuleSource,
    Stage::RouteResolution,
    Stage::StaticAsset,
    Stage::ServerFunction,
];

/// Shared state behind every request
pub struct Gateway {
    settings: ServerConfig,
    platform_repo: Arc<dyn RepoProvider>,
    providers: ProviderRegistry,
    tenants: TenantRegistry,
    modules: ModuleLoader,
    server_settings: RwLock<Map<String, Value>>,
}

impl Gateway {
    pub fn new(
        settings: ServerConfig,
        platform_repo: Arc<dyn RepoProvider>,
        providers: ProviderRegistry,
        modules: ModuleRegistry,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            platform_repo,
            providers,
            tenants: TenantRegistry::new(),
            modules: ModuleLoader::new(modules),
            server_settings: RwLock::new(Map::new()),
        })
    }

    pub fn settings(&self) -> &ServerConfig {
        &self.settings
    }

    pub fn tenants(&self) -> &TenantRegistry {
        &self.tenants
    }

    pub fn modules(&self) -> &ModuleLoader {
        &self.modules
    }

    pub fn server_settings(&self) -> Map<String, Value> {
        self.server_settings.read().clone()
    }

    /// Fetch `.servers/<name>.json` from the platform repository.
    ///
    /// A missing document leaves the server without settings.
    pub async fn load_server_settings(&self) -> anyhow::Result<()> {
        let Some(name) = self.settings.server_config.as_deref() else {
            warn!("No server configuration named, server is unprotected");
            return Ok(());
        };

        let path = format!(".servers/{}.json", name);
        let text = self
            .platform_repo
            .get_config_file(&path, &self.settings.config_package)
            .await?;

        match text {
            Some(text) => {
                let settings: Map<String, Value> = serde_json::from_str(&text)
                    .map_err(|e| anyhow::anyhow!("Invalid server configuration {}: {}", path, e))?;
                info!(server_config = %name, keys = settings.len(), "Server configuration loaded");
                *self.server_settings.write() = settings;
            }
            None => {
                warn!(server_config = %name, "Server configuration not found, server is unprotected");
            }
        }
        Ok(())
    }

    /// Run `req` through the pipeline
    pub async fn handle(&self, mut req: GatewayRequest) -> HttpResponse {
        for stage in PIPELINE {
            if let Some(response) = self.run_stage(stage, &mut req).await {
                return response;
            }
        }
        text_response(StatusCode::NOT_FOUND, "No request handler.")
    }

    async fn run_stage(&self, stage: Stage, req: &mut GatewayRequest) -> Option<HttpResponse> {
        match stage {
            Stage::Guard => self.guard(req),
            Stage::Bootstrap => self.bootstrap(req).await,
            Stage::Operational => self.operational(req).await,
            Stage::ModuleSource => self.module_source(req).await,
            Stage::RouteResolution => {
                self.resolve_route(req);
                None
            }
            Stage::StaticAsset => self.static_asset(req).await,
            Stage::ServerFunction => self.server_function(req).await,
        }
    }

    fn guard(&self, req: &GatewayRequest) -> Option<HttpResponse> {
        match self.tenants.state(&req.hostname) {
            TenantState::Initializing => Some(initializing_response()),
            _ => None,
        }
    }

    async fn bootstrap(&self, req: &GatewayRequest) -> Option<HttpResponse> {
        if req.is_operational() || req.is_loopback_host() {
            return None;
        }
        if self.tenants.state(&req.hostname) == TenantState::Ready {
            return None;
        }

        let Some(claim) = self.tenants.try_begin(&req.hostname) else {
            // Lost the race: either another request is initializing or it just finished
            return match self.tenants.state(&req.hostname) {
                TenantState::Ready => None,
                _ => Some(initializing_response()),
            };
        };

        match load_tenant(
            &req.hostname,
            self.platform_repo.as_ref(),
            &self.providers,
            &self.settings.config_package,
        )
        .await
        {
            Ok(tenant) => {
                claim.complete(tenant);
                None
            }
            Err(e) => {
                error!(hostname = %req.hostname, error = %e, "Tenant initialization failed");
                drop(claim);
                Some(error_response(
                    GatewayErrorCode::TenantInitFailure,
                    format!("TenantInitHandler[{}]", req.hostname),
                ))
            }
        }
    }

    async fn operational(&self, req: &GatewayRequest) -> Option<HttpResponse> {
        if !req.is_operational() {
            return None;
        }

        match (&req.method, req.path.as_str()) {
            (&Method::GET, "/~/healthcheck") => Some(text_response(StatusCode::OK, "OK")),
            (&Method::GET, "/~/resettenant") => Some(self.reset_tenant(&req.hostname)),
            (&Method::GET, "/~/refreshcache") => Some(self.refresh_cache(&req.hostname)),
            (&Method::POST, "/~/runtest") => Some(self.run_test(req).await),
            _ => None,
        }
    }

    fn reset_tenant(&self, hostname: &str) -> HttpResponse {
        if self.tenants.evict(hostname).is_some() {
            info!(hostname = %hostname, "Tenant reset");
        }
        self.modules.forget_tenant(hostname);
        text_response(StatusCode::OK, "Tenant application was reset.")
    }

    fn refresh_cache(&self, hostname: &str) -> HttpResponse {
        let Some(tenant) = self.tenants.get(hostname) else {
            return error_response(GatewayErrorCode::NotFound, "Tenant Not Found");
        };
        let epoch = tenant.cache.advance_epoch();
        info!(hostname = %hostname, epoch, "Tenant cache refreshed");
        json_response(StatusCode::OK, json!({ "epoch": epoch }).to_string())
    }

    async fn run_test(&self, req: &GatewayRequest) -> HttpResponse {
        let Some(tenant) = self.tenants.get(&req.hostname) else {
            return error_response(GatewayErrorCode::NotFound, "Tenant Not Found");
        };
        let request: TestRunRequest = match serde_json::from_slice(&req.body) {
            Ok(request) => request,
            Err(e) => {
                return error_response(
                    GatewayErrorCode::BadRequest,
                    format!("Invalid test run request: {}", e),
                )
            }
        };

        let summary = run_tests(&self.modules, &tenant, self.platform_repo.as_ref(), request).await;
        info!(
            hostname = %req.hostname,
            tests = summary.tests,
            failures = summary.failures,
            "Test run finished"
        );
        match serde_json::to_string(&summary) {
            Ok(body) => json_response(StatusCode::OK, body),
            Err(e) => error_response(GatewayErrorCode::HandlerException, e.to_string()),
        }
    }

    async fn module_source(&self, req: &GatewayRequest) -> Option<HttpResponse> {
        let from_loader = req
            .header("user-agent")
            .is_some_and(|ua| ua.starts_with(&self.settings.loader_user_agent));
        if !req.is_loopback_host() || req.method != Method::GET || !from_loader {
            return None;
        }

        let not_found = || error_response(GatewayErrorCode::NotFound, "Not Found");
        let Some(etag) = req.query_param("eTag") else {
            return Some(not_found());
        };
        let hostname = etag.split(':').next().unwrap_or_default();
        let Some(tenant) = self.tenants.get(hostname) else {
            debug!(hostname = %hostname, path = %req.path, "Module source for unknown tenant");
            return Some(not_found());
        };

        let item = match resolve_package_item(&tenant, self.platform_repo.as_ref(), &req.path).await
        {
            Ok(Some(item)) => item,
            Ok(None) | Err(RepoError::InvalidPath(_)) => return Some(not_found()),
            Err(e) => {
                warn!(hostname = %hostname, path = %req.path, error = %e, "Module source fetch failed");
                return Some(error_response(
                    GatewayErrorCode::UpstreamUnavailable,
                    "Bad Gateway",
                ));
            }
        };

        let body = match std::str::from_utf8(&item.content) {
            Ok(source) if req.path.ends_with(MODULE_EXTENSION) => {
                Bytes::from(tag_module_imports(source, &etag))
            }
            _ => item.content.clone(),
        };
        let response = Response::builder()
            .status(StatusCode::OK)
            .header("content-type", &item.content_type)
            .body(Full::new(body))
            .unwrap_or_else(|_| text_response(StatusCode::OK, item.content.clone()));
        Some(response)
    }

    fn resolve_route(&self, req: &mut GatewayRequest) {
        let Some(tenant) = self.tenants.get(&req.hostname) else {
            return;
        };

        match tenant.routes.resolve(&req.method, &req.path) {
            Some(route) => {
                debug!(hostname = %req.hostname, path = %req.path, route = %route.path, "Route matched");
                req.route_path = Some(route.path);
                req.route_params = route.params;
            }
            None => req.route_path = Some(req.path.clone()),
        }
    }

    async fn static_asset(&self, req: &GatewayRequest) -> Option<HttpResponse> {
        let route_path = req.route_path.as_deref()?;
        if RouteTarget::of(route_path) != RouteTarget::Client || req.method != Method::GET {
            return None;
        }
        let tenant = self.tenants.get(&req.hostname)?;

        match resolve_package_item(&tenant, self.platform_repo.as_ref(), route_path).await {
            Ok(Some(item)) => Some(item.to_response(req.header("if-none-match"))),
            Ok(None) | Err(RepoError::InvalidPath(_)) => {
                Some(error_response(GatewayErrorCode::NotFound, "Not Found"))
            }
            Err(e) => {
                warn!(hostname = %req.hostname, path = %route_path, error = %e, "Asset fetch failed");
                Some(error_response(
                    GatewayErrorCode::UpstreamUnavailable,
                    "Bad Gateway",
                ))
            }
        }
    }

    async fn server_function(&self, req: &GatewayRequest) -> Option<HttpResponse> {
        let route_path = req.route_path.as_deref()?;
        let tenant = self.tenants.get(&req.hostname)?;

        if RouteTarget::of(route_path) != RouteTarget::Server {
            return Some(error_response(GatewayErrorCode::NotFound, "Not Found"));
        }
        let Some((module_path, function_name)) = split_function_path(route_path) else {
            return Some(error_response(GatewayErrorCode::NotFound, "Not Found"));
        };

        let module = match self
            .modules
            .import(&tenant, self.platform_repo.as_ref(), &module_path)
            .await
        {
            Ok(module) => module,
            Err(ModuleError::NotFound(_) | ModuleError::Repo(RepoError::InvalidPath(_))) => {
                return Some(error_response(
                    GatewayErrorCode::NotFound,
                    "Endpoint Not Found",
                ))
            }
            Err(e) => {
                warn!(hostname = %req.hostname, module = %module_path, error = %e, "Module import failed");
                return Some(error_response(
                    GatewayErrorCode::UpstreamUnavailable,
                    "Bad Gateway",
                ));
            }
        };

        let Some(function) = module.function(function_name) else {
            return Some(error_response(
                GatewayErrorCode::NotFound,
                "Endpoint Service Not Found",
            ));
        };
        if function.method != req.method {
            return Some(error_response(
                GatewayErrorCode::MethodNotAllowed,
                "Method Not Allowed",
            ));
        }

        let ctx = match build_context(&tenant, req).await {
            Ok(ctx) => ctx,
            Err(e) => return Some(error_response(GatewayErrorCode::BadRequest, e.to_string())),
        };

        let response = match AssertUnwindSafe(function.call(ctx)).catch_unwind().await {
            Ok(Ok(Some(response))) => response,
            Ok(Ok(None)) => empty_response(StatusCode::NO_CONTENT),
            Ok(Err(e)) => {
                error!(
                    hostname = %req.hostname,
                    module = %module_path,
                    function = %function_name,
                    error = %e,
                    "Server function failed"
                );
                error_response(GatewayErrorCode::HandlerException, e.to_string())
            }
            Err(_) => {
                error!(
                    hostname = %req.hostname,
                    module = %module_path,
                    function = %function_name,
                    "Server function panicked"
                );
                error_response(GatewayErrorCode::HandlerException, "Internal Server Error")
            }
        };
        Some(response)
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("platform_repo", &self.platform_repo.name())
            .field("tenants", &self.tenants.len())
            .field("modules", &self.modules.instance_count())
            .finish()
    }
}

fn initializing_response() -> HttpResponse {
    error_response(GatewayErrorCode::TenantInitializing, INITIALIZING_MESSAGE)
}

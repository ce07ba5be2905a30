//! Invocation context handed to server functions

use crate::cache::content_digest;
use crate::error::{ContextError, HttpResponse};
use crate::request::{parse_query, GatewayRequest};
use crate::tenant::Tenant;
use futures::future::BoxFuture;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::HeaderMap;
use hyper::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use uuid::Uuid;

/// Cookie carrying colon-separated feature flags
pub const FEATURE_FLAGS_COOKIE: &str = "featureFlags";

/// Identity of the tenant serving the call
#[derive(Debug, Clone, Serialize)]
pub struct TenantContext {
    pub id: String,
    pub hostname: String,
    /// Slot for an authenticated user; never populated by the gateway
    pub user: Option<Value>,
}

/// Decoded request body
#[derive(Debug, Clone, PartialEq)]
pub enum RequestData {
    Json(Value),
    /// Text fields of a urlencoded or multipart form
    Form(HashMap<String, String>),
    Blob(Bytes),
}

impl RequestData {
    /// Deserialize a JSON body into `T`
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ContextError> {
        match self {
            RequestData::Json(value) => Ok(serde_json::from_value(value.clone())?),
            RequestData::Form(fields) => {
                let value = serde_json::to_value(fields)?;
                Ok(serde_json::from_value(value)?)
            }
            RequestData::Blob(bytes) => Ok(serde_json::from_slice(bytes)?),
        }
    }

    /// Form field, or top-level string member of a JSON object
    pub fn field(&self, name: &str) -> Option<&str> {
        match self {
            RequestData::Form(fields) => fields.get(name).map(String::as_str),
            RequestData::Json(value) => value.get(name).and_then(Value::as_str),
            RequestData::Blob(_) => None,
        }
    }
}

/// A file part of a multipart body
#[derive(Debug, Clone, PartialEq)]
pub struct UploadedFile {
    /// Form field the file was sent under
    pub field: String,
    pub filename: String,
    pub content_type: String,
    pub size: usize,
    pub content: Bytes,
}

/// The request as seen by a server function
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub headers: HeaderMap,
    pub cookies: HashMap<String, String>,
    /// Route parameters merged with query parameters (query wins)
    pub params: HashMap<String, String>,
    pub data: RequestData,
    pub files: Vec<UploadedFile>,
}

impl RequestContext {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }
}

/// Response constructors for server functions
#[derive(Debug, Clone, Copy, Default)]
pub struct ResponseHelper {
    status: Option<StatusCode>,
}

impl ResponseHelper {
    /// Use `status` instead of the constructor's default
    pub fn with_status(self, status: StatusCode) -> Self {
        Self {
            status: Some(status),
        }
    }

    fn status_or(&self, default: StatusCode) -> StatusCode {
        self.status.unwrap_or(default)
    }

    /// Redirect to `location` (302 unless a status was set)
    pub fn redirect(&self, location: &str) -> anyhow::Result<HttpResponse> {
        Ok(Response::builder()
            .status(self.status_or(StatusCode::FOUND))
            .header("location", location)
            .body(Full::new(Bytes::new()))?)
    }

    /// Arbitrary body with caller-supplied headers
    pub fn send(
        &self,
        body: impl Into<Bytes>,
        headers: &[(&str, &str)],
    ) -> anyhow::Result<HttpResponse> {
        let mut builder = Response::builder().status(self.status_or(StatusCode::OK));
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        Ok(builder.body(Full::new(body.into()))?)
    }

    pub fn json<T: Serialize + ?Sized>(&self, body: &T) -> anyhow::Result<HttpResponse> {
        let body = serde_json::to_vec(body)?;
        Ok(self.typed(body, "application/json"))
    }

    pub fn text(&self, body: impl Into<Bytes>) -> HttpResponse {
        self.typed(body, "text/plain")
    }

    pub fn html(&self, body: impl Into<Bytes>) -> HttpResponse {
        self.typed(body, "text/html")
    }

    fn typed(&self, body: impl Into<Bytes>, content_type: &'static str) -> HttpResponse {
        Response::builder()
            .status(self.status_or(StatusCode::OK))
            .header("content-type", content_type)
            .body(Full::new(body.into()))
            .expect("valid response with StatusCode enum and static header")
    }
}

/// Id generation and one-way hashing
#[derive(Debug, Clone, Copy, Default)]
pub struct Utils;

impl Utils {
    pub fn create_id(&self) -> String {
        Uuid::new_v4().to_string()
    }

    /// SHA-256 of `value` as lowercase hex
    pub fn create_hash(&self, value: &str) -> String {
        content_digest(value.as_bytes())
    }

    pub fn compare_with_hash(&self, value: &str, hash: &str) -> bool {
        self.create_hash(value).eq_ignore_ascii_case(hash)
    }
}

type FlagArm<'a, T> = (String, Box<dyn FnOnce() -> BoxFuture<'a, T> + Send + 'a>);

/// Ordered flag alternatives for [`FeatureFlags::flag`]
pub struct FlagMapping<'a, T> {
    arms: Vec<FlagArm<'a, T>>,
}

impl<'a, T> FlagMapping<'a, T> {
    pub fn new() -> Self {
        Self { arms: Vec::new() }
    }

    /// Add an arm. `key` lists colon-separated flags, or is `default`.
    pub fn on<F, Fut>(mut self, key: impl Into<String>, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = T> + Send + 'a,
    {
        let run: Box<dyn FnOnce() -> BoxFuture<'a, T> + Send + 'a> =
            Box::new(move || -> BoxFuture<'a, T> { Box::pin(f()) });
        self.arms.push((key.into(), run));
        self
    }
}

impl<T> Default for FlagMapping<'_, T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Active feature flags for one call
#[derive(Debug, Clone, Default)]
pub struct FeatureFlags {
    active: Vec<String>,
}

impl FeatureFlags {
    /// Union of the cookie's flags and the tenant's defaults
    pub fn new(cookie: Option<&str>, defaults: &[String]) -> Self {
        let mut active: Vec<String> = cookie
            .map(|c| {
                c.split(':')
                    .filter(|f| !f.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        for flag in defaults {
            if !active.contains(flag) {
                active.push(flag.clone());
            }
        }
        Self { active }
    }

    pub fn is_active(&self, flag: &str) -> bool {
        self.active.iter().any(|f| f == flag)
    }

    pub fn active(&self) -> &[String] {
        &self.active
    }

    fn arm_matches(&self, key: &str) -> bool {
        key.split(':')
            .any(|flag| flag == "default" || self.is_active(flag))
    }

    /// Run the first arm whose key names an active flag or `default`.
    /// Later arms are never evaluated.
    pub async fn flag<T>(&self, mapping: FlagMapping<'_, T>) -> Option<T> {
        for (key, run) in mapping.arms {
            if self.arm_matches(&key) {
                return Some(run().await);
            }
        }
        None
    }
}

/// Everything a server function receives
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub tenant: TenantContext,
    pub request: RequestContext,
    pub response: ResponseHelper,
    pub app_settings: Map<String, Value>,
    pub utils: Utils,
    pub feature: FeatureFlags,
}

/// Assemble the context for a call into `tenant` for `request`
pub async fn build_context(
    tenant: &Tenant,
    request: &GatewayRequest,
) -> Result<InvocationContext, ContextError> {
    let cookies = request.cookies();

    let mut params = request.route_params.clone();
    params.extend(request.query_params());

    let (data, files) = decode_body(request.content_type(), request.body.clone()).await?;

    let feature = FeatureFlags::new(
        cookies.get(FEATURE_FLAGS_COOKIE).map(String::as_str),
        &tenant.app.feature_flags(),
    );

    Ok(InvocationContext {
        tenant: TenantContext {
            id: tenant.id().to_string(),
            hostname: tenant.hostname.clone(),
            user: None,
        },
        request: RequestContext {
            headers: request.headers.clone(),
            cookies,
            params,
            data,
            files,
        },
        response: ResponseHelper::default(),
        app_settings: tenant.app.app_settings.clone(),
        utils: Utils,
        feature,
    })
}

async fn decode_body(
    content_type: Option<&str>,
    body: Bytes,
) -> Result<(RequestData, Vec<UploadedFile>), ContextError> {
    let content_type = content_type.unwrap_or_default();

    if content_type.starts_with("application/json") {
        if body.is_empty() {
            return Ok((RequestData::Json(Value::Null), Vec::new()));
        }
        let value = serde_json::from_slice(&body)?;
        return Ok((RequestData::Json(value), Vec::new()));
    }

    if content_type.starts_with("application/x-www-form-urlencoded") {
        let text = std::str::from_utf8(&body)
            .map_err(|e| ContextError::InvalidForm(e.to_string()))?;
        return Ok((RequestData::Form(parse_query(text)), Vec::new()));
    }

    if content_type.starts_with("multipart/form-data") {
        return decode_multipart(content_type, body).await;
    }

    Ok((RequestData::Blob(body), Vec::new()))
}

async fn decode_multipart(
    content_type: &str,
    body: Bytes,
) -> Result<(RequestData, Vec<UploadedFile>), ContextError> {
    let boundary =
        multer::parse_boundary(content_type).map_err(|e| ContextError::InvalidForm(e.to_string()))?;
    let stream = futures::stream::once(async move { Ok::<Bytes, std::io::Error>(body) });
    let mut multipart = multer::Multipart::new(stream, boundary);

    let mut fields = HashMap::new();
    let mut files = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ContextError::InvalidForm(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match field.file_name().map(String::from) {
            Some(filename) => {
                let content_type = field
                    .content_type()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| "application/octet-stream".to_string());
                let content = field
                    .bytes()
                    .await
                    .map_err(|e| ContextError::InvalidForm(e.to_string()))?;
                files.push(UploadedFile {
                    field: name,
                    filename,
                    content_type,
                    size: content.len(),
                    content,
                });
            }
            None => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ContextError::InvalidForm(e.to_string()))?;
                fields.insert(name, text);
            }
        }
    }

    Ok((RequestData::Form(fields), files))
}

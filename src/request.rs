//! The per-request value threaded through the pipeline

use hyper::body::Bytes;
use hyper::header::{HeaderMap, COOKIE, HOST};
use hyper::{Method, Uri};
use std::collections::HashMap;
use std::net::SocketAddr;

/// Maximum hostname length (DNS limit)
const MAX_HOSTNAME_LEN: usize = 253;

/// Hostname served by the module loader endpoint
pub const LOOPBACK_HOST: &str = "127.0.0.1";

/// An HTTP request as the pipeline sees it.
///
/// `route_path` and `route_params` are filled in by route resolution; stages
/// that run earlier must not rely on them.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub method: Method,
    /// Lowercased hostname without port
    pub hostname: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_addr: Option<SocketAddr>,
    pub route_path: Option<String>,
    pub route_params: HashMap<String, String>,
}

impl GatewayRequest {
    pub fn new(
        method: Method,
        hostname: impl Into<String>,
        path_and_query: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Self {
        let (path, query) = match path_and_query.split_once('?') {
            Some((path, query)) => (path, Some(query.to_string())),
            None => (path_and_query, None),
        };
        Self {
            method,
            hostname: hostname.into(),
            path: if path.is_empty() { "/".to_string() } else { path.to_string() },
            query,
            headers,
            body,
            client_addr: None,
            route_path: None,
            route_params: HashMap::new(),
        }
    }

    pub fn with_client_addr(mut self, addr: SocketAddr) -> Self {
        self.client_addr = Some(addr);
        self
    }

    /// Header value as text, if present and valid
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn query_params(&self) -> HashMap<String, String> {
        self.query.as_deref().map(parse_query).unwrap_or_default()
    }

    /// Single query parameter value
    pub fn query_param(&self, name: &str) -> Option<String> {
        self.query_params().remove(name)
    }

    pub fn cookies(&self) -> HashMap<String, String> {
        parse_cookies(&self.headers)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    /// Operational endpoints live under `/~/`
    pub fn is_operational(&self) -> bool {
        self.path.starts_with("/~/")
    }

    pub fn is_loopback_host(&self) -> bool {
        self.hostname == LOOPBACK_HOST
    }
}

/// Decode an `application/x-www-form-urlencoded` string. Later keys win.
pub fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (decode_component(key), decode_component(value))
        })
        .collect()
}

fn decode_component(value: &str) -> String {
    let value = value.replace('+', " ");
    urlencoding::decode(&value)
        .map(|v| v.into_owned())
        .unwrap_or(value)
}

/// Parse every `Cookie` header into name/value pairs
pub fn parse_cookies(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|header| header.split(';'))
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            let value = value.trim().trim_matches('"');
            let value = urlencoding::decode(value)
                .map(|v| v.into_owned())
                .unwrap_or_else(|_| value.to_string());
            Some((name.to_string(), value))
        })
        .collect()
}

/// Extract and validate the request hostname.
///
/// The Host header wins when present. HTTP/2 clients may send only the
/// `:authority` pseudo-header, which hyper exposes through the URI.
pub fn extract_hostname(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    match headers.get(HOST) {
        Some(host) => {
            let host = host.to_str().ok()?;
            // Strip port if present
            validate_hostname(host.split(':').next()?)
        }
        None => validate_hostname(uri.host()?),
    }
}

fn validate_hostname(hostname: &str) -> Option<String> {
    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }

    // Alphanumeric, hyphen, and dot only; keeps hostnames safe in
    // log fields and repository paths
    if !hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return None;
    }
    if hostname.starts_with('.') || hostname.contains("..") {
        return None;
    }

    Some(hostname.to_lowercase())
}

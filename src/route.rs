//! Route mapping: ordered URL patterns resolved to package paths
//!
//! Patterns use `/`-separated segments. A segment is a literal, a named
//! parameter (`:id`), an optional parameter (`:id?`), a repeated parameter
//! (`:rest*` for zero or more segments, `:rest+` for one or more) or a bare
//! `*` wildcard whose capture is named `0`.

use hyper::Method;
use serde::Deserialize;
use std::collections::HashMap;

/// Declarative rule binding a URL pattern to a package path
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RouteMapping {
    pub route: String,
    pub path: String,
    /// HTTP verb required for server targets
    #[serde(default)]
    pub method: String,
}

/// What kind of package item a resolved path names
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteTarget {
    /// Static asset under `/<package>/client/...`
    Client,
    /// Server function under `/<package>/server/...`
    Server,
    Other,
}

impl RouteTarget {
    /// Classify a package path by its second segment
    pub fn of(path: &str) -> Self {
        match path.split('/').nth(2) {
            Some("client") => RouteTarget::Client,
            Some("server") => RouteTarget::Server,
            _ => RouteTarget::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Repeat {
    One,
    Optional,
    ZeroOrMore,
    OneOrMore,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param { name: String, repeat: Repeat },
}

/// A compiled route pattern
#[derive(Debug, Clone)]
pub struct RoutePattern {
    segments: Vec<Segment>,
}

impl RoutePattern {
    pub fn parse(pattern: &str) -> Self {
        let mut wildcards = 0;
        let segments = split_segments(pattern)
            .map(|raw| {
                if raw == "*" {
                    let name = wildcards.to_string();
                    wildcards += 1;
                    return Segment::Param {
                        name,
                        repeat: Repeat::ZeroOrMore,
                    };
                }
                match raw.strip_prefix(':') {
                    Some(token) if !token.is_empty() && !is_modifier(token) => parse_param(token),
                    _ => Segment::Literal(raw.to_string()),
                }
            })
            .collect();
        Self { segments }
    }

    /// Match a request path, returning captured parameters on success
    pub fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        let parts: Vec<&str> = split_segments(path).collect();
        let mut params = HashMap::new();
        if match_from(&self.segments, &parts, &mut params) {
            Some(params)
        } else {
            None
        }
    }
}

fn split_segments(path: &str) -> std::str::Split<'_, char> {
    path.strip_prefix('/').unwrap_or(path).split('/')
}

fn is_modifier(s: &str) -> bool {
    matches!(s, "?" | "*" | "+")
}

fn parse_param(token: &str) -> Segment {
    let (name, repeat) = match token.as_bytes()[token.len() - 1] {
        b'?' => (&token[..token.len() - 1], Repeat::Optional),
        b'*' => (&token[..token.len() - 1], Repeat::ZeroOrMore),
        b'+' => (&token[..token.len() - 1], Repeat::OneOrMore),
        _ => (token, Repeat::One),
    };
    Segment::Param {
        name: name.to_string(),
        repeat,
    }
}

fn match_from(segments: &[Segment], parts: &[&str], params: &mut HashMap<String, String>) -> bool {
    let Some((segment, rest)) = segments.split_first() else {
        return parts.is_empty();
    };

    match segment {
        Segment::Literal(literal) => match parts.split_first() {
            Some((part, remaining)) if *part == literal.as_str() => match_from(rest, remaining, params),
            _ => false,
        },
        Segment::Param { name, repeat } => {
            let (min, max) = match repeat {
                Repeat::One => (1, 1),
                Repeat::Optional => (0, 1),
                Repeat::ZeroOrMore => (0, parts.len()),
                Repeat::OneOrMore => (1, parts.len()),
            };

            // Greedy: prefer consuming as many segments as allowed
            for take in (min..=max.min(parts.len())).rev() {
                let taken = &parts[..take];
                if *repeat != Repeat::ZeroOrMore && taken.iter().any(|p| p.is_empty()) {
                    continue;
                }
                if match_from(rest, &parts[take..], params) {
                    if take > 0 {
                        params.insert(name.clone(), decode(&taken.join("/")));
                    }
                    return true;
                }
            }
            false
        }
    }
}

fn decode(value: &str) -> String {
    urlencoding::decode(value)
        .map(|v| v.into_owned())
        .unwrap_or_else(|_| value.to_string())
}

/// A successful route resolution
#[derive(Debug, Clone, PartialEq)]
pub struct RouteMatch {
    /// Package path the request resolved to
    pub path: String,
    pub params: HashMap<String, String>,
    pub target: RouteTarget,
}

#[derive(Debug, Clone)]
struct CompiledRoute {
    pattern: RoutePattern,
    mapping: RouteMapping,
    target: RouteTarget,
}

/// A tenant's route mappings compiled once, in declaration order
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<CompiledRoute>,
}

impl RouteTable {
    pub fn new(mappings: &[RouteMapping]) -> Self {
        let routes = mappings
            .iter()
            .map(|mapping| CompiledRoute {
                pattern: RoutePattern::parse(&mapping.route),
                target: RouteTarget::of(&mapping.path),
                mapping: mapping.clone(),
            })
            .collect();
        Self { routes }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Resolve a request path. The first mapping that matches structurally and
    /// accepts the method wins; client targets accept any method.
    pub fn resolve(&self, method: &Method, path: &str) -> Option<RouteMatch> {
        self.routes.iter().find_map(|route| {
            let params = route.pattern.matches(path)?;
            match route.target {
                RouteTarget::Client => Some(RouteMatch {
                    path: route.mapping.path.clone(),
                    params: HashMap::new(),
                    target: RouteTarget::Client,
                }),
                RouteTarget::Server
                    if route.mapping.method.eq_ignore_ascii_case(method.as_str()) =>
                {
                    Some(RouteMatch {
                        path: route.mapping.path.clone(),
                        params,
                        target: RouteTarget::Server,
                    })
                }
                _ => None,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(route: &str, path: &str, method: &str) -> RouteMapping {
        RouteMapping {
            route: route.to_string(),
            path: path.to_string(),
            method: method.to_string(),
        }
    }

    #[test]
    fn test_route_target_of() {
        assert_eq!(RouteTarget::of("/app/client/index.html"), RouteTarget::Client);
        assert_eq!(RouteTarget::of("/app/server/endpoint/message"), RouteTarget::Server);
        assert_eq!(RouteTarget::of("/app/shared/lib.ts"), RouteTarget::Other);
        assert_eq!(RouteTarget::of("/app"), RouteTarget::Other);
    }

    #[test]
    fn test_literal_pattern() {
        let pattern = RoutePattern::parse("/api/message");
        assert!(pattern.matches("/api/message").is_some());
        assert!(pattern.matches("/api/message/").is_none());
        assert!(pattern.matches("/api").is_none());
        assert!(pattern.matches("/API/message").is_none());
    }

    #[test]
    fn test_root_pattern() {
        let pattern = RoutePattern::parse("/");
        assert!(pattern.matches("/").is_some());
        assert!(pattern.matches("/index.html").is_none());
    }

    #[test]
    fn test_named_params() {
        let pattern = RoutePattern::parse("/users/:id/posts/:post");
        let params = pattern.matches("/users/42/posts/hello%20world").unwrap();
        assert_eq!(params.get("id").map(String::as_str), Some("42"));
        assert_eq!(params.get("post").map(String::as_str), Some("hello world"));

        assert!(pattern.matches("/users//posts/1").is_none());
    }

    #[test]
    fn test_optional_param() {
        let pattern = RoutePattern::parse("/docs/:page?");
        assert_eq!(
            pattern.matches("/docs/intro").unwrap().get("page").map(String::as_str),
            Some("intro")
        );
        assert!(pattern.matches("/docs").unwrap().is_empty());
        assert!(pattern.matches("/docs/a/b").is_none());
    }

    #[test]
    fn test_wildcards() {
        let pattern = RoutePattern::parse("/assets/*");
        let params = pattern.matches("/assets/css/site.css").unwrap();
        assert_eq!(params.get("0").map(String::as_str), Some("css/site.css"));
        assert!(pattern.matches("/assets").is_some());

        let pattern = RoutePattern::parse("/files/:rest+");
        assert!(pattern.matches("/files").is_none());
        assert_eq!(
            pattern.matches("/files/a/b").unwrap().get("rest").map(String::as_str),
            Some("a/b")
        );
    }

    #[test]
    fn test_bare_colon_is_literal() {
        let pattern = RoutePattern::parse("/a/:");
        assert!(pattern.matches("/a/:").is_some());
        assert!(pattern.matches("/a/b").is_none());
    }

    #[test]
    fn test_resolve_server_requires_method() {
        let table = RouteTable::new(&[mapping(
            "/api/message",
            "/app/server/endpoint/message",
            "GET",
        )]);

        let matched = table.resolve(&Method::GET, "/api/message").unwrap();
        assert_eq!(matched.path, "/app/server/endpoint/message");
        assert_eq!(matched.target, RouteTarget::Server);

        assert!(table.resolve(&Method::POST, "/api/message").is_none());
    }

    #[test]
    fn test_resolve_method_is_case_insensitive() {
        let table = RouteTable::new(&[mapping("/api/items", "/app/server/items/list", "get")]);
        assert!(table.resolve(&Method::GET, "/api/items").is_some());
    }

    #[test]
    fn test_resolve_client_is_method_agnostic() {
        let table = RouteTable::new(&[mapping("/", "/app/client/index.html", "GET")]);
        let matched = table.resolve(&Method::POST, "/").unwrap();
        assert_eq!(matched.target, RouteTarget::Client);
        assert!(matched.params.is_empty());
    }

    #[test]
    fn test_resolve_first_mapping_wins() {
        let table = RouteTable::new(&[
            mapping("/api/:name", "/app/client/generic.html", ""),
            mapping("/api/message", "/app/server/endpoint/message", "GET"),
        ]);

        let matched = table.resolve(&Method::GET, "/api/message").unwrap();
        assert_eq!(matched.path, "/app/client/generic.html");
        assert_eq!(matched.target, RouteTarget::Client);
    }

    #[test]
    fn test_resolve_skips_method_mismatch_to_later_mapping() {
        let table = RouteTable::new(&[
            mapping("/api/items/:id", "/app/server/items/update", "PUT"),
            mapping("/api/items/:id", "/app/server/items/get", "GET"),
        ]);

        let matched = table.resolve(&Method::GET, "/api/items/7").unwrap();
        assert_eq!(matched.path, "/app/server/items/get");
        assert_eq!(matched.params.get("id").map(String::as_str), Some("7"));
    }

    #[test]
    fn test_resolve_other_targets_never_match() {
        let table = RouteTable::new(&[mapping("/lib", "/app/shared/lib.ts", "GET")]);
        assert!(table.resolve(&Method::GET, "/lib").is_none());
    }

    #[test]
    fn test_mapping_from_json_defaults_method() {
        let parsed: RouteMapping =
            serde_json::from_str(r#"{"route": "/", "path": "/app/client/index.html"}"#).unwrap();
        assert_eq!(parsed.method, "");
    }
}

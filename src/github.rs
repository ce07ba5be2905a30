//! GitHub-style remote repository provider
//!
//! With a credential, files come from the contents API as base64 JSON and carry
//! the blob `sha`. Without one, files come from the public raw-content endpoint.

use crate::error::RepoError;
use crate::repo::{split_ref, RepoFile, RepoProvider, RepoSettings};
use async_trait::async_trait;
use base64::Engine;
use hyper::body::Bytes;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

pub const PROVIDER_NAME: &str = "GitHub";

const DEFAULT_API_URL: &str = "https://api.github.com";
const DEFAULT_RAW_URL: &str = "https://raw.githubusercontent.com";
const DEFAULT_REF: &str = "main";

/// Response body of the contents API for a single file
#[derive(Debug, Deserialize)]
struct ContentsResponse {
    name: Option<String>,
    content: Option<String>,
    sha: Option<String>,
}

/// Fetches package files from `<owner>/<package>` repositories
pub struct GitHubProvider {
    owner: String,
    credentials: Option<String>,
    api_url: String,
    raw_url: String,
    http_client: reqwest::Client,
}

impl GitHubProvider {
    pub fn new(settings: &RepoSettings) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("spheregate/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "Failed to build configured HTTP client, using defaults");
                reqwest::Client::new()
            });

        Self {
            owner: settings.root.trim_matches('/').to_string(),
            credentials: settings.credentials.clone().filter(|c| !c.is_empty()),
            api_url: settings
                .api_url
                .clone()
                .unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            raw_url: settings
                .raw_url
                .clone()
                .unwrap_or_else(|| DEFAULT_RAW_URL.to_string()),
            http_client,
        }
    }

    fn contents_url(&self, file: &str, package: &str, git_ref: Option<&str>) -> String {
        let mut url = format!(
            "{}/repos/{}/{}/contents/{}",
            self.api_url.trim_end_matches('/'),
            self.owner,
            package,
            file.trim_start_matches('/')
        );
        if let Some(git_ref) = git_ref {
            url.push_str("?ref=");
            url.push_str(&urlencoding::encode(git_ref));
        }
        url
    }

    fn raw_url(&self, file: &str, package: &str, git_ref: Option<&str>) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.raw_url.trim_end_matches('/'),
            self.owner,
            package,
            git_ref.unwrap_or(DEFAULT_REF),
            file.trim_start_matches('/')
        )
    }

    async fn fetch(
        &self,
        url: &str,
        credentials: Option<&str>,
    ) -> Result<Option<reqwest::Response>, RepoError> {
        let mut request = self.http_client.get(url);
        if let Some(token) = credentials {
            request = request
                .bearer_auth(token)
                .header("accept", "application/vnd.github+json");
        }

        let response = request.send().await.map_err(|e| RepoError::Http {
            url: url.to_string(),
            source: e,
        })?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                debug!(url = %url, "File not found in remote repository");
                Ok(None)
            }
            status if status.is_success() => Ok(Some(response)),
            status => Err(RepoError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            }),
        }
    }

    async fn get_contents(
        &self,
        file: &str,
        package: &str,
        git_ref: Option<&str>,
        token: &str,
    ) -> Result<Option<RepoFile>, RepoError> {
        let url = self.contents_url(file, package, git_ref);
        let Some(response) = self.fetch(&url, Some(token)).await? else {
            return Ok(None);
        };

        let body = response.bytes().await.map_err(|e| RepoError::Http {
            url: url.clone(),
            source: e,
        })?;
        decode_contents(&url, file, &body)
    }

    async fn get_raw(
        &self,
        file: &str,
        package: &str,
        git_ref: Option<&str>,
    ) -> Result<Option<RepoFile>, RepoError> {
        let url = self.raw_url(file, package, git_ref);
        let Some(response) = self.fetch(&url, None).await? else {
            return Ok(None);
        };

        let content = response.bytes().await.map_err(|e| RepoError::Http {
            url: url.clone(),
            source: e,
        })?;
        Ok(Some(RepoFile {
            name: base_name(file),
            content,
            sha: None,
        }))
    }
}

#[async_trait]
impl RepoProvider for GitHubProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn get_file(&self, path: &str, package: &str) -> Result<Option<RepoFile>, RepoError> {
        let (file, git_ref) = split_ref(path);
        match &self.credentials {
            Some(token) => self.get_contents(file, package, git_ref, token).await,
            None => self.get_raw(file, package, git_ref).await,
        }
    }
}

/// Decode a contents API body. Directory listings and bodies without a `sha`
/// are not files and count as absent.
fn decode_contents(url: &str, file: &str, body: &[u8]) -> Result<Option<RepoFile>, RepoError> {
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| RepoError::InvalidContent {
            location: url.to_string(),
            reason: e.to_string(),
        })?;
    if !value.is_object() {
        return Ok(None);
    }

    let contents: ContentsResponse =
        serde_json::from_value(value).map_err(|e| RepoError::InvalidContent {
            location: url.to_string(),
            reason: e.to_string(),
        })?;
    let (Some(sha), Some(encoded)) = (contents.sha, contents.content) else {
        return Ok(None);
    };

    // The API wraps base64 payloads at 60 columns
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    let content = base64::engine::general_purpose::STANDARD
        .decode(compact)
        .map_err(|e| RepoError::InvalidContent {
            location: url.to_string(),
            reason: e.to_string(),
        })?;

    Ok(Some(RepoFile {
        name: contents.name.unwrap_or_else(|| base_name(file)),
        content: Bytes::from(content),
        sha: Some(sha),
    }))
}

fn base_name(file: &str) -> String {
    file.rsplit('/').next().unwrap_or(file).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// Request heads received by the mock upstream, lowercased
    type Seen = Arc<Mutex<Vec<String>>>;

    /// Local stand-in for the contents API (`/api`) and raw endpoint (`/raw`)
    async fn mock_upstream() -> (SocketAddr, Seen) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));

        let recorder = Arc::clone(&seen);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let recorder = Arc::clone(&recorder);
                tokio::spawn(async move {
                    serve_one(stream, recorder).await;
                });
            }
        });
        (addr, seen)
    }

    async fn serve_one(mut stream: TcpStream, seen: Seen) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        }
        let head = String::from_utf8_lossy(&buf).to_lowercase();
        let target = head
            .split_whitespace()
            .nth(1)
            .unwrap_or_default()
            .to_string();
        seen.lock().push(head);

        let (status, body) = match target.as_str() {
            "/api/repos/acme/shop/contents/client/app.js"
            | "/api/repos/acme/shop/contents/client/app.js?ref=v2" => (
                "200 OK",
                r#"{"name": "app.js", "sha": "abc123", "content": "Y29uc29sZS5sb2coMSk="}"#,
            ),
            "/raw/acme/shop/main/client/app.js" => ("200 OK", "console.log(1)"),
            "/raw/acme/shop/v2/client/app.js" => ("200 OK", "console.log(2)"),
            t if t.ends_with("/broken.js") => ("500 Internal Server Error", "oops"),
            _ => ("404 Not Found", "Not Found"),
        };
        let response = format!(
            "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        );
        let _ = stream.write_all(response.as_bytes()).await;
        let _ = stream.shutdown().await;
    }

    fn provider_at(addr: SocketAddr, credentials: Option<&str>) -> GitHubProvider {
        GitHubProvider::new(&RepoSettings {
            provider: PROVIDER_NAME.to_string(),
            root: "acme".to_string(),
            credentials: credentials.map(String::from),
            api_url: Some(format!("http://{}/api", addr)),
            raw_url: Some(format!("http://{}/raw", addr)),
        })
    }

    fn provider(credentials: Option<&str>) -> GitHubProvider {
        GitHubProvider::new(&RepoSettings {
            provider: PROVIDER_NAME.to_string(),
            root: "acme".to_string(),
            credentials: credentials.map(String::from),
            api_url: None,
            raw_url: None,
        })
    }

    #[test]
    fn test_contents_url() {
        let github = provider(Some("token"));
        assert_eq!(
            github.contents_url("client/app.js", "shop", None),
            "https://api.github.com/repos/acme/shop/contents/client/app.js"
        );
        assert_eq!(
            github.contents_url("/client/app.js", "shop", Some("v1.0")),
            "https://api.github.com/repos/acme/shop/contents/client/app.js?ref=v1.0"
        );
    }

    #[test]
    fn test_raw_url_defaults_to_main() {
        let github = provider(None);
        assert_eq!(
            github.raw_url("client/app.js", "shop", None),
            "https://raw.githubusercontent.com/acme/shop/main/client/app.js"
        );
        assert_eq!(
            github.raw_url("client/app.js", "shop", Some("release")),
            "https://raw.githubusercontent.com/acme/shop/release/client/app.js"
        );
    }

    #[test]
    fn test_empty_credentials_use_raw_endpoint() {
        let github = provider(Some(""));
        assert!(github.credentials.is_none());
    }

    #[test]
    fn test_decode_contents_wrapped_base64() {
        let body = br#"{"name": "app.js", "sha": "abc123", "content": "Y29uc29s\nZS5sb2co\nMSk=\n"}"#;
        let file = decode_contents("url", "client/app.js", body).unwrap().unwrap();

        assert_eq!(file.name, "app.js");
        assert_eq!(file.sha.as_deref(), Some("abc123"));
        assert_eq!(&file.content[..], b"console.log(1)");
    }

    #[test]
    fn test_decode_contents_directory_listing_is_absent() {
        let body = br#"[{"name": "a.js", "sha": "1"}]"#;
        assert!(decode_contents("url", "client", body).unwrap().is_none());
    }

    #[test]
    fn test_decode_contents_invalid_json() {
        let result = decode_contents("url", "client/app.js", b"not json");
        assert!(matches!(result, Err(RepoError::InvalidContent { .. })));
    }

    #[tokio::test]
    async fn test_contents_api_sends_bearer_credential() {
        let (addr, seen) = mock_upstream().await;
        let github = provider_at(addr, Some("secret-token"));

        let file = github
            .get_file("client/app.js?ref=v2", "shop")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(file.name, "app.js");
        assert_eq!(file.sha.as_deref(), Some("abc123"));
        assert_eq!(&file.content[..], b"console.log(1)");

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].starts_with("get /api/repos/acme/shop/contents/client/app.js?ref=v2 "));
        assert!(seen[0].contains("authorization: bearer secret-token"));
    }

    #[tokio::test]
    async fn test_remote_status_mapping() {
        let (addr, _) = mock_upstream().await;
        let github = provider_at(addr, Some("secret-token"));

        let missing = github.get_file("client/missing.js", "shop").await.unwrap();
        assert!(missing.is_none());

        let broken = github.get_file("client/broken.js", "shop").await;
        assert!(matches!(broken, Err(RepoError::Status { status: 500, .. })));

        let raw = provider_at(addr, None);
        assert!(raw.get_file("client/missing.js", "shop").await.unwrap().is_none());
        assert!(matches!(
            raw.get_file("client/broken.js", "shop").await,
            Err(RepoError::Status { status: 500, .. })
        ));
    }

    #[tokio::test]
    async fn test_raw_endpoint_without_credential() {
        let (addr, seen) = mock_upstream().await;
        let github = provider_at(addr, None);

        let file = github.get_file("client/app.js", "shop").await.unwrap().unwrap();
        assert_eq!(file.name, "app.js");
        assert!(file.sha.is_none());
        assert_eq!(&file.content[..], b"console.log(1)");

        let tagged = github
            .get_file("client/app.js?ref=v2", "shop")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&tagged.content[..], b"console.log(2)");

        let seen = seen.lock();
        assert!(seen[0].starts_with("get /raw/acme/shop/main/client/app.js "));
        assert!(seen[1].starts_with("get /raw/acme/shop/v2/client/app.js "));
        assert!(seen.iter().all(|head| !head.contains("authorization:")));
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let github = provider_at(addr, None);
        let result = github.get_file("client/app.js", "shop").await;
        assert!(matches!(result, Err(RepoError::Http { .. })));
    }
}

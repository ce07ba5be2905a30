use crate::repo::RepoSettings;
use serde::Deserialize;
use std::path::Path;

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Platform repository holding tenant and application configs
    #[serde(default)]
    pub repo: RepoSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// HTTP port (default: 80)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Package in the platform repo holding `.tenants/`, `.applications/`
    /// and `.servers/` documents (default: .sphere)
    #[serde(default = "default_config_package")]
    pub config_package: String,

    /// Name of the server configuration document under `.servers/`
    pub server_config: Option<String>,

    /// User-Agent prefix identifying the module loader on loopback requests
    #[serde(default = "default_loader_user_agent")]
    pub loader_user_agent: String,

    /// Maximum accepted request body size in bytes (default: 10 MiB)
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            config_package: default_config_package(),
            server_config: None,
            loader_user_agent: default_loader_user_agent(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl ServerConfig {
    /// Socket address string for the listener
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn default_listen_port() -> u16 {
    80
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_config_package() -> String {
    ".sphere".to_string()
}

fn default_loader_user_agent() -> String {
    "spheregate-loader".to_string()
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Apply `REPO_*` and `SERVER_*` overrides from the process environment
    pub fn apply_env(&mut self) -> anyhow::Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides using `lookup` as the environment
    pub fn apply_env_from<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(provider) = lookup("REPO_PROVIDER") {
            self.repo.provider = provider;
        }
        if let Some(root) = lookup("REPO_ROOT") {
            self.repo.root = root;
        }
        if let Some(credentials) = lookup("REPO_CREDENTIALS") {
            self.repo.credentials = Some(credentials);
        }
        if let Some(server_config) = lookup("SERVER_CONFIG") {
            self.server.server_config = Some(server_config);
        }
        if let Some(port) = lookup("SERVER_HTTP_PORT") {
            self.server.port = port
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid SERVER_HTTP_PORT '{}': {}", port, e))?;
        }
        Ok(())
    }

    /// Fill in the repository root with the working directory when unset
    pub fn with_default_root(mut self) -> Self {
        if self.repo.root.is_empty() {
            if let Ok(cwd) = std::env::current_dir() {
                self.repo.root = cwd.display().to_string();
            }
        }
        self
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.bind.trim().is_empty() {
            errors.push("server.bind must not be empty".to_string());
        }
        if self.server.config_package.trim().is_empty()
            || self.server.config_package.contains('/')
        {
            errors.push(format!(
                "server.config_package '{}' must be a single directory name",
                self.server.config_package
            ));
        }
        if self.server.loader_user_agent.trim().is_empty() {
            errors.push("server.loader_user_agent must not be empty".to_string());
        }
        if self.server.max_body_bytes == 0 {
            errors.push("server.max_body_bytes must be greater than 0".to_string());
        }
        if let Some(name) = &self.server.server_config {
            if name.is_empty() || name.contains('/') {
                errors.push(format!("server.server_config '{}' is not a valid name", name));
            }
        }
        if self.repo.provider.trim().is_empty() {
            errors.push("repo.provider must not be empty".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

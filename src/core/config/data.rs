use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::defaults;

/// One remote MCP server. `name` doubles as the server ID in storage keys.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub name: String,
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub base_url: String,
    /// Static headers sent on every request, e.g. a shared API key.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl ServerConfig {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            base_url: base_url.into(),
            headers: HashMap::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.name
    }

    /// Enabled servers with a non-empty URL are the only ones the pool dials.
    pub fn is_connectable(&self) -> bool {
        self.enabled && !self.base_url.trim().is_empty()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct OAuthConfig {
    /// Callback endpoint exposed by the host web layer.
    #[serde(default)]
    pub redirect_uri: String,
    #[serde(default = "defaults::client_name")]
    pub client_name: String,
    #[serde(default)]
    pub scopes: Option<Vec<String>>,
    /// Pending authorizations older than this are rejected on callback.
    #[serde(default = "defaults::session_ttl_secs")]
    pub session_ttl_secs: u64,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            redirect_uri: String::new(),
            client_name: defaults::client_name(),
            scopes: None,
            session_ttl_secs: defaults::session_ttl_secs(),
        }
    }
}

impl OAuthConfig {
    pub fn scope(&self) -> Option<String> {
        self.scopes
            .as_ref()
            .filter(|scopes| !scopes.is_empty())
            .map(|scopes| scopes.join(" "))
    }

    pub fn session_ttl(&self) -> chrono::Duration {
        seconds(self.session_ttl_secs)
    }
}

/// Everything a pool generation needs. Reconfiguration replaces it wholesale.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    #[serde(default = "defaults::idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "defaults::sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "defaults::user_id_header")]
    pub user_id_header: String,
    #[serde(default = "defaults::request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "defaults::connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub oauth: OAuthConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            idle_timeout_secs: defaults::idle_timeout_secs(),
            sweep_interval_secs: defaults::sweep_interval_secs(),
            user_id_header: defaults::user_id_header(),
            request_timeout_secs: defaults::request_timeout_secs(),
            connect_timeout_secs: defaults::connect_timeout_secs(),
            oauth: OAuthConfig::default(),
        }
    }
}

impl PoolConfig {
    pub fn with_servers(servers: Vec<ServerConfig>) -> Self {
        Self {
            servers,
            ..Self::default()
        }
    }

    pub fn idle_timeout(&self) -> chrono::Duration {
        seconds(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn server(&self, name: &str) -> Option<&ServerConfig> {
        self.servers.iter().find(|server| server.name == name)
    }
}

fn seconds(secs: u64) -> chrono::Duration {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}

/// Get a user-friendly display string for a path
/// Converts absolute paths to use ~ notation on Unix-like systems when possible
pub fn path_display<P: AsRef<Path>>(path: P) -> String {
    let path = path.as_ref();

    #[cfg(unix)]
    {
        if let Some(home) = std::env::var_os("HOME") {
            let home_path = PathBuf::from(home);
            if let Ok(relative) = path.strip_prefix(&home_path) {
                return format!("~/{}", relative.display());
            }
        }
    }

    path.display().to_string()
}

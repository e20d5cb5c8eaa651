use super::data::{PoolConfig, ServerConfig};
use super::defaults::{DEFAULT_IDLE_TIMEOUT_SECS, DEFAULT_SWEEP_INTERVAL_SECS, DEFAULT_USER_ID_HEADER};
use super::io::ConfigError;
use std::fs;
use tempfile::TempDir;

#[test]
fn test_load_full_config_from_toml() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let config_path = temp_dir.path().join("config.toml");
    fs::write(
        &config_path,
        r#"
idle_timeout_secs = 600
user_id_header = "X-Chat-User"

[oauth]
redirect_uri = "https://chat.example.com/oauth/callback"
scopes = ["mcp.read", "mcp.write"]

[[servers]]
name = "github"
base_url = "https://mcp.github.example.com/mcp"

[servers.headers]
X-Api-Key = "secret"

[[servers]]
name = "wiki"
enabled = false
base_url = "https://wiki.example.com/mcp"
"#,
    )
    .expect("Failed to write config");

    let config = PoolConfig::load_from_path(&config_path).expect("Failed to load config");

    assert_eq!(config.idle_timeout_secs, 600);
    assert_eq!(config.sweep_interval_secs, DEFAULT_SWEEP_INTERVAL_SECS);
    assert_eq!(config.user_id_header, "X-Chat-User");
    assert_eq!(config.servers.len(), 2);
    assert!(config.servers[0].enabled);
    assert_eq!(
        config.servers[0].headers.get("X-Api-Key").map(String::as_str),
        Some("secret")
    );
    assert!(!config.servers[1].enabled);
    assert_eq!(config.oauth.scope().as_deref(), Some("mcp.read mcp.write"));
    assert_eq!(config.oauth.client_name, "mcpool");
}

#[test]
fn test_empty_config_uses_defaults() {
    let config: PoolConfig = toml::from_str("").expect("empty config should parse");
    assert_eq!(config.idle_timeout_secs, DEFAULT_IDLE_TIMEOUT_SECS);
    assert_eq!(config.user_id_header, DEFAULT_USER_ID_HEADER);
    assert!(config.servers.is_empty());
    assert_eq!(config, PoolConfig::default());
}

#[test]
fn test_missing_config_file_reports_path() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let config_path = temp_dir.path().join("missing.toml");

    let err = PoolConfig::load_from_path(&config_path).expect_err("missing file should fail");
    assert!(matches!(err, ConfigError::Read { .. }));
    assert!(err.to_string().contains("missing.toml"));
}

#[test]
fn test_invalid_toml_is_a_parse_error() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let config_path = temp_dir.path().join("config.toml");
    fs::write(&config_path, "servers = 12").expect("Failed to write config");

    let err = PoolConfig::load_from_path(&config_path).expect_err("bad toml should fail");
    assert!(matches!(err, ConfigError::Parse { .. }));
}

#[test]
fn test_validate_rejects_duplicate_server_names() {
    let config = PoolConfig::with_servers(vec![
        ServerConfig::new("alpha", "https://a.example.com"),
        ServerConfig::new("alpha", "https://b.example.com"),
    ]);
    let err = config.validate().expect_err("duplicates should fail");
    assert!(err.to_string().contains("duplicate server name: alpha"));
}

#[test]
fn test_validate_rejects_non_http_urls_only_for_connectable_servers() {
    let bad = PoolConfig::with_servers(vec![ServerConfig::new("alpha", "ftp://a.example.com")]);
    assert!(bad.validate().is_err());

    let mut disabled = ServerConfig::new("alpha", "ftp://a.example.com");
    disabled.enabled = false;
    let empty = ServerConfig::new("beta", "");
    let ok = PoolConfig::with_servers(vec![disabled, empty]);
    assert!(ok.validate().is_ok());
}

#[test]
fn test_server_connectable_requires_enabled_and_url() {
    assert!(ServerConfig::new("a", "https://a.example.com").is_connectable());
    assert!(!ServerConfig::new("a", "   ").is_connectable());
    let mut disabled = ServerConfig::new("a", "https://a.example.com");
    disabled.enabled = false;
    assert!(!disabled.is_connectable());
}

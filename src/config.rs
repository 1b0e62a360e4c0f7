//! Server configuration.
//!
//! Read once at start-up from defaults, an optional JSON file and environment
//! variables, then validated. Nothing here is reconfigurable at runtime.

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl ConfigError {
    fn invalid(key: &'static str, value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            key,
            value: value.into(),
            reason: reason.into(),
        }
    }
}

/// Top-level configuration for the server.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Hard bound on every execution, in seconds.
    #[serde(default = "default_timeout")]
    pub execution_timeout_seconds: u64,

    /// Origins allowed by the CORS layer. `*` allows any origin.
    #[serde(default = "default_wildcard")]
    pub cors_origins: Vec<String>,

    /// Host header patterns accepted by the server. Supports `*` and `*.domain`.
    #[serde(default = "default_wildcard")]
    pub allowed_hosts: Vec<String>,

    /// Listen address.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Listen port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Version reported by the health probe.
    #[serde(default = "default_version")]
    pub version: String,

    /// Extra directories on the interpreter's module search path.
    #[serde(default)]
    pub python_path: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            execution_timeout_seconds: default_timeout(),
            cors_origins: default_wildcard(),
            allowed_hosts: default_wildcard(),
            host: default_host(),
            port: default_port(),
            version: default_version(),
            python_path: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration: defaults, then the optional JSON file, then
    /// environment variables. The result is validated.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let base = match file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        let config = base.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw)
    }

    /// Parse configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Layer environment overrides on top of `self`.
    ///
    /// `lookup` resolves a variable name to its value; `Config::load` passes
    /// the process environment.
    pub fn apply_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("EXECUTION_TIMEOUT") {
            self.execution_timeout_seconds = raw.trim().parse().map_err(|e| {
                ConfigError::invalid("EXECUTION_TIMEOUT", &raw, format!("{e}"))
            })?;
        }
        if let Some(raw) = lookup("CORS_ORIGINS") {
            self.cors_origins = parse_list("CORS_ORIGINS", &raw)?;
        }
        if let Some(raw) = lookup("ALLOWED_HOSTS") {
            self.allowed_hosts = parse_list("ALLOWED_HOSTS", &raw)?;
        }
        if let Some(raw) = lookup("HOST") {
            self.host = raw
                .trim()
                .parse()
                .map_err(|e| ConfigError::invalid("HOST", &raw, format!("{e}")))?;
        }
        if let Some(raw) = lookup("PORT") {
            self.port = raw
                .trim()
                .parse()
                .map_err(|e| ConfigError::invalid("PORT", &raw, format!("{e}")))?;
        }
        if let Some(raw) = lookup("APP_VERSION") {
            self.version = raw.trim().to_string();
        }
        if let Some(raw) = lookup("PYTHON_PATH") {
            self.python_path = std::env::split_paths(&raw)
                .map(|p| p.to_string_lossy().into_owned())
                .filter(|p| !p.is_empty())
                .collect();
        }
        debug!(?self, "Applied environment overrides");
        Ok(self)
    }

    /// Reject values that would make the server misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.execution_timeout_seconds == 0 {
            return Err(ConfigError::invalid(
                "execution_timeout_seconds",
                "0",
                "must be at least one second",
            ));
        }
        if self.version.is_empty() {
            return Err(ConfigError::invalid("version", "", "must not be empty"));
        }
        validate_entries("cors_origins", &self.cors_origins, validate_origin)?;
        validate_entries("allowed_hosts", &self.allowed_hosts, validate_host_pattern)?;
        Ok(())
    }

    /// The execution deadline applied to every submission.
    pub const fn deadline(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_seconds)
    }

    /// Whether any origin is allowed.
    pub fn allows_any_origin(&self) -> bool {
        self.cors_origins.iter().any(|o| o == "*")
    }

    /// Check a `Host` header value (with or without port) against `allowed_hosts`.
    pub fn host_allowed(&self, host_header: &str) -> bool {
        let host = strip_port(host_header.trim()).to_ascii_lowercase();
        self.allowed_hosts.iter().any(|pattern| {
            if pattern == "*" {
                return true;
            }
            let pattern = pattern.to_ascii_lowercase();
            match pattern.strip_prefix("*.") {
                Some(domain) => host
                    .strip_suffix(domain)
                    .is_some_and(|prefix| prefix.ends_with('.') && prefix.len() > 1),
                None => host == pattern,
            }
        })
    }
}

/// Parse a list value: either a JSON array of strings or a comma-separated string.
fn parse_list(key: &'static str, raw: &str) -> Result<Vec<String>, ConfigError> {
    let trimmed = raw.trim();
    let items: Vec<String> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed)
            .map_err(|e| ConfigError::invalid(key, raw, format!("not a JSON string array: {e}")))?
    } else {
        trimmed.split(',').map(|s| s.trim().to_string()).collect()
    };
    if items.iter().any(String::is_empty) {
        return Err(ConfigError::invalid(key, raw, "contains an empty entry"));
    }
    Ok(items)
}

fn validate_entries(
    key: &'static str,
    entries: &[String],
    check: fn(&str) -> Result<(), String>,
) -> Result<(), ConfigError> {
    if entries.is_empty() {
        return Err(ConfigError::invalid(key, "[]", "must list at least one entry"));
    }
    for entry in entries {
        check(entry).map_err(|reason| ConfigError::invalid(key, entry.as_str(), reason))?;
    }
    Ok(())
}

fn validate_origin(origin: &str) -> Result<(), String> {
    if origin == "*" {
        return Ok(());
    }
    let rest = origin
        .strip_prefix("http://")
        .or_else(|| origin.strip_prefix("https://"))
        .ok_or("origin must start with http:// or https://")?;
    if rest.is_empty() || rest.contains('/') || rest.chars().any(char::is_whitespace) {
        return Err("origin must be scheme://host[:port] with no path".to_string());
    }
    Ok(())
}

fn validate_host_pattern(pattern: &str) -> Result<(), String> {
    if pattern.is_empty() || pattern.contains('/') || pattern.chars().any(char::is_whitespace) {
        return Err("host pattern must be a bare host name".to_string());
    }
    if pattern != "*" && pattern.contains('*') && !pattern.starts_with("*.") {
        return Err("wildcards are only allowed as a leading '*.'".to_string());
    }
    Ok(())
}

/// Drop a trailing `:port` from a Host header, keeping bracketed IPv6 intact.
fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return host.find(']').map_or(host, |end| &host[..=end]);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

const fn default_timeout() -> u64 {
    30
}

fn default_wildcard() -> Vec<String> {
    vec!["*".to_string()]
}

const fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

const fn default_port() -> u16 {
    8000
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.execution_timeout_seconds, 30);
        assert_eq!(config.deadline(), Duration::from_secs(30));
        assert_eq!(config.port, 8000);
        assert_eq!(config.cors_origins, vec!["*"]);
        assert_eq!(config.allowed_hosts, vec!["*"]);
        assert_eq!(config.version, env!("CARGO_PKG_VERSION"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parse_partial_json() {
        let config = Config::from_json(r#"{"execution_timeout_seconds": 5, "port": 9000}"#).unwrap();
        assert_eq!(config.execution_timeout_seconds, 5);
        assert_eq!(config.port, 9000);
        // Unset fields fall back to defaults
        assert_eq!(config.cors_origins, vec!["*"]);
    }

    #[test]
    fn unknown_json_field_rejected() {
        assert!(Config::from_json(r#"{"timeout": 5}"#).is_err());
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"allowed_hosts": ["localhost"], "version": "2.1.0"}"#).unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.allowed_hosts, vec!["localhost"]);
        assert_eq!(config.version, "2.1.0");
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = Config::from_file(Path::new("/nonexistent/config.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn env_overrides() {
        let config = Config::default()
            .apply_overrides(env(&[
                ("EXECUTION_TIMEOUT", "10"),
                ("PORT", "8080"),
                ("HOST", "127.0.0.1"),
                ("CORS_ORIGINS", r#"["http://localhost:3000", "https://app.example.com"]"#),
                ("ALLOWED_HOSTS", "localhost, *.example.com"),
                ("APP_VERSION", "1.2.3"),
            ]))
            .unwrap();

        assert_eq!(config.execution_timeout_seconds, 10);
        assert_eq!(config.port, 8080);
        assert_eq!(config.host, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(
            config.cors_origins,
            vec!["http://localhost:3000", "https://app.example.com"]
        );
        assert_eq!(config.allowed_hosts, vec!["localhost", "*.example.com"]);
        assert_eq!(config.version, "1.2.3");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn malformed_timeout_rejected() {
        let err = Config::default()
            .apply_overrides(env(&[("EXECUTION_TIMEOUT", "thirty")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { key: "EXECUTION_TIMEOUT", .. }
        ));
    }

    #[test]
    fn malformed_list_rejected() {
        // A list literal that is not valid JSON is an error, not a single origin
        assert!(Config::default()
            .apply_overrides(env(&[("CORS_ORIGINS", "['http://a.com']")]))
            .is_err());
        assert!(Config::default()
            .apply_overrides(env(&[("ALLOWED_HOSTS", "a.com,,b.com")]))
            .is_err());
        assert!(Config::default()
            .apply_overrides(env(&[("CORS_ORIGINS", "[1, 2]")]))
            .is_err());
    }

    #[test]
    fn zero_timeout_rejected() {
        let config = Config {
            execution_timeout_seconds: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_origin_rejected() {
        let config = Config {
            cors_origins: vec!["localhost:3000".to_string()],
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            cors_origins: vec!["https://example.com/path".to_string()],
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_hosts_rejected() {
        let config = Config {
            allowed_hosts: Vec::new(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn host_matching() {
        let config = Config {
            allowed_hosts: vec!["localhost".to_string(), "*.example.com".to_string()],
            ..Config::default()
        };
        assert!(config.host_allowed("localhost"));
        assert!(config.host_allowed("localhost:8000"));
        assert!(config.host_allowed("API.example.com"));
        assert!(!config.host_allowed("example.com"));
        assert!(!config.host_allowed("evil.com"));
        assert!(!config.host_allowed("notexample.com"));
    }

    #[test]
    fn wildcard_host_allows_everything() {
        let config = Config::default();
        assert!(config.host_allowed("anything.test:1234"));
        assert!(config.host_allowed("[::1]:8000"));
    }

    #[test]
    fn strip_port_variants() {
        assert_eq!(strip_port("localhost:8000"), "localhost");
        assert_eq!(strip_port("localhost"), "localhost");
        assert_eq!(strip_port("[::1]:8000"), "[::1]");
        assert_eq!(strip_port("[::1]"), "[::1]");
    }
}

//! Server configuration.
//!
//! Loaded from `CERRO_*` environment variables. Values that are present
//! but unparseable fail startup; absent values fall back to defaults.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use cerro_core::{Error, Result, Tier};

/// Configuration for the Cerro API server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server port.
    pub http_port: u16,

    /// Enable debug mode.
    ///
    /// When enabled:
    /// - pretty (non-JSON) logs
    /// - an in-memory query backend is allowed when ClickHouse is unconfigured
    pub debug: bool,

    /// Manifest source and refresh configuration.
    #[serde(default)]
    pub manifest: ManifestConfig,

    /// Path to the API-key trust store (JSON file).
    #[serde(default)]
    pub api_keys_file: Option<PathBuf>,

    /// Required tier for endpoints without a `tier<N>` tag.
    #[serde(default)]
    pub default_endpoint_tier: Tier,

    /// ClickHouse connection settings.
    #[serde(default)]
    pub clickhouse: ClickHouseConfig,

    /// CORS configuration.
    #[serde(default)]
    pub cors: CorsConfig,

    /// Whether per-credential rate limiting is enforced.
    #[serde(default = "default_true")]
    pub rate_limit_enabled: bool,

    /// Per-request budget for backend query execution, in seconds.
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,
}

const fn default_true() -> bool {
    true
}

const fn default_query_timeout_secs() -> u64 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 8000,
            debug: false,
            manifest: ManifestConfig::default(),
            api_keys_file: None,
            default_endpoint_tier: Tier::Tier0,
            clickhouse: ClickHouseConfig::default(),
            cors: CorsConfig::default(),
            rate_limit_enabled: true,
            query_timeout_secs: default_query_timeout_secs(),
        }
    }
}

/// Manifest source and refresh configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestConfig {
    /// Remote manifest URL, tried first.
    #[serde(default)]
    pub url: Option<String>,

    /// Local fallback copy of the manifest.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Whether the background refresh task runs.
    #[serde(default = "default_true")]
    pub refresh_enabled: bool,

    /// Background refresh interval in seconds.
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,

    /// Timeout for fetching the manifest, independent of request-serving
    /// timeouts.
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
}

const fn default_refresh_interval_secs() -> u64 {
    300
}

const fn default_fetch_timeout_secs() -> u64 {
    30
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self {
            url: None,
            path: None,
            refresh_enabled: true,
            refresh_interval_secs: default_refresh_interval_secs(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
        }
    }
}

/// ClickHouse connection settings.
///
/// Either a full `url` (ClickHouse Cloud hostname or `http(s)://…` base) or
/// host/port parts. The URL takes precedence when both are set.
#[derive(Clone, Serialize, Deserialize)]
pub struct ClickHouseConfig {
    /// Full base URL or bare hostname (Cloud deployments).
    #[serde(default)]
    pub url: Option<String>,
    /// Hostname when `url` is unset.
    pub host: String,
    /// HTTP(S) interface port.
    pub port: u16,
    /// Username.
    pub user: String,
    /// Password. Redacted from Debug output.
    pub password: String,
    /// Database to query.
    pub database: String,
    /// Use HTTPS when composing from host/port.
    pub secure: bool,
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: "localhost".to_string(),
            port: 8443,
            user: "default".to_string(),
            password: String::new(),
            database: "default".to_string(),
            secure: true,
        }
    }
}

impl std::fmt::Debug for ClickHouseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClickHouseConfig")
            .field("url", &self.url)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("database", &self.database)
            .field("secure", &self.secure)
            .finish()
    }
}

impl ClickHouseConfig {
    /// Whether a connection target was explicitly configured.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.url.is_some() || self.host != "localhost"
    }

    /// The HTTP(S) base URL queries are POSTed to.
    #[must_use]
    pub fn base_url(&self) -> String {
        if let Some(url) = &self.url {
            if url.starts_with("http://") || url.starts_with("https://") {
                return url.trim_end_matches('/').to_string();
            }
            return format!("https://{url}:{}", self.port);
        }
        let scheme = if self.secure { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}

/// CORS configuration for browser-based access.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Allowed origins. Use `["*"]` to allow all origins (development only).
    /// Empty list disables CORS entirely.
    pub allowed_origins: Vec<String>,

    /// Max age for preflight cache (seconds).
    pub max_age_seconds: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
            max_age_seconds: 3600,
        }
    }
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// Supported env vars:
    /// - `CERRO_HTTP_PORT`
    /// - `CERRO_DEBUG`
    /// - `CERRO_MANIFEST_URL`
    /// - `CERRO_MANIFEST_PATH`
    /// - `CERRO_MANIFEST_REFRESH_ENABLED`
    /// - `CERRO_MANIFEST_REFRESH_INTERVAL_SECONDS`
    /// - `CERRO_MANIFEST_FETCH_TIMEOUT_SECONDS`
    /// - `CERRO_API_KEYS_FILE`
    /// - `CERRO_DEFAULT_ENDPOINT_TIER` (`tier0`..`tier3`)
    /// - `CERRO_CLICKHOUSE_URL`
    /// - `CERRO_CLICKHOUSE_HOST`
    /// - `CERRO_CLICKHOUSE_PORT`
    /// - `CERRO_CLICKHOUSE_USER`
    /// - `CERRO_CLICKHOUSE_PASSWORD`
    /// - `CERRO_CLICKHOUSE_DATABASE`
    /// - `CERRO_CLICKHOUSE_SECURE`
    /// - `CERRO_CORS_ALLOWED_ORIGINS` (comma-separated, or `*`)
    /// - `CERRO_CORS_MAX_AGE_SECONDS`
    /// - `CERRO_RATE_LIMIT_ENABLED`
    /// - `CERRO_QUERY_TIMEOUT_SECONDS`
    ///
    /// # Errors
    ///
    /// Returns an error if any environment variable is present but cannot
    /// be parsed, or if no manifest source is configured.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(port) = env_u16("CERRO_HTTP_PORT")? {
            config.http_port = port;
        }
        if let Some(debug) = env_bool("CERRO_DEBUG")? {
            config.debug = debug;
        }

        if let Some(url) = env_string("CERRO_MANIFEST_URL") {
            config.manifest.url = Some(url);
        }
        if let Some(path) = env_string("CERRO_MANIFEST_PATH") {
            config.manifest.path = Some(PathBuf::from(path));
        }
        if let Some(enabled) = env_bool("CERRO_MANIFEST_REFRESH_ENABLED")? {
            config.manifest.refresh_enabled = enabled;
        }
        if let Some(secs) = env_u64("CERRO_MANIFEST_REFRESH_INTERVAL_SECONDS")? {
            if secs == 0 {
                return Err(Error::InvalidInput(
                    "CERRO_MANIFEST_REFRESH_INTERVAL_SECONDS must be greater than 0".to_string(),
                ));
            }
            config.manifest.refresh_interval_secs = secs;
        }
        if let Some(secs) = env_u64("CERRO_MANIFEST_FETCH_TIMEOUT_SECONDS")? {
            config.manifest.fetch_timeout_secs = secs;
        }

        if let Some(path) = env_string("CERRO_API_KEYS_FILE") {
            config.api_keys_file = Some(PathBuf::from(path));
        }
        if let Some(tier) = env_string("CERRO_DEFAULT_ENDPOINT_TIER") {
            config.default_endpoint_tier = tier.parse()?;
        }

        if let Some(url) = env_string("CERRO_CLICKHOUSE_URL") {
            config.clickhouse.url = Some(url);
        }
        if let Some(host) = env_string("CERRO_CLICKHOUSE_HOST") {
            config.clickhouse.host = host;
        }
        if let Some(port) = env_u16("CERRO_CLICKHOUSE_PORT")? {
            config.clickhouse.port = port;
        }
        if let Some(user) = env_string("CERRO_CLICKHOUSE_USER") {
            config.clickhouse.user = user;
        }
        if let Some(password) = env_string("CERRO_CLICKHOUSE_PASSWORD") {
            config.clickhouse.password = password;
        }
        if let Some(database) = env_string("CERRO_CLICKHOUSE_DATABASE") {
            config.clickhouse.database = database;
        }
        if let Some(secure) = env_bool("CERRO_CLICKHOUSE_SECURE")? {
            config.clickhouse.secure = secure;
        }

        if let Some(origins) = env_string("CERRO_CORS_ALLOWED_ORIGINS") {
            config.cors.allowed_origins = parse_cors_allowed_origins(&origins);
        }
        if let Some(max_age) = env_u64("CERRO_CORS_MAX_AGE_SECONDS")? {
            config.cors.max_age_seconds = max_age;
        }

        if let Some(enabled) = env_bool("CERRO_RATE_LIMIT_ENABLED")? {
            config.rate_limit_enabled = enabled;
        }
        if let Some(secs) = env_u64("CERRO_QUERY_TIMEOUT_SECONDS")? {
            if secs == 0 {
                return Err(Error::InvalidInput(
                    "CERRO_QUERY_TIMEOUT_SECONDS must be greater than 0".to_string(),
                ));
            }
            config.query_timeout_secs = secs;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates cross-field invariants.
    ///
    /// # Errors
    ///
    /// Returns an error when no manifest source is configured, or when the
    /// CORS wildcard is combined with other origins or with production mode.
    pub fn validate(&self) -> Result<()> {
        if self.manifest.url.is_none() && self.manifest.path.is_none() {
            return Err(Error::InvalidInput(
                "CERRO_MANIFEST_URL or CERRO_MANIFEST_PATH is required".to_string(),
            ));
        }

        let has_wildcard = self.cors.allowed_origins.iter().any(|origin| origin == "*");
        if has_wildcard && self.cors.allowed_origins.len() > 1 {
            return Err(Error::InvalidInput(
                "cors.allowed_origins: '*' must be the only allowed origin".to_string(),
            ));
        }
        if !self.debug && has_wildcard {
            return Err(Error::InvalidInput(
                "cors.allowed_origins cannot include '*' when debug=false".to_string(),
            ));
        }

        Ok(())
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn env_u16(name: &str) -> Result<Option<u16>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<u16>()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("{name} must be a u16: {e}")))
}

fn env_u64(name: &str) -> Result<Option<u64>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<u64>()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("{name} must be a u64: {e}")))
}

fn env_bool(name: &str) -> Result<Option<bool>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    match v.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "y" => Ok(Some(true)),
        "false" | "0" | "no" | "n" => Ok(Some(false)),
        _ => Err(Error::InvalidInput(format!(
            "{name} must be a boolean (true/false/1/0)"
        ))),
    }
}

fn parse_cors_allowed_origins(value: &str) -> Vec<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    if trimmed == "*" {
        return vec!["*".to_string()];
    }

    trimmed
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_requires_a_manifest_source() {
        let config = Config::default();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("CERRO_MANIFEST_URL"));
    }

    #[test]
    fn validate_rejects_wildcard_cors_in_production() {
        let config = Config {
            manifest: ManifestConfig {
                path: Some(PathBuf::from("./manifest.json")),
                ..ManifestConfig::default()
            },
            cors: CorsConfig {
                allowed_origins: vec!["*".to_string()],
                max_age_seconds: 3600,
            },
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let debug = Config {
            debug: true,
            ..config
        };
        assert!(debug.validate().is_ok());
    }

    #[test]
    fn clickhouse_base_url_composition() {
        let mut ch = ClickHouseConfig::default();
        assert_eq!(ch.base_url(), "https://localhost:8443");

        ch.secure = false;
        ch.port = 8123;
        assert_eq!(ch.base_url(), "http://localhost:8123");

        ch.url = Some("abc123.eu-central-1.aws.clickhouse.cloud".to_string());
        ch.port = 8443;
        assert_eq!(
            ch.base_url(),
            "https://abc123.eu-central-1.aws.clickhouse.cloud:8443"
        );

        ch.url = Some("http://ch.internal:9000/".to_string());
        assert_eq!(ch.base_url(), "http://ch.internal:9000");
    }

    #[test]
    fn clickhouse_debug_redacts_password() {
        let ch = ClickHouseConfig {
            password: "hunter2".to_string(),
            ..ClickHouseConfig::default()
        };
        let rendered = format!("{ch:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("[REDACTED]"));
    }

    #[test]
    fn cors_origin_parsing() {
        assert_eq!(parse_cors_allowed_origins("*"), vec!["*"]);
        assert_eq!(
            parse_cors_allowed_origins("https://a.example, https://b.example"),
            vec!["https://a.example", "https://b.example"]
        );
        assert!(parse_cors_allowed_origins("  ").is_empty());
    }
}

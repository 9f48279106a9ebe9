use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Deserializer, Serialize};
use serde_aux::prelude::deserialize_vec_from_string_or_vec;

/// Application configuration loaded from multiple sources.
///
/// Configuration is loaded in priority order (lowest to highest):
/// 1. Struct defaults
/// 2. config.yaml file (if exists)
/// 3. Environment variables with VK_ prefix (always wins)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub security_headers: SecurityHeadersConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub tokens: TokenConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub operations: OperationsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// HTTP server port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// HTTP server bind address.
    #[serde(default = "default_host")]
    pub host: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level filter (debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CorsConfig {
    /// Allowed origins for CORS requests.
    /// Use `"*"` to allow any origin (not recommended for production).
    /// Accepts either an array or comma-separated string.
    #[serde(
        default = "default_allowed_origins",
        deserialize_with = "deserialize_list"
    )]
    pub allowed_origins: Vec<String>,
}

/// Deserialize a list from comma-separated string or array, filtering empty values.
fn deserialize_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let items: Vec<String> = deserialize_vec_from_string_or_vec(deserializer)?;
    Ok(items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect())
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SecurityHeadersConfig {
    /// Enable security headers (default: true).
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Enable HSTS header (default: false, enable in production with HTTPS).
    #[serde(default)]
    pub hsts_enabled: bool,

    /// HSTS max-age in seconds (default: 31536000 = 1 year).
    #[serde(default = "default_hsts_max_age")]
    pub hsts_max_age: u64,

    /// Include subdomains in HSTS (default: true).
    #[serde(default = "default_true")]
    pub hsts_include_subdomains: bool,

    /// X-Frame-Options value: "DENY" or "SAMEORIGIN" (default: "DENY").
    #[serde(default = "default_frame_options")]
    pub frame_options: String,

    /// Content-Security-Policy header value (default: "default-src 'self'").
    #[serde(default = "default_csp")]
    pub content_security_policy: String,

    /// Referrer-Policy header value (default: "strict-origin-when-cross-origin").
    #[serde(default = "default_referrer_policy")]
    pub referrer_policy: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// Session keys unused for this long are destroyed (session expiry).
    #[serde(default = "default_session_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Expose `POST /api/session`, which hands out a session id and key in
    /// the response body. Development only: in production the host
    /// application's login issues keys.
    /// Enable via `VK_SESSION__BOOTSTRAP_ENABLED=true`
    #[serde(default)]
    pub bootstrap_enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TokenConfig {
    /// Longest lifetime a capability token may be minted with.
    #[serde(default = "default_max_token_minutes")]
    pub max_duration_minutes: i64,

    /// Length of generated backup passphrases (and the cap for
    /// `generate_password` requests).
    #[serde(default = "default_password_length")]
    pub password_length: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UploadConfig {
    /// Directory holding partial uploads and assembled artifacts.
    #[serde(default = "default_upload_dir")]
    pub dir: String,

    /// Largest artifact accepted, in MiB.
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,

    /// Largest single chunk accepted, in MiB.
    #[serde(default = "default_max_chunk_size_mb")]
    pub max_chunk_size_mb: u64,

    /// File extensions accepted for restore uploads (without the dot).
    #[serde(
        default = "default_allowed_extensions",
        deserialize_with = "deserialize_list"
    )]
    pub allowed_extensions: Vec<String>,

    /// Upload sessions without a chunk for this long are discarded.
    #[serde(default = "default_upload_inactivity")]
    pub inactivity_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OperationsConfig {
    /// A dump or restore still running after this long is forced to failed.
    #[serde(default = "default_operation_timeout")]
    pub timeout_secs: u64,

    /// Finished operation records are kept this long for status polling.
    #[serde(default = "default_operation_retention")]
    pub retention_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Program run to produce a dump. Receives the passphrase in
    /// `VK_BACKUP_PASSPHRASE` and must print the artifact location on stdout.
    #[serde(default)]
    pub dump_command: Option<String>,

    /// Program run to restore a dump. Receives the passphrase in
    /// `VK_BACKUP_PASSPHRASE` and the artifact path as its last argument.
    #[serde(default)]
    pub restore_command: Option<String>,

    /// JSON file persisting application settings such as `bck_script_passkey`.
    /// When unset, settings live in memory only.
    #[serde(default)]
    pub settings_file: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MaintenanceConfig {
    /// Interval between sweeps of expired tokens, idle uploads and sessions.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

// These functions cannot be const because serde uses function pointers for defaults
#[allow(clippy::missing_const_for_fn)]
fn default_port() -> u16 {
    8080
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

#[allow(clippy::missing_const_for_fn)]
fn default_allowed_origins() -> Vec<String> {
    // Default to empty (no cross-origin requests allowed) - safe for production
    // Configure explicitly via VK_CORS__ALLOWED_ORIGINS or config.yaml
    vec![]
}

#[allow(clippy::missing_const_for_fn)]
fn default_true() -> bool {
    true
}

#[allow(clippy::missing_const_for_fn)]
fn default_hsts_max_age() -> u64 {
    31_536_000 // 1 year
}

fn default_frame_options() -> String {
    "DENY".to_string()
}

fn default_csp() -> String {
    "default-src 'self'".to_string()
}

fn default_referrer_policy() -> String {
    "strict-origin-when-cross-origin".to_string()
}

#[allow(clippy::missing_const_for_fn)]
fn default_session_idle_timeout() -> u64 {
    3600
}

#[allow(clippy::missing_const_for_fn)]
fn default_max_token_minutes() -> i64 {
    60
}

#[allow(clippy::missing_const_for_fn)]
fn default_password_length() -> usize {
    40
}

fn default_upload_dir() -> String {
    std::env::temp_dir()
        .join("vaultkeep-uploads")
        .to_string_lossy()
        .into_owned()
}

#[allow(clippy::missing_const_for_fn)]
fn default_max_file_size_mb() -> u64 {
    512
}

#[allow(clippy::missing_const_for_fn)]
fn default_max_chunk_size_mb() -> u64 {
    5
}

fn default_allowed_extensions() -> Vec<String> {
    vec!["sql".to_string()]
}

#[allow(clippy::missing_const_for_fn)]
fn default_upload_inactivity() -> u64 {
    600
}

#[allow(clippy::missing_const_for_fn)]
fn default_operation_timeout() -> u64 {
    3600
}

#[allow(clippy::missing_const_for_fn)]
fn default_operation_retention() -> u64 {
    86_400
}

#[allow(clippy::missing_const_for_fn)]
fn default_sweep_interval() -> u64 {
    60
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: default_allowed_origins(),
        }
    }
}

impl Default for SecurityHeadersConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            hsts_enabled: false,
            hsts_max_age: default_hsts_max_age(),
            hsts_include_subdomains: default_true(),
            frame_options: default_frame_options(),
            content_security_policy: default_csp(),
            referrer_policy: default_referrer_policy(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_session_idle_timeout(),
            bootstrap_enabled: false,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            max_duration_minutes: default_max_token_minutes(),
            password_length: default_password_length(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            dir: default_upload_dir(),
            max_file_size_mb: default_max_file_size_mb(),
            max_chunk_size_mb: default_max_chunk_size_mb(),
            allowed_extensions: default_allowed_extensions(),
            inactivity_timeout_secs: default_upload_inactivity(),
        }
    }
}

impl UploadConfig {
    #[must_use]
    pub const fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb.saturating_mul(1024 * 1024)
    }

    #[must_use]
    pub const fn max_chunk_size_bytes(&self) -> u64 {
        self.max_chunk_size_mb.saturating_mul(1024 * 1024)
    }

    #[must_use]
    pub const fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }
}

impl Default for OperationsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_operation_timeout(),
            retention_secs: default_operation_retention(),
        }
    }
}

impl OperationsConfig {
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    #[must_use]
    pub const fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl MaintenanceConfig {
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                port: default_port(),
                host: default_host(),
            },
            logging: LoggingConfig {
                level: default_log_level(),
            },
            cors: CorsConfig::default(),
            security_headers: SecurityHeadersConfig::default(),
            session: SessionConfig::default(),
            tokens: TokenConfig::default(),
            upload: UploadConfig::default(),
            operations: OperationsConfig::default(),
            storage: StorageConfig::default(),
            maintenance: MaintenanceConfig::default(),
        }
    }
}

/// Configuration loading and validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Figment(#[from] Box<figment::Error>),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// Sources are merged in priority order:
    /// 1. Struct defaults (lowest)
    /// 2. config.yaml file (if exists)
    /// 3. Environment variables with VK_ prefix (highest)
    ///
    /// # Errors
    /// Returns an error if configuration cannot be loaded or is invalid.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config.yaml")
    }

    /// Load configuration with a custom YAML file path.
    ///
    /// # Errors
    /// Returns an error if configuration cannot be loaded or is invalid.
    pub fn load_from(yaml_path: &str) -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Yaml::file(yaml_path))
            .merge(Env::prefixed("VK_").split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    /// Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Validation("server.port cannot be 0".into()));
        }

        // CORS origins must be valid URLs or "*"
        for origin in &self.cors.allowed_origins {
            if origin != "*" && !origin.starts_with("http://") && !origin.starts_with("https://") {
                return Err(ConfigError::Validation(format!(
                    "cors.allowed_origins contains invalid origin '{origin}'. Must be '*' or start with http:// or https://"
                )));
            }
        }

        // X-Frame-Options must be DENY or SAMEORIGIN
        let frame_opts = self.security_headers.frame_options.to_uppercase();
        if frame_opts != "DENY" && frame_opts != "SAMEORIGIN" {
            return Err(ConfigError::Validation(format!(
                "security_headers.frame_options must be 'DENY' or 'SAMEORIGIN', got: '{}'",
                self.security_headers.frame_options
            )));
        }

        if self.session.idle_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "session.idle_timeout_secs cannot be 0".into(),
            ));
        }

        if self.tokens.max_duration_minutes < 1 {
            return Err(ConfigError::Validation(
                "tokens.max_duration_minutes must be at least 1".into(),
            ));
        }

        if !(crate::tokens::MIN_SECRET_LENGTH..=crate::tokens::MAX_SECRET_LENGTH)
            .contains(&self.tokens.password_length)
        {
            return Err(ConfigError::Validation(format!(
                "tokens.password_length must be between {} and {}",
                crate::tokens::MIN_SECRET_LENGTH,
                crate::tokens::MAX_SECRET_LENGTH
            )));
        }

        if self.upload.dir.trim().is_empty() {
            return Err(ConfigError::Validation("upload.dir is required".into()));
        }

        if self.upload.max_file_size_mb == 0 {
            return Err(ConfigError::Validation(
                "upload.max_file_size_mb cannot be 0".into(),
            ));
        }

        if self.upload.max_chunk_size_mb == 0 {
            return Err(ConfigError::Validation(
                "upload.max_chunk_size_mb cannot be 0".into(),
            ));
        }

        if self.upload.allowed_extensions.is_empty() {
            return Err(ConfigError::Validation(
                "upload.allowed_extensions must list at least one extension".into(),
            ));
        }

        for ext in &self.upload.allowed_extensions {
            if !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(ConfigError::Validation(format!(
                    "upload.allowed_extensions contains invalid extension '{ext}'. Use bare alphanumeric extensions like 'sql'"
                )));
            }
        }

        if self.upload.inactivity_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "upload.inactivity_timeout_secs cannot be 0".into(),
            ));
        }

        if self.operations.timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "operations.timeout_secs cannot be 0".into(),
            ));
        }

        if self.maintenance.sweep_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "maintenance.sweep_interval_secs cannot be 0".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.upload.allowed_extensions, vec!["sql".to_string()]);
        assert_eq!(config.upload.max_chunk_size_bytes(), 5 * 1024 * 1024);
        assert_eq!(config.tokens.password_length, 40);
        assert!(!config.session.bootstrap_enabled);
        assert!(config.storage.dump_command.is_none());
    }

    #[test]
    fn test_validation_accepts_defaults() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_cors_defaults_to_empty() {
        let config = CorsConfig::default();
        assert!(config.allowed_origins.is_empty());
    }

    #[test]
    fn test_cors_validation_rejects_invalid_origin() {
        let mut config = Config::default();
        config.cors.allowed_origins = vec!["not-a-url".into()];
        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("invalid origin"));
    }

    #[test]
    fn test_cors_deserialize_comma_separated_string() {
        // Simulate what figment does with env var
        let json = r#"{"allowed_origins": "http://localhost:5173,https://app.example.com"}"#;
        let config: CorsConfig = serde_json::from_str(json).expect("should parse");
        assert_eq!(config.allowed_origins.len(), 2);
        assert_eq!(config.allowed_origins[0], "http://localhost:5173");
        assert_eq!(config.allowed_origins[1], "https://app.example.com");
    }

    #[test]
    fn test_cors_deserialize_empty_string() {
        let json = r#"{"allowed_origins": ""}"#;
        let config: CorsConfig = serde_json::from_str(json).expect("should parse");
        assert!(config.allowed_origins.is_empty());
    }

    #[test]
    fn test_upload_extensions_accept_comma_separated_string() {
        let json = r#"{"allowed_extensions": "sql, gz"}"#;
        let config: UploadConfig = serde_json::from_str(json).expect("should parse");
        assert_eq!(config.allowed_extensions, vec!["sql", "gz"]);
        assert_eq!(config.max_file_size_mb, 512);
    }

    #[test]
    fn test_upload_rejects_dotted_extension() {
        let mut config = Config::default();
        config.upload.allowed_extensions = vec![".sql".into()];
        let result = config.validate();
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("upload.allowed_extensions"));
    }

    #[test]
    fn test_session_bootstrap_can_be_enabled() {
        let json = r#"{"bootstrap_enabled": true}"#;
        let config: SessionConfig = serde_json::from_str(json).expect("should parse");
        assert!(config.bootstrap_enabled);
        assert_eq!(config.idle_timeout_secs, 3600);
    }

    #[test]
    fn test_env_overrides_yaml() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "config.yaml",
                "server:\n  port: 9000\nupload:\n  max_file_size_mb: 64\n",
            )?;
            jail.set_env("VK_SERVER__PORT", "9100");
            jail.set_env("VK_UPLOAD__ALLOWED_EXTENSIONS", "sql,dump");

            let config = Config::load().map_err(|e| e.to_string())?;
            assert_eq!(config.server.port, 9100);
            assert_eq!(config.upload.max_file_size_mb, 64);
            assert_eq!(config.upload.allowed_extensions, vec!["sql", "dump"]);
            Ok(())
        });
    }

    // Table-driven boundary tests for validation rules

    #[test]
    fn port_boundaries() {
        let cases = [
            (0u16, false, "zero port"),
            (1, true, "minimum valid port"),
            (8080, true, "default port"),
            (65535, true, "maximum port"),
        ];

        for (port, should_pass, desc) in cases {
            let mut config = Config::default();
            config.server.port = port;
            let result = config.validate();
            assert_eq!(result.is_ok(), should_pass, "case '{}': {:?}", desc, result);
        }
    }

    #[test]
    fn token_duration_boundaries() {
        let cases = [
            (-5i64, false, "negative"),
            (0, false, "zero"),
            (1, true, "one minute"),
            (60, true, "default"),
        ];

        for (minutes, should_pass, desc) in cases {
            let mut config = Config::default();
            config.tokens.max_duration_minutes = minutes;
            let result = config.validate();
            assert_eq!(result.is_ok(), should_pass, "case '{}': {:?}", desc, result);
        }
    }

    #[test]
    fn password_length_boundaries() {
        let cases = [
            (7usize, false, "below minimum"),
            (8, true, "minimum"),
            (40, true, "default"),
            (128, true, "maximum"),
            (129, false, "above maximum"),
        ];

        for (len, should_pass, desc) in cases {
            let mut config = Config::default();
            config.tokens.password_length = len;
            let result = config.validate();
            assert_eq!(result.is_ok(), should_pass, "case '{}': {:?}", desc, result);
        }
    }

    #[test]
    fn frame_options_boundaries() {
        let cases = [
            ("DENY", true, "uppercase DENY"),
            ("sameorigin", true, "lowercase sameorigin"),
            ("ALLOW-FROM", false, "deprecated ALLOW-FROM"),
            ("", false, "empty string"),
        ];

        for (value, should_pass, desc) in cases {
            let mut config = Config::default();
            config.security_headers.frame_options = value.into();
            let result = config.validate();
            assert_eq!(result.is_ok(), should_pass, "case '{}': {:?}", desc, result);
        }
    }
}

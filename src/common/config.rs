//! Configuration file handling
//!
//! The settings describe the server under test. They are loaded once per run
//! and handed to every test body.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::paths::config_path;
use super::{Error, Result};

/// Environment variable overriding `base_url`
pub const BASE_URL_ENV: &str = "BDT_BASE_URL";

/// Environment variable providing a pre-issued access token
pub const ACCESS_TOKEN_ENV: &str = "BDT_ACCESS_TOKEN";

/// Settings for the server under test
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Full URL of the server, to which export endpoints are appended
    #[serde(default)]
    pub base_url: String,

    /// Full URL of the token endpoint
    #[serde(default)]
    pub token_endpoint: Option<String>,

    /// Registered client id
    #[serde(default)]
    pub client_id: Option<String>,

    /// Pre-shared secret for client-credentials authentication
    #[serde(default)]
    pub client_secret: Option<String>,

    /// How the tester obtains access tokens
    #[serde(default)]
    pub auth_type: AuthType,

    /// PEM (RS384/ES384) or raw Ed25519 private key used to sign client assertions
    #[serde(default)]
    pub private_key: Option<PathBuf>,

    /// JWS algorithm of `private_key`
    #[serde(default)]
    pub signing_algorithm: SigningAlgorithm,

    /// `kid` header placed on signed client assertions
    #[serde(default)]
    pub key_id: Option<String>,

    /// Pre-issued access token; skips the token exchange when set
    #[serde(default)]
    pub access_token: Option<String>,

    /// Scopes requested from the token endpoint
    #[serde(default = "default_scope")]
    pub scope: String,

    /// Set to false to accept self-signed certificates
    #[serde(default = "default_strict_ssl")]
    pub strict_ssl: bool,

    /// System-level export endpoint relative to the server root (e.g. "/$export")
    #[serde(default)]
    pub system_export_endpoint: Option<String>,

    /// Patient-level export endpoint (e.g. "/Patient/$export")
    #[serde(default)]
    pub patient_export_endpoint: Option<String>,

    /// Group-level export endpoint (e.g. "/Group/5/$export")
    #[serde(default)]
    pub group_export_endpoint: Option<String>,

    /// Resource type that is quick to export
    #[serde(default = "default_fastest_resource")]
    pub fastest_resource: String,

    /// Status polling backoff
    #[serde(default)]
    pub polling: PollingConfig,
}

/// Token acquisition strategy
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AuthType {
    /// Requests are sent without a token (unless `access_token` is set)
    #[default]
    None,
    /// HTTP Basic exchange with `client_id` and `client_secret`
    ClientCredentials,
    /// Signed client assertion exchanged for a token
    BackendServices,
}

/// Algorithm used to sign client assertions
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
pub enum SigningAlgorithm {
    #[default]
    RS384,
    ES384,
    EdDSA,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            token_endpoint: None,
            client_id: None,
            client_secret: None,
            auth_type: AuthType::default(),
            private_key: None,
            signing_algorithm: SigningAlgorithm::default(),
            key_id: None,
            access_token: None,
            scope: default_scope(),
            strict_ssl: default_strict_ssl(),
            system_export_endpoint: None,
            patient_export_endpoint: None,
            group_export_endpoint: None,
            fastest_resource: default_fastest_resource(),
            polling: PollingConfig::default(),
        }
    }
}

fn default_scope() -> String {
    "system/*.read".to_string()
}

fn default_strict_ssl() -> bool {
    true
}

fn default_fastest_resource() -> String {
    "Patient".to_string()
}

/// Backoff applied while a job reports "still running"
#[derive(Debug, Clone, Deserialize)]
pub struct PollingConfig {
    /// Delay after the first "still running" response
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Added to the delay after every further attempt
    #[serde(default = "default_step")]
    pub step_ms: u64,

    /// Upper bound for a single delay
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay(),
            step_ms: default_step(),
            max_delay_ms: default_max_delay(),
        }
    }
}

fn default_initial_delay() -> u64 {
    2_000
}
fn default_step() -> u64 {
    1_000
}
fn default_max_delay() -> u64 {
    10_000
}

impl PollingConfig {
    /// Delay to wait after the `attempt`-th status request (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let extra = self
            .step_ms
            .saturating_mul(u64::from(attempt.saturating_sub(1)));
        let ms = self.initial_delay_ms.saturating_add(extra);
        Duration::from_millis(ms.min(self.max_delay_ms))
    }
}

impl Settings {
    /// Load settings from `path`, or from the default config file if it exists
    ///
    /// Environment overrides are applied afterwards. Fails if no base URL
    /// is configured anywhere.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) => Self::from_file(path)?,
            None => match config_path() {
                Some(default) if default.exists() => Self::from_file(&default)?,
                _ => Self::default(),
            },
        };
        settings.apply_env();
        settings.validate()?;
        Ok(settings)
    }

    /// Parse a settings file without applying overrides
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::FileRead {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
        Self::from_toml(&content)
    }

    /// Parse settings from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::ConfigParse(e.to_string()))
    }

    fn apply_env(&mut self) {
        if let Ok(base_url) = std::env::var(BASE_URL_ENV) {
            if !base_url.is_empty() {
                self.base_url = base_url;
            }
        }
        if let Ok(token) = std::env::var(ACCESS_TOKEN_ENV) {
            if !token.is_empty() {
                self.access_token = Some(token);
            }
        }
    }

    /// Check that the settings describe a reachable server
    pub fn validate(&self) -> Result<()> {
        if self.base_url.trim().is_empty() {
            return Err(Error::Config(format!(
                "No base_url configured. Set it in the config file or via {}",
                BASE_URL_ENV
            )));
        }
        url::Url::parse(&self.base_url).map_err(|e| Error::invalid_url(&self.base_url, e))?;
        Ok(())
    }

    /// Resolve an endpoint relative to `base_url`
    ///
    /// Absolute URLs are returned unchanged.
    pub fn endpoint_url(&self, endpoint: &str) -> Result<String> {
        if let Ok(url) = url::Url::parse(endpoint) {
            return Ok(url.to_string());
        }
        let base = self.base_url.trim_end_matches('/');
        let joined = format!("{}/{}", base, endpoint.trim_start_matches('/'));
        url::Url::parse(&joined)
            .map(|url| url.to_string())
            .map_err(|e| Error::invalid_url(&joined, e))
    }
}

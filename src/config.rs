use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::GatewayError;
use crate::sampler::TrafficMode;
use crate::vendor::Vendor;

pub const DEFAULT_PORT: u16 = 4399;

pub const ENV_FLOW_BASE_URL: &str = "FLOW_BASE_URL";
pub const ENV_SESSION_TOKEN: &str = "FLOW_SESSION_TOKEN";
pub const ENV_REDIS_URL: &str = "FLOW_GATEWAY_REDIS_URL";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {path} failed: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parse config failed: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Base URL of the orchestration platform. Delegated routes, token
    /// exchange, the models catalog and identity lookups all live under it.
    pub flow_base_url: Option<String>,
    pub session_token: Option<String>,
    pub listen_host: String,
    pub port: u16,
    /// How many ports above `port` to try before giving up.
    pub port_scan_span: u16,
    pub traffic: TrafficMode,
    pub exchange_timeout_secs: u64,
    pub forward_timeout_secs: u64,
    pub allow_list_ttl_secs: u64,
    pub endpoints: EndpointPaths,
    pub headers: FlowHeaders,
    pub direct: DirectBaseUrls,
    /// Model renames applied to direct Gemini calls.
    pub gemini_aliases: BTreeMap<String, String>,
    pub store: StoreConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            flow_base_url: None,
            session_token: None,
            listen_host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            port_scan_span: 100,
            traffic: TrafficMode::Balance,
            exchange_timeout_secs: 30,
            forward_timeout_secs: 300,
            allow_list_ttl_secs: 24 * 60 * 60,
            endpoints: EndpointPaths::default(),
            headers: FlowHeaders::default(),
            direct: DirectBaseUrls::default(),
            gemini_aliases: BTreeMap::new(),
            store: StoreConfig::default(),
        }
    }
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("flow_base_url", &self.flow_base_url)
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "<redacted>"),
            )
            .field("listen_host", &self.listen_host)
            .field("port", &self.port)
            .field("port_scan_span", &self.port_scan_span)
            .field("traffic", &self.traffic)
            .field("exchange_timeout_secs", &self.exchange_timeout_secs)
            .field("forward_timeout_secs", &self.forward_timeout_secs)
            .field("allow_list_ttl_secs", &self.allow_list_ttl_secs)
            .field("endpoints", &self.endpoints)
            .field("headers", &self.headers)
            .field("direct", &self.direct)
            .field("gemini_aliases", &self.gemini_aliases)
            .field("store", &self.store)
            .finish()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointPaths {
    pub token_exchange: String,
    pub models_catalog: String,
    /// Must contain `{clientId}`.
    pub identity: String,
}

impl Default for EndpointPaths {
    fn default() -> Self {
        Self {
            token_exchange: "/auth-engine-api/v1/api-key/token".to_string(),
            models_catalog: "/ai-orchestration-api/v1/models".to_string(),
            identity: "/user-api/v1/users/client/{clientId}".to_string(),
        }
    }
}

/// Header and cookie names the orchestration platform reads.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowHeaders {
    pub tenant: String,
    pub agent: String,
    pub token_cookie: String,
}

impl Default for FlowHeaders {
    fn default() -> Self {
        Self {
            tenant: "FlowTenant".to_string(),
            agent: "FlowAgent".to_string(),
            token_cookie: "FlowToken".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectBaseUrls {
    pub amazon_bedrock: Option<String>,
    pub azure_foundry: Option<String>,
    pub azure_openai: Option<String>,
    pub google_gemini: Option<String>,
}

impl Default for DirectBaseUrls {
    fn default() -> Self {
        Self {
            amazon_bedrock: None,
            azure_foundry: None,
            azure_openai: Some("https://api.openai.com".to_string()),
            google_gemini: Some("https://generativelanguage.googleapis.com".to_string()),
        }
    }
}

impl DirectBaseUrls {
    pub fn get(&self, vendor: Vendor) -> Option<&str> {
        let url = match vendor {
            Vendor::AmazonBedrock => self.amazon_bedrock.as_deref(),
            Vendor::AzureFoundry => self.azure_foundry.as_deref(),
            Vendor::AzureOpenai => self.azure_openai.as_deref(),
            Vendor::GoogleGemini => self.google_gemini.as_deref(),
        };
        url.filter(|url| !url.trim().is_empty())
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Persistent state file. Defaults to the user's config directory.
    pub state_path: Option<PathBuf>,
    pub redis_url: Option<String>,
    pub redis_prefix: Option<String>,
}

impl GatewayConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Loads `path` when given, otherwise the default config file if one
    /// exists, then applies environment overrides.
    pub fn resolve(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => match default_config_path().filter(|path| path.exists()) {
                Some(path) => Self::load(path)?,
                None => Self::default(),
            },
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        if let Some(url) = non_empty(ENV_FLOW_BASE_URL) {
            self.flow_base_url = Some(url);
        }
        if let Some(token) = non_empty(ENV_SESSION_TOKEN) {
            self.session_token = Some(token);
        }
        if let Some(url) = non_empty(ENV_REDIS_URL) {
            self.store.redis_url = Some(url);
        }
    }

    pub fn flow_base_url(&self) -> Result<&str, GatewayError> {
        self.flow_base_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| GatewayError::configuration("flow base url is not set"))
    }

    pub fn direct_base_url(&self, vendor: Vendor) -> Result<&str, GatewayError> {
        self.direct.get(vendor).ok_or_else(|| {
            GatewayError::configuration(format!("no direct base url configured for {vendor}"))
        })
    }

    pub fn session_token(&self) -> Option<&str> {
        self.session_token
            .as_deref()
            .filter(|token| !token.trim().is_empty())
    }

    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_secs(self.exchange_timeout_secs.max(1))
    }

    pub fn forward_timeout(&self) -> Duration {
        Duration::from_secs(self.forward_timeout_secs.max(1))
    }

    pub fn allow_list_ttl(&self) -> Duration {
        Duration::from_secs(self.allow_list_ttl_secs)
    }

    pub fn state_path(&self) -> PathBuf {
        self.store
            .state_path
            .clone()
            .or_else(|| default_config_dir().map(|dir| dir.join("state.json")))
            .unwrap_or_else(|| PathBuf::from("flow-gateway-state.json"))
    }
}

fn default_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("flow-gateway"))
}

pub fn default_config_path() -> Option<PathBuf> {
    default_config_dir().map(|dir| dir.join("config.toml"))
}

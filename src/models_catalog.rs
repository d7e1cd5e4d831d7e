//! Which models the orchestration backend serves, per vendor.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::GatewayError;
use crate::store::{self, SharedStore};
use crate::utils::http::{join_base_url, send_checked_json};
use crate::vendor::Vendor;

pub const ALLOW_LIST_KEY: &str = "models:allow-list";

pub type ModelAllowList = BTreeMap<Vendor, Vec<String>>;

#[async_trait]
pub trait ModelCatalog: Send + Sync {
    async fn fetch(&self) -> Result<ModelAllowList, GatewayError>;
}

pub struct HttpModelCatalog {
    client: reqwest::Client,
    url: String,
    session_token: Option<String>,
    timeout: Duration,
}

impl std::fmt::Debug for HttpModelCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpModelCatalog")
            .field("url", &self.url)
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

impl HttpModelCatalog {
    pub fn new(client: reqwest::Client, base_url: &str, path: &str) -> Self {
        Self {
            client,
            url: join_base_url(base_url, path),
            session_token: None,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_session_token(mut self, token: Option<String>) -> Self {
        self.session_token = token.filter(|token| !token.trim().is_empty());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl ModelCatalog for HttpModelCatalog {
    async fn fetch(&self) -> Result<ModelAllowList, GatewayError> {
        let mut req = self.client.get(self.url.as_str()).timeout(self.timeout);
        if let Some(token) = self.session_token.as_deref() {
            req = req.bearer_auth(token);
        }
        let raw = send_checked_json::<BTreeMap<String, Vec<String>>>(req)
            .await
            .map_err(|err| GatewayError::ModelCatalog {
                message: err.to_string(),
            })?;
        Ok(from_wire(raw))
    }
}

/// Vendors this gateway does not mount are dropped rather than rejected.
fn from_wire(raw: BTreeMap<String, Vec<String>>) -> ModelAllowList {
    raw.into_iter()
        .filter_map(|(vendor, models)| vendor.parse::<Vendor>().ok().map(|vendor| (vendor, models)))
        .collect()
}

fn to_wire(list: &ModelAllowList) -> BTreeMap<&'static str, &[String]> {
    list.iter()
        .map(|(vendor, models)| (vendor.as_str(), models.as_slice()))
        .collect()
}

/// Serves the allow-list from the ephemeral store, refreshing it from the
/// catalog once it has expired.
#[derive(Clone)]
pub struct AllowListCache {
    catalog: Arc<dyn ModelCatalog>,
    cache: SharedStore,
    ttl: Duration,
}

impl std::fmt::Debug for AllowListCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllowListCache")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl AllowListCache {
    pub fn new(catalog: Arc<dyn ModelCatalog>, cache: SharedStore, ttl: Duration) -> Self {
        Self { catalog, cache, ttl }
    }

    pub async fn allow_list(&self) -> Result<ModelAllowList, GatewayError> {
        let cached: Option<BTreeMap<String, Vec<String>>> =
            match store::get_json(self.cache.as_ref(), ALLOW_LIST_KEY).await {
                Ok(cached) => cached,
                Err(err) => {
                    tracing::warn!(error = %err, "ignoring unreadable cached allow-list");
                    None
                }
            };
        if let Some(cached) = cached {
            return Ok(from_wire(cached));
        }

        let fresh = self.catalog.fetch().await?;
        tracing::info!(vendors = fresh.len(), "refreshed model allow-list");
        let ttl_ms = self.ttl.as_millis() as u64;
        if ttl_ms > 0 {
            store::set_json(self.cache.as_ref(), ALLOW_LIST_KEY, &to_wire(&fresh), Some(ttl_ms)).await?;
        }
        Ok(fresh)
    }

    pub async fn models_for(&self, vendor: Vendor) -> Result<Vec<String>, GatewayError> {
        Ok(self
            .allow_list()
            .await?
            .remove(&vendor)
            .unwrap_or_default())
    }
}

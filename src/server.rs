//! HTTP surface and composition root.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use axum::Json;
use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::response::Response;
use axum::routing::{any, get};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::GatewayError;
use crate::auth::{AuthExchange, HttpAuthExchange, IssuedToken, TokenCache};
use crate::config::GatewayConfig;
use crate::credential::{
    CredentialStore, DelegatedCredential, HttpIdentityLookup, IdentityLookup, OwnerInfo,
};
use crate::models_catalog::{AllowListCache, HttpModelCatalog, ModelAllowList, ModelCatalog};
use crate::proxy::{Forwarder, ProxyPipeline, ProxyServices, Stores};
use crate::sampler::WeightedSampler;
use crate::store::{FileStore, MemoryStore, SharedStore};
use crate::vendor::{Vendor, adapter_for};

/// Stands in for every flow-platform collaborator when no base url is set,
/// so direct-only setups still start.
#[derive(Debug)]
struct FlowUnconfigured;

impl FlowUnconfigured {
    fn error() -> GatewayError {
        GatewayError::configuration("flow base url is not set")
    }
}

#[async_trait]
impl AuthExchange for FlowUnconfigured {
    async fn exchange(&self, _: &DelegatedCredential) -> Result<IssuedToken, GatewayError> {
        Err(Self::error())
    }
}

#[async_trait]
impl ModelCatalog for FlowUnconfigured {
    async fn fetch(&self) -> Result<ModelAllowList, GatewayError> {
        Err(Self::error())
    }
}

#[async_trait]
impl IdentityLookup for FlowUnconfigured {
    async fn owner(&self, _: &str) -> Result<Option<OwnerInfo>, GatewayError> {
        Err(Self::error())
    }
}

/// Opens the persistent and ephemeral stores the config asks for.
///
/// With a redis url both live in redis under the configured prefix;
/// otherwise persistent state goes to the state file and ephemeral state
/// stays in memory.
pub async fn open_stores(config: &GatewayConfig, state_override: Option<&Path>) -> Result<Stores, GatewayError> {
    if let Some(url) = config.store.redis_url.as_deref() {
        return open_redis(url, config.store.redis_prefix.as_deref());
    }
    let path = state_override
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config.state_path());
    let persistent: SharedStore = Arc::new(FileStore::open(&path).await?);
    tracing::debug!(path = %path.display(), "opened state file");
    Ok(Stores {
        persistent,
        ephemeral: Arc::new(MemoryStore::new()),
    })
}

#[cfg(feature = "store-redis")]
fn open_redis(url: &str, prefix: Option<&str>) -> Result<Stores, GatewayError> {
    let mut store = crate::store::RedisStore::new(url)?;
    if let Some(prefix) = prefix {
        store = store.with_prefix(prefix);
    }
    let shared: SharedStore = Arc::new(store);
    Ok(Stores {
        persistent: shared.clone(),
        ephemeral: shared,
    })
}

#[cfg(not(feature = "store-redis"))]
fn open_redis(_: &str, _: Option<&str>) -> Result<Stores, GatewayError> {
    Err(GatewayError::configuration(
        "redis store requested but this build lacks the store-redis feature",
    ))
}

/// Credential store with identity lookups wired to the flow platform.
pub fn credential_store(config: &GatewayConfig, stores: &Stores, client: &reqwest::Client) -> CredentialStore {
    let identity: Arc<dyn IdentityLookup> = match config.flow_base_url() {
        Ok(base) => Arc::new(
            HttpIdentityLookup::new(client.clone(), base, &config.endpoints.identity)
                .with_session_token(config.session_token().map(str::to_string))
                .with_timeout(config.exchange_timeout()),
        ),
        Err(_) => Arc::new(FlowUnconfigured),
    };
    CredentialStore::new(stores.persistent.clone()).with_identity_lookup(identity)
}

impl ProxyServices {
    pub fn from_parts(config: GatewayConfig, stores: Stores) -> Result<Self, GatewayError> {
        let forwarder = Forwarder::new(config.forward_timeout())?;
        let client = forwarder.client().clone();
        let credentials = credential_store(&config, &stores, &client);

        let (exchange, catalog): (Arc<dyn AuthExchange>, Arc<dyn ModelCatalog>) =
            match config.flow_base_url() {
                Ok(base) => (
                    Arc::new(
                        HttpAuthExchange::new(client.clone(), base, &config.endpoints.token_exchange)
                            .with_tenant_header(config.headers.tenant.clone())
                            .with_timeout(config.exchange_timeout()),
                    ),
                    Arc::new(
                        HttpModelCatalog::new(client, base, &config.endpoints.models_catalog)
                            .with_session_token(config.session_token().map(str::to_string))
                            .with_timeout(config.exchange_timeout()),
                    ),
                ),
                Err(_) => {
                    tracing::warn!("flow base url is not set; only direct credentials can serve requests");
                    (Arc::new(FlowUnconfigured), Arc::new(FlowUnconfigured))
                }
            };

        let tokens = TokenCache::new(credentials.clone(), stores.ephemeral.clone(), exchange);
        let sampler = WeightedSampler::new(stores.persistent.clone(), stores.ephemeral.clone());
        let allow_list = AllowListCache::new(catalog, stores.ephemeral.clone(), config.allow_list_ttl());

        Ok(Self {
            config,
            stores,
            credentials,
            tokens,
            sampler,
            allow_list,
            forwarder,
        })
    }
}

async fn health() -> Json<bool> {
    Json(true)
}

async fn proxy(State(pipeline): State<Arc<ProxyPipeline>>, request: Request<Body>) -> Response {
    pipeline.handle(request).await
}

/// `/health` plus one mount per vendor. Each mount answers every method on
/// its prefix and everything beneath it.
pub fn router(services: Arc<ProxyServices>) -> Router {
    let mut app = Router::new().route("/health", get(health));
    for vendor in Vendor::ALL {
        let adapter = adapter_for(vendor, &services.config.gemini_aliases);
        let pipeline = Arc::new(ProxyPipeline::new(adapter, services.clone()));
        let prefix = vendor.mount_prefix();
        app = app
            .route(prefix, any(proxy).with_state(pipeline.clone()))
            .route(&format!("{prefix}/*rest"), any(proxy).with_state(pipeline));
    }
    app
}

/// Binds the first free port in `[port, port + span]`.
pub async fn bind_first_free(host: &str, port: u16, span: u16) -> Result<TcpListener, GatewayError> {
    let last = port.saturating_add(span);
    for candidate in port..=last {
        match TcpListener::bind((host, candidate)).await {
            Ok(listener) => return Ok(listener),
            Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
                tracing::debug!(port = candidate, "port in use");
            }
            Err(err) => {
                return Err(GatewayError::configuration(format!(
                    "bind {host}:{candidate} failed: {err}"
                )));
            }
        }
    }
    Err(GatewayError::configuration(format!(
        "no free port on {host} between {port} and {last}"
    )))
}

/// Serves until `shutdown` is cancelled.
pub async fn serve(
    services: Arc<ProxyServices>,
    shutdown: CancellationToken,
) -> Result<SocketAddr, GatewayError> {
    let config = &services.config;
    let listener = bind_first_free(&config.listen_host, config.port, config.port_scan_span).await?;
    let addr = listener
        .local_addr()
        .map_err(|err| GatewayError::configuration(format!("listener address: {err}")))?;

    let candidates = services.credentials.list_credentials().await?;
    if candidates.is_empty() {
        tracing::warn!("no credentials stored; requests will fail until one is added");
    }
    tracing::info!(
        %addr,
        traffic = config.traffic.as_str(),
        credentials = candidates.len(),
        "flow-gateway listening"
    );
    for vendor in Vendor::ALL {
        tracing::info!(vendor = %vendor, url = %format!("http://{addr}{}", vendor.mount_prefix()), "mounted");
    }

    axum::serve(listener, router(services.clone()))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|err| GatewayError::configuration(format!("server error: {err}")))?;
    tracing::info!("flow-gateway stopped");
    Ok(addr)
}

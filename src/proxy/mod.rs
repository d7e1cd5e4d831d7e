//! Request pipeline shared by every vendor mount.

use crate::auth::TokenCache;
use crate::config::GatewayConfig;
use crate::credential::CredentialStore;
use crate::models_catalog::AllowListCache;
use crate::sampler::WeightedSampler;
use crate::store::SharedStore;

mod forward;
mod pipeline;

pub use forward::{
    Forwarder, REQUEST_ID_HEADER, generate_request_id, insert_request_id, request_id_from,
    sanitize_inbound_headers,
};
pub use pipeline::{ProxyPipeline, RequestContext};

/// The two stores the gateway keeps state in.
///
/// `persistent` holds credential records and sampler weights. `ephemeral`
/// holds anything with a lifetime: demote markers, bearer tokens and the
/// model allow-list.
#[derive(Clone)]
pub struct Stores {
    pub persistent: SharedStore,
    pub ephemeral: SharedStore,
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores").finish_non_exhaustive()
    }
}

/// Everything a pipeline needs, built once by the composition root.
#[derive(Debug)]
pub struct ProxyServices {
    pub config: GatewayConfig,
    pub stores: Stores,
    pub credentials: CredentialStore,
    pub tokens: TokenCache,
    pub sampler: WeightedSampler,
    pub allow_list: AllowListCache,
    pub forwarder: Forwarder,
}

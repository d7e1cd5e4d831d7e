use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::AuthExchange;
use crate::GatewayError;
use crate::credential::{Credential, CredentialStore, DelegatedCredential};
use crate::store::{self, Clock, SharedStore, SystemClock};

pub const TOKEN_KEY_PREFIX: &str = "auth:token:";

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BearerToken {
    value: String,
    expires_at: u64,
}

/// Resolves the secret a request is authenticated with.
///
/// Direct credentials hand back their api key untouched. Delegated ones go
/// through the exchange once and are then served from the ephemeral store
/// until the issuer's declared lifetime runs out.
#[derive(Clone)]
pub struct TokenCache {
    credentials: CredentialStore,
    cache: SharedStore,
    exchange: Arc<dyn AuthExchange>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCache").finish_non_exhaustive()
    }
}

impl TokenCache {
    pub fn new(
        credentials: CredentialStore,
        cache: SharedStore,
        exchange: Arc<dyn AuthExchange>,
    ) -> Self {
        Self {
            credentials,
            cache,
            exchange,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub async fn get_token(&self, client_id: &str) -> Result<String, GatewayError> {
        let credential = self.credentials.get(client_id).await?;
        self.token_for(&credential).await
    }

    pub async fn token_for(&self, credential: &Credential) -> Result<String, GatewayError> {
        match credential {
            Credential::Direct(direct) => Ok(direct.api_key.clone()),
            Credential::Delegated(delegated) => self.delegated_token(delegated).await,
        }
    }

    async fn delegated_token(&self, credential: &DelegatedCredential) -> Result<String, GatewayError> {
        let key = format!("{TOKEN_KEY_PREFIX}{}", credential.client_id);
        let now = self.clock.now_millis();

        let cached: Option<BearerToken> = match store::get_json(self.cache.as_ref(), &key).await {
            Ok(cached) => cached,
            Err(err) => {
                tracing::warn!(client_id = %credential.client_id, error = %err, "ignoring unreadable cached token");
                None
            }
        };
        if let Some(token) = cached.filter(|token| token.expires_at > now) {
            tracing::debug!(client_id = %credential.client_id, "token cache hit");
            return Ok(token.value);
        }

        let issued = self.exchange.exchange(credential).await?;
        tracing::info!(
            client_id = %credential.client_id,
            expires_in = issued.expires_in,
            "issued delegated token"
        );
        if issued.expires_in > 0 {
            let ttl_ms = issued.expires_in.saturating_mul(1000);
            let token = BearerToken {
                value: issued.access_token.clone(),
                expires_at: now.saturating_add(ttl_ms),
            };
            store::set_json(self.cache.as_ref(), &key, &token, Some(ttl_ms)).await?;
        }
        Ok(issued.access_token)
    }
}

use std::sync::Arc;

use futures_util::future::join_all;
use serde::Serialize;

use super::{Credential, IdentityLookup, OwnerInfo};
use crate::GatewayError;
use crate::store::{self, SharedStore};

pub const CREDENTIAL_KEY_PREFIX: &str = "auth:meta:";

/// A credential joined with whatever the identity service knows about its owner.
#[derive(Clone, Debug, Serialize)]
pub struct ListedCredential {
    pub credential: Credential,
    pub owner: Option<OwnerInfo>,
}

#[derive(Clone)]
pub struct CredentialStore {
    store: SharedStore,
    identity: Option<Arc<dyn IdentityLookup>>,
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("identity", &self.identity.is_some())
            .finish_non_exhaustive()
    }
}

fn record_key(client_id: &str) -> String {
    format!("{CREDENTIAL_KEY_PREFIX}{client_id}")
}

impl CredentialStore {
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            identity: None,
        }
    }

    pub fn with_identity_lookup(mut self, identity: Arc<dyn IdentityLookup>) -> Self {
        self.identity = Some(identity);
        self
    }

    pub async fn get(&self, client_id: &str) -> Result<Credential, GatewayError> {
        let not_found = || GatewayError::NotFound {
            client_id: client_id.to_string(),
        };
        let record: serde_json::Value = store::get_json(self.store.as_ref(), &record_key(client_id))
            .await?
            .ok_or_else(not_found)?;
        Credential::from_record(record).map_err(|err| {
            tracing::warn!(client_id, error = %err, "stored credential does not resolve");
            not_found()
        })
    }

    /// Full overwrite keyed by client id. An existing record keeps its kind.
    pub async fn set(&self, credential: &Credential) -> Result<(), GatewayError> {
        let client_id = credential.client_id();
        if client_id.trim().is_empty() {
            return Err(GatewayError::invalid_request("credential client id is empty"));
        }
        match self.get(client_id).await {
            Ok(existing) if existing.kind() != credential.kind() => {
                return Err(GatewayError::invalid_request(format!(
                    "credential {client_id} is {} and cannot become {}",
                    existing.kind().as_str(),
                    credential.kind().as_str()
                )));
            }
            Ok(_) | Err(GatewayError::NotFound { .. }) => {}
            Err(err) => return Err(err),
        }

        store::set_json(self.store.as_ref(), &record_key(client_id), credential, None).await?;
        tracing::info!(
            client_id,
            kind = credential.kind().as_str(),
            "credential stored"
        );
        Ok(())
    }

    pub async fn remove(&self, client_id: &str) -> Result<(), GatewayError> {
        if self.store.delete(&record_key(client_id)).await? {
            Ok(())
        } else {
            Err(GatewayError::NotFound {
                client_id: client_id.to_string(),
            })
        }
    }

    /// Every resolvable credential, sorted by client id. Records that no
    /// longer resolve are skipped.
    pub async fn list_credentials(&self) -> Result<Vec<Credential>, GatewayError> {
        let keys = self.store.scan(CREDENTIAL_KEY_PREFIX).await?;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(client_id) = key.strip_prefix(CREDENTIAL_KEY_PREFIX) else {
                continue;
            };
            match self.get(client_id).await {
                Ok(credential) => out.push(credential),
                Err(GatewayError::NotFound { .. }) => {
                    tracing::warn!(client_id, "skipping unresolvable credential record");
                }
                Err(err) => return Err(err),
            }
        }
        out.sort_by(|a, b| a.client_id().cmp(b.client_id()));
        Ok(out)
    }

    /// Like [`Self::list_credentials`], with owner details looked up
    /// concurrently. A failed lookup leaves `owner` empty.
    pub async fn list(&self) -> Result<Vec<ListedCredential>, GatewayError> {
        let credentials = self.list_credentials().await?;
        let Some(identity) = self.identity.as_ref() else {
            return Ok(credentials
                .into_iter()
                .map(|credential| ListedCredential {
                    credential,
                    owner: None,
                })
                .collect());
        };

        let lookups = credentials.iter().map(|credential| async move {
            match identity.owner(credential.client_id()).await {
                Ok(owner) => owner,
                Err(err) => {
                    tracing::debug!(
                        client_id = credential.client_id(),
                        error = %err,
                        "owner lookup failed"
                    );
                    None
                }
            }
        });
        let owners = join_all(lookups).await;

        Ok(credentials
            .into_iter()
            .zip(owners)
            .map(|(credential, owner)| ListedCredential { credential, owner })
            .collect())
    }
}

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::GatewayError;
use crate::utils::http::{join_base_url, response_text_truncated};

const MAX_ERROR_BODY_BYTES: usize = 4 * 1024;

/// Display-only owner record for a client id.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OwnerInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[async_trait]
pub trait IdentityLookup: Send + Sync {
    /// `Ok(None)` when the identity service knows nothing about the client.
    async fn owner(&self, client_id: &str) -> Result<Option<OwnerInfo>, GatewayError>;
}

#[derive(Clone)]
pub struct HttpIdentityLookup {
    client: reqwest::Client,
    base_url: String,
    path_template: String,
    session_token: Option<String>,
    timeout: Duration,
}

impl std::fmt::Debug for HttpIdentityLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpIdentityLookup")
            .field("base_url", &self.base_url)
            .field("path_template", &self.path_template)
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "<redacted>"),
            )
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl HttpIdentityLookup {
    /// `path_template` must contain a `{clientId}` placeholder.
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        path_template: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            path_template: path_template.into(),
            session_token: None,
            timeout: Duration::from_secs(10),
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
impl IdentityLookup for HttpIdentityLookup {
    async fn owner(&self, client_id: &str) -> Result<Option<OwnerInfo>, GatewayError> {
        let path = self.path_template.replace("{clientId}", client_id);
        let mut req = self
            .client
            .get(join_base_url(&self.base_url, &path))
            .timeout(self.timeout);
        if let Some(token) = self.session_token.as_deref() {
            req = req.bearer_auth(token);
        }

        let response = req.send().await.map_err(|err| GatewayError::Backend {
            message: format!("identity lookup failed: {err}"),
        })?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response_text_truncated(response, MAX_ERROR_BODY_BYTES).await;
            return Err(GatewayError::Backend {
                message: format!("identity lookup returned {status}: {body}"),
            });
        }
        let owner = response
            .json::<OwnerInfo>()
            .await
            .map_err(|err| GatewayError::Backend {
                message: format!("identity lookup returned invalid json: {err}"),
            })?;
        Ok(Some(owner))
    }
}

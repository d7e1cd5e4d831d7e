use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};

use crate::GatewayError;
use crate::credential::DelegatedCredential;
use crate::utils::http::{HttpCallError, join_base_url, send_checked_json};

#[derive(Clone)]
pub struct IssuedToken {
    pub access_token: String,
    pub expires_in: u64,
}

impl std::fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedToken")
            .field("access_token", &"<redacted>")
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// Trades delegated client credentials for a bearer token.
#[async_trait]
pub trait AuthExchange: Send + Sync {
    async fn exchange(&self, credential: &DelegatedCredential) -> Result<IssuedToken, GatewayError>;
}

#[derive(Clone, Debug)]
pub struct HttpAuthExchange {
    client: reqwest::Client,
    url: String,
    tenant_header: String,
    timeout: Duration,
}

impl HttpAuthExchange {
    pub fn new(client: reqwest::Client, base_url: &str, path: &str) -> Self {
        Self {
            client,
            url: join_base_url(base_url, path),
            tenant_header: "FlowTenant".to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_tenant_header(mut self, name: impl Into<String>) -> Self {
        self.tenant_header = name.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenRequest<'a> {
    app_to_access: &'a str,
    client_id: &'a str,
    client_secret: &'a str,
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default, deserialize_with = "seconds")]
    expires_in: u64,
}

/// The issuer reports `expires_in` either as a number or a numeric string.
fn seconds<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(u64),
        Float(f64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Int(value) => Ok(value),
        Raw::Float(value) if value.is_finite() && value >= 0.0 => Ok(value as u64),
        Raw::Float(value) => Err(serde::de::Error::custom(format!(
            "invalid expires_in: {value}"
        ))),
        Raw::Text(text) => text
            .trim()
            .parse::<u64>()
            .map_err(|_| serde::de::Error::custom(format!("invalid expires_in: {text}"))),
    }
}

#[async_trait]
impl AuthExchange for HttpAuthExchange {
    async fn exchange(&self, credential: &DelegatedCredential) -> Result<IssuedToken, GatewayError> {
        let body = TokenRequest {
            app_to_access: &credential.app_scope,
            client_id: &credential.client_id,
            client_secret: &credential.client_secret,
        };
        let req = self
            .client
            .post(self.url.as_str())
            .header(self.tenant_header.as_str(), credential.tenant.as_str())
            .timeout(self.timeout)
            .json(&body);

        let parsed = send_checked_json::<TokenResponse>(req)
            .await
            .map_err(|err| GatewayError::AuthExchange {
                message: match err {
                    HttpCallError::Timeout(_) => {
                        format!("token exchange timed out after {:?}", self.timeout)
                    }
                    other => format!("token exchange failed: {other}"),
                },
            })?;

        let access_token = parsed
            .access_token
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| GatewayError::AuthExchange {
                message: "token exchange response missing access_token".to_string(),
            })?;
        Ok(IssuedToken {
            access_token,
            expires_in: parsed.expires_in,
        })
    }
}

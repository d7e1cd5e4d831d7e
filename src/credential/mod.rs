//! Upstream credentials the gateway can route through.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::GatewayError;
use crate::config::GatewayConfig;
use crate::vendor::Vendor;

mod identity;
mod store;

pub use identity::{HttpIdentityLookup, IdentityLookup, OwnerInfo};
pub use store::{CredentialStore, ListedCredential};

pub const DEFAULT_AGENT: &str = "simple_agent";
pub const DEFAULT_APP_SCOPE: &str = "llm-api";

/// Written tagged by `kind`; read back through [`Credential::from_record`].
#[derive(Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Credential {
    Direct(DirectCredential),
    Delegated(DelegatedCredential),
}

/// A raw vendor API key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectCredential {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub name: String,
    pub vendor: Vendor,
    pub api_key: String,
}

/// Client credentials exchanged for a short-lived bearer token.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegatedCredential {
    pub client_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_agent")]
    pub agent: String,
    #[serde(default = "default_app_scope", alias = "appToAccess")]
    pub app_scope: String,
    pub client_secret: String,
    pub tenant: String,
}

fn default_agent() -> String {
    DEFAULT_AGENT.to_string()
}

fn default_app_scope() -> String {
    DEFAULT_APP_SCOPE.to_string()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CredentialKind {
    Direct,
    Delegated,
}

impl CredentialKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CredentialKind::Direct => "direct",
            CredentialKind::Delegated => "delegated",
        }
    }

    /// Accepts the current tag names and the ones older records were written with.
    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "direct" | "default" => Some(CredentialKind::Direct),
            "delegated" | "flow" => Some(CredentialKind::Delegated),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("record is not a json object")]
    NotAnObject,
    #[error("unknown credential kind: {0}")]
    UnknownKind(String),
    #[error("record matches no credential shape")]
    UnknownShape,
    #[error("invalid {kind} credential: {source}")]
    Invalid {
        kind: &'static str,
        source: serde_json::Error,
    },
    #[error("credential has an empty client id")]
    EmptyClientId,
}

impl DirectCredential {
    pub fn new(name: impl Into<String>, vendor: Vendor, api_key: impl Into<String>) -> Self {
        let api_key = api_key.into();
        Self {
            client_id: derive_client_id(&api_key),
            name: name.into(),
            vendor,
            api_key,
        }
    }
}

/// Direct credentials are keyed by a name-based UUID of their key.
pub fn derive_client_id(api_key: &str) -> String {
    uuid::Uuid::new_v5(&uuid::Uuid::nil(), api_key.as_bytes()).to_string()
}

impl Credential {
    /// Resolves a stored record by its discriminant. Records written without
    /// one are classified by the fields only one variant carries.
    pub fn from_record(record: Value) -> Result<Self, RecordError> {
        let Value::Object(mut fields) = record else {
            return Err(RecordError::NotAnObject);
        };

        let tag = fields
            .remove("kind")
            .or_else(|| fields.remove("type"))
            .and_then(|tag| tag.as_str().map(str::to_string));
        let kind = match tag {
            Some(tag) => CredentialKind::from_tag(&tag).ok_or(RecordError::UnknownKind(tag))?,
            None if fields.contains_key("apiKey") && fields.contains_key("vendor") => {
                CredentialKind::Direct
            }
            None if fields.contains_key("clientSecret") && fields.contains_key("tenant") => {
                CredentialKind::Delegated
            }
            None => return Err(RecordError::UnknownShape),
        };

        let record = Value::Object(fields);
        let credential = match kind {
            CredentialKind::Direct => {
                let mut direct: DirectCredential =
                    serde_json::from_value(record).map_err(|source| RecordError::Invalid {
                        kind: kind.as_str(),
                        source,
                    })?;
                if direct.client_id.trim().is_empty() {
                    direct.client_id = derive_client_id(&direct.api_key);
                }
                Credential::Direct(direct)
            }
            CredentialKind::Delegated => Credential::Delegated(
                serde_json::from_value(record).map_err(|source| RecordError::Invalid {
                    kind: kind.as_str(),
                    source,
                })?,
            ),
        };

        if credential.client_id().trim().is_empty() {
            return Err(RecordError::EmptyClientId);
        }
        Ok(credential)
    }

    pub fn kind(&self) -> CredentialKind {
        match self {
            Credential::Direct(_) => CredentialKind::Direct,
            Credential::Delegated(_) => CredentialKind::Delegated,
        }
    }

    pub fn client_id(&self) -> &str {
        match self {
            Credential::Direct(direct) => &direct.client_id,
            Credential::Delegated(delegated) => &delegated.client_id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Credential::Direct(direct) => &direct.name,
            Credential::Delegated(delegated) => &delegated.name,
        }
    }

    /// Direct keys only serve their own vendor; delegated credentials serve all of them.
    pub fn applies_to(&self, vendor: Vendor) -> bool {
        match self {
            Credential::Direct(direct) => direct.vendor == vendor,
            Credential::Delegated(_) => true,
        }
    }

    /// Base URL requests made with this credential are sent to.
    pub fn host<'a>(&self, config: &'a GatewayConfig) -> Result<&'a str, GatewayError> {
        match self {
            Credential::Direct(direct) => config.direct_base_url(direct.vendor),
            Credential::Delegated(_) => config.flow_base_url(),
        }
    }

    /// One-line summary for logs with secrets cut to a short prefix.
    pub fn profile(&self) -> String {
        match self {
            Credential::Direct(direct) => format!(
                "<name={}, vendor={}, apiKey={}>",
                direct.name,
                direct.vendor,
                secret_prefix(&direct.api_key)
            ),
            Credential::Delegated(delegated) => format!(
                "<name={}, clientId={}, clientSecret={}, tenant={}, agent={}>",
                delegated.name,
                secret_prefix(&delegated.client_id),
                secret_prefix(&delegated.client_secret),
                delegated.tenant,
                delegated.agent
            ),
        }
    }

    /// Copy with secrets masked, for display.
    pub fn masked(&self) -> Self {
        match self {
            Credential::Direct(direct) => Credential::Direct(DirectCredential {
                api_key: mask_secret(&direct.api_key),
                ..direct.clone()
            }),
            Credential::Delegated(delegated) => Credential::Delegated(DelegatedCredential {
                client_secret: mask_secret(&delegated.client_secret),
                ..delegated.clone()
            }),
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::Direct(direct) => f
                .debug_struct("Direct")
                .field("client_id", &direct.client_id)
                .field("name", &direct.name)
                .field("vendor", &direct.vendor)
                .field("api_key", &"<redacted>")
                .finish(),
            Credential::Delegated(delegated) => f
                .debug_struct("Delegated")
                .field("client_id", &delegated.client_id)
                .field("name", &delegated.name)
                .field("agent", &delegated.agent)
                .field("app_scope", &delegated.app_scope)
                .field("client_secret", &"<redacted>")
                .field("tenant", &delegated.tenant)
                .finish(),
        }
    }
}

fn secret_prefix(secret: &str) -> String {
    let prefix: String = secret.chars().take(8).collect();
    format!("{prefix}...")
}

fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn delegated() -> Credential {
        Credential::Delegated(DelegatedCredential {
            client_id: "0f4e1b2a-client".to_string(),
            name: "team".to_string(),
            agent: DEFAULT_AGENT.to_string(),
            app_scope: DEFAULT_APP_SCOPE.to_string(),
            client_secret: "super-secret-value".to_string(),
            tenant: "acme".to_string(),
        })
    }

    #[test]
    fn serializes_with_kind_tag_and_camel_case() {
        let value = serde_json::to_value(delegated()).unwrap();
        assert_eq!(value["kind"], "delegated");
        assert_eq!(value["clientSecret"], "super-secret-value");
        assert_eq!(value["appScope"], "llm-api");
    }

    #[test]
    fn resolves_by_tag_including_legacy_names() {
        let record = json!({
            "type": "flow",
            "clientId": "c1",
            "name": "n",
            "appToAccess": "llm-api",
            "clientSecret": "s",
            "tenant": "t"
        });
        let credential = Credential::from_record(record).unwrap();
        assert_eq!(credential.kind(), CredentialKind::Delegated);
        let Credential::Delegated(delegated) = credential else {
            panic!("expected delegated");
        };
        assert_eq!(delegated.agent, DEFAULT_AGENT);

        let record = json!({"kind": "default", "vendor": "google-gemini", "apiKey": "k", "clientId": "c2"});
        assert_eq!(
            Credential::from_record(record).unwrap().kind(),
            CredentialKind::Direct
        );
    }

    #[test]
    fn untagged_records_resolve_by_discriminating_fields() {
        let record = json!({"vendor": "azure-openai", "apiKey": "sk-test", "name": "mine"});
        let credential = Credential::from_record(record).unwrap();
        assert_eq!(credential.kind(), CredentialKind::Direct);
        assert_eq!(credential.client_id(), derive_client_id("sk-test"));

        let record = json!({"clientId": "c", "clientSecret": "s", "tenant": "t"});
        assert_eq!(
            Credential::from_record(record).unwrap().kind(),
            CredentialKind::Delegated
        );
    }

    #[test]
    fn malformed_records_fail_to_resolve() {
        assert!(matches!(
            Credential::from_record(json!({"kind": "oauth", "clientId": "x"})),
            Err(RecordError::UnknownKind(_))
        ));
        assert!(matches!(
            Credential::from_record(json!({"clientId": "x"})),
            Err(RecordError::UnknownShape)
        ));
        assert!(matches!(
            Credential::from_record(json!({"kind": "direct", "vendor": "google-gemini"})),
            Err(RecordError::Invalid { .. })
        ));
        assert!(matches!(
            Credential::from_record(json!({"kind": "direct", "vendor": "cohere", "apiKey": "k"})),
            Err(RecordError::Invalid { .. })
        ));
        assert!(matches!(
            Credential::from_record(json!("direct")),
            Err(RecordError::NotAnObject)
        ));
    }

    #[test]
    fn derived_client_id_is_stable() {
        let a = DirectCredential::new("a", Vendor::GoogleGemini, "AIza-key");
        let b = DirectCredential::new("b", Vendor::GoogleGemini, "AIza-key");
        assert_eq!(a.client_id, b.client_id);
        assert_ne!(a.client_id, derive_client_id("other"));
    }

    #[test]
    fn debug_and_profile_hide_secrets() {
        let credential = delegated();
        let debug = format!("{credential:?}");
        assert!(!debug.contains("super-secret-value"));
        assert!(debug.contains("<redacted>"));

        let profile = credential.profile();
        assert!(profile.contains("clientSecret=super-se..."));
        assert!(!profile.contains("super-secret-value"));

        let Credential::Delegated(masked) = credential.masked() else {
            panic!("expected delegated");
        };
        assert_eq!(masked.client_secret, "supe...alue");
    }

    #[test]
    fn applicability_follows_kind() {
        let direct = Credential::Direct(DirectCredential::new("g", Vendor::GoogleGemini, "k"));
        assert!(direct.applies_to(Vendor::GoogleGemini));
        assert!(!direct.applies_to(Vendor::AzureOpenai));
        assert!(delegated().applies_to(Vendor::AmazonBedrock));
    }
}

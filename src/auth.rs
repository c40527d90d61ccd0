use log::{debug, info};
use reqwest::Client;
use serde::Deserialize;
use std::env;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::Config;

const IDENTITY_URL: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const IDENTITY_API_VERSION: &str = "2018-02-01";
// Refresh this long before the token actually expires.
const EXPIRY_SKEW: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("token endpoint returned status {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// How bearer tokens for the control plane are obtained.
#[derive(Debug, Clone)]
pub enum Credential {
    /// Pre-issued token, used verbatim.
    Static(String),
    /// Service principal, client-credentials grant.
    ClientSecret {
        tenant_id: String,
        client_id: String,
        client_secret: String,
    },
    /// Managed identity of the VM through the metadata token endpoint.
    ManagedIdentity { endpoint: String },
}

impl Credential {
    /// Env vars, first match wins:
    /// - AZURE_ACCESS_TOKEN
    /// - AZURE_TENANT_ID + AZURE_CLIENT_ID + AZURE_CLIENT_SECRET
    /// - otherwise managed identity (LIMITOMETER_IDENTITY_URL overrides the endpoint)
    pub fn from_env() -> Self {
        let var = |k: &str| env::var(k).ok().filter(|s| !s.is_empty());
        if let Some(token) = var("AZURE_ACCESS_TOKEN") {
            return Self::Static(token);
        }
        if let (Some(tenant_id), Some(client_id), Some(client_secret)) = (
            var("AZURE_TENANT_ID"),
            var("AZURE_CLIENT_ID"),
            var("AZURE_CLIENT_SECRET"),
        ) {
            return Self::ClientSecret {
                tenant_id,
                client_id,
                client_secret,
            };
        }
        Self::ManagedIdentity {
            endpoint: var("LIMITOMETER_IDENTITY_URL").unwrap_or_else(|| IDENTITY_URL.into()),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Static(_) => "static token",
            Self::ClientSecret { .. } => "client secret",
            Self::ManagedIdentity { .. } => "managed identity",
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    // v1 endpoints and the metadata service send this as a string.
    #[serde(default)]
    expires_in: Option<serde_json::Value>,
}

impl TokenResponse {
    fn lifetime(&self) -> Duration {
        let secs = match &self.expires_in {
            Some(serde_json::Value::Number(n)) => n.as_u64(),
            Some(serde_json::Value::String(s)) => s.parse::<u64>().ok(),
            _ => None,
        };
        Duration::from_secs(secs.unwrap_or(3600))
    }
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

/// Produces bearer tokens for ARM requests, caching them until shortly
/// before they expire.
pub struct Authorizer {
    credential: Credential,
    resource: String,
    authority: String,
    cache: Mutex<Option<CachedToken>>,
}

impl Authorizer {
    pub fn new(credential: Credential, cfg: &Config) -> Self {
        Self::with_authority(credential, cfg, cfg.cloud.active_directory_endpoint())
    }

    /// Like [`Authorizer::new`] with an explicit Active Directory endpoint.
    pub fn with_authority(credential: Credential, cfg: &Config, authority: &str) -> Self {
        info!("Using {} authorizer", credential.kind());
        Self {
            credential,
            resource: cfg.cloud.resource_manager_endpoint().to_string(),
            authority: authority.to_string(),
            cache: Mutex::new(None),
        }
    }

    pub fn from_env(cfg: &Config) -> Self {
        Self::new(Credential::from_env(), cfg)
    }

    pub async fn bearer(&self, client: &Client) -> Result<String, AuthError> {
        if let Credential::Static(token) = &self.credential {
            return Ok(token.clone());
        }
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref() {
            if Instant::now() < cached.refresh_at {
                return Ok(cached.value.clone());
            }
        }
        debug!("Requesting new {} token", self.credential.kind());
        let token = self.request_token(client).await?;
        let refresh_at = Instant::now() + token.lifetime().saturating_sub(EXPIRY_SKEW);
        let value = token.access_token;
        *cache = Some(CachedToken {
            value: value.clone(),
            refresh_at,
        });
        Ok(value)
    }

    async fn request_token(&self, client: &Client) -> Result<TokenResponse, AuthError> {
        let res = match &self.credential {
            Credential::Static(token) => {
                return Ok(TokenResponse {
                    access_token: token.clone(),
                    expires_in: None,
                })
            }
            Credential::ClientSecret {
                tenant_id,
                client_id,
                client_secret,
            } => {
                let url = format!(
                    "{}{}/oauth2/token",
                    self.authority,
                    urlencoding::encode(tenant_id)
                );
                client
                    .post(url)
                    .form(&[
                        ("grant_type", "client_credentials"),
                        ("client_id", client_id.as_str()),
                        ("client_secret", client_secret.as_str()),
                        ("resource", self.resource.as_str()),
                    ])
                    .send()
                    .await?
            }
            Credential::ManagedIdentity { endpoint } => {
                client
                    .get(endpoint)
                    .header("Metadata", "true")
                    .query(&[
                        ("api-version", IDENTITY_API_VERSION),
                        ("resource", self.resource.as_str()),
                    ])
                    .send()
                    .await?
            }
        };
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(AuthError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(res.json::<TokenResponse>().await?)
    }
}

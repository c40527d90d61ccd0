use crate::auth::Authorizer;
use crate::config::{Config, ConfigError};
use crate::error::ControlPlaneError;
use async_trait::async_trait;
use log::{debug, warn};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

pub const COMPUTE_API_VERSION: &str = "2019-07-01";
pub const NETWORK_API_VERSION: &str = "2019-11-01";

/// One completed control-plane call. `value` is only decoded for 200 responses.
#[derive(Debug, Clone)]
pub struct ArmResponse<T> {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub value: Option<T>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachine {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub properties: VirtualMachineProperties,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineProperties {
    #[serde(default)]
    pub network_profile: Option<NetworkProfile>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkProfile {
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterfaceReference>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkInterfaceReference {
    pub id: String,
    #[serde(default)]
    pub properties: Option<NetworkInterfaceReferenceProperties>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkInterfaceReferenceProperties {
    #[serde(default)]
    pub primary: Option<bool>,
}

impl NetworkInterfaceReference {
    fn is_primary(&self) -> bool {
        self.properties
            .as_ref()
            .and_then(|p| p.primary)
            .unwrap_or(false)
    }
}

/// Identity fields shared by every ARM resource; the rest of the payload is ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Resource {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// A page of a list operation; only the resource names are kept.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceList {
    #[serde(default)]
    pub value: Vec<Resource>,
    #[serde(default)]
    pub next_link: Option<String>,
}

/// Full resource id of the VM's primary network interface: the only
/// attachment if there is exactly one, else the one flagged primary.
pub fn primary_interface_id(vm: &VirtualMachine) -> Result<&str, ControlPlaneError> {
    let nics = vm
        .properties
        .network_profile
        .as_ref()
        .map(|p| p.network_interfaces.as_slice())
        .unwrap_or_default();
    if let [only] = nics {
        return Ok(only.id.as_str());
    }
    nics.iter()
        .find(|n| n.is_primary())
        .map(|n| n.id.as_str())
        .ok_or_else(|| {
            ControlPlaneError::Unresolved(format!(
                "no primary network interface on vm {:?}",
                vm.name.as_deref().unwrap_or_default()
            ))
        })
}

/// Deepest child name of a resource id.
pub fn last_segment(id: &str) -> Result<&str, ControlPlaneError> {
    match id.rsplit('/').next() {
        Some(name) if !name.is_empty() => Ok(name),
        _ => Err(ControlPlaneError::Unresolved(format!(
            "resource name missing from id {:?}",
            id
        ))),
    }
}

/// Read operations issued against the control plane.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn get_vm(&self, name: &str) -> Result<ArmResponse<VirtualMachine>, ControlPlaneError>;
    async fn get_nic(&self, name: &str)
        -> Result<ArmResponse<Resource>, ControlPlaneError>;
    async fn list_load_balancers(&self) -> Result<ArmResponse<ResourceList>, ControlPlaneError>;
    async fn list_vms(&self) -> Result<ArmResponse<ResourceList>, ControlPlaneError>;
    async fn list_nics(&self) -> Result<ArmResponse<ResourceList>, ControlPlaneError>;
}

pub fn build_client(cfg: &Config) -> reqwest::Result<Client> {
    let mut default_headers = HeaderMap::new();
    if let Ok(ua) = HeaderValue::from_str(&cfg.user_agent) {
        default_headers.insert(USER_AGENT, ua);
    }
    default_headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    Client::builder()
        .default_headers(default_headers)
        .timeout(Duration::from_secs(cfg.timeout_secs))
        .use_rustls_tls()
        .build()
}

/// [`ControlPlane`] backed by Azure Resource Manager over HTTPS.
pub struct ArmClient {
    http: Client,
    base: Url,
    group_path: String,
    auth: Authorizer,
}

impl ArmClient {
    pub fn new(cfg: &Config, auth: Authorizer) -> Result<Self, ConfigError> {
        let http = build_client(cfg).map_err(ConfigError::Client)?;
        let mut endpoint = cfg.arm_endpoint.clone();
        if !endpoint.ends_with('/') {
            endpoint.push('/');
        }
        let base = Url::parse(&endpoint)
            .map_err(|_| ConfigError::InvalidEndpoint(cfg.arm_endpoint.clone()))?;
        Ok(Self {
            http,
            base,
            group_path: cfg.resource_group_path(),
            auth,
        })
    }

    fn url(&self, resource: &str, api_version: &str) -> Result<Url, ControlPlaneError> {
        let mut url = self
            .base
            .join(&format!("{}/providers/{}", self.group_path, resource))?;
        url.query_pairs_mut().append_pair("api-version", api_version);
        Ok(url)
    }

    async fn get<T: DeserializeOwned>(&self, url: Url) -> Result<ArmResponse<T>, ControlPlaneError> {
        let token = self.auth.bearer(&self.http).await?;
        debug!("GET {}", url);
        let res = self
            .http
            .get(url.clone())
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .send()
            .await?;
        let status = res.status();
        let headers = res.headers().clone();
        let value = if status == StatusCode::OK {
            match res.json::<T>().await {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!("GET {} returned an undecodable body: {}", url.path(), e);
                    None
                }
            }
        } else {
            None
        };
        Ok(ArmResponse {
            status,
            headers,
            value,
        })
    }
}

#[async_trait]
impl ControlPlane for ArmClient {
    async fn get_vm(&self, name: &str) -> Result<ArmResponse<VirtualMachine>, ControlPlaneError> {
        let mut url = self.url(
            &format!(
                "Microsoft.Compute/virtualMachines/{}",
                urlencoding::encode(name)
            ),
            COMPUTE_API_VERSION,
        )?;
        url.query_pairs_mut().append_pair("$expand", "instanceView");
        self.get(url).await
    }

    async fn get_nic(
        &self,
        name: &str,
    ) -> Result<ArmResponse<Resource>, ControlPlaneError> {
        let url = self.url(
            &format!(
                "Microsoft.Network/networkInterfaces/{}",
                urlencoding::encode(name)
            ),
            NETWORK_API_VERSION,
        )?;
        self.get(url).await
    }

    async fn list_load_balancers(&self) -> Result<ArmResponse<ResourceList>, ControlPlaneError> {
        let url = self.url("Microsoft.Network/loadBalancers", NETWORK_API_VERSION)?;
        self.get(url).await
    }

    async fn list_vms(&self) -> Result<ArmResponse<ResourceList>, ControlPlaneError> {
        let url = self.url("Microsoft.Compute/virtualMachines", COMPUTE_API_VERSION)?;
        self.get(url).await
    }

    async fn list_nics(&self) -> Result<ArmResponse<ResourceList>, ControlPlaneError> {
        let url = self.url("Microsoft.Network/networkInterfaces", NETWORK_API_VERSION)?;
        self.get(url).await
    }
}

/// Delay before retry `attempt` (0-based). An explicit `Retry-After` wins.
pub fn compute_backoff(attempt: u32, retry_after: Option<Duration>) -> Duration {
    if let Some(d) = retry_after {
        return d;
    }
    // Exponential backoff with jitter: base 200ms * 2^attempt, max 5s.
    let base = 200u64.saturating_mul(1u64 << attempt.min(5));
    let max = 5_000u64.min(base);
    let jitter = fastrand::u64(0..=max / 2);
    Duration::from_millis(max / 2 + jitter)
}

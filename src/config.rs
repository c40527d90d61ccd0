use log::debug;
use reqwest::Client;
use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const METADATA_URL: &str = "http://169.254.169.254/metadata/instance/compute";
const METADATA_API_VERSION: &str = "2018-10-01";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable {0}")]
    Missing(&'static str),

    #[error("instance metadata query failed: {0}")]
    Metadata(#[from] reqwest::Error),

    #[error("unknown Azure environment {0:?}")]
    UnknownCloud(String),

    #[error("invalid ARM endpoint {0:?}")]
    InvalidEndpoint(String),

    #[error("unknown config source {0:?}, expected metadata or environment")]
    UnknownSource(String),

    #[error("failed to build HTTP client: {0}")]
    Client(reqwest::Error),
}

/// Where the subscription and resource group are read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    Metadata,
    Environment,
}

impl FromStr for ConfigSource {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "metadata" => Ok(Self::Metadata),
            "environment" => Ok(Self::Environment),
            _ => Err(ConfigError::UnknownSource(s.to_string())),
        }
    }
}

/// Sovereign cloud the subscription lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AzureCloud {
    Public,
    China,
    UsGovernment,
    Germany,
}

impl AzureCloud {
    /// Accepts the names used by the instance metadata service and the
    /// Azure SDKs. An empty name means the public cloud.
    pub fn from_name(name: &str) -> Result<Self, ConfigError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "" | "azurepubliccloud" | "azurecloud" => Ok(Self::Public),
            "azurechinacloud" => Ok(Self::China),
            "azureusgovernmentcloud" | "azureusgovernment" => Ok(Self::UsGovernment),
            "azuregermancloud" => Ok(Self::Germany),
            _ => Err(ConfigError::UnknownCloud(name.to_string())),
        }
    }

    pub fn resource_manager_endpoint(self) -> &'static str {
        match self {
            Self::Public => "https://management.azure.com/",
            Self::China => "https://management.chinacloudapi.cn/",
            Self::UsGovernment => "https://management.usgovcloudapi.net/",
            Self::Germany => "https://management.microsoftazure.de/",
        }
    }

    pub fn active_directory_endpoint(self) -> &'static str {
        match self {
            Self::Public => "https://login.microsoftonline.com/",
            Self::China => "https://login.chinacloudapi.cn/",
            Self::UsGovernment => "https://login.microsoftonline.us/",
            Self::Germany => "https://login.microsoftonline.de/",
        }
    }
}

/// Resolved configuration bundle handed to the control-plane client.
#[derive(Debug, Clone)]
pub struct Config {
    pub vm_name: String,
    pub subscription_id: String,
    pub resource_group: String,
    pub location: String,
    pub cloud: AzureCloud,
    pub arm_endpoint: String,
    pub user_agent: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ComputeMetadata {
    #[serde(default)]
    name: String,
    subscription_id: String,
    #[serde(default)]
    location: String,
    resource_group_name: String,
    #[serde(default)]
    az_environment: String,
}

impl Config {
    pub async fn load(source: ConfigSource) -> Result<Self, ConfigError> {
        match source {
            ConfigSource::Metadata => Self::from_metadata().await,
            ConfigSource::Environment => Self::from_env(),
        }
    }

    /// Load configuration from environment.
    ///
    /// Env vars:
    /// - SubscriptionID [required]
    /// - ResourceGroupName [required]
    /// - Name (VM name, used when --node is not given)
    /// - Location
    /// - Environment (Azure cloud name, default AzurePublicCloud)
    pub fn from_env() -> Result<Self, ConfigError> {
        let subscription_id =
            env::var("SubscriptionID").map_err(|_| ConfigError::Missing("SubscriptionID"))?;
        let resource_group =
            env::var("ResourceGroupName").map_err(|_| ConfigError::Missing("ResourceGroupName"))?;
        let cloud = AzureCloud::from_name(&env::var("Environment").unwrap_or_default())?;
        Ok(Self::assemble(
            env::var("Name").unwrap_or_default(),
            subscription_id,
            resource_group,
            env::var("Location").unwrap_or_default(),
            cloud,
        ))
    }

    /// Query the instance metadata service of the VM we are running on.
    ///
    /// `LIMITOMETER_METADATA_URL` replaces the link-local endpoint.
    pub async fn from_metadata() -> Result<Self, ConfigError> {
        let url = env::var("LIMITOMETER_METADATA_URL").unwrap_or_else(|_| METADATA_URL.into());
        // The metadata service must be reached directly, never through a proxy.
        let client = Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(ConfigError::Client)?;
        debug!("Querying instance metadata at {}", url);
        let meta: ComputeMetadata = client
            .get(&url)
            .header("Metadata", "True")
            .query(&[("format", "json"), ("api-version", METADATA_API_VERSION)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let cloud = AzureCloud::from_name(&meta.az_environment)?;
        Ok(Self::assemble(
            meta.name,
            meta.subscription_id,
            meta.resource_group_name,
            meta.location,
            cloud,
        ))
    }

    fn assemble(
        vm_name: String,
        subscription_id: String,
        resource_group: String,
        location: String,
        cloud: AzureCloud,
    ) -> Self {
        let arm_endpoint = env::var("ARM_ENDPOINT")
            .unwrap_or_else(|_| cloud.resource_manager_endpoint().to_string());
        let timeout_secs = env::var("ARM_HTTP_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(30);
        let user_agent = env::var("LIMITOMETER_USER_AGENT")
            .unwrap_or_else(|_| format!("limitometer/{}", env!("CARGO_PKG_VERSION")));
        Self {
            vm_name,
            subscription_id,
            resource_group,
            location,
            cloud,
            arm_endpoint,
            user_agent,
            timeout_secs,
        }
    }

    /// ARM path prefix for resources of the configured resource group.
    pub fn resource_group_path(&self) -> String {
        format!(
            "subscriptions/{}/resourceGroups/{}",
            urlencoding::encode(&self.subscription_id),
            urlencoding::encode(&self.resource_group)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_source_is_case_insensitive() {
        assert_eq!("Metadata".parse::<ConfigSource>().unwrap(), ConfigSource::Metadata);
        assert_eq!(
            "ENVIRONMENT".parse::<ConfigSource>().unwrap(),
            ConfigSource::Environment
        );
        assert!("file".parse::<ConfigSource>().is_err());
    }

    #[test]
    fn cloud_names_map_to_endpoints() {
        assert_eq!(AzureCloud::from_name("").unwrap(), AzureCloud::Public);
        assert_eq!(
            AzureCloud::from_name("AzureChinaCloud").unwrap().resource_manager_endpoint(),
            "https://management.chinacloudapi.cn/"
        );
        assert_eq!(
            AzureCloud::from_name("AzureUSGovernmentCloud").unwrap(),
            AzureCloud::UsGovernment
        );
        assert!(matches!(
            AzureCloud::from_name("Mars"),
            Err(ConfigError::UnknownCloud(_))
        ));
    }

    #[test]
    fn resource_group_path_encodes_segments() {
        let cfg = Config::assemble(
            "vm".into(),
            "sub-1".into(),
            "my group".into(),
            "westeurope".into(),
            AzureCloud::Public,
        );
        assert_eq!(cfg.resource_group_path(), "subscriptions/sub-1/resourceGroups/my%20group");
    }
}

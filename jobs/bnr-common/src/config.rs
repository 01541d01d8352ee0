//! Job configuration: pipeline inputs from the environment, shared settings
//! from the parameter store.

use async_trait::async_trait;
use aws_config::{BehaviorVersion, SdkConfig};
use aws_sdk_ssm::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_sdk_ssm::Client as SsmClient;
use std::fmt::Display;
use std::str::FromStr;

use crate::error::{BnrError, Result};

/// Parameter store names shared by the jobs.
pub mod params {
    pub const DYNAMODB_LOG_GROUP: &str = "dynamodb-bnr-log-grp-name";
    pub const DYNAMODB_METADATA_BUCKET: &str = "dynamodb-metadata-bucket-name";
    pub const DYNAMODB_METADATA_KEY: &str = "dynamodb-metadata-file-key";
    pub const DYNAMODB_RETENTION_CONFIG_KEY: &str = "dynamodb-config-file-key";

    pub const CASSANDRA_LOG_GROUP: &str = "cassandra-bnr-log-grp-name";
    pub const CASSANDRA_METADATA_BUCKET: &str = "cassandra-metadata-bucket-name";
    pub const CASSANDRA_RETENTION_CONFIG_KEY: &str = "cassandra-config-file-key";

    pub const ALERT_SENDER: &str = "bnr-alerts-sender-email";
    pub const ALERT_RECIPIENTS: &str = "bnr-alerts-receiver-email-list";
    pub const TEAMS_WEBHOOKS: &str = "bnr-teams-webhook-urls";

    pub const OPSCENTER_USER: &str = "opscenter-poc-user-id";
    pub const OPSCENTER_PASSWORD: &str = "opscenter-poc-password";
}

pub async fn load_aws_config() -> SdkConfig {
    aws_config::defaults(BehaviorVersion::latest()).load().await
}

pub fn region_name(config: &SdkConfig) -> String {
    config
        .region()
        .map(|region| region.to_string())
        .unwrap_or_else(|| "us-east-1".to_string())
}

#[async_trait]
pub trait ParameterStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<String>;

    /// Fetches a `SecureString`, decrypted.
    async fn get_secret(&self, name: &str) -> Result<String>;

    async fn get_optional(&self, name: &str) -> Result<Option<String>> {
        match self.get(name).await {
            Ok(value) => Ok(Some(value)),
            Err(BnrError::ParameterNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

pub struct SsmParameterStore {
    client: SsmClient,
}

impl SsmParameterStore {
    pub fn new(client: SsmClient) -> Self {
        Self { client }
    }

    async fn fetch(&self, name: &str, with_decryption: bool) -> Result<String> {
        let output = self
            .client
            .get_parameter()
            .name(name)
            .with_decryption(with_decryption)
            .send()
            .await
            .map_err(|e| match e.code() {
                Some("ParameterNotFound") => BnrError::ParameterNotFound(name.to_string()),
                _ => BnrError::Parameter(format!("{name}: {}", DisplayErrorContext(&e))),
            })?;

        output
            .parameter()
            .and_then(|parameter| parameter.value())
            .map(|value| value.trim().to_string())
            .ok_or_else(|| BnrError::ParameterNotFound(name.to_string()))
    }
}

#[async_trait]
impl ParameterStore for SsmParameterStore {
    async fn get(&self, name: &str) -> Result<String> {
        self.fetch(name, false).await
    }

    async fn get_secret(&self, name: &str) -> Result<String> {
        self.fetch(name, true).await
    }
}

/// Reads a non-empty environment variable.
pub fn required_env(name: &str) -> Result<String> {
    optional_env(name)
        .ok_or_else(|| BnrError::Config(format!("environment variable {name} must be set")))
}

pub fn optional_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Parses an environment variable, falling back to `default` when unset.
pub fn parse_env<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match optional_env(name) {
        Some(raw) => raw
            .parse()
            .map_err(|e| BnrError::Config(format!("invalid {name} '{raw}': {e}"))),
        None => Ok(default),
    }
}

/// Splits a comma separated list, dropping blanks.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentLocation {
    pub bucket: String,
    pub key: String,
}

/// Where alerts go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertSettings {
    pub log_group: String,
    pub sender: String,
    pub recipients: Vec<String>,
    pub webhooks: Vec<String>,
}

impl AlertSettings {
    pub async fn load(params: &dyn ParameterStore, log_group_param: &str) -> Result<Self> {
        let log_group = params.get(log_group_param).await?;
        let sender = params.get(params::ALERT_SENDER).await?;
        let recipients = split_list(&params.get(params::ALERT_RECIPIENTS).await?);
        let webhooks = params
            .get_optional(params::TEAMS_WEBHOOKS)
            .await?
            .map(|raw| split_list(&raw))
            .unwrap_or_default();

        Ok(Self {
            log_group,
            sender,
            recipients,
            webhooks,
        })
    }
}

/// Settings shared by every DynamoDB job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamoSettings {
    pub alerts: AlertSettings,
    pub metadata: DocumentLocation,
    pub retention_config: DocumentLocation,
}

impl DynamoSettings {
    pub async fn load(params: &dyn ParameterStore) -> Result<Self> {
        let alerts = AlertSettings::load(params, params::DYNAMODB_LOG_GROUP).await?;
        let bucket = params.get(params::DYNAMODB_METADATA_BUCKET).await?;
        let metadata_key = params.get(params::DYNAMODB_METADATA_KEY).await?;
        let retention_key = params.get(params::DYNAMODB_RETENTION_CONFIG_KEY).await?;

        Ok(Self {
            alerts,
            metadata: DocumentLocation {
                bucket: bucket.clone(),
                key: metadata_key,
            },
            retention_config: DocumentLocation {
                bucket,
                key: retention_key,
            },
        })
    }
}

use bnr_common::config::{params, AlertSettings, DocumentLocation, ParameterStore};
use bnr_common::{BnrError, JsonDocumentStore};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

use crate::client::Credentials;
use crate::ClusterError;

pub const DEFAULT_SETTINGS_KEY: &str = "poc_opscenter_metadata.json";
pub const DEFAULT_PROFILE: &str = "POC";

/// Connection details of one OpsCenter managed cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterProfile {
    pub opscenter_ip: String,
    #[serde(deserialize_with = "port_from_number_or_string")]
    pub opscenter_port: u16,
    pub s3_backup_path: String,
    pub opscenter_cluster_name: String,
}

impl ClusterProfile {
    pub fn address(&self) -> String {
        format!("{}:{}", self.opscenter_ip, self.opscenter_port)
    }
}

fn port_from_number_or_string<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }

    match Port::deserialize(deserializer)? {
        Port::Number(port) => Ok(port),
        Port::Text(raw) => raw.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Cluster profiles by name, as kept in the cluster settings document.
pub type ClusterSettingsDocument = BTreeMap<String, ClusterProfile>;
pub type ClusterSettingsStore = JsonDocumentStore<ClusterSettingsDocument>;

pub async fn load_profile(
    store: &ClusterSettingsStore,
    profile: &str,
) -> Result<ClusterProfile, ClusterError> {
    let mut document = store.read().await?;
    document
        .remove(profile)
        .ok_or_else(|| ClusterError::UnknownProfile(profile.to_string()))
}

/// Settings shared by every cluster job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterJobSettings {
    pub alerts: AlertSettings,
    pub cluster_settings: DocumentLocation,
    pub retention_config: DocumentLocation,
    pub credentials: Credentials,
}

impl ClusterJobSettings {
    pub async fn load(
        params: &dyn ParameterStore,
        settings_key: &str,
    ) -> Result<Self, BnrError> {
        let alerts = AlertSettings::load(params, params::CASSANDRA_LOG_GROUP).await?;
        let bucket = params.get(params::CASSANDRA_METADATA_BUCKET).await?;
        let retention_key = params.get(params::CASSANDRA_RETENTION_CONFIG_KEY).await?;
        let credentials = Credentials {
            username: params.get(params::OPSCENTER_USER).await?,
            password: params.get_secret(params::OPSCENTER_PASSWORD).await?,
        };

        Ok(Self {
            alerts,
            cluster_settings: DocumentLocation {
                bucket: bucket.clone(),
                key: settings_key.to_string(),
            },
            retention_config: DocumentLocation {
                bucket,
                key: retention_key,
            },
            credentials,
        })
    }
}

//! Backup, restore and inventory workflows for Cassandra clusters managed
//! through OpsCenter.

pub mod client;
pub mod settings;

use bnr_common::config::{optional_env, required_env, split_list};
use bnr_common::model::{from_epoch_seconds, name_suffix};
use bnr_common::pipeline::PipelineOutput;
use bnr_common::{BnrError, RetentionConfigStore, RetentionDays, RetentionEntry, StoreError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::client::{ActivityFilter, BackupActivity, BackupRun, OpsCenterApi, Session};

pub const BACKUP_JOB_NAME: &str = "CassandraBackup";
pub const RESTORE_JOB_NAME: &str = "CassandraRestore";
pub const TARGET_CLUSTER_OUTPUT: &str = "TargetClusterName";
pub const KEYSPACES_OUTPUT: &str = "Keyspaces";

/// OpsCenter's own keyspace, never backed up or restored.
pub const OPSCENTER_KEYSPACE: &str = "OpsCenter";

const EVENT_TIME_FORMAT: &str = "%d-%m-%y %H:%M:%S";

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("OpsCenter rejected the request: {0}")]
    Api(String),

    #[error("OpsCenter authentication failed: {0}")]
    Authentication(String),

    #[error("OpsCenter request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected OpsCenter response: {0}")]
    Decode(String),

    #[error("no backup found on S3 for cluster {0}")]
    NoBackupFound(String),

    #[error("cluster profile {0} not found in the cluster settings")]
    UnknownProfile(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Common(#[from] BnrError),
}

/// Keyspaces a backup covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyspaceSelection {
    All,
    Named(Vec<String>),
}

impl KeyspaceSelection {
    /// A missing or blank list, or one containing `all`, selects every keyspace.
    pub fn parse(raw: Option<&str>) -> Self {
        let names = raw.map(split_list).unwrap_or_default();
        if names.is_empty() || names.iter().any(|name| name.eq_ignore_ascii_case("all")) {
            Self::All
        } else {
            Self::Named(names)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterRestoreMode {
    Manual { backup_id: String },
    ManualLatest,
}

impl ClusterRestoreMode {
    pub fn parse(method: &str, backup_id: Option<String>) -> Result<Self, ClusterError> {
        match method {
            "Manual" => backup_id
                .map(|backup_id| Self::Manual { backup_id })
                .ok_or_else(|| ClusterError::InvalidRequest("Manual restore needs BackupId".into())),
            "ManualLatest" => Ok(Self::ManualLatest),
            other => Err(ClusterError::InvalidRequest(format!(
                "unknown restore method '{other}', expected Manual or ManualLatest"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreScope {
    All,
    Keyspaces(Vec<String>),
    Table { keyspace: String, table: String },
}

impl RestoreScope {
    pub fn parse(
        scope: &str,
        keyspaces: Option<&str>,
        table: Option<&str>,
    ) -> Result<Self, ClusterError> {
        match scope {
            "All" => Ok(Self::All),
            "Keyspace" => {
                let names = keyspaces.map(split_list).unwrap_or_default();
                if names.is_empty() {
                    return Err(ClusterError::InvalidRequest(
                        "Keyspace restore needs Keyspaces".into(),
                    ));
                }
                Ok(Self::Keyspaces(names))
            }
            "Table" => match (keyspaces.map(str::trim), table.map(str::trim)) {
                (Some(keyspace), Some(table)) if !keyspace.is_empty() && !table.is_empty() => {
                    Ok(Self::Table {
                        keyspace: keyspace.to_string(),
                        table: table.to_string(),
                    })
                }
                _ => Err(ClusterError::InvalidRequest(
                    "Table restore needs Keyspaces and TableName".into(),
                )),
            },
            other => Err(ClusterError::InvalidRequest(format!(
                "unknown restore scope '{other}', expected All, Keyspace or Table"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterRestoreRequest {
    pub mode: ClusterRestoreMode,
    pub scope: RestoreScope,
}

impl ClusterRestoreRequest {
    pub fn from_env() -> Result<Self, ClusterError> {
        let method = required_env("CassandraClusterRestoreMethod")?;
        let mode = ClusterRestoreMode::parse(&method, optional_env("BackupId"))?;
        let scope = RestoreScope::parse(
            &required_env("RestoreScope")?,
            optional_env("Keyspaces").as_deref(),
            optional_env("TableName").as_deref(),
        )?;
        Ok(Self { mode, scope })
    }
}

pub fn target_cluster_name(cluster: &str, now: DateTime<Utc>) -> String {
    format!("restored{cluster}{}", name_suffix(now))
}

pub fn format_event_time(event_time: f64) -> String {
    from_epoch_seconds(event_time)
        .map(|at| at.format(EVENT_TIME_FORMAT).to_string())
        .unwrap_or_else(|| event_time.to_string())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupSummary {
    pub cluster: String,
    pub keyspaces: Vec<String>,
    pub destination_id: String,
    /// The on-server copy removed after the run.
    pub removed_on_server: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestoreSummary {
    pub cluster: String,
    pub target_cluster: String,
    pub backup_id: String,
    pub destination_id: String,
    pub keyspaces: Vec<String>,
    pub table: Option<String>,
}

pub struct ClusterManagerService {
    api: Arc<dyn OpsCenterApi>,
    bucket: String,
    retention: RetentionConfigStore,
    output: PipelineOutput,
}

impl ClusterManagerService {
    /// `bucket` is the S3 bucket the cluster backs up to.
    pub fn new(
        api: Arc<dyn OpsCenterApi>,
        bucket: impl Into<String>,
        retention: RetentionConfigStore,
        output: PipelineOutput,
    ) -> Self {
        Self {
            api,
            bucket: bucket.into(),
            retention,
            output,
        }
    }

    pub fn cluster(&self) -> &str {
        self.api.cluster()
    }

    /// Every keyspace on the cluster except OpsCenter's own.
    pub async fn user_keyspaces(&self, session: &Session) -> Result<Vec<String>, ClusterError> {
        let mut keyspaces = self.api.list_keyspaces(session).await?;
        keyspaces.retain(|name| name != OPSCENTER_KEYSPACE);
        Ok(keyspaces)
    }

    pub async fn resolve_keyspaces(
        &self,
        session: &Session,
        selection: &KeyspaceSelection,
    ) -> Result<Vec<String>, ClusterError> {
        let keyspaces = match selection {
            KeyspaceSelection::All => self.user_keyspaces(session).await?,
            KeyspaceSelection::Named(names) => names
                .iter()
                .filter(|name| name.as_str() != OPSCENTER_KEYSPACE)
                .cloned()
                .collect(),
        };
        if keyspaces.is_empty() {
            return Err(ClusterError::InvalidRequest(format!(
                "no keyspaces to work on in cluster {}",
                self.cluster()
            )));
        }
        Ok(keyspaces)
    }

    /// Id of the S3 destination for the backup bucket, added when missing.
    pub async fn ensure_destination(
        &self,
        session: &Session,
        acceleration_mode: bool,
    ) -> Result<String, ClusterError> {
        let destinations = self.api.list_destinations(session).await?;
        if let Some((id, _)) = destinations
            .iter()
            .find(|(_, destination)| destination.is_s3_bucket(&self.bucket))
        {
            info!("Existing destination {} found for bucket {}", id, self.bucket);
            return Ok(id.clone());
        }

        info!("No destination for bucket {}, adding one", self.bucket);
        self.api
            .add_destination(session, &self.bucket, acceleration_mode)
            .await
    }

    /// Backs the selected keyspaces up to S3, then removes the on-server copy
    /// OpsCenter keeps of the newest backup.
    #[instrument(skip(self, session))]
    pub async fn run_backup(
        &self,
        session: &Session,
        selection: &KeyspaceSelection,
    ) -> Result<BackupSummary, ClusterError> {
        let keyspaces = self.resolve_keyspaces(session, selection).await?;
        let destination_id = self.ensure_destination(session, false).await?;

        info!(
            "Backup started for keyspaces {} at destination {}",
            keyspaces.join(","),
            destination_id
        );
        let started = std::time::Instant::now();
        self.api
            .run_backup(
                session,
                &BackupRun {
                    keyspaces: keyspaces.clone(),
                    destination_id: Some(destination_id.clone()),
                    compressed: true,
                },
            )
            .await?;
        info!("Backup finished in {:.1}s", started.elapsed().as_secs_f64());

        let activity = self
            .api
            .backup_activity(session, &ActivityFilter::all())
            .await?;
        let newest = newest(activity.iter().filter(|entry| entry.is_backup()));
        let removed_on_server = match newest {
            Some(entry) => {
                self.api
                    .delete_backup(session, &entry.backup_id, None)
                    .await?;
                info!("Deleted the on-server copy of {}", entry.backup_id);
                Some(entry.backup_id.clone())
            }
            None => {
                warn!("No backup activity found, on-server copy left in place");
                None
            }
        };

        Ok(BackupSummary {
            cluster: self.cluster().to_string(),
            keyspaces,
            destination_id,
            removed_on_server,
        })
    }

    /// Live, successful S3 backups, newest first.
    pub async fn s3_backups(&self, session: &Session) -> Result<Vec<BackupActivity>, ClusterError> {
        let mut backups: Vec<BackupActivity> = self
            .api
            .backup_activity(session, &ActivityFilter::live_backups())
            .await?
            .into_iter()
            .filter(BackupActivity::is_live_on_s3)
            .collect();
        backups.sort_by(|a, b| b.event_time.total_cmp(&a.event_time));
        Ok(backups)
    }

    pub async fn latest_s3_backup(&self, session: &Session) -> Result<BackupActivity, ClusterError> {
        self.s3_backups(session)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ClusterError::NoBackupFound(self.cluster().to_string()))
    }

    pub async fn run_restore(
        &self,
        session: &Session,
        request: &ClusterRestoreRequest,
    ) -> Result<RestoreSummary, ClusterError> {
        self.run_restore_at(session, request, Utc::now()).await
    }

    /// Restores a backup of the cluster. The target cluster name is published
    /// before anything else happens.
    #[instrument(skip(self, session, now))]
    pub async fn run_restore_at(
        &self,
        session: &Session,
        request: &ClusterRestoreRequest,
        now: DateTime<Utc>,
    ) -> Result<RestoreSummary, ClusterError> {
        let target_cluster = target_cluster_name(self.cluster(), now);
        self.output.set(TARGET_CLUSTER_OUTPUT, &target_cluster)?;

        let backup_id = match &request.mode {
            ClusterRestoreMode::Manual { backup_id } => backup_id.clone(),
            ClusterRestoreMode::ManualLatest => self.latest_s3_backup(session).await?.backup_id,
        };
        let destination_id = self.ensure_destination(session, true).await?;

        let (keyspaces, table) = match &request.scope {
            RestoreScope::All => {
                let keyspaces = self.resolve_keyspaces(session, &KeyspaceSelection::All).await?;
                self.api
                    .restore_keyspaces(session, &backup_id, &destination_id, &keyspaces)
                    .await?;
                (keyspaces, None)
            }
            RestoreScope::Keyspaces(names) => {
                let known = self.user_keyspaces(session).await?;
                let (keyspaces, unknown): (Vec<String>, Vec<String>) =
                    names.iter().cloned().partition(|name| known.contains(name));
                if !unknown.is_empty() {
                    warn!("Skipping keyspaces not in the cluster: {}", unknown.join(","));
                }
                if keyspaces.is_empty() {
                    return Err(ClusterError::InvalidRequest(format!(
                        "none of {} exist in cluster {}",
                        names.join(","),
                        self.cluster()
                    )));
                }
                self.api
                    .restore_keyspaces(session, &backup_id, &destination_id, &keyspaces)
                    .await?;
                (keyspaces, None)
            }
            RestoreScope::Table { keyspace, table } => {
                self.api
                    .restore_table(session, &backup_id, &destination_id, keyspace, table)
                    .await?;
                (vec![keyspace.clone()], Some(table.clone()))
            }
        };
        info!("Restore of {} started from backup {}", keyspaces.join(","), backup_id);

        Ok(RestoreSummary {
            cluster: self.cluster().to_string(),
            target_cluster,
            backup_id,
            destination_id,
            keyspaces,
            table,
        })
    }

    /// Publishes every keyspace of the cluster as a comma separated output.
    pub async fn export_keyspaces(&self, session: &Session) -> Result<Vec<String>, ClusterError> {
        let keyspaces = self.api.list_keyspaces(session).await?;
        self.output.set(KEYSPACES_OUTPUT, &keyspaces.join(","))?;
        Ok(keyspaces)
    }

    /// Records how long a restored cluster is kept. A later registration for
    /// the same cluster replaces the earlier one.
    pub async fn register_retention(
        &self,
        cluster: &str,
        days: RetentionDays,
        now: DateTime<Utc>,
    ) -> Result<(), ClusterError> {
        self.retention
            .update(|config| config.insert(cluster, RetentionEntry::new(now, days)))
            .await?;
        info!("Retention config written for {} ({} days)", cluster, days);
        Ok(())
    }
}

fn newest<'a>(entries: impl Iterator<Item = &'a BackupActivity>) -> Option<&'a BackupActivity> {
    entries.max_by(|a, b| a.event_time.total_cmp(&b.event_time))
}

use bnr_common::config::{parse_env, required_env};
use bnr_common::model::name_suffix;
use bnr_common::provider::capture_counts;
use bnr_common::{
    BackupRecord, BnrError, MetadataStore, Notifier, Outcome, RetentionDays, TableCounts,
    TableProvider,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

pub const JOB_NAME: &str = "DynamoDBBackup";

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Request {
    pub table_name: String,
    #[serde(default)]
    pub retention_days: RetentionDays,
}

impl Request {
    /// Reads `TableNameForBackup` and `BackupRetentionPeriod`.
    pub fn from_env() -> Result<Self, BnrError> {
        Ok(Self {
            table_name: required_env("TableNameForBackup")?,
            retention_days: parse_env("BackupRetentionPeriod", RetentionDays::FOREVER)?,
        })
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    Completed,
    /// The backup exists but its metadata record could not be written.
    Degraded,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Response {
    pub status: BackupStatus,
    pub table_name: String,
    pub backup_id: String,
    pub timestamp: String,
    pub counts: TableCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata_error: Option<String>,
}

/// A recorded backup and whether the provider still has it.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ListedBackup {
    pub backup_id: String,
    pub created_at: Option<DateTime<Utc>>,
    pub retention_days: RetentionDays,
    pub available: bool,
}

pub fn backup_name(table_name: &str, now: DateTime<Utc>) -> String {
    format!("backup_{}_{}", table_name, name_suffix(now))
}

pub struct BackupManagerService {
    provider: Arc<dyn TableProvider>,
    metadata: MetadataStore,
    notifier: Arc<dyn Notifier>,
}

impl BackupManagerService {
    pub fn new(
        provider: Arc<dyn TableProvider>,
        metadata: MetadataStore,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            provider,
            metadata,
            notifier,
        }
    }

    /// Creates the backup and appends its record to the metadata document.
    /// A failed metadata write does not fail the run: the backup is reported
    /// as [`BackupStatus::Degraded`].
    #[instrument(skip(self))]
    pub async fn run_backup(
        &self,
        table_name: &str,
        retention_days: RetentionDays,
    ) -> Result<Response, BnrError> {
        let now = Utc::now();

        let (record, backup_id) = match self.create_backup(table_name, retention_days, now).await {
            Ok(created) => created,
            Err(e) => {
                let reason = match &e {
                    BnrError::Provider(p) if p.is_not_found() => {
                        format!("No source table found with the specified name: {table_name}")
                    }
                    other => other.to_string(),
                };
                error!("Backup of {} failed: {}", table_name, reason);
                self.notifier
                    .report(
                        "DynamoDB Backup Operation Failed!",
                        &format!("Backup of DynamoDB table {table_name} failed\nReason: {reason}"),
                        Outcome::Failure,
                    )
                    .await;
                return Err(e);
            }
        };

        self.notifier
            .report(
                "DynamoDB Backup Operation Successful",
                &format!("Backup Successfully Created for table {table_name}: {backup_id}"),
                Outcome::Success,
            )
            .await;

        let counts = record.counts();
        let metadata_error = match self.update_backup_metadata(table_name, record).await {
            Ok(()) => {
                self.notifier
                    .report(
                        "DynamoDB Metadata Created Successfully",
                        &format!(
                            "Metadata Created Successfully for table {} at {}",
                            table_name,
                            self.metadata.key()
                        ),
                        Outcome::Success,
                    )
                    .await;
                None
            }
            Err(e) => {
                warn!("Backup {} was created but its metadata was not recorded: {}", backup_id, e);
                self.notifier
                    .report(
                        "DynamoDB Metadata creation failed",
                        &format!(
                            "Metadata creation failed for table {table_name}, backup {backup_id}: {e}"
                        ),
                        Outcome::Failure,
                    )
                    .await;
                Some(e.to_string())
            }
        };

        Ok(Response {
            status: if metadata_error.is_none() {
                BackupStatus::Completed
            } else {
                BackupStatus::Degraded
            },
            table_name: table_name.to_string(),
            backup_id,
            timestamp: now.to_rfc3339(),
            counts,
            metadata_error,
        })
    }

    /// Captures counts and creates the backup. The table is described before
    /// anything else so a missing table fails without touching the metadata.
    pub async fn create_backup(
        &self,
        table_name: &str,
        retention_days: RetentionDays,
        now: DateTime<Utc>,
    ) -> Result<(BackupRecord, String), BnrError> {
        let (description, counts) = capture_counts(self.provider.as_ref(), table_name).await?;

        let backup_id = self
            .provider
            .create_backup(table_name, &backup_name(table_name, now))
            .await?;

        info!(
            "Created backup {} of {} with {} items",
            backup_id, table_name, counts.item_count
        );

        let record = BackupRecord::new(
            backup_id.clone(),
            counts,
            description.kms_key_arn,
            now,
            retention_days,
        );
        Ok((record, backup_id))
    }

    pub async fn update_backup_metadata(
        &self,
        table_name: &str,
        record: BackupRecord,
    ) -> Result<(), BnrError> {
        self.metadata
            .update(|document| document.append(table_name, record.clone()))
            .await?;
        Ok(())
    }

    /// Recorded backups of `table_name`, each checked against the provider.
    pub async fn list_backups(&self, table_name: &str) -> Result<Vec<ListedBackup>, BnrError> {
        let document = self.metadata.read_or_default().await?.document;
        let live: HashSet<String> = self
            .provider
            .list_backups(table_name)
            .await?
            .into_iter()
            .collect();

        Ok(document
            .records(table_name)
            .iter()
            .map(|record| ListedBackup {
                backup_id: record.backup_id.clone(),
                created_at: record.created_at_utc(),
                retention_days: record.retention_days,
                available: !record.is_stale() && live.contains(&record.backup_id),
            })
            .collect())
    }
}

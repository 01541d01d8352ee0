//! The managed table service, seen through the handful of calls the jobs make.

use async_trait::async_trait;
use aws_sdk_dynamodb::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_dynamodb::primitives::DateTime as AwsDateTime;
use aws_sdk_dynamodb::types::Select;
use aws_sdk_dynamodb::Client as DynamoClient;
use chrono::{DateTime, Utc};
use std::fmt;
use tracing::{debug, info, instrument};

use crate::error::ProviderError;
use crate::model::TableCounts;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableStatus {
    Creating,
    Updating,
    Active,
    Other(String),
}

impl TableStatus {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "CREATING" => Self::Creating,
            "UPDATING" => Self::Updating,
            "ACTIVE" => Self::Active,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Creating => "CREATING",
            Self::Updating => "UPDATING",
            Self::Active => "ACTIVE",
            Self::Other(raw) => raw,
        }
    }

    /// Still materializing; worth waiting for.
    pub fn is_provisioning(&self) -> bool {
        matches!(self, Self::Creating | Self::Updating)
    }
}

impl fmt::Display for TableStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescription {
    pub name: String,
    pub arn: Option<String>,
    pub status: TableStatus,
    pub gsi_count: u64,
    pub lsi_count: u64,
    pub kms_key_arn: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PointInTime {
    /// The most recent restorable moment.
    Latest,
    At(DateTime<Utc>),
}

impl fmt::Display for PointInTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latest => write!(f, "latest restorable time"),
            Self::At(at) => write!(f, "{}", at.to_rfc3339()),
        }
    }
}

/// A table created by a restore call. It is usually still `CREATING`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoredTable {
    pub name: String,
    pub arn: Option<String>,
}

#[async_trait]
pub trait TableProvider: Send + Sync {
    async fn describe_table(&self, table: &str) -> Result<TableDescription, ProviderError>;

    /// Full count of the items currently in the table.
    async fn count_items(&self, table: &str) -> Result<u64, ProviderError>;

    /// Returns the backup's handle (its ARN).
    async fn create_backup(&self, table: &str, backup_name: &str) -> Result<String, ProviderError>;

    async fn list_backups(&self, table: &str) -> Result<Vec<String>, ProviderError>;

    async fn delete_backup(&self, backup_id: &str) -> Result<(), ProviderError>;

    async fn restore_from_backup(
        &self,
        target: &str,
        backup_id: &str,
    ) -> Result<RestoredTable, ProviderError>;

    async fn restore_to_point_in_time(
        &self,
        source: &str,
        target: &str,
        point: &PointInTime,
    ) -> Result<RestoredTable, ProviderError>;

    async fn delete_table(&self, table: &str) -> Result<(), ProviderError>;
}

/// Describes the table and counts its items.
pub async fn capture_counts(
    provider: &dyn TableProvider,
    table: &str,
) -> Result<(TableDescription, TableCounts), ProviderError> {
    let description = provider.describe_table(table).await?;
    let item_count = provider.count_items(table).await?;
    let counts = TableCounts {
        item_count,
        gsi_count: description.gsi_count,
        lsi_count: description.lsi_count,
    };
    Ok((description, counts))
}

/// Maps an SDK error onto the provider taxonomy using the service error code.
fn classify<E>(err: SdkError<E>, resource: &str) -> ProviderError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    let resource = resource.to_string();
    match err.code() {
        Some("ResourceNotFoundException" | "TableNotFoundException" | "BackupNotFoundException") => {
            ProviderError::NotFound(resource)
        }
        Some("TableAlreadyExistsException") => ProviderError::AlreadyExists(resource),
        Some("InvalidRestoreTimeException") => ProviderError::InvalidRestoreTime(resource),
        Some("BackupInUseException" | "TableInUseException" | "ResourceInUseException") => {
            ProviderError::InUse(resource)
        }
        _ => ProviderError::Transient(format!("{resource}: {}", DisplayErrorContext(&err))),
    }
}

fn restored_table(
    description: Option<&aws_sdk_dynamodb::types::TableDescription>,
    target: &str,
) -> RestoredTable {
    RestoredTable {
        name: description
            .and_then(|table| table.table_name())
            .unwrap_or(target)
            .to_string(),
        arn: description
            .and_then(|table| table.table_arn())
            .map(str::to_owned),
    }
}

pub struct DynamoTableProvider {
    client: DynamoClient,
}

impl DynamoTableProvider {
    pub fn new(client: DynamoClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TableProvider for DynamoTableProvider {
    #[instrument(skip(self))]
    async fn describe_table(&self, table: &str) -> Result<TableDescription, ProviderError> {
        let output = self
            .client
            .describe_table()
            .table_name(table)
            .send()
            .await
            .map_err(|e| classify(e, table))?;

        let description = output
            .table
            .ok_or_else(|| ProviderError::NotFound(table.to_string()))?;

        Ok(TableDescription {
            name: description.table_name().unwrap_or(table).to_string(),
            arn: description.table_arn().map(str::to_owned),
            status: description
                .table_status()
                .map(|status| TableStatus::parse(status.as_str()))
                .unwrap_or_else(|| TableStatus::Other("UNKNOWN".to_string())),
            gsi_count: description.global_secondary_indexes().len() as u64,
            lsi_count: description.local_secondary_indexes().len() as u64,
            kms_key_arn: description
                .sse_description()
                .and_then(|sse| sse.kms_master_key_arn())
                .map(str::to_owned),
        })
    }

    #[instrument(skip(self))]
    async fn count_items(&self, table: &str) -> Result<u64, ProviderError> {
        let mut total = 0u64;
        let mut start_key = None;
        let mut pages = 0;

        loop {
            let result = self
                .client
                .scan()
                .table_name(table)
                .select(Select::Count)
                .set_exclusive_start_key(start_key.take())
                .send()
                .await
                .map_err(|e| classify(e, table))?;

            pages += 1;
            total += u64::try_from(result.count).unwrap_or(0);

            match result.last_evaluated_key {
                Some(key) if !key.is_empty() => start_key = Some(key),
                _ => break,
            }
        }

        debug!("Counted {} items in {} across {} pages", total, table, pages);
        Ok(total)
    }

    #[instrument(skip(self))]
    async fn create_backup(&self, table: &str, backup_name: &str) -> Result<String, ProviderError> {
        let output = self
            .client
            .create_backup()
            .table_name(table)
            .backup_name(backup_name)
            .send()
            .await
            .map_err(|e| classify(e, table))?;

        let backup_arn = output
            .backup_details()
            .map(|details| details.backup_arn().to_string())
            .ok_or_else(|| {
                ProviderError::Transient(format!("no backup details returned for {table}"))
            })?;

        info!("Created backup {} of table {}", backup_arn, table);
        Ok(backup_arn)
    }

    #[instrument(skip(self))]
    async fn list_backups(&self, table: &str) -> Result<Vec<String>, ProviderError> {
        let mut arns = Vec::new();
        let mut start_arn = None;

        loop {
            let result = self
                .client
                .list_backups()
                .table_name(table)
                .set_exclusive_start_backup_arn(start_arn.take())
                .send()
                .await
                .map_err(|e| classify(e, table))?;

            arns.extend(
                result
                    .backup_summaries()
                    .iter()
                    .filter_map(|summary| summary.backup_arn().map(str::to_owned)),
            );

            match result.last_evaluated_backup_arn {
                Some(arn) => start_arn = Some(arn),
                None => break,
            }
        }

        Ok(arns)
    }

    #[instrument(skip(self))]
    async fn delete_backup(&self, backup_id: &str) -> Result<(), ProviderError> {
        self.client
            .delete_backup()
            .backup_arn(backup_id)
            .send()
            .await
            .map_err(|e| classify(e, backup_id))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn restore_from_backup(
        &self,
        target: &str,
        backup_id: &str,
    ) -> Result<RestoredTable, ProviderError> {
        let output = self
            .client
            .restore_table_from_backup()
            .target_table_name(target)
            .backup_arn(backup_id)
            .send()
            .await
            .map_err(|e| match classify(e, backup_id) {
                ProviderError::AlreadyExists(_) => ProviderError::AlreadyExists(target.to_string()),
                other => other,
            })?;

        Ok(restored_table(output.table_description(), target))
    }

    #[instrument(skip(self))]
    async fn restore_to_point_in_time(
        &self,
        source: &str,
        target: &str,
        point: &PointInTime,
    ) -> Result<RestoredTable, ProviderError> {
        let request = self
            .client
            .restore_table_to_point_in_time()
            .source_table_name(source)
            .target_table_name(target);

        let request = match point {
            PointInTime::Latest => request.use_latest_restorable_time(true),
            PointInTime::At(at) => request.restore_date_time(AwsDateTime::from_secs(at.timestamp())),
        };

        let output = request.send().await.map_err(|e| match classify(e, source) {
            ProviderError::AlreadyExists(_) => ProviderError::AlreadyExists(target.to_string()),
            other => other,
        })?;

        Ok(restored_table(output.table_description(), target))
    }

    #[instrument(skip(self))]
    async fn delete_table(&self, table: &str) -> Result<(), ProviderError> {
        self.client
            .delete_table()
            .table_name(table)
            .send()
            .await
            .map_err(|e| classify(e, table))?;
        Ok(())
    }
}

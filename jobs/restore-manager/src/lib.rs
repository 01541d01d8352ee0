use bnr_common::config::{optional_env, required_env};
use bnr_common::model::name_suffix;
use bnr_common::pipeline::PipelineOutput;
use bnr_common::{
    BackupRecord, BnrError, MetadataStore, Notifier, Outcome, PointInTime, ProviderError,
    RestoredTable, RetentionConfigStore, RetentionDays, RetentionEntry, StoreError, TableProvider,
};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use restore_validator::{report_validation, RestoreValidator, ValidationError, ValidationReport};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

pub const JOB_NAME: &str = "DynamoDBRestore";

/// Input format of `PITRBackupDate`, interpreted as UTC.
pub const PITR_DATE_FORMAT: &str = "%Y-%m-%d::%H:%M";

pub const TARGET_TABLE_OUTPUT: &str = "TargetTableName";

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("Table with the same name already exists: {0}")]
    AlreadyExists(String),

    #[error("No existing metadata found for table {0}")]
    NoBackupFound(String),

    #[error("No backup found for the specified date: {0}")]
    InvalidTime(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid restore request: {0}")]
    InvalidRequest(String),

    #[error("Restore validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Provider(ProviderError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Common(#[from] BnrError),
}

impl From<ProviderError> for RestoreError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::AlreadyExists(name) => Self::AlreadyExists(name),
            ProviderError::InvalidRestoreTime(name) => Self::InvalidTime(name),
            ProviderError::NotFound(name) => Self::NotFound(name),
            other => Self::Provider(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreMode {
    /// From an explicitly chosen backup.
    Manual { backup_arn: String },
    /// From the most recent recorded backup of the source table.
    ManualLatest,
    /// Point-in-time recovery to a given moment.
    PitrDate(DateTime<Utc>),
    /// Point-in-time recovery to the latest restorable moment.
    Pitr,
}

impl RestoreMode {
    pub fn parse(
        method: &str,
        backup_arn: Option<String>,
        pitr_date: Option<String>,
    ) -> Result<Self, RestoreError> {
        match method {
            "Manual" => backup_arn
                .map(|backup_arn| Self::Manual { backup_arn })
                .ok_or_else(|| RestoreError::InvalidRequest("BackupArn is required".to_string())),
            "ManualLatest" => Ok(Self::ManualLatest),
            "Pitrdate" => {
                let raw = pitr_date.ok_or_else(|| {
                    RestoreError::InvalidRequest("PITRBackupDate is required".to_string())
                })?;
                parse_pitr_date(&raw).map(Self::PitrDate)
            }
            "Pitr" => Ok(Self::Pitr),
            other => Err(RestoreError::InvalidRequest(format!(
                "unknown restore method '{other}'"
            ))),
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Manual { backup_arn } => format!("ARN: {backup_arn}"),
            Self::ManualLatest => "latest ARN".to_string(),
            Self::PitrDate(at) => format!("PITR Date: {}", at.format(PITR_DATE_FORMAT)),
            Self::Pitr => "Latest PITR".to_string(),
        }
    }
}

pub fn parse_pitr_date(raw: &str) -> Result<DateTime<Utc>, RestoreError> {
    NaiveDateTime::parse_from_str(raw.trim(), PITR_DATE_FORMAT)
        .map(|naive| Utc.from_utc_datetime(&naive))
        .map_err(|e| RestoreError::InvalidRequest(format!("invalid PITRBackupDate '{raw}': {e}")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestoreTrigger {
    #[default]
    Manual,
    Scheduled,
}

impl FromStr for RestoreTrigger {
    type Err = RestoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "manual" => Ok(Self::Manual),
            "scheduled" => Ok(Self::Scheduled),
            other => Err(RestoreError::InvalidRequest(format!(
                "unknown restore trigger '{other}'"
            ))),
        }
    }
}

impl fmt::Display for RestoreTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Manual => write!(f, "manual"),
            Self::Scheduled => write!(f, "scheduled"),
        }
    }
}

pub fn target_table_name(source: &str, trigger: RestoreTrigger, now: DateTime<Utc>) -> String {
    let prefix = match trigger {
        RestoreTrigger::Manual => "restored",
        RestoreTrigger::Scheduled => "auto_restored",
    };
    format!("{}_{}_{}", prefix, source, name_suffix(now))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreRequest {
    pub source_table: String,
    pub mode: RestoreMode,
    pub trigger: RestoreTrigger,
}

impl RestoreRequest {
    /// A scheduled restore always starts from the latest recorded backup.
    pub fn new(source_table: impl Into<String>, mode: RestoreMode, trigger: RestoreTrigger) -> Self {
        let mode = match trigger {
            RestoreTrigger::Scheduled => RestoreMode::ManualLatest,
            RestoreTrigger::Manual => mode,
        };
        Self {
            source_table: source_table.into(),
            mode,
            trigger,
        }
    }

    /// Reads `TableNameForBackup`, `RestoreTrigger`, `DynamoDBRestoreMethod`,
    /// `BackupArn` and `PITRBackupDate`.
    pub fn from_env() -> Result<Self, RestoreError> {
        let source_table = required_env("TableNameForBackup")?;
        let trigger = optional_env("RestoreTrigger")
            .map(|raw| raw.parse::<RestoreTrigger>())
            .transpose()?
            .unwrap_or_default();
        let mode = match trigger {
            RestoreTrigger::Scheduled => RestoreMode::ManualLatest,
            RestoreTrigger::Manual => RestoreMode::parse(
                &required_env("DynamoDBRestoreMethod")?,
                optional_env("BackupArn"),
                optional_env("PITRBackupDate"),
            )?,
        };
        Ok(Self::new(source_table, mode, trigger))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestoreOutcome {
    pub target_table: String,
    pub table_arn: Option<String>,
    pub source_backup: Option<BackupRecord>,
    pub validation: ValidationReport,
}

pub struct RestoreManagerService {
    provider: Arc<dyn TableProvider>,
    metadata: MetadataStore,
    retention: RetentionConfigStore,
    validator: RestoreValidator,
    output: PipelineOutput,
    notifier: Arc<dyn Notifier>,
}

impl RestoreManagerService {
    pub fn new(
        provider: Arc<dyn TableProvider>,
        metadata: MetadataStore,
        retention: RetentionConfigStore,
        validator: RestoreValidator,
        output: PipelineOutput,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            provider,
            metadata,
            retention,
            validator,
            output,
            notifier,
        }
    }

    /// Restores, validates and reports. Any failure is reported before it is
    /// returned.
    pub async fn run_restore(&self, request: &RestoreRequest) -> Result<RestoreOutcome, RestoreError> {
        self.run_restore_at(request, Utc::now()).await
    }

    #[instrument(skip(self), fields(source = %request.source_table, trigger = %request.trigger))]
    pub async fn run_restore_at(
        &self,
        request: &RestoreRequest,
        now: DateTime<Utc>,
    ) -> Result<RestoreOutcome, RestoreError> {
        let target = target_table_name(&request.source_table, request.trigger, now);

        let (restored, record) = match self.start_restore(request, &target).await {
            Ok(started) => started,
            Err(e) => {
                error!("Restore of {} failed: {}", request.source_table, e);
                self.notifier
                    .report(
                        "Restore Failed!",
                        &format!("Restore of DynamoDB table failed\nReason: {e}"),
                        Outcome::Failure,
                    )
                    .await;
                return Err(e);
            }
        };

        info!("Restore started, target table {}", restored.name);
        self.notifier
            .report(
                "Restore Succeeded!",
                &format!(
                    "New restored DynamoDB table created named {} from {}",
                    restored.name,
                    request.mode.describe()
                ),
                Outcome::Success,
            )
            .await;

        let validation = self.validator.validate(&restored.name, record.as_ref()).await;
        report_validation(self.notifier.as_ref(), &restored.name, &validation).await;

        Ok(RestoreOutcome {
            target_table: restored.name,
            table_arn: restored.arn,
            source_backup: record,
            validation: validation?,
        })
    }

    /// Publishes the target name and issues the restore call. Returns the
    /// backup record to validate against, when there is one.
    pub async fn start_restore(
        &self,
        request: &RestoreRequest,
        target: &str,
    ) -> Result<(RestoredTable, Option<BackupRecord>), RestoreError> {
        self.output.set(TARGET_TABLE_OUTPUT, target)?;
        let source = request.source_table.as_str();

        match &request.mode {
            RestoreMode::Manual { backup_arn } => {
                let restored = self.provider.restore_from_backup(target, backup_arn).await?;
                let record = self.recorded_backup(source, backup_arn).await;
                Ok((restored, record))
            }
            RestoreMode::ManualLatest => {
                let document = self.metadata.read_or_default().await?.document;
                let record = document
                    .latest(source)
                    .cloned()
                    .ok_or_else(|| RestoreError::NoBackupFound(source.to_string()))?;
                info!("Latest backup of {} is {}", source, record.backup_id);

                let restored = self
                    .provider
                    .restore_from_backup(target, &record.backup_id)
                    .await?;
                Ok((restored, Some(record)))
            }
            RestoreMode::PitrDate(at) => {
                let restored = self
                    .provider
                    .restore_to_point_in_time(source, target, &PointInTime::At(*at))
                    .await?;
                Ok((restored, None))
            }
            RestoreMode::Pitr => {
                let restored = self
                    .provider
                    .restore_to_point_in_time(source, target, &PointInTime::Latest)
                    .await?;
                Ok((restored, None))
            }
        }
    }

    /// Looks up the record of an explicitly chosen backup. The restore has
    /// already been issued, so an unreadable document only costs validation.
    async fn recorded_backup(&self, source: &str, backup_arn: &str) -> Option<BackupRecord> {
        match self.metadata.read_or_default().await {
            Ok(versioned) => {
                let record = versioned.document.find(source, backup_arn).cloned();
                if record.is_none() {
                    info!("No metadata recorded for backup {}", backup_arn);
                }
                record
            }
            Err(e) => {
                warn!("Could not read backup metadata: {}", e);
                None
            }
        }
    }

    /// Records a restored table in the retention config so the sweeper tears it
    /// down once `days` have passed. A later registration of the same table
    /// replaces the earlier one.
    pub async fn register_retention(
        &self,
        table_name: &str,
        days: RetentionDays,
        now: DateTime<Utc>,
    ) -> Result<(), RestoreError> {
        let previous = self
            .retention
            .update(|config| config.insert(table_name, RetentionEntry::new(now, days)))
            .await?;
        if previous.is_some() {
            info!("Replaced retention entry of {}", table_name);
        }
        info!("Retention config written for {} ({} days)", table_name, days);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!(
            RestoreMode::parse("Manual", Some("arn:1".into()), None).unwrap(),
            RestoreMode::Manual {
                backup_arn: "arn:1".into()
            }
        );
        assert_eq!(
            RestoreMode::parse("ManualLatest", None, None).unwrap(),
            RestoreMode::ManualLatest
        );
        assert_eq!(RestoreMode::parse("Pitr", None, None).unwrap(), RestoreMode::Pitr);
        assert_eq!(
            RestoreMode::parse("Pitrdate", None, Some("2024-01-06::16:30".into())).unwrap(),
            RestoreMode::PitrDate(at(1_704_558_600))
        );
    }

    #[test]
    fn test_invalid_modes() {
        assert!(matches!(
            RestoreMode::parse("Manual", None, None),
            Err(RestoreError::InvalidRequest(_))
        ));
        assert!(matches!(
            RestoreMode::parse("Pitrdate", None, Some("06/01/2024".into())),
            Err(RestoreError::InvalidRequest(_))
        ));
        assert!(matches!(
            RestoreMode::parse("Snapshot", None, None),
            Err(RestoreError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_target_names() {
        let now = at(1_704_556_800);
        assert_eq!(
            target_table_name("orders", RestoreTrigger::Manual, now),
            "restored_orders_01-06-2024-16-00-00"
        );
        assert_eq!(
            target_table_name("orders", RestoreTrigger::Scheduled, now),
            "auto_restored_orders_01-06-2024-16-00-00"
        );
    }

    #[test]
    fn test_scheduled_restore_uses_latest() {
        let request = RestoreRequest::new("orders", RestoreMode::Pitr, RestoreTrigger::Scheduled);
        assert_eq!(request.mode, RestoreMode::ManualLatest);
        assert_eq!("Scheduled".parse::<RestoreTrigger>().unwrap(), RestoreTrigger::Scheduled);
        assert!("nightly".parse::<RestoreTrigger>().is_err());
    }

    #[test]
    fn test_provider_errors_map_to_restore_errors() {
        assert!(matches!(
            RestoreError::from(ProviderError::AlreadyExists("t".into())),
            RestoreError::AlreadyExists(_)
        ));
        assert!(matches!(
            RestoreError::from(ProviderError::InvalidRestoreTime("t".into())),
            RestoreError::InvalidTime(_)
        ));
        assert!(matches!(
            RestoreError::from(ProviderError::Transient("t".into())),
            RestoreError::Provider(_)
        ));
    }
}

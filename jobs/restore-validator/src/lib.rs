use bnr_common::config::parse_env;
use bnr_common::provider::capture_counts;
use bnr_common::{
    BackupRecord, BnrError, Notifier, Outcome, ProviderError, TableCounts, TableDescription,
    TableProvider, TableStatus,
};
use bon::Builder;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, instrument};

pub const DEFAULT_POLL_SECONDS: u64 = 30;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 120;

/// What a single status poll says about a restored table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TableState {
    Waiting,
    Ready,
    Failed,
}

impl From<&TableStatus> for TableState {
    fn from(status: &TableStatus) -> Self {
        match status {
            TableStatus::Creating | TableStatus::Updating => Self::Waiting,
            TableStatus::Active => Self::Ready,
            TableStatus::Other(_) => Self::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CountField {
    ItemCount,
    GsiCount,
    LsiCount,
}

impl fmt::Display for CountField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ItemCount => write!(f, "Item count"),
            Self::GsiCount => write!(f, "GSI count"),
            Self::LsiCount => write!(f, "LSI count"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FieldMismatch {
    pub field: CountField,
    pub expected: u64,
    pub actual: u64,
}

impl fmt::Display for FieldMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} in backup: {}; {} in restored table: {}",
            self.field, self.expected, self.field, self.actual
        )
    }
}

fn describe_mismatches(mismatches: &[FieldMismatch]) -> String {
    mismatches
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("table {table} not ready after {attempts} attempts, last status {last_status}")]
    Timeout {
        table: String,
        attempts: u32,
        last_status: TableStatus,
    },

    #[error("table {table} creation failed with status {status}")]
    CreationFailed { table: String, status: TableStatus },

    #[error("restored table does not match its backup:\n{}", describe_mismatches(.0))]
    Mismatch(Vec<FieldMismatch>),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Every field whose count differs, in item, GSI, LSI order.
pub fn compare_counts(expected: TableCounts, actual: TableCounts) -> Vec<FieldMismatch> {
    [
        (CountField::ItemCount, expected.item_count, actual.item_count),
        (CountField::GsiCount, expected.gsi_count, actual.gsi_count),
        (CountField::LsiCount, expected.lsi_count, actual.lsi_count),
    ]
    .into_iter()
    .filter(|(_, expected, actual)| expected != actual)
    .map(|(field, expected, actual)| FieldMismatch {
        field,
        expected,
        actual,
    })
    .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Counts match the backup record.
    Verified,
    /// The table is active but there was no record to compare against.
    ReadyUnverified,
}

#[derive(Builder, Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct ValidationReport {
    #[builder(into)]
    pub table_name: String,
    pub verdict: Verdict,
    pub attempts: u32,
    pub expected: Option<TableCounts>,
    pub actual: Option<TableCounts>,
    #[builder(default = Utc::now())]
    pub timestamp: DateTime<Utc>,
}

/// Waits for a restored table to become active, then checks it against the
/// backup it came from.
pub struct RestoreValidator {
    provider: Arc<dyn TableProvider>,
    poll_interval: Duration,
    max_attempts: u32,
}

impl RestoreValidator {
    pub fn new(provider: Arc<dyn TableProvider>) -> Self {
        Self {
            provider,
            poll_interval: Duration::from_secs(DEFAULT_POLL_SECONDS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Reads `ValidationPollSeconds` and `ValidationMaxAttempts`.
    pub fn from_env(provider: Arc<dyn TableProvider>) -> Result<Self, BnrError> {
        Ok(Self::new(provider)
            .with_poll_interval(Duration::from_secs(parse_env(
                "ValidationPollSeconds",
                DEFAULT_POLL_SECONDS,
            )?))
            .with_max_attempts(parse_env("ValidationMaxAttempts", DEFAULT_MAX_ATTEMPTS)?))
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Polls the table status until it is active. Returns the final
    /// description and the number of polls it took.
    #[instrument(skip(self))]
    pub async fn await_ready(
        &self,
        table_name: &str,
    ) -> Result<(TableDescription, u32), ValidationError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let description = self.provider.describe_table(table_name).await?;

            match TableState::from(&description.status) {
                TableState::Ready => return Ok((description, attempt)),
                TableState::Failed => {
                    error!("Table {} creation failed: {}", table_name, description.status);
                    return Err(ValidationError::CreationFailed {
                        table: table_name.to_string(),
                        status: description.status,
                    });
                }
                TableState::Waiting if attempt >= self.max_attempts => {
                    return Err(ValidationError::Timeout {
                        table: table_name.to_string(),
                        attempts: attempt,
                        last_status: description.status,
                    });
                }
                TableState::Waiting => {
                    info!(
                        "Iteration {}, waiting for table to be created. Current status: {}. Waited {}s",
                        attempt,
                        description.status,
                        self.poll_interval.as_secs() * u64::from(attempt)
                    );
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }

    /// Waits for readiness, then compares item, GSI and LSI counts with
    /// `record`. Without a record only readiness is checked.
    #[instrument(skip(self, record))]
    pub async fn validate(
        &self,
        table_name: &str,
        record: Option<&BackupRecord>,
    ) -> Result<ValidationReport, ValidationError> {
        let (_, attempts) = self.await_ready(table_name).await?;

        let Some(record) = record else {
            info!("No backup record for {}, skipping count validation", table_name);
            return Ok(ValidationReport::builder()
                .table_name(table_name)
                .verdict(Verdict::ReadyUnverified)
                .attempts(attempts)
                .build());
        };

        let (_, actual) = capture_counts(self.provider.as_ref(), table_name).await?;
        let expected = record.counts();

        let mismatches = compare_counts(expected, actual);
        if !mismatches.is_empty() {
            for mismatch in &mismatches {
                error!("{}", mismatch);
            }
            return Err(ValidationError::Mismatch(mismatches));
        }

        info!("Restored table {} matches backup {}", table_name, record.backup_id);
        Ok(ValidationReport::builder()
            .table_name(table_name)
            .verdict(Verdict::Verified)
            .attempts(attempts)
            .expected(expected)
            .actual(actual)
            .build())
    }
}

/// Sends the validation result to `notifier`.
pub async fn report_validation(
    notifier: &dyn Notifier,
    table_name: &str,
    result: &Result<ValidationReport, ValidationError>,
) {
    match result {
        Ok(report) if report.verdict == Verdict::Verified => {
            notifier
                .report(
                    "Restore Metadata Validation Succeeded!",
                    &format!("Metadata validation of DynamoDB table {table_name} succeeded"),
                    Outcome::Success,
                )
                .await;
        }
        Ok(_) => {
            notifier
                .report(
                    "Restore Completed Without Validation",
                    &format!(
                        "DynamoDB table {table_name} is active; no backup metadata to validate against"
                    ),
                    Outcome::Success,
                )
                .await;
        }
        Err(e) => {
            notifier
                .report(
                    "Restore Metadata Validation Failed!",
                    &format!("Restore validation of DynamoDB table {table_name} failed\nReason: {e}"),
                    Outcome::Failure,
                )
                .await;
        }
    }
}

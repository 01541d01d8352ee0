use bnr_common::{
    BnrError, MetadataStore, ProviderError, RetentionConfigStore, TableProvider,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

pub const JOB_NAME: &str = "DynamoDBRetention";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepFailure {
    pub resource: String,
    pub reason: String,
}

/// What a sweep did with every resource it looked at.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub deleted: Vec<String>,
    /// Expired, but the provider no longer had it.
    pub already_gone: Vec<String>,
    /// Expired, but the provider refused because it is in use. Retried next sweep.
    pub in_use: Vec<String>,
    pub failed: Vec<SweepFailure>,
    /// Retention of zero days.
    pub exempt: Vec<String>,
    /// Not expired yet.
    pub kept: Vec<String>,
}

impl SweepReport {
    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }

    pub fn summary(&self) -> String {
        let mut lines = vec![format!(
            "deleted {}, already gone {}, in use {}, failed {}, exempt {}, kept {}",
            self.deleted.len(),
            self.already_gone.len(),
            self.in_use.len(),
            self.failed.len(),
            self.exempt.len(),
            self.kept.len()
        )];
        lines.extend(self.deleted.iter().map(|id| format!("Deleted: {id}")));
        lines.extend(
            self.failed
                .iter()
                .map(|failure| format!("Failed: {} ({})", failure.resource, failure.reason)),
        );
        lines.join("\n")
    }

    fn record_deletion(&mut self, resource: &str, result: Result<(), ProviderError>) -> bool {
        match result {
            Ok(()) => {
                info!("{} is expired and has been deleted", resource);
                self.deleted.push(resource.to_string());
                true
            }
            Err(ProviderError::NotFound(_)) => {
                warn!("{} was deleted before it expired", resource);
                self.already_gone.push(resource.to_string());
                true
            }
            Err(ProviderError::InUse(_)) => {
                warn!("{} is in use, leaving it for the next sweep", resource);
                self.in_use.push(resource.to_string());
                false
            }
            Err(e) => {
                error!("Failed to delete {}: {}", resource, e);
                self.failed.push(SweepFailure {
                    resource: resource.to_string(),
                    reason: e.to_string(),
                });
                false
            }
        }
    }
}

/// Results of a combined sweep. Each half runs even when the other failed.
#[derive(Debug)]
pub struct FullSweep {
    pub backups: Result<SweepReport, BnrError>,
    pub tables: Result<SweepReport, BnrError>,
}

impl FullSweep {
    pub fn has_failures(&self) -> bool {
        [&self.backups, &self.tables]
            .iter()
            .any(|half| half.as_ref().map_or(true, SweepReport::has_failures))
    }
}

pub struct RetentionSweeper {
    provider: Arc<dyn TableProvider>,
    metadata: MetadataStore,
    retention: RetentionConfigStore,
}

impl RetentionSweeper {
    pub fn new(
        provider: Arc<dyn TableProvider>,
        metadata: MetadataStore,
        retention: RetentionConfigStore,
    ) -> Self {
        Self {
            provider,
            metadata,
            retention,
        }
    }

    /// Deletes every recorded backup past its retention and marks its record
    /// stale. Records are never removed from the document.
    #[instrument(skip(self))]
    pub async fn sweep_backups(&self, now: DateTime<Utc>) -> Result<SweepReport, BnrError> {
        let document = self.metadata.read_or_default().await?.document;
        let mut report = SweepReport::default();
        let mut gone = Vec::new();

        for (table_name, records) in document.tables() {
            for record in records.iter().filter(|record| !record.is_stale()) {
                let backup_id = record.backup_id.as_str();
                if record.retention_days.is_forever() {
                    report.exempt.push(backup_id.to_string());
                    continue;
                }
                if !record.is_expired(now) {
                    report.kept.push(backup_id.to_string());
                    continue;
                }

                let result = self.provider.delete_backup(backup_id).await;
                if report.record_deletion(backup_id, result) {
                    gone.push((table_name.to_string(), backup_id.to_string()));
                }
            }
        }

        if !gone.is_empty() {
            let marked = self
                .metadata
                .update(|document| {
                    let mut marked = 0;
                    for (table_name, backup_id) in &gone {
                        if document.mark_deleted(table_name, backup_id, now) {
                            marked += 1;
                        }
                    }
                    marked
                })
                .await?;
            info!("Marked {} backup records as deleted", marked);
        }

        Ok(report)
    }

    /// Deletes restored tables past their retention and drops their entries
    /// from the retention config.
    #[instrument(skip(self))]
    pub async fn sweep_restored_tables(&self, now: DateTime<Utc>) -> Result<SweepReport, BnrError> {
        let config = self.retention.read_or_default().await?.document;
        let mut report = SweepReport::default();
        let mut gone = Vec::new();

        for (table_name, entry) in config.iter() {
            if entry.days_to_retain.is_forever() {
                report.exempt.push(table_name.to_string());
                continue;
            }
            if !entry.is_expired(now) {
                report.kept.push(table_name.to_string());
                continue;
            }

            let result = self.provider.delete_table(table_name).await;
            if report.record_deletion(table_name, result) {
                gone.push(table_name.to_string());
            }
        }

        if !gone.is_empty() {
            self.retention
                .update(|config| {
                    for table_name in &gone {
                        config.remove(table_name);
                    }
                })
                .await?;
            info!("Removed {} entries from the retention config", gone.len());
        }

        Ok(report)
    }

    pub async fn sweep_all(&self, now: DateTime<Utc>) -> FullSweep {
        let backups = self.sweep_backups(now).await;
        if let Err(e) = &backups {
            error!("Backup sweep aborted: {}", e);
        }
        let tables = self.sweep_restored_tables(now).await;
        if let Err(e) = &tables {
            error!("Restored table sweep aborted: {}", e);
        }
        FullSweep { backups, tables }
    }

    /// Deletes the table a scheduled restore created.
    #[instrument(skip(self))]
    pub async fn teardown(&self, table_name: &str) -> Result<(), BnrError> {
        self.provider.delete_table(table_name).await?;
        info!("Table {} has been deleted", table_name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_deletion_classification() {
        let mut report = SweepReport::default();
        assert!(report.record_deletion("a", Ok(())));
        assert!(report.record_deletion("b", Err(ProviderError::NotFound("b".into()))));
        assert!(!report.record_deletion("c", Err(ProviderError::InUse("c".into()))));
        assert!(!report.record_deletion("d", Err(ProviderError::Transient("boom".into()))));

        assert_eq!(report.deleted, vec!["a"]);
        assert_eq!(report.already_gone, vec!["b"]);
        assert_eq!(report.in_use, vec!["c"]);
        assert_eq!(report.failed[0].resource, "d");
        assert!(report.has_failures());
    }

    #[test]
    fn test_summary() {
        let report = SweepReport {
            deleted: vec!["arn:1".into()],
            kept: vec!["arn:2".into(), "arn:3".into()],
            ..Default::default()
        };
        let summary = report.summary();
        assert!(summary.starts_with("deleted 1, already gone 0, in use 0, failed 0, exempt 0, kept 2"));
        assert!(summary.contains("Deleted: arn:1"));
        assert!(!report.has_failures());
    }
}

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Recorded in place of a KMS key ARN when the table uses the default key.
pub const NO_KMS_KEY: &str = "No KMS Key";

/// Timestamp format of `creation_date_time` in the retention config document.
pub const RETENTION_TIME_FORMAT: &str = "%d-%m-%y %H:%M:%S";

/// Suffix format used when synthesizing backup and restore target names.
pub const NAME_TIME_FORMAT: &str = "%m-%d-%Y-%H-%M-%S";

pub const SECONDS_PER_DAY: i64 = 86_400;

pub fn name_suffix(now: DateTime<Utc>) -> String {
    now.format(NAME_TIME_FORMAT).to_string()
}

pub fn epoch_seconds(at: DateTime<Utc>) -> f64 {
    at.timestamp() as f64 + f64::from(at.timestamp_subsec_nanos()) / 1e9
}

pub fn from_epoch_seconds(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    let whole = secs.floor();
    let nanos = (((secs - whole) * 1e9).round() as u32).min(999_999_999);
    DateTime::from_timestamp(whole as i64, nanos)
}

/// Retention period in days. Zero means "keep forever".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RetentionDays(u32);

impl RetentionDays {
    pub const FOREVER: Self = Self(0);

    pub fn new(days: u32) -> Self {
        Self(days)
    }

    pub fn days(self) -> u32 {
        self.0
    }

    pub fn is_forever(self) -> bool {
        self.0 == 0
    }

    /// When something created at `created_at` becomes eligible for deletion.
    pub fn expires_at(self, created_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.is_forever() {
            return None;
        }
        created_at.checked_add_signed(Duration::seconds(i64::from(self.0) * SECONDS_PER_DAY))
    }

    /// Strictly past the retention window at `now`; never true for `FOREVER`.
    pub fn is_expired(self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.expires_at(created_at)
            .map(|expires_at| now > expires_at)
            .unwrap_or(false)
    }
}

impl FromStr for RetentionDays {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

impl fmt::Display for RetentionDays {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Older documents carry the retention as a string, straight from the pipeline input.
impl<'de> Deserialize<'de> for RetentionDays {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u32),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(days) => Ok(Self(days)),
            Raw::Text(text) => text.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Item and secondary index counts of a table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableCounts {
    pub item_count: u64,
    pub gsi_count: u64,
    pub lsi_count: u64,
}

fn default_kms_key() -> String {
    NO_KMS_KEY.to_string()
}

/// One backup of one table, as stored in the metadata document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    #[serde(alias = "backup_arn")]
    pub backup_id: String,
    pub item_count: u64,
    pub gsi_count: u64,
    pub lsi_count: u64,
    #[serde(default = "default_kms_key")]
    pub kms_key_arn: String,
    /// Creation time in epoch seconds.
    #[serde(rename = "timestamp")]
    pub created_at: f64,
    #[serde(rename = "backup_retention_days", default)]
    pub retention_days: RetentionDays,
    /// Set once the backup itself has been removed from the provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<f64>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl BackupRecord {
    pub fn new(
        backup_id: impl Into<String>,
        counts: TableCounts,
        kms_key_arn: Option<String>,
        created_at: DateTime<Utc>,
        retention_days: RetentionDays,
    ) -> Self {
        Self {
            backup_id: backup_id.into(),
            item_count: counts.item_count,
            gsi_count: counts.gsi_count,
            lsi_count: counts.lsi_count,
            kms_key_arn: kms_key_arn.unwrap_or_else(default_kms_key),
            created_at: epoch_seconds(created_at),
            retention_days,
            deleted_at: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn counts(&self) -> TableCounts {
        TableCounts {
            item_count: self.item_count,
            gsi_count: self.gsi_count,
            lsi_count: self.lsi_count,
        }
    }

    pub fn created_at_utc(&self) -> Option<DateTime<Utc>> {
        from_epoch_seconds(self.created_at)
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.created_at_utc()
            .and_then(|created_at| self.retention_days.expires_at(created_at))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.created_at_utc()
            .map(|created_at| self.retention_days.is_expired(created_at, now))
            .unwrap_or(false)
    }

    pub fn is_stale(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// All known backups, keyed by source table name. Lists are append-only and
/// kept in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataDocument {
    tables: BTreeMap<String, Vec<BackupRecord>>,
}

impl MetadataDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, table_name: &str, record: BackupRecord) {
        self.tables
            .entry(table_name.to_string())
            .or_default()
            .push(record);
    }

    pub fn records(&self, table_name: &str) -> &[BackupRecord] {
        self.tables
            .get(table_name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn tables(&self) -> impl Iterator<Item = (&str, &[BackupRecord])> {
        self.tables
            .iter()
            .map(|(name, records)| (name.as_str(), records.as_slice()))
    }

    pub fn contains_table(&self, table_name: &str) -> bool {
        self.tables.contains_key(table_name)
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Most recent backup of `table_name` that still exists.
    pub fn latest(&self, table_name: &str) -> Option<&BackupRecord> {
        self.records(table_name)
            .iter()
            .filter(|record| !record.is_stale())
            .max_by(|a, b| a.created_at.total_cmp(&b.created_at))
    }

    pub fn find(&self, table_name: &str, backup_id: &str) -> Option<&BackupRecord> {
        self.records(table_name)
            .iter()
            .find(|record| record.backup_id == backup_id)
    }

    /// Marks every record of `table_name` with `backup_id` as deleted. Returns
    /// whether anything changed.
    pub fn mark_deleted(&mut self, table_name: &str, backup_id: &str, at: DateTime<Utc>) -> bool {
        let Some(records) = self.tables.get_mut(table_name) else {
            return false;
        };
        let mut changed = false;
        for record in records
            .iter_mut()
            .filter(|record| record.backup_id == backup_id && !record.is_stale())
        {
            record.deleted_at = Some(epoch_seconds(at));
            changed = true;
        }
        changed
    }
}

mod retention_time {
    use super::*;
    use serde::Serializer;

    pub fn serialize<S>(at: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&at.format(RETENTION_TIME_FORMAT).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&raw, RETENTION_TIME_FORMAT)
            .map(|naive| Utc.from_utc_datetime(&naive))
            .map_err(serde::de::Error::custom)
    }
}

/// Retention of a restored table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionEntry {
    #[serde(with = "retention_time")]
    pub creation_date_time: DateTime<Utc>,
    pub days_to_retain: RetentionDays,
}

impl RetentionEntry {
    /// Creation time is truncated to whole seconds, the stored precision.
    pub fn new(created_at: DateTime<Utc>, days_to_retain: RetentionDays) -> Self {
        Self {
            creation_date_time: created_at.with_nanosecond(0).unwrap_or(created_at),
            days_to_retain,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.days_to_retain
            .is_expired(self.creation_date_time, now)
    }
}

/// Restored resources awaiting tear-down, keyed by resource name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RetentionConfigDocument {
    resources: BTreeMap<String, RetentionEntry>,
}

impl RetentionConfigDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, resource: &str, entry: RetentionEntry) -> Option<RetentionEntry> {
        self.resources.insert(resource.to_string(), entry)
    }

    pub fn remove(&mut self, resource: &str) -> Option<RetentionEntry> {
        self.resources.remove(resource)
    }

    pub fn get(&self, resource: &str) -> Option<&RetentionEntry> {
        self.resources.get(resource)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &RetentionEntry)> {
        self.resources
            .iter()
            .map(|(name, entry)| (name.as_str(), entry))
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

//! In-memory stand-ins for the object store, the table service and the
//! parameter store. Enabled for downstream crates through the `testing` feature.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::config::ParameterStore;
use crate::error::{BnrError, ProviderError, Result, StoreError};
use crate::model::TableCounts;
use crate::provider::{PointInTime, RestoredTable, TableDescription, TableProvider, TableStatus};
use crate::store::{ObjectStore, StoredObject, WritePrecondition};

#[derive(Default)]
struct Objects {
    entries: HashMap<String, (Vec<u8>, u64)>,
    next_version: u64,
}

impl Objects {
    fn bump(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }
}

/// Object store honouring write preconditions, with versions `"v1"`, `"v2"`, ...
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<Objects>,
    fail_puts: Mutex<Option<StoreError>>,
    puts: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `body` as if another writer had put it.
    pub fn insert_raw(&self, key: &str, body: Vec<u8>) {
        let mut objects = self.objects.lock().unwrap();
        let version = objects.bump();
        objects.entries.insert(key.to_string(), (body, version));
    }

    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .entries
            .get(key)
            .map(|(body, _)| body.clone())
    }

    pub fn json(&self, key: &str) -> Option<serde_json::Value> {
        self.raw(key)
            .and_then(|body| serde_json::from_slice(&body).ok())
    }

    /// Every subsequent put fails with `error`.
    pub fn fail_puts(&self, error: StoreError) {
        *self.fail_puts.lock().unwrap() = Some(error);
    }

    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

fn version_token(version: u64) -> String {
    format!("v{version}")
}

fn copy_error(error: &StoreError) -> StoreError {
    match error {
        StoreError::NotFound(key) => StoreError::NotFound(key.clone()),
        StoreError::ConcurrentModification(key) => StoreError::ConcurrentModification(key.clone()),
        other => StoreError::Backend(other.to_string()),
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.objects.lock().unwrap().entries.contains_key(key))
    }

    async fn get(&self, key: &str) -> Result<StoredObject, StoreError> {
        self.objects
            .lock()
            .unwrap()
            .entries
            .get(key)
            .map(|(body, version)| StoredObject {
                body: body.clone(),
                version: Some(version_token(*version)),
            })
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        precondition: WritePrecondition,
    ) -> Result<(), StoreError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.fail_puts.lock().unwrap().as_ref() {
            return Err(copy_error(error));
        }

        let mut objects = self.objects.lock().unwrap();
        let current = objects.entries.get(key).map(|(_, version)| *version);
        let allowed = match (&precondition, current) {
            (WritePrecondition::None, _) => true,
            (WritePrecondition::MustNotExist, current) => current.is_none(),
            (WritePrecondition::MatchVersion(expected), Some(current)) => {
                *expected == version_token(current)
            }
            (WritePrecondition::MatchVersion(_), None) => false,
        };
        if !allowed {
            return Err(StoreError::ConcurrentModification(key.to_string()));
        }

        let version = objects.bump();
        objects.entries.insert(key.to_string(), (body, version));
        Ok(())
    }
}

/// Provider operations a failure can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeOp {
    DescribeTable,
    CountItems,
    CreateBackup,
    ListBackups,
    DeleteBackup,
    RestoreFromBackup,
    RestoreToPointInTime,
    DeleteTable,
}

#[derive(Debug, Clone)]
struct FakeTable {
    arn: String,
    statuses: VecDeque<TableStatus>,
    counts: TableCounts,
    kms_key_arn: Option<String>,
}

impl FakeTable {
    fn new(name: &str, counts: TableCounts, kms_key_arn: Option<String>) -> Self {
        Self {
            arn: format!("arn:aws:dynamodb:us-east-1:000000000000:table/{name}"),
            statuses: VecDeque::from([TableStatus::Active]),
            counts,
            kms_key_arn,
        }
    }

    /// Walks the status script; the last status sticks.
    fn next_status(&mut self) -> TableStatus {
        if self.statuses.len() > 1 {
            self.statuses.pop_front().unwrap_or(TableStatus::Active)
        } else {
            self.statuses.front().cloned().unwrap_or(TableStatus::Active)
        }
    }
}

#[derive(Debug, Clone)]
struct FakeBackup {
    table: String,
    counts: TableCounts,
    kms_key_arn: Option<String>,
}

#[derive(Default)]
struct ProviderState {
    tables: BTreeMap<String, FakeTable>,
    backups: BTreeMap<String, FakeBackup>,
    failures: HashMap<(FakeOp, String), ProviderError>,
    restore_statuses: Vec<TableStatus>,
    restored_counts: Option<TableCounts>,
    deleted_backups: Vec<String>,
    deleted_tables: Vec<String>,
    calls: Vec<(FakeOp, String)>,
    next_backup: usize,
}

/// Table service kept in memory. Restores copy the counts of the backup (or
/// of the source table for point-in-time restores) into the new table.
#[derive(Default)]
pub struct FakeTableProvider {
    state: Mutex<ProviderState>,
}

impl FakeTableProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_table(&self, name: &str, counts: TableCounts) -> &Self {
        self.add_encrypted_table(name, counts, None)
    }

    pub fn add_encrypted_table(
        &self,
        name: &str,
        counts: TableCounts,
        kms_key_arn: Option<&str>,
    ) -> &Self {
        self.state.lock().unwrap().tables.insert(
            name.to_string(),
            FakeTable::new(name, counts, kms_key_arn.map(str::to_owned)),
        );
        self
    }

    pub fn add_backup(&self, backup_id: &str, table: &str, counts: TableCounts) -> &Self {
        self.state.lock().unwrap().backups.insert(
            backup_id.to_string(),
            FakeBackup {
                table: table.to_string(),
                counts,
                kms_key_arn: None,
            },
        );
        self
    }

    /// Statuses reported by successive describes of `table`.
    pub fn script_statuses(&self, table: &str, statuses: Vec<TableStatus>) -> &Self {
        if let Some(fake) = self.state.lock().unwrap().tables.get_mut(table) {
            fake.statuses = statuses.into();
        }
        self
    }

    /// Status script given to every table a restore creates.
    pub fn set_restore_statuses(&self, statuses: Vec<TableStatus>) -> &Self {
        self.state.lock().unwrap().restore_statuses = statuses;
        self
    }

    /// Counts given to every table a restore creates, instead of the copied ones.
    pub fn set_restored_counts(&self, counts: TableCounts) -> &Self {
        self.state.lock().unwrap().restored_counts = Some(counts);
        self
    }

    pub fn set_counts(&self, table: &str, counts: TableCounts) -> &Self {
        if let Some(fake) = self.state.lock().unwrap().tables.get_mut(table) {
            fake.counts = counts;
        }
        self
    }

    /// `op` on `resource` fails with `error` from now on.
    pub fn fail(&self, op: FakeOp, resource: &str, error: ProviderError) -> &Self {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert((op, resource.to_string()), error);
        self
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.state.lock().unwrap().tables.contains_key(name)
    }

    pub fn has_backup(&self, backup_id: &str) -> bool {
        self.state.lock().unwrap().backups.contains_key(backup_id)
    }

    pub fn table_names(&self) -> Vec<String> {
        self.state.lock().unwrap().tables.keys().cloned().collect()
    }

    pub fn deleted_backups(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted_backups.clone()
    }

    pub fn deleted_tables(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted_tables.clone()
    }

    pub fn calls(&self, op: FakeOp) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(called, _)| *called == op)
            .map(|(_, resource)| resource.clone())
            .collect()
    }

    fn enter(&self, op: FakeOp, resource: &str) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push((op, resource.to_string()));
        match state.failures.get(&(op, resource.to_string())) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn create_restored(
        state: &mut ProviderState,
        target: &str,
        counts: TableCounts,
        kms_key_arn: Option<String>,
    ) -> Result<RestoredTable, ProviderError> {
        if state.tables.contains_key(target) {
            return Err(ProviderError::AlreadyExists(target.to_string()));
        }

        let mut table = FakeTable::new(target, state.restored_counts.unwrap_or(counts), kms_key_arn);
        table.statuses = if state.restore_statuses.is_empty() {
            VecDeque::from([TableStatus::Creating, TableStatus::Active])
        } else {
            state.restore_statuses.clone().into()
        };
        let restored = RestoredTable {
            name: target.to_string(),
            arn: Some(table.arn.clone()),
        };
        state.tables.insert(target.to_string(), table);
        Ok(restored)
    }
}

#[async_trait]
impl TableProvider for FakeTableProvider {
    async fn describe_table(&self, table: &str) -> Result<TableDescription, ProviderError> {
        self.enter(FakeOp::DescribeTable, table)?;
        let mut state = self.state.lock().unwrap();
        let fake = state
            .tables
            .get_mut(table)
            .ok_or_else(|| ProviderError::NotFound(table.to_string()))?;

        Ok(TableDescription {
            name: table.to_string(),
            arn: Some(fake.arn.clone()),
            status: fake.next_status(),
            gsi_count: fake.counts.gsi_count,
            lsi_count: fake.counts.lsi_count,
            kms_key_arn: fake.kms_key_arn.clone(),
        })
    }

    async fn count_items(&self, table: &str) -> Result<u64, ProviderError> {
        self.enter(FakeOp::CountItems, table)?;
        self.state
            .lock()
            .unwrap()
            .tables
            .get(table)
            .map(|fake| fake.counts.item_count)
            .ok_or_else(|| ProviderError::NotFound(table.to_string()))
    }

    async fn create_backup(&self, table: &str, backup_name: &str) -> Result<String, ProviderError> {
        self.enter(FakeOp::CreateBackup, table)?;
        let mut state = self.state.lock().unwrap();
        let fake = state
            .tables
            .get(table)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(table.to_string()))?;

        state.next_backup += 1;
        let backup_id = format!("{}/backup/{:04}-{}", fake.arn, state.next_backup, backup_name);
        state.backups.insert(
            backup_id.clone(),
            FakeBackup {
                table: table.to_string(),
                counts: fake.counts,
                kms_key_arn: fake.kms_key_arn,
            },
        );
        Ok(backup_id)
    }

    async fn list_backups(&self, table: &str) -> Result<Vec<String>, ProviderError> {
        self.enter(FakeOp::ListBackups, table)?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .backups
            .iter()
            .filter(|(_, backup)| backup.table == table)
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn delete_backup(&self, backup_id: &str) -> Result<(), ProviderError> {
        self.enter(FakeOp::DeleteBackup, backup_id)?;
        let mut state = self.state.lock().unwrap();
        state
            .backups
            .remove(backup_id)
            .ok_or_else(|| ProviderError::NotFound(backup_id.to_string()))?;
        state.deleted_backups.push(backup_id.to_string());
        Ok(())
    }

    async fn restore_from_backup(
        &self,
        target: &str,
        backup_id: &str,
    ) -> Result<RestoredTable, ProviderError> {
        self.enter(FakeOp::RestoreFromBackup, backup_id)?;
        let mut state = self.state.lock().unwrap();
        let backup = state
            .backups
            .get(backup_id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(backup_id.to_string()))?;
        Self::create_restored(&mut state, target, backup.counts, backup.kms_key_arn)
    }

    async fn restore_to_point_in_time(
        &self,
        source: &str,
        target: &str,
        _point: &PointInTime,
    ) -> Result<RestoredTable, ProviderError> {
        self.enter(FakeOp::RestoreToPointInTime, source)?;
        let mut state = self.state.lock().unwrap();
        let table = state
            .tables
            .get(source)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(source.to_string()))?;
        Self::create_restored(&mut state, target, table.counts, table.kms_key_arn)
    }

    async fn delete_table(&self, table: &str) -> Result<(), ProviderError> {
        self.enter(FakeOp::DeleteTable, table)?;
        let mut state = self.state.lock().unwrap();
        state
            .tables
            .remove(table)
            .ok_or_else(|| ProviderError::NotFound(table.to_string()))?;
        state.deleted_tables.push(table.to_string());
        Ok(())
    }
}

/// Parameter store backed by a fixed map.
#[derive(Debug, Default, Clone)]
pub struct StaticParameterStore {
    values: HashMap<String, String>,
}

impl StaticParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.values.insert(name.to_string(), value.to_string());
        self
    }
}

#[async_trait]
impl ParameterStore for StaticParameterStore {
    async fn get(&self, name: &str) -> Result<String> {
        self.values
            .get(name)
            .cloned()
            .ok_or_else(|| BnrError::ParameterNotFound(name.to_string()))
    }

    async fn get_secret(&self, name: &str) -> Result<String> {
        self.get(name).await
    }
}

use async_trait::async_trait;
use bnr_common::pipeline::PipelineOutput;
use bnr_common::testing::MemoryObjectStore;
use bnr_common::{RetentionConfigDocument, RetentionConfigStore, RetentionDays};
use chrono::{DateTime, Utc};
use cluster_manager::client::{
    ActivityFilter, BackupActivity, BackupRun, Destination, OpsCenterApi, Session,
};
use cluster_manager::{
    ClusterError, ClusterManagerService, ClusterRestoreMode, ClusterRestoreRequest,
    KeyspaceSelection, RestoreScope,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio_test::{assert_err, assert_ok};

const BUCKET: &str = "cassandra-backups";
const RETENTION_KEY: &str = "cassandra/retention.json";

#[derive(Debug, Clone, PartialEq)]
enum Call {
    AddDestination { bucket: String, acceleration: bool },
    RunBackup(BackupRun),
    DeleteBackup { backup_id: String, destination: Option<String> },
    RestoreKeyspaces { backup_id: String, destination: String, keyspaces: Vec<String> },
    RestoreTable { backup_id: String, keyspace: String, table: String },
}

#[derive(Default)]
struct State {
    destinations: BTreeMap<String, Destination>,
    keyspaces: Vec<String>,
    activity: Vec<BackupActivity>,
    calls: Vec<Call>,
    sessions_seen: Vec<String>,
    restore_error: Option<String>,
}

/// In-memory OpsCenter for one cluster.
struct FakeOpsCenter {
    state: Mutex<State>,
}

impl FakeOpsCenter {
    fn new(keyspaces: &[&str]) -> Self {
        Self {
            state: Mutex::new(State {
                keyspaces: keyspaces.iter().map(|name| name.to_string()).collect(),
                ..State::default()
            }),
        }
    }

    fn add_destination_entry(&self, id: &str, provider: &str, path: &str) {
        self.state.lock().unwrap().destinations.insert(
            id.to_string(),
            Destination {
                provider: provider.to_string(),
                path: path.to_string(),
                server_side_encryption: Some(true),
                acceleration_mode: None,
            },
        );
    }

    fn add_activity(&self, backup_id: &str, event_time: f64, provider: &str, deleted: bool) {
        self.state.lock().unwrap().activity.push(BackupActivity {
            backup_id: backup_id.to_string(),
            event_time,
            kind: "backup".to_string(),
            deleted_at: deleted.then(|| json!(event_time + 1.0)),
            destination: json!({ "provider": provider }),
        });
    }

    fn fail_restores(&self, message: &str) {
        self.state.lock().unwrap().restore_error = Some(message.to_string());
    }

    fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    fn sessions_seen(&self) -> Vec<String> {
        self.state.lock().unwrap().sessions_seen.clone()
    }

    fn record(&self, session: &Session, call: Option<Call>) {
        let mut state = self.state.lock().unwrap();
        state.sessions_seen.push(session.id().to_string());
        state.calls.extend(call);
    }
}

#[async_trait]
impl OpsCenterApi for FakeOpsCenter {
    fn cluster(&self) -> &str {
        "poc"
    }

    async fn list_destinations(
        &self,
        session: &Session,
    ) -> Result<BTreeMap<String, Destination>, ClusterError> {
        self.record(session, None);
        Ok(self.state.lock().unwrap().destinations.clone())
    }

    async fn add_destination(
        &self,
        session: &Session,
        bucket: &str,
        acceleration_mode: bool,
    ) -> Result<String, ClusterError> {
        self.record(
            session,
            Some(Call::AddDestination {
                bucket: bucket.to_string(),
                acceleration: acceleration_mode,
            }),
        );
        let id = "dest-new".to_string();
        self.add_destination_entry(&id, "s3", bucket);
        Ok(id)
    }

    async fn list_keyspaces(&self, session: &Session) -> Result<Vec<String>, ClusterError> {
        self.record(session, None);
        Ok(self.state.lock().unwrap().keyspaces.clone())
    }

    async fn run_backup(&self, session: &Session, run: &BackupRun) -> Result<(), ClusterError> {
        self.record(session, Some(Call::RunBackup(run.clone())));
        let event_time = 5_000.0 + self.state.lock().unwrap().activity.len() as f64;
        self.add_activity("opscenter_run", event_time, "s3", false);
        Ok(())
    }

    async fn backup_activity(
        &self,
        session: &Session,
        filter: &ActivityFilter,
    ) -> Result<Vec<BackupActivity>, ClusterError> {
        self.record(session, None);
        let activity = self.state.lock().unwrap().activity.clone();
        Ok(activity
            .into_iter()
            .filter(|entry| !filter.live_only || !entry.is_deleted())
            .collect())
    }

    async fn restore_keyspaces(
        &self,
        session: &Session,
        backup_id: &str,
        destination_id: &str,
        keyspaces: &[String],
    ) -> Result<Value, ClusterError> {
        self.record(
            session,
            Some(Call::RestoreKeyspaces {
                backup_id: backup_id.to_string(),
                destination: destination_id.to_string(),
                keyspaces: keyspaces.to_vec(),
            }),
        );
        match self.state.lock().unwrap().restore_error.clone() {
            Some(message) => Err(ClusterError::Api(message)),
            None => Ok(json!(["restore-request-1"])),
        }
    }

    async fn restore_table(
        &self,
        session: &Session,
        backup_id: &str,
        _destination_id: &str,
        keyspace: &str,
        table: &str,
    ) -> Result<Value, ClusterError> {
        self.record(
            session,
            Some(Call::RestoreTable {
                backup_id: backup_id.to_string(),
                keyspace: keyspace.to_string(),
                table: table.to_string(),
            }),
        );
        Ok(json!(["restore-request-2"]))
    }

    async fn delete_backup(
        &self,
        session: &Session,
        backup_id: &str,
        destination_id: Option<&str>,
    ) -> Result<(), ClusterError> {
        self.record(
            session,
            Some(Call::DeleteBackup {
                backup_id: backup_id.to_string(),
                destination: destination_id.map(str::to_string),
            }),
        );
        Ok(())
    }
}

fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap()
}

struct Harness {
    api: Arc<FakeOpsCenter>,
    objects: Arc<MemoryObjectStore>,
    output_dir: tempfile::TempDir,
    session: Session,
}

impl Harness {
    fn new(keyspaces: &[&str]) -> Self {
        Self {
            api: Arc::new(FakeOpsCenter::new(keyspaces)),
            objects: Arc::new(MemoryObjectStore::new()),
            output_dir: tempfile::tempdir().unwrap(),
            session: Session::new("session-1"),
        }
    }

    fn output_path(&self) -> PathBuf {
        self.output_dir.path().join("github_output")
    }

    fn output(&self) -> String {
        std::fs::read_to_string(self.output_path()).unwrap_or_default()
    }

    fn service(&self) -> ClusterManagerService {
        ClusterManagerService::new(
            self.api.clone(),
            BUCKET,
            RetentionConfigStore::new(self.objects.clone(), RETENTION_KEY),
            PipelineOutput::to_file(self.output_path()),
        )
    }
}

fn restore(mode: ClusterRestoreMode, scope: RestoreScope) -> ClusterRestoreRequest {
    ClusterRestoreRequest { mode, scope }
}

#[tokio::test]
async fn test_backup_all_reuses_destination_and_drops_on_server_copy() {
    let harness = Harness::new(&["orders", "OpsCenter", "users"]);
    harness.api.add_destination_entry("dest-1", "s3", BUCKET);
    harness.api.add_activity("opscenter_old", 1_000.0, "s3", false);

    let summary = assert_ok!(
        harness
            .service()
            .run_backup(&harness.session, &KeyspaceSelection::All)
            .await
    );
    assert_eq!(summary.keyspaces, vec!["orders", "users"]);
    assert_eq!(summary.destination_id, "dest-1");
    assert_eq!(summary.removed_on_server.as_deref(), Some("opscenter_run"));

    assert_eq!(
        harness.api.calls(),
        vec![
            Call::RunBackup(BackupRun {
                keyspaces: vec!["orders".into(), "users".into()],
                destination_id: Some("dest-1".into()),
                compressed: true,
            }),
            Call::DeleteBackup {
                backup_id: "opscenter_run".into(),
                destination: None,
            },
        ]
    );
    assert!(harness
        .api
        .sessions_seen()
        .iter()
        .all(|id| id == "session-1"));
}

#[tokio::test]
async fn test_backup_adds_missing_destination() {
    let harness = Harness::new(&["orders"]);
    // Same path, wrong provider.
    harness.api.add_destination_entry("dest-local", "local", BUCKET);
    harness.api.add_destination_entry("dest-other", "s3", "another-bucket");

    let selection = KeyspaceSelection::Named(vec!["orders".into()]);
    let summary = assert_ok!(harness.service().run_backup(&harness.session, &selection).await);
    assert_eq!(summary.destination_id, "dest-new");
    assert_eq!(
        harness.api.calls()[0],
        Call::AddDestination {
            bucket: BUCKET.into(),
            acceleration: false,
        }
    );
}

#[tokio::test]
async fn test_backup_without_keyspaces_is_rejected() {
    let harness = Harness::new(&["OpsCenter"]);

    let err = assert_err!(
        harness
            .service()
            .run_backup(&harness.session, &KeyspaceSelection::All)
            .await
    );
    assert!(matches!(err, ClusterError::InvalidRequest(_)));

    let selection = KeyspaceSelection::Named(vec!["OpsCenter".into()]);
    assert_err!(harness.service().run_backup(&harness.session, &selection).await);
    assert!(harness.api.calls().is_empty());
}

#[tokio::test]
async fn test_latest_s3_backup() {
    let harness = Harness::new(&["orders"]);
    harness.api.add_activity("opscenter_1", 1_000.0, "s3", false);
    harness.api.add_activity("opscenter_3", 3_000.0, "s3", true);
    harness.api.add_activity("opscenter_4", 4_000.0, "local", false);
    harness.api.add_activity("opscenter_2", 2_000.0, "s3", false);

    let service = harness.service();
    let backups = assert_ok!(service.s3_backups(&harness.session).await);
    let ids: Vec<&str> = backups.iter().map(|b| b.backup_id.as_str()).collect();
    assert_eq!(ids, vec!["opscenter_2", "opscenter_1"]);

    let latest = assert_ok!(service.latest_s3_backup(&harness.session).await);
    assert_eq!(latest.backup_id, "opscenter_2");
}

#[tokio::test]
async fn test_latest_restore_without_backups() {
    let harness = Harness::new(&["orders"]);
    harness.api.add_activity("opscenter_1", 1_000.0, "s3", true);

    let err = assert_err!(
        harness
            .service()
            .run_restore_at(
                &harness.session,
                &restore(ClusterRestoreMode::ManualLatest, RestoreScope::All),
                at(1_704_556_800)
            )
            .await
    );
    assert!(matches!(err, ClusterError::NoBackupFound(cluster) if cluster == "poc"));
    assert_eq!(
        harness.output(),
        "TargetClusterName=restoredpoc01-06-2024-16-00-00\n"
    );
}

#[tokio::test]
async fn test_restore_all_keyspaces_from_latest() {
    let harness = Harness::new(&["orders", "OpsCenter", "users"]);
    harness.api.add_activity("opscenter_1", 1_000.0, "s3", false);
    harness.api.add_activity("opscenter_2", 2_000.0, "s3", false);

    let summary = assert_ok!(
        harness
            .service()
            .run_restore_at(
                &harness.session,
                &restore(ClusterRestoreMode::ManualLatest, RestoreScope::All),
                at(1_704_556_800)
            )
            .await
    );
    assert_eq!(summary.backup_id, "opscenter_2");
    assert_eq!(summary.target_cluster, "restoredpoc01-06-2024-16-00-00");
    assert_eq!(
        harness.api.calls(),
        vec![
            Call::AddDestination {
                bucket: BUCKET.into(),
                acceleration: true,
            },
            Call::RestoreKeyspaces {
                backup_id: "opscenter_2".into(),
                destination: "dest-new".into(),
                keyspaces: vec!["orders".into(), "users".into()],
            },
        ]
    );
}

#[tokio::test]
async fn test_restore_named_keyspaces_skips_unknown() {
    let harness = Harness::new(&["orders", "users"]);
    harness.api.add_destination_entry("dest-1", "s3", BUCKET);

    let request = restore(
        ClusterRestoreMode::Manual {
            backup_id: "opscenter_7".into(),
        },
        RestoreScope::Keyspaces(vec!["users".into(), "billing".into()]),
    );
    let summary = assert_ok!(
        harness
            .service()
            .run_restore_at(&harness.session, &request, at(1_704_556_800))
            .await
    );
    assert_eq!(summary.keyspaces, vec!["users"]);

    let request = restore(
        ClusterRestoreMode::Manual {
            backup_id: "opscenter_7".into(),
        },
        RestoreScope::Keyspaces(vec!["billing".into()]),
    );
    let err = assert_err!(
        harness
            .service()
            .run_restore_at(&harness.session, &request, at(1_704_556_801))
            .await
    );
    assert!(matches!(err, ClusterError::InvalidRequest(_)));
}

#[tokio::test]
async fn test_restore_single_table() {
    let harness = Harness::new(&["orders"]);
    harness.api.add_destination_entry("dest-1", "s3", BUCKET);

    let request = restore(
        ClusterRestoreMode::Manual {
            backup_id: "opscenter_7".into(),
        },
        RestoreScope::Table {
            keyspace: "orders".into(),
            table: "line_items".into(),
        },
    );
    let summary = assert_ok!(
        harness
            .service()
            .run_restore_at(&harness.session, &request, at(1_704_556_800))
            .await
    );
    assert_eq!(summary.table.as_deref(), Some("line_items"));
    assert_eq!(
        harness.api.calls(),
        vec![Call::RestoreTable {
            backup_id: "opscenter_7".into(),
            keyspace: "orders".into(),
            table: "line_items".into(),
        }]
    );
}

#[tokio::test]
async fn test_restore_api_error_propagates() {
    let harness = Harness::new(&["orders"]);
    harness.api.add_destination_entry("dest-1", "s3", BUCKET);
    harness.api.fail_restores("Backup opscenter_7 not found");

    let request = restore(
        ClusterRestoreMode::Manual {
            backup_id: "opscenter_7".into(),
        },
        RestoreScope::All,
    );
    let err = assert_err!(
        harness
            .service()
            .run_restore_at(&harness.session, &request, at(1_704_556_800))
            .await
    );
    assert!(matches!(err, ClusterError::Api(message) if message.contains("opscenter_7")));
}

#[tokio::test]
async fn test_export_keyspaces() {
    let harness = Harness::new(&["OpsCenter", "orders", "users"]);

    let keyspaces = assert_ok!(harness.service().export_keyspaces(&harness.session).await);
    assert_eq!(keyspaces.len(), 3);
    assert_eq!(harness.output(), "Keyspaces=OpsCenter,orders,users\n");
}

#[tokio::test]
async fn test_register_retention() {
    let harness = Harness::new(&["orders"]);
    let service = harness.service();

    assert_ok!(
        service
            .register_retention("restoredpoc01-06-2024-16-00-00", RetentionDays::new(2), at(1_000))
            .await
    );
    assert_ok!(
        service
            .register_retention("restoredpoc01-06-2024-16-00-00", RetentionDays::new(4), at(2_000))
            .await
    );

    let config: RetentionConfigDocument =
        serde_json::from_slice(&harness.objects.raw(RETENTION_KEY).unwrap()).unwrap();
    assert_eq!(config.len(), 1);
    let entry = config.get("restoredpoc01-06-2024-16-00-00").unwrap();
    assert_eq!(entry.days_to_retain, RetentionDays::new(4));
    assert_eq!(entry.creation_date_time, at(2_000));
}

//! HTTP client for the OpsCenter management API.
//!
//! Every call after [`OpsCenterClient::login`] takes the [`Session`] it runs
//! under. OpsCenter answers failures with a `{"message": ...}` body, often with
//! a 200 status, so bodies are inspected before they are decoded.

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, COOKIE};
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info};

use crate::ClusterError;

pub const SESSION_HEADER: &str = "opscenter-session";
pub const SESSION_COOKIE: &str = "TWISTED_SESSION";
pub const S3_PROVIDER: &str = "s3";

/// An authenticated OpsCenter session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    id: String,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A backup destination configured on the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub provider: String,
    pub path: String,
    #[serde(default)]
    pub server_side_encryption: Option<bool>,
    #[serde(default)]
    pub acceleration_mode: Option<bool>,
}

impl Destination {
    pub fn is_s3_bucket(&self, bucket: &str) -> bool {
        self.provider == S3_PROVIDER && self.path == bucket
    }
}

/// One entry of the cluster's backup activity log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupActivity {
    pub backup_id: String,
    pub event_time: f64,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub deleted_at: Option<Value>,
    #[serde(default)]
    pub destination: Value,
}

impl BackupActivity {
    pub fn is_backup(&self) -> bool {
        self.kind == "backup"
    }

    pub fn is_deleted(&self) -> bool {
        !matches!(self.deleted_at, None | Some(Value::Null))
    }

    pub fn provider(&self) -> Option<&str> {
        self.destination.get("provider").and_then(Value::as_str)
    }

    /// A live backup stored in S3.
    pub fn is_live_on_s3(&self) -> bool {
        !self.is_deleted() && self.provider() == Some(S3_PROVIDER)
    }
}

/// Query filter for [`OpsCenterApi::backup_activity`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivityFilter {
    pub kind: Option<String>,
    pub live_only: bool,
    pub successful_only: bool,
}

impl ActivityFilter {
    pub fn all() -> Self {
        Self::default()
    }

    /// Successful backups that have not been removed.
    pub fn live_backups() -> Self {
        Self {
            kind: Some("backup".to_string()),
            live_only: true,
            successful_only: true,
        }
    }

    pub fn query(&self) -> Vec<(&'static str, String)> {
        let mut query = Vec::new();
        if let Some(kind) = &self.kind {
            query.push(("filter_type", kind.clone()));
        }
        if self.live_only {
            query.push(("filter_live", "1".to_string()));
        }
        if self.successful_only {
            query.push(("filter_success", "1".to_string()));
        }
        query
    }
}

/// Payload of a backup run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRun {
    pub keyspaces: Vec<String>,
    pub destination_id: Option<String>,
    pub compressed: bool,
}

impl BackupRun {
    pub fn payload(&self) -> Value {
        let mut payload = json!({ "keyspaces": self.keyspaces });
        if let Some(destination_id) = &self.destination_id {
            let mut destinations = serde_json::Map::new();
            destinations.insert(
                destination_id.clone(),
                json!({ "compressed": self.compressed }),
            );
            payload["destinations"] = Value::Object(destinations);
        }
        payload
    }
}

/// Cluster scoped OpsCenter operations.
#[async_trait]
pub trait OpsCenterApi: Send + Sync {
    fn cluster(&self) -> &str;

    async fn list_destinations(
        &self,
        session: &Session,
    ) -> Result<BTreeMap<String, Destination>, ClusterError>;

    /// Registers an encrypted S3 destination and returns its id.
    async fn add_destination(
        &self,
        session: &Session,
        bucket: &str,
        acceleration_mode: bool,
    ) -> Result<String, ClusterError>;

    async fn list_keyspaces(&self, session: &Session) -> Result<Vec<String>, ClusterError>;

    async fn run_backup(&self, session: &Session, run: &BackupRun) -> Result<(), ClusterError>;

    async fn backup_activity(
        &self,
        session: &Session,
        filter: &ActivityFilter,
    ) -> Result<Vec<BackupActivity>, ClusterError>;

    async fn restore_keyspaces(
        &self,
        session: &Session,
        backup_id: &str,
        destination_id: &str,
        keyspaces: &[String],
    ) -> Result<Value, ClusterError>;

    async fn restore_table(
        &self,
        session: &Session,
        backup_id: &str,
        destination_id: &str,
        keyspace: &str,
        table: &str,
    ) -> Result<Value, ClusterError>;

    /// Deletes a backup. Without a destination the on-server copy is removed.
    async fn delete_backup(
        &self,
        session: &Session,
        backup_id: &str,
        destination_id: Option<&str>,
    ) -> Result<(), ClusterError>;
}

/// Decodes an OpsCenter response body.
pub fn decode<T: DeserializeOwned>(status: StatusCode, body: &str) -> Result<T, ClusterError> {
    let value: Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(_) if !status.is_success() => {
            return Err(ClusterError::Api(format!("HTTP {status}: {}", body.trim())))
        }
        Err(e) => return Err(ClusterError::Decode(e.to_string())),
    };

    if let Some(message) = value.get("message").and_then(Value::as_str) {
        return Err(ClusterError::Api(message.to_string()));
    }
    if !status.is_success() {
        return Err(ClusterError::Api(format!("HTTP {status}: {value}")));
    }

    serde_json::from_value(value).map_err(|e| ClusterError::Decode(e.to_string()))
}

#[derive(Deserialize)]
struct LoginResponse {
    sessionid: String,
}

#[derive(Deserialize)]
struct AddDestinationResponse {
    destination: Vec<BTreeMap<String, Value>>,
}

pub struct OpsCenterClient {
    http: reqwest::Client,
    base_url: String,
    cluster: String,
}

impl OpsCenterClient {
    /// `address` is `host:port` of the OpsCenter server.
    pub fn new(http: reqwest::Client, address: &str, cluster: impl Into<String>) -> Self {
        Self {
            http,
            base_url: format!("http://{address}"),
            cluster: cluster.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}/{}", self.base_url, self.cluster, path)
    }

    fn authorized(&self, request: RequestBuilder, session: &Session) -> RequestBuilder {
        request
            .header(SESSION_HEADER, session.id())
            .header(COOKIE, format!("{SESSION_COOKIE}={}", session.id()))
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ClusterError> {
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        debug!(%status, "OpsCenter responded");
        decode(status, &body)
    }

    pub async fn login(&self, credentials: &Credentials) -> Result<Session, ClusterError> {
        let request = self
            .http
            .post(format!("{}/login", self.base_url))
            .header(CONTENT_TYPE, "application/json")
            .json(&json!({
                "username": credentials.username,
                "password": credentials.password,
            }));

        let response: LoginResponse = self.send(request).await.map_err(|e| match e {
            ClusterError::Api(message) => ClusterError::Authentication(message),
            other => other,
        })?;
        info!("Authenticated to OpsCenter at {}", self.base_url);
        Ok(Session::new(response.sessionid))
    }
}

#[async_trait]
impl OpsCenterApi for OpsCenterClient {
    fn cluster(&self) -> &str {
        &self.cluster
    }

    async fn list_destinations(
        &self,
        session: &Session,
    ) -> Result<BTreeMap<String, Destination>, ClusterError> {
        let request = self.http.get(self.url("backups/destinations"));
        self.send(self.authorized(request, session)).await
    }

    async fn add_destination(
        &self,
        session: &Session,
        bucket: &str,
        acceleration_mode: bool,
    ) -> Result<String, ClusterError> {
        let request = self.http.post(self.url("backups/destinations")).json(&json!({
            "delete_this": false,
            "provider": S3_PROVIDER,
            "path": bucket,
            "region": "us-east-1",
            "access_key": "",
            "access_secret": "",
            "server_side_encryption": true,
            "acceleration_mode": acceleration_mode,
        }));

        let response: AddDestinationResponse = self.send(self.authorized(request, session)).await?;
        let id = response
            .destination
            .first()
            .and_then(|entry| entry.keys().next())
            .cloned()
            .ok_or_else(|| ClusterError::Decode("destination response carries no id".into()))?;
        info!("Added S3 destination {} for bucket {}", id, bucket);
        Ok(id)
    }

    async fn list_keyspaces(&self, session: &Session) -> Result<Vec<String>, ClusterError> {
        let request = self.http.get(self.url("keyspaces"));
        let keyspaces: BTreeMap<String, Value> = self.send(self.authorized(request, session)).await?;
        Ok(keyspaces.into_keys().collect())
    }

    async fn run_backup(&self, session: &Session, run: &BackupRun) -> Result<(), ClusterError> {
        let request = self.http.post(self.url("backups/run")).json(&run.payload());
        let _: Value = self.send(self.authorized(request, session)).await?;
        Ok(())
    }

    async fn backup_activity(
        &self,
        session: &Session,
        filter: &ActivityFilter,
    ) -> Result<Vec<BackupActivity>, ClusterError> {
        let request = self
            .http
            .get(self.url("backup-activity"))
            .query(&filter.query());
        self.send(self.authorized(request, session)).await
    }

    async fn restore_keyspaces(
        &self,
        session: &Session,
        backup_id: &str,
        destination_id: &str,
        keyspaces: &[String],
    ) -> Result<Value, ClusterError> {
        let keyspace: BTreeMap<&str, Value> = keyspaces
            .iter()
            .map(|name| (name.as_str(), json!({})))
            .collect();
        let request = self
            .http
            .post(self.url(&format!("backups/restore/{backup_id}")))
            .json(&json!({ "destination": destination_id, "keyspace": keyspace }));
        self.send(self.authorized(request, session)).await
    }

    async fn restore_table(
        &self,
        session: &Session,
        backup_id: &str,
        destination_id: &str,
        keyspace: &str,
        table: &str,
    ) -> Result<Value, ClusterError> {
        let request = self
            .http
            .post(self.url(&format!("backups/restore/{backup_id}/{keyspace}/{table}")))
            .json(&json!({ "destination": destination_id }));
        self.send(self.authorized(request, session)).await
    }

    async fn delete_backup(
        &self,
        session: &Session,
        backup_id: &str,
        destination_id: Option<&str>,
    ) -> Result<(), ClusterError> {
        let mut query = vec![("tag", backup_id)];
        if let Some(destination_id) = destination_id {
            query.push(("destination", destination_id));
        }
        let request = self.http.delete(self.url("backups")).query(&query);
        let _: Value = self.send(self.authorized(request, session)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_bodies_are_api_errors() {
        let err = decode::<Vec<String>>(StatusCode::OK, r#"{"message": "Invalid keyspace"}"#)
            .unwrap_err();
        assert!(matches!(err, ClusterError::Api(message) if message == "Invalid keyspace"));

        let err = decode::<Value>(StatusCode::BAD_GATEWAY, "upstream down").unwrap_err();
        assert!(matches!(err, ClusterError::Api(message) if message.contains("502")));

        let err = decode::<Vec<String>>(StatusCode::OK, "{not json").unwrap_err();
        assert!(matches!(err, ClusterError::Decode(_)));
    }

    #[test]
    fn test_decode_destinations() {
        let body = r#"{
            "a1b2": {"provider": "s3", "path": "cassandra-backups", "server_side_encryption": true},
            "c3d4": {"provider": "local", "path": "/var/lib/backups"}
        }"#;
        let destinations: BTreeMap<String, Destination> = decode(StatusCode::OK, body).unwrap();
        assert!(destinations["a1b2"].is_s3_bucket("cassandra-backups"));
        assert!(!destinations["c3d4"].is_s3_bucket("cassandra-backups"));
        assert_eq!(destinations["c3d4"].server_side_encryption, None);
    }

    #[test]
    fn test_activity_classification() {
        let body = r#"[
            {"backup_id": "opscenter_1", "event_time": 1700000000, "type": "backup",
             "deleted_at": null, "destination": {"provider": "s3"}},
            {"backup_id": "opscenter_2", "event_time": 1700000100.5, "type": "backup",
             "deleted_at": 1700000200, "destination": {"provider": "s3"}},
            {"backup_id": "opscenter_3", "event_time": 1700000300, "type": "restore"}
        ]"#;
        let activity: Vec<BackupActivity> = decode(StatusCode::OK, body).unwrap();
        assert!(activity[0].is_live_on_s3());
        assert!(activity[1].is_deleted());
        assert!(!activity[1].is_live_on_s3());
        assert!(!activity[2].is_backup());
        assert_eq!(activity[2].provider(), None);
    }

    #[test]
    fn test_backup_run_payload() {
        let run = BackupRun {
            keyspaces: vec!["orders".into(), "users".into()],
            destination_id: Some("a1b2".into()),
            compressed: true,
        };
        assert_eq!(
            run.payload(),
            json!({
                "keyspaces": ["orders", "users"],
                "destinations": {"a1b2": {"compressed": true}}
            })
        );

        let on_server = BackupRun {
            destination_id: None,
            ..run
        };
        assert!(on_server.payload().get("destinations").is_none());
    }

    #[test]
    fn test_activity_filter_query() {
        assert!(ActivityFilter::all().query().is_empty());
        assert_eq!(
            ActivityFilter::live_backups().query(),
            vec![
                ("filter_type", "backup".to_string()),
                ("filter_live", "1".to_string()),
                ("filter_success", "1".to_string()),
            ]
        );
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let credentials = Credentials {
            username: "bnr".into(),
            password: "hunter2".into(),
        };
        let printed = format!("{credentials:?}");
        assert!(printed.contains("bnr"));
        assert!(!printed.contains("hunter2"));
    }
}

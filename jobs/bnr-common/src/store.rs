//! JSON documents kept in object storage.
//!
//! Documents are rewritten as a whole. Every read hands back the object's
//! version token (the S3 ETag) and writes made through [`JsonDocumentStore::update`]
//! are conditional on it, so two jobs touching the same document cannot silently
//! drop each other's changes.

use async_trait::async_trait;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::Client as S3Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::error::StoreError;
use crate::model::{MetadataDocument, RetentionConfigDocument};

pub const DEFAULT_UPDATE_ATTEMPTS: usize = 3;

/// Condition attached to a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WritePrecondition {
    /// Overwrite whatever is there.
    None,
    /// Only create; fail if the object already exists.
    MustNotExist,
    /// Only replace the object carrying this version token.
    MatchVersion(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub body: Vec<u8>,
    pub version: Option<String>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Fails with [`StoreError::NotFound`] when the object is absent.
    async fn get(&self, key: &str) -> Result<StoredObject, StoreError>;

    /// Fails with [`StoreError::ConcurrentModification`] when the precondition
    /// does not hold.
    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        precondition: WritePrecondition,
    ) -> Result<(), StoreError>;
}

pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
}

impl S3ObjectStore {
    pub fn new(client: S3Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn map_sdk_error<E>(err: SdkError<E>, key: &str) -> StoreError
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        if let SdkError::ServiceError(ref service_err) = err {
            match service_err.raw().status().as_u16() {
                404 => return StoreError::NotFound(key.to_string()),
                // 412 for a failed If-Match / If-None-Match, 409 for a racing conditional write
                409 | 412 => return StoreError::ConcurrentModification(key.to_string()),
                _ => {}
            }
        }
        StoreError::Backend(format!("{}", DisplayErrorContext(&err)))
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => match Self::map_sdk_error(err, key) {
                StoreError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn get(&self, key: &str) -> Result<StoredObject, StoreError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, key))?;

        let version = output.e_tag().map(str::to_owned);
        let body = output
            .body
            .collect()
            .await
            .map_err(|e| StoreError::Backend(format!("reading {key}: {e}")))?
            .into_bytes()
            .to_vec();

        Ok(StoredObject { body, version })
    }

    #[instrument(skip(self, body), fields(bucket = %self.bucket, size = body.len()))]
    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        precondition: WritePrecondition,
    ) -> Result<(), StoreError> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type("application/json")
            .body(body.into());

        request = match precondition {
            WritePrecondition::None => request,
            WritePrecondition::MustNotExist => request.if_none_match("*"),
            WritePrecondition::MatchVersion(version) => request.if_match(version),
        };

        request
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, key))?;

        Ok(())
    }
}

/// A document together with the version it was read at. `version` is `None`
/// when the document did not exist yet.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub document: T,
    pub version: Option<String>,
}

/// Encodes a document the way every job stores it: pretty printed with a
/// four space indent. Map keys come out sorted because documents are `BTreeMap`s.
pub fn encode_document<T: Serialize>(document: &T) -> serde_json::Result<Vec<u8>> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
    document.serialize(&mut serializer)?;
    Ok(buf)
}

/// Accessor for a single JSON document at a fixed key.
pub struct JsonDocumentStore<T> {
    store: Arc<dyn ObjectStore>,
    key: String,
    max_attempts: usize,
    _document: PhantomData<fn() -> T>,
}

pub type MetadataStore = JsonDocumentStore<MetadataDocument>;
pub type RetentionConfigStore = JsonDocumentStore<RetentionConfigDocument>;

impl<T> JsonDocumentStore<T>
where
    T: Serialize + DeserializeOwned + Default + Send + Sync,
{
    pub fn new(store: Arc<dyn ObjectStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
            max_attempts: DEFAULT_UPDATE_ATTEMPTS,
            _document: PhantomData,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn exists(&self) -> Result<bool, StoreError> {
        self.store.exists(&self.key).await
    }

    /// Fails with `NotFound` when the document is absent and `Corrupt` when it
    /// does not parse.
    pub async fn read(&self) -> Result<T, StoreError> {
        Ok(self.read_versioned().await?.document)
    }

    pub async fn read_versioned(&self) -> Result<Versioned<T>, StoreError> {
        let object = self.store.get(&self.key).await?;
        let document = serde_json::from_slice(&object.body).map_err(|source| StoreError::Corrupt {
            key: self.key.clone(),
            source,
        })?;
        Ok(Versioned {
            document,
            version: object.version,
        })
    }

    /// Like [`read_versioned`](Self::read_versioned) but an absent document
    /// reads as empty.
    pub async fn read_or_default(&self) -> Result<Versioned<T>, StoreError> {
        match self.read_versioned().await {
            Err(StoreError::NotFound(_)) => Ok(Versioned {
                document: T::default(),
                version: None,
            }),
            other => other,
        }
    }

    /// Unconditional overwrite; the last writer wins.
    pub async fn write(&self, document: &T) -> Result<(), StoreError> {
        self.put(document, WritePrecondition::None).await
    }

    /// Writes only if the stored document is still at `version` (or still
    /// absent when `version` is `None`).
    pub async fn write_versioned(
        &self,
        document: &T,
        version: Option<&str>,
    ) -> Result<(), StoreError> {
        let precondition = match version {
            Some(version) => WritePrecondition::MatchVersion(version.to_string()),
            None => WritePrecondition::MustNotExist,
        };
        self.put(document, precondition).await
    }

    /// Optimistic read-modify-write. `apply` may run more than once: it is
    /// re-applied to a fresh read whenever another writer got there first.
    pub async fn update<F, R>(&self, mut apply: F) -> Result<R, StoreError>
    where
        F: FnMut(&mut T) -> R + Send,
        R: Send,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let Versioned {
                mut document,
                version,
            } = self.read_or_default().await?;
            let result = apply(&mut document);

            match self.write_versioned(&document, version.as_deref()).await {
                Ok(()) => {
                    info!(key = %self.key, attempt, "Document updated");
                    return Ok(result);
                }
                Err(StoreError::ConcurrentModification(_)) if attempt < self.max_attempts => {
                    warn!(
                        key = %self.key,
                        attempt,
                        "Document changed while updating, retrying on a fresh copy"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn put(&self, document: &T, precondition: WritePrecondition) -> Result<(), StoreError> {
        let body =
            encode_document(document).map_err(|e| StoreError::Encode(self.key.clone(), e))?;
        self.store.put(&self.key, body, precondition).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BackupRecord, RetentionDays, TableCounts};
    use crate::testing::MemoryObjectStore;
    use chrono::DateTime;
    use tokio_test::{assert_err, assert_ok};

    const KEY: &str = "dynamodb/metadata.json";

    fn record(id: &str, secs: i64) -> BackupRecord {
        BackupRecord::new(
            id,
            TableCounts {
                item_count: 100,
                gsi_count: 1,
                lsi_count: 0,
            },
            None,
            DateTime::from_timestamp(secs, 0).unwrap(),
            RetentionDays::new(7),
        )
    }

    fn metadata_store(objects: &Arc<MemoryObjectStore>) -> MetadataStore {
        MetadataStore::new(objects.clone(), KEY)
    }

    #[tokio::test]
    async fn test_read_missing_document() {
        let objects = Arc::new(MemoryObjectStore::new());
        let store = metadata_store(&objects);

        assert!(!assert_ok!(store.exists().await));
        assert!(matches!(store.read().await, Err(StoreError::NotFound(_))));

        let empty = assert_ok!(store.read_or_default().await);
        assert!(empty.document.is_empty());
        assert_eq!(empty.version, None);
    }

    #[tokio::test]
    async fn test_corrupt_document() {
        let objects = Arc::new(MemoryObjectStore::new());
        objects.insert_raw(KEY, b"{not json".to_vec());
        let store = metadata_store(&objects);

        assert!(matches!(
            store.read().await,
            Err(StoreError::Corrupt { .. })
        ));
        // An unparseable document must not be treated as empty and overwritten.
        assert_err!(store.update(|doc| doc.append("orders", record("arn:1", 1))).await);
        assert_eq!(objects.raw(KEY).unwrap(), b"{not json".to_vec());
    }

    #[tokio::test]
    async fn test_write_read_round_trip_is_byte_stable() {
        let objects = Arc::new(MemoryObjectStore::new());
        let store = metadata_store(&objects);

        let mut doc = MetadataDocument::new();
        doc.append("users", record("arn:2", 2_000));
        doc.append("orders", record("arn:1", 1_000));
        assert_ok!(store.write(&doc).await);
        let first = objects.raw(KEY).unwrap();

        let read_back = assert_ok!(store.read().await);
        assert_eq!(read_back, doc);
        assert_ok!(store.write(&read_back).await);
        assert_eq!(objects.raw(KEY).unwrap(), first);

        let text = String::from_utf8(first).unwrap();
        assert!(text.find("\"orders\"").unwrap() < text.find("\"users\"").unwrap());
        assert!(text.contains("\n    \"orders\""));
    }

    #[tokio::test]
    async fn test_update_creates_document() {
        let objects = Arc::new(MemoryObjectStore::new());
        let store = metadata_store(&objects);

        assert_ok!(store.update(|doc| doc.append("orders", record("arn:1", 1))).await);

        let doc = assert_ok!(store.read().await);
        assert_eq!(doc.records("orders").len(), 1);
    }

    #[tokio::test]
    async fn test_stale_version_is_rejected() {
        let objects = Arc::new(MemoryObjectStore::new());
        let store = metadata_store(&objects);
        assert_ok!(store.update(|doc| doc.append("orders", record("arn:1", 1))).await);

        let first = assert_ok!(store.read_versioned().await);
        let second = assert_ok!(store.read_versioned().await);

        let mut doc = first.document.clone();
        doc.append("orders", record("arn:2", 2));
        assert_ok!(store.write_versioned(&doc, first.version.as_deref()).await);

        let mut other = second.document.clone();
        other.append("orders", record("arn:3", 3));
        assert!(matches!(
            store.write_versioned(&other, second.version.as_deref()).await,
            Err(StoreError::ConcurrentModification(_))
        ));
    }

    #[tokio::test]
    async fn test_update_retries_without_losing_records() {
        let objects = Arc::new(MemoryObjectStore::new());
        let store = metadata_store(&objects);
        assert_ok!(store.update(|doc| doc.append("orders", record("arn:1", 1))).await);

        // Another job appends between our read and our write on the first attempt.
        let racer = metadata_store(&objects);
        let mut raced = false;
        let interloper = objects.clone();
        let result = store
            .update(|doc| {
                if !raced {
                    raced = true;
                    let mut theirs = MetadataDocument::new();
                    theirs.append("orders", record("arn:1", 1));
                    theirs.append("orders", record("arn:other", 2));
                    interloper.insert_raw(KEY, encode_document(&theirs).unwrap());
                }
                doc.append("orders", record("arn:mine", 3));
            })
            .await;
        assert_ok!(result);

        let doc = assert_ok!(racer.read().await);
        let ids: Vec<_> = doc
            .records("orders")
            .iter()
            .map(|r| r.backup_id.as_str())
            .collect();
        assert_eq!(ids, vec!["arn:1", "arn:other", "arn:mine"]);
    }

    #[tokio::test]
    async fn test_update_gives_up_after_max_attempts() {
        let objects = Arc::new(MemoryObjectStore::new());
        let store = metadata_store(&objects).with_max_attempts(2);
        let interloper = objects.clone();

        let mut calls = 0;
        let result = store
            .update(|doc| {
                calls += 1;
                interloper.insert_raw(KEY, b"{}".to_vec());
                doc.append("orders", record("arn:x", 1));
            })
            .await;

        assert!(matches!(result, Err(StoreError::ConcurrentModification(_))));
        assert_eq!(calls, 2);
    }
}

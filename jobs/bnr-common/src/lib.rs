//! Building blocks shared by the backup, restore and retention jobs.
//!
//! Every job wires these pieces together in its `main`: AWS clients and
//! notifiers are created once per run and handed to the workflow explicitly.

pub mod config;
pub mod error;
pub mod model;
pub mod notify;
pub mod pipeline;
pub mod provider;
pub mod store;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::{BnrError, ProviderError, Result, StoreError};
pub use model::{
    BackupRecord, MetadataDocument, RetentionConfigDocument, RetentionDays, RetentionEntry,
    TableCounts,
};
pub use notify::{report_failure, Notifier, Notifiers, Outcome};
pub use provider::{PointInTime, RestoredTable, TableDescription, TableProvider, TableStatus};
pub use store::{JsonDocumentStore, MetadataStore, ObjectStore, RetentionConfigStore, Versioned};

//! Best-effort document persistence.
//!
//! The gateway holds an ordered list of document sinks and stops at the first
//! one that accepts the record. Exhausting the list is not an error for the
//! caller: the failure is logged and `None` is returned. There is no retry.

mod firestore;
mod local;
pub mod value;

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;

pub use firestore::{
    new_document_id, FirestoreClient, FirestoreRest, FirestoreTarget, DEFAULT_DATABASE,
    DEFAULT_FIRESTORE_ENDPOINT,
};
pub use local::{InMemoryDocumentSink, SqliteDocumentSink, StoredDocument};

/// Collection receiving per-sample detection records.
pub const DETECTION_LOG_COLLECTION: &str = "detection_logs";
/// Collection receiving aggregate reports.
pub const REPORT_COLLECTION: &str = "model_results";

/// Collection names used by the recorder and the report scheduler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Collections {
    pub detection_log: String,
    pub report: String,
}

impl Default for Collections {
    fn default() -> Self {
        Self {
            detection_log: DETECTION_LOG_COLLECTION.to_string(),
            report: REPORT_COLLECTION.to_string(),
        }
    }
}

/// A store that accepts structured records.
pub trait DocumentSink: Send + Sync {
    fn name(&self) -> &'static str;

    /// Insert `record` into `collection`, returning the new document id.
    fn insert(&self, collection: &str, record: &Value) -> Result<String>;
}

#[derive(Default)]
pub struct SinkGateway {
    providers: Vec<Box<dyn DocumentSink>>,
}

impl SinkGateway {
    /// `providers` are tried in order: primary first, fallbacks after.
    pub fn new(providers: Vec<Box<dyn DocumentSink>>) -> Self {
        Self { providers }
    }

    /// Gateway with no sinks; every write is dropped.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn provider_names(&self) -> Vec<&'static str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    /// Persist `record`, returning the id from the first sink that accepts it.
    pub fn persist(&self, collection: &str, record: &Value) -> Option<String> {
        if self.providers.is_empty() {
            log::debug!("no document sinks configured; dropping {} record", collection);
            return None;
        }
        for provider in &self.providers {
            match provider.insert(collection, record) {
                Ok(id) => {
                    log::debug!("{} record stored via {} as {}", collection, provider.name(), id);
                    return Some(id);
                }
                Err(err) => {
                    log::warn!("{} write via {} failed: {:#}", collection, provider.name(), err);
                }
            }
        }
        log::warn!("{} record dropped: all document sinks failed", collection);
        None
    }

    /// Serialize and persist. Serialization failures are logged like sink failures.
    pub fn persist_serialized<T: Serialize>(&self, collection: &str, record: &T) -> Option<String> {
        match serde_json::to_value(record) {
            Ok(value) => self.persist(collection, &value),
            Err(err) => {
                log::warn!("{} record could not be serialized: {}", collection, err);
                None
            }
        }
    }
}
